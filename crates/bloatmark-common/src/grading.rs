//! Bufferbloat grading.
//!
//! The grade is a pure function of Δ = loaded RTT − baseline RTT. The
//! overall table applies to single-user tests; personas carry their own
//! threshold triples, and the household overall grade is the rounded
//! arithmetic mean of the latency-sensitive personas' sub-grades.

use serde::{Deserialize, Serialize};

use crate::persona::Persona;

// ── Grade ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }

    /// Numeric value for averaging: A+ = 5 … F = 0.
    fn score(&self) -> u32 {
        match self {
            Grade::APlus => 5,
            Grade::A => 4,
            Grade::B => 3,
            Grade::C => 2,
            Grade::D => 1,
            Grade::F => 0,
        }
    }

    fn from_score(score: u32) -> Grade {
        match score {
            5 => Grade::APlus,
            4 => Grade::A,
            3 => Grade::B,
            2 => Grade::C,
            1 => Grade::D,
            _ => Grade::F,
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Grade {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A+" => Ok(Grade::APlus),
            "A" => Ok(Grade::A),
            "B" => Ok(Grade::B),
            "C" => Ok(Grade::C),
            "D" => Ok(Grade::D),
            "F" => Ok(Grade::F),
            other => Err(format!("unknown grade: {other}")),
        }
    }
}

/// Single-user grade from the latency delta in milliseconds.
pub fn grade_from_delta(delta_ms: f64) -> Grade {
    if delta_ms < 5.0 {
        Grade::APlus
    } else if delta_ms < 30.0 {
        Grade::A
    } else if delta_ms < 60.0 {
        Grade::B
    } else if delta_ms < 200.0 {
        Grade::C
    } else if delta_ms < 400.0 {
        Grade::D
    } else {
        Grade::F
    }
}

// ── Persona sub-grades ──────────────────────────────────────────────

/// A persona's Δ-threshold triple: at or above each bound the grade
/// steps down from A through B and C to F.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradeThresholds {
    pub a_ms: f64,
    pub b_ms: f64,
    pub c_ms: f64,
}

impl GradeThresholds {
    pub const fn new(a_ms: f64, b_ms: f64, c_ms: f64) -> Self {
        Self { a_ms, b_ms, c_ms }
    }

    pub fn grade(&self, delta_ms: f64) -> Grade {
        if delta_ms < self.a_ms {
            Grade::A
        } else if delta_ms < self.b_ms {
            Grade::B
        } else if delta_ms < self.c_ms {
            Grade::C
        } else {
            Grade::F
        }
    }
}

/// Sub-grade for one persona from its measured latency delta.
pub fn persona_grade(persona: Persona, delta_ms: f64) -> Grade {
    persona.grade_thresholds().grade(delta_ms)
}

/// Household overall grade: rounded arithmetic mean of the gaming and
/// video-call sub-grades. A missing persona contributes an F.
pub fn household_overall(gaming: Option<Grade>, video_call: Option<Grade>) -> Grade {
    let g = gaming.unwrap_or(Grade::F).score();
    let v = video_call.unwrap_or(Grade::F).score();
    // Round half up on the 2-sample mean.
    Grade::from_score((g + v + 1) / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_grade_boundaries() {
        assert_eq!(grade_from_delta(0.0), Grade::APlus);
        assert_eq!(grade_from_delta(4.9), Grade::APlus);
        assert_eq!(grade_from_delta(5.0), Grade::A);
        assert_eq!(grade_from_delta(29.9), Grade::A);
        assert_eq!(grade_from_delta(30.0), Grade::B);
        assert_eq!(grade_from_delta(59.9), Grade::B);
        assert_eq!(grade_from_delta(60.0), Grade::C);
        assert_eq!(grade_from_delta(199.9), Grade::C);
        assert_eq!(grade_from_delta(200.0), Grade::D);
        assert_eq!(grade_from_delta(399.9), Grade::D);
        assert_eq!(grade_from_delta(400.0), Grade::F);
        assert_eq!(grade_from_delta(2000.0), Grade::F);
    }

    #[test]
    fn persona_thresholds_applied() {
        assert_eq!(persona_grade(Persona::Gaming, 10.0), Grade::A);
        assert_eq!(persona_grade(Persona::Gaming, 25.0), Grade::B);
        assert_eq!(persona_grade(Persona::Gaming, 80.0), Grade::C);
        assert_eq!(persona_grade(Persona::Gaming, 150.0), Grade::F);
        // Bulk tolerates far more before failing.
        assert_eq!(persona_grade(Persona::Bulk, 150.0), Grade::A);
        assert_eq!(persona_grade(Persona::Bulk, 4999.0), Grade::C);
    }

    #[test]
    fn household_mean_rounds_up() {
        // A (4) + B (3) → 3.5 → rounds to 4 → A
        assert_eq!(
            household_overall(Some(Grade::A), Some(Grade::B)),
            Grade::A
        );
        // B + B → B
        assert_eq!(
            household_overall(Some(Grade::B), Some(Grade::B)),
            Grade::B
        );
    }

    #[test]
    fn missing_persona_counts_as_f() {
        // A (4) + missing (0) → 2 → C
        assert_eq!(household_overall(Some(Grade::A), None), Grade::C);
        assert_eq!(household_overall(None, None), Grade::F);
    }

    #[test]
    fn grade_serde_uses_display_names() {
        assert_eq!(serde_json::to_string(&Grade::APlus).unwrap(), "\"A+\"");
        assert_eq!(serde_json::to_string(&Grade::F).unwrap(), "\"F\"");
        let g: Grade = serde_json::from_str("\"A+\"").unwrap();
        assert_eq!(g, Grade::APlus);
    }
}

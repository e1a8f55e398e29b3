//! Environment configuration.
//!
//! Every process reads the same variable set and validates all of it up
//! front: a partially-valid config never runs. Errors name the variable
//! and the offending value.

use std::collections::HashMap;

use thiserror::Error;

use crate::persona::{Persona, ALL_PERSONAS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("PERSONA_PORTS: missing entry for persona {0}")]
    MissingPersona(Persona),
    #[error("PERSONA_PORTS: duplicate port {0}")]
    DuplicatePort(u16),
    #[error("TLS_CERT and TLS_KEY must be set together")]
    TlsHalfConfigured,
    #[error("WEBHOOK_URL requires WEBHOOK_SECRET")]
    WebhookUnsigned,
    #[error("{var}: file not readable: {path}")]
    FileUnreadable { var: &'static str, path: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub front_door_port: u16,
    pub ping_port: u16,
    pub persona_ports: HashMap<Persona, u16>,
    pub max_test_duration_s: u64,
    pub telemetry_db: String,
    pub telemetry_ring_size: u32,
    pub telemetry_api_key: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub max_download_bytes: u64,
    pub max_upload_bytes: u64,
}

const GIB: u64 = 1024 * 1024 * 1024;

impl Config {
    /// Read the full configuration from process environment variables.
    pub fn from_env() -> Result<Config, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read from an arbitrary lookup (tests inject maps here).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let front_door_port = parse_or("FRONT_DOOR_PORT", &get, 8000)?;
        let ping_port = parse_or("PING_PORT", &get, 8005)?;
        let persona_ports = parse_persona_ports(get("PERSONA_PORTS").as_deref())?;

        let max_test_duration_s = parse_or("MAX_TEST_DURATION_S", &get, 300)?;
        if max_test_duration_s == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_TEST_DURATION_S",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }

        let telemetry_ring_size: u32 = parse_or("TELEMETRY_RING_SIZE", &get, 1000)?;
        if telemetry_ring_size == 0 {
            return Err(ConfigError::Invalid {
                var: "TELEMETRY_RING_SIZE",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }

        let tls_cert = get("TLS_CERT").filter(|s| !s.is_empty());
        let tls_key = get("TLS_KEY").filter(|s| !s.is_empty());
        match (&tls_cert, &tls_key) {
            (Some(_), None) | (None, Some(_)) => return Err(ConfigError::TlsHalfConfigured),
            (Some(cert), Some(key)) => {
                for (var, path) in [("TLS_CERT", cert), ("TLS_KEY", key)] {
                    if std::fs::metadata(path).is_err() {
                        return Err(ConfigError::FileUnreadable {
                            var,
                            path: path.clone(),
                        });
                    }
                }
            }
            (None, None) => {}
        }

        let webhook_url = get("WEBHOOK_URL").filter(|s| !s.is_empty());
        let webhook_secret = get("WEBHOOK_SECRET").filter(|s| !s.is_empty());
        if webhook_url.is_some() && webhook_secret.is_none() {
            return Err(ConfigError::WebhookUnsigned);
        }

        Ok(Config {
            front_door_port,
            ping_port,
            persona_ports,
            max_test_duration_s,
            telemetry_db: get("TELEMETRY_DB").unwrap_or_else(|| "bloatmark.db".into()),
            telemetry_ring_size,
            telemetry_api_key: get("TELEMETRY_API_KEY").filter(|s| !s.is_empty()),
            webhook_url,
            webhook_secret,
            tls_cert,
            tls_key,
            max_download_bytes: parse_or("MAX_DOWNLOAD_BYTES", &get, 4 * GIB)?,
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", &get, 4 * GIB)?,
        })
    }

    pub fn persona_port(&self, persona: Persona) -> u16 {
        // Validated exhaustive at load time.
        self.persona_ports[&persona]
    }

    /// Loopback base URL of a persona worker, for orchestrator and
    /// supervisor control calls.
    pub fn worker_url(&self, persona: Persona) -> String {
        format!("http://127.0.0.1:{}", self.persona_port(persona))
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some()
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &'static str,
    get: &impl Fn(&str) -> Option<String>,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

/// Parse `gaming:8002,video:8003,streaming:8001,bulk:8004`. Every persona
/// must be present exactly once and ports must not collide.
fn parse_persona_ports(raw: Option<&str>) -> Result<HashMap<Persona, u16>, ConfigError> {
    let mut ports: HashMap<Persona, u16> = match raw {
        None => {
            return Ok(ALL_PERSONAS
                .iter()
                .map(|p| (*p, p.default_port()))
                .collect())
        }
        Some(raw) => {
            let mut map = HashMap::new();
            for entry in raw.split(',') {
                let entry = entry.trim();
                let (name, port) = entry.split_once(':').ok_or_else(|| ConfigError::Invalid {
                    var: "PERSONA_PORTS",
                    value: entry.to_string(),
                    reason: "expected persona:port".into(),
                })?;
                let persona: Persona =
                    name.trim().parse().map_err(|e: String| ConfigError::Invalid {
                        var: "PERSONA_PORTS",
                        value: entry.to_string(),
                        reason: e,
                    })?;
                let port: u16 = port.trim().parse().map_err(|_| ConfigError::Invalid {
                    var: "PERSONA_PORTS",
                    value: entry.to_string(),
                    reason: "bad port".into(),
                })?;
                map.insert(persona, port);
            }
            map
        }
    };

    for persona in ALL_PERSONAS {
        if !ports.contains_key(&persona) {
            return Err(ConfigError::MissingPersona(persona));
        }
    }
    let mut seen = std::collections::HashSet::new();
    for port in ports.values() {
        if !seen.insert(*port) {
            return Err(ConfigError::DuplicatePort(*port));
        }
    }
    ports.shrink_to_fit();
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |var| {
            pairs
                .iter()
                .find(|(k, _)| *k == var)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults_when_env_empty() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.front_door_port, 8000);
        assert_eq!(cfg.ping_port, 8005);
        assert_eq!(cfg.persona_port(Persona::Streaming), 8001);
        assert_eq!(cfg.max_test_duration_s, 300);
        assert_eq!(cfg.telemetry_ring_size, 1000);
        assert!(cfg.telemetry_api_key.is_none());
        assert!(!cfg.tls_enabled());
    }

    #[test]
    fn persona_ports_parsed() {
        let cfg = Config::from_lookup(lookup(&[(
            "PERSONA_PORTS",
            "gaming:9002,video:9003,streaming:9001,bulk:9004",
        )]))
        .unwrap();
        assert_eq!(cfg.persona_port(Persona::Gaming), 9002);
        assert_eq!(cfg.persona_port(Persona::VideoCall), 9003);
    }

    #[test]
    fn persona_ports_missing_entry_rejected() {
        let err = Config::from_lookup(lookup(&[("PERSONA_PORTS", "gaming:9002,video:9003")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingPersona(_)));
    }

    #[test]
    fn persona_ports_collision_rejected() {
        let err = Config::from_lookup(lookup(&[(
            "PERSONA_PORTS",
            "gaming:9002,video:9002,streaming:9001,bulk:9004",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePort(9002)));
    }

    #[test]
    fn unparsable_port_names_the_variable() {
        let err = Config::from_lookup(lookup(&[("FRONT_DOOR_PORT", "eighty")])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("FRONT_DOOR_PORT"), "{msg}");
        assert!(msg.contains("eighty"), "{msg}");
    }

    #[test]
    fn zero_ring_size_rejected() {
        let err = Config::from_lookup(lookup(&[("TELEMETRY_RING_SIZE", "0")])).unwrap_err();
        assert!(err.to_string().contains("TELEMETRY_RING_SIZE"));
    }

    #[test]
    fn webhook_url_without_secret_rejected() {
        let err = Config::from_lookup(lookup(&[("WEBHOOK_URL", "https://example.com/hook")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::WebhookUnsigned));
    }

    #[test]
    fn tls_half_configured_rejected() {
        let err =
            Config::from_lookup(lookup(&[("TLS_CERT", "/tmp/cert.pem")])).unwrap_err();
        assert!(matches!(err, ConfigError::TlsHalfConfigured));
    }

    #[test]
    fn tls_missing_files_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("TLS_CERT", "/nonexistent/cert.pem"),
            ("TLS_KEY", "/nonexistent/key.pem"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::FileUnreadable { .. }));
    }
}

//! Prefixed ID generation and test-id validation.
//!
//! Server-generated entity IDs use a `prefix_` followed by a UUIDv7
//! (time-ordered), so they sort by creation time and are identifiable by
//! type in logs. Test IDs are chosen by the client and only validated.

use uuid::Uuid;

/// Generate a prefixed ID using UUIDv7.
fn prefixed_id(prefix: &str) -> String {
    let id = Uuid::now_v7();
    format!("{}_{}", prefix, id.as_simple())
}

/// Generate a connection ID: `conn_<uuid7>`
pub fn connection_id() -> String {
    prefixed_id("conn")
}

/// Generate a stream ID: `strm_<uuid7>`
pub fn stream_id() -> String {
    prefixed_id("strm")
}

/// Validate a client-chosen test ID.
///
/// Opaque, 128-bit-equivalent: 8–128 characters from the URL-safe set.
/// Anything else is rejected before it reaches the orchestrator.
pub fn valid_test_id(raw: &str) -> bool {
    (8..=128).contains(&raw.len())
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_correct_prefix() {
        assert!(connection_id().starts_with("conn_"));
        assert!(stream_id().starts_with("strm_"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(connection_id(), connection_id());
    }

    #[test]
    fn ids_are_sortable_by_time() {
        let a = connection_id();
        let b = connection_id();
        // UUIDv7 is time-ordered, so b > a lexicographically.
        assert!(b > a, "expected {b} > {a}");
    }

    #[test]
    fn test_id_validation() {
        assert!(valid_test_id("9f86d081884c7d65"));
        assert!(valid_test_id("client-chosen_id-123"));
        assert!(!valid_test_id("short"));
        assert!(!valid_test_id(&"x".repeat(129)));
        assert!(!valid_test_id("has spaces in it"));
        assert!(!valid_test_id("semi;colon-injection"));
    }
}

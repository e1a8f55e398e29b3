//! Outbound result mirror.
//!
//! Each successful submit is POSTed to the configured URL as a JSON copy
//! signed with HMAC-SHA-256 over the exact body bytes. Delivery runs in
//! its own task and never blocks the submit path; three attempts with
//! exponential backoff, then give up with a warning.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use bloatmark_common::model::TestResult;

use crate::state::AppState;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

pub const SIGNATURE_HEADER: &str = "x-bloatmark-signature";

/// Fire-and-forget delivery of a stored result.
pub fn spawn_delivery(state: &AppState, result: &TestResult) {
    let (Some(url), Some(secret)) = (
        state.config().webhook_url.clone(),
        state.config().webhook_secret.clone(),
    ) else {
        return;
    };

    let body = match serde_json::to_string(result) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "webhook body serialization failed");
            return;
        }
    };
    let client = state.http().clone();
    let test_id = result.test_id.clone();

    tokio::spawn(async move {
        deliver(client, url, secret, body, test_id).await;
    });
}

async fn deliver(
    client: reqwest::Client,
    url: String,
    secret: String,
    body: String,
    test_id: String,
) {
    let signature = format!("sha256={}", sign(&secret, body.as_bytes()));
    let mut backoff = INITIAL_BACKOFF;

    for attempt in 1..=MAX_ATTEMPTS {
        let sent = client
            .post(&url)
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, &signature)
            .body(body.clone())
            .send()
            .await;

        match sent {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(test_id = %test_id, attempt, "webhook delivered");
                return;
            }
            Ok(resp) => {
                tracing::warn!(test_id = %test_id, attempt, status = %resp.status(), "webhook rejected");
            }
            Err(e) => {
                tracing::warn!(test_id = %test_id, attempt, error = %e, "webhook send failed");
            }
        }

        if attempt < MAX_ATTEMPTS {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
    tracing::warn!(test_id = %test_id, "webhook delivery abandoned after {MAX_ATTEMPTS} attempts");
}

/// HMAC-SHA-256 over the body, hex-encoded.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        write!(out, "{byte:02x}").unwrap();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_sha256_known_vector() {
        // RFC 2202-style reference vector.
        let sig = sign("key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            sig,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn signature_depends_on_secret_and_body() {
        let a = sign("secret-a", b"{}");
        let b = sign("secret-b", b"{}");
        let c = sign("secret-a", b"{ }");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}

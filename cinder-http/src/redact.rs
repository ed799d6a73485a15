//! Redaction of downstream response snapshots.
//!
//! Error responses from downstream services get attached to the subsegment
//! for debugging, but they may echo credentials or personal data back. The
//! snapshot is therefore JSON-aware redacted and size-bounded before it is
//! recorded.

use serde_json::Value;

/// Substrings marking a JSON key as sensitive.
const SENSITIVE_KEYS: [&str; 6] = [
    "password",
    "secret",
    "token",
    "authorization",
    "api_key",
    "cookie",
];

const REDACTED: &str = "***";

/// Upper bound on recorded snapshot size, in bytes.
const MAX_SNAPSHOT_LEN: usize = 2048;

/// Builds a bounded, redacted snapshot of a response body.
///
/// JSON bodies have values under sensitive keys replaced recursively and
/// are re-serialized; anything else is recorded verbatim. Either form is
/// truncated to [`MAX_SNAPSHOT_LEN`].
pub(crate) fn safe_snapshot(body: &str) -> String {
    let snapshot = match serde_json::from_str::<Value>(body) {
        Ok(mut value) => {
            redact_value(&mut value);
            value.to_string()
        }
        Err(_) => body.to_string(),
    };
    truncate(snapshot)
}

fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if is_sensitive(key) {
                    *entry = Value::String(REDACTED.to_string());
                } else {
                    redact_value(entry);
                }
            }
        }
        Value::Array(entries) => {
            for entry in entries {
                redact_value(entry);
            }
        }
        _ => {}
    }
}

fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|marker| key.contains(marker))
}

fn truncate(mut snapshot: String) -> String {
    if snapshot.len() <= MAX_SNAPSHOT_LEN {
        return snapshot;
    }
    let mut cut = MAX_SNAPSHOT_LEN;
    while !snapshot.is_char_boundary(cut) {
        cut -= 1;
    }
    snapshot.truncate(cut);
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_keys_are_redacted_recursively() {
        let snapshot = safe_snapshot(
            r#"{
                "detail": "bad request",
                "Password": "hunter2",
                "auth": {"access_token": "abc", "scope": "read"},
                "attempts": [{"api_key": "xyz"}]
            }"#,
        );

        assert!(snapshot.contains("bad request"));
        assert!(snapshot.contains("read"));
        assert!(!snapshot.contains("hunter2"));
        assert!(!snapshot.contains("abc"));
        assert!(!snapshot.contains("xyz"));
        assert!(snapshot.contains(REDACTED));
    }

    #[test]
    fn non_json_bodies_are_recorded_verbatim() {
        assert_eq!(safe_snapshot("plain text error"), "plain text error");
    }

    #[test]
    fn snapshots_are_size_bounded() {
        let long = format!("{{\"detail\": \"{}\"}}", "x".repeat(3000));
        assert!(safe_snapshot(&long).len() <= MAX_SNAPSHOT_LEN);

        let multibyte = "é".repeat(2000);
        let bounded = safe_snapshot(&multibyte);
        assert!(bounded.len() <= MAX_SNAPSHOT_LEN);
        assert!(bounded.chars().all(|c| c == 'é'));
    }
}

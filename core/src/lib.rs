#![deny(missing_docs)]
//! watch_core: shared building blocks for the watch engine
//! (configuration, change detection, state, browser facade).

/// Application settings (config.toml + environment variables).
pub mod cfg;
/// Tracing/log initialization helpers.
pub mod logx;
/// Watch configuration model, validation, id and content-hash derivation.
pub mod watch;
/// Browser driver facade consumed by the pipeline engines.
pub mod browser;
/// Cron expression subset used by scheduled watches.
pub mod cron;
/// Minimal dotted/indexed JSON path resolver.
pub mod jsonpath;
/// Pure data reshapers applied to extractor output.
pub mod transform;
/// Change verdicts between current and prior extracted values.
pub mod compare;
/// Notification message rendering.
pub mod template;
/// Per-watch snapshot persistence.
pub mod store;

use md5::{Digest, Md5};

/// Hex MD5 of an arbitrary byte string.
pub fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex MD5 of a JSON value's canonical serialization.
pub fn md5_json(value: &serde_json::Value) -> String {
    md5_hex(value.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_hex_matches_known_vector() {
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn md5_json_is_stable_per_value() {
        let a = serde_json::json!({"k": [1, 2, 3]});
        let b = serde_json::json!({"k": [1, 2, 3]});
        assert_eq!(md5_json(&a), md5_json(&b));
        let c = serde_json::json!({"k": [1, 2, 4]});
        assert_ne!(md5_json(&a), md5_json(&c));
    }
}

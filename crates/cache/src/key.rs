//! Stable cache keys.

use sha2::{Digest, Sha256};

use stockview_core::{canonical_params, ReportParams};

/// Derive the cache key of `(view_name, params)`.
///
/// The params are rendered canonically (keys sorted at every depth) before
/// hashing, so logically equal parameter maps always share a key.
pub fn cache_key(view_name: &str, params: &ReportParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(view_name.as_bytes());
    hasher.update(b":");
    hasher.update(canonical_params(params).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn params(value: Value) -> ReportParams {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn key_is_hex_sha256() {
        let key = cache_key("inventory_report", &ReportParams::new());
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn view_name_is_part_of_the_key() {
        let p = params(json!({"start_date": "2024-01-01"}));
        assert_ne!(cache_key("sales_report", &p), cache_key("purchase_report", &p));
    }

    #[test]
    fn different_params_give_different_keys() {
        let a = params(json!({"start_date": "2024-01-01"}));
        let b = params(json!({"start_date": "2024-01-02"}));
        assert_ne!(cache_key("sales_report", &a), cache_key("sales_report", &b));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        #[test]
        fn reordered_params_share_a_key(
            entries in proptest::collection::btree_map("[a-z_]{1,10}", "[a-z0-9-]{0,10}", 0..6)
        ) {
            let forward: ReportParams = entries
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            let mut backward = ReportParams::new();
            for (k, v) in entries.iter().rev() {
                backward.insert(k.clone(), json!({"nested": v, "also": [k]}));
                backward.insert(k.clone(), json!(v));
            }

            prop_assert_eq!(cache_key("view", &forward), cache_key("view", &backward));
        }
    }
}

//! Report parameters and their canonical form.

use serde_json::{Map, Value};

/// Opaque report parameters (`start_date`, `supplier_name`, ...).
pub type ReportParams = Map<String, Value>;

/// Records produced by a report generator.
pub type Report = Vec<Value>;

/// Render a JSON value with object keys sorted at every depth.
///
/// Two parameter maps that are logically equal always render to the same
/// string, independent of insertion order or of whether `serde_json` was
/// built with `preserve_order`.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Canonical form of a parameter map (see [`canonical_json`]).
pub fn canonical_params(params: &ReportParams) -> String {
    let mut out = String::new();
    write_object(params, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already have a single serialized form.
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_object(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key], out);
    }
    out.push('}');
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn params(value: Value) -> ReportParams {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn nested_objects_are_sorted() {
        let a = params(json!({"b": 1, "a": {"y": [1, {"d": 2, "c": 3}], "x": null}}));
        assert_eq!(
            canonical_params(&a),
            r#"{"a":{"x":null,"y":[1,{"c":3,"d":2}]},"b":1}"#
        );
    }

    #[test]
    fn strings_are_escaped() {
        let a = params(json!({"supplier_name": "A \"quoted\" name"}));
        assert_eq!(canonical_params(&a), r#"{"supplier_name":"A \"quoted\" name"}"#);
    }

    #[test]
    fn empty_params_render_as_empty_object() {
        assert_eq!(canonical_params(&ReportParams::new()), "{}");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        #[test]
        fn insertion_order_does_not_matter(entries in proptest::collection::btree_map("[a-z_]{1,8}", 0i64..1000, 0..8)) {
            let forward: ReportParams = entries
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            let mut backward = ReportParams::new();
            for (k, v) in entries.iter().rev() {
                backward.insert(k.clone(), json!(v));
            }

            prop_assert_eq!(canonical_params(&forward), canonical_params(&backward));
        }
    }
}

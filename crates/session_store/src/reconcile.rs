use serde_json::Value;

/// Fills in every template field missing from `data` with the template's default.
///
/// Additive only: fields already present are never replaced or removed, so data
/// written by an older or newer schema survives. Nested objects present on both
/// sides are reconciled the same way. Returns `true` when anything was inserted;
/// running it again on the result returns `false`.
pub fn reconcile(data: &mut Value, template: &Value) -> bool {
    let (Value::Object(fields), Value::Object(defaults)) = (data, template) else {
        return false;
    };

    let mut changed = false;
    for (name, default) in defaults {
        match fields.get_mut(name) {
            None => {
                fields.insert(name.clone(), default.clone());
                changed = true;
            }
            Some(existing) if existing.is_object() && default.is_object() => {
                changed |= reconcile(existing, default);
            }
            Some(_) => {}
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn adds_missing_fields_only() {
        let mut data = json!({"coins": 50});
        let template = json!({"coins": 0, "level": "intro"});

        assert!(reconcile(&mut data, &template));
        assert_eq!(data, json!({"coins": 50, "level": "intro"}));
    }

    #[test]
    fn is_idempotent() {
        let template = json!({"coins": 0, "level": "intro", "stats": {"wins": 0}});
        let mut once = json!({"stats": {}});
        reconcile(&mut once, &template);

        let mut twice = once.clone();
        assert!(!reconcile(&mut twice, &template));
        assert_eq!(once, twice);
    }

    #[test]
    fn never_removes_or_overwrites() {
        let mut data = json!({"coins": "legacy", "retired_field": true, "stats": {"wins": 3}});
        let template = json!({"coins": 0, "stats": {"wins": 0, "losses": 0}});

        reconcile(&mut data, &template);
        assert_eq!(
            data,
            json!({
                "coins": "legacy",
                "retired_field": true,
                "stats": {"wins": 3, "losses": 0}
            })
        );
    }

    #[test]
    fn type_mismatch_keeps_stored_value() {
        let mut data = json!({"inventory": ["sword"]});
        let template = json!({"inventory": {"slots": 10}});

        assert!(!reconcile(&mut data, &template));
        assert_eq!(data, json!({"inventory": ["sword"]}));
    }

    #[test]
    fn non_object_data_is_left_alone() {
        let mut data = json!(17);
        assert!(!reconcile(&mut data, &json!({"coins": 0})));
        assert_eq!(data, json!(17));
    }
}

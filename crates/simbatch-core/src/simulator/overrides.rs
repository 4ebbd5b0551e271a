use crate::errors::{ErrorKind, JobError};
use serde_json::Value;
use std::collections::BTreeMap;

const NAME_FIELD: &str = "Name";
const CHILDREN_FIELD: &str = "Children";

/// Applies every override to `doc`, stopping at the first path that does not resolve.
pub fn apply_all(doc: &mut Value, overrides: &BTreeMap<String, Value>) -> Result<(), JobError> {
    for (path, value) in overrides {
        apply_one(doc, path, value.clone())?;
    }
    Ok(())
}

/// Sets one parameter.
///
/// `path` is either a JSON pointer (`/Children/0/Amount`) or a dot path of node names
/// ending in a property, e.g. `Simulation.Field.Fertilise at sowing.Amount`, walked
/// through each node's `Children` by `Name`. A leading `.` and the root's own name are
/// optional. The property must already exist on the target node.
pub fn apply_one(doc: &mut Value, path: &str, value: Value) -> Result<(), JobError> {
    let invalid = |why: &str| JobError::new(ErrorKind::InvalidOverride, format!("{}: {}", path, why));

    if path.starts_with('/') {
        let slot = doc.pointer_mut(path).ok_or_else(|| invalid("pointer does not resolve"))?;
        *slot = value;
        return Ok(());
    }

    let trimmed = path.trim_start_matches('.');
    let mut segments: Vec<&str> = trimmed.split('.').collect();
    let property = match segments.pop() {
        Some(p) if !p.is_empty() => p,
        _ => return Err(invalid("empty path")),
    };

    let root_name = doc.get(NAME_FIELD).and_then(Value::as_str).map(str::to_string);
    if segments.first().is_some() && segments.first().copied() == root_name.as_deref() {
        segments.remove(0);
    }

    let mut node = doc;
    for seg in segments {
        let children = node
            .get_mut(CHILDREN_FIELD)
            .and_then(Value::as_array_mut)
            .ok_or_else(|| invalid(&format!("'{}' has no children", seg)))?;
        node = children
            .iter_mut()
            .find(|c| c.get(NAME_FIELD).and_then(Value::as_str) == Some(seg))
            .ok_or_else(|| invalid(&format!("no node named '{}'", seg)))?;
    }

    let obj = node
        .as_object_mut()
        .ok_or_else(|| invalid("target is not an object"))?;
    match obj.get_mut(property) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(invalid(&format!("unknown property '{}'", property))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model() -> Value {
        json!({
            "Name": "Simulations",
            "Children": [
                {
                    "Name": "Simulation",
                    "Children": [
                        {
                            "Name": "Field",
                            "Children": [
                                { "Name": "Fertilise at sowing", "Amount": 0 }
                            ]
                        },
                        { "Name": "Clock", "Start": "1990-01-01" }
                    ]
                }
            ]
        })
    }

    #[test]
    fn dot_path_with_and_without_root() {
        let mut m = model();
        apply_one(&mut m, ".Simulations.Simulation.Field.Fertilise at sowing.Amount", json!(50)).unwrap();
        assert_eq!(m["Children"][0]["Children"][0]["Children"][0]["Amount"], json!(50));

        apply_one(&mut m, "Simulation.Clock.Start", json!("2000-01-01")).unwrap();
        assert_eq!(m["Children"][0]["Children"][1]["Start"], json!("2000-01-01"));
    }

    #[test]
    fn json_pointer() {
        let mut m = model();
        apply_one(&mut m, "/Children/0/Children/1/Start", json!("1999-01-01")).unwrap();
        assert_eq!(m["Children"][0]["Children"][1]["Start"], json!("1999-01-01"));
    }

    #[test]
    fn unknown_node_or_property_is_invalid_override() {
        let mut m = model();
        let e = apply_one(&mut m, "Simulation.Weather.File", json!("x.met")).unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidOverride);
        assert!(e.message.contains("Weather"));

        let e = apply_one(&mut m, "Simulation.Clock.End", json!("x")).unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidOverride);

        let e = apply_one(&mut m, "/nope", json!(1)).unwrap_err();
        assert_eq!(e.kind, ErrorKind::InvalidOverride);
    }

    #[test]
    fn apply_all_stops_on_first_error() {
        let mut m = model();
        let mut ov = BTreeMap::new();
        ov.insert("Simulation.Clock.Start".to_string(), json!("2001-01-01"));
        ov.insert("Simulation.Missing.X".to_string(), json!(1));
        assert!(apply_all(&mut m, &ov).is_err());
    }
}

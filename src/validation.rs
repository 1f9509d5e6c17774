//! Module parameter validation

use serde_json::Value;
use tracing::warn;

use crate::error::{GraphError, Result};
use crate::module::{ParamSpec, ParamType};

/// Validate a module's parameter object against its declared specs.
/// Unknown keys are tolerated but logged.
pub fn validate_params(owner: &str, params: &Value, specs: &[ParamSpec]) -> Result<()> {
    let empty = serde_json::Map::new();
    let object = match params {
        Value::Null => &empty,
        Value::Object(map) => map,
        other => {
            return Err(GraphError::InvalidParams(format!(
                "{}: parameters must be an object, got {}",
                owner, other
            )))
        }
    };

    for spec in specs {
        match object.get(spec.name) {
            Some(value) => validate_type(owner, spec, value)?,
            None if spec.required => {
                return Err(GraphError::InvalidParams(format!(
                    "{}: missing required parameter: {}",
                    owner, spec.name
                )))
            }
            None => {}
        }
    }

    for key in object.keys() {
        if !specs.iter().any(|s| s.name == key.as_str()) {
            warn!("{}: ignoring unknown parameter '{}'", owner, key);
        }
    }
    Ok(())
}

/// Validate that a value matches the expected type
fn validate_type(owner: &str, spec: &ParamSpec, value: &Value) -> Result<()> {
    let valid = match spec.ty {
        ParamType::String => value.is_string(),
        ParamType::Integer => value.is_u64() || value.is_i64(),
        ParamType::Number => value.is_number(),
        ParamType::Boolean => value.is_boolean(),
    };

    if !valid {
        return Err(GraphError::InvalidParams(format!(
            "{}: type mismatch for {}: expected {}, got {}",
            owner,
            spec.name,
            spec.ty.as_str(),
            value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SPECS: &[ParamSpec] = &[
        ParamSpec::required("path", ParamType::String),
        ParamSpec::optional("width", ParamType::Integer),
        ParamSpec::optional("weight", ParamType::Number),
    ];

    #[test]
    fn test_validate_required_fields() {
        assert!(validate_params("i-blob:main", &json!({ "path": "/tmp/in.raw" }), SPECS).is_ok());
        let err = validate_params("i-blob:main", &json!({ "width": 4 }), SPECS).unwrap_err();
        assert!(err.to_string().contains("missing required parameter: path"));
        assert!(validate_params("i-blob:main", &Value::Null, SPECS).is_err());
    }

    #[test]
    fn test_validate_types() {
        let valid = json!({ "path": "in.raw", "width": 64, "weight": 1 });
        assert!(validate_params("x", &valid, SPECS).is_ok());

        let invalid = json!({ "path": "in.raw", "width": "sixty-four" });
        assert!(validate_params("x", &invalid, SPECS).is_err());

        let fractional = json!({ "path": "in.raw", "width": 6.5 });
        assert!(validate_params("x", &fractional, SPECS).is_err());

        assert!(validate_params("x", &json!([1, 2]), SPECS).is_err());
    }
}

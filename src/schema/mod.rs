//! JSON-Schema validation that reports every violation at once.

use std::fmt;

use serde_json::Value;

/// One schema violation inside a named document section.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SchemaViolation {
    /// Section that was validated, for example `software.docker`.
    pub context: String,
    /// JSON pointer to the offending value; empty for the section root.
    pub path: String,
    /// Validator message.
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}: {}", self.context, self.message)
        } else {
            write!(f, "{}{}: {}", self.context, self.path, self.message)
        }
    }
}

/// Renders violations one per line.
#[must_use]
pub fn render_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(|violation| format!("  - {violation}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Validates `instance` against `schema`.
///
/// # Errors
///
/// Returns every violation found. A schema that does not compile is reported
/// as a single violation at the section root.
pub fn validate(schema: &Value, instance: &Value, context: &str) -> Result<(), Vec<SchemaViolation>> {
    let validator = jsonschema::validator_for(schema).map_err(|err| {
        vec![SchemaViolation {
            context: context.to_owned(),
            path: String::new(),
            message: format!("invalid schema: {err}"),
        }]
    })?;
    let violations: Vec<SchemaViolation> = validator
        .iter_errors(instance)
        .map(|err| SchemaViolation {
            context: context.to_owned(),
            path: err.instance_path.to_string(),
            message: err.to_string(),
        })
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["roles"],
            "properties": {
                "roles": {"type": "array", "items": {"type": "string"}},
                "version": {"type": "string"}
            },
            "additionalProperties": false
        })
    }

    #[rstest]
    fn valid_instance_passes() {
        let result = validate(&schema(), &json!({"roles": ["a"]}), "software.docker");
        assert_eq!(result, Ok(()));
    }

    #[rstest]
    fn every_violation_is_collected() {
        let instance = json!({"roles": [1], "version": 2, "extra": true});
        let Err(violations) = validate(&schema(), &instance, "software.docker") else {
            panic!("instance should be rejected");
        };
        assert_eq!(violations.len(), 3, "{violations:?}");
        assert!(violations.iter().all(|v| v.context == "software.docker"));
        assert!(violations.iter().any(|v| v.path == "/roles/0"));
        assert!(violations.iter().any(|v| v.path == "/version"));
    }

    #[rstest]
    fn display_joins_context_and_path() {
        let violation = SchemaViolation {
            context: String::from("sites"),
            path: String::from("/0/kind"),
            message: String::from("is a required property"),
        };
        assert_eq!(violation.to_string(), "sites/0/kind: is a required property");
    }
}

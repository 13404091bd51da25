//! Root schema for experiment documents.
//!
//! Only the shape shared by every document is described here. Provider
//! bodies, plugin sections, and kind-specific experiment keys are validated
//! later against the schema their registration declares.

use serde_json::{Value, json};

/// Keys every experiment entry may carry regardless of its kind.
pub const COMMON_EXPERIMENT_KEYS: [&str; 9] = [
    "kind",
    "name",
    "description",
    "count",
    "variables",
    "inputs",
    "setup",
    "post-scripts",
    "outputs",
];

/// Schema fragment for a list of role labels.
#[must_use]
pub fn roles_schema() -> Value {
    json!({
        "type": "array",
        "minItems": 1,
        "uniqueItems": true,
        "items": {"type": "string", "pattern": "^[a-zA-Z0-9._-]+$"}
    })
}

/// Schema fragment for an inline script bound to roles.
#[must_use]
pub fn script_schema() -> Value {
    json!({
        "type": "object",
        "required": ["roles", "script"],
        "properties": {
            "roles": roles_schema(),
            "script": {"type": "string"},
            "executable": {"type": "string", "minLength": 1}
        },
        "additionalProperties": false
    })
}

fn transfer_schema() -> Value {
    json!({
        "type": "object",
        "required": ["roles", "src", "dst"],
        "properties": {
            "roles": roles_schema(),
            "src": {"type": "string", "minLength": 1},
            "dst": {"type": "string", "minLength": 1}
        },
        "additionalProperties": false
    })
}

fn variables_schema() -> Value {
    json!({
        "type": "object",
        "patternProperties": {
            "^[A-Za-z_][A-Za-z0-9_]*$": {"type": ["string", "number"]}
        },
        "additionalProperties": false
    })
}

/// Schema every experiment document must satisfy.
#[must_use]
pub fn root_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "Kiso experiment",
        "type": "object",
        "required": ["name", "sites", "experiments"],
        "properties": {
            "name": {"type": "string", "minLength": 1},
            "variables": variables_schema(),
            "sites": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["kind", "resources"],
                    "properties": {
                        "kind": {"type": "string", "minLength": 1},
                        "name": {"type": "string", "minLength": 1},
                        "resources": {
                            "type": "object",
                            "required": ["machines"],
                            "properties": {
                                "machines": {
                                    "type": "array",
                                    "minItems": 1,
                                    "items": {
                                        "type": "object",
                                        "required": ["roles"],
                                        "properties": {
                                            "roles": roles_schema(),
                                            "number": {"type": "integer", "minimum": 1}
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            },
            "software": {
                "type": "object",
                "additionalProperties": {"type": "object"}
            },
            "deployment": {
                "type": "object",
                "additionalProperties": {"type": "object"}
            },
            "experiments": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["kind", "name"],
                    "properties": {
                        "kind": {"type": "string", "minLength": 1},
                        "name": {"type": "string", "pattern": "^[a-zA-Z0-9._-]+$"},
                        "description": {"type": "string"},
                        "count": {"type": "integer", "minimum": 1},
                        "variables": variables_schema(),
                        "inputs": {"type": "array", "items": transfer_schema()},
                        "setup": {"type": "array", "items": script_schema()},
                        "post-scripts": {"type": "array", "items": script_schema()},
                        "outputs": {"type": "array", "items": transfer_schema()}
                    }
                }
            }
        },
        "additionalProperties": false
    })
}

//! Per-type command validation.
//!
//! The rule set is established once at startup; unknown command types are
//! rejected before anything is persisted.

use std::collections::HashMap;

use crate::domain::{Command, DomainError};

/// Shape requirements for one command type.
#[derive(Debug, Clone, Default)]
pub struct TypeRule {
    /// Fields that must be present (and non-null) in the payload object.
    pub required_fields: Vec<&'static str>,
    /// Whether the payload may be empty (delete commands carry none).
    pub allow_empty_payload: bool,
}

/// Command validator with a type-to-rule mapping built at startup.
pub struct CommandValidator {
    rules: HashMap<String, TypeRule>,
}

impl CommandValidator {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Validator pre-loaded with the entity command family.
    pub fn with_entity_rules() -> Self {
        let mut validator = Self::new();
        validator.register(
            "entity.create",
            TypeRule {
                required_fields: vec!["name"],
                allow_empty_payload: false,
            },
        );
        validator.register(
            "entity.update",
            TypeRule {
                required_fields: vec![],
                allow_empty_payload: false,
            },
        );
        validator.register(
            "entity.delete",
            TypeRule {
                required_fields: vec![],
                allow_empty_payload: true,
            },
        );
        validator
    }

    pub fn register(&mut self, command_type: impl Into<String>, rule: TypeRule) {
        self.rules.insert(command_type.into(), rule);
    }

    pub fn known_type(&self, command_type: &str) -> bool {
        self.rules.contains_key(command_type)
    }

    /// Validate the command against its type's rule.
    pub fn validate(&self, command: &Command) -> Result<(), DomainError> {
        let rule = self.rules.get(&command.command_type).ok_or_else(|| {
            DomainError::validation(format!(
                "no handler registered for command type `{}`",
                command.command_type
            ))
        })?;

        if command.entity_id.is_empty() {
            return Err(DomainError::validation("entity id must not be empty"));
        }
        if command.entity_id.len() > 256 {
            return Err(DomainError::validation("entity id exceeds 256 characters"));
        }

        if command.max_retries < 0 {
            return Err(DomainError::validation("max_retries must be non-negative"));
        }
        if command.retry_count < 0 {
            return Err(DomainError::validation("retry_count must be non-negative"));
        }

        let payload = command.payload.as_object().ok_or_else(|| {
            DomainError::validation("command payload must be a JSON object")
        })?;

        if payload.is_empty() && !rule.allow_empty_payload {
            return Err(DomainError::validation(format!(
                "command type `{}` requires a non-empty payload",
                command.command_type
            )));
        }

        for field in &rule.required_fields {
            match payload.get(*field) {
                Some(value) if !value.is_null() => {}
                _ => {
                    return Err(DomainError::validation(format!(
                        "payload field `{field}` is required for `{}`",
                        command.command_type
                    )))
                }
            }
        }

        Ok(())
    }
}

impl Default for CommandValidator {
    fn default() -> Self {
        Self::with_entity_rules()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::Command;

    #[test]
    fn unknown_type_is_rejected() {
        let validator = CommandValidator::with_entity_rules();
        let cmd = Command::new("entity.rename", "e-1", json!({"name": "x"}));
        let err = validator.validate(&cmd).unwrap_err();
        assert!(err.to_string().contains("no handler"));
    }

    #[test]
    fn create_requires_name() {
        let validator = CommandValidator::with_entity_rules();

        let missing = Command::new("entity.create", "e-1", json!({"label": "x"}));
        assert!(validator.validate(&missing).is_err());

        let null_name = Command::new("entity.create", "e-1", json!({"name": null}));
        assert!(validator.validate(&null_name).is_err());

        let ok = Command::new("entity.create", "e-1", json!({"name": "x"}));
        assert!(validator.validate(&ok).is_ok());
    }

    #[test]
    fn delete_allows_empty_payload() {
        let validator = CommandValidator::with_entity_rules();
        let cmd = Command::new("entity.delete", "e-1", json!({}));
        assert!(validator.validate(&cmd).is_ok());
    }

    #[test]
    fn update_rejects_empty_payload() {
        let validator = CommandValidator::with_entity_rules();
        let cmd = Command::new("entity.update", "e-1", json!({}));
        assert!(validator.validate(&cmd).is_err());
    }

    #[test]
    fn entity_id_must_be_present() {
        let validator = CommandValidator::with_entity_rules();
        let cmd = Command::new("entity.update", "", json!({"n": 1}));
        assert!(validator.validate(&cmd).is_err());
    }

    #[test]
    fn payload_must_be_object() {
        let validator = CommandValidator::with_entity_rules();
        let cmd = Command::new("entity.update", "e-1", json!([1, 2]));
        assert!(validator.validate(&cmd).is_err());
    }
}

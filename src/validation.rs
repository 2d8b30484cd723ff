use crate::errors::{DomainError, DomainResult, ValidationError};
use regex::Regex;
use std::sync::OnceLock;

/// A trait that entities should implement for validation.
pub trait Validate {
    /// Validates the entity and returns an error if validation fails.
    fn validate(&self) -> DomainResult<()>;
}

// Common regex patterns
fn sha256_hex_regex() -> &'static Regex {
    static SHA256_REGEX: OnceLock<Regex> = OnceLock::new();
    SHA256_REGEX.get_or_init(|| Regex::new(r"^[0-9a-f]{64}$").unwrap())
}

fn color_regex() -> &'static Regex {
    static COLOR_REGEX: OnceLock<Regex> = OnceLock::new();
    COLOR_REGEX.get_or_init(|| Regex::new(r"^#[0-9a-fA-F]{6}([0-9a-fA-F]{2})?$").unwrap())
}

/// Struct for configuring validations in a fluent style
#[derive(Default)]
pub struct ValidationBuilder<T> {
    field_name: String,
    value: Option<T>,
    errors: Vec<ValidationError>,
}

impl<T> ValidationBuilder<T> {
    pub fn new(field_name: &str, value: Option<T>) -> Self {
        Self {
            field_name: field_name.to_string(),
            value,
            errors: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self
    where
        T: Default + PartialEq,
    {
        if self.value.is_none() || self.value == Some(T::default()) {
            self.errors.push(ValidationError::required(&self.field_name));
        }
        self
    }

    pub fn validate_with<F>(mut self, validator: F) -> Self
    where
        F: FnOnce(&T) -> Result<(), ValidationError>,
    {
        if let Some(value) = &self.value {
            if let Err(err) = validator(value) {
                self.errors.push(err);
            }
        }
        self
    }

    /// Complete validation and return result
    pub fn validate(self) -> DomainResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            // Return the first error for simplicity
            Err(DomainError::Validation(self.errors[0].clone()))
        }
    }
}

/// String-specific validations
impl ValidationBuilder<String> {
    pub fn min_length(mut self, min: usize) -> Self {
        if let Some(value) = &self.value {
            if value.len() < min {
                self.errors.push(ValidationError::min_length(&self.field_name, min));
            }
        }
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        if let Some(value) = &self.value {
            if value.len() > max {
                self.errors.push(ValidationError::max_length(&self.field_name, max));
            }
        }
        self
    }

    pub fn matches_pattern(mut self, pattern: &Regex, message: &str) -> Self {
        if let Some(value) = &self.value {
            if !pattern.is_match(value) {
                self.errors.push(ValidationError::format(&self.field_name, message));
            }
        }
        self
    }

    pub fn sha256_hex(self) -> Self {
        self.matches_pattern(sha256_hex_regex(), "must be a lowercase hex SHA-256 digest")
    }

    pub fn hex_color(self) -> Self {
        self.matches_pattern(color_regex(), "must be a #RRGGBB or #RRGGBBAA color")
    }

    pub fn one_of(mut self, allowed_values: &[&str], message: Option<&str>) -> Self {
        if let Some(value) = &self.value {
            if !allowed_values.contains(&value.as_str()) {
                let reason = message.unwrap_or("must be one of the allowed values");
                self.errors
                    .push(ValidationError::invalid_value(&self.field_name, reason));
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_rejects_empty_string() {
        let result = ValidationBuilder::new("title", Some(String::new()))
            .required()
            .validate();
        assert!(result.is_err());
    }

    #[test]
    fn max_length_enforced() {
        let result = ValidationBuilder::new("title", Some("x".repeat(600)))
            .max_length(500)
            .validate();
        assert!(result.is_err());
    }

    #[test]
    fn sha256_hex_accepts_digest() {
        let digest = "a".repeat(64);
        assert!(ValidationBuilder::new("fileHash", Some(digest))
            .sha256_hex()
            .validate()
            .is_ok());
        assert!(ValidationBuilder::new("fileHash", Some("not-a-hash".to_string()))
            .sha256_hex()
            .validate()
            .is_err());
    }

    #[test]
    fn one_of_rejects_unknown() {
        let result = ValidationBuilder::new("status", Some("bogus".to_string()))
            .one_of(&["inbox", "next"], None)
            .validate();
        assert!(result.is_err());
    }
}

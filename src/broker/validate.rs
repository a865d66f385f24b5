use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self { status: ValidationStatus::Success, message: None }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self { status: ValidationStatus::Failure, message: Some(message.into()) }
    }

    pub fn is_success(&self) -> bool {
        self.status == ValidationStatus::Success
    }
}

/// Caller supplied acceptance check for a decoded reply.
///
/// Implemented for any `Fn(&Value) -> ValidationResult`, so most call
/// sites just pass a closure.
pub trait ResponseValidator: Send + Sync {
    fn validate(&self, value: &Value) -> ValidationResult;
}

impl<F> ResponseValidator for F
where
    F: Fn(&Value) -> ValidationResult + Send + Sync,
{
    fn validate(&self, value: &Value) -> ValidationResult {
        self(value)
    }
}

/// Accepts replies whose top-level `key` equals `expected`
pub struct FieldEquals {
    key: String,
    expected: Value,
}

impl FieldEquals {
    pub fn new(key: impl Into<String>, expected: impl Into<Value>) -> Self {
        Self { key: key.into(), expected: expected.into() }
    }
}

impl ResponseValidator for FieldEquals {
    fn validate(&self, value: &Value) -> ValidationResult {
        match value.get(&self.key) {
            Some(actual) if *actual == self.expected => ValidationResult::success(),
            Some(actual) => ValidationResult::failure(format!(
                "expected '{}' to be {}, got {}", self.key, self.expected, actual
            )),
            None => ValidationResult::failure(format!("missing '{}' in response", self.key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_closure_validator() {
        let validator = |v: &Value| {
            if v.is_object() {
                ValidationResult::success()
            } else {
                ValidationResult::failure("not an object")
            }
        };
        assert!(validator.validate(&json!({})).is_success());
        assert_eq!(
            validator.validate(&json!([])).message.as_deref(),
            Some("not an object")
        );
    }

    #[test]
    fn test_field_equals() {
        let validator = FieldEquals::new("message", "success");
        assert!(validator.validate(&json!({"message": "success"})).is_success());

        let rejected = validator.validate(&json!({"message": "fail"}));
        assert_eq!(rejected.status, ValidationStatus::Failure);
        assert!(rejected.message.unwrap().contains("\"fail\""));

        let missing = validator.validate(&json!({"code": 200}));
        assert_eq!(missing.message.as_deref(), Some("missing 'message' in response"));
    }

    #[test]
    fn test_result_serializes_like_the_log() {
        let value = serde_json::to_value(ValidationResult::failure("too long")).unwrap();
        assert_eq!(value, json!({"status": "failure", "message": "too long"}));
    }
}

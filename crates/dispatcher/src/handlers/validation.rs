use serde_json::Value;

use relay_core::{Envelope, RelayError, RelayResult};

/// Declarative required-field check. Each rule is a field name or several
/// alternatives joined by `|` (`"userId|user_id"`); a rule passes when any
/// alternative holds a non-empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequiredFields {
    rules: Vec<Vec<String>>,
}

impl RequiredFields {
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = rules
            .into_iter()
            .map(|rule| {
                rule.as_ref()
                    .split('|')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|alternatives| !alternatives.is_empty())
            .collect();
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn check(&self, request: &Envelope) -> RelayResult<()> {
        let missing: Vec<&str> = self
            .rules
            .iter()
            .filter(|alternatives| !alternatives.iter().any(|name| is_present(request.body.get(name))))
            .map(|alternatives| alternatives[0].as_str())
            .collect();

        match missing.as_slice() {
            [] => Ok(()),
            [one] => Err(RelayError::Validation(format!("{one} is required"))),
            many => Err(RelayError::Validation(format!("{} are required", many.join(", ")))),
        }
    }
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: Value) -> Envelope {
        Envelope::from_value(value).unwrap()
    }

    #[test]
    fn test_alternatives() {
        let rules = RequiredFields::new(["userId|user_id", "period"]);
        assert!(rules.check(&envelope(json!({"user_id": "u", "period": "monthly"}))).is_ok());
        assert!(rules.check(&envelope(json!({"userId": "u", "period": "monthly"}))).is_ok());

        let err = rules.check(&envelope(json!({"period": "monthly"}))).unwrap_err();
        assert_eq!(err.to_string(), RelayError::Validation("userId is required".to_string()).to_string());
    }

    #[test]
    fn test_empty_values_count_as_missing() {
        let rules = RequiredFields::new(["message", "user_id"]);
        let err = rules
            .check(&envelope(json!({"message": "  ", "user_id": null})))
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(msg) if msg == "message, user_id are required"));
    }

    #[test]
    fn test_numbers_and_zero_are_present() {
        let rules = RequiredFields::new(["totalIncome|total_income"]);
        assert!(rules.check(&envelope(json!({"totalIncome": 0}))).is_ok());
    }

    #[test]
    fn test_blank_rules_are_ignored() {
        assert!(RequiredFields::new(["", " | "]).is_empty());
    }
}

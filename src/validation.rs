//! Input validation: the `ValidatedJson<T>` extractor plus the domain
//! validators used by import/settings request types.

use axum::{
    body::HttpBody,
    extract::{rejection::JsonRejection, FromRequest},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    BoxError, Json,
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedJson<T>(pub T);

#[derive(Debug)]
pub enum ValidationRejection {
    JsonRejection(JsonRejection),
    ValidationError(ValidationErrors),
}

impl IntoResponse for ValidationRejection {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ValidationRejection::JsonRejection(rejection) => {
                let message = match rejection {
                    JsonRejection::JsonDataError(_) => "Invalid JSON format",
                    JsonRejection::JsonSyntaxError(_) => "JSON syntax error",
                    JsonRejection::MissingJsonContentType(_) => {
                        "Missing Content-Type: application/json header"
                    }
                    _ => "Bad request",
                };
                (StatusCode::BAD_REQUEST, message.to_string())
            }
            ValidationRejection::ValidationError(errors) => {
                let mut messages = Vec::new();
                for (field, errors) in errors.field_errors() {
                    for error in errors {
                        messages.push(format!(
                            "{}: {}",
                            field,
                            error.message.as_ref().unwrap_or(&"Invalid value".into())
                        ));
                    }
                }
                (StatusCode::BAD_REQUEST, messages.join(", "))
            }
        };

        let body = Json(serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[axum::async_trait]
impl<T, S, B> FromRequest<S, B> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
    B: HttpBody + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
    Json<T>: FromRequest<S, B, Rejection = JsonRejection>,
{
    type Rejection = ValidationRejection;

    async fn from_request(req: Request<B>, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(ValidationRejection::JsonRejection)?;

        value
            .validate()
            .map_err(ValidationRejection::ValidationError)?;

        Ok(ValidatedJson(value))
    }
}

/// Domain validators for import/settings request types.
pub mod validators {
    use super::*;
    use regex::Regex;

    /// `^[A-Za-z]\d{3}$` after whitespace removal (spec §4.1).
    pub fn validate_wbs6_code(code: &str) -> Result<(), ValidationError> {
        let cleaned: String = code.chars().filter(|c| !c.is_whitespace()).collect();
        let re = Regex::new(r"^[A-Za-z]\d{3}$").unwrap();
        if re.is_match(&cleaned) {
            Ok(())
        } else {
            Err(ValidationError::new("invalid_wbs6_code"))
        }
    }

    /// `^[A-Za-z]\d{3}[.\s_-]?\d{3}$` (spec §4.1).
    pub fn validate_wbs7_code(code: &str) -> Result<(), ValidationError> {
        let re = Regex::new(r"^[A-Za-z]\d{3}[.\s_-]?\d{3}$").unwrap();
        if re.is_match(code) {
            Ok(())
        } else {
            Err(ValidationError::new("invalid_wbs7_code"))
        }
    }

    pub fn validate_positive_decimal(value: &rust_decimal::Decimal) -> Result<(), ValidationError> {
        if *value > rust_decimal::Decimal::ZERO {
            Ok(())
        } else {
            Err(ValidationError::new("must_be_positive"))
        }
    }

    pub fn validate_non_negative_decimal(
        value: &rust_decimal::Decimal,
    ) -> Result<(), ValidationError> {
        if *value >= rust_decimal::Decimal::ZERO {
            Ok(())
        } else {
            Err(ValidationError::new("must_be_non_negative"))
        }
    }

    pub fn validate_percentage(value: &f64) -> Result<(), ValidationError> {
        if (0.0..=100.0).contains(value) {
            Ok(())
        } else {
            Err(ValidationError::new("invalid_percentage"))
        }
    }

    pub fn validate_round_number(value: &i32) -> Result<(), ValidationError> {
        if *value >= 1 {
            Ok(())
        } else {
            Err(ValidationError::new("invalid_round_number"))
        }
    }

    pub fn validate_non_empty(value: &str) -> Result<(), ValidationError> {
        if !value.trim().is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new("cannot_be_empty"))
        }
    }

    pub fn validate_file_extension(value: &str) -> Result<(), ValidationError> {
        let allowed = ["xls", "xlsx", "xlsm", "xml", "mmcomm"];
        let ext = value.rsplit('.').next().unwrap_or("").to_lowercase();
        if allowed.contains(&ext.as_str()) {
            Ok(())
        } else {
            Err(ValidationError::new("unsupported_file_extension"))
        }
    }
}

#[allow(dead_code)]
#[cfg(test)]
mod tests {
    use super::validators::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_wbs6_code_accepts_letter_plus_three_digits() {
        assert!(validate_wbs6_code("A004").is_ok());
        assert!(validate_wbs6_code("A 004").is_ok());
        assert!(validate_wbs6_code("A0045").is_err());
    }

    #[test]
    fn test_wbs7_code_accepts_optional_separator() {
        assert!(validate_wbs7_code("A004.010").is_ok());
        assert!(validate_wbs7_code("A004010").is_ok());
        assert!(validate_wbs7_code("A004-010").is_ok());
        assert!(validate_wbs7_code("A004").is_err());
    }

    #[test]
    fn test_positive_decimal() {
        assert!(validate_positive_decimal(&Decimal::new(1, 0)).is_ok());
        assert!(validate_positive_decimal(&Decimal::ZERO).is_err());
        assert!(validate_positive_decimal(&Decimal::new(-1, 0)).is_err());
    }

    #[test]
    fn test_file_extension() {
        assert!(validate_file_extension("computo.xlsx").is_ok());
        assert!(validate_file_extension("computo.pdf").is_err());
    }
}

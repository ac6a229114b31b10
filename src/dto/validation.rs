//! Validation helpers for DTOs.

use validator::ValidationError;

/// Validates that a chat platform snowflake is non-zero.
///
/// # Examples
///
/// ```ignore
/// validate_snowflake(&1_234_567_890) // Ok
/// validate_snowflake(&0)             // Err
/// ```
pub fn validate_snowflake(id: &u64) -> Result<(), ValidationError> {
    if *id == 0 {
        let mut err = ValidationError::new("snowflake_zero");
        err.message = Some("Identifier must be a non-zero snowflake".into());
        return Err(err);
    }
    Ok(())
}

/// Validates that a track identifier is non-blank and free of control characters.
pub fn validate_track_identifier(identifier: &str) -> Result<(), ValidationError> {
    if identifier.trim().is_empty() {
        let mut err = ValidationError::new("identifier_blank");
        err.message = Some("Track identifier must not be blank".into());
        return Err(err);
    }

    if identifier.chars().any(char::is_control) {
        let mut err = ValidationError::new("identifier_format");
        err.message = Some("Track identifier must not contain control characters".into());
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snowflakes_must_be_non_zero() {
        assert!(validate_snowflake(&42).is_ok());
        assert!(validate_snowflake(&0).is_err());
    }

    #[test]
    fn track_identifiers_reject_blank_and_control_characters() {
        assert!(validate_track_identifier("QAAAjwIAJ1J1").is_ok());
        assert!(validate_track_identifier("   ").is_err());
        assert!(validate_track_identifier("abc\n").is_err());
    }
}

//! Validation helpers for DTOs.

use validator::ValidationError;

const MAX_USER_ID_LEN: usize = 64;

/// Validates that a user ID is 1 to 64 ASCII letters, digits, `-` or `_`.
///
/// # Examples
///
/// ```ignore
/// validate_user_id("ada_42") // Ok
/// validate_user_id("")       // Err - empty
/// validate_user_id("a b")    // Err - space
/// ```
pub fn validate_user_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() || id.len() > MAX_USER_ID_LEN {
        let mut err = ValidationError::new("user_id_length");
        err.message = Some(
            format!(
                "User ID must be between 1 and {MAX_USER_ID_LEN} characters (got {})",
                id.len()
            )
            .into(),
        );
        return Err(err);
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        let mut err = ValidationError::new("user_id_format");
        err.message = Some("User ID may only contain letters, digits, `-` and `_`".into());
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_user_id_valid() {
        assert!(validate_user_id("ada").is_ok());
        assert!(validate_user_id("bot-easy_1").is_ok());
        assert!(validate_user_id(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn test_validate_user_id_invalid_length() {
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_user_id_invalid_format() {
        assert!(validate_user_id("ada lovelace").is_err());
        assert!(validate_user_id("ada/1").is_err());
        assert!(validate_user_id("éa").is_err());
    }
}

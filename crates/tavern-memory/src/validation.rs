//! Boundary input validation.
//!
//! The storage core keeps text fields as unvalidated strings.  These checks
//! are applied where text enters the system: messages at ingestion and
//! candidate facts as they come back from an extraction oracle.

use thiserror::Error;

pub const MAX_FACT_LENGTH: usize = 500;
pub const MAX_DISPLAY_NAME_LENGTH: usize = 100;
pub const MAX_MESSAGE_LENGTH: usize = 2000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("{field} too long ({len} > {max} characters)")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len > max {
        Err(ValidationError::TooLong { field, len, max })
    } else {
        Ok(())
    }
}

/// Candidate fact text: non-blank, at most [`MAX_FACT_LENGTH`] characters.
pub fn validate_fact(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty("fact"));
    }
    check_len("fact", content, MAX_FACT_LENGTH)
}

/// Author display name: non-blank, at most [`MAX_DISPLAY_NAME_LENGTH`] characters.
pub fn validate_display_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::Empty("display name"));
    }
    check_len("display name", name, MAX_DISPLAY_NAME_LENGTH)
}

/// Message body.  Empty bodies are allowed (attachment-only messages).
pub fn validate_message(text: &str) -> Result<(), ValidationError> {
    check_len("message", text, MAX_MESSAGE_LENGTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_fact_is_rejected() {
        assert_eq!(validate_fact("   "), Err(ValidationError::Empty("fact")));
    }

    #[test]
    fn fact_length_is_counted_in_characters() {
        let at_limit = "é".repeat(MAX_FACT_LENGTH);
        assert!(validate_fact(&at_limit).is_ok());
        let over = "é".repeat(MAX_FACT_LENGTH + 1);
        assert!(matches!(
            validate_fact(&over),
            Err(ValidationError::TooLong { len, .. }) if len == MAX_FACT_LENGTH + 1
        ));
    }

    #[test]
    fn empty_message_is_allowed() {
        assert!(validate_message("").is_ok());
        assert!(validate_message(&"x".repeat(MAX_MESSAGE_LENGTH + 1)).is_err());
    }

    #[test]
    fn display_name_limits() {
        assert!(validate_display_name("Ada").is_ok());
        assert!(validate_display_name("").is_err());
        assert!(validate_display_name(&"n".repeat(MAX_DISPLAY_NAME_LENGTH + 1)).is_err());
    }
}

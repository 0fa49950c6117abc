//! Input checks applied before anything reaches a service call.

use crate::errors::ValidationError;

pub const ADDRESS_MIN_LEN: usize = 5;
pub const ADDRESS_MAX_LEN: usize = 200;
pub const DISPLAY_NAME_MAX_LEN: usize = 80;
pub const CHAT_MESSAGE_MAX_LEN: usize = 2000;

/// Normalize and check free-form address text. Returns the trimmed address
/// with internal whitespace collapsed.
pub fn validate_address_input(input: &str) -> Result<String, ValidationError> {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return Err(ValidationError::Empty { field: "address" });
    }
    let len = collapsed.chars().count();
    if !(ADDRESS_MIN_LEN..=ADDRESS_MAX_LEN).contains(&len) {
        return Err(ValidationError::Length {
            field: "address",
            min: ADDRESS_MIN_LEN,
            max: ADDRESS_MAX_LEN,
        });
    }
    if collapsed.chars().any(char::is_control) {
        return Err(ValidationError::Invalid {
            field: "address",
            message: "contains control characters".to_string(),
        });
    }
    if !collapsed.chars().any(|c| c.is_ascii_digit()) {
        return Err(ValidationError::Invalid {
            field: "address",
            message: "must include a street number".to_string(),
        });
    }
    if !collapsed.chars().any(char::is_alphabetic) {
        return Err(ValidationError::Invalid {
            field: "address",
            message: "must include a street name".to_string(),
        });
    }
    Ok(collapsed)
}

/// Lowercase and check an email address.
pub fn validate_email(input: &str) -> Result<String, ValidationError> {
    let email = input.trim().to_lowercase();
    if email.is_empty() {
        return Err(ValidationError::Empty { field: "email" });
    }
    let invalid = |message: &str| ValidationError::Invalid {
        field: "email",
        message: message.to_string(),
    };
    if email.chars().any(char::is_whitespace) {
        return Err(invalid("must not contain spaces"));
    }
    let Some((local, domain)) = email.split_once('@') else {
        return Err(invalid("missing '@'"));
    };
    if local.is_empty() || domain.contains('@') {
        return Err(invalid("malformed local part"));
    }
    let domain_ok = domain
        .split('.')
        .collect::<Vec<_>>()
        .split_last()
        .is_some_and(|(tld, rest)| {
            !rest.is_empty() && tld.len() >= 2 && rest.iter().all(|label| !label.is_empty())
        });
    if !domain_ok {
        return Err(invalid("malformed domain"));
    }
    Ok(email)
}

pub fn validate_display_name(input: Option<&str>) -> Result<Option<String>, ValidationError> {
    let Some(name) = input.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(None);
    };
    if name.chars().count() > DISPLAY_NAME_MAX_LEN {
        return Err(ValidationError::Length {
            field: "display_name",
            min: 1,
            max: DISPLAY_NAME_MAX_LEN,
        });
    }
    Ok(Some(name.to_string()))
}

pub fn validate_chat_message(input: &str) -> Result<String, ValidationError> {
    let text = input.trim();
    if text.is_empty() {
        return Err(ValidationError::Empty { field: "message" });
    }
    if text.chars().count() > CHAT_MESSAGE_MAX_LEN {
        return Err(ValidationError::Length {
            field: "message",
            min: 1,
            max: CHAT_MESSAGE_MAX_LEN,
        });
    }
    Ok(text.to_string())
}

//! Syntactic email validation.
//!
//! Accepts the two RFC 5322 shapes clients actually send: a bare
//! `local@domain` addr-spec and the `Display Name <local@domain>` form.
//! Only dot-atom local parts are supported; quoted local parts are rejected.

use std::sync::LazyLock;

use crate::error::AuthError;

/// dot-atom local part, '@', one or more hostname labels.
static ADDR_SPEC_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"^[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+(\.[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+)*@[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$",
    )
    .expect("Invalid addr-spec regex")
});

/// Validates `input` and returns the bare addr-spec it contains.
///
/// # Errors
///
/// Returns [`AuthError::InvalidEmail`] when the input is empty or not a
/// well-formed address.
pub fn validate_email(input: &str) -> Result<String, AuthError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AuthError::invalid_email("email is empty"));
    }

    let addr = match (trimmed.rfind('<'), trimmed.strip_suffix('>')) {
        (Some(open), Some(without_close)) => {
            let display = &trimmed[..open];
            if display.contains(['<', '>', '@']) && !is_quoted(display.trim()) {
                return Err(AuthError::invalid_email("malformed display name"));
            }
            &without_close[open + 1..]
        }
        (None, None) => trimmed,
        _ => return Err(AuthError::invalid_email("unbalanced angle brackets")),
    };

    if addr.len() > 254 {
        return Err(AuthError::invalid_email("address too long"));
    }
    if !ADDR_SPEC_REGEX.is_match(addr) {
        return Err(AuthError::invalid_email("missing @ or invalid address"));
    }
    Ok(addr.to_string())
}

fn is_quoted(s: &str) -> bool {
    s.len() >= 2 && s.starts_with('"') && s.ends_with('"')
}

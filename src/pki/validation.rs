//! Input checks run before anything reaches Easy-RSA.

use thiserror::Error;

/// Longest common name accepted; the X.509 upper bound for CN.
pub const MAX_NAME_LEN: usize = 64;
pub const MAX_TEMPLATE_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name is too long")]
    TooLong,
    #[error("name may not start with '{0}'")]
    BadStart(char),
    #[error("name contains '{0}'; use letters, digits, '.', '-' or '_'")]
    BadCharacter(char),
    #[error("name may not be '.' or '..'")]
    Reserved,
}

/// Certificate and request names become file names under the PKI and
/// command arguments; only a conservative ASCII set is allowed.
pub fn validate_certificate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong);
    }
    if name == "." || name == ".." {
        return Err(NameError::Reserved);
    }
    if let Some(bad) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))) {
        return Err(NameError::BadCharacter(bad));
    }
    match name.chars().next() {
        Some(first @ ('-' | '.')) => Err(NameError::BadStart(first)),
        _ => Ok(()),
    }
}

/// Template names map to `<name>.vars` inside the template directory.
pub fn validate_template_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_TEMPLATE_LEN {
        return Err(NameError::TooLong);
    }
    match name.chars().find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))) {
        Some(bad) => Err(NameError::BadCharacter(bad)),
        None => Ok(()),
    }
}

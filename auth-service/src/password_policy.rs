//! Password complexity rules applied at registration and password change.
//!
//! Only the candidate password is checked; nothing here touches storage.

use std::fmt;

pub const MIN_LENGTH: usize = 8;
pub const MAX_LENGTH: usize = 128;
pub const SPECIAL_CHARACTERS: &str = "@$!%*?&#^()-_=+[]{}|;:,.<>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordViolation {
    Required,
    TooShort,
    TooLong,
    MissingUppercase,
    MissingLowercase,
    MissingDigit,
    MissingSpecial,
}

impl PasswordViolation {
    pub fn message(&self) -> String {
        match self {
            PasswordViolation::Required => "is required".to_string(),
            PasswordViolation::TooShort => format!("must be at least {MIN_LENGTH} characters"),
            PasswordViolation::TooLong => format!("must not exceed {MAX_LENGTH} characters"),
            PasswordViolation::MissingUppercase => {
                "must contain at least one uppercase letter".to_string()
            }
            PasswordViolation::MissingLowercase => {
                "must contain at least one lowercase letter".to_string()
            }
            PasswordViolation::MissingDigit => "must contain at least one number".to_string(),
            PasswordViolation::MissingSpecial => {
                format!("must contain at least one special character ({SPECIAL_CHARACTERS})")
            }
        }
    }
}

impl fmt::Display for PasswordViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PasswordPolicy;

impl PasswordPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Collects every violated rule. Characters outside the explicit classes (spaces,
    /// accented letters) count toward length and are otherwise ignored.
    pub fn validate(&self, password: Option<&str>) -> Result<(), Vec<PasswordViolation>> {
        let password = match password {
            Some(value) if !value.is_empty() => value,
            _ => return Err(vec![PasswordViolation::Required]),
        };

        let mut violations = Vec::new();
        let length = password.chars().count();
        if length < MIN_LENGTH {
            violations.push(PasswordViolation::TooShort);
        }
        if length > MAX_LENGTH {
            violations.push(PasswordViolation::TooLong);
        }
        if !password.chars().any(|c| c.is_ascii_uppercase()) {
            violations.push(PasswordViolation::MissingUppercase);
        }
        if !password.chars().any(|c| c.is_ascii_lowercase()) {
            violations.push(PasswordViolation::MissingLowercase);
        }
        if !password.chars().any(|c| c.is_ascii_digit()) {
            violations.push(PasswordViolation::MissingDigit);
        }
        if !password.chars().any(|c| SPECIAL_CHARACTERS.contains(c)) {
            violations.push(PasswordViolation::MissingSpecial);
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

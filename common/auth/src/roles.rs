pub const ROLE_USER: &str = "USER";
pub const ROLE_ADMIN: &str = "ADMIN";

/// Roles granted to every newly registered account.
pub const DEFAULT_ROLES: &[&str] = &[ROLE_USER];

const MAX_ROLE_LEN: usize = 50;

/// Upper-cases a role name and checks it is 1-50 chars of `[A-Z0-9_]`.
pub fn normalize_role(raw: &str) -> Option<String> {
    let role = raw.trim().to_ascii_uppercase();
    let valid = !role.is_empty()
        && role.len() <= MAX_ROLE_LEN
        && role
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    valid.then_some(role)
}

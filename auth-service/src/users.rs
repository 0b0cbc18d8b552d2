use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use common_auth::{normalize_role, DEFAULT_ROLES, ROLE_ADMIN};
use common_http_errors::FieldError;
use tracing::{info, warn};
use uuid::Uuid;

use crate::authorization::{Action, AuthorizationPolicy, Identity};
use crate::error::{ServiceError, ServiceResult};
use crate::metrics::AuthMetrics;
use crate::model::{
    is_well_formed_email, normalize_email, RoleAction, RoleChangeEntry, User, UserAttributes,
};
use crate::password_policy::PasswordPolicy;
use crate::passwords::{hash_password, verify_password, PasswordChecker};
use crate::store::{
    DeletedFilter, IdentityField, RoleChangeLog, SoftDeleteOutcome, StoreError, UserStore,
};
use crate::tokens::TokenService;

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 50;
const NAME_MAX: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub email: Option<String>,
    pub password: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub attributes: Option<UserAttributes>,
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub email: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub enabled: Option<bool>,
    pub attributes: Option<UserAttributes>,
}

#[derive(Debug, Clone, Default)]
pub struct PasswordChange {
    pub old_password: Option<String>,
    pub new_password: Option<String>,
    pub confirm_password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserSort {
    #[default]
    Email,
    Username,
    FirstName,
    LastName,
}

impl UserSort {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "email" => Some(UserSort::Email),
            "username" => Some(UserSort::Username),
            "firstName" => Some(UserSort::FirstName),
            "lastName" => Some(UserSort::LastName),
            _ => None,
        }
    }

    fn key<'a>(&self, user: &'a User) -> Option<&'a str> {
        match self {
            UserSort::Email => Some(user.email.as_str()),
            UserSort::Username => user.username.as_deref(),
            UserSort::FirstName => user.first_name.as_deref(),
            UserSort::LastName => user.last_name.as_deref(),
        }
    }

    /// Case-insensitive, missing values last, email as tie-breaker.
    fn compare(&self, left: &User, right: &User) -> Ordering {
        let by_key = match (self.key(left), self.key(right)) {
            (Some(a), Some(b)) => a.to_lowercase().cmp(&b.to_lowercase()),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_key.then_with(|| left.email.cmp(&right.email))
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn check_email(email: &str, errors: &mut Vec<FieldError>) {
    if !is_well_formed_email(email) {
        errors.push(
            FieldError::new("email", "must be a well-formed email address").with_rejected(email),
        );
    }
}

fn check_username(username: &str, errors: &mut Vec<FieldError>) {
    let length = username.chars().count();
    let allowed = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&length) || !allowed {
        errors.push(
            FieldError::new(
                "username",
                format!(
                    "must be {USERNAME_MIN}-{USERNAME_MAX} characters of letters, digits, '.', '_' or '-'"
                ),
            )
            .with_rejected(username),
        );
    }
}

fn check_name(field: &str, value: Option<&str>, errors: &mut Vec<FieldError>) {
    if let Some(value) = value {
        if value.chars().count() > NAME_MAX {
            errors.push(FieldError::new(
                field,
                format!("must not exceed {NAME_MAX} characters"),
            ));
        }
    }
}

/// Registration, profile maintenance, soft deletion, role administration and password
/// changes, each gated by [`AuthorizationPolicy`].
pub struct UserLifecycleService {
    users: Arc<dyn UserStore>,
    role_log: Arc<dyn RoleChangeLog>,
    tokens: Arc<TokenService>,
    passwords: Arc<dyn PasswordChecker>,
    policy: PasswordPolicy,
    metrics: Arc<AuthMetrics>,
}

impl UserLifecycleService {
    pub fn new(
        users: Arc<dyn UserStore>,
        role_log: Arc<dyn RoleChangeLog>,
        tokens: Arc<TokenService>,
        passwords: Arc<dyn PasswordChecker>,
        metrics: Arc<AuthMetrics>,
    ) -> Self {
        Self {
            users,
            role_log,
            tokens,
            passwords,
            policy: PasswordPolicy::new(),
            metrics,
        }
    }

    fn password_errors(&self, field: &str, password: Option<&str>) -> Vec<FieldError> {
        match self.policy.validate(password) {
            Ok(()) => Vec::new(),
            Err(violations) => violations
                .into_iter()
                .map(|violation| FieldError::new(field, violation.message()))
                .collect(),
        }
    }

    /// New accounts are enabled and hold only the default roles. Every validation problem
    /// is reported at once; identity collisions are a conflict, not a validation error.
    pub async fn register(&self, registration: Registration) -> ServiceResult<User> {
        let email = trimmed(registration.email).map(|value| normalize_email(&value));
        let username = trimmed(registration.username);
        let first_name = trimmed(registration.first_name);
        let last_name = trimmed(registration.last_name);

        let mut errors = Vec::new();
        match email.as_deref() {
            Some(email) => check_email(email, &mut errors),
            None => errors.push(FieldError::new("email", "is required")),
        }
        if let Some(username) = username.as_deref() {
            check_username(username, &mut errors);
        }
        check_name("firstName", first_name.as_deref(), &mut errors);
        check_name("lastName", last_name.as_deref(), &mut errors);
        errors.extend(self.password_errors("password", registration.password.as_deref()));
        if !errors.is_empty() {
            return Err(ServiceError::Validation(errors));
        }

        let (Some(email), Some(password)) = (email, registration.password) else {
            return Err(ServiceError::field("email", "is required"));
        };

        // Races past this check are settled by the store's unique constraint.
        if self.users.exists_by_email(&email, DeletedFilter::Exclude).await? {
            return Err(ServiceError::DuplicateIdentity {
                field: IdentityField::Email,
            });
        }
        if let Some(username) = username.as_deref() {
            if self
                .users
                .exists_by_username(username, DeletedFilter::Exclude)
                .await?
            {
                return Err(ServiceError::DuplicateIdentity {
                    field: IdentityField::Username,
                });
            }
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email,
            username,
            password_hash: hash_password(&self.passwords, &password).await?,
            first_name,
            last_name,
            roles: DEFAULT_ROLES
                .iter()
                .map(|role| role.to_string())
                .collect::<BTreeSet<_>>(),
            enabled: true,
            attributes: registration.attributes.unwrap_or_default(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        self.users.insert(&user).await?;
        info!(user_id = %user.id, "User registered");
        Ok(user)
    }

    /// Makes sure the named account exists and holds `ADMIN`. The grant is recorded as
    /// self-acted. Used once at startup so a fresh deployment has an administrator.
    pub async fn bootstrap_admin(&self, email: &str, password: &str) -> ServiceResult<User> {
        let normalized = normalize_email(email);
        let user = match self
            .users
            .find_by_email(&normalized, DeletedFilter::Exclude)
            .await?
        {
            Some(user) => user,
            None => {
                self.register(Registration {
                    email: Some(normalized),
                    password: Some(password.to_string()),
                    ..Registration::default()
                })
                .await?
            }
        };
        let actor = Identity::new(user.id, vec![ROLE_ADMIN.to_string()]);
        self.mutate_role(&actor, user.id, ROLE_ADMIN, RoleAction::Add)
            .await
    }

    /// Soft-deleted accounts resolve only for administrators.
    pub async fn get(&self, identity: &Identity, id: Uuid) -> ServiceResult<User> {
        AuthorizationPolicy::ensure(Some(identity), Action::GetAnyUser, Some(id))?;
        let user = self
            .users
            .find_by_id(id, DeletedFilter::Include)
            .await?
            .ok_or(ServiceError::UserNotFound)?;
        if user.is_deleted() && !identity.is_admin() {
            return Err(ServiceError::UserNotFound);
        }
        Ok(user)
    }

    pub async fn list(&self, identity: &Identity, sort: UserSort) -> ServiceResult<Vec<User>> {
        AuthorizationPolicy::ensure(Some(identity), Action::ListUsers, None)?;
        let mut users = self.users.list_all(DeletedFilter::Exclude).await?;
        users.sort_by(|left, right| sort.compare(left, right));
        Ok(users)
    }

    pub async fn update(
        &self,
        identity: &Identity,
        id: Uuid,
        changes: ProfileChanges,
    ) -> ServiceResult<User> {
        AuthorizationPolicy::ensure_update(identity, id)?;
        if changes.enabled.is_some() {
            AuthorizationPolicy::ensure(Some(identity), Action::UpdateAnyUser, Some(id))?;
        }

        let mut user = self
            .users
            .find_by_id(id, DeletedFilter::Exclude)
            .await?
            .ok_or(ServiceError::UserNotFound)?;

        let mut errors = Vec::new();
        if let Some(email) = changes.email {
            let email = normalize_email(&email);
            if email.is_empty() {
                errors.push(FieldError::new("email", "must not be blank"));
            } else {
                check_email(&email, &mut errors);
            }
            user.email = email;
        }
        if let Some(username) = changes.username {
            let username = username.trim().to_string();
            if username.is_empty() {
                user.username = None;
            } else {
                check_username(&username, &mut errors);
                user.username = Some(username);
            }
        }
        if let Some(first_name) = changes.first_name {
            user.first_name = trimmed(Some(first_name));
        }
        if let Some(last_name) = changes.last_name {
            user.last_name = trimmed(Some(last_name));
        }
        check_name("firstName", user.first_name.as_deref(), &mut errors);
        check_name("lastName", user.last_name.as_deref(), &mut errors);
        if !errors.is_empty() {
            return Err(ServiceError::Validation(errors));
        }
        if let Some(enabled) = changes.enabled {
            user.enabled = enabled;
        }
        if let Some(attributes) = changes.attributes {
            user.attributes = attributes;
        }
        user.updated_at = Utc::now();

        let saved = match self.users.save(&user).await {
            Ok(saved) => saved,
            Err(StoreError::LastAdmin) => {
                warn!(
                    user_id = %id,
                    actor = %identity.user_id,
                    "Refused to disable last administrator"
                );
                return Err(ServiceError::last_admin());
            }
            Err(err) => return Err(err.into()),
        };
        info!(user_id = %saved.id, actor = %identity.user_id, "User updated");
        Ok(saved)
    }

    /// Owner only. Outstanding refresh tokens are revoked once the new hash is stored.
    pub async fn change_password(
        &self,
        identity: &Identity,
        id: Uuid,
        change: PasswordChange,
    ) -> ServiceResult<()> {
        AuthorizationPolicy::ensure(Some(identity), Action::ChangeOwnPassword, Some(id))?;

        let old_password = change.old_password.unwrap_or_default();
        if old_password.is_empty() {
            return Err(ServiceError::field("oldPassword", "is required"));
        }

        let user = self
            .users
            .find_by_id(id, DeletedFilter::Exclude)
            .await?
            .ok_or(ServiceError::UserNotFound)?;
        if !verify_password(&self.passwords, &old_password, &user.password_hash).await? {
            warn!(user_id = %user.id, "Password change rejected: current password mismatch");
            return Err(ServiceError::IncorrectPassword);
        }

        let mut errors = self.password_errors("newPassword", change.new_password.as_deref());
        if let Some(confirm) = change.confirm_password.as_deref() {
            if Some(confirm) != change.new_password.as_deref() {
                errors.push(FieldError::new("confirmPassword", "must match newPassword"));
            }
        }
        if !errors.is_empty() {
            return Err(ServiceError::Validation(errors));
        }
        let Some(new_password) = change.new_password else {
            return Err(ServiceError::field("newPassword", "is required"));
        };

        let hash = hash_password(&self.passwords, &new_password).await?;
        self.users
            .set_password_hash(user.id, &hash, Utc::now())
            .await?;
        let revoked = self.tokens.revoke_all_for(user.id).await?;
        info!(user_id = %user.id, revoked, "Password changed");
        Ok(())
    }

    /// Admin only, idempotent, refuses to remove the last active administrator.
    pub async fn soft_delete(&self, identity: &Identity, id: Uuid) -> ServiceResult<()> {
        AuthorizationPolicy::ensure(Some(identity), Action::DeleteUser, Some(id))?;

        match self.users.soft_delete(id, Utc::now()).await {
            Ok(SoftDeleteOutcome::Deleted) => {
                let revoked = self.tokens.revoke_all_for(id).await?;
                info!(user_id = %id, actor = %identity.user_id, revoked, "User soft-deleted");
                Ok(())
            }
            Ok(SoftDeleteOutcome::AlreadyDeleted) => Ok(()),
            Err(StoreError::LastAdmin) => {
                warn!(
                    user_id = %id,
                    actor = %identity.user_id,
                    "Refused to delete last administrator"
                );
                Err(ServiceError::last_admin())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn add_role(
        &self,
        identity: &Identity,
        id: Uuid,
        role: &str,
    ) -> ServiceResult<User> {
        AuthorizationPolicy::ensure(Some(identity), Action::AddRole, Some(id))?;
        self.mutate_role(identity, id, role, RoleAction::Add).await
    }

    pub async fn remove_role(
        &self,
        identity: &Identity,
        id: Uuid,
        role: &str,
    ) -> ServiceResult<User> {
        AuthorizationPolicy::ensure(Some(identity), Action::RemoveRole, Some(id))?;
        self.mutate_role(identity, id, role, RoleAction::Remove).await
    }

    pub async fn role_history(
        &self,
        identity: &Identity,
        id: Uuid,
    ) -> ServiceResult<Vec<RoleChangeEntry>> {
        AuthorizationPolicy::ensure(Some(identity), Action::UpdateAnyUser, Some(id))?;
        Ok(self.role_log.entries_for(id).await?)
    }

    /// The store writes the audit entry together with the role set, and only when the set
    /// actually changes.
    async fn mutate_role(
        &self,
        identity: &Identity,
        id: Uuid,
        raw_role: &str,
        action: RoleAction,
    ) -> ServiceResult<User> {
        let role = normalize_role(raw_role).ok_or_else(|| {
            ServiceError::Validation(vec![FieldError::new(
                "role",
                "must be 1-50 characters of A-Z, 0-9 or '_'",
            )
            .with_rejected(raw_role)])
        })?;

        let change = RoleChangeEntry {
            id: Uuid::new_v4(),
            target_user_id: id,
            acting_user_id: identity.user_id,
            role,
            action,
            timestamp: Utc::now(),
        };
        let role = &change.role;
        let mutation = match self.users.change_role(&change).await {
            Ok(mutation) => mutation,
            Err(StoreError::LastAdmin) => {
                warn!(
                    user_id = %id,
                    actor = %identity.user_id,
                    role = %role,
                    "Refused to remove role from last administrator"
                );
                return Err(ServiceError::last_admin());
            }
            Err(err) => return Err(err.into()),
        };

        if mutation.changed {
            self.metrics.role_change(action.as_str());
            info!(
                user_id = %id,
                actor = %identity.user_id,
                role = %role,
                action = action.as_str(),
                "Role changed"
            );
        }
        Ok(mutation.user)
    }
}

use std::sync::Arc;

use common_http_errors::FieldError;
use tracing::{info, warn};

use crate::authorization::Identity;
use crate::error::{ServiceError, ServiceResult};
use crate::metrics::AuthMetrics;
use crate::model::{normalize_email, User};
use crate::passwords::{verify_absent_password, verify_password, PasswordChecker};
use crate::store::{DeletedFilter, UserStore};
use crate::tokens::{AccessToken, RefreshToken, TokenService};

/// A freshly issued token pair and the account it belongs to.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: User,
    pub access: AccessToken,
    pub refresh: RefreshToken,
}

/// Login, refresh rotation, current-user resolution and refresh revocation.
pub struct AuthService {
    users: Arc<dyn UserStore>,
    tokens: Arc<TokenService>,
    passwords: Arc<dyn PasswordChecker>,
    metrics: Arc<AuthMetrics>,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserStore>,
        tokens: Arc<TokenService>,
        passwords: Arc<dyn PasswordChecker>,
        metrics: Arc<AuthMetrics>,
    ) -> Self {
        Self {
            users,
            tokens,
            passwords,
            metrics,
        }
    }

    /// Absent, soft-deleted and wrong-password attempts are indistinguishable
    /// (`InvalidCredentials`); a correct password on a disabled account is `AccountDisabled`.
    pub async fn login(
        &self,
        email: Option<&str>,
        password: Option<&str>,
    ) -> ServiceResult<Session> {
        let email = email.map(str::trim).unwrap_or_default();
        let password = password.unwrap_or_default();

        let mut missing = Vec::new();
        if email.is_empty() {
            missing.push(FieldError::new("email", "is required"));
        }
        if password.is_empty() {
            missing.push(FieldError::new("password", "is required"));
        }
        if !missing.is_empty() {
            self.metrics.login_attempt("invalid_request");
            return Err(ServiceError::Validation(missing));
        }

        let email = normalize_email(email);
        let Some(user) = self
            .users
            .find_by_email(&email, DeletedFilter::Exclude)
            .await?
        else {
            verify_absent_password(&self.passwords, password).await?;
            self.metrics.login_attempt("invalid_credentials");
            warn!(reason = "unknown_account", "Login rejected");
            return Err(ServiceError::InvalidCredentials);
        };

        if !verify_password(&self.passwords, password, &user.password_hash).await? {
            self.metrics.login_attempt("invalid_credentials");
            warn!(user_id = %user.id, reason = "password_mismatch", "Login rejected");
            return Err(ServiceError::InvalidCredentials);
        }

        if !user.enabled {
            self.metrics.login_attempt("disabled");
            warn!(user_id = %user.id, reason = "account_disabled", "Login rejected");
            return Err(ServiceError::AccountDisabled);
        }

        let session = self.issue_session(user).await?;
        self.metrics.login_attempt("success");
        info!(user_id = %session.user.id, "Login succeeded");
        Ok(session)
    }

    /// Spends the presented refresh token and issues a new pair carrying the account's
    /// current roles.
    pub async fn refresh(&self, refresh_token: Option<&str>) -> ServiceResult<Session> {
        let result = self.rotate(refresh_token).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(ServiceError::AccountDisabled) => "disabled",
            Err(ServiceError::Unexpected(_)) => "error",
            Err(_) => "invalid",
        };
        self.metrics.token_refresh(outcome);
        result
    }

    async fn rotate(&self, refresh_token: Option<&str>) -> ServiceResult<Session> {
        let token = refresh_token.ok_or(ServiceError::InvalidToken)?;
        let record = self.tokens.consume_refresh_token(token).await?;

        let user = self
            .users
            .find_by_id(record.user_id, DeletedFilter::Include)
            .await?
            .ok_or(ServiceError::InvalidToken)?;
        if user.is_deleted() {
            warn!(user_id = %user.id, "Refresh presented for deleted account");
            return Err(ServiceError::InvalidToken);
        }
        if !user.enabled {
            warn!(user_id = %user.id, "Refresh presented for disabled account");
            return Err(ServiceError::AccountDisabled);
        }

        self.issue_session(user).await
    }

    pub async fn current_user(&self, identity: &Identity) -> ServiceResult<User> {
        self.users
            .find_by_id(identity.user_id, DeletedFilter::Exclude)
            .await?
            .ok_or(ServiceError::UserNotFound)
    }

    /// Drops the presented refresh token when there is one, otherwise every outstanding
    /// refresh token of the caller. Access tokens already issued stay valid until they expire.
    pub async fn revoke_refresh_tokens(
        &self,
        identity: &Identity,
        presented: Option<&str>,
    ) -> ServiceResult<u64> {
        let revoked = match presented {
            Some(token) => u64::from(
                self.tokens
                    .revoke_refresh_token(identity.user_id, token)
                    .await?,
            ),
            None => self.tokens.revoke_all_for(identity.user_id).await?,
        };
        info!(
            user_id = %identity.user_id,
            revoked,
            single = presented.is_some(),
            "Refresh tokens revoked"
        );
        Ok(revoked)
    }

    async fn issue_session(&self, user: User) -> ServiceResult<Session> {
        let access = self
            .tokens
            .issue_access_token(user.id, &user.email, &user.role_list())?;
        let refresh = self.tokens.issue_refresh_token(user.id).await?;
        Ok(Session {
            user,
            access,
            refresh,
        })
    }
}

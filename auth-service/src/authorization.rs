//! Explicit access decisions, evaluated per operation.

use common_auth::{AuthContext, Claims, ROLE_ADMIN};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};

/// Who is acting, as asserted by a verified access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub roles: Vec<String>,
}

impl Identity {
    pub fn new(user_id: Uuid, roles: Vec<String>) -> Self {
        Self { user_id, roles }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|value| value == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ROLE_ADMIN)
    }
}

impl From<&Claims> for Identity {
    fn from(claims: &Claims) -> Self {
        Self::new(claims.subject, claims.roles.clone())
    }
}

impl From<&AuthContext> for Identity {
    fn from(context: &AuthContext) -> Self {
        Self::from(&context.claims)
    }
}

impl From<AuthContext> for Identity {
    fn from(context: AuthContext) -> Self {
        let claims = context.into_claims();
        Self::new(claims.subject, claims.roles)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Register,
    Login,
    ViewSelf,
    UpdateSelf,
    ChangeOwnPassword,
    ListUsers,
    GetAnyUser,
    UpdateAnyUser,
    DeleteUser,
    AddRole,
    RemoveRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AuthorizationPolicy;

impl AuthorizationPolicy {
    /// Rules apply in order: anonymous callers may only register or log in; self actions
    /// need `target == caller`; listing and reading need any authenticated caller;
    /// mutations of other accounts need `ADMIN`.
    pub fn can_access(
        identity: Option<&Identity>,
        action: Action,
        target: Option<Uuid>,
    ) -> Decision {
        let Some(identity) = identity else {
            return match action {
                Action::Register | Action::Login => Decision::Allow,
                _ => Decision::Deny,
            };
        };

        let allowed = match action {
            Action::ViewSelf | Action::UpdateSelf | Action::ChangeOwnPassword => {
                target == Some(identity.user_id)
            }
            Action::ListUsers | Action::GetAnyUser => true,
            Action::UpdateAnyUser | Action::DeleteUser | Action::AddRole | Action::RemoveRole => {
                identity.is_admin()
            }
            Action::Register | Action::Login => false,
        };

        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    /// `Unauthenticated` without an identity, `AuthorizationDenied` for a refused identity.
    pub fn ensure(
        identity: Option<&Identity>,
        action: Action,
        target: Option<Uuid>,
    ) -> ServiceResult<()> {
        match Self::can_access(identity, action, target) {
            Decision::Allow => Ok(()),
            Decision::Deny if identity.is_none() => Err(ServiceError::Unauthenticated),
            Decision::Deny => Err(ServiceError::AuthorizationDenied),
        }
    }

    /// Profile updates: the owner through `UpdateSelf`, anyone else through `UpdateAnyUser`.
    pub fn ensure_update(identity: &Identity, target: Uuid) -> ServiceResult<()> {
        let own = Self::can_access(Some(identity), Action::UpdateSelf, Some(target));
        let any = Self::can_access(Some(identity), Action::UpdateAnyUser, Some(target));
        if own.is_allowed() || any.is_allowed() {
            Ok(())
        } else {
            Err(ServiceError::AuthorizationDenied)
        }
    }
}

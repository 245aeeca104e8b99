//! Authentication and Authorization
//!
//! An `Authenticator` turns the credentials of a request into an
//! `AuthState`. The state is fixed for the lifetime of the request and
//! carries the `TaskAuthorizer` consulted before every task.

use crate::context::SyncContext;
use crate::protocol::{SyncRequest, SyncTask};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// User role for access control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Admin,     // Full access
    ReadWrite, // Can read and write data
    ReadOnly,  // Can only read data
}

impl Role {
    pub fn can_write(&self) -> bool {
        matches!(self, Role::Admin | Role::ReadWrite)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// Hub wide permissions of an authenticated user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HubPermission {
    pub subscribe: bool,
}

/// Decides whether a single task may run
pub trait TaskAuthorizer: Send + Sync {
    /// `Err(reason)` denies the task
    fn authorize_task(&self, task: &SyncTask, ctx: &SyncContext) -> Result<(), String>;
}

/// Result of authenticating a request
#[derive(Clone)]
pub struct AuthState {
    user_id: Option<String>,
    authenticated: bool,
    authorizer: Arc<dyn TaskAuthorizer>,
    permission: HubPermission,
}

impl AuthState {
    pub fn new(
        user_id: Option<String>,
        authenticated: bool,
        authorizer: Arc<dyn TaskAuthorizer>,
        permission: HubPermission,
    ) -> Self {
        AuthState {
            user_id,
            authenticated,
            authorizer,
            permission,
        }
    }

    /// Anonymous caller allowed to run every task
    pub fn anonymous() -> Self {
        AuthState::new(None, false, Arc::new(AuthorizeAll), HubPermission { subscribe: true })
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn authorizer(&self) -> &dyn TaskAuthorizer {
        self.authorizer.as_ref()
    }

    pub fn permission(&self) -> HubPermission {
        self.permission
    }
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("user_id", &self.user_id)
            .field("authenticated", &self.authenticated)
            .field("permission", &self.permission)
            .finish()
    }
}

/// Produces the `AuthState` of a request
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: &SyncRequest) -> AuthState;
}

// ==================== Authorizers ====================

pub struct AuthorizeAll;

impl TaskAuthorizer for AuthorizeAll {
    fn authorize_task(&self, _task: &SyncTask, _ctx: &SyncContext) -> Result<(), String> {
        Ok(())
    }
}

/// Denies every task with a fixed reason
pub struct AuthorizeDeny {
    reason: String,
}

impl AuthorizeDeny {
    pub fn new(reason: impl Into<String>) -> Self {
        AuthorizeDeny { reason: reason.into() }
    }
}

impl TaskAuthorizer for AuthorizeDeny {
    fn authorize_task(&self, _task: &SyncTask, _ctx: &SyncContext) -> Result<(), String> {
        Err(self.reason.clone())
    }
}

/// Role based task authorization
pub struct RoleAuthorizer {
    role: Role,
}

impl RoleAuthorizer {
    pub fn new(role: Role) -> Self {
        RoleAuthorizer { role }
    }
}

impl TaskAuthorizer for RoleAuthorizer {
    fn authorize_task(&self, task: &SyncTask, _ctx: &SyncContext) -> Result<(), String> {
        if self.role.can_write() {
            return Ok(());
        }
        if task.is_mutation() || matches!(task, SyncTask::Command(_)) {
            return Err(format!("role {:?} not permitted to run {}", self.role, task.name()));
        }
        Ok(())
    }
}

// ==================== Authenticators ====================

/// Accepts every request as anonymous with full access
#[derive(Debug, Default)]
pub struct AuthenticateNone;

impl Authenticator for AuthenticateNone {
    fn authenticate(&self, request: &SyncRequest) -> AuthState {
        AuthState::new(
            request.user_id.clone(),
            false,
            Arc::new(AuthorizeAll),
            HubPermission { subscribe: true },
        )
    }
}

struct UserCredential {
    token_hash: String,
    role: Role,
}

/// Authenticates users by id and token. Tokens are stored as SHA-256 hashes.
pub struct UserAuthenticator {
    users: RwLock<HashMap<String, UserCredential>>,
    anonymous_role: Option<Role>,
}

impl UserAuthenticator {
    pub fn new() -> Self {
        UserAuthenticator {
            users: RwLock::new(HashMap::new()),
            anonymous_role: None,
        }
    }

    /// Role granted to requests without credentials. Without it they are denied.
    pub fn with_anonymous_role(mut self, role: Role) -> Self {
        self.anonymous_role = Some(role);
        self
    }

    pub fn add_user(&self, user_id: &str, token: &str, role: Role) -> Result<(), String> {
        let mut users = self.users.write();
        if users.contains_key(user_id) {
            return Err(format!("User {} already exists", user_id));
        }
        users.insert(
            user_id.to_string(),
            UserCredential {
                token_hash: hash_token(token),
                role,
            },
        );
        Ok(())
    }

    pub fn remove_user(&self, user_id: &str) -> bool {
        self.users.write().remove(user_id).is_some()
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    fn denied(user_id: Option<String>, reason: &str) -> AuthState {
        AuthState::new(user_id, false, Arc::new(AuthorizeDeny::new(reason)), HubPermission::default())
    }
}

impl Default for UserAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for UserAuthenticator {
    fn authenticate(&self, request: &SyncRequest) -> AuthState {
        let user_id = match &request.user_id {
            Some(user_id) => user_id,
            None => {
                return match self.anonymous_role {
                    Some(role) => AuthState::new(
                        None,
                        false,
                        Arc::new(RoleAuthorizer::new(role)),
                        HubPermission { subscribe: false },
                    ),
                    None => Self::denied(None, "not authenticated"),
                };
            }
        };

        let users = self.users.read();
        let credential = match users.get(user_id) {
            Some(credential) => credential,
            None => return Self::denied(Some(user_id.clone()), "user not found"),
        };
        let token = request.token.as_deref().unwrap_or_default();
        if credential.token_hash != hash_token(token) {
            tracing::debug!(user = %user_id, "invalid token");
            return Self::denied(Some(user_id.clone()), "invalid credentials");
        }
        AuthState::new(
            Some(user_id.clone()),
            true,
            Arc::new(RoleAuthorizer::new(credential.role)),
            HubPermission { subscribe: true },
        )
    }
}

/// Hash a token using SHA-256
fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

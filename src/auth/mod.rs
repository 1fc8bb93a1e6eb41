/*!
 * # Authentication and Authorization
 *
 * Bearer JWT (HS256) validation for tokens minted by an external
 * authorization server, plus route-level permission gating.
 *
 * `auth_middleware` validates the token and stores an [`AuthUser`] in the
 * request extensions; `permission_middleware` then checks a single
 * permission. Routers opt in through [`AuthRouterExt`].
 */

pub mod permissions;

use crate::errors::ServiceError;
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub use permissions::consts;

/// Claim structure for JWT tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// OAuth2 scopes, space separated.
    #[serde(default, deserialize_with = "scope_string")]
    pub scope: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub iss: Option<String>,
}

/// Some issuers send `scope` as an array instead of a string.
fn scope_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scope {
        Text(String),
        List(Vec<String>),
    }

    Ok(match Option::<Scope>::deserialize(deserializer)? {
        Some(Scope::Text(s)) => Some(s),
        Some(Scope::List(items)) => Some(items.join(" ")),
        None => None,
    })
}

/// Authenticated caller extracted from the JWT token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
    pub name: Option<String>,
    pub roles: Vec<String>,
    /// Normalized to `resource:action`.
    pub permissions: Vec<String>,
    /// Raw bearer token, forwarded on sibling calls.
    #[serde(skip)]
    pub token: String,
}

impl AuthUser {
    fn from_claims(claims: Claims, token: &str) -> Self {
        let mut granted: Vec<String> = claims
            .permissions
            .iter()
            .map(|p| permissions::normalize(p))
            .collect();
        if let Some(scope) = &claims.scope {
            granted.extend(scope.split_whitespace().map(permissions::normalize));
        }
        granted.sort();
        granted.dedup();

        Self {
            user_id: claims.sub,
            name: claims.name,
            roles: claims.roles,
            permissions: granted,
            token: token.to_string(),
        }
    }

    /// Check if the user has a specific role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Check if the user has a specific permission
    pub fn has_permission(&self, permission: &str) -> bool {
        let wanted = permissions::normalize(permission);
        self.permissions.iter().any(|p| *p == wanted)
    }

    /// Check if the user is an admin
    pub fn is_admin(&self) -> bool {
        self.has_role(consts::ADMIN_ROLE)
    }

    /// Admins pass every permission check.
    pub fn is_allowed(&self, permission: &str) -> bool {
        self.is_admin() || self.has_permission(permission)
    }

    pub fn require(&self, permission: &str) -> Result<(), AuthError> {
        if self.is_allowed(permission) {
            Ok(())
        } else {
            Err(AuthError::InsufficientPermissions(permission.to_string()))
        }
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

/// Authentication configuration
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// Empty disables the `iss` check.
    pub jwt_issuer: String,
    /// Empty disables the `aud` check.
    pub jwt_audience: String,
}

impl AuthConfig {
    pub fn new(jwt_secret: String, jwt_issuer: String, jwt_audience: String) -> Self {
        Self {
            jwt_secret,
            jwt_issuer,
            jwt_audience,
        }
    }
}

/// Validates bearer tokens.
#[derive(Clone)]
pub struct AuthService {
    config: AuthConfig,
    decoding_key: DecodingKey,
}

impl AuthService {
    pub fn new(config: AuthConfig) -> Self {
        let decoding_key = DecodingKey::from_secret(config.jwt_secret.as_bytes());
        Self {
            config,
            decoding_key,
        }
    }

    /// Validate a JWT token and extract the claims
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        if !self.config.jwt_issuer.is_empty() {
            validation.set_issuer(&[self.config.jwt_issuer.as_str()]);
        }
        if !self.config.jwt_audience.is_empty() {
            validation.set_audience(&[self.config.jwt_audience.as_str()]);
        }

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => {
                    debug!("rejected token: {}", e);
                    AuthError::InvalidToken
                }
            })
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthUser, AuthError> {
        let token = bearer_token(headers)?;
        let claims = self.validate_token(token)?;
        Ok(AuthUser::from_claims(claims, token))
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::InvalidToken)?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or(AuthError::InvalidToken)?
        .trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}

/// Authentication error types
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,

    #[error("Missing token")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Missing permission {0}")]
    InsufficientPermissions(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<AuthError> for ServiceError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InsufficientPermissions(_) => ServiceError::AccessDenied(err.to_string()),
            AuthError::InternalError(msg) => ServiceError::InternalError(msg),
            other => ServiceError::AuthenticationFailed(other.to_string()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ServiceError::from(self).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or_else(|| AuthError::MissingAuth.into())
    }
}

/// Permission middleware to check if a user has the required permission
pub async fn permission_middleware(
    State(required_permission): State<String>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let user = request
        .extensions()
        .get::<AuthUser>()
        .ok_or(AuthError::MissingAuth)?;

    user.require(&required_permission)?;
    Ok(next.run(request).await)
}

/// Authentication middleware that extracts and validates auth tokens
pub async fn auth_middleware(mut request: Request, next: Next) -> Response {
    let auth_service = match request.extensions().get::<Arc<AuthService>>() {
        Some(service) => service.clone(),
        None => {
            return AuthError::InternalError("Authentication service not available".to_string())
                .into_response();
        }
    };

    match auth_service.authenticate(request.headers()) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

/// Makes the [`AuthService`] available to [`auth_middleware`].
pub async fn inject_auth_service(
    State(auth): State<Arc<AuthService>>,
    mut request: Request,
    next: Next,
) -> Response {
    request.extensions_mut().insert(auth);
    next.run(request).await
}

/// Extension methods for Router to add auth middleware
pub trait AuthRouterExt {
    fn with_auth(self) -> Self;
    fn with_permission(self, permission: &str) -> Self;
}

impl<S> AuthRouterExt for axum::Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn with_auth(self) -> Self {
        self.route_layer(axum::middleware::from_fn(auth_middleware))
    }

    fn with_permission(self, permission: &str) -> Self {
        self.route_layer(axum::middleware::from_fn_with_state(
            permission.to_string(),
            permission_middleware,
        ))
        .with_auth()
    }
}

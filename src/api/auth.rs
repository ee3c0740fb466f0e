//! Bearer-token authentication for the control plane: short-lived HS256
//! access tokens plus rotating refresh tokens with a process-local
//! revocation set.

use axum::{
    Json,
    extract::{ConnectInfo, FromRequestParts, State},
    http::request::Parts,
};
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::RwLock;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{ApiState, error::{ApiError, ValidatedJson}};
use crate::config::JwtConfig;
use crate::models::{AuditEntry, GroupId, MemberRole, Membership, User, UserId, UserStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub email: String,
    pub kind: TokenKind,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    config: JwtConfig,
}

impl JwtKeys {
    pub fn new(config: JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.signing_key.as_bytes()),
            decoding: DecodingKey::from_secret(config.signing_key.as_bytes()),
            config,
        }
    }

    fn issue(&self, user: &User, kind: TokenKind) -> Result<(String, Claims), ApiError> {
        let ttl = match kind {
            TokenKind::Access => self.config.access_ttl,
            TokenKind::Refresh => self.config.refresh_ttl,
        };
        let now = Utc::now();
        let claims = Claims {
            sub: *user.id,
            email: user.email.clone(),
            kind,
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::from_std(ttl).unwrap_or_default()).timestamp(),
        };
        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)
            .map_err(|_| ApiError::Internal)?;
        Ok((token, claims))
    }

    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, ApiError> {
        let data =
            jsonwebtoken::decode::<Claims>(token, &self.decoding, &Validation::default())
                .map_err(|e| {
                    trace!("token rejected: {e}");
                    ApiError::Unauthorized
                })?;
        if data.claims.kind != kind {
            return Err(ApiError::Unauthorized);
        }
        Ok(data.claims)
    }

    pub fn access_ttl_secs(&self) -> u64 {
        self.config.access_ttl.as_secs()
    }
}

/// Refresh tokens revoked by logout or rotation. Process-local by design;
/// access tokens simply expire.
#[derive(Default)]
pub struct RevokedTokens {
    jtis: RwLock<HashSet<String>>,
}

impl RevokedTokens {
    pub fn revoke(&self, jti: &str) {
        self.jtis.write().expect("revocation set poisoned").insert(jti.to_string());
    }

    pub fn is_revoked(&self, jti: &str) -> bool {
        self.jtis.read().expect("revocation set poisoned").contains(jti)
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
}

fn token_pair(state: &ApiState, user: &User) -> Result<TokenPair, ApiError> {
    let (access_token, _) = state.jwt.issue(user, TokenKind::Access)?;
    let (refresh_token, _) = state.jwt.issue(user, TokenKind::Refresh)?;
    Ok(TokenPair {
        access_token,
        refresh_token,
        token_type: "Bearer",
        expires_in: state.jwt.access_ttl_secs(),
    })
}

pub async fn login(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ValidatedJson(request): ValidatedJson<LoginRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    if state.login_limiter.is_blocked(peer.ip()) {
        warn!(ip = %peer.ip(), "login throttled");
        return Err(ApiError::RateLimited {
            retry_after_secs: 60,
        });
    }
    if request.email.is_empty() || request.password.is_empty() {
        return Err(ApiError::Validation("email and password are required".into()));
    }

    let user = state.store.user_by_email(&request.email).await?;
    let authenticated = user
        .filter(|u| u.status == UserStatus::Active)
        .filter(|u| u.verify_password(&request.password));

    let Some(user) = authenticated else {
        state.login_limiter.record_failure(peer.ip());
        state
            .store
            .append_audit(
                AuditEntry::new(None, &request.email, "auth.login_failed", "user", "")
                    .with_ip(Some(peer.ip())),
            )
            .await
            .ok();
        return Err(ApiError::Unauthorized);
    };

    state
        .store
        .append_audit(
            AuditEntry::new(None, &user.email, "auth.login", "user", user.id.to_string())
                .with_ip(Some(peer.ip())),
        )
        .await
        .ok();

    Ok(Json(token_pair(&state, &user)?))
}

pub async fn refresh(
    State(state): State<ApiState>,
    ValidatedJson(request): ValidatedJson<RefreshRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    let claims = state.jwt.verify(&request.refresh_token, TokenKind::Refresh)?;
    if state.revoked.is_revoked(&claims.jti) {
        debug!("refresh with a revoked token");
        return Err(ApiError::Unauthorized);
    }

    let user = state
        .store
        .user(UserId(claims.sub))
        .await?
        .filter(|u| u.status == UserStatus::Active)
        .ok_or(ApiError::Unauthorized)?;

    // rotation: the presented token is spent either way
    state.revoked.revoke(&claims.jti);
    Ok(Json(token_pair(&state, &user)?))
}

pub async fn logout(
    State(state): State<ApiState>,
    ValidatedJson(request): ValidatedJson<RefreshRequest>,
) -> Result<axum::http::StatusCode, ApiError> {
    if request.refresh_token.is_empty() {
        return Err(ApiError::Validation("refresh_token is required".into()));
    }
    // revoking an unknown or expired token is a no-op, not an error
    if let Ok(claims) = state.jwt.verify(&request.refresh_token, TokenKind::Refresh) {
        state.revoked.revoke(&claims.jti);
    }
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Authenticated caller: the account plus its memberships.
pub struct AuthUser {
    pub user: User,
    pub memberships: Vec<Membership>,
}

impl AuthUser {
    pub fn membership(&self, group: GroupId) -> Option<&Membership> {
        self.memberships.iter().find(|m| m.group_id == group)
    }

    pub fn is_member_of(&self, group: GroupId) -> bool {
        self.membership(group).is_some()
    }

    pub fn is_system_admin(&self, state: &ApiState) -> bool {
        state.system_group.is_some_and(|system| {
            self.membership(system)
                .is_some_and(|m| matches!(m.role, MemberRole::Owner | MemberRole::Admin))
        })
    }

    /// Admin rights over a tenant: owner/admin membership, or system-group
    /// administration.
    pub fn can_admin(&self, state: &ApiState, group: GroupId) -> bool {
        self.membership(group)
            .is_some_and(|m| matches!(m.role, MemberRole::Owner | MemberRole::Admin))
            || self.is_system_admin(state)
    }

    pub fn can_read(&self, state: &ApiState, group: GroupId) -> bool {
        self.is_member_of(group) || self.is_system_admin(state)
    }

    /// The tenant implied by non-group-scoped routes: the caller's first
    /// membership.
    pub fn group_context(&self) -> Result<GroupId, ApiError> {
        self.memberships
            .first()
            .map(|m| m.group_id)
            .ok_or(ApiError::Forbidden)
    }
}

impl FromRequestParts<ApiState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        let claims = state.jwt.verify(token, TokenKind::Access)?;
        let user = state
            .store
            .user(UserId(claims.sub))
            .await?
            .filter(|u| u.status == UserStatus::Active)
            .ok_or(ApiError::Unauthorized)?;
        let memberships = state.store.memberships_for_user(user.id).await?;

        Ok(AuthUser { user, memberships })
    }
}

//! Interface to the Steam Client-Messaging layer.
//!
//! The broker never speaks the CM wire protocol itself; it drives a
//! connected session through the [`CmSession`] trait and obtains sessions
//! from a [`CmConnector`]. The deployment links in a concrete transport;
//! the test suite substitutes a scripted one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Steam result codes surfaced by CM responses. Only the codes the broker
/// reacts to are enumerated; everything else arrives as [`EResult::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EResult {
    Fail,
    AccessDenied,
    ServiceUnavailable,
    InvalidSignature,
    AccessTokenDenied,
    MissingToken,
    Blocked,
    Other(i32),
}

impl EResult {
    pub fn code(self) -> i32 {
        match self {
            EResult::Fail => 2,
            EResult::AccessDenied => 15,
            EResult::ServiceUnavailable => 20,
            EResult::InvalidSignature => 43,
            EResult::AccessTokenDenied => 86,
            EResult::MissingToken => 87,
            EResult::Blocked => 88,
            EResult::Other(code) => code,
        }
    }
}

/// Failure of a CM request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CmError {
    /// The request did not complete within its deadline.
    #[error("CM request timed out")]
    Timeout,
    /// The CM server answered with a non-success result code.
    #[error("CM request failed with EResult {}", .0.code())]
    Steam(EResult),
    /// The connection or the transport beneath it failed.
    #[error("CM transport failure: {0}")]
    Transport(String),
}

impl CmError {
    /// Errors after which a disconnect-and-reconnect is the right response.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CmError::Timeout | CmError::Steam(EResult::ServiceUnavailable)
        )
    }

    /// Sign-in failures that mean the token has been invalidated server-side.
    pub fn invalidates_token(&self) -> bool {
        matches!(
            self,
            CmError::Steam(EResult::AccessDenied) | CmError::Steam(EResult::InvalidSignature)
        )
    }

    /// The `(type, primary, auxiliary)` triple used on every client-facing
    /// error surface.
    pub fn wire(&self) -> WireError {
        match self {
            CmError::Timeout => WireError {
                kind: 1,
                primary: ERRC_CM_TIMEOUT,
                auxiliary: None,
            },
            CmError::Steam(res) => WireError {
                kind: 2,
                primary: ERRC_CM_FAIL,
                auxiliary: Some(res.code()),
            },
            CmError::Transport(_) => WireError {
                kind: 0,
                primary: ERRC_CM_FAIL,
                auxiliary: None,
            },
        }
    }
}

pub const ERRC_CM_FAIL: i32 = 1;
pub const ERRC_CM_TIMEOUT: i32 = 2;

/// Error triple serialized into sign-in protocol messages.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WireError {
    #[serde(rename = "type")]
    pub kind: i32,
    pub primary: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auxiliary: Option<i32>,
}

/// Wrap a CM request future with its per-call deadline.
pub async fn with_timeout<T>(
    ms: u64,
    fut: impl std::future::Future<Output = Result<T, CmError>>,
) -> Result<T, CmError> {
    match tokio::time::timeout(std::time::Duration::from_millis(ms), fut).await {
        Ok(res) => res,
        Err(_) => Err(CmError::Timeout),
    }
}

/// Information parsed from a Steam authentication token (a JWT): the token
/// payload carries the account's Steam ID, the expiry timestamp, and the
/// audience list that distinguishes renewable refresh tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthTokenInfo {
    pub steam_id: u64,
    pub renewable: bool,
    pub expires: i64,
}

#[derive(Deserialize)]
struct TokenClaims {
    sub: String,
    exp: i64,
    #[serde(default)]
    aud: Vec<String>,
}

/// Parse an authentication token's payload. Returns `None` for anything
/// that is not a well-formed token.
pub fn parse_auth_token(token: &str) -> Option<AuthTokenInfo> {
    let payload = token.split('.').nth(1)?;
    let raw = base64::decode_config(payload, base64::URL_SAFE_NO_PAD).ok()?;
    let claims: TokenClaims = serde_json::from_slice(&raw).ok()?;
    let steam_id = claims.sub.parse().ok()?;
    if steam_id == 0 {
        return None;
    }
    Some(AuthTokenInfo {
        steam_id,
        renewable: claims.aud.iter().any(|a| a == "renew"),
        expires: claims.exp,
    })
}

/// A license owned by an account, as reported by the CM server.
#[derive(Debug, Clone, Copy)]
pub struct License {
    pub package_id: u32,
    pub access_token: u64,
}

/// A PICS package-info request entry.
#[derive(Debug, Clone, Copy)]
pub struct PackageRequest {
    pub package_id: u32,
    pub access_token: u64,
}

/// A PICS package-info response entry; `data` is a binary VDF buffer.
#[derive(Debug, Clone)]
pub struct PackageEntry {
    pub package_id: u32,
    pub result: Result<Vec<u8>, CmError>,
}

/// A PICS app access-token response entry.
#[derive(Debug, Clone)]
pub struct TokenEntry {
    pub app_id: u32,
    pub result: Result<u64, CmError>,
}

/// A PICS app-info request entry.
#[derive(Debug, Clone, Copy)]
pub struct AppRequest {
    pub app_id: u32,
    pub access_token: u64,
}

/// A PICS app-info response entry; `data` is a text VDF document.
#[derive(Debug, Clone)]
pub struct AppEntry {
    pub app_id: u32,
    pub access_token: u64,
    pub result: Result<String, CmError>,
}

/// Kinds of second-factor confirmation an authentication session may ask
/// the user for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationKind {
    Device,
    GuardCode,
    Email,
}

impl ConfirmationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfirmationKind::Device => "device",
            ConfirmationKind::GuardCode => "guard_code",
            ConfirmationKind::Email => "email",
        }
    }
}

/// How an interactive sign-in is performed.
#[derive(Debug, Clone)]
pub enum AuthRequest {
    Credentials {
        account_name: String,
        password: String,
    },
    Qr,
}

/// Progress events of an interactive authentication session.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// A fresh QR challenge URL.
    NewUrl(String),
    /// The account requires one of the listed confirmations.
    ConfirmationRequired(Vec<ConfirmationKind>),
    /// The session finished; on success carries the new auth token.
    Completed(Result<String, CmError>),
}

/// One connected CM session. Completions resolve in issue order for a
/// given session.
#[async_trait]
pub trait CmSession: Send + Sync {
    async fn sign_in(&self, token: &str) -> Result<(), CmError>;

    /// Ask the server to renew a renewable token. `Ok(None)` means the
    /// server declined to issue a new one at this time.
    async fn renew_token(&self, token: &str) -> Result<Option<String>, CmError>;

    async fn get_licenses(&self) -> Result<Vec<License>, CmError>;

    async fn get_package_info(
        &self,
        packages: &[PackageRequest],
    ) -> Result<Vec<PackageEntry>, CmError>;

    async fn get_access_tokens(&self, app_ids: &[u32]) -> Result<Vec<TokenEntry>, CmError>;

    async fn get_app_info(&self, apps: &[AppRequest]) -> Result<Vec<AppEntry>, CmError>;

    async fn get_depot_key(&self, app_id: u32, depot_id: u32) -> Result<[u8; 32], CmError>;

    async fn get_mrc(
        &self,
        app_id: u32,
        depot_id: u32,
        manifest_id: u64,
    ) -> Result<u64, CmError>;

    /// Start an interactive authentication session; progress arrives on the
    /// returned channel.
    async fn begin_auth(
        &self,
        device_name: &str,
        request: AuthRequest,
    ) -> Result<mpsc::UnboundedReceiver<AuthEvent>, CmError>;

    async fn submit_confirmation(&self, kind: ConfirmationKind, code: &str)
        -> Result<(), CmError>;

    async fn disconnect(&self);
}

/// Source of CM sessions.
#[async_trait]
pub trait CmConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn CmSession>, CmError>;
}

/// Connector used when no CM transport is linked into the build: every
/// connection attempt reports the CM servers as unavailable. The serving
/// front-end still runs (an empty catalog serves an empty manifest); the
/// embedding deployment provides a real [`CmConnector`] to `run`.
pub struct Unavailable;

#[async_trait]
impl CmConnector for Unavailable {
    async fn connect(&self) -> Result<Arc<dyn CmSession>, CmError> {
        Err(CmError::Steam(EResult::ServiceUnavailable))
    }
}

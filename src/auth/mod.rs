//! Credentials and the device/auth context seam.
//!
//! The client never persists authentication state itself. User credentials
//! are a shared handle whose discharges the refresh path updates in place;
//! device state is owned by the [`AuthContext`] collaborator and fetched on
//! demand.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod macaroon;
pub mod sso;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("cannot deserialize macaroon: {0}")]
    InvalidMacaroon(String),

    #[error("root macaroon has no third party caveat for {0}")]
    MissingLoginCaveat(String),

    #[error("two factor authentication required")]
    TwoFactorRequired,

    #[error("two factor authentication failed")]
    TwoFactorFailed,

    #[error("invalid credentials: {0}")]
    InvalidAuthData(String),

    #[error("cannot get nonce from store: store server returned status {0}")]
    NonceStatus(u16),

    #[error("cannot get device session from store: store server returned status {0}")]
    SessionStatus(u16),

    #[error("{0}")]
    Context(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Default)]
struct UserAuth {
    macaroon: String,
    discharges: Vec<String>,
}

/// A logged-in user's store macaroon and its discharges. Cloning yields a
/// handle to the same credentials, so a transparent refresh is visible to
/// every holder.
#[derive(Clone, Default)]
pub struct UserCredentials {
    inner: Arc<RwLock<UserAuth>>,
}

impl UserCredentials {
    pub fn new(macaroon: impl Into<String>, discharges: Vec<String>) -> Self {
        UserCredentials {
            inner: Arc::new(RwLock::new(UserAuth {
                macaroon: macaroon.into(),
                discharges,
            })),
        }
    }

    pub fn has_store_auth(&self) -> bool {
        !self.inner.read().expect("credentials lock").macaroon.is_empty()
    }

    pub fn macaroon(&self) -> String {
        self.inner.read().expect("credentials lock").macaroon.clone()
    }

    pub fn discharges(&self) -> Vec<String> {
        self.inner.read().expect("credentials lock").discharges.clone()
    }

    pub fn set_discharges(&self, discharges: Vec<String>) {
        self.inner.write().expect("credentials lock").discharges = discharges;
    }
}

/// Device identity and session as known to the auth context.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceState {
    pub brand: String,
    pub model: String,
    pub serial: String,
    pub session_macaroon: String,
}

/// Signed artifacts needed to open a device session against a store nonce.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSessionRequestParams {
    #[serde(rename = "device-session-request")]
    pub request: String,
    #[serde(rename = "serial-assertion")]
    pub serial_assertion: String,
    #[serde(rename = "model-assertion")]
    pub model_assertion: String,
}

/// Cloud placement advertised to the CDN.
#[derive(Debug, Clone, Default)]
pub struct CloudInfo {
    pub name: String,
    pub region: String,
    pub availability_zone: String,
}

/// The store id and proxied base URL of a proxy store.
#[derive(Debug, Clone)]
pub struct ProxyStore {
    pub store_id: String,
    pub url: Option<Url>,
}

/// Everything the client needs to know about the device and persisted
/// authentication, without owning any of it.
#[async_trait]
pub trait AuthContext: Send + Sync {
    async fn device(&self) -> Result<DeviceState, AuthError>;

    /// Persist a fresh session macaroon; returns the authoritative device
    /// state afterwards.
    async fn update_device_auth(
        &self,
        device: &DeviceState,
        session_macaroon: &str,
    ) -> Result<DeviceState, AuthError>;

    /// Persist refreshed user discharges; returns the authoritative
    /// discharge list afterwards.
    async fn update_user_auth(
        &self,
        user: &UserCredentials,
        discharges: &[String],
    ) -> Result<Vec<String>, AuthError>;

    /// The store id to use, given the configured fallback.
    async fn store_id(&self, fallback: &str) -> Result<String, AuthError>;

    async fn device_session_request_params(
        &self,
        nonce: &str,
    ) -> Result<DeviceSessionRequestParams, AuthError>;

    /// Proxy store indirection; `None` keeps the default URL.
    async fn proxy_store_params(&self, default_url: &Url) -> Result<Option<ProxyStore>, AuthError>;

    async fn cloud_info(&self) -> Result<Option<CloudInfo>, AuthError>;
}

#[derive(Deserialize)]
struct NonceResponse {
    nonce: String,
}

#[derive(Deserialize)]
struct SessionResponse {
    macaroon: String,
}

/// Ask the store for a device nonce.
pub(crate) async fn request_store_device_nonce(
    client: &reqwest::Client,
    url: Url,
) -> Result<String, AuthError> {
    let resp = client
        .post(url)
        .header("User-Agent", crate::USER_AGENT)
        .header("Accept", crate::client::JSON_CONTENT_TYPE)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(AuthError::NonceStatus(resp.status().as_u16()));
    }
    let nonce: NonceResponse = resp.json().await?;
    Ok(nonce.nonce)
}

/// Exchange signed session-request parameters for a session macaroon. The
/// previous session macaroon, when present, rides along so the store can
/// invalidate it.
pub(crate) async fn request_device_session(
    client: &reqwest::Client,
    url: Url,
    params: &DeviceSessionRequestParams,
    previous_session: &str,
) -> Result<String, AuthError> {
    let mut req = client
        .post(url)
        .header("User-Agent", crate::USER_AGENT)
        .header("Accept", crate::client::JSON_CONTENT_TYPE)
        .json(params);
    if !previous_session.is_empty() {
        req = req.header(
            "X-Device-Authorization",
            format!(r#"Macaroon root="{previous_session}""#),
        );
    }
    let resp = req.send().await?;
    if !resp.status().is_success() {
        return Err(AuthError::SessionStatus(resp.status().as_u16()));
    }
    let session: SessionResponse = resp.json().await?;
    Ok(session.macaroon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_shared_between_clones() {
        let user = UserCredentials::new("root", vec!["d1".to_string()]);
        let alias = user.clone();
        user.set_discharges(vec!["d2".to_string()]);
        assert_eq!(alias.discharges(), vec!["d2".to_string()]);
        assert!(alias.has_store_auth());
    }

    #[test]
    fn anonymous_credentials() {
        let user = UserCredentials::default();
        assert!(!user.has_store_auth());
    }

    #[test]
    fn session_request_params_wire_names() {
        let params = DeviceSessionRequestParams {
            request: "req".into(),
            serial_assertion: "serial".into(),
            model_assertion: "model".into(),
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["device-session-request"], "req");
        assert_eq!(json["serial-assertion"], "serial");
        assert_eq!(json["model-assertion"], "model");
    }
}

//! Shared test fixtures: an in-process store served over a loopback socket,
//! plus fake auth collaborators.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use axum::Router;
use reqwest::Url;
use tempfile::TempDir;

use snapstore::auth::macaroon::{Macaroon, MacaroonCodec};
use snapstore::auth::{
    AuthContext, AuthError, CloudInfo, DeviceSessionRequestParams, DeviceState, ProxyStore,
    UserCredentials,
};
use snapstore::{Config, Store};

/// Honour RUST_LOG in test runs, once.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Serve `router` on an ephemeral loopback port, returning its base URL.
pub async fn serve(router: Router) -> String {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve test store");
    });
    format!("http://{addr}/")
}

/// A config pointed at the fake store with all filesystem paths under the
/// given temp dir.
pub fn test_config(base_url: &str, work: &TempDir) -> Config {
    Config {
        store_base_url: Url::parse(base_url).expect("test base url"),
        download_cache_dir: work.path().join("cache"),
        blob_dir: work.path().join("blobs"),
        ssl_certs_dir: None,
        ..Config::default()
    }
}

pub fn test_store(base_url: &str, work: &TempDir) -> Store {
    Store::new(test_config(base_url, work), None).expect("test store")
}

// A transparent macaroon fake: serialized form is "location|signature".

pub struct FakeMacaroon {
    location: String,
    signature: String,
}

impl Macaroon for FakeMacaroon {
    fn location(&self) -> String {
        self.location.clone()
    }

    fn signature(&self) -> Vec<u8> {
        self.signature.clone().into_bytes()
    }

    fn third_party_caveat_id(&self, location: &str) -> Option<String> {
        (location == "login.ubuntu.com").then(|| format!("caveat-for-{}", self.signature))
    }

    fn bind(&self, root_signature: &[u8]) -> Box<dyn Macaroon> {
        Box::new(FakeMacaroon {
            location: self.location.clone(),
            signature: format!(
                "{}+{}",
                self.signature,
                String::from_utf8_lossy(root_signature)
            ),
        })
    }
}

pub struct FakeCodec;

impl MacaroonCodec for FakeCodec {
    fn deserialize(&self, raw: &str) -> Result<Box<dyn Macaroon>, AuthError> {
        let (location, signature) = raw
            .split_once('|')
            .ok_or_else(|| AuthError::InvalidMacaroon(raw.to_string()))?;
        Ok(Box::new(FakeMacaroon {
            location: location.to_string(),
            signature: signature.to_string(),
        }))
    }

    fn serialize(&self, macaroon: &dyn Macaroon) -> Result<String, AuthError> {
        Ok(format!(
            "{}|{}",
            macaroon.location(),
            String::from_utf8_lossy(&macaroon.signature())
        ))
    }
}

/// In-memory auth context tracking refresh traffic.
pub struct FakeAuthContext {
    pub device: Mutex<DeviceState>,
    pub store_id: String,
    pub cloud: Option<CloudInfo>,
    pub user_refreshes: AtomicUsize,
    pub device_refreshes: AtomicUsize,
}

impl FakeAuthContext {
    pub fn with_session() -> Self {
        FakeAuthContext {
            device: Mutex::new(DeviceState {
                brand: "generic".to_string(),
                model: "generic-classic".to_string(),
                serial: "serial-123".to_string(),
                session_macaroon: "device-session".to_string(),
            }),
            store_id: String::new(),
            cloud: None,
            user_refreshes: AtomicUsize::new(0),
            device_refreshes: AtomicUsize::new(0),
        }
    }

    pub fn without_session() -> Self {
        let ctx = Self::with_session();
        ctx.device.lock().unwrap().session_macaroon = String::new();
        ctx
    }
}

#[async_trait]
impl AuthContext for FakeAuthContext {
    async fn device(&self) -> Result<DeviceState, AuthError> {
        Ok(self.device.lock().unwrap().clone())
    }

    async fn update_device_auth(
        &self,
        _device: &DeviceState,
        session_macaroon: &str,
    ) -> Result<DeviceState, AuthError> {
        self.device_refreshes.fetch_add(1, Ordering::SeqCst);
        let mut device = self.device.lock().unwrap();
        device.session_macaroon = session_macaroon.to_string();
        Ok(device.clone())
    }

    async fn update_user_auth(
        &self,
        _user: &UserCredentials,
        discharges: &[String],
    ) -> Result<Vec<String>, AuthError> {
        self.user_refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(discharges
            .iter()
            .map(|d| format!("{d}-persisted"))
            .collect())
    }

    async fn store_id(&self, fallback: &str) -> Result<String, AuthError> {
        if self.store_id.is_empty() {
            Ok(fallback.to_string())
        } else {
            Ok(self.store_id.clone())
        }
    }

    async fn device_session_request_params(
        &self,
        nonce: &str,
    ) -> Result<DeviceSessionRequestParams, AuthError> {
        Ok(DeviceSessionRequestParams {
            request: format!("signed-{nonce}"),
            serial_assertion: "serial-assertion".to_string(),
            model_assertion: "model-assertion".to_string(),
        })
    }

    async fn proxy_store_params(
        &self,
        _default_url: &Url,
    ) -> Result<Option<ProxyStore>, AuthError> {
        Ok(None)
    }

    async fn cloud_info(&self) -> Result<Option<CloudInfo>, AuthError> {
        Ok(self.cloud.clone())
    }
}


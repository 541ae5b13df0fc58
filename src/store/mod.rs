//! The Store façade: one shared client for all store interaction.
//!
//! Construction wires together configuration, the HTTP client, the download
//! cache and the optional auth context. All operations take `&self` and are
//! safe to call from many tasks at once; the only serialized path is the
//! device-session refresh.

use std::fs;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::auth::macaroon::{self, MacaroonCodec};
use crate::auth::{self, AuthContext, AuthError, DeviceState, UserCredentials};
use crate::cache::{CacheManager, DownloadCache, NullCache};
use crate::client::retry::{
    should_retry_error, should_retry_status, RetryStrategy, DEFAULT_RETRY_STRATEGY,
};
use crate::client::{ApiLevel, DeviceAuthNeed, RequestOptions, StoreResponse};
use crate::config::{self, Config};
use crate::store::delta::{DeltaApplier, Xdelta3Applier};
use crate::store::error::StoreError;

pub mod actions;
pub mod assertions;
pub mod catalog;
pub mod commerce;
pub mod connectivity;
pub mod delta;
pub mod discovery;
pub mod download;
pub mod error;

// API endpoint paths. The v1 prefix repeats "api/" because the per-endpoint
// paths are what varies between store generations.
pub(crate) const SEARCH_ENDPOINT: &str = "api/v1/snaps/search";
pub(crate) const ORDERS_ENDPOINT: &str = "api/v1/snaps/purchases/orders";
pub(crate) const BUY_ENDPOINT: &str = "api/v1/snaps/purchases/buy";
pub(crate) const CUSTOMERS_ME_ENDPOINT: &str = "api/v1/snaps/purchases/customers/me";
pub(crate) const SECTIONS_ENDPOINT: &str = "api/v1/snaps/sections";
pub(crate) const COMMANDS_ENDPOINT: &str = "api/v1/snaps/names";
pub(crate) const SNAP_ACTION_ENDPOINT: &str = "v2/snaps/refresh";
pub(crate) const SNAP_INFO_ENDPOINT: &str = "v2/snaps/info";
pub(crate) const COHORTS_ENDPOINT: &str = "v2/cohorts";
pub(crate) const FIND_ENDPOINT: &str = "v2/snaps/find";
pub(crate) const DEVICE_NONCE_ENDPOINT: &str = "api/v1/snaps/auth/nonces";
pub(crate) const DEVICE_SESSION_ENDPOINT: &str = "api/v1/snaps/auth/sessions";
pub(crate) const ASSERTIONS_ENDPOINT: &str = "api/v1/snaps/assertions";

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// A default codec for deployments that never handle user credentials; any
/// attempt to process a macaroon through it fails.
struct OpaqueCodec;

impl MacaroonCodec for OpaqueCodec {
    fn deserialize(&self, _raw: &str) -> Result<Box<dyn macaroon::Macaroon>, AuthError> {
        Err(AuthError::InvalidMacaroon(
            "no macaroon codec configured".to_string(),
        ))
    }

    fn serialize(&self, _macaroon: &dyn macaroon::Macaroon) -> Result<String, AuthError> {
        Err(AuthError::InvalidMacaroon(
            "no macaroon codec configured".to_string(),
        ))
    }
}

/// The snap store client.
pub struct Store {
    pub(crate) cfg: Config,
    pub(crate) no_cdn: bool,
    pub(crate) deltas_enabled: bool,
    /// Reused client for metadata calls.
    pub(crate) client: reqwest::Client,
    pub(crate) auth_ctx: Option<Arc<dyn AuthContext>>,
    pub(crate) codec: Arc<dyn MacaroonCodec>,
    pub(crate) delta_applier: Arc<dyn DeltaApplier>,
    /// Serializes device-session refresh so concurrent 401s don't stampede
    /// the nonce/session exchange.
    session_mu: tokio::sync::Mutex<()>,
    suggested_currency: Mutex<Option<String>>,
    cacher: RwLock<(usize, Arc<dyn DownloadCache>)>,
}

impl Store {
    pub fn new(cfg: Config, auth_ctx: Option<Arc<dyn AuthContext>>) -> Result<Self, StoreError> {
        cfg.validate()?;
        let client = build_http_client(&cfg, Some(METADATA_TIMEOUT))?;
        let cache_downloads = cfg.cache_downloads;
        let cacher = new_cacher(&cfg, cache_downloads);
        Ok(Store {
            no_cdn: config::no_cdn(),
            deltas_enabled: config::use_delta_experiment(),
            client,
            auth_ctx,
            codec: Arc::new(OpaqueCodec),
            delta_applier: Arc::new(Xdelta3Applier),
            session_mu: tokio::sync::Mutex::new(()),
            suggested_currency: Mutex::new(None),
            cacher: RwLock::new((cache_downloads, cacher)),
            cfg,
        })
    }

    pub fn with_macaroon_codec(mut self, codec: Arc<dyn MacaroonCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_delta_applier(mut self, applier: Arc<dyn DeltaApplier>) -> Self {
        self.delta_applier = applier;
        self
    }

    /// A fresh client without the metadata timeout, for downloads and other
    /// streaming responses.
    pub(crate) fn new_untimed_client(&self) -> Result<reqwest::Client, StoreError> {
        build_http_client(&self.cfg, None)
    }

    pub fn cache_downloads(&self) -> usize {
        self.cacher.read().expect("cacher lock").0
    }

    pub fn set_cache_downloads(&self, file_count: usize) {
        let cacher = new_cacher(&self.cfg, file_count);
        *self.cacher.write().expect("cacher lock") = (file_count, cacher);
    }

    pub(crate) fn cacher(&self) -> Arc<dyn DownloadCache> {
        self.cacher.read().expect("cacher lock").1.clone()
    }

    /// The store's suggested currency, as last reported; defaults to USD.
    pub fn suggested_currency(&self) -> String {
        self.suggested_currency
            .lock()
            .expect("currency lock")
            .clone()
            .unwrap_or_else(|| "USD".to_string())
    }

    pub(crate) fn extract_suggested_currency(&self, resp: &StoreResponse) {
        if let Some(currency) = resp.header("X-Suggested-Currency") {
            *self.suggested_currency.lock().expect("currency lock") =
                Some(currency.to_string());
        }
    }

    // URL resolution

    /// The effective base URL: an auth-context proxy store replaces the
    /// configured base.
    pub(crate) async fn base_url(&self, default_url: &Url) -> Url {
        if let Some(ctx) = &self.auth_ctx {
            match ctx.proxy_store_params(default_url).await {
                Ok(Some(proxy)) => {
                    if let Some(u) = proxy.url {
                        return u;
                    }
                }
                Ok(None) => {}
                Err(err) => debug!("cannot get proxy store parameters from state: {err}"),
            }
        }
        default_url.clone()
    }

    pub(crate) async fn endpoint_url(&self, path: &str, query: &[(&str, &str)]) -> Url {
        let base = self.base_url(&self.cfg.store_base_url).await;
        config::endpoint_url(&base, path, query)
    }

    pub(crate) async fn assertions_endpoint_url(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Url {
        let default = self
            .cfg
            .assertions_base_url
            .as_ref()
            .unwrap_or(&self.cfg.store_base_url);
        let base = self.base_url(default).await;
        config::endpoint_url(&base, &format!("{ASSERTIONS_ENDPOINT}/{path}"), query)
    }

    // Authentication

    /// True when there is a user or a device session to authenticate with.
    pub(crate) async fn auth_available(
        &self,
        user: Option<&UserCredentials>,
    ) -> Result<bool, StoreError> {
        if user.is_some_and(|u| u.has_store_auth()) {
            return Ok(true);
        }
        if let Some(ctx) = &self.auth_ctx {
            let device = ctx.device().await?;
            return Ok(!device.session_macaroon.is_empty());
        }
        Ok(false)
    }

    /// Log the user in and return the root macaroon and its SSO discharge.
    pub async fn login_user(
        &self,
        username: &str,
        password: &str,
        otp: &str,
    ) -> Result<(String, String), StoreError> {
        let macaroon =
            auth::sso::request_store_macaroon(&self.client, &config::store_developer_url())
                .await?;
        let root = self.codec.deserialize(&macaroon)?;
        let caveat_id = macaroon::login_caveat_id(root.as_ref(), &config::auth_location())?;
        let discharge = auth::sso::discharge_auth_caveat(
            &self.client,
            &config::auth_url(),
            &caveat_id,
            username,
            password,
            otp,
        )
        .await?;
        Ok((macaroon, discharge))
    }

    /// Refresh the user's SSO discharges and persist them; the caller's
    /// credentials handle observes the new values.
    pub(crate) async fn refresh_user(&self, user: &UserCredentials) -> Result<(), StoreError> {
        let Some(ctx) = &self.auth_ctx else {
            return Err(StoreError::Internal(
                "user credentials need to be refreshed but update in place requires an auth context"
                    .to_string(),
            ));
        };
        let sso_location = config::auth_location();
        let mut new_discharges = Vec::new();
        for discharge in user.discharges() {
            let location = self
                .codec
                .deserialize(&discharge)
                .map(|m| m.location())
                .unwrap_or_default();
            if location != sso_location {
                new_discharges.push(discharge);
                continue;
            }
            let refreshed = auth::sso::refresh_discharge_macaroon(
                &self.client,
                &config::auth_url(),
                &discharge,
            )
            .await?;
            new_discharges.push(refreshed);
        }
        let current = ctx.update_user_auth(user, &new_discharges).await?;
        user.set_discharges(current);
        Ok(())
    }

    /// Set or refresh the device session. The critical section re-reads the
    /// authoritative device state: if another task already refreshed it, no
    /// network traffic happens.
    pub(crate) async fn refresh_device_session(
        &self,
        device: &DeviceState,
    ) -> Result<DeviceState, StoreError> {
        let Some(ctx) = &self.auth_ctx else {
            return Err(StoreError::Internal(
                "no device and auth context".to_string(),
            ));
        };

        let _guard = self.session_mu.lock().await;
        let current = ctx.device().await?;
        if &current != device {
            return Ok(current);
        }

        let nonce_url = self.endpoint_url(DEVICE_NONCE_ENDPOINT, &[]).await;
        let nonce = auth::request_store_device_nonce(&self.client, nonce_url).await?;
        let params = ctx.device_session_request_params(&nonce).await?;
        let session_url = self.endpoint_url(DEVICE_SESSION_ENDPOINT, &[]).await;
        let session = auth::request_device_session(
            &self.client,
            session_url,
            &params,
            &device.session_macaroon,
        )
        .await?;
        Ok(ctx.update_device_auth(device, &session).await?)
    }

    /// Make sure a device session is available, establishing one on first
    /// use. Requires an auth context; a device without a serial assertion
    /// yet cannot open a session.
    pub async fn ensure_device_session(&self) -> Result<DeviceState, StoreError> {
        let Some(ctx) = &self.auth_ctx else {
            return Err(StoreError::Internal("no auth context".to_string()));
        };
        let device = ctx.device().await?;
        if !device.session_macaroon.is_empty() {
            return Ok(device);
        }
        if device.serial.is_empty() {
            return Err(StoreError::NoSerial);
        }
        self.refresh_device_session(&device).await
    }

    pub(crate) async fn refresh_auth(
        &self,
        user: Option<&UserCredentials>,
        need: AuthRefreshNeed,
    ) -> Result<(), StoreError> {
        if need.user {
            if let Some(user) = user {
                self.refresh_user(user).await?;
            }
        }
        if need.device {
            let Some(ctx) = &self.auth_ctx else {
                return Err(StoreError::Internal(
                    "no device and auth context".to_string(),
                ));
            };
            let device = ctx.device().await?;
            self.refresh_device_session(&device).await?;
        }
        Ok(())
    }

    // Request pipeline

    /// Send one store request with credentials attached, transparently
    /// refreshing user and/or device auth when the store answers 401 with
    /// refresh hints. Four refresh rounds cover both layers expiring twice.
    pub(crate) async fn do_request(
        &self,
        client: &reqwest::Client,
        opts: &RequestOptions,
        user: Option<&UserCredentials>,
    ) -> Result<reqwest::Response, StoreError> {
        let mut auth_refreshes = 0;
        loop {
            let req = self.build_request(client, opts, user).await?;
            let resp = client.execute(req).await?;

            if resp.status() == StatusCode::UNAUTHORIZED && auth_refreshes < 4 {
                let www_auth = resp
                    .headers()
                    .get("WWW-Authenticate")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                let need = AuthRefreshNeed {
                    user: user.is_some() && www_auth.contains("needs_refresh=1"),
                    device: www_auth.contains("refresh_device_session=1"),
                };
                if need.needed() {
                    self.refresh_auth(user, need).await?;
                    auth_refreshes += 1;
                    continue;
                }
            }
            return Ok(resp);
        }
    }

    async fn build_request(
        &self,
        client: &reqwest::Client,
        opts: &RequestOptions,
        user: Option<&UserCredentials>,
    ) -> Result<reqwest::Request, StoreError> {
        let mut builder = client.request(opts.method.clone(), opts.url.clone());

        let (store_id, custom_store) = self.effective_store_id().await;
        if custom_store {
            builder = builder.header(opts.api_level.store_header(), store_id.as_str());
        }

        if self.auth_ctx.is_some()
            && (custom_store || opts.device_auth_need != DeviceAuthNeed::CustomStoreOnly)
        {
            match self.ensure_device_session().await {
                Ok(device) => {
                    builder = builder.header(
                        opts.api_level.device_authorization_header(),
                        macaroon::device_authorization(&device.session_macaroon),
                    );
                }
                Err(StoreError::NoSerial) => {
                    // no serial assertion yet, continue without device auth
                    debug!("cannot set device session: no serial assertion yet");
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(user) = user {
            if user.has_store_auth() {
                builder = builder.header(
                    "Authorization",
                    macaroon::user_authorization(self.codec.as_ref(), user),
                );
            }
        }

        builder = builder
            .header("User-Agent", crate::USER_AGENT)
            .header("Accept", opts.accept.as_str())
            .header(
                opts.api_level.architecture_header(),
                self.cfg.architecture.as_str(),
            )
            .header(opts.api_level.series_header(), self.cfg.series.as_str())
            .header(
                opts.api_level.classic_header(),
                if self.cfg.on_classic { "true" } else { "false" },
            )
            .header("Snap-Device-Capabilities", "default-tracks");
        if let Some(cua) = &opts.client_user_agent {
            builder = builder.header("Snap-Client-User-Agent", cua.as_str());
        }
        if opts.api_level == ApiLevel::V1 {
            builder = builder.header("X-Ubuntu-Wire-Protocol", crate::WIRE_PROTOCOL);
        }
        if let Some(ct) = &opts.content_type {
            builder = builder.header("Content-Type", ct.as_str());
        }
        for (name, value) in &opts.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(data) = &opts.data {
            builder = builder.body(data.clone());
        }

        Ok(builder.build()?)
    }

    /// The store id to send, and whether it makes this a custom store.
    async fn effective_store_id(&self) -> (String, bool) {
        let mut store_id = self.cfg.store_id.clone();
        if let Some(ctx) = &self.auth_ctx {
            match ctx.store_id(&store_id).await {
                Ok(id) => store_id = id,
                Err(err) => debug!("cannot get store ID from state: {err}"),
            }
        }
        let custom = !store_id.is_empty();
        (store_id, custom)
    }

    /// Send with retry, buffer the response and decode it into the success
    /// or failure shape depending on status.
    pub(crate) async fn retry_request_decode<S, F>(
        &self,
        opts: &RequestOptions,
        user: Option<&UserCredentials>,
    ) -> Result<(StoreResponse, Option<S>, Option<F>), StoreError>
    where
        S: DeserializeOwned,
        F: DeserializeOwned,
    {
        self.retry_request_decode_with(&self.client, opts, user, DEFAULT_RETRY_STRATEGY)
            .await
    }

    pub(crate) async fn retry_request_decode_with<S, F>(
        &self,
        client: &reqwest::Client,
        opts: &RequestOptions,
        user: Option<&UserCredentials>,
        strategy: RetryStrategy,
    ) -> Result<(StoreResponse, Option<S>, Option<F>), StoreError>
    where
        S: DeserializeOwned,
        F: DeserializeOwned,
    {
        let resp = self.retry_request(client, opts, user, strategy).await?;
        let (success, failure) = resp.decode_body()?;
        Ok((resp, success, failure))
    }

    /// Send with retry and buffer the response, without decoding.
    pub(crate) async fn retry_request(
        &self,
        client: &reqwest::Client,
        opts: &RequestOptions,
        user: Option<&UserCredentials>,
        strategy: RetryStrategy,
    ) -> Result<StoreResponse, StoreError> {
        let mut attempts = strategy.attempts();
        let mut last_err = None;
        while attempts.next().await {
            if attempts.current() > 1 {
                debug!("retrying {} (attempt {})", opts.url, attempts.current());
            }
            let resp = match self.do_request(client, opts, user).await {
                Ok(resp) => resp,
                Err(StoreError::Http(err)) if should_retry_error(&err) && attempts.more() => {
                    last_err = Some(StoreError::Http(err));
                    continue;
                }
                Err(err) => return Err(err),
            };
            if should_retry_status(resp.status()) && attempts.more() {
                last_err = Some(StoreError::from_status(
                    "query the store",
                    resp.status(),
                    &opts.method,
                    resp.url(),
                    None,
                ));
                continue;
            }
            match StoreResponse::read(opts.method.clone(), resp).await {
                Ok(resp) => return Ok(resp),
                Err(err) if should_retry_error(&err) && attempts.more() => {
                    last_err = Some(StoreError::Http(err));
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_err
            .unwrap_or_else(|| StoreError::Internal("retry strategy exhausted".to_string())))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AuthRefreshNeed {
    pub user: bool,
    pub device: bool,
}

impl AuthRefreshNeed {
    pub fn needed(&self) -> bool {
        self.user || self.device
    }
}

fn new_cacher(cfg: &Config, file_count: usize) -> Arc<dyn DownloadCache> {
    if file_count > 0 {
        Arc::new(CacheManager::new(cfg.download_cache_dir.clone(), file_count))
    } else {
        Arc::new(NullCache)
    }
}

fn build_http_client(
    cfg: &Config,
    timeout: Option<Duration>,
) -> Result<reqwest::Client, StoreError> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(proxy) = &cfg.proxy {
        builder = builder.proxy(proxy.clone());
    }
    if let Some(dir) = &cfg.ssl_certs_dir {
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let pem = match fs::read(entry.path()) {
                    Ok(pem) => pem,
                    Err(err) => {
                        debug!("cannot read extra certificate {}: {err}", entry.path().display());
                        continue;
                    }
                };
                match reqwest::Certificate::from_pem(&pem) {
                    Ok(cert) => builder = builder.add_root_certificate(cert),
                    Err(err) => {
                        debug!("cannot parse extra certificate {}: {err}", entry.path().display())
                    }
                }
            }
        }
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_validates_config() {
        let cfg = Config {
            store_base_url: Url::parse("https://api.example.com/?x=1").unwrap(),
            ssl_certs_dir: None,
            ..Config::default()
        };
        assert!(Store::new(cfg, None).is_err());
    }

    #[test]
    fn suggested_currency_defaults_to_usd() {
        let cfg = Config {
            ssl_certs_dir: None,
            ..Config::default()
        };
        let store = Store::new(cfg, None).unwrap();
        assert_eq!(store.suggested_currency(), "USD");
    }

    #[test]
    fn set_cache_downloads_swaps_cacher() {
        let cfg = Config {
            ssl_certs_dir: None,
            ..Config::default()
        };
        let store = Store::new(cfg, None).unwrap();
        // disabled by default: the null cache reports no entries
        assert!(store.cacher().path("aa").is_none());
        store.set_cache_downloads(3);
        assert!(store.cacher().path("aa").is_none());
    }
}

//! Store configuration and URL resolution.
//!
//! Base URLs come from compile-time defaults, switched to the staging
//! deployment or replaced wholesale by environment overrides. The assertions
//! base URL can be overridden independently. All overrides resolve through a
//! lookup closure so tests never touch the process environment.

use std::env;
use std::path::PathBuf;

use reqwest::Url;
use thiserror::Error;

use crate::types::info::{DETAIL_FIELDS, FIND_FIELDS, INFO_FIELDS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name}: {source}")]
    InvalidOverride {
        name: &'static str,
        source: url::ParseError,
    },

    #[error("store API URL may not contain query string")]
    BaseURLWithQuery,
}

/// Immutable-after-construction store access configuration.
pub struct Config {
    pub store_base_url: Url,
    /// Separate because it has its own environment override; `None` falls
    /// back to the store base.
    pub assertions_base_url: Option<Url>,

    /// Store id used when the auth context cannot provide one.
    pub store_id: String,

    pub architecture: String,
    pub series: String,
    pub on_classic: bool,

    pub detail_fields: Vec<String>,
    pub info_fields: Vec<String>,
    pub find_fields: Vec<String>,
    pub delta_format: String,

    /// Number of downloads kept in the cache; zero disables caching.
    pub cache_downloads: usize,
    pub download_cache_dir: PathBuf,
    /// Where installed snap blobs live; delta application reads the source
    /// revision from here.
    pub blob_dir: PathBuf,
    /// Extra PEM certificates to trust, one file per certificate.
    pub ssl_certs_dir: Option<PathBuf>,

    pub proxy: Option<reqwest::Proxy>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store_base_url: api_url(),
            assertions_base_url: None,
            store_id: String::new(),
            architecture: default_architecture().to_string(),
            series: DEFAULT_SERIES.to_string(),
            on_classic: false,
            detail_fields: to_owned_fields(DETAIL_FIELDS),
            info_fields: to_owned_fields(INFO_FIELDS),
            find_fields: to_owned_fields(FIND_FIELDS),
            delta_format: DEFAULT_DELTA_FORMAT.to_string(),
            cache_downloads: 0,
            download_cache_dir: PathBuf::from("/var/cache/snapd/download-cache"),
            blob_dir: PathBuf::from("/var/lib/snapd/snaps"),
            ssl_certs_dir: Some(PathBuf::from("/etc/snapd/ssl/store-certs")),
            proxy: None,
        }
    }
}

impl Config {
    /// Resolve base URLs from the defaults and environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let store_base_url = store_url(&api_url(), env_lookup)?;
        if store_base_url.query().is_some() {
            return Err(ConfigError::BaseURLWithQuery);
        }
        Ok(Config {
            store_base_url,
            assertions_base_url: asserts_url(env_lookup)?,
            ..Config::default()
        })
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.store_base_url.query().is_some() {
            return Err(ConfigError::BaseURLWithQuery);
        }
        if let Some(u) = &self.assertions_base_url {
            if u.query().is_some() {
                return Err(ConfigError::BaseURLWithQuery);
            }
        }
        Ok(())
    }
}

fn to_owned_fields(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

pub(crate) const DEFAULT_SERIES: &str = "16";
pub(crate) const DEFAULT_DELTA_FORMAT: &str = "xdelta3";

fn default_architecture() -> &'static str {
    match env::consts::ARCH {
        "x86" => "i386",
        "x86_64" => "amd64",
        "arm" => "armhf",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64el",
        "s390x" => "s390x",
        "riscv64" => "riscv64",
        other => other,
    }
}

fn env_lookup(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(get: impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    match get(name) {
        Some(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

pub(crate) fn use_staging() -> bool {
    env_bool(env_lookup, "SNAPPY_USE_STAGING_STORE", false)
}

pub(crate) fn no_cdn() -> bool {
    env_bool(env_lookup, "SNAPPY_STORE_NO_CDN", false)
}

pub(crate) fn use_delta_experiment() -> bool {
    env_bool(env_lookup, "SNAPD_USE_DELTAS_EXPERIMENTAL", true)
}

/// The system default API base URL.
pub(crate) fn api_url() -> Url {
    let s = if use_staging() {
        "https://api.staging.snapcraft.io/"
    } else {
        "https://api.snapcraft.io/"
    };
    Url::parse(s).expect("compile-time store URL")
}

/// The effective store base URL, honouring the forced-URL overrides. The
/// legacy variable is accepted only when it carries the old `api/v1/`
/// suffix, which is then stripped.
pub(crate) fn store_url(
    api: &Url,
    get: impl Fn(&str) -> Option<String>,
) -> Result<Url, ConfigError> {
    let mut override_value = None;
    let mut override_name = "SNAPPY_FORCE_API_URL";
    if let Some(s) = get("SNAPPY_FORCE_CPI_URL") {
        if let Some(stripped) = s.strip_suffix("api/v1/") {
            override_name = "SNAPPY_FORCE_CPI_URL";
            override_value = Some(stripped.to_string());
        }
    }
    if override_value.is_none() {
        override_value = get("SNAPPY_FORCE_API_URL");
    }
    match override_value {
        Some(s) => Url::parse(&s).map_err(|source| ConfigError::InvalidOverride {
            name: override_name,
            source,
        }),
        None => Ok(api.clone()),
    }
}

/// The assertions base URL override, if any.
pub(crate) fn asserts_url(
    get: impl Fn(&str) -> Option<String>,
) -> Result<Option<Url>, ConfigError> {
    match get("SNAPPY_FORCE_SAS_URL") {
        Some(s) => Url::parse(&s)
            .map(Some)
            .map_err(|source| ConfigError::InvalidOverride {
                name: "SNAPPY_FORCE_SAS_URL",
                source,
            }),
        None => Ok(None),
    }
}

/// Hostname of the SSO service issuing user discharges.
pub(crate) fn auth_location() -> String {
    auth_location_from(env_lookup)
}

fn auth_location_from(get: impl Fn(&str) -> Option<String>) -> String {
    if env_bool(&get, "SNAPPY_USE_STAGING_STORE", false) {
        "login.staging.ubuntu.com".to_string()
    } else {
        "login.ubuntu.com".to_string()
    }
}

/// Base URL of the SSO API.
pub(crate) fn auth_url() -> String {
    if let Some(u) = env_lookup("SNAPPY_FORCE_SSO_URL") {
        return u;
    }
    format!("https://{}/api/v2", auth_location())
}

/// The developer dashboard, which issues root store macaroons.
pub(crate) fn store_developer_url() -> String {
    if use_staging() {
        "https://dashboard.staging.snapcraft.io/".to_string()
    } else {
        "https://dashboard.snapcraft.io/".to_string()
    }
}

/// Clone `base`, append `path` (normalising slashes) and set the query.
pub(crate) fn endpoint_url(base: &Url, path: &str, query: &[(&str, &str)]) -> Url {
    let mut u = base.clone();
    if !path.is_empty() {
        let joined = format!(
            "{}/{}",
            u.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        u.set_path(&joined);
        u.set_query(None);
    }
    if !query.is_empty() {
        let mut pairs = u.query_pairs_mut();
        pairs.clear();
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }
    u
}

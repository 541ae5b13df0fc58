//! The error taxonomy surfaced to callers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use reqwest::{Method, StatusCode, Url};
use thiserror::Error;

use crate::auth::AuthError;
use crate::client::StoreResponse;
use crate::config::ConfigError;

/// An available release reported alongside "revision not found".
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct SnapRelease {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub channel: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("you need to log in first")]
    Unauthenticated,

    #[error("cannot authenticate to snap store")]
    InvalidCredentials,

    #[error("no serial assertion yet")]
    NoSerial,

    #[error("snap not found")]
    SnapNotFound,

    #[error("snap has no updates available")]
    NoUpdateAvailable,

    #[error("bad query")]
    BadQuery,

    #[error("invalid scope")]
    InvalidScope,

    #[error("too many requests")]
    TooManyRequests,

    #[error("sha3-384 mismatch for {name:?}: got {actual} but expected {expected}")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("received an unexpected http response code {code} while trying to download {url}")]
    Download { code: u16, url: String },

    #[error("payment declined")]
    PaymentDeclined,

    #[error("no payment methods")]
    NoPaymentMethods,

    #[error("terms of service not accepted")]
    TermsNotAccepted,

    #[error("cannot buy snap: {0}")]
    Buy(String),

    #[error("no snap revision available as specified")]
    RevisionNotAvailable {
        action: String,
        channel: String,
        releases: Vec<SnapRelease>,
    },

    #[error(transparent)]
    SnapAction(Box<SnapActionError>),

    #[error("{assert_type} assertion not found")]
    AssertionNotFound {
        assert_type: String,
        headers: BTreeMap<String, String>,
    },

    #[error("assertion service error: [{title}] {detail:?}")]
    AssertionService { title: String, detail: String },

    /// Sentinel: the store accepted the request but flagged the user
    /// authorization as soft-expired.
    #[error("soft-expired user authorization needs refresh")]
    UserAuthorizationNeedsRefresh,

    /// Sentinel: ditto for the device session.
    #[error("soft-expired device authorization needs refresh")]
    DeviceAuthorizationNeedsRefresh,

    #[error("cannot {verb}: got unexpected HTTP status code {status} via {method} to {url:?}{}",
            .oops.as_deref().map(|o| format!(" [{o}]")).unwrap_or_default())]
    UnexpectedStatus {
        verb: String,
        status: u16,
        method: String,
        url: String,
        oops: Option<String>,
    },

    #[error("received an unexpected content type ({content_type:?}) via {url:?}")]
    UnexpectedContentType { content_type: String, url: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Protocol(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Map a non-2xx response to the generic taxonomy: 429 is its own kind,
    /// anything else reports the status with the request coordinates and
    /// the `X-Oops-Id` incident marker when present.
    pub(crate) fn unexpected_status(verb: &str, resp: &StoreResponse) -> StoreError {
        Self::from_status(verb, resp.status, &resp.method, &resp.url, resp.header("X-Oops-Id"))
    }

    pub(crate) fn from_status(
        verb: &str,
        status: StatusCode,
        method: &Method,
        url: &Url,
        oops: Option<&str>,
    ) -> StoreError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            return StoreError::TooManyRequests;
        }
        StoreError::UnexpectedStatus {
            verb: verb.to_string(),
            status: status.as_u16(),
            method: method.to_string(),
            url: url.to_string(),
            oops: oops.map(|o| o.to_string()),
        }
    }
}

impl From<SnapActionError> for StoreError {
    fn from(err: SnapActionError) -> Self {
        StoreError::SnapAction(Box::new(err))
    }
}

/// Aggregate outcome of a snap-action batch with per-instance failures.
/// Results that did succeed ride along in `results`.
#[derive(Debug, Default)]
pub struct SnapActionError {
    /// Successful results produced alongside the failures.
    pub results: Vec<crate::store::actions::SnapActionResult>,
    /// The response carried no results at all.
    pub no_results: bool,
    /// Errors by instance name for refresh actions.
    pub refresh: HashMap<String, StoreError>,
    /// Errors by instance name for install actions.
    pub install: HashMap<String, StoreError>,
    /// Errors by snap name for download actions.
    pub download: HashMap<String, StoreError>,
    /// Errors not tied to any action.
    pub other: Vec<StoreError>,
}

impl SnapActionError {
    pub fn is_empty(&self) -> bool {
        !self.no_results
            && self.refresh.is_empty()
            && self.install.is_empty()
            && self.download.is_empty()
            && self.other.is_empty()
    }

    fn single(&self) -> Option<(&'static str, &String, &StoreError)> {
        let total = self.refresh.len() + self.install.len() + self.download.len();
        if total != 1 || !self.other.is_empty() {
            return None;
        }
        if let Some((name, err)) = self.refresh.iter().next() {
            return Some(("refresh", name, err));
        }
        if let Some((name, err)) = self.install.iter().next() {
            return Some(("install", name, err));
        }
        self.download
            .iter()
            .next()
            .map(|(name, err)| ("download", name, err))
    }
}

impl fmt::Display for SnapActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((verb, name, err)) = self.single() {
            return write!(f, "cannot {verb} snap {name:?}: {err}");
        }
        if self.refresh.is_empty()
            && self.install.is_empty()
            && self.download.is_empty()
            && self.other.len() == 1
        {
            return write!(f, "cannot query the store: {}", self.other[0]);
        }
        if self.no_results && self.other.is_empty() && self.single().is_none() && self.is_empty_maps()
        {
            return write!(f, "no install/refresh information results from the store");
        }
        writeln!(f, "cannot query the store for updates:")?;
        for (verb, errs) in [
            ("refresh", &self.refresh),
            ("install", &self.install),
            ("download", &self.download),
        ] {
            let mut names: Vec<&String> = errs.keys().collect();
            names.sort();
            for name in names {
                writeln!(f, " cannot {verb} snap {name:?}: {}", errs[name])?;
            }
        }
        for err in &self.other {
            writeln!(f, " {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SnapActionError {}

impl SnapActionError {
    fn is_empty_maps(&self) -> bool {
        self.refresh.is_empty() && self.install.is_empty() && self.download.is_empty()
    }
}

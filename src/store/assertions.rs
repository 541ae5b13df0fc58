//! Fetching signed assertions from the assertions service.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::auth::UserCredentials;
use crate::client::{RequestOptions, JSON_CONTENT_TYPE};
use crate::store::error::StoreError;
use crate::store::Store;

/// Media type of the signed assertion format.
pub const ASSERTION_MEDIA_TYPE: &str = "application/x.ubuntu.assertion";

/// An assertion type: its name, its primary key header names, and the
/// maximum format revision this client understands.
#[derive(Debug, Clone)]
pub struct AssertionType {
    pub name: &'static str,
    pub primary_key: &'static [&'static str],
    pub max_supported_format: u32,
}

/// A fetched assertion, still in its signed wire form; decoding and
/// verification belong to the assertion database.
#[derive(Debug, Clone)]
pub struct RawAssertion {
    pub type_name: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct AssertionSvcError {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    title: String,
    #[serde(default)]
    detail: String,
}

impl AssertionType {
    /// Reconstruct header values from the primary key, best effort.
    fn headers_from_primary_key(&self, primary_key: &[&str]) -> BTreeMap<String, String> {
        self.primary_key
            .iter()
            .zip(primary_key)
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }
}

impl Store {
    /// Fetch the assertion with the given type and primary key.
    pub async fn assertion(
        &self,
        assert_type: &AssertionType,
        primary_key: &[&str],
        user: Option<&UserCredentials>,
    ) -> Result<RawAssertion, StoreError> {
        let max_format = assert_type.max_supported_format.to_string();
        let mut path = assert_type.name.to_string();
        for key in primary_key {
            path.push('/');
            path.push_str(key);
        }
        let url = self
            .assertions_endpoint_url(&path, &[("max-format", &max_format)])
            .await;
        let opts = RequestOptions::get(url).accept(ASSERTION_MEDIA_TYPE);

        let resp = self
            .retry_request(
                &self.client,
                &opts,
                user,
                crate::client::retry::DEFAULT_RETRY_STRATEGY,
            )
            .await?;

        if resp.status.as_u16() == 200 {
            return Ok(RawAssertion {
                type_name: assert_type.name.to_string(),
                body: resp.body.to_vec(),
            });
        }

        let content_type = resp.content_type().unwrap_or_default();
        if content_type == JSON_CONTENT_TYPE || content_type == "application/problem+json" {
            let svc_err: AssertionSvcError = resp.decode().map_err(|err| {
                StoreError::Protocol(format!(
                    "cannot decode assertion service error with HTTP status code {}: {err}",
                    resp.status.as_u16()
                ))
            })?;
            if svc_err.status == 404 {
                return Err(StoreError::AssertionNotFound {
                    assert_type: assert_type.name.to_string(),
                    headers: assert_type.headers_from_primary_key(primary_key),
                });
            }
            return Err(StoreError::AssertionService {
                title: svc_err.title,
                detail: svc_err.detail,
            });
        }

        Err(StoreError::unexpected_status("fetch assertion", &resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SNAP_DECLARATION: AssertionType = AssertionType {
        name: "snap-declaration",
        primary_key: &["series", "snap-id"],
        max_supported_format: 4,
    };

    #[test]
    fn headers_reconstructed_from_primary_key() {
        let headers = SNAP_DECLARATION.headers_from_primary_key(&["16", "some-id"]);
        assert_eq!(headers.get("series").unwrap(), "16");
        assert_eq!(headers.get("snap-id").unwrap(), "some-id");
    }
}

//! Connectivity probing of the API host and the CDN.

use std::collections::HashMap;

use reqwest::Method;
use serde::Deserialize;

use crate::client::retry::CONN_CHECK_RETRY_STRATEGY;
use crate::client::{ApiLevel, RequestOptions};
use crate::store::error::StoreError;
use crate::store::{Store, SNAP_INFO_ENDPOINT};

// abbreviated info shapes, just enough for the download URL
#[derive(Debug, Default, Deserialize)]
struct InfoAbbrev {
    #[serde(default, rename = "channel-map")]
    channel_map: Vec<ChannelAbbrev>,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelAbbrev {
    #[serde(default)]
    download: DownloadAbbrev,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadAbbrev {
    #[serde(default)]
    url: String,
}

impl Store {
    /// Probe the info endpoint and the CDN; returns host → reachable.
    pub async fn connectivity_check(&self) -> Result<HashMap<String, bool>, StoreError> {
        let mut status = HashMap::new();
        let (hosts, result) = self.snap_conn_check().await;
        for host in hosts {
            status.insert(host, result.is_ok());
        }
        Ok(status)
    }

    async fn snap_conn_check(&self) -> (Vec<String>, Result<(), StoreError>) {
        let mut hosts = Vec::new();
        // "core" is the one snap sure to be present in every store
        let info_url = self
            .endpoint_url(
                &format!("{SNAP_INFO_ENDPOINT}/core"),
                &[
                    // only the download URL is needed
                    ("fields", "download"),
                    ("architecture", &self.cfg.architecture),
                ],
            )
            .await;
        if let Some(host) = info_url.host_str() {
            hosts.push(host.to_string());
        }

        let opts = RequestOptions::get(info_url).api_level(ApiLevel::V2);
        let resp = match self
            .retry_request(&self.client, &opts, None, CONN_CHECK_RETRY_STRATEGY)
            .await
        {
            Ok(resp) => resp,
            Err(err) => return (hosts, Err(err)),
        };
        let result: InfoAbbrev = match resp.decode() {
            Ok(result) => result,
            Err(err) => return (hosts, Err(err.into())),
        };

        let dl_url_raw = result
            .channel_map
            .first()
            .map(|c| c.download.url.clone())
            .unwrap_or_default();
        let dl_url = match reqwest::Url::parse(&dl_url_raw) {
            Ok(u) => u,
            Err(err) => {
                return (
                    hosts,
                    Err(StoreError::Internal(format!(
                        "invalid download URL in connectivity check: {err}"
                    ))),
                )
            }
        };
        if let Some(host) = dl_url.host_str() {
            hosts.push(host.to_string());
        }

        let cdn_probe = self.cdn_probe(dl_url).await;
        match cdn_probe {
            Ok(final_host) => {
                // account for the redirect to the actual CDN machine
                if let Some(last) = hosts.last_mut() {
                    *last = final_host;
                }
                (hosts, Ok(()))
            }
            Err(err) => (hosts, Err(err)),
        }
    }

    /// HEAD the CDN URL and report the final, post-redirect host.
    async fn cdn_probe(&self, dl_url: reqwest::Url) -> Result<String, StoreError> {
        let mut opts = self
            .download_req_opts(dl_url, &Default::default())
            .await?;
        opts.method = Method::HEAD;
        let resp = self
            .retry_request(&self.client, &opts, None, CONN_CHECK_RETRY_STRATEGY)
            .await?;
        let final_host = resp.url.host_str().unwrap_or_default().to_string();
        if resp.status.as_u16() != 200 {
            return Err(StoreError::Protocol(
                "unexpected response during connection check".to_string(),
            ));
        }
        Ok(final_host)
    }
}

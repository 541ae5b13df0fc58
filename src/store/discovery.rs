//! Snap discovery: info lookup, search (v2 with v1 fallback) and sections.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::auth::UserCredentials;
use crate::client::retry::DEFAULT_RETRY_STRATEGY;
use crate::client::{
    ApiLevel, DeviceAuthNeed, RequestOptions, HAL_JSON_CONTENT_TYPE, JSON_CONTENT_TYPE,
};
use crate::store::actions::translate_snap_action_error;
use crate::store::error::StoreError;
use crate::store::{Store, FIND_ENDPOINT, SEARCH_ENDPOINT, SECTIONS_ENDPOINT, SNAP_INFO_ENDPOINT};
use crate::types::info::{
    info_from_remote, info_from_store_info, info_from_store_search_result, SnapDetails, StoreInfo,
    StoreSearchResult,
};
use crate::types::SnapInfo;

/// Characters with special meaning to the search backend; queries carrying
/// any of them are rejected client-side. "-" is also special there but is a
/// legitimate part of snap names, so it passes.
const BAD_QUERY_CHARS: &[char] = &[
    '+', '=', '&', '|', '>', '<', '!', '(', ')', '{', '}', '[', ']', '^', '"', '~', '*', '?', ':',
    '\\', '/',
];

/// What to search the store for.
#[derive(Debug, Clone, Default)]
pub struct Search {
    /// Term to search by, or a name prefix when `prefix` is set.
    pub query: String,
    pub prefix: bool,
    pub common_id: String,
    /// Called "section" by the v1 API.
    pub category: String,
    pub private: bool,
    pub scope: String,
}

#[derive(Debug, Deserialize)]
struct SearchV2Results {
    #[serde(default)]
    results: Vec<StoreSearchResult>,
    #[serde(default, rename = "error-list")]
    error_list: Vec<SearchError>,
}

#[derive(Debug, Deserialize)]
struct SearchError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct SearchV1Results {
    #[serde(default, rename = "_embedded")]
    embedded: SearchV1Payload,
}

#[derive(Debug, Default, Deserialize)]
struct SearchV1Payload {
    #[serde(default, rename = "clickindex:package")]
    packages: Vec<SnapDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct SectionResults {
    #[serde(default, rename = "_embedded")]
    embedded: SectionPayload,
}

#[derive(Debug, Default, Deserialize)]
struct SectionPayload {
    #[serde(default, rename = "clickindex:sections")]
    sections: Vec<SectionName>,
}

#[derive(Debug, Deserialize)]
struct SectionName {
    #[serde(rename = "Name", alias = "name")]
    name: String,
}

impl Store {
    /// Look up the store metadata for one snap by name.
    pub async fn snap_info(
        &self,
        name: &str,
        user: Option<&UserCredentials>,
    ) -> Result<SnapInfo, StoreError> {
        let fields = self.cfg.info_fields.join(",");
        let url = self
            .endpoint_url(
                &format!("{SNAP_INFO_ENDPOINT}/{name}"),
                &[("fields", &fields), ("architecture", &self.cfg.architecture)],
            )
            .await;
        let opts = RequestOptions::get(url).api_level(ApiLevel::V2);

        let (resp, remote, _) = self
            .retry_request_decode::<StoreInfo, serde_json::Value>(&opts, user)
            .await?;

        match resp.status.as_u16() {
            200 => {}
            404 => return Err(StoreError::SnapNotFound),
            _ => {
                return Err(StoreError::unexpected_status(
                    &format!("get details for snap {name:?}"),
                    &resp,
                ))
            }
        }
        let remote = remote.ok_or(StoreError::SnapNotFound)?;
        let mut info = info_from_store_info(&remote);

        if let Err(err) = self
            .decorate_orders(std::slice::from_mut(&mut info), user)
            .await
        {
            warn!("cannot get user orders: {err}");
        }
        self.extract_suggested_currency(&resp);

        Ok(info)
    }

    /// Find installable snaps matching the given search.
    pub async fn find(
        &self,
        search: &Search,
        user: Option<&UserCredentials>,
    ) -> Result<Vec<SnapInfo>, StoreError> {
        if search.private && user.is_none() {
            return Err(StoreError::Unauthenticated);
        }

        let search_term = search.query.trim();
        if search_term.contains(BAD_QUERY_CHARS) {
            return Err(StoreError::BadQuery);
        }

        let fields = self.cfg.find_fields.join(",");
        let mut query: Vec<(&str, &str)> = vec![
            ("fields", &fields),
            ("architecture", &self.cfg.architecture),
        ];
        if search.private {
            query.push(("private", "true"));
        }
        if search.prefix {
            query.push(("name", search_term));
        } else {
            if !search.common_id.is_empty() {
                query.push(("common-id", &search.common_id));
            }
            if !search_term.is_empty() {
                query.push(("q", search_term));
            }
        }
        if !search.category.is_empty() {
            query.push(("category", &search.category));
        }
        // v2 searches all risks by default; restrict to stable unless the
        // caller asked for the wide scope
        if search.scope.is_empty() {
            query.push(("channel", "stable"));
        } else if search.scope != "wide" {
            return Err(StoreError::InvalidScope);
        }
        query.push((
            "confinement",
            if self.cfg.on_classic {
                "strict,classic"
            } else {
                "strict"
            },
        ));

        let url = self.endpoint_url(FIND_ENDPOINT, &query).await;
        let opts = RequestOptions::get(url)
            .accept(JSON_CONTENT_TYPE)
            .api_level(ApiLevel::V2);

        let resp = self
            .retry_request(&self.client, &opts, user, DEFAULT_RETRY_STRATEGY)
            .await?;
        let search_data: SearchV2Results = if resp.ok()
            || (!resp.body.is_empty() && resp.content_type() == Some(JSON_CONTENT_TYPE))
        {
            resp.decode()?
        } else {
            SearchV2Results {
                results: Vec::new(),
                error_list: Vec::new(),
            }
        };

        if resp.status.as_u16() != 200 {
            // v2 may not be available on some proxies
            if resp.status.as_u16() == 404 {
                let verstr = resp.header("Snap-Store-Version").unwrap_or_default();
                match verstr.parse::<u32>() {
                    Ok(ver) if ver < 20 => return self.find_v1(search, user).await,
                    Ok(_) => {}
                    Err(_) => debug!("bogus Snap-Store-Version header {verstr:?}"),
                }
            }
            if let Some(first) = search_data.error_list.first() {
                if search_data.error_list.len() > 1 {
                    warn!(
                        "unexpected number of errors ({}) when trying to search via {:?}",
                        search_data.error_list.len(),
                        resp.url.as_str()
                    );
                }
                return Err(translate_snap_action_error(
                    "",
                    "",
                    &first.code,
                    &first.message,
                    Vec::new(),
                ));
            }
            return Err(StoreError::unexpected_status("search", &resp));
        }

        if resp.content_type() != Some(JSON_CONTENT_TYPE) {
            return Err(StoreError::UnexpectedContentType {
                content_type: resp.content_type().unwrap_or_default().to_string(),
                url: resp.url.to_string(),
            });
        }

        let mut snaps: Vec<SnapInfo> = search_data
            .results
            .iter()
            .map(info_from_store_search_result)
            .collect();

        if let Err(err) = self.decorate_orders(&mut snaps, user).await {
            warn!("cannot get user orders: {err}");
        }
        self.extract_suggested_currency(&resp);

        Ok(snaps)
    }

    /// The v1 search fallback for older store proxies; the query is already
    /// validated by `find`.
    async fn find_v1(
        &self,
        search: &Search,
        user: Option<&UserCredentials>,
    ) -> Result<Vec<SnapInfo>, StoreError> {
        let search_term = search.query.trim();
        let fields = self.cfg.detail_fields.join(",");
        let mut query: Vec<(&str, &str)> = vec![("fields", &fields)];

        if search.private {
            query.push(("private", "true"));
        }
        if search.prefix {
            query.push(("name", search_term));
        } else {
            if !search.common_id.is_empty() {
                query.push(("common_id", &search.common_id));
            }
            if !search_term.is_empty() {
                query.push(("q", search_term));
            }
        }
        // category was "section" in v1
        if !search.category.is_empty() {
            query.push(("section", &search.category));
        }
        if !search.scope.is_empty() {
            query.push(("scope", &search.scope));
        }
        query.push((
            "confinement",
            if self.cfg.on_classic {
                "strict,classic"
            } else {
                "strict"
            },
        ));

        let url = self.endpoint_url(SEARCH_ENDPOINT, &query).await;
        let opts = RequestOptions::get(url);

        let (resp, search_data, _) = self
            .retry_request_decode::<SearchV1Results, serde_json::Value>(&opts, user)
            .await?;

        if resp.status.as_u16() != 200 {
            return Err(StoreError::unexpected_status("search", &resp));
        }
        if resp.content_type() != Some(HAL_JSON_CONTENT_TYPE) {
            return Err(StoreError::UnexpectedContentType {
                content_type: resp.content_type().unwrap_or_default().to_string(),
                url: resp.url.to_string(),
            });
        }

        let mut snaps: Vec<SnapInfo> = search_data
            .unwrap_or_default()
            .embedded
            .packages
            .iter()
            .map(info_from_remote)
            .collect();

        if let Err(err) = self.decorate_orders(&mut snaps, user).await {
            warn!("cannot get user orders: {err}");
        }
        self.extract_suggested_currency(&resp);

        Ok(snaps)
    }

    /// The list of available store sections.
    pub async fn sections(&self, user: Option<&UserCredentials>) -> Result<Vec<String>, StoreError> {
        let url = self.endpoint_url(SECTIONS_ENDPOINT, &[]).await;
        let opts = RequestOptions::get(url).device_auth_need(DeviceAuthNeed::CustomStoreOnly);

        let (resp, section_data, _) = self
            .retry_request_decode::<SectionResults, serde_json::Value>(&opts, user)
            .await?;

        if resp.status.as_u16() != 200 {
            return Err(StoreError::unexpected_status("sections", &resp));
        }
        if resp.content_type() != Some(HAL_JSON_CONTENT_TYPE) {
            return Err(StoreError::UnexpectedContentType {
                content_type: resp.content_type().unwrap_or_default().to_string(),
                url: resp.url.to_string(),
            });
        }

        Ok(section_data
            .unwrap_or_default()
            .embedded
            .sections
            .into_iter()
            .map(|s| s.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_query_chars_cover_denylist() {
        for c in r#"+=&|><!(){}[]^"~*?:\/"#.chars() {
            assert!(BAD_QUERY_CHARS.contains(&c), "missing {c:?}");
        }
        assert!(!BAD_QUERY_CHARS.contains(&'-'));
    }
}

//! Request descriptions and response plumbing for the store pipeline.
//!
//! A [`RequestOptions`] value describes one logical store request: method,
//! URL, negotiated content types, API level (which selects header names),
//! and how much device authentication it wants. The [`Store`] façade turns
//! it into signed HTTP traffic.
//!
//! [`Store`]: crate::store::Store

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::store::error::StoreError;

pub mod retry;

/// Default accept value for store requests.
pub const HAL_JSON_CONTENT_TYPE: &str = "application/hal+json";
/// For store endpoints that don't support HAL.
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiLevel {
    /// `api/v1` endpoints.
    V1,
    /// `v2` endpoints.
    V2,
}

impl ApiLevel {
    pub fn device_authorization_header(self) -> &'static str {
        match self {
            ApiLevel::V1 => "X-Device-Authorization",
            ApiLevel::V2 => "Snap-Device-Authorization",
        }
    }

    pub fn store_header(self) -> &'static str {
        match self {
            ApiLevel::V1 => "X-Ubuntu-Store",
            ApiLevel::V2 => "Snap-Device-Store",
        }
    }

    pub fn series_header(self) -> &'static str {
        match self {
            ApiLevel::V1 => "X-Ubuntu-Series",
            ApiLevel::V2 => "Snap-Device-Series",
        }
    }

    pub fn architecture_header(self) -> &'static str {
        match self {
            ApiLevel::V1 => "X-Ubuntu-Architecture",
            ApiLevel::V2 => "Snap-Device-Architecture",
        }
    }

    pub fn classic_header(self) -> &'static str {
        match self {
            ApiLevel::V1 => "X-Ubuntu-Classic",
            ApiLevel::V2 => "Snap-Classic",
        }
    }
}

/// How much the request wants device authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAuthNeed {
    /// Attach it whenever available.
    Preferred,
    /// Attach it only when talking to a custom store.
    CustomStoreOnly,
}

/// Parameters of one store request.
pub struct RequestOptions {
    pub method: Method,
    pub url: Url,
    pub accept: String,
    pub content_type: Option<String>,
    pub api_level: ApiLevel,
    pub device_auth_need: DeviceAuthNeed,
    pub data: Option<Vec<u8>>,
    pub extra_headers: Vec<(String, String)>,
    /// User agent of the client that asked for this operation, forwarded to
    /// the store alongside our own.
    pub client_user_agent: Option<String>,
}

impl RequestOptions {
    pub fn new(method: Method, url: Url) -> Self {
        RequestOptions {
            method,
            url,
            accept: HAL_JSON_CONTENT_TYPE.to_string(),
            content_type: None,
            api_level: ApiLevel::V1,
            device_auth_need: DeviceAuthNeed::Preferred,
            data: None,
            extra_headers: Vec::new(),
            client_user_agent: None,
        }
    }

    pub fn get(url: Url) -> Self {
        RequestOptions::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        RequestOptions::new(Method::POST, url)
    }

    pub fn accept(mut self, accept: &str) -> Self {
        self.accept = accept.to_string();
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn api_level(mut self, level: ApiLevel) -> Self {
        self.api_level = level;
        self
    }

    pub fn device_auth_need(mut self, need: DeviceAuthNeed) -> Self {
        self.device_auth_need = need;
        self
    }

    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.extra_headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// A fully read store response: status, headers and buffered body, plus the
/// request coordinates for error reporting.
pub struct StoreResponse {
    pub method: Method,
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl StoreResponse {
    pub async fn read(method: Method, resp: reqwest::Response) -> Result<Self, reqwest::Error> {
        let url = resp.url().clone();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        Ok(StoreResponse {
            method,
            url,
            status,
            headers,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
    }

    pub fn ok(&self) -> bool {
        self.status == StatusCode::OK || self.status == StatusCode::CREATED
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Decode the body into the success shape on 200/201, into the failure
    /// shape on other statuses with a non-empty body.
    pub fn decode_body<S: DeserializeOwned, F: DeserializeOwned>(
        &self,
    ) -> Result<(Option<S>, Option<F>), StoreError> {
        if self.ok() {
            Ok((Some(self.decode()?), None))
        } else if self.body.is_empty() {
            Ok((None, None))
        } else {
            Ok((None, Some(self.decode()?)))
        }
    }
}

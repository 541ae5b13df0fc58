//! Streaming ingestion of the names catalog.
//!
//! The catalog response is far too large to buffer, so it is decoded
//! package by package straight off the wire: the response stream is bridged
//! into a blocking JSON reader whose visitor emits each package as soon as
//! it parses.

use std::io::Write;

use futures::StreamExt;
use serde::de::{DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::debug;

use crate::client::retry::{should_retry_error, should_retry_status, DEFAULT_RETRY_STRATEGY};
use crate::client::{DeviceAuthNeed, RequestOptions};
use crate::store::error::StoreError;
use crate::store::{Store, COMMANDS_ENDPOINT};
use crate::types::join_snap_app;

/// Receives each catalog package with its command names.
pub trait SnapAdder: Send {
    fn add_snap(
        &mut self,
        snap_name: &str,
        version: &str,
        summary: &str,
        commands: &[String],
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct Alias {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct CatalogItem {
    #[serde(default, rename = "package_name")]
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    aliases: Vec<Alias>,
    #[serde(default)]
    apps: Vec<String>,
}

struct CatalogSink<'a> {
    names: &'a mut dyn Write,
    adder: &'a mut dyn SnapAdder,
}

impl CatalogSink<'_> {
    fn emit(&mut self, item: CatalogItem) -> Result<(), String> {
        if item.name.is_empty() {
            return Ok(());
        }
        writeln!(self.names, "{}", item.name).map_err(|e| e.to_string())?;
        if item.apps.is_empty() {
            return Ok(());
        }
        let mut commands = Vec::with_capacity(item.aliases.len() + item.apps.len());
        for alias in &item.aliases {
            commands.push(alias.name.clone());
        }
        for app in &item.apps {
            commands.push(join_snap_app(&item.name, app));
        }
        self.adder
            .add_snap(&item.name, &item.version, &item.summary, &commands)
            .map_err(|e| e.to_string())
    }
}

struct RootSeed<'s, 'a>(&'s mut CatalogSink<'a>);

impl<'de> DeserializeSeed<'de> for RootSeed<'_, '_> {
    type Value = bool;

    fn deserialize<D: serde::Deserializer<'de>>(self, deserializer: D) -> Result<bool, D::Error> {
        deserializer.deserialize_map(RootVisitor(self.0))
    }
}

struct RootVisitor<'s, 'a>(&'s mut CatalogSink<'a>);

impl<'de> Visitor<'de> for RootVisitor<'_, '_> {
    type Value = bool;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a catalog object")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> Result<bool, M::Error> {
        let mut found = false;
        while let Some(key) = map.next_key::<String>()? {
            if key == "_embedded" {
                found = map.next_value_seed(EmbeddedSeed(&mut *self.0))?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(found)
    }
}

struct EmbeddedSeed<'s, 'a>(&'s mut CatalogSink<'a>);

impl<'de> DeserializeSeed<'de> for EmbeddedSeed<'_, '_> {
    type Value = bool;

    fn deserialize<D: serde::Deserializer<'de>>(self, deserializer: D) -> Result<bool, D::Error> {
        deserializer.deserialize_map(EmbeddedVisitor(self.0))
    }
}

struct EmbeddedVisitor<'s, 'a>(&'s mut CatalogSink<'a>);

impl<'de> Visitor<'de> for EmbeddedVisitor<'_, '_> {
    type Value = bool;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("an _embedded object")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> Result<bool, M::Error> {
        let mut found = false;
        while let Some(key) = map.next_key::<String>()? {
            if key == "clickindex:package" {
                map.next_value_seed(PackagesSeed(&mut *self.0))?;
                found = true;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(found)
    }
}

struct PackagesSeed<'s, 'a>(&'s mut CatalogSink<'a>);

impl<'de> DeserializeSeed<'de> for PackagesSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: serde::Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(PackagesVisitor(self.0))
    }
}

struct PackagesVisitor<'s, 'a>(&'s mut CatalogSink<'a>);

impl<'de> Visitor<'de> for PackagesVisitor<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a package array")
    }

    fn visit_seq<S: SeqAccess<'de>>(self, mut seq: S) -> Result<(), S::Error> {
        while let Some(item) = seq.next_element::<CatalogItem>()? {
            self.0.emit(item).map_err(serde::de::Error::custom)?;
        }
        Ok(())
    }
}

/// Decode the catalog from `reader`, writing package names to `names` and
/// feeding command data to `adder`, without ever holding the whole document.
pub(crate) fn decode_catalog(
    reader: impl std::io::Read,
    names: &mut dyn Write,
    adder: &mut dyn SnapAdder,
) -> Result<(), StoreError> {
    let mut sink = CatalogSink { names, adder };
    let mut de = serde_json::Deserializer::from_reader(reader);
    let found = RootSeed(&mut sink)
        .deserialize(&mut de)
        .map_err(|e| StoreError::Protocol(format!("decode new commands catalog: {e}")))?;
    if !found {
        return Err(StoreError::Protocol(
            "decode new commands catalog: bad catalog preamble".to_string(),
        ));
    }
    Ok(())
}

impl Store {
    /// Stream the commands catalog: package names into `names`, alias and
    /// `snap.app` command names into `adder`. Both are handed back when the
    /// ingest completes.
    pub async fn write_catalogs<W, A>(&self, names: W, adder: A) -> Result<(W, A), StoreError>
    where
        W: Write + Send + 'static,
        A: SnapAdder + 'static,
    {
        let confinement = if self.cfg.on_classic {
            "strict,classic"
        } else {
            "strict"
        };
        let url = self
            .endpoint_url(COMMANDS_ENDPOINT, &[("confinement", confinement)])
            .await;
        let opts = RequestOptions::get(url).device_auth_need(DeviceAuthNeed::CustomStoreOnly);
        // a separate untimed client: the body takes as long as it takes
        let client = self.new_untimed_client()?;

        let mut attempts = DEFAULT_RETRY_STRATEGY.attempts();
        let mut last_err = None;
        while attempts.next().await {
            if attempts.current() > 1 {
                debug!("retrying catalog fetch (attempt {})", attempts.current());
            }
            let resp = match self.do_request(&client, &opts, None).await {
                Ok(resp) => resp,
                Err(StoreError::Http(err)) if should_retry_error(&err) && attempts.more() => {
                    last_err = Some(StoreError::Http(err));
                    continue;
                }
                Err(err) => return Err(err),
            };
            if should_retry_status(resp.status()) && attempts.more() {
                last_err = Some(StoreError::from_status(
                    "refresh commands catalog",
                    resp.status(),
                    &opts.method,
                    resp.url(),
                    None,
                ));
                continue;
            }
            if resp.status().as_u16() != 200 {
                return Err(StoreError::from_status(
                    "refresh commands catalog",
                    resp.status(),
                    &opts.method,
                    resp.url(),
                    None,
                ));
            }

            let stream = resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other));
            let bridge = SyncIoBridge::new(StreamReader::new(Box::pin(stream)));
            let (mut names, mut adder) = (names, adder);
            let (names, adder, result) = tokio::task::spawn_blocking(move || {
                let result = decode_catalog(bridge, &mut names, &mut adder);
                (names, adder, result)
            })
            .await
            .map_err(|err| StoreError::Internal(format!("catalog decoder panicked: {err}")))?;
            result?;
            return Ok((names, adder));
        }
        Err(last_err.unwrap_or_else(|| StoreError::Internal("catalog retries exhausted".into())))
    }
}

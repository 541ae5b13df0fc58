//! Wire-format snap metadata and the caller-facing [`SnapInfo`] model.
//!
//! The v2 endpoints (info, find, refresh) all speak the same `snap` object
//! shape; the v1 search fallback uses an older flat shape with snake_case
//! keys. Both decode into [`SnapInfo`].

use std::collections::HashMap;

use serde::Deserialize;

use crate::types::{Epoch, Revision};

/// Where and how to fetch a snap blob, plus any applicable binary delta.
#[derive(Debug, Clone, Default)]
pub struct DownloadInfo {
    pub download_url: String,
    pub anon_download_url: String,
    pub size: u64,
    pub sha3_384: String,
    pub deltas: Vec<DeltaInfo>,
}

/// A single binary delta between two revisions.
#[derive(Debug, Clone)]
pub struct DeltaInfo {
    pub from_revision: i32,
    pub to_revision: i32,
    pub format: String,
    pub download_url: String,
    pub anon_download_url: String,
    pub size: u64,
    pub sha3_384: String,
}

/// The publisher account as reported by the store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreAccount {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, rename = "display-name")]
    pub display_name: String,
    #[serde(default)]
    pub validation: String,
}

/// Decoded snap metadata handed back to callers.
#[derive(Debug, Clone, Default)]
pub struct SnapInfo {
    pub name: String,
    /// Local instance key, filled in by the snap-action engine for
    /// parallel-install results; never comes from the wire.
    pub instance_key: String,
    pub snap_id: String,
    pub revision: Revision,
    pub version: String,
    pub epoch: Epoch,
    /// Effective channel the data was resolved from.
    pub channel: String,
    pub snap_type: String,
    pub base: String,
    pub confinement: String,
    pub architectures: Vec<String>,
    pub title: String,
    pub summary: String,
    pub description: String,
    pub license: String,
    pub contact: String,
    pub website: String,
    pub private: bool,
    pub publisher: StoreAccount,
    pub common_ids: Vec<String>,
    /// Price per currency; empty for free snaps.
    pub prices: HashMap<String, String>,
    /// True when the snap is non-free and the user has not bought it.
    pub must_buy: bool,
    pub download: DownloadInfo,
}

impl SnapInfo {
    pub fn paid(&self) -> bool {
        !self.prices.is_empty()
    }

    pub fn instance_name(&self) -> String {
        if self.instance_key.is_empty() {
            self.name.clone()
        } else {
            format!("{}_{}", self.name, self.instance_key)
        }
    }
}

// v2 wire shapes

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct StoreSnapDelta {
    #[serde(default)]
    pub format: String,
    #[serde(default, rename = "sha3-384")]
    pub sha3_384: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub source: i32,
    #[serde(default)]
    pub target: i32,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct StoreSnapDownload {
    #[serde(default, rename = "sha3-384")]
    pub sha3_384: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub deltas: Vec<StoreSnapDelta>,
}

/// The `snap` object of the v2 endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct StoreSnap {
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub base: String,
    #[serde(default)]
    pub confinement: String,
    #[serde(default)]
    pub contact: String,
    #[serde(default, rename = "common-ids")]
    pub common_ids: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub download: StoreSnapDownload,
    #[serde(default)]
    pub epoch: Epoch,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub prices: HashMap<String, String>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub publisher: StoreAccount,
    #[serde(default)]
    pub revision: i32,
    #[serde(default, rename = "snap-id")]
    pub snap_id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "type")]
    pub snap_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub website: String,
}

/// Field projections: every `StoreSnap` key the client understands.
pub(crate) const INFO_FIELDS: &[&str] = &[
    "architectures",
    "base",
    "confinement",
    "contact",
    "common-ids",
    "description",
    "download",
    "epoch",
    "license",
    "name",
    "prices",
    "private",
    "publisher",
    "revision",
    "snap-id",
    "summary",
    "title",
    "type",
    "version",
    "website",
];

/// Find drops the per-revision keys the search response cannot provide and
/// asks for the effective channel instead.
pub(crate) const FIND_FIELDS: &[&str] = &[
    "base",
    "confinement",
    "contact",
    "common-ids",
    "description",
    "download",
    "license",
    "prices",
    "private",
    "publisher",
    "revision",
    "summary",
    "title",
    "type",
    "version",
    "website",
    "channel",
];

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct StoreChannel {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub risk: String,
    #[serde(default)]
    pub track: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct StoreInfoChannelSnap {
    #[serde(flatten)]
    pub snap: StoreSnap,
    #[serde(default)]
    pub channel: StoreChannel,
}

/// Response of `v2/snaps/info/{name}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct StoreInfo {
    #[serde(default, rename = "channel-map")]
    pub channel_map: Vec<StoreInfoChannelSnap>,
    #[serde(default)]
    pub snap: StoreSnap,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "snap-id")]
    pub snap_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct StoreSearchChannelSnap {
    #[serde(flatten)]
    pub snap: StoreSnap,
    #[serde(default)]
    pub channel: String,
}

/// One result of `v2/snaps/find`.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct StoreSearchResult {
    #[serde(default)]
    pub revision: StoreSearchChannelSnap,
    #[serde(default)]
    pub snap: StoreSnap,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "snap-id")]
    pub snap_id: String,
}

fn download_info_from_store(download: &StoreSnapDownload) -> DownloadInfo {
    DownloadInfo {
        download_url: download.url.clone(),
        anon_download_url: String::new(),
        size: download.size,
        sha3_384: download.sha3_384.clone(),
        deltas: download
            .deltas
            .iter()
            .map(|d| DeltaInfo {
                from_revision: d.source,
                to_revision: d.target,
                format: d.format.clone(),
                download_url: d.url.clone(),
                anon_download_url: String::new(),
                size: d.size,
                sha3_384: d.sha3_384.clone(),
            })
            .collect(),
    }
}

pub(crate) fn info_from_store_snap(snap: &StoreSnap) -> SnapInfo {
    SnapInfo {
        name: snap.name.clone(),
        instance_key: String::new(),
        snap_id: snap.snap_id.clone(),
        revision: Revision(snap.revision),
        version: snap.version.clone(),
        epoch: snap.epoch.clone(),
        channel: String::new(),
        snap_type: snap.snap_type.clone(),
        base: snap.base.clone(),
        confinement: snap.confinement.clone(),
        architectures: snap.architectures.clone(),
        title: snap.title.clone(),
        summary: snap.summary.clone(),
        description: snap.description.clone(),
        license: snap.license.clone(),
        contact: snap.contact.clone(),
        website: snap.website.clone(),
        private: snap.private,
        publisher: snap.publisher.clone(),
        common_ids: snap.common_ids.clone(),
        prices: snap.prices.clone(),
        must_buy: false,
        download: download_info_from_store(&snap.download),
    }
}

/// Merge the `snap` object of an info response with its first channel-map
/// entry, which carries the revision-specific data for the resolved channel.
pub(crate) fn info_from_store_info(info: &StoreInfo) -> SnapInfo {
    let mut si = info_from_store_snap(&info.snap);
    if si.name.is_empty() {
        si.name = info.name.clone();
    }
    if si.snap_id.is_empty() {
        si.snap_id = info.snap_id.clone();
    }
    if let Some(entry) = info.channel_map.first() {
        si.revision = Revision(entry.snap.revision);
        si.version = entry.snap.version.clone();
        si.epoch = entry.snap.epoch.clone();
        si.confinement = entry.snap.confinement.clone();
        si.download = download_info_from_store(&entry.snap.download);
        si.channel = if entry.channel.name.is_empty() {
            format!("{}/{}", entry.channel.track, entry.channel.risk)
        } else {
            entry.channel.name.clone()
        };
    }
    si
}

pub(crate) fn info_from_store_search_result(res: &StoreSearchResult) -> SnapInfo {
    let mut si = info_from_store_snap(&res.snap);
    if si.name.is_empty() {
        si.name = res.name.clone();
    }
    if si.snap_id.is_empty() {
        si.snap_id = res.snap_id.clone();
    }
    // per-revision data lives under "revision" in search results
    si.revision = Revision(res.revision.snap.revision);
    if !res.revision.snap.version.is_empty() {
        si.version = res.revision.snap.version.clone();
    }
    if !res.revision.snap.confinement.is_empty() {
        si.confinement = res.revision.snap.confinement.clone();
    }
    if !res.revision.snap.download.url.is_empty() {
        si.download = download_info_from_store(&res.revision.snap.download);
    }
    si.channel = res.revision.channel.clone();
    si
}

// v1 wire shape, kept for the search fallback against old proxies

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SnapDetails {
    #[serde(default, rename = "architecture")]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub anon_download_url: String,
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub download_sha3_384: String,
    #[serde(default, rename = "binary_filesize")]
    pub download_size: u64,
    #[serde(default)]
    pub confinement: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub epoch: Epoch,
    #[serde(default, rename = "package_name")]
    pub name: String,
    #[serde(default)]
    pub prices: HashMap<String, f64>,
    #[serde(default)]
    pub publisher: String,
    #[serde(default, rename = "developer_id")]
    pub developer_id: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub revision: i32,
    #[serde(default)]
    pub snap_id: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "support_url")]
    pub support_url: String,
    #[serde(default, rename = "content")]
    pub snap_type: String,
}

pub(crate) const DETAIL_FIELDS: &[&str] = &[
    "architecture",
    "channel",
    "anon_download_url",
    "download_url",
    "download_sha3_384",
    "binary_filesize",
    "confinement",
    "description",
    "summary",
    "title",
    "epoch",
    "package_name",
    "prices",
    "publisher",
    "developer_id",
    "private",
    "revision",
    "snap_id",
    "license",
    "version",
    "support_url",
    "content",
];

pub(crate) fn info_from_remote(details: &SnapDetails) -> SnapInfo {
    SnapInfo {
        name: details.name.clone(),
        instance_key: String::new(),
        snap_id: details.snap_id.clone(),
        revision: Revision(details.revision),
        version: details.version.clone(),
        epoch: details.epoch.clone(),
        channel: details.channel.clone(),
        snap_type: details.snap_type.clone(),
        base: String::new(),
        confinement: details.confinement.clone(),
        architectures: details.architectures.clone(),
        title: details.title.clone(),
        summary: details.summary.clone(),
        description: details.description.clone(),
        license: details.license.clone(),
        contact: details.support_url.clone(),
        website: String::new(),
        private: details.private,
        publisher: StoreAccount {
            id: details.developer_id.clone(),
            username: details.publisher.clone(),
            display_name: String::new(),
            validation: String::new(),
        },
        common_ids: Vec::new(),
        prices: details
            .prices
            .iter()
            .map(|(currency, amount)| (currency.clone(), format!("{amount:.2}")))
            .collect(),
        must_buy: false,
        download: DownloadInfo {
            download_url: details.download_url.clone(),
            anon_download_url: details.anon_download_url.clone(),
            size: details.download_size,
            sha3_384: details.download_sha3_384.clone(),
            deltas: Vec::new(),
        },
    }
}

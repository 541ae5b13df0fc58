//! The batched install/refresh protocol.
//!
//! One request carries the context (currently installed snaps) and the
//! requested actions; the response is walked result by result, partitioning
//! successes from per-action failures. Local instance keys never travel in
//! the clear: they are hashed together with the snap id and a per-request
//! salt.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::auth::UserCredentials;
use crate::client::{ApiLevel, RequestOptions, JSON_CONTENT_TYPE};
use crate::store::error::{SnapActionError, SnapRelease, StoreError};
use crate::store::{Store, AuthRefreshNeed, COHORTS_ENDPOINT, SNAP_ACTION_ENDPOINT};
use crate::types::info::{info_from_store_snap, StoreSnap};
use crate::types::{split_instance_name, Epoch, Revision, SnapInfo};

/// Options applying to a whole snap-action batch.
#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    /// The refresh is managed via snapd-control.
    pub refresh_managed: bool,
    pub is_auto_refresh: bool,
    /// Salt for the privacy-preserving instance keys.
    pub privacy_key: String,
}

/// An installed snap described to the store as refresh context.
#[derive(Debug, Clone, Default)]
pub struct CurrentSnap {
    pub instance_name: String,
    pub snap_id: String,
    pub revision: Revision,
    pub tracking_channel: String,
    pub refreshed_date: Option<DateTime<Utc>>,
    pub ignore_validation: bool,
    /// Revisions the local policy refuses to move to.
    pub block: Vec<Revision>,
    pub epoch: Epoch,
    pub cohort_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Install,
    Refresh,
    Download,
}

impl ActionKind {
    fn as_str(self) -> &'static str {
        match self {
            ActionKind::Install => "install",
            ActionKind::Refresh => "refresh",
            ActionKind::Download => "download",
        }
    }
}

/// Validation stance of a single action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    IgnoreValidation,
    EnforceValidation,
}

/// One requested operation in a snap-action batch.
#[derive(Debug, Clone)]
pub struct SnapAction {
    pub action: ActionKind,
    pub instance_name: String,
    pub snap_id: String,
    pub channel: String,
    pub revision: Revision,
    pub cohort_key: String,
    pub validation: Option<ValidationMode>,
    pub epoch: Epoch,
}

impl SnapAction {
    pub fn new(action: ActionKind, instance_name: impl Into<String>) -> Self {
        SnapAction {
            action,
            instance_name: instance_name.into(),
            snap_id: String::new(),
            channel: String::new(),
            revision: Revision::unset(),
            cohort_key: String::new(),
            validation: None,
            epoch: Epoch::default(),
        }
    }
}

/// The non-error outcome of a single action.
#[derive(Debug, Clone)]
pub struct SnapActionResult {
    pub info: SnapInfo,
    pub redirect_channel: String,
}

#[derive(Serialize)]
struct CurrentSnapJson<'a> {
    #[serde(rename = "snap-id")]
    snap_id: &'a str,
    #[serde(rename = "instance-key")]
    instance_key: String,
    revision: i32,
    #[serde(rename = "tracking-channel")]
    tracking_channel: &'a str,
    epoch: &'a Epoch,
    #[serde(rename = "refreshed-date", skip_serializing_if = "Option::is_none")]
    refreshed_date: Option<&'a DateTime<Utc>>,
    #[serde(rename = "ignore-validation", skip_serializing_if = "is_false")]
    ignore_validation: bool,
    #[serde(rename = "cohort-key", skip_serializing_if = "str::is_empty")]
    cohort_key: &'a str,
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Serialize)]
struct SnapActionJson<'a> {
    action: &'static str,
    #[serde(rename = "instance-key")]
    instance_key: String,
    #[serde(skip_serializing_if = "str::is_empty")]
    name: &'a str,
    #[serde(rename = "snap-id", skip_serializing_if = "str::is_empty")]
    snap_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    channel: &'a str,
    #[serde(skip_serializing_if = "Revision::is_unset")]
    revision: Revision,
    #[serde(rename = "cohort-key", skip_serializing_if = "str::is_empty")]
    cohort_key: &'a str,
    #[serde(rename = "ignore-validation", skip_serializing_if = "Option::is_none")]
    ignore_validation: Option<bool>,
    // The store needs an epoch (even if null) for install and download, to
    // know the client handles epochs at all. Refresh sends nothing: the
    // snap in the context already carries it. `Some(None)` is the JSON
    // null, `None` omits the field.
    #[serde(skip_serializing_if = "Option::is_none")]
    epoch: Option<Option<&'a Epoch>>,
}

#[derive(Serialize)]
struct SnapActionRequest<'a> {
    context: Vec<CurrentSnapJson<'a>>,
    actions: Vec<SnapActionJson<'a>>,
    fields: &'a [String],
}

#[derive(Debug, Default, Deserialize)]
struct SnapActionResultList {
    #[serde(default)]
    results: Vec<SnapActionResultJson>,
    #[serde(default, rename = "error-list")]
    error_list: Vec<ErrorListEntry>,
}

#[derive(Debug, Deserialize)]
struct ErrorListEntry {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct SnapActionResultJson {
    #[serde(default)]
    result: String,
    #[serde(default, rename = "instance-key")]
    instance_key: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    snap: StoreSnap,
    #[serde(default, rename = "effective-channel")]
    effective_channel: String,
    #[serde(default, rename = "redirect-channel")]
    redirect_channel: String,
    #[serde(default)]
    error: ResultError,
}

#[derive(Debug, Default, Deserialize)]
struct ResultError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    extra: ResultErrorExtra,
}

#[derive(Debug, Default, Deserialize)]
struct ResultErrorExtra {
    #[serde(default)]
    releases: Vec<SnapRelease>,
}

/// Translate a store error code into the typed taxonomy.
pub(crate) fn translate_snap_action_error(
    action: &str,
    channel: &str,
    code: &str,
    message: &str,
    releases: Vec<SnapRelease>,
) -> StoreError {
    match code {
        "revision-not-found" => StoreError::RevisionNotAvailable {
            action: action.to_string(),
            channel: channel.to_string(),
            releases,
        },
        "id-not-found" | "name-not-found" => StoreError::SnapNotFound,
        "user-authorization-needs-refresh" => StoreError::UserAuthorizationNeedsRefresh,
        "device-authorization-needs-refresh" => StoreError::DeviceAuthorizationNeedsRefresh,
        _ => StoreError::Protocol(message.to_string()),
    }
}

/// Derive the opaque wire key for a context snap. Plain instances use the
/// raw snap id; parallel installs hash the local key so it never leaves the
/// machine.
fn gen_instance_key(cur: &CurrentSnap, salt: &str) -> Result<String, StoreError> {
    let (_, instance_key) = split_instance_name(&cur.instance_name);
    let Some(instance_key) = instance_key else {
        return Ok(cur.snap_id.clone());
    };
    if salt.is_empty() {
        return Err(StoreError::Internal(
            "request salt not provided".to_string(),
        ));
    }
    let mut h = Sha256::new();
    h.update(cur.snap_id.as_bytes());
    h.update(instance_key.as_bytes());
    h.update(salt.as_bytes());
    let enc = URL_SAFE_NO_PAD.encode(h.finalize());
    Ok(format!("{}:{}", cur.snap_id, enc))
}

impl Store {
    /// Query the store for the given install/refresh/download actions with
    /// the context of currently installed snaps. An overall-successful
    /// response with per-snap errors yields both the good results and a
    /// [`SnapActionError`].
    pub async fn snap_action(
        &self,
        current_snaps: &[CurrentSnap],
        actions: &[SnapAction],
        user: Option<&UserCredentials>,
        opts: &RefreshOptions,
    ) -> Result<Vec<SnapActionResult>, StoreError> {
        if current_snaps.is_empty() && actions.is_empty() {
            return Err(SnapActionError {
                no_results: true,
                ..Default::default()
            }
            .into());
        }

        let mut auth_refreshes = 0;
        loop {
            let result = self.snap_action_once(current_snaps, actions, user, opts).await;

            if let Err(StoreError::SnapAction(sa_err)) = &result {
                if auth_refreshes < 2 && !sa_err.other.is_empty() {
                    let mut need = AuthRefreshNeed::default();
                    for other in &sa_err.other {
                        match other {
                            StoreError::UserAuthorizationNeedsRefresh => need.user = true,
                            StoreError::DeviceAuthorizationNeedsRefresh => need.device = true,
                            _ => {}
                        }
                    }
                    if need.needed() {
                        if let Err(err) = self.refresh_auth(user, need).await {
                            // best effort
                            debug!("cannot refresh soft-expired authorisation: {err}");
                        }
                        auth_refreshes += 1;
                        continue;
                    }
                }
            }

            return result;
        }
    }

    async fn snap_action_once(
        &self,
        current_snaps: &[CurrentSnap],
        actions: &[SnapAction],
        user: Option<&UserCredentials>,
        opts: &RefreshOptions,
    ) -> Result<Vec<SnapActionResult>, StoreError> {
        let salt = &opts.privacy_key;

        let mut cur_snaps: HashMap<String, &CurrentSnap> =
            HashMap::with_capacity(current_snaps.len());
        let mut instance_name_to_key: HashMap<&str, String> =
            HashMap::with_capacity(current_snaps.len());
        let mut context = Vec::with_capacity(current_snaps.len());
        for cur in current_snaps {
            if cur.snap_id.is_empty() || cur.instance_name.is_empty() || cur.revision.is_unset() {
                return Err(StoreError::Internal(
                    "invalid current snap information".to_string(),
                ));
            }
            let instance_key = gen_instance_key(cur, salt)?;
            cur_snaps.insert(instance_key.clone(), cur);
            instance_name_to_key.insert(&cur.instance_name, instance_key.clone());

            context.push(CurrentSnapJson {
                snap_id: &cur.snap_id,
                instance_key,
                revision: cur.revision.0,
                tracking_channel: if cur.tracking_channel.is_empty() {
                    "stable"
                } else {
                    &cur.tracking_channel
                },
                epoch: &cur.epoch,
                refreshed_date: cur.refreshed_date.as_ref(),
                ignore_validation: cur.ignore_validation,
                cohort_key: &cur.cohort_key,
            });
        }

        let mut install_num = 0;
        let mut download_num = 0;
        let mut installs: HashMap<String, &SnapAction> = HashMap::new();
        let mut downloads: HashMap<String, &SnapAction> = HashMap::new();
        let mut refreshes: HashMap<String, &SnapAction> = HashMap::new();
        let mut action_jsons = Vec::with_capacity(actions.len());
        for action in actions {
            if action.instance_name.is_empty() {
                return Err(StoreError::Internal(
                    "action without instance name".to_string(),
                ));
            }
            let ignore_validation = action.validation.map(|v| v == ValidationMode::IgnoreValidation);

            let instance_key = match action.action {
                ActionKind::Install => {
                    install_num += 1;
                    let key = format!("install-{install_num}");
                    installs.insert(key.clone(), action);
                    key
                }
                ActionKind::Download => {
                    download_num += 1;
                    let key = format!("download-{download_num}");
                    downloads.insert(key.clone(), action);
                    if split_instance_name(&action.instance_name).1.is_some() {
                        return Err(StoreError::Internal(format!(
                            "unsupported download with instance name {:?}",
                            action.instance_name
                        )));
                    }
                    key
                }
                ActionKind::Refresh => {
                    let key = instance_name_to_key
                        .get(action.instance_name.as_str())
                        .cloned()
                        .unwrap_or_default();
                    refreshes.insert(key.clone(), action);
                    key
                }
            };

            // a pinned revision overrides any channel preference
            let channel = if action.revision.is_unset() {
                action.channel.as_str()
            } else {
                ""
            };

            let mut json = SnapActionJson {
                action: action.action.as_str(),
                instance_key,
                name: "",
                snap_id: &action.snap_id,
                channel,
                revision: action.revision,
                cohort_key: &action.cohort_key,
                ignore_validation,
                epoch: None,
            };
            if action.action != ActionKind::Refresh {
                json.name = crate::types::instance_snap(&action.instance_name);
                json.epoch = if action.epoch.is_zero() {
                    Some(None)
                } else {
                    // the amend case
                    Some(Some(&action.epoch))
                };
            }
            action_jsons.push(json);
        }

        let body = serde_json::to_vec(&SnapActionRequest {
            context,
            actions: action_jsons,
            fields: &self.cfg.info_fields,
        })?;

        let url = self.endpoint_url(SNAP_ACTION_ENDPOINT, &[]).await;
        let mut req = RequestOptions::post(url)
            .accept(JSON_CONTENT_TYPE)
            .content_type(JSON_CONTENT_TYPE)
            .api_level(ApiLevel::V2)
            .data(body);

        if opts.is_auto_refresh {
            debug!("auto-refresh; adding header Snap-Refresh-Reason: scheduled");
            req = req.header("Snap-Refresh-Reason", "scheduled");
        }
        if self.deltas_enabled && self.delta_applier.available() {
            debug!(
                "deltas enabled, adding header Snap-Accept-Delta-Format: {}",
                self.cfg.delta_format
            );
            req = req.header("Snap-Accept-Delta-Format", &self.cfg.delta_format);
        }
        if opts.refresh_managed {
            req = req.header("Snap-Refresh-Managed", "true");
        }

        let (resp, results, _) = self
            .retry_request_decode::<SnapActionResultList, serde_json::Value>(&req, user)
            .await?;
        if resp.status.as_u16() != 200 {
            return Err(StoreError::unexpected_status(
                "query the store for updates",
                &resp,
            ));
        }
        self.extract_suggested_currency(&resp);
        let results = results.unwrap_or_default();

        let mut sa_err = SnapActionError::default();
        let mut sars = Vec::new();
        for res in &results.results {
            if res.result == "error" {
                self.file_action_error(
                    res,
                    &installs,
                    &downloads,
                    &refreshes,
                    &cur_snaps,
                    &mut sa_err,
                );
                continue;
            }
            let mut info = info_from_store_snap(&res.snap);
            info.channel = res.effective_channel.clone();

            let mut instance_name = String::new();
            if res.result == "refresh" {
                let Some(cur) = cur_snaps.get(res.instance_key.as_str()) else {
                    return Err(StoreError::Protocol(
                        "unexpected invalid install/refresh API result: unexpected refresh"
                            .to_string(),
                    ));
                };
                let rrev = Revision(res.snap.revision);
                if rrev == cur.revision || cur.block.contains(&rrev) {
                    sa_err
                        .refresh
                        .insert(cur.instance_name.clone(), StoreError::NoUpdateAvailable);
                    continue;
                }
                instance_name = cur.instance_name.clone();
            } else if res.result == "install" {
                if let Some(action) = installs.get(res.instance_key.as_str()) {
                    instance_name = action.instance_name.clone();
                }
            }

            if res.result != "download" && instance_name.is_empty() {
                return Err(StoreError::Protocol(format!(
                    "unexpected invalid install/refresh API result: unexpected instance-key {:?}",
                    res.instance_key
                )));
            }

            if let (_, Some(key)) = split_instance_name(&instance_name) {
                info.instance_key = key.to_string();
            }

            sars.push(SnapActionResult {
                info,
                redirect_channel: res.redirect_channel.clone(),
            });
        }

        for entry in &results.error_list {
            sa_err.other.push(translate_snap_action_error(
                "",
                "",
                &entry.code,
                &entry.message,
                Vec::new(),
            ));
        }
        sa_err.no_results = results.results.is_empty();

        if !sa_err.is_empty() {
            // the good results still ride along inside the error
            sa_err.results = sars;
            return Err(sa_err.into());
        }

        Ok(sars)
    }

    fn file_action_error(
        &self,
        res: &SnapActionResultJson,
        installs: &HashMap<String, &SnapAction>,
        downloads: &HashMap<String, &SnapAction>,
        refreshes: &HashMap<String, &SnapAction>,
        cur_snaps: &HashMap<String, &CurrentSnap>,
        sa_err: &mut SnapActionError,
    ) {
        let releases = res.error.extra.releases.clone();
        if let Some(action) = installs.get(res.instance_key.as_str()) {
            if !res.name.is_empty() {
                sa_err.install.insert(
                    action.instance_name.clone(),
                    translate_snap_action_error(
                        "install",
                        &action.channel,
                        &res.error.code,
                        &res.error.message,
                        releases,
                    ),
                );
                return;
            }
        } else if let Some(action) = downloads.get(res.instance_key.as_str()) {
            if !res.name.is_empty() {
                sa_err.download.insert(
                    res.name.clone(),
                    translate_snap_action_error(
                        "download",
                        &action.channel,
                        &res.error.code,
                        &res.error.message,
                        releases,
                    ),
                );
                return;
            }
        } else if let Some(cur) = cur_snaps.get(res.instance_key.as_str()) {
            match refreshes.get(res.instance_key.as_str()) {
                Some(action) => {
                    let channel = if action.channel.is_empty() && action.revision.is_unset() {
                        &cur.tracking_channel
                    } else {
                        &action.channel
                    };
                    sa_err.refresh.insert(
                        cur.instance_name.clone(),
                        translate_snap_action_error(
                            "refresh",
                            channel,
                            &res.error.code,
                            &res.error.message,
                            releases,
                        ),
                    );
                }
                None => {
                    // error for a context snap that was not part of an action
                    debug!(
                        "unexpected error for snap {:?}, instance key {:?}: [{}] {}",
                        cur.instance_name, res.instance_key, res.error.code, res.error.message
                    );
                    sa_err.other.push(translate_snap_action_error(
                        "",
                        "",
                        &res.error.code,
                        &format!("snap {:?}: {}", cur.instance_name, res.error.message),
                        Vec::new(),
                    ));
                }
            }
            return;
        }
        // nameless install/download errors and unknown instance keys
        sa_err.other.push(translate_snap_action_error(
            "",
            "",
            &res.error.code,
            &res.error.message,
            Vec::new(),
        ));
    }

    /// Ask the store to create cohort keys for the given snaps.
    pub async fn create_cohorts(
        &self,
        snaps: &[String],
    ) -> Result<HashMap<String, String>, StoreError> {
        #[derive(Serialize)]
        struct CohortsRequest<'a> {
            snaps: &'a [String],
        }
        #[derive(Default, Deserialize)]
        struct CohortsResponse {
            #[serde(default, rename = "cohort-keys")]
            cohort_keys: HashMap<String, String>,
        }

        let body = serde_json::to_vec(&CohortsRequest { snaps })?;
        let url = self.endpoint_url(COHORTS_ENDPOINT, &[]).await;
        let req = RequestOptions::post(url)
            .api_level(ApiLevel::V2)
            .data(body);

        let (resp, remote, _) = self
            .retry_request_decode::<CohortsResponse, serde_json::Value>(&req, None)
            .await?;
        match resp.status.as_u16() {
            200 => {}
            404 => return Err(StoreError::SnapNotFound),
            _ => {
                return Err(StoreError::unexpected_status(
                    &format!("create cohorts for {}", snaps.join(", ")),
                    &resp,
                ))
            }
        }
        Ok(remote.unwrap_or_default().cohort_keys)
    }
}

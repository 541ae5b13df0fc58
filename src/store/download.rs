//! Resumable, hash-verified, rate-limited snap downloads.
//!
//! Downloads land next to their target as `.partial` files, resume from
//! whatever prefix is already on disk, and only move into place once the
//! SHA3-384 checks out. A cache hit skips the network entirely; an offered
//! binary delta is tried first and any delta failure falls back to the full
//! download.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use sha3::{Digest, Sha3_384};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::auth::UserCredentials;
use crate::client::retry::{should_retry_error, should_retry_status, DOWNLOAD_RETRY_STRATEGY};
use crate::client::RequestOptions;
use crate::store::error::StoreError;
use crate::store::Store;
use crate::types::DownloadInfo;

/// Download progress sink. Reporting is outside this crate's concern; the
/// null meter drops everything.
pub trait ProgressMeter: Send + Sync {
    fn start(&self, name: &str, total: u64);
    fn advance(&self, bytes: u64);
    fn finished(&self);
}

/// Discards all progress.
pub struct NullProgress;

impl ProgressMeter for NullProgress {
    fn start(&self, _name: &str, _total: u64) {}
    fn advance(&self, _bytes: u64) {}
    fn finished(&self) {}
}

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Bytes per second; zero means unlimited.
    pub rate_limit: u64,
    pub is_auto_refresh: bool,
    /// Keep a non-empty `.partial` around when the download fails.
    pub leave_partial_on_error: bool,
}

/// Token bucket applied to the response stream; bursts up to twice the
/// sustained rate.
struct TokenBucket {
    rate: f64,
    capacity: f64,
    available: f64,
    last: tokio::time::Instant,
}

impl TokenBucket {
    fn new(rate: u64) -> Self {
        TokenBucket {
            rate: rate as f64,
            capacity: (2 * rate) as f64,
            available: (2 * rate) as f64,
            last: tokio::time::Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.available = (self.available + elapsed * self.rate).min(self.capacity);
        self.last = now;
    }

    async fn throttle(&mut self, bytes: usize) {
        self.refill();
        let needed = bytes as f64;
        if self.available < needed {
            let wait = (needed - self.available) / self.rate;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            self.refill();
        }
        self.available -= needed;
    }
}

pub(crate) fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

pub(crate) async fn file_sha3_384(file: &mut File) -> Result<(String, u64), StoreError> {
    file.seek(SeekFrom::Start(0)).await?;
    let mut hasher = Sha3_384::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

impl Store {
    /// The `Snap-CDN` header value: the explicit opt-out wins, then cloud
    /// placement from the auth context; otherwise no header.
    pub(crate) async fn cdn_header(&self) -> Result<Option<String>, StoreError> {
        if self.no_cdn {
            return Ok(Some("none".to_string()));
        }
        let Some(ctx) = &self.auth_ctx else {
            return Ok(None);
        };
        let Some(cloud) = ctx.cloud_info().await? else {
            return Ok(None);
        };
        let mut params = vec![format!("cloud-name={:?}", cloud.name)];
        if !cloud.region.is_empty() {
            params.push(format!("region={:?}", cloud.region));
        }
        if !cloud.availability_zone.is_empty() {
            params.push(format!("availability-zone={:?}", cloud.availability_zone));
        }
        Ok(Some(params.join(" ")))
    }

    pub(crate) async fn download_req_opts(
        &self,
        url: reqwest::Url,
        opts: &DownloadOptions,
    ) -> Result<RequestOptions, StoreError> {
        let mut req = RequestOptions::get(url);
        if let Some(cdn) = self.cdn_header().await? {
            req = req.header("Snap-CDN", &cdn);
        }
        if opts.is_auto_refresh {
            req = req.header("Snap-Refresh-Reason", "scheduled");
        }
        Ok(req)
    }

    fn select_url<'a>(
        download_url: &'a str,
        anon_download_url: &'a str,
        auth_avail: bool,
    ) -> &'a str {
        if anon_download_url.is_empty() || auth_avail {
            download_url
        } else {
            anon_download_url
        }
    }

    /// Download the snap addressed by `download_info` to `target_path`.
    pub async fn download(
        &self,
        name: &str,
        target_path: &Path,
        download_info: &DownloadInfo,
        meter: &dyn ProgressMeter,
        user: Option<&UserCredentials>,
        opts: &DownloadOptions,
    ) -> Result<(), StoreError> {
        if let Some(parent) = target_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if self
            .cacher()
            .get(&download_info.sha3_384, target_path)
            .is_ok()
        {
            debug!(
                "cache hit for sha3-384 …{:.5}",
                download_info.sha3_384
            );
            return Ok(());
        }

        if self.deltas_enabled && self.delta_applier.available() {
            debug!("available deltas returned by store: {}", download_info.deltas.len());
            if download_info.deltas.len() == 1 {
                match self
                    .download_and_apply_delta(name, target_path, download_info, meter, user, opts)
                    .await
                {
                    Ok(()) => return Ok(()),
                    // any delta failure reverts to a normal download
                    Err(err) => {
                        debug!("cannot download or apply deltas for {name}: {err}")
                    }
                }
            }
        }

        let partial = partial_path(target_path);
        let result = self
            .download_to_partial(name, target_path, &partial, download_info, meter, user, opts)
            .await;
        if let Err(err) = result {
            let keep = opts.leave_partial_on_error
                && tokio::fs::metadata(&partial)
                    .await
                    .map(|m| m.len() > 0)
                    .unwrap_or(false);
            if !keep {
                let _ = tokio::fs::remove_file(&partial).await;
            }
            return Err(err);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_to_partial(
        &self,
        name: &str,
        target_path: &Path,
        partial: &Path,
        download_info: &DownloadInfo,
        meter: &dyn ProgressMeter,
        user: Option<&UserCredentials>,
        opts: &DownloadOptions,
    ) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(partial)
            .await?;
        let resume = file.seek(SeekFrom::End(0)).await?;
        if resume > 0 {
            debug!("resuming download of {partial:?} at {resume}");
        } else {
            debug!("starting download of {partial:?}");
        }

        let auth_avail = self.auth_available(user).await?;
        let url = Self::select_url(
            &download_info.download_url,
            &download_info.anon_download_url,
            auth_avail,
        );

        let mut result = if download_info.size == 0 || resume < download_info.size {
            self.download_blob(name, &download_info.sha3_384, url, user, &mut file, resume, meter, opts)
                .await
        } else {
            // already have all the bytes, just verify them
            let (actual, _) = file_sha3_384(&mut file).await?;
            if actual != download_info.sha3_384 {
                Err(StoreError::HashMismatch {
                    name: name.to_string(),
                    expected: download_info.sha3_384.clone(),
                    actual,
                })
            } else {
                Ok(())
            }
        };

        // a bad hash means the partial was poisoned; retry once from scratch
        if let Err(StoreError::HashMismatch { .. }) = &result {
            debug!("hash mismatch on download, truncating and trying again from scratch");
            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            result = self
                .download_blob(
                    name,
                    &download_info.sha3_384,
                    url,
                    user,
                    &mut file,
                    0,
                    meter,
                    &DownloadOptions::default(),
                )
                .await;
        }
        result?;

        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(partial, target_path).await?;

        self.cacher().put(&download_info.sha3_384, target_path)?;
        Ok(())
    }

    /// The retrying download loop writing into `file` from `resume` on.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn download_blob(
        &self,
        name: &str,
        sha3_384: &str,
        url: &str,
        user: Option<&UserCredentials>,
        file: &mut File,
        mut resume: u64,
        meter: &dyn ProgressMeter,
        opts: &DownloadOptions,
    ) -> Result<(), StoreError> {
        let store_url = reqwest::Url::parse(url)
            .map_err(|err| StoreError::Internal(format!("invalid download URL {url:?}: {err}")))?;

        let started = std::time::Instant::now();
        let mut attempts = DOWNLOAD_RETRY_STRATEGY.attempts();
        let mut last_err: Option<StoreError> = None;
        let mut downloaded_size = 0u64;
        while attempts.next().await {
            if attempts.current() > 1 {
                debug!("retrying download of {url} (attempt {})", attempts.current());
            }
            let mut req_opts = self.download_req_opts(store_url.clone(), opts).await?;

            let mut hasher = Sha3_384::new();
            if resume > 0 {
                req_opts = req_opts.header("Range", &format!("bytes={resume}-"));
                // seed the hash with what is already on disk
                file.seek(SeekFrom::Start(0)).await?;
                let mut buf = vec![0u8; 64 * 1024];
                let mut seeded = 0u64;
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    seeded += n as u64;
                }
                if seeded != resume {
                    return Err(StoreError::Internal(format!(
                        "resume offset wrong: {resume} != {seeded}"
                    )));
                }
            }

            let client = self.new_untimed_client()?;
            let resp = match self.do_request(&client, &req_opts, user).await {
                Ok(resp) => resp,
                Err(StoreError::Http(err)) if should_retry_error(&err) && attempts.more() => {
                    last_err = Some(StoreError::Http(err));
                    continue;
                }
                Err(err) => return Err(err),
            };

            if resume > 0 && resp.status() != StatusCode::PARTIAL_CONTENT {
                debug!("server does not support resume");
                file.seek(SeekFrom::Start(0)).await?;
                hasher = Sha3_384::new();
                resume = 0;
            }
            if should_retry_status(resp.status()) && attempts.more() {
                last_err = Some(StoreError::Download {
                    code: resp.status().as_u16(),
                    url: url.to_string(),
                });
                continue;
            }

            match resp.status().as_u16() {
                200 | 206 => {}
                402 => {
                    return Err(StoreError::Protocol(format!(
                        "please buy {name} before installing it"
                    )))
                }
                code => {
                    return Err(StoreError::Download {
                        code,
                        url: url.to_string(),
                    })
                }
            }

            let total = resume + resp.content_length().unwrap_or(0);
            meter.start(name, total);
            let mut bucket = (opts.rate_limit > 0).then(|| TokenBucket::new(opts.rate_limit));

            let mut stream = resp.bytes_stream();
            let mut copy_err: Option<reqwest::Error> = None;
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        copy_err = Some(err);
                        break;
                    }
                };
                if let Some(bucket) = bucket.as_mut() {
                    bucket.throttle(chunk.len()).await;
                }
                file.write_all(&chunk).await?;
                hasher.update(&chunk);
                downloaded_size += chunk.len() as u64;
                meter.advance(chunk.len() as u64);
            }
            meter.finished();

            if let Some(err) = copy_err {
                if should_retry_error(&err) && attempts.more() {
                    // pick up from whatever made it to disk
                    file.flush().await?;
                    resume = file.seek(SeekFrom::End(0)).await?;
                    last_err = Some(StoreError::Http(err));
                    continue;
                }
                return Err(err.into());
            }

            file.flush().await?;
            let actual = hex::encode(hasher.finalize());
            if !sha3_384.is_empty() && actual != sha3_384 {
                return Err(StoreError::HashMismatch {
                    name: name.to_string(),
                    expected: sha3_384.to_string(),
                    actual,
                });
            }

            let dt = started.elapsed().as_secs_f64();
            debug!(
                "download succeeded in {dt:.3}s ({:.0} B/s)",
                downloaded_size as f64 / dt.max(f64::EPSILON)
            );
            return Ok(());
        }
        Err(last_err.unwrap_or_else(|| StoreError::Internal("download retries exhausted".into())))
    }

    /// Stream the snap blob, honouring the cache; returns the body reader
    /// and the HTTP-like status (200, or 206 when resuming).
    pub async fn download_stream(
        &self,
        _name: &str,
        download_info: &DownloadInfo,
        resume: u64,
        user: Option<&UserCredentials>,
    ) -> Result<(Box<dyn tokio::io::AsyncRead + Send + Unpin>, u16), StoreError> {
        if let Some(path) = self.cacher().path(&download_info.sha3_384) {
            debug!(
                "cache hit for sha3-384 …{:.5}",
                download_info.sha3_384
            );
            let mut file = File::open(&path).await?;
            if resume == 0 {
                return Ok((Box::new(file), 200));
            }
            file.seek(SeekFrom::Start(resume)).await?;
            return Ok((Box::new(file), 206));
        }

        let auth_avail = self.auth_available(user).await?;
        let url = Self::select_url(
            &download_info.download_url,
            &download_info.anon_download_url,
            auth_avail,
        );
        let store_url = reqwest::Url::parse(url)
            .map_err(|err| StoreError::Internal(format!("invalid download URL {url:?}: {err}")))?;

        let mut req_opts = self
            .download_req_opts(store_url, &DownloadOptions::default())
            .await?;
        if resume > 0 {
            req_opts = req_opts.header("Range", &format!("bytes={resume}-"));
        }
        let client = self.new_untimed_client()?;
        let resp = self.do_request(&client, &req_opts, user).await?;
        let status = resp.status().as_u16();
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let reader = tokio_util::io::StreamReader::new(Box::pin(stream));
        Ok((Box::new(reader), status))
    }
}

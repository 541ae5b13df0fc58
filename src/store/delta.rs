//! Binary delta download and application.
//!
//! The actual patch tool lives behind [`DeltaApplier`] so tests can swap in
//! a fake; the default shells out to xdelta3.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::auth::UserCredentials;
use crate::store::download::{file_sha3_384, DownloadOptions, ProgressMeter};
use crate::store::error::StoreError;
use crate::store::Store;
use crate::types::{DeltaInfo, DownloadInfo};

/// Applies a binary delta to reconstruct a snap blob.
#[async_trait]
pub trait DeltaApplier: Send + Sync {
    /// Whether the tool backing this applier can run at all.
    fn available(&self) -> bool;

    /// Format this applier understands.
    fn format(&self) -> &str;

    /// Produce `target` from `source` and `delta`.
    async fn apply(&self, source: &Path, delta: &Path, target: &Path) -> Result<(), StoreError>;
}

/// The stock applier: `xdelta3 -d -s <source> <delta> <target>`.
pub struct Xdelta3Applier;

fn executable_in_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}

#[async_trait]
impl DeltaApplier for Xdelta3Applier {
    fn available(&self) -> bool {
        executable_in_path("xdelta3")
    }

    fn format(&self) -> &str {
        "xdelta3"
    }

    async fn apply(&self, source: &Path, delta: &Path, target: &Path) -> Result<(), StoreError> {
        let status = tokio::process::Command::new("xdelta3")
            .arg("-d")
            .arg("-s")
            .arg(source)
            .arg(delta)
            .arg(target)
            .status()
            .await?;
        if !status.success() {
            return Err(StoreError::Protocol(format!(
                "xdelta3 failed with {status} applying {delta:?}"
            )));
        }
        Ok(())
    }
}

impl Store {
    /// Download the offered delta into `writer_path` scratch space.
    async fn download_delta(
        &self,
        delta_name: &str,
        download_info: &DownloadInfo,
        file: &mut tokio::fs::File,
        meter: &dyn ProgressMeter,
        user: Option<&UserCredentials>,
        opts: &DownloadOptions,
    ) -> Result<(), StoreError> {
        if download_info.deltas.len() != 1 {
            return Err(StoreError::Protocol(
                "store returned more than one download delta".to_string(),
            ));
        }
        let delta = &download_info.deltas[0];
        if delta.format != self.cfg.delta_format {
            return Err(StoreError::Protocol(format!(
                "store returned unsupported delta format {:?} (only {} currently)",
                delta.format, self.cfg.delta_format
            )));
        }
        let auth_avail = self.auth_available(user).await?;
        let url = if delta.anon_download_url.is_empty() || auth_avail {
            &delta.download_url
        } else {
            &delta.anon_download_url
        };
        self.download_blob(
            delta_name,
            &delta.sha3_384,
            url,
            user,
            file,
            0,
            meter,
            opts,
        )
        .await
    }

    /// Apply a downloaded delta against the source revision blob, verifying
    /// the result against the full snap's hash.
    async fn apply_delta(
        &self,
        name: &str,
        delta_path: &Path,
        delta: &DeltaInfo,
        target_path: &Path,
        target_sha3_384: &str,
    ) -> Result<(), StoreError> {
        let source = self
            .cfg
            .blob_dir
            .join(format!("{name}_{}.snap", delta.from_revision));
        if !source.is_file() {
            return Err(StoreError::Protocol(format!(
                "snap {name:?} revision {} not found at {}",
                delta.from_revision,
                source.display()
            )));
        }
        if delta.format != self.cfg.delta_format {
            return Err(StoreError::Protocol(format!(
                "cannot apply unsupported delta format {:?} (only {} currently)",
                delta.format, self.cfg.delta_format
            )));
        }

        let partial_target = super::download::partial_path(target_path);
        if let Err(err) = self
            .delta_applier
            .apply(&source, delta_path, &partial_target)
            .await
        {
            let _ = tokio::fs::remove_file(&partial_target).await;
            return Err(err);
        }

        set_private_mode(&partial_target).await?;

        let mut produced = tokio::fs::File::open(&partial_target).await?;
        let (actual, _) = file_sha3_384(&mut produced).await?;
        drop(produced);
        if !target_sha3_384.is_empty() && actual != target_sha3_384 {
            let _ = tokio::fs::remove_file(&partial_target).await;
            return Err(StoreError::HashMismatch {
                name: name.to_string(),
                expected: target_sha3_384.to_string(),
                actual,
            });
        }

        if tokio::fs::rename(&partial_target, target_path).await.is_err() {
            // cross-device rename: fall back to a copy
            tokio::fs::copy(&partial_target, target_path).await?;
            let _ = tokio::fs::remove_file(&partial_target).await;
        }
        Ok(())
    }

    /// Download and apply the single offered delta; any error here makes the
    /// caller fall back to the full download.
    pub(crate) async fn download_and_apply_delta(
        &self,
        name: &str,
        target_path: &Path,
        download_info: &DownloadInfo,
        meter: &dyn ProgressMeter,
        user: Option<&UserCredentials>,
        opts: &DownloadOptions,
    ) -> Result<(), StoreError> {
        let delta = &download_info.deltas[0];
        let delta_path: PathBuf = {
            let mut name = target_path.as_os_str().to_os_string();
            name.push(format!(
                ".{}-{}-to-{}.partial",
                delta.format, delta.from_revision, delta.to_revision
            ));
            PathBuf::from(name)
        };
        let delta_name = format!("{name} (delta)");

        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&delta_path)
            .await?;

        let result = self
            .download_delta(&delta_name, download_info, &mut file, meter, user, opts)
            .await;
        drop(file);
        if let Err(err) = result {
            let _ = tokio::fs::remove_file(&delta_path).await;
            return Err(err);
        }
        debug!("successfully downloaded delta for {name:?} at {delta_path:?}");

        let result = self
            .apply_delta(name, &delta_path, delta, target_path, &download_info.sha3_384)
            .await;
        let _ = tokio::fs::remove_file(&delta_path).await;
        result?;

        debug!(
            "successfully applied delta for {name:?}, saving {} bytes",
            download_info.size.saturating_sub(delta.size)
        );
        Ok(())
    }
}

#[cfg(unix)]
async fn set_private_mode(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_private_mode(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xdelta3_format() {
        assert_eq!(Xdelta3Applier.format(), "xdelta3");
    }

    #[test]
    fn executable_lookup_misses_nonsense() {
        assert!(!executable_in_path("definitely-not-a-real-tool-name"));
    }
}

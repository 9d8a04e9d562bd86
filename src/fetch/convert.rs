//! Image inspection and raw conversion through `qemu-img`

use crate::cache::ImageRef;
use crate::error::{ImageCacheError, ImageCacheResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Output of `qemu-img info --output=json`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageInfo {
    pub format: Option<String>,
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    #[serde(rename = "actual-size", default)]
    pub actual_size: Option<u64>,
    #[serde(rename = "backing-filename", default)]
    pub backing_file: Option<String>,
}

impl ImageInfo {
    /// Parse qemu-img JSON output
    pub fn parse(json: &str) -> ImageCacheResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Whether the image is already raw (an unknown format counts as raw)
    pub fn is_raw(&self) -> bool {
        matches!(self.format.as_deref(), None | Some("raw"))
    }

    /// Estimated raw size: on-disk size scaled by `growth_factor`, capped at
    /// the virtual size
    pub fn estimated_raw_size(&self, growth_factor: f64) -> u64 {
        match self.actual_size {
            Some(actual) => {
                let grown = (actual as f64 * growth_factor).max(0.0) as u64;
                grown.min(self.virtual_size)
            }
            None => self.virtual_size,
        }
    }
}

/// `qemu-img` command wrapper
#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: String,
}

impl QemuImg {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Inspect an image file
    pub async fn info(&self, path: &Path) -> ImageCacheResult<ImageInfo> {
        let output = Command::new(&self.binary)
            .args(["info", "--output=json"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ImageCacheError::io(format!("running {} info", self.binary), e))?;

        if !output.status.success() {
            return Err(ImageCacheError::ImageUnacceptable {
                image: path.display().to_string(),
                reason: format!(
                    "'qemu-img info' failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        ImageInfo::parse(&String::from_utf8_lossy(&output.stdout))
    }

    /// Convert `src` to a raw image at `dest`
    pub async fn convert(&self, image: &ImageRef, src: &Path, dest: &Path) -> ImageCacheResult<()> {
        debug!("Converting {} to raw at {}", src.display(), dest.display());
        let output = Command::new(&self.binary)
            .args(["convert", "-O", "raw"])
            .arg(src)
            .arg(dest)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ImageCacheError::io(format!("running {} convert", self.binary), e))?;

        if !output.status.success() {
            return Err(ImageCacheError::ImageConvertFailed {
                image: image.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Turn the downloaded file `tmp` into a raw image at `dest`.
    ///
    /// Images with a backing file are rejected. Non-raw images are converted
    /// into a staged file that is verified before it replaces `dest`. `tmp` is
    /// removed on failure.
    pub async fn image_to_raw(&self, image: &ImageRef, dest: &Path, tmp: &Path) -> ImageCacheResult<()> {
        let info = match self.info(tmp).await {
            Ok(info) => info,
            Err(e) => {
                let _ = tokio::fs::remove_file(tmp).await;
                return Err(e);
            }
        };
        self.raw_from_info(image, dest, tmp, &info).await
    }

    /// [`image_to_raw`](Self::image_to_raw) for a file already inspected as `info`
    pub async fn raw_from_info(
        &self,
        image: &ImageRef,
        dest: &Path,
        tmp: &Path,
        info: &ImageInfo,
    ) -> ImageCacheResult<()> {
        let result = self.stage_raw(image, dest, tmp, info).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(tmp).await;
        }
        result
    }

    async fn stage_raw(&self, image: &ImageRef, dest: &Path, tmp: &Path, info: &ImageInfo) -> ImageCacheResult<()> {
        let format = info
            .format
            .clone()
            .ok_or_else(|| ImageCacheError::ImageUnacceptable {
                image: image.to_string(),
                reason: "'qemu-img info' parsing failed".to_string(),
            })?;

        if let Some(backing) = &info.backing_file {
            return Err(ImageCacheError::ImageUnacceptable {
                image: image.to_string(),
                reason: format!("fmt={} backed by: {}", format, backing),
            });
        }

        if info.is_raw() {
            return rename(tmp, dest).await;
        }

        let staged = staged_path(dest);
        self.convert(image, tmp, &staged).await?;
        tokio::fs::remove_file(tmp)
            .await
            .map_err(|e| ImageCacheError::io(format!("removing {}", tmp.display()), e))?;

        let converted = self.info(&staged).await?;
        if !converted.is_raw() {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(ImageCacheError::ImageConvertFailed {
                image: image.to_string(),
                reason: format!(
                    "converted to {} instead of raw",
                    converted.format.as_deref().unwrap_or("unknown")
                ),
            });
        }

        rename(&staged, dest).await?;
        info!("Converted {} from {} to raw", image, format);
        Ok(())
    }
}

fn staged_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".converted");
    name.into()
}

async fn rename(from: &Path, to: &Path) -> ImageCacheResult<()> {
    tokio::fs::rename(from, to).await.map_err(|e| {
        ImageCacheError::io(
            format!("renaming {} to {}", from.display(), to.display()),
            e,
        )
    })
}

//! Standard fetcher: local files, HTTP(S) and the image registry
//!
//! Transfers go to `<dest>.part` first. With `force_raw`, the downloaded
//! file is inspected and, if it needs conversion, the estimated raw size is
//! demanded from the cross-cache coordinator before `qemu-img` runs.

use super::convert::QemuImg;
use super::{part_path, Fetcher};
use crate::cache::ImageRef;
use crate::config::schema::FetchConfig;
use crate::disk;
use crate::error::{ImageCacheError, ImageCacheResult};
use crate::reclaim::CrossCacheCoordinator;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Where the bytes of an image come from
#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    File(PathBuf),
    Http(String),
}

/// Image metadata served by the registry
#[derive(Debug, Deserialize)]
struct RegistryImage {
    size: Option<u64>,
    updated_at: Option<DateTime<Utc>>,
}

/// Fetcher for `file://`, absolute paths, `http(s)://` and registry images
pub struct StandardFetcher {
    agent: ureq::Agent,
    registry_url: Option<String>,
    qemu: QemuImg,
    growth_factor: f64,
    coordinator: Option<Arc<CrossCacheCoordinator>>,
}

impl StandardFetcher {
    pub fn new(config: &FetchConfig) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.http_timeout_secs)))
            .build();

        Self {
            agent: ureq::Agent::new_with_config(agent_config),
            registry_url: config.registry_url.clone(),
            qemu: QemuImg::new(config.qemu_img.clone()),
            growth_factor: config.raw_image_growth_factor,
            coordinator: None,
        }
    }

    /// Reclaim space through `coordinator` before raw conversions
    pub fn with_coordinator(mut self, coordinator: Arc<CrossCacheCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    fn registry_base(&self, image: &ImageRef) -> ImageCacheResult<&str> {
        self.registry_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .ok_or_else(|| ImageCacheError::RegistryNotConfigured(image.to_string()))
    }

    fn source(&self, image: &ImageRef) -> ImageCacheResult<Source> {
        match image {
            ImageRef::Registry(id) => Ok(Source::Http(format!(
                "{}/v2/images/{}/file",
                self.registry_base(image)?,
                id
            ))),
            ImageRef::Generic(href) => {
                if href.starts_with("http://") || href.starts_with("https://") {
                    Ok(Source::Http(href.clone()))
                } else if let Some(path) = href.strip_prefix("file://") {
                    Ok(Source::File(PathBuf::from(path)))
                } else if Path::new(href).is_absolute() {
                    Ok(Source::File(PathBuf::from(href)))
                } else {
                    Err(ImageCacheError::download(
                        href.clone(),
                        "unsupported image reference",
                    ))
                }
            }
        }
    }

    async fn registry_metadata(&self, image: &ImageRef, id: &str) -> ImageCacheResult<RegistryImage> {
        let url = format!("{}/v2/images/{}", self.registry_base(image)?, id);
        let agent = self.agent.clone();
        let name = image.to_string();

        blocking(move || {
            let mut response = agent
                .get(&url)
                .call()
                .map_err(|e| ImageCacheError::download(&name, e.to_string()))?;
            let body = response
                .body_mut()
                .read_to_string()
                .map_err(|e| ImageCacheError::download(&name, e.to_string()))?;
            Ok(serde_json::from_str(&body)?)
        })
        .await
    }

    /// HEAD an HTTP source, returning `(content_length, last_modified)`
    async fn head(&self, image: &ImageRef, url: &str) -> ImageCacheResult<(Option<u64>, Option<DateTime<Utc>>)> {
        let agent = self.agent.clone();
        let url = url.to_string();
        let name = image.to_string();

        blocking(move || {
            let response = agent
                .head(&url)
                .call()
                .map_err(|e| ImageCacheError::download(&name, e.to_string()))?;
            let header = |key: &str| {
                response
                    .headers()
                    .get(key)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let length = header("content-length").and_then(|v| v.parse().ok());
            let modified = header("last-modified").and_then(|v| parse_http_date(&v));
            Ok((length, modified))
        })
        .await
    }

    /// Transfer the image bytes to `dest` without conversion
    async fn download(&self, image: &ImageRef, dest: &Path) -> ImageCacheResult<u64> {
        match self.source(image)? {
            Source::File(path) => tokio::fs::copy(&path, dest)
                .await
                .map_err(|e| ImageCacheError::download(image.to_string(), e.to_string())),
            Source::Http(url) => {
                let agent = self.agent.clone();
                let dest = dest.to_path_buf();
                let name = image.to_string();

                blocking(move || {
                    let mut response = agent
                        .get(&url)
                        .call()
                        .map_err(|e| ImageCacheError::download(&name, e.to_string()))?;
                    let mut file = std::fs::File::create(&dest).map_err(|e| {
                        ImageCacheError::io(format!("creating {}", dest.display()), e)
                    })?;
                    let mut reader = response.body_mut().as_reader();
                    std::io::copy(&mut reader, &mut file)
                        .map_err(|e| ImageCacheError::download(&name, e.to_string()))
                })
                .await
            }
        }
    }

    async fn ensure_space(&self, dir: &Path, required: u64) -> ImageCacheResult<()> {
        match &self.coordinator {
            Some(coordinator) => coordinator.reclaim_space(dir, required).await,
            None => {
                let free = disk::free_bytes(dir)?;
                if required < free {
                    Ok(())
                } else {
                    Err(ImageCacheError::InsufficientDiskSpace {
                        path: dir.to_path_buf(),
                        required,
                        actual: free,
                    })
                }
            }
        }
    }

    async fn fetch_part(&self, image: &ImageRef, dest: &Path, part: &Path, force_raw: bool) -> ImageCacheResult<()> {
        let bytes = self.download(image, part).await?;
        info!("Downloaded {} ({} bytes)", image, bytes);

        if !force_raw {
            return tokio::fs::rename(part, dest).await.map_err(|e| {
                ImageCacheError::io(format!("renaming {} to {}", part.display(), dest.display()), e)
            });
        }

        let info = self.qemu.info(part).await?;
        if !info.is_raw() {
            let required = info.estimated_raw_size(self.growth_factor);
            let dir = dest.parent().unwrap_or_else(|| Path::new("."));
            debug!("Raw conversion of {} needs about {} bytes", image, required);
            self.ensure_space(dir, required).await?;
        }

        self.qemu.raw_from_info(image, dest, part, &info).await
    }
}

#[async_trait]
impl Fetcher for StandardFetcher {
    async fn fetch(&self, image: &ImageRef, dest: &Path, force_raw: bool) -> ImageCacheResult<()> {
        let part = part_path(dest);
        let result = self.fetch_part(image, dest, &part, force_raw).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&part).await;
        }
        result
    }

    async fn will_convert_to_raw(&self, _image: &ImageRef, path: &Path) -> ImageCacheResult<bool> {
        Ok(!self.qemu.info(path).await?.is_raw())
    }

    async fn estimate_converted_size(&self, path: &Path) -> ImageCacheResult<u64> {
        Ok(self
            .qemu
            .info(path)
            .await?
            .estimated_raw_size(self.growth_factor))
    }

    async fn query_remote_size(&self, image: &ImageRef) -> ImageCacheResult<u64> {
        if let ImageRef::Registry(id) = image {
            return self
                .registry_metadata(image, id)
                .await?
                .size
                .ok_or_else(|| ImageCacheError::download(image.to_string(), "registry reports no size"));
        }

        match self.source(image)? {
            Source::File(path) => tokio::fs::metadata(&path)
                .await
                .map(|m| m.len())
                .map_err(|e| ImageCacheError::download(image.to_string(), e.to_string())),
            Source::Http(url) => self.head(image, &url).await?.0.ok_or_else(|| {
                ImageCacheError::download(image.to_string(), "server reports no Content-Length")
            }),
        }
    }

    async fn convert_to_raw(&self, image: &ImageRef, dest: &Path, src: &Path) -> ImageCacheResult<()> {
        self.qemu.image_to_raw(image, dest, src).await
    }

    async fn upstream_modified(&self, image: &ImageRef) -> ImageCacheResult<Option<DateTime<Utc>>> {
        if let ImageRef::Registry(id) = image {
            return Ok(self.registry_metadata(image, id).await?.updated_at);
        }

        match self.source(image)? {
            Source::File(path) => {
                let metadata = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| ImageCacheError::download(image.to_string(), e.to_string()))?;
                Ok(metadata.modified().ok().map(DateTime::<Utc>::from))
            }
            Source::Http(url) => Ok(self.head(image, &url).await?.1),
        }
    }
}

/// Parse an HTTP-date such as `Wed, 21 Oct 2015 07:28:00 GMT`
fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

async fn blocking<T, F>(f: F) -> ImageCacheResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ImageCacheResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ImageCacheError::Internal(format!("transfer task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn fetcher(registry_url: Option<&str>) -> StandardFetcher {
        let config = FetchConfig {
            registry_url: registry_url.map(str::to_string),
            ..FetchConfig::default()
        };
        StandardFetcher::new(&config)
    }

    #[test]
    fn classifies_sources() {
        let f = fetcher(Some("http://registry:9292/"));

        assert_eq!(
            f.source(&ImageRef::parse("https://x/img.qcow2")).unwrap(),
            Source::Http("https://x/img.qcow2".to_string())
        );
        assert_eq!(
            f.source(&ImageRef::parse("file:///srv/img.raw")).unwrap(),
            Source::File(PathBuf::from("/srv/img.raw"))
        );
        assert_eq!(
            f.source(&ImageRef::parse("/srv/img.raw")).unwrap(),
            Source::File(PathBuf::from("/srv/img.raw"))
        );
        assert_eq!(
            f.source(&ImageRef::parse("glance://abc")).unwrap(),
            Source::Http("http://registry:9292/v2/images/abc/file".to_string())
        );
        assert!(f.source(&ImageRef::parse("relative/img")).is_err());
    }

    #[test]
    fn registry_requires_url() {
        let err = fetcher(None)
            .source(&ImageRef::parse("glance://abc"))
            .unwrap_err();
        assert!(matches!(err, ImageCacheError::RegistryNotConfigured(_)));
    }

    #[test]
    fn parses_http_dates() {
        let parsed = parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap());
        assert!(parse_http_date("yesterday").is_none());
    }

    #[tokio::test]
    async fn fetches_local_file_without_conversion() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("source.img");
        std::fs::write(&src, b"image-bytes").unwrap();
        let dest = dir.path().join("dest.img");
        let image = ImageRef::parse(&format!("file://{}", src.display()));

        let f = fetcher(None);
        f.fetch(&image, &dest, false).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"image-bytes");
        assert!(!part_path(&dest).exists());
        assert_eq!(f.query_remote_size(&image).await.unwrap(), 11);
        assert!(f.upstream_modified(&image).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_fetch_leaves_no_part_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dest.img");
        let image = ImageRef::parse(&format!("{}/missing.img", dir.path().display()));

        let err = fetcher(None).fetch(&image, &dest, false).await.unwrap_err();

        assert!(err.is_download_failure());
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    /// Stand-in `qemu-img` that records its subcommands in `calls`. Files
    /// ending in `.converted` report raw, everything else reports `format`.
    fn fake_qemu(dir: &Path, format: &str) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let calls = dir.join("calls");
        let script = dir.join("qemu-img");
        let body = format!(
            r#"#!/bin/sh
echo "$1" >> '{calls}'
case "$1" in
  info)
    case "$3" in
      *.converted) echo '{{"virtual-size": 5, "format": "raw"}}' ;;
      *) echo '{{"virtual-size": 5, "format": "{format}", "actual-size": 2}}' ;;
    esac ;;
  convert) cp "$4" "$5" ;;
esac
"#,
            calls = calls.display(),
            format = format
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, calls)
    }

    fn qemu_calls(calls: &Path) -> Vec<String> {
        std::fs::read_to_string(calls)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    async fn fetch_raw_with(format: &str) -> Vec<String> {
        let dir = TempDir::new().unwrap();
        let (script, calls) = fake_qemu(dir.path(), format);
        let src = dir.path().join("src.img");
        std::fs::write(&src, b"bytes").unwrap();
        let config = FetchConfig {
            qemu_img: script.display().to_string(),
            ..FetchConfig::default()
        };
        let dest = dir.path().join("dest");

        StandardFetcher::new(&config)
            .fetch(&ImageRef::parse(src.to_str().unwrap()), &dest, true)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"bytes");
        assert!(!part_path(&dest).exists());
        qemu_calls(&calls)
    }

    #[tokio::test]
    async fn raw_download_is_inspected_once() {
        assert_eq!(fetch_raw_with("raw").await, vec!["info"]);
    }

    #[tokio::test]
    async fn converted_download_is_inspected_before_and_after() {
        assert_eq!(
            fetch_raw_with("qcow2").await,
            vec!["info", "convert", "info"]
        );
    }
}

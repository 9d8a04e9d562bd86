//! Error types for imagecache
//!
//! All modules use `ImageCacheResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for imagecache operations
pub type ImageCacheResult<T> = Result<T, ImageCacheError>;

fn mib(bytes: &u64) -> f64 {
    *bytes as f64 / (1024.0 * 1024.0)
}

/// All errors that can occur in imagecache
#[derive(Error, Debug)]
pub enum ImageCacheError {
    // Download errors
    #[error("Failed to download image {image}: {reason}")]
    DownloadFailed { image: String, reason: String },

    #[error("Could not link image {image} from {} to {}: {source}", .from.display(), .to.display())]
    LinkFailed {
        image: String,
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "Insufficient disk space at {}: {:.1} MiB required, {:.1} MiB available",
        .path.display(),
        mib(.required),
        mib(.actual)
    )]
    InsufficientDiskSpace {
        path: PathBuf,
        required: u64,
        actual: u64,
    },

    // Image inspection errors
    #[error("Image {image} is unacceptable: {reason}")]
    ImageUnacceptable { image: String, reason: String },

    #[error("Converting image {image} to raw failed: {reason}")]
    ImageConvertFailed { image: String, reason: String },

    #[error("No image registry configured to resolve {0}")]
    RegistryNotConfigured(String),

    // Locking errors
    #[error("Failed to acquire lock {name}: {source}")]
    Lock {
        name: String,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl ImageCacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a download failure for an image
    pub fn download(image: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DownloadFailed {
            image: image.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means the image could not be placed at its destination
    pub fn is_download_failure(&self) -> bool {
        matches!(self, Self::DownloadFailed { .. } | Self::LinkFailed { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::LinkFailed { .. } => {
                Some("The cache directory and the destination must be on the same filesystem")
            }
            Self::InsufficientDiskSpace { .. } => {
                Some("Lower cache.size_mb or cache.ttl_minutes, or free space on the device")
            }
            Self::RegistryNotConfigured(_) => Some("Set fetch.registry_url in the configuration"),
            _ => None,
        }
    }
}

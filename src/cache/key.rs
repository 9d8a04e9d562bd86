//! Image references and cache key derivation
//!
//! Registry images are addressed by their registry id, which is stable for
//! the lifetime of the image. Any other reference is addressed by a UUIDv5
//! of the reference string in the URL namespace, so the same URL always maps
//! to the same key and different URLs do not collide.

use std::fmt;
use uuid::Uuid;

/// Scheme prefix for image registry references
pub const REGISTRY_SCHEME: &str = "glance://";

/// Suffix of master entries that hold a raw conversion
pub const CONVERTED_SUFFIX: &str = ".converted";

/// A parsed image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageRef {
    /// Image published in the versioned image registry, by id
    Registry(String),
    /// Any other reference (http(s) URL, file URL, local path)
    Generic(String),
}

impl ImageRef {
    /// Parse a reference string. Never fails; unrecognised shapes are generic.
    pub fn parse(reference: &str) -> Self {
        if Uuid::try_parse(reference).is_ok() {
            return Self::Registry(reference.to_string());
        }

        if let Some(rest) = reference.strip_prefix(REGISTRY_SCHEME) {
            let id = rest.rsplit('/').next().unwrap_or_default();
            if !id.is_empty() {
                return Self::Registry(id.to_string());
            }
        }

        Self::Generic(reference.to_string())
    }

    /// Whether this reference names an immutable registry image
    pub fn is_registry(&self) -> bool {
        matches!(self, Self::Registry(_))
    }

    /// Stable, filesystem-safe cache key for this reference
    pub fn cache_key(&self) -> String {
        match self {
            Self::Registry(id) => id.clone(),
            Self::Generic(href) => Uuid::new_v5(&Uuid::NAMESPACE_URL, href.as_bytes()).to_string(),
        }
    }

    /// Master entry file name, distinguishing raw conversions
    pub fn master_file_name(&self, force_raw: bool) -> String {
        let key = self.cache_key();
        if force_raw {
            format!("{}{}", key, CONVERTED_SUFFIX)
        } else {
            key
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry(id) => write!(f, "{}{}", REGISTRY_SCHEME, id),
            Self::Generic(href) => write!(f, "{}", href),
        }
    }
}

impl From<&str> for ImageRef {
    fn from(reference: &str) -> Self {
        Self::parse(reference)
    }
}

/// Resolve a reference to its cache key and whether it is a registry image
pub fn resolve(reference: &str) -> (String, bool) {
    let image = ImageRef::parse(reference);
    (image.cache_key(), image.is_registry())
}

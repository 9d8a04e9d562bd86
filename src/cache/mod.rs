//! Master image cache
//!
//! Images are downloaded once into a master directory and handed out as hard
//! links. Link counts track which masters are still referenced.
//!
//! # Master entry names
//!
//! | Reference | Entry |
//! |-----------|-------|
//! | `<uuid>` or `glance://.../<uuid>` | `<uuid>` |
//! | any other URL or path | UUIDv5 of the reference |
//! | either, converted to raw | `<key>.converted` |

pub mod eviction;
pub mod key;
pub mod master;

pub use eviction::{format_bytes, CacheSizeStatus, EvictionPolicy, MasterEntry};
pub use key::ImageRef;
pub use master::MasterImageCache;

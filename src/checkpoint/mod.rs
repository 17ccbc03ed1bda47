//! Resumption checkpoints.
//!
//! Checkpoints are small JSON documents keyed by a [`CheckpointKey`]
//! fingerprint and persisted by a [`CheckpointStore`]. The store knows nothing
//! about what it holds; the uploader and the object-store backend each own
//! their record layout.

mod key;
mod store;

use std::path::PathBuf;

pub use key::CheckpointKey;
pub use store::CheckpointStore;

/// Default directory for direct-upload checkpoints, `$HOME/.edo/upload_progress`.
#[must_use]
pub fn default_upload_root() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".edo").join("upload_progress"))
}

/// Default directory for object-store checkpoints,
/// `$HOME/.edo/aliyun_oss_upload_progress`.
#[must_use]
pub fn default_object_store_root() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".edo").join("aliyun_oss_upload_progress"))
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

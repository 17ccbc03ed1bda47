//! Fingerprints that name checkpoint files.

use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::TransferError;

/// Hex SHA-256 fingerprint of one (file, ticket, endpoint) triple.
///
/// Only fingerprints are used as checkpoint file names, so keys never carry
/// path separators or other caller-controlled text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey(String);

impl CheckpointKey {
    /// Fingerprints an upload.
    ///
    /// `canonical_ticket` must already have one-time fields removed (see
    /// [`TransferTicket::canonical_json`](crate::TransferTicket::canonical_json)).
    /// `endpoint` identifies the server the session lives on.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if `path` cannot be made absolute.
    pub fn fingerprint(
        path: &Path,
        canonical_ticket: &str,
        endpoint: &str,
    ) -> Result<Self, TransferError> {
        let absolute = std::path::absolute(path).map_err(|e| TransferError::io(path, e))?;

        let mut hasher = Sha256::new();
        hasher.update(absolute.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_ticket.as_bytes());
        hasher.update([0u8]);
        hasher.update(endpoint.as_bytes());
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// The fingerprint as lowercase hex.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let a = CheckpointKey::fingerprint(Path::new("/data/a.bin"), "{}", "https://api").unwrap();
        let b = CheckpointKey::fingerprint(Path::new("/data/a.bin"), "{}", "https://api").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_changes_with_each_input() {
        let base = CheckpointKey::fingerprint(Path::new("/data/a.bin"), "{}", "https://api").unwrap();
        let other_path =
            CheckpointKey::fingerprint(Path::new("/data/b.bin"), "{}", "https://api").unwrap();
        let other_ticket =
            CheckpointKey::fingerprint(Path::new("/data/a.bin"), "{\"a\":1}", "https://api")
                .unwrap();
        let other_endpoint =
            CheckpointKey::fingerprint(Path::new("/data/a.bin"), "{}", "https://api2").unwrap();
        assert_ne!(base, other_path);
        assert_ne!(base, other_ticket);
        assert_ne!(base, other_endpoint);
    }

    #[test]
    fn test_relative_path_matches_absolute() {
        let cwd = std::env::current_dir().unwrap();
        let relative = CheckpointKey::fingerprint(Path::new("x.bin"), "{}", "e").unwrap();
        let absolute = CheckpointKey::fingerprint(&cwd.join("x.bin"), "{}", "e").unwrap();
        assert_eq!(relative, absolute);
    }
}

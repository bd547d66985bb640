//! Provides the key to on-disk path mapping
//!
use crate::errors::StashError;
use sha1::{Digest, Sha1};
use std::path::PathBuf;

/// Hex length of the 160-bit path digest
const DIGEST_HEX_LEN: usize = 40;

/// Default number of hex characters per directory segment
pub const DEFAULT_SEGMENT_LEN: usize = 5;

/// A hashed storage-layout record. The full digest is partitioned
/// into equal-length directory segments to bound per-directory fanout,
/// and repeated in full as the filename.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct PathKey {
    pub segments: Vec<String>,
    pub filename: String,
}

impl PathKey {
    /// Relative path below the owner directory
    pub fn full_path(&self) -> PathBuf {
        let mut path: PathBuf = self.segments.iter().collect();
        path.push(&self.filename);
        path
    }

    /// First directory segment, the unit of deletion
    pub fn root_segment(&self) -> &str {
        &self.segments[0]
    }
}

/// Controls the mapping from a key to its PathKey
#[derive(Debug, Clone)]
pub enum PathTransform {
    /// Hash the key with a 160-bit digest and split the hex form
    /// every `segment_len` characters
    Hash { segment_len: usize },

    /// Use the key verbatim as a single segment and filename.
    /// Produces a flat layout, only suitable for tests and benches.
    Identity,
}

impl Default for PathTransform {
    fn default() -> Self {
        PathTransform::Hash {
            segment_len: DEFAULT_SEGMENT_LEN,
        }
    }
}

impl PathTransform {
    /// Build a hash transform, validating that the segment length
    /// tiles the digest with no gaps
    pub fn hash(segment_len: usize) -> Result<Self, StashError> {
        if segment_len == 0 || DIGEST_HEX_LEN % segment_len != 0 {
            return Err(StashError::BadSegmentLen(segment_len));
        }
        Ok(PathTransform::Hash { segment_len })
    }

    /// Map a key to its storage layout. Deterministic and pure.
    ///
    /// # Example
    ///
    /// ```
    /// use stash_lib::PathTransform;
    ///
    /// let pk = PathTransform::default().path_key(b"picture_0.png");
    /// assert_eq!(pk.segments.len(), 8);
    /// assert_eq!(pk.segments.concat(), pk.filename);
    /// ```
    pub fn path_key(&self, key: &[u8]) -> PathKey {
        match self {
            PathTransform::Hash { segment_len } => {
                let digest = hex::encode(Sha1::digest(key));
                let segments = digest
                    .as_bytes()
                    .chunks(*segment_len)
                    .map(|c| String::from_utf8_lossy(c).into_owned())
                    .collect();
                PathKey {
                    segments,
                    filename: digest,
                }
            }
            PathTransform::Identity => {
                let name = String::from_utf8_lossy(key).into_owned();
                PathKey {
                    segments: vec![name.clone()],
                    filename: name,
                }
            }
        }
    }
}

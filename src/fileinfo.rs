//! File info and resume classification (§3 "Resume classification").

use crate::error::{Error, Result};
use crate::store::FileStore;

const HASH_CHUNK: usize = 64 * 1024;

/// `(size, md5)` of a file, or the absent sentinel `(0, "0")` the original
/// protocol uses when a peer has no prior copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub md5_hex: String,
}

impl FileInfo {
    pub fn absent() -> Self {
        FileInfo {
            size: 0,
            md5_hex: "0".to_string(),
        }
    }
}

/// Computes `(size, md5)` of the whole file, or [`FileInfo::absent`] if it
/// doesn't exist.
pub fn file_info(store: &mut dyn FileStore) -> Result<FileInfo> {
    if !store.exists() {
        return Ok(FileInfo::absent());
    }
    let size = store.len()?;
    let md5_hex = hash_prefix(store, size)?;
    Ok(FileInfo { size, md5_hex })
}

/// MD5, as lowercase hex, of the first `len` bytes of `store`.
pub fn hash_prefix(store: &mut dyn FileStore, len: u64) -> Result<String> {
    let mut ctx = md5::Context::new();
    let mut offset = 0u64;
    let mut remaining = len;
    while remaining > 0 {
        let want = std::cmp::min(remaining, HASH_CHUNK as u64) as usize;
        let chunk = store.read_range(offset, want)?;
        if chunk.is_empty() {
            break;
        }
        ctx.consume(&chunk);
        offset += chunk.len() as u64;
        remaining -= chunk.len() as u64;
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Outcome of comparing a sender's local file prefix against a peer's
/// reported `(size, md5)` of its own partial copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Peer has nothing (or a mismatching prefix): start from offset 0.
    Resend,
    /// Peer's prefix matches; a caller-supplied policy decides whether to
    /// actually resume or restart anyway.
    CosendEligible,
}

/// Classifies resume eligibility for the side holding the authoritative
/// (complete) copy of the file, per §3.
///
/// Returns [`Error::FileNotFound`] if `store` has no file at all — the
/// sender-side check against a missing local file is a fatal abort, not a
/// RESEND (that's the *peer's* absence, which is `peer_size == 0` below).
pub fn classify_resume(
    store: &mut dyn FileStore,
    peer_size: u64,
    peer_md5_hex: &str,
) -> Result<Resume> {
    if !store.exists() {
        return Err(Error::FileNotFound);
    }
    if peer_size == 0 {
        return Ok(Resume::Resend);
    }
    let local_prefix_md5 = hash_prefix(store, peer_size)?;
    Ok(if local_prefix_md5 == peer_md5_hex {
        Resume::CosendEligible
    } else {
        Resume::Resend
    })
}

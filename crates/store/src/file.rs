//! Store-file naming, generation selection and the CAS byte encoding.
//!
//! Store files are named `<prefix>.<suffix>.<gen>`; the prefix is
//! `<bucket-uuid>_<vbid>` and the suffix distinguishes `data` from
//! `views` files. Opening picks the highest generation present.

use std::fs;
use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::error::{self, Result};

/// Builds a store file name for a generation.
pub fn make_store_file_name(prefix: &str, suffix: &str, gen: u64) -> String {
    format!("{prefix}.{suffix}.{gen}")
}

/// Finds the highest-generation store file for `prefix`/`suffix` in
/// `dir`, if any.
pub fn latest_store_file(dir: &Path, prefix: &str, suffix: &str) -> Result<Option<(PathBuf, u64)>> {
    let head = format!("{prefix}.{suffix}.");
    let mut best: Option<(PathBuf, u64)> = None;
    for entry in fs::read_dir(dir).context(error::IoSnafu)? {
        let entry = entry.context(error::IoSnafu)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(tail) = name.strip_prefix(&head) else { continue };
        let Ok(gen) = tail.parse::<u64>() else { continue };
        if best.as_ref().map_or(true, |(_, g)| gen > *g) {
            best = Some((entry.path(), gen));
        }
    }
    Ok(best)
}

/// Encodes a CAS as the big-endian key of a change-log record, so byte
/// order equals numeric order.
pub fn cas_bytes(cas: u64) -> [u8; 8] {
    cas.to_be_bytes()
}

/// Decodes a change-log key back to its CAS.
pub fn cas_bytes_parse(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] =
        bytes.try_into().map_err(|_| error::Error::BadChangeKey { len: bytes.len() })?;
    Ok(u64::from_be_bytes(arr))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn cas_bytes_round_trip() {
        for cas in [0u64, 1, 255, 256, u64::MAX] {
            assert_eq!(cas_bytes_parse(&cas_bytes(cas)).unwrap(), cas);
        }
    }

    #[test]
    fn cas_bytes_order_matches_numeric() {
        assert!(cas_bytes(1) < cas_bytes(2));
        assert!(cas_bytes(255) < cas_bytes(256));
        assert!(cas_bytes(u32::MAX as u64) < cas_bytes(u32::MAX as u64 + 1));
    }

    #[test]
    fn cas_bytes_parse_rejects_bad_length() {
        assert!(cas_bytes_parse(b"short").is_err());
    }

    #[test]
    fn latest_generation_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        for gen in [0u64, 3, 12] {
            std::fs::write(dir.path().join(make_store_file_name("u_5", "views", gen)), b"x")
                .unwrap();
        }
        // Unrelated files are ignored.
        std::fs::write(dir.path().join("u_6.views.99"), b"x").unwrap();
        std::fs::write(dir.path().join("u_5.data.100"), b"x").unwrap();
        std::fs::write(dir.path().join("u_5.views.notanumber"), b"x").unwrap();

        let (path, gen) = latest_store_file(dir.path(), "u_5", "views")
            .expect("scan")
            .expect("file present");
        assert_eq!(gen, 12);
        assert!(path.ends_with("u_5.views.12"));
    }

    #[test]
    fn no_files_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(latest_store_file(dir.path(), "u_1", "data").expect("scan").is_none());
    }
}

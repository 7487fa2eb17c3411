//! Resolution cache: previously resolved conflicts keyed by content.
//!
//! The key is a SHA-256 fingerprint of the exact `(base, ours, theirs)`
//! triple, so a recorded resolution is only ever reused for byte-identical
//! inputs. Records are directories `<fingerprint>/` holding the `resolved`
//! content and a `meta.json`.
//!
//! Lookup order: the package being applied, then the project's shipped area,
//! then user-recorded resolutions. Shipped areas are never written.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::EngineError;
use crate::fs_util;
use crate::layout::Layout;
use crate::ledger::unix_now;

/// Resolved content file inside a record.
pub const RESOLVED_FILE: &str = "resolved";

/// Metadata file inside a record.
pub const META_FILE: &str = "meta.json";

/// Content fingerprint of a merge triple.
///
/// Each input is length-prefixed (u64 LE) so shifting bytes between inputs
/// changes the fingerprint.
#[must_use]
pub fn fingerprint(base: &[u8], ours: &[u8], theirs: &[u8]) -> String {
    let mut hasher = Sha256::new();
    for part in [base, ours, theirs] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for b in &digest {
        let _ = write!(hex, "{b:02x}");
    }
    hex
}

/// Is `s` shaped like a fingerprint (64 lowercase hex chars)?
#[must_use]
pub fn is_fingerprint(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Where a cached resolution came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionSource {
    Package,
    Shipped,
    User,
}

impl ResolutionSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Package => "package",
            Self::Shipped => "shipped",
            Self::User => "user",
        }
    }
}

/// A cache hit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedResolution {
    pub content: Vec<u8>,
    pub source: ResolutionSource,
}

/// `meta.json` of a resolution record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionMeta {
    pub fingerprint: String,
    /// Project-relative path the conflict was in when recorded.
    pub path: String,
    /// Unix timestamp (seconds).
    pub recorded_at: u64,
}

/// Layered resolution cache.
#[derive(Clone, Debug)]
pub struct ResolutionCache {
    shipped: Vec<(PathBuf, ResolutionSource)>,
    user: PathBuf,
}

impl ResolutionCache {
    /// Cache over the project's shipped and user areas.
    #[must_use]
    pub fn new(layout: &Layout) -> Self {
        Self {
            shipped: vec![(layout.shipped_resolutions_dir(), ResolutionSource::Shipped)],
            user: layout.user_resolutions_dir(),
        }
    }

    /// Put a package's shipped resolutions ahead of everything else.
    #[must_use]
    pub fn with_package(mut self, dir: PathBuf) -> Self {
        self.shipped.insert(0, (dir, ResolutionSource::Package));
        self
    }

    /// First recorded resolution for `fp`, in lookup order.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] if a record exists but cannot be read.
    pub fn lookup(&self, fp: &str) -> Result<Option<CachedResolution>, EngineError> {
        if !is_fingerprint(fp) {
            return Ok(None);
        }
        let layers = self
            .shipped
            .iter()
            .map(|(dir, src)| (dir.as_path(), *src))
            .chain(std::iter::once((self.user.as_path(), ResolutionSource::User)));
        for (dir, source) in layers {
            let path = dir.join(fp).join(RESOLVED_FILE);
            if let Some(content) =
                fs_util::read_optional(&path).map_err(|e| EngineError::io_at(e, &path))?
            {
                debug!(fingerprint = fp, source = source.as_str(), "resolution cache hit");
                return Ok(Some(CachedResolution { content, source }));
            }
        }
        Ok(None)
    }

    /// Record a user resolution.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] on write failure.
    pub fn save(&self, fp: &str, path: &str, content: &[u8]) -> Result<(), EngineError> {
        if !is_fingerprint(fp) {
            return Err(EngineError::ResolutionNotFound {
                fingerprint: fp.to_owned(),
            });
        }
        let record = self.user.join(fp);
        let resolved = record.join(RESOLVED_FILE);
        fs_util::write_atomic(&resolved, content).map_err(|e| EngineError::io_at(e, &resolved))?;

        let meta = ResolutionMeta {
            fingerprint: fp.to_owned(),
            path: path.to_owned(),
            recorded_at: unix_now(),
        };
        let json = serde_json::to_string_pretty(&meta).map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        let meta_path = record.join(META_FILE);
        fs_util::write_atomic(&meta_path, json.as_bytes()).map_err(|e| EngineError::io_at(e, &meta_path))
    }

    /// User-recorded resolutions, sorted by fingerprint.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] if the directory cannot be listed.
    pub fn list_user(&self) -> Result<Vec<ResolutionMeta>, EngineError> {
        read_records(&self.user)
    }

    /// Drop every user-recorded resolution.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] on failure.
    pub fn clear_user(&self) -> Result<(), EngineError> {
        fs_util::remove_dir_if_exists(&self.user).map_err(|e| EngineError::io_at(e, &self.user))?;
        fs::create_dir_all(&self.user).map_err(|e| EngineError::io_at(e, &self.user))
    }
}

/// Read `meta.json` of every record directory under `dir`.
pub(crate) fn read_records<T: for<'de> Deserialize<'de>>(dir: &Path) -> Result<Vec<T>, EngineError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(EngineError::io_at(e, dir)),
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| is_fingerprint(n))
        .collect();
    names.sort();

    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let meta_path = dir.join(&name).join(META_FILE);
        let Ok(contents) = fs::read_to_string(&meta_path) else {
            continue;
        };
        match serde_json::from_str(&contents) {
            Ok(meta) => out.push(meta),
            Err(e) => debug!(path = %meta_path.display(), error = %e, "skipping unreadable record"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_position_sensitive() {
        let a = fingerprint(b"base", b"ours", b"theirs");
        assert_eq!(a, fingerprint(b"base", b"ours", b"theirs"));
        assert!(is_fingerprint(&a));
        assert_ne!(a, fingerprint(b"bas", b"eours", b"theirs"));
        assert_ne!(a, fingerprint(b"base", b"theirs", b"ours"));
    }

    #[test]
    fn lookup_order_package_shipped_user() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let pkg = dir.path().join("pkg/resolutions");
        let fp = fingerprint(b"b", b"o", b"t");

        let cache = ResolutionCache::new(&layout).with_package(pkg.clone());
        assert!(cache.lookup(&fp).unwrap().is_none());

        cache.save(&fp, "src/a.ts", b"user").unwrap();
        assert_eq!(cache.lookup(&fp).unwrap().unwrap().source, ResolutionSource::User);

        fs_util::write_file(&layout.shipped_resolutions_dir().join(&fp).join(RESOLVED_FILE), b"shipped").unwrap();
        let hit = cache.lookup(&fp).unwrap().unwrap();
        assert_eq!((hit.source, hit.content.as_slice()), (ResolutionSource::Shipped, b"shipped".as_slice()));

        fs_util::write_file(&pkg.join(&fp).join(RESOLVED_FILE), b"package").unwrap();
        let hit = cache.lookup(&fp).unwrap().unwrap();
        assert_eq!((hit.source, hit.content.as_slice()), (ResolutionSource::Package, b"package".as_slice()));
    }

    #[test]
    fn list_and_clear_user() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResolutionCache::new(&Layout::new(dir.path()));
        let fp = fingerprint(b"1", b"2", b"3");
        cache.save(&fp, "x.ts", b"resolved").unwrap();

        let listed = cache.list_user().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "x.ts");

        cache.clear_user().unwrap();
        assert!(cache.list_user().unwrap().is_empty());
        assert!(cache.lookup(&fp).unwrap().is_none());
    }

    #[test]
    fn malformed_fingerprint_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResolutionCache::new(&Layout::new(dir.path()));
        assert!(cache.lookup("../../etc").unwrap().is_none());
        assert!(cache.save("../x", "a", b"b").is_err());
    }
}

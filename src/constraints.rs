// src/constraints.rs

//! Environmental preconditions for starting transfers: network reachability
//! and free space on the download volume.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub trait Constraints: Send + Sync {
    fn network_available(&self) -> bool;
    /// Bytes available to unprivileged writers on the volume holding `path`.
    fn available_storage(&self, path: &Path) -> io::Result<u64>;
}

/// Reads free space from the filesystem. There is no portable link-state
/// probe, so the network is assumed up and outages surface as transient
/// transfer failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConstraints;

impl Constraints for SystemConstraints {
    fn network_available(&self) -> bool {
        true
    }

    fn available_storage(&self, path: &Path) -> io::Result<u64> {
        // The download root may not exist yet; measure its nearest ancestor.
        let existing = path
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or_else(|| Path::new("."));
        free_bytes(existing)
    }
}

#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn free_bytes(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: statvfs is plain old data, and `c_path` is NUL-terminated and outlives the call.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let r = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_bytes(_path: &Path) -> io::Result<u64> {
    Ok(u64::MAX)
}

/// Constraints pushed in by the host (e.g. a mobile shell that knows
/// connectivity and storage state better than we do).
#[derive(Debug)]
pub struct ManualConstraints {
    network: AtomicBool,
    storage: AtomicU64,
}

impl ManualConstraints {
    pub fn new(network: bool, storage: u64) -> Self {
        Self {
            network: AtomicBool::new(network),
            storage: AtomicU64::new(storage),
        }
    }

    pub fn set_network(&self, available: bool) {
        self.network.store(available, Ordering::SeqCst);
    }

    pub fn set_storage(&self, bytes: u64) {
        self.storage.store(bytes, Ordering::SeqCst);
    }
}

impl Default for ManualConstraints {
    fn default() -> Self {
        Self::new(true, u64::MAX)
    }
}

impl Constraints for ManualConstraints {
    fn network_available(&self) -> bool {
        self.network.load(Ordering::SeqCst)
    }

    fn available_storage(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.storage.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_storage_for_missing_dir_uses_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not/yet/created");
        let free = SystemConstraints.available_storage(&missing).unwrap();
        assert!(free > 0);
    }

    #[test]
    fn manual_constraints_follow_updates() {
        let c = ManualConstraints::default();
        assert!(c.network_available());
        c.set_network(false);
        c.set_storage(42);
        assert!(!c.network_available());
        assert_eq!(c.available_storage(Path::new("/")).unwrap(), 42);
    }
}

//! Shared handles to mounted NTFS volumes.

use std::path::Path;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::{Result, WimError};
use crate::ntfs::{NtfsMounter, NtfsVolumeOps};

struct VolumeShared {
    ops: Mutex<Box<dyn NtfsVolumeOps>>,
    source: String,
}

impl Drop for VolumeShared {
    fn drop(&mut self) {
        debug!("releasing NTFS volume {}", self.source);
    }
}

/// A reference-counted read-only NTFS volume.
///
/// Cloning a `Volume` is cheap and shares the underlying backend; the backend
/// is released when the last handle is dropped. Blob descriptors hold clones,
/// so the volume outlives the capture driver as long as any deferred payload
/// still points into it.
///
/// The backend is not thread-safe; every access goes through an internal lock,
/// which serializes attribute reads issued by a multithreaded hashing or
/// writing pipeline.
#[derive(Clone)]
pub struct Volume {
    shared: Arc<VolumeShared>,
}

impl Volume {
    /// Mount the NTFS filesystem on `device` read-only through the given
    /// platform binding.
    pub fn mount_readonly(device: &Path, mounter: &dyn NtfsMounter) -> Result<Volume> {
        let describe = device.display().to_string();
        let ops = mounter
            .mount_readonly(device)
            .map_err(|_| WimError::MountFailed(describe.clone()))?;
        debug!("mounted NTFS volume {describe} read-only");
        Ok(Self::from_ops(ops, describe))
    }

    /// Wrap an already-mounted backend, e.g. an in-memory one for tests.
    pub fn from_ops(ops: Box<dyn NtfsVolumeOps>, source: impl Into<String>) -> Volume {
        Volume {
            shared: Arc::new(VolumeShared {
                ops: Mutex::new(ops),
                source: source.into(),
            }),
        }
    }

    /// Run `f` with exclusive access to the volume backend.
    pub fn with_ops<T>(&self, f: impl FnOnce(&mut dyn NtfsVolumeOps) -> T) -> T {
        let mut guard = self
            .shared
            .ops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(guard.as_mut())
    }

    /// Whether two handles refer to the same mounted volume.
    pub fn same_volume(a: &Volume, b: &Volume) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }

    /// The device path or description this volume was opened from.
    pub fn source(&self) -> &str {
        &self.shared.source
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("source", &self.shared.source)
            .finish()
    }
}

pub mod backup;
pub mod cache;
pub mod config;
pub mod delta;
pub mod envelope;
pub mod model;
pub mod pipe;
pub mod restore;
pub mod snapshot;
mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[allow(non_upper_case_globals)]
const KiB: usize = 1024;
#[allow(non_upper_case_globals)]
const MiB: usize = 1024 * KiB;

/// Size of pipe buffers responsible for streaming data between threads.
pub const PIPE_BUFFER_SIZE: usize = 128 * KiB;

/// Size of the read buffer for file I/O.
const IO_BUFFER_SIZE: usize = 64 * KiB;

/// High-water mark for reusable scratch buffers. A buffer whose capacity
/// grows past this is dropped and recreated instead of being retained.
const MEMORY_LIMIT: usize = 10 * MiB;

/// Version written into snapshot and signature-cache headers.
pub const FORMAT_VERSION: u16 = 1;

/// Cooperative cancellation flag threaded through the backup and restore
/// drivers. Checked before each walk entry and each restored entry.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            anyhow::bail!("operation cancelled");
        }
        Ok(())
    }
}

/// Returns the machine hostname as a UTF-8 string.
pub fn hostname() -> anyhow::Result<String> {
    let name = nix::unistd::gethostname()?;
    Ok(name.to_string_lossy().into_owned())
}

//! Per-path serialization of filesystem mutations
//!
//! Sessions that run concurrently must not interleave two mutations of the
//! same path (two uploads to one name, RMDIR racing an upload into it, ...).
//! Each absolute path gets its own async mutex, created on first use and
//! dropped from the table once nobody holds or awaits it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub type PathGuard = OwnedMutexGuard<()>;

#[derive(Clone, Default)]
pub struct PathLocks {
    table: Arc<Mutex<HashMap<PathBuf, Weak<AsyncMutex<()>>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `path`. Held until the guard drops.
    pub async fn lock(&self, path: &Path) -> PathGuard {
        let slot = {
            let mut table = self.table.lock();
            table.retain(|_, w| w.strong_count() > 0);
            match table.get(path).and_then(Weak::upgrade) {
                Some(slot) => slot,
                None => {
                    let slot = Arc::new(AsyncMutex::new(()));
                    table.insert(path.to_path_buf(), Arc::downgrade(&slot));
                    slot
                }
            }
        };
        slot.lock_owned().await
    }

    /// Number of paths currently tracked.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        let mut table = self.table.lock();
        table.retain(|_, w| w.strong_count() > 0);
        table.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

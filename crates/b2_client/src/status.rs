//! Registry of live transfers.
//!
//! Writers and readers register on creation and deregister when dropped; the
//! registry lock is only ever held for registration and snapshotting, never
//! across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Point-in-time progress of one transfer.
#[derive(Clone, Debug)]
pub struct TransferProgress {
    pub object: String,
    pub chunks_done: u64,
    /// Not known for writers until the stream ends.
    pub chunks_total: Option<u64>,
}

/// Everything the client is moving right now.
#[derive(Clone, Debug, Default)]
pub struct StatusSnapshot {
    pub writers: Vec<TransferProgress>,
    pub readers: Vec<TransferProgress>,
}

pub(crate) struct ProgressCell {
    object: String,
    done: AtomicU64,
    /// Zero means unknown.
    total: AtomicU64,
}

impl ProgressCell {
    fn snapshot(&self) -> TransferProgress {
        let total = self.total.load(Ordering::Relaxed);
        TransferProgress {
            object: self.object.clone(),
            chunks_done: self.done.load(Ordering::Relaxed),
            chunks_total: (total > 0).then_some(total),
        }
    }
}

/// Cloneable counter workers use to report completed chunks.
#[derive(Clone)]
pub(crate) struct ProgressTicker {
    cell: Arc<ProgressCell>,
}

impl ProgressTicker {
    pub(crate) fn tick(&self) {
        self.cell.done.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum TransferKind {
    Writer,
    Reader,
}

#[derive(Default)]
struct Tables {
    next_id: u64,
    writers: HashMap<u64, Arc<ProgressCell>>,
    readers: HashMap<u64, Arc<ProgressCell>>,
}

#[derive(Default)]
pub(crate) struct StatusRegistry {
    tables: Mutex<Tables>,
}

impl StatusRegistry {
    pub(crate) fn register(
        self: &Arc<Self>,
        kind: TransferKind,
        object: String,
    ) -> StatusHandle {
        let cell = Arc::new(ProgressCell {
            object,
            done: AtomicU64::new(0),
            total: AtomicU64::new(0),
        });
        let mut tables = self.tables.lock().unwrap();
        tables.next_id += 1;
        let id = tables.next_id;
        match kind {
            TransferKind::Writer => tables.writers.insert(id, cell.clone()),
            TransferKind::Reader => tables.readers.insert(id, cell.clone()),
        };
        StatusHandle {
            registry: Arc::downgrade(self),
            kind,
            id,
            cell,
        }
    }

    pub(crate) fn snapshot(&self) -> StatusSnapshot {
        let tables = self.tables.lock().unwrap();
        StatusSnapshot {
            writers: tables.writers.values().map(|c| c.snapshot()).collect(),
            readers: tables.readers.values().map(|c| c.snapshot()).collect(),
        }
    }
}

/// One transfer's registration; deregisters on drop.
pub(crate) struct StatusHandle {
    registry: Weak<StatusRegistry>,
    kind: TransferKind,
    id: u64,
    cell: Arc<ProgressCell>,
}

impl StatusHandle {
    pub(crate) fn ticker(&self) -> ProgressTicker {
        ProgressTicker {
            cell: self.cell.clone(),
        }
    }

    pub(crate) fn set_total(&self, total: u64) {
        self.cell.total.store(total, Ordering::Relaxed);
    }
}

impl Drop for StatusHandle {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut tables = registry.tables.lock().unwrap();
        match self.kind {
            TransferKind::Writer => tables.writers.remove(&self.id),
            TransferKind::Reader => tables.readers.remove(&self.id),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_shows_up_in_snapshots_until_drop() {
        let registry = Arc::new(StatusRegistry::default());
        let handle = registry.register(TransferKind::Writer, "obj".into());
        handle.ticker().tick();
        handle.ticker().tick();
        handle.set_total(5);

        let snap = registry.snapshot();
        assert_eq!(snap.writers.len(), 1);
        assert!(snap.readers.is_empty());
        assert_eq!(snap.writers[0].object, "obj");
        assert_eq!(snap.writers[0].chunks_done, 2);
        assert_eq!(snap.writers[0].chunks_total, Some(5));

        drop(handle);
        assert!(registry.snapshot().writers.is_empty());
    }
}

//! Background eviction and journal compaction
//!
//! A single worker thread waits on a channel with room for one pending
//! request. Scheduling while a request is already queued is a no-op, so a
//! burst of commits costs one compaction pass rather than a backlog.

use crate::cache::Shared;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

pub(crate) struct Compactor {
    requests: Mutex<Option<SyncSender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Compactor {
    /// Start the worker. It only holds a weak reference, so dropping the
    /// last cache handle also stops it.
    pub fn spawn(shared: Weak<Shared>) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);

        let worker = thread::Builder::new()
            .name("disk-lru-compactor".to_string())
            .spawn(move || run(rx, shared));

        match worker {
            Ok(handle) => Self {
                requests: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(handle)),
            },
            Err(e) => {
                // Eviction still happens on flush and close
                error!(error = %e, "Failed to start cache compactor thread");
                Self {
                    requests: Mutex::new(None),
                    worker: Mutex::new(None),
                }
            }
        }
    }

    /// Ask the worker for a compaction pass
    pub fn schedule(&self) {
        let requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = requests.as_ref() {
            match tx.try_send(()) {
                Ok(()) => debug!("Scheduled cache compaction"),
                Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {
                    warn!("Cache compactor is no longer running")
                }
            }
        }
    }

    /// Stop accepting requests and wait for the worker to exit
    pub fn shutdown(&self) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("Cache compactor thread panicked");
            }
        }
    }
}

fn run(requests: Receiver<()>, shared: Weak<Shared>) {
    while requests.recv().is_ok() {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if let Err(e) = shared.compact() {
            warn!(error = %e, "Background cache compaction failed");
        }
    }
    debug!("Cache compactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DiskLruCache;
    use std::io::Write;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_commit_over_budget_trims_in_background() {
        let dir = tempdir().unwrap();
        let cache = DiskLruCache::open(dir.path(), 1, 1, 10).unwrap();

        for key in ["a", "b", "c"] {
            let mut editor = cache.edit(key).unwrap().unwrap();
            editor
                .new_output_stream(0)
                .unwrap()
                .write_all(b"123456")
                .unwrap();
            editor.commit().unwrap();
        }

        assert!(wait_until(|| cache.size() <= 10));
        assert!(cache.get("c").unwrap().is_some());
    }

    #[test]
    fn test_redundant_journal_is_compacted_in_background() {
        let dir = tempdir().unwrap();
        let cache = DiskLruCache::open(dir.path(), 1, 1, 1024).unwrap();

        let mut editor = cache.edit("k1").unwrap().unwrap();
        editor.set_string(0, "v").unwrap();
        editor.commit().unwrap();

        for _ in 0..2500 {
            cache.get("k1").unwrap().unwrap();
        }

        assert!(wait_until(|| cache.stats().redundant_ops < 2000));
    }

    #[test]
    fn test_schedule_while_queued_is_noop() {
        // No worker drains the queue, so every request stays visible
        let (tx, rx) = mpsc::sync_channel(1);
        let compactor = Compactor {
            requests: Mutex::new(Some(tx)),
            worker: Mutex::new(None),
        };

        for _ in 0..5 {
            compactor.schedule();
        }
        assert_eq!(rx.try_iter().count(), 1);

        compactor.schedule();
        assert_eq!(rx.try_iter().count(), 1);

        compactor.shutdown();
        compactor.schedule();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_stops_worker() {
        let dir = tempdir().unwrap();
        let cache = DiskLruCache::open(dir.path(), 1, 1, 1024).unwrap();
        cache.close().unwrap();

        // Closing joins the worker, scheduling afterwards is harmless
        assert!(cache.is_closed());
        cache.close().unwrap();
    }
}

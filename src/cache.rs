//! Cache Controller
//!
//! Tables declare one of three caching strategies:
//! - `None`: decoded records stay resident, the sweeper ignores the table
//! - `RetainForever`: as `None`, and explicit release requests are refused
//! - `SlidingTimeout`: records are cleared once the table has been idle for
//!   the configured time, then reloaded from disk on the next access
//!
//! A single sweeper thread per registry visits the watched tables on a fixed
//! interval. It takes the same per-table lock as callers, but only with a
//! bounded wait, so a busy table is simply skipped until the next pass.

use crate::error::Result;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A table whose decoded records can be dropped
pub trait Evictable: Send + Sync {
    fn table_name(&self) -> &str;

    /// Clear the in-memory records if the table has been idle past its
    /// timeout. Returns whether anything was cleared.
    fn evict_if_idle(&self, now: Instant) -> bool;
}

/// Why a table's in-memory records were dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    IdleTimeout,
    Requested,
}

/// Memory-cleared notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCleared {
    pub table: String,
    pub reason: ClearReason,
    pub records_released: usize,
}

/// Last-access clock for one table
#[derive(Debug)]
pub struct AccessTracker {
    last_access: Mutex<Instant>,
    timeout: Option<Duration>,
}

impl AccessTracker {
    pub fn new(timeout: Option<Duration>) -> Self {
        AccessTracker {
            last_access: Mutex::new(Instant::now()),
            timeout,
        }
    }

    /// Re-arm the sliding timer
    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_access.lock())
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match self.timeout {
            Some(timeout) => self.idle_for(now) >= timeout,
            None => false,
        }
    }
}

/// Sweeper statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub watched_tables: usize,
    pub sweeps: u64,
    pub evictions: u64,
    pub running: bool,
}

struct SweepState {
    tables: Mutex<Vec<Weak<dyn Evictable>>>,
    sweeps: AtomicU64,
    evictions: AtomicU64,
}

impl SweepState {
    fn sweep(&self, now: Instant) -> usize {
        let live: Vec<Arc<dyn Evictable>> = {
            let mut tables = self.tables.lock();
            tables.retain(|t| t.strong_count() > 0);
            tables.iter().filter_map(Weak::upgrade).collect()
        };

        let mut evicted = 0;
        for table in live {
            if table.evict_if_idle(now) {
                evicted += 1;
            }
        }

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }
}

struct Worker {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
    thread_id: ThreadId,
}

/// Owns the background sweeper
pub struct CacheController {
    state: Arc<SweepState>,
    worker: Mutex<Option<Worker>>,
    interval: Duration,
}

impl CacheController {
    pub fn new(interval: Duration) -> Self {
        CacheController {
            state: Arc::new(SweepState {
                tables: Mutex::new(Vec::new()),
                sweeps: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start sweeping a table; spawns the sweeper on first use
    pub fn watch(&self, table: &Arc<dyn Evictable>) -> Result<()> {
        self.state.tables.lock().push(Arc::downgrade(table));
        debug!(table = %table.table_name(), "Watching table for idle eviction");
        self.ensure_running()
    }

    pub fn unwatch(&self, name: &str) {
        self.state
            .tables
            .lock()
            .retain(|t| t.upgrade().map(|t| t.table_name() != name).unwrap_or(false));
    }

    /// Run one sweep on the calling thread
    pub fn sweep_now(&self) -> usize {
        self.state.sweep(Instant::now())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            watched_tables: self.state.tables.lock().len(),
            sweeps: self.state.sweeps.load(Ordering::Relaxed),
            evictions: self.state.evictions.load(Ordering::Relaxed),
            running: self.worker.lock().is_some(),
        }
    }

    /// Stop the sweeper and wait for it to exit
    pub fn shutdown(&self) {
        let worker = match self.worker.lock().take() {
            Some(worker) => worker,
            None => return,
        };

        let _ = worker.shutdown.send(());
        if worker.thread_id == thread::current().id() {
            warn!("Sweeper shut down from its own thread; not joining");
            return;
        }
        if worker.handle.join().is_err() {
            warn!("Sweeper thread panicked");
        }
        info!("Stopped cache sweeper");
    }

    fn ensure_running(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let (shutdown, receiver) = channel::bounded::<()>(1);
        let state = Arc::clone(&self.state);
        let interval = self.interval;

        let handle = thread::Builder::new()
            .name("flatstore-sweeper".to_string())
            .spawn(move || loop {
                match receiver.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let evicted = state.sweep(Instant::now());
                        if evicted > 0 {
                            debug!(evicted, "Sweep released idle tables");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        info!(interval_ms = interval.as_millis() as u64, "Started cache sweeper");
        *worker = Some(Worker {
            shutdown,
            thread_id: handle.thread().id(),
            handle,
        });
        Ok(())
    }
}

impl Drop for CacheController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FakeTable {
        name: String,
        tracker: AccessTracker,
        loaded: AtomicBool,
    }

    impl Evictable for FakeTable {
        fn table_name(&self) -> &str {
            &self.name
        }

        fn evict_if_idle(&self, now: Instant) -> bool {
            self.tracker.is_expired(now) && self.loaded.swap(false, Ordering::SeqCst)
        }
    }

    fn fake(name: &str, timeout_ms: u64) -> Arc<FakeTable> {
        Arc::new(FakeTable {
            name: name.to_string(),
            tracker: AccessTracker::new(Some(Duration::from_millis(timeout_ms))),
            loaded: AtomicBool::new(true),
        })
    }

    #[test]
    fn test_tracker_expiry() {
        let tracker = AccessTracker::new(Some(Duration::from_millis(50)));
        let now = Instant::now();
        assert!(!tracker.is_expired(now));
        assert!(tracker.is_expired(now + Duration::from_millis(60)));

        let forever = AccessTracker::new(None);
        assert!(!forever.is_expired(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_manual_sweep() {
        let controller = CacheController::new(Duration::from_secs(3600));
        let table = fake("Sessions", 10);
        let handle: Arc<dyn Evictable> = table.clone();
        controller.watch(&handle).unwrap();

        assert_eq!(controller.sweep_now(), 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(controller.sweep_now(), 1);
        assert!(!table.loaded.load(Ordering::SeqCst));
        assert_eq!(controller.stats().evictions, 1);
    }

    #[test]
    fn test_background_sweeper_evicts_and_joins() {
        let controller = CacheController::new(Duration::from_millis(10));
        let table = fake("Sessions", 20);
        let handle: Arc<dyn Evictable> = table.clone();
        controller.watch(&handle).unwrap();
        assert!(controller.stats().running);

        let deadline = Instant::now() + Duration::from_secs(5);
        while table.loaded.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!table.loaded.load(Ordering::SeqCst));

        controller.shutdown();
        assert!(!controller.stats().running);
    }

    #[test]
    fn test_dropped_tables_are_forgotten() {
        let controller = CacheController::new(Duration::from_secs(3600));
        {
            let table: Arc<dyn Evictable> = fake("Gone", 1);
            controller.watch(&table).unwrap();
        }
        controller.sweep_now();
        assert_eq!(controller.stats().watched_tables, 0);

        let kept: Arc<dyn Evictable> = fake("Kept", 1);
        controller.watch(&kept).unwrap();
        controller.unwatch("Kept");
        assert_eq!(controller.stats().watched_tables, 0);
    }
}

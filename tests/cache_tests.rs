//! Caching strategies and the background sweeper

mod common;

use common::*;
use flatstore_core::*;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_sliding_table_is_evicted_and_reloaded() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(&temp_dir);
    let sessions = Table::<Session>::open(&registry).unwrap();

    let cleared = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&cleared);
    sessions.on_memory_cleared(move |event| sink.lock().unwrap().push(event.clone()));

    let mut session = Session::new("abc123");
    sessions.insert(&mut session).unwrap();
    assert!(sessions.is_loaded().unwrap());

    assert!(
        wait_until(Duration::from_secs(5), || !cleared.lock().unwrap().is_empty()),
        "sweeper never cleared the idle table"
    );
    {
        let events = cleared.lock().unwrap();
        assert_eq!(events[0].table, "Sessions");
        assert_eq!(events[0].reason, ClearReason::IdleTimeout);
        assert_eq!(events[0].records_released, 1);
    }
    assert!(!sessions.is_loaded().unwrap());

    // metadata does not need the records
    assert_eq!(sessions.record_count().unwrap(), 1);
    assert!(!sessions.is_loaded().unwrap());

    assert_eq!(sessions.select().unwrap(), vec![session]);
    assert!(sessions.is_loaded().unwrap());
}

#[test]
fn test_mutation_after_eviction_reloads() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(&temp_dir);
    let sessions = Table::<Session>::open(&registry).unwrap();

    let mut first = Session::new("one");
    sessions.insert(&mut first).unwrap();
    assert!(wait_until(Duration::from_secs(5), || !sessions.is_loaded().unwrap()));

    let mut second = Session::new("two");
    sessions.insert(&mut second).unwrap();
    assert_eq!(second.id.value(), 1);
    assert_eq!(sessions.select().unwrap(), vec![first, second]);
}

#[test]
fn test_unswept_strategies_stay_resident() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(&temp_dir);
    let customers = Table::<Customer>::open(&registry).unwrap();
    let settings = Table::<Setting>::open(&registry).unwrap();

    thread::sleep(Duration::from_millis(4 * SESSION_TIMEOUT_MS as u64));
    assert!(customers.is_loaded().unwrap());
    assert!(settings.is_loaded().unwrap());
}

#[test]
fn test_release_memory_by_strategy() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(&temp_dir);
    let customers = Table::<Customer>::open(&registry).unwrap();
    let settings = Table::<Setting>::open(&registry).unwrap();

    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    customers.on_memory_cleared(move |event| sink.lock().unwrap().push(event.reason));

    let mut ann = Customer::new("ann", 1, "ann@example.com");
    customers.insert(&mut ann).unwrap();

    assert!(customers.release_memory().unwrap());
    assert!(!customers.release_memory().unwrap(), "nothing left to release");
    assert!(!customers.is_loaded().unwrap());
    assert_eq!(*reasons.lock().unwrap(), vec![ClearReason::Requested]);

    assert_eq!(customers.select_id(ann.id.value()).unwrap(), Some(ann));

    assert!(!settings.release_memory().unwrap());
    assert!(settings.is_loaded().unwrap());
}

#[test]
fn test_reference_check_reloads_evicted_target() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(&temp_dir);
    let customers = Table::<Customer>::open(&registry).unwrap();
    let orders = Table::<Order>::open(&registry).unwrap();

    let mut ann = Customer::new("ann", 1, "ann@example.com");
    customers.insert(&mut ann).unwrap();
    customers.release_memory().unwrap();

    let mut order = Order::new(ann.id.value(), 3);
    orders.insert(&mut order).unwrap();
    assert!(customers.is_loaded().unwrap());
}

#[test]
fn test_negative_sliding_timeout_is_out_of_range() {
    #[derive(Clone, Serialize, Deserialize)]
    struct Broken {
        id: RowId,
    }

    impl Record for Broken {
        fn descriptor() -> TableDescriptor {
            TableDescriptor::new("Broken").with_caching(CachingStrategy::sliding(-5))
        }

        fn row_id(&self) -> &RowId {
            &self.id
        }

        fn row_id_mut(&mut self) -> &mut RowId {
            &mut self.id
        }

        fn property(&self, _name: &str) -> Option<PropertyValue> {
            None
        }
    }

    let temp_dir = TempDir::new().unwrap();
    let registry = registry(&temp_dir);
    let err = Table::<Broken>::open(&registry).unwrap_err();
    assert!(err.is_out_of_range());
    assert!(!temp_dir.path().join("Broken.fst").exists());
}

#[test]
fn test_registry_shutdown_stops_sweeping() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(&temp_dir);
    let sessions = Table::<Session>::open(&registry).unwrap();
    let mut session = Session::new("kept");
    sessions.insert(&mut session).unwrap();

    registry.shutdown();
    thread::sleep(Duration::from_millis(4 * SESSION_TIMEOUT_MS as u64));
    assert!(sessions.is_loaded().unwrap());

    // open tables keep working, new ones are refused
    assert_eq!(sessions.select().unwrap().len(), 1);
    assert!(Table::<Customer>::open(&registry).unwrap_err().is_disposed());
}

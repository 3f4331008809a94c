// Copyright 2025-2026 CEMAXECUTER LLC

//! The device factory: parallel discovery plus reference-counted,
//! argument-keyed device construction.
//!
//! `make` deduplicates by the markup-serialized argument string, and
//! additionally by the args discovered during enumeration, so a caller
//! asking for `"driver=hackrf"` shares the instance with one asking for
//! `"driver=hackrf, serial=..."`. The factory lock is released around
//! driver construction and disposal so other factory calls never wait on
//! driver I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::args::{parse_kwargs, serialize_kwargs, Kwargs};
use crate::device::Device;
use crate::registry;
use crate::Error;

struct Entry {
    device: Arc<dyn Device>,
    count: usize,
}

#[derive(Default)]
struct FactoryState {
    by_args: HashMap<String, u64>,
    entries: HashMap<u64, Entry>,
    next_id: u64,
}

static FACTORY: OnceLock<Mutex<FactoryState>> = OnceLock::new();

fn factory() -> &'static Mutex<FactoryState> {
    FACTORY.get_or_init(|| Mutex::new(FactoryState::default()))
}

/// Enumerate devices across all registered drivers in parallel.
///
/// A `driver=` key in the filter args restricts the search to one driver.
/// Each result is tagged with the driver that produced it. A failing
/// driver is logged and does not stop the others.
pub fn enumerate(markup: &str) -> Vec<Kwargs> {
    enumerate_kwargs(&parse_kwargs(markup))
}

pub fn enumerate_kwargs(args: &Kwargs) -> Vec<Kwargs> {
    registry::ensure_builtin_drivers();
    let filter = args.get("driver").cloned();
    let descriptors: Vec<_> = registry::drivers()
        .into_iter()
        .filter(|d| filter.as_deref().map_or(true, |f| f == d.name))
        .collect();

    let mut results = Vec::new();
    let scope_result = crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = descriptors
            .iter()
            .map(|d| {
                let d = *d;
                (d.name, scope.spawn(move |_| (d.find)(args)))
            })
            .collect();
        for (name, handle) in handles {
            match handle.join() {
                Ok(Ok(found)) => {
                    for mut kw in found {
                        kw.insert("driver".to_string(), name.to_string());
                        results.push(kw);
                    }
                }
                Ok(Err(e)) => log::warn!("driver \"{}\" enumeration failed: {}", name, e),
                Err(_) => log::error!("driver \"{}\" enumeration panicked", name),
            }
        }
    });
    if scope_result.is_err() {
        log::error!("device enumeration scope failed");
    }
    results
}

/// Make (or share) a device for the given markup args.
pub fn make(markup: &str) -> Result<Arc<dyn Device>, Error> {
    make_kwargs(&parse_kwargs(markup))
}

pub fn make_kwargs(args: &Kwargs) -> Result<Arc<dyn Device>, Error> {
    registry::ensure_builtin_drivers();
    let caller_key = serialize_kwargs(args);

    // Fast path: an instance already keyed by the caller's exact args.
    {
        let mut state = factory().lock().unwrap();
        if let Some(&id) = state.by_args.get(&caller_key) {
            let entry = state.entries.get_mut(&id).expect("table invariant");
            entry.count += 1;
            return Ok(Arc::clone(&entry.device));
        }
    }

    // Discovery happens without the lock; drivers may spend a while on
    // USB I/O here.
    let discovered = enumerate_kwargs(args).into_iter().next();
    let discovered_key = discovered.as_ref().map(serialize_kwargs);

    // Re-check under the discovered-args key: someone who asked with
    // more (or fewer) args may already own this hardware.
    if let Some(dkey) = &discovered_key {
        let mut state = factory().lock().unwrap();
        if let Some(&id) = state.by_args.get(dkey) {
            let entry = state.entries.get_mut(&id).expect("table invariant");
            entry.count += 1;
            let device = Arc::clone(&entry.device);
            state.by_args.insert(caller_key, id);
            return Ok(device);
        }
    }

    // Merge: discovered args win; caller-supplied args fill the gaps.
    let mut merged = discovered.clone().unwrap_or_default();
    for (key, value) in args {
        merged.entry(key.clone()).or_insert_with(|| value.clone());
    }

    let descriptor = match merged.get("driver") {
        Some(name) => {
            registry::driver(name.as_str()).ok_or_else(|| Error::UnknownDriver(name.clone()))?
        }
        None => {
            let drivers = registry::drivers();
            if drivers.len() > 1 {
                return Err(Error::NoDevice(caller_key));
            }
            drivers
                .into_iter()
                .next()
                .ok_or_else(|| Error::NoDevice(caller_key.clone()))?
        }
    };

    // Construct with the lock released.
    let device = (descriptor.make)(&merged)?;

    let insert_key = discovered_key.unwrap_or_else(|| caller_key.clone());
    let mut state = factory().lock().unwrap();
    if let Some(&id) = state.by_args.get(&insert_key) {
        // A concurrent make won the race; adopt its instance and let ours
        // dispose after the lock drops.
        let entry = state.entries.get_mut(&id).expect("table invariant");
        entry.count += 1;
        let winner = Arc::clone(&entry.device);
        state.by_args.insert(caller_key, id);
        drop(state);
        drop(device);
        return Ok(winner);
    }
    let id = state.next_id;
    state.next_id += 1;
    state.by_args.insert(insert_key.clone(), id);
    if caller_key != insert_key {
        state.by_args.insert(caller_key, id);
    }
    state.entries.insert(
        id,
        Entry {
            device: Arc::clone(&device),
            count: 1,
        },
    );
    Ok(device)
}

/// Release one factory reference. At zero the device is removed from the
/// table and disposed with the lock released.
pub fn unmake(device: &Arc<dyn Device>) -> Result<(), Error> {
    let mut state = factory().lock().unwrap();
    let id = state
        .entries
        .iter()
        .find(|(_, entry)| Arc::ptr_eq(&entry.device, device))
        .map(|(&id, _)| id)
        .ok_or_else(|| {
            Error::InvalidArgs("device handle was not created by the factory".to_string())
        })?;

    let entry = state.entries.get_mut(&id).expect("table invariant");
    entry.count -= 1;
    if entry.count == 0 {
        let entry = state.entries.remove(&id).expect("table invariant");
        state.by_args.retain(|_, v| *v != id);
        drop(state);
        // Dispose outside the lock; this is the last factory reference.
        drop(entry.device);
    }
    Ok(())
}

/// Number of live factory-owned device instances.
pub fn active_devices() -> usize {
    factory().lock().unwrap().entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_is_refcounted_and_deduplicated() {
        let a = make("driver=null, serial=factory-a").unwrap();
        let b = make("driver=null, serial=factory-a").unwrap();
        assert!(Arc::ptr_eq(&a, &b), "same args share one instance");

        unmake(&a).unwrap();
        // Still alive: b holds the second reference.
        let c = make("driver=null, serial=factory-a").unwrap();
        assert!(Arc::ptr_eq(&b, &c));
        unmake(&b).unwrap();
        unmake(&c).unwrap();

        // Fully released: a fresh make constructs a new instance.
        let d = make("driver=null, serial=factory-a").unwrap();
        assert!(!Arc::ptr_eq(&a, &d));
        unmake(&d).unwrap();
    }

    #[test]
    fn test_double_keyed_lookup_shares_instance() {
        // The null driver reports serial "0" by default, so a bare make
        // and a serial-qualified make resolve to the same hardware.
        let bare = make("driver=null, label=dedup-test").unwrap();
        let qualified = make("driver=null, label=dedup-test, serial=0").unwrap();
        assert!(Arc::ptr_eq(&bare, &qualified));
        unmake(&bare).unwrap();
        unmake(&qualified).unwrap();
    }

    #[test]
    fn test_unmake_rejects_foreign_device() {
        let device = make("driver=null, serial=factory-foreign").unwrap();
        unmake(&device).unwrap();
        assert!(unmake(&device).is_err(), "already released");
    }

    #[test]
    fn test_unknown_driver() {
        match make("driver=imaginary") {
            Err(Error::UnknownDriver(name)) => assert_eq!(name, "imaginary"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_enumerate_tags_driver_and_respects_filter() {
        let found = enumerate("driver=null");
        assert!(!found.is_empty());
        for kw in &found {
            assert_eq!(kw.get("driver").map(String::as_str), Some("null"));
        }

        let none = enumerate("driver=imaginary");
        assert!(none.is_empty());
    }
}

// Copyright 2025 CEMAXECUTER LLC

//! Process-wide driver library sessions.
//!
//! Some native libraries pair a global `init` with a global `exit`. A
//! [`DriverSession`] reference-counts that pair across every device the
//! driver opens: the first acquirer runs `init`, the last released guard
//! runs `exit`, and the whole exchange is serialized by the session lock
//! so reacquiring after a release neither leaks nor double-inits.

use std::sync::Mutex;

use crate::Error;

pub struct DriverSession {
    name: &'static str,
    count: Mutex<usize>,
}

pub struct SessionGuard {
    session: &'static DriverSession,
    exit: Box<dyn Fn() -> i32 + Send + Sync>,
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("session", &self.session.name)
            .finish_non_exhaustive()
    }
}

impl DriverSession {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            count: Mutex::new(0),
        }
    }

    /// Acquire the session, running `init` if this is the first holder.
    pub fn acquire<I, E>(&'static self, init: I, exit: E) -> Result<SessionGuard, Error>
    where
        I: FnOnce() -> i32,
        E: Fn() -> i32 + Send + Sync + 'static,
    {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            let code = init();
            if code != 0 {
                return Err(Error::Driver {
                    driver: self.name,
                    op: "init",
                    code,
                });
            }
        }
        *count += 1;
        Ok(SessionGuard {
            session: self,
            exit: Box::new(exit),
        })
    }

    #[cfg(test)]
    fn holders(&self) -> usize {
        *self.count.lock().unwrap()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut count = self.session.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            let code = (self.exit)();
            if code != 0 {
                log::warn!("{}: library exit failed ({})", self.session.name, code);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static INITS: AtomicUsize = AtomicUsize::new(0);
    static EXITS: AtomicUsize = AtomicUsize::new(0);
    static SESSION: DriverSession = DriverSession::new("mock");

    #[test]
    fn test_session_refcount() {
        let init = || {
            INITS.fetch_add(1, Ordering::SeqCst);
            0
        };
        let exit = || {
            EXITS.fetch_add(1, Ordering::SeqCst);
            0
        };

        let a = SESSION.acquire(init, exit).unwrap();
        assert_eq!(INITS.load(Ordering::SeqCst), 1);
        assert_eq!(SESSION.holders(), 1);

        let b = SESSION.acquire(init, exit).unwrap();
        assert_eq!(INITS.load(Ordering::SeqCst), 1, "second acquire must not re-init");
        assert_eq!(SESSION.holders(), 2);

        drop(a);
        assert_eq!(EXITS.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(EXITS.load(Ordering::SeqCst), 1, "last release runs exit");

        // Reacquire after full release: init runs again, exactly once.
        let c = SESSION.acquire(init, exit).unwrap();
        assert_eq!(INITS.load(Ordering::SeqCst), 2);
        drop(c);
        assert_eq!(EXITS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_init_leaves_session_unheld() {
        static FAILING: DriverSession = DriverSession::new("failing");
        let err = FAILING.acquire(|| -3, || 0).unwrap_err();
        match err {
            Error::Driver { driver, op, code } => {
                assert_eq!(driver, "failing");
                assert_eq!(op, "init");
                assert_eq!(code, -3);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(FAILING.holders(), 0);
        assert!(FAILING.acquire(|| 0, || 0).is_ok());
    }
}

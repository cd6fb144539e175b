//! Process-global sandbox toggle around contract execution.
//!
//! The `smartcontract` database role keeps non-deterministic SQL out of
//! contract code; this flag covers the host side. While it is set, nothing
//! on the contract path may observe the wall clock, randomness, the
//! filesystem or the network. Host work that interleaves with an executing
//! contract (logging, signal handling, error reporting) must run through
//! [`suspended`] so the flag is restored afterwards.

use std::sync::atomic::{AtomicBool, Ordering};

static SANDBOXED: AtomicBool = AtomicBool::new(false);

/// True while contract code is executing.
pub fn active() -> bool {
    SANDBOXED.load(Ordering::SeqCst)
}

/// Enter the sandbox; dropping the guard leaves it.
pub fn enter() -> SandboxGuard {
    SANDBOXED.store(true, Ordering::SeqCst);
    SandboxGuard { _private: () }
}

/// Run host-side work with the sandbox temporarily lifted, restoring the
/// previous state afterwards.
pub fn suspended<T>(f: impl FnOnce() -> T) -> T {
    let was_active = SANDBOXED.swap(false, Ordering::SeqCst);
    let result = f();
    SANDBOXED.store(was_active, Ordering::SeqCst);
    result
}

pub struct SandboxGuard {
    _private: (),
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        SANDBOXED.store(false, Ordering::SeqCst);
    }
}

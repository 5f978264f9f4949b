//! Per-CPU identity.
//!
//! Every host thread that enters the kernel behaves as its own logical CPU.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Id that never names a CPU.
pub const INVALID_CPUID: usize = 0;

static NEXT_CPUID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CPUID: usize = NEXT_CPUID.fetch_add(1, Ordering::Relaxed);
}

/// Returns current CPU's ID.
pub fn current_id() -> usize {
    CPUID.with(|id| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_per_thread() {
        let here = current_id();
        assert_ne!(here, INVALID_CPUID);
        assert_eq!(here, current_id());
        let there = std::thread::spawn(current_id).join().unwrap();
        assert_ne!(here, there);
    }
}

//! Cooperative shutdown flag shared between a controller and a run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cloneable flag: any clone can trigger it, every clone observes it.
///
/// Triggering is one-way. The simulation loop polls it between events; the
/// live channel sets it on `done` or on a transport error.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let signal = ShutdownSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_triggered());

        signal.trigger();
        assert!(observer.is_triggered());

        signal.trigger();
        assert!(signal.is_triggered());
    }

    #[test]
    fn trigger_from_another_thread() {
        let signal = ShutdownSignal::new();
        let remote = signal.clone();
        std::thread::spawn(move || remote.trigger())
            .join()
            .expect("thread joins");
        assert!(signal.is_triggered());
    }
}

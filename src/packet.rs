//! # Dispatch Packets and Signals
//!
//! The host-facing launch descriptor and the completion signal it carries.
//! A packet is a plain value the host fills in; the core consumes it when
//! constructing a grid and touches the signal exactly once, when the grid
//! drains.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// A shared countdown signal, decremented by the core and waitable by the
/// host.
#[derive(Debug, Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

#[derive(Debug)]
struct SignalInner {
    value: Mutex<i64>,
    condvar: Condvar,
}

impl Signal {
    /// Create a signal with the given initial value.
    pub fn new(initial: i64) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                value: Mutex::new(initial),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Current value.
    pub fn value(&self) -> i64 {
        *self.inner.value.lock()
    }

    /// Decrement the value by one and wake every waiter.
    pub fn decrement(&self) {
        let mut value = self.inner.value.lock();
        *value -= 1;
        self.inner.condvar.notify_all();
    }

    /// Block until the value drops to `target` or below.
    pub fn wait_until(&self, target: i64) {
        let mut value = self.inner.value.lock();
        while *value > target {
            self.inner.condvar.wait(&mut value);
        }
    }
}

/// A kernel-dispatch descriptor, filled in by the host.
#[derive(Debug, Clone)]
pub struct DispatchPacket {
    /// Number of live grid dimensions, 1 to 3.
    pub dimensions: u32,
    /// Grid extent per axis, in work-items. Unused axes are 1.
    pub grid_size: [u32; 3],
    /// Work-group extent per axis, in work-items.
    pub workgroup_size: [u32; 3],
    /// Opaque handle of the kernel to run, as issued by the executable.
    pub kernel_object: u64,
    /// Flat address of the host-staged kernel-argument image, or zero if
    /// the kernel takes no arguments.
    pub kernarg_address: u32,
    /// Private-segment bytes to reserve per work-item.
    pub private_segment_size: u32,
    /// Group-segment bytes to reserve per work-group.
    pub group_segment_size: u32,
    /// Signal decremented once when the whole grid completes.
    pub completion_signal: Signal,
}

impl DispatchPacket {
    /// Total number of work-items in the grid.
    pub fn grid_items(&self) -> u64 {
        self.grid_size.iter().map(|&n| n as u64).product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_decrement() {
        let signal = Signal::new(2);
        assert_eq!(signal.value(), 2);
        signal.decrement();
        signal.decrement();
        assert_eq!(signal.value(), 0);
        // Already satisfied, returns immediately.
        signal.wait_until(0);
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let signal = Signal::new(1);
        let waiter = signal.clone();
        let handle = std::thread::spawn(move || waiter.wait_until(0));
        signal.decrement();
        handle.join().unwrap();
        assert_eq!(signal.value(), 0);
    }

    #[test]
    fn test_grid_items() {
        let packet = DispatchPacket {
            dimensions: 3,
            grid_size: [4, 3, 2],
            workgroup_size: [2, 1, 1],
            kernel_object: 1,
            kernarg_address: 0,
            private_segment_size: 0,
            group_segment_size: 0,
            completion_signal: Signal::new(1),
        };
        assert_eq!(packet.grid_items(), 24);
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::traits::AcceleratorAccess;

#[derive(Clone)]
pub struct Semaphore {
    state: Arc<SemaphoreState>,
}

struct SemaphoreState {
    count: Mutex<usize>,
    condition: Condvar,
}

pub struct SemaphoreGuard {
    state: Arc<SemaphoreState>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Arc::new(SemaphoreState {
                count: Mutex::new(permits),
                condition: Condvar::new(),
            }),
        }
    }

    pub fn acquire(&self) -> SemaphoreGuard {
        let mut count = self.state.count.lock();
        self.state.condition.wait_while(&mut count, |&mut c| c == 0);
        *count -= 1;
        SemaphoreGuard {
            state: self.state.clone(),
        }
    }

    pub fn available_permits(&self) -> usize {
        *self.state.count.lock()
    }
}

impl SemaphoreGuard {
    fn release(&self) {
        let mut count = self.state.count.lock();
        *count += 1;
        self.state.condition.notify_one();
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Serializes calls into a backend that owns an accelerator exclusively.
///
/// Backends that run on the CPU or tolerate sharing pass straight through.
/// Clones share one permit.
#[derive(Clone)]
pub struct DeviceGate {
    semaphore: Option<Semaphore>,
}

impl DeviceGate {
    pub fn for_access(access: AcceleratorAccess) -> Self {
        let semaphore = match access {
            AcceleratorAccess::Exclusive { .. } => Some(Semaphore::new(1)),
            AcceleratorAccess::None | AcceleratorAccess::Shared => None,
        };
        Self { semaphore }
    }

    pub const fn is_serialized(&self) -> bool {
        self.semaphore.is_some()
    }

    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.semaphore.as_ref().map(|semaphore| {
            trace!("Waiting for accelerator");
            semaphore.acquire()
        });
        f()
    }

    /// True when both gates hand out the same permit.
    pub fn shares_permit_with(&self, other: &Self) -> bool {
        match (&self.semaphore, &other.semaphore) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a.state, &b.state),
            _ => false,
        }
    }
}

/// One gate per physical device, handed to every component that runs on it.
#[derive(Default)]
pub struct DeviceGates {
    devices: HashMap<i32, DeviceGate>,
}

impl DeviceGates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate_for(&mut self, access: AcceleratorAccess) -> DeviceGate {
        match access {
            AcceleratorAccess::Exclusive { device_id } => self
                .devices
                .entry(device_id)
                .or_insert_with(|| DeviceGate::for_access(access))
                .clone(),
            AcceleratorAccess::None | AcceleratorAccess::Shared => DeviceGate::for_access(access),
        }
    }
}

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use misaka_types::process::ProcId;

use super::Process;
use crate::{error::KernelError, sync::SpinLock};

/// Generation-checked reference to a process table slot.
///
/// A handle outlives the process it names; once the slot is reused the
/// generation no longer matches and lookups return `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcHandle {
    index: u32,
    generation: u32,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    proc: Option<Arc<Process>>,
}

pub struct ProcTable {
    slots: Box<[SpinLock<Slot>]>,
    next_pid: AtomicU32,
}

impl ProcTable {
    pub fn new(nproc: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: (0..nproc).map(|_| SpinLock::new(Slot::default())).collect(),
            next_pid: AtomicU32::new(1),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn allocate_pid(&self) -> ProcId {
        loop {
            let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
            if let Some(pid) = ProcId::from_raw(pid) {
                return pid;
            }
        }
    }

    /// Finds an unused slot and installs the process built by `build`.
    pub(crate) fn allocate<F>(&self, build: F) -> Result<Arc<Process>, KernelError>
    where
        F: FnOnce(ProcId, ProcHandle) -> Process,
    {
        for (index, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.lock();
            if slot.proc.is_some() {
                continue;
            }
            let handle = ProcHandle {
                index: u32::try_from(index).map_err(|_e| KernelError::NoFreeProc)?,
                generation: slot.generation,
            };
            let p = Arc::new(build(self.allocate_pid(), handle));
            slot.proc = Some(Arc::clone(&p));
            return Ok(p);
        }
        Err(KernelError::NoFreeProc)
    }

    /// Releases the slot of an exited process.
    pub(crate) fn free(&self, handle: ProcHandle) {
        let Some(slot) = self.slots.get(handle.index as usize) else {
            return;
        };
        let mut slot = slot.lock();
        if slot.generation == handle.generation {
            slot.generation = slot.generation.wrapping_add(1);
            let p = slot.proc.take();
            drop(slot);
            drop(p);
        }
    }

    pub fn get(&self, handle: ProcHandle) -> Option<Arc<Process>> {
        let slot = self.slots.get(handle.index as usize)?.lock();
        if slot.generation != handle.generation {
            return None;
        }
        slot.proc.clone()
    }

    pub fn find(&self, pid: ProcId) -> Option<Arc<Process>> {
        self.slots.iter().find_map(|slot| {
            let slot = slot.lock();
            slot.proc.as_ref().filter(|p| p.pid() == pid).map(Arc::clone)
        })
    }

    /// Snapshot of every live process.
    pub fn processes(&self) -> Vec<Arc<Process>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.lock().proc.clone())
            .collect()
    }

    /// Snapshot of the members of process group `pgid`.
    pub fn group(&self, pgid: ProcId) -> Vec<Arc<Process>> {
        self.processes()
            .into_iter()
            .filter(|p| p.pgid() == pgid)
            .collect()
    }

    /// Logs a process listing.
    ///
    /// For debugging.
    pub fn dump(&self) {
        for p in self.processes() {
            log::info!("{:5} {:<10} {}", p.pid(), p.state().to_string(), p.name());
        }
    }
}

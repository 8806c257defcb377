//! Processes, as far as virtual memory is concerned.
//!
//! There is no real scheduler here: the table tracks which process is
//! current, `switch_to` changes address spaces explicitly, and `kill` is the
//! teardown path both the fault handler and callers use. Pid 0 is the null
//! process; it runs on the kernel page directory and cannot be killed.

use alloc::string::String;
use alloc::vec::Vec;

use crate::machine::Machine;
use crate::memory::layout::PhysAddr;
use crate::memory::vspace::RegionList;
use crate::memory::{self, KillReason, Vm, VmError};

pub type Pid = u32;

/// Size of the process table.
pub const NPROC: usize = 32;

/// The null process.
pub const NULL_PID: Pid = 0;

/// One process.
pub struct Process {
    pub pid: Pid,
    pub name: String,
    /// User processes have a private page directory and a heap; the null
    /// process has neither.
    pub user: bool,
    pub page_dir: PhysAddr,
    pub regions: RegionList,
    /// Pages currently reserved in the heap, in pages.
    pub vpages: u32,
}

/// The process table.
pub struct ProcTable {
    slots: Vec<Option<Process>>,
    current: Pid,
    /// A page directory whose owner died while running on it. Freed on the
    /// next address-space switch.
    deferred_pd: Option<PhysAddr>,
}

impl ProcTable {
    pub fn new() -> ProcTable {
        let mut slots: Vec<Option<Process>> = (0..NPROC).map(|_| None).collect();
        slots[NULL_PID as usize] = Some(Process {
            pid: NULL_PID,
            name: String::from("null"),
            user: false,
            page_dir: PhysAddr::NULL,
            regions: RegionList::new(),
            vpages: 0,
        });
        ProcTable {
            slots,
            current: NULL_PID,
            deferred_pd: None,
        }
    }

    pub fn current(&self) -> Pid {
        self.current
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.get(pid as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.get_mut(pid as usize)?.as_mut()
    }

    /// Live processes, in pid order.
    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    fn free_slot(&self) -> Option<usize> {
        (1..NPROC).find(|&i| self.slots[i].is_none())
    }
}

/// Create a user process: a free table slot, a page directory sharing the
/// kernel's mappings, a heap of one free region, and zeroed accounting.
pub fn vcreate(
    machine: &mut Machine,
    vm: &mut Vm,
    procs: &mut ProcTable,
    name: &str,
) -> Result<Pid, VmError> {
    let slot = procs.free_slot().ok_or(VmError::ProcessLimit)?;
    let pd = memory::vm_create(machine, vm).ok_or(VmError::OutOfMemory)?;
    let pid = slot as Pid;
    procs.slots[slot] = Some(Process {
        pid,
        name: String::from(name),
        user: true,
        page_dir: pd,
        regions: RegionList::new(),
        vpages: 0,
    });
    log::info!("pid {} ({}) created", pid, name);
    Ok(pid)
}

/// Terminate `pid`, reclaiming everything it owns. If it is the current
/// process, the switch back to the null process happens here and the page
/// directory is freed only after that switch.
pub fn kill(
    machine: &mut Machine,
    vm: &mut Vm,
    procs: &mut ProcTable,
    pid: Pid,
    diag: Option<KillReason>,
) -> Result<(), VmError> {
    if pid == NULL_PID {
        return Err(VmError::InvalidArgument);
    }
    let proc = procs
        .slots
        .get_mut(pid as usize)
        .and_then(Option::take)
        .ok_or(VmError::NoSuchProcess)?;
    match diag {
        Some(reason) => log::error!("pid {} ({}) killed: {}", pid, proc.name, reason),
        None => log::info!("pid {} ({}) exited", pid, proc.name),
    }

    let was_current = procs.current == pid;
    let deferred = memory::vm_cleanup(machine, vm, pid, proc.page_dir, was_current);
    if was_current {
        procs.deferred_pd = deferred;
        switch_to(machine, vm, procs, NULL_PID).expect("null process missing");
    }
    Ok(())
}

/// Switch the current process: bind the target's address space (flushing the
/// TLB) and release any page directory whose teardown was deferred.
pub fn switch_to(
    machine: &mut Machine,
    vm: &mut Vm,
    procs: &mut ProcTable,
    pid: Pid,
) -> Result<(), VmError> {
    let pd = match procs.get(pid) {
        Some(p) if p.user => p.page_dir,
        Some(_) => vm.kernel_pd,
        None => return Err(VmError::NoSuchProcess),
    };
    procs.current = pid;
    machine.bind(pd);
    // Nothing runs on the dead directory anymore.
    if let Some(old_pd) = procs.deferred_pd.take() {
        vm.pt_pool.free(old_pd);
    }
    Ok(())
}

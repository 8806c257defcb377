//! The memory management subsystem.
//!
//! Everything lives in a [`Vm`] value built once at boot: the three frame
//! pools, the clock hand, and the kernel page directory. Nothing here is a
//! process-wide global; the kernel object threads `&mut Vm` through the
//! fault handler and the heap calls.

use core::fmt;

use crate::machine::Machine;
use crate::process::{Pid, Process};

pub use self::frames::{FfsPool, PtPool, SwapPool};
pub use self::swap::{SwapEvent, SwapTrace};

pub mod frames;
pub mod layout;
pub mod paging;
pub mod pte;
pub mod swap;
pub mod vspace;

use self::layout::{PhysAddr, VirtAddr, PAGE_SIZE, SWAP_END, VHEAP_END, VHEAP_START};
use self::pte::{Pte, PteState};

/// Failures reported to the caller of a VM operation. These have no side
/// effects; the harsher failure modes (segfault, out of memory on a fault)
/// kill the offending process instead of returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Null pointer, zero size, or a pid that names nothing.
    InvalidArgument,
    /// Heap calls are for user processes only.
    NotUser,
    /// No free region fits the request.
    OutOfMemory,
    /// The span to free is not a whole number of allocated regions.
    NotAllocated,
    /// No such process.
    NoSuchProcess,
    /// The process table is full.
    ProcessLimit,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmError::InvalidArgument => "invalid argument",
            VmError::NotUser => "not a user process",
            VmError::OutOfMemory => "out of memory",
            VmError::NotAllocated => "span not allocated",
            VmError::NoSuchProcess => "no such process",
            VmError::ProcessLimit => "process table full",
        };
        f.write_str(s)
    }
}

/// Why a process was killed by the fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    SegmentationFault,
    OutOfMemory,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillReason::SegmentationFault => f.write_str("SEGMENTATION_FAULT"),
            KillReason::OutOfMemory => f.write_str("OUT_OF_MEMORY"),
        }
    }
}

/// The memory subsystem.
pub struct Vm {
    pub pt_pool: PtPool,
    pub ffs: FfsPool,
    pub swap: SwapPool,
    /// The persistent clock hand, an FFS index.
    pub clock_hand: usize,
    pub trace: SwapTrace,
    /// Whether the replacement engine may evict. With this off, FFS
    /// exhaustion is terminal for the faulting process.
    pub swap_enabled: bool,
    /// The kernel page directory every process shares its low mappings with.
    pub kernel_pd: PhysAddr,
}

impl Vm {
    /// Build the subsystem: fresh pools, and a kernel page directory
    /// identity-mapping everything up to the end of the swap area.
    pub fn init(machine: &mut Machine, swap_enabled: bool) -> Vm {
        let mut pt_pool = PtPool::new();
        let kernel_pd = pt_pool
            .alloc(&mut machine.phys)
            .expect("page-table pool exhausted at boot");
        paging::map_region(
            machine,
            &mut pt_pool,
            kernel_pd,
            VirtAddr(0),
            VirtAddr(SWAP_END),
        );
        log::info!(
            "kernel page tables inited - {} table frames used",
            layout::MAX_PT_SIZE - pt_pool.free_frames()
        );
        Vm {
            pt_pool,
            ffs: FfsPool::new(),
            swap: SwapPool::new(),
            clock_hand: 0,
            trace: SwapTrace::new(),
            swap_enabled,
            kernel_pd,
        }
    }
}

/// Allocate heap pages for `proc`. Rounds up to pages, walks the region list
/// once, and returns the first address of the reservation. No frame is
/// touched until the pages are first accessed.
pub fn vmalloc(proc: &mut Process, nbytes: u32) -> Result<VirtAddr, VmError> {
    if !proc.user {
        return Err(VmError::NotUser);
    }
    if nbytes == 0 {
        return Err(VmError::InvalidArgument);
    }
    let npages = (nbytes - 1) / PAGE_SIZE + 1;
    let va = proc.regions.allocate(npages).ok_or(VmError::OutOfMemory)?;
    proc.vpages += npages;
    Ok(va)
}

/// Free heap pages of `proc`. The page-rounded span must be a whole number
/// of allocated regions; partial frees and double frees are rejected with no
/// side effects. Mapped pages give their frame back, swapped pages give
/// their slot back, and each mapped page's stale translation is dropped.
pub fn vfree(
    machine: &mut Machine,
    vm: &mut Vm,
    proc: &mut Process,
    ptr: VirtAddr,
    nbytes: u32,
) -> Result<(), VmError> {
    if !proc.user {
        return Err(VmError::NotUser);
    }
    if ptr == VirtAddr::NULL || nbytes == 0 {
        return Err(VmError::InvalidArgument);
    }
    let start = ptr.page_base();
    // The end rounds up in 64 bits so a span touching the top of the address
    // space cannot wrap.
    let end = (ptr.0 as u64 + nbytes as u64 + (PAGE_SIZE as u64 - 1)) & !(PAGE_SIZE as u64 - 1);
    if (start.0 as u64) < VHEAP_START as u64 || end > VHEAP_END as u64 + 1 {
        return Err(VmError::NotAllocated);
    }
    let npages = ((end - start.0 as u64) / PAGE_SIZE as u64) as u32;
    if !proc.regions.covers_exactly(start, npages) {
        return Err(VmError::NotAllocated);
    }

    for i in 0..npages {
        let va = start.offset(i * PAGE_SIZE);
        let Some(entry) = paging::lookup(machine, proc.page_dir, va) else {
            continue;
        };
        match machine.phys.read_entry(entry).state() {
            PteState::Mapped(frame) => {
                vm.ffs.free(frame);
                machine.phys.write_entry(entry, Pte::EMPTY);
                machine.invlpg(va);
            }
            PteState::Swapped(slot) => {
                vm.swap.free(slot);
                machine.phys.write_entry(entry, Pte::EMPTY);
            }
            PteState::Absent => {}
        }
    }

    proc.regions.release(start, npages);
    proc.vpages -= npages;
    Ok(())
}

/// Build the VM half of a new user process: a zeroed page directory sharing
/// the kernel's low mappings. `None` if the table pool is out of frames.
pub fn vm_create(machine: &mut Machine, vm: &mut Vm) -> Option<PhysAddr> {
    let pd = vm.pt_pool.alloc(&mut machine.phys)?;
    let kernel_dirs = (SWAP_END >> 22) as u32;
    for i in 0..kernel_dirs {
        let entry = machine.phys.read_entry(vm.kernel_pd.offset(i * 4));
        machine.phys.write_entry(pd.offset(i * 4), entry);
    }
    Some(pd)
}

/// Tear down the VM state of a dying process: every FFS frame and swap slot
/// it owns, then its heap page tables. The page directory itself is freed
/// too, unless `defer_pd` is set, in which case it is returned so the caller
/// can release it after the address-space switch (the dying process may
/// still be running on it).
pub fn vm_cleanup(
    machine: &mut Machine,
    vm: &mut Vm,
    pid: Pid,
    pd: PhysAddr,
    defer_pd: bool,
) -> Option<PhysAddr> {
    let frames = vm.ffs.release_owned(pid);
    let slots = vm.swap.release_owned(pid);

    let first = (VHEAP_START >> 22) as u32;
    let last = (VHEAP_END >> 22) as u32;
    for i in first..=last {
        let entry = machine.phys.read_entry(pd.offset(i * 4));
        if let PteState::Mapped(table) = entry.state() {
            if table != PhysAddr::NULL {
                vm.pt_pool.free(table);
            }
        }
    }

    log::debug!(
        "pid {}: reclaimed {} frames, {} swap slots",
        pid,
        frames,
        slots
    );

    if defer_pd {
        Some(pd)
    } else {
        vm.pt_pool.free(pd);
        None
    }
}

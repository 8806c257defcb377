//! A teaching kernel's demand-paged virtual memory, runnable on a host.
//!
//! Each user process gets a private heap at `[256MiB, 512MiB)`. `vmalloc`
//! only reserves addresses; the first touch of a page takes a fault, and the
//! handler binds a frame from the bounded FFS pool, evicting to swap with a
//! clock when the pool runs dry. See the `memory` module for the machinery
//! and `machine` for the modeled hardware.
//!
//! The whole system is one [`Kernel`] value:
//!
//! ```
//! use demos::{BootConfig, Kernel};
//!
//! let mut kernel = Kernel::boot(BootConfig::default());
//! let pid = kernel.vcreate("hello").unwrap();
//! kernel.switch_to(pid).unwrap();
//! let va = kernel.vmalloc(8192).unwrap();
//! kernel.store_byte(va, b'*').unwrap();
//! assert_eq!(kernel.load_byte(va).unwrap(), b'*');
//! assert_eq!(kernel.used_ffs_frames(pid), 1); // the second page never faulted
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod debug;
pub mod machine;
pub mod memory;
pub mod process;
pub mod trap;

use crate::debug::MappingAudit;
use crate::machine::{IrqFlag, Machine, Translation};
use crate::memory::layout::{FFS_FRAMES, SWAP_SLOTS};
use crate::memory::paging;
use crate::memory::pte::{PteFlags, PteState};
use crate::memory::Vm;
use crate::process::ProcTable;

pub use crate::memory::layout::{PhysAddr, VirtAddr, PAGE_SIZE};
pub use crate::memory::paging::FaultOutcome;
pub use crate::memory::swap::SwapEvent;
pub use crate::memory::{KillReason, VmError};
pub use crate::process::Pid;

/// Boot-time knobs.
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// Enable the replacement engine. Off, FFS exhaustion kills the
    /// faulting process; on, it evicts.
    pub swapping: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig { swapping: false }
    }
}

/// The kernel: the machine it runs on, the memory subsystem, and the
/// process table. Built once per boot; everything dispatches through it.
pub struct Kernel {
    irq: IrqFlag,
    machine: Machine,
    vm: Vm,
    procs: ProcTable,
}

impl Kernel {
    /// Bring the system up: backed physical memory, kernel page tables
    /// identity-mapping everything below the end of swap, fresh pools, and
    /// the null process.
    pub fn boot(config: BootConfig) -> Kernel {
        let mut machine = Machine::new();
        log::info!(
            "physical memory inited - {} FFS frames, {} swap slots",
            FFS_FRAMES,
            SWAP_SLOTS
        );
        let vm = Vm::init(&mut machine, config.swapping);
        machine.bind(vm.kernel_pd);
        log::info!(
            "paging inited - swapping {}",
            if config.swapping { "on" } else { "off" }
        );
        Kernel {
            irq: IrqFlag::new(),
            machine,
            vm,
            procs: ProcTable::new(),
        }
    }

    /// Create a user process with a fresh address space and an empty heap.
    pub fn vcreate(&mut self, name: &str) -> Result<Pid, VmError> {
        let Kernel {
            irq,
            machine,
            vm,
            procs,
        } = self;
        let _irq = irq.disable();
        process::vcreate(machine, vm, procs, name)
    }

    /// Terminate `pid` and reclaim all of its memory.
    pub fn kill(&mut self, pid: Pid) -> Result<(), VmError> {
        let Kernel {
            irq,
            machine,
            vm,
            procs,
        } = self;
        let _irq = irq.disable();
        process::kill(machine, vm, procs, pid, None)
    }

    /// Make `pid` the current process and bind its address space.
    pub fn switch_to(&mut self, pid: Pid) -> Result<(), VmError> {
        let Kernel {
            irq,
            machine,
            vm,
            procs,
        } = self;
        let _irq = irq.disable();
        process::switch_to(machine, vm, procs, pid)
    }

    /// Reserve heap pages for the current process. Nothing is mapped until
    /// the pages are touched.
    pub fn vmalloc(&mut self, nbytes: u32) -> Result<VirtAddr, VmError> {
        let Kernel { irq, procs, .. } = self;
        let _irq = irq.disable();
        let pid = procs.current();
        let proc = procs.get_mut(pid).ok_or(VmError::NoSuchProcess)?;
        memory::vmalloc(proc, nbytes)
    }

    /// Release heap pages of the current process.
    pub fn vfree(&mut self, ptr: VirtAddr, nbytes: u32) -> Result<(), VmError> {
        let Kernel {
            irq,
            machine,
            vm,
            procs,
        } = self;
        let _irq = irq.disable();
        let pid = procs.current();
        let proc = procs.get_mut(pid).ok_or(VmError::NoSuchProcess)?;
        memory::vfree(machine, vm, proc, ptr, nbytes)
    }

    /// Run the page-fault handler against the address latched in CR2.
    pub fn handle_pagefault(&mut self) -> FaultOutcome {
        let Kernel {
            irq,
            machine,
            vm,
            procs,
        } = self;
        let _irq = irq.disable();
        paging::handle_fault(machine, vm, procs)
    }

    /// A user-mode store to `va`. Faults and retries like the hardware; if
    /// the fault handler kills the process, the reason comes back as the
    /// error.
    pub fn store_byte(&mut self, va: VirtAddr, val: u8) -> Result<(), KillReason> {
        self.access(va, Some(val)).map(|_| ())
    }

    /// A user-mode load from `va`.
    pub fn load_byte(&mut self, va: VirtAddr) -> Result<u8, KillReason> {
        self.access(va, None)
    }

    /// Store a buffer byte by byte starting at `va`.
    pub fn write_bytes(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), KillReason> {
        for (i, &b) in data.iter().enumerate() {
            self.store_byte(va.offset(i as u32), b)?;
        }
        Ok(())
    }

    /// Load `buf.len()` bytes starting at `va`.
    pub fn read_bytes(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), KillReason> {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.load_byte(va.offset(i as u32))?;
        }
        Ok(())
    }

    /// One user access: TLB, then the page tables, then a fault. The loop
    /// runs at most twice; after a handled fault the retry must hit.
    fn access(&mut self, va: VirtAddr, write: Option<u8>) -> Result<u8, KillReason> {
        for _ in 0..2 {
            if let Some(val) = self.try_access(va, write) {
                return Ok(val);
            }
            self.machine.cr2 = va;
            match self.handle_pagefault() {
                FaultOutcome::Handled => continue,
                FaultOutcome::Killed(reason) => return Err(reason),
            }
        }
        panic!("access at {} still faults after a handled page fault", va);
    }

    /// Translate and perform the access, or `None` to raise a fault. Mirrors
    /// the MMU: a TLB fill walks the tables and sets the accessed bit, a
    /// write sets the dirty bit.
    fn try_access(&mut self, va: VirtAddr, write: Option<u8>) -> Option<u8> {
        let Kernel { machine, procs, .. } = self;
        let proc = procs.get(procs.current())?;
        debug_assert!(proc.user, "user access from the null process");
        let pd = proc.page_dir;
        let vpage = va.page_number();

        let t = match machine.tlb.lookup(vpage) {
            Some(t) => {
                if !t.user || (write.is_some() && !t.writable) {
                    return None;
                }
                if write.is_some() && !t.dirty {
                    let entry = paging::lookup(machine, pd, va)?;
                    let pte = machine.phys.read_entry(entry);
                    machine.phys.write_entry(entry, pte.with(PteFlags::DIRTY));
                    machine.tlb.set_dirty(vpage);
                }
                t
            }
            None => {
                let entry = paging::lookup(machine, pd, va)?;
                let pte = machine.phys.read_entry(entry);
                let (frame, flags) = match pte.state() {
                    PteState::Mapped(frame) => (frame, pte.flags()),
                    _ => return None,
                };
                if !flags.contains(PteFlags::USER) {
                    return None;
                }
                let writable = flags.contains(PteFlags::WRITABLE);
                if write.is_some() && !writable {
                    return None;
                }
                let mut updated = pte.with(PteFlags::ACCESSED);
                if write.is_some() {
                    updated = updated.with(PteFlags::DIRTY);
                }
                machine.phys.write_entry(entry, updated);
                let t = Translation {
                    frame,
                    writable,
                    user: true,
                    dirty: updated.flags().contains(PteFlags::DIRTY),
                };
                machine.tlb.fill(vpage, t);
                t
            }
        };

        let pa = t.frame.offset(va.page_offset());
        Some(match write {
            Some(val) => {
                machine.phys.write_byte(pa, val);
                val
            }
            None => machine.phys.read_byte(pa),
        })
    }

    // Introspection, mostly for the test suites.

    /// Free frames left in FFS.
    pub fn free_ffs_pages(&self) -> usize {
        self.vm.ffs.free_frames()
    }

    /// Free slots left in the swap area.
    pub fn free_swap_pages(&self) -> usize {
        self.vm.swap.free_slots()
    }

    /// FFS frames currently owned by `pid`.
    pub fn used_ffs_frames(&self, pid: Pid) -> usize {
        self.vm.ffs.used_by(pid)
    }

    /// Heap pages currently reserved by `pid`.
    pub fn allocated_virtual_pages(&self, pid: Pid) -> usize {
        self.procs.get(pid).map(|p| p.vpages as usize).unwrap_or(0)
    }

    /// Swap slots currently owned by `pid`.
    pub fn used_swap_slots(&self, pid: Pid) -> usize {
        self.vm.swap.used_by(pid)
    }

    pub fn current_pid(&self) -> Pid {
        self.procs.current()
    }

    /// Where the clock hand points right now.
    pub fn clock_hand(&self) -> usize {
        self.vm.clock_hand
    }

    /// Every eviction and swap-in so far, oldest first.
    pub fn swap_events(&self) -> &[SwapEvent] {
        self.vm.trace.events()
    }

    /// Totals: (pages swapped out, pages swapped in).
    pub fn swap_counts(&self) -> (u64, u64) {
        (self.vm.trace.swapped_out, self.vm.trace.swapped_in)
    }

    /// Physical address `va` maps to in `pid`'s address space, if mapped.
    pub fn translate(&self, pid: Pid, va: VirtAddr) -> Option<PhysAddr> {
        let proc = self.procs.get(pid)?;
        paging::translate(&self.machine, proc.page_dir, va)
    }

    /// Number of regions in `pid`'s heap list.
    pub fn heap_regions(&self, pid: Pid) -> usize {
        self.procs.get(pid).map(|p| p.regions.region_count()).unwrap_or(0)
    }

    /// Cross-check every PTE against the frame and slot records.
    pub fn audit_mappings(&self) -> Result<MappingAudit, &'static str> {
        debug::audit_mappings(&self.machine, &self.vm, &self.procs)
    }

    /// The modeled hardware, for tests that poke registers directly.
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }
}

//! Two-level page-table walking and the page-fault handler.
//!
//! A page directory holds 1024 entries of 4MiB each; a page table holds 1024
//! page entries. Both levels use the entry format in [`super::pte`]. The
//! walker hands out the physical address of the leaf entry so callers can
//! read-modify-write it through the machine model; it never touches leaf
//! frames itself.
//!
//! The fault handler classifies a fault in order: kernel fault (fatal),
//! segfault (address in no allocated region), swap-in, lazy fill, and lazy
//! fill by eviction when FFS is exhausted. Every PTE it installs carries the
//! accessed bit, so a fresh page always survives its first clock sweep.

use crate::machine::Machine;
use crate::process::{self, ProcTable};

use super::frames::PtPool;
use super::layout::{PhysAddr, VirtAddr};
use super::pte::{Pte, PteFlags, PteState};
use super::swap;
use super::{KillReason, Vm};

/// What the fault handler did. `Handled` means the faulting access can be
/// retried; `Killed` means the current process is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Handled,
    Killed(KillReason),
}

/// The physical address of the PDE for `va` in `pd`.
fn pde_addr(pd: PhysAddr, va: VirtAddr) -> PhysAddr {
    pd.offset(va.dir_index() as u32 * 4)
}

/// The physical address of the PTE for `va` in the table at `table`.
fn pte_addr(table: PhysAddr, va: VirtAddr) -> PhysAddr {
    table.offset(va.table_index() as u32 * 4)
}

/// Return the leaf entry for `va`, creating the page table if the PDE is
/// absent. `user` decides the user bit of a newly written PDE. Returns `None`
/// only if the table pool is exhausted.
///
/// Existing entries are left alone: the walker does not allocate leaf frames
/// and does not touch presence or accessed bits on the way down.
pub fn walk(
    machine: &mut Machine,
    pts: &mut PtPool,
    pd: PhysAddr,
    va: VirtAddr,
    user: bool,
) -> Option<PhysAddr> {
    let pde_at = pde_addr(pd, va);
    let pde = machine.phys.read_entry(pde_at);
    let table = match pde.state() {
        // A decoded table address of zero is treated as absent.
        PteState::Mapped(table) if table != PhysAddr::NULL => table,
        _ => {
            let table = pts.alloc(&mut machine.phys)?;
            let mut flags = PteFlags::PRESENT | PteFlags::WRITABLE;
            if user {
                flags |= PteFlags::USER;
            }
            machine.phys.write_entry(pde_at, Pte::mapped(table, flags));
            table
        }
    };
    Some(pte_addr(table, va))
}

/// Like [`walk`], but never allocates: `None` if no table covers `va`.
pub fn lookup(machine: &Machine, pd: PhysAddr, va: VirtAddr) -> Option<PhysAddr> {
    let pde = machine.phys.read_entry(pde_addr(pd, va));
    match pde.state() {
        PteState::Mapped(table) if table != PhysAddr::NULL => Some(pte_addr(table, va)),
        _ => None,
    }
}

/// Translate `va` through `pd`, if it is mapped.
pub fn translate(machine: &Machine, pd: PhysAddr, va: VirtAddr) -> Option<PhysAddr> {
    let entry = lookup(machine, pd, va)?;
    match machine.phys.read_entry(entry).state() {
        PteState::Mapped(frame) => Some(frame.offset(va.page_offset())),
        _ => None,
    }
}

/// Identity-map `[start, end)` into `pd` with kernel permissions. Used once
/// at boot to build the kernel page directory; running out of table frames
/// here is fatal.
pub fn map_region(machine: &mut Machine, pts: &mut PtPool, pd: PhysAddr, start: VirtAddr, end: VirtAddr) {
    let mut va = start.page_base();
    while va.0 < end.0 {
        let entry = walk(machine, pts, pd, va, false)
            .expect("page-table pool exhausted while mapping the kernel");
        machine.phys.write_entry(
            entry,
            Pte::mapped(
                PhysAddr(va.0),
                PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::GLOBAL,
            ),
        );
        va = VirtAddr(va.0 + super::layout::PAGE_SIZE);
    }
}

/// Handle the fault whose address is latched in CR2. Runs with interrupts
/// disabled for its whole duration; the trap stub retries the faulting
/// instruction when we return `Handled`.
pub fn handle_fault(machine: &mut Machine, vm: &mut Vm, procs: &mut ProcTable) -> FaultOutcome {
    let addr = machine.cr2;
    let pid = procs.current();
    let vpage = addr.page_base();

    let (pd, in_region) = {
        let proc = procs.get(pid).expect("fault with no current process");
        if !proc.user {
            panic!("kernel page fault at {}", addr);
        }
        (proc.page_dir, proc.regions.contains_allocated(vpage))
    };

    if !in_region {
        log::error!("pid {}: {} at {}", pid, KillReason::SegmentationFault, addr);
        process::kill(machine, vm, procs, pid, Some(KillReason::SegmentationFault))
            .expect("killing the faulting process");
        return FaultOutcome::Killed(KillReason::SegmentationFault);
    }

    let entry = match walk(machine, &mut vm.pt_pool, pd, vpage, true) {
        Some(entry) => entry,
        None => {
            // Out of page-table frames mid-fault. The process cannot grow
            // its address space, so it dies like a segfault and the system
            // carries on.
            log::error!("pid {}: out of page tables at {}", pid, addr);
            process::kill(machine, vm, procs, pid, Some(KillReason::SegmentationFault))
                .expect("killing the faulting process");
            return FaultOutcome::Killed(KillReason::SegmentationFault);
        }
    };

    match machine.phys.read_entry(entry).state() {
        PteState::Swapped(slot) => {
            let Vm {
                ffs,
                swap: swap_pool,
                clock_hand,
                trace,
                ..
            } = &mut *vm;
            let frame = swap::swap_in(machine, ffs, swap_pool, clock_hand, trace, slot, pid);
            ffs.set_mapping(frame, vpage, pd);
            machine.phys.write_entry(entry, Pte::mapped(frame, user_page_flags()));
            machine.invlpg(vpage);
            FaultOutcome::Handled
        }
        PteState::Absent => {
            let frame = match vm.ffs.alloc(&mut machine.phys, pid) {
                Some(frame) => Some(frame),
                None if vm.swap_enabled => {
                    let Vm {
                        ffs,
                        swap: swap_pool,
                        clock_hand,
                        trace,
                        ..
                    } = &mut *vm;
                    let victim = swap::select_victim(machine, ffs, clock_hand)
                        .expect("no evictable frame in a full FFS");
                    let frame = swap::swap_out(machine, ffs, swap_pool, trace, victim);
                    ffs.transfer(frame, pid);
                    machine.phys.zero_frame(frame);
                    Some(frame)
                }
                None => None,
            };
            match frame {
                Some(frame) => {
                    vm.ffs.set_mapping(frame, vpage, pd);
                    machine.phys.write_entry(entry, Pte::mapped(frame, user_page_flags()));
                    machine.invlpg(vpage);
                    FaultOutcome::Handled
                }
                None => {
                    log::error!("pid {}: {} at {}", pid, KillReason::OutOfMemory, addr);
                    process::kill(machine, vm, procs, pid, Some(KillReason::OutOfMemory))
                        .expect("killing the faulting process");
                    FaultOutcome::Killed(KillReason::OutOfMemory)
                }
            }
        }
        // Already mapped: a stale cached translation faulted. Drop it and
        // let the access retry.
        PteState::Mapped(_) => {
            machine.invlpg(vpage);
            FaultOutcome::Handled
        }
    }
}

/// Flags for a user heap page the handler installs. Accessed is set so the
/// page gets one full clock sweep of protection before it can be evicted.
fn user_page_flags() -> PteFlags {
    PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER | PteFlags::ACCESSED
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::layout::{pt_index, MAX_PT_SIZE, PAGE_SIZE, VHEAP_START};

    fn setup() -> (Machine, PtPool, PhysAddr) {
        let mut machine = Machine::new();
        let mut pts = PtPool::new();
        let pd = pts.alloc(&mut machine.phys).unwrap();
        (machine, pts, pd)
    }

    #[test]
    fn walk_allocates_a_table_once() {
        let (mut machine, mut pts, pd) = setup();
        let va = VirtAddr(VHEAP_START);
        let before = pts.free_frames();
        let a = walk(&mut machine, &mut pts, pd, va, true).unwrap();
        assert_eq!(pts.free_frames(), before - 1);
        // Second walk in the same 4MiB block reuses the table.
        let b = walk(&mut machine, &mut pts, pd, va.offset(PAGE_SIZE), true).unwrap();
        assert_eq!(pts.free_frames(), before - 1);
        assert_eq!(b.0, a.0 + 4);
        // The PDE came out present, writable, user.
        let pde = machine.phys.read_entry(pd.offset(va.dir_index() as u32 * 4));
        assert!(pde.flags().contains(PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER));
    }

    #[test]
    fn lookup_never_allocates() {
        let (machine, pts, pd) = setup();
        assert_eq!(lookup(&machine, pd, VirtAddr(VHEAP_START)), None);
        assert_eq!(pts.free_frames(), MAX_PT_SIZE - 1);
    }

    #[test]
    fn zero_table_address_is_absent() {
        let (mut machine, _pts, pd) = setup();
        let va = VirtAddr(VHEAP_START);
        // A corrupt PDE: present but pointing at frame 0.
        machine.phys.write_entry(
            pd.offset(va.dir_index() as u32 * 4),
            Pte::mapped(PhysAddr::NULL, PteFlags::PRESENT),
        );
        assert_eq!(lookup(&machine, pd, va), None);
    }

    #[test]
    fn walk_reports_pool_exhaustion() {
        let (mut machine, mut pts, pd) = setup();
        while pts.alloc(&mut machine.phys).is_some() {}
        assert_eq!(walk(&mut machine, &mut pts, pd, VirtAddr(VHEAP_START), true), None);
    }

    #[test]
    fn identity_map_translates_identically() {
        let (mut machine, mut pts, pd) = setup();
        let start = VirtAddr(crate::memory::layout::PT_POOL_BASE);
        let end = VirtAddr(crate::memory::layout::PT_POOL_BASE + 8 * PAGE_SIZE);
        map_region(&mut machine, &mut pts, pd, start, end);
        for i in 0..8 {
            let va = start.offset(i * PAGE_SIZE + 123);
            assert_eq!(translate(&machine, pd, va), Some(PhysAddr(va.0)));
        }
        assert_eq!(translate(&machine, pd, end.offset(123)), None);
    }

    #[test]
    fn walker_tables_come_from_the_pool() {
        let (mut machine, mut pts, pd) = setup();
        let entry = walk(&mut machine, &mut pts, pd, VirtAddr(VHEAP_START), true).unwrap();
        assert!(pt_index(entry.page_base()).is_some());
    }
}

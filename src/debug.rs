//! Debug checks over the whole paging state.
//!
//! The tests lean on one big invariant: at any instant, an FFS frame is
//! referenced by at most one PTE in the whole system, a swap slot likewise,
//! and the frame records agree with the page tables. `audit_mappings` walks
//! every live process's heap tables and cross-checks both directions.

use alloc::vec;

use crate::machine::Machine;
use crate::memory::layout::{
    ffs_frame_addr, ffs_index, PhysAddr, VirtAddr, FFS_FRAMES, SWAP_SLOTS, VHEAP_END, VHEAP_START,
};
use crate::memory::paging;
use crate::memory::pte::PteState;
use crate::memory::Vm;
use crate::process::ProcTable;

/// What the audit saw, when it saw nothing wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingAudit {
    /// PTEs in the mapped state across all processes.
    pub mapped: usize,
    /// PTEs in the swapped state across all processes.
    pub swapped: usize,
}

/// Check mapping uniqueness and record/PTE agreement. Returns a description
/// of the first violation found.
pub fn audit_mappings(
    machine: &Machine,
    vm: &Vm,
    procs: &ProcTable,
) -> Result<MappingAudit, &'static str> {
    let mut frame_refs = vec![0u8; FFS_FRAMES];
    let mut slot_refs = vec![0u8; SWAP_SLOTS];
    let mut audit = MappingAudit {
        mapped: 0,
        swapped: 0,
    };

    for proc in procs.iter().filter(|p| p.user) {
        let first = (VHEAP_START >> 22) as u32;
        let last = (VHEAP_END >> 22) as u32;
        for dir in first..=last {
            let pde = machine.phys.read_entry(proc.page_dir.offset(dir * 4));
            let table = match pde.state() {
                PteState::Mapped(table) if table != PhysAddr::NULL => table,
                _ => continue,
            };
            for idx in 0..1024u32 {
                let va = VirtAddr((dir << 22) | (idx << 12));
                match machine.phys.read_entry(table.offset(idx * 4)).state() {
                    PteState::Mapped(frame) => {
                        let Some(i) = ffs_index(frame) else {
                            return Err("mapped heap PTE points outside FFS");
                        };
                        frame_refs[i] += 1;
                        if frame_refs[i] > 1 {
                            return Err("FFS frame referenced by two PTEs");
                        }
                        let rec = vm.ffs.record(i);
                        if !rec.used || rec.vaddr != va || rec.page_dir != proc.page_dir {
                            return Err("frame record disagrees with its PTE");
                        }
                        audit.mapped += 1;
                    }
                    PteState::Swapped(slot) => {
                        if slot >= SWAP_SLOTS {
                            return Err("swapped PTE names an impossible slot");
                        }
                        slot_refs[slot] += 1;
                        if slot_refs[slot] > 1 {
                            return Err("swap slot referenced by two PTEs");
                        }
                        if !vm.swap.record(slot).used {
                            return Err("swapped PTE names a free slot");
                        }
                        audit.swapped += 1;
                    }
                    PteState::Absent => {}
                }
            }
        }
    }

    // Reverse direction: every record claiming a mapping must be the one its
    // PTE names.
    for i in 0..FFS_FRAMES {
        let rec = vm.ffs.record(i);
        if !rec.has_mapping() {
            continue;
        }
        let Some(entry) = paging::lookup(machine, rec.page_dir, rec.vaddr) else {
            return Err("frame record points at a missing page table");
        };
        match machine.phys.read_entry(entry).state() {
            PteState::Mapped(frame) if frame == ffs_frame_addr(i) => {}
            _ => return Err("frame record points at a PTE that moved on"),
        }
    }

    Ok(audit)
}

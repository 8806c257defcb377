//! The replacement engine: clock-hand victim selection, swap-out, swap-in.
//!
//! Victim selection is second chance over the FFS records, driven by a
//! single clock hand that lives for the whole boot. The hand is never reset:
//! not on process exit, not between workloads. Each inspected frame either
//! loses its accessed bit or becomes the victim, so two full passes are
//! enough to find one whenever any evictable frame exists.

use alloc::vec::Vec;

use crate::machine::Machine;
use crate::process::Pid;

use super::frames::{FfsPool, SwapPool};
use super::layout::{ffs_frame_addr, ffs_index, swap_slot_addr, PhysAddr, FFS_FRAMES};
use super::paging;
use super::pte::{Pte, PteFlags};

/// How many trace lines get printed before the trace goes quiet. Events keep
/// being recorded past the budget.
const PRINT_BUDGET: u32 = 128;

/// One replacement-engine action, as observed by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapEvent {
    /// FFS frame `frame` was copied out to swap slot `slot`.
    Eviction { frame: usize, slot: usize },
    /// Swap slot `slot` was copied back into FFS frame `frame`.
    SwapIn { slot: usize, frame: usize },
}

/// The eviction/swap-in trace: a print budget for the console and an
/// unbounded event record for tests, plus running totals.
pub struct SwapTrace {
    budget: u32,
    events: Vec<SwapEvent>,
    pub swapped_out: u64,
    pub swapped_in: u64,
}

impl SwapTrace {
    pub fn new() -> SwapTrace {
        SwapTrace {
            budget: PRINT_BUDGET,
            events: Vec::new(),
            swapped_out: 0,
            swapped_in: 0,
        }
    }

    fn eviction(&mut self, frame: usize, slot: usize) {
        if self.budget > 0 {
            self.budget -= 1;
            log::info!("eviction:: FFS frame {}, swap frame {} copy", frame, slot);
        }
        self.events.push(SwapEvent::Eviction { frame, slot });
        self.swapped_out += 1;
    }

    fn swap_in(&mut self, slot: usize, frame: usize) {
        if self.budget > 0 {
            self.budget -= 1;
            log::info!("swapping:: swap frame {}, FFS frame {}", slot, frame);
        }
        self.events.push(SwapEvent::SwapIn { slot, frame });
        self.swapped_in += 1;
    }

    pub fn events(&self) -> &[SwapEvent] {
        &self.events
    }
}

/// Pick a victim frame with the clock. Inspects at most two full passes;
/// every inspected frame advances the hand by exactly one. Frames without
/// complete mapping metadata (reserved, or mid-install) are skipped.
///
/// Returns the FFS index of a frame whose accessed bit was clear at the
/// moment of selection, with the hand already advanced past it.
pub fn select_victim(machine: &mut Machine, ffs: &FfsPool, hand: &mut usize) -> Option<usize> {
    for _ in 0..2 * FFS_FRAMES {
        let i = *hand;
        *hand = (*hand + 1) % FFS_FRAMES;
        let rec = ffs.record(i);
        if !rec.has_mapping() {
            continue;
        }
        let Some(entry) = paging::lookup(machine, rec.page_dir, rec.vaddr) else {
            continue;
        };
        let pte = machine.phys.read_entry(entry);
        if !pte.is_present() {
            continue;
        }
        if pte.flags().contains(PteFlags::ACCESSED) {
            // Second chance: strip the bit and move on.
            machine.phys.write_entry(entry, pte.without(PteFlags::ACCESSED));
        } else {
            return Some(i);
        }
    }
    None
}

/// Evict `victim` (an FFS index): copy its page into a fresh swap slot,
/// rewrite the owner's PTE to the swapped state, and invalidate the stale
/// translation. The frame itself stays used, stripped to the reserved state
/// for the caller to claim.
pub fn swap_out(
    machine: &mut Machine,
    ffs: &mut FfsPool,
    swap: &mut SwapPool,
    trace: &mut SwapTrace,
    victim: usize,
) -> PhysAddr {
    let rec = *ffs.record(victim);
    debug_assert!(rec.has_mapping());
    let frame = ffs_frame_addr(victim);

    let slot = match swap.alloc(rec.owner, frame) {
        Some(slot) => slot,
        None => panic!("swap area exhausted"),
    };
    machine.phys.copy_frame(frame, swap_slot_addr(slot));

    let entry = paging::lookup(machine, rec.page_dir, rec.vaddr)
        .expect("victim frame with no page table");
    machine.phys.write_entry(entry, Pte::swapped(slot));
    machine.invlpg(rec.vaddr);

    ffs.clear_mapping(frame);
    trace.eviction(victim, slot);
    frame
}

/// Bring `slot` back into FFS for `pid`, evicting if FFS is full. Frees the
/// slot and returns the frame holding the restored page; the caller installs
/// the PTE and the mapping metadata.
pub fn swap_in(
    machine: &mut Machine,
    ffs: &mut FfsPool,
    swap: &mut SwapPool,
    hand: &mut usize,
    trace: &mut SwapTrace,
    slot: usize,
    pid: Pid,
) -> PhysAddr {
    let frame = match ffs.alloc(&mut machine.phys, pid) {
        Some(frame) => frame,
        None => {
            let victim = select_victim(machine, ffs, hand)
                .expect("no evictable frame in a full FFS");
            let frame = swap_out(machine, ffs, swap, trace, victim);
            ffs.transfer(frame, pid);
            frame
        }
    };
    machine.phys.copy_frame(swap_slot_addr(slot), frame);
    swap.free(slot);
    trace.swap_in(slot, ffs_index(frame).expect("swap-in target outside FFS"));
    frame
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::frames::PtPool;
    use crate::memory::layout::{VirtAddr, PAGE_SIZE, SWAP_SLOTS, VHEAP_START};
    use crate::memory::pte::PteState;

    /// Build a page directory with `n` mapped heap pages backed by FFS
    /// frames 0..n, all accessed.
    fn setup(n: usize) -> (Machine, PtPool, FfsPool, SwapPool, SwapTrace, PhysAddr) {
        let mut machine = Machine::new();
        let mut pts = PtPool::new();
        let mut ffs = FfsPool::new();
        let pd = pts.alloc(&mut machine.phys).unwrap();
        for i in 0..n {
            let va = VirtAddr(VHEAP_START + i as u32 * PAGE_SIZE);
            let frame = ffs.alloc(&mut machine.phys, 1).unwrap();
            ffs.set_mapping(frame, va, pd);
            let entry = paging::walk(&mut machine, &mut pts, pd, va, true).unwrap();
            machine.phys.write_entry(
                entry,
                Pte::mapped(
                    frame,
                    PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER | PteFlags::ACCESSED,
                ),
            );
        }
        (machine, pts, ffs, SwapPool::new(), SwapTrace::new(), pd)
    }

    fn pte_of(machine: &Machine, pd: PhysAddr, i: usize) -> Pte {
        let va = VirtAddr(VHEAP_START + i as u32 * PAGE_SIZE);
        let entry = paging::lookup(machine, pd, va).unwrap();
        machine.phys.read_entry(entry)
    }

    #[test]
    fn first_sweep_clears_then_selects() {
        let (mut machine, _pts, ffs, _swap, _trace, pd) = setup(4);
        let mut hand = 0;
        // All four are accessed: the first pass strips them, the second pass
        // selects frame 0.
        let victim = select_victim(&mut machine, &ffs, &mut hand).unwrap();
        assert_eq!(victim, 0);
        assert_eq!(hand, 1);
        for i in 1..4 {
            assert!(!pte_of(&machine, pd, i).flags().contains(PteFlags::ACCESSED));
        }
    }

    #[test]
    fn accessed_frames_get_a_second_chance() {
        let (mut machine, _pts, ffs, _swap, _trace, pd) = setup(4);
        let mut hand = 0;
        // Clear frame 2 by hand; it should win even though the hand starts
        // at 0.
        let entry = paging::lookup(&machine, pd, VirtAddr(VHEAP_START + 2 * PAGE_SIZE)).unwrap();
        let pte = machine.phys.read_entry(entry);
        machine.phys.write_entry(entry, pte.without(PteFlags::ACCESSED));
        let victim = select_victim(&mut machine, &ffs, &mut hand).unwrap();
        assert_eq!(victim, 2);
        assert_eq!(hand, 3);
        // Frames 0 and 1 lost their accessed bit on the way past.
        assert!(!pte_of(&machine, pd, 0).flags().contains(PteFlags::ACCESSED));
        assert!(!pte_of(&machine, pd, 1).flags().contains(PteFlags::ACCESSED));
    }

    #[test]
    fn empty_pool_has_no_victim() {
        let (mut machine, _pts, ffs, _swap, _trace, _pd) = setup(0);
        let mut hand = 0;
        assert_eq!(select_victim(&mut machine, &ffs, &mut hand), None);
    }

    #[test]
    fn swap_out_round_trips_through_swap_in() {
        let (mut machine, _pts, mut ffs, mut swap, mut trace, pd) = setup(2);
        let frame = ffs_frame_addr(0);
        machine.phys.frame_mut(frame).copy_from_slice(&[0x5a; PAGE_SIZE as usize]);

        let got = swap_out(&mut machine, &mut ffs, &mut swap, &mut trace, 0);
        assert_eq!(got, frame);
        // The PTE now names the slot, the record is reserved, the slot is
        // taken.
        let PteState::Swapped(slot) = pte_of(&machine, pd, 0).state() else {
            panic!("victim PTE not swapped");
        };
        assert!(ffs.record(0).used);
        assert!(!ffs.record(0).has_mapping());
        assert_eq!(swap.free_slots(), SWAP_SLOTS - 1);
        assert_eq!(trace.events(), &[SwapEvent::Eviction { frame: 0, slot }]);

        // Give the frame away, then pull the slot back in; contents survive.
        ffs.transfer(frame, 2);
        machine.phys.zero_frame(frame);
        let mut hand = 0;
        let back = swap_in(&mut machine, &mut ffs, &mut swap, &mut hand, &mut trace, slot, 1);
        assert!(machine.phys.frame(back).iter().all(|&b| b == 0x5a));
        assert_eq!(swap.free_slots(), SWAP_SLOTS);
        assert_eq!(trace.swapped_in, 1);
    }

    #[test]
    fn swap_in_evicts_when_ffs_is_full() {
        let (mut machine, _pts, mut ffs, mut swap, mut trace, pd) = setup(2);
        // Fill the rest of FFS with reserved frames so nothing else is
        // evictable.
        while ffs.alloc(&mut machine.phys, 9).is_some() {}
        // Stash page 0 in swap and hand its frame away, leaving FFS full.
        let frame = swap_out(&mut machine, &mut ffs, &mut swap, &mut trace, 0);
        ffs.transfer(frame, 9);
        let PteState::Swapped(slot) = pte_of(&machine, pd, 0).state() else {
            panic!("victim PTE not swapped");
        };
        // Swap-in must now evict: the only candidate with a mapping is
        // frame 1.
        let mut hand = 0;
        let back = swap_in(&mut machine, &mut ffs, &mut swap, &mut hand, &mut trace, slot, 3);
        assert_eq!(back, ffs_frame_addr(1));
        assert!(matches!(pte_of(&machine, pd, 1).state(), PteState::Swapped(_)));
        assert_eq!(ffs.record(1).owner, 3);
        assert_eq!(
            trace.events().last(),
            Some(&SwapEvent::SwapIn { slot, frame: 1 })
        );
    }
}

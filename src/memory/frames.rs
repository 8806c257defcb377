//! The three physical pools: FFS frames, page-table frames, and swap slots.
//!
//! All three are fixed-address arrays with per-slot metadata and a free
//! count, allocated first-fit. They return and accept physical addresses
//! (FFS, page tables) or slot indices (swap); the layout module's partition
//! makes the address forms unambiguous.

use alloc::vec;
use alloc::vec::Vec;

use crate::machine::PhysMem;
use crate::process::Pid;

use super::layout::{
    ffs_frame_addr, ffs_index, pt_frame_addr, pt_index, PhysAddr, VirtAddr, FFS_FRAMES,
    MAX_PT_SIZE, SWAP_SLOTS,
};

/// Per-frame metadata for FFS.
///
/// `used` with a non-null `vaddr`/`page_dir` pair is a live mapping the
/// replacement engine may evict. `used` with a null `vaddr` is a reserved
/// frame: just allocated, or just reclaimed by swap-out, and owned by
/// whichever code path is about to install it.
#[derive(Debug, Clone, Copy)]
pub struct FrameRecord {
    pub used: bool,
    pub owner: Pid,
    pub vaddr: VirtAddr,
    pub page_dir: PhysAddr,
}

impl FrameRecord {
    const FREE: FrameRecord = FrameRecord {
        used: false,
        owner: 0,
        vaddr: VirtAddr::NULL,
        page_dir: PhysAddr::NULL,
    };

    /// Whether this record points at an installed PTE.
    pub fn has_mapping(&self) -> bool {
        self.used && self.vaddr != VirtAddr::NULL && self.page_dir != PhysAddr::NULL
    }
}

/// The FFS frame pool.
pub struct FfsPool {
    records: Vec<FrameRecord>,
    free: usize,
    /// Lower bound on the lowest free index, so first-fit does not rescan
    /// the used prefix on every allocation.
    hint: usize,
}

impl FfsPool {
    pub fn new() -> FfsPool {
        FfsPool {
            records: vec![FrameRecord::FREE; FFS_FRAMES],
            free: FFS_FRAMES,
            hint: 0,
        }
    }

    /// First-fit allocate a frame for `owner`. The frame is zeroed and comes
    /// back reserved (no mapping metadata yet).
    pub fn alloc(&mut self, phys: &mut PhysMem, owner: Pid) -> Option<PhysAddr> {
        if self.free == 0 {
            return None;
        }
        let i = (self.hint..FFS_FRAMES).find(|&i| !self.records[i].used)?;
        self.records[i] = FrameRecord {
            used: true,
            owner,
            vaddr: VirtAddr::NULL,
            page_dir: PhysAddr::NULL,
        };
        self.free -= 1;
        self.hint = i + 1;
        let addr = ffs_frame_addr(i);
        phys.zero_frame(addr);
        Some(addr)
    }

    /// Free a frame by address.
    pub fn free(&mut self, addr: PhysAddr) {
        let i = ffs_index(addr).expect("freeing a non-FFS address");
        assert!(self.records[i].used, "double free of FFS frame {}", i);
        self.records[i] = FrameRecord::FREE;
        self.free += 1;
        self.hint = self.hint.min(i);
    }

    /// Record where an allocated frame is about to be mapped.
    pub fn set_mapping(&mut self, addr: PhysAddr, vaddr: VirtAddr, page_dir: PhysAddr) {
        let i = ffs_index(addr).expect("mapping a non-FFS address");
        debug_assert!(self.records[i].used);
        self.records[i].vaddr = vaddr;
        self.records[i].page_dir = page_dir;
    }

    /// Strip a frame back to the reserved state (used, no mapping).
    pub fn clear_mapping(&mut self, addr: PhysAddr) {
        let i = ffs_index(addr).expect("clearing a non-FFS address");
        debug_assert!(self.records[i].used);
        self.records[i].vaddr = VirtAddr::NULL;
        self.records[i].page_dir = PhysAddr::NULL;
    }

    /// Hand an already-used frame to a new owner. The free count is not
    /// touched; this is the eviction fast path reusing the victim's frame.
    pub fn transfer(&mut self, addr: PhysAddr, owner: Pid) {
        let i = ffs_index(addr).expect("transferring a non-FFS address");
        assert!(self.records[i].used, "transfer of free FFS frame {}", i);
        self.records[i].owner = owner;
        self.records[i].vaddr = VirtAddr::NULL;
        self.records[i].page_dir = PhysAddr::NULL;
    }

    pub fn record(&self, i: usize) -> &FrameRecord {
        &self.records[i]
    }

    pub fn free_frames(&self) -> usize {
        self.free
    }

    /// How many frames `pid` currently holds.
    pub fn used_by(&self, pid: Pid) -> usize {
        self.records.iter().filter(|r| r.used && r.owner == pid).count()
    }

    /// Free every frame owned by `pid`. Returns how many were released.
    pub fn release_owned(&mut self, pid: Pid) -> usize {
        let mut released = 0;
        for (i, r) in self.records.iter_mut().enumerate() {
            if r.used && r.owner == pid {
                *r = FrameRecord::FREE;
                released += 1;
                self.hint = self.hint.min(i);
            }
        }
        self.free += released;
        released
    }
}

/// The page-directory/page-table frame pool.
pub struct PtPool {
    used: Vec<bool>,
    free: usize,
}

impl PtPool {
    pub fn new() -> PtPool {
        PtPool {
            used: vec![false; MAX_PT_SIZE],
            free: MAX_PT_SIZE,
        }
    }

    /// Allocate and zero a table frame.
    pub fn alloc(&mut self, phys: &mut PhysMem) -> Option<PhysAddr> {
        if self.free == 0 {
            return None;
        }
        let i = self.used.iter().position(|&u| !u)?;
        self.used[i] = true;
        self.free -= 1;
        let addr = pt_frame_addr(i);
        phys.zero_frame(addr);
        Some(addr)
    }

    pub fn free(&mut self, addr: PhysAddr) {
        let i = pt_index(addr).expect("freeing a non-pool table frame");
        assert!(self.used[i], "double free of table frame {}", i);
        self.used[i] = false;
        self.free += 1;
    }

    pub fn free_frames(&self) -> usize {
        self.free
    }
}

/// Per-slot metadata for the swap area. `ffs_frame` remembers which frame
/// the contents came from; nothing depends on it, it exists for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct SlotRecord {
    pub used: bool,
    pub owner: Pid,
    pub ffs_frame: PhysAddr,
}

impl SlotRecord {
    const FREE: SlotRecord = SlotRecord {
        used: false,
        owner: 0,
        ffs_frame: PhysAddr::NULL,
    };
}

/// The swap slot pool.
pub struct SwapPool {
    slots: Vec<SlotRecord>,
    free: usize,
    /// Rotating search start, so an eviction storm does not rescan the whole
    /// used prefix on every allocation.
    hint: usize,
}

impl SwapPool {
    pub fn new() -> SwapPool {
        SwapPool {
            slots: vec![SlotRecord::FREE; SWAP_SLOTS],
            free: SWAP_SLOTS,
            hint: 0,
        }
    }

    /// Allocate a slot for a page of `owner` that lived in `from`. Returns
    /// the slot index, never an address.
    pub fn alloc(&mut self, owner: Pid, from: PhysAddr) -> Option<usize> {
        if self.free == 0 {
            return None;
        }
        for step in 0..SWAP_SLOTS {
            let i = (self.hint + step) % SWAP_SLOTS;
            if !self.slots[i].used {
                self.slots[i] = SlotRecord {
                    used: true,
                    owner,
                    ffs_frame: from,
                };
                self.free -= 1;
                self.hint = (i + 1) % SWAP_SLOTS;
                return Some(i);
            }
        }
        None
    }

    pub fn free(&mut self, slot: usize) {
        assert!(self.slots[slot].used, "double free of swap slot {}", slot);
        self.slots[slot] = SlotRecord::FREE;
        self.free += 1;
    }

    pub fn record(&self, slot: usize) -> &SlotRecord {
        &self.slots[slot]
    }

    pub fn free_slots(&self) -> usize {
        self.free
    }

    pub fn used_by(&self, pid: Pid) -> usize {
        self.slots.iter().filter(|s| s.used && s.owner == pid).count()
    }

    /// Free every slot owned by `pid`. Returns how many were released.
    pub fn release_owned(&mut self, pid: Pid) -> usize {
        let mut released = 0;
        for s in &mut self.slots {
            if s.used && s.owner == pid {
                *s = SlotRecord::FREE;
                released += 1;
            }
        }
        self.free += released;
        released
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::layout::{FFS_BASE, PT_POOL_BASE};

    #[test]
    fn ffs_alloc_is_first_fit_and_zeroing() {
        let mut phys = PhysMem::new();
        let mut pool = FfsPool::new();
        phys.frame_mut(ffs_frame_addr(0)).fill(0xff);
        let a = pool.alloc(&mut phys, 3).unwrap();
        assert_eq!(a, PhysAddr(FFS_BASE));
        assert!(phys.frame(a).iter().all(|&b| b == 0));
        assert_eq!(pool.free_frames(), FFS_FRAMES - 1);
        let b = pool.alloc(&mut phys, 3).unwrap();
        assert_eq!(b, ffs_frame_addr(1));
        pool.free(a);
        assert_eq!(pool.free_frames(), FFS_FRAMES - 1);
        // Frame 0 is free again, so first-fit hands it right back.
        assert_eq!(pool.alloc(&mut phys, 4).unwrap(), a);
        assert_eq!(pool.record(0).owner, 4);
    }

    #[test]
    fn ffs_transfer_keeps_the_free_count() {
        let mut phys = PhysMem::new();
        let mut pool = FfsPool::new();
        let a = pool.alloc(&mut phys, 1).unwrap();
        pool.set_mapping(a, VirtAddr(0x1000_0000), PhysAddr(PT_POOL_BASE));
        let before = pool.free_frames();
        pool.transfer(a, 2);
        assert_eq!(pool.free_frames(), before);
        assert_eq!(pool.record(0).owner, 2);
        assert!(!pool.record(0).has_mapping());
        assert_eq!(pool.used_by(1), 0);
        assert_eq!(pool.used_by(2), 1);
    }

    #[test]
    fn ffs_release_owned() {
        let mut phys = PhysMem::new();
        let mut pool = FfsPool::new();
        for _ in 0..3 {
            pool.alloc(&mut phys, 7).unwrap();
        }
        pool.alloc(&mut phys, 8).unwrap();
        assert_eq!(pool.release_owned(7), 3);
        assert_eq!(pool.used_by(7), 0);
        assert_eq!(pool.used_by(8), 1);
        assert_eq!(pool.free_frames(), FFS_FRAMES - 1);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn ffs_double_free_panics() {
        let mut phys = PhysMem::new();
        let mut pool = FfsPool::new();
        let a = pool.alloc(&mut phys, 1).unwrap();
        pool.free(a);
        pool.free(a);
    }

    #[test]
    fn pt_pool_reuses_freed_frames() {
        let mut phys = PhysMem::new();
        let mut pool = PtPool::new();
        let a = pool.alloc(&mut phys).unwrap();
        let b = pool.alloc(&mut phys).unwrap();
        assert_ne!(a, b);
        pool.free(a);
        assert_eq!(pool.alloc(&mut phys).unwrap(), a);
        assert_eq!(pool.free_frames(), MAX_PT_SIZE - 2);
    }

    #[test]
    fn swap_slots_and_owner_release() {
        let mut pool = SwapPool::new();
        let s0 = pool.alloc(9, ffs_frame_addr(0)).unwrap();
        let s1 = pool.alloc(9, ffs_frame_addr(1)).unwrap();
        let s2 = pool.alloc(10, ffs_frame_addr(2)).unwrap();
        assert_eq!(pool.free_slots(), SWAP_SLOTS - 3);
        assert_eq!(pool.record(s0).ffs_frame, ffs_frame_addr(0));
        pool.free(s1);
        assert_eq!(pool.release_owned(9), 1);
        assert_eq!(pool.used_by(10), 1);
        pool.free(s2);
        assert_eq!(pool.free_slots(), SWAP_SLOTS);
    }
}

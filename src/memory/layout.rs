//! The physical and virtual memory maps, and the address types everything else
//! is written in terms of.
//!
//! Physical memory is laid out as follows:
//! - `[0, 28MiB)`: kernel text/data, identity mapped (not backed by the model).
//! - `[28MiB, 32MiB)`: the page-table pool, 1024 frames handed out to page
//!   directories and page tables.
//! - `[32MiB, 96MiB)`: FFS, the 16384 frames that back user heap pages.
//! - `[96MiB, 224MiB)`: the swap area, 32768 slots of one page each.
//!
//! Everything up to 224MiB is identity mapped in the kernel page directory.
//! Each user process additionally sees its private heap at `[256MiB, 512MiB)`.
//!
//! A physical address uniquely determines which area it belongs to, so frames
//! can be freed by address alone.

use core::fmt;

use static_assertions::const_assert;

/// The size of a page (and of a frame and of a swap slot).
pub const PAGE_SIZE: u32 = 4096;

/// log2 of `PAGE_SIZE`.
pub const PAGE_SHIFT: u32 = 12;

/// End of the kernel's own physical region.
pub const KERNEL_END: u32 = 32 << 20;

/// Number of frames in the page-table pool.
pub const MAX_PT_SIZE: usize = 1024;

/// First frame of the page-table pool. The pool is carved out of the top of
/// the kernel region.
pub const PT_POOL_BASE: u32 = KERNEL_END - (MAX_PT_SIZE as u32) * PAGE_SIZE;

/// Number of frames in FFS.
pub const FFS_FRAMES: usize = 16384;

/// First frame of FFS.
pub const FFS_BASE: u32 = KERNEL_END;

/// One past the last byte of FFS.
pub const FFS_END: u32 = FFS_BASE + (FFS_FRAMES as u32) * PAGE_SIZE;

/// Number of slots in the swap area.
pub const SWAP_SLOTS: usize = 32768;

/// First slot of the swap area.
pub const SWAP_BASE: u32 = FFS_END;

/// One past the last byte of the swap area.
pub const SWAP_END: u32 = SWAP_BASE + (SWAP_SLOTS as u32) * PAGE_SIZE;

/// First page of the per-process user heap.
pub const VHEAP_START: u32 = 256 << 20;

/// Last byte of the per-process user heap (inclusive).
pub const VHEAP_END: u32 = (512 << 20) - 1;

/// Number of pages in the user heap.
pub const VHEAP_PAGES: u32 = (VHEAP_END - VHEAP_START + 1) / PAGE_SIZE;

// Pin down the map. If one of these fires, somebody resized an area without
// moving its neighbors.
const_assert!(PT_POOL_BASE == 28 << 20);
const_assert!(FFS_END == 96 << 20);
const_assert!(SWAP_END == 224 << 20);
const_assert!(VHEAP_START % PAGE_SIZE == 0);
const_assert!((VHEAP_END + 1) % PAGE_SIZE == 0);
const_assert!(VHEAP_PAGES == 65536);

/// A 32-bit virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub u32);

/// A 32-bit physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u32);

impl VirtAddr {
    /// The null address, used as a "no mapping" sentinel in frame records.
    pub const NULL: VirtAddr = VirtAddr(0);

    /// The first address of the page containing `self`.
    pub fn page_base(self) -> VirtAddr {
        VirtAddr(self.0 & !(PAGE_SIZE - 1))
    }

    /// The offset of `self` within its page.
    pub fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// The virtual page number.
    pub fn page_number(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    /// Index of this address's entry in a page directory (top 10 bits).
    pub fn dir_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Index of this address's entry in a page table (middle 10 bits).
    pub fn table_index(self) -> usize {
        ((self.0 >> PAGE_SHIFT) & 0x3ff) as usize
    }

    pub fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// `self + off`. Panics on overflow, which would wrap around the 32-bit
    /// address space.
    pub fn offset(self, off: u32) -> VirtAddr {
        VirtAddr(self.0.checked_add(off).expect("virtual address overflow"))
    }
}

impl PhysAddr {
    /// The null address, used as a "no page directory" sentinel.
    pub const NULL: PhysAddr = PhysAddr(0);

    pub fn page_base(self) -> PhysAddr {
        PhysAddr(self.0 & !(PAGE_SIZE - 1))
    }

    pub fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    pub fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    pub fn offset(self, off: u32) -> PhysAddr {
        PhysAddr(self.0.checked_add(off).expect("physical address overflow"))
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// The physical address of FFS frame `i`.
pub fn ffs_frame_addr(i: usize) -> PhysAddr {
    debug_assert!(i < FFS_FRAMES);
    PhysAddr(FFS_BASE + (i as u32) * PAGE_SIZE)
}

/// The FFS index of a frame address, if the address lies in FFS.
pub fn ffs_index(addr: PhysAddr) -> Option<usize> {
    if (FFS_BASE..FFS_END).contains(&addr.0) {
        Some(((addr.0 - FFS_BASE) / PAGE_SIZE) as usize)
    } else {
        None
    }
}

/// The physical address of swap slot `i`.
pub fn swap_slot_addr(i: usize) -> PhysAddr {
    debug_assert!(i < SWAP_SLOTS);
    PhysAddr(SWAP_BASE + (i as u32) * PAGE_SIZE)
}

/// The physical address of page-table pool frame `i`.
pub fn pt_frame_addr(i: usize) -> PhysAddr {
    debug_assert!(i < MAX_PT_SIZE);
    PhysAddr(PT_POOL_BASE + (i as u32) * PAGE_SIZE)
}

/// The pool index of a page-table frame address, if the address lies in the
/// pool.
pub fn pt_index(addr: PhysAddr) -> Option<usize> {
    if (PT_POOL_BASE..KERNEL_END).contains(&addr.0) {
        Some(((addr.0 - PT_POOL_BASE) / PAGE_SIZE) as usize)
    } else {
        None
    }
}

/// Whether `addr` lies inside the user heap.
pub fn in_vheap(addr: VirtAddr) -> bool {
    (VHEAP_START..=VHEAP_END).contains(&addr.0)
}

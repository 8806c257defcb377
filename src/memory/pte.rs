//! The hardware entry format shared by page directories and page tables.
//!
//! An entry is a 32-bit word: the top 20 bits hold a page-aligned base
//! address, the low 12 bits hold flags. One reinterpretation on top of the
//! architectural format: when `PRESENT` is clear but the software `AVAIL` bit
//! is set, the 20 base bits hold a swap slot index instead of a frame
//! address. Every entry is therefore in exactly one of three states, and
//! `Pte::state` is the only place that decodes the discriminator.

use bitflags::bitflags;

use super::layout::{PhysAddr, PAGE_SHIFT};

/// Mask of the base-address bits of an entry.
pub const ADDR_MASK: u32 = 0xffff_f000;

/// Mask of the flag bits of an entry.
pub const FLAGS_MASK: u32 = 0x0000_0fff;

bitflags! {
    /// Architectural flag bits of a PDE/PTE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// The entry maps a frame (or, for a PDE, a page table).
        const PRESENT = 1 << 0;
        /// The page can be written.
        const WRITABLE = 1 << 1;
        /// The page can be accessed from user mode.
        const USER = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const NO_CACHE = 1 << 4;
        /// Set by hardware when the page is read or written.
        const ACCESSED = 1 << 5;
        /// Set by hardware when the page is written.
        const DIRTY = 1 << 6;
        /// Survives a full TLB flush.
        const GLOBAL = 1 << 8;
        /// First software-available bit. With `PRESENT` clear it marks a
        /// swapped-out page.
        const AVAIL = 1 << 9;
    }
}

/// The decoded state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteState {
    /// Nothing here. A fault on this page is a lazy fill (or a segfault).
    Absent,
    /// Present; the base bits are a frame address.
    Mapped(PhysAddr),
    /// Not present, but saved in the swap area; the base bits are the slot.
    Swapped(usize),
}

/// A page-directory or page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(u32);

impl Pte {
    /// An absent entry.
    pub const EMPTY: Pte = Pte(0);

    pub fn from_raw(raw: u32) -> Pte {
        Pte(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Build a present entry. Stray bits in `frame` or `flags` are masked
    /// off and `PRESENT` is inserted, as in the real entry format the
    /// alignment of the base guarantees the two do not overlap.
    pub fn mapped(frame: PhysAddr, flags: PteFlags) -> Pte {
        Pte((frame.0 & ADDR_MASK) | (flags.bits() & FLAGS_MASK) | PteFlags::PRESENT.bits())
    }

    /// Build a swapped-out entry for `slot`. All permission and hardware
    /// status bits are left clear.
    pub fn swapped(slot: usize) -> Pte {
        Pte(((slot as u32) << PAGE_SHIFT) | PteFlags::AVAIL.bits())
    }

    pub fn state(self) -> PteState {
        if self.flags().contains(PteFlags::PRESENT) {
            PteState::Mapped(self.frame())
        } else if self.flags().contains(PteFlags::AVAIL) {
            PteState::Swapped((self.0 >> PAGE_SHIFT) as usize)
        } else {
            PteState::Absent
        }
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }

    /// The base address. Meaningful only in the mapped state.
    pub fn frame(self) -> PhysAddr {
        PhysAddr(self.0 & ADDR_MASK)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// A copy of the entry with `flags` also set.
    pub fn with(self, flags: PteFlags) -> Pte {
        Pte(self.0 | (flags.bits() & FLAGS_MASK))
    }

    /// A copy of the entry with `flags` cleared.
    pub fn without(self, flags: PteFlags) -> Pte {
        Pte(self.0 & !(flags.bits() & FLAGS_MASK))
    }
}

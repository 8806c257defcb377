//! The machine model: backed physical memory, the TLB, the paging registers,
//! and the interrupt flag.
//!
//! The kernel runs hosted, so the hardware it drives is an explicit object
//! instead of the real thing. Only the regions the paging code actually
//! touches are backed: the page-table pool, FFS, and the swap area. Reaching
//! any other physical address is a machine check and panics, which is exactly
//! the severity it would have on metal.

use alloc::vec;
use alloc::vec::Vec;
use core::cell::Cell;

use crate::memory::layout::{
    PhysAddr, VirtAddr, FFS_BASE, FFS_END, KERNEL_END, PAGE_SIZE, PT_POOL_BASE, SWAP_BASE,
    SWAP_END,
};
use crate::memory::pte::Pte;

/// Number of entries in the translation cache.
const TLB_SLOTS: usize = 64;

/// The backed parts of physical memory.
pub struct PhysMem {
    pt_pool: Vec<u8>,
    ffs: Vec<u8>,
    swap: Vec<u8>,
}

impl PhysMem {
    pub fn new() -> PhysMem {
        PhysMem {
            pt_pool: vec![0; (KERNEL_END - PT_POOL_BASE) as usize],
            ffs: vec![0; (FFS_END - FFS_BASE) as usize],
            swap: vec![0; (SWAP_END - SWAP_BASE) as usize],
        }
    }

    /// Resolve a physical address to its backing area and offset.
    fn resolve(&self, addr: PhysAddr) -> (&[u8], usize) {
        match addr.0 {
            a if (PT_POOL_BASE..KERNEL_END).contains(&a) => (&self.pt_pool, (a - PT_POOL_BASE) as usize),
            a if (FFS_BASE..FFS_END).contains(&a) => (&self.ffs, (a - FFS_BASE) as usize),
            a if (SWAP_BASE..SWAP_END).contains(&a) => (&self.swap, (a - SWAP_BASE) as usize),
            _ => panic!("machine check: physical access at {}", addr),
        }
    }

    fn resolve_mut(&mut self, addr: PhysAddr) -> (&mut [u8], usize) {
        match addr.0 {
            a if (PT_POOL_BASE..KERNEL_END).contains(&a) => (&mut self.pt_pool, (a - PT_POOL_BASE) as usize),
            a if (FFS_BASE..FFS_END).contains(&a) => (&mut self.ffs, (a - FFS_BASE) as usize),
            a if (SWAP_BASE..SWAP_END).contains(&a) => (&mut self.swap, (a - SWAP_BASE) as usize),
            _ => panic!("machine check: physical access at {}", addr),
        }
    }

    /// The page-sized frame starting at `base`.
    pub fn frame(&self, base: PhysAddr) -> &[u8] {
        debug_assert!(base.is_page_aligned());
        let (area, off) = self.resolve(base);
        &area[off..off + PAGE_SIZE as usize]
    }

    pub fn frame_mut(&mut self, base: PhysAddr) -> &mut [u8] {
        debug_assert!(base.is_page_aligned());
        let (area, off) = self.resolve_mut(base);
        &mut area[off..off + PAGE_SIZE as usize]
    }

    pub fn zero_frame(&mut self, base: PhysAddr) {
        self.frame_mut(base).fill(0);
    }

    /// Copy the page at `src` to the page at `dst`.
    pub fn copy_frame(&mut self, src: PhysAddr, dst: PhysAddr) {
        let mut buf = [0u8; PAGE_SIZE as usize];
        buf.copy_from_slice(self.frame(src));
        self.frame_mut(dst).copy_from_slice(&buf);
    }

    /// Read the 32-bit paging entry at `addr` (must be 4-byte aligned).
    pub fn read_entry(&self, addr: PhysAddr) -> Pte {
        debug_assert!(addr.0 % 4 == 0);
        let (area, off) = self.resolve(addr);
        let word = [area[off], area[off + 1], area[off + 2], area[off + 3]];
        Pte::from_raw(u32::from_le_bytes(word))
    }

    pub fn write_entry(&mut self, addr: PhysAddr, entry: Pte) {
        debug_assert!(addr.0 % 4 == 0);
        let (area, off) = self.resolve_mut(addr);
        area[off..off + 4].copy_from_slice(&entry.raw().to_le_bytes());
    }

    pub fn read_byte(&self, addr: PhysAddr) -> u8 {
        let (area, off) = self.resolve(addr);
        area[off]
    }

    pub fn write_byte(&mut self, addr: PhysAddr, val: u8) {
        let (area, off) = self.resolve_mut(addr);
        area[off] = val;
    }
}

/// One cached translation.
#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    valid: bool,
    vpage: u32,
    frame: PhysAddr,
    writable: bool,
    user: bool,
    dirty: bool,
}

/// What a TLB lookup returns.
#[derive(Debug, Clone, Copy)]
pub struct Translation {
    pub frame: PhysAddr,
    pub writable: bool,
    pub user: bool,
    pub dirty: bool,
}

/// A direct-mapped translation cache. Real hardware would fill this on a
/// page-table walk and set the accessed bit as a side effect; the access path
/// in `lib.rs` does the same.
pub struct Tlb {
    slots: [TlbEntry; TLB_SLOTS],
}

impl Tlb {
    pub fn new() -> Tlb {
        Tlb {
            slots: [TlbEntry {
                valid: false,
                vpage: 0,
                frame: PhysAddr::NULL,
                writable: false,
                user: false,
                dirty: false,
            }; TLB_SLOTS],
        }
    }

    fn slot(vpage: u32) -> usize {
        (vpage as usize) % TLB_SLOTS
    }

    pub fn lookup(&self, vpage: u32) -> Option<Translation> {
        let e = &self.slots[Self::slot(vpage)];
        if e.valid && e.vpage == vpage {
            Some(Translation {
                frame: e.frame,
                writable: e.writable,
                user: e.user,
                dirty: e.dirty,
            })
        } else {
            None
        }
    }

    pub fn fill(&mut self, vpage: u32, t: Translation) {
        self.slots[Self::slot(vpage)] = TlbEntry {
            valid: true,
            vpage,
            frame: t.frame,
            writable: t.writable,
            user: t.user,
            dirty: t.dirty,
        };
    }

    /// Mark the cached translation for `vpage` dirty, if there is one.
    pub fn set_dirty(&mut self, vpage: u32) {
        let e = &mut self.slots[Self::slot(vpage)];
        if e.valid && e.vpage == vpage {
            e.dirty = true;
        }
    }

    /// Drop the translation for the page containing `va`, like `invlpg`.
    pub fn invalidate(&mut self, va: VirtAddr) {
        let vpage = va.page_number();
        let e = &mut self.slots[Self::slot(vpage)];
        if e.valid && e.vpage == vpage {
            e.valid = false;
        }
    }

    /// Drop everything, like a CR3 reload.
    pub fn flush(&mut self) {
        for e in &mut self.slots {
            e.valid = false;
        }
    }
}

/// The interrupt-enable flag.
///
/// Interior mutability lets a guard hold the flag while the rest of the
/// machine is mutated through disjoint borrows.
pub struct IrqFlag(Cell<bool>);

impl IrqFlag {
    pub fn new() -> IrqFlag {
        IrqFlag(Cell::new(true))
    }

    pub fn enabled(&self) -> bool {
        self.0.get()
    }

    /// Disable interrupts, returning a guard that restores the previous mask
    /// when dropped, on every exit path.
    pub fn disable(&self) -> IrqGuard<'_> {
        let prev = self.0.replace(false);
        IrqGuard { flag: self, prev }
    }
}

/// See [`IrqFlag::disable`].
pub struct IrqGuard<'a> {
    flag: &'a IrqFlag,
    prev: bool,
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.flag.0.set(self.prev);
    }
}

/// The whole machine: memory, TLB, and the paging registers.
pub struct Machine {
    pub phys: PhysMem,
    pub tlb: Tlb,
    /// Faulting linear address, latched by the access path before the fault
    /// handler runs.
    pub cr2: VirtAddr,
    /// Base of the currently bound page directory.
    pub cr3: PhysAddr,
}

impl Machine {
    pub fn new() -> Machine {
        Machine {
            phys: PhysMem::new(),
            tlb: Tlb::new(),
            cr2: VirtAddr::NULL,
            cr3: PhysAddr::NULL,
        }
    }

    /// Switch address spaces: load CR3 and flush the TLB.
    pub fn bind(&mut self, pd: PhysAddr) {
        self.cr3 = pd;
        self.tlb.flush();
    }

    /// Invalidate one page's cached translation.
    pub fn invlpg(&mut self, va: VirtAddr) {
        self.tlb.invalidate(va);
    }
}

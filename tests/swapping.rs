//! Eviction and swap-in scenarios: round-trip contents, conservation under
//! an eviction storm, and the behavior of the persistent clock hand.

use demos::memory::layout::{ffs_index, FFS_FRAMES, SWAP_SLOTS};
use demos::{BootConfig, Kernel, Pid, SwapEvent, VirtAddr, PAGE_SIZE};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const F: usize = FFS_FRAMES;

fn boot() -> Kernel {
    Kernel::boot(BootConfig { swapping: true })
}

fn touch(kernel: &mut Kernel, base: VirtAddr, pages: usize) {
    for i in 0..pages {
        kernel.store_byte(base.offset(i as u32 * PAGE_SIZE), 1).unwrap();
    }
}

/// Touch fresh pages after `va` until the page at `va` is no longer
/// resident. Returns how many pages it took.
fn evict_page(kernel: &mut Kernel, pid: Pid, va: VirtAddr, from: usize) -> usize {
    for i in from..2 * F {
        kernel
            .store_byte(va.offset(i as u32 * PAGE_SIZE), 2)
            .unwrap();
        if kernel.translate(pid, va).is_none() {
            return i;
        }
    }
    panic!("page at {:?} never got evicted", va);
}

#[test]
fn s7_eviction_round_trips_content() {
    let mut kernel = boot();
    let pid = kernel.vcreate("s7").unwrap();
    kernel.switch_to(pid).unwrap();
    let va = kernel.vmalloc(2 * F as u32 * PAGE_SIZE).unwrap();

    kernel.store_byte(va, b'A').unwrap();
    let frame0 = ffs_index(kernel.translate(pid, va).unwrap().page_base()).unwrap();

    evict_page(&mut kernel, pid, va, 1);

    // The trace names the eviction of page 0's frame.
    let slot = kernel
        .swap_events()
        .iter()
        .find_map(|e| match e {
            SwapEvent::Eviction { frame, slot } if *frame == frame0 => Some(*slot),
            _ => None,
        })
        .expect("no eviction event for page 0");

    // Reading it back faults, swaps in, and the payload survived.
    assert_eq!(kernel.load_byte(va).unwrap(), b'A');
    assert!(kernel
        .swap_events()
        .iter()
        .any(|e| matches!(e, SwapEvent::SwapIn { slot: s, .. } if *s == slot)));
    kernel.audit_mappings().unwrap();
}

#[test]
fn random_payload_survives_eviction() {
    let mut kernel = boot();
    let pid = kernel.vcreate("payload").unwrap();
    kernel.switch_to(pid).unwrap();
    let va = kernel.vmalloc(2 * F as u32 * PAGE_SIZE).unwrap();

    let mut rng = StdRng::seed_from_u64(0xfeed_face);
    let mut payload = [0u8; PAGE_SIZE as usize];
    rng.fill(&mut payload[..]);
    kernel.write_bytes(va, &payload).unwrap();

    evict_page(&mut kernel, pid, va, 1);

    let mut back = [0u8; PAGE_SIZE as usize];
    kernel.read_bytes(va, &mut back).unwrap();
    assert_eq!(back[..], payload[..]);
}

#[test]
fn dual_tenant_eviction_storm_conserves_frames() {
    let mut kernel = boot();
    let first = kernel.vcreate("storm-a").unwrap();
    let second = kernel.vcreate("storm-b").unwrap();
    let pages = 3 * F / 4;
    let mut heaps = Vec::new();
    for &pid in &[first, second] {
        kernel.switch_to(pid).unwrap();
        heaps.push(kernel.vmalloc(pages as u32 * PAGE_SIZE).unwrap());
    }
    // Together they want 1.5x the pool, so the engine has to shuffle.
    for (i, &pid) in [first, second].iter().enumerate() {
        kernel.switch_to(pid).unwrap();
        touch(&mut kernel, heaps[i], pages);
    }

    let (out, in_) = kernel.swap_counts();
    assert!(out > 0, "no eviction happened under 1.5x pressure");
    assert!(out >= in_);

    // Conservation for both pools, and every mapping unique.
    let held = kernel.used_ffs_frames(first) + kernel.used_ffs_frames(second);
    assert_eq!(kernel.free_ffs_pages() + held, F);
    let stashed = kernel.used_swap_slots(first) + kernel.used_swap_slots(second);
    assert_eq!(kernel.free_swap_pages() + stashed, SWAP_SLOTS);
    assert!(stashed > 0);
    let audit = kernel.audit_mappings().unwrap();
    assert_eq!(audit.swapped, stashed);

    // Teardown returns every frame and every slot.
    kernel.kill(first).unwrap();
    kernel.kill(second).unwrap();
    assert_eq!(kernel.free_ffs_pages(), F);
    assert_eq!(kernel.free_swap_pages(), SWAP_SLOTS);
}

#[test]
fn swapped_pages_can_be_vfreed() {
    let mut kernel = boot();
    let pid = kernel.vcreate("vfree-swapped").unwrap();
    kernel.switch_to(pid).unwrap();
    let va = kernel.vmalloc((F as u32 + 64) * PAGE_SIZE).unwrap();
    kernel.store_byte(va, 5).unwrap();
    evict_page(&mut kernel, pid, va, 1);
    assert!(kernel.free_swap_pages() < SWAP_SLOTS);

    // Freeing the whole reservation releases resident frames and swap
    // slots alike.
    kernel.vfree(va, (F as u32 + 64) * PAGE_SIZE).unwrap();
    assert_eq!(kernel.free_ffs_pages(), F);
    assert_eq!(kernel.free_swap_pages(), SWAP_SLOTS);
    assert_eq!(kernel.allocated_virtual_pages(pid), 0);
}

#[test]
fn clock_hand_advances_one_frame_per_eviction() {
    let mut kernel = boot();
    let pid = kernel.vcreate("clock").unwrap();
    kernel.switch_to(pid).unwrap();
    let va = kernel.vmalloc(2 * F as u32 * PAGE_SIZE).unwrap();
    touch(&mut kernel, va, F);
    assert_eq!(kernel.free_ffs_pages(), 0);

    // First eviction pays for the sweep that strips all the accessed bits.
    let h0 = kernel.clock_hand();
    kernel.store_byte(va.offset(F as u32 * PAGE_SIZE), 3).unwrap();
    let h1 = kernel.clock_hand();
    assert_ne!(h1, h0);
    assert!(h1 < F);

    // From then on everything ahead of the hand is cold, so each eviction
    // moves it by exactly one.
    for i in 1..5u32 {
        kernel
            .store_byte(va.offset((F as u32 + i) * PAGE_SIZE), 3)
            .unwrap();
        let h = kernel.clock_hand();
        assert_eq!(h, (h1 + i as usize) % F);
    }
    assert_eq!(kernel.swap_counts().0, 5);
}

#[test]
fn hand_survives_process_turnover() {
    let mut kernel = boot();
    let first = kernel.vcreate("one").unwrap();
    kernel.switch_to(first).unwrap();
    let va = kernel.vmalloc((F as u32 + 8) * PAGE_SIZE).unwrap();
    touch(&mut kernel, va, F + 8);
    let hand = kernel.clock_hand();
    assert!(kernel.swap_counts().0 >= 8);
    kernel.kill(first).unwrap();
    assert_eq!(kernel.clock_hand(), hand);

    // A new tenant inherits the hand where the old one left it.
    let second = kernel.vcreate("two").unwrap();
    kernel.switch_to(second).unwrap();
    assert_eq!(kernel.clock_hand(), hand);
    let vb = kernel.vmalloc(8 * PAGE_SIZE).unwrap();
    touch(&mut kernel, vb, 8);
    assert_eq!(kernel.clock_hand(), hand);
}

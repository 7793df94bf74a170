//! End-to-end behaviour of the memory-management core on the host.

use kernel_alloc::{
    AddressSpaceAllocator, AddressSpaceConfig, AddressSpaceKind, BootFrameAllocator, HhdmPhysMapper,
    MemoryError, PageManager, PhysicalFrameAllocator,
};
use kernel_info::memory_map::{MemoryRegion, MemoryRegionKind};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress};
use kernel_vmem::{FrameSource, MapError, PageTableAdapter, Permissions, X86PageTable};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

/// Page table kept in a map, with optional fault injection.
#[derive(Default)]
struct SoftPageTable {
    entries: BTreeMap<u64, (PhysicalAddress, Permissions)>,
    /// Fail the n-th `map_page` call (0-based) with `OutOfTableFrames`.
    fail_map_at: Option<usize>,
    maps: usize,
}

impl PageTableAdapter for SoftPageTable {
    fn map_page<F: FrameSource + ?Sized>(
        &mut self,
        _frames: &F,
        va: VirtualAddress,
        pa: PhysicalAddress,
        permissions: Permissions,
    ) -> Result<(), MapError> {
        let call = self.maps;
        self.maps += 1;
        if self.fail_map_at == Some(call) {
            return Err(MapError::OutOfTableFrames);
        }
        if self.entries.insert(va.as_u64(), (pa, permissions)).is_some() {
            return Err(MapError::AlreadyMapped(va));
        }
        Ok(())
    }

    fn unmap_page(&mut self, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        self.entries
            .remove(&va.as_u64())
            .map(|(pa, _)| pa)
            .ok_or(MapError::NotMapped(va))
    }

    fn remap_page(&mut self, va: VirtualAddress, permissions: Permissions) -> Result<(), MapError> {
        let entry = self
            .entries
            .get_mut(&va.as_u64())
            .ok_or(MapError::NotMapped(va))?;
        entry.1 = permissions;
        Ok(())
    }

    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.entries
            .get(&va.align_down().as_u64())
            .map(|&(pa, _)| pa + va.page_offset())
    }

    fn release_tables<F: FrameSource + ?Sized>(&mut self, _frames: &F) {}
}

/// A 4 KiB-aligned frame of simulated RAM.
#[repr(align(4096))]
struct Aligned4K([u8; 4096]);

/// Simulated physical memory, one contiguous host buffer. Physical address
/// `pa` lives at `buffer + pa`, which is exactly a direct map.
struct TestRam {
    frames: Vec<Aligned4K>,
}

impl TestRam {
    fn with_frames(n: u64) -> Self {
        Self {
            frames: (0..n).map(|_| Aligned4K([0; 4096])).collect(),
        }
    }

    fn direct_map(&mut self) -> HhdmPhysMapper {
        HhdmPhysMapper::new(self.frames.as_mut_ptr() as u64)
    }
}

fn usable(frames: u64) -> PhysicalFrameAllocator {
    let map = [MemoryRegion::new(0, frames * PAGE_SIZE, MemoryRegionKind::Usable)];
    PhysicalFrameAllocator::initialize(&map, frames * PAGE_SIZE)
}

fn va(page: u64) -> VirtualAddress {
    VirtualAddress::new(page * PAGE_SIZE)
}

fn window(kind: AddressSpaceKind, pages: u64) -> AddressSpaceConfig {
    AddressSpaceConfig {
        kind,
        base: VirtualAddress::zero(),
        pages,
        max_pages: pages,
    }
}

#[test]
fn frames_reserve_allocate_free_until_exhaustion() {
    let pfa = usable(4096);
    pfa.reserve_frames(PhysicalFrame::new(0), 8).unwrap();

    let base = pfa.allocate_frames(10).unwrap();
    assert_eq!(base.number(), 8);

    let before = pfa.stats();
    pfa.free_frames(PhysicalFrame::new(9), 1).unwrap();
    let after = pfa.stats();
    assert_eq!(after.used, before.used - 1);
    assert_eq!(after.free, before.free + 1);
    assert!(pfa.is_frame_free(PhysicalFrame::new(9)));

    // The contiguous tail [18, 4096).
    assert_eq!(pfa.allocate_frames(4078).unwrap().number(), 18);
    // Frame 9 is reusable.
    assert_eq!(pfa.allocate_frame().unwrap().number(), 9);
    assert_eq!(pfa.allocate_frame(), Err(MemoryError::OutOfPhysicalMemory));

    let stats = pfa.stats();
    assert_eq!(stats.free, 0);
    assert_eq!(stats.used + stats.reserved, stats.total);
}

#[test]
fn frame_zero_is_never_handed_out() {
    let pfa = usable(256);
    let mut seen = Vec::new();
    while let Ok(frame) = pfa.allocate_frame() {
        assert_ne!(frame.number(), 0);
        seen.push(frame);
    }
    assert_eq!(seen.len(), 255);
    // Even with frame 0 as the only remaining candidate the allocator fails.
    pfa.free_frames(PhysicalFrame::new(0), 1).ok();
    pfa.unreserve_frames(PhysicalFrame::new(0), 1).unwrap();
    assert_eq!(pfa.allocate_frame(), Err(MemoryError::OutOfPhysicalMemory));
}

#[test]
fn sixteen_page_window_reuses_hole() {
    let pfa = usable(64);
    let pm = PageManager::create_address_space(
        &pfa,
        window(AddressSpaceKind::User, 16),
        SoftPageTable::default(),
    )
    .unwrap();
    assert_eq!(pm.allocate_pages(5, Permissions::READ_WRITE), Ok(va(0)));
    assert_eq!(pm.allocate_pages(5, Permissions::READ_WRITE), Ok(va(5)));
    pm.free_pages(va(0)).unwrap();
    assert_eq!(pm.allocate_pages(3, Permissions::READ_WRITE), Ok(va(0)));
}

/// Small deterministic generator so sequences are reproducible.
struct Lcg(u64);

impl Lcg {
    fn below(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) % bound
    }
}

#[test]
fn page_counts_always_add_up() {
    let pfa = usable(512);
    let pm = PageManager::create_address_space(
        &pfa,
        window(AddressSpaceKind::User, 96),
        SoftPageTable::default(),
    )
    .unwrap();
    let mut rng = Lcg(7);
    let mut live: Vec<VirtualAddress> = Vec::new();

    for step in 0..400 {
        match rng.below(4) {
            0 | 1 => {
                if let Ok(base) = pm.allocate_pages(1 + rng.below(8), Permissions::READ_WRITE) {
                    live.push(base);
                }
            }
            2 => {
                if let Ok(base) = pm.reserve_pages(1 + rng.below(4), Permissions::READ_ONLY) {
                    live.push(base);
                }
            }
            _ if !live.is_empty() => {
                let victim = live.swap_remove(rng.below(live.len() as u64) as usize);
                pm.free_pages(victim).unwrap();
            }
            _ => {}
        }
        if step % 50 == 0 {
            pm.compact_free_ranges();
        }

        let usage = pm.usage();
        let object_pages: u64 = pm.objects().iter().map(|o| o.pages).sum();
        let free_pages: u64 = pm.free_runs().iter().map(|&(_, p)| p).sum();
        assert_eq!(free_pages + object_pages, usage.total_pages, "step {step}");
        assert_eq!(usage.committed_frames, usage.used_pages, "step {step}");
        assert_eq!(pfa.stats().used, usage.used_pages, "step {step}");
    }
}

#[test]
fn allocate_then_free_is_invisible_to_later_allocations() {
    fn fragmented() -> AddressSpaceAllocator {
        let asa = AddressSpaceAllocator::new(VirtualAddress::zero(), 64, 64).unwrap();
        let blocks: Vec<_> = (0..8).map(|_| asa.allocate(4).unwrap()).collect();
        for &b in blocks.iter().step_by(3) {
            asa.free(b, 4).unwrap();
        }
        asa
    }

    let untouched = fragmented();
    let probed = fragmented();
    let a = probed.allocate(6).unwrap();
    probed.free(a, 6).unwrap();

    for count in [2, 6, 4, 12, 1, 9, 3] {
        assert_eq!(probed.allocate(count), untouched.allocate(count), "count {count}");
    }
}

#[test]
fn compacting_twice_changes_nothing() {
    let asa = AddressSpaceAllocator::new(VirtualAddress::zero(), 40, 40).unwrap();
    let blocks: Vec<_> = (0..10).map(|_| asa.allocate(2).unwrap()).collect();
    for &b in &blocks[2..7] {
        asa.free(b, 2).unwrap();
    }
    asa.compact_free_ranges();
    let once = asa.free_runs();
    assert_eq!(asa.compact_free_ranges(), 0);
    assert_eq!(asa.free_runs(), once);
    assert_eq!(once, vec![(va(4), 10), (va(20), 20)]);
}

#[test]
fn largest_free_run_is_the_allocation_boundary() {
    let asa = AddressSpaceAllocator::new(VirtualAddress::zero(), 32, 48).unwrap();
    asa.allocate_at(va(10), 2).unwrap();
    asa.allocate_at(va(20), 1).unwrap();
    let largest = asa.largest_free_run();
    assert_eq!(largest, 11);

    assert_eq!(asa.allocate(largest + 1), Err(MemoryError::OutOfVirtualSpace));
    let base = asa.allocate(largest).unwrap();
    assert_eq!(base, va(21));
    assert!(!asa.free_runs().iter().any(|&(s, _)| s == base));

    asa.expand_right(48).unwrap();
    assert_eq!(asa.allocate(16), Ok(va(32)));
}

#[test]
fn user_space_exhaustion_is_an_ordinary_error() {
    let pfa = usable(8);
    let pm = PageManager::create_address_space(
        &pfa,
        window(AddressSpaceKind::User, 32),
        SoftPageTable::default(),
    )
    .unwrap();
    assert_eq!(
        pm.allocate_pages(20, Permissions::READ_WRITE),
        Err(MemoryError::OutOfPhysicalMemory)
    );
    assert_eq!(
        pm.allocate_pages(33, Permissions::READ_WRITE),
        Err(MemoryError::OutOfVirtualSpace)
    );
    assert_eq!(pfa.stats().used, 0);
    assert_eq!(pm.usage().free_pages, 32);
}

#[test]
fn mapping_failure_rolls_back_frames_and_range() {
    let pfa = usable(64);
    let table = SoftPageTable {
        fail_map_at: Some(3),
        ..SoftPageTable::default()
    };
    let pm = PageManager::create_address_space(&pfa, window(AddressSpaceKind::User, 16), table)
        .unwrap();
    assert_eq!(
        pm.allocate_pages_at(va(4), 5, Permissions::READ_WRITE),
        Err(MemoryError::OutOfPhysicalMemory)
    );
    assert_eq!(pfa.stats().used, 0);
    assert_eq!(pm.object_count(), 0);
    for page in 4..9 {
        assert_eq!(pm.translate(va(page)), None);
    }
    // The range is claimable again.
    pm.allocate_pages_at(va(4), 5, Permissions::READ_WRITE).unwrap();
}

#[test]
#[should_panic(expected = "kernel address space")]
fn kernel_space_frame_exhaustion_is_fatal() {
    let pfa = usable(4);
    let pm = PageManager::create_address_space(
        &pfa,
        window(AddressSpaceKind::Kernel, 32),
        SoftPageTable::default(),
    )
    .unwrap();
    let _ = pm.allocate_pages(8, Permissions::READ_WRITE);
}

#[test]
fn user_buffer_validation() {
    let pfa = usable(64);
    let pm = PageManager::create_address_space(
        &pfa,
        window(AddressSpaceKind::User, 32),
        SoftPageTable::default(),
    )
    .unwrap();
    let buf = pm.allocate_pages(2, Permissions::READ_WRITE).unwrap();
    let stack = pm.reserve_pages(4, Permissions::READ_WRITE).unwrap();

    assert_eq!(pm.check_writable(buf + 16, 2 * PAGE_SIZE - 16), Ok(()));
    assert_eq!(
        pm.check_writable(buf, 2 * PAGE_SIZE + 1),
        Err(MemoryError::PermissionDenied)
    );
    // Reserved but not committed.
    assert_eq!(pm.check_readable(stack, 8), Err(MemoryError::PermissionDenied));
    assert_eq!(pm.get_permissions(stack), Some(Permissions::READ_WRITE.for_user()));
    assert_eq!(pm.get_permissions(va(31)), None);
}

#[test]
fn x86_tables_come_from_the_shared_frame_allocator() {
    const FRAMES: u64 = 64;
    let mut ram = TestRam::with_frames(FRAMES);
    let phys = ram.direct_map();
    let pfa = usable(FRAMES);
    let before = pfa.stats();

    let table = X86PageTable::new(&phys, &pfa, true).unwrap();
    let pm = PageManager::create_address_space(&pfa, AddressSpaceConfig::user().with_pages(64), table)
        .unwrap();
    let base = pm.allocate_pages(3, Permissions::READ_WRITE).unwrap();
    assert_eq!(base.as_u64(), kernel_info::memory::USERSPACE_BASE);

    let pa = pm.translate(base + PAGE_SIZE + 0x10).unwrap();
    assert_eq!(pa.page_offset(), 0x10);
    assert!(!pfa.is_frame_free(pa.frame()));
    // Root, PDPT, PD, PT and three data frames.
    assert_eq!(pfa.stats().used, 7);

    pm.remap(base, Permissions::READ_ONLY).unwrap();
    assert!(!pm.is_writable(base, 1));
    assert!(pm.is_readable(base, 3 * PAGE_SIZE));

    pm.destroy_address_space();
    assert_eq!(pfa.stats(), before);
}

#[test]
fn boot_frames_survive_the_handoff() {
    const FRAMES: u64 = 64;
    let map = [
        MemoryRegion::new(0, 32 * PAGE_SIZE, MemoryRegionKind::Usable),
        MemoryRegion::new(32 * PAGE_SIZE, 8 * PAGE_SIZE, MemoryRegionKind::KernelImage),
        MemoryRegion::new(40 * PAGE_SIZE, 24 * PAGE_SIZE, MemoryRegionKind::Usable),
    ];
    let mut ram = TestRam::with_frames(FRAMES);
    let phys = ram.direct_map();

    let boot = BootFrameAllocator::new(&map, 16);
    let early = X86PageTable::new(&phys, &boot, false).unwrap();
    let root = early.root().unwrap();
    let handoff = boot.retire();

    let pfa = PhysicalFrameAllocator::with_handoff(&map, FRAMES * PAGE_SIZE, &handoff);
    assert!(!pfa.is_frame_free(root.frame()));
    assert_eq!(pfa.stats().used, handoff.frame_count());
    assert_eq!(pfa.stats().reserved, 1 + 8);

    let mut handed_out = Vec::new();
    while let Ok(frame) = pfa.allocate_frame() {
        handed_out.push(frame.number());
    }
    assert_eq!(handed_out.len(), 64 - 1 - 8 - 1);
    assert!(!handed_out.contains(&root.frame().number()));
    assert!(!handed_out.iter().any(|f| (32..40).contains(f)));
}

#[test]
fn concurrent_frame_traffic_never_double_allocates() {
    const FRAMES: u64 = 1024;
    let threads = 4;
    let rounds = 2_000;

    let pfa = Arc::new(usable(FRAMES));
    let before = pfa.stats();
    let owned: Arc<Vec<AtomicBool>> = Arc::new((0..FRAMES).map(|_| AtomicBool::new(false)).collect());
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let pfa = Arc::clone(&pfa);
            let owned = Arc::clone(&owned);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let mut rng = Lcg(t as u64 + 1);
                let mut held: Vec<(PhysicalFrame, u64)> = Vec::new();
                start.wait();
                for _ in 0..rounds {
                    if held.len() < 8 && rng.below(3) != 0 {
                        let count = 1 + rng.below(3);
                        let base = pfa.allocate_frames(count).unwrap();
                        for f in base.number()..base.number() + count {
                            let was = owned[f as usize].swap(true, Ordering::SeqCst);
                            assert!(!was, "frame {f} handed out twice");
                        }
                        held.push((base, count));
                    } else if let Some((base, count)) = held.pop() {
                        for f in base.number()..base.number() + count {
                            owned[f as usize].store(false, Ordering::SeqCst);
                        }
                        pfa.free_frames(base, count).unwrap();
                    }
                    thread::yield_now();
                }
                for (base, count) in held {
                    for f in base.number()..base.number() + count {
                        owned[f as usize].store(false, Ordering::SeqCst);
                    }
                    pfa.free_frames(base, count).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(pfa.stats(), before);
    assert!(!owned[0].load(Ordering::SeqCst));
}

#[test]
fn address_spaces_on_many_threads_share_one_bitmap() {
    let threads = 4;
    let pfa = usable(512);
    let before = pfa.stats();
    let start = Barrier::new(threads);
    let all_held = Barrier::new(threads);
    let (pfa_ref, start, all_held) = (&pfa, &start, &all_held);

    let per_thread: Vec<Vec<u64>> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                s.spawn(move || {
                    let pm = PageManager::create_address_space(
                        pfa_ref,
                        window(AddressSpaceKind::User, 64),
                        SoftPageTable::default(),
                    )
                    .unwrap();
                    start.wait();
                    let mut frames = Vec::new();
                    for _ in 0..4 {
                        let base = pm.allocate_pages(4, Permissions::READ_WRITE).unwrap();
                        for i in 0..4 {
                            frames.push(pm.translate(base + i * PAGE_SIZE).unwrap().frame().number());
                        }
                    }
                    let scratch = pm.allocate_pages(2, Permissions::READ_ONLY).unwrap();
                    pm.free_pages(scratch).unwrap();
                    assert_eq!(pm.usage().committed_frames, 16);

                    // Every space holds its frames at the same time here.
                    all_held.wait();
                    pm.destroy_address_space();
                    frames
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen: Vec<u64> = per_thread.into_iter().flatten().collect();
    let committed = seen.len();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), committed);
    assert!(!seen.contains(&0));
    assert_eq!(pfa.stats(), before);
}

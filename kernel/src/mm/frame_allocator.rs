//! Physical frame manager (component C).
//!
//! Tracks free physical memory as a sorted, coalesced list of page-aligned
//! ranges (§3 "Frame & page range"), plus a reference-count table for the
//! frames currently handed out (§3 "Frame reference table"), so COW sharing
//! and `munmap` can drive frames back to the pool.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use super::bootloader::MemoryMapEntry;
use super::{page_align_up, FrameNumber, PhysAddr, KERNEL_PHYS_START, PAGE_SIZE};
use crate::error::{KernelError, KernelResult, ResourceError};
use crate::sync::once_lock::GlobalState;

/// A half-open run of frames `[base, base + frames)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameRange {
    base: u32,
    frames: u32,
}

impl FrameRange {
    fn limit(&self) -> u32 {
        self.base + self.frames
    }
}

/// Sorted, pairwise-disjoint, coalesced list of frame ranges (§8 invariant
/// 1). Kept as a plain sorted `Vec` rather than a hand-rolled linked list;
/// the ordering and coalescing invariants are identical either way, and a
/// `Vec` is the idiomatic container for one.
#[derive(Default)]
struct FreeList {
    ranges: Vec<FrameRange>,
}

impl FreeList {
    fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Inserts a range, merging with any adjacent neighbor on either side.
    fn insert(&mut self, base: u32, frames: u32) {
        if frames == 0 {
            return;
        }
        let pos = self
            .ranges
            .iter()
            .position(|r| r.base >= base)
            .unwrap_or(self.ranges.len());

        let mut new_range = FrameRange { base, frames };

        // Merge with the range immediately before, if adjacent.
        if pos > 0 {
            let prev = self.ranges[pos - 1];
            if prev.limit() == new_range.base {
                new_range.base = prev.base;
                new_range.frames += prev.frames;
                self.ranges.remove(pos - 1);
                let pos = pos - 1;
                self.merge_forward(pos, new_range);
                return;
            }
        }
        self.merge_forward(pos, new_range);
    }

    /// Inserts `new_range` at `pos`, then merges with whatever now follows
    /// it if adjacent.
    fn merge_forward(&mut self, pos: usize, mut new_range: FrameRange) {
        if pos < self.ranges.len() && self.ranges[pos].base == new_range.limit() {
            new_range.frames += self.ranges[pos].frames;
            self.ranges.remove(pos);
        }
        self.ranges.insert(pos, new_range);
    }

    /// First-fit: returns the base of the first range with room for `n`
    /// contiguous frames, splitting (or consuming) that range.
    fn take(&mut self, n: u32) -> Option<u32> {
        let (idx, range) = self
            .ranges
            .iter()
            .enumerate()
            .find(|(_, r)| r.frames >= n)?;
        let base = range.base;
        if range.frames == n {
            self.ranges.remove(idx);
        } else {
            self.ranges[idx] = FrameRange {
                base: base + n,
                frames: range.frames - n,
            };
        }
        Some(base)
    }

    fn total_frames(&self) -> u64 {
        self.ranges.iter().map(|r| r.frames as u64).sum()
    }
}

struct FrameAllocatorState {
    free: FreeList,
    /// Ranges explicitly declared hardware-owned; never returned to `free`.
    hw: Vec<FrameRange>,
    /// Refcount of every frame currently handed out (absent == free or hw).
    refcounts: BTreeMap<u32, u32>,
}

impl FrameAllocatorState {
    fn is_hw(&self, frame: u32) -> bool {
        self.hw.iter().any(|r| frame >= r.base && frame < r.limit())
    }
}

static STATE: GlobalState<Mutex<FrameAllocatorState>> = GlobalState::new();

/// Builds the initial free pool from the boot loader's usable regions,
/// reserving everything below [`KERNEL_PHYS_START`] (BIOS/real-mode data)
/// and `[KERNEL_PHYS_START, kernel_end)` (the kernel image itself, which
/// the boot loader places at `KERNEL_PHYS_START`) as hardware-owned so
/// neither is ever handed out (§8 scenario 1).
pub fn init(memory_map: &[MemoryMapEntry], kernel_end: PhysAddr) -> KernelResult<()> {
    let kernel_end = page_align_up(kernel_end.as_u32() as usize) as u32;
    let kernel_end = kernel_end.max(KERNEL_PHYS_START as u32);

    let mut free = FreeList::new();
    let mut hw = Vec::new();
    hw.push(FrameRange {
        base: (KERNEL_PHYS_START as u32) >> super::PAGE_SHIFT as u32,
        frames: (kernel_end - KERNEL_PHYS_START as u32) >> super::PAGE_SHIFT as u32,
    });

    for region in memory_map.iter().filter(|r| r.is_usable()) {
        let base = page_align_up(region.base as usize) as u32;
        let end = ((region.base + region.length) as usize & !(PAGE_SIZE - 1)) as u32;
        if end <= base {
            continue;
        }
        let base = base.max(kernel_end);
        if end <= base {
            continue;
        }
        free.insert(base >> super::PAGE_SHIFT as u32, (end - base) >> super::PAGE_SHIFT as u32);
    }

    let _ = STATE.init(Mutex::new(FrameAllocatorState {
        free,
        hw,
        refcounts: BTreeMap::new(),
    }));
    Ok(())
}

/// Allocates `n` contiguous page-aligned frames, first-fit low-to-high
/// (§4.C). Each returned frame starts at refcount 1.
pub fn alloc_frames(n: u32) -> KernelResult<PhysAddr> {
    STATE
        .with(|s| {
            let mut s = s.lock();
            let base = s
                .free
                .take(n)
                .ok_or(KernelError::Resource(ResourceError::NoMoreFreeMemory {
                    requested: (n as usize) * PAGE_SIZE,
                }))?;
            for frame in base..base + n {
                s.refcounts.insert(frame, 1);
            }
            Ok(PhysAddr::new(FrameNumber::new(base).as_addr()))
        })
        .ok_or(KernelError::Resource(ResourceError::NoMoreFreeMemory {
            requested: (n as usize) * PAGE_SIZE,
        }))?
}

/// Returns `n` frames starting at `phys` to the free pool, coalescing with
/// neighbors. Requires each frame to currently be allocated.
pub fn free_frames(phys: PhysAddr, n: u32) -> KernelResult<()> {
    let base = FrameNumber::from_addr(phys.as_u32()).0;
    STATE
        .with(|s| {
            let mut s = s.lock();
            for frame in base..base + n {
                s.refcounts.remove(&frame);
            }
            s.free.insert(base, n);
            Ok(())
        })
        .unwrap_or(Err(KernelError::State(
            crate::error::StateError::NotInitialized { subsystem: "mm::frame_allocator" },
        )))
}

/// Marks `[phys, phys + size)` as hardware-owned (refcount effectively
/// infinite): carved out of consideration entirely, never freed.
pub fn declare_hw(phys: PhysAddr, size: usize) -> KernelResult<()> {
    let base = FrameNumber::from_addr(phys.as_u32()).0;
    let frames = (page_align_up(size) / PAGE_SIZE) as u32;
    STATE
        .with(|s| {
            let mut s = s.lock();
            s.hw.push(FrameRange { base, frames });
        })
        .ok_or(KernelError::State(crate::error::StateError::NotInitialized {
            subsystem: "mm::frame_allocator",
        }))
}

/// Increments `phys`'s refcount (COW sharing), returning the new count.
pub fn frame_ref_inc(phys: PhysAddr) -> KernelResult<u32> {
    let frame = FrameNumber::from_addr(phys.as_u32()).0;
    STATE
        .with(|s| {
            let mut s = s.lock();
            if s.is_hw(frame) {
                return u32::MAX;
            }
            let count = s.refcounts.entry(frame).or_insert(1);
            *count += 1;
            *count
        })
        .ok_or(KernelError::State(crate::error::StateError::NotInitialized {
            subsystem: "mm::frame_allocator",
        }))
}

/// Decrements `phys`'s refcount, returning the frame to the free pool when
/// it reaches zero (and the frame is not hardware-owned). Returns the
/// refcount after decrementing (0 if freed, `u32::MAX` if hardware-owned).
pub fn frame_ref_dec(phys: PhysAddr) -> KernelResult<u32> {
    let frame = FrameNumber::from_addr(phys.as_u32()).0;
    STATE
        .with(|s| {
            let mut s = s.lock();
            if s.is_hw(frame) {
                return u32::MAX;
            }
            let remaining = match s.refcounts.get_mut(&frame) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    *count
                }
                _ => {
                    s.refcounts.remove(&frame);
                    s.free.insert(frame, 1);
                    0
                }
            };
            remaining
        })
        .ok_or(KernelError::State(crate::error::StateError::NotInitialized {
            subsystem: "mm::frame_allocator",
        }))
}

/// Current refcount of `phys`: `None` if free, `Some(u32::MAX)` if
/// hardware-owned, `Some(n)` otherwise.
pub fn frame_refcount(phys: PhysAddr) -> Option<u32> {
    let frame = FrameNumber::from_addr(phys.as_u32()).0;
    STATE.with(|s| {
        let s = s.lock();
        if s.is_hw(frame) {
            Some(u32::MAX)
        } else {
            s.refcounts.get(&frame).copied()
        }
    })?
}

/// Total number of frames still free, for diagnostics.
pub fn free_frame_count() -> u64 {
    STATE.with(|s| s.lock().free.total_frames()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() {
        let _ = STATE.init(Mutex::new(FrameAllocatorState {
            free: FreeList::new(),
            hw: Vec::new(),
            refcounts: BTreeMap::new(),
        }));
        STATE.with(|s| {
            s.lock().free.insert(0, 16);
        });
    }

    #[test]
    fn init_excludes_kernel_image_from_free_pool() {
        // 64 MiB usable region starting at KERNEL_PHYS_START, kernel image
        // occupies the first 0x80000 bytes of it (§8 scenario 1 shape).
        let map = super::super::bootloader::memory_map_from_entries(&[(
            KERNEL_PHYS_START as u64,
            0x400_0000,
            super::super::bootloader::MemoryMapEntry::TYPE_USABLE,
        )]);
        let kernel_end = PhysAddr::new(KERNEL_PHYS_START as u32 + 0x8_0000);
        init(&map, kernel_end).unwrap();

        assert_eq!(
            free_frame_count(),
            (0x400_0000 - 0x8_0000) as u64 / PAGE_SIZE as u64
        );
        let first = alloc_frames(1).unwrap();
        assert_eq!(first.as_u32(), kernel_end.as_u32(), "first free frame must start past the kernel image");
    }

    #[test]
    fn first_fit_allocates_low_to_high() {
        reset();
        let a = alloc_frames(4).unwrap();
        let b = alloc_frames(4).unwrap();
        assert_eq!(a.as_u32(), 0);
        assert_eq!(b.as_u32(), 4 * PAGE_SIZE as u32);
    }

    #[test]
    fn free_coalesces_with_neighbors() {
        reset();
        let a = alloc_frames(4).unwrap();
        let b = alloc_frames(4).unwrap();
        free_frames(a, 4).unwrap();
        free_frames(b, 4).unwrap();
        let reclaimed = alloc_frames(16);
        assert!(reclaimed.is_ok(), "freed ranges should have merged back together");
    }

    #[test]
    fn exhaustion_returns_no_more_free_memory() {
        reset();
        assert!(alloc_frames(17).is_err());
    }

    #[test]
    fn cow_refcount_round_trip() {
        reset();
        let a = alloc_frames(1).unwrap();
        assert_eq!(frame_refcount(a), Some(1));
        assert_eq!(frame_ref_inc(a).unwrap(), 2);
        assert_eq!(frame_ref_dec(a).unwrap(), 1);
        assert_eq!(frame_ref_dec(a).unwrap(), 0);
        assert_eq!(frame_refcount(a), None);
    }

    #[test]
    fn hardware_frames_are_never_freed() {
        reset();
        declare_hw(PhysAddr::new(16 * PAGE_SIZE as u32), PAGE_SIZE).unwrap();
        assert_eq!(frame_ref_dec(PhysAddr::new(16 * PAGE_SIZE as u32)).unwrap(), u32::MAX);
    }
}

//! Virtual address spaces (component D, §4.D).
//!
//! The kernel half of every address space (everything at or above
//! [`KERNEL_VIRT_BASE`]) shares the same page-table frames by pointer, so a
//! process's directory only needs its own copy of the kernel-half entries,
//! not the tables they point to. `kmmap`/`kmunmap` below operate on whatever
//! directory is currently active, since that's true of every process.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::page_table::{self, EntryFlags};
use super::{
    frame_allocator, page_align_up, FaultHandlerFn, FrameNumber, PhysAddr, VirtAddr,
    KERNEL_VIRT_BASE, PAGE_SIZE, USER_VIRT_START,
};
use crate::arch::x86::cpu;
use crate::error::{ArgumentError, KernelError, KernelResult, ResourceError, StateError};
use crate::sched::{ProcessId, UserStackDescriptor};
use crate::sync::once_lock::GlobalState;

/// One page, reserved below the recursive-mapping window, used to briefly
/// map an arbitrary physical frame into the current address space while
/// building a page directory that isn't loaded in CR3 yet.
const SCRATCH_VADDR: u32 = super::RECURSIVE_TABLES_BASE as u32 - PAGE_SIZE as u32;

/// A registered page-fault handler range, `[start, end)` in user space
/// (§3 "Page fault handler table", §4.D step 2). Kept sorted and
/// pairwise-disjoint, same discipline as the frame allocator's free list.
#[derive(Clone, Copy)]
struct FaultRange {
    start: u32,
    end: u32,
    handler: FaultHandlerFn,
}

/// Which end of the free-user-page list `alloc_pages` draws from (§4.D
/// "alloc_pages(n, start_pt)"): the beginning, for the default user heap,
/// or the end, for stack growth, so the two regions grow toward each
/// other instead of sharing one pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePlacement {
    Start,
    End,
}

/// A process's address space: its root page directory, bump pointers for
/// the next heap mapping (ascending, from [`USER_VIRT_START`]) and the
/// next stack mapping (descending, from the top of user space), its user
/// stack once allocated, and its fault-handler range table.
pub struct AddressSpace {
    pid: ProcessId,
    dir_frame: FrameNumber,
    next_user_addr: u32,
    next_stack_addr: u32,
    stack: Option<UserStackDescriptor>,
    fault_ranges: Vec<FaultRange>,
}

static ADDRESS_SPACES: GlobalState<Mutex<BTreeMap<ProcessId, Arc<Mutex<AddressSpace>>>>> =
    GlobalState::new();

pub fn init() {
    let _ = ADDRESS_SPACES.init(Mutex::new(BTreeMap::new()));
}

fn with_scratch<R>(frame: FrameNumber, f: impl FnOnce(*mut page_table::Entry) -> R) -> KernelResult<R> {
    let vaddr = VirtAddr::new(SCRATCH_VADDR);
    page_table::map(vaddr, frame, EntryFlags::WRITABLE, || {
        let p = frame_allocator::alloc_frames(1)?;
        Ok(FrameNumber::from_addr(p.as_u32()))
    })?;
    let ptr = vaddr.as_u32() as *mut page_table::Entry;
    let result = f(ptr);
    page_table::unmap(vaddr)?;
    Ok(result)
}

fn dir_index_of(vaddr: u32) -> usize {
    (vaddr as usize >> 22) & 0x3FF
}

/// Builds a fresh page directory whose kernel half (everything from
/// [`KERNEL_VIRT_BASE`] up, plus the recursive slot) mirrors the currently
/// active directory, and whose user half starts out entirely unmapped.
fn new_directory() -> KernelResult<FrameNumber> {
    let phys = frame_allocator::alloc_frames(1)?;
    let frame = FrameNumber::from_addr(phys.as_u32());

    with_scratch(frame, |dir| {
        for i in 0..page_table::ENTRIES_PER_TABLE {
            // SAFETY: `dir` addresses the freshly mapped scratch page.
            unsafe { *dir.add(i) = page_table::Entry::EMPTY };
        }
        let kernel_start = dir_index_of(KERNEL_VIRT_BASE as u32);
        for i in kernel_start..page_table::ENTRIES_PER_TABLE - 1 {
            let entry = page_table::directory_entry(VirtAddr::new((i as u32) << 22));
            // SAFETY: same as above.
            unsafe { *dir.add(i) = entry };
        }
        // The new directory's recursive slot must point at itself, not at
        // whatever the active directory's slot copied forward.
        let recursive = page_table::Entry::new(frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
        // SAFETY: same as above.
        unsafe { *dir.add(page_table::ENTRIES_PER_TABLE - 1) = recursive };
    })?;

    Ok(frame)
}

/// Creates and registers a new address space for `pid`.
pub fn create(pid: ProcessId) -> KernelResult<Arc<Mutex<AddressSpace>>> {
    let dir_frame = new_directory()?;
    let space = Arc::new(Mutex::new(AddressSpace {
        pid,
        dir_frame,
        next_user_addr: USER_VIRT_START as u32,
        next_stack_addr: KERNEL_VIRT_BASE as u32,
        stack: None,
        fault_ranges: Vec::new(),
    }));
    ADDRESS_SPACES.with(|m| m.lock().insert(pid, space.clone()));
    Ok(space)
}

pub fn get(pid: ProcessId) -> Option<Arc<Mutex<AddressSpace>>> {
    ADDRESS_SPACES.with(|m| m.lock().get(&pid).cloned())?
}

/// Tears down `pid`'s address space: frees every mapped user frame
/// (dropping refcounts, so COW siblings keep their share) and the
/// directory frame itself.
pub fn destroy(pid: ProcessId) -> KernelResult<()> {
    let space = ADDRESS_SPACES
        .with(|m| m.lock().remove(&pid))
        .flatten()
        .ok_or(KernelError::Resource(ResourceError::NoSuchId { id: pid.0 }))?;

    let mut space = space.lock();
    let first_di = dir_index_of(USER_VIRT_START as u32);
    let last_di = dir_index_of(KERNEL_VIRT_BASE as u32);
    for di in first_di..last_di {
        for ti in 0..page_table::ENTRIES_PER_TABLE {
            let vaddr = VirtAddr::new(((di as u32) << 22) | ((ti as u32) << 12));
            if let Ok(frame) = page_table::unmap(vaddr) {
                let _ = frame_allocator::frame_ref_dec(PhysAddr::new(frame.as_addr()));
            }
        }
    }
    space.fault_ranges.clear();
    frame_allocator::free_frames(PhysAddr::new(space.dir_frame.as_addr()), 1)
}

impl AddressSpace {
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn dir_frame(&self) -> FrameNumber {
        self.dir_frame
    }

    pub fn stack(&self) -> Option<UserStackDescriptor> {
        self.stack
    }

    /// Draws `n` contiguous virtual pages from this space's free-user-page
    /// list (§4.D "alloc_pages(n, start_pt)"), from the beginning for the
    /// default user heap or from the end for stack growth, so the two
    /// regions advance toward each other instead of sharing one pointer.
    /// Returns the low address of the drawn range.
    pub fn alloc_pages(&mut self, n: usize, placement: PagePlacement) -> KernelResult<VirtAddr> {
        let size = (n * PAGE_SIZE) as u32;
        match placement {
            PagePlacement::Start => {
                let start = self.next_user_addr;
                let new_next = start
                    .checked_add(size)
                    .ok_or(KernelError::Resource(ResourceError::NoMoreFreeMemory {
                        requested: size as usize,
                    }))?;
                if new_next > self.next_stack_addr {
                    return Err(KernelError::Resource(ResourceError::NoMoreFreeMemory {
                        requested: size as usize,
                    }));
                }
                self.next_user_addr = new_next;
                Ok(VirtAddr::new(start))
            }
            PagePlacement::End => {
                let new_top = self
                    .next_stack_addr
                    .checked_sub(size)
                    .ok_or(KernelError::Resource(ResourceError::NoMoreFreeMemory {
                        requested: size as usize,
                    }))?;
                if new_top < self.next_user_addr {
                    return Err(KernelError::Resource(ResourceError::NoMoreFreeMemory {
                        requested: size as usize,
                    }));
                }
                self.next_stack_addr = new_top;
                Ok(VirtAddr::new(new_top))
            }
        }
    }

    /// Maps `n` pages of fresh, zero-refcounted anonymous memory starting
    /// at `start`.
    fn map_fresh(&mut self, start: u32, pages: usize, ro: bool) -> KernelResult<()> {
        let mut flags = EntryFlags::PRESENT | EntryFlags::USER;
        if !ro {
            flags |= EntryFlags::WRITABLE;
        }
        for i in 0..pages {
            let vaddr = VirtAddr::new(start + (i * PAGE_SIZE) as u32);
            let phys = frame_allocator::alloc_frames(1)?;
            let frame = FrameNumber::from_addr(phys.as_u32());
            page_table::map(vaddr, frame, flags, || {
                let p = frame_allocator::alloc_frames(1)?;
                Ok(FrameNumber::from_addr(p.as_u32()))
            })?;
        }
        Ok(())
    }

    /// Maps `size` bytes of fresh, zero-refcounted anonymous memory drawn
    /// from the beginning of the free-user-page list (the default user
    /// heap), rounded up to whole pages.
    pub fn mmap(&mut self, size: usize, ro: bool, exec: bool) -> KernelResult<VirtAddr> {
        let _ = exec; // i386 without PAE has no per-page execute-disable bit.
        let pages = page_align_up(size) / PAGE_SIZE;
        let start = self.alloc_pages(pages, PagePlacement::Start)?;
        self.map_fresh(start.as_u32(), pages, ro)?;
        Ok(start)
    }

    /// Maps `size` bytes at a caller-chosen `vaddr` onto a caller-chosen
    /// `paddr`, for MMIO or other fixed hardware regions. Declares the
    /// range hardware-owned in the frame allocator when `is_hw` is set, so
    /// it is never handed out or freed.
    pub fn mmap_direct(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        size: usize,
        ro: bool,
        exec: bool,
        is_hw: bool,
    ) -> KernelResult<()> {
        let _ = exec;
        if !vaddr.is_page_aligned() || !paddr.is_page_aligned() {
            return Err(KernelError::Argument(ArgumentError::Alignment {
                addr: vaddr.as_u32() as usize,
                align: PAGE_SIZE,
            }));
        }
        if is_hw {
            frame_allocator::declare_hw(paddr, size)?;
        }
        let pages = page_align_up(size) / PAGE_SIZE;
        let mut flags = EntryFlags::PRESENT | EntryFlags::USER;
        if !ro {
            flags |= EntryFlags::WRITABLE;
        }
        for i in 0..pages {
            let va = VirtAddr::new(vaddr.as_u32() + (i * PAGE_SIZE) as u32);
            let frame = FrameNumber::from_addr(paddr.as_u32() + (i * PAGE_SIZE) as u32);
            page_table::map(va, frame, flags, || {
                let p = frame_allocator::alloc_frames(1)?;
                Ok(FrameNumber::from_addr(p.as_u32()))
            })?;
        }
        Ok(())
    }

    /// Unmaps `size` bytes starting at `vaddr`, dropping a refcount on
    /// each frame (freeing it back to the pool once the last sharer drops).
    pub fn munmap(&mut self, vaddr: VirtAddr, size: usize) -> KernelResult<()> {
        let pages = page_align_up(size) / PAGE_SIZE;
        for i in 0..pages {
            let va = VirtAddr::new(vaddr.as_u32() + (i * PAGE_SIZE) as u32);
            let frame = page_table::unmap(va)?;
            let _ = frame_allocator::frame_ref_dec(PhysAddr::new(frame.as_addr()));
        }
        Ok(())
    }

    /// Allocates a fresh user stack of `size` bytes, drawn from the end of
    /// the free-user-page list so it grows down from the top of user
    /// space while the heap grows up from the bottom, and records it as
    /// this space's stack region, returning its low address.
    pub fn alloc_stack(&mut self, size: usize) -> KernelResult<u32> {
        let pages = page_align_up(size) / PAGE_SIZE;
        let base = self.alloc_pages(pages, PagePlacement::End)?;
        self.map_fresh(base.as_u32(), pages, false)?;
        self.stack = Some(UserStackDescriptor {
            base_low: base.as_u32(),
            size: page_align_up(size) as u32,
        });
        Ok(base.as_u32())
    }

    /// Registers a page-fault handler for `[start, end)`. Fails with
    /// `Unauthorized` if `start >= end`, `HandlerAlreadyExists` if the
    /// range overlaps one already registered.
    pub fn register_fault_handler(
        &mut self,
        start: VirtAddr,
        end: VirtAddr,
        handler: FaultHandlerFn,
    ) -> KernelResult<()> {
        let (start, end) = (start.as_u32(), end.as_u32());
        if start >= end {
            return Err(KernelError::State(StateError::UnauthorizedAction));
        }
        let pos = self.fault_ranges.partition_point(|r| r.start < start);
        if pos > 0 && self.fault_ranges[pos - 1].end > start {
            return Err(KernelError::State(StateError::HandlerAlreadyExists));
        }
        if pos < self.fault_ranges.len() && self.fault_ranges[pos].start < end {
            return Err(KernelError::State(StateError::HandlerAlreadyExists));
        }
        self.fault_ranges.insert(pos, FaultRange { start, end, handler });
        Ok(())
    }

    /// Looks up the handler registered over `vaddr`, if any.
    pub fn fault_handler_for(&self, vaddr: VirtAddr) -> Option<FaultHandlerFn> {
        let addr = vaddr.as_u32();
        self.fault_ranges
            .iter()
            .find(|r| addr >= r.start && addr < r.end)
            .map(|r| r.handler)
    }
}

/// Kernel-half convenience wrapper (§4.D): registers a fault handler range
/// against the currently running thread's address space, so callers at the
/// syscall boundary don't need to thread a `Arc<Mutex<AddressSpace>>`
/// through themselves.
pub fn register_fault_handler(start: VirtAddr, end: VirtAddr, handler: FaultHandlerFn) -> KernelResult<()> {
    let pid = crate::sched::current()
        .ok_or(KernelError::State(StateError::NotInitialized { subsystem: "sched" }))?
        .pid;
    let space = get(pid).ok_or(KernelError::Resource(ResourceError::NoSuchId { id: pid.0 }))?;
    space.lock().register_fault_handler(start, end, handler)
}

/// Translates `vaddr` through whichever page directory is currently active
/// (the running thread's own address space, or the shared kernel tables
/// for a kernel-half address).
pub fn translate_current(vaddr: VirtAddr) -> Option<PhysAddr> {
    page_table::translate(vaddr)
}

/// Maps `size` bytes of fresh anonymous memory at `vaddr` into the kernel
/// half, shared by every address space's directory. Used for kernel-only
/// allocations that aren't tied to a particular process (the sleep queue,
/// the futex bucket table's backing storage, and similar).
pub fn kmmap(vaddr: VirtAddr, size: usize, ro: bool, exec: bool) -> KernelResult<()> {
    let _ = exec; // i386 without PAE has no per-page execute-disable bit.
    if !vaddr.is_page_aligned() {
        return Err(KernelError::Argument(ArgumentError::Alignment {
            addr: vaddr.as_u32() as usize,
            align: PAGE_SIZE,
        }));
    }
    if page_table::translate(vaddr).is_some() {
        return Err(KernelError::State(StateError::MappingAlreadyExists {
            addr: vaddr.as_u32() as usize,
        }));
    }
    let pages = page_align_up(size) / PAGE_SIZE;
    let mut flags = EntryFlags::PRESENT;
    if !ro {
        flags |= EntryFlags::WRITABLE;
    }
    for i in 0..pages {
        let va = VirtAddr::new(vaddr.as_u32() + (i * PAGE_SIZE) as u32);
        let phys = frame_allocator::alloc_frames(1)?;
        let frame = FrameNumber::from_addr(phys.as_u32());
        page_table::map(va, frame, flags, || {
            let p = frame_allocator::alloc_frames(1)?;
            Ok(FrameNumber::from_addr(p.as_u32()))
        })?;
    }
    Ok(())
}

/// Maps `vaddr -> phys` into the currently active address space's kernel
/// half. Used for device MMIO and other kernel-only mappings that every
/// process's directory already shares by pointer.
pub fn kmmap_hw(vaddr: VirtAddr, phys: PhysAddr, size: usize) -> KernelResult<()> {
    frame_allocator::declare_hw(phys, size)?;
    let pages = page_align_up(size) / PAGE_SIZE;
    for i in 0..pages {
        let va = VirtAddr::new(vaddr.as_u32() + (i * PAGE_SIZE) as u32);
        let frame = FrameNumber::from_addr(phys.as_u32() + (i * PAGE_SIZE) as u32);
        page_table::map(va, frame, EntryFlags::PRESENT | EntryFlags::WRITABLE, || {
            let p = frame_allocator::alloc_frames(1)?;
            Ok(FrameNumber::from_addr(p.as_u32()))
        })?;
    }
    Ok(())
}

pub fn kmunmap(vaddr: VirtAddr, size: usize) -> KernelResult<()> {
    let pages = page_align_up(size) / PAGE_SIZE;
    for i in 0..pages {
        let va = VirtAddr::new(vaddr.as_u32() + (i * PAGE_SIZE) as u32);
        page_table::unmap(va)?;
    }
    Ok(())
}

/// Copy-on-write fork (§4.D's fork procedure): walks every present page in
/// the *currently active* address space's user half, marks shared frames
/// read-only on both sides, bumps their refcount, and maps the same frames
/// into `dst`. `dst` isn't loaded in CR3 yet, so this briefly switches CR3
/// to it (kernel half is identical, so kernel code keeps running normally)
/// while installing the copied entries, then switches back.
pub fn copy_self_mapping(dst: &mut AddressSpace) -> KernelResult<()> {
    let first_di = dir_index_of(USER_VIRT_START as u32);
    let last_di = dir_index_of(KERNEL_VIRT_BASE as u32);

    let mut shared = Vec::new();
    for di in first_di..last_di {
        for ti in 0..page_table::ENTRIES_PER_TABLE {
            let vaddr = VirtAddr::new(((di as u32) << 22) | ((ti as u32) << 12));
            if let Some(entry) = page_table::table_entry(vaddr) {
                if !entry.is_present() {
                    continue;
                }
                let mut flags = entry.flags();
                if flags.contains(EntryFlags::WRITABLE) {
                    page_table::set_writable(vaddr, false)?;
                    flags.remove(EntryFlags::WRITABLE);
                }
                frame_allocator::frame_ref_inc(PhysAddr::new(entry.frame().as_addr()));
                shared.push((vaddr, entry.frame(), flags));
            }
        }
    }

    let saved_cr3 = cpu::read_cr3();
    // SAFETY: `dst.dir_frame` is a fully formed directory built by
    // `new_directory`, sharing the same kernel half as `saved_cr3`.
    unsafe { cpu::write_cr3(dst.dir_frame.as_addr()) };

    let mut result = Ok(());
    for (vaddr, frame, flags) in shared {
        if let Err(e) = page_table::map(vaddr, frame, flags, || {
            let p = frame_allocator::alloc_frames(1)?;
            Ok(FrameNumber::from_addr(p.as_u32()))
        }) {
            result = Err(e);
            break;
        }
    }

    // SAFETY: `saved_cr3` was the live directory before this call and is
    // still fully formed.
    unsafe { cpu::write_cr3(saved_cr3) };
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_space() -> AddressSpace {
        AddressSpace {
            pid: ProcessId(1),
            dir_frame: FrameNumber::new(0),
            next_user_addr: USER_VIRT_START as u32,
            next_stack_addr: KERNEL_VIRT_BASE as u32,
            stack: None,
            fault_ranges: Vec::new(),
        }
    }

    fn handler_a(_addr: VirtAddr) -> KernelResult<()> {
        Ok(())
    }

    fn handler_b(_addr: VirtAddr) -> KernelResult<()> {
        Ok(())
    }

    #[test]
    fn fault_range_rejects_overlap() {
        let mut space = test_space();
        space
            .register_fault_handler(VirtAddr::new(0x1000), VirtAddr::new(0x3000), handler_a)
            .unwrap();
        let err = space.register_fault_handler(VirtAddr::new(0x2000), VirtAddr::new(0x4000), handler_b);
        assert!(err.is_err());
    }

    #[test]
    fn fault_range_rejects_inverted_bounds() {
        let mut space = test_space();
        let err = space.register_fault_handler(VirtAddr::new(0x3000), VirtAddr::new(0x1000), handler_a);
        assert_eq!(err, Err(KernelError::State(StateError::UnauthorizedAction)));
    }

    #[test]
    fn fault_range_lookup_finds_containing_range() {
        let mut space = test_space();
        space
            .register_fault_handler(VirtAddr::new(0x1000), VirtAddr::new(0x3000), handler_a)
            .unwrap();
        assert!(space.fault_handler_for(VirtAddr::new(0x1500)).is_some());
        assert!(space.fault_handler_for(VirtAddr::new(0x3500)).is_none());
    }

    #[test]
    fn alloc_pages_start_and_end_grow_toward_each_other() {
        let mut space = test_space();
        let heap = space.alloc_pages(1, PagePlacement::Start).unwrap();
        let stack = space.alloc_pages(1, PagePlacement::End).unwrap();
        assert_eq!(heap.as_u32(), USER_VIRT_START as u32);
        assert_eq!(stack.as_u32(), KERNEL_VIRT_BASE as u32 - PAGE_SIZE as u32);
        assert!(heap.as_u32() < stack.as_u32());
    }

    #[test]
    fn alloc_pages_rejects_collision_between_heap_and_stack() {
        let mut space = test_space();
        // Pin the two bump pointers one page apart, then ask for two pages
        // from each end: both requests would have to cross the other's
        // pointer, so both must fail.
        space.next_user_addr = KERNEL_VIRT_BASE as u32 - PAGE_SIZE as u32;
        space.next_stack_addr = KERNEL_VIRT_BASE as u32;
        assert!(space.alloc_pages(2, PagePlacement::Start).is_err());
        assert!(space.alloc_pages(2, PagePlacement::End).is_err());
    }
}

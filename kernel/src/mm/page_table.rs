//! Two-level i386 page tables, accessed through the recursive mapping slot
//! (component D, §4.D).
//!
//! A page directory has 1024 entries, each pointing at a page table of
//! 1024 entries, each mapping one 4 KiB page. The last directory entry
//! points at the directory itself, so `RECURSIVE_TABLES_BASE + i * 4 KiB`
//! always addresses page table `i` of whichever directory is loaded in
//! CR3, and `RECURSIVE_DIR_BASE` addresses the directory itself — no
//! separate physical-memory window is needed to edit the active tables.

use bitflags::bitflags;

use super::{FrameNumber, PhysAddr, VirtAddr, PAGE_SIZE, RECURSIVE_DIR_BASE, RECURSIVE_TABLES_BASE};
use crate::arch::x86::cpu;
use crate::error::{KernelError, KernelResult, StateError};

pub const ENTRIES_PER_TABLE: usize = 1024;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
    }
}

const ADDR_MASK: u32 = !0xFFF;

/// A single directory or table entry: the physical frame address plus
/// flags, packed the way the MMU expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u32);

impl Entry {
    pub const EMPTY: Entry = Entry(0);

    pub fn new(frame: FrameNumber, flags: EntryFlags) -> Self {
        Self((frame.as_addr() & ADDR_MASK) | flags.bits())
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn frame(self) -> FrameNumber {
        FrameNumber::from_addr(self.0 & ADDR_MASK)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }
}

fn dir_index(vaddr: VirtAddr) -> usize {
    (vaddr.as_u32() as usize >> 22) & 0x3FF
}

fn table_index(vaddr: VirtAddr) -> usize {
    (vaddr.as_u32() as usize >> 12) & 0x3FF
}

/// Pointer to the active page directory, via the recursive slot.
#[cfg(target_arch = "x86")]
fn directory() -> *mut Entry {
    RECURSIVE_DIR_BASE as *mut Entry
}

/// Pointer to the active directory's `index`'th page table, via the
/// recursive slot.
#[cfg(target_arch = "x86")]
fn table(index: usize) -> *mut Entry {
    (RECURSIVE_TABLES_BASE + index * PAGE_SIZE) as *mut Entry
}

/// On the host test target there is no MMU behind [`RECURSIVE_DIR_BASE`]:
/// dereferencing it directly would just fault the test process. This
/// stands in a heap-backed directory and table set of the same shape, the
/// same way [`crate::serial`] swaps a real UART for an in-memory sink under
/// `#[cfg(test)]`; production behavior (`target_arch = "x86"`) never uses
/// it.
#[cfg(not(target_arch = "x86"))]
mod host_sim {
    extern crate alloc;

    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;

    use spin::Mutex;

    use super::{Entry, ENTRIES_PER_TABLE};

    struct Sim {
        directory: Box<[Entry; ENTRIES_PER_TABLE]>,
        tables: BTreeMap<usize, Box<[Entry; ENTRIES_PER_TABLE]>>,
    }

    impl Sim {
        fn new() -> Self {
            Self {
                directory: Box::new([Entry::EMPTY; ENTRIES_PER_TABLE]),
                tables: BTreeMap::new(),
            }
        }
    }

    static SIM: Mutex<Option<Sim>> = Mutex::new(None);

    pub fn directory_ptr() -> *mut Entry {
        let mut guard = SIM.lock();
        guard.get_or_insert_with(Sim::new).directory.as_mut_ptr()
    }

    pub fn table_ptr(index: usize) -> *mut Entry {
        let mut guard = SIM.lock();
        guard
            .get_or_insert_with(Sim::new)
            .tables
            .entry(index)
            .or_insert_with(|| Box::new([Entry::EMPTY; ENTRIES_PER_TABLE]))
            .as_mut_ptr()
    }

    /// Test-only: drops every simulated directory/table so each test that
    /// builds its own address space starts from a clean slate.
    #[cfg(test)]
    pub fn reset() {
        *SIM.lock() = Some(Sim::new());
    }
}

#[cfg(not(target_arch = "x86"))]
fn directory() -> *mut Entry {
    host_sim::directory_ptr()
}

#[cfg(not(target_arch = "x86"))]
fn table(index: usize) -> *mut Entry {
    host_sim::table_ptr(index)
}

/// Reads the directory entry for `vaddr`.
pub fn directory_entry(vaddr: VirtAddr) -> Entry {
    // SAFETY: the recursive slot always addresses a live directory.
    unsafe { *directory().add(dir_index(vaddr)) }
}

/// Reads the table entry mapping `vaddr`, if its directory entry is
/// present (its page table exists and is addressable via the recursive
/// slot).
pub fn table_entry(vaddr: VirtAddr) -> Option<Entry> {
    if !directory_entry(vaddr).is_present() {
        return None;
    }
    // SAFETY: the directory entry above is present, so this table is live
    // and reachable through the recursive slot.
    Some(unsafe { *table(dir_index(vaddr)).add(table_index(vaddr)) })
}

pub fn is_present(vaddr: VirtAddr) -> bool {
    table_entry(vaddr).is_some_and(Entry::is_present)
}

/// Translates `vaddr` to its physical address in the active address space.
pub fn translate(vaddr: VirtAddr) -> Option<PhysAddr> {
    let entry = table_entry(vaddr)?;
    if !entry.is_present() {
        return None;
    }
    let offset = vaddr.as_u32() & (PAGE_SIZE as u32 - 1);
    Some(PhysAddr::new(entry.frame().as_addr() | offset))
}

/// Ensures a page table exists for `vaddr`'s directory entry, allocating
/// and zeroing one if necessary.
fn ensure_table(vaddr: VirtAddr, alloc_frame: impl FnOnce() -> KernelResult<FrameNumber>) -> KernelResult<()> {
    let di = dir_index(vaddr);
    // SAFETY: the recursive slot always addresses a live directory.
    let pde = unsafe { &mut *directory().add(di) };
    if pde.is_present() {
        return Ok(());
    }
    let frame = alloc_frame()?;
    *pde = Entry::new(frame, EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER);
    // The new table is now reachable at `table(di)`, but the TLB may still
    // cache the old (not-present) translation for that recursive slot.
    unsafe { cpu::invlpg(table(di) as usize) };
    let tbl = table(di);
    for i in 0..ENTRIES_PER_TABLE {
        // SAFETY: `tbl` addresses the table just installed above.
        unsafe { *tbl.add(i) = Entry::EMPTY };
    }
    Ok(())
}

/// Installs a present mapping `vaddr -> frame`, allocating a page table for
/// its directory entry if needed. Fails with `MappingAlreadyExists` if
/// `vaddr` is already mapped.
pub fn map(
    vaddr: VirtAddr,
    frame: FrameNumber,
    flags: EntryFlags,
    alloc_frame: impl FnOnce() -> KernelResult<FrameNumber>,
) -> KernelResult<()> {
    ensure_table(vaddr, alloc_frame)?;
    let di = dir_index(vaddr);
    let ti = table_index(vaddr);
    // SAFETY: `ensure_table` guarantees this table is live.
    let pte = unsafe { &mut *table(di).add(ti) };
    if pte.is_present() {
        return Err(KernelError::State(StateError::MappingAlreadyExists {
            addr: vaddr.as_u32() as usize,
        }));
    }
    *pte = Entry::new(frame, flags | EntryFlags::PRESENT);
    unsafe { cpu::invlpg(vaddr.as_u32() as usize) };
    Ok(())
}

/// Removes the mapping at `vaddr`, returning the frame it pointed to.
/// Fails with `MemoryNotMapped` if `vaddr` has no present mapping.
pub fn unmap(vaddr: VirtAddr) -> KernelResult<FrameNumber> {
    let di = dir_index(vaddr);
    if !directory_entry(vaddr).is_present() {
        return Err(KernelError::State(StateError::MemoryNotMapped {
            addr: vaddr.as_u32() as usize,
        }));
    }
    let ti = table_index(vaddr);
    // SAFETY: the directory entry checked above is present.
    let pte = unsafe { &mut *table(di).add(ti) };
    if !pte.is_present() {
        return Err(KernelError::State(StateError::MemoryNotMapped {
            addr: vaddr.as_u32() as usize,
        }));
    }
    let frame = pte.frame();
    *pte = Entry::EMPTY;
    unsafe { cpu::invlpg(vaddr.as_u32() as usize) };
    Ok(frame)
}

/// Clears `WRITABLE` on an existing mapping (used to mark a page COW) or
/// sets it (used to end COW sharing once a frame is no longer shared).
/// Fails with `MemoryNotMapped` if `vaddr` has no present mapping.
pub fn set_writable(vaddr: VirtAddr, writable: bool) -> KernelResult<()> {
    let di = dir_index(vaddr);
    if !directory_entry(vaddr).is_present() {
        return Err(KernelError::State(StateError::MemoryNotMapped {
            addr: vaddr.as_u32() as usize,
        }));
    }
    let ti = table_index(vaddr);
    // SAFETY: the directory entry checked above is present.
    let pte = unsafe { &mut *table(di).add(ti) };
    if !pte.is_present() {
        return Err(KernelError::State(StateError::MemoryNotMapped {
            addr: vaddr.as_u32() as usize,
        }));
    }
    let mut flags = pte.flags();
    flags.set(EntryFlags::WRITABLE, writable);
    *pte = Entry::new(pte.frame(), flags);
    unsafe { cpu::invlpg(vaddr.as_u32() as usize) };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_frame_and_flags() {
        let e = Entry::new(FrameNumber::new(5), EntryFlags::PRESENT | EntryFlags::WRITABLE);
        assert_eq!(e.frame(), FrameNumber::new(5));
        assert!(e.flags().contains(EntryFlags::WRITABLE));
        assert!(e.is_present());
    }

    #[test]
    fn empty_entry_is_not_present() {
        assert!(!Entry::EMPTY.is_present());
    }

    #[test]
    fn index_split_matches_i386_layout() {
        let va = VirtAddr::new(0xE000_1004);
        assert_eq!(dir_index(va), 0xE00_0100_4u32 as usize >> 22 & 0x3FF);
        assert_eq!(table_index(va), (0xE000_1004usize >> 12) & 0x3FF);
    }
}

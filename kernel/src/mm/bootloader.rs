//! Multiboot memory map ingestion.
//!
//! The boot loader itself is an external collaborator; this module only
//! reads the memory-map structure it hands the kernel at a known physical
//! address (component boundary named in the interface table) and turns it
//! into the plain region list the frame allocator wants.

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{ArgumentError, KernelError, KernelResult};

/// One raw entry of the multiboot memory map: `{base, length, type}` as laid
/// out on the wire, type 1 meaning usable RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub typ: u32,
}

impl MemoryMapEntry {
    pub const TYPE_USABLE: u32 = 1;

    pub fn is_usable(&self) -> bool {
        self.typ == Self::TYPE_USABLE
    }
}

/// Multiboot1 `mmap_*` entry as laid out by the spec: a leading `size` field
/// (not counting itself) followed by base/length/type.
#[repr(C, packed)]
struct RawMmapEntry {
    size: u32,
    base: u64,
    length: u64,
    typ: u32,
}

/// Multiboot1 info header fields this kernel reads: flag bit 6 signals that
/// `mmap_addr`/`mmap_length` are valid.
#[repr(C, packed)]
struct RawMultibootInfo {
    flags: u32,
    _mem_lower: u32,
    _mem_upper: u32,
    _boot_device: u32,
    _cmdline: u32,
    _mods_count: u32,
    _mods_addr: u32,
    _syms: [u32; 4],
    mmap_length: u32,
    mmap_addr: u32,
}

const FLAG_MMAP: u32 = 1 << 6;

/// Parses the multiboot memory map at `multiboot_info_addr`.
///
/// # Errors
/// Returns [`ArgumentError::NullPointer`] if the address is zero, or
/// [`ArgumentError::IncorrectValue`] if the bootloader did not provide a
/// memory map.
#[cfg(target_arch = "x86")]
pub fn parse_memory_map(multiboot_info_addr: usize) -> KernelResult<Vec<MemoryMapEntry>> {
    if multiboot_info_addr == 0 {
        return Err(KernelError::Argument(ArgumentError::NullPointer));
    }
    // SAFETY: the caller (kernel entry point) passes the physical address
    // the boot loader placed its info structure at, per the multiboot
    // protocol, before any other code has had a chance to overwrite it.
    let info = unsafe { &*(multiboot_info_addr as *const RawMultibootInfo) };
    if info.flags & FLAG_MMAP == 0 {
        return Err(KernelError::Argument(ArgumentError::IncorrectValue {
            name: "multiboot_info.flags",
        }));
    }

    let mut regions = Vec::new();
    let mut cursor = info.mmap_addr as usize;
    let end = cursor + info.mmap_length as usize;
    while cursor < end {
        // SAFETY: bounded by `mmap_length`, which the boot loader guarantees
        // covers a well-formed sequence of `RawMmapEntry` records.
        let entry = unsafe { &*(cursor as *const RawMmapEntry) };
        regions.push(MemoryMapEntry {
            base: entry.base,
            length: entry.length,
            typ: entry.typ,
        });
        cursor += entry.size as usize + core::mem::size_of::<u32>();
    }
    Ok(regions)
}

#[cfg(not(target_arch = "x86"))]
pub fn parse_memory_map(_multiboot_info_addr: usize) -> KernelResult<Vec<MemoryMapEntry>> {
    Ok(Vec::new())
}

/// Parses memory map entries already decoded into plain tuples, for host
/// unit tests that cannot dereference a raw multiboot pointer.
pub fn memory_map_from_entries(entries: &[(u64, u64, u32)]) -> Vec<MemoryMapEntry> {
    entries
        .iter()
        .map(|&(base, length, typ)| MemoryMapEntry { base, length, typ })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_region_recognized() {
        let regions = memory_map_from_entries(&[(0x100000, 0x4000000, 1), (0, 0x9FC00, 1)]);
        assert!(regions.iter().all(|r| r.is_usable()));
        let total: u64 = regions.iter().map(|r| r.length).sum();
        assert_eq!(total, 0x4000000 + 0x9FC00);
    }

    #[test]
    fn reserved_region_excluded() {
        let regions = memory_map_from_entries(&[(0xA0000, 0x20000, 2)]);
        assert!(!regions[0].is_usable());
    }
}

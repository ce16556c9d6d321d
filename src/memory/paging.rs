//! Sv39 page tables and address-space operations.
//!
//! Three levels of 512 eight-byte entries, 4 KiB leaves. The kernel window
//! `[0, 0xC000_0000)` is identity-mapped with three giga-page leaves in the
//! root (`U=0`, `G=1`) and installed into every address space, so physical
//! frame addresses stay dereferencable no matter which root is active. The
//! user window occupies `[USER_LO, USER_HI)` with `U=1` 4 KiB leaves.

use bit_field::BitField;
use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::memory::{FRAME_ALLOCATOR, PAGE_SIZE};

/// Lowest user-window virtual address (root index 3).
pub const USER_LO: usize = 0xC000_0000;
/// One past the highest user-window virtual address.
pub const USER_HI: usize = 0x1_0000_0000;

/// NUL-scan bound for `memory_validate_vstr`.
pub const VSTR_MAX: usize = 4096;

const ENTRIES: usize = 512;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: usize {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

/// One Sv39 page-table entry: flags in bits 0..10, PPN in bits 10..54.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(usize);

impl Pte {
    pub const fn empty() -> Pte {
        Pte(0)
    }

    pub fn new(pa: usize, flags: PteFlags) -> Pte {
        let mut bits = flags.bits();
        bits.set_bits(10..54, pa >> 12);
        Pte(bits)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub fn pa(self) -> usize {
        self.0.get_bits(10..54) << 12
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    /// Valid and carrying at least one of R/W/X: a leaf rather than a
    /// pointer to the next level.
    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }
}

/// Opaque handle for a root page table, sufficient to install it as the
/// active translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MTag(usize);

impl MTag {
    pub(crate) const fn from_root_pa(pa: usize) -> MTag {
        MTag(pa)
    }

    pub fn root_pa(self) -> usize {
        self.0
    }
}

/// Nine translation bits per level: level 2 is the root index.
pub fn vpn(va: usize, level: usize) -> usize {
    (va >> (12 + 9 * level)) & 0x1ff
}

pub fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

pub fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Whether `[ptr, ptr + len)` sits entirely inside the user window.
pub fn user_span_ok(ptr: usize, len: usize) -> bool {
    ptr >= USER_LO && ptr < USER_HI && len <= USER_HI - ptr
}

fn alloc_frame() -> Result<usize> {
    FRAME_ALLOCATOR.lock().allocate_frame().ok_or(Error::NoMem)
}

fn free_frame(pa: usize) {
    FRAME_ALLOCATOR.lock().free_frame(pa);
}

unsafe fn table_mut<'a>(pa: usize) -> &'a mut [Pte; ENTRIES] {
    &mut *(pa as *mut [Pte; ENTRIES])
}

/// Install the globally shared kernel windows into a root table. Giga-page
/// leaves keep every intermediate table private to the user window.
fn install_kernel_windows(root_pa: usize) {
    let rwgad = PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::G | PteFlags::A | PteFlags::D;
    let root = unsafe { table_mut(root_pa) };
    // [0x0000_0000, 0x8000_0000): device MMIO.
    root[0] = Pte::new(0x0000_0000, rwgad);
    root[1] = Pte::new(0x4000_0000, rwgad);
    // [0x8000_0000, 0xC000_0000): RAM including the kernel image.
    root[2] = Pte::new(0x8000_0000, rwgad | PteFlags::X);
}

/// Allocate a fresh root page table carrying the shared kernel mappings.
pub fn memory_space_create() -> Result<MTag> {
    let root_pa = alloc_frame()?;
    install_kernel_windows(root_pa);
    Ok(MTag(root_pa))
}

/// Install `mtag` as the active translation and fence.
pub fn memory_space_switch(mtag: MTag) {
    crate::cpu::translation_set_root(mtag.root_pa());
}

/// Descend to the leaf entry for `va`, creating intermediate tables.
fn walk_create(root_pa: usize, va: usize) -> Result<*mut Pte> {
    let mut table_pa = root_pa;
    for level in [2usize, 1] {
        let entry = &mut unsafe { table_mut(table_pa) }[vpn(va, level)];
        if entry.is_valid() {
            debug_assert!(!entry.is_leaf());
            table_pa = entry.pa();
        } else {
            let next_pa = alloc_frame()?;
            *entry = Pte::new(next_pa, PteFlags::V);
            table_pa = next_pa;
        }
    }
    Ok(&mut unsafe { table_mut(table_pa) }[vpn(va, 0)])
}

/// Non-creating descent; `None` when any level is missing.
fn walk_lookup(root_pa: usize, va: usize) -> Option<Pte> {
    let mut table_pa = root_pa;
    for level in [2usize, 1] {
        let entry = unsafe { table_mut(table_pa) }[vpn(va, level)];
        if !entry.is_valid() || entry.is_leaf() {
            return None;
        }
        table_pa = entry.pa();
    }
    let leaf = unsafe { table_mut(table_pa) }[vpn(va, 0)];
    if leaf.is_valid() {
        Some(leaf)
    } else {
        None
    }
}

/// Allocate fresh frames for every 4 KiB span of `[va, va + len)` and map
/// them with `perms` (plus V/A/D) into `mtag`'s user window.
pub fn memory_alloc_and_map_range(mtag: MTag, va: usize, len: usize, perms: PteFlags) -> Result<()> {
    let start = page_round_down(va);
    let end = page_round_up(va + len);
    debug_assert!(user_span_ok(start, end - start));
    let mut page = start;
    while page < end {
        let frame_pa = alloc_frame()?;
        let leaf = walk_create(mtag.root_pa(), page)?;
        unsafe {
            debug_assert!(!(*leaf).is_valid());
            *leaf = Pte::new(frame_pa, perms | PteFlags::V | PteFlags::A | PteFlags::D);
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

fn user_root_indices() -> core::ops::Range<usize> {
    vpn(USER_LO, 2)..vpn(USER_HI - 1, 2) + 1
}

/// Physically duplicate the user window of `parent` into a fresh space.
/// Intermediate tables are never shared; every mapped user frame is copied
/// byte-for-byte into a newly allocated frame with the parent's
/// permissions.
pub fn memory_space_clone(parent: MTag) -> Result<MTag> {
    let child = memory_space_create()?;
    let parent_root = unsafe { table_mut(parent.root_pa()) };
    for i2 in user_root_indices() {
        let l2 = parent_root[i2];
        if !l2.is_valid() {
            continue;
        }
        let l1_table = unsafe { table_mut(l2.pa()) };
        for i1 in 0..ENTRIES {
            let l1 = l1_table[i1];
            if !l1.is_valid() {
                continue;
            }
            let l0_table = unsafe { table_mut(l1.pa()) };
            for i0 in 0..ENTRIES {
                let leaf = l0_table[i0];
                if !leaf.is_valid() {
                    continue;
                }
                let va = ((i2 << 18) | (i1 << 9) | i0) << 12;
                if let Err(e) = clone_leaf(child, va, leaf) {
                    memory_space_destroy(child);
                    return Err(e);
                }
            }
        }
    }
    Ok(child)
}

fn clone_leaf(child: MTag, va: usize, leaf: Pte) -> Result<()> {
    let frame_pa = alloc_frame()?;
    unsafe {
        core::ptr::copy_nonoverlapping(leaf.pa() as *const u8, frame_pa as *mut u8, PAGE_SIZE);
        *walk_create(child.root_pa(), va)? = Pte::new(frame_pa, leaf.flags());
    }
    Ok(())
}

/// Free every user leaf frame and intermediate table of `mtag`, leaving
/// the root with only the kernel windows.
pub fn memory_space_reclaim(mtag: MTag) {
    let root = unsafe { table_mut(mtag.root_pa()) };
    for i2 in user_root_indices() {
        let l2 = root[i2];
        if !l2.is_valid() {
            continue;
        }
        let l1_table = unsafe { table_mut(l2.pa()) };
        for i1 in 0..ENTRIES {
            let l1 = l1_table[i1];
            if !l1.is_valid() {
                continue;
            }
            let l0_table = unsafe { table_mut(l1.pa()) };
            for i0 in 0..ENTRIES {
                let leaf = l0_table[i0];
                if leaf.is_valid() {
                    free_frame(leaf.pa());
                }
            }
            free_frame(l1.pa());
        }
        free_frame(l2.pa());
        root[i2] = Pte::empty();
    }
}

/// Reclaim the user window and release the root table itself. `mtag` must
/// not be the active translation.
pub fn memory_space_destroy(mtag: MTag) {
    memory_space_reclaim(mtag);
    free_frame(mtag.root_pa());
}

/// Demand-map the page containing `va` when it falls inside one of the
/// declared `(lo, hi, perms)` ranges. Returns false when no range covers
/// the address, leaving the fault to the owning process.
pub fn memory_handle_page_fault(
    mtag: MTag,
    va: usize,
    ranges: &[(usize, usize, PteFlags)],
) -> bool {
    for &(lo, hi, perms) in ranges {
        if va >= lo && va < hi {
            return memory_alloc_and_map_range(mtag, page_round_down(va), PAGE_SIZE, perms)
                .is_ok();
        }
    }
    false
}

/// Copy `bytes` into `mtag`'s user window at `va` through the identity
/// window. The destination pages must already be mapped; the loader uses
/// this to populate a space before it ever becomes active.
pub fn memory_space_write(mtag: MTag, va: usize, bytes: &[u8]) -> Result<()> {
    let mut off = 0;
    while off < bytes.len() {
        let cursor = va + off;
        let leaf = walk_lookup(mtag.root_pa(), page_round_down(cursor)).ok_or(Error::Fault)?;
        let page_off = cursor % PAGE_SIZE;
        let n = (PAGE_SIZE - page_off).min(bytes.len() - off);
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes[off..].as_ptr(),
                (leaf.pa() + page_off) as *mut u8,
                n,
            );
        }
        off += n;
    }
    Ok(())
}

/// Check that every byte of `[ptr, ptr + len)` is user-mapped in `mtag`
/// with at least `need` permissions.
pub fn memory_validate_vptr_len(mtag: MTag, ptr: usize, len: usize, need: PteFlags) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    if !user_span_ok(ptr, len) {
        return Err(Error::Fault);
    }
    let mut page = page_round_down(ptr);
    let end = ptr + len;
    while page < end {
        let leaf = walk_lookup(mtag.root_pa(), page).ok_or(Error::Fault)?;
        if !leaf.flags().contains(need | PteFlags::U) {
            return Err(Error::Fault);
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

/// Like `memory_validate_vptr_len` but bounded by a NUL scan. Each page is
/// proven mapped before its bytes are touched (through the identity
/// window, so the scan itself cannot fault). Returns the string length.
pub fn memory_validate_vstr(mtag: MTag, ptr: usize, need: PteFlags) -> Result<usize> {
    if !user_span_ok(ptr, 1) {
        return Err(Error::Fault);
    }
    let mut scanned = 0;
    let mut va = ptr;
    while scanned < VSTR_MAX {
        let leaf = walk_lookup(mtag.root_pa(), page_round_down(va)).ok_or(Error::Fault)?;
        if !leaf.flags().contains(need | PteFlags::U) {
            return Err(Error::Fault);
        }
        let page_off = va % PAGE_SIZE;
        let in_page = PAGE_SIZE - page_off;
        let bytes =
            unsafe { core::slice::from_raw_parts((leaf.pa() + page_off) as *const u8, in_page) };
        for (i, &b) in bytes.iter().enumerate() {
            if b == 0 {
                return Ok(scanned + i);
            }
        }
        scanned += in_page;
        va += in_page;
        if va >= USER_HI {
            return Err(Error::Fault);
        }
    }
    Err(Error::Fault)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpn_split() {
        let va = 0xC040_3000usize;
        assert_eq!(vpn(va, 2), 3);
        assert_eq!(vpn(va, 1), 2);
        assert_eq!(vpn(va, 0), 3);
        // Recompose.
        assert_eq!(((vpn(va, 2) << 18) | (vpn(va, 1) << 9) | vpn(va, 0)) << 12, va);
    }

    #[test]
    fn pte_roundtrip() {
        let flags = PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::U;
        let pte = Pte::new(0x8020_3000, flags);
        assert_eq!(pte.pa(), 0x8020_3000);
        assert_eq!(pte.flags(), flags);
        assert!(pte.is_valid());
        assert!(pte.is_leaf());
    }

    #[test]
    fn pointer_entries_are_not_leaves() {
        let pte = Pte::new(0x8000_0000, PteFlags::V);
        assert!(pte.is_valid());
        assert!(!pte.is_leaf());
    }

    #[test]
    fn page_rounding() {
        assert_eq!(page_round_down(0xC000_1234), 0xC000_1000);
        assert_eq!(page_round_up(0xC000_1234), 0xC000_2000);
        assert_eq!(page_round_up(0xC000_1000), 0xC000_1000);
    }

    #[test]
    fn user_span_bounds() {
        assert!(user_span_ok(USER_LO, PAGE_SIZE));
        assert!(user_span_ok(USER_HI - 16, 16));
        assert!(!user_span_ok(USER_HI - 8, 16));
        assert!(!user_span_ok(USER_LO - 1, 1));
        assert!(!user_span_ok(0, 8));
        // Length overflowing the window end must not wrap.
        assert!(!user_span_ok(USER_LO, usize::MAX));
    }

    #[test]
    fn user_window_root_indices() {
        assert_eq!(user_root_indices(), 3..4);
    }
}

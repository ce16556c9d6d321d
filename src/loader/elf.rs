use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::io::{ioread_full, Io, IOCTL_GETLEN, IOCTL_SETPOS};
use crate::memory::{
    self, memory_alloc_and_map_range, memory_space_write, MTag, PteFlags, USER_HI,
};

// ── ELF64 constants ──

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// Eagerly mapped user stack: four pages below the top of the window.
const USER_STACK_EAGER: usize = 4 * memory::PAGE_SIZE;
/// The rest of the stack region is demand-mapped on first touch.
const USER_STACK_MAX: usize = 256 * 1024;

// ── ELF64 structures ──

struct Elf64Ehdr {
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf64Ehdr {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 64 {
            return Err(Error::Inval);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(Error::Inval);
        }
        if data[4] != ELFCLASS64 || data[5] != ELFDATA2LSB {
            return Err(Error::Inval);
        }

        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        if e_type != ET_EXEC || e_machine != EM_RISCV {
            return Err(Error::Inval);
        }

        Ok(Elf64Ehdr {
            e_entry: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            e_phoff: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[54], data[55]]),
            e_phnum: u16::from_le_bytes([data[56], data[57]]),
        })
    }
}

struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl Elf64Phdr {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 56 {
            return Err(Error::Inval);
        }
        Ok(Elf64Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_flags: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            p_offset: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }

    fn perms(&self) -> PteFlags {
        let mut perms = PteFlags::U;
        if self.p_flags & PF_R != 0 {
            perms |= PteFlags::R;
        }
        if self.p_flags & PF_W != 0 {
            perms |= PteFlags::W;
        }
        if self.p_flags & PF_X != 0 {
            perms |= PteFlags::X;
        }
        perms
    }
}

/// Result of loading a program image into an address space.
pub struct LoadedImage {
    pub entry: usize,
    pub stack_top: usize,
    /// `(lo, hi, perms)` span to demand-map on page faults.
    pub on_demand: (usize, usize, PteFlags),
}

/// Read the whole object, preferring a single sized read when the object
/// can report its length.
fn read_all(io: &dyn Io) -> Result<Vec<u8>> {
    match io.ctl(IOCTL_GETLEN, 0) {
        Ok(len) => {
            io.ctl(IOCTL_SETPOS, 0)?;
            let mut data = vec![0u8; len];
            let got = ioread_full(io, &mut data)?;
            data.truncate(got);
            Ok(data)
        }
        Err(Error::NotSup) => {
            let mut data = Vec::new();
            let mut chunk = [0u8; 512];
            loop {
                let n = io.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&chunk[..n]);
            }
            Ok(data)
        }
        Err(e) => Err(e),
    }
}

/// Load an ELF64 executable from `io` into `mtag`'s user window and map
/// the user stack at the top of the window.
pub fn load(io: &dyn Io, mtag: MTag) -> Result<LoadedImage> {
    let file_data = read_all(io)?;
    let ehdr = Elf64Ehdr::parse(&file_data)?;

    crate::log_info!(
        "ELF: entry={:#x} phoff={} phnum={}",
        ehdr.e_entry,
        ehdr.e_phoff,
        ehdr.e_phnum
    );

    let stack_lo = USER_HI - USER_STACK_MAX;
    let mut loaded = 0;
    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize;
        if off + 56 > file_data.len() {
            return Err(Error::Inval);
        }
        let phdr = Elf64Phdr::parse(&file_data[off..])?;
        if phdr.p_type != PT_LOAD {
            continue;
        }

        let vaddr = phdr.p_vaddr as usize;
        let memsz = phdr.p_memsz as usize;
        let filesz = phdr.p_filesz as usize;
        if !memory::paging::user_span_ok(vaddr, memsz) || vaddr + memsz > stack_lo {
            return Err(Error::Inval);
        }
        if filesz > memsz || phdr.p_offset as usize + filesz > file_data.len() {
            return Err(Error::Inval);
        }

        memory_alloc_and_map_range(mtag, vaddr, memsz, phdr.perms())?;
        let file_off = phdr.p_offset as usize;
        memory_space_write(mtag, vaddr, &file_data[file_off..file_off + filesz])?;
        // Frames come zeroed, so the BSS tail needs no explicit clearing.
        loaded += 1;
    }
    if loaded == 0 {
        return Err(Error::Inval);
    }

    let entry = ehdr.e_entry as usize;
    if !memory::paging::user_span_ok(entry, 4) {
        return Err(Error::Inval);
    }

    // Eager stack pages at the very top; the rest of the region fills in
    // on demand.
    let stack_perms = PteFlags::R | PteFlags::W | PteFlags::U;
    memory_alloc_and_map_range(mtag, USER_HI - USER_STACK_EAGER, USER_STACK_EAGER, stack_perms)?;

    crate::log_info!("ELF: {} segment(s) mapped, stack_top={:#x}", loaded, USER_HI);
    Ok(LoadedImage {
        entry,
        stack_top: USER_HI,
        on_demand: (stack_lo, USER_HI - USER_STACK_EAGER, stack_perms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_ehdr() -> [u8; 64] {
        let mut h = [0u8; 64];
        h[0..4].copy_from_slice(&ELF_MAGIC);
        h[4] = ELFCLASS64;
        h[5] = ELFDATA2LSB;
        h[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        h[18..20].copy_from_slice(&EM_RISCV.to_le_bytes());
        h[24..32].copy_from_slice(&(0xC000_0000u64).to_le_bytes());
        h[32..40].copy_from_slice(&64u64.to_le_bytes());
        h[54..56].copy_from_slice(&56u16.to_le_bytes());
        h[56..58].copy_from_slice(&1u16.to_le_bytes());
        h
    }

    #[test]
    fn header_parses() {
        let h = minimal_ehdr();
        let ehdr = Elf64Ehdr::parse(&h).unwrap();
        assert_eq!(ehdr.e_entry, 0xC000_0000);
        assert_eq!(ehdr.e_phnum, 1);
        assert_eq!(ehdr.e_phentsize, 56);
    }

    #[test]
    fn bad_magic_and_wrong_machine_rejected() {
        let mut h = minimal_ehdr();
        h[0] = 0;
        assert!(Elf64Ehdr::parse(&h).is_err());

        let mut h = minimal_ehdr();
        h[18..20].copy_from_slice(&62u16.to_le_bytes()); // x86-64
        assert!(Elf64Ehdr::parse(&h).is_err());

        assert!(Elf64Ehdr::parse(&[0u8; 10]).is_err());
    }

    #[test]
    fn phdr_perms_map_to_pte_bits() {
        let mut raw = [0u8; 56];
        raw[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        raw[4..8].copy_from_slice(&(PF_R | PF_X).to_le_bytes());
        let phdr = Elf64Phdr::parse(&raw).unwrap();
        let perms = phdr.perms();
        assert!(perms.contains(PteFlags::R | PteFlags::X | PteFlags::U));
        assert!(!perms.contains(PteFlags::W));
    }
}

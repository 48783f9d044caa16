//! Goblin-based loader: maps ELF, PE, and Mach-O images into an `ImageDatabase`.

use std::fmt;

use goblin::mach::{constants::cputype, Mach, MachO};
use goblin::{elf, pe, Object};

use crate::database::{ImageDatabase, Region};
use crate::{Address, Architecture, DisassemblyError};

/// Loads binaries into an in-memory database focused on their entry point.
#[derive(Debug, Default)]
pub struct GoblinLoader;

impl GoblinLoader {
    /// Construct a new GoblinLoader.
    pub fn new() -> Self {
        GoblinLoader
    }

    /// Parse `data` and map its loadable sections.
    pub fn load(&self, data: &[u8]) -> Result<ImageDatabase, DisassemblyError> {
        match Object::parse(data) {
            Ok(Object::Elf(elf)) => self.load_elf(&elf, data),
            Ok(Object::PE(pe)) => self.load_pe(&pe, data),
            Ok(Object::Mach(Mach::Binary(macho))) => self.load_macho(&macho),
            Ok(Object::Mach(Mach::Fat(_))) => Err(DisassemblyError::ParsingError(
                "Fat Mach-O archives are not supported; extract one slice first".into(),
            )),
            Ok(_) => Err(DisassemblyError::ParsingError("Unsupported file format".into())),
            Err(e) => Err(DisassemblyError::ParsingError(e.to_string())),
        }
    }

    /// Map a flat file as one executable region at `base`.
    pub fn load_raw(
        &self,
        data: &[u8],
        base: Address,
        architecture: Architecture,
    ) -> Result<ImageDatabase, DisassemblyError> {
        let is_64bit = architecture
            .is_64bit()
            .ok_or(DisassemblyError::UnsupportedArchitecture(architecture))?;
        let mut db = ImageDatabase::new(architecture, is_64bit);
        db.add_region(Region::new("raw", base, data.to_vec(), true))
            .map_err(|e| DisassemblyError::ParsingError(e.to_string()))?;
        db.set_focus(base);
        Ok(db)
    }

    /// Load an ELF image.
    fn load_elf(&self, elf: &elf::Elf, data: &[u8]) -> Result<ImageDatabase, DisassemblyError> {
        let arch = match elf.header.e_machine {
            elf::header::EM_386 => Architecture::X86_32,
            elf::header::EM_X86_64 => Architecture::X86_64,
            elf::header::EM_ARM => Architecture::Arm,
            elf::header::EM_AARCH64 => Architecture::AArch64,
            elf::header::EM_MIPS => Architecture::Mips32,
            elf::header::EM_RISCV => {
                if elf.is_64 {
                    Architecture::RiscV64
                } else {
                    Architecture::RiscV32
                }
            }
            _ => Architecture::Unknown,
        };

        let mut db = ImageDatabase::new(arch, elf.is_64);

        // Allocated sections, skipping thread-local templates that alias other addresses
        let mut mapped = 0;
        for sh in &elf.section_headers {
            let flags = sh.sh_flags;
            if flags & elf::section_header::SHF_ALLOC as u64 == 0
                || flags & elf::section_header::SHF_TLS as u64 != 0
                || sh.sh_size == 0
            {
                continue;
            }
            let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string();
            let bytes = if sh.sh_type == elf::section_header::SHT_NOBITS {
                Vec::new()
            } else {
                file_slice(data, sh.sh_offset, sh.sh_size).to_vec()
            };
            let region = Region::new(name, sh.sh_addr, bytes, sh.is_executable())
                .with_size(sh.sh_size as usize);
            if add_region(&mut db, region) {
                mapped += 1;
            }
        }

        // Section headers may be stripped; fall back to loadable segments
        if mapped == 0 {
            for (i, ph) in elf.program_headers.iter().enumerate() {
                if ph.p_type != elf::program_header::PT_LOAD || ph.p_memsz == 0 {
                    continue;
                }
                let bytes = file_slice(data, ph.p_offset, ph.p_filesz).to_vec();
                let region = Region::new(format!("LOAD{}", i), ph.p_vaddr, bytes, ph.is_executable())
                    .with_size(ph.p_memsz as usize);
                add_region(&mut db, region);
            }
        }

        db.set_focus(elf.entry);
        Ok(db)
    }

    /// Load a PE image.
    fn load_pe(&self, pe: &pe::PE<'_>, data: &[u8]) -> Result<ImageDatabase, DisassemblyError> {
        let arch = match pe.header.coff_header.machine {
            pe::header::COFF_MACHINE_X86 => Architecture::X86_32,
            pe::header::COFF_MACHINE_X86_64 => Architecture::X86_64,
            pe::header::COFF_MACHINE_ARM => Architecture::Arm,
            pe::header::COFF_MACHINE_ARM64 => Architecture::AArch64,
            _ => Architecture::Unknown,
        };

        let image_base = pe.image_base as Address;
        let mut db = ImageDatabase::new(arch, pe.is_64);

        for sect in &pe.sections {
            let name = sect.name().unwrap_or("").to_string();
            let executable =
                (sect.characteristics & pe::section_table::IMAGE_SCN_MEM_EXECUTE) != 0;
            let bytes = file_slice(data, sect.pointer_to_raw_data as u64, sect.size_of_raw_data as u64).to_vec();
            let size = (sect.virtual_size as usize).max(bytes.len());
            let Some(start) = image_base.checked_add(sect.virtual_address as Address) else {
                log::warn!("Skipping section '{}': RVA 0x{:x} wraps the address space", name, sect.virtual_address);
                continue;
            };
            let region = Region::new(name, start, bytes, executable).with_size(size);
            add_region(&mut db, region);
        }

        db.set_focus(image_base.saturating_add(pe.entry as Address));
        Ok(db)
    }

    /// Load a single-architecture Mach-O image.
    fn load_macho(&self, macho: &MachO<'_>) -> Result<ImageDatabase, DisassemblyError> {
        let arch = match macho.header.cputype {
            cputype::CPU_TYPE_I386 => Architecture::X86_32,
            cputype::CPU_TYPE_X86_64 => Architecture::X86_64,
            cputype::CPU_TYPE_ARM => Architecture::Arm,
            cputype::CPU_TYPE_ARM64 => Architecture::AArch64,
            _ => Architecture::Unknown,
        };

        let mut db = ImageDatabase::new(arch, macho.is_64);

        for segment in &macho.segments {
            // __PAGEZERO and friends carry no access rights
            if segment.maxprot == 0 || segment.vmsize == 0 {
                continue;
            }
            let name = segment.name().unwrap_or("").to_string();
            let executable = (segment.maxprot & 0x4) != 0;
            let region = Region::new(name, segment.vmaddr, segment.data.to_vec(), executable)
                .with_size(segment.vmsize as usize);
            add_region(&mut db, region);
        }

        // LC_MAIN stores a file offset; LC_UNIXTHREAD stores the address
        let entry = if macho.old_style_entry {
            macho.entry
        } else {
            macho
                .segments
                .iter()
                .find_map(|s| file_offset_to_address(macho.entry, s.fileoff, s.filesize, s.vmaddr))
                .unwrap_or(macho.entry)
        };
        db.set_focus(entry);
        Ok(db)
    }
}

impl fmt::Display for GoblinLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GoblinLoader")
    }
}

/// Clamp a file range to the data actually present.
fn file_slice(data: &[u8], offset: u64, len: u64) -> &[u8] {
    let start = (offset as usize).min(data.len());
    let end = start.saturating_add(len as usize).min(data.len());
    &data[start..end]
}

/// Map a file offset into the segment loaded from `[fileoff, fileoff + filesize)` at `vmaddr`.
fn file_offset_to_address(offset: u64, fileoff: u64, filesize: u64, vmaddr: Address) -> Option<Address> {
    if offset < fileoff || offset >= fileoff.saturating_add(filesize) {
        return None;
    }
    vmaddr.checked_add(offset - fileoff)
}

fn add_region(db: &mut ImageDatabase, region: Region) -> bool {
    match db.add_region(region) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Skipping region: {}", e);
            false
        }
    }
}

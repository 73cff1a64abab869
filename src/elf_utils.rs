//! ELF loading
//!
//! Loads every allocatable section of a 32-bit RISC-V ELF image into
//! guest memory through the host IO callbacks and reports the entry
//! point. Only static, freestanding images are supported; there is no
//! relocation and no dynamic linking.

use elf::abi::SHF_ALLOC;
use elf::endian::AnyEndian;
use elf::ElfBytes;
use log::debug;
use thiserror::Error;

use crate::machine::SystemIo;

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("could not read ELF file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse ELF file: {0}")]
    Parse(#[from] elf::ParseError),
}

/// Load the image at `path` into guest memory; returns the ELF entry
/// point, to be written to the machine's pc.
pub fn load_elf<IO: SystemIo>(io: &mut IO, path: &str) -> Result<u32, ElfError> {
    let file_data = std::fs::read(path)?;
    let file = ElfBytes::<AnyEndian>::minimal_parse(&file_data)?;

    if let Some(section_headers) = file.section_headers() {
        for header in section_headers.iter() {
            if header.sh_flags & u64::from(SHF_ALLOC) == 0 {
                continue;
            }
            // SHT_NOBITS (.bss) has no file data; guest memory is
            // already zeroed.
            let (data, compression) = file.section_data(&header)?;
            if compression.is_some() {
                continue;
            }
            let load_address = header.sh_addr as u32;
            debug!(
                "loading section at {load_address:#010x} ({} bytes)",
                data.len()
            );
            for (offset, byte) in data.iter().enumerate() {
                io.write_b(load_address.wrapping_add(offset as u32), *byte);
            }
        }
    }
    Ok(file.ehdr.e_entry as u32)
}

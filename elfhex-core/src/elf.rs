//! ELF32 file header and program header table construction. The headers are
//! program-independent; their field values are filled in from the layout the
//! renderer computes.

use crate::program::{Endianness, Metadata};

pub const FILE_HEADER_SIZE: u32 = 52;
pub const PROGRAM_HEADER_ENTRY_SIZE: u32 = 32;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;

/// Total size of the ELF header plus the program header table.
pub fn header_size(segment_count: usize) -> u32 {
    FILE_HEADER_SIZE + PROGRAM_HEADER_ENTRY_SIZE * segment_count as u32
}

/// One PT_LOAD entry, filled in from the renderer's layout.
pub struct ProgramHeader {
    pub offset: u32,
    pub vaddr: u32,
    pub file_size: u32,
    pub mem_size: u32,
    pub flags: u32,
    pub align: u32,
}

pub fn render_file_header(metadata: &Metadata, entry: u32, segment_count: usize) -> Vec<u8> {
    let endianness = metadata.endianness;
    let mut out = Vec::with_capacity(FILE_HEADER_SIZE as usize);
    out.extend_from_slice(&ELF_MAGIC);
    out.push(ELFCLASS32);
    out.push(match endianness {
        Endianness::Little => ELFDATA2LSB,
        Endianness::Big => ELFDATA2MSB,
    });
    out.push(EV_CURRENT);
    out.push(0); // EI_OSABI
    out.push(0); // EI_ABIVERSION
    out.extend_from_slice(&[0; 7]);
    endianness.write_u16(&mut out, ET_EXEC);
    endianness.write_u16(&mut out, metadata.machine);
    endianness.write_u32(&mut out, 1); // e_version
    endianness.write_u32(&mut out, entry);
    endianness.write_u32(&mut out, FILE_HEADER_SIZE); // e_phoff
    endianness.write_u32(&mut out, 0); // e_shoff
    endianness.write_u32(&mut out, 0); // e_flags
    endianness.write_u16(&mut out, FILE_HEADER_SIZE as u16);
    endianness.write_u16(&mut out, PROGRAM_HEADER_ENTRY_SIZE as u16);
    endianness.write_u16(&mut out, segment_count as u16);
    endianness.write_u16(&mut out, 0); // e_shentsize
    endianness.write_u16(&mut out, 0); // e_shnum
    endianness.write_u16(&mut out, 0); // e_shstrndx
    out
}

pub fn render_program_headers(metadata: &Metadata, headers: &[ProgramHeader]) -> Vec<u8> {
    let endianness = metadata.endianness;
    let mut out = Vec::with_capacity(headers.len() * PROGRAM_HEADER_ENTRY_SIZE as usize);
    for header in headers {
        endianness.write_u32(&mut out, PT_LOAD);
        endianness.write_u32(&mut out, header.offset);
        endianness.write_u32(&mut out, header.vaddr);
        endianness.write_u32(&mut out, header.vaddr); // p_paddr
        endianness.write_u32(&mut out, header.file_size);
        endianness.write_u32(&mut out, header.mem_size);
        endianness.write_u32(&mut out, header.flags);
        endianness.write_u32(&mut out, header.align);
    }
    out
}

//! Guest image loaders: ELF executables and uImages (optionally
//! gzip-compressed payloads), plus raw binary blobs.
//!
//! Loaders run on the partition's boot vCPU during start-with-load and
//! copy segments into guest-physical memory through the translation
//! tables, so a partition can never load outside its own memory.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errors::{Error, Result};
use crate::log::{LogLevel, LogType};
use crate::printlog;

use super::guestmem;
use super::Guest;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELFCLASS32: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const PT_LOAD: u32 = 1;

const UIMAGE_MAGIC: u32 = 0x2705_1956;
const UIMAGE_COMP_NONE: u8 = 0;
const UIMAGE_COMP_GZIP: u8 = 1;

fn be16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

fn be32(b: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

/// Load every registered image. Returns the entry point recorded from
/// the last image that carried one.
pub fn load_images(guest: &Arc<Guest>) -> Result<()> {
    let images = guest.images.lock();
    for image in images.iter() {
        load_image(guest, &image.data, image.dest_gphys)?;
    }
    Ok(())
}

/// Detect the image format by magic and dispatch.
pub fn load_image(guest: &Arc<Guest>, data: &[u8], dest: u64) -> Result<()> {
    if data.len() >= 4 && &data[..4] == ELF_MAGIC {
        return load_elf(guest, data);
    }
    if data.len() >= 64 && be32(data, 0) == UIMAGE_MAGIC {
        return load_uimage(guest, data);
    }

    // raw binary: copy to the destination, entry at its base
    guestmem::copy_to_gphys(guest, dest, data)?;
    guest.entry.store(dest, core::sync::atomic::Ordering::Release);
    Ok(())
}

/// Load a 32-bit big-endian ELF's PT_LOAD segments at their physical
/// addresses and record the entry point.
pub fn load_elf(guest: &Arc<Guest>, image: &[u8]) -> Result<()> {
    if image.len() < 52 || &image[..4] != ELF_MAGIC {
        return Err(Error::Invalid);
    }
    if image[4] != ELFCLASS32 || image[5] != ELFDATA2MSB {
        printlog!(LogType::Partition, LogLevel::Error,
                  "load_elf: not a 32-bit big-endian image");
        return Err(Error::Invalid);
    }

    let entry = be32(image, 24) as u64;
    let phoff = be32(image, 28) as usize;
    let phentsize = be16(image, 42) as usize;
    let phnum = be16(image, 44) as usize;

    if phentsize < 32 || phoff + phnum * phentsize > image.len() {
        return Err(Error::Invalid);
    }

    for i in 0..phnum {
        let ph = phoff + i * phentsize;
        let p_type = be32(image, ph);
        if p_type != PT_LOAD {
            continue;
        }

        let p_offset = be32(image, ph + 4) as usize;
        let p_paddr = be32(image, ph + 12) as u64;
        let p_filesz = be32(image, ph + 16) as usize;
        let p_memsz = be32(image, ph + 20) as usize;

        if p_offset + p_filesz > image.len() || p_memsz < p_filesz {
            return Err(Error::Invalid);
        }

        printlog!(LogType::Partition, LogLevel::Debug,
                  "load_elf: segment at {:#x}, filesz {:#x}, memsz {:#x}",
                  p_paddr, p_filesz, p_memsz);

        guestmem::copy_to_gphys(guest, p_paddr, &image[p_offset..p_offset + p_filesz])?;
        if p_memsz > p_filesz {
            let zeros = alloc::vec![0u8; p_memsz - p_filesz];
            guestmem::copy_to_gphys(guest, p_paddr + p_filesz as u64, &zeros)?;
        }
    }

    guest.entry.store(entry, core::sync::atomic::Ordering::Release);
    Ok(())
}

/// Strip a gzip wrapper and inflate the raw deflate stream.
fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 18 || data[0] != 0x1f || data[1] != 0x8b || data[2] != 8 {
        return Err(Error::Invalid);
    }

    let flags = data[3];
    let mut off = 10;
    if flags & 0x04 != 0 {
        // FEXTRA
        if off + 2 > data.len() {
            return Err(Error::Invalid);
        }
        let xlen = u16::from_le_bytes([data[off], data[off + 1]]) as usize;
        off += 2 + xlen;
    }
    if flags & 0x08 != 0 {
        // FNAME
        off += data.get(off..).ok_or(Error::Invalid)?
            .iter().position(|&b| b == 0).ok_or(Error::Invalid)? + 1;
    }
    if flags & 0x10 != 0 {
        // FCOMMENT
        off += data.get(off..).ok_or(Error::Invalid)?
            .iter().position(|&b| b == 0).ok_or(Error::Invalid)? + 1;
    }
    if flags & 0x02 != 0 {
        // FHCRC
        off += 2;
    }
    if off >= data.len() - 8 {
        return Err(Error::Invalid);
    }

    miniz_oxide::inflate::decompress_to_vec(&data[off..data.len() - 8])
        .map_err(|_| Error::Invalid)
}

/// Load a uImage: 64-byte header followed by the payload, which may be
/// gzip-compressed.
pub fn load_uimage(guest: &Arc<Guest>, image: &[u8]) -> Result<()> {
    if image.len() < 64 || be32(image, 0) != UIMAGE_MAGIC {
        return Err(Error::Invalid);
    }

    let size = be32(image, 12) as usize;
    let load = be32(image, 16) as u64;
    let ep = be32(image, 20) as u64;
    let comp = image[31];

    if 64 + size > image.len() {
        return Err(Error::Invalid);
    }
    let payload = &image[64..64 + size];

    match comp {
        UIMAGE_COMP_NONE => {
            guestmem::copy_to_gphys(guest, load, payload)?;
        }
        UIMAGE_COMP_GZIP => {
            let data = gunzip(payload)?;
            printlog!(LogType::Partition, LogLevel::Debug,
                      "load_uimage: inflated {:#x} -> {:#x} bytes", size, data.len());
            guestmem::copy_to_gphys(guest, load, &data)?;
        }
        _ => {
            printlog!(LogType::Partition, LogLevel::Error,
                      "load_uimage: unsupported compression {}", comp);
            return Err(Error::Unimplemented);
        }
    }

    guest.entry.store(ep, core::sync::atomic::Ordering::Release);
    Ok(())
}

// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Boot-image loader: detects and loads a Linux bzImage or a flat binary
//! into guest RAM, in the form the x86 architecture expects to find at
//! reset. See `Documentation/x86/boot.txt` in the Linux source tree for the
//! on-disk layout this module hard-codes offsets against.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::ivt::InterruptTable;
use crate::memory::GuestRam;

pub const BOOT_LOADER_SELECTOR: u16 = 0x1000;
pub const BOOT_LOADER_IP: u16 = 0x0000;
pub const BOOT_LOADER_SP: u16 = 0x8000;
pub const BOOT_CMDLINE_OFFSET: u64 = 0x0002_0000;
pub const BZ_KERNEL_START: u64 = 0x0010_0000;

const BZIMAGE_MAGIC: &[u8; 4] = b"HdrS";
const BOOT_PROTOCOL_REQUIRED: u16 = 0x0202;
const BZ_DEFAULT_SETUP_SECTS: u8 = 4;
const CAN_USE_HEAP: u8 = 0x80;

/// Kernel command-line prefix, byte-exact per spec.md §6, including the
/// trailing space before any user-supplied parameters.
pub const CMDLINE_PREFIX: &str =
    "notsc nolapic nosmp noacpi pci=conf1 console=ttyS0 root=fc00 rw ";
pub const CMDLINE_MAX_LEN: usize = 2048;

/// Offsets of the `setup_header` fields this loader reads or patches,
/// counted from the start of the file / the start of the setup region once
/// loaded into guest memory (both are the same offset, since the whole
/// setup region — including the header — is copied verbatim). See
/// `Documentation/x86/boot.txt`.
mod hdr_offset {
    pub const SETUP_SECTS: u64 = 0x1f1;
    pub const HEADER_MAGIC: u64 = 0x202;
    pub const VERSION: u64 = 0x206;
    pub const TYPE_OF_LOADER: u64 = 0x210;
    pub const LOADFLAGS: u64 = 0x211;
    pub const HEAP_END_PTR: u64 = 0x224;
    pub const CMD_LINE_PTR: u64 = 0x228;
    pub const CMDLINE_SIZE: u64 = 0x238;
}

/// The two recognized guest kernel image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootImageKind {
    BzImage,
    FlatBinary,
}

/// Everything the VCPU initializer needs once a kernel has been loaded.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    pub kind: BootImageKind,
    pub boot_selector: u16,
    /// Real-mode instruction pointer the vCPU starts at. Carried as `u32`
    /// (wider than the 16-bit offset real mode can actually address) so an
    /// out-of-range value survives to `cpu::configure_regs`'s fatal check
    /// instead of being silently wrapped at construction time.
    pub boot_ip: u32,
    pub boot_sp: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} is not a valid bzImage or flat binary")]
    NotAKernelImage(String),
    #[error("I/O error loading kernel image: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Memory(#[from] crate::memory::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Try bzImage first, then fall back to flat binary. Fatal (propagates) on
/// any failure, including "neither format matched" (spec.md §4.4).
pub fn load_kernel(
    ram: &GuestRam,
    ivt: &mut InterruptTable,
    kernel_path: &std::path::Path,
    cmdline: &str,
) -> Result<BootInfo> {
    let display_path = kernel_path.display().to_string();
    let mut file = File::open(kernel_path)?;

    if let Some(info) = try_load_bzimage(ram, ivt, &mut file, cmdline)? {
        return Ok(info);
    }

    if let Some(info) = try_load_flat_binary(ram, &mut file)? {
        return Ok(info);
    }

    Err(Error::NotAKernelImage(display_path))
}

fn read_u8_at(buf: &[u8], off: u64) -> u8 {
    buf[off as usize]
}

fn read_u16_at(buf: &[u8], off: u64) -> u16 {
    let off = off as usize;
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32_at(buf: &[u8], off: u64) -> u32 {
    let off = off as usize;
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Enough of the file to cover every `hdr_offset` constant above.
const HEADER_PROBE_LEN: usize = 0x250;

fn try_load_bzimage(
    ram: &GuestRam,
    ivt: &mut InterruptTable,
    file: &mut File,
    cmdline: &str,
) -> Result<Option<BootInfo>> {
    file.seek(SeekFrom::Start(0))?;
    let mut header = vec![0u8; HEADER_PROBE_LEN];
    let read = file.read(&mut header)?;
    header.truncate(read);
    if header.len() < (hdr_offset::VERSION as usize + 2) {
        return Ok(None);
    }

    let magic = &header[hdr_offset::HEADER_MAGIC as usize..hdr_offset::HEADER_MAGIC as usize + 4];
    if magic != BZIMAGE_MAGIC {
        return Ok(None);
    }

    let version = read_u16_at(&header, hdr_offset::VERSION);
    if version < BOOT_PROTOCOL_REQUIRED {
        return Ok(None);
    }

    let mut setup_sects = read_u8_at(&header, hdr_offset::SETUP_SECTS);
    if setup_sects == 0 {
        setup_sects = BZ_DEFAULT_SETUP_SECTS;
    }
    let setup_size = (setup_sects as usize + 1) * 512;

    // Load the whole setup region (real-mode code + header) at the
    // real-mode boot segment, flat 0x10000.
    file.seek(SeekFrom::Start(0))?;
    let setup_addr = ram.real(BOOT_LOADER_SELECTOR, BOOT_LOADER_IP);
    ram.read_from(setup_addr, file, setup_size)?;

    // Load the protected-mode payload at 1 MiB.
    let remaining = file.metadata()?.len().saturating_sub(setup_size as u64);
    if remaining > 0 {
        ram.read_from(ram.flat(BZ_KERNEL_START), file, remaining as usize)?;
    }

    // Command line, NUL-terminated and padded to `cmdline_size`.
    let cmdline_size = read_u32_at(&header, hdr_offset::CMDLINE_SIZE) as usize;
    if cmdline_size > 0 {
        let mut buf = vec![0u8; cmdline_size];
        let visible = std::cmp::min(cmdline.len() + 1, cmdline_size);
        buf[..visible - 1].copy_from_slice(&cmdline.as_bytes()[..visible - 1]);
        ram.write_slice(&buf, ram.flat(BOOT_CMDLINE_OFFSET))?;
    }

    // Patch the in-guest copy of the setup header.
    let hdr_addr = |off: u64| ram.real(BOOT_LOADER_SELECTOR, off as u16);
    ram.write_obj(BOOT_CMDLINE_OFFSET as u32, hdr_addr(hdr_offset::CMD_LINE_PTR))?;
    ram.write_obj(0xffu8, hdr_addr(hdr_offset::TYPE_OF_LOADER))?;
    ram.write_obj(0xfe00u16, hdr_addr(hdr_offset::HEAP_END_PTR))?;
    let loadflags: u8 = ram.read_obj(hdr_addr(hdr_offset::LOADFLAGS))?;
    ram.write_obj(loadflags | CAN_USE_HEAP, hdr_addr(hdr_offset::LOADFLAGS))?;

    ivt.install(ram)?;

    Ok(Some(BootInfo {
        kind: BootImageKind::BzImage,
        boot_selector: BOOT_LOADER_SELECTOR,
        boot_ip: BOOT_LOADER_IP as u32 + 0x0200,
        boot_sp: BOOT_LOADER_SP,
    }))
}

/// Always succeeds once reached — there is no content validation for a
/// flat binary, by design (spec.md §9 Open Question).
fn try_load_flat_binary(ram: &GuestRam, file: &mut File) -> Result<Option<BootInfo>> {
    file.seek(SeekFrom::Start(0))?;
    let size = file.metadata()?.len() as usize;
    let addr = ram.real(BOOT_LOADER_SELECTOR, BOOT_LOADER_IP);
    ram.read_from(addr, file, size)?;

    Ok(Some(BootInfo {
        kind: BootImageKind::FlatBinary,
        boot_selector: BOOT_LOADER_SELECTOR,
        boot_ip: BOOT_LOADER_IP as u32,
        boot_sp: BOOT_LOADER_SP,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MIN_RAM_SIZE;
    use std::io::Write;

    fn bzimage_fixture(version: u16, setup_sects: u8, cmdline_size: u32, tail_len: usize) -> Vec<u8> {
        let mut data = vec![0u8; HEADER_PROBE_LEN];
        data[hdr_offset::SETUP_SECTS as usize] = setup_sects;
        data[hdr_offset::HEADER_MAGIC as usize..hdr_offset::HEADER_MAGIC as usize + 4]
            .copy_from_slice(BZIMAGE_MAGIC);
        data[hdr_offset::VERSION as usize..hdr_offset::VERSION as usize + 2]
            .copy_from_slice(&version.to_le_bytes());
        data[hdr_offset::CMDLINE_SIZE as usize..hdr_offset::CMDLINE_SIZE as usize + 4]
            .copy_from_slice(&cmdline_size.to_le_bytes());
        data[hdr_offset::LOADFLAGS as usize] = 0x01;

        let setup_sects_eff = if setup_sects == 0 { BZ_DEFAULT_SETUP_SECTS } else { setup_sects };
        let setup_size = (setup_sects_eff as usize + 1) * 512;
        data.resize(setup_size, 0);
        data.extend(std::iter::repeat(0xAAu8).take(tail_len));
        data
    }

    fn write_tmp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    // E1 — bzImage load.
    #[test]
    fn e1_bzimage_load() {
        let data = bzimage_fixture(0x020a, 4, 256, 0xA00);
        let f = write_tmp(&data);
        let ram = GuestRam::new(MIN_RAM_SIZE).unwrap();
        let mut ivt = InterruptTable::new();

        let info = load_kernel(&ram, &mut ivt, f.path(), "quiet").unwrap();
        assert_eq!(info.kind, BootImageKind::BzImage);
        assert_eq!(info.boot_ip, 0x0200);

        let setup_size = (4 + 1) * 512;
        let mut got = vec![0u8; setup_size];
        ram.read_slice(&mut got, ram.flat(0x10000)).unwrap();
        assert_eq!(&got[..], &data[..setup_size]);

        let mut tail = vec![0u8; 0xA00];
        ram.read_slice(&mut tail, ram.flat(0x100000)).unwrap();
        assert_eq!(&tail[..], &data[setup_size..]);

        let mut cmdline_area = vec![0u8; 256];
        ram.read_slice(&mut cmdline_area, ram.flat(0x20000)).unwrap();
        assert_eq!(&cmdline_area[..6], b"quiet\0");
        assert!(cmdline_area[6..].iter().all(|&b| b == 0));

        let cmd_line_ptr: u32 = ram
            .read_obj(ram.real(BOOT_LOADER_SELECTOR, hdr_offset::CMD_LINE_PTR as u16))
            .unwrap();
        assert_eq!(cmd_line_ptr, 0x20000);
        let type_of_loader: u8 = ram
            .read_obj(ram.real(BOOT_LOADER_SELECTOR, hdr_offset::TYPE_OF_LOADER as u16))
            .unwrap();
        assert_eq!(type_of_loader, 0xff);
        let heap_end_ptr: u16 = ram
            .read_obj(ram.real(BOOT_LOADER_SELECTOR, hdr_offset::HEAP_END_PTR as u16))
            .unwrap();
        assert_eq!(heap_end_ptr, 0xfe00);
        let loadflags: u8 = ram
            .read_obj(ram.real(BOOT_LOADER_SELECTOR, hdr_offset::LOADFLAGS as u16))
            .unwrap();
        assert_eq!(loadflags & CAN_USE_HEAP, CAN_USE_HEAP);
    }

    // E2 — flat binary fallback.
    #[test]
    fn e2_flat_binary_fallback() {
        let data = vec![0x90u8; 1024]; // no "HdrS" anywhere relevant
        let f = write_tmp(&data);
        let ram = GuestRam::new(MIN_RAM_SIZE).unwrap();
        let mut ivt = InterruptTable::new();

        let info = load_kernel(&ram, &mut ivt, f.path(), "").unwrap();
        assert_eq!(info.kind, BootImageKind::FlatBinary);
        assert_eq!(info.boot_ip, 0x0000);

        let mut got = vec![0u8; data.len()];
        ram.read_slice(&mut got, ram.flat(0x10000)).unwrap();
        assert_eq!(got, data);
    }

    // E3 — invalid bzImage version falls through to flat binary.
    #[test]
    fn e3_old_version_falls_back_to_flat() {
        let data = bzimage_fixture(0x0201, 4, 256, 0x100);
        let f = write_tmp(&data);
        let ram = GuestRam::new(MIN_RAM_SIZE).unwrap();
        let mut ivt = InterruptTable::new();

        let info = load_kernel(&ram, &mut ivt, f.path(), "").unwrap();
        assert_eq!(info.kind, BootImageKind::FlatBinary);
        assert_eq!(info.boot_ip, 0x0000);
    }

    #[test]
    fn cmdline_prefix_is_byte_exact() {
        assert_eq!(
            CMDLINE_PREFIX,
            "notsc nolapic nosmp noacpi pci=conf1 console=ttyS0 root=fc00 rw "
        );
    }
}

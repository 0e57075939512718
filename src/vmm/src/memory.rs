// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest physical RAM: a single, page-aligned host-backed region registered
//! at guest address 0, plus the real-mode addressing helpers the boot-image
//! loader and the inspector both need.

use vm_memory::{Address, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

/// Minimum guest RAM size the core will accept, in bytes (64 MiB).
pub const MIN_RAM_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to allocate {0} bytes of guest memory: {1}")]
    Allocate(u64, vm_memory::Error),
    #[error("guest memory access out of bounds: {0}")]
    OutOfBounds(#[source] vm_memory::GuestMemoryError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Page-aligned guest RAM backed by a single anonymous mmap, registered at
/// guest physical address 0.
pub struct GuestRam {
    mem: GuestMemoryMmap,
    size: u64,
}

impl GuestRam {
    /// Allocate `size` bytes of guest RAM. `size` must already be a multiple
    /// of the host page size and at least [`MIN_RAM_SIZE`]; the caller
    /// (`Machine::new`) is responsible for rounding.
    pub fn new(size: u64) -> Result<Self> {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size as usize)])
            .map_err(|e| Error::Allocate(size, e))?;
        Ok(GuestRam { mem, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// `flat_to_host`: a guest physical address, as a [`GuestAddress`] ready
    /// for use with the `Bytes`/`GuestMemory` accessors below. There is no
    /// host pointer in this port (see DESIGN.md) — bounds are enforced by
    /// the underlying region on every access instead of by a manual check.
    pub fn flat(&self, addr: u64) -> GuestAddress {
        GuestAddress(addr)
    }

    /// `real_to_host`: real-mode segment:offset -> guest physical address.
    pub fn real(&self, selector: u16, offset: u16) -> GuestAddress {
        self.flat(real_to_flat(selector, offset))
    }

    /// `in_ram`: is this guest physical address inside the registered RAM
    /// region?
    pub fn in_ram(&self, addr: GuestAddress) -> bool {
        addr.raw_value() < self.size
    }

    pub fn write_obj<T: vm_memory::ByteValued>(&self, val: T, addr: GuestAddress) -> Result<()> {
        self.mem.write_obj(val, addr).map_err(Error::OutOfBounds)
    }

    pub fn read_obj<T: vm_memory::ByteValued>(&self, addr: GuestAddress) -> Result<T> {
        self.mem.read_obj(addr).map_err(Error::OutOfBounds)
    }

    pub fn write_slice(&self, buf: &[u8], addr: GuestAddress) -> Result<()> {
        self.mem.write_slice(buf, addr).map_err(Error::OutOfBounds)
    }

    pub fn read_slice(&self, buf: &mut [u8], addr: GuestAddress) -> Result<()> {
        self.mem.read_slice(buf, addr).map_err(Error::OutOfBounds)
    }

    /// Copy `count` bytes directly from `src` into guest memory at `addr`,
    /// without an intermediate heap buffer (used for the bulk of the kernel
    /// image load).
    pub fn read_from<F: std::io::Read>(
        &self,
        addr: GuestAddress,
        src: &mut F,
        count: usize,
    ) -> Result<usize> {
        self.mem.read_from(addr, src, count).map_err(Error::OutOfBounds)
    }

    /// Raw access for the inspector, which needs to read one byte at a time
    /// and stop cleanly the moment it steps outside RAM.
    pub fn read_byte(&self, addr: GuestAddress) -> Option<u8> {
        if !self.in_ram(addr) {
            return None;
        }
        self.mem.read_obj(addr).ok()
    }

    pub(crate) fn inner(&self) -> &GuestMemoryMmap {
        &self.mem
    }
}

/// `selector_to_base`: real-mode segment base address.
pub fn selector_to_base(selector: u16) -> u32 {
    selector as u32 * 16
}

/// Flatten a real-mode (selector, offset) pair: `(selector << 4) + offset`.
pub fn real_to_flat(selector: u16, offset: u16) -> u64 {
    ((selector as u64) << 4) + offset as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    // Representative sample spanning the u16 range, used in place of a
    // property-test crate (none is present in this workspace's dependency
    // graph) to exercise invariants 1 and 3 from the design's testable
    // properties list.
    const SAMPLE_U16: [u16; 7] = [0, 1, 0x200, 0x1000, 0x7fff, 0xfffe, 0xffff];

    #[test]
    fn selector_to_base_matches_formula() {
        for &s in &SAMPLE_U16 {
            assert_eq!(selector_to_base(s), s as u32 * 16);
        }
    }

    #[test]
    fn ram_min_size_registers_at_zero() {
        let ram = GuestRam::new(MIN_RAM_SIZE).unwrap();
        assert!(ram.in_ram(ram.flat(0)));
        assert!(!ram.in_ram(ram.flat(MIN_RAM_SIZE)));
    }

    #[test]
    fn real_to_host_matches_flat_to_host() {
        let ram = GuestRam::new(MIN_RAM_SIZE).unwrap();
        for &selector in &SAMPLE_U16 {
            for &offset in &SAMPLE_U16 {
                let flat = real_to_flat(selector, offset);
                assert_eq!(ram.real(selector, offset), ram.flat(flat));
            }
        }
    }
}

// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Fake real-mode interrupt vector table. The guest never takes a real
//! interrupt through the BIOS during boot; it only needs every one of the
//! 256 vectors to point at *something* that returns with `iret`, plus a
//! placeholder at `0x10` (BIOS video services) that does the same.

use crate::memory::GuestRam;

/// Start of the "BIOS data area" low-memory region handler stubs are
/// placed in.
pub const BDA_START: u64 = 0x000f_0000;

const ENTRY_COUNT: usize = 256;
const ENTRY_SIZE: usize = 4;

/// `iret` — a real-mode handler stub that immediately returns to the
/// interrupted code.
const IRET_STUB: [u8; 1] = [0xcf];

/// A 4-byte real-mode interrupt vector: (segment, offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterruptDescriptor {
    pub segment: u16,
    pub offset: u16,
}

/// `flat >> 4` — the segment a blob placed at a 16-byte-aligned flat
/// address lives in, with offset 0.
fn real_segment(flat: u64) -> u16 {
    (flat >> 4) as u16
}

/// Builder for the 256-entry real-mode IVT plus the handler blobs its
/// entries point at. Blobs are packed into the BDA region back to back,
/// each starting on the next 16-byte-aligned address after the previous
/// one.
pub struct InterruptTable {
    entries: [InterruptDescriptor; ENTRY_COUNT],
    cursor: u64,
}

impl InterruptTable {
    pub fn new() -> Self {
        InterruptTable {
            entries: [InterruptDescriptor::default(); ENTRY_COUNT],
            cursor: BDA_START,
        }
    }

    /// Fill every entry with `default`.
    pub fn setup(&mut self, default: InterruptDescriptor) {
        self.entries = [default; ENTRY_COUNT];
    }

    /// Override a single entry.
    pub fn set(&mut self, index: usize, desc: InterruptDescriptor) {
        self.entries[index] = desc;
    }

    /// Byte size of the whole table (256 × 4).
    pub fn byte_size() -> usize {
        ENTRY_COUNT * ENTRY_SIZE
    }

    /// Next free, 16-byte-aligned blob address, and reserve `len` bytes
    /// starting there.
    fn allocate(&mut self, len: usize) -> u64 {
        let addr = self.cursor;
        let aligned_len = (len + 15) & !15;
        self.cursor += aligned_len as u64;
        addr
    }

    /// Write `256 × 4 = 1024` bytes of vector table to `dest` (guest flat
    /// address 0).
    pub fn copy(&self, ram: &GuestRam, dest: u64) -> crate::memory::Result<()> {
        let mut buf = [0u8; ENTRY_COUNT * ENTRY_SIZE];
        for (i, desc) in self.entries.iter().enumerate() {
            buf[i * 4..i * 4 + 2].copy_from_slice(&desc.segment.to_le_bytes());
            buf[i * 4 + 2..i * 4 + 4].copy_from_slice(&desc.offset.to_le_bytes());
        }
        ram.write_slice(&buf, ram.flat(dest))
    }

    /// Install the default `iret`-only handler in every entry, override
    /// `0x10` with a second `iret` stub (standing in for BIOS video
    /// services, which this core does not emulate), and copy the finished
    /// table to guest flat address 0.
    pub fn install(&mut self, ram: &GuestRam) -> crate::memory::Result<()> {
        let default_addr = self.allocate(IRET_STUB.len());
        ram.write_slice(&IRET_STUB, ram.flat(default_addr))?;
        let default = InterruptDescriptor {
            segment: real_segment(default_addr),
            offset: 0,
        };
        self.setup(default);

        let int10_addr = self.allocate(IRET_STUB.len());
        ram.write_slice(&IRET_STUB, ram.flat(int10_addr))?;
        self.set(
            0x10,
            InterruptDescriptor {
                segment: real_segment(int10_addr),
                offset: 0,
            },
        );

        self.copy(ram, 0)
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{GuestRam, MIN_RAM_SIZE};

    #[test]
    fn setup_fills_all_entries() {
        let mut table = InterruptTable::new();
        let desc = InterruptDescriptor {
            segment: 0x1234,
            offset: 0x5678,
        };
        table.setup(desc);
        assert!(table.entries.iter().all(|&e| e == desc));
    }

    #[test]
    fn set_overrides_single_entry() {
        let mut table = InterruptTable::new();
        table.setup(InterruptDescriptor::default());
        let desc = InterruptDescriptor {
            segment: 0xf000,
            offset: 0,
        };
        table.set(0x10, desc);
        assert_eq!(table.entries[0x10], desc);
        assert_eq!(table.entries[0x0f], InterruptDescriptor::default());
    }

    #[test]
    fn byte_size_is_1024() {
        assert_eq!(InterruptTable::byte_size(), 1024);
    }

    #[test]
    fn install_writes_table_at_guest_zero_and_targets_iret() {
        let ram = GuestRam::new(MIN_RAM_SIZE).unwrap();
        let mut table = InterruptTable::new();
        table.install(&ram).unwrap();

        // Entry 0x10 points at a blob that is an `iret`.
        let desc = table.entries[0x10];
        let flat = crate::memory::real_to_flat(desc.segment, desc.offset);
        assert_eq!(ram.read_byte(ram.flat(flat)), Some(0xcf));

        // Default entry (e.g. 0x00) also resolves to an `iret` blob.
        let desc0 = table.entries[0];
        let flat0 = crate::memory::real_to_flat(desc0.segment, desc0.offset);
        assert_eq!(ram.read_byte(ram.flat(flat0)), Some(0xcf));
    }
}

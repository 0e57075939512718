// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Post-mortem diagnostics for a vCPU that exited in a way the run loop
//! cannot recover from: register/segment dump, a short disassembly-free
//! code window around `rip`, a page-table walk if the guest had already
//! entered protected mode, and a raw memory dump.

use kvm_ioctls::VcpuFd;

use crate::memory::GuestRam;

const CODE_WINDOW: u64 = 64;
const CODE_PROLOGUE: u64 = CODE_WINDOW * 43 / 64;
const CR0_PE: u64 = 0x1;
const PAGE_TABLE_ENTRY_MASK: u64 = !0xfff;
const HUGE_PAGE_BIT: u64 = 1 << 7;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("KVM ioctl failed: {0}")]
    KvmIoctl(#[from] kvm_ioctls::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn is_in_protected_mode(cr0: u64) -> bool {
    cr0 & CR0_PE != 0
}

/// `rip` is segment-relative in real mode, flat once the guest has set
/// `CR0.PE`.
fn ip_to_flat(cr0: u64, cs_selector: u16, rip: u64) -> u64 {
    if is_in_protected_mode(cr0) {
        rip
    } else {
        rip + ((cs_selector as u64) << 4)
    }
}

/// Dump general-purpose registers, segment registers, and the interrupt
/// bitmap to stdout. Mirrors the fixed layout of the original register
/// dump so the numbers are easy to diff against `/proc/<pid>/...` or a
/// debugger attached to the same guest state.
pub fn show_registers(vcpu: &VcpuFd, nmi_disabled: bool) -> Result<()> {
    let regs = vcpu.get_regs()?;
    let sregs = vcpu.get_sregs()?;

    println!("Registers:");
    println!(
        " rip: {:016x}   rsp: {:016x} flags: {:016x}",
        regs.rip, regs.rsp, regs.rflags
    );
    println!(
        " rax: {:016x}   rbx: {:016x}   rcx: {:016x}",
        regs.rax, regs.rbx, regs.rcx
    );
    println!(
        " rdx: {:016x}   rsi: {:016x}   rdi: {:016x}",
        regs.rdx, regs.rsi, regs.rdi
    );
    println!(
        " rbp: {:016x}   r8:  {:016x}   r9:  {:016x}",
        regs.rbp, regs.r8, regs.r9
    );
    println!(
        " r10: {:016x}   r11: {:016x}   r12: {:016x}",
        regs.r10, regs.r11, regs.r12
    );
    println!(
        " r13: {:016x}   r14: {:016x}   r15: {:016x}",
        regs.r13, regs.r14, regs.r15
    );

    println!(
        " cr0: {:016x}   cr2: {:016x}   cr3: {:016x}",
        sregs.cr0, sregs.cr2, sregs.cr3
    );
    println!(" cr4: {:016x}   cr8: {:016x}", sregs.cr4, sregs.cr8);

    println!("Segment registers:");
    println!(" register  selector  base              limit     type  p dpl db s l g avl");
    print_segment("cs ", &sregs.cs);
    print_segment("ss ", &sregs.ss);
    print_segment("ds ", &sregs.ds);
    print_segment("es ", &sregs.es);
    print_segment("fs ", &sregs.fs);
    print_segment("gs ", &sregs.gs);
    print_segment("tr ", &sregs.tr);
    print_segment("ldt", &sregs.ldt);
    print_dtable("gdt", sregs.gdt.base, sregs.gdt.limit);
    print_dtable("idt", sregs.idt.base, sregs.idt.limit);

    println!(
        " [ efer: {:016x}  apic base: {:016x}  nmi: {} ]",
        sregs.efer,
        sregs.apic_base,
        if nmi_disabled { "disabled" } else { "enabled" }
    );

    println!("Interrupt bitmap:");
    print!(" ");
    for word in sregs.interrupt_bitmap.iter() {
        print!("{:016x} ", word);
    }
    println!();

    Ok(())
}

fn print_segment(name: &str, seg: &kvm_bindings::kvm_segment) {
    println!(
        " {}       {:04x}      {:016x}  {:08x}  {:02x}    {} {}   {}  {} {} {} {}",
        name,
        seg.selector,
        seg.base,
        seg.limit,
        seg.type_,
        seg.present,
        seg.dpl,
        seg.db,
        seg.s,
        seg.l,
        seg.g,
        seg.avl
    );
}

fn print_dtable(name: &str, base: u64, limit: u16) {
    println!(" {}                 {:016x}  {:08x}", name, base, limit);
}

/// Dump a short window of guest code around `rip` (with the current
/// instruction byte bracketed) and the first 32 bytes below `rsp`.
pub fn show_code(vcpu: &VcpuFd, ram: &GuestRam) -> Result<()> {
    let regs = vcpu.get_regs()?;
    let sregs = vcpu.get_sregs()?;

    let flat_ip = ip_to_flat(sregs.cr0, sregs.cs.selector, regs.rip);
    let start = flat_ip.saturating_sub(CODE_PROLOGUE);

    print!("Code: ");
    for i in 0..CODE_WINDOW {
        let addr = start + i;
        let byte = match ram.read_byte(ram.flat(addr)) {
            Some(b) => b,
            None => break,
        };
        if addr == flat_ip {
            print!("<{:02x}> ", byte);
        } else {
            print!("{:02x} ", byte);
        }
    }
    println!();

    println!("Stack:");
    dump_mem(ram, regs.rsp, 32);

    Ok(())
}

/// Walk the 4-level page table rooted at `cr3`, if the guest has entered
/// protected mode. Stops silently the moment a table pointer steps outside
/// RAM, same as the register dump it supports.
pub fn show_page_tables(vcpu: &VcpuFd, ram: &GuestRam) -> Result<()> {
    let sregs = vcpu.get_sregs()?;
    if !is_in_protected_mode(sregs.cr0) {
        return Ok(());
    }

    let pte4_addr = sregs.cr3;
    let pte4: u64 = match ram.read_obj(ram.flat(pte4_addr)) {
        Ok(v) => v,
        Err(_) => return Ok(()),
    };

    let pte3_addr = pte4 & PAGE_TABLE_ENTRY_MASK;
    let pte3: u64 = match ram.read_obj(ram.flat(pte3_addr)) {
        Ok(v) => v,
        Err(_) => return Ok(()),
    };

    let pte2_addr = pte3 & PAGE_TABLE_ENTRY_MASK;
    let pte2: u64 = match ram.read_obj(ram.flat(pte2_addr)) {
        Ok(v) => v,
        Err(_) => return Ok(()),
    };

    println!("Page Tables:");
    if pte2 & HUGE_PAGE_BIT != 0 {
        println!(" pte4: {:016x}   pte3: {:016x}   pte2: {:016x}", pte4, pte3, pte2);
        return Ok(());
    }

    let pte1_addr = pte2 & PAGE_TABLE_ENTRY_MASK;
    let pte1: u64 = match ram.read_obj(ram.flat(pte1_addr)) {
        Ok(v) => v,
        Err(_) => return Ok(()),
    };
    println!(
        " pte4: {:016x}   pte3: {:016x}   pte2: {:016x}   pte1: {:016x}",
        pte4, pte3, pte2, pte1
    );
    Ok(())
}

/// Dump `size` bytes of guest memory starting at `addr`, 8 per line. `size`
/// is rounded down to a multiple of 8; the dump stops the moment it steps
/// outside RAM rather than padding with zeroes.
pub fn dump_mem(ram: &GuestRam, addr: u64, size: u64) {
    let size = size & !7;
    if size == 0 {
        return;
    }

    let mut n = 0u64;
    while n < size {
        let mut row = [0u8; 8];
        let mut complete = true;
        for (i, byte) in row.iter_mut().enumerate() {
            match ram.read_byte(ram.flat(addr + n + i as u64)) {
                Some(b) => *byte = b,
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if !complete {
            break;
        }
        println!(
            "  {:#010x}: {:02x} {:02x} {:02x} {:02x}  {:02x} {:02x} {:02x} {:02x}",
            addr + n,
            row[0],
            row[1],
            row[2],
            row[3],
            row[4],
            row[5],
            row[6],
            row[7]
        );
        n += 8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{GuestRam, MIN_RAM_SIZE};

    #[test]
    fn code_prologue_matches_original_ratio() {
        assert_eq!(CODE_PROLOGUE, 43);
    }

    #[test]
    fn ip_to_flat_uses_segment_base_in_real_mode() {
        assert_eq!(ip_to_flat(0, 0x1000, 0x0200), 0x0200 + (0x1000 << 4));
    }

    #[test]
    fn ip_to_flat_is_identity_in_protected_mode() {
        assert_eq!(ip_to_flat(CR0_PE, 0x08, 0x100000), 0x100000);
    }

    #[test]
    fn dump_mem_rounds_size_down_to_multiple_of_eight() {
        let ram = GuestRam::new(MIN_RAM_SIZE).unwrap();
        // 11 rounds down to 8; nothing panics, no assertion beyond that
        // since dump_mem only prints.
        dump_mem(&ram, 0, 11);
    }

    #[test]
    fn dump_mem_stops_at_ram_boundary() {
        let ram = GuestRam::new(MIN_RAM_SIZE).unwrap();
        dump_mem(&ram, MIN_RAM_SIZE - 4, 16);
    }
}

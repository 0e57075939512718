// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! VCPU initializer. The guest starts in 16-bit real mode, at the boot
//! selector/ip/sp the boot-image loader produced, so the register setup
//! here is deliberately the opposite of a modern long-mode boot: no GDT, no
//! paging, segment bases derived straight from the selector.

use kvm_bindings::{kvm_fpu, kvm_msr_entry, kvm_regs, Msrs};
use kvm_ioctls::VcpuFd;

use crate::memory::selector_to_base;

const FPU_FCW: u16 = 0x037f;
const FPU_MXCSR: u32 = 0x1f80;

/// `rflags` bit 1 is always set on real x86 hardware; everything else
/// starts clear.
const RFLAGS_RESERVED: u64 = 0x0000_0000_0000_0002;

mod msr {
    pub const IA32_SYSENTER_CS: u32 = 0x174;
    pub const IA32_SYSENTER_ESP: u32 = 0x175;
    pub const IA32_SYSENTER_EIP: u32 = 0x176;
    pub const STAR: u32 = 0xc000_0081;
    pub const CSTAR: u32 = 0xc000_0083;
    pub const KERNEL_GS_BASE: u32 = 0xc000_0102;
    pub const SYSCALL_MASK: u32 = 0xc000_0084;
    pub const LSTAR: u32 = 0xc000_0082;
    pub const IA32_TSC: u32 = 0x10;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("boot ip {0:#x} does not fit in a 16-bit real-mode offset")]
    IpTooHighForRealMode(u64),
    #[error("KVM_SET_MSRS wrote {written} of {requested} entries")]
    PartialMsrWrite { written: usize, requested: usize },
    #[error("KVM ioctl failed: {0}")]
    KvmIoctl(#[from] kvm_ioctls::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Real-mode register state derived from a loaded boot image.
pub struct BootRegs {
    pub boot_selector: u16,
    pub boot_ip: u32,
    pub boot_sp: u16,
}

/// Program every piece of vCPU state the spec's run loop depends on:
/// segment registers, general registers, FPU, and the fixed MSR list. Order
/// matches the original reset sequence: sregs, regs, fpu, msrs.
pub fn reset_vcpu(vcpu: &VcpuFd, boot: &BootRegs) -> Result<()> {
    configure_sregs(vcpu, boot)?;
    configure_regs(vcpu, boot)?;
    configure_fpu(vcpu)?;
    configure_msrs(vcpu)?;
    Ok(())
}

fn configure_sregs(vcpu: &VcpuFd, boot: &BootRegs) -> Result<()> {
    let mut sregs = vcpu.get_sregs()?;

    let base = selector_to_base(boot.boot_selector) as u64;
    for seg in [
        &mut sregs.cs,
        &mut sregs.ss,
        &mut sregs.ds,
        &mut sregs.es,
        &mut sregs.fs,
        &mut sregs.gs,
    ] {
        seg.selector = boot.boot_selector;
        seg.base = base;
    }

    vcpu.set_sregs(&sregs)?;
    Ok(())
}

/// `boot_ip` arrives as a `u32` (wider than real mode's 16-bit offset) so an
/// out-of-range value reaches this check instead of being truncated before
/// `configure_regs` ever sees it.
fn validate_boot_ip(boot_ip: u32) -> Result<()> {
    if boot_ip > u16::MAX as u32 {
        return Err(Error::IpTooHighForRealMode(boot_ip as u64));
    }
    Ok(())
}

fn configure_regs(vcpu: &VcpuFd, boot: &BootRegs) -> Result<()> {
    validate_boot_ip(boot.boot_ip)?;

    let regs = kvm_regs {
        rflags: RFLAGS_RESERVED,
        rip: boot.boot_ip as u64,
        rsp: boot.boot_sp as u64,
        rbp: boot.boot_sp as u64,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;
    Ok(())
}

fn configure_fpu(vcpu: &VcpuFd) -> Result<()> {
    let fpu = kvm_fpu {
        fcw: FPU_FCW,
        mxcsr: FPU_MXCSR,
        ..Default::default()
    };
    vcpu.set_fpu(&fpu)?;
    Ok(())
}

/// Fixed MSR list every boot needs zeroed (or, for the TSC, reset). Since
/// this core only targets x86_64 hosts, the 64-bit-only entries (`STAR`,
/// `CSTAR`, `KERNEL_GS_BASE`, `LSTAR`) are always included rather than
/// gated on a long-mode check.
fn configure_msrs(vcpu: &VcpuFd) -> Result<()> {
    let entry = |index: u32, data: u64| kvm_msr_entry {
        index,
        data,
        ..Default::default()
    };

    let entries = vec![
        entry(msr::IA32_SYSENTER_CS, 0),
        entry(msr::IA32_SYSENTER_ESP, 0),
        entry(msr::IA32_SYSENTER_EIP, 0),
        entry(msr::STAR, 0),
        entry(msr::CSTAR, 0),
        entry(msr::KERNEL_GS_BASE, 0),
        entry(msr::SYSCALL_MASK, 0),
        entry(msr::LSTAR, 0),
        entry(msr::IA32_TSC, 0),
    ];
    let requested = entries.len();

    let msrs = Msrs::from_entries(&entries).expect("fixed MSR entry list is always valid");
    let written = vcpu.set_msrs(&msrs)?;
    if written != requested {
        return Err(Error::PartialMsrWrite { written, requested });
    }
    Ok(())
}

/// Arm single-instruction tracing. Unlike every other setup step, a failure
/// here is a warning, not fatal (spec.md §6 `--single-step`): guests that
/// run without hardware debug-register support still boot, they simply
/// don't single-step.
pub fn enable_singlestep(vcpu: &VcpuFd) -> std::result::Result<(), kvm_ioctls::Error> {
    let debug = kvm_bindings::kvm_guest_debug {
        control: kvm_bindings::KVM_GUESTDBG_ENABLE | kvm_bindings::KVM_GUESTDBG_SINGLESTEP,
        ..Default::default()
    };
    vcpu.set_guest_debug(&debug)
}

#[cfg(test)]
mod tests {
    use super::*;

    // E5 — rip overflow. configure_regs itself needs a real VcpuFd, but the
    // fatal check it runs before touching one is this pure function.
    #[test]
    fn e5_rip_overflow_is_rejected() {
        let err = validate_boot_ip(0x10000).unwrap_err();
        assert!(matches!(err, Error::IpTooHighForRealMode(0x10000)));
    }

    #[test]
    fn boot_ip_at_the_real_mode_limit_is_accepted() {
        assert!(validate_boot_ip(0xffff).is_ok());
    }

    #[test]
    fn selector_to_base_is_used_for_every_data_segment() {
        assert_eq!(selector_to_base(0x1000), 0x1000 * 16);
        assert_eq!(selector_to_base(0), 0);
    }
}

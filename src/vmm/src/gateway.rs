// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Host-hypervisor gateway: the one module that actually talks to
//! `/dev/kvm`. Everything else in this core works against a `VmFd`/`VcpuFd`
//! that this module hands out already fully provisioned — TSS address set,
//! PIT and IRQ chip created, capabilities checked, guest RAM registered.

use std::os::unix::io::FromRawFd;
use std::os::unix::io::IntoRawFd;

use kvm_bindings::{kvm_pit_config, KVM_API_VERSION};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};
use vm_memory::{Address, GuestAddress, GuestMemory};

use crate::capability::{self, MissingCapability};
use crate::memory::GuestRam;

/// Address KVM expects for the task-state segment on x86_64. Lives in an
/// unused "hole" of physical address space below 4GiB; it does not need to
/// back real guest memory.
const TSS_ADDRESS: u64 = 0xfffb_d000;

const MEMORY_SLOT: u32 = 0;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("host CPU does not support hardware virtualization (VMX)")]
    NoHardwareVirtualization,
    #[error(transparent)]
    MissingCapability(#[from] MissingCapability),
    #[error("KVM ioctl failed: {0}")]
    KvmIoctl(#[from] kvm_ioctls::Error),
    #[error("unexpected KVM API version {actual} (expected {expected})")]
    UnexpectedApiVersion { actual: i32, expected: i32 },
    #[error("guest RAM is not backed by a mappable host address")]
    UnmappableGuestRam,
    #[error("'{0}' not found; make sure the kvm module is loaded")]
    DeviceNotFound(String),
    #[error("failed to open {0}: {1}")]
    OpenDevice(String, std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Owns the open `/dev/kvm` handle, the VM file descriptor, and the single
/// boot vCPU. Dropping this tears every ioctl-backed resource down in the
/// order the kernel expects (vCPU, then VM, then the device handle).
pub struct Gateway {
    kvm: Kvm,
    vm_fd: VmFd,
    vcpu_fd: VcpuFd,
}

impl Gateway {
    /// Run the boot sequence: confirm VMX, open `kvm_dev`, check the API
    /// version, create the VM, check every required extension, set the TSS
    /// address, create the in-kernel PIT, register `ram` at guest address
    /// 0, create the IRQ chip, and create vCPU 0. Any failure here is fatal
    /// and unwinds everything already created (spec.md §4.1, §7
    /// `HostUnsupported`).
    pub fn boot(kvm_dev: &str, ram: &GuestRam) -> Result<Self> {
        if !host_supports_vmx() {
            return Err(Error::NoHardwareVirtualization);
        }

        let kvm = open_kvm_device(kvm_dev)?;

        let api_version = kvm.get_api_version();
        if api_version != KVM_API_VERSION as i32 {
            return Err(Error::UnexpectedApiVersion {
                actual: api_version,
                expected: KVM_API_VERSION as i32,
            });
        }

        let vm_fd = kvm.create_vm()?;

        capability::gate(&kvm)?;

        vm_fd.set_tss_address(TSS_ADDRESS as usize)?;

        let pit_config = kvm_pit_config { flags: 0, ..Default::default() };
        vm_fd.create_pit2(pit_config)?;

        register_memory(&vm_fd, ram)?;

        vm_fd.create_irq_chip()?;

        let vcpu_fd = vm_fd.create_vcpu(0)?;

        Ok(Gateway { kvm, vm_fd, vcpu_fd })
    }

    pub fn vcpu(&self) -> &VcpuFd {
        &self.vcpu_fd
    }

    pub fn vm(&self) -> &VmFd {
        &self.vm_fd
    }

    pub fn kvm(&self) -> &Kvm {
        &self.kvm
    }

    pub fn enable_singlestep(&self) -> std::result::Result<(), kvm_ioctls::Error> {
        crate::cpu::enable_singlestep(&self.vcpu_fd)
    }
}

/// `Kvm::new()` always opens the hardcoded `/dev/kvm`; since `--kvm-dev`
/// lets the caller point at an alternate device node, the file is opened
/// by hand and `Kvm` is built from its raw fd instead.
fn open_kvm_device(path: &str) -> Result<Kvm> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::DeviceNotFound(path.to_string())
            } else {
                Error::OpenDevice(path.to_string(), e)
            }
        })?;
    Ok(unsafe { Kvm::from_raw_fd(file.into_raw_fd()) })
}

fn register_memory(vm_fd: &VmFd, ram: &GuestRam) -> Result<()> {
    let guest_addr = GuestAddress(0);
    let userspace_addr = ram
        .inner()
        .get_host_address(guest_addr)
        .map_err(|_| Error::UnmappableGuestRam)? as u64;

    let region = kvm_bindings::kvm_userspace_memory_region {
        slot: MEMORY_SLOT,
        guest_phys_addr: guest_addr.raw_value(),
        memory_size: ram.size(),
        userspace_addr,
        flags: 0,
    };

    // Safe because `ram` owns the backing mapping and outlives the `VmFd`
    // registration: `Gateway` holds both for its whole lifetime.
    unsafe { vm_fd.set_user_memory_region(region)? };
    Ok(())
}

/// `CPUID.1:ECX.VMX[bit 5]` — the one host feature check this core makes
/// without going through an ioctl.
fn host_supports_vmx() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        const VMX_BIT: u32 = 1 << 5;
        let regs = unsafe { core::arch::x86_64::__cpuid(1) };
        regs.ecx & VMX_BIT != 0
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmx_bit_mask_is_bit_five() {
        const VMX_BIT: u32 = 1 << 5;
        assert_eq!(VMX_BIT, 0x20);
    }
}

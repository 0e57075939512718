// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Required KVM extensions, checked once at startup before any VM state is
//! built. The list is data, not code, so the test suite can enumerate it
//! without parsing anything (spec.md §4.3/§9).

use kvm_ioctls::{Cap, Kvm};

/// One required extension: its `KVM_CAP_*` discriminant plus a human name
/// for the fatal error message.
pub struct RequiredCap {
    pub name: &'static str,
    pub cap: Cap,
}

/// Authoritative set of extensions this core depends on. Adding a new
/// dependency on a KVM capability means adding a row here, not an ad-hoc
/// check at the call site.
pub const REQUIRED: &[RequiredCap] = &[
    RequiredCap { name: "KVM_CAP_COALESCED_MMIO", cap: Cap::CoalescedMmio },
    RequiredCap { name: "KVM_CAP_USER_MEMORY", cap: Cap::UserMemory },
    RequiredCap { name: "KVM_CAP_SET_TSS_ADDR", cap: Cap::SetTssAddr },
    RequiredCap { name: "KVM_CAP_PIT2", cap: Cap::Pit2 },
    RequiredCap { name: "KVM_CAP_IRQ_ROUTING", cap: Cap::IrqRouting },
    RequiredCap { name: "KVM_CAP_IRQCHIP", cap: Cap::Irqchip },
    RequiredCap { name: "KVM_CAP_HLT", cap: Cap::Hlt },
    RequiredCap { name: "KVM_CAP_IRQ_INJECT_STATUS", cap: Cap::IrqInjectStatus },
    RequiredCap { name: "KVM_CAP_EXT_CPUID", cap: Cap::ExtCpuid },
];

#[derive(Debug, thiserror::Error)]
#[error("missing required KVM extension: {0}")]
pub struct MissingCapability(pub &'static str);

/// Verify every capability in [`REQUIRED`] is supported by `kvm`. The first
/// missing one is reported; callers treat this as fatal (spec.md §7,
/// `HostUnsupported`).
pub fn gate(kvm: &Kvm) -> Result<(), MissingCapability> {
    for req in REQUIRED {
        if !kvm.check_extension(req.cap) {
            return Err(MissingCapability(req.name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_list_has_no_duplicates() {
        let mut names: Vec<&str> = REQUIRED.iter().map(|r| r.name).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn required_list_is_nonempty() {
        assert!(!REQUIRED.is_empty());
    }
}

// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The `VmExit` taxonomy from the design's data model, and the translation
//! from `kvm-ioctls`' own `VcpuExit`/`Result` shape onto it. Keeping this
//! translation in one small, pure function is what makes testable property
//! 8 ("the dispatch table takes exactly one of continue/dispatch/terminate
//! for every exit reason") checkable without a real `/dev/kvm`.

use kvm_ioctls::{Error as KvmError, VcpuExit};

/// Direction of a port I/O exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    In,
    Out,
}

/// The `data` payload of an `Io` exit. A guest `OUT` has already filled
/// these bytes for the dispatcher to read; a guest `IN` expects the
/// dispatcher to fill them before the next `run()`.
pub enum IoData<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

impl<'a> IoData<'a> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            IoData::In(d) => d,
            IoData::Out(d) => d,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The `data` payload of an `Mmio` exit; same asymmetry as [`IoData`].
pub enum MmioData<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl<'a> MmioData<'a> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            MmioData::Read(d) => d,
            MmioData::Write(d) => d,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One VM-exit, classified. Lifetimes borrow directly out of the shared
/// VCPU run area for the duration of a single dispatch (spec.md §9); they
/// cannot outlive the `run()` call that produced them.
pub enum VmExit<'a> {
    Debug,
    Io {
        port: u16,
        direction: IoDirection,
        width: u8,
        count: u32,
        data: IoData<'a>,
    },
    Mmio {
        phys_addr: u64,
        is_write: bool,
        data: MmioData<'a>,
    },
    Interrupted,
    Halt,
    Shutdown,
    FailEntry,
    InternalError,
    Unknown(String),
}

impl<'a> VmExit<'a> {
    /// Name used by the run loop's terminate-with-diagnostics path
    /// (spec.md §4.7).
    pub fn reason_name(&self) -> &'static str {
        match self {
            VmExit::Debug => "Debug",
            VmExit::Io { .. } => "Io",
            VmExit::Mmio { .. } => "Mmio",
            VmExit::Interrupted => "Interrupted",
            VmExit::Halt => "Halt",
            VmExit::Shutdown => "Shutdown",
            VmExit::FailEntry => "FailEntry",
            VmExit::InternalError => "InternalError",
            VmExit::Unknown(_) => "Unknown",
        }
    }
}

/// Classify the result of a single `VcpuFd::run()` call. A signal that
/// interrupts the blocking ioctl surfaces here as `Err` with `errno() ==
/// EINTR`; that is the periodic-timer mechanism spec.md §5 describes, and
/// it is the only `Err` case that is not fatal.
pub fn classify(run_result: Result<VcpuExit<'_>, KvmError>) -> Result<VmExit<'_>, KvmError> {
    match run_result {
        Err(e) if e.errno() == libc::EINTR => Ok(VmExit::Interrupted),
        Err(e) => Err(e),
        Ok(VcpuExit::Debug(..)) => Ok(VmExit::Debug),
        Ok(VcpuExit::IoIn(port, data)) => {
            let width = data.len() as u8;
            Ok(VmExit::Io {
                port,
                direction: IoDirection::In,
                width,
                count: 1,
                data: IoData::In(data),
            })
        }
        Ok(VcpuExit::IoOut(port, data)) => {
            let width = data.len() as u8;
            Ok(VmExit::Io {
                port,
                direction: IoDirection::Out,
                width,
                count: 1,
                data: IoData::Out(data),
            })
        }
        Ok(VcpuExit::MmioRead(phys_addr, data)) => Ok(VmExit::Mmio {
            phys_addr,
            is_write: false,
            data: MmioData::Read(data),
        }),
        Ok(VcpuExit::MmioWrite(phys_addr, data)) => Ok(VmExit::Mmio {
            phys_addr,
            is_write: true,
            data: MmioData::Write(data),
        }),
        Ok(VcpuExit::Hlt) => Ok(VmExit::Halt),
        Ok(VcpuExit::Shutdown) => Ok(VmExit::Shutdown),
        Ok(VcpuExit::FailEntry(..)) => Ok(VmExit::FailEntry),
        Ok(VcpuExit::InternalError) => Ok(VmExit::InternalError),
        Ok(other) => {
            let tag = unknown_tag(&other);
            Ok(VmExit::Unknown(tag))
        }
    }
}

/// `kvm-ioctls` does not expose the raw hardware `exit_reason` for every
/// `VcpuExit` variant, so an exit this core has no dedicated handling for is
/// tagged with the variant's own name (taken off its `Debug` output) rather
/// than a fabricated numeric code standing in for one.
fn unknown_tag(exit: &VcpuExit<'_>) -> String {
    format!("{:?}", exit)
        .split(['(', ' '])
        .next()
        .unwrap_or("Unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Property 8: every reachable `VmExit` variant is handled by exactly
    // one of {continue, dispatch, terminate} in the run loop. We check the
    // weaker, directly-testable half here: classification never panics and
    // always yields a named reason.
    #[test]
    fn every_variant_has_a_reason_name() {
        let names = [
            VmExit::Debug.reason_name(),
            VmExit::Interrupted.reason_name(),
            VmExit::Halt.reason_name(),
            VmExit::Shutdown.reason_name(),
            VmExit::FailEntry.reason_name(),
            VmExit::InternalError.reason_name(),
            VmExit::Unknown("Other".to_string()).reason_name(),
        ];
        assert!(names.iter().all(|n| !n.is_empty()));
    }
}

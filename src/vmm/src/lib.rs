// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! A minimal userspace hypervisor core built directly on `/dev/kvm`. This
//! crate owns everything between "kernel image on disk" and "vCPU blocked in
//! `KVM_RUN`": the gateway to the kernel's KVM interface, guest RAM, the boot
//! image loader, vCPU reset, and the exit-dispatch run loop. It does not own
//! a CLI, a terminal, or any device model — those are collaborators reached
//! through [`runloop::IoDispatcher`]/[`runloop::MmioDispatcher`].

#![cfg(target_arch = "x86_64")]

pub mod capability;
pub mod config;
pub mod cpu;
pub mod exit;
pub mod gateway;
pub mod inspector;
pub mod ivt;
pub mod loader;
pub mod memory;
pub mod runloop;

use std::path::Path;

pub use config::VmmConfig;
pub use runloop::{HostSignal, InterruptHook, IoDispatcher, MmioDispatcher, RunOutcome, SignalSource};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Gateway(#[from] gateway::Error),
    #[error(transparent)]
    Memory(#[from] memory::Error),
    #[error(transparent)]
    Loader(#[from] loader::Error),
    #[error(transparent)]
    Cpu(#[from] cpu::Error),
    #[error(transparent)]
    Runloop(#[from] runloop::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single booted guest: the KVM handles, its RAM, and the interrupt table
/// that was written into that RAM. Built in one shot by [`Machine::new`];
/// driven to completion by [`Machine::run`].
pub struct Machine {
    gateway: gateway::Gateway,
    ram: memory::GuestRam,
    ivt: ivt::InterruptTable,
    nmi_disabled: bool,
}

impl Machine {
    /// Run the whole boot sequence described in spec.md §4.1: open the KVM
    /// gateway (which itself checks capabilities, sets up the TSS/PIT/IRQ
    /// chip, and registers RAM), load the kernel image, install the fake
    /// real-mode IVT, and reset vCPU 0 to the resulting boot state.
    ///
    /// `nmi_disabled` only affects the diagnostics dump on a fatal exit; it
    /// does not change KVM setup.
    pub fn new(config: &VmmConfig, nmi_disabled: bool) -> Result<Self> {
        let ram = memory::GuestRam::new(config.mem_bytes())?;
        let gateway = gateway::Gateway::boot(&config.kvm_dev.to_string_lossy(), &ram)?;

        let mut ivt = ivt::InterruptTable::new();
        let boot_info = loader::load_kernel(
            &ram,
            &mut ivt,
            Path::new(&config.kernel.kernel_path),
            &config.kernel.cmdline,
        )?;

        let boot_regs = cpu::BootRegs {
            boot_selector: boot_info.boot_selector,
            boot_ip: boot_info.boot_ip,
            boot_sp: boot_info.boot_sp,
        };
        cpu::reset_vcpu(gateway.vcpu(), &boot_regs)?;

        if config.single_step {
            // A warning, not fatal: spec.md §6 treats missing guest-debug
            // support as "boots without single-step", not a startup error.
            if let Err(e) = gateway.enable_singlestep() {
                eprintln!("warning: --single-step requested but unavailable: {}", e);
            }
        }

        Ok(Machine { gateway, ram, ivt, nmi_disabled })
    }

    /// Drive the guest until it halts, shuts down, hits an exit the run loop
    /// cannot continue from, or the host cancels it. `io`/`mmio`/
    /// `interrupt_hook` are the external collaborators this core dispatches
    /// every non-fatal exit to; `signal` is polled once per iteration for a
    /// pending `SIGINT`/`SIGQUIT` cancellation (spec.md §5).
    pub fn run<I, M, H, S>(
        &self,
        io: &mut I,
        mmio: &mut M,
        interrupt_hook: &mut H,
        signal: &S,
    ) -> Result<RunOutcome>
    where
        I: IoDispatcher,
        M: MmioDispatcher,
        H: InterruptHook,
        S: SignalSource,
    {
        let outcome = runloop::run(
            self.gateway.vcpu(),
            &self.ram,
            io,
            mmio,
            interrupt_hook,
            signal,
            self.nmi_disabled,
        )?;
        Ok(outcome)
    }

    pub fn ram(&self) -> &memory::GuestRam {
        &self.ram
    }

    pub fn ivt(&self) -> &ivt::InterruptTable {
        &self.ivt
    }
}

// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The run loop: issues the blocking `KVM_RUN` ioctl, classifies the exit
//! reason, and dispatches to whichever external collaborator owns that
//! class of exit. Everything outside this module — serial emulation,
//! virtio, a disk backend — is a collaborator reached only through the
//! [`IoDispatcher`]/[`MmioDispatcher`] seams below; this core implements
//! none of them.

use kvm_ioctls::VcpuFd;

use crate::exit::{classify, IoDirection, VmExit};
use crate::inspector;
use crate::memory::GuestRam;

/// Handles a port I/O exit. Returns `false` to request termination
/// (spec.md §7 `DispatchFailure`).
pub trait IoDispatcher {
    fn io_in(&mut self, port: u16, width: u8, data: &mut [u8]) -> bool;
    fn io_out(&mut self, port: u16, width: u8, data: &[u8]) -> bool;
}

/// Handles an MMIO exit. Returns `false` to request termination.
pub trait MmioDispatcher {
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]) -> bool;
    fn mmio_write(&mut self, addr: u64, data: &[u8]) -> bool;
}

/// Called once per `Interrupted` exit, i.e. once per periodic-timer tick
/// that lands while the guest is running. Takes no data and has no
/// meaningful failure mode — it is an opaque side effect (spec.md §4.7).
pub trait InterruptHook {
    fn on_interrupt(&mut self);
}

impl<F: FnMut()> InterruptHook for F {
    fn on_interrupt(&mut self) {
        self()
    }
}

/// What the host asked the run loop to do, polled once per iteration. Distinct
/// from a dispatcher failure or a guest-initiated exit: this is cancellation
/// requested from outside the guest entirely (spec.md §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// No cancellation pending; keep running.
    None,
    /// `SIGINT`: stop now, no diagnostics.
    Quit,
    /// `SIGQUIT`: dump registers/code/page tables, then stop.
    QuitWithDiagnostics,
}

/// Source of host-cancellation requests, polled once per `KVM_RUN` iteration.
/// `main.rs` implements this over the atomic flag its signal handlers write;
/// nothing in this module assumes `libc` signals specifically.
pub trait SignalSource {
    fn poll(&self) -> HostSignal;
}

impl<F: Fn() -> HostSignal> SignalSource for F {
    fn poll(&self) -> HostSignal {
        self()
    }
}

/// Why the run loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The guest shut itself down cleanly (`Shutdown` or `Hlt`).
    Shutdown,
    /// Every other exit this loop cannot continue from: `FailEntry`,
    /// `InternalError`, `Unknown`, or a dispatcher reporting failure.
    Terminated,
    /// The host asked for cancellation (`SIGINT`/`SIGQUIT`) before the guest
    /// reached a terminal exit on its own.
    HostCancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("KVM ioctl failed: {0}")]
    KvmIoctl(#[from] kvm_ioctls::Error),
    #[error(transparent)]
    Inspector(#[from] crate::inspector::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a single dispatched exit asks the run loop to do next. Split out of
/// `run` so the dispatch decision (property 8, scenario E6) is checkable
/// without a real vCPU: it only ever touches the three dispatcher seams.
enum Step {
    Continue,
    Shutdown,
    Terminate(String),
}

fn dispatch_one<I, M, H>(exit: VmExit, io: &mut I, mmio: &mut M, interrupt_hook: &mut H) -> Step
where
    I: IoDispatcher,
    M: MmioDispatcher,
    H: InterruptHook,
{
    match exit {
        VmExit::Debug => Step::Continue,
        VmExit::Io { port, direction, width, data, .. } => {
            let ok = match (direction, data) {
                (IoDirection::In, crate::exit::IoData::In(buf)) => io.io_in(port, width, buf),
                (IoDirection::Out, crate::exit::IoData::Out(buf)) => io.io_out(port, width, buf),
                _ => unreachable!("IoDirection always matches its IoData variant"),
            };
            if ok { Step::Continue } else { Step::Terminate("Io".to_string()) }
        }
        VmExit::Mmio { phys_addr, data, .. } => {
            let ok = match data {
                crate::exit::MmioData::Read(buf) => mmio.mmio_read(phys_addr, buf),
                crate::exit::MmioData::Write(buf) => mmio.mmio_write(phys_addr, buf),
            };
            if ok { Step::Continue } else { Step::Terminate("Mmio".to_string()) }
        }
        VmExit::Interrupted => {
            interrupt_hook.on_interrupt();
            Step::Continue
        }
        VmExit::Halt | VmExit::Shutdown => Step::Shutdown,
        VmExit::FailEntry => Step::Terminate("FailEntry".to_string()),
        VmExit::InternalError => Step::Terminate("InternalError".to_string()),
        VmExit::Unknown(tag) => Step::Terminate(format!("Unknown ({})", tag)),
    }
}

/// Drive the vCPU until it halts, shuts down, hits an exit this loop cannot
/// handle, or the host cancels it. `nmi_disabled` is only used for the
/// diagnostics dump. `signal` is polled at the top of every iteration, so a
/// cancellation request is observed between `KVM_RUN` calls rather than only
/// once before the loop starts.
pub fn run<I, M, H, S>(
    vcpu: &VcpuFd,
    ram: &GuestRam,
    io: &mut I,
    mmio: &mut M,
    interrupt_hook: &mut H,
    signal: &S,
    nmi_disabled: bool,
) -> Result<RunOutcome>
where
    I: IoDispatcher,
    M: MmioDispatcher,
    H: InterruptHook,
    S: SignalSource,
{
    loop {
        match signal.poll() {
            HostSignal::None => {}
            HostSignal::Quit => return Ok(RunOutcome::HostCancelled),
            HostSignal::QuitWithDiagnostics => {
                inspector::show_registers(vcpu, nmi_disabled)?;
                inspector::show_code(vcpu, ram)?;
                inspector::show_page_tables(vcpu, ram)?;
                return Ok(RunOutcome::HostCancelled);
            }
        }

        let run_result = vcpu.run();
        let exit = match classify(run_result) {
            Ok(exit) => exit,
            Err(e) => return Err(Error::KvmIoctl(e)),
        };

        if matches!(exit, VmExit::Debug) {
            inspector::show_registers(vcpu, nmi_disabled)?;
            inspector::show_code(vcpu, ram)?;
            continue;
        }

        match dispatch_one(exit, io, mmio, interrupt_hook) {
            Step::Continue => {}
            Step::Shutdown => return Ok(RunOutcome::Shutdown),
            Step::Terminate(reason) => {
                terminate(vcpu, ram, nmi_disabled, &reason)?;
                return Ok(RunOutcome::Terminated);
            }
        }
    }
}

fn terminate(vcpu: &VcpuFd, ram: &GuestRam, nmi_disabled: bool, reason: &str) -> Result<()> {
    println!("Guest terminated: {}", reason);
    inspector::show_registers(vcpu, nmi_disabled)?;
    inspector::show_code(vcpu, ram)?;
    inspector::show_page_tables(vcpu, ram)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // A bare fn item implements `Fn() -> HostSignal`, so `main.rs` can pass
    // `&host_signal` without wrapping it in a one-off struct.
    #[test]
    fn closure_signal_source_dispatches_through_poll() {
        fn always_quit() -> HostSignal {
            HostSignal::Quit
        }
        let source: &dyn SignalSource = &always_quit;
        assert_eq!(source.poll(), HostSignal::Quit);

        let none = || HostSignal::None;
        assert_eq!(SignalSource::poll(&none), HostSignal::None);
    }

    struct RecordingIo {
        calls: Vec<(u16, bool)>,
    }
    impl IoDispatcher for RecordingIo {
        fn io_in(&mut self, port: u16, _width: u8, _data: &mut [u8]) -> bool {
            self.calls.push((port, true));
            true
        }
        fn io_out(&mut self, port: u16, _width: u8, _data: &[u8]) -> bool {
            self.calls.push((port, false));
            true
        }
    }

    #[test]
    fn io_dispatch_trait_is_object_safe_enough_to_store() {
        let mut rec = RecordingIo { calls: vec![] };
        let mut buf = [0u8; 1];
        assert!(rec.io_in(0x3f8, 1, &mut buf));
        assert!(rec.io_out(0x3f8, 1, &buf));
        assert_eq!(rec.calls, vec![(0x3f8, true), (0x3f8, false)]);
    }

    #[test]
    fn interrupt_hook_closure_runs() {
        let mut count = 0;
        let mut hook = || count += 1;
        hook.on_interrupt();
        hook.on_interrupt();
        assert_eq!(count, 2);
    }

    struct Recorder {
        log: std::rc::Rc<std::cell::RefCell<Vec<&'static str>>>,
    }
    impl IoDispatcher for Recorder {
        fn io_in(&mut self, _port: u16, _width: u8, _data: &mut [u8]) -> bool {
            self.log.borrow_mut().push("io_in");
            true
        }
        fn io_out(&mut self, _port: u16, _width: u8, _data: &[u8]) -> bool {
            self.log.borrow_mut().push("io_out");
            true
        }
    }
    impl MmioDispatcher for Recorder {
        fn mmio_read(&mut self, _addr: u64, _data: &mut [u8]) -> bool {
            self.log.borrow_mut().push("mmio_read");
            true
        }
        fn mmio_write(&mut self, _addr: u64, _data: &[u8]) -> bool {
            self.log.borrow_mut().push("mmio_write");
            true
        }
    }

    // E6 — run loop dispatch order, driven through `dispatch_one` directly
    // since exercising `run` needs a real vCPU. `classify` is exercised
    // separately in exit.rs; here the scripted `VmExit` values stand in for
    // its output.
    #[test]
    fn e6_dispatch_order_matches_script() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut io = Recorder { log: log.clone() };
        let mut mmio = Recorder { log: log.clone() };
        let out_buf = [0u8; 1];
        let mut interrupt_count = 0;
        let mut interrupt_hook = || {
            log.borrow_mut().push("interrupt");
            interrupt_count += 1;
        };

        let script = vec![
            VmExit::Io {
                port: 0x3f8,
                direction: IoDirection::Out,
                width: 1,
                count: 1,
                data: crate::exit::IoData::Out(&out_buf[..]),
            },
            VmExit::Mmio {
                phys_addr: 0xfee0_0000,
                is_write: true,
                data: crate::exit::MmioData::Write(&out_buf[..]),
            },
            VmExit::Interrupted,
            VmExit::Halt,
        ];

        let mut outcome = None;
        for exit in script {
            match dispatch_one(exit, &mut io, &mut mmio, &mut interrupt_hook) {
                Step::Continue => {}
                Step::Shutdown => {
                    outcome = Some(RunOutcome::Shutdown);
                    break;
                }
                Step::Terminate(_) => {
                    outcome = Some(RunOutcome::Terminated);
                    break;
                }
            }
        }

        assert_eq!(outcome, Some(RunOutcome::Shutdown));
        assert_eq!(*log.borrow(), vec!["io_out", "mmio_write", "interrupt"]);
        assert_eq!(interrupt_count, 1);
    }
}

// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use clap::Parser;
use vmm::{HostSignal, InterruptHook, IoDispatcher, Machine, MmioDispatcher, RunOutcome, VmmConfig};

#[derive(Parser)]
#[clap(version = "0.1", author = "Polytech Montpellier - DevOps")]
struct Opts {
    /// Linux kernel path. Also accepted positionally if no flag is given.
    #[clap(short, long)]
    kernel: Option<String>,

    /// Kernel path given without a leading dash.
    kernel_positional: Option<String>,

    /// Disk image for the virtio-blk collaborator (accepted, not wired to a
    /// working device — see Non-goals).
    #[clap(long)]
    image: Option<String>,

    /// Initrd file (accepted, not wired to a working device — see Non-goals).
    #[clap(long)]
    initrd: Option<String>,

    /// Appended to the built-in kernel command line.
    #[clap(long)]
    params: Option<String>,

    /// KVM device node.
    #[clap(long, default_value = "/dev/kvm")]
    kvm_dev: String,

    /// Guest memory size in MiB (must be at least 64).
    #[clap(long, default_value = "256")]
    mem: u32,

    /// Arm single-instruction tracing via the guest-debug ioctl.
    #[clap(long)]
    single_step: bool,

    /// Log every I/O port dispatch to stderr.
    #[clap(long)]
    ioport_debug: bool,
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("--kernel is required")]
    MissingKernel,
    #[error(transparent)]
    Config(#[from] vmm::config::Error),
    #[error(transparent)]
    Machine(#[from] vmm::Error),
}

/// A no-op stand-in for the serial/virtio/PCI collaborators this core does
/// not implement (spec.md Non-goals): every access fails cleanly instead of
/// panicking, which the run loop treats as `DispatchFailure`.
struct StubDispatcher {
    ioport_debug: bool,
}

impl IoDispatcher for StubDispatcher {
    fn io_in(&mut self, port: u16, _width: u8, _data: &mut [u8]) -> bool {
        if self.ioport_debug {
            eprintln!("ioport debug: IN  port={:#06x}", port);
        }
        false
    }

    fn io_out(&mut self, port: u16, _width: u8, _data: &[u8]) -> bool {
        if self.ioport_debug {
            eprintln!("ioport debug: OUT port={:#06x}", port);
        }
        false
    }
}

impl MmioDispatcher for StubDispatcher {
    fn mmio_read(&mut self, _addr: u64, _data: &mut [u8]) -> bool {
        false
    }

    fn mmio_write(&mut self, _addr: u64, _data: &[u8]) -> bool {
        false
    }
}

/// Set only by a signal handler, polled once per run-loop iteration (spec.md
/// §5, §9). `SIGINT` and `SIGQUIT` write distinct values so the run loop can
/// tell "just stop" from "dump diagnostics first" apart.
static INTERRUPT: AtomicU8 = AtomicU8::new(INTERRUPT_NONE);
const INTERRUPT_NONE: u8 = 0;
const INTERRUPT_QUIT: u8 = 1;
const INTERRUPT_QUIT_WITH_DIAGNOSTICS: u8 = 2;

static TIMER_TICK: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    INTERRUPT.store(INTERRUPT_QUIT, Ordering::SeqCst);
}

extern "C" fn on_sigquit(_sig: libc::c_int) {
    INTERRUPT.store(INTERRUPT_QUIT_WITH_DIAGNOSTICS, Ordering::SeqCst);
}

extern "C" fn on_alarm(_sig: libc::c_int) {
    TIMER_TICK.store(true, Ordering::SeqCst);
}

/// Install `SIGINT`/`SIGQUIT` handlers that only ever write a flag.
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
        libc::signal(libc::SIGQUIT, on_sigquit as libc::sighandler_t);
        libc::signal(libc::SIGALRM, on_alarm as libc::sighandler_t);
    }
}

/// Translate the shared flag into the run loop's [`HostSignal`]. Lives
/// outside any closure so `&host_signal` can be passed to `Machine::run`
/// without capturing anything by value.
fn host_signal() -> HostSignal {
    match INTERRUPT.load(Ordering::SeqCst) {
        INTERRUPT_QUIT => HostSignal::Quit,
        INTERRUPT_QUIT_WITH_DIAGNOSTICS => HostSignal::QuitWithDiagnostics,
        _ => HostSignal::None,
    }
}

/// Arm a 1ms-period `CLOCK_MONOTONIC` timer delivering `SIGALRM`, the
/// collaborator spec.md §5 describes as unblocking `KVM_RUN` via `EINTR`.
fn install_periodic_timer() {
    unsafe {
        let mut sev: libc::sigevent = std::mem::zeroed();
        sev.sigev_notify = libc::SIGEV_SIGNAL;
        sev.sigev_signo = libc::SIGALRM;

        let mut timer_id: libc::timer_t = std::ptr::null_mut();
        if libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timer_id) != 0 {
            eprintln!("warning: periodic timer unavailable, guest will not receive ticks");
            return;
        }

        let interval = libc::timespec { tv_sec: 0, tv_nsec: 1_000_000 };
        let spec = libc::itimerspec { it_interval: interval, it_value: interval };
        if libc::timer_settime(timer_id, 0, &spec, std::ptr::null_mut()) != 0 {
            eprintln!("warning: could not arm periodic timer");
        }
    }
}

/// Save the current terminal mode so it can be restored on exit, matching
/// the teacher's raw-mode-then-restore shape without changing any terminal
/// attributes this core does not itself need.
struct TerminalGuard {
    original: libc::termios,
}

impl TerminalGuard {
    fn new() -> Option<Self> {
        let mut original: libc::termios = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::tcgetattr(libc::STDIN_FILENO, &mut original) };
        if rc != 0 {
            return None;
        }
        Some(TerminalGuard { original })
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
        }
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            1
        }
    };
    // `run()` has returned, so every local it owned — in particular
    // `TerminalGuard` — has already dropped and restored the terminal.
    // `SIGINT` handling relies on that: it does nothing beyond requesting
    // this return, then lets the normal unwind of `run()`'s scope do the
    // restoring (spec.md §5).
    std::process::exit(code);
}

fn run() -> Result<i32, Error> {
    let opts = Opts::parse();

    if opts.image.is_some() {
        eprintln!("warning: --image accepted but no disk backend is implemented");
    }
    if opts.initrd.is_some() {
        eprintln!("warning: --initrd accepted but no initrd loader is implemented");
    }

    let kernel_path = opts
        .kernel
        .or(opts.kernel_positional)
        .ok_or(Error::MissingKernel)?;

    let config = VmmConfig::builder(PathBuf::from(kernel_path), opts.mem)
        .kvm_dev(PathBuf::from(opts.kvm_dev))
        .params(opts.params)
        .single_step(opts.single_step)
        .ioport_debug(opts.ioport_debug)
        .build()?;

    let _terminal_guard = TerminalGuard::new();
    install_signal_handlers();
    install_periodic_timer();

    let machine = Machine::new(&config, false)?;

    if host_signal() != HostSignal::None {
        eprintln!("interrupted before guest start, shutting down");
        return Ok(1);
    }

    let mut io_dispatcher = StubDispatcher { ioport_debug: config.ioport_debug };
    let mut mmio_dispatcher = StubDispatcher { ioport_debug: config.ioport_debug };
    let mut interrupt_hook = || {
        TIMER_TICK.store(false, Ordering::SeqCst);
    };

    let outcome = machine.run(
        &mut io_dispatcher,
        &mut mmio_dispatcher,
        &mut interrupt_hook,
        &host_signal,
    )?;

    match outcome {
        RunOutcome::Shutdown => Ok(0),
        RunOutcome::Terminated => Ok(1),
        RunOutcome::HostCancelled => Ok(0),
    }
}

//! Seams to the external collaborators: the per-syscall decoder family and
//! the seccomp advisor.
//!
//! The tracer core drives the two-phase syscall protocol; what each syscall
//! *means* (names, argument rendering, tampering policy) is delegated
//! through these traits.

use std::any::Any;
use std::io::{self, Write};
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::arch::{self, Personality, Registers};
use crate::error::Result;
use crate::session::Resume;

/// View of a tracee at a syscall-entry-stop.
pub struct SyscallEnter<'a> {
    pub pid: Pid,
    pub personality: Personality,
    pub scno: u64,
    pub regs: &'a Registers,
    /// Decoder-owned scratch, kept on the tcb across phases and dropped with
    /// it.
    pub scratch: &'a mut Option<Box<dyn Any>>,
}

/// View of a tracee at a syscall-exit-stop.
pub struct SyscallExit<'a> {
    pub pid: Pid,
    pub personality: Personality,
    /// Syscall number resolved at the matching entry.
    pub scno: u64,
    pub regs: &'a Registers,
    /// Raw return value; `-4095..0` are negated errnos.
    pub retval: i64,
    pub scratch: &'a mut Option<Box<dyn Any>>,
}

/// Whether an entry decode already produced a complete trace line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnterDisposition {
    /// The line is complete; no exit-phase formatting is required.
    Done,
    /// The exit phase must finish the line with the result.
    NeedsExit,
}

/// Fault-injection directive attached to a syscall occurrence.
#[derive(Clone, Copy, Debug, Default)]
pub struct Tamper {
    /// Substitute this return value at syscall exit.
    pub retval: Option<i64>,
    /// Deliver this signal when the tracee is next resumed.
    pub signal: Option<Signal>,
    /// Hold the tracee at the entry stop for this long before resuming.
    pub delay_enter: Option<Duration>,
    /// Hold the tracee at the exit stop for this long before resuming.
    pub delay_exit: Option<Duration>,
}

/// Result of decoding a syscall entry.
#[derive(Debug)]
pub struct EnterDecode {
    /// Formatted entry text, e.g. `openat(AT_FDCWD, "x", O_RDONLY`.
    pub text: String,
    pub disposition: EnterDisposition,
    pub tamper: Option<Tamper>,
}

/// The per-syscall argument decoder family, resolved per personality.
pub trait SyscallDecoder {
    /// Decode a syscall entry for the tracee's current personality.
    fn on_enter(&mut self, call: &mut SyscallEnter<'_>) -> Result<EnterDecode>;

    /// Format the result half of the line, e.g. `) = 3`.
    fn on_exit(&mut self, call: &mut SyscallExit<'_>) -> Result<String>;
}

/// Decides the resume primitive for a tracee carrying a kernel filter.
pub trait SeccompAdvisor {
    /// `data` is the `SECCOMP_RET_DATA` of the stop, when one applies.
    fn advise(&mut self, pid: Pid, data: Option<u16>) -> Resume;
}

/// Fallback decoder: numeric syscall rendering, no tampering.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawDecoder;

impl SyscallDecoder for RawDecoder {
    fn on_enter(&mut self, call: &mut SyscallEnter<'_>) -> Result<EnterDecode> {
        let args = arch::syscall_args(call.regs);

        let rendered: Vec<_> = args.iter().map(|arg| format!("{:#x}", arg)).collect();
        let text = format!("syscall_{}({}", call.scno, rendered.join(", "));

        Ok(EnterDecode {
            text,
            disposition: EnterDisposition::NeedsExit,
            tamper: None,
        })
    }

    fn on_exit(&mut self, call: &mut SyscallExit<'_>) -> Result<String> {
        let text = if (-4095..0).contains(&call.retval) {
            format!(") = -1 (errno {})", -call.retval)
        } else {
            format!(") = {:#x}", call.retval)
        };

        Ok(text)
    }
}

/// Supplies the per-tracee output stream when a tcb is allocated.
pub type OutputFactory = Box<dyn FnMut(Pid) -> io::Result<Box<dyn Write>>>;

pub(crate) fn stderr_factory() -> OutputFactory {
    Box::new(|_pid| Ok(Box::new(io::stderr()) as Box<dyn Write>))
}

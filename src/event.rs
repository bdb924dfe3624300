//! Trace Events: the tracer's classification of raw wait statuses.

use std::convert::TryFrom;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::error::Result;
use crate::tcb::TcbFlags;

/// How a new tracee task came into existence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloneKind {
    Fork,
    Vfork,
    Clone,
}

/// How a tracee left (or is leaving) the system.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitKind {
    Exit(i32),
    Signaled { signal: Signal, core_dumped: bool },
}

impl ExitKind {
    /// Parse the pending wait status reported by a ptrace exit-event.
    ///
    /// The bit layout of the word `status` is:
    ///
    ///   15                         8   7                     0
    ///    +-------------------------+---+---------------------+
    ///    |        exit_code        | c |       sig_no        |
    ///    +-------------------------+---+---------------------+
    ///
    /// If `status[6:0]` is nonzero, the tracee is being killed by `sig_no`,
    /// and a set `status[7]` bit flags a core dump. Otherwise, it is a normal
    /// exit with exit code `status[15:8]`.
    pub(crate) fn parse(status: u16) -> Result<Self> {
        let sig_no = status & 0x7f;

        let kind = if sig_no == 0 {
            // Extract, zero-extend, cast.
            let exit_code = (status >> 8) as u8 as u32 as i32;

            ExitKind::Exit(exit_code)
        } else {
            let signal = Signal::try_from(sig_no as i32).map_err(crate::error::Error::Os)?;
            let core_dumped = status & (1 << 7) != 0;

            ExitKind::Signaled { signal, core_dumped }
        };

        Ok(kind)
    }
}

/// The tracer's classification of one raw OS process-state notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TraceEvent {
    /// Nothing new arrived, but queued work remains. Administrative only.
    Again,

    /// The tracee exited normally and was reaped.
    Exited { exit_code: i32 },

    /// The tracee was killed by a signal and was reaped.
    Killed { signal: Signal, core_dumped: bool },

    /// The pending `SIGSTOP` induced by a classic attach.
    Attach,

    /// Syscall-entry or syscall-exit stop; the phase is tracked per-TCB.
    SyscallStop,

    /// Signal-delivery-stop.
    SignalDelivery { signal: Signal },

    /// Group-stop: job-control suspension of the tracee.
    Group { signal: Signal },

    /// `PTRACE_EVENT_STOP` for a seize-style interrupt request.
    Interrupt,

    /// Seccomp-stop carrying `SECCOMP_RET_DATA`.
    Seccomp { data: u16 },

    /// The tracee created a new task that will be auto-attached.
    NewChild { kind: CloneKind, new: Pid },

    /// Exec auxiliary-event; `old` is the pre-exec tid of the exec'ing thread.
    Exec { old: Pid },

    /// Exit auxiliary-event: the tracee is mid-exit but not yet reaped.
    Exiting { kind: ExitKind },

    /// The parent of a vfork child resumed.
    VforkDone,
}

/// One raw notification from the wait primitive, with auxiliary data
/// prefetched so that classification itself is pure.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RawNotice {
    pub pid: Pid,
    pub raw_status: i32,
    /// `PTRACE_GETEVENTMSG` payload, prefetched for ptrace-event-stops.
    pub aux: Option<u64>,
    /// Whether a `PTRACE_GETSIGINFO` probe failed with `EINVAL`, which marks
    /// a definite group-stop for one of the four stopping signals.
    pub siginfo_einval: bool,
}

// Stopping signals, the only candidates for a group-stop.
fn is_stopping(signal: Signal) -> bool {
    use Signal::*;

    matches!(signal, SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU)
}

/// Classify a raw notification into a [`TraceEvent`].
///
/// This is a pure function of the notification (status bits plus prefetched
/// auxiliary data) and the TCB flag bits; identical inputs classify
/// identically regardless of call order.
pub(crate) fn classify(notice: &RawNotice, flags: TcbFlags) -> Result<TraceEvent> {
    use Signal::*;

    let status = WaitStatus::from_raw(notice.pid, notice.raw_status).map_err(crate::Error::Os)?;

    let event = match status {
        WaitStatus::Exited(_pid, exit_code) => TraceEvent::Exited { exit_code },
        WaitStatus::Signaled(_pid, signal, core_dumped) => {
            TraceEvent::Killed { signal, core_dumped }
        },
        WaitStatus::PtraceSyscall(_pid) => {
            // Disambiguated from a plain `SIGTRAP` stop by the reserved
            // `SIGTRAP | 0x80` value set under `PTRACE_O_TRACESYSGOOD`.
            TraceEvent::SyscallStop
        },
        WaitStatus::PtraceEvent(_pid, _signal, code) => classify_ptrace_event(notice, code)?,
        WaitStatus::Stopped(_pid, signal) => {
            if signal == SIGSTOP && flags.contains(TcbFlags::IGNORE_ONE_SIGSTOP) {
                // The stop a classic attach induces: consumed, never traced.
                TraceEvent::Attach
            } else if is_stopping(signal) && notice.siginfo_einval {
                TraceEvent::Group { signal }
            } else {
                TraceEvent::SignalDelivery { signal }
            }
        },
        WaitStatus::Continued(_) | WaitStatus::StillAlive => {
            internal_error!("classifying a non-notification wait status")
        },
    };

    Ok(event)
}

fn classify_ptrace_event(notice: &RawNotice, code: i32) -> Result<TraceEvent> {
    let aux = || match notice.aux {
        Some(aux) => Ok(aux),
        None => Err(crate::Error::Internal(
            "ptrace-event-stop without prefetched event message".into(),
        )),
    };

    let event = match code {
        libc::PTRACE_EVENT_FORK => TraceEvent::NewChild {
            kind: CloneKind::Fork,
            new: Pid::from_raw(aux()? as u32 as i32),
        },
        libc::PTRACE_EVENT_VFORK => TraceEvent::NewChild {
            kind: CloneKind::Vfork,
            new: Pid::from_raw(aux()? as u32 as i32),
        },
        libc::PTRACE_EVENT_CLONE => TraceEvent::NewChild {
            kind: CloneKind::Clone,
            new: Pid::from_raw(aux()? as u32 as i32),
        },
        libc::PTRACE_EVENT_EXEC => TraceEvent::Exec {
            old: Pid::from_raw(aux()? as u32 as i32),
        },
        // The event message names the child, but the parent needs no more
        // than the release itself.
        libc::PTRACE_EVENT_VFORK_DONE => TraceEvent::VforkDone,
        libc::PTRACE_EVENT_EXIT => {
            // The event message is the pending wait status as an `unsigned
            // long`; only the low 16-bit word is meaningful.
            let kind = ExitKind::parse(aux()? as u16)?;

            TraceEvent::Exiting { kind }
        },
        libc::PTRACE_EVENT_SECCOMP => TraceEvent::Seccomp {
            data: aux()? as u16,
        },
        libc::PTRACE_EVENT_STOP => {
            // Only reachable under seize-style attach: either our own
            // interrupt request, or a group-stop reported event-style.
            let signal = stop_signal(notice.raw_status)?;

            if is_stopping(signal) {
                TraceEvent::Group { signal }
            } else {
                TraceEvent::Interrupt
            }
        },
        _ => {
            internal_error!("unexpected ptrace-event-stop code")
        },
    };

    Ok(event)
}

// `WSTOPSIG` of a raw status known to satisfy `WIFSTOPPED`.
fn stop_signal(raw_status: i32) -> Result<Signal> {
    let sig_no = (raw_status >> 8) & 0x7f;
    Signal::try_from(sig_no).map_err(crate::Error::Os)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    const PID: i32 = 1000;

    fn notice(raw_status: i32) -> RawNotice {
        RawNotice {
            pid: Pid::from_raw(PID),
            raw_status,
            aux: None,
            siginfo_einval: false,
        }
    }

    fn stopped(signal: libc::c_int) -> i32 {
        0x7f | (signal << 8)
    }

    fn ptrace_event(event: i32) -> i32 {
        stopped(libc::SIGTRAP) | (event << 16)
    }

    #[test]
    fn classifies_exits() {
        let event = classify(&notice(7 << 8), TcbFlags::empty()).unwrap();
        assert_eq!(event, TraceEvent::Exited { exit_code: 7 });

        let event = classify(&notice(libc::SIGKILL), TcbFlags::empty()).unwrap();
        assert_eq!(
            event,
            TraceEvent::Killed { signal: Signal::SIGKILL, core_dumped: false }
        );
    }

    #[test]
    fn classifies_syscall_stop() {
        let raw = stopped(libc::SIGTRAP | 0x80);
        let event = classify(&notice(raw), TcbFlags::empty()).unwrap();
        assert_eq!(event, TraceEvent::SyscallStop);
    }

    #[test]
    fn classifies_attach_stop_by_flag() {
        let raw = stopped(libc::SIGSTOP);

        let event = classify(&notice(raw), TcbFlags::IGNORE_ONE_SIGSTOP).unwrap();
        assert_eq!(event, TraceEvent::Attach);

        // Without the flag, the same status is an ordinary signal stop.
        let event = classify(&notice(raw), TcbFlags::empty()).unwrap();
        assert_eq!(event, TraceEvent::SignalDelivery { signal: Signal::SIGSTOP });
    }

    #[test]
    fn classifies_group_stop_by_siginfo_probe() {
        let mut n = notice(stopped(libc::SIGTSTP));
        n.siginfo_einval = true;

        let event = classify(&n, TcbFlags::empty()).unwrap();
        assert_eq!(event, TraceEvent::Group { signal: Signal::SIGTSTP });
    }

    #[test]
    fn classifies_aux_events() {
        let mut n = notice(ptrace_event(libc::PTRACE_EVENT_FORK));
        n.aux = Some(1234);

        let event = classify(&n, TcbFlags::empty()).unwrap();
        assert_eq!(
            event,
            TraceEvent::NewChild { kind: CloneKind::Fork, new: Pid::from_raw(1234) }
        );

        let mut n = notice(ptrace_event(libc::PTRACE_EVENT_EXEC));
        n.aux = Some(PID as u64);

        let event = classify(&n, TcbFlags::empty()).unwrap();
        assert_eq!(event, TraceEvent::Exec { old: Pid::from_raw(PID) });

        let mut n = notice(ptrace_event(libc::PTRACE_EVENT_EXIT));
        n.aux = Some(u64::from(2u16 << 8));

        let event = classify(&n, TcbFlags::empty()).unwrap();
        assert_eq!(event, TraceEvent::Exiting { kind: ExitKind::Exit(2) });

        let mut n = notice(ptrace_event(libc::PTRACE_EVENT_SECCOMP));
        n.aux = Some(0xbeef);

        let event = classify(&n, TcbFlags::empty()).unwrap();
        assert_eq!(event, TraceEvent::Seccomp { data: 0xbeef });
    }

    #[test]
    fn classifies_vfork_done() {
        let mut n = notice(ptrace_event(libc::PTRACE_EVENT_VFORK_DONE));
        n.aux = Some(4321);

        let event = classify(&n, TcbFlags::empty()).unwrap();
        assert_eq!(event, TraceEvent::VforkDone);
    }

    #[test]
    fn classification_is_pure() {
        // Identical inputs classify identically, regardless of call order.
        let mut exit_notice = notice(ptrace_event(libc::PTRACE_EVENT_EXIT));
        exit_notice.aux = Some(0);

        let notices = vec![
            notice(stopped(libc::SIGTRAP | 0x80)),
            notice(stopped(libc::SIGSTOP)),
            notice(9 << 8),
            exit_notice,
        ];

        let flags = [TcbFlags::empty(), TcbFlags::IGNORE_ONE_SIGSTOP];

        let mut forward = vec![];
        for n in &notices {
            for &f in &flags {
                forward.push(classify(n, f).unwrap());
            }
        }

        let mut backward = vec![];
        for n in notices.iter().rev() {
            for f in flags.iter().rev().copied() {
                backward.push(classify(n, f).unwrap());
            }
        }
        backward.reverse();

        assert_eq!(forward, backward);
    }

    #[test]
    fn exit_kind_parses_signaled_status() {
        let kind = ExitKind::parse((libc::SIGSEGV as u16) | (1 << 7)).unwrap();
        assert_eq!(
            kind,
            ExitKind::Signaled { signal: Signal::SIGSEGV, core_dumped: true }
        );
    }
}

//! The event dispatcher: a state machine keyed by Trace Event kind, driving
//! the two-phase syscall protocol and selecting each tracee's next resume.

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::arch;
use crate::attach::AttachMode;
use crate::decoder::{EnterDisposition, SyscallEnter, SyscallExit};
use crate::error::{Error, Result};
use crate::event::{CloneKind, ExitKind, TraceEvent};
use crate::session::{Resume, Session};
use crate::tcb::{Siginfo, TcbFlags, TcbId, WaitData};

/// Whether the dispatch loop should keep going.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    Continue,
    /// The session is finished: the last tracee is gone.
    Stop,
}

fn listen(pid: Pid) -> nix::Result<()> {
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_LISTEN,
            pid.as_raw(),
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_void>(),
        )
    };

    Errno::result(res).map(drop)
}

impl Session {
    /// Dispatch one delivered Trace Event and resume its tracee.
    pub fn dispatch_event(&mut self, id: TcbId, data: WaitData) -> Result<Flow> {
        let pid = match self.registry.get(id) {
            Some(tcb) => tcb.pid(),
            None => return Ok(Flow::Continue),
        };

        debug!(pid = pid.as_raw(), event = ?data.event, "dispatching");

        match data.event {
            TraceEvent::Again => Ok(Flow::Continue),

            TraceEvent::Exited { exit_code } => self.tracee_gone(id, ExitKind::Exit(exit_code)),

            TraceEvent::Killed { signal, core_dumped } => {
                self.tracee_gone(id, ExitKind::Signaled { signal, core_dumped })
            },

            // Attach handshake complete; the stop itself is not traced.
            TraceEvent::Attach | TraceEvent::Interrupt => {
                self.resume_default(id, None, None)?;
                Ok(Flow::Continue)
            },

            TraceEvent::SyscallStop => self.syscall_stop(id, None),

            TraceEvent::Seccomp { data: ret_data } => self.syscall_stop(id, Some(ret_data)),

            TraceEvent::SignalDelivery { signal } => {
                self.print_signal(id, signal, data.siginfo)?;

                // Re-inject on resume so delivery semantics are preserved.
                self.resume_default(id, None, Some(signal))?;
                Ok(Flow::Continue)
            },

            TraceEvent::Group { signal } => self.group_stop(id, signal),

            TraceEvent::NewChild { kind, new } => self.new_child(id, kind, new),

            TraceEvent::Exec { old } => self.exec_event(id, old),

            TraceEvent::Exiting { kind } => {
                // Flush before the kernel-level death notification arrives;
                // there is no chance to print for this pid afterward.
                debug!(pid = pid.as_raw(), ?kind, "tracee entering exit");
                self.finish_line_truncated(id)?;
                self.resume(id, Resume::Continue, None)?;
                Ok(Flow::Continue)
            },

            TraceEvent::VforkDone => {
                self.resume_default(id, None, None)?;
                Ok(Flow::Continue)
            },
        }
    }

    // The tracee is gone and reaped; tear down its tcb.
    fn tracee_gone(&mut self, id: TcbId, kind: ExitKind) -> Result<Flow> {
        self.finish_line_truncated(id)?;
        self.print_gone(id, kind)?;

        if let Some(tcb) = self.registry.get(id) {
            info!(pid = tcb.pid().as_raw(), ?kind, "tracee gone");
        }

        self.last_exit = Some(kind);
        self.drop_tcb(id);

        if self.registry.is_empty() {
            Ok(Flow::Stop)
        } else {
            Ok(Flow::Continue)
        }
    }

    fn new_child(&mut self, id: TcbId, kind: CloneKind, new: Pid) -> Result<Flow> {
        // The tcb was registered when the event was classified; here we only
        // log and release the parent.
        info!(?kind, new = new.as_raw(), "tracee created a new task");

        self.resume_default(id, None, None)?;
        Ok(Flow::Continue)
    }

    fn group_stop(&mut self, id: TcbId, signal: Signal) -> Result<Flow> {
        self.print_note(id, &format!("--- stopped by {} ---", signal.as_str()))?;

        match self.mode {
            AttachMode::Seize => {
                // End the ptrace-stop without releasing the group-stop, so
                // job control still works on the tracee.
                self.resume(id, Resume::Listen, None)?;
            },
            AttachMode::Classic => {
                // Deliver the stopping signal verbatim.
                self.resume_default(id, None, Some(signal))?;
            },
        }

        Ok(Flow::Continue)
    }

    fn syscall_stop(&mut self, id: TcbId, seccomp: Option<u16>) -> Result<Flow> {
        let in_syscall = match self.registry.get(id) {
            Some(tcb) => tcb.flags.contains(TcbFlags::IN_SYSCALL),
            None => return Ok(Flow::Continue),
        };

        if seccomp.is_some() && in_syscall {
            // A seccomp-stop only ever precedes syscall entry.
            warn!("seccomp-stop while mid-syscall; resyncing to entry");

            self.finish_line_truncated(id)?;

            if let Some(tcb) = self.registry.get_mut(id) {
                tcb.flags.remove(TcbFlags::IN_SYSCALL);
            }

            return self.syscall_enter(id, seccomp);
        }

        if in_syscall {
            self.syscall_exit(id, seccomp)
        } else {
            self.syscall_enter(id, seccomp)
        }
    }

    fn syscall_enter(&mut self, id: TcbId, seccomp: Option<u16>) -> Result<Flow> {
        let pid = match self.registry.get(id) {
            Some(tcb) => tcb.pid(),
            None => return Ok(Flow::Continue),
        };

        let regs = match arch::read_registers(pid) {
            Ok(regs) => regs,
            Err(err) if err.tracee_died() => {
                // Died mid-flight. Do not force a detach: the death
                // notification arrives on a subsequent wait and is the one
                // that tears the tcb down.
                debug!(pid = pid.as_raw(), "tracee died before entry decode");
                self.resume_default(id, seccomp, None)?;
                return Ok(Flow::Continue);
            },
            Err(err) => return Err(err),
        };

        let personality = arch::detect_personality(&regs);
        let scno = arch::syscall_number(&regs);

        let decode = {
            let tcb = match self.registry.get_mut(id) {
                Some(tcb) => tcb,
                None => return Ok(Flow::Continue),
            };

            tcb.personality = personality;
            tcb.scno = Some(scno);
            tcb.syscalls_seen += 1;

            let mut call = SyscallEnter {
                pid,
                personality,
                scno,
                regs: &regs,
                scratch: &mut tcb.scratch,
            };

            self.decoder.on_enter(&mut call)?
        };

        self.total_syscalls += 1;

        if let Some(limit) = self.config.syscall_limit {
            if self.total_syscalls >= limit {
                self.limit_hit = true;
            }
        }

        let complete = decode.disposition == EnterDisposition::Done;
        self.print_enter(id, &decode.text, complete)?;

        // The phase flag toggles exactly once per transition.
        if let Some(tcb) = self.registry.get_mut(id) {
            tcb.flags.insert(TcbFlags::IN_SYSCALL);
        }

        let mut inject = None;
        let mut delay_enter = None;

        if let Some(tamper) = decode.tamper {
            inject = tamper.signal;
            delay_enter = tamper.delay_enter;

            if let Some(tcb) = self.registry.get_mut(id) {
                tcb.tamper_retval = tamper.retval;
                tcb.tamper_delay_exit = tamper.delay_exit;
            }
        }

        let mode = self.choose_resume(id, seccomp);

        if let Some(duration) = delay_enter {
            // Park the resume decision; the delay timer replays it.
            self.arm_delay(id, duration, mode, inject);
            return Ok(Flow::Continue);
        }

        self.resume(id, mode, inject)?;
        Ok(Flow::Continue)
    }

    fn syscall_exit(&mut self, id: TcbId, seccomp: Option<u16>) -> Result<Flow> {
        let (pid, scno, personality, substitute, delay_exit) = {
            let tcb = match self.registry.get_mut(id) {
                Some(tcb) => tcb,
                None => return Ok(Flow::Continue),
            };

            // The phase flag toggles exactly once per transition.
            tcb.flags.remove(TcbFlags::IN_SYSCALL);

            (
                tcb.pid(),
                tcb.scno.unwrap_or(0),
                tcb.personality,
                tcb.tamper_retval.take(),
                tcb.tamper_delay_exit.take(),
            )
        };

        let mut regs = match arch::read_registers(pid) {
            Ok(regs) => regs,
            Err(err) if err.tracee_died() => {
                debug!(pid = pid.as_raw(), "tracee died before exit decode");
                self.finish_line_truncated(id)?;
                self.resume_default(id, seccomp, None)?;
                return Ok(Flow::Continue);
            },
            Err(err) => return Err(err),
        };

        if let Some(value) = substitute {
            arch::set_return_value(&mut regs, value);

            match arch::write_registers(pid, regs) {
                Ok(()) => {},
                Err(err) if err.tracee_died() => {
                    debug!(pid = pid.as_raw(), "tracee died before retval tamper");
                },
                Err(err) => return Err(err),
            }
        }

        let retval = arch::return_value(&regs);

        let text = {
            let tcb = match self.registry.get_mut(id) {
                Some(tcb) => tcb,
                None => return Ok(Flow::Continue),
            };

            let mut call = SyscallExit {
                pid,
                personality,
                scno,
                regs: &regs,
                retval,
                scratch: &mut tcb.scratch,
            };

            self.decoder.on_exit(&mut call)?
        };

        self.print_exit(id, &text)?;

        let mode = self.choose_resume(id, seccomp);

        if let Some(duration) = delay_exit {
            self.arm_delay(id, duration, mode, None);
            return Ok(Flow::Continue);
        }

        self.resume(id, mode, None)?;
        Ok(Flow::Continue)
    }

    fn exec_event(&mut self, id: TcbId, old: Pid) -> Result<Flow> {
        let (pid, in_syscall) = match self.registry.get(id) {
            Some(tcb) => (tcb.pid(), tcb.flags.contains(TcbFlags::IN_SYSCALL)),
            None => return Ok(Flow::Continue),
        };

        if !in_syscall {
            // An exec event should arrive between the entry and exit halves
            // of the exec call. Recover with a best-effort one-shot decode
            // instead of aborting.
            warn!(pid = pid.as_raw(), "exec event outside syscall decode; recovering");

            if let Err(err) = self.recover_exec_decode(id, pid) {
                debug!(%err, "recovery decode failed");
            }
        }

        let id = self.reconcile_exec(id, old);

        if let Some(tcb) = self.registry.get_mut(id) {
            // The next syscall-stop is the exit half of the exec call.
            tcb.flags.insert(TcbFlags::IN_SYSCALL);

            // The address space was replaced wholesale.
            tcb.unwind_cache = None;
        }

        if self.config.detach_on_exec {
            info!(pid = pid.as_raw(), "detaching on exec");
            self.detach_tcb(id, true)?;

            if self.registry.is_empty() {
                return Ok(Flow::Stop);
            }

            return Ok(Flow::Continue);
        }

        self.resume(id, Resume::Syscall, None)?;
        Ok(Flow::Continue)
    }

    // One-shot resynchronization decode for an off-phase exec event.
    fn recover_exec_decode(&mut self, id: TcbId, pid: Pid) -> Result<()> {
        let regs = arch::read_registers(pid)?;

        let personality = arch::detect_personality(&regs);
        let scno = arch::syscall_number(&regs);

        let decode = {
            let tcb = match self.registry.get_mut(id) {
                Some(tcb) => tcb,
                None => return Ok(()),
            };

            tcb.personality = personality;
            tcb.scno = Some(scno);

            let mut call = SyscallEnter {
                pid,
                personality,
                scno,
                regs: &regs,
                scratch: &mut tcb.scratch,
            };

            self.decoder.on_enter(&mut call)?
        };

        let complete = decode.disposition == EnterDisposition::Done;
        self.print_enter(id, &decode.text, complete)?;

        Ok(())
    }

    // Pick the resume primitive: the seccomp advisor decides for tracees
    // carrying a kernel filter, everyone else stops at the next syscall
    // boundary.
    pub(crate) fn choose_resume(&mut self, id: TcbId, seccomp: Option<u16>) -> Resume {
        let (pid, filtered) = match self.registry.get(id) {
            Some(tcb) => (tcb.pid(), tcb.flags.contains(TcbFlags::SECCOMP_FILTER)),
            None => return Resume::Syscall,
        };

        if filtered {
            if let Some(advisor) = self.advisor.as_mut() {
                return advisor.advise(pid, seccomp);
            }
        }

        Resume::Syscall
    }

    pub(crate) fn resume_default(
        &mut self,
        id: TcbId,
        seccomp: Option<u16>,
        signal: Option<Signal>,
    ) -> Result<()> {
        let mode = self.choose_resume(id, seccomp);
        self.resume(id, mode, signal)
    }

    /// Release a stopped tracee, delivering `signal` if one is pending.
    ///
    /// A resume that fails with `ESRCH` is treated as success: the tracee
    /// already died, and the death notification on a subsequent wait is the
    /// authoritative report. Any other failure is fatal to the tracer.
    pub(crate) fn resume(&mut self, id: TcbId, mode: Resume, signal: Option<Signal>) -> Result<()> {
        let pid = match self.registry.get(id) {
            Some(tcb) => tcb.pid(),
            None => return Ok(()),
        };

        debug!(pid = pid.as_raw(), ?mode, ?signal, "resuming");

        let res = match mode {
            Resume::Syscall => ptrace::syscall(pid, signal),
            Resume::Continue => ptrace::cont(pid, signal),
            Resume::Listen => listen(pid),
        };

        match res {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                debug!(pid = pid.as_raw(), "resume raced tracee death; treated as success");
                Ok(())
            },
            Err(source) => Err(Error::Resume { pid, mode, source }),
        }
    }

    // -- Trace line discipline --------------------------------------------
    //
    // Output is line-oriented and only one line may be in progress across
    // the whole session; an interrupted line is completed with an explicit
    // truncation marker, never silently merged or dropped.

    fn claim_output(&mut self, id: TcbId) -> Result<()> {
        if let Some(current) = self.printing {
            if current != id {
                if let Some(tcb) = self.registry.get_mut(current) {
                    tcb.abort_line()?;
                }

                self.printing = None;
            }
        }

        Ok(())
    }

    fn print_enter(&mut self, id: TcbId, text: &str, complete: bool) -> Result<()> {
        self.claim_output(id)?;

        if let Some(tcb) = self.registry.get_mut(id) {
            tcb.begin_line(text, !complete)?;
        }

        self.printing = if complete { None } else { Some(id) };

        Ok(())
    }

    fn print_exit(&mut self, id: TcbId, text: &str) -> Result<()> {
        self.claim_output(id)?;

        if let Some(tcb) = self.registry.get_mut(id) {
            if tcb.line_unfinished() {
                tcb.end_line(text)?;
            } else {
                // The entry half was truncated earlier; make the resumption
                // explicit rather than merging with a stranger's line.
                tcb.resumed_line(text)?;
            }
        }

        if self.printing == Some(id) {
            self.printing = None;
        }

        Ok(())
    }

    fn print_note(&mut self, id: TcbId, note: &str) -> Result<()> {
        self.claim_output(id)?;

        if let Some(tcb) = self.registry.get_mut(id) {
            tcb.abort_line()?;
            tcb.begin_line(note, false)?;
        }

        if self.printing == Some(id) {
            self.printing = None;
        }

        Ok(())
    }

    fn print_signal(&mut self, id: TcbId, signal: Signal, siginfo: Option<Siginfo>) -> Result<()> {
        let note = match siginfo {
            Some(si) => format!(
                "--- {} {{si_signo={}, si_code={}}} ---",
                signal.as_str(),
                si.si_signo,
                si.si_code
            ),
            None => format!("--- {} ---", signal.as_str()),
        };

        self.print_note(id, &note)
    }

    fn print_gone(&mut self, id: TcbId, kind: ExitKind) -> Result<()> {
        let note = match kind {
            ExitKind::Exit(code) => format!("+++ exited with {} +++", code),
            ExitKind::Signaled { signal, core_dumped } => {
                if core_dumped {
                    format!("+++ killed by {} (core dumped) +++", signal.as_str())
                } else {
                    format!("+++ killed by {} +++", signal.as_str())
                }
            },
        };

        self.print_note(id, &note)
    }

    // Complete an interrupted line for `id` with the truncation marker.
    pub(crate) fn finish_line_truncated(&mut self, id: TcbId) -> Result<()> {
        if let Some(tcb) = self.registry.get_mut(id) {
            tcb.abort_line()?;
        }

        if self.printing == Some(id) {
            self.printing = None;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{self, Write};

    use crate::attach::AttachMode;
    use crate::session::Config;

    fn sink_session() -> Session {
        let config = Config {
            attach_mode: Some(AttachMode::Classic),
            ..Config::default()
        };

        let mut session = Session::new(config);
        session.set_output(Box::new(|_| {
            Ok(Box::new(io::sink()) as Box<dyn Write>)
        }));

        session
    }

    // Pid 1 is never a tracee of ours, so any attempted resume would fail
    // loudly. The iterate-again event must reach dispatch without one.
    #[test]
    fn iterate_again_issues_no_resume() {
        let mut session = sink_session();
        let id = session.allocate_tcb(Pid::from_raw(1));

        let flow = session
            .dispatch_event(id, WaitData::new(TraceEvent::Again, 0))
            .unwrap();

        assert_eq!(flow, Flow::Continue);
        assert!(session.registry.get(id).is_some());
    }
}

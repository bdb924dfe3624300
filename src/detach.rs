//! Graceful detach: reuniting tracees with the kernel on our way out.
//!
//! `PTRACE_DETACH` requires the tracee to be in a ptrace-stop. A tracee that
//! is currently running must first be stopped, the induced stop consumed,
//! and any pre-existing stop signal re-injected so detach does not eat it.

use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::attach::AttachMode;
use crate::error::Result;
use crate::event::{classify, ExitKind, RawNotice, TraceEvent};
use crate::mux::wait_nohang;
use crate::session::Session;
use crate::tcb::{TcbFlags, TcbId};

// Bounded wait for the detach-induced stop: 100 polls of 1ms each.
const STOP_POLLS: u32 = 100;
const STOP_POLL_DELAY: Duration = Duration::from_millis(1);

impl Session {
    /// Detach from `pid`, leaving it running. The tracee keeps any signal
    /// that was pending when the detach request arrived.
    pub fn detach(&mut self, pid: Pid) -> Result<()> {
        let id = match self.registry.lookup(pid) {
            Some(id) => id,
            None => return Ok(()),
        };

        // Undelivered wait data means the tracee is sitting in a ptrace-stop
        // we have not yet resumed it from.
        let stopped = self
            .registry
            .get(id)
            .map(|tcb| !tcb.queued.is_empty() || tcb.delayed.is_some())
            .unwrap_or(false);

        self.detach_tcb(id, stopped)
    }

    /// Detach every remaining tracee. Failures are logged, never fatal; a
    /// tracee that cannot be detached is abandoned to the kernel default.
    pub(crate) fn detach_all(&mut self) {
        let ids: Vec<_> = self.registry.ids().collect();

        for id in ids {
            let stopped = self
                .registry
                .get(id)
                .map(|tcb| !tcb.queued.is_empty() || tcb.delayed.is_some())
                .unwrap_or(false);

            if let Err(err) = self.detach_tcb(id, stopped) {
                warn!(%err, "detach failed; abandoning tracee");
                self.drop_tcb(id);
            }
        }
    }

    /// Detach the tcb `id`. `stopped` says whether the tracee is already in
    /// a ptrace-stop, in which case detach is a single call.
    pub(crate) fn detach_tcb(&mut self, id: TcbId, stopped: bool) -> Result<()> {
        let pid = match self.registry.get_mut(id) {
            Some(tcb) => {
                tcb.flags.insert(TcbFlags::DETACHING);
                tcb.pid()
            },
            None => return Ok(()),
        };

        debug!(pid = pid.as_raw(), stopped, "detaching");

        if stopped {
            self.detach_now(pid, None);
            self.drop_tcb(id);
            return Ok(());
        }

        // Induce a stop we can detach from.
        let induced = match self.mode {
            AttachMode::Seize => ptrace::interrupt(pid),
            AttachMode::Classic => kill(pid, Signal::SIGSTOP),
        };

        match induced {
            Ok(()) => {},
            Err(Errno::ESRCH) => {
                // Already gone; nothing to release.
                self.drop_tcb(id);
                return Ok(());
            },
            Err(err) => {
                warn!(pid = pid.as_raw(), %err, "could not stop tracee for detach");
                self.detach_now(pid, None);
                self.drop_tcb(id);
                return Ok(());
            },
        }

        let inject = self.await_detach_stop(pid);
        self.detach_now(pid, inject);
        self.drop_tcb(id);

        Ok(())
    }

    // Wait, bounded, for the induced stop to be reported, consuming other
    // notifications along the way. Returns a stop signal that must ride
    // along with the detach so it is not lost.
    fn await_detach_stop(&mut self, pid: Pid) -> Option<Signal> {
        for _ in 0..STOP_POLLS {
            let raw_status = match wait_nohang(pid) {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    thread::sleep(STOP_POLL_DELAY);
                    continue;
                },
                Err(Errno::ECHILD) => return None,
                Err(err) => {
                    warn!(pid = pid.as_raw(), %err, "wait failed during detach");
                    return None;
                },
            };

            let notice = RawNotice {
                pid,
                raw_status,
                aux: None,
                siginfo_einval: false,
            };

            let event = match classify(&notice, TcbFlags::DETACHING) {
                Ok(event) => event,
                Err(err) => {
                    warn!(pid = pid.as_raw(), %err, "unclassifiable stop during detach");
                    return None;
                },
            };

            match event {
                TraceEvent::Exited { exit_code } => {
                    // Died while we were detaching; record it rather than
                    // dropping the report on the floor.
                    self.last_exit = Some(ExitKind::Exit(exit_code));
                    return None;
                },
                TraceEvent::Killed { signal, core_dumped } => {
                    self.last_exit = Some(ExitKind::Signaled { signal, core_dumped });
                    return None;
                },
                TraceEvent::SignalDelivery { signal } => {
                    // A pre-existing signal beat our stop request. Under a
                    // classic attach the self-induced SIGSTOP is consumed;
                    // anything else is the tracee's own and rides along.
                    if self.mode == AttachMode::Classic && signal == Signal::SIGSTOP {
                        return None;
                    }

                    return Some(signal);
                },
                TraceEvent::Group { signal } => {
                    if self.mode == AttachMode::Classic && signal == Signal::SIGSTOP {
                        return None;
                    }

                    return Some(signal);
                },
                TraceEvent::Interrupt => return None,
                event => {
                    // Some other ptrace-stop arrived first. It is a stop all
                    // the same; detach from it directly.
                    debug!(pid = pid.as_raw(), ?event, "stop consumed during detach");
                    return None;
                },
            }
        }

        warn!(pid = pid.as_raw(), "tracee never stopped; forcing detach");
        None
    }

    // Fire the actual detach; ESRCH means the tracee is already gone.
    fn detach_now(&self, pid: Pid, signal: Option<Signal>) {
        match ptrace::detach(pid, signal) {
            Ok(()) => {},
            Err(Errno::ESRCH) => {},
            Err(err) => {
                warn!(pid = pid.as_raw(), %err, "ptrace detach failed");
            },
        }
    }
}

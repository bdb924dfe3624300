//! The event multiplexer: the single wait point of the whole tracer.
//!
//! One logical blocking wait is realized as a non-blocking sweep over every
//! known tracee with exponential backoff, so the cooperative delay timer can
//! bound the sleep. After the first hit, the sweep keeps draining: one wait
//! cycle can legitimately surface more than one notification, e.g. when a
//! tracee is killed right after another event.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::event::{self, RawNotice, TraceEvent};
use crate::session::Session;
use crate::tcb::{Siginfo, TcbFlags, TcbId, WaitData};

const MAX_POLL_DELAY: Duration = Duration::from_millis(10);

// `waitpid` with `WNOHANG | __WALL`, returning the raw status so that
// classification stays a pure function of the bits.
pub(crate) fn wait_nohang(pid: Pid) -> std::result::Result<Option<i32>, Errno> {
    let mut raw = 0;

    let res = unsafe { libc::waitpid(pid.as_raw(), &mut raw, libc::WNOHANG | libc::__WALL) };

    match res {
        0 => Ok(None),
        -1 => Err(Errno::last()),
        _ => Ok(Some(raw)),
    }
}

fn wifstopped(raw_status: i32) -> bool {
    raw_status & 0xff == 0x7f
}

fn wstopsig(raw_status: i32) -> i32 {
    (raw_status >> 8) & 0xff
}

fn ptrace_event_code(raw_status: i32) -> i32 {
    (raw_status >> 16) & 0xffff
}

impl Session {
    /// Wait for the next dispatchable Trace Event.
    ///
    /// Returns `None` when no tracees remain, when the syscall-count limit
    /// has been reached, or when an interrupt request arrives while idle.
    pub fn wait_event(&mut self) -> Result<Option<(TcbId, WaitData)>> {
        if self.limit_hit {
            return Ok(None);
        }

        let mut poll_delay = self.config.poll_delay;

        loop {
            // The delay timer is polled here, at the one suspension point,
            // so timer logic never runs concurrently with dispatch logic.
            self.expire_delays()?;

            if let Some(next) = self.pop_pending() {
                return Ok(Some(next));
            }

            if self.registry.is_empty() {
                debug!("no tracees to wait on");
                return Ok(None);
            }

            if self.sweep()? > 0 {
                poll_delay = self.config.poll_delay;
                continue;
            }

            if self.interrupted() {
                return Ok(None);
            }

            // Back off, but never sleep past the nearest delay deadline.
            let mut sleep = poll_delay.min(MAX_POLL_DELAY);

            if let Some(deadline) = self.nearest_deadline() {
                sleep = sleep.min(deadline.saturating_duration_since(Instant::now()));
            }

            trace!(tracees = self.registry.len(), ?sleep, "no tracee updates, backing off");
            std::thread::sleep(sleep);

            poll_delay = poll_delay.saturating_mul(2);
        }
    }

    // Deliver the oldest queued event, in generation order. A tcb holding a
    // second, "extra" event re-enters the queue at the back: the extra is
    // delivered on a later call, strictly after the one ahead of it.
    fn pop_pending(&mut self) -> Option<(TcbId, WaitData)> {
        while let Some(id) = self.pending.pop_front() {
            let tcb = match self.registry.get_mut(id) {
                Some(tcb) => tcb,
                None => continue,
            };

            let data = match tcb.queued.pop_front() {
                Some(data) => data,
                None => continue,
            };

            if !tcb.queued.is_empty() {
                self.pending.push_back(id);
            }

            self.startup_fixup(id, &data);

            return Some((id, data));
        }

        None
    }

    // One non-blocking pass over every known tracee, repeated until quiet.
    fn sweep(&mut self) -> Result<usize> {
        let mut collected = 0;

        loop {
            let mut hits = 0;

            let ids: Vec<_> = self.registry.ids().collect();

            for id in ids {
                let pid = match self.registry.get(id) {
                    // A queued death report means the pid is already reaped;
                    // waiting on it again would only report ECHILD.
                    Some(tcb) if tcb.death_queued() => continue,
                    Some(tcb) => tcb.pid(),
                    None => continue,
                };

                match wait_nohang(pid) {
                    Ok(None) => {},
                    Ok(Some(raw_status)) => {
                        self.enqueue(id, pid, raw_status)?;
                        hits += 1;
                    },
                    Err(Errno::ECHILD) => {
                        // Not traced and not our child: provably gone, with
                        // its death already consumed elsewhere. Undelivered
                        // wait data still belongs to the dispatcher.
                        let undelivered = self
                            .registry
                            .get(id)
                            .map(|tcb| !tcb.queued.is_empty())
                            .unwrap_or(false);

                        if undelivered {
                            debug!(pid = pid.as_raw(), "wait raced queued events; keeping tcb");
                        } else {
                            warn!(pid = pid.as_raw(), "tracee vanished; dropping tcb");
                            self.drop_tcb(id);
                        }
                    },
                    Err(source) => return Err(Error::Wait { source }),
                }
            }

            collected += hits;

            if hits == 0 {
                break;
            }
        }

        Ok(collected)
    }

    // Classify one raw notification and queue it on its tcb.
    fn enqueue(&mut self, id: TcbId, pid: Pid, raw_status: i32) -> Result<()> {
        let mut siginfo: Option<Siginfo> = None;
        let mut administrative = None;
        let mut notice = RawNotice {
            pid,
            raw_status,
            aux: None,
            siginfo_einval: false,
        };

        if wifstopped(raw_status) {
            if ptrace_event_code(raw_status) != 0 {
                match ptrace::getevent(pid) {
                    Ok(msg) => notice.aux = Some(msg as u64),
                    Err(Errno::ESRCH) => {
                        // Killed under us: nothing dispatchable arrived, but
                        // the loop still iterates, and the death notification
                        // follows on a later sweep.
                        debug!(pid = pid.as_raw(), "event-stop for dying tracee");
                        administrative = Some(TraceEvent::Again);
                    },
                    Err(source) => return Err(Error::Os(source)),
                }
            } else if wstopsig(raw_status) != (libc::SIGTRAP | 0x80) {
                match ptrace::getsiginfo(pid) {
                    Ok(info) => siginfo = Some(info),
                    Err(Errno::EINVAL) => notice.siginfo_einval = true,
                    Err(Errno::ESRCH) => {},
                    Err(source) => return Err(Error::Os(source)),
                }
            }
        }

        let flags = self
            .registry
            .get(id)
            .map(|tcb| tcb.flags)
            .unwrap_or_else(TcbFlags::empty);

        let event = match administrative {
            Some(event) => event,
            None => event::classify(&notice, flags)?,
        };

        trace!(pid = pid.as_raw(), ?event, "classified notification");

        // Register announced tasks immediately, so the sweep polls them.
        if let TraceEvent::NewChild { new, .. } = event {
            self.mark_new_child(new);
        }

        let mut data = WaitData::new(event, raw_status);
        data.aux = notice.aux;
        data.siginfo = siginfo;

        if let Some(tcb) = self.registry.get_mut(id) {
            tcb.queued.push_back(data);

            match tcb.queued.len() {
                1 => self.pending.push_back(id),
                2 => debug!(
                    pid = pid.as_raw(),
                    "holding extra event for a later wait cycle"
                ),
                depth => warn!(
                    pid = pid.as_raw(),
                    depth, "extra-event queue deeper than expected"
                ),
            }
        }

        Ok(())
    }

    // One-time fix-up, run when the first Trace Event for a tcb is
    // delivered: apply session-wide trace options and seed the per-tracee
    // statistics baseline.
    fn startup_fixup(&mut self, id: TcbId, data: &WaitData) {
        let (pid, flags) = match self.registry.get(id) {
            Some(tcb) => (tcb.pid(), tcb.flags),
            None => return,
        };

        if flags.contains(TcbFlags::STARTUP_DONE) {
            return;
        }

        match data.event {
            TraceEvent::Exited { .. } | TraceEvent::Killed { .. } | TraceEvent::Again => return,
            _ => {},
        }

        let options = self.tracee_options();

        if let Err(err) = ptrace::setoptions(pid, options) {
            // Tolerated: the tracee may already be dying, and its death is
            // reported through the normal path.
            debug!(pid = pid.as_raw(), %err, "could not apply trace options");
        }

        if let Some(tcb) = self.registry.get_mut(id) {
            tcb.flags.insert(TcbFlags::ATTACHED | TcbFlags::STARTUP_DONE);
            tcb.flags.remove(TcbFlags::IGNORE_ONE_SIGSTOP);
            tcb.syscalls_seen = 0;
        }

        debug!(pid = pid.as_raw(), "applied startup fix-up");
    }
}

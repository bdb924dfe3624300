//! Cooperative delay timers: resume decisions parked until a deadline.
//!
//! A delay never blocks the dispatch loop. The parked resume is recorded on
//! the tcb, the event multiplexer caps its idle sleep at the nearest
//! deadline, and expiry performs the original decision verbatim.

use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tracing::debug;

use crate::error::Result;
use crate::session::{Resume, Session};
use crate::tcb::{DelayedResume, TcbFlags, TcbId};

impl Session {
    /// Park a resume decision for `id` until `duration` from now.
    ///
    /// The tracee simply stays in its current ptrace-stop; other tracees
    /// keep running and dispatching in the meantime.
    pub(crate) fn arm_delay(
        &mut self,
        id: TcbId,
        duration: Duration,
        mode: Resume,
        signal: Option<Signal>,
    ) {
        let deadline = Instant::now() + duration;

        if let Some(tcb) = self.registry.get_mut(id) {
            debug!(
                pid = tcb.pid().as_raw(),
                delay_ms = duration.as_millis() as u64,
                "parking resume"
            );

            tcb.flags.insert(TcbFlags::DELAYED);
            tcb.delayed = Some(DelayedResume { deadline, mode, signal });
        }
    }

    /// The earliest parked deadline across all tracees, if any.
    pub(crate) fn nearest_deadline(&self) -> Option<Instant> {
        self.registry
            .ids()
            .filter_map(|id| self.registry.get(id))
            .filter_map(|tcb| tcb.delayed.as_ref())
            .map(|delayed| delayed.deadline)
            .min()
    }

    /// Perform every parked resume whose deadline has passed, oldest
    /// deadline first. Returns how many fired.
    pub(crate) fn expire_delays(&mut self) -> Result<usize> {
        let now = Instant::now();

        let mut expired: Vec<(Instant, TcbId)> = self
            .registry
            .ids()
            .filter_map(|id| {
                let tcb = self.registry.get(id)?;
                let delayed = tcb.delayed.as_ref()?;

                if delayed.deadline <= now {
                    Some((delayed.deadline, id))
                } else {
                    None
                }
            })
            .collect();

        expired.sort_by_key(|&(deadline, _)| deadline);

        let fired = expired.len();

        for (_, id) in expired {
            let parked = match self.registry.get_mut(id) {
                Some(tcb) => {
                    tcb.flags.remove(TcbFlags::DELAYED);
                    tcb.delayed.take()
                },
                None => None,
            };

            if let Some(DelayedResume { mode, signal, .. }) = parked {
                // The original decision, replayed verbatim; the syscall is
                // never decoded a second time.
                self.resume(id, mode, signal)?;
            }
        }

        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{self, Write};

    use nix::unistd::Pid;

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

    #[test]
    fn delay_does_not_fire_before_deadline() {
        let mut session = sink_session();
        let id = session.allocate_tcb(Pid::from_raw(1));

        session.arm_delay(id, Duration::from_secs(3600), Resume::Syscall, None);

        assert_eq!(session.expire_delays().unwrap(), 0);

        let tcb = session.registry().get(id).unwrap();
        assert!(tcb.flags().contains(TcbFlags::DELAYED));

        assert!(session.nearest_deadline().unwrap() > Instant::now());
    }

    #[test]
    fn expired_delay_clears_flag_and_parked_state() {
        let mut session = sink_session();

        // A pid that cannot exist, so the replayed resume hits the
        // tracee-died path and is treated as success.
        let id = session.allocate_tcb(Pid::from_raw(i32::MAX));

        session.arm_delay(id, Duration::ZERO, Resume::Syscall, None);

        assert_eq!(session.expire_delays().unwrap(), 1);

        let tcb = session.registry().get(id).unwrap();
        assert!(!tcb.flags().contains(TcbFlags::DELAYED));
        assert!(session.nearest_deadline().is_none());
    }

    #[test]
    fn nearest_deadline_picks_the_minimum() {
        let mut session = sink_session();

        let near = session.allocate_tcb(Pid::from_raw(1));
        let far = session.allocate_tcb(Pid::from_raw(2));

        session.arm_delay(far, Duration::from_secs(60), Resume::Syscall, None);
        session.arm_delay(near, Duration::from_secs(1), Resume::Syscall, None);

        let deadline = session.nearest_deadline().unwrap();
        assert!(deadline <= Instant::now() + Duration::from_secs(1));
    }
}

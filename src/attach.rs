//! Bringing tracees under control: attach-mode probing, spawning, attaching
//! to running processes, and whole-thread-group discovery.

use std::fs;

use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, info, warn};

use crate::cmd::Command;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::tcb::TcbFlags;

/// How tracees are brought under control, selected once per session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttachMode {
    /// `PTRACE_ATTACH`: forces a pending `SIGSTOP` that must be consumed
    /// before the tracee is considered ready.
    Classic,
    /// `PTRACE_SEIZE`: non-intrusive; a known stop is reached by an explicit
    /// interrupt request.
    Seize,
}

impl AttachMode {
    /// Probe kernel support by seizing a disposable forked child.
    pub fn probe() -> AttachMode {
        match probe_seize() {
            Ok(mode) => mode,
            Err(err) => {
                warn!(%err, "attach-mode probe failed; assuming classic");
                AttachMode::Classic
            },
        }
    }
}

fn probe_seize() -> Result<AttachMode> {
    match unsafe { unistd::fork() }? {
        ForkResult::Child => {
            // Exists only to be seized; reaped by the parent below.
            loop {
                let _ = unistd::pause();
            }
        },
        ForkResult::Parent { child } => {
            let mode = match ptrace::seize(child, Options::empty()) {
                Ok(()) => AttachMode::Seize,
                Err(_) => AttachMode::Classic,
            };

            let _ = kill(child, Signal::SIGKILL);
            let _ = waitpid(child, Some(WaitPidFlag::__WALL));

            debug!(?mode, "probed attach mode");

            Ok(mode)
        },
    }
}

// Every tid in /proc/<pid>/task, the target pid first.
fn thread_group(pid: Pid) -> Vec<Pid> {
    let mut tids = vec![pid];

    let task_dir = format!("/proc/{}/task", pid);

    if let Ok(entries) = fs::read_dir(task_dir) {
        for entry in entries.flatten() {
            if let Ok(raw) = entry.file_name().to_string_lossy().parse::<i32>() {
                let tid = Pid::from_raw(raw);

                if tid != pid {
                    tids.push(tid);
                }
            }
        }
    }

    tids
}

impl Session {
    /// Spawn `cmd` as a fresh tracee.
    ///
    /// Classic mode relies on the child's pre-exec trace-me request; seize
    /// mode waits for the child's pre-exec stop and seizes it from outside.
    /// Either way the child is under control before it reaches `execv()`.
    pub fn spawn(&mut self, cmd: Command) -> Result<Pid> {
        let trace_me = self.attach_mode() == AttachMode::Classic;

        let child = cmd.fork_exec(trace_me)?;

        if trace_me {
            // The raised SIGSTOP will surface as the attach-stop.
            let id = self.allocate_tcb(child);

            if let Some(tcb) = self.registry.get_mut(id) {
                tcb.flags.insert(TcbFlags::IGNORE_ONE_SIGSTOP);
            }
        } else {
            self.seize_spawned(child)?;
        }

        info!(pid = child.as_raw(), "spawned tracee");

        Ok(child)
    }

    // Synchronize on the child's self-stop, then seize it and let it run on
    // to `execv()`. Options ride along with the seize request, so no
    // startup fix-up call to `PTRACE_SETOPTIONS` is needed.
    fn seize_spawned(&mut self, child: Pid) -> Result<()> {
        waitpid(child, Some(WaitPidFlag::WUNTRACED))
            .map_err(|source| Error::Attach { pid: child, source })?;

        ptrace::seize(child, self.tracee_options())
            .map_err(|source| Error::Attach { pid: child, source })?;

        let id = self.allocate_tcb(child);

        if let Some(tcb) = self.registry.get_mut(id) {
            tcb.flags.insert(TcbFlags::ATTACHED | TcbFlags::STARTUP_DONE);
        }

        // End the pre-exec group-stop.
        kill(child, Signal::SIGCONT).map_err(|source| Error::Attach { pid: child, source })?;

        Ok(())
    }

    /// Attach to a running process.
    ///
    /// With follow-forks enabled, every existing thread of the process is
    /// attached as well; per-thread attach failures drop only that thread.
    /// The attach fails as a whole only when not a single task could be
    /// attached.
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        let tids = if self.config.follow_forks {
            thread_group(pid)
        } else {
            vec![pid]
        };

        let mut attached = 0;
        let mut first_err = None;

        for tid in tids {
            if self.registry.lookup(tid).is_some() {
                continue;
            }

            match self.attach_task(tid) {
                Ok(()) => attached += 1,
                Err(err) => {
                    warn!(tid = tid.as_raw(), %err, "could not attach to task; dropping it");

                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                },
            }
        }

        if attached == 0 {
            return Err(first_err.unwrap_or(Error::Attach {
                pid,
                source: Errno::ESRCH,
            }));
        }

        info!(pid = pid.as_raw(), tasks = attached, "attached");

        Ok(())
    }

    fn attach_task(&mut self, tid: Pid) -> Result<()> {
        match self.attach_mode() {
            AttachMode::Classic => {
                ptrace::attach(tid).map_err(|source| Error::Attach { pid: tid, source })?;

                let id = self.allocate_tcb(tid);

                if let Some(tcb) = self.registry.get_mut(id) {
                    tcb.flags.insert(TcbFlags::IGNORE_ONE_SIGSTOP);
                }
            },
            AttachMode::Seize => {
                ptrace::seize(tid, self.tracee_options())
                    .map_err(|source| Error::Attach { pid: tid, source })?;

                if let Err(source) = ptrace::interrupt(tid) {
                    // The task can die between seize and interrupt; its
                    // death notification still arrives normally.
                    if source != Errno::ESRCH {
                        return Err(Error::Attach { pid: tid, source });
                    }
                }

                let id = self.allocate_tcb(tid);

                if let Some(tcb) = self.registry.get_mut(id) {
                    tcb.flags.insert(TcbFlags::ATTACHED | TcbFlags::STARTUP_DONE);
                }
            },
        }

        debug!(tid = tid.as_raw(), "attached task");

        Ok(())
    }

    /// Register a task announced by a fork/vfork/clone auxiliary event.
    ///
    /// The new task starts as a tracee and will report an attach-style stop
    /// before running; mark it so that stop is consumed, not traced.
    pub(crate) fn mark_new_child(&mut self, new: Pid) {
        if self.registry.lookup(new).is_some() {
            return;
        }

        info!(pid = new.as_raw(), "tracking new child");

        let id = self.allocate_tcb(new);

        if let Some(tcb) = self.registry.get_mut(id) {
            tcb.flags.insert(TcbFlags::IGNORE_ONE_SIGSTOP);
        }
    }
}

//! The Session: single owner of the TCB registry, event queues, and the
//! dispatch loop. All tracer state lives here; nothing is process-global.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::ptrace::Options;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::attach::AttachMode;
use crate::decoder::{
    stderr_factory, OutputFactory, RawDecoder, SeccompAdvisor, SyscallDecoder,
};
use crate::dispatch::Flow;
use crate::error::Result;
use crate::event::ExitKind;
use crate::tcb::{Registry, TcbFlags, TcbId};

/// Resume requests, which release stopped tracees.
///
/// The resume mode determines the possible subsequent stops of the tracee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resume {
    /// Stop again at the next syscall boundary.
    Syscall,
    /// Run freely until the next non-syscall stop.
    Continue,
    /// End the current ptrace-stop without releasing a group-stop,
    /// preserving job-control semantics. Seize-style attach only.
    Listen,
}

/// The tracer cannot run without these options: exec and exit events keep
/// the tcb table coherent across image swaps and teardown, and the
/// sysgood bit is how syscall-stops are told apart from real `SIGTRAP`s.
/// They are applied to every tracee on top of whatever [`Config::options`]
/// asks for.
pub const REQUIRED_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEEXIT)
    .union(Options::PTRACE_O_TRACESYSGOOD);

/// Options that auto-attach new tasks created by a tracee.
pub const FOLLOW_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACEVFORK)
    .union(Options::PTRACE_O_TRACECLONE);

const DEFAULT_POLL_DELAY: Duration = Duration::from_micros(1);

/// Session-wide tracing configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Extra ptrace options applied to tracees. [`REQUIRED_OPTIONS`] are
    /// always set, even if unset here.
    pub options: Options,
    /// Trace new tasks created by fork, vfork, and clone, and attach to
    /// every existing thread of an attached process.
    pub follow_forks: bool,
    /// Force an attach style; `None` probes kernel support once.
    pub attach_mode: Option<AttachMode>,
    /// Initial sleep before re-polling tracees for new events.
    pub poll_delay: Duration,
    /// Stop tracing after this many syscall entries, session-wide.
    pub syscall_limit: Option<u64>,
    /// Stop following a tracee when it execs.
    pub detach_on_exec: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            options: Options::empty(),
            follow_forks: true,
            attach_mode: None,
            poll_delay: DEFAULT_POLL_DELAY,
            syscall_limit: None,
            detach_on_exec: false,
        }
    }
}

/// Terminal condition of a tracing session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Exit {
    /// The last tracee exited normally with this code.
    Exited(i32),
    /// The last tracee was killed by this signal.
    Signaled(Signal),
    /// An external interrupt request was observed; tracees were detached.
    Interrupted,
    /// The syscall-count limit was reached; tracees were detached.
    LimitReached,
    /// Every tracee was detached on request.
    Detached,
}

impl Exit {
    /// Deterministic process-exit encoding of the terminal condition,
    /// following shell conventions: the tracee's exit code, or `128 + signo`
    /// when the last tracee died of a signal.
    pub fn code(&self) -> i32 {
        match self {
            Exit::Exited(code) => *code,
            Exit::Signaled(signal) => 128 + *signal as i32,
            Exit::Interrupted | Exit::LimitReached | Exit::Detached => 0,
        }
    }
}

/// Requests an orderly shutdown of a running session.
///
/// The flag is observed only between dispatches, never mid-dispatch, so a
/// trace line in progress is always completed (possibly with a truncation
/// marker) before the session returns.
#[derive(Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Tracer session for one or more Linux processes.
pub struct Session {
    pub(crate) config: Config,
    pub(crate) mode: AttachMode,
    pub(crate) registry: Registry,
    /// TCBs with wait data ready for dispatch, in generation order.
    pub(crate) pending: VecDeque<TcbId>,
    pub(crate) decoder: Box<dyn SyscallDecoder>,
    pub(crate) advisor: Option<Box<dyn SeccompAdvisor>>,
    pub(crate) output: OutputFactory,
    /// The tcb whose trace line is currently in progress, if any.
    pub(crate) printing: Option<TcbId>,
    interrupt: Arc<AtomicBool>,
    pub(crate) total_syscalls: u64,
    pub(crate) limit_hit: bool,
    pub(crate) last_exit: Option<ExitKind>,
}

impl Session {
    /// Create a session with the built-in numeric decoder.
    pub fn new(config: Config) -> Self {
        Self::with_decoder(config, Box::new(RawDecoder))
    }

    pub fn with_decoder(config: Config, decoder: Box<dyn SyscallDecoder>) -> Self {
        let mode = config.attach_mode.unwrap_or_else(AttachMode::probe);

        info!(?mode, "session attach mode selected");

        Self {
            config,
            mode,
            registry: Registry::new(),
            pending: VecDeque::new(),
            decoder,
            advisor: None,
            output: stderr_factory(),
            printing: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            total_syscalls: 0,
            limit_hit: false,
            last_exit: None,
        }
    }

    pub fn attach_mode(&self) -> AttachMode {
        self.mode
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Install the advisor consulted for tracees carrying a kernel filter.
    pub fn set_advisor(&mut self, advisor: Box<dyn SeccompAdvisor>) {
        self.advisor = Some(advisor);
    }

    /// Install the factory that opens per-tracee output streams.
    pub fn set_output(&mut self, output: OutputFactory) {
        self.output = output;
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(self.interrupt.clone())
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    /// Mark whether `pid` carries a kernel-assisted syscall filter, making
    /// the seccomp advisor responsible for its resume selection.
    pub fn set_seccomp_filter(&mut self, pid: Pid, carries: bool) -> bool {
        let id = match self.registry.lookup(pid) {
            Some(id) => id,
            None => return false,
        };

        if let Some(tcb) = self.registry.get_mut(id) {
            tcb.flags.set(TcbFlags::SECCOMP_FILTER, carries);
            true
        } else {
            false
        }
    }

    /// Ptrace options applied to tracees at startup fix-up time.
    pub(crate) fn tracee_options(&self) -> Options {
        let mut options = self.config.options | REQUIRED_OPTIONS;

        if self.config.follow_forks {
            options |= FOLLOW_OPTIONS;
        }

        options
    }

    /// Run the dispatch loop to completion.
    ///
    /// Returns when no tracees remain, the syscall-count limit is reached,
    /// or an interrupt request has been observed and fully drained.
    pub fn run(&mut self) -> Result<Exit> {
        loop {
            // Cancellation is level-triggered and only observed here,
            // between dispatches.
            if self.interrupted() {
                info!("interrupt observed; detaching all tracees");
                self.detach_all();
                return Ok(Exit::Interrupted);
            }

            let (id, data) = match self.wait_event()? {
                Some(next) => next,
                None => {
                    if self.interrupted() {
                        info!("interrupt observed while idle; detaching all tracees");
                        self.detach_all();
                        return Ok(Exit::Interrupted);
                    }

                    return Ok(self.finish());
                },
            };

            match self.dispatch_event(id, data)? {
                Flow::Continue => {},
                Flow::Stop => return Ok(self.finish()),
            }
        }
    }

    fn finish(&mut self) -> Exit {
        self.flush_unfinished_lines();

        if self.limit_hit {
            info!(total = self.total_syscalls, "syscall-count limit reached");
            self.detach_all();
            return Exit::LimitReached;
        }

        if !self.registry.is_empty() {
            self.detach_all();
            return Exit::Detached;
        }

        match self.last_exit {
            Some(ExitKind::Exit(code)) => Exit::Exited(code),
            Some(ExitKind::Signaled { signal, .. }) => Exit::Signaled(signal),
            None => Exit::Detached,
        }
    }

    pub(crate) fn flush_unfinished_lines(&mut self) {
        let ids: Vec<_> = self.registry.ids().collect();

        for id in ids {
            if let Some(tcb) = self.registry.get_mut(id) {
                if let Err(err) = tcb.abort_line() {
                    warn!(%err, "could not flush unfinished trace line");
                }
            }
        }

        self.printing = None;
    }

    /// Allocate a tcb for `pid`, opening its output stream. An output
    /// failure discards that tracee's trace text, never the tracee.
    pub(crate) fn allocate_tcb(&mut self, pid: Pid) -> TcbId {
        let out = match (self.output)(pid) {
            Ok(out) => out,
            Err(err) => {
                warn!(pid = pid.as_raw(), %err, "could not open trace output");
                Box::new(io::sink())
            },
        };

        self.registry.allocate(pid, out)
    }

    /// Free a tcb and purge every reference the session still holds to it.
    pub(crate) fn drop_tcb(&mut self, id: TcbId) {
        self.pending.retain(|&pending| pending != id);

        if self.printing == Some(id) {
            self.printing = None;
        }

        self.registry.free(id);
    }

    /// Repair tcb identity after an exec replaced the thread-group leader.
    ///
    /// The exec event arrives on the surviving pid (`event_id`'s tcb) and
    /// names the exec'ing thread's former tid in `old`. The old-tid tcb
    /// survives: it takes over the leader's output stream and print column,
    /// the superseded leader tcb is destroyed, and the survivor is relabeled
    /// to the leader's pid. Afterward `old` resolves to no tcb.
    pub(crate) fn reconcile_exec(&mut self, event_id: TcbId, old: Pid) -> TcbId {
        let leader_pid = match self.registry.get(event_id) {
            Some(tcb) => tcb.pid(),
            None => return event_id,
        };

        if old == leader_pid {
            // Exec on the leader thread itself; identities are intact.
            return event_id;
        }

        let survivor_id = match self.registry.lookup(old) {
            Some(id) if id != event_id => id,
            _ => {
                // The exec'ing thread was never attached (e.g. attach raced
                // thread creation). Keep the leader tcb as-is.
                debug!(
                    old = old.as_raw(),
                    "exec from unknown thread; keeping leader tcb"
                );
                return event_id;
            },
        };

        if let Some((leader, survivor)) = self.registry.get_pair_mut(event_id, survivor_id) {
            survivor.swap_output(leader);
        }

        info!(
            leader = leader_pid.as_raw(),
            old = old.as_raw(),
            "exec replaced thread-group leader; reconciling tcbs"
        );

        self.drop_tcb(event_id);
        self.registry.relabel(survivor_id, leader_pid);

        survivor_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

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
    fn reconcile_leaves_one_tcb_for_surviving_pid() {
        let mut session = sink_session();

        let leader = session.allocate_tcb(Pid::from_raw(100));
        let thread = session.allocate_tcb(Pid::from_raw(101));

        // Exec event arrives on the leader pid, naming the old thread tid.
        let survivor = session.reconcile_exec(leader, Pid::from_raw(101));

        assert_eq!(survivor, thread);
        assert_eq!(session.registry.lookup(Pid::from_raw(101)), None);
        assert_eq!(session.registry.lookup(Pid::from_raw(100)), Some(survivor));
        assert_eq!(session.registry.len(), 1);
    }

    #[test]
    fn reconcile_on_leader_exec_is_identity() {
        let mut session = sink_session();

        let leader = session.allocate_tcb(Pid::from_raw(200));

        let survivor = session.reconcile_exec(leader, Pid::from_raw(200));

        assert_eq!(survivor, leader);
        assert_eq!(session.registry.len(), 1);
    }

    #[test]
    fn exit_code_encoding_is_deterministic() {
        assert_eq!(Exit::Exited(3).code(), 3);
        assert_eq!(Exit::Signaled(Signal::SIGKILL).code(), 128 + 9);
        assert_eq!(Exit::Interrupted.code(), 0);
    }
}

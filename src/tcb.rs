//! Tracee control blocks and the registry that owns them.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::debug;

use crate::arch::Personality;
use crate::error::Result;
use crate::event::TraceEvent;
use crate::session::Resume;

/// Extra signal info, such as its cause.
pub type Siginfo = libc::siginfo_t;

bitflags! {
    /// Per-tracee state bits.
    pub struct TcbFlags: u32 {
        /// The attach handshake completed; the tracee is under our control.
        const ATTACHED = 1 << 0;
        /// The one-time startup fix-up (trace options, stats baseline) ran.
        const STARTUP_DONE = 1 << 1;
        /// A classic attach induced a `SIGSTOP` that must be consumed, not
        /// reported as signal delivery.
        const IGNORE_ONE_SIGSTOP = 1 << 2;
        /// Between a syscall-entry dispatch and the matching exit dispatch.
        const IN_SYSCALL = 1 << 3;
        /// The tracee carries a kernel-assisted syscall filter; resume
        /// selection defers to the seccomp advisor.
        const SECCOMP_FILTER = 1 << 4;
        /// A resume decision is parked on the delay queue.
        const DELAYED = 1 << 5;
        /// Detach was requested; ignore further trace output for this tcb.
        const DETACHING = 1 << 6;
    }
}

/// One OS notification captured for dispatch.
#[derive(Clone, Copy)]
pub struct WaitData {
    pub event: TraceEvent,
    pub raw_status: i32,
    pub siginfo: Option<Siginfo>,
    /// Auxiliary-event message, e.g. the old pid on exec.
    pub aux: Option<u64>,
}

impl fmt::Debug for WaitData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitData")
            .field("event", &self.event)
            .field("raw_status", &self.raw_status)
            .field("siginfo", &self.siginfo.map(|si| si.si_signo))
            .field("aux", &self.aux)
            .finish()
    }
}

impl WaitData {
    pub(crate) fn new(event: TraceEvent, raw_status: i32) -> Self {
        Self { event, raw_status, siginfo: None, aux: None }
    }
}

/// A resume decision parked until its deadline passes. Only the decision is
/// kept; the syscall was already decoded when it was made.
pub(crate) struct DelayedResume {
    pub deadline: Instant,
    pub mode: Resume,
    pub signal: Option<Signal>,
}

/// Tracee control block: everything the tracer knows about one task.
pub struct Tcb {
    pid: Pid,
    pub(crate) flags: TcbFlags,
    pub(crate) personality: Personality,
    /// Syscall number decoded at the current or last entry.
    pub(crate) scno: Option<u64>,
    /// Wait data ready for dispatch. Depth is expected to stay at one, with
    /// a second "extra" slot used when one wait cycle surfaces two events.
    pub(crate) queued: VecDeque<WaitData>,
    pub(crate) delayed: Option<DelayedResume>,
    /// Substituted return value to apply at the next syscall-exit.
    pub(crate) tamper_retval: Option<i64>,
    /// Delay to inject before resuming from the next syscall-exit.
    pub(crate) tamper_delay_exit: Option<Duration>,
    /// Per-tracee trace output stream.
    out: Box<dyn Write>,
    /// Print column of the line in progress; zero when no line is open.
    col: usize,
    unfinished: bool,
    /// Opaque per-decoder scratch; dropped when the tcb is freed.
    pub(crate) scratch: Option<Box<dyn Any>>,
    /// Opaque handle to a process memory-map cache, invalidated on exec.
    pub(crate) unwind_cache: Option<Box<dyn Any>>,
    /// Statistics baseline seeded by the startup fix-up.
    pub(crate) syscalls_seen: u64,
}

impl Tcb {
    fn new(pid: Pid, out: Box<dyn Write>) -> Self {
        Self {
            pid,
            flags: TcbFlags::empty(),
            personality: Personality::default(),
            scno: None,
            queued: VecDeque::new(),
            delayed: None,
            tamper_retval: None,
            tamper_delay_exit: None,
            out,
            col: 0,
            unfinished: false,
            scratch: None,
            unwind_cache: None,
            syscalls_seen: 0,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn flags(&self) -> TcbFlags {
        self.flags
    }

    pub fn personality(&self) -> Personality {
        self.personality
    }

    /// True while a trace line is open and awaiting its result half.
    pub fn line_unfinished(&self) -> bool {
        self.unfinished
    }

    /// True when a death report is queued but not yet delivered. Consuming
    /// an `Exited`/`Killed` status reaps the pid, so it must not be waited
    /// on again.
    pub(crate) fn death_queued(&self) -> bool {
        self.queued.iter().any(|data| {
            matches!(
                data.event,
                TraceEvent::Exited { .. } | TraceEvent::Killed { .. }
            )
        })
    }

    /// Syscall stops observed for this tracee since its startup fix-up.
    pub fn syscalls_seen(&self) -> u64 {
        self.syscalls_seen
    }

    /// Slot for a decoder-owned cache of the tracee's address-space layout.
    /// Cleared on exec, when the mapping is replaced wholesale.
    pub fn unwind_cache(&mut self) -> &mut Option<Box<dyn Any>> {
        &mut self.unwind_cache
    }

    /// Open a trace line. An `unfinished` line expects [`Tcb::end_line`] (or
    /// a truncation via [`Tcb::abort_line`]) later.
    pub(crate) fn begin_line(&mut self, text: &str, unfinished: bool) -> Result<()> {
        write!(self.out, "{}", text)?;
        self.col = text.len();

        if unfinished {
            self.unfinished = true;
        } else {
            writeln!(self.out)?;
            self.col = 0;
        }

        Ok(())
    }

    /// Complete the line in progress.
    pub(crate) fn end_line(&mut self, text: &str) -> Result<()> {
        writeln!(self.out, "{}", text)?;
        self.col = 0;
        self.unfinished = false;

        Ok(())
    }

    /// Write a whole line that resumes an interrupted call's result half.
    pub(crate) fn resumed_line(&mut self, text: &str) -> Result<()> {
        writeln!(self.out, "<... resumed>{}", text)?;
        self.col = 0;
        self.unfinished = false;

        Ok(())
    }

    /// Complete an interrupted line with an explicit truncation marker, so
    /// it is never silently dropped or merged with the next line.
    pub(crate) fn abort_line(&mut self) -> Result<()> {
        if self.unfinished {
            writeln!(self.out, " <unfinished ...>")?;
            self.col = 0;
            self.unfinished = false;
        }

        Ok(())
    }

    /// Exchange output stream and print-column state with another tcb.
    pub(crate) fn swap_output(&mut self, other: &mut Tcb) {
        std::mem::swap(&mut self.out, &mut other.out);
        std::mem::swap(&mut self.col, &mut other.col);
        std::mem::swap(&mut self.unfinished, &mut other.unfinished);
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("pid", &self.pid)
            .field("flags", &self.flags)
            .field("personality", &self.personality)
            .field("scno", &self.scno)
            .field("queued", &self.queued.len())
            .finish()
    }
}

/// Stable handle to a registry slot.
///
/// Handles stay valid across registry growth; a handle is invalidated only
/// by freeing its tcb.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TcbId(usize);

/// The set of live tracee control blocks.
///
/// Slots are reused after a free, and the backing storage only ever grows,
/// so outstanding [`TcbId`] handles are never relocated or renumbered.
#[derive(Default)]
pub struct Registry {
    slots: Vec<Option<Tcb>>,
    /// Single-entry cache for pid lookup; linear scan on miss.
    cache: Option<(Pid, TcbId)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a free slot to `pid` and return its handle.
    pub fn allocate(&mut self, pid: Pid, out: Box<dyn Write>) -> TcbId {
        let tcb = Tcb::new(pid, out);

        let id = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(tcb);
                TcbId(free)
            },
            None => {
                self.slots.push(Some(tcb));
                TcbId(self.slots.len() - 1)
            },
        };

        debug!(pid = pid.as_raw(), ?id, "allocated tcb");

        self.cache = Some((pid, id));

        id
    }

    pub fn lookup(&mut self, pid: Pid) -> Option<TcbId> {
        if let Some((cached_pid, id)) = self.cache {
            if cached_pid == pid {
                return Some(id);
            }
        }

        let found = self.slots.iter().position(|slot| {
            slot.as_ref().map(|tcb| tcb.pid == pid).unwrap_or(false)
        });

        let id = TcbId(found?);
        self.cache = Some((pid, id));

        Some(id)
    }

    pub fn get(&self, id: TcbId) -> Option<&Tcb> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: TcbId) -> Option<&mut Tcb> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Borrow two distinct tcbs at once.
    pub(crate) fn get_pair_mut(
        &mut self,
        a: TcbId,
        b: TcbId,
    ) -> Option<(&mut Tcb, &mut Tcb)> {
        if a == b || a.0 >= self.slots.len() || b.0 >= self.slots.len() {
            return None;
        }

        let (lo, hi) = if a.0 < b.0 { (a.0, b.0) } else { (b.0, a.0) };
        let (head, tail) = self.slots.split_at_mut(hi);
        let first = head[lo].as_mut()?;
        let second = tail[0].as_mut()?;

        if a.0 < b.0 {
            Some((first, second))
        } else {
            Some((second, first))
        }
    }

    /// Release a slot. Decoder scratch is dropped and the output stream is
    /// flushed and closed with the tcb.
    pub fn free(&mut self, id: TcbId) -> Option<Tcb> {
        let slot = self.slots.get_mut(id.0)?;
        let mut tcb = slot.take()?;

        debug!(pid = tcb.pid.as_raw(), ?id, "freeing tcb");

        let _ = tcb.out.flush();

        if let Some((_, cached_id)) = self.cache {
            if cached_id == id {
                self.cache = None;
            }
        }

        Some(tcb)
    }

    /// Rebind a live slot to a new pid. Subsequent lookups of the old pid
    /// fail; lookups of `new_pid` return this slot.
    pub(crate) fn relabel(&mut self, id: TcbId, new_pid: Pid) {
        if let Some(tcb) = self.slots.get_mut(id.0).and_then(Option::as_mut) {
            debug!(
                old = tcb.pid.as_raw(),
                new = new_pid.as_raw(),
                "relabeling tcb"
            );

            tcb.pid = new_pid;
        }

        self.cache = None;
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn ids(&self) -> impl Iterator<Item = TcbId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| TcbId(index))
    }
}

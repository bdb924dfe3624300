use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::Result;
use nix::sys::signal::Signal;
use ntest::timeout;
use sctrace::{
    AttachMode, Command, Config, EnterDecode, EnterDisposition, Exit, Session, SyscallDecoder,
    SyscallEnter, SyscallExit, Tamper,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Enter,
    Exit(i64),
}

/// Tampers the first syscall occurrence it sees and records every phase
/// with its wall-clock time.
#[derive(Clone)]
struct Saboteur {
    tamper: Tamper,
    armed: Rc<RefCell<bool>>,
    log: Rc<RefCell<Vec<(Phase, Instant)>>>,
}

impl Saboteur {
    fn new(tamper: Tamper) -> Self {
        Self {
            tamper,
            armed: Rc::new(RefCell::new(true)),
            log: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl SyscallDecoder for Saboteur {
    fn on_enter(&mut self, call: &mut SyscallEnter<'_>) -> sctrace::Result<EnterDecode> {
        self.log.borrow_mut().push((Phase::Enter, Instant::now()));

        let tamper = self.armed.replace(false).then(|| self.tamper);

        Ok(EnterDecode {
            text: format!("syscall_{}(", call.scno),
            disposition: EnterDisposition::NeedsExit,
            tamper,
        })
    }

    fn on_exit(&mut self, call: &mut SyscallExit<'_>) -> sctrace::Result<String> {
        self.log
            .borrow_mut()
            .push((Phase::Exit(call.retval), Instant::now()));

        Ok(format!(") = {}", call.retval))
    }
}

fn classic_config() -> Config {
    Config {
        attach_mode: Some(AttachMode::Classic),
        ..Config::default()
    }
}

fn sabotaged_session(tamper: Tamper) -> Result<(Session, Rc<RefCell<Vec<(Phase, Instant)>>>)> {
    let decoder = Saboteur::new(tamper);
    let log = decoder.log.clone();

    let mut session = Session::with_decoder(classic_config(), Box::new(decoder));
    session.set_output(Box::new(|_| {
        Ok(Box::new(io::sink()) as Box<dyn Write>)
    }));

    Ok((session, log))
}

// The first syscall traced on a spawn is the child's own exec call; the
// fresh image never looks at the return register it left behind, so a
// substituted result is visible to the decoder without disturbing the
// program.
#[test]
#[timeout(10000)]
fn test_tamper_retval_and_delay_exit() -> Result<()> {
    let delay = Duration::from_millis(200);

    let (mut session, log) = sabotaged_session(Tamper {
        retval: Some(42),
        delay_exit: Some(delay),
        ..Tamper::default()
    })?;

    session.spawn(Command::new(vec!["true"])?)?;

    let exit = session.run()?;
    assert_eq!(exit, Exit::Exited(0));

    let log = log.borrow();

    let first_exit = log
        .iter()
        .position(|(phase, _)| matches!(phase, Phase::Exit(_)))
        .expect("no syscall result recorded");

    assert_eq!(log[first_exit].0, Phase::Exit(42));

    // The tracee was parked at that exit stop, so its next entry cannot
    // arrive before the delay has elapsed.
    let next_enter = log[first_exit + 1..]
        .iter()
        .find(|(phase, _)| *phase == Phase::Enter)
        .expect("tracee never re-entered a syscall");

    let gap = next_enter.1.duration_since(log[first_exit].1);
    assert!(gap >= delay, "resumed after only {:?}", gap);

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_tamper_signal_injection() -> Result<()> {
    let (mut session, _log) = sabotaged_session(Tamper {
        signal: Some(Signal::SIGTERM),
        ..Tamper::default()
    })?;

    session.spawn(Command::new(vec!["true"])?)?;

    // The injected signal rides along on the resume from the entry stop
    // and kills the tracee before the call returns.
    let exit = session.run()?;
    assert_eq!(exit, Exit::Signaled(Signal::SIGTERM));
    assert_eq!(exit.code(), 128 + Signal::SIGTERM as i32);

    Ok(())
}

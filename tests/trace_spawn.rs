use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use anyhow::Result;
use ntest::timeout;
use sctrace::{
    AttachMode, Command, Config, EnterDecode, EnterDisposition, Exit, Session, SyscallDecoder,
    SyscallEnter, SyscallExit,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Enter(u64),
    Exit(u64),
}

#[derive(Clone, Default)]
struct Recorder {
    log: Rc<RefCell<Vec<Phase>>>,
}

impl SyscallDecoder for Recorder {
    fn on_enter(&mut self, call: &mut SyscallEnter<'_>) -> sctrace::Result<EnterDecode> {
        self.log.borrow_mut().push(Phase::Enter(call.scno));

        Ok(EnterDecode {
            text: format!("syscall_{}(", call.scno),
            disposition: EnterDisposition::NeedsExit,
            tamper: None,
        })
    }

    fn on_exit(&mut self, call: &mut SyscallExit<'_>) -> sctrace::Result<String> {
        self.log.borrow_mut().push(Phase::Exit(call.scno));

        Ok(format!(") = {}", call.retval))
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn classic_config() -> Config {
    Config {
        attach_mode: Some(AttachMode::Classic),
        ..Config::default()
    }
}

#[test]
#[timeout(10000)]
fn test_trace_true_to_exit() -> Result<()> {
    let recorder = Recorder::default();
    let log = recorder.log.clone();

    let out = SharedBuf::default();
    let text = out.0.clone();

    let mut session = Session::with_decoder(classic_config(), Box::new(recorder));
    session.set_output(Box::new(move |_| {
        Ok(Box::new(out.clone()) as Box<dyn Write>)
    }));

    session.spawn(Command::new(vec!["true"])?)?;

    let exit = session.run()?;

    assert_eq!(exit, Exit::Exited(0));
    assert_eq!(exit.code(), 0);
    assert!(session.registry().is_empty());

    // Every result half pairs with the immediately preceding entry half; a
    // trailing unpaired entry is the call that never returned (exit_group).
    let log = log.borrow();
    assert!(!log.is_empty());

    let mut open: Option<u64> = None;

    for phase in log.iter() {
        match *phase {
            Phase::Enter(scno) => {
                assert_eq!(open, None, "entry while another call is open");
                open = Some(scno);
            },
            Phase::Exit(scno) => {
                assert_eq!(open, Some(scno), "result half without matching entry");
                open = None;
            },
        }
    }

    let text = text.borrow();
    let text = String::from_utf8_lossy(&text);
    assert!(text.contains("+++ exited with 0 +++"), "trace text: {}", text);

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_spawn_runs_named_program() -> Result<()> {
    let mut session = Session::new(classic_config());
    session.set_output(Box::new(|_| {
        Ok(Box::new(io::sink()) as Box<dyn Write>)
    }));

    session.spawn(Command::new(vec!["false"])?)?;

    let exit = session.run()?;

    // Only the named program produces this exit code; a failed exec would
    // surface as something else entirely.
    assert_eq!(exit, Exit::Exited(1));

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_two_tracees_to_exit() -> Result<()> {
    let mut session = Session::new(classic_config());
    session.set_output(Box::new(|_| {
        Ok(Box::new(io::sink()) as Box<dyn Write>)
    }));

    let first = session.spawn(Command::new(vec!["true"])?)?;
    let second = session.spawn(Command::new(vec!["true"])?)?;

    assert_ne!(first, second);
    assert_eq!(session.registry().len(), 2);

    let exit = session.run()?;

    // Both tracees are traced to completion; the last death is reported.
    assert_eq!(exit, Exit::Exited(0));
    assert!(session.registry().is_empty());

    Ok(())
}

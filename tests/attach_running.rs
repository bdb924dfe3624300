use std::io::{self, Write};
use std::process::Command as StdCommand;

use anyhow::Result;
use ntest::timeout;
use sctrace::{AttachMode, Config, Exit, Pid, Session};

fn sink_session(config: Config) -> Session {
    let mut session = Session::new(config);
    session.set_output(Box::new(|_| {
        Ok(Box::new(io::sink()) as Box<dyn Write>)
    }));

    session
}

#[test]
#[timeout(10000)]
fn test_attach_to_running_then_interrupt() -> Result<()> {
    let mut child = StdCommand::new("sleep").arg("60").spawn()?;
    let pid = Pid::from_raw(child.id() as i32);

    let config = Config {
        attach_mode: Some(AttachMode::Classic),
        ..Config::default()
    };

    let mut session = sink_session(config);

    session.attach(pid)?;
    assert_eq!(session.registry().len(), 1);

    // Request shutdown before entering the loop; the session must detach
    // the blocked tracee and report the interrupt.
    session.interrupt_handle().interrupt();

    let exit = session.run()?;

    assert_eq!(exit, Exit::Interrupted);
    assert_eq!(exit.code(), 0);
    assert!(session.registry().is_empty());

    child.kill()?;
    child.wait()?;

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_attach_to_missing_process_fails() {
    let config = Config {
        attach_mode: Some(AttachMode::Classic),
        follow_forks: false,
        ..Config::default()
    };

    let mut session = sink_session(config);

    // A pid from outside the valid range cannot be attached.
    let res = session.attach(Pid::from_raw(i32::MAX));

    assert!(res.is_err());
    assert!(session.registry().is_empty());
}

#[test]
#[timeout(10000)]
fn test_probe_selects_a_mode() {
    // Either answer is valid; probing must not hang, error, or leak a child.
    let mode = AttachMode::probe();

    assert!(matches!(mode, AttachMode::Classic | AttachMode::Seize));
}

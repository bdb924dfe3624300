use std::io::{self, Write};

use anyhow::Result;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use ntest::timeout;
use sctrace::{AttachMode, Command, Config, Exit, Session};

#[test]
#[timeout(10000)]
fn test_syscall_limit_detaches() -> Result<()> {
    let config = Config {
        attach_mode: Some(AttachMode::Classic),
        syscall_limit: Some(5),
        ..Config::default()
    };

    let mut session = Session::new(config);
    session.set_output(Box::new(|_| {
        Ok(Box::new(io::sink()) as Box<dyn Write>)
    }));

    // Program startup alone reaches the limit long before the sleep.
    let pid = session.spawn(Command::new(vec!["sleep", "60"])?)?;

    let exit = session.run()?;

    assert_eq!(exit, Exit::LimitReached);
    assert_eq!(exit.code(), 0);
    assert!(session.registry().is_empty());

    // The detached tracee is still ours to reap.
    kill(pid, Signal::SIGKILL)?;
    waitpid(pid, None)?;

    Ok(())
}

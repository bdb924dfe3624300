use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use nix::sys::signal::{kill, Signal};
use ntest::timeout;
use sctrace::{AttachMode, Command, Config, Exit, Session};

// A tracee dying at an arbitrary point must surface as a normal death
// report, never as a tracer error: resume requests that race the death are
// treated as successful, and the kernel's notification is authoritative.
#[test]
#[timeout(10000)]
fn test_sigkill_mid_trace() -> Result<()> {
    let config = Config {
        attach_mode: Some(AttachMode::Classic),
        ..Config::default()
    };

    let mut session = Session::new(config);
    session.set_output(Box::new(|_| {
        Ok(Box::new(io::sink()) as Box<dyn Write>)
    }));

    let pid = session.spawn(Command::new(vec!["sleep", "60"])?)?;

    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        let _ = kill(pid, Signal::SIGKILL);
    });

    let exit = session.run()?;

    killer.join().unwrap();

    assert_eq!(exit, Exit::Signaled(Signal::SIGKILL));
    assert_eq!(exit.code(), 128 + 9);
    assert!(session.registry().is_empty());

    Ok(())
}

use std::env;

use sctrace::{Command, Config, Session};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<String> = env::args().skip(1).collect();

    if argv.is_empty() {
        eprintln!("usage: trace <command> [args...]");
        std::process::exit(2);
    }

    let cmd = Command::new(argv)?;

    let mut session = Session::new(Config::default());
    session.spawn(cmd)?;

    let exit = session.run()?;

    std::process::exit(exit.code());
}

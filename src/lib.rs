#[macro_use]
pub mod error;

pub mod arch;
pub mod attach;
pub mod cmd;
pub mod decoder;
pub mod event;
pub mod session;
pub mod tcb;

mod delay;
mod detach;
mod dispatch;
mod mux;

pub use arch::{Personality, Registers};
pub use attach::AttachMode;
pub use cmd::Command;
pub use decoder::{
    EnterDecode, EnterDisposition, OutputFactory, RawDecoder, SeccompAdvisor, SyscallDecoder,
    SyscallEnter, SyscallExit, Tamper,
};
pub use dispatch::Flow;
pub use error::{Error, Result};
pub use event::{CloneKind, ExitKind, TraceEvent};
pub use session::{Config, Exit, InterruptHandle, Resume, Session, FOLLOW_OPTIONS, REQUIRED_OPTIONS};
pub use tcb::{Registry, Siginfo, Tcb, TcbFlags, TcbId, WaitData};

pub use nix::sys::ptrace::Options;
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;

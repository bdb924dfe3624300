use std::env;
use std::ffi::{CString, NulError, OsStr};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use nix::{
    sys::{
        ptrace,
        signal::{raise, Signal},
    },
    unistd::{fork, ForkResult, Pid},
};

use crate::error::Error;

// `execv()` does no `PATH` search, so a bare program name is resolved
// against the environment up front, pre-fork. A name that resolves to
// nothing is kept as-is; the exec call reports the failure.
fn resolve_exe(name: &CString) -> CString {
    let bytes = name.as_bytes();

    if bytes.contains(&b'/') {
        return name.clone();
    }

    if let Some(path) = env::var_os("PATH") {
        for dir in env::split_paths(&path) {
            let candidate = dir.join(OsStr::from_bytes(bytes));

            if candidate.is_file() {
                if let Ok(exe) = CString::new(candidate.into_os_string().into_vec()) {
                    return exe;
                }
            }
        }
    }

    name.clone()
}

/// Command to spawn as a child process to be traced.
#[derive(Clone, Debug)]
pub struct Command {
    /// Resolved path of the program image, for `execv()`.
    exe: CString,
    /// Argument vector to pass to `execv()`.
    argv: Vec<CString>,
}

impl Command {
    pub fn new(argv: Vec<impl Into<Vec<u8>>>) -> Result<Self, NulError> {
        if argv.is_empty() {
            panic!("Command exe required");
        }

        // Ensure we own NUL-terminated strings for the foreign exec call.
        //
        // We're heap-allocating, so always do this before forking.
        let argv: Result<Vec<_>, _> = argv
            .into_iter()
            .map(CString::new)
            .collect();
        let argv = argv?;

        let exe = resolve_exe(&argv[0]);

        Ok(Self { exe, argv })
    }

    /// Fork and exec a child process determined by `self.argv`.
    ///
    /// If `trace_me`, the child sets itself as a tracee of the parent before
    /// stopping. Either way it raises `SIGSTOP` pre-exec, so the parent can
    /// observe (classic) or seize (seize-style) it without a race.
    pub fn fork_exec(self, trace_me: bool) -> Result<Pid, Error> {
        // Heap-allocates, must occur pre-fork.
        let exe = self.exe.as_ptr();
        let argv = self.argv();

        match unsafe { fork() }? {
            ForkResult::Child => {
                // If any post-fork call fails, `panic`, since `?` may call
                // `malloc` via `Into`, which is not async-signal-safe.

                if trace_me && ptrace::traceme().is_err() {
                    panic!("Unable to request trace");
                }

                if raise(Signal::SIGSTOP).is_err() {
                    panic!("Unable to raise SIGSTOP");
                }

                // Use unsafe `libc::execv`, because the `nix` wrapper heap-
                // allocates a `Vec` internally, which is not async-signal-safe.
                unsafe {
                    if 0 != libc::execv(exe, argv.as_ptr()) {
                        panic!("Unable to exec tracee");
                    }
                }

                unreachable!();
            },
            ForkResult::Parent { child } => {
                Ok(child)
            },
        }
    }

    // Construct NUL-terminated arguments for `execv`. We heap-allocate to
    // return a `Vec`, and so must do this before calling `fork()`.
    fn argv(&self) -> Vec<*const libc::c_char> {
        let mut argv: Vec<_> = self.argv
            .iter()
            .map(|s| s.as_ptr())
            .collect();
        argv.push(std::ptr::null());
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_names_resolve_against_path() {
        let cmd = Command::new(vec!["true"]).unwrap();

        assert!(cmd.exe.as_bytes().contains(&b'/'));
        assert!(cmd.exe.as_bytes().ends_with(b"/true"));
    }

    #[test]
    fn explicit_paths_are_kept() {
        let cmd = Command::new(vec!["./does/not/exist"]).unwrap();

        assert_eq!(cmd.exe.as_bytes(), b"./does/not/exist");

        let cmd = Command::new(vec!["/bin/true", "ignored"]).unwrap();

        assert_eq!(cmd.exe.as_bytes(), b"/bin/true");
    }

    #[test]
    fn unresolvable_names_are_kept_for_exec_to_report() {
        let cmd = Command::new(vec!["no-such-program-here"]).unwrap();

        assert_eq!(cmd.exe.as_bytes(), b"no-such-program-here");
    }
}

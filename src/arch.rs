//! Personality (ABI) identification and raw register access for tracees.

use nix::unistd::Pid;

use crate::error::{Result, ResultExt};

#[cfg(target_arch = "x86_64")]
use nix::sys::ptrace;

#[cfg(target_arch = "aarch64")]
use nix::errno::Errno;

/// Register state of a tracee.
#[cfg(target_arch = "x86_64")]
pub type Registers = libc::user_regs_struct;

/// Register state of a tracee.
#[cfg(target_arch = "aarch64")]
pub type Registers = user_pt_regs;

/// Linux constant defined in `include/uapi/linux/elf.h`.
#[cfg(target_arch = "aarch64")]
const NT_PRSTATUS: i32 = 0x1;

#[cfg(target_arch = "aarch64")]
pub(crate) const PTRACE_GETREGSET: u32 = 0x4204;

#[cfg(target_arch = "aarch64")]
pub(crate) const PTRACE_SETREGSET: u32 = 0x4205;

/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/arch/arm64/include/uapi/asm/ptrace.h#88).
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[allow(non_camel_case_types)]
pub struct user_pt_regs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

/// The ABI a tracee currently operates under: calling convention, word size,
/// and syscall table.
///
/// A tracee's personality can change at runtime, e.g. by exec'ing into an
/// image built for a different ABI. It is re-detected from register state on
/// each syscall entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Personality {
    /// The native 64-bit ABI.
    Default,
    /// The 32-bit compat ABI.
    Compat32,
    /// The x32 ILP32 ABI on x86_64.
    X32,
}

impl Default for Personality {
    fn default() -> Self {
        Personality::Default
    }
}

impl Personality {
    /// Word size of pointers and long arguments under this personality.
    pub fn word_size(&self) -> usize {
        match self {
            Personality::Default => 8,
            Personality::Compat32 | Personality::X32 => 4,
        }
    }
}

/// `__X32_SYSCALL_BIT` from `arch/x86/include/uapi/asm/unistd.h`.
#[cfg(target_arch = "x86_64")]
const X32_SYSCALL_BIT: u64 = 0x4000_0000;

/// Segment selector for 32-bit compat code, `arch/x86/include/asm/segment.h`.
#[cfg(target_arch = "x86_64")]
const USER32_CS: u64 = 0x23;

/// `PSR_MODE32_BIT` from `arch/arm64/include/uapi/asm/ptrace.h`.
#[cfg(target_arch = "aarch64")]
const PSR_MODE32_BIT: u64 = 0x10;

#[cfg(target_arch = "x86_64")]
pub fn detect_personality(regs: &Registers) -> Personality {
    if regs.cs == USER32_CS {
        Personality::Compat32
    } else if regs.orig_rax & X32_SYSCALL_BIT != 0 {
        Personality::X32
    } else {
        Personality::Default
    }
}

#[cfg(target_arch = "aarch64")]
pub fn detect_personality(regs: &Registers) -> Personality {
    if regs.pstate & PSR_MODE32_BIT != 0 {
        Personality::Compat32
    } else {
        Personality::Default
    }
}

/// The syscall number selected at the current syscall-stop.
#[cfg(target_arch = "x86_64")]
pub fn syscall_number(regs: &Registers) -> u64 {
    regs.orig_rax & !X32_SYSCALL_BIT
}

/// The syscall number selected at the current syscall-stop.
#[cfg(target_arch = "aarch64")]
pub fn syscall_number(regs: &Registers) -> u64 {
    regs.regs[8]
}

#[cfg(target_arch = "x86_64")]
pub fn syscall_args(regs: &Registers) -> [u64; 6] {
    [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9]
}

#[cfg(target_arch = "aarch64")]
pub fn syscall_args(regs: &Registers) -> [u64; 6] {
    [
        regs.regs[0],
        regs.regs[1],
        regs.regs[2],
        regs.regs[3],
        regs.regs[4],
        regs.regs[5],
    ]
}

/// The raw return value at a syscall-exit-stop. Values in `-4095..0` are
/// negated errnos.
#[cfg(target_arch = "x86_64")]
pub fn return_value(regs: &Registers) -> i64 {
    regs.rax as i64
}

/// The raw return value at a syscall-exit-stop. Values in `-4095..0` are
/// negated errnos.
#[cfg(target_arch = "aarch64")]
pub fn return_value(regs: &Registers) -> i64 {
    regs.regs[0] as i64
}

#[cfg(target_arch = "x86_64")]
pub fn set_return_value(regs: &mut Registers, value: i64) {
    regs.rax = value as u64;
}

#[cfg(target_arch = "aarch64")]
pub fn set_return_value(regs: &mut Registers, value: i64) {
    regs.regs[0] = value as u64;
}

#[cfg(target_arch = "x86_64")]
pub fn program_counter(regs: &Registers) -> u64 {
    regs.rip
}

#[cfg(target_arch = "aarch64")]
pub fn program_counter(regs: &Registers) -> u64 {
    regs.pc
}

#[cfg(target_arch = "x86_64")]
pub fn read_registers(pid: Pid) -> Result<Registers> {
    ptrace::getregs(pid).died_if_esrch(pid)
}

#[cfg(target_arch = "aarch64")]
pub fn read_registers(pid: Pid) -> Result<Registers> {
    let mut data = std::mem::MaybeUninit::uninit();
    let mut rv = libc::iovec {
        iov_base: &mut data as *mut _ as *mut libc::c_void,
        iov_len: std::mem::size_of::<Registers>(),
    };

    let res = unsafe {
        libc::ptrace(
            PTRACE_GETREGSET,
            pid.as_raw(),
            NT_PRSTATUS,
            &mut rv as *mut _ as *mut libc::c_void,
        )
    };

    Errno::result(res).died_if_esrch(pid)?;

    Ok(unsafe { data.assume_init() })
}

#[cfg(target_arch = "x86_64")]
pub fn write_registers(pid: Pid, regs: Registers) -> Result<()> {
    ptrace::setregs(pid, regs).died_if_esrch(pid)
}

#[cfg(target_arch = "aarch64")]
pub fn write_registers(pid: Pid, regs: Registers) -> Result<()> {
    let mut rv = libc::iovec {
        iov_base: &regs as *const _ as *const libc::c_void as *mut libc::c_void,
        iov_len: std::mem::size_of::<Registers>(),
    };

    let res = unsafe {
        libc::ptrace(
            PTRACE_SETREGSET,
            pid.as_raw(),
            NT_PRSTATUS,
            &mut rv as *mut _ as *mut libc::c_void,
        )
    };

    Errno::result(res).died_if_esrch(pid)?;

    Ok(())
}

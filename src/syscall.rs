/// This file contains the logic for issuing a single call on behalf of a test
/// program, either through a pseudo-call routine we implement ourselves or
/// straight through the kernel's syscall gate
use crate::misc::set_errno;

/// Argument slots a call can receive
pub const MAX_ARGS: usize = 9;

/// Argument slots the raw syscall gate takes
pub const MAX_RAW_ARGS: usize = 6;

/// A pseudo-call implemented in user space
pub type CallFn = fn(isize, isize, isize, isize, isize, isize, isize, isize, isize) -> isize;

#[derive(Clone, Copy)]
pub enum CallTarget {
    Custom(CallFn),     // Invoked directly with all nine slots
    Raw(libc::c_long),  // Kernel syscall number
}

/// Describes one kernel call; immutable once the program is decoded
#[derive(Clone, Copy)]
pub struct Call {
    pub name: &'static str,
    pub target: CallTarget,
}

impl Call {
    pub const fn raw(name: &'static str, sys_nr: libc::c_long) -> Self {
        Call {
            name,
            target: CallTarget::Raw(sys_nr),
        }
    }

    pub const fn custom(name: &'static str, call: CallFn) -> Self {
        Call {
            name,
            target: CallTarget::Custom(call),
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.target {
            CallTarget::Custom(_) => write!(f, "{} (pseudo)", self.name),
            CallTarget::Raw(nr) => write!(f, "{} (nr {})", self.name, nr),
        }
    }
}

/// Run `call` and hand back its raw result, errors are -1 with errno set.
/// `flag_coverage` says whether the whole run collects coverage
pub fn execute_syscall(call: &Call, args: &[isize; MAX_ARGS], flag_coverage: bool) -> isize {
    let a = args;
    let sys_nr = match call.target {
        CallTarget::Custom(func) => {
            return func(a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8]);
        }
        CallTarget::Raw(sys_nr) => sys_nr,
    };

    let res = unsafe {
        libc::syscall(
            sys_nr,
            a[0] as libc::c_long,
            a[1] as libc::c_long,
            a[2] as libc::c_long,
            a[3] as libc::c_long,
            a[4] as libc::c_long,
            a[5] as libc::c_long,
        )
    } as isize;

    // Some prctl commands (PR_GET_TIMERSLACK and friends) don't follow the
    // usual return convention and can leave any errno behind, which confuses
    // fallback coverage
    if !flag_coverage && res == -1 && call.name == "prctl" {
        set_errno(libc::EINVAL);
    }

    res
}

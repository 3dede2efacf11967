/// This file contains miscellaneous helper functions and the console macros.
/// Everything goes to stderr, stdout belongs to the supervisor pipe

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;

// Gates `debug!` output
static VERBOSE: AtomicBool = AtomicBool::new(false);

#[macro_export]
macro_rules! prompt {
    () => ({
        eprint!("\x1b[1;35m\u{2726}covexec\u{2726}\x1b[0m\n");
    });
    ($($arg:tt)*) => ({
        eprint!("\x1b[1;35m\u{2726}covexec\u{2726}\x1b[0m ");
        eprintln!($($arg)*);
    });
}

#[macro_export]
macro_rules! prompt_warn {
    () => ({
        eprint!("\x1b[1;33m\u{2726}covexec\u{2726}\x1b[0m\n");
    });
    ($($arg:tt)*) => ({
        eprint!("\x1b[1;33m\u{2726}covexec\u{2726}\x1b[0m ");
        eprintln!($($arg)*);
    });
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => ({
        if $crate::misc::is_verbose() {
            eprint!("\x1b[1;36m\u{2726}covexec\u{2726}\x1b[0m ");
            eprintln!($($arg)*);
        }
    });
}

// Report the error with its stage and leave through `doexit`, never returns
#[macro_export]
macro_rules! fatal {
    ($err:expr) => {
        {
            let err = $err;
            eprint!("\n\x1b[1;31mfatal\x1b[0m {} ", $crate::misc::timestamp());
            err.display();
            $crate::exit::doexit(err.status());
        }
    };
}

pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

// Wall-clock stamp for diagnostics
pub fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

// Wrappers for errno access to tuck unsafes away
pub fn get_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub fn set_errno(errno: i32) {
    unsafe { *libc::__errno_location() = errno }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trips_through_thread_slot() {
        set_errno(libc::ENOENT);
        assert_eq!(get_errno(), libc::ENOENT);
        assert_eq!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::ENOENT)
        );
    }

    #[test]
    fn verbose_flag_toggles() {
        set_verbose(true);
        assert!(is_verbose());
        set_verbose(false);
        assert!(!is_verbose());
    }
}

//! The last-resort way out of the executor.
//!
//! Normal exit cannot be trusted here. libc's `_exit` runs its own fallback
//! when `exit_group` fails (a `hlt`), and a generated seccomp filter can in
//! fact forbid `exit_group`. If we then fault, the crash handler runs again
//! and we recurse while the shared output region is being written. So we ask
//! the kernel directly, and if we are still alive afterwards we spin until
//! the supervisor kills us. The spin is not the recovery mechanism, the
//! supervisor's kill is.

use std::sync::atomic::{compiler_fence, Ordering};

/// Terminate the whole process with `status`. Safe to call from signal
/// handlers, touches no executor state
pub fn doexit(status: i32) -> ! {
    unsafe {
        libc::syscall(libc::SYS_exit_group, status as libc::c_long);
    }
    spin_forever()
}

/// Terminate only the calling thread with `status`
pub fn doexit_thread(status: i32) -> ! {
    unsafe {
        libc::syscall(libc::SYS_exit, status as libc::c_long);
    }
    spin_forever()
}

// The volatile counter and the fence keep the optimizer from treating the
// code after the syscall as dead
#[inline(never)]
fn spin_forever() -> ! {
    let mut i: u32 = 0;
    loop {
        unsafe {
            let cur = std::ptr::read_volatile(&i);
            std::ptr::write_volatile(&mut i, cur.wrapping_add(1));
        }
        compiler_fence(Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    const CHILD_ENV: &str = "COVEXEC_EXIT_CHILD";

    #[test]
    fn doexit_reports_status_to_parent() {
        if std::env::var_os(CHILD_ENV).is_some() {
            doexit(42);
        }

        let exe = std::env::current_exe().unwrap();
        let status = Command::new(exe)
            .args(["--exact", "exit::tests::doexit_reports_status_to_parent"])
            .args(["--test-threads=1", "--nocapture"])
            .env(CHILD_ENV, "1")
            .status()
            .unwrap();

        assert_eq!(status.code(), Some(42));
    }

    const THREAD_CHILD_ENV: &str = "COVEXEC_EXIT_THREAD_CHILD";

    // Ends a worker with `doexit_thread`, waits for its task to disappear and
    // then exits the whole process with a status only the survivor can pick
    fn exit_one_thread_then_process() -> ! {
        let (tx, rx) = std::sync::mpsc::channel();
        let _worker = std::thread::spawn(move || {
            let _ = tx.send(unsafe { libc::gettid() });
            doexit_thread(1);
        });

        let Ok(tid) = rx.recv() else {
            doexit(2);
        };

        let task = format!("/proc/self/task/{}", tid);
        for _ in 0..1000 {
            if !std::path::Path::new(&task).exists() {
                doexit(7);
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        doexit(3)
    }

    #[test]
    fn doexit_thread_leaves_the_process_running() {
        if std::env::var_os(THREAD_CHILD_ENV).is_some() {
            exit_one_thread_then_process();
        }

        let exe = std::env::current_exe().unwrap();
        let status = Command::new(exe)
            .args(["--exact", "exit::tests::doexit_thread_leaves_the_process_running"])
            .args(["--test-threads=1", "--nocapture"])
            .env(THREAD_CHILD_ENV, "1")
            .status()
            .unwrap();

        assert_eq!(status.code(), Some(7));
    }
}

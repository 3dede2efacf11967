//! In-target execution core of a kernel fuzzer: runs individual calls inside
//! a disposable process while collecting kcov coverage for them.

pub mod misc;
pub mod err;
pub mod exit;
pub mod config;
pub mod bitness;
pub mod handle;
pub mod kcov;
pub mod cover;
pub mod syscall;
pub mod features;
pub mod context;

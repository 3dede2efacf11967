/// This file contains the logic for figuring out whether the running kernel
/// is 64-bit, which is not the same question as whether we are
///
/// uname's machine string is assembled in involved ways and can be overridden
/// at kernel build time, so we don't trust it. Instead we look at how wide
/// the addresses in the kernel symbol table are printed
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::debug;

// Exported kernel symbols, one "address type name" per line
pub const KALLSYMS_PATH: &str = "/proc/kallsyms";

// How much of the first line we look at
const PREFIX_LEN: usize = 16;

// Column of the separator when addresses are printed with 8 hex digits
const NARROW_SEPARATOR: usize = 8;

/// Returns true if the kernel underneath us uses 64-bit pointers
pub fn detect_kernel_bitness() -> bool {
    detect_kernel_bitness_with(KALLSYMS_PATH)
}

/// Same as `detect_kernel_bitness` but reads the symbol table from `path`
pub fn detect_kernel_bitness_with<P: AsRef<Path>>(path: P) -> bool {
    // A 64-bit binary cannot be running on a 32-bit kernel
    if std::mem::size_of::<*const u8>() == 8 {
        debug!("detected 64-bit kernel (64-bit executor)");
        return true;
    }

    let wide = symbols_are_wide(path);
    debug!("detected {}-bit kernel", if wide { 64 } else { 32 });
    wide
}

/// Inspect the first line of a symbol table. Unreadable or short tables
/// count as wide
pub fn symbols_are_wide<P: AsRef<Path>>(path: P) -> bool {
    let Ok(mut file) = File::open(path) else {
        return true;
    };

    let mut buf = [0u8; PREFIX_LEN];
    if file.read_exact(&mut buf).is_err() {
        return true;
    }

    !matches!(buf[NARROW_SEPARATOR], b' ' | b'\t')
}

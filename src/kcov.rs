//! Kernel coverage (kcov) ABI and the device we talk to.
//!
//! The device is opened by path, sized with `KCOV_INIT_TRACE`, mapped shared
//! into our address space and then switched on with `KCOV_ENABLE` (for the
//! calling task) or `KCOV_REMOTE_ENABLE` (for background kernel threads that
//! carry one of our remote handles).
//!
//! The remote-enable argument has two layouts. A 32-bit kernel aligns its
//! 64-bit fields to 4 bytes, a 64-bit kernel to 8. Which one we pass depends
//! on the kernel, not on how we were compiled, so both layouts exist side by
//! side and are picked at runtime. Their sizes are part of the ioctl number
//! and are checked at compile time.

use std::ffi::CString;

use crate::err::ExecErr;
use crate::{debug, prompt_warn};

/// Record program counters
pub const KCOV_TRACE_PC: u32 = 0;

/// Record comparison operands
pub const KCOV_TRACE_CMP: u32 = 1;

/// Where debugfs exposes kcov
pub const KCOV_PATH: &str = "/sys/kernel/debug/kcov";

const DEBUGFS_MOUNT: &str = "/sys/kernel/debug";

// ioctl encoding, asm-generic layout: 2 direction bits over 14 size bits
#[cfg(not(any(
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "mips",
    target_arch = "mips64",
    target_arch = "sparc",
    target_arch = "sparc64"
)))]
mod ioc_bits {
    pub const NONE: u32 = 0;
    pub const WRITE: u32 = 1;
    pub const READ: u32 = 2;
    pub const SIZE_BITS: u32 = 14;
}

// powerpc, mips and sparc use 3 direction bits over 13 size bits
#[cfg(any(
    target_arch = "powerpc",
    target_arch = "powerpc64",
    target_arch = "mips",
    target_arch = "mips64",
    target_arch = "sparc",
    target_arch = "sparc64"
))]
mod ioc_bits {
    pub const NONE: u32 = 1;
    pub const READ: u32 = 2;
    pub const WRITE: u32 = 4;
    pub const SIZE_BITS: u32 = 13;
}

use ioc_bits::{NONE as IOC_NONE, READ as IOC_READ, WRITE as IOC_WRITE};

const IOC_SIZE_SHIFT: u32 = 16;
const IOC_DIR_SHIFT: u32 = IOC_SIZE_SHIFT + ioc_bits::SIZE_BITS;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> libc::Ioctl {
    ((dir << IOC_DIR_SHIFT) | ((size as u32) << IOC_SIZE_SHIFT) | ((ty as u32) << 8) | nr as u32)
        as libc::Ioctl
}

pub const KCOV_INIT_TRACE32: libc::Ioctl = ioc(IOC_READ, b'c', 1, 4);
pub const KCOV_INIT_TRACE64: libc::Ioctl = ioc(IOC_READ, b'c', 1, 8);
pub const KCOV_ENABLE: libc::Ioctl = ioc(IOC_NONE, b'c', 100, 0);
pub const KCOV_DISABLE: libc::Ioctl = ioc(IOC_NONE, b'c', 101, 0);
pub const KCOV_REMOTE_ENABLE32: libc::Ioctl =
    ioc(IOC_WRITE, b'c', 102, std::mem::size_of::<NarrowRemoteArg>());
pub const KCOV_REMOTE_ENABLE64: libc::Ioctl =
    ioc(IOC_WRITE, b'c', 102, std::mem::size_of::<WideRemoteArg>());

/// Remote-enable header as a 32-bit kernel lays it out: 64-bit fields only
/// 4-byte aligned
#[repr(C, packed(4))]
#[derive(Clone, Copy, Debug, Default)]
pub struct NarrowRemoteArg {
    pub trace_mode: u32,
    pub area_size: u32,
    pub num_handles: u32,
    pub common_handle: u64,
}

/// A u64 that is 8-byte aligned even on targets where u64 is not
#[repr(C, align(8))]
#[derive(Clone, Copy, Debug, Default)]
pub struct AlignedU64(pub u64);

/// Remote-enable header as a 64-bit kernel lays it out
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct WideRemoteArg {
    pub trace_mode: u32,
    pub area_size: u32,
    pub num_handles: u32,
    pub common_handle: AlignedU64,
}

const _: () = assert!(std::mem::size_of::<NarrowRemoteArg>() == 20);
const _: () = assert!(std::mem::size_of::<WideRemoteArg>() == 24);

// The kernel reads `num_handles` handles right after the header

#[repr(C, packed(4))]
#[derive(Clone, Copy, Debug, Default)]
pub struct NarrowRemoteRequest {
    pub arg: NarrowRemoteArg,
    pub handles: [u64; 1],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct WideRemoteRequest {
    pub arg: WideRemoteArg,
    pub handles: [AlignedU64; 1],
}

const _: () = assert!(std::mem::size_of::<NarrowRemoteRequest>() == 28);
const _: () = assert!(std::mem::size_of::<WideRemoteRequest>() == 32);

/// Layout-independent description of a remote registration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteRequest {
    pub trace_mode: u32,
    pub area_size: u32,
    pub common_handle: u64,
    pub handle: u64,
}

impl RemoteRequest {
    pub fn narrow(&self) -> NarrowRemoteRequest {
        NarrowRemoteRequest {
            arg: NarrowRemoteArg {
                trace_mode: self.trace_mode,
                area_size: self.area_size,
                num_handles: 1,
                common_handle: self.common_handle,
            },
            handles: [self.handle],
        }
    }

    pub fn wide(&self) -> WideRemoteRequest {
        WideRemoteRequest {
            arg: WideRemoteArg {
                trace_mode: self.trace_mode,
                area_size: self.area_size,
                num_handles: 1,
                common_handle: AlignedU64(self.common_handle),
            },
            handles: [AlignedU64(self.handle)],
        }
    }
}

/// The operations the coverage engine needs from a kcov-like device. The
/// real one is `KcovDevice`, tests plug in their own
pub trait CoverDevice: Send {
    /// Size the trace buffer to `entries` entries of the kernel's width
    fn init_trace(&mut self, entries: usize, wide: bool) -> Result<(), ExecErr>;

    /// Map `len` bytes of the trace buffer shared, returns its address
    fn map(&mut self, len: usize) -> Result<usize, ExecErr>;

    /// Start tracing the calling task in `mode`
    fn enable(&mut self, mode: u32) -> Result<(), ExecErr>;

    /// Start collecting from background kernel threads carrying our handles
    fn remote_enable(&mut self, req: &RemoteRequest, wide: bool) -> Result<(), ExecErr>;

    fn disable(&mut self) -> Result<(), ExecErr>;
}

/// A real kcov file descriptor
#[derive(Debug)]
pub struct KcovDevice {
    fd: i32,
}

impl KcovDevice {
    /// Open the device at `path`. If a debugfs node is missing we mount
    /// debugfs once and retry
    pub fn open(path: &str) -> Result<Self, ExecErr> {
        let Ok(c_path) = CString::new(path) else {
            return Err(ExecErr::setup("Invalid cover device path"));
        };

        let mut fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd == -1
            && crate::misc::get_errno() == libc::ENOENT
            && path.starts_with(DEBUGFS_MOUNT)
        {
            prompt_warn!("Failed to open '{}', mounting debugfs and retrying", path);
            mount_debugfs();
            fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        }

        if fd == -1 {
            return Err(ExecErr::setup(&format!("Failed to open cover device '{}'", path))
                .with_errno());
        }

        debug!("opened cover device '{}' as fd {}", path, fd);
        Ok(KcovDevice { fd })
    }
}

impl CoverDevice for KcovDevice {
    fn init_trace(&mut self, entries: usize, wide: bool) -> Result<(), ExecErr> {
        let cmd = if wide { KCOV_INIT_TRACE64 } else { KCOV_INIT_TRACE32 };
        let result = unsafe { libc::ioctl(self.fd, cmd, entries as libc::c_ulong) };
        if result != 0 {
            return Err(ExecErr::setup("Cover init trace write failed").with_errno());
        }

        Ok(())
    }

    fn map(&mut self, len: usize) -> Result<usize, ExecErr> {
        let result = unsafe {
            libc::mmap(
                std::ptr::null_mut::<libc::c_void>(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                0,
            )
        };

        if result == libc::MAP_FAILED {
            return Err(ExecErr::setup("Cover mmap failed").with_errno());
        }

        Ok(result as usize)
    }

    fn enable(&mut self, mode: u32) -> Result<(), ExecErr> {
        let result = unsafe { libc::ioctl(self.fd, KCOV_ENABLE, mode as libc::c_ulong) };
        if result != 0 {
            return Err(
                ExecErr::feature(&format!("Cover enable write trace failed, mode={}", mode))
                    .with_errno(),
            );
        }

        Ok(())
    }

    fn remote_enable(&mut self, req: &RemoteRequest, wide: bool) -> Result<(), ExecErr> {
        let result = if wide {
            let arg = req.wide();
            unsafe { libc::ioctl(self.fd, KCOV_REMOTE_ENABLE64, &arg as *const WideRemoteRequest) }
        } else {
            let arg = req.narrow();
            unsafe {
                libc::ioctl(self.fd, KCOV_REMOTE_ENABLE32, &arg as *const NarrowRemoteRequest)
            }
        };

        if result != 0 {
            return Err(ExecErr::feature("Remote cover enable write trace failed").with_errno());
        }

        Ok(())
    }

    fn disable(&mut self) -> Result<(), ExecErr> {
        let result = unsafe { libc::ioctl(self.fd, KCOV_DISABLE, 0 as libc::c_ulong) };
        if result != 0 {
            return Err(ExecErr::execution("Cover disable failed").with_errno());
        }

        Ok(())
    }
}

impl Drop for KcovDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

// Mount debugfs where kcov lives, EBUSY means it already is
fn mount_debugfs() {
    let (Ok(target), Ok(fstype)) = (CString::new(DEBUGFS_MOUNT), CString::new("debugfs")) else {
        return;
    };

    let result = unsafe {
        libc::mount(
            fstype.as_ptr(),
            target.as_ptr(),
            fstype.as_ptr(),
            0,
            std::ptr::null(),
        )
    };

    if result != 0 && crate::misc::get_errno() != libc::EBUSY {
        debug!("debugfs mount failed: {}", std::io::Error::last_os_error());
    }
}

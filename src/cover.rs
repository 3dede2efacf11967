//! This file contains all of the logic pertaining to kernel code coverage
//! feedback.
//!
//! A `Cover` owns one kcov device and the buffer the kernel writes into. The
//! first word of the buffer is a live entry counter that the kernel bumps on
//! every trace event, the entries follow it. We zero the counter before a
//! measurement window and read it back afterwards, nothing else writes it.
//!
//! Each thread has at most one primary cover active at a time. The active one
//! is kept in a registry keyed by thread id so that code deep inside call
//! execution can reset it without having the `Cover` at hand. Extra covers
//! belong to background threads and are registered with the kernel under
//! their own remote handles instead.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::thread::ThreadId;

use crate::context::ExecContext;
use crate::err::ExecErr;
use crate::handle::{remote_handle, SUBSYSTEM_COMMON, SUBSYSTEM_USB};
use crate::kcov::{CoverDevice, KcovDevice, RemoteRequest, KCOV_TRACE_CMP, KCOV_TRACE_PC};
use crate::{debug, fatal};

/// Entries in the buffer of a primary cover
pub const COVER_SIZE: usize = 256 << 10;

/// Entries in the buffer of a background (extra) cover
pub const EXTRA_COVER_SIZE: usize = 64 << 10;

// Kernel text and modules on x86_64
const KERNEL_TEXT_START: u64 = 0xffff_ffff_8000_0000;
const KERNEL_TEXT_END: u64 = 0xffff_ffff_ff00_0000;

// Set in a comparison's type when one operand is a compile-time constant
const KCOV_CMP_CONST: u64 = 1;

// Words per comparison record: type, arg1, arg2, pc
const CMP_RECORD_WORDS: usize = 4;

/// Where a cover's buffer lives and how to read it. This is all the registry
/// needs to reset a cover on behalf of its owner
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoverArea {
    addr: usize,     // Start of the shared buffer, the counter
    wide: bool,      // 8-byte entries (64-bit kernel) or 4-byte entries
    capacity: usize, // Number of entries including the counter slot
}

impl CoverArea {
    pub(crate) fn new(addr: usize, wide: bool, capacity: usize) -> Self {
        CoverArea {
            addr,
            wide,
            capacity,
        }
    }

    #[inline]
    pub fn entry_size(&self) -> usize {
        if self.wide { 8 } else { 4 }
    }

    /// One past the last usable byte
    #[inline]
    pub fn end(&self) -> usize {
        self.addr + self.capacity * self.entry_size()
    }

    /// Zero the live counter
    #[inline]
    pub(crate) fn reset(&self) {
        unsafe { std::ptr::write_volatile(self.addr as *mut u64, 0) };
    }

    /// Current value of the live counter
    #[inline]
    pub(crate) fn count(&self) -> usize {
        if self.wide {
            unsafe { std::ptr::read_volatile(self.addr as *const u64) as usize }
        } else {
            unsafe { std::ptr::read_volatile(self.addr as *const u32) as usize }
        }
    }

    // Raw entry at `idx`, widened
    #[inline]
    fn entry(&self, idx: usize) -> u64 {
        debug_assert!(idx < self.capacity);
        if self.wide {
            unsafe { std::ptr::read_volatile((self.addr as *const u64).add(idx)) }
        } else {
            unsafe { std::ptr::read_volatile((self.addr as *const u32).add(idx)) as u64 }
        }
    }

    // Comparison records are made of u64 words whatever the kernel width
    #[inline]
    fn word(&self, idx: usize) -> u64 {
        unsafe { std::ptr::read_volatile((self.addr as *const u64).add(idx)) }
    }

    fn words(&self) -> usize {
        (self.end() - self.addr) / 8
    }
}

// Active primary cover per thread
fn registry() -> &'static Mutex<HashMap<ThreadId, CoverArea>> {
    static ACTIVE: OnceLock<Mutex<HashMap<ThreadId, CoverArea>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn set_active(area: CoverArea) {
    let mut active = registry().lock().unwrap_or_else(|e| e.into_inner());
    active.insert(std::thread::current().id(), area);
}

// Forget `area` under whichever thread enabled it. The cover may be dropped
// on a different thread, and the thread that enabled it may have moved on to
// another cover already
fn clear_active(area: CoverArea) {
    let mut active = registry().lock().unwrap_or_else(|e| e.into_inner());
    active.retain(|_, cur| *cur != area);
}

/// The cover the calling thread last enabled, if any
pub fn active_cover() -> Option<CoverArea> {
    let active = registry().lock().unwrap_or_else(|e| e.into_inner());
    active.get(&std::thread::current().id()).copied()
}

/// Zero the counter of `cov`, or of the calling thread's active cover when
/// none is given. Having neither is an error
pub fn reset(cov: Option<&Cover>) -> Result<(), ExecErr> {
    if let Some(cov) = cov {
        cov.area.reset();
        return Ok(());
    }

    // Hold the registry while writing, a cover is unregistered before it is
    // unmapped
    let active = registry().lock().unwrap_or_else(|e| e.into_inner());
    let Some(area) = active.get(&std::thread::current().id()) else {
        return Err(ExecErr::setup("cover_reset: current_cover == 0"));
    };

    area.reset();
    Ok(())
}

/// Reset the calling thread's active cover, aborting the process if there
/// is none
pub fn reset_current() {
    if let Err(err) = reset(None) {
        fatal!(err);
    }
}

/// One decoded record from comparison-trace mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Comparison {
    pub kind: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub pc: u64,
}

impl Comparison {
    /// Operand size in bytes
    pub fn size(&self) -> usize {
        1 << ((self.kind >> 1) & 3)
    }

    /// One of the operands was a constant in the kernel source
    pub fn is_const(&self) -> bool {
        self.kind & KCOV_CMP_CONST != 0
    }
}

/// One stream of kernel coverage: the device, its shared buffer and the
/// result of the last collection
pub struct Cover {
    device: Box<dyn CoverDevice>,
    area: CoverArea,
    mmap_len: usize,
    pub size: usize, // Entries recorded as of the last `collect`
    extra: bool,     // Background cover registered by remote handle
    comps: bool,     // Enabled in comparison-trace mode
}

impl Cover {
    /// Open the kcov device configured in `ctx` and map its buffer
    pub fn open(ctx: &ExecContext, extra: bool) -> Result<Self, ExecErr> {
        let device = KcovDevice::open(&ctx.cover_device)?;
        Cover::open_with(Box::new(device), ctx.is_kernel_64_bit, extra)
    }

    /// Set up a cover on an already opened device
    pub fn open_with(
        mut device: Box<dyn CoverDevice>,
        is_kernel_64_bit: bool,
        extra: bool,
    ) -> Result<Self, ExecErr> {
        let capacity = if extra { EXTRA_COVER_SIZE } else { COVER_SIZE };
        device.init_trace(capacity, is_kernel_64_bit)?;

        let entry_size = if is_kernel_64_bit { 8 } else { 4 };
        let mmap_len = capacity * entry_size;
        let addr = device.map(mmap_len)?;

        let area = CoverArea::new(addr, is_kernel_64_bit, capacity);

        debug!(
            "cover mapped @ 0x{:X} - 0x{:X} ({} entries, extra={})",
            area.addr,
            area.end(),
            capacity,
            extra
        );

        Ok(Cover {
            device,
            area,
            mmap_len,
            size: 0,
            extra,
            comps: false,
        })
    }

    pub fn area(&self) -> CoverArea {
        self.area
    }

    /// Start tracing. A primary cover traces the calling thread and becomes
    /// its active cover, an extra cover asks the kernel to collect from
    /// background threads tagged with this process' remote handles.
    ///
    /// Some kernels reject this with assorted errnos (EBADF, EFAULT, ENOTTY
    /// have all been seen), so failures come back as feature errors
    pub fn enable(&mut self, ctx: &ExecContext, collect_comps: bool) -> Result<(), ExecErr> {
        let mode = if collect_comps { KCOV_TRACE_CMP } else { KCOV_TRACE_PC };

        if !self.extra {
            self.device.enable(mode)?;
            set_active(self.area);
        } else {
            // Instance 0 is never handed out, and an id that does not fit a
            // handle encodes as 0 which the kernel would happily accept
            let Some(instance) = ctx.procid.checked_add(1) else {
                return Err(ExecErr::feature("Remote cover procid is out of range"));
            };

            let common_handle = remote_handle(SUBSYSTEM_COMMON, instance);
            let handle = remote_handle(SUBSYSTEM_USB, instance);
            if common_handle == 0 || handle == 0 {
                return Err(ExecErr::feature(&format!(
                    "No remote handle for instance {}",
                    instance
                )));
            }

            let req = RemoteRequest {
                trace_mode: mode,
                area_size: EXTRA_COVER_SIZE as u32,
                common_handle,
                handle,
            };
            self.device.remote_enable(&req, self.area.wide)?;
        }

        self.comps = collect_comps;
        Ok(())
    }

    /// Zero this cover's counter
    #[inline]
    pub fn reset(&self) {
        self.area.reset();
    }

    /// Snapshot how many entries the kernel recorded since the last reset.
    /// Tracing keeps going
    pub fn collect(&mut self) -> usize {
        self.size = self.area.count();
        self.size
    }

    /// Nothing to do on Linux, the buffer never needs its protection toggled
    pub fn protect(&self) {}

    pub fn unprotect(&self) {}

    /// Whether `pc` lies in the monitored kernel code. Only decidable
    /// cheaply for 64-bit x86 kernels, everything else passes
    pub fn check(&self, pc: u64) -> bool {
        if cfg!(any(target_arch = "x86", target_arch = "x86_64")) && self.area.wide {
            return (KERNEL_TEXT_START..KERNEL_TEXT_END).contains(&pc);
        }

        true
    }

    /// Recorded program counters as of the last `collect`. A counter that
    /// ran past the buffer is clamped
    pub fn pcs(&self) -> impl Iterator<Item = u64> + '_ {
        let n = self.size.min(self.area.capacity - 1);
        (1..=n).map(move |idx| self.area.entry(idx))
    }

    /// Recorded comparisons as of the last `collect`, empty unless enabled
    /// in comparison-trace mode
    pub fn comparisons(&self) -> impl Iterator<Item = Comparison> + '_ {
        let n = if self.comps {
            self.size.min((self.area.words() - 1) / CMP_RECORD_WORDS)
        } else {
            0
        };

        (0..n).map(move |i| {
            let base = 1 + i * CMP_RECORD_WORDS;
            Comparison {
                kind: self.area.word(base),
                arg1: self.area.word(base + 1),
                arg2: self.area.word(base + 2),
                pc: self.area.word(base + 3),
            }
        })
    }

    /// Stop tracing, the mapping stays valid
    pub fn disable(&mut self) -> Result<(), ExecErr> {
        clear_active(self.area);
        self.device.disable()
    }
}

impl Drop for Cover {
    fn drop(&mut self) {
        clear_active(self.area);
        unsafe { libc::munmap(self.area.addr as *mut libc::c_void, self.mmap_len) };
    }
}

/// A stand-in for the kcov device backed by anonymous shared memory, plus
/// helpers that write the buffer the way the kernel would
#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{Arc, Mutex};

    use super::CoverArea;
    use crate::err::ExecErr;
    use crate::kcov::{CoverDevice, RemoteRequest};

    #[derive(Default, Debug)]
    pub struct FakeLog {
        pub init: Option<(usize, bool)>,
        pub enabled: Option<u32>,
        pub remote: Option<(RemoteRequest, bool)>,
        pub disabled: bool,
    }

    #[derive(Default)]
    pub struct FakeDevice {
        pub log: Arc<Mutex<FakeLog>>,
        pub fail_enable: bool,
        pub fail_remote: bool,
        pub fail_map: bool,
    }

    impl FakeDevice {
        pub fn new() -> (Self, Arc<Mutex<FakeLog>>) {
            let device = FakeDevice::default();
            let log = device.log.clone();
            (device, log)
        }
    }

    impl CoverDevice for FakeDevice {
        fn init_trace(&mut self, entries: usize, wide: bool) -> Result<(), ExecErr> {
            self.log.lock().unwrap().init = Some((entries, wide));
            Ok(())
        }

        fn map(&mut self, len: usize) -> Result<usize, ExecErr> {
            if self.fail_map {
                return Err(ExecErr::setup("Cover mmap failed"));
            }

            let result = unsafe {
                libc::mmap(
                    std::ptr::null_mut::<libc::c_void>(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            assert_ne!(result, libc::MAP_FAILED);

            // Pretend the kernel traced something before anyone reset
            unsafe { std::ptr::write_volatile(result as *mut u64, 17) };
            Ok(result as usize)
        }

        fn enable(&mut self, mode: u32) -> Result<(), ExecErr> {
            if self.fail_enable {
                return Err(ExecErr::feature("Cover enable write trace failed"));
            }

            self.log.lock().unwrap().enabled = Some(mode);
            Ok(())
        }

        fn remote_enable(&mut self, req: &RemoteRequest, wide: bool) -> Result<(), ExecErr> {
            if self.fail_remote {
                return Err(ExecErr::feature("Remote cover enable write trace failed"));
            }

            self.log.lock().unwrap().remote = Some((*req, wide));
            Ok(())
        }

        fn disable(&mut self) -> Result<(), ExecErr> {
            self.log.lock().unwrap().disabled = true;
            Ok(())
        }
    }

    /// Append entries the way kcov does, dropping what no longer fits
    pub fn trace(area: CoverArea, values: &[u64]) {
        let mut count = area.count();
        for &value in values {
            if count + 1 >= area.capacity {
                break;
            }

            count += 1;
            unsafe {
                if area.wide {
                    std::ptr::write_volatile((area.addr as *mut u64).add(count), value);
                } else {
                    std::ptr::write_volatile((area.addr as *mut u32).add(count), value as u32);
                }
            }
        }

        unsafe {
            if area.wide {
                std::ptr::write_volatile(area.addr as *mut u64, count as u64);
            } else {
                std::ptr::write_volatile(area.addr as *mut u32, count as u32);
            }
        }
    }

    /// Append comparison records, always in u64 words
    pub fn trace_cmps(area: CoverArea, records: &[[u64; 4]]) {
        let mut count = unsafe { std::ptr::read_volatile(area.addr as *const u64) } as usize;
        for record in records {
            let base = 1 + count * 4;
            for (i, &word) in record.iter().enumerate() {
                unsafe { std::ptr::write_volatile((area.addr as *mut u64).add(base + i), word) };
            }
            count += 1;
        }

        unsafe { std::ptr::write_volatile(area.addr as *mut u64, count as u64) };
    }
}

/// This file contains the execution context that is threaded through all of
/// the coverage and call execution logic of one executor process
use crate::bitness::detect_kernel_bitness;
use crate::config::Config;
use crate::cover::{self, Cover};
use crate::err::ExecErr;
use crate::kcov::KCOV_PATH;
use crate::syscall::{execute_syscall, Call, MAX_ARGS};
use crate::{debug, prompt_warn};

// Everything the executor learns about itself and its kernel once at start,
// read-only afterwards so threads can share clones of it
#[derive(Clone, Debug)]
pub struct ExecContext {
    pub is_kernel_64_bit: bool, // Width of kernel pointers, not ours
    pub flag_coverage: bool,    // Whole-run coverage collection
    pub flag_comparisons: bool, // Covers are enabled in comparison mode
    pub procid: u64,            // Executor id, base of remote handles
    pub cover_device: String,   // Path of the kcov device
}

impl Default for ExecContext {
    fn default() -> Self {
        ExecContext {
            is_kernel_64_bit: true,
            flag_coverage: true,
            flag_comparisons: false,
            procid: 0,
            cover_device: KCOV_PATH.to_string(),
        }
    }
}

impl ExecContext {
    pub fn new(config: &Config, is_kernel_64_bit: bool) -> Self {
        ExecContext {
            is_kernel_64_bit,
            flag_coverage: config.flag_coverage,
            flag_comparisons: config.collect_comps,
            procid: config.procid,
            cover_device: config.cover_device.clone(),
        }
    }

    /// Open and enable a cover in one go. Open failures are setup errors,
    /// enable failures come back as feature errors
    pub fn cover_start(&self, extra: bool) -> Result<Cover, ExecErr> {
        let mut cov = Cover::open(self, extra)?;
        cov.enable(self, self.flag_comparisons)?;
        Ok(cov)
    }

    /// Reset `cov` or the thread's active cover. Without whole-run coverage
    /// there is nothing to reset
    pub fn cover_reset(&self, cov: Option<&Cover>) -> Result<(), ExecErr> {
        if !self.flag_coverage {
            return Ok(());
        }

        cover::reset(cov)
    }

    /// Execute a single call with this context's normalization rules
    pub fn execute(&self, call: &Call, args: &[isize; MAX_ARGS]) -> isize {
        execute_syscall(call, args, self.flag_coverage)
    }
}

/// Process-level initialization: die with the parent and work out the
/// kernel's bitness once
pub fn os_init(config: &Config) -> ExecContext {
    let result = unsafe {
        libc::prctl(
            libc::PR_SET_PDEATHSIG,
            libc::SIGKILL as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };

    if result != 0 {
        prompt_warn!(
            "Failed to register parent-death signal: {}",
            std::io::Error::last_os_error()
        );
    }

    let is_kernel_64_bit = detect_kernel_bitness();
    debug!("kernel is {}-bit", if is_kernel_64_bit { 64 } else { 32 });

    ExecContext::new(config, is_kernel_64_bit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cover::active_cover;
    use crate::cover::fake::{trace, FakeDevice};
    use crate::err::Stage;

    // Instrumented sites our pseudo-call reaches
    const HIT_SITES: [u64; 3] = [0xffffffff81000100, 0xffffffff81000200, 0xffffffff81000300];

    // Stands in for a call whose kernel path hits three traced sites
    fn traced_nop(
        _: isize, _: isize, _: isize, _: isize, _: isize,
        _: isize, _: isize, _: isize, _: isize,
    ) -> isize {
        if let Some(area) = active_cover() {
            trace(area, &HIT_SITES);
        }
        0
    }

    fn fake_cover(ctx: &ExecContext) -> Cover {
        let (device, _) = FakeDevice::new();
        let mut cov = Cover::open_with(Box::new(device), ctx.is_kernel_64_bit, false).unwrap();
        cov.enable(ctx, ctx.flag_comparisons).unwrap();
        cov
    }

    #[test]
    fn new_copies_config() {
        let config = Config {
            flag_coverage: false,
            collect_comps: true,
            procid: 7,
            cover_device: "/dev/null".to_string(),
            ..Config::default()
        };

        let ctx = ExecContext::new(&config, false);
        assert!(!ctx.is_kernel_64_bit);
        assert!(!ctx.flag_coverage);
        assert!(ctx.flag_comparisons);
        assert_eq!(ctx.procid, 7);
        assert_eq!(ctx.cover_device, "/dev/null");
    }

    #[test]
    fn traced_call_is_fully_collected() {
        let ctx = ExecContext::default();
        let mut cov = fake_cover(&ctx);

        ctx.cover_reset(None).unwrap();
        let call = Call::custom("syz_traced_nop", traced_nop);
        assert_eq!(ctx.execute(&call, &[0; MAX_ARGS]), 0);

        assert_eq!(cov.collect(), HIT_SITES.len());
        let pcs: Vec<u64> = cov.pcs().filter(|&pc| cov.check(pc)).collect();
        assert_eq!(pcs, HIT_SITES);
    }

    #[test]
    fn windows_start_from_zero() {
        let ctx = ExecContext::default();
        let mut cov = fake_cover(&ctx);
        let call = Call::custom("syz_traced_nop", traced_nop);

        for _ in 0..3 {
            ctx.cover_reset(Some(&cov)).unwrap();
            ctx.execute(&call, &[0; MAX_ARGS]);
            assert_eq!(cov.collect(), HIT_SITES.len());
        }
    }

    #[test]
    fn reset_is_skipped_without_coverage() {
        let ctx = ExecContext {
            flag_coverage: false,
            ..ExecContext::default()
        };

        // No active cover, but nothing is asked of it either
        assert!(ctx.cover_reset(None).is_ok());

        let with_cover = ExecContext::default();
        let err = with_cover.cover_reset(None).unwrap_err();
        assert_eq!(err.stage(), Stage::Setup);
    }

    #[test]
    fn cover_start_on_missing_device_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecContext {
            cover_device: dir.path().join("kcov").to_str().unwrap().to_string(),
            ..ExecContext::default()
        };

        let err = ctx.cover_start(false).err().unwrap();
        assert_eq!(err.stage(), Stage::Setup);
    }

    #[test]
    fn os_init_detects_bitness() {
        let ctx = os_init(&Config::default());
        if cfg!(target_pointer_width = "64") {
            assert!(ctx.is_kernel_64_bit);
        }
        assert!(ctx.flag_coverage);
    }
}

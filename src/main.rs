/// This file contains the `main` program logic which initializes the executor,
/// sets up the requested features, runs one kernel call under kcov and
/// reports the coverage it produced
use std::sync::mpsc;
use std::thread::JoinHandle;

use covexec::config::parse_args;
use covexec::context::{os_init, ExecContext};
use covexec::cover::Cover;
use covexec::err::{ExecErr, Stage};
use covexec::features::{setup_features, setup_machine};
use covexec::misc::set_verbose;
use covexec::syscall::{Call, MAX_ARGS};
use covexec::{fatal, prompt, prompt_warn};

// How many recorded entries we print
const SHOW_ENTRIES: usize = 8;

// A background thread holding an extra cover until we ask it to collect
struct ExtraWorker {
    done: mpsc::Sender<()>,
    handle: JoinHandle<usize>,
}

fn spawn_extra(ctx: &ExecContext) -> Option<ExtraWorker> {
    let ctx = ctx.clone();
    let (started_tx, started_rx) = mpsc::channel::<Result<(), ExecErr>>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    // Remote coverage is tied to the task that enabled it, so the thread
    // has to stay alive for the whole window
    let handle = std::thread::spawn(move || {
        let mut cov = match ctx.cover_start(true) {
            Ok(cov) => cov,
            Err(err) => {
                let _ = started_tx.send(Err(err));
                return 0;
            }
        };

        cov.reset();
        let _ = started_tx.send(Ok(()));
        let _ = done_rx.recv();
        cov.collect()
    });

    match started_rx.recv() {
        Ok(Ok(())) => Some(ExtraWorker {
            done: done_tx,
            handle,
        }),
        Ok(Err(err)) if err.stage() == Stage::Feature => {
            prompt_warn!("Extra coverage unavailable: {}", err);
            None
        }
        Ok(Err(err)) => fatal!(err),
        Err(_) => fatal!(ExecErr::setup("Extra coverage thread died during setup")),
    }
}

fn main() {
    let config = parse_args().unwrap_or_else(|error| {
        fatal!(error);
    });
    set_verbose(config.verbose);

    // Register for parent death and figure out the kernel
    prompt!("Initializing executor...");
    let ctx = os_init(&config);
    prompt!("Kernel is {}-bit", if ctx.is_kernel_64_bit { 64 } else { 32 });

    setup_machine();

    for (name, result) in setup_features(&config.features) {
        match result {
            Ok(()) => prompt!("Feature '{}' enabled", name),
            Err(err) => prompt_warn!("Feature '{}' unavailable: {}", name, err),
        }
    }

    let Some(sys_nr) = config.syscall else {
        prompt!("No '--syscall' argument, nothing to execute");
        return;
    };

    // Build the call, prctl is the one name execution cares about
    let name = if sys_nr == libc::SYS_prctl { "prctl" } else { "syscall" };
    let call = Call::raw(name, sys_nr);
    let mut args = [0isize; MAX_ARGS];
    args[..config.args.len()].copy_from_slice(&config.args);

    // Open the primary cover, an enable rejected by the kernel just means we
    // run without coverage
    let mut cover = None;
    if ctx.flag_coverage {
        let mut cov = Cover::open(&ctx, false).unwrap_or_else(|error| {
            fatal!(error);
        });

        match cov.enable(&ctx, ctx.flag_comparisons) {
            Ok(()) => cover = Some(cov),
            Err(err) => prompt_warn!("Coverage unavailable: {}", err),
        }
    }

    let extra = if ctx.flag_coverage && config.extra {
        spawn_extra(&ctx)
    } else {
        None
    };

    // Measurement window
    if let Some(cov) = cover.as_ref() {
        if let Err(err) = ctx.cover_reset(Some(cov)) {
            fatal!(err);
        }
    }

    let res = ctx.execute(&call, &args);
    let os_err = std::io::Error::last_os_error();

    if let Some(cov) = cover.as_mut() {
        cov.collect();
    }

    prompt!("{:?} = {}", call, res);
    if res == -1 {
        prompt!("errno: {}", os_err);
    }

    if let Some(cov) = cover.as_ref() {
        prompt!("Collected {} entries", cov.size);
        if ctx.flag_comparisons {
            for cmp in cov.comparisons().take(SHOW_ENTRIES) {
                prompt!(
                    "cmp @ 0x{:X}: 0x{:X} vs 0x{:X} ({} bytes{})",
                    cmp.pc,
                    cmp.arg1,
                    cmp.arg2,
                    cmp.size(),
                    if cmp.is_const() { ", const" } else { "" }
                );
            }
        } else {
            for pc in cov.pcs().filter(|&pc| cov.check(pc)).take(SHOW_ENTRIES) {
                prompt!("pc 0x{:X}", pc);
            }
        }
    }

    if let Some(worker) = extra {
        let _ = worker.done.send(());
        match worker.handle.join() {
            Ok(size) => prompt!("Collected {} entries from background threads", size),
            Err(_) => prompt_warn!("Extra coverage thread panicked"),
        }
    }
}

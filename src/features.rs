/// This file contains the table of optional execution-environment features
/// the supervisor can ask for, and the routines that switch them on. The set
/// is closed: adding a feature means adding a variant here
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::err::ExecErr;
use crate::{debug, prompt_warn};

const DEBUGFS: &str = "/sys/kernel/debug";
const KMEMLEAK: &str = "/sys/kernel/debug/kmemleak";
const KCSAN: &str = "/sys/kernel/debug/kcsan";
const BINFMT_MISC: &str = "/proc/sys/fs/binfmt_misc";
const RAW_GADGET: &str = "/dev/raw-gadget";
const MAKE_IT_FAIL: &str = "/proc/self/make-it-fail";
const NMI_LONGEST_NS: &str = "/sys/kernel/debug/x86/nmi_longest_ns";

// Fault injection knobs under debugfs: (path, value, must succeed)
const FAULT_KNOBS: [(&str, &str, bool); 5] = [
    ("failslab/ignore-gfp-wait", "N", true),
    ("fail_futex/ignore-private", "N", false),
    ("fail_page_alloc/ignore-gfp-highmem", "N", false),
    ("fail_page_alloc/ignore-gfp-wait", "N", false),
    ("fail_page_alloc/min-order", "0", false),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    Leak,
    Fault,
    BinfmtMisc,
    Kcsan,
    Usb,
}

/// Every feature, in the order they are negotiated
pub const FEATURES: [Feature; 5] = [
    Feature::Leak,
    Feature::Fault,
    Feature::BinfmtMisc,
    Feature::Kcsan,
    Feature::Usb,
];

impl Feature {
    pub fn name(&self) -> &'static str {
        match self {
            Feature::Leak => "leak",
            Feature::Fault => "fault",
            Feature::BinfmtMisc => "binfmt_misc",
            Feature::Kcsan => "kcsan",
            Feature::Usb => "usb",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        FEATURES.iter().copied().find(|feature| feature.name() == name)
    }

    /// Run this feature's setup routine
    pub fn setup(&self) -> Result<(), ExecErr> {
        debug!("setting up feature '{}'", self.name());
        match self {
            Feature::Leak => setup_leak(Path::new(KMEMLEAK)),
            Feature::Fault => setup_fault(Path::new(MAKE_IT_FAIL), Path::new(DEBUGFS)),
            Feature::BinfmtMisc => setup_binfmt_misc(),
            Feature::Kcsan => setup_kcsan(Path::new(KCSAN)),
            Feature::Usb => setup_usb(Path::new(RAW_GADGET)),
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Set up the named features. Unknown names and failed setups are reported
/// per feature, none of them stops the others
pub fn setup_features(names: &[String]) -> Vec<(String, Result<(), ExecErr>)> {
    names
        .iter()
        .map(|name| {
            let result = match Feature::from_name(name) {
                Some(feature) => feature.setup(),
                None => Err(ExecErr::feature(&format!("Unknown feature '{}'", name))),
            };
            (name.clone(), result)
        })
        .collect()
}

/// Machine-wide tweaks done once per boot. Slow debug kernels in qemu print
/// "NMI handler took too long" all the time and garble the console, raising
/// the threshold silences them
pub fn setup_machine() {
    if let Err(err) = write_file(Path::new(NMI_LONGEST_NS), "10000000000") {
        prompt_warn!("{}", err);
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), ExecErr> {
    std::fs::write(path, contents).map_err(|e| {
        ExecErr::feature(&format!("Write to '{}' failed: {}", path.display(), e))
    })
}

// Stop the periodic scanner, we scan explicitly between programs
fn setup_leak(kmemleak: &Path) -> Result<(), ExecErr> {
    write_file(kmemleak, "scan=off")?;
    write_file(kmemleak, "clear")
}

fn setup_fault(make_it_fail: &Path, debugfs: &Path) -> Result<(), ExecErr> {
    if !make_it_fail.exists() {
        return Err(ExecErr::feature("Fault injection is not enabled in the kernel"));
    }

    for (knob, value, required) in FAULT_KNOBS {
        match write_file(&debugfs.join(knob), value) {
            Err(err) if required => return Err(err),
            Err(err) => debug!("{}", err),
            Ok(()) => {}
        }
    }

    Ok(())
}

fn setup_binfmt_misc() -> Result<(), ExecErr> {
    let Ok(target) = std::ffi::CString::new(BINFMT_MISC) else {
        return Err(ExecErr::feature("Invalid binfmt_misc path"));
    };
    let fstype = c"binfmt_misc";

    let result = unsafe {
        libc::mount(fstype.as_ptr(), target.as_ptr(), fstype.as_ptr(), 0, std::ptr::null())
    };

    if result != 0 && crate::misc::get_errno() != libc::EBUSY {
        return Err(ExecErr::feature("Mount of binfmt_misc failed").with_errno());
    }

    Ok(())
}

fn setup_kcsan(control: &Path) -> Result<(), ExecErr> {
    write_file(control, "on")
}

// Test programs run unprivileged, they need the gadget node
fn setup_usb(raw_gadget: &Path) -> Result<(), ExecErr> {
    let perms = std::fs::Permissions::from_mode(0o666);
    std::fs::set_permissions(raw_gadget, perms).map_err(|e| {
        ExecErr::feature(&format!("Failed to open '{}': {}", raw_gadget.display(), e))
    })
}

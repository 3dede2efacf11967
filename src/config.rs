/// This file contains all of the logic necessary to formulate a coherent
/// Config data structure that we pass to the ExecContext. We use the `clap`
/// crate and parse args here
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::err::ExecErr;
use crate::kcov::KCOV_PATH;
use crate::syscall::MAX_RAW_ARGS;

// Remote handle instances are 32 bits wide and start at 1
const MAX_PROCID: u64 = u32::MAX as u64;

#[derive(Clone, Debug)]
pub struct Config {
    pub cover_device: String,
    pub flag_coverage: bool,
    pub collect_comps: bool,
    pub extra: bool,
    pub procid: u64,
    pub features: Vec<String>,
    pub syscall: Option<libc::c_long>,
    pub args: Vec<isize>,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cover_device: KCOV_PATH.to_string(),
            flag_coverage: true,
            collect_comps: false,
            extra: false,
            procid: 0,
            features: Vec::new(),
            syscall: None,
            args: Vec::new(),
            verbose: false,
        }
    }
}

fn command() -> Command {
    Command::new("covexec")
    .version("0.0.1")
    .about("Runs a kernel call under kcov and reports the coverage it produced")
    .arg(Arg::new("cover-device")
        .long("cover-device")
        .value_name("PATH")
        .help("Path of the kcov device (/sys/kernel/debug/kcov default)"))
    .arg(Arg::new("no-cover")
        .long("no-cover")
        .help("Run without collecting coverage")
        .action(ArgAction::SetTrue))
    .arg(Arg::new("comps")
        .long("comps")
        .help("Collect comparison operands instead of program counters")
        .action(ArgAction::SetTrue))
    .arg(Arg::new("extra")
        .long("extra")
        .help("Also collect coverage from background kernel threads")
        .action(ArgAction::SetTrue))
    .arg(Arg::new("procid")
        .long("procid")
        .value_name("ID")
        .help("Executor process id, used for remote coverage handles (0 default)"))
    .arg(Arg::new("feature")
        .long("feature")
        .value_name("NAME")
        .help("Optional feature to set up, may be repeated")
        .action(ArgAction::Append))
    .arg(Arg::new("syscall")
        .long("syscall")
        .value_name("NR")
        .help("Syscall number to execute"))
    .arg(Arg::new("args")
        .long("args")
        .value_name("ARGS")
        .help("Up to 6 syscall arguments (decimal or 0x hex)")
        .num_args(1..=MAX_RAW_ARGS)
        .allow_hyphen_values(true))
    .arg(Arg::new("verbose")
        .long("verbose")
        .help("Enables debug output")
        .action(ArgAction::SetTrue))
}

// Accept both decimal and 0x-prefixed hex
fn parse_number(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()? as i64,
        None => digits.parse::<i64>().ok()?,
    };

    Some(if negative { value.wrapping_neg() } else { value })
}

pub fn parse_args() -> Result<Config, ExecErr> {
    config_from_matches(&command().get_matches())
}

fn config_from_matches(matches: &ArgMatches) -> Result<Config, ExecErr> {
    let mut config = Config::default();

    if let Some(path) = matches.get_one::<String>("cover-device") {
        config.cover_device = path.to_string();
    }

    config.flag_coverage = !matches.get_flag("no-cover");
    config.collect_comps = matches.get_flag("comps");
    config.extra = matches.get_flag("extra");
    config.verbose = matches.get_flag("verbose");

    // See if a procid was provided
    if let Some(str_repr) = matches.get_one::<String>("procid") {
        let Ok(procid) = str_repr.parse::<u64>() else {
            return Err(ExecErr::setup("Invalid --procid value"));
        };

        // procid + 1 becomes a 32-bit remote handle instance
        if procid >= MAX_PROCID {
            return Err(ExecErr::setup(&format!(
                "--procid must be below {}",
                MAX_PROCID
            )));
        }

        config.procid = procid;
    }

    if let Some(names) = matches.get_many::<String>("feature") {
        config.features = names.cloned().collect();
    }

    // See if a syscall was provided
    if let Some(str_repr) = matches.get_one::<String>("syscall") {
        let Some(nr) = parse_number(str_repr) else {
            return Err(ExecErr::setup("Invalid --syscall value"));
        };

        config.syscall = Some(nr as libc::c_long);
    }

    if let Some(values) = matches.get_many::<String>("args") {
        for str_repr in values {
            let Some(arg) = parse_number(str_repr) else {
                return Err(ExecErr::setup(&format!("Invalid --args value '{}'", str_repr)));
            };

            config.args.push(arg as isize);
        }
    }

    Ok(config)
}

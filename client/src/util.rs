use colored::*;
use log::{Level, LevelFilter};
use std::{io, path::Path};

static LOGGER: Logger = Logger;
struct Logger;

const BASE_MODULES: &[&str] = &["goconnect_daemon", "goconnect_shared"];

fn target_is_base(target: &str) -> bool {
    BASE_MODULES
        .iter()
        .any(|module| module == &target || target.starts_with(&format!("{module}::")))
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
            && (log::max_level() == LevelFilter::Trace || target_is_base(metadata.target()))
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let level_str = match record.level() {
                Level::Error => "[E]".red(),
                Level::Warn => "[!]".yellow(),
                Level::Info => "[*]".dimmed(),
                Level::Debug => "[D]".blue(),
                Level::Trace => "[T]".purple(),
            };
            if record.level() <= LevelFilter::Debug && !target_is_base(record.target()) {
                println!(
                    "{} {} {}",
                    level_str,
                    format!("[{}]", record.target()).dimmed(),
                    record.args()
                );
            } else {
                println!("{} {}", level_str, record.args());
            }
        }
    }

    fn flush(&self) {}
}

pub fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    log::set_max_level(level);
    log::set_logger(&LOGGER).ok();
}

/// Mirrors the teacher's `permissions_helptext` — CAP_NET_ADMIN and
/// config/data-dir permission errors are common enough on first run to
/// deserve a pointed message instead of a bare `io::Error` debug print.
pub fn permissions_helptext(config_dir: &Path, e: &io::Error) {
    if e.raw_os_error() == Some(1) {
        let current_exe = std::env::current_exe()
            .ok()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "<goconnectd path>".into());
        eprintln!(
            "{}: goconnectd can't access the device info.\n\n\
             You either need to run goconnectd as root, or give it CAP_NET_ADMIN capabilities:\n\n    \
             sudo setcap cap_net_admin+eip {}\n",
            "ERROR".bold().red(),
            current_exe
        );
    } else if e.kind() == io::ErrorKind::PermissionDenied {
        eprintln!(
            "{}: goconnectd can't access {}.\n\n\
             You either need to run goconnectd as root, or give the user/group running it\n\
             permission to access that directory.\n",
            "ERROR".bold().red(),
            config_dir.to_string_lossy(),
        );
    }
}

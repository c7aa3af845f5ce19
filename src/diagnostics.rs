use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

static DEBUG_ENABLED: OnceLock<bool> = OnceLock::new();
static DEBUG_EPOCH: OnceLock<Instant> = OnceLock::new();
static DEBUG_LOG_FILE: OnceLock<Option<Mutex<std::fs::File>>> = OnceLock::new();

pub const DEBUG_ENV: &str = "REPL_SESSION_DEBUG";
pub const DEBUG_FILE_ENV: &str = "REPL_SESSION_DEBUG_FILE";

fn debug_enabled() -> bool {
    *DEBUG_ENABLED.get_or_init(|| {
        let enabled = std::env::var(DEBUG_ENV)
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false);
        if enabled {
            return true;
        }
        std::env::var(DEBUG_FILE_ENV)
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
    })
}

fn debug_epoch() -> Instant {
    *DEBUG_EPOCH.get_or_init(Instant::now)
}

/// Writes a timestamped debug line when enabled via `REPL_SESSION_DEBUG`
/// (stderr) or `REPL_SESSION_DEBUG_FILE` (appended to the named file). The
/// default sink for inbound `log` messages.
pub fn debug_log(message: impl AsRef<str>) {
    if !debug_enabled() {
        return;
    }
    let elapsed = debug_epoch().elapsed();
    let line = format!(
        "[repl-session +{:>6}ms] {}",
        elapsed.as_millis(),
        message.as_ref()
    );

    let file = DEBUG_LOG_FILE.get_or_init(|| {
        let path = std::env::var(DEBUG_FILE_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
            .map(Mutex::new)
    });
    match file {
        Some(file) => {
            if let Ok(mut guard) = file.lock() {
                let _ = writeln!(*guard, "{line}");
                let _ = guard.flush();
            }
        }
        None => {
            eprintln!("{line}");
        }
    }
}

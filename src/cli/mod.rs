//! CLI command implementations.

pub mod capacity;
pub mod create;
pub mod destroy;
pub mod info;
pub mod init;
pub mod list;
pub mod serve;
pub mod stop;

use serde::Serialize;
use std::time::Duration;

/// Parse a humantime duration argument ("30s", "2m").
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Print a value as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> vmsup::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| vmsup::Error::InternalFault(format!("failed to encode output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

/// Format a MiB amount for tables.
pub fn format_mib(mib: u64) -> String {
    if mib >= 1024 && mib % 1024 == 0 {
        format!("{} GiB", mib / 1024)
    } else {
        format!("{} MiB", mib)
    }
}

//! Parsing for human-written durations (`15m`) and memory sizes (`512M`).

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use regex::Regex;

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)([smh])$").expect("duration pattern compiles"));
static MEMORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)([MG])$").expect("memory pattern compiles"));

/// Shortest wall-clock timeout accepted from task files.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Longest wall-clock timeout accepted from task files.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Parse `<number><unit>` where unit is `s`, `m`, or `h`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    let caps = DURATION_RE
        .captures(trimmed)
        .ok_or_else(|| anyhow!("invalid duration {trimmed:?}: expected <number>(s|m|h)"))?;
    let value: u64 = caps[1]
        .parse()
        .map_err(|err| anyhow!("invalid duration {trimmed:?}: {err}"))?;
    let secs = match &caps[2] {
        "s" => Some(value),
        "m" => value.checked_mul(60),
        "h" => value.checked_mul(60 * 60),
        unit => bail!("invalid duration unit {unit:?}"),
    };
    secs.map(Duration::from_secs)
        .ok_or_else(|| anyhow!("duration {trimmed:?} overflows"))
}

/// Parse a duration and require it to fall within `MIN_TIMEOUT..=MAX_TIMEOUT`.
pub fn parse_timeout(input: &str) -> Result<Duration> {
    let duration = parse_duration(input)?;
    if duration < MIN_TIMEOUT || duration > MAX_TIMEOUT {
        bail!("timeout {input:?} must be between 1s and 24h");
    }
    Ok(duration)
}

/// Parse `<number>M` or `<number>G` into bytes (binary units).
pub fn parse_memory(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let caps = MEMORY_RE
        .captures(trimmed)
        .ok_or_else(|| anyhow!("invalid memory size {trimmed:?}: expected <number>(M|G)"))?;
    let value: u64 = caps[1]
        .parse()
        .map_err(|err| anyhow!("invalid memory size {trimmed:?}: {err}"))?;
    let multiplier: u64 = match &caps[2] {
        "M" => 1024 * 1024,
        "G" => 1024 * 1024 * 1024,
        unit => bail!("invalid memory unit {unit:?}"),
    };
    let bytes = value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("memory size {trimmed:?} overflows"))?;
    if bytes == 0 {
        bail!("memory size must be > 0");
    }
    Ok(bytes)
}

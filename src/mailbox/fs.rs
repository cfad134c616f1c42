//! File and clock helpers shared by the mailbox, lease and presence stores.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

/// Read and parse a JSON file, returning `default` when it is missing or corrupt.
///
/// A partially written file can only be observed if a writer bypassed
/// [`atomic_write_json`], so a parse failure is logged quietly and treated as
/// empty state.
pub async fn read_json_or<T: DeserializeOwned>(path: &Path, default: T) -> T {
    match tokio::fs::read_to_string(path).await {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(value) => value,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Unparseable JSON, using default");
                default
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "Unreadable file, using default");
            }
            default
        }
    }
}

/// Write JSON to `path` atomically: write a uniquely named temp file in the
/// same directory, then rename it over the target.
pub async fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)?;
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, json).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "mailbox".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Current time as an RFC 3339 UTC timestamp with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Format epoch milliseconds the same way as [`now_timestamp`].
pub fn timestamp_from_ms(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp to epoch milliseconds.
///
/// Accepts RFC 3339 and the zone-less `YYYY-MM-DDTHH:MM:SS[.fff]` form some
/// writers produce (interpreted as UTC).
pub fn parse_timestamp_ms(raw: &str) -> Option<u64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return u64::try_from(dt.timestamp_millis()).ok();
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| u64::try_from(naive.and_utc().timestamp_millis()).ok())
}

/// `HH:MM:SS` portion of a stored timestamp, for display.
pub fn format_time(raw: &str) -> String {
    match raw.split_once('T') {
        Some((_, time)) => time
            .split(['.', 'Z', '+'])
            .next()
            .unwrap_or(time)
            .to_string(),
        None => raw.to_string(),
    }
}

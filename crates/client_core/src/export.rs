//! Writes a finished extraction to a timestamped JSON file.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local, TimeZone};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

const FALLBACK_LABEL: &str = "result";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("nothing to export: result is empty")]
    EmptyResult,
    #[error("failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Local part of the user's e-mail, or `result` when there is none.
pub fn label_from_email(email: Option<&str>) -> String {
    let local = email
        .and_then(|email| email.split('@').next())
        .map(str::trim)
        .filter(|local| !local.is_empty());
    match local {
        Some(local) => sanitize_label(local),
        None => FALLBACK_LABEL.to_string(),
    }
}

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `{label}_{YYYY-MM-DD}_{HH-MM-SS}.json`
pub fn export_file_name<Tz>(label: &str, at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    format!(
        "{}_{}_{}.json",
        sanitize_label(label),
        at.format("%Y-%m-%d"),
        at.format("%H-%M-%S")
    )
}

fn is_empty_result(result: &Value) -> bool {
    match result {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Writes `result` into `dir`, stamped with the current local time.
///
/// Both the date and the time in the file name come from the local clock, so
/// a file written shortly after local midnight carries the local date even
/// where the UTC date is still the previous day.
pub fn export_result(result: &Value, label: &str, dir: &Path) -> Result<PathBuf, ExportError> {
    export_result_at(result, label, dir, &Local::now())
}

pub fn export_result_at<Tz>(
    result: &Value,
    label: &str,
    dir: &Path,
    at: &DateTime<Tz>,
) -> Result<PathBuf, ExportError>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    if is_empty_result(result) {
        return Err(ExportError::EmptyResult);
    }

    let path = dir.join(export_file_name(label, at));
    let body = serde_json::to_string_pretty(result)?;
    fs::create_dir_all(dir).map_err(|source| ExportError::Write {
        path: dir.to_path_buf(),
        source,
    })?;
    fs::write(&path, body).map_err(|source| ExportError::Write {
        path: path.clone(),
        source,
    })?;

    info!(path = %path.display(), "export: result written");
    Ok(path)
}

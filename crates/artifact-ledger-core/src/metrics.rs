//! Lightweight structural metrics read from a trace archive's own index.
//!
//! HAR captures are JSON documents whose `log.entries` array is the index; zip bundles carry a
//! central directory. Anything that cannot be parsed falls back to its raw byte size.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::de::IgnoredAny;
use serde::Deserialize;

use crate::{ArchiveFormat, AssetMetrics};

#[derive(Deserialize)]
struct HarDocument {
    log: HarLog,
}

#[derive(Deserialize)]
struct HarLog {
    #[serde(default)]
    pages: Vec<IgnoredAny>,
    entries: Vec<HarEntry>,
}

#[derive(Deserialize)]
struct HarEntry {
    #[serde(default)]
    response: Option<HarResponse>,
}

#[derive(Deserialize)]
struct HarResponse {
    #[serde(default, rename = "bodySize")]
    body_size: Option<i64>,
}

/// Extract metrics for the archive at `path`, whose on-disk size is `size_bytes`.
///
/// Never fails: unparseable archives produce [`AssetMetrics::raw`].
#[must_use]
pub fn extract_metrics(path: &Path, size_bytes: u64) -> AssetMetrics {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let parsed = match extension.as_str() {
        "zip" => zip_metrics(path, size_bytes),
        _ => har_metrics(path, size_bytes),
    };

    match parsed {
        Ok(metrics) => metrics,
        Err(reason) => {
            tracing::debug!(
                path = %path.display(),
                %reason,
                "archive index unreadable; using raw size"
            );
            AssetMetrics::raw(size_bytes)
        }
    }
}

fn har_metrics(path: &Path, size_bytes: u64) -> Result<AssetMetrics, String> {
    let file = File::open(path).map_err(|err| err.to_string())?;
    let document: HarDocument =
        serde_json::from_reader(BufReader::new(file)).map_err(|err| err.to_string())?;

    let body_bytes = document
        .log
        .entries
        .iter()
        .filter_map(|entry| entry.response.as_ref().and_then(|response| response.body_size))
        .filter_map(|size| u64::try_from(size).ok())
        .sum();

    Ok(AssetMetrics {
        size_bytes,
        archive_format: ArchiveFormat::Har,
        entries_count: Some(document.log.entries.len() as u64),
        pages_count: Some(document.log.pages.len() as u64),
        body_bytes: Some(body_bytes),
    })
}

fn zip_metrics(path: &Path, size_bytes: u64) -> Result<AssetMetrics, String> {
    let file = File::open(path).map_err(|err| err.to_string())?;
    let archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|err| err.to_string())?;

    Ok(AssetMetrics {
        size_bytes,
        archive_format: ArchiveFormat::Zip,
        entries_count: Some(archive.len() as u64),
        pages_count: None,
        body_bytes: None,
    })
}

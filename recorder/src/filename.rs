//! Output filename resolution
//!
//! Templates may contain three placeholders, resolved in this order:
//! - `${timestamp}`: local time, with every run of non-alphanumeric characters
//!   collapsed to one hyphen. When present, `${sequence}` is dropped together
//!   with one adjacent underscore, and the directory is never scanned.
//! - `${appTitle}`: the `title=` line of `<root_dir>/manifest`, or `trace`.
//! - `${sequence}`: one past the highest number already used in the output
//!   directory by files with the same prefix and suffix, starting at 1.
//!
//! Resolution never fails; every lookup problem falls back to a default.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub const TIMESTAMP_PLACEHOLDER: &str = "${timestamp}";
pub const SEQUENCE_PLACEHOLDER: &str = "${sequence}";
pub const APP_TITLE_PLACEHOLDER: &str = "${appTitle}";

/// Template used when none is configured
pub const DEFAULT_TEMPLATE: &str = "${appTitle}_${timestamp}.perfetto-trace";

/// App title used when the manifest cannot supply one
pub const FALLBACK_APP_TITLE: &str = "trace";

/// Manifest file read for the app title
const MANIFEST_FILE: &str = "manifest";

/// Source of directory entries for the sequence scan
#[async_trait]
pub trait DirectoryListing: Send + Sync {
    /// File names in `dir`; `Ok(None)` when the directory does not exist
    async fn entries(&self, dir: &Path) -> io::Result<Option<Vec<String>>>;
}

/// Lists entries from the real filesystem
pub struct FsListing;

#[async_trait]
impl DirectoryListing for FsListing {
    async fn entries(&self, dir: &Path) -> io::Result<Option<Vec<String>>> {
        let mut read_dir = match fs::read_dir(dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(Some(names))
    }
}

/// Inputs to a filename resolution
#[derive(Debug, Clone)]
pub struct FilenameContext {
    /// Local wall-clock time stamped into `${timestamp}`
    pub timestamp: NaiveDateTime,
    /// Directory holding the app manifest
    pub root_dir: Option<PathBuf>,
    /// Destination directory scanned for `${sequence}`
    pub dir: PathBuf,
}

/// Resolve `template` (or [`DEFAULT_TEMPLATE`]) into a concrete filename
pub async fn resolve_filename(
    template: Option<&str>,
    ctx: &FilenameContext,
    listing: &dyn DirectoryListing,
) -> String {
    let mut name = template.unwrap_or(DEFAULT_TEMPLATE).to_string();

    if name.contains(TIMESTAMP_PLACEHOLDER) {
        name = name.replace(TIMESTAMP_PLACEHOLDER, &format_timestamp(&ctx.timestamp));
        name = strip_sequence(&name);
    }

    if name.contains(APP_TITLE_PLACEHOLDER) {
        let title = read_app_title(ctx.root_dir.as_deref()).await;
        name = name.replace(APP_TITLE_PLACEHOLDER, &title);
    }

    if let Some((prefix, suffix)) = name.split_once(SEQUENCE_PLACEHOLDER) {
        let next = match listing.entries(&ctx.dir).await {
            Ok(Some(entries)) => next_sequence(&entries, prefix, suffix),
            Ok(None) => 1,
            Err(e) => {
                debug!("Sequence scan of {} failed: {}", ctx.dir.display(), e);
                1
            }
        };
        name = name.replace(SEQUENCE_PLACEHOLDER, &next.to_string());
    }

    name
}

/// Filesystem-safe rendering of a local timestamp, e.g. `10-19-2026-3-04-05-PM`
pub fn format_timestamp(timestamp: &NaiveDateTime) -> String {
    let formatted = timestamp.format("%-m/%-d/%Y, %-I:%M:%S %p").to_string();

    let mut safe = String::with_capacity(formatted.len());
    for c in formatted.chars() {
        if c.is_ascii_alphanumeric() {
            safe.push(c);
        } else if !safe.is_empty() && !safe.ends_with('-') {
            safe.push('-');
        }
    }
    safe.trim_end_matches('-').to_string()
}

/// Remove every `${sequence}` plus one neighbouring underscore, preferring the left one
fn strip_sequence(name: &str) -> String {
    let mut out = name.to_string();
    while let Some(start) = out.find(SEQUENCE_PLACEHOLDER) {
        let end = start + SEQUENCE_PLACEHOLDER.len();
        let (start, end) = if out[..start].ends_with('_') {
            (start - 1, end)
        } else if out[end..].starts_with('_') {
            (start, end + 1)
        } else {
            (start, end)
        };
        out.replace_range(start..end, "");
    }
    out
}

/// App title from `<root_dir>/manifest`, or [`FALLBACK_APP_TITLE`]
///
/// Path separators in the title become underscores so it stays one path component.
pub async fn read_app_title(root_dir: Option<&Path>) -> String {
    let Some(root_dir) = root_dir else {
        return FALLBACK_APP_TITLE.to_string();
    };

    let path = root_dir.join(MANIFEST_FILE);
    let content = match fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) => {
            debug!("No app title from {}: {}", path.display(), e);
            return FALLBACK_APP_TITLE.to_string();
        }
    };

    content
        .lines()
        .find_map(|line| line.trim().strip_prefix("title="))
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .unwrap_or(FALLBACK_APP_TITLE)
        .replace(['/', '\\'], "_")
}

/// One past the highest numeric middle among `prefix<n>suffix` entries
pub fn next_sequence(entries: &[String], prefix: &str, suffix: &str) -> u64 {
    entries
        .iter()
        .filter_map(|name| name.strip_prefix(prefix)?.strip_suffix(suffix))
        .filter(|middle| !middle.is_empty() && middle.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|middle| middle.parse::<u64>().ok())
        // A number with no successor cannot be followed, so it is skipped
        .filter_map(|n| n.checked_add(1))
        .max()
        .unwrap_or(1)
}

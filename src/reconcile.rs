//! Incremental reconciliation of one Raindrop against its local note.
//!
//! A note is either absent (first sync) or present. Both cases collapse into a
//! single pass over an in-memory copy of the note:
//!
//! 1. start from the file on disk, or from a freshly rendered header whose
//!    watermark is the epoch sentinel;
//! 2. read the `last_update` watermark by scanning for the first line with that key;
//! 3. append every highlight created strictly after the watermark, in API order;
//! 4. move the watermark forward to the Raindrop's `last_update` when that is a
//!    strictly later instant, sub-second precision included;
//! 5. write the result to `<note>.temp` and rename it over the note.
//!
//! The watermark and the appended highlights land in the same rename, so a crash
//! can never leave new highlights behind a stale watermark. When nothing changes
//! the note is not rewritten at all.

use std::io::ErrorKind;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::NoteError;
use crate::model::{Collection, Raindrop};
use crate::render::Renderer;
use crate::timestamp::{compare_key, parse_timestamp};

pub const WATERMARK_KEY: &str = "last_update";
const TEMP_SUFFIX: &str = ".temp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteState {
    Absent,
    Present,
}

/// How hard to try replacing a note with its rewritten temp file.
#[derive(Debug, Clone, Copy)]
pub struct ReplacePolicy {
    pub attempts: u32,
    /// Delay before the second attempt; doubled for every attempt after that.
    pub backoff: Duration,
}

impl Default for ReplacePolicy {
    fn default() -> Self {
        ReplacePolicy {
            attempts: 5,
            backoff: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub state: NoteState,
    /// Number of highlight blocks appended in this pass.
    pub appended: usize,
    /// Watermark on disk after the pass.
    pub watermark: String,
    pub written: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub value: String,
    /// Byte range of `value` inside the note, quotes excluded.
    pub range: Range<usize>,
}

/// Finds the first `last_update` field. Accepts `key: value`, `key:: value`
/// and quoted values.
pub fn find_watermark(content: &str) -> Option<Watermark> {
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        let body = line.trim_end_matches(['\n', '\r']);
        let indent = body.len() - body.trim_start().len();
        let Some(rest) = body[indent..].strip_prefix(WATERMARK_KEY) else {
            continue;
        };
        if !rest.starts_with(':') {
            continue;
        }

        let after_colons = rest.trim_start_matches(':');
        let after_space = after_colons.trim_start();
        let value = after_space.trim_end();
        let value_start = body.len() - after_space.len();

        let (value, value_start) = match unquote(value) {
            Some(inner) => (inner, value_start + 1),
            None => (value, value_start),
        };

        let start = line_start + value_start;
        return Some(Watermark {
            value: value.to_string(),
            range: start..start + value.len(),
        });
    }
    None
}

fn unquote(value: &str) -> Option<&str> {
    ['"', '\''].into_iter().find_map(|quote| {
        value
            .strip_prefix(quote)
            .and_then(|inner| inner.strip_suffix(quote))
    })
}

pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Runs one reconciliation pass for `raindrop`, whose note lives at `path`.
pub async fn reconcile(
    path: &Path,
    raindrop: &Raindrop,
    collection: &Collection,
    renderer: &dyn Renderer,
    policy: ReplacePolicy,
) -> Result<Reconciled, NoteError> {
    let (state, original) = match fs::read_to_string(path).await {
        Ok(content) => (NoteState::Present, content),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            (NoteState::Absent, renderer.render_header(raindrop, collection))
        }
        Err(e) => return Err(NoteError::io(path, e)),
    };

    let watermark = find_watermark(&original).ok_or_else(|| NoteError::WatermarkMissing {
        path: path.to_path_buf(),
    })?;
    let note_key = compare_key(&watermark.value)?;
    let advances = parse_timestamp(&raindrop.last_update)? > parse_timestamp(&watermark.value)?;

    let mut blocks = Vec::new();
    for highlight in &raindrop.highlights {
        if compare_key(&highlight.created)? <= note_key {
            continue;
        }
        blocks.push(renderer.render_highlight(raindrop, highlight));
    }

    let mut content = original.clone();
    let final_watermark = if advances {
        content.replace_range(watermark.range.clone(), &raindrop.last_update);
        raindrop.last_update.clone()
    } else {
        watermark.value.clone()
    };

    if !blocks.is_empty() && !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    for block in &blocks {
        content.push_str(block);
    }

    let written = state == NoteState::Absent || content != original;
    if written {
        write_atomically(path, &content, policy).await?;
    }

    tracing::debug!(
        path = %path.display(),
        raindrop_id = raindrop.id,
        state = ?state,
        appended = blocks.len(),
        watermark = %final_watermark,
        written,
        "reconciled note"
    );

    Ok(Reconciled {
        state,
        appended: blocks.len(),
        watermark: final_watermark,
        written,
    })
}

/// Writes `content` to the temp sibling of `path`, then renames it over `path`.
/// A temp file left behind by an interrupted run is simply overwritten.
pub async fn write_atomically(path: &Path, content: &str, policy: ReplacePolicy) -> Result<(), NoteError> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| NoteError::io(parent, e))?;
    }

    let tmp = temp_path(path);
    let write_result: std::io::Result<()> = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp).await;
        return Err(NoteError::io(&tmp, e));
    }

    replace_with_retry(&tmp, path, policy).await
}

async fn replace_with_retry(tmp: &Path, path: &Path, policy: ReplacePolicy) -> Result<(), NoteError> {
    let attempts = policy.attempts.max(1);
    let mut delay = policy.backoff;
    let mut attempt = 1;

    loop {
        match fs::rename(tmp, path).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= attempts => {
                let _ = fs::remove_file(tmp).await;
                return Err(NoteError::ReplaceExhausted {
                    path: path.to_path_buf(),
                    attempts,
                    source: e,
                });
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "failed to replace note, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static APOSTROPHES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"['’`]").unwrap());
static SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w]+").unwrap());

const SEPARATOR: char = '-';
/// Keeps `<id> - <title>.md` well under common 255-byte filename limits.
const MAX_NAME_CHARS: usize = 120;
const UNTITLED: &str = "Untitled";

/// Folds `value` to ASCII, dropping characters with no ASCII decomposition.
/// With `allow_unicode` the text is only NFKC-normalised.
pub fn fold_text(value: &str, allow_unicode: bool) -> String {
    if allow_unicode {
        value.nfkc().collect()
    } else {
        value.nfkd().filter(char::is_ascii).collect()
    }
}

pub fn slugify(value: &str) -> String {
    slugify_with(value, false)
}

/// Lowercases, collapses every run of whitespace or punctuation into one `-`
/// and trims separators from both ends. Never fails; may return an empty string.
pub fn slugify_with(value: &str, allow_unicode: bool) -> String {
    let folded = fold_text(value, allow_unicode).to_lowercase();
    let folded = APOSTROPHES.replace_all(&folded, "");
    let slug = SEPARATORS.replace_all(&folded, "-");
    slug.trim_matches(|c: char| c == SEPARATOR || c == '_').to_string()
}

/// Slug with every word capitalised, e.g. `Hello, world!` becomes `Hello-World`.
pub fn find_valid_filename(orig: &str, sep: &str) -> String {
    slugify(orig)
        .split(SEPARATOR)
        .filter(|word| !word.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(sep)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn display_name(title: &str) -> String {
    let name = find_valid_filename(title, "-");
    let truncated: String = name.chars().take(MAX_NAME_CHARS).collect();
    let truncated = truncated.trim_end_matches(SEPARATOR);
    if truncated.is_empty() {
        UNTITLED.to_string()
    } else {
        truncated.to_string()
    }
}

pub fn collection_dir(root: &Path, collection_title: &str) -> PathBuf {
    root.join(display_name(collection_title))
}

/// `<root>/<CollectionTitle>/<raindrop_id> - <Raindrop-Title>.md`
pub fn note_path(root: &Path, collection_title: &str, raindrop_id: i64, title: &str) -> PathBuf {
    collection_dir(root, collection_title).join(format!("{} - {}.md", raindrop_id, display_name(title)))
}

//!
//! src/text.rs  Andrew Belles  Oct 5th, 2025
//!
//! Text repair for titles/artists scraped from chart pages, plus the
//! title transforms used to build catalog search queries
//!

use std::sync::LazyLock;

use regex::Regex;
use scraper::Html;
use unicode_normalization::UnicodeNormalization;

static PARENTHETICAL: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\([^()]*\)"));
static WHITESPACE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\s+"));

/// Decode html entities (`&amp;`, `&#39;`) by letting the html5 parser do it.
/// Angle brackets are escaped first so text like `<3` survives
fn unescape_html(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let guarded = text.replace('<', "&lt;").replace('>', "&gt;");
    let fragment = Html::parse_fragment(&guarded);
    fragment.root_element().text().collect()
}

/// Undo utf-8 bytes that were decoded as latin-1 ("BeyoncÃ©" -> "Beyoncé").
/// Leaves the text untouched when it is not a clean round trip
fn repair_double_encoding(text: &str) -> String {
    if text.is_ascii() || text.chars().any(|c| c as u32 > 0xFF) {
        return text.to_string();
    }
    let bytes: Vec<u8> = text.chars().map(|c| c as u32 as u8).collect();
    match String::from_utf8(bytes) {
        Ok(repaired) => repaired,
        Err(_) => text.to_string()
    }
}

fn is_smart_punctuation(c: char) -> bool {
    matches!(c, '\u{00A0}' | '\u{2010}'..='\u{205E}')
}

/// Smart quotes, dashes, ellipses and odd spaces to their ascii forms;
/// letters keep their diacritics
fn ascii_punctuation(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if is_smart_punctuation(c) {
            out.push_str(any_ascii::any_ascii_char(c));
        } else {
            out.push(c);
        }
    }
    out
}

/// Full repair pipeline applied to every scraped text field
pub fn clean_text(text: &str) -> String {
    let unescaped = unescape_html(text);
    let repaired  = repair_double_encoding(&unescaped);
    let composed: String = repaired.nfc().collect();
    let ascii = ascii_punctuation(&composed);
    collapse_whitespace(&ascii)
}

pub fn collapse_whitespace(text: &str) -> String {
    match WHITESPACE.as_ref() {
        Ok(re) => re.replace_all(text.trim(), " ").into_owned(),
        Err(_) => text.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Removes every non-nested `( ... )` group, e.g. "(feat. X)" or "(Remix)"
pub fn strip_parentheticals(title: &str) -> String {
    let stripped = match PARENTHETICAL.as_ref() {
        Ok(re) => re.replace_all(title, "").into_owned(),
        Err(_) => title.to_string()
    };
    collapse_whitespace(&stripped)
}

/// Cache key shared by the isrc and youtube lookups
pub fn search_key(title: &str, artist: &str) -> String {
    format!("{title}|{artist}")
}

/// Case-insensitive relevance check of a search hit against a track. The
/// hit matches on the title or on any comma separated artist name
pub fn hit_matches(hit_title: &str, title: &str, artist: &str) -> bool {
    let hit = hit_title.to_lowercase();
    let title = title.trim().to_lowercase();
    if !title.is_empty() && hit.contains(&title) {
        return true;
    }
    artist
        .split(',')
        .map(|a| a.trim().to_lowercase())
        .filter(|a| !a.is_empty())
        .any(|a| hit.contains(&a))
}

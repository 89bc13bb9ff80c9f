//! Fixed mapping between remote emotion keys and home-side emoji.

const TABLE: &[(&str, &str)] = &[
    ("like", "👍"),
    ("heart", "❤️"),
    ("laugh", "😆"),
    ("surprised", "😮"),
    ("sad", "😢"),
    ("angry", "😡"),
    ("clap", "👏"),
    ("fire", "🔥"),
];

const VARIATION_SELECTOR: char = '\u{FE0F}';

pub fn emoji_for_key(key: &str) -> Option<&'static str> {
    TABLE
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, emoji)| *emoji)
}

/// Reverse lookup. Emoji presentation selectors are ignored, so "❤" and
/// "❤️" both map to `heart`.
pub fn key_for_emoji(emoji: &str) -> Option<&'static str> {
    let wanted = strip_selector(emoji);
    TABLE
        .iter()
        .find(|(_, e)| strip_selector(e) == wanted)
        .map(|(key, _)| *key)
}

fn strip_selector(s: &str) -> String {
    s.chars().filter(|c| *c != VARIATION_SELECTOR).collect()
}

use regex::Regex;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

/// Room left for an extension and a `_slide_N` / `_caption` suffix.
pub const MAX_FILENAME_LEN: usize = 255 - 10;

const FALLBACK_NAME: &str = "download";

fn forbidden() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s.\-]").expect("static regex"))
}

/// Turns a display name into something every filesystem accepts.
///
/// Names are NFKD-decomposed first so accented letters keep their ASCII
/// base. Characters outside word/space/dot/dash become `_` and whatever is
/// still non-ASCII is dropped. The result is capped at [`MAX_FILENAME_LEN`] bytes.
pub fn sanitize_filename(name: &str) -> String {
    let decomposed: String = name.nfkd().collect();
    let replaced = forbidden().replace_all(&decomposed, "_");
    let ascii: String = replaced
        .chars()
        .filter(|c| c.is_ascii())
        .map(|c| if c.is_ascii_control() { '_' } else { c })
        .collect();

    let mut out = sanitize_filename::sanitize_with_options(
        ascii.trim(),
        sanitize_filename::Options { windows: true, truncate: false, replacement: "_" },
    );
    if out.len() > MAX_FILENAME_LEN {
        out.truncate(MAX_FILENAME_LEN);
    }

    let out = out.trim().trim_end_matches('.').to_string();
    if out.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        out
    }
}

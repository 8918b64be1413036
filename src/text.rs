use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_PREVIEW_CHARS: usize = 200;

static FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*(```|~~~).*$").expect("valid fence regex"));
static IMAGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").expect("valid image regex"));
static LINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("valid link regex"));
static LINE_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s{0,3}(#{1,6}\s+|>\s?|[-*+]\s+\[[ xX]\]\s+|[-*+]\s+|\d+[.)]\s+)")
        .expect("valid line prefix regex")
});
// Markers only count when they wrap text, so `snake_case` and `2*3` survive.
static INLINE_MARKS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\*\*([^*\n]+?)\*\*", "$1"),
        (r"~~([^~\n]+?)~~", "$1"),
        (r"`([^`\n]+)`", "$1"),
        (r"\*([^*\s](?:[^*\n]*[^*\s])?)\*", "$1"),
        (r"(^|\W)__([^_\n]+?)__(\W|$)", "$1$2$3"),
        (r"(^|\W)_([^_\s](?:[^_\n]*[^_\s])?)_(\W|$)", "$1$2$3"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).expect("valid inline regex"), replacement))
    .collect()
});
static HTML_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?[A-Za-z][^>]*>").expect("valid html regex"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Strips markdown syntax so the result reads as plain text.
pub fn strip_markdown(input: &str) -> String {
    let text = FENCE_RE.replace_all(input, "");
    let text = IMAGE_RE.replace_all(&text, "$1");
    let text = LINK_RE.replace_all(&text, "$1");
    let text = LINE_PREFIX_RE.replace_all(&text, "");
    let text = HTML_TAG_RE.replace_all(&text, "");
    let text = INLINE_MARKS
        .iter()
        .fold(text.into_owned(), |text, (re, replacement)| re.replace_all(&text, *replacement).into_owned());
    WHITESPACE_RE.replace_all(&text, " ").trim().to_string()
}

/// First `max_chars` characters of the plain-text body.
pub fn derive_preview(body: &str, max_chars: usize) -> String {
    strip_markdown(body).chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::{derive_preview, strip_markdown};

    #[test]
    fn strips_common_markdown() {
        let body = "# Title\n\n- [x] **done** item\n> quoted `code`\n[link](https://example.com) ![alt](img.png)";
        assert_eq!(strip_markdown(body), "Title done item quoted code link alt");
    }

    #[test]
    fn preview_is_bounded_by_chars_not_bytes() {
        let body = "é".repeat(300);
        let preview = derive_preview(&body, 200);
        assert_eq!(preview.chars().count(), 200);
    }

    #[test]
    fn keeps_unpaired_markers_in_plain_text() {
        assert_eq!(strip_markdown("rename snake_case_id to 2*3 now"), "rename snake_case_id to 2*3 now");
        assert_eq!(
            strip_markdown("an *emphasised* and _underlined_ word, __strong__ too"),
            "an emphasised and underlined word, strong too"
        );
        assert_eq!(derive_preview("use my_var_name", 200), "use my_var_name");
    }

    #[test]
    fn drops_code_fences() {
        assert_eq!(strip_markdown("```rust\nlet x = 1;\n```"), "let x = 1;");
    }
}

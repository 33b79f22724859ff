//! Reply-hidden content handling for stored post markdown.
//!
//! The authoring UI marks a hidden region with a blockquote line carrying an
//! image whose alt text is `^mbbs_reply_visible_tag^`. Everything in the
//! blockquote run after that line is visible only to repliers and editors;
//! other viewers get a placeholder stating how many characters are hidden.
//! The marker syntax is a wire convention shared with the editor and must be
//! matched exactly.

use once_cell::sync::Lazy;
use regex::Regex;

pub const REPLY_VISIBLE_TAG: &str = "^mbbs_reply_visible_tag^";

static RE_REPLY_HIDDEN_MARK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"> !\[\^mbbs_reply_visible_tag\^\]\(.+\)").unwrap());
static RE_QUOTE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*>").unwrap());
static RE_QUOTE_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*> ?").unwrap());
static RE_HIDDEN_BLOCKQUOTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<blockquote\b[^>]*>.*?</blockquote>").unwrap());
static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\s\n]").unwrap());

/// True iff the source contains a well-formed reply-hidden marker line.
pub fn markdown_has_reply_hidden_content(markdown: &str) -> bool {
    RE_REPLY_HIDDEN_MARK.is_match(markdown)
}

/// Plain-text rendition of stored content (the stored markdown is HTML in
/// practice). Hidden blockquote regions are erased before text extraction so
/// they never leak into the search index. Never errors: any conversion
/// failure degrades to an empty string.
pub fn markdown_to_pure_text(markdown: &str) -> String {
    if markdown.is_empty() {
        return String::new();
    }
    let without_hidden = RE_HIDDEN_BLOCKQUOTE.replace_all(markdown, |caps: &regex::Captures| {
        if caps[0].contains(REPLY_VISIBLE_TAG) {
            String::new()
        } else {
            caps[0].to_string()
        }
    });
    // blockquote markers are syntax, not content
    let unquoted = RE_QUOTE_PREFIX.replace_all(&without_hidden, "");
    match html2text::from_read(unquoted.as_bytes(), 200) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("markdown to text conversion failed: {e}");
            String::new()
        }
    }
}

/// Replaces every hidden blockquote run with a one-line summary stating the
/// number of hidden characters. Lines outside hidden runs pass through in
/// their original order; inputs without the marker come back unchanged.
pub fn filter_markdown_hidden_content(markdown: &str) -> String {
    let mut in_filter = false;
    let mut content_lines: Vec<String> = Vec::new();
    let mut filtered_lines: Vec<&str> = Vec::new();
    for line in markdown.split('\n') {
        if in_filter {
            if RE_QUOTE_LINE.is_match(line) {
                filtered_lines.push(line);
            } else {
                content_lines.push(hidden_summary(&filtered_lines));
                in_filter = false;
                filtered_lines.clear();
                content_lines.push(line.to_string());
            }
        } else if line.contains("> ![^mbbs_reply_visible_tag^]") {
            in_filter = true;
            content_lines.push(line.to_string());
        } else {
            content_lines.push(line.to_string());
        }
    }
    if !filtered_lines.is_empty() {
        // hidden run reached end of input
        content_lines.push(hidden_summary(&filtered_lines));
    }
    content_lines.join("\n")
}

fn hidden_summary(filtered_lines: &[&str]) -> String {
    let text = markdown_to_pure_text(&filtered_lines.join("\n"));
    let count = RE_WHITESPACE.replace_all(&text, "").chars().count();
    format!("> （有隐藏内容共 {count} 字，评论后可见）\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_well_formed_marker_only() {
        assert!(markdown_has_reply_hidden_content(
            "> ![^mbbs_reply_visible_tag^](x.png)"
        ));
        assert!(markdown_has_reply_hidden_content(
            "before\n> ![^mbbs_reply_visible_tag^](/res/a.png)\n> hidden"
        ));
        // missing closing caret
        assert!(!markdown_has_reply_hidden_content(
            "> ![^mbbs_reply_visible_tag](x.png)"
        ));
        // no url
        assert!(!markdown_has_reply_hidden_content(
            "> ![^mbbs_reply_visible_tag^]()"
        ));
        // not a blockquote
        assert!(!markdown_has_reply_hidden_content(
            "![^mbbs_reply_visible_tag^](x.png)"
        ));
        assert!(!markdown_has_reply_hidden_content("plain text"));
    }

    #[test]
    fn filter_passes_unmarked_input_through() {
        let md = "# title\n\nsome text\n> a normal quote\nend";
        assert_eq!(filter_markdown_hidden_content(md), md);
    }

    #[test]
    fn filter_replaces_hidden_run_with_summary() {
        let md = "> ![^mbbs_reply_visible_tag^](x.png)\n> secret\n> text\nafter";
        let out = filter_markdown_hidden_content(md);
        assert_eq!(
            out,
            "> ![^mbbs_reply_visible_tag^](x.png)\n> （有隐藏内容共 10 字，评论后可见）\n\nafter"
        );
    }

    #[test]
    fn filter_handles_hidden_run_at_end_of_input() {
        let md = "intro\n> ![^mbbs_reply_visible_tag^](x.png)\n> abc";
        let out = filter_markdown_hidden_content(md);
        assert!(out.starts_with("intro\n> ![^mbbs_reply_visible_tag^](x.png)\n"));
        assert!(out.contains("有隐藏内容共 3 字"));
    }

    #[test]
    fn summary_counts_non_whitespace_chars() {
        let md = "> ![^mbbs_reply_visible_tag^](x.png)\n>  a b \n> c\nend";
        let out = filter_markdown_hidden_content(md);
        assert!(out.contains("有隐藏内容共 3 字"), "got: {out}");
    }

    #[test]
    fn pure_text_erases_hidden_blockquote_html() {
        let html = "<p>visible</p><blockquote><p><img alt=\"^mbbs_reply_visible_tag^\" src=\"x.png\"></p><p>secret</p></blockquote><p>tail</p>";
        let text = markdown_to_pure_text(html);
        assert!(text.contains("visible"));
        assert!(text.contains("tail"));
        assert!(!text.contains("secret"));
    }

    #[test]
    fn pure_text_keeps_ordinary_blockquotes() {
        let html = "<blockquote><p>quoted words</p></blockquote>";
        let text = markdown_to_pure_text(html);
        assert!(text.contains("quoted words"));
    }

    #[test]
    fn pure_text_of_empty_input_is_empty() {
        assert_eq!(markdown_to_pure_text(""), "");
    }
}

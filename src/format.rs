//! Content formatting - turns a source post into destination-safe text
//!
//! The HTML body is flattened to plain text, cut to [`CONTENT_BUDGET`]
//! characters, and the permalink is appended after a single space.

use crate::post::RawPost;
use scraper::{ElementRef, Html};

/// Characters of post text kept before the permalink.
///
/// Destination limit is 300; 50 are reserved for the ellipsis, a space and a
/// permalink of up to 48 characters. Fixed, not derived from the actual URL.
pub const CONTENT_BUDGET: usize = 250;

/// Appended to text cut at [`CONTENT_BUDGET`]
pub const ELLIPSIS: char = '\u{2026}';

/// Format a post for publishing: plain text, truncated, permalink appended
pub fn format_post(post: &RawPost) -> String {
    let text = html_to_text(&post.content);
    let mut message = truncate_content(&text);
    message.push(' ');
    message.push_str(&post.url);
    message
}

/// Cut `text` to [`CONTENT_BUDGET`] characters, marking the cut with [`ELLIPSIS`]
pub fn truncate_content(text: &str) -> String {
    match text.char_indices().nth(CONTENT_BUDGET) {
        Some((cut, _)) => {
            let mut truncated = text[..cut].to_string();
            truncated.push(ELLIPSIS);
            truncated
        }
        None => text.to_string(),
    }
}

/// Render an HTML fragment as plain text.
///
/// Entities are decoded, whitespace runs collapse to one space, paragraphs
/// become blank-line separated and `<br>` becomes a newline. Headings are
/// upper-cased and list items start with ` * `. Links render as their visible
/// text only. No line wrapping is applied.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut renderer = PlainText::default();
    renderer.element(fragment.root_element());
    renderer.out
}

/// Written before the text of each list item
const LIST_ITEM_PREFIX: &str = " * ";

#[derive(Default)]
struct PlainText {
    out: String,
    pending_newlines: usize,
    pending_space: bool,
    pending_prefix: Option<&'static str>,
    heading_depth: usize,
}

impl PlainText {
    fn element(&mut self, element: ElementRef<'_>) {
        let name = element.value().name();
        match name {
            "br" => {
                self.pending_newlines += 1;
                return;
            }
            "script" | "style" | "template" => return,
            _ => {}
        }

        let breaks = block_breaks(name);
        self.request_breaks(breaks);

        let heading = is_heading(name);
        if heading {
            self.heading_depth += 1;
        }
        if name == "li" {
            self.pending_prefix = Some(LIST_ITEM_PREFIX);
        }

        for child in element.children() {
            if let Some(child_element) = ElementRef::wrap(child) {
                self.element(child_element);
            } else if let Some(text) = child.value().as_text() {
                self.text(text);
            }
        }

        if heading {
            self.heading_depth -= 1;
        }
        // An empty item must not mark the following text
        if name == "li" {
            self.pending_prefix = None;
        }
        self.request_breaks(breaks);
    }

    fn request_breaks(&mut self, breaks: usize) {
        self.pending_newlines = self.pending_newlines.max(breaks);
    }

    fn text(&mut self, text: &str) {
        for ch in text.chars() {
            if is_collapsible(ch) {
                self.pending_space = true;
                continue;
            }

            // Leading breaks and spaces are dropped
            if !self.out.is_empty() {
                if self.pending_newlines > 0 {
                    self.out.extend(std::iter::repeat('\n').take(self.pending_newlines));
                } else if self.pending_space {
                    self.out.push(' ');
                }
            }

            if let Some(prefix) = self.pending_prefix.take() {
                self.out.push_str(prefix);
            }

            self.pending_newlines = 0;
            self.pending_space = false;
            if self.heading_depth > 0 {
                self.out.extend(ch.to_uppercase());
            } else {
                self.out.push(ch);
            }
        }
    }
}

/// Newlines requested before and after a block element
fn block_breaks(name: &str) -> usize {
    match name {
        "p" | "blockquote" | "pre" | "ul" | "ol" | "table" | "h1" | "h2" | "h3" | "h4" | "h5"
        | "h6" => 2,
        "div" | "li" | "tr" | "hr" => 1,
        _ => 0,
    }
}

fn is_heading(name: &str) -> bool {
    matches!(name, "h1" | "h2" | "h3" | "h4" | "h5" | "h6")
}

/// HTML whitespace; no-break spaces are content
fn is_collapsible(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\n' | '\r' | '\x0c')
}

//! Post-processing of model output before it is shown in Telegram.
//!
//! Two strategies exist. Strip mode removes every trace of markup and yields
//! plain text. Convert mode turns a small Markdown subset into Telegram HTML
//! (`<b>`, `<i>`, `<tg-spoiler>`) after escaping everything else.

use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use tracing::warn;

/// Default phrases rendered in italics.
pub const DEFAULT_EMPHASIS_TRIGGERS: &[&str] = &["Важно:", "Запомни:", "Обрати внимание:"];

/// Default phrases that hide the rest of the answer behind a spoiler, by priority.
pub const DEFAULT_SPOILER_TRIGGERS: &[&str] = &["Ответ:", "РЕШЕНИЕ:"];

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*?>").unwrap());
static HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#{1,6}[^\S\n]+").unwrap());
static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.*?)\*\*").unwrap());
static MARKUP_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(/?)(b|i|tg-spoiler)>").unwrap());

/// House style for replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatMode {
    /// Model writes plain text; leftover markup is removed.
    Strip,
    /// Model writes light Markdown; it is converted to Telegram HTML.
    #[default]
    Convert,
}

/// A reply ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// Text to send.
    pub text: String,
    /// `text` must be sent with HTML parse mode.
    pub html: bool,
    /// Plain-text rendition, sent when Telegram rejects the HTML.
    pub plain: String,
}

impl Rendered {
    pub fn plain(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            plain: text.clone(),
            text,
            html: false,
        }
    }
}

/// Configured sanitizer.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    mode: FormatMode,
    emphasis_triggers: Vec<String>,
    spoiler_triggers: Vec<String>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(
            FormatMode::default(),
            DEFAULT_EMPHASIS_TRIGGERS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_SPOILER_TRIGGERS.iter().map(|s| s.to_string()).collect(),
        )
    }
}

impl Sanitizer {
    pub fn new(
        mode: FormatMode,
        emphasis_triggers: Vec<String>,
        spoiler_triggers: Vec<String>,
    ) -> Self {
        Self {
            mode,
            emphasis_triggers,
            spoiler_triggers,
        }
    }

    /// Render raw model output in the configured mode.
    ///
    /// The plain rendition is computed first so a fallback always exists. In
    /// convert mode, output whose tags do not nest is replaced by it.
    pub fn render(&self, raw: &str) -> Rendered {
        let plain = strip_markup(raw);
        match self.mode {
            FormatMode::Strip => Rendered::plain(plain),
            FormatMode::Convert => {
                let html = self.convert_markup(raw);
                if is_well_formed(&html) {
                    Rendered {
                        text: html,
                        html: true,
                        plain,
                    }
                } else {
                    warn!("Converted reply has unbalanced tags, sending plain text");
                    Rendered::plain(plain)
                }
            }
        }
    }

    /// Convert light Markdown into Telegram HTML.
    pub fn convert_markup(&self, text: &str) -> String {
        let escaped = escape_html(text);
        let bolded = BOLD.replace_all(&escaped, "<b>${1}</b>");
        let cleaned = bolded.replace('*', "");
        let mut html = layout_paragraphs(&cleaned);

        for phrase in &self.emphasis_triggers {
            let needle = escape_html(phrase);
            if needle.is_empty() {
                continue;
            }
            html = html.replace(&needle, &format!("<i>{needle}</i>"));
        }

        let spoiler = self
            .spoiler_triggers
            .iter()
            .map(|t| escape_html(t))
            .find(|t| !t.is_empty() && html.contains(t.as_str()));
        if let Some(trigger) = spoiler {
            html = wrap_spoiler(&html, &trigger);
        }

        html
    }
}

/// Remove tags, emphasis markers and heading markers; trim.
///
/// The result never contains `<`, `*`, a backtick, or a line starting with
/// `#{1,6}` followed by whitespace.
pub fn strip_markup(text: &str) -> String {
    let without_tags = TAG.replace_all(text, "");
    let mut text = without_tags.replace(['<', '*', '`'], "");
    // Removing one marker can expose another, e.g. "# # x".
    while HEADING.is_match(&text) {
        text = HEADING.replace_all(&text, "").into_owned();
    }
    text.trim().to_string()
}

/// Escape the characters meaningful to Telegram HTML.
pub fn escape_html(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '&' => result.push_str("&amp;"),
            _ => result.push(c),
        }
    }
    result
}

/// Check that `<b>`, `<i>` and `<tg-spoiler>` open and close in order.
pub fn is_well_formed(html: &str) -> bool {
    let mut open: Vec<&str> = Vec::new();
    for caps in MARKUP_TAG.captures_iter(html) {
        let name = caps.get(2).map_or("", |m| m.as_str());
        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        if !closing {
            open.push(name);
        } else if open.pop() != Some(name) {
            return false;
        }
    }
    open.is_empty()
}

/// First non-empty line becomes a bold header; every line becomes its own paragraph.
fn layout_paragraphs(text: &str) -> String {
    let mut lines = text.split('\n').map(str::trim).filter(|l| !l.is_empty());
    let Some(first) = lines.next() else {
        return String::new();
    };

    // A line opening with bold keeps its own emphasis; wrapping it again would nest <b>.
    let header = if first.starts_with("<b>") {
        first.to_string()
    } else {
        format!("<b>{first}</b>")
    };

    std::iter::once(header)
        .chain(lines.map(str::to_string))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Hide everything after the first `trigger` in a spoiler, labelled in bold.
///
/// A bold span wrapping the trigger is dropped in favour of the label. Tags
/// still open at the split are closed before it and reopened in the spoiler.
fn wrap_spoiler(text: &str, trigger: &str) -> String {
    let Some((mut before, after)) = text.split_once(trigger) else {
        return text.to_string();
    };
    let mut open = open_tags(before);
    let mut after = after.to_string();
    if let Some(rest) = before.strip_suffix("<b>") {
        before = rest;
        open.pop();
        after = remove_unmatched_close(&after, "b");
    }

    let closers: String = open.iter().rev().map(|t| format!("</{t}>")).collect();
    let mut answer = after.trim();
    // Spans that end right at the trigger need no reopening.
    loop {
        let Some(close) = open.last().map(|t| format!("</{t}>")) else {
            break;
        };
        let Some(rest) = answer.strip_prefix(close.as_str()) else {
            break;
        };
        answer = rest.trim_start();
        open.pop();
    }
    if TAG.replace_all(answer, "").trim().is_empty() {
        return text.to_string();
    }

    let openers: String = open.iter().map(|t| format!("<{t}>")).collect();
    let reveal = format!("<b>{trigger}</b> <tg-spoiler>{openers}{answer}</tg-spoiler>");
    let before = before.trim_end();
    if TAG.replace_all(before, "").trim().is_empty() {
        reveal
    } else {
        format!("{before}{closers}\n\n{reveal}")
    }
}

/// Names of the markup tags left open at the end of `html`, outermost first.
fn open_tags(html: &str) -> Vec<String> {
    let mut open = Vec::new();
    for caps in MARKUP_TAG.captures_iter(html) {
        let name = caps.get(2).map_or("", |m| m.as_str());
        if caps.get(1).is_some_and(|m| !m.as_str().is_empty()) {
            open.pop();
        } else {
            open.push(name.to_string());
        }
    }
    open
}

/// Remove the first `</name>` that closes a tag opened before `html` starts.
fn remove_unmatched_close(html: &str, name: &str) -> String {
    let mut depth = 0usize;
    for caps in MARKUP_TAG.captures_iter(html) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if !caps.get(1).is_some_and(|m| !m.as_str().is_empty()) {
            depth += 1;
        } else if depth > 0 {
            depth -= 1;
        } else {
            if caps.get(2).is_some_and(|m| m.as_str() == name) {
                return format!("{}{}", &html[..whole.start()], &html[whole.end()..]);
            }
            break;
        }
    }
    html.to_string()
}

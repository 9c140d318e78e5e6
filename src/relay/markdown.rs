//! Telegram MarkdownV2 rendering for model output.
//!
//! Model answers are ordinary Markdown. Telegram's MarkdownV2 parser rejects
//! any unescaped reserved character, so prose is escaped wholesale and fenced
//! code blocks are re-emitted with only `` ` `` and `\` escaped. Output is cut
//! into chunks that fit a single Telegram message.

use regex::Regex;
use std::sync::LazyLock;

/// Telegram allows 4096 characters per message; keep some headroom.
pub const MAX_CHUNK_CHARS: usize = 4000;

/// Characters with special meaning in MarkdownV2 outside code.
const RESERVED: &str = r"_*[]()~`>#+-=|{}.!\";

static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```([A-Za-z0-9_+\-]*)\n?(.*?)```").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Code { lang: String, code: String },
}

/// Escape every reserved MarkdownV2 character.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    for c in text.chars() {
        if RESERVED.contains(c) {
            result.push('\\');
        }
        result.push(c);
    }
    result
}

/// Escape for use inside `code` or ```pre``` entities.
pub fn escape_code(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '`' || c == '\\' {
            result.push('\\');
        }
        result.push(c);
    }
    result
}

/// Undo escaping so a chunk can be resent as plain text.
pub fn strip_escapes(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                result.push(next);
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Split model output into prose and fenced code. Whitespace-only prose is dropped.
pub fn segments(text: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut last = 0;

    for caps in CODE_BLOCK.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        push_prose(&mut out, &text[last..whole.start()]);
        let lang = caps.get(1).map_or("", |m| m.as_str()).to_string();
        let code = caps
            .get(2)
            .map_or("", |m| m.as_str())
            .trim_end_matches('\n')
            .to_string();
        out.push(Segment::Code { lang, code });
        last = whole.end();
    }
    push_prose(&mut out, &text[last..]);
    out
}

fn push_prose(out: &mut Vec<Segment>, prose: &str) {
    if !prose.trim().is_empty() {
        out.push(Segment::Text(prose.to_string()));
    }
}

/// Render model output into MarkdownV2 chunks, each at most [`MAX_CHUNK_CHARS`].
pub fn render(text: &str) -> Vec<String> {
    render_with_limit(text, MAX_CHUNK_CHARS)
}

fn render_with_limit(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    for segment in segments(text) {
        match segment {
            Segment::Text(prose) => {
                chunks.extend(split_chunks(&escape_markdown_v2(&prose), max_chars));
            }
            Segment::Code { lang, code } => {
                // "```lang\n" + "\n```"
                if code.trim().is_empty() {
                    chunks.push(format!("```{lang}\n\n```"));
                    continue;
                }
                let fence = lang.chars().count() + 8;
                let budget = max_chars.saturating_sub(fence).max(1);
                for piece in split_chunks(&escape_code(&code), budget) {
                    chunks.push(format!("```{lang}\n{piece}\n```"));
                }
            }
        }
    }
    chunks
}

/// Split `text` into pieces of at most `max_chars` characters, preferring
/// paragraph, line, sentence and word boundaries in the second half of each
/// window. A hard cut never separates a backslash from the character it escapes.
pub fn split_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > max_chars {
        let limit = rest
            .char_indices()
            .nth(max_chars)
            .map_or(rest.len(), |(idx, _)| idx);
        let window = &rest[..limit];

        let mut split = None;
        for sep in ["\n\n", "\n", ". ", " "] {
            if let Some(pos) = window.rfind(sep)
                && pos > limit / 2
            {
                split = Some(pos + sep.len());
                break;
            }
        }
        let split = split.unwrap_or_else(|| hard_cut(window));

        chunks.push(rest[..split].to_string());
        rest = &rest[split..];
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Cut at the end of `window`, stepping back one byte if that would leave a
/// dangling escape backslash.
fn hard_cut(window: &str) -> usize {
    let trailing = window.bytes().rev().take_while(|&b| b == b'\\').count();
    if trailing % 2 == 1 && window.len() > 1 {
        window.len() - 1
    } else {
        window.len()
    }
}

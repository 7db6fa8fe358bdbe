//! Splitting reply text into renderable segments and speakable sentences.
//!
//! Display text mixes three kinds of content:
//!
//! ````text
//! [waves] Hello! Here is the snippet:
//! ```rust
//! fn main() {}
//! ```
//! ````
//!
//! `[...]` is a stage direction (action), fenced blocks are code, the rest is
//! plain text. Brackets inside a code fence are code, not actions.

use serde::Serialize;

const FENCE: &str = "```";

/// Kind of a display segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// Bracketed stage direction, e.g. `[waves]`.
    Action,
    /// Plain prose.
    Text,
    /// Fenced code block (fence and language tag removed).
    Code,
}

/// A run of display text of one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySegment {
    pub kind: SegmentKind,
    pub content: String,
}

impl DisplaySegment {
    fn new(kind: SegmentKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }
}

/// Split display text into action, text and code segments, in order.
///
/// Empty segments are dropped. An unterminated `[` is plain text; an
/// unterminated fence runs to the end of the input.
pub fn split_display(text: &str) -> Vec<DisplaySegment> {
    let mut segments = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let fence_at = rest.find(FENCE);
        let bracket_at = rest.find('[');
        let next = match (fence_at, bracket_at) {
            (Some(f), Some(b)) => Some(f.min(b)),
            (f, b) => f.or(b),
        };
        let Some(start) = next else {
            push_text(&mut segments, rest);
            break;
        };

        push_text(&mut segments, &rest[..start]);
        let tail = &rest[start..];

        if Some(start) == fence_at {
            let body = &tail[FENCE.len()..];
            let (code, after) = match body.find(FENCE) {
                Some(end) => (&body[..end], &body[end + FENCE.len()..]),
                None => (body, ""),
            };
            let code = strip_language_tag(code).trim_matches('\n').trim_end();
            if !code.trim().is_empty() {
                segments.push(DisplaySegment::new(SegmentKind::Code, code));
            }
            rest = after;
        } else {
            match tail.find(']') {
                Some(end) => {
                    let action = tail[1..end].trim();
                    if !action.is_empty() {
                        segments.push(DisplaySegment::new(SegmentKind::Action, action));
                    }
                    rest = &tail[end + 1..];
                }
                None => {
                    push_text(&mut segments, tail);
                    break;
                }
            }
        }
    }
    segments
}

/// Merge consecutive segments of the same kind so each run is one render call.
pub fn batch_segments(segments: Vec<DisplaySegment>) -> Vec<DisplaySegment> {
    let mut batched: Vec<DisplaySegment> = Vec::with_capacity(segments.len());
    for segment in segments {
        match batched.last_mut() {
            Some(last) if last.kind == segment.kind => {
                let sep = match segment.kind {
                    SegmentKind::Action => ", ",
                    SegmentKind::Text => " ",
                    SegmentKind::Code => "\n",
                };
                last.content.push_str(sep);
                last.content.push_str(&segment.content);
            }
            _ => batched.push(segment),
        }
    }
    batched
}

/// Text with stage directions and code blocks removed, whitespace collapsed.
pub fn strip_actions(text: &str) -> String {
    split_display(text)
        .into_iter()
        .filter(|s| s.kind == SegmentKind::Text)
        .map(|s| s.content)
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split speech text into sentences for incremental synthesis.
///
/// A sentence ends at `.`, `!`, `?` or `…` followed by whitespace (or the end
/// of input), or at a line break.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            flush_sentence(&mut sentences, &mut current);
            continue;
        }
        current.push(c);
        if matches!(c, '.' | '!' | '?' | '…') {
            // Swallow runs like "?!" or "..." before deciding.
            while let Some(&next) = chars.peek() {
                if matches!(next, '.' | '!' | '?' | '…' | '"' | '\'' | ')') {
                    current.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if chars.peek().is_none_or(|n| n.is_whitespace()) {
                flush_sentence(&mut sentences, &mut current);
            }
        }
    }
    flush_sentence(&mut sentences, &mut current);
    sentences
}

fn flush_sentence(sentences: &mut Vec<String>, current: &mut String) {
    let sentence = current.split_whitespace().collect::<Vec<_>>().join(" ");
    if !sentence.is_empty() {
        sentences.push(sentence);
    }
    current.clear();
}

fn push_text(segments: &mut Vec<DisplaySegment>, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        segments.push(DisplaySegment::new(SegmentKind::Text, text));
    }
}

fn strip_language_tag(code: &str) -> &str {
    match code.split_once('\n') {
        Some((first, body)) if !first.trim().is_empty() && !first.contains(char::is_whitespace) => {
            body
        }
        _ => code,
    }
}

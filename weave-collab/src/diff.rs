//! Text diffing: turn "old text + new text" into positional edit intents.
//!
//! UI widgets usually hand over the whole new buffer after each keystroke.
//! The diff trims the common prefix and suffix and reports what is left
//! as one delete followed by one insert. The prefix is capped at the
//! cursor hint so that edits inside runs of repeated characters are
//! attributed to where the user actually typed.
//!
//! Positions and lengths count Unicode scalar values, matching the CRDT
//! engine.

/// One positional edit against the old text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditIntent {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
}

/// Compute the edits that turn `old` into `new`.
///
/// Deletes come before inserts and both target the same position, so the
/// intents can be applied in order to `old` without adjusting offsets.
pub fn diff(old: &str, new: &str, cursor_hint: usize) -> Vec<EditIntent> {
    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();

    let shared = old.len().min(new.len());
    let max_prefix = shared.min(cursor_hint);
    let prefix = old
        .iter()
        .zip(new.iter())
        .take(max_prefix)
        .take_while(|(a, b)| a == b)
        .count();

    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let deleted = old.len() - prefix - suffix;
    let inserted: String = new[prefix..new.len() - suffix].iter().collect();

    let mut intents = Vec::with_capacity(2);
    if deleted > 0 {
        intents.push(EditIntent::Delete {
            position: prefix,
            length: deleted,
        });
    }
    if !inserted.is_empty() {
        intents.push(EditIntent::Insert {
            position: prefix,
            text: inserted,
        });
    }
    intents
}

/// Apply intents to a string. Mirrors what the engine does with them.
pub fn apply(text: &str, intents: &[EditIntent]) -> String {
    let mut chars: Vec<char> = text.chars().collect();
    for intent in intents {
        match intent {
            EditIntent::Delete { position, length } => {
                let start = (*position).min(chars.len());
                let end = position.saturating_add(*length).min(chars.len());
                chars.drain(start..end);
            }
            EditIntent::Insert { position, text } => {
                let at = (*position).min(chars.len());
                chars.splice(at..at, text.chars());
            }
        }
    }
    chars.into_iter().collect()
}

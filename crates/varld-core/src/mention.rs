// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Mention parsing and the response-selection predicate.
//!
//! `should_respond` is a pure, memoryless function: given a message and one
//! agent's identity it decides whether that agent replies.  Turn budgets are
//! deliberately not its concern.
//!
//! The rules, in evaluation order:
//! 1. never reply to yourself (or to a message you already answered this turn),
//! 2. system messages address everyone,
//! 3. when the message carries well-formed mentions, only the *first*
//!    mention counts, and only when it opens the message or a paragraph —
//!    a mid-text mention is a conversational reference, not an address,
//! 4. a mention-free human message is a broadcast to every agent,
//! 5. a mention-free agent message addresses no one (loop suppression).

use std::sync::OnceLock;

use regex::Regex;

/// Who authored a message, as far as the filter is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderKind {
    Human,
    Agent,
    System,
}

/// A well-formed `@name` token found in a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    /// The name without the leading `@`.
    pub name: String,
    /// Byte offset of the `@` in the message text.
    pub offset: usize,
}

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([A-Za-z][A-Za-z0-9_-]*)").expect("static regex"))
}

/// Extract all well-formed mentions in order of appearance.
///
/// A mention is `@` followed by a letter and then letters, digits, hyphens,
/// or underscores.  Malformed tokens (`@@`, `@123`, `@-x`) are ignored, as
/// are `@` signs embedded in a word (`user@host`).
pub fn extract_mentions(text: &str) -> Vec<Mention> {
    mention_re()
        .captures_iter(text)
        .filter_map(|cap| {
            let m = cap.get(0)?;
            let at = m.start();
            // Reject when the '@' is glued to a preceding word character or
            // another '@' — those are e-mail-like fragments, not mentions.
            if let Some(prev) = text[..at].chars().next_back() {
                if prev.is_alphanumeric() || prev == '@' || prev == '_' {
                    return None;
                }
            }
            Some(Mention {
                name: cap.get(1)?.as_str().to_string(),
                offset: at,
            })
        })
        .collect()
}

/// The first well-formed mention, if any.
pub fn first_mention(text: &str) -> Option<Mention> {
    extract_mentions(text).into_iter().next()
}

/// Whether the mention at `offset` opens the message or a paragraph: only
/// whitespace may separate it from the start of the text or the previous
/// newline.
fn is_paragraph_leading(text: &str, offset: usize) -> bool {
    let before = &text[..offset];
    match before.rfind('\n') {
        Some(nl) => before[nl + 1..].trim().is_empty(),
        None => before.trim().is_empty(),
    }
}

fn names_match(mention: &str, agent_id: &str, agent_name: &str) -> bool {
    mention.eq_ignore_ascii_case(agent_id) || mention.eq_ignore_ascii_case(agent_name)
}

/// Decide whether the agent identified by `agent_id`/`agent_name` replies to
/// a message.
///
/// `already_replied` covers the agent's own prior emission within the same
/// turn; the caller tracks it.
pub fn should_respond(
    agent_id: &str,
    agent_name: &str,
    content: &str,
    sender: &str,
    sender_kind: SenderKind,
    already_replied: bool,
) -> bool {
    // Rule 1: own messages and answered turns are never re-answered.
    if names_match(sender, agent_id, agent_name) || already_replied {
        return false;
    }

    // Rule 2: system messages address everyone.
    if sender_kind == SenderKind::System {
        return true;
    }

    let mentions = extract_mentions(content);
    if let Some(first) = mentions.first() {
        // Rules 4–6: only the first mention can address an agent, and only
        // when it opens the message or a paragraph.  Mentions after earlier
        // non-whitespace text are references; nobody replies on their
        // account.
        return is_paragraph_leading(content, first.offset)
            && names_match(&first.name, agent_id, agent_name);
    }

    // Rules 7–8: mention-free messages broadcast from humans, stay silent
    // from agents.
    match sender_kind {
        SenderKind::Human => true,
        SenderKind::Agent => false,
        SenderKind::System => true,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

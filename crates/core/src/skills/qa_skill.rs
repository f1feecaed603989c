//! # QA Skill
//!
//! Rule-based checks over a contact's drafts: leftover placeholders, dashes,
//! word counts per touch and a real subject line.

use regex::Regex;
use std::sync::OnceLock;

use super::{QaOutput, QcFlag};
use crate::state::Draft;

const PLACEHOLDER_PATTERN: &str = r"\[(DRAFT|PENDING|TODO)|\{(company|name)\}|PLACEHOLDER";

fn placeholder_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(PLACEHOLDER_PATTERN).ok())
        .as_ref()
}

fn has_placeholder(text: &str) -> bool {
    match placeholder_regex() {
        Some(re) => re.is_match(text),
        None => ["[DRAFT]", "[PENDING", "[TODO", "{company}", "{name}", "PLACEHOLDER"]
            .iter()
            .any(|p| text.contains(p)),
    }
}

/// Allowed word count range for a touch
pub fn word_bounds(touch_number: u32) -> Option<(usize, usize)> {
    match touch_number {
        1 => Some((70, 120)),
        3 | 5 => Some((40, 120)),
        6 => Some((30, 50)),
        _ => None,
    }
}

fn check_draft(draft: &Draft) -> Vec<(&'static str, String)> {
    let mut failed = Vec::new();

    if has_placeholder(&draft.body) {
        failed.push(("no_placeholders", "body contains placeholder text".to_string()));
    }
    if draft.body.contains('\u{2014}') || draft.body.contains('\u{2013}') {
        failed.push(("no_em_dashes", "body contains an em or en dash".to_string()));
    }

    let words = draft.body.split_whitespace().count();
    let words_ok = match word_bounds(draft.touch_number) {
        Some((min, max)) => (min..=max).contains(&words),
        None => words > 0,
    };
    if !words_ok {
        failed.push((
            "word_count",
            format!("{} words for touch {}", words, draft.touch_number),
        ));
    }

    let subject_ok = draft
        .subject_line
        .as_deref()
        .is_some_and(|s| !s.trim().is_empty() && !s.starts_with("[DRAFT]"));
    if !subject_ok {
        failed.push(("has_subject", "missing or placeholder subject".to_string()));
    }

    failed
}

/// Check every draft; a contact without drafts passes
pub fn check(contact_id: &str, drafts: &[Draft]) -> QaOutput {
    let flags: Vec<QcFlag> = drafts
        .iter()
        .flat_map(|draft| {
            check_draft(draft)
                .into_iter()
                .map(move |(check, detail)| QcFlag {
                    contact_id: contact_id.to_string(),
                    draft_id: Some(draft.id.clone()),
                    check: check.to_string(),
                    detail,
                })
        })
        .collect();

    QaOutput {
        contact_id: contact_id.to_string(),
        passed: flags.is_empty(),
        drafts_checked: drafts.len(),
        flags,
    }
}

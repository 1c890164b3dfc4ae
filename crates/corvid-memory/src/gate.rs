// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The absoluteness gate.
//!
//! A canonical event must stand alone: no pronouns, no relative time or place
//! expressions, and every salient numeric id from the source retained.  The
//! gate collects categorized hits over a rewrite candidate; the historian
//! loops the model with that feedback until the candidate passes or retries
//! run out.
//!
//! Pronoun matches guard against adjacent ASCII letters (so `它` inside a
//! latin identifier does not count), and id detection works over *maximal*
//! digit runs — a 13-digit number must not match as its 12-digit prefix.

use std::sync::OnceLock;

use regex::Regex;

const MAX_HIT_VALUES_PER_PATTERN: usize = 5;

const PRONOUNS: [&str; 10] = [
    "他们", "她们", "它们", "这位", "那位", "我", "你", "他", "她", "它",
];

fn rel_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new("(今天|昨天|明天|刚才|刚刚|稍后|上周|下周|最近)").expect("static regex")
    })
}

fn rel_place_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("(这里|那边|本地|当地|这儿|那儿)").expect("static regex"))
}

/// Categorized relative-expression hits over a candidate text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegexHits {
    pub pronoun: Vec<String>,
    pub relative_time: Vec<String>,
    pub relative_place: Vec<String>,
}

impl RegexHits {
    pub fn is_empty(&self) -> bool {
        self.pronoun.is_empty() && self.relative_time.is_empty() && self.relative_place.is_empty()
    }
}

/// Collect unique pronoun / relative-time / relative-place hits (capped per
/// category).
pub fn collect_regex_hits(text: &str) -> RegexHits {
    RegexHits {
        pronoun: collect_pronoun_hits(text, MAX_HIT_VALUES_PER_PATTERN),
        relative_time: collect_pattern_hits(rel_time_re(), text, MAX_HIT_VALUES_PER_PATTERN),
        relative_place: collect_pattern_hits(rel_place_re(), text, MAX_HIT_VALUES_PER_PATTERN),
    }
}

fn collect_pattern_hits(re: &Regex, text: &str, limit: usize) -> Vec<String> {
    let mut found = Vec::new();
    for m in re.find_iter(text) {
        let value = m.as_str().to_string();
        if !found.contains(&value) {
            found.push(value);
            if found.len() >= limit {
                break;
            }
        }
    }
    found
}

/// Pronouns count only when not embedded between ASCII letters.  Longer
/// pronouns are matched first so `他们` never double-counts as `他`.
fn collect_pronoun_hits(text: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut found: Vec<String> = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let mut matched_len = 0;
        let mut matched: Option<&str> = None;
        for pronoun in PRONOUNS {
            let p_chars: Vec<char> = pronoun.chars().collect();
            if chars[i..].starts_with(&p_chars) {
                matched = Some(pronoun);
                matched_len = p_chars.len();
                break;
            }
        }
        if let Some(pronoun) = matched {
            let prev_is_ascii = i
                .checked_sub(1)
                .map(|j| chars[j].is_ascii_alphabetic())
                .unwrap_or(false);
            let next_is_ascii = chars
                .get(i + matched_len)
                .map(|c| c.is_ascii_alphabetic())
                .unwrap_or(false);
            if !prev_is_ascii && !next_is_ascii {
                let value = pronoun.to_string();
                if !found.contains(&value) {
                    found.push(value);
                }
            }
            i += matched_len;
        } else {
            i += 1;
        }
    }
    found.truncate(limit);
    found
}

/// Unique maximal digit runs of 5–12 digits, in order of appearance.
pub fn collect_id_hits(text: &str, limit: usize) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut run = String::new();
    let mut push_run = |run: &mut String, found: &mut Vec<String>| {
        if (5..=12).contains(&run.len()) && !found.iter().any(|f| f == run) && found.len() < limit {
            found.push(run.clone());
        }
        run.clear();
    };
    for c in text.chars() {
        if c.is_ascii_digit() {
            run.push(c);
        } else if !run.is_empty() {
            push_run(&mut run, &mut found);
        }
    }
    if !run.is_empty() {
        push_run(&mut run, &mut found);
    }
    found
}

/// Ids present in the source (`memo` + observations) that are *not* part of
/// the identity context (sender/user/group/message ids).  These must survive
/// every rewrite.
pub fn source_entity_ids(
    memo: &str,
    observations: &str,
    identity_values: &[String],
) -> Vec<String> {
    let source_ids = collect_id_hits(&format!("{memo} {observations}"), 50);
    if source_ids.is_empty() {
        return Vec::new();
    }
    let mut context_ids: Vec<String> = Vec::new();
    for value in identity_values {
        for id in collect_id_hits(value, 50) {
            if !context_ids.contains(&id) {
                context_ids.push(id);
            }
        }
    }
    source_ids
        .into_iter()
        .filter(|id| !context_ids.contains(id))
        .collect()
}

/// Required ids missing from the candidate.
pub fn entity_id_drift(required: &[String], candidate: &str) -> Vec<String> {
    if required.is_empty() {
        return Vec::new();
    }
    let candidate_ids = collect_id_hits(candidate, 50);
    required
        .iter()
        .filter(|id| !candidate_ids.contains(id))
        .cloned()
        .collect()
}

/// Feedback block enumerating the gate's findings for the retry prompt.
pub fn build_gate_feedback(hits: &RegexHits, drift: &[String], force_enabled: bool) -> String {
    let mut lines = Vec::new();
    if !hits.pronoun.is_empty() {
        lines.push(format!("- 命中代词: {}", hits.pronoun.join(", ")));
    }
    if !hits.relative_time.is_empty() {
        lines.push(format!("- 命中相对时间: {}", hits.relative_time.join(", ")));
    }
    if !hits.relative_place.is_empty() {
        lines.push(format!("- 命中相对地点: {}", hits.relative_place.join(", ")));
    }
    if !drift.is_empty() {
        lines.push(format!("- 命中实体ID漂移: {}", drift.join(", ")));
    }
    lines.push(format!(
        "- 当前 force: {}",
        if force_enabled { "true" } else { "false" }
    ));
    if force_enabled {
        lines.push("- force=true 仅可放宽专有名词中的相对词；实体ID漂移仍然不允许。".into());
    } else {
        lines.push("- force=false 时必须彻底消除相对表达并修复ID漂移。".into());
    }
    lines.join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pronouns_are_detected() {
        let hits = collect_regex_hits("他今天在这里提到了问题");
        assert_eq!(hits.pronoun, vec!["他"]);
        assert_eq!(hits.relative_time, vec!["今天"]);
        assert_eq!(hits.relative_place, vec!["这里"]);
        assert!(!hits.is_empty());
    }

    #[test]
    fn plural_pronoun_matches_whole_word() {
        let hits = collect_regex_hits("他们说好了");
        assert_eq!(hits.pronoun, vec!["他们"]);
    }

    #[test]
    fn pronoun_adjacent_to_ascii_letters_is_ignored() {
        // The guard mirrors (?<![a-zA-Z])…(?![a-zA-Z]).
        let hits = collect_regex_hits("变量名a他b不算");
        assert!(hits.pronoun.is_empty());
        let hits2 = collect_regex_hits("句末提到 他 了");
        assert_eq!(hits2.pronoun, vec!["他"]);
    }

    #[test]
    fn absolute_text_passes() {
        let hits =
            collect_regex_hits("Null(1708213363)在2026-02-24 10:00于bot测试群(1017148870)提到该问题");
        assert!(hits.is_empty());
    }

    #[test]
    fn hits_are_unique_and_capped() {
        let text = "今天今天今天 昨天 明天 刚才 刚刚 稍后 上周";
        let hits = collect_regex_hits(text);
        assert_eq!(hits.relative_time.len(), 5);
        assert_eq!(hits.relative_time[0], "今天");
    }

    #[test]
    fn id_runs_respect_length_bounds() {
        assert_eq!(collect_id_hits("id 1234 too short", 10), Vec::<String>::new());
        assert_eq!(collect_id_hits("id 12345 ok", 10), vec!["12345"]);
        assert_eq!(collect_id_hits("id 123456789012 ok", 10), vec!["123456789012"]);
        // 13 digits is one maximal run, not a 12-digit prefix.
        assert!(collect_id_hits("id 1234567890123 long", 10).is_empty());
    }

    #[test]
    fn id_runs_dedupe_in_order() {
        let ids = collect_id_hits("12345 then 67890 then 12345", 10);
        assert_eq!(ids, vec!["12345", "67890"]);
    }

    #[test]
    fn source_ids_exclude_identity_context() {
        let required = source_entity_ids(
            "",
            "他提到了 1708213363 的问题",
            &["120218451".into(), "1017148870".into()],
        );
        assert_eq!(required, vec!["1708213363"]);

        let none = source_entity_ids(
            "",
            "发送者 120218451 说了话",
            &["120218451".into()],
        );
        assert!(none.is_empty());
    }

    #[test]
    fn drift_detects_missing_required_ids() {
        let required = vec!["1708213363".to_string()];
        assert_eq!(
            entity_id_drift(&required, "改写后没有保留编号"),
            vec!["1708213363"]
        );
        assert!(entity_id_drift(&required, "保留了 1708213363").is_empty());
        assert!(entity_id_drift(&[], "anything").is_empty());
    }

    #[test]
    fn feedback_enumerates_categories() {
        let hits = collect_regex_hits("他今天在这里");
        let feedback = build_gate_feedback(&hits, &["123456".into()], false);
        assert!(feedback.contains("命中代词: 他"));
        assert!(feedback.contains("命中相对时间: 今天"));
        assert!(feedback.contains("命中相对地点: 这里"));
        assert!(feedback.contains("命中实体ID漂移: 123456"));
        assert!(feedback.contains("force=false"));
    }

    #[test]
    fn feedback_mentions_force_rules_when_enabled() {
        let feedback = build_gate_feedback(&RegexHits::default(), &[], true);
        assert!(feedback.contains("force=true"));
        assert!(feedback.contains("实体ID漂移仍然不允许"));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed message segments.
//!
//! Messages on the wire are arrays of `{type, data}` objects.  The runtime
//! works with the typed form and renders either plain text (for prompts) or
//! CQ codes (for outbound bodies that embed at/image references).

use serde::{Deserialize, Serialize};

/// One message segment.  `data` fields are stringly on the wire; ids stay as
/// strings so round-trips are lossless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Segment {
    Text {
        text: String,
    },
    At {
        qq: String,
    },
    Image {
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    Record {
        file: String,
    },
    Video {
        file: String,
    },
    Reply {
        id: String,
    },
    Forward {
        id: String,
    },
    Face {
        id: String,
    },
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn at(qq: i64) -> Self {
        Self::At { qq: qq.to_string() }
    }
}

/// Serialize a segment list to the wire JSON array.
pub fn render_segments(segments: &[Segment]) -> serde_json::Value {
    serde_json::to_value(segments).unwrap_or_else(|_| serde_json::Value::Array(Vec::new()))
}

/// Parse a wire JSON array back into segments.  Unknown segment types are
/// dropped (the transport grows types faster than the runtime cares about).
pub fn message_to_segments(value: &serde_json::Value) -> Vec<Segment> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        serde_json::Value::String(text) => vec![Segment::text(text.clone())],
        _ => Vec::new(),
    }
}

/// Concatenated plain text of all text segments.
pub fn plain_text(segments: &[Segment]) -> String {
    segments
        .iter()
        .filter_map(|s| match s {
            Segment::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

/// True when any segment @-mentions the given account.
pub fn mentions(segments: &[Segment], self_id: i64) -> bool {
    let target = self_id.to_string();
    segments
        .iter()
        .any(|s| matches!(s, Segment::At { qq } if *qq == target))
}

/// Render segments as a CQ-code string for outbound bodies.
pub fn to_cq_string(segments: &[Segment]) -> String {
    let mut out = String::new();
    for seg in segments {
        match seg {
            Segment::Text { text } => out.push_str(text),
            Segment::At { qq } => out.push_str(&format!("[CQ:at,qq={qq}]")),
            Segment::Image { file, .. } => out.push_str(&format!("[CQ:image,file={file}]")),
            Segment::Record { file } => out.push_str(&format!("[CQ:record,file={file}]")),
            Segment::Video { file } => out.push_str(&format!("[CQ:video,file={file}]")),
            Segment::Reply { id } => out.push_str(&format!("[CQ:reply,id={id}]")),
            Segment::Forward { id } => out.push_str(&format!("[CQ:forward,id={id}]")),
            Segment::Face { id } => out.push_str(&format!("[CQ:face,id={id}]")),
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Segment> {
        vec![
            Segment::at(123456),
            Segment::text(" hello "),
            Segment::Image {
                file: "abc.png".into(),
                url: Some("https://example/abc.png".into()),
            },
            Segment::Reply { id: "777".into() },
        ]
    }

    #[test]
    fn wire_round_trip_is_lossless() {
        // message_to_segments(render_segments(xs)) == xs
        let xs = sample();
        let wire = render_segments(&xs);
        let back = message_to_segments(&wire);
        assert_eq!(back, xs);
    }

    #[test]
    fn wire_shape_matches_onebot() {
        let wire = render_segments(&[Segment::at(5)]);
        assert_eq!(wire[0]["type"], "at");
        assert_eq!(wire[0]["data"]["qq"], "5");
    }

    #[test]
    fn string_message_becomes_single_text_segment() {
        let parsed = message_to_segments(&serde_json::json!("hi there"));
        assert_eq!(parsed, vec![Segment::text("hi there")]);
    }

    #[test]
    fn unknown_segment_types_are_dropped() {
        let wire = serde_json::json!([
            { "type": "text", "data": { "text": "a" } },
            { "type": "hologram", "data": { "x": 1 } },
        ]);
        let parsed = message_to_segments(&wire);
        assert_eq!(parsed, vec![Segment::text("a")]);
    }

    #[test]
    fn plain_text_joins_text_segments_only() {
        assert_eq!(plain_text(&sample()), " hello ");
    }

    #[test]
    fn mentions_matches_at_segment() {
        assert!(mentions(&sample(), 123456));
        assert!(!mentions(&sample(), 999));
    }

    #[test]
    fn cq_rendering() {
        let s = to_cq_string(&[Segment::at(9), Segment::text(" hi")]);
        assert_eq!(s, "[CQ:at,qq=9] hi");
    }
}

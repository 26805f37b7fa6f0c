//! Turns the engine's incremental frames into chat-sized segments.
//!
//! Answer text is flushed one paragraph at a time so the user sees progress
//! and no single WeCom message grows past the platform's length limit.
//! Reasoning text is flushed the same way, diffed against a snapshot of
//! what was already sent.

use super::frame::{ProcedurePayload, Reference, ReplyPayload, StreamFrame};

pub const PARAGRAPH_BREAK: &str = "\n\n";

/// Per-session accumulator. Owned by the task consuming one stream.
#[derive(Debug, Default)]
pub struct Segmenter {
    answer: String,
    /// Byte offset of the last paragraph break already flushed
    answer_boundary: usize,
    reasoning: String,
    reasoning_snapshot: String,
    reasoning_procedure: String,
    reasoning_elapsed_ms: u64,
    elapsed_reported: bool,
    /// Elapsed-time line waiting for the next segment to carry it
    pending_prefix: Option<String>,
    latest_procedure: String,
    references: Vec<Reference>,
}

impl Segmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one frame; returns the segments it completes, in order.
    pub fn push(&mut self, frame: &StreamFrame) -> Vec<String> {
        match frame {
            StreamFrame::TokenStat { payload } => self.on_token_stat(payload).into_iter().collect(),
            StreamFrame::Thought { payload } => self.on_thought(payload).into_iter().collect(),
            StreamFrame::Reference { payload } => {
                self.references.extend(payload.references.iter().cloned());
                Vec::new()
            }
            StreamFrame::Reply { payload } if payload.is_from_self => {
                tracing::debug!(trace_id = %payload.trace_id, "Ignoring echo of user input");
                Vec::new()
            }
            StreamFrame::Reply { payload } => self.on_reply(payload),
            // Terminal frames are handled by the consumer
            StreamFrame::Error { .. } | StreamFrame::Unknown => Vec::new(),
        }
    }

    /// Flush whatever answer text follows the last paragraph break.
    pub fn finish(&mut self) -> Option<String> {
        let tail = self
            .answer
            .get(self.answer_boundary..)
            .unwrap_or_default()
            .trim()
            .to_string();
        self.answer_boundary = self.answer.len();

        let prefix = self.pending_prefix.take().or_else(|| self.take_elapsed_line());
        let text = match prefix {
            Some(prefix) if tail.is_empty() => prefix,
            Some(prefix) => format!("{prefix}{PARAGRAPH_BREAK}{tail}"),
            None => tail,
        };
        self.emit(text)
    }

    fn on_token_stat(&mut self, payload: &ProcedurePayload) -> Option<String> {
        let procedure = payload.procedures.last()?;
        tracing::trace!(name = %procedure.name, status = %procedure.status, "Procedure update");
        let title = procedure.title.trim();
        if title.is_empty() || title == self.latest_procedure {
            return None;
        }
        self.latest_procedure = title.to_string();
        self.emit(format!("> {title}，请稍等..."))
    }

    fn on_thought(&mut self, payload: &ProcedurePayload) -> Option<String> {
        let procedure = payload.procedures.first()?;
        tracing::trace!(
            name = %procedure.name,
            status = %procedure.status,
            elapsed_ms = procedure.elapsed,
            "Reasoning update"
        );
        let content = procedure.debugging.content.as_str();
        // The engine normally resends the whole reasoning so far
        if content.starts_with(self.reasoning.as_str()) {
            self.reasoning = content.to_string();
        } else {
            self.reasoning.push_str(content);
        }
        self.reasoning_elapsed_ms = procedure.elapsed;
        self.reasoning_procedure = procedure.title.trim().to_string();

        if !self.reasoning.ends_with(PARAGRAPH_BREAK) {
            return None;
        }
        let delta = self.take_reasoning_delta();
        if delta.is_empty() {
            return None;
        }
        let text = reasoning_block(&self.reasoning_procedure, &delta);
        self.emit(text)
    }

    fn on_reply(&mut self, payload: &ReplyPayload) -> Vec<String> {
        let mut out = Vec::new();
        if payload.is_final {
            tracing::debug!(
                trace_id = %payload.trace_id,
                record_id = %payload.record_id,
                "Received final reply frame"
            );
        }

        if self.pending_prefix.is_none() {
            self.pending_prefix = self.take_elapsed_line();
        }

        if self.reasoning.len() > self.reasoning_snapshot.len() {
            let delta = self.take_reasoning_delta();
            if !delta.is_empty() {
                let mut text = reasoning_block(&self.reasoning_procedure, &delta);
                if let Some(prefix) = self.pending_prefix.take() {
                    text.push('\n');
                    text.push_str(&prefix);
                }
                out.extend(self.emit(text));
            }
        }

        self.answer = payload.content.clone();
        let Some(tail) = self.answer.get(self.answer_boundary..) else {
            return out;
        };
        let Some(offset) = tail.rfind(PARAGRAPH_BREAK) else {
            return out;
        };
        let position = self.answer_boundary + offset;
        if position == self.answer_boundary {
            return out;
        }

        let cut = self.answer[self.answer_boundary..position].trim().to_string();
        self.answer_boundary = position;
        if !cut.is_empty() {
            let text = match self.pending_prefix.take() {
                Some(prefix) => format!("{prefix}{PARAGRAPH_BREAK}{cut}"),
                None => cut,
            };
            out.extend(self.emit(text));
        }
        out
    }

    /// Unflushed reasoning since the last snapshot; advances the snapshot.
    fn take_reasoning_delta(&mut self) -> String {
        let delta = self
            .reasoning
            .strip_prefix(self.reasoning_snapshot.as_str())
            .unwrap_or(&self.reasoning)
            .trim()
            .to_string();
        self.reasoning_snapshot = self.reasoning.clone();
        delta
    }

    /// The elapsed-time line, at most once per session.
    fn take_elapsed_line(&mut self) -> Option<String> {
        if self.elapsed_reported || self.reasoning_elapsed_ms == 0 {
            return None;
        }
        self.elapsed_reported = true;
        Some(format!(
            "> <font color=\"comment\">{}共用时{:.3}秒</font>",
            self.reasoning_procedure,
            self.reasoning_elapsed_ms as f64 / 1000.0
        ))
    }

    fn emit(&self, text: String) -> Option<String> {
        if text.trim().is_empty() {
            return None;
        }
        Some(format_references(&text, &self.references))
    }
}

fn reasoning_block(procedure: &str, delta: &str) -> String {
    let quoted: Vec<String> = delta.lines().map(|line| format!("> {line}")).collect();
    format!("> {procedure}中...\n>\n{}", quoted.join("\n"))
}

/// Replace each `[id]` of a known reference with a markdown link.
/// Unknown ids are left as they are.
pub fn format_references(text: &str, references: &[Reference]) -> String {
    references
        .iter()
        .filter(|r| !r.id.is_empty())
        .fold(text.to_string(), |acc, r| {
            acc.replace(&format!("[{}]", r.id), &format!("[【资料{}】]({})", r.id, r.url))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::frame::{Debugging, Procedure, ReferencePayload};

    fn reply(content: &str) -> StreamFrame {
        StreamFrame::Reply {
            payload: ReplyPayload {
                content: content.to_string(),
                ..Default::default()
            },
        }
    }

    fn thought(content: &str, elapsed: u64) -> StreamFrame {
        StreamFrame::Thought {
            payload: ProcedurePayload {
                procedures: vec![Procedure {
                    title: "思考".to_string(),
                    elapsed,
                    debugging: Debugging {
                        content: content.to_string(),
                    },
                    ..Default::default()
                }],
            },
        }
    }

    fn token_stat(titles: &[&str]) -> StreamFrame {
        StreamFrame::TokenStat {
            payload: ProcedurePayload {
                procedures: titles
                    .iter()
                    .map(|t| Procedure {
                        title: t.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            },
        }
    }

    fn reference(id: &str, url: &str) -> StreamFrame {
        StreamFrame::Reference {
            payload: ReferencePayload {
                references: vec![Reference {
                    id: id.to_string(),
                    url: url.to_string(),
                    ..Default::default()
                }],
            },
        }
    }

    #[test]
    fn single_reply_is_flushed_at_end() {
        let mut seg = Segmenter::new();
        let frame = StreamFrame::Reply {
            payload: ReplyPayload {
                content: "Hello world".into(),
                is_final: true,
                ..Default::default()
            },
        };
        assert!(seg.push(&frame).is_empty());
        assert_eq!(seg.finish(), Some("Hello world".to_string()));
    }

    #[test]
    fn paragraph_is_flushed_when_break_appears() {
        let mut seg = Segmenter::new();
        assert_eq!(seg.push(&reply("Part one.\n\nPart two")), vec!["Part one."]);
        assert!(seg.push(&reply("Part one.\n\nPart two, continued.")).is_empty());
        assert_eq!(seg.finish(), Some("Part two, continued.".to_string()));
    }

    #[test]
    fn growing_answer_is_emitted_once_per_paragraph() {
        let full = "alpha\n\nbeta gamma\n\n\ndelta";
        let mut seg = Segmenter::new();
        let mut out = Vec::new();
        for end in 1..=full.len() {
            out.extend(seg.push(&reply(&full[..end])));
        }
        out.extend(seg.finish());
        assert_eq!(out, vec!["alpha", "beta gamma", "delta"]);
    }

    #[test]
    fn multibyte_answer_splits_on_char_boundaries() {
        let mut seg = Segmenter::new();
        assert_eq!(seg.push(&reply("你好。\n\n世界")), vec!["你好。"]);
        assert_eq!(seg.finish(), Some("世界".to_string()));
    }

    #[test]
    fn shrinking_answer_does_not_panic() {
        let mut seg = Segmenter::new();
        assert_eq!(seg.push(&reply("long paragraph\n\nmore")), vec!["long paragraph"]);
        assert!(seg.push(&reply("short")).is_empty());
        assert_eq!(seg.finish(), None);
    }

    #[test]
    fn self_echo_is_not_segmented() {
        let mut seg = Segmenter::new();
        let echo = StreamFrame::Reply {
            payload: ReplyPayload {
                content: "my question\n\n".into(),
                is_from_self: true,
                ..Default::default()
            },
        };
        assert!(seg.push(&echo).is_empty());
        assert_eq!(seg.finish(), None);
    }

    #[test]
    fn token_stat_pings_only_on_new_title() {
        let mut seg = Segmenter::new();
        assert_eq!(seg.push(&token_stat(&["检索"])), vec!["> 检索，请稍等..."]);
        assert!(seg.push(&token_stat(&["检索"])).is_empty());
        assert_eq!(
            seg.push(&token_stat(&["检索", " 生成 "])),
            vec!["> 生成，请稍等..."]
        );
        assert!(seg.push(&token_stat(&[])).is_empty());
    }

    #[test]
    fn reasoning_is_flushed_per_paragraph_without_repeats() {
        let mut seg = Segmenter::new();
        assert!(seg.push(&thought("first idea", 100)).is_empty());
        assert_eq!(
            seg.push(&thought("first idea\n\n", 200)),
            vec!["> 思考中...\n>\n> first idea"]
        );
        // boundary noise only
        assert!(seg.push(&thought("first idea\n\n\n\n", 300)).is_empty());
        assert_eq!(
            seg.push(&thought("first idea\n\n\n\nsecond idea\n\n", 400)),
            vec!["> 思考中...\n>\n> second idea"]
        );
    }

    #[test]
    fn reasoning_deltas_are_appended() {
        let mut seg = Segmenter::new();
        assert!(seg.push(&thought("one ", 10)).is_empty());
        assert_eq!(
            seg.push(&thought("two\n\n", 20)),
            vec!["> 思考中...\n>\n> one two"]
        );
    }

    #[test]
    fn residual_reasoning_carries_elapsed_line_once() {
        let mut seg = Segmenter::new();
        seg.push(&thought("pondering", 2500));

        let first = seg.push(&reply("Answer\n\nmore"));
        assert_eq!(
            first,
            vec![
                "> 思考中...\n>\n> pondering\n> <font color=\"comment\">思考共用时2.500秒</font>",
                "Answer",
            ]
        );

        let rest = seg.finish().unwrap();
        assert_eq!(rest, "more");
        let all = [first.join("\n"), rest].join("\n");
        assert_eq!(all.matches("共用时").count(), 1);
    }

    #[test]
    fn elapsed_line_prefixes_first_answer_segment_when_reasoning_was_flushed() {
        let mut seg = Segmenter::new();
        assert_eq!(seg.push(&thought("done thinking\n\n", 1000)).len(), 1);
        let out = seg.push(&reply("Para\n\nnext"));
        assert_eq!(
            out,
            vec!["> <font color=\"comment\">思考共用时1.000秒</font>\n\nPara"]
        );
        assert_eq!(seg.finish(), Some("next".to_string()));
    }

    #[test]
    fn elapsed_line_prefixes_final_flush_when_no_paragraph_broke() {
        let mut seg = Segmenter::new();
        seg.push(&thought("hmm\n\n", 1234));
        seg.push(&reply("short answer"));
        assert_eq!(
            seg.finish(),
            Some("> <font color=\"comment\">思考共用时1.234秒</font>\n\nshort answer".to_string())
        );
    }

    #[test]
    fn references_are_linked_at_emission_time() {
        let mut seg = Segmenter::new();
        seg.push(&reference("1", "https://docs/1"));
        seg.push(&reference("2", "https://docs/2"));
        let out = seg.push(&reply("See [1] and [3].\n\nTail [2]"));
        assert_eq!(out, vec!["See [【资料1】](https://docs/1) and [3]."]);
        assert_eq!(
            seg.finish(),
            Some("Tail [【资料2】](https://docs/2)".to_string())
        );
    }

    #[test]
    fn late_reference_is_not_applied_retroactively() {
        let mut seg = Segmenter::new();
        let out = seg.push(&reply("Cite [1].\n\nrest [1]"));
        assert_eq!(out, vec!["Cite [1]."]);
        seg.push(&reference("1", "u"));
        assert_eq!(seg.finish(), Some("rest [【资料1】](u)".to_string()));
    }

    #[test]
    fn format_references_leaves_unknown_tokens() {
        let refs = vec![Reference {
            id: "7".into(),
            url: "https://x".into(),
            ..Default::default()
        }];
        assert_eq!(format_references("[7] [8] [77]", &refs), "[【资料7】](https://x) [8] [77]");
        assert_eq!(format_references("plain", &[]), "plain");
    }

    #[test]
    fn empty_session_emits_nothing() {
        let mut seg = Segmenter::new();
        assert_eq!(seg.finish(), None);
        assert!(seg.push(&reply("\n\n")).is_empty());
        assert_eq!(seg.finish(), None);
    }
}

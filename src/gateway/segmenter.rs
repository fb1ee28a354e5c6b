//! Splitting of oversized requests and ordered reassembly of their results.

use crate::gateway::orchestrator::InvocationOrchestrator;
use crate::gateway::types::{GatewayError, RetryMode, SegmentConfig, Task, TaskId};
use crate::provider::{GenerationKind, GenerationOutput};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', '。', '！', '？', '\n'];
const CLAUSE_PUNCTUATION: &[char] = &[',', ';', ':', '，', '；', '、'];

/// What to do when some chunks of a segmented request fail
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassemblyPolicy {
    /// Any failed chunk fails the whole request
    #[default]
    RequireAll,
    /// Text only: fall back to the first successful chunk, flagged as degraded
    AcceptPartial,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReassembledOutput {
    pub output: GenerationOutput,
    pub chunks: usize,
    pub failed: usize,
    pub degraded: bool,
}

/// Split `content` into chunks of at most `max_chunk` characters.
///
/// Content not longer than `threshold` comes back as a single chunk. Lengths are
/// counted in chars, never bytes.
pub fn split_content(content: &str, config: &SegmentConfig) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= config.threshold {
        return vec![content.to_string()];
    }

    chunk_ranges(&chars, config)
        .into_iter()
        .map(|range| chars[range].iter().collect::<String>())
        .collect()
}

fn chunk_ranges(chars: &[char], config: &SegmentConfig) -> Vec<Range<usize>> {
    let max_chunk = config.max_chunk.max(1);
    let min_chunk = config.min_chunk.min(max_chunk);
    let mut ranges: Vec<Range<usize>> = Vec::new();
    let mut start = skip_whitespace(chars, 0);

    while chars.len() - start > max_chunk {
        // Leave at least `min_chunk` chars behind so the tail never has to be merged
        // into a chunk that is already full
        let window_end = (start + max_chunk).min(chars.len() - min_chunk);
        let end = find_boundary(chars, start, window_end, min_chunk).unwrap_or(window_end);
        if let Some(range) = trimmed(chars, start..end) {
            ranges.push(range);
        }
        start = skip_whitespace(chars, end);
    }

    if let Some(tail) = trimmed(chars, start..chars.len()) {
        ranges.push(tail);
    }

    ranges
}

/// Exclusive end of the best split point in `start..window_end`
fn find_boundary(
    chars: &[char],
    start: usize,
    window_end: usize,
    min_chunk: usize,
) -> Option<usize> {
    let earliest = start + min_chunk;
    let rightmost = |matches: &dyn Fn(char) -> bool| {
        (earliest..window_end).rev().find(|&i| matches(chars[i]))
    };

    if let Some(i) = rightmost(&|c| SENTENCE_TERMINATORS.contains(&c)) {
        return Some(i + 1);
    }
    if let Some(i) = rightmost(&|c| CLAUSE_PUNCTUATION.contains(&c)) {
        return Some(i + 1);
    }
    // Break before the whitespace so it is trimmed from both sides
    rightmost(&|c| c.is_whitespace()).filter(|&i| i > start)
}

fn skip_whitespace(chars: &[char], mut index: usize) -> usize {
    while index < chars.len() && chars[index].is_whitespace() {
        index += 1;
    }
    index
}

fn trimmed(chars: &[char], range: Range<usize>) -> Option<Range<usize>> {
    let mut start = range.start;
    let mut end = range.end;
    while start < end && chars[start].is_whitespace() {
        start += 1;
    }
    while end > start && chars[end - 1].is_whitespace() {
        end -= 1;
    }
    (start < end).then_some(start..end)
}

/// Ordered sub-tasks of one oversized task and their results
#[derive(Debug, Clone)]
pub struct ChunkSet {
    pub parent_id: TaskId,
    pub kind: GenerationKind,
    pub tasks: Vec<Task>,
    results: Vec<Option<Result<GenerationOutput, GatewayError>>>,
}

impl ChunkSet {
    pub fn from_task(task: &Task, config: &SegmentConfig) -> Self {
        let tasks: Vec<Task> = split_content(&task.payload.content, config)
            .into_iter()
            .enumerate()
            .map(|(index, content)| Task {
                id: format!("{}#{}", task.id, index),
                payload: task.payload.with_content(content),
                priority: task.priority,
            })
            .collect();

        Self {
            parent_id: task.id.clone(),
            kind: task.payload.kind,
            results: vec![None; tasks.len()],
            tasks,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn record(&mut self, index: usize, result: Result<GenerationOutput, GatewayError>) {
        if let Some(slot) = self.results.get_mut(index) {
            *slot = Some(result);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.results.iter().all(|slot| slot.is_some())
    }

    /// Concatenate in chunk order, or report the failure according to `policy`
    pub fn reassemble(
        self,
        policy: ReassemblyPolicy,
        separator: &str,
    ) -> Result<ReassembledOutput, GatewayError> {
        let total = self.results.len();
        let mut outputs = Vec::with_capacity(total);
        let mut first_success = None;
        let mut first_error = None;
        let mut failed = 0;

        for (index, slot) in self.results.into_iter().enumerate() {
            match slot {
                Some(Ok(output)) => {
                    if first_success.is_none() {
                        first_success = Some(output.clone());
                    }
                    outputs.push(output);
                }
                Some(Err(error)) => {
                    failed += 1;
                    first_error.get_or_insert(error);
                }
                None => {
                    failed += 1;
                    first_error.get_or_insert_with(|| GatewayError::Unknown {
                        message: format!("chunk {}#{} never completed", self.parent_id, index),
                        attempts: 0,
                    });
                }
            }
        }

        if failed == 0 {
            return Ok(ReassembledOutput {
                output: concatenate(outputs, separator)?,
                chunks: total,
                failed: 0,
                degraded: false,
            });
        }

        if policy == ReassemblyPolicy::AcceptPartial
            && self.kind == GenerationKind::Text
            && let Some(output) = first_success
        {
            warn!(
                "Task {} returns degraded output, {} of {} chunks failed",
                self.parent_id, failed, total
            );
            return Ok(ReassembledOutput {
                output,
                chunks: total,
                failed,
                degraded: true,
            });
        }

        Err(GatewayError::Segment {
            failed,
            total,
            first_error: Box::new(first_error.unwrap_or(GatewayError::NoCredentials)),
        })
    }
}

fn concatenate(
    outputs: Vec<GenerationOutput>,
    separator: &str,
) -> Result<GenerationOutput, GatewayError> {
    let mut outputs = outputs.into_iter();
    let Some(first) = outputs.next() else {
        return Err(GatewayError::InvalidRequest("nothing to reassemble".to_string()));
    };

    match first {
        GenerationOutput::Text { mut text } => {
            for output in outputs {
                let GenerationOutput::Text { text: next } = output else {
                    return Err(GatewayError::InvalidRequest(
                        "chunks produced mixed output kinds".to_string(),
                    ));
                };
                text.push_str(separator);
                text.push_str(&next);
            }
            Ok(GenerationOutput::Text { text })
        }
        GenerationOutput::Audio {
            mut bytes,
            mime_type,
        } => {
            for output in outputs {
                let GenerationOutput::Audio { bytes: next, .. } = output else {
                    return Err(GatewayError::InvalidRequest(
                        "chunks produced mixed output kinds".to_string(),
                    ));
                };
                bytes.extend_from_slice(&next);
            }
            Ok(GenerationOutput::Audio { bytes, mime_type })
        }
    }
}

/// Dispatches chunk sub-tasks through the orchestrator with bounded parallelism
#[derive(Debug)]
pub struct Segmenter {
    orchestrator: Arc<InvocationOrchestrator>,
    config: SegmentConfig,
    parallelism: usize,
}

impl Segmenter {
    pub fn new(
        orchestrator: Arc<InvocationOrchestrator>,
        config: SegmentConfig,
        parallelism: usize,
    ) -> Self {
        Self {
            orchestrator,
            config,
            parallelism: parallelism.max(1),
        }
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    pub async fn run(
        &self,
        task: &Task,
        mode: RetryMode,
        policy: ReassemblyPolicy,
    ) -> Result<ReassembledOutput, GatewayError> {
        let mut set = ChunkSet::from_task(task, &self.config);
        if set.len() == 1 {
            let output = self.orchestrator.invoke(task, mode).await?;
            return Ok(ReassembledOutput {
                output,
                chunks: 1,
                failed: 0,
                degraded: false,
            });
        }

        info!("Task {} split into {} chunks", task.id, set.len());

        let orchestrator = &self.orchestrator;
        let results: Vec<(usize, Result<GenerationOutput, GatewayError>)> =
            stream::iter(set.tasks.clone().into_iter().enumerate())
                .map(|(index, chunk)| async move {
                    let result = orchestrator.invoke(&chunk, mode).await;
                    debug!("Chunk {} finished: {}", chunk.id, result.is_ok());
                    (index, result)
                })
                .buffer_unordered(self.parallelism)
                .collect()
                .await;

        for (index, result) in results {
            set.record(index, result);
        }

        set.reassemble(policy, &self.config.text_separator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::GenerationRequest;

    fn sentence(i: usize) -> String {
        let head = format!("Sentence {:02} ", i);
        format!("{}{}.", head, "a".repeat(39 - head.len()))
    }

    fn text(value: &str) -> GenerationOutput {
        GenerationOutput::Text {
            text: value.to_string(),
        }
    }

    #[test]
    fn test_short_content_is_not_split() {
        let content = "A short request.";
        assert_eq!(
            split_content(content, &SegmentConfig::default()),
            vec![content.to_string()]
        );
    }

    #[test]
    fn test_450_chars_split_into_three_sentence_chunks() {
        let content = (0..11).map(sentence).collect::<Vec<_>>().join(" ");
        assert_eq!(content.chars().count(), 450);

        let chunks = split_content(&content, &SegmentConfig::default());
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.ends_with('.'));
            assert!(chunk.chars().count() <= 200);
        }

        let total: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert_eq!(total + chunks.len() - 1, 450);
        assert_eq!(chunks.join(" "), content);
    }

    #[test]
    fn test_clause_then_whitespace_fallback() {
        let clauses = (0..12).map(|_| "word word word, more").collect::<Vec<_>>().join(" ");
        let chunks = split_content(&clauses, &SegmentConfig::default());
        assert!(chunks.len() > 1);
        assert!(chunks[0].ends_with(','));

        let words = "word ".repeat(60);
        let chunks = split_content(words.trim_end(), &SegmentConfig::default());
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| !c.starts_with(' ') && !c.ends_with(' ')));
        assert!(chunks.iter().all(|c| c.chars().count() <= 200));
    }

    #[test]
    fn test_forced_split_counts_chars_not_bytes() {
        let content = "字".repeat(300);
        let chunks = split_content(&content, &SegmentConfig::default());
        assert_eq!(
            chunks.iter().map(|c| c.chars().count()).collect::<Vec<_>>(),
            vec![200, 100]
        );
    }

    #[test]
    fn test_cjk_sentence_terminators() {
        let content = format!("{}。{}", "字".repeat(150), "字".repeat(100));
        let chunks = split_content(&content, &SegmentConfig::default());
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with('。'));
        assert_eq!(chunks[1].chars().count(), 100);
    }

    #[test]
    fn test_boundary_too_close_to_start_is_ignored() {
        let content = format!("Hi. {}", "b".repeat(250));
        let chunks = split_content(&content, &SegmentConfig::default());
        assert_eq!(chunks[0].chars().count(), 200);
        assert!(chunks[0].starts_with("Hi. "));
    }

    #[test]
    fn test_short_tail_is_rebalanced_within_limit() {
        let config = SegmentConfig::default();

        let content = "a".repeat(210);
        let chunks = split_content(&content, &config);
        assert_eq!(
            chunks.iter().map(|c| c.chars().count()).collect::<Vec<_>>(),
            vec![190, 20]
        );
        assert_eq!(chunks.concat(), content);

        let content = format!("{}. {}", "a".repeat(194), "b".repeat(19));
        let chunks = split_content(&content, &config);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with('.'));
        assert_eq!(chunks[1], "b".repeat(19));

        for extra in 1..=config.min_chunk {
            let content = format!("{} {}", "word ".repeat(40).trim_end(), "c".repeat(extra));
            let chunks = split_content(&content, &config);
            assert!(chunks.len() > 1, "tail of {} was not split off", extra);
            assert!(
                chunks.iter().all(|c| c.chars().count() <= config.max_chunk),
                "chunk over limit for tail {}: {:?}",
                extra,
                chunks.iter().map(|c| c.chars().count()).collect::<Vec<_>>()
            );
            assert_eq!(chunks.join(" "), content);
        }
    }

    #[test]
    fn test_chunk_ids_and_parameters() {
        let task = Task::new(
            "story",
            GenerationRequest::speech((0..11).map(sentence).collect::<Vec<_>>().join(" "), "alto"),
        )
        .with_priority(4);
        let set = ChunkSet::from_task(&task, &SegmentConfig::default());

        let ids: Vec<&str> = set.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["story#0", "story#1", "story#2"]);
        assert!(set.tasks.iter().all(|t| t.payload.voice.as_deref() == Some("alto")));
        assert!(set.tasks.iter().all(|t| t.priority == Some(4)));
    }

    fn two_chunk_set(kind: GenerationKind) -> ChunkSet {
        let content = (0..11).map(sentence).collect::<Vec<_>>().join(" ");
        let payload = match kind {
            GenerationKind::Text => GenerationRequest::text(content),
            GenerationKind::Speech => GenerationRequest::speech(content, "alto"),
        };
        let mut set = ChunkSet::from_task(&Task::new("t", payload), &SegmentConfig::default());
        set.tasks.truncate(2);
        set.results.truncate(2);
        set
    }

    #[test]
    fn test_reassembly_keeps_chunk_order() {
        let mut set = two_chunk_set(GenerationKind::Text);
        set.record(1, Ok(text("second")));
        assert!(!set.is_complete());
        set.record(0, Ok(text("first")));
        assert!(set.is_complete());

        let result = set.reassemble(ReassemblyPolicy::RequireAll, " ").unwrap();
        assert_eq!(result.output, text("first second"));
        assert!(!result.degraded);
    }

    #[test]
    fn test_audio_bytes_are_appended() {
        let mut set = two_chunk_set(GenerationKind::Speech);
        set.record(0, Ok(GenerationOutput::Audio {
            bytes: vec![1, 2],
            mime_type: "audio/mpeg".into(),
        }));
        set.record(1, Ok(GenerationOutput::Audio {
            bytes: vec![3],
            mime_type: "audio/mpeg".into(),
        }));

        let result = set.reassemble(ReassemblyPolicy::RequireAll, " ").unwrap();
        assert_eq!(result.output, GenerationOutput::Audio {
            bytes: vec![1, 2, 3],
            mime_type: "audio/mpeg".into(),
        });
    }

    #[test]
    fn test_failed_chunk_fails_by_default() {
        let mut set = two_chunk_set(GenerationKind::Text);
        set.record(0, Ok(text("first")));
        set.record(1, Err(GatewayError::Server {
            message: "down".into(),
            attempts: 3,
        }));

        match set.reassemble(ReassemblyPolicy::RequireAll, " ") {
            Err(GatewayError::Segment { failed, total, first_error }) => {
                assert_eq!((failed, total), (1, 2));
                assert!(matches!(*first_error, GatewayError::Server { .. }));
            }
            other => panic!("expected segment failure, got {:?}", other),
        }
    }

    #[test]
    fn test_accept_partial_is_text_only() {
        let failure = || GatewayError::Network {
            message: "reset".into(),
            attempts: 3,
        };

        let mut set = two_chunk_set(GenerationKind::Text);
        set.record(0, Err(failure()));
        set.record(1, Ok(text("second")));
        let result = set.reassemble(ReassemblyPolicy::AcceptPartial, " ").unwrap();
        assert_eq!(result.output, text("second"));
        assert!(result.degraded);
        assert_eq!(result.failed, 1);

        let mut set = two_chunk_set(GenerationKind::Speech);
        set.record(0, Ok(GenerationOutput::Audio {
            bytes: vec![1],
            mime_type: "audio/mpeg".into(),
        }));
        set.record(1, Err(failure()));
        assert!(matches!(
            set.reassemble(ReassemblyPolicy::AcceptPartial, " "),
            Err(GatewayError::Segment { failed: 1, total: 2, .. })
        ));
    }
}

//! Round transcripts and how they are cut into chunks.

use crate::config::{ChunkStrategy, VectorizationConfig};
use crate::model::{Message, MessageId, ParticipantId};

/// Marker appended to a transcript line that was cut short.
const ELLIPSIS: &str = "...";

/// A piece of transcript stored as one memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub message_ids: Vec<MessageId>,
    pub speaker_ids: Vec<ParticipantId>,
}

impl Chunk {
    fn push_line(&mut self, line: &str, message_id: Option<MessageId>, speaker_id: Option<ParticipantId>) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        self.text.push_str(line);
        if let Some(id) = message_id {
            self.message_ids.push(id);
        }
        if let Some(id) = speaker_id {
            if !self.speaker_ids.contains(&id) {
                self.speaker_ids.push(id);
            }
        }
    }

    fn len_chars(&self) -> usize {
        self.text.chars().count()
    }
}

/// `Round N | Participants: A, B`
pub fn transcript_header(round_number: u32, participants: &[String]) -> String {
    format!(
        "Round {round_number} | Participants: {}",
        participants.join(", ")
    )
}

/// Cut `line` to `max_chars` characters, marking the cut.
pub fn truncate_line(line: &str, max_chars: usize) -> String {
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    if max_chars <= ELLIPSIS.len() {
        return line.chars().take(max_chars).collect();
    }
    let keep = max_chars - ELLIPSIS.len();
    let mut out: String = line.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

/// The full transcript of a round: header, then one attributed line per
/// message.
pub fn transcript(
    round_number: u32,
    participants: &[String],
    messages: &[Message],
    max_line_chars: usize,
) -> String {
    let mut lines = vec![transcript_header(round_number, participants)];
    lines.extend(
        messages
            .iter()
            .map(|m| truncate_line(&m.attributed(), max_line_chars)),
    );
    lines.join("\n")
}

fn tail_chars(text: &str, n: usize) -> &str {
    let count = text.chars().count();
    if n >= count {
        return text;
    }
    let start = text
        .char_indices()
        .nth(count - n)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &text[start..]
}

/// Cut a round into chunks according to `config.chunk_strategy`.
///
/// `perMessage` yields one chunk per message, each led by the header.
/// `perRound` and `perScene` pack whole lines into chunks of about
/// `chunk_size` characters; with a nonzero `sliding_window_overlap` each
/// chunk after the first starts with the tail of the one before it.
pub fn chunk_round(
    round_number: u32,
    participants: &[String],
    messages: &[Message],
    config: &VectorizationConfig,
) -> Vec<Chunk> {
    if messages.is_empty() {
        return Vec::new();
    }
    let header = transcript_header(round_number, participants);

    if config.chunk_strategy == ChunkStrategy::PerMessage {
        return messages
            .iter()
            .map(|m| {
                let mut chunk = Chunk::default();
                chunk.push_line(&header, None, None);
                chunk.push_line(
                    &truncate_line(&m.attributed(), config.max_line_chars),
                    Some(m.id),
                    m.speaker_id,
                );
                chunk
            })
            .collect();
    }

    let chunk_size = config.chunk_size.max(1);
    let mut base = Vec::new();
    let mut current = Chunk::default();
    current.push_line(&header, None, None);

    for message in messages {
        let line = truncate_line(&message.attributed(), config.max_line_chars);
        let grown = current.len_chars() + 1 + line.chars().count();
        if !current.message_ids.is_empty() && grown > chunk_size {
            base.push(std::mem::take(&mut current));
        }
        current.push_line(&line, Some(message.id), message.speaker_id);
    }
    base.push(current);

    let overlap = (chunk_size as f64 * config.sliding_window_overlap.clamp(0.0, 0.9)).floor() as usize;
    if overlap == 0 || base.len() < 2 {
        return base;
    }

    let mut chunks = Vec::with_capacity(base.len());
    for (i, chunk) in base.iter().enumerate() {
        if i == 0 {
            chunks.push(chunk.clone());
            continue;
        }
        let carried = tail_chars(&base[i - 1].text, overlap);
        chunks.push(Chunk {
            text: format!("{carried}\n{}", chunk.text),
            ..chunk.clone()
        });
    }
    chunks
}

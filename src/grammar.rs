/// Field grammar for Chat Bridge transcripts.
///
/// A transcript carries its metadata as bold labels (`**Max Rounds:** 10`) and
/// its conversation as level-3 headings (`### Agent A (2024-01-01 12:00:05)`).
/// Every labeled field is described once in [`Field`]; boundary rules live in
/// the matchers compiled by [`Grammar`], and the message scan is a single
/// left-to-right pass over the conversation section.
use crate::transcript::{AgentLabel, Speaker};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// How far a field's value extends past its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    /// Remainder of the label's line.
    Line,
    /// Up to a blank line followed by another label, a heading line, or end of text.
    Block,
}

/// Every labeled field a transcript may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    SessionId,
    Started,
    ConversationStarter,
    MaxRounds,
    MemoryRounds,
    StopWordDetection,
    StopWords,
    Provider(AgentLabel),
    Model(AgentLabel),
    Temperature(AgentLabel),
    Persona(AgentLabel),
    SystemPrompt(AgentLabel),
}

impl Field {
    /// All fields in document order.
    pub const ALL: [Field; 17] = [
        Field::SessionId,
        Field::Started,
        Field::ConversationStarter,
        Field::Provider(AgentLabel::A),
        Field::Model(AgentLabel::A),
        Field::Temperature(AgentLabel::A),
        Field::Persona(AgentLabel::A),
        Field::SystemPrompt(AgentLabel::A),
        Field::Provider(AgentLabel::B),
        Field::Model(AgentLabel::B),
        Field::Temperature(AgentLabel::B),
        Field::Persona(AgentLabel::B),
        Field::SystemPrompt(AgentLabel::B),
        Field::MaxRounds,
        Field::MemoryRounds,
        Field::StopWordDetection,
        Field::StopWords,
    ];

    /// The label text as it appears between `**` and `:**`.
    pub fn label(self) -> String {
        match self {
            Field::SessionId => "Session ID".to_string(),
            Field::Started => "Started".to_string(),
            Field::ConversationStarter => "Conversation Starter".to_string(),
            Field::MaxRounds => "Max Rounds".to_string(),
            Field::MemoryRounds => "Memory Rounds".to_string(),
            Field::StopWordDetection => "Stop Word Detection".to_string(),
            Field::StopWords => "Stop Words".to_string(),
            Field::Provider(l) => format!("Agent {} Provider", l.as_str()),
            Field::Model(l) => format!("Agent {} Model", l.as_str()),
            Field::Temperature(l) => format!("Agent {} Temperature", l.as_str()),
            Field::Persona(l) => format!("Agent {} Persona", l.as_str()),
            Field::SystemPrompt(l) => format!("Agent {} System Prompt", l.as_str()),
        }
    }

    pub fn shape(self) -> FieldShape {
        match self {
            Field::ConversationStarter | Field::SystemPrompt(_) => FieldShape::Block,
            _ => FieldShape::Line,
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// Compiled matchers for every [`Field`].
pub struct Grammar {
    matchers: HashMap<Field, Regex>,
}

impl Grammar {
    pub fn new() -> Self {
        let matchers = Field::ALL
            .iter()
            .map(|&field| (field, field_pattern(field)))
            .collect();
        Self { matchers }
    }

    /// Capture a field's raw value: trimmed, `None` when the label is absent
    /// or carries nothing.
    pub fn capture<'t>(&self, field: Field, text: &'t str) -> Option<&'t str> {
        let value = self.matchers.get(&field)?.captures(text)?.get(1)?.as_str();
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

impl Default for Grammar {
    fn default() -> Self {
        Self::new()
    }
}

fn field_pattern(field: Field) -> Regex {
    let label = regex::escape(&field.label());
    let pattern = match field.shape() {
        FieldShape::Line => format!(r"\*\*{label}:\*\*[ \t]*([^\n]*)"),
        FieldShape::Block => {
            format!(r"(?s)\*\*{label}:\*\*[ \t]*(.*?)(?:\n[ \t]*\n\*\*|\n#|\z)")
        }
    };
    Regex::new(&pattern).unwrap()
}

pub static GRAMMAR: LazyLock<Grammar> = LazyLock::new(Grammar::new);

static CONVERSATION_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^##[ \t]+Conversation[ \t]*$").unwrap());

static MESSAGE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^###[ \t]+(Human|Agent A|Agent B)[ \t]+\(([\d-]+ [\d:]+)\)[ \t]*\n").unwrap()
});

static ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\A\s*<sub\b[^>]*>.*?</sub>").unwrap());

/// A message header and the raw text up to the next header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlock<'t> {
    pub speaker: Speaker,
    pub timestamp: &'t str,
    pub body: &'t str,
}

/// Text strictly after the `## Conversation` heading line, to end of document.
pub fn conversation_section(text: &str) -> Option<&str> {
    let heading = CONVERSATION_HEADING.find(text)?;
    Some(&text[heading.end()..])
}

/// Scan a conversation section for message blocks in document order.
pub fn message_blocks(section: &str) -> Vec<MessageBlock<'_>> {
    let headers: Vec<_> = MESSAGE_HEADER.captures_iter(section).collect();
    let mut blocks = Vec::with_capacity(headers.len());

    for (i, caps) in headers.iter().enumerate() {
        let (Some(whole), Some(speaker), Some(timestamp)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        let Some(speaker) = Speaker::parse(speaker.as_str()) else {
            continue;
        };
        let end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(section.len(), |m| m.start());
        blocks.push(MessageBlock {
            speaker,
            timestamp: timestamp.as_str(),
            body: &section[whole.end()..end],
        });
    }

    blocks
}

/// Drop a leading `<sub>…</sub>` annotation and surrounding whitespace.
pub fn strip_annotation(body: &str) -> &str {
    match ANNOTATION.find(body) {
        Some(m) => body[m.end()..].trim(),
        None => body.trim(),
    }
}

//! Transcript extraction: turn the raw Markdown of one Chat Bridge log into a
//! [`Transcript`]. Pure and infallible; every field that cannot be recovered
//! takes its unset value and is reported as a [`MalformedField`].

use crate::grammar::{self, Field, GRAMMAR};
use crate::transcript::{AgentConfig, AgentLabel, Message, Session, Transcript};
use regex::Regex;
use std::sync::LazyLock;

static SESSION_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^conv_\d+_\d+$").unwrap());
static TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\d-]+ [\d:]+$").unwrap());
static DECIMAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?\d+(\.\d+)?$").unwrap());

/// The spelling that turns stop-word detection on.
const ENABLED: &str = "Enabled";

/// Why a field fell back to its unset value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldFault {
    /// The label was not found, or carried no value.
    Absent,
    /// The label was found but its value did not have the expected form.
    Unparseable { raw: String },
}

/// A field that could not be recovered. Never fatal on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedField {
    pub field: Field,
    pub fault: FieldFault,
}

impl std::fmt::Display for MalformedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.fault {
            FieldFault::Absent => write!(f, "{}: absent", self.field),
            FieldFault::Unparseable { raw } => write!(f, "{}: unparseable value {raw:?}", self.field),
        }
    }
}

/// Result of extracting one document.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub transcript: Transcript,
    pub issues: Vec<MalformedField>,
}

/// Extract a transcript from raw document text.
pub fn extract(text: &str) -> Extraction {
    let text = text.replace("\r\n", "\n");
    let mut fields = FieldReader {
        text: &text,
        issues: Vec::new(),
    };

    let session = Session {
        session_id: fields.matching(Field::SessionId, &SESSION_ID),
        started_at: fields.matching(Field::Started, &TIMESTAMP),
        conversation_starter: fields.text(Field::ConversationStarter),
        max_rounds: fields.number(Field::MaxRounds),
        memory_rounds: fields.number(Field::MemoryRounds),
        stop_word_detection: fields.flag(Field::StopWordDetection),
        stop_words: fields.text(Field::StopWords),
    };

    let agents = AgentLabel::ALL.map(|label| AgentConfig {
        label,
        provider: fields.text(Field::Provider(label)),
        model: fields.text(Field::Model(label)),
        temperature: fields.number(Field::Temperature(label)),
        persona: fields.text(Field::Persona(label)),
        system_prompt: fields.text(Field::SystemPrompt(label)),
    });

    let messages = extract_messages(&text);

    Extraction {
        transcript: Transcript {
            session,
            agents,
            messages,
        },
        issues: fields.issues,
    }
}

/// Scan the conversation section and number messages from zero.
fn extract_messages(text: &str) -> Vec<Message> {
    let Some(section) = grammar::conversation_section(text) else {
        return Vec::new();
    };

    grammar::message_blocks(section)
        .into_iter()
        .zip(0u32..)
        .map(|(block, position)| Message {
            position,
            speaker: block.speaker,
            timestamp: block.timestamp.to_string(),
            content: grammar::strip_annotation(block.body).to_string(),
        })
        .collect()
}

/// Applies the grammar to one document, recording every fallback.
struct FieldReader<'t> {
    text: &'t str,
    issues: Vec<MalformedField>,
}

impl<'t> FieldReader<'t> {
    fn raw(&mut self, field: Field) -> Option<&'t str> {
        let value = GRAMMAR.capture(field, self.text);
        if value.is_none() {
            self.issues.push(MalformedField {
                field,
                fault: FieldFault::Absent,
            });
        }
        value
    }

    fn unparseable(&mut self, field: Field, raw: &str) {
        self.issues.push(MalformedField {
            field,
            fault: FieldFault::Unparseable {
                raw: raw.to_string(),
            },
        });
    }

    fn text(&mut self, field: Field) -> Option<String> {
        self.raw(field).map(str::to_string)
    }

    /// Text that must match `pattern` exactly; anything else counts as absent.
    fn matching(&mut self, field: Field, pattern: &Regex) -> Option<String> {
        let raw = self.raw(field)?;
        if pattern.is_match(raw) {
            Some(raw.to_string())
        } else {
            self.unparseable(field, raw);
            None
        }
    }

    /// First token parsed as a plain decimal; zero when absent or unparseable.
    fn number<N>(&mut self, field: Field) -> N
    where
        N: std::str::FromStr + Default,
    {
        let Some(raw) = self.raw(field) else {
            return N::default();
        };
        let token = raw.split_whitespace().next().unwrap_or_default();
        if !DECIMAL.is_match(token) {
            self.unparseable(field, raw);
            return N::default();
        }
        match token.parse() {
            Ok(n) => n,
            Err(_) => {
                self.unparseable(field, raw);
                N::default()
            }
        }
    }

    /// `true` only when the whole value is `Enabled`.
    fn flag(&mut self, field: Field) -> bool {
        self.raw(field).is_some_and(|raw| raw == ENABLED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Speaker;

    const SAMPLE: &str = include_str!("../fixtures/conv_20240101_000001.md");

    #[test]
    fn extracts_session_fields() {
        let t = extract(SAMPLE).transcript;
        assert_eq!(t.session_id(), Some("conv_20240101_000001"));
        assert_eq!(t.session.started_at.as_deref(), Some("2024-01-01 12:00:00"));
        assert_eq!(
            t.session.conversation_starter.as_deref(),
            Some("Should historic city centres ban private cars?\nConsider both residents and visitors.")
        );
        assert_eq!(t.session.max_rounds, 10);
        assert_eq!(t.session.memory_rounds, 8);
        assert!(t.session.stop_word_detection);
        assert_eq!(t.session.stop_words.as_deref(), Some("goodbye, end chat"));
    }

    #[test]
    fn extracts_both_agents() {
        let t = extract(SAMPLE).transcript;
        let a = t.agent(AgentLabel::A);
        assert_eq!(a.provider.as_deref(), Some("openai"));
        assert_eq!(a.model.as_deref(), Some("gpt-4o-mini"));
        assert!((a.temperature - 0.7).abs() < f64::EPSILON);
        assert_eq!(a.persona.as_deref(), Some("urban_planner"));
        assert_eq!(
            a.system_prompt.as_deref(),
            Some("You are an urban planner.\nArgue from evidence and cite examples.")
        );

        let b = t.agent(AgentLabel::B);
        assert_eq!(b.provider.as_deref(), Some("anthropic"));
        assert!((b.temperature - 1.0).abs() < f64::EPSILON);
        assert_eq!(
            b.system_prompt.as_deref(),
            Some("You question every assumption the other side makes.")
        );
    }

    #[test]
    fn extracts_messages_in_order_without_annotations() {
        let t = extract(SAMPLE).transcript;
        let speakers: Vec<Speaker> = t.messages.iter().map(|m| m.speaker).collect();
        assert_eq!(
            speakers,
            vec![Speaker::Human, Speaker::AgentA, Speaker::AgentB]
        );
        let positions: Vec<u32> = t.messages.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);

        assert_eq!(t.messages[1].timestamp, "2024-01-01 12:00:07");
        assert_eq!(
            t.messages[1].content,
            "Yes. Pedestrianised centres in Ghent and Pontevedra saw footfall rise."
        );
        assert!(!t.messages[1].content.contains("temperature 0.7"));
        assert!(!t.messages[2].content.contains("<sub>"));
    }

    #[test]
    fn complete_document_has_no_issues() {
        let extraction = extract(SAMPLE);
        assert!(
            extraction.issues.is_empty(),
            "unexpected issues: {:?}",
            extraction.issues
        );
    }

    #[test]
    fn empty_document_degrades_to_sentinels() {
        let extraction = extract("");
        let t = &extraction.transcript;
        assert_eq!(t.session_id(), None);
        assert_eq!(t.session.max_rounds, 0);
        assert_eq!(t.session.memory_rounds, 0);
        assert!(!t.session.stop_word_detection);
        assert_eq!(t.agents.len(), 2);
        assert_eq!(t.agent(AgentLabel::A).temperature, 0.0);
        assert_eq!(t.agent(AgentLabel::B).provider, None);
        assert!(t.messages.is_empty());
        assert_eq!(extraction.issues.len(), Field::ALL.len());
        assert!(extraction
            .issues
            .iter()
            .all(|i| i.fault == FieldFault::Absent));
    }

    #[test]
    fn session_id_must_match_strictly() {
        for bad in ["session_1_2", "conv_2024_abc", "conv_20240101", "conv_1_2 extra"] {
            let doc = format!("**Session ID:** {bad}\n");
            let extraction = extract(&doc);
            assert_eq!(extraction.transcript.session_id(), None, "{bad}");
            assert!(extraction.issues.contains(&MalformedField {
                field: Field::SessionId,
                fault: FieldFault::Unparseable {
                    raw: bad.to_string()
                },
            }));
        }
    }

    #[test]
    fn unparseable_numbers_fall_back_to_zero() {
        let doc = "**Max Rounds:** many\n**Agent B Temperature:** warm\n**Memory Rounds:** 4 rounds\n";
        let extraction = extract(doc);
        let t = &extraction.transcript;
        assert_eq!(t.session.max_rounds, 0);
        assert_eq!(t.session.memory_rounds, 4);
        assert_eq!(t.agent(AgentLabel::B).temperature, 0.0);
        assert!(extraction.issues.contains(&MalformedField {
            field: Field::Temperature(AgentLabel::B),
            fault: FieldFault::Unparseable {
                raw: "warm".to_string()
            },
        }));
    }

    #[test]
    fn non_finite_temperatures_fall_back_to_zero() {
        for value in ["NaN", "inf", "-infinity", "1e3"] {
            let doc = SAMPLE.replace(
                "**Agent A Temperature:** 0.7",
                &format!("**Agent A Temperature:** {value}"),
            );
            let extraction = extract(&doc);
            assert_eq!(
                extraction.transcript.agent(AgentLabel::A).temperature,
                0.0,
                "{value}"
            );
            assert!(
                extraction.issues.contains(&MalformedField {
                    field: Field::Temperature(AgentLabel::A),
                    fault: FieldFault::Unparseable {
                        raw: value.to_string()
                    },
                }),
                "{value}"
            );
        }
    }

    #[test]
    fn stop_word_flag_requires_exact_enabled() {
        for (value, expected) in [
            ("Enabled", true),
            ("enabled", false),
            ("Disabled", false),
            ("Yes", false),
            ("Enabled extra", false),
            ("Enabled (default)", false),
        ] {
            let doc = format!("**Stop Word Detection:** {value}\n");
            assert_eq!(
                extract(&doc).transcript.session.stop_word_detection,
                expected,
                "{value}"
            );
        }
    }

    #[test]
    fn crlf_documents_extract_like_lf() {
        let crlf = SAMPLE.replace('\n', "\r\n");
        assert_eq!(extract(&crlf).transcript, extract(SAMPLE).transcript);
    }

    #[test]
    fn empty_message_body_is_kept() {
        let doc = "## Conversation\n\n### Human (2024-01-01 00:00:00)\n\n### Agent A (2024-01-01 00:00:01)\n<sub>x</sub>\n";
        let t = extract(doc).transcript;
        assert_eq!(t.messages.len(), 2);
        assert_eq!(t.messages[0].content, "");
        assert_eq!(t.messages[1].content, "");
        assert_eq!(t.messages[1].position, 1);
    }

    #[test]
    fn messages_outside_conversation_section_are_ignored() {
        let doc = "### Human (2024-01-01 00:00:00)\nstray\n\n## Conversation\n\n### Agent B (2024-01-01 00:00:02)\nkept\n";
        let t = extract(doc).transcript;
        assert_eq!(t.messages.len(), 1);
        assert_eq!(t.messages[0].speaker, Speaker::AgentB);
        assert_eq!(t.messages[0].position, 0);
        assert_eq!(t.messages[0].content, "kept");
    }

    #[test]
    fn extra_agent_blocks_do_not_add_agents() {
        let doc = "**Agent A Provider:** openai\n**Agent C Provider:** other\n**Agent A Provider:** duplicate\n";
        let t = extract(doc).transcript;
        assert_eq!(t.agents.len(), 2);
        assert_eq!(t.agent(AgentLabel::A).provider.as_deref(), Some("openai"));
    }
}

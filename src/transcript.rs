//! Structured record recovered from one Chat Bridge transcript: the session,
//! its two agent configurations, and the ordered conversation.

use serde::Serialize;

/// Session-level metadata. `session_id` is the external key for every row
/// written on behalf of this document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Session {
    pub session_id: Option<String>,
    pub started_at: Option<String>,
    pub conversation_starter: Option<String>,
    pub max_rounds: u32,
    pub memory_rounds: u32,
    pub stop_word_detection: bool,
    pub stop_words: Option<String>,
}

/// Which side of the bridge an agent configuration describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AgentLabel {
    A,
    B,
}

impl AgentLabel {
    pub const ALL: [AgentLabel; 2] = [AgentLabel::A, AgentLabel::B];

    /// Value stored in the `agent_label` column.
    pub fn as_str(self) -> &'static str {
        match self {
            AgentLabel::A => "A",
            AgentLabel::B => "B",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A" => Some(AgentLabel::A),
            "B" => Some(AgentLabel::B),
            _ => None,
        }
    }

    /// Slot in [`Transcript::agents`].
    pub fn index(self) -> usize {
        match self {
            AgentLabel::A => 0,
            AgentLabel::B => 1,
        }
    }
}

/// Provider/model settings for one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentConfig {
    pub label: AgentLabel,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: f64,
    pub persona: Option<String>,
    pub system_prompt: Option<String>,
}

impl AgentConfig {
    /// An agent with every descriptive field unset.
    pub fn unset(label: AgentLabel) -> Self {
        Self {
            label,
            provider: None,
            model: None,
            temperature: 0.0,
            persona: None,
            system_prompt: None,
        }
    }
}

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Speaker {
    #[serde(rename = "Human")]
    Human,
    #[serde(rename = "Agent A")]
    AgentA,
    #[serde(rename = "Agent B")]
    AgentB,
}

impl Speaker {
    /// Spelling used both in message headers and in the `speaker` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Speaker::Human => "Human",
            Speaker::AgentA => "Agent A",
            Speaker::AgentB => "Agent B",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Human" => Some(Speaker::Human),
            "Agent A" => Some(Speaker::AgentA),
            "Agent B" => Some(Speaker::AgentB),
            _ => None,
        }
    }
}

/// One conversation turn. `position` is zero-based and dense within a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub position: u32,
    pub speaker: Speaker,
    pub timestamp: String,
    pub content: String,
}

/// Everything extracted from a single document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub session: Session,
    /// Always agent A followed by agent B.
    pub agents: [AgentConfig; 2],
    pub messages: Vec<Message>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self {
            session: Session::default(),
            agents: AgentLabel::ALL.map(AgentConfig::unset),
            messages: Vec::new(),
        }
    }
}

impl Transcript {
    /// The session key, if present and non-empty.
    pub fn session_id(&self) -> Option<&str> {
        self.session
            .session_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
    }

    pub fn agent(&self, label: AgentLabel) -> &AgentConfig {
        &self.agents[label.index()]
    }

    pub fn agent_mut(&mut self, label: AgentLabel) -> &mut AgentConfig {
        &mut self.agents[label.index()]
    }
}

/// Idempotent persistence of one transcript.
///
/// [`apply`] writes the session, then both agents, then every message on a
/// transaction owned by the caller. Each write is an upsert keyed by the
/// natural key of its table, so applying the same transcript twice leaves
/// the store unchanged. Committing or rolling back is the caller's job.
use crate::transcript::{AgentConfig, Message, Session, Transcript};
use rusqlite::{params, Connection, Transaction};

/// Write phases, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Session,
    Agents,
    Messages,
    Commit,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Session => "session",
            Phase::Agents => "agents",
            Phase::Messages => "messages",
            Phase::Commit => "commit",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-document write progress.
///
/// `Parsed → SessionApplied → AgentsApplied → MessagesApplied → Committed`,
/// with `RolledBack` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Parsed,
    SessionApplied,
    AgentsApplied,
    MessagesApplied,
    Committed,
    RolledBack,
}

impl DocumentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentState::Committed | DocumentState::RolledBack)
    }

    /// The phase that moves this state forward, if any.
    pub fn next_phase(self) -> Option<Phase> {
        match self {
            DocumentState::Parsed => Some(Phase::Session),
            DocumentState::SessionApplied => Some(Phase::Agents),
            DocumentState::AgentsApplied => Some(Phase::Messages),
            DocumentState::MessagesApplied => Some(Phase::Commit),
            DocumentState::Committed | DocumentState::RolledBack => None,
        }
    }

    /// State after `phase` succeeds.
    pub fn after(phase: Phase) -> Self {
        match phase {
            Phase::Session => DocumentState::SessionApplied,
            Phase::Agents => DocumentState::AgentsApplied,
            Phase::Messages => DocumentState::MessagesApplied,
            Phase::Commit => DocumentState::Committed,
        }
    }
}

/// Errors that stop a transcript from being applied.
#[derive(Debug)]
pub enum PersistError {
    /// The transcript has no session identifier; nothing was written.
    MissingKey,
    /// A statement failed while running `phase`.
    Phase {
        phase: Phase,
        reached: DocumentState,
        source: rusqlite::Error,
    },
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::MissingKey => write!(f, "transcript has no session identifier"),
            PersistError::Phase { phase, source, .. } => {
                write!(f, "{phase} upsert failed: {source}")
            }
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistError::MissingKey => None,
            PersistError::Phase { source, .. } => Some(source),
        }
    }
}

/// What a successful [`apply`] wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistReport {
    pub session_id: String,
    pub agents: usize,
    pub messages: usize,
    /// Stored messages positioned past the end of this transcript, left over
    /// from an earlier, longer import. They are reported, not deleted.
    pub stale_messages: u64,
}

/// Apply a transcript inside `tx`.
///
/// On error the transaction holds partial writes and must be rolled back.
pub fn apply(tx: &Transaction<'_>, transcript: &Transcript) -> Result<PersistReport, PersistError> {
    let session_id = transcript.session_id().ok_or(PersistError::MissingKey)?;
    let mut state = DocumentState::Parsed;

    let fail = |phase: Phase, reached: DocumentState| {
        move |source: rusqlite::Error| PersistError::Phase {
            phase,
            reached,
            source,
        }
    };

    upsert_session(tx, session_id, &transcript.session).map_err(fail(Phase::Session, state))?;
    state = advance(session_id, state, Phase::Session);

    let agents =
        upsert_agents(tx, session_id, &transcript.agents).map_err(fail(Phase::Agents, state))?;
    state = advance(session_id, state, Phase::Agents);

    let messages = upsert_messages(tx, session_id, &transcript.messages)
        .map_err(fail(Phase::Messages, state))?;
    let stale_messages = count_stale_messages(tx, session_id, transcript.messages.len())
        .map_err(fail(Phase::Messages, state))?;
    advance(session_id, state, Phase::Messages);

    if stale_messages > 0 {
        tracing::warn!(
            session_id,
            stale_messages,
            "store holds messages beyond the end of this transcript"
        );
    }

    Ok(PersistReport {
        session_id: session_id.to_string(),
        agents,
        messages,
        stale_messages,
    })
}

fn advance(session_id: &str, from: DocumentState, phase: Phase) -> DocumentState {
    debug_assert_eq!(from.next_phase(), Some(phase));
    let to = DocumentState::after(phase);
    tracing::debug!(session_id, ?from, ?to, "phase applied");
    to
}

/// Insert the session row, or refresh its start time and starter on conflict.
/// Round limits and stop-word settings are fixed at first import.
pub fn upsert_session(conn: &Connection, session_id: &str, session: &Session) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO sessions
            (session_id, started_at, conversation_starter, max_rounds,
             memory_rounds, stop_word_detection, stop_words)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(session_id) DO UPDATE SET
            started_at = excluded.started_at,
            conversation_starter = excluded.conversation_starter",
        params![
            session_id,
            session.started_at,
            session.conversation_starter,
            session.max_rounds,
            session.memory_rounds,
            session.stop_word_detection,
            session.stop_words,
        ],
    )?;
    Ok(())
}

/// Insert both agent rows, or overwrite every descriptive field on conflict.
pub fn upsert_agents(
    conn: &Connection,
    session_id: &str,
    agents: &[AgentConfig; 2],
) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO agents
            (session_id, agent_label, provider, model, temperature, persona, system_prompt)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(session_id, agent_label) DO UPDATE SET
            provider = excluded.provider,
            model = excluded.model,
            temperature = excluded.temperature,
            persona = excluded.persona,
            system_prompt = excluded.system_prompt",
    )?;
    for agent in agents {
        stmt.execute(params![
            session_id,
            agent.label.as_str(),
            agent.provider,
            agent.model,
            agent.temperature,
            agent.persona,
            agent.system_prompt,
        ])?;
    }
    Ok(agents.len())
}

/// Insert each message at its position, or replace only the body on
/// conflict. Speaker and timestamp identify the slot and never change.
pub fn upsert_messages(
    conn: &Connection,
    session_id: &str,
    messages: &[Message],
) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO messages (session_id, message_order, speaker, timestamp, content)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(session_id, message_order) DO UPDATE SET
            content = excluded.content",
    )?;
    for message in messages {
        stmt.execute(params![
            session_id,
            message.position,
            message.speaker.as_str(),
            message.timestamp,
            message.content,
        ])?;
    }
    Ok(messages.len())
}

fn count_stale_messages(conn: &Connection, session_id: &str, len: usize) -> rusqlite::Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND message_order >= ?2",
        params![session_id, len as i64],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::extract::extract;
    use crate::transcript::{AgentLabel, Speaker};
    use tempfile::TempDir;

    const SAMPLE: &str = include_str!("../fixtures/conv_20240101_000001.md");

    fn test_db() -> (TempDir, Connection) {
        let dir = TempDir::new().unwrap();
        let conn = db::open_or_create(&dir.path().join("chat_bridge.db")).unwrap();
        (dir, conn)
    }

    fn apply_committed(conn: &mut Connection, t: &Transcript) -> Result<PersistReport, PersistError> {
        let tx = conn.transaction().unwrap();
        let report = apply(&tx, t)?;
        tx.commit().unwrap();
        Ok(report)
    }

    fn sample() -> Transcript {
        extract(SAMPLE).transcript
    }

    #[test]
    fn applies_session_agents_and_messages() {
        let (_dir, mut conn) = test_db();
        let report = apply_committed(&mut conn, &sample()).unwrap();

        assert_eq!(report.session_id, "conv_20240101_000001");
        assert_eq!(report.agents, 2);
        assert_eq!(report.messages, 3);
        assert_eq!(report.stale_messages, 0);

        let counts = db::table_counts(&conn).unwrap();
        assert_eq!((counts.sessions, counts.agents, counts.messages), (1, 2, 3));

        let stored = db::load_transcript(&conn, "conv_20240101_000001")
            .unwrap()
            .unwrap();
        assert_eq!(stored, sample());
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let (_dir, mut conn) = test_db();
        apply_committed(&mut conn, &sample()).unwrap();
        let first = db::load_transcript(&conn, "conv_20240101_000001").unwrap();
        apply_committed(&mut conn, &sample()).unwrap();
        let second = db::load_transcript(&conn, "conv_20240101_000001").unwrap();

        assert_eq!(first, second);
        let counts = db::table_counts(&conn).unwrap();
        assert_eq!((counts.sessions, counts.agents, counts.messages), (1, 2, 3));
    }

    #[test]
    fn session_conflict_updates_only_descriptive_fields() {
        let (_dir, mut conn) = test_db();
        apply_committed(&mut conn, &sample()).unwrap();

        let mut reimport = sample();
        reimport.session.started_at = Some("2024-01-02 08:30:00".to_string());
        reimport.session.conversation_starter = Some("Corrected prompt".to_string());
        reimport.session.max_rounds = 0;
        reimport.session.memory_rounds = 0;
        reimport.session.stop_word_detection = false;
        reimport.session.stop_words = None;
        apply_committed(&mut conn, &reimport).unwrap();

        let stored = db::load_transcript(&conn, "conv_20240101_000001")
            .unwrap()
            .unwrap();
        assert_eq!(stored.session.started_at.as_deref(), Some("2024-01-02 08:30:00"));
        assert_eq!(
            stored.session.conversation_starter.as_deref(),
            Some("Corrected prompt")
        );
        assert_eq!(stored.session.max_rounds, 10);
        assert_eq!(stored.session.memory_rounds, 8);
        assert!(stored.session.stop_word_detection);
        assert_eq!(stored.session.stop_words.as_deref(), Some("goodbye, end chat"));
    }

    #[test]
    fn agent_conflict_updates_every_field() {
        let (_dir, mut conn) = test_db();
        apply_committed(&mut conn, &sample()).unwrap();

        let mut reimport = sample();
        reimport.agents[1] = AgentConfig {
            label: AgentLabel::B,
            provider: Some("ollama".to_string()),
            model: Some("llama3".to_string()),
            temperature: 0.2,
            persona: None,
            system_prompt: Some("Be brief.".to_string()),
        };
        apply_committed(&mut conn, &reimport).unwrap();

        let stored = db::load_transcript(&conn, "conv_20240101_000001")
            .unwrap()
            .unwrap();
        assert_eq!(stored.agents[1], reimport.agents[1]);
        assert_eq!(stored.agents[0], sample().agents[0]);
    }

    #[test]
    fn message_conflict_updates_only_content() {
        let (_dir, mut conn) = test_db();
        apply_committed(&mut conn, &sample()).unwrap();

        let mut reimport = sample();
        reimport.messages[1].content = "Edited reply".to_string();
        reimport.messages[1].speaker = Speaker::AgentB;
        reimport.messages[1].timestamp = "2030-01-01 00:00:00".to_string();
        apply_committed(&mut conn, &reimport).unwrap();

        let stored = db::load_transcript(&conn, "conv_20240101_000001")
            .unwrap()
            .unwrap();
        assert_eq!(stored.messages.len(), 3);
        assert_eq!(stored.messages[1].content, "Edited reply");
        assert_eq!(stored.messages[1].speaker, Speaker::AgentA);
        assert_eq!(stored.messages[1].timestamp, "2024-01-01 12:00:07");
    }

    #[test]
    fn shorter_reimport_reports_stale_messages() {
        let (_dir, mut conn) = test_db();
        apply_committed(&mut conn, &sample()).unwrap();

        let mut shorter = sample();
        shorter.messages.truncate(1);
        let report = apply_committed(&mut conn, &shorter).unwrap();
        assert_eq!(report.messages, 1);
        assert_eq!(report.stale_messages, 2);
        assert_eq!(db::table_counts(&conn).unwrap().messages, 3);
    }

    #[test]
    fn missing_key_writes_nothing() {
        let (_dir, mut conn) = test_db();
        let mut t = sample();
        t.session.session_id = None;

        let tx = conn.transaction().unwrap();
        let err = apply(&tx, &t).unwrap_err();
        assert!(matches!(err, PersistError::MissingKey));
        tx.commit().unwrap();

        assert_eq!(db::table_counts(&conn).unwrap(), db::TableCounts::default());
    }

    #[test]
    fn message_failure_reports_phase_and_rolls_back() {
        let (_dir, mut conn) = test_db();
        conn.execute_batch(
            "CREATE TRIGGER reject_boom BEFORE INSERT ON messages
             WHEN NEW.content = 'boom'
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();

        let mut t = sample();
        t.messages[2].content = "boom".to_string();

        let tx = conn.transaction().unwrap();
        let err = apply(&tx, &t).unwrap_err();
        match err {
            PersistError::Phase { phase, reached, .. } => {
                assert_eq!(phase, Phase::Messages);
                assert_eq!(reached, DocumentState::AgentsApplied);
            }
            other => panic!("expected phase error, got {other:?}"),
        }
        tx.rollback().unwrap();

        assert_eq!(db::table_counts(&conn).unwrap(), db::TableCounts::default());
    }

    #[test]
    fn state_machine_order() {
        let mut state = DocumentState::Parsed;
        let mut phases = Vec::new();
        while let Some(phase) = state.next_phase() {
            phases.push(phase);
            state = DocumentState::after(phase);
        }
        assert_eq!(
            phases,
            vec![Phase::Session, Phase::Agents, Phase::Messages, Phase::Commit]
        );
        assert_eq!(state, DocumentState::Committed);
        assert!(state.is_terminal());
        assert!(DocumentState::RolledBack.is_terminal());
        assert!(!DocumentState::MessagesApplied.is_terminal());
    }
}

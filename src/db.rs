use crate::transcript::{AgentConfig, AgentLabel, Message, Session, Speaker, Transcript};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Opens (or creates) the transcript database at the given path.
///
/// Creates the sessions, agents and messages tables if they don't already exist.
/// Returns an open connection ready for use.
pub fn open_or_create(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    // Enable WAL mode so concurrent ingest workers don't block readers
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_id           TEXT PRIMARY KEY,
            started_at           TEXT,
            conversation_starter TEXT,
            max_rounds           INTEGER NOT NULL DEFAULT 0,
            memory_rounds        INTEGER NOT NULL DEFAULT 0,
            stop_word_detection  INTEGER NOT NULL DEFAULT 0,
            stop_words           TEXT
        );

        CREATE TABLE IF NOT EXISTS agents (
            session_id    TEXT NOT NULL REFERENCES sessions(session_id),
            agent_label   TEXT NOT NULL CHECK (agent_label IN ('A', 'B')),
            provider      TEXT,
            model         TEXT,
            temperature   REAL NOT NULL DEFAULT 0,
            persona       TEXT,
            system_prompt TEXT,
            PRIMARY KEY (session_id, agent_label)
        );

        CREATE TABLE IF NOT EXISTS messages (
            session_id    TEXT NOT NULL REFERENCES sessions(session_id),
            message_order INTEGER NOT NULL,
            speaker       TEXT NOT NULL CHECK (speaker IN ('Human', 'Agent A', 'Agent B')),
            timestamp     TEXT NOT NULL,
            content       TEXT NOT NULL,
            PRIMARY KEY (session_id, message_order)
        );",
    )?;

    Ok(conn)
}

/// Hands out one connection per document being ingested.
///
/// The schema must already exist (see [`Store::init`]); `acquire` never
/// creates the database file.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the database file and schema if missing.
    pub fn init(&self) -> Result<()> {
        open_or_create(&self.path).map(drop)
    }

    /// Open a connection to an existing database. Dropping the connection
    /// releases it.
    pub fn acquire(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }
}

/// Row counts per table, for batch summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableCounts {
    pub sessions: i64,
    pub agents: i64,
    pub messages: i64,
}

pub fn table_counts(conn: &Connection) -> Result<TableCounts> {
    let count = |table: &str| -> Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
    };
    Ok(TableCounts {
        sessions: count("sessions")?,
        agents: count("agents")?,
        messages: count("messages")?,
    })
}

/// Read a stored session back into a [`Transcript`].
///
/// Returns `None` when no session row exists. Missing agent rows come back
/// unset; messages are ordered by position.
pub fn load_transcript(conn: &Connection, session_id: &str) -> Result<Option<Transcript>> {
    let session = conn
        .query_row(
            "SELECT session_id, started_at, conversation_starter, max_rounds, memory_rounds,
                    stop_word_detection, stop_words
             FROM sessions WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok(Session {
                    session_id: row.get(0)?,
                    started_at: row.get(1)?,
                    conversation_starter: row.get(2)?,
                    max_rounds: row.get(3)?,
                    memory_rounds: row.get(4)?,
                    stop_word_detection: row.get(5)?,
                    stop_words: row.get(6)?,
                })
            },
        )
        .optional()?;

    let Some(session) = session else {
        return Ok(None);
    };

    let mut transcript = Transcript {
        session,
        ..Transcript::default()
    };

    let mut stmt = conn.prepare(
        "SELECT agent_label, provider, model, temperature, persona, system_prompt
         FROM agents WHERE session_id = ?1",
    )?;
    let rows = stmt.query_map(params![session_id], |row| {
        let label: String = row.get(0)?;
        Ok((
            label,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;
    for row in rows {
        let (label, provider, model, temperature, persona, system_prompt) = row?;
        let Some(label) = AgentLabel::parse(&label) else {
            continue;
        };
        *transcript.agent_mut(label) = AgentConfig {
            label,
            provider,
            model,
            temperature,
            persona,
            system_prompt,
        };
    }

    let mut stmt = conn.prepare(
        "SELECT message_order, speaker, timestamp, content
         FROM messages WHERE session_id = ?1 ORDER BY message_order ASC",
    )?;
    transcript.messages = stmt
        .query_map(params![session_id], map_message)?
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect();

    Ok(Some(transcript))
}

fn map_message(row: &rusqlite::Row) -> Result<Option<Message>> {
    let speaker: String = row.get(1)?;
    let Some(speaker) = Speaker::parse(&speaker) else {
        return Ok(None);
    };
    Ok(Some(Message {
        position: row.get(0)?,
        speaker,
        timestamp: row.get(2)?,
        content: row.get(3)?,
    }))
}

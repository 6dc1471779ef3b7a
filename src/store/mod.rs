//! C1 — the append-only Event Log, the system's source of truth.
//!
//! Backed by `sqlx` against SQLite. SQLite has no row-level
//! `SELECT ... FOR UPDATE`, so dense per-conversation sequence numbers are
//! enforced with a `UNIQUE(conversation_id, sequence)` constraint,
//! `BEGIN IMMEDIATE` transactions, and bounded retry on
//! `SQLITE_BUSY`/unique-violation. See `DESIGN.md` for the full reasoning.

use crate::error::{Error, Result};
use crate::model::{ConversationEvent, EventKind, Message};
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

const APPEND_RETRY_BUDGET: usize = 8;

/// A tail entry, the unit [`EventStore::tail`] broadcasts to subscribers.
/// `log_id` is a global monotonic counter — the id C7 frames carry so
/// clients can resume with `Last-Event-ID`.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub log_id: i64,
    pub event: ConversationEvent,
}

/// The durable Event Log.
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
    tail_tx: broadcast::Sender<LogEntry>,
}

impl EventStore {
    /// Connects (creating the database file/schema if needed) and prepares
    /// the hot tail broadcast channel.
    pub async fn connect(database_url: &str) -> Result<Self> {
        // `:memory:` databases are private per-connection; a pool of more than
        // one connection would silently scatter tables/rows across separate
        // in-memory databases. Single-writer SQLite gains nothing from more
        // than one connection anyway for a file-backed database either.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let (tail_tx, _) = broadcast::channel(4096);
        let store = Self { pool, tail_tx };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS squads (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL,
                active INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                squad_id TEXT NOT NULL REFERENCES squads(id),
                role TEXT NOT NULL,
                specialization TEXT NOT NULL,
                generator_ref TEXT NOT NULL,
                system_prompt TEXT NOT NULL,
                tool_capabilities TEXT NOT NULL,
                active INTEGER NOT NULL,
                UNIQUE(squad_id, role, specialization)
            );
            CREATE INDEX IF NOT EXISTS idx_agents_squad ON agents(squad_id);

            CREATE TABLE IF NOT EXISTS routing_rules (
                id TEXT PRIMARY KEY,
                squad_id TEXT NOT NULL REFERENCES squads(id),
                asker_role TEXT NOT NULL,
                question_type TEXT NOT NULL,
                escalation_level INTEGER NOT NULL,
                responder_role TEXT NOT NULL,
                priority INTEGER NOT NULL,
                active INTEGER NOT NULL,
                UNIQUE(squad_id, asker_role, question_type, escalation_level, responder_role)
            );
            CREATE INDEX IF NOT EXISTS idx_rules_lookup
                ON routing_rules(squad_id, asker_role, escalation_level);

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                squad_id TEXT NOT NULL REFERENCES squads(id),
                task_execution_id TEXT,
                asker_agent_id TEXT NOT NULL,
                current_responder_agent_id TEXT,
                question_type TEXT NOT NULL,
                escalation_level INTEGER NOT NULL,
                state TEXT NOT NULL,
                parent_conversation_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                closed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS conversation_events (
                log_id INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                squad_id TEXT NOT NULL,
                conversation_id TEXT,
                sequence INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                author_agent_id TEXT,
                occurred_at TEXT NOT NULL,
                UNIQUE(conversation_id, sequence)
            );
            CREATE INDEX IF NOT EXISTS idx_events_conversation
                ON conversation_events(conversation_id, sequence);
            CREATE INDEX IF NOT EXISTS idx_events_squad
                ON conversation_events(squad_id, conversation_id, sequence);

            CREATE TABLE IF NOT EXISTS messages (
                message_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT,
                squad_id TEXT NOT NULL,
                sender_agent_id TEXT NOT NULL,
                recipient_agent_id TEXT,
                type TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_recipient
                ON messages(recipient_agent_id, message_seq);
            CREATE INDEX IF NOT EXISTS idx_messages_squad
                ON messages(squad_id, message_seq);

            CREATE TABLE IF NOT EXISTS agent_watermarks (
                agent_id TEXT PRIMARY KEY,
                high_watermark INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS templates (
                slug TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                version TEXT NOT NULL,
                body TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Subscribes to the hot tail of new appends. The SSE fan-out is its
    /// sole consumer; callers filter by squad/conversation themselves since
    /// the channel carries every append in the process.
    pub fn tail(&self) -> broadcast::Receiver<LogEntry> {
        self.tail_tx.subscribe()
    }

    /// Appends one [`ConversationEvent`] and returns its assigned sequence.
    ///
    /// Retries on unique-constraint violation / `SQLITE_BUSY` up to
    /// [`APPEND_RETRY_BUDGET`] times.
    pub async fn append(
        &self,
        squad_id: Uuid,
        conversation_id: Option<Uuid>,
        kind: EventKind,
        payload: Value,
        author_agent_id: Option<Uuid>,
    ) -> Result<ConversationEvent> {
        for attempt in 0..APPEND_RETRY_BUDGET {
            match self
                .try_append(squad_id, conversation_id, kind, payload.clone(), author_agent_id)
                .await
            {
                Ok(event) => return Ok(event),
                Err(Error::Conflict(_)) if attempt + 1 < APPEND_RETRY_BUDGET => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(
            "append retry budget exhausted".to_string(),
        ))
    }

    async fn try_append(
        &self,
        squad_id: Uuid,
        conversation_id: Option<Uuid>,
        kind: EventKind,
        payload: Value,
        author_agent_id: Option<Uuid>,
    ) -> Result<ConversationEvent> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let next_sequence: i64 = if let Some(cid) = conversation_id {
            let row = sqlx::query(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM conversation_events WHERE conversation_id = ?",
            )
            .bind(cid.to_string())
            .fetch_one(&mut *tx)
            .await?;
            row.try_get::<i64, _>(0)?
        } else {
            let row = sqlx::query(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM conversation_events \
                 WHERE squad_id = ? AND conversation_id IS NULL",
            )
            .bind(squad_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
            row.try_get::<i64, _>(0)?
        };

        let id = Uuid::new_v4();
        let occurred_at = Utc::now();
        let payload_text = serde_json::to_string(&payload)
            .map_err(|e| Error::Invalid(format!("event payload not serializable: {e}")))?;

        let insert = sqlx::query(
            "INSERT INTO conversation_events \
             (id, squad_id, conversation_id, sequence, kind, payload, author_agent_id, occurred_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(squad_id.to_string())
        .bind(conversation_id.map(|c| c.to_string()))
        .bind(next_sequence)
        .bind(kind.as_str())
        .bind(&payload_text)
        .bind(author_agent_id.map(|a| a.to_string()))
        .bind(occurred_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        let insert = match insert {
            Ok(r) => r,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await.ok();
                return Err(Error::Conflict(format!(
                    "concurrent append at sequence {next_sequence}"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let log_id = insert.last_insert_rowid();

        if let Some(cid) = conversation_id {
            sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
                .bind(occurred_at.to_rfc3339())
                .bind(cid.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let event = ConversationEvent {
            id,
            squad_id,
            conversation_id,
            sequence: next_sequence,
            kind,
            payload,
            author_agent_id,
            occurred_at,
        };
        let _ = self.tail_tx.send(LogEntry { log_id, event: event.clone() });
        Ok(event)
    }

    /// Transactionally persists a [`Message`] and, if it belongs to a
    /// conversation, a `message_appended` [`ConversationEvent`] carrying the
    /// message id in its payload — both rows in the same transaction, so a
    /// message is never observable without its event or vice versa. Returns
    /// the message id and its `message_seq`, the ordinal the bus's
    /// per-agent high-watermark is keyed on.
    ///
    /// Broadcasts (`conversation_id = None`) get a squad-scoped event with
    /// no conversation, sequenced against the squad's broadcast stream the
    /// same way `append` sequences conversation-scoped events.
    pub async fn append_message(&self, message: &Message, squad_id: Uuid) -> Result<(Uuid, i64)> {
        for attempt in 0..APPEND_RETRY_BUDGET {
            match self.try_append_message(message, squad_id).await {
                Ok(message_seq) => return Ok((message.id, message_seq)),
                Err(Error::Conflict(_)) if attempt + 1 < APPEND_RETRY_BUDGET => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(
            "append_message retry budget exhausted".to_string(),
        ))
    }

    async fn try_append_message(&self, message: &Message, squad_id: Uuid) -> Result<i64> {
        let metadata_text = serde_json::to_string(&message.metadata)
            .map_err(|e| Error::Invalid(format!("message metadata not serializable: {e}")))?;
        let payload_text = serde_json::to_string(&serde_json::json!({ "messageId": message.id }))
            .map_err(|e| Error::Invalid(format!("event payload not serializable: {e}")))?;

        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let insert = sqlx::query(
            "INSERT INTO messages \
             (id, conversation_id, squad_id, sender_agent_id, recipient_agent_id, type, content, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(message.conversation_id.map(|c| c.to_string()))
        .bind(squad_id.to_string())
        .bind(message.sender_agent_id.to_string())
        .bind(message.recipient_agent_id.map(|r| r.to_string()))
        .bind(message.message_type.as_str())
        .bind(&message.content)
        .bind(&metadata_text)
        .bind(message.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        let message_seq = insert.last_insert_rowid();

        let next_sequence: i64 = if let Some(cid) = message.conversation_id {
            let row = sqlx::query(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM conversation_events WHERE conversation_id = ?",
            )
            .bind(cid.to_string())
            .fetch_one(&mut *tx)
            .await?;
            row.try_get::<i64, _>(0)?
        } else {
            let row = sqlx::query(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM conversation_events \
                 WHERE squad_id = ? AND conversation_id IS NULL",
            )
            .bind(squad_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
            row.try_get::<i64, _>(0)?
        };

        let event_id = Uuid::new_v4();
        let occurred_at = Utc::now();
        let event_insert = sqlx::query(
            "INSERT INTO conversation_events \
             (id, squad_id, conversation_id, sequence, kind, payload, author_agent_id, occurred_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event_id.to_string())
        .bind(squad_id.to_string())
        .bind(message.conversation_id.map(|c| c.to_string()))
        .bind(next_sequence)
        .bind(EventKind::MessageAppended.as_str())
        .bind(&payload_text)
        .bind(message.sender_agent_id.to_string())
        .bind(occurred_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        let event_insert = match event_insert {
            Ok(r) => r,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await.ok();
                return Err(Error::Conflict(format!(
                    "concurrent append at sequence {next_sequence}"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let log_id = event_insert.last_insert_rowid();

        if let Some(cid) = message.conversation_id {
            sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
                .bind(occurred_at.to_rfc3339())
                .bind(cid.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let event = ConversationEvent {
            id: event_id,
            squad_id,
            conversation_id: message.conversation_id,
            sequence: next_sequence,
            kind: EventKind::MessageAppended,
            payload: serde_json::json!({ "messageId": message.id }),
            author_agent_id: Some(message.sender_agent_id),
            occurred_at,
        };
        let _ = self.tail_tx.send(LogEntry { log_id, event });

        Ok(message_seq)
    }

    /// Ordered, finite read of a conversation's timeline.
    pub async fn read_timeline(
        &self,
        conversation_id: Uuid,
        from_sequence: i64,
        limit: i64,
    ) -> Result<Vec<ConversationEvent>> {
        let rows = sqlx::query(
            "SELECT id, squad_id, conversation_id, sequence, kind, payload, author_agent_id, occurred_at \
             FROM conversation_events \
             WHERE conversation_id = ? AND sequence >= ? \
             ORDER BY sequence ASC LIMIT ?",
        )
        .bind(conversation_id.to_string())
        .bind(from_sequence)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Highest sequence committed for a conversation, used by C7 to compute
    /// the resume cursor on connect.
    pub async fn max_sequence(&self, conversation_id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) FROM conversation_events WHERE conversation_id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    /// Highest `log_id` committed across the whole log, the SSE resume
    /// cursor's upper bound on connect.
    pub async fn max_log_id(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(log_id), 0) FROM conversation_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    /// Last message_seq this agent's runtime has consumed, persisted so a
    /// restarted runtime can replay exactly what it missed.
    pub async fn get_watermark(&self, agent_id: Uuid) -> Result<i64> {
        let row = sqlx::query("SELECT high_watermark FROM agent_watermarks WHERE agent_id = ?")
            .bind(agent_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<i64, _>(0)).transpose()?.unwrap_or(0))
    }

    pub async fn set_watermark(&self, agent_id: Uuid, message_seq: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_watermarks (agent_id, high_watermark) VALUES (?, ?) \
             ON CONFLICT(agent_id) DO UPDATE SET high_watermark = excluded.high_watermark",
        )
        .bind(agent_id.to_string())
        .bind(message_seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Messages addressed to `agent_id` (directly, or broadcast to its
    /// squad) committed after `after_seq`, in commit order — the redelivery
    /// set a runtime replays on startup per its persisted high-watermark.
    pub async fn read_messages_for_recipient_since(
        &self,
        agent_id: Uuid,
        squad_id: Uuid,
        after_seq: i64,
    ) -> Result<Vec<(i64, Message)>> {
        let rows = sqlx::query(
            "SELECT message_seq, id, conversation_id, sender_agent_id, recipient_agent_id, \
             type, content, metadata, created_at \
             FROM messages \
             WHERE message_seq > ? AND squad_id = ? \
             AND (recipient_agent_id = ? OR (recipient_agent_id IS NULL AND sender_agent_id != ?)) \
             ORDER BY message_seq ASC",
        )
        .bind(after_seq)
        .bind(squad_id.to_string())
        .bind(agent_id.to_string())
        .bind(agent_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                let message_seq: i64 = r.try_get("message_seq")?;
                Ok((message_seq, row_to_message(r)?))
            })
            .collect()
    }

    /// Looks up one message by id, used by C7 to enrich a `message_appended`
    /// SSE frame with the full message body.
    pub async fn get_message(&self, id: Uuid) -> Result<Message> {
        let row = sqlx::query(
            "SELECT message_seq, id, conversation_id, sender_agent_id, recipient_agent_id, \
             type, content, metadata, created_at \
             FROM messages WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("message {id}")))?;
        row_to_message(&row)
    }

    /// The first message posted in a conversation — the opening question,
    /// used by escalation to forward the original content to the child
    /// conversation rather than just the question type.
    pub async fn first_message_for_conversation(&self, conversation_id: Uuid) -> Result<Message> {
        let row = sqlx::query(
            "SELECT message_seq, id, conversation_id, sender_agent_id, recipient_agent_id, \
             type, content, metadata, created_at \
             FROM messages \
             WHERE conversation_id = ? \
             ORDER BY message_seq ASC LIMIT 1",
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no messages for conversation {conversation_id}")))?;
        row_to_message(&row)
    }

    /// The most recent messages exchanged in a conversation, oldest first —
    /// the windowed history C5 feeds a `TextGenerator` call
    /// (`AGENT_HISTORY_WINDOW`).
    pub async fn read_conversation_messages(&self, conversation_id: Uuid, limit: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT message_seq, id, conversation_id, sender_agent_id, recipient_agent_id, \
             type, content, metadata, created_at \
             FROM messages \
             WHERE conversation_id = ? \
             ORDER BY message_seq DESC LIMIT ?",
        )
        .bind(conversation_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut messages = rows.iter().map(row_to_message).collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Events for a squad (across all its conversations and broadcasts)
    /// with `log_id > after`, ordered ascending — used both for SSE resume
    /// replay and for crash-recovery sweeps.
    pub async fn read_squad_log_since(
        &self,
        squad_id: Uuid,
        after_log_id: i64,
        limit: i64,
    ) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            "SELECT log_id, id, squad_id, conversation_id, sequence, kind, payload, author_agent_id, occurred_at \
             FROM conversation_events \
             WHERE squad_id = ? AND log_id > ? \
             ORDER BY log_id ASC LIMIT ?",
        )
        .bind(squad_id.to_string())
        .bind(after_log_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(LogEntry {
                    log_id: r.try_get("log_id")?,
                    event: row_to_event(r)?,
                })
            })
            .collect()
    }
}

fn row_to_event(row: &SqliteRow) -> Result<ConversationEvent> {
    let id: String = row.try_get("id")?;
    let squad_id: String = row.try_get("squad_id")?;
    let conversation_id: Option<String> = row.try_get("conversation_id")?;
    let sequence: i64 = row.try_get("sequence")?;
    let kind: String = row.try_get("kind")?;
    let payload: String = row.try_get("payload")?;
    let author_agent_id: Option<String> = row.try_get("author_agent_id")?;
    let occurred_at: String = row.try_get("occurred_at")?;

    Ok(ConversationEvent {
        id: Uuid::parse_str(&id).map_err(|e| Error::Invalid(e.to_string()))?,
        squad_id: Uuid::parse_str(&squad_id).map_err(|e| Error::Invalid(e.to_string()))?,
        conversation_id: conversation_id
            .map(|c| Uuid::parse_str(&c))
            .transpose()
            .map_err(|e| Error::Invalid(e.to_string()))?,
        sequence,
        kind: EventKind::parse(&kind)
            .ok_or_else(|| Error::Invalid(format!("unknown event kind {kind}")))?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| Error::Invalid(format!("corrupt event payload: {e}")))?,
        author_agent_id: author_agent_id
            .map(|a| Uuid::parse_str(&a))
            .transpose()
            .map_err(|e| Error::Invalid(e.to_string()))?,
        occurred_at: chrono::DateTime::parse_from_rfc3339(&occurred_at)
            .map_err(|e| Error::Invalid(e.to_string()))?
            .with_timezone(&Utc),
    })
}

fn row_to_message(row: &SqliteRow) -> Result<Message> {
    use crate::model::MessageType;

    let id: String = row.try_get("id")?;
    let conversation_id: Option<String> = row.try_get("conversation_id")?;
    let sender_agent_id: String = row.try_get("sender_agent_id")?;
    let recipient_agent_id: Option<String> = row.try_get("recipient_agent_id")?;
    let message_type: String = row.try_get("type")?;
    let content: String = row.try_get("content")?;
    let metadata: String = row.try_get("metadata")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(Message {
        id: Uuid::parse_str(&id).map_err(|e| Error::Invalid(e.to_string()))?,
        conversation_id: conversation_id
            .map(|c| Uuid::parse_str(&c))
            .transpose()
            .map_err(|e| Error::Invalid(e.to_string()))?,
        sender_agent_id: Uuid::parse_str(&sender_agent_id)
            .map_err(|e| Error::Invalid(e.to_string()))?,
        recipient_agent_id: recipient_agent_id
            .map(|r| Uuid::parse_str(&r))
            .transpose()
            .map_err(|e| Error::Invalid(e.to_string()))?,
        message_type: MessageType::parse(&message_type)
            .ok_or_else(|| Error::Invalid(format!("unknown message type {message_type}")))?,
        content,
        metadata: message_metadata_from_json(&metadata),
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| Error::Invalid(e.to_string()))?
            .with_timezone(&Utc),
    })
}

/// Helper retained for callers that need to reconstruct a [`Message`] from a
/// raw row (C8's timeline/history endpoints); not used by the append path.
pub fn message_metadata_from_json(raw: &str) -> HashMap<String, Value> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_store() -> EventStore {
        EventStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn append_assigns_dense_sequences() {
        let store = new_store().await;
        let squad_id = Uuid::new_v4();
        let conversation_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO conversations (id, squad_id, asker_agent_id, question_type, \
             escalation_level, state, created_at, updated_at) \
             VALUES (?, ?, ?, 'default', 0, 'initiated', ?, ?)",
        )
        .bind(conversation_id.to_string())
        .bind(squad_id.to_string())
        .bind(Uuid::new_v4().to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(store.pool())
        .await
        .unwrap();

        for i in 1..=3 {
            let event = store
                .append(
                    squad_id,
                    Some(conversation_id),
                    EventKind::StateChanged,
                    serde_json::json!({ "i": i }),
                    None,
                )
                .await
                .unwrap();
            assert_eq!(event.sequence, i);
        }

        let timeline = store.read_timeline(conversation_id, 1, 100).await.unwrap();
        assert_eq!(timeline.len(), 3);
        assert_eq!(timeline[0].sequence, 1);
        assert_eq!(timeline[2].sequence, 3);
    }

    #[tokio::test]
    async fn broadcast_events_have_no_conversation() {
        let store = new_store().await;
        let squad_id = Uuid::new_v4();
        let event = store
            .append(
                squad_id,
                None,
                EventKind::MessageAppended,
                serde_json::json!({}),
                None,
            )
            .await
            .unwrap();
        assert!(event.conversation_id.is_none());
        assert_eq!(event.sequence, 1);
    }
}

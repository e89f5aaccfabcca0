use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{from_micros, json_col, micros, uuid_col, Store};
use crate::error::{Error, Result};
use crate::types::{Conversation, Role, Turn};

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: uuid_col(row, 0)?,
        user_id: row.get(1)?,
        started_at: from_micros(row.get(2)?),
        last_message_at: row.get::<_, Option<i64>>(3)?.map(from_micros),
    })
}

fn turn_from_row(row: &Row<'_>) -> rusqlite::Result<Turn> {
    let role: String = row.get(1)?;
    Ok(Turn {
        id: uuid_col(row, 0)?,
        role: Role::parse(&role).unwrap_or(Role::User),
        content: row.get(2)?,
        created_at: from_micros(row.get(3)?),
        meta: json_col(row, 4)?,
    })
}

impl Store {
    /// Fetch the conversation, creating it under `id` when absent.
    pub async fn ensure_conversation(&self, id: Uuid, user_id: &str) -> Result<Conversation> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let now = micros(&Utc::now());
            conn.execute(
                "INSERT OR IGNORE INTO conversations (id, user_id, started_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), user_id, now],
            )?;
            Ok(conn.query_row(
                "SELECT id, user_id, started_at, last_message_at FROM conversations WHERE id = ?1",
                params![id.to_string()],
                conversation_from_row,
            )?)
        })
        .await
    }

    pub async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, user_id, started_at, last_message_at FROM conversations WHERE id = ?1",
                    params![id.to_string()],
                    conversation_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// The most recent `limit` turns in chronological order.
    pub async fn recent_turns(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<Turn>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, role, content, created_at, meta FROM conversation_turns
                 WHERE conversation_id = ?1
                 ORDER BY created_at DESC
                 LIMIT ?2",
            )?;
            let mut turns = stmt
                .query_map(
                    params![conversation_id.to_string(), limit as i64],
                    turn_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            turns.reverse();
            Ok(turns)
        })
        .await
    }

    pub async fn list_turns(&self, conversation_id: Uuid) -> Result<Vec<Turn>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, role, content, created_at, meta FROM conversation_turns
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC",
            )?;
            let turns = stmt
                .query_map(params![conversation_id.to_string()], turn_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(turns)
        })
        .await
    }

    /// Persist a user/assistant pair atomically. The assistant turn must be
    /// strictly later than the user turn. A pair that would not sort after
    /// the conversation's latest turn is shifted forward, keeping its gap.
    pub async fn save_turn_pair(
        &self,
        conversation_id: Uuid,
        user_turn: Turn,
        assistant_turn: Turn,
    ) -> Result<(Turn, Turn)> {
        if assistant_turn.created_at <= user_turn.created_at {
            return Err(Error::Integrity(
                "assistant turn must be created after its user turn".into(),
            ));
        }
        self.call(move |conn| {
            let (mut user_turn, mut assistant_turn) = (user_turn, assistant_turn);
            let tx = conn.transaction()?;
            let latest: Option<i64> = tx.query_row(
                "SELECT MAX(created_at) FROM conversation_turns WHERE conversation_id = ?1",
                params![conversation_id.to_string()],
                |row| row.get(0),
            )?;
            if let Some(latest) = latest {
                let shift = latest + 1 - micros(&user_turn.created_at);
                if shift > 0 {
                    user_turn.created_at += chrono::Duration::microseconds(shift);
                    assistant_turn.created_at += chrono::Duration::microseconds(shift);
                }
            }
            for turn in [&user_turn, &assistant_turn] {
                let meta = turn.meta.as_ref().map(serde_json::to_string).transpose()?;
                tx.execute(
                    "INSERT INTO conversation_turns (id, conversation_id, role, content, created_at, meta)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        turn.id.to_string(),
                        conversation_id.to_string(),
                        turn.role.as_str(),
                        turn.content,
                        micros(&turn.created_at),
                        meta,
                    ],
                )?;
            }
            let updated = tx.execute(
                "UPDATE conversations SET last_message_at = ?2 WHERE id = ?1",
                params![conversation_id.to_string(), micros(&assistant_turn.created_at)],
            )?;
            if updated != 1 {
                return Err(Error::NotFound(format!("conversation {}", conversation_id)));
            }
            tx.commit()?;
            Ok((user_turn, assistant_turn))
        })
        .await
    }
}

use chrono::Utc;

use super::schema::Database;
use super::types::DatabaseError;
use crate::subscriber::{ChatId, Subscriber};

/// Times an edit is re-applied after losing a race before giving up.
const MAX_EDIT_ATTEMPTS: usize = 8;

impl Database {
    // ========================================================================
    // Subscriber Operations
    // ========================================================================

    /// Insert or replace a subscriber's full state (UPSERT).
    ///
    /// This overwrites whatever is stored. Changes to a chat that may be
    /// running go through [`Database::update_subscriber`] instead.
    pub async fn save_subscriber(&self, subscriber: &Subscriber) -> Result<(), DatabaseError> {
        let state = serde_json::to_string(subscriber)?;
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO subscribers (chat_id, state, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chat_id) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at,
                revision = revision + 1
        "#,
        )
        .bind(subscriber.chat_id())
        .bind(&state)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    /// Load one subscriber, or `None` if the chat never started.
    pub async fn load_subscriber(&self, chat_id: ChatId) -> Result<Option<Subscriber>, DatabaseError> {
        Ok(self
            .load_versioned(chat_id)
            .await?
            .map(|(subscriber, _)| subscriber))
    }

    /// Apply `edit` to the stored subscriber and save the result atomically.
    ///
    /// The subscriber is loaded together with its revision and written back
    /// only if nobody saved it in between. On a lost race the edit is
    /// re-applied to the fresh state, so concurrent writers (the running
    /// scheduler and CLI commands) never overwrite each other's changes.
    ///
    /// # Arguments
    ///
    /// * `chat_id` - The chat to edit
    /// * `edit` - Mutates the subscriber; may run more than once. Returning
    ///   `Err` aborts without saving
    ///
    /// # Returns
    ///
    /// `Some` with the edit's value once saved, or `None` if the chat does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns the edit's own error unchanged, database errors converted
    /// into `E`, and `DatabaseError::Conflict` if every attempt lost.
    pub async fn update_subscriber<T, E, F>(&self, chat_id: ChatId, mut edit: F) -> Result<Option<T>, E>
    where
        F: FnMut(&mut Subscriber) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        for attempt in 1..=MAX_EDIT_ATTEMPTS {
            let Some((mut subscriber, revision)) = self.load_versioned(chat_id).await? else {
                return Ok(None);
            };
            let value = edit(&mut subscriber)?;
            if self.save_if_revision(&subscriber, revision).await? {
                return Ok(Some(value));
            }
            tracing::debug!(chat_id = chat_id, attempt = attempt, "Subscriber changed during edit, retrying");
        }
        Err(DatabaseError::Conflict(chat_id).into())
    }

    async fn load_versioned(&self, chat_id: ChatId) -> Result<Option<(Subscriber, i64)>, DatabaseError> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT state, revision FROM subscribers WHERE chat_id = ?")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;

        match row {
            Some((state, revision)) => Ok(Some((serde_json::from_str(&state)?, revision))),
            None => Ok(None),
        }
    }

    /// Compare-and-swap write. Returns false if the stored revision moved on
    /// or the row was deleted.
    async fn save_if_revision(&self, subscriber: &Subscriber, revision: i64) -> Result<bool, DatabaseError> {
        let state = serde_json::to_string(subscriber)?;
        let result = sqlx::query(
            r#"
            UPDATE subscribers SET state = ?, updated_at = ?, revision = revision + 1
            WHERE chat_id = ? AND revision = ?
        "#,
        )
        .bind(&state)
        .bind(Utc::now().timestamp())
        .bind(subscriber.chat_id())
        .bind(revision)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    /// Every stored subscriber, by ascending chat id. Rows that fail to
    /// decode are skipped with a warning so one corrupt row cannot stop the
    /// scheduler from starting.
    pub async fn list_subscribers(&self) -> Result<Vec<Subscriber>, DatabaseError> {
        let rows: Vec<(ChatId, String)> =
            sqlx::query_as("SELECT chat_id, state FROM subscribers ORDER BY chat_id")
                .fetch_all(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;

        let subscribers = rows
            .into_iter()
            .filter_map(|(chat_id, state)| match serde_json::from_str(&state) {
                Ok(subscriber) => Some(subscriber),
                Err(e) => {
                    tracing::warn!(chat_id = chat_id, error = %e, "Skipping undecodable subscriber");
                    None
                }
            })
            .collect();
        Ok(subscribers)
    }

    /// Delete a subscriber. Returns whether a row existed.
    pub async fn delete_subscriber(&self, chat_id: ChatId) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM subscribers WHERE chat_id = ?")
            .bind(chat_id)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }
}

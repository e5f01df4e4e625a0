//! Durable key-value slot for the last selected conversation.

use sqlx::SqlitePool;

use printline_protocol::SyncResult;

const SELECTED_KEY: &str = "selected_conversation";

/// Small persisted state table so a fresh engine instance reopens on the
/// conversation the user last had selected.
#[derive(Clone)]
pub struct SelectionStore {
    pool: SqlitePool,
}

impl SelectionStore {
    pub async fn open(pool: SqlitePool) -> SyncResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS engine_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    pub async fn load_selected(&self) -> SyncResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM engine_state WHERE key = ?")
                .bind(SELECTED_KEY)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn save_selected(&self, conversation_id: Option<&str>) -> SyncResult<()> {
        match conversation_id {
            Some(id) => {
                sqlx::query(
                    r#"
                    INSERT INTO engine_state (key, value) VALUES (?, ?)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value
                    "#,
                )
                .bind(SELECTED_KEY)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM engine_state WHERE key = ?")
                    .bind(SELECTED_KEY)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn selection_round_trips() {
        let store = SelectionStore::open(memory_pool().await).await.unwrap();
        assert_eq!(store.load_selected().await.unwrap(), None);

        store.save_selected(Some("conv-9")).await.unwrap();
        assert_eq!(store.load_selected().await.unwrap().as_deref(), Some("conv-9"));

        store.save_selected(Some("conv-10")).await.unwrap();
        assert_eq!(
            store.load_selected().await.unwrap().as_deref(),
            Some("conv-10")
        );

        store.save_selected(None).await.unwrap();
        assert_eq!(store.load_selected().await.unwrap(), None);
    }
}

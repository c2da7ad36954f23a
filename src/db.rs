//! SQLite-слой: пользователи бота и их привязка к клиентам панели.
//!
//! Панель ничего не знает о Telegram-чатах, поэтому связь
//! tg_user_id -> (email, uuid) клиента живёт здесь. Привязка появляется,
//! когда пользователь присылает свою ссылку, и дальше кнопка «Мой статус»
//! работает без повторной вставки ссылки.

use sqlx::FromRow;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, FromRow)]
pub struct BotUser {
    pub tg_user_id: i64,
    pub tg_username: Option<String>,
    pub tg_display_name: Option<String>,
    pub client_email: Option<String>,
    pub client_uuid: Option<String>,
    pub first_seen: i64,
    pub last_seen: i64,
}

#[derive(Debug, Clone)]
pub struct BotStats {
    pub total: i64,
    pub bound: i64,
    pub seen_today: i64,
}

pub struct Db {
    pool: SqlitePool,
}

fn current_unix_timestamp() -> Result<i64, anyhow::Error> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .map_err(|err| anyhow::anyhow!("Системное время меньше UNIX_EPOCH: {}", err))
}

const SELECT_USER: &str = "SELECT tg_user_id, tg_username, tg_display_name, client_email, client_uuid, first_seen, last_seen FROM bot_users";

impl Db {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Не удалось создать директорию для БД: {}", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts)
            .await
            .map_err(|e| anyhow::anyhow!("Не удалось подключиться к SQLite: {}", e))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, anyhow::Error> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePool::connect_with(opts).await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_users (
                tg_user_id INTEGER PRIMARY KEY,
                tg_username TEXT,
                tg_display_name TEXT,
                client_email TEXT,
                client_uuid TEXT,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bot_users_client_email ON bot_users(client_email);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция БД: {}", e))?;
        Ok(())
    }

    /// Регистрирует контакт с пользователем: создаёт запись или обновляет
    /// username/имя и last_seen.
    pub async fn touch_user(
        &self,
        tg_user_id: i64,
        tg_username: Option<&str>,
        tg_display_name: Option<&str>,
    ) -> Result<(), anyhow::Error> {
        let now = current_unix_timestamp()?;
        sqlx::query(
            "INSERT INTO bot_users (tg_user_id, tg_username, tg_display_name, first_seen, last_seen)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(tg_user_id) DO UPDATE SET
                 tg_username = excluded.tg_username,
                 tg_display_name = excluded.tg_display_name,
                 last_seen = excluded.last_seen",
        )
        .bind(tg_user_id)
        .bind(tg_username)
        .bind(tg_display_name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Запоминает привязку чата к клиенту панели.
    pub async fn bind_client(
        &self,
        tg_user_id: i64,
        client_email: Option<&str>,
        client_uuid: Option<&str>,
    ) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            "UPDATE bot_users SET client_email = ?, client_uuid = ? WHERE tg_user_id = ?",
        )
        .bind(client_email)
        .bind(client_uuid)
        .bind(tg_user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_user(&self, tg_user_id: i64) -> Result<Option<BotUser>, anyhow::Error> {
        let row = sqlx::query_as::<_, BotUser>(&format!("{} WHERE tg_user_id = ?", SELECT_USER))
            .bind(tg_user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Все известные чаты — адресаты рассылки.
    pub async fn list_chat_ids(&self) -> Result<Vec<i64>, anyhow::Error> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT tg_user_id FROM bot_users ORDER BY first_seen ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn stats(&self) -> Result<BotStats, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM bot_users")
            .fetch_one(&self.pool)
            .await?;
        let bound = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM bot_users WHERE client_email IS NOT NULL OR client_uuid IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        let seen_today = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM bot_users WHERE last_seen >= ?",
        )
        .bind(now - 86_400)
        .fetch_one(&self.pool)
        .await?;
        Ok(BotStats {
            total,
            bound,
            seen_today,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn touch_is_idempotent_upsert() {
        let db = Db::open_in_memory().await.unwrap();
        db.touch_user(100, Some("alice"), Some("Alice"))
            .await
            .unwrap();
        db.touch_user(100, Some("alice2"), None).await.unwrap();

        let user = db.get_user(100).await.unwrap().unwrap();
        assert_eq!(user.tg_username.as_deref(), Some("alice2"));
        assert_eq!(user.tg_display_name, None);

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.seen_today, 1);
    }

    #[tokio::test]
    async fn bind_requires_existing_user() {
        let db = Db::open_in_memory().await.unwrap();
        assert!(!db.bind_client(5, Some("user1"), None).await.unwrap());

        db.touch_user(5, None, None).await.unwrap();
        assert!(
            db.bind_client(5, Some("user1"), Some("uuid-1"))
                .await
                .unwrap()
        );

        let user = db.get_user(5).await.unwrap().unwrap();
        assert_eq!(user.client_email.as_deref(), Some("user1"));
        assert_eq!(user.client_uuid.as_deref(), Some("uuid-1"));
        assert_eq!(db.stats().await.unwrap().bound, 1);
    }

    #[tokio::test]
    async fn all_known_chats_are_broadcast_targets() {
        let db = Db::open_in_memory().await.unwrap();
        db.touch_user(3, None, None).await.unwrap();
        db.touch_user(1, None, None).await.unwrap();
        db.touch_user(2, None, None).await.unwrap();

        let ids = db.list_chat_ids().await.unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&1) && ids.contains(&2) && ids.contains(&3));
    }
}

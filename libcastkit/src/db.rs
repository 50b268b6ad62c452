//! SQLite history for castkit
//!
//! Holds the action log, the local schedule queue, hourly rate windows and the
//! set of feed items already posted.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashSet;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::types::{Action, ActionEntry, ActionRecord, ActionStatus, Network, PostRequest, QueuedPost};

/// An action with its per-network records
#[derive(Debug, Clone)]
pub struct ActionWithRecords {
    pub action: ActionEntry,
    pub records: Vec<ActionRecord>,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(db_path).to_string();
        if let Some(parent) = Path::new(&expanded).parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        let url = format!("sqlite://{}?mode=rwc", expanded.replace('\\', "/"));
        let pool = SqlitePool::connect(&url).await.map_err(DbError::SqlxError)?;
        Self::migrate(pool).await
    }

    /// Private in-memory database; a single connection keeps every query on the same DB
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(DbError::SqlxError)?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_action(&self, entry: &ActionEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO actions (id, action, content, target, created_at, scheduled_at, status, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(entry.action.as_str())
        .bind(&entry.content)
        .bind(&entry.target)
        .bind(entry.created_at)
        .bind(entry.scheduled_at)
        .bind(entry.status.as_str())
        .bind(&entry.metadata)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn update_action_status(&self, id: &str, status: ActionStatus) -> Result<()> {
        sqlx::query("UPDATE actions SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn get_action(&self, id: &str) -> Result<Option<ActionEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, action, content, target, created_at, scheduled_at, status, metadata
            FROM actions WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| action_from_row(&r)).transpose()
    }

    pub async fn create_action_record(&self, record: &ActionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO action_records
                (action_id, network, platform_id, url, completed_at, success, error_message, account_name)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.action_id)
        .bind(&record.network)
        .bind(&record.platform_id)
        .bind(&record.url)
        .bind(record.completed_at)
        .bind(record.success as i32)
        .bind(&record.error_message)
        .bind(&record.account_name)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn get_action_records(&self, action_id: &str) -> Result<Vec<ActionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, action_id, network, platform_id, url, completed_at, success,
                   error_message, account_name
            FROM action_records
            WHERE action_id = ?
            ORDER BY id
            "#,
        )
        .bind(action_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| ActionRecord {
                id: r.get("id"),
                action_id: r.get("action_id"),
                network: r.get("network"),
                platform_id: r.get("platform_id"),
                url: r.get("url"),
                completed_at: r.get("completed_at"),
                success: r.get::<i32, _>("success") != 0,
                error_message: r.get("error_message"),
                account_name: r.get("account_name"),
            })
            .collect())
    }

    /// Most recent actions first, optionally only those touching `network`
    pub async fn recent_actions(
        &self,
        network: Option<Network>,
        limit: usize,
    ) -> Result<Vec<ActionWithRecords>> {
        let ids: Vec<String> = match network {
            Some(network) => sqlx::query(
                r#"
                SELECT DISTINCT a.id, a.created_at FROM actions a
                JOIN action_records r ON r.action_id = a.id
                WHERE r.network = ?
                ORDER BY a.created_at DESC
                LIMIT ?
                "#,
            )
            .bind(network.as_str())
            .bind(limit as i64),
            None => sqlx::query("SELECT id FROM actions ORDER BY created_at DESC LIMIT ?")
                .bind(limit as i64),
        }
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?
        .iter()
        .map(|r| r.get("id"))
        .collect();

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(action) = self.get_action(&id).await? {
                let records = self.get_action_records(&id).await?;
                results.push(ActionWithRecords { action, records });
            }
        }
        Ok(results)
    }

    pub async fn enqueue(&self, queued: &QueuedPost) -> Result<()> {
        let request = serde_json::to_string(&queued.request)
            .map_err(|e| DbError::Corrupt(format!("serialize request: {}", e)))?;
        let networks = queued
            .networks
            .iter()
            .map(|n| n.as_str())
            .collect::<Vec<_>>()
            .join(",");

        sqlx::query(
            r#"
            INSERT INTO scheduled_queue (id, request, networks, due_at, attempts, account, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&queued.id)
        .bind(request)
        .bind(networks)
        .bind(queued.due_at)
        .bind(queued.attempts as i64)
        .bind(&queued.account)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Queue entries due at or before `now`, oldest first
    pub async fn due_posts(&self, now: i64) -> Result<Vec<QueuedPost>> {
        let rows = sqlx::query(
            r#"
            SELECT id, request, networks, due_at, attempts, account
            FROM scheduled_queue WHERE due_at <= ? ORDER BY due_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        rows.iter().map(queued_from_row).collect()
    }

    pub async fn list_queue(&self) -> Result<Vec<QueuedPost>> {
        let rows = sqlx::query(
            r#"
            SELECT id, request, networks, due_at, attempts, account
            FROM scheduled_queue ORDER BY due_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        rows.iter().map(queued_from_row).collect()
    }

    /// Returns false when no entry had that id
    pub async fn dequeue(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduled_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a failed entry to `due_at` and count the attempt
    pub async fn defer(&self, id: &str, due_at: i64) -> Result<()> {
        sqlx::query("UPDATE scheduled_queue SET due_at = ?, attempts = attempts + 1 WHERE id = ?")
            .bind(due_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Narrow a partly sent entry to the networks still pending and defer it
    pub async fn defer_networks(&self, id: &str, networks: &[Network], due_at: i64) -> Result<()> {
        let networks = networks.iter().map(|n| n.as_str()).collect::<Vec<_>>().join(",");
        sqlx::query(
            "UPDATE scheduled_queue SET networks = ?, due_at = ?, attempts = attempts + 1 WHERE id = ?",
        )
        .bind(networks)
        .bind(due_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Move an entry to `due_at` without counting an attempt
    pub async fn reschedule(&self, id: &str, due_at: i64) -> Result<()> {
        sqlx::query("UPDATE scheduled_queue SET due_at = ? WHERE id = ?")
            .bind(due_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn rate_window_count(&self, network: &str, window_start: i64) -> Result<u32> {
        let row = sqlx::query(
            "SELECT post_count FROM rate_windows WHERE network = ? AND window_start = ?",
        )
        .bind(network)
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(row.map(|r| r.get::<i64, _>("post_count") as u32).unwrap_or(0))
    }

    pub async fn increment_rate_window(&self, network: &str, window_start: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_windows (network, window_start, post_count)
            VALUES (?, ?, 1)
            ON CONFLICT(network, window_start)
            DO UPDATE SET post_count = post_count + 1
            "#,
        )
        .bind(network)
        .bind(window_start)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn delete_rate_windows_before(&self, window_start: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_windows WHERE window_start < ?")
            .bind(window_start)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected())
    }

    pub async fn seen_feed_items(&self, feed_url: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT item_id FROM feed_seen WHERE feed_url = ?")
            .bind(feed_url)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(rows.iter().map(|r| r.get("item_id")).collect())
    }

    pub async fn mark_feed_item_seen(&self, feed_url: &str, item_id: &str, posted_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feed_seen (feed_url, item_id, posted_at) VALUES (?, ?, ?)
            ON CONFLICT(feed_url, item_id) DO NOTHING
            "#,
        )
        .bind(feed_url)
        .bind(item_id)
        .bind(posted_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }
}

fn action_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<ActionEntry> {
    let action: String = r.get("action");
    let action: Action = action
        .parse()
        .map_err(|_| DbError::Corrupt(format!("unknown action '{}'", action)))?;
    Ok(ActionEntry {
        id: r.get("id"),
        action,
        content: r.get("content"),
        target: r.get("target"),
        created_at: r.get("created_at"),
        scheduled_at: r.get("scheduled_at"),
        status: ActionStatus::parse(&r.get::<String, _>("status")),
        metadata: r.get("metadata"),
    })
}

fn queued_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<QueuedPost> {
    let id: String = r.get("id");
    let request: PostRequest = serde_json::from_str(&r.get::<String, _>("request"))
        .map_err(|e| DbError::Corrupt(format!("queue entry {}: {}", id, e)))?;
    let networks = Network::parse_list(&r.get::<String, _>("networks"))
        .map_err(|e| DbError::Corrupt(format!("queue entry {}: {}", id, e)))?;
    Ok(QueuedPost {
        id,
        request,
        networks,
        due_at: r.get("due_at"),
        attempts: r.get::<i64, _>("attempts") as u32,
        account: r.get("account"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CastError;
    use tempfile::TempDir;

    fn record(action_id: &str, network: &str, success: bool) -> ActionRecord {
        ActionRecord {
            id: None,
            action_id: action_id.to_string(),
            network: network.to_string(),
            platform_id: success.then(|| "123".to_string()),
            url: None,
            completed_at: Some(chrono::Utc::now().timestamp()),
            success,
            error_message: (!success).then(|| "boom".to_string()),
            account_name: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn test_creates_file_and_parent_directories() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("history.db");
        Database::new(path.to_str().unwrap()).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_action_roundtrip_with_records() {
        let db = Database::in_memory().await.unwrap();
        let entry = ActionEntry::new(Action::Like, String::new(), Some("42".to_string()));
        db.create_action(&entry).await.unwrap();
        db.create_action_record(&record(&entry.id, "x", true)).await.unwrap();
        db.create_action_record(&record(&entry.id, "telegram", false)).await.unwrap();
        db.update_action_status(&entry.id, ActionStatus::Posted).await.unwrap();

        let stored = db.get_action(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.action, Action::Like);
        assert_eq!(stored.target.as_deref(), Some("42"));
        assert_eq!(stored.status, ActionStatus::Posted);

        let records = db.get_action_records(&entry.id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].success);
        assert_eq!(records[1].error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_missing_action_is_none() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.get_action("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_requires_existing_action() {
        let db = Database::in_memory().await.unwrap();
        let err = db
            .create_action_record(&record("ghost", "x", true))
            .await
            .unwrap_err();
        assert!(matches!(err, CastError::Database(DbError::SqlxError(_))));
    }

    #[tokio::test]
    async fn test_recent_actions_filters_by_network() {
        let db = Database::in_memory().await.unwrap();
        let mut first = ActionEntry::new(Action::Post, "one".into(), None);
        first.created_at = 100;
        let mut second = ActionEntry::new(Action::Post, "two".into(), None);
        second.created_at = 200;
        db.create_action(&first).await.unwrap();
        db.create_action(&second).await.unwrap();
        db.create_action_record(&record(&first.id, "x", true)).await.unwrap();
        db.create_action_record(&record(&second.id, "discord", true)).await.unwrap();

        let all = db.recent_actions(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].action.content, "two");

        let x_only = db.recent_actions(Some(Network::X), 10).await.unwrap();
        assert_eq!(x_only.len(), 1);
        assert_eq!(x_only[0].action.content, "one");
    }

    #[tokio::test]
    async fn test_queue_lifecycle() {
        let db = Database::in_memory().await.unwrap();
        let queued = QueuedPost {
            id: "q1".to_string(),
            request: PostRequest::text("later"),
            networks: vec![Network::X, Network::Telegram],
            due_at: 1_000,
            attempts: 0,
            account: None,
        };
        db.enqueue(&queued).await.unwrap();

        assert!(db.due_posts(999).await.unwrap().is_empty());
        let due = db.due_posts(1_000).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].networks, vec![Network::X, Network::Telegram]);
        assert_eq!(due[0].request.content, "later");

        db.defer("q1", 2_000).await.unwrap();
        let listed = db.list_queue().await.unwrap();
        assert_eq!(listed[0].attempts, 1);
        assert_eq!(listed[0].due_at, 2_000);

        db.reschedule("q1", 3_600).await.unwrap();
        let listed = db.list_queue().await.unwrap();
        assert_eq!(listed[0].attempts, 1);
        assert_eq!(listed[0].due_at, 3_600);

        db.defer_networks("q1", &[Network::Telegram], 4_000).await.unwrap();
        let listed = db.list_queue().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].networks, vec![Network::Telegram]);
        assert_eq!(listed[0].attempts, 2);
        assert_eq!(listed[0].due_at, 4_000);
        assert_eq!(listed[0].request.content, "later");

        assert!(db.dequeue("q1").await.unwrap());
        assert!(!db.dequeue("q1").await.unwrap());
    }

    #[tokio::test]
    async fn test_rate_windows() {
        let db = Database::in_memory().await.unwrap();
        assert_eq!(db.rate_window_count("x", 3600).await.unwrap(), 0);
        db.increment_rate_window("x", 3600).await.unwrap();
        db.increment_rate_window("x", 3600).await.unwrap();
        db.increment_rate_window("x", 7200).await.unwrap();
        assert_eq!(db.rate_window_count("x", 3600).await.unwrap(), 2);
        assert_eq!(db.delete_rate_windows_before(7200).await.unwrap(), 1);
        assert_eq!(db.rate_window_count("x", 3600).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_feed_seen_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let url = "https://example.com/feed.xml";
        db.mark_feed_item_seen(url, "a", 1).await.unwrap();
        db.mark_feed_item_seen(url, "a", 2).await.unwrap();
        db.mark_feed_item_seen("https://other/feed", "b", 1).await.unwrap();

        let seen = db.seen_feed_items(url).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen.contains("a"));
    }
}

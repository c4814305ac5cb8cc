//! Database operations for Fanpost

use chrono::DateTime;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::types::{Platform, Post, PostStatus, ReportRecord};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    /// Store a post snapshot
    ///
    /// Inserts the post or replaces the stored snapshot when the incoming
    /// revision is newer. Returns `false` when a newer or equal revision is
    /// already stored and nothing was written.
    pub async fn save_post(&self, post: &Post) -> Result<bool> {
        let snapshot = serde_json::to_string(post).map_err(DbError::Snapshot)?;

        let result = sqlx::query(
            r#"
            INSERT INTO posts (id, user_id, status, scheduled_at, created_at, revision, succeeded, snapshot)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                revision = excluded.revision,
                succeeded = excluded.succeeded,
                snapshot = excluded.snapshot
            WHERE excluded.revision > posts.revision
            "#,
        )
        .bind(&post.id)
        .bind(&post.user_id)
        .bind(post.status().as_str())
        .bind(post.scheduled_at.timestamp())
        .bind(post.created_at.timestamp())
        .bind(post.revision() as i64)
        .bind(post.succeeded_count() as i64)
        .bind(snapshot)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Get a post by ID
    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query("SELECT snapshot FROM posts WHERE id = ?")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.map(|r| decode_snapshot(&r.get::<String, _>("snapshot")))
            .transpose()
    }

    /// Posts that were pending or mid-dispatch when last stored, oldest due first
    pub async fn load_unfinished_posts(&self) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            r#"
            SELECT snapshot FROM posts
            WHERE status IN (?, ?)
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(PostStatus::Pending.as_str())
        .bind(PostStatus::Dispatching.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| decode_snapshot(&r.get::<String, _>("snapshot")))
            .collect()
    }

    /// Posts with more succeeded destinations than report records
    pub async fn load_unreported_posts(&self) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            r#"
            SELECT p.snapshot FROM posts p
            WHERE p.succeeded > (
                SELECT COUNT(*) FROM report_records r WHERE r.post_id = p.id
            )
            ORDER BY p.scheduled_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| decode_snapshot(&r.get::<String, _>("snapshot")))
            .collect()
    }

    /// Insert a report record unless one exists for `(post_id, platform)`
    ///
    /// Returns `true` if the record was created by this call.
    pub async fn record_report(&self, record: &ReportRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO report_records (post_id, platform, platform_post_id, reported_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(post_id, platform) DO NOTHING
            "#,
        )
        .bind(&record.post_id)
        .bind(record.platform.as_str())
        .bind(&record.platform_post_id)
        .bind(record.reported_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn has_report(&self, post_id: &str, platform: Platform) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM report_records WHERE post_id = ? AND platform = ?")
            .bind(post_id)
            .bind(platform.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.is_some())
    }

    /// All report records for a post
    pub async fn get_reports(&self, post_id: &str) -> Result<Vec<ReportRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT post_id, platform, platform_post_id, reported_at
            FROM report_records
            WHERE post_id = ?
            ORDER BY platform ASC
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut records = Vec::with_capacity(rows.len());
        for r in rows {
            let platform: String = r.get("platform");
            let Ok(platform) = platform.parse::<Platform>() else {
                tracing::warn!(post_id, %platform, "skipping report record for unknown platform");
                continue;
            };
            records.push(ReportRecord {
                post_id: r.get("post_id"),
                platform,
                platform_post_id: r.get("platform_post_id"),
                reported_at: DateTime::from_timestamp(r.get::<i64, _>("reported_at"), 0)
                    .unwrap_or_default(),
            });
        }

        Ok(records)
    }

    /// Close the pool, waiting for open connections to be returned
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode_snapshot(snapshot: &str) -> Result<Post> {
    let mut post: Post = serde_json::from_str(snapshot).map_err(DbError::Snapshot)?;
    post.refresh_status();
    Ok(post)
}

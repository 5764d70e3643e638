//! SQLite database operations
//!
//! All database access goes through this module.
//! Natural keys (`remote_id`s, follow pairs) carry UNIQUE constraints, and
//! every write that the inbox performs is an `INSERT OR IGNORE` whose
//! rows-affected count decides whether follow-up writes happen.

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::path::Path;
use std::str::FromStr;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

/// What an unfollow removed for a pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnfollowOutcome {
    pub edge_removed: bool,
    pub request_removed: bool,
}

impl UnfollowOutcome {
    pub fn removed_anything(&self) -> bool {
        self.edge_removed || self.request_removed
    }
}

async fn begin_immediate(pool: &Pool<Sqlite>) -> Result<PoolConnection<Sqlite>, AppError> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(conn)
}

async fn finish_immediate<T>(
    conn: &mut SqliteConnection,
    result: Result<T, AppError>,
) -> Result<T, AppError> {
    match result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(value)
        }
        Err(error) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(error)
        }
    }
}

async fn insert_notification_on(
    conn: &mut SqliteConnection,
    notification: &Notification,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO notifications (
            id, recipient_id, notification_type, related_actor_id, related_status_id, read, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&notification.id)
    .bind(&notification.recipient_id)
    .bind(&notification.notification_type)
    .bind(&notification.related_actor_id)
    .bind(&notification.related_status_id)
    .bind(notification.read)
    .bind(notification.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Insert an actor
    ///
    /// Fails if an actor with the same `remote_id` exists.
    pub async fn insert_actor(&self, actor: &Actor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO actors (
                id, remote_id, username, local, inbox, outbox, shared_inbox,
                manually_approves_followers, public_key_pem, private_key_pem,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.remote_id)
        .bind(&actor.username)
        .bind(actor.local)
        .bind(&actor.inbox)
        .bind(&actor.outbox)
        .bind(&actor.shared_inbox)
        .bind(actor.manually_approves_followers)
        .bind(&actor.public_key_pem)
        .bind(&actor.private_key_pem)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a remote actor unless one with the same `remote_id` exists.
    ///
    /// Concurrent first contacts collapse onto a single row.
    ///
    /// # Returns
    /// The stored actor (existing or newly inserted).
    pub async fn insert_actor_if_absent(&self, actor: &Actor) -> Result<Actor, AppError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO actors (
                id, remote_id, username, local, inbox, outbox, shared_inbox,
                manually_approves_followers, public_key_pem, private_key_pem,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.remote_id)
        .bind(&actor.username)
        .bind(actor.local)
        .bind(&actor.inbox)
        .bind(&actor.outbox)
        .bind(&actor.shared_inbox)
        .bind(actor.manually_approves_followers)
        .bind(&actor.public_key_pem)
        .bind(&actor.private_key_pem)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_actor_by_remote_id(&actor.remote_id)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn get_actor(&self, id: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    pub async fn get_actor_by_remote_id(&self, remote_id: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE remote_id = ?")
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Look up a local account by username
    pub async fn get_local_actor_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Actor>, AppError> {
        let actor =
            sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE local = 1 AND username = ?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;

        Ok(actor)
    }

    /// Public key stored for the actor owning `remote_id`, if any
    pub async fn get_actor_public_key(&self, remote_id: &str) -> Result<Option<String>, AppError> {
        let key = sqlx::query_scalar::<_, Option<String>>(
            "SELECT public_key_pem FROM actors WHERE remote_id = ?",
        )
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(key.flatten())
    }

    // =========================================================================
    // Follow relationships
    // =========================================================================

    /// Current relationship state for (subject, object)
    pub async fn get_relationship(
        &self,
        subject_id: &str,
        object_id: &str,
    ) -> Result<RelationshipState, AppError> {
        let followed = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM follows WHERE subject_id = ? AND object_id = ?",
        )
        .bind(subject_id)
        .bind(object_id)
        .fetch_one(&self.pool)
        .await?;
        if followed > 0 {
            return Ok(RelationshipState::Followed);
        }

        let requested = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM follow_requests WHERE subject_id = ? AND object_id = ?",
        )
        .bind(subject_id)
        .bind(object_id)
        .fetch_one(&self.pool)
        .await?;
        if requested > 0 {
            return Ok(RelationshipState::Requested);
        }

        Ok(RelationshipState::None)
    }

    /// Store a follow request and its notification atomically.
    ///
    /// # Returns
    /// `true` if the request was new, `false` if the pair already had one.
    pub async fn record_follow_request(
        &self,
        request: &FollowRequest,
        notification: &Notification,
    ) -> Result<bool, AppError> {
        let mut conn = begin_immediate(&self.pool).await?;

        let result: Result<bool, AppError> = async {
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO follow_requests (id, remote_id, subject_id, object_id, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&request.id)
            .bind(&request.remote_id)
            .bind(&request.subject_id)
            .bind(&request.object_id)
            .bind(request.created_at)
            .execute(&mut *conn)
            .await?;

            if inserted.rows_affected() == 0 {
                return Ok(false);
            }

            insert_notification_on(&mut conn, notification).await?;
            Ok(true)
        }
        .await;

        finish_immediate(&mut conn, result).await
    }

    /// Store a follow edge atomically with its notification.
    ///
    /// Any pending request for the same pair is cleared.
    ///
    /// # Returns
    /// `true` if the edge was new.
    pub async fn record_follow(
        &self,
        edge: &FollowEdge,
        notification: Option<&Notification>,
    ) -> Result<bool, AppError> {
        let mut conn = begin_immediate(&self.pool).await?;

        let result: Result<bool, AppError> = async {
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO follows (id, remote_id, subject_id, object_id, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&edge.id)
            .bind(&edge.remote_id)
            .bind(&edge.subject_id)
            .bind(&edge.object_id)
            .bind(edge.created_at)
            .execute(&mut *conn)
            .await?;

            sqlx::query("DELETE FROM follow_requests WHERE subject_id = ? AND object_id = ?")
                .bind(&edge.subject_id)
                .bind(&edge.object_id)
                .execute(&mut *conn)
                .await?;

            if inserted.rows_affected() == 0 {
                return Ok(false);
            }

            if let Some(notification) = notification {
                insert_notification_on(&mut conn, notification).await?;
            }
            Ok(true)
        }
        .await;

        finish_immediate(&mut conn, result).await
    }

    /// Find the pending request for a pair
    pub async fn get_follow_request(
        &self,
        subject_id: &str,
        object_id: &str,
    ) -> Result<Option<FollowRequest>, AppError> {
        let request = sqlx::query_as::<_, FollowRequest>(
            "SELECT * FROM follow_requests WHERE subject_id = ? AND object_id = ?",
        )
        .bind(subject_id)
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(request)
    }

    /// Find a pending request by its Follow activity URI
    ///
    /// Ids are not unique across pairs; the oldest request wins.
    pub async fn get_follow_request_by_remote_id(
        &self,
        remote_id: &str,
    ) -> Result<Option<FollowRequest>, AppError> {
        let request = sqlx::query_as::<_, FollowRequest>(
            "SELECT * FROM follow_requests WHERE remote_id = ? ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(request)
    }

    /// Pending requests addressed to an actor, oldest first
    pub async fn get_follow_requests_for(
        &self,
        object_id: &str,
    ) -> Result<Vec<FollowRequest>, AppError> {
        let requests = sqlx::query_as::<_, FollowRequest>(
            "SELECT * FROM follow_requests WHERE object_id = ? ORDER BY created_at ASC",
        )
        .bind(object_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(requests)
    }

    pub async fn count_follow_requests(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM follow_requests")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Turn a pending request into an edge.
    ///
    /// # Returns
    /// `false` when the request is already gone (replayed or stale Accept).
    pub async fn accept_follow_request(&self, request: &FollowRequest) -> Result<bool, AppError> {
        let mut conn = begin_immediate(&self.pool).await?;

        let result: Result<bool, AppError> = async {
            let deleted = sqlx::query("DELETE FROM follow_requests WHERE id = ?")
                .bind(&request.id)
                .execute(&mut *conn)
                .await?;

            if deleted.rows_affected() == 0 {
                return Ok(false);
            }

            sqlx::query(
                r#"
                INSERT OR IGNORE INTO follows (id, remote_id, subject_id, object_id, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(EntityId::new().0)
            .bind(&request.remote_id)
            .bind(&request.subject_id)
            .bind(&request.object_id)
            .bind(chrono::Utc::now())
            .execute(&mut *conn)
            .await?;

            Ok(true)
        }
        .await;

        finish_immediate(&mut conn, result).await
    }

    /// Drop a pending request without creating an edge.
    ///
    /// # Returns
    /// `true` if a request was removed.
    pub async fn reject_follow_request(&self, request_id: &str) -> Result<bool, AppError> {
        let deleted = sqlx::query("DELETE FROM follow_requests WHERE id = ?")
            .bind(request_id)
            .execute(&self.pool)
            .await?;

        Ok(deleted.rows_affected() > 0)
    }

    /// Remove the edge and any pending request for a pair.
    pub async fn remove_follow(
        &self,
        subject_id: &str,
        object_id: &str,
    ) -> Result<UnfollowOutcome, AppError> {
        let mut conn = begin_immediate(&self.pool).await?;

        let result: Result<UnfollowOutcome, AppError> = async {
            let edges = sqlx::query("DELETE FROM follows WHERE subject_id = ? AND object_id = ?")
                .bind(subject_id)
                .bind(object_id)
                .execute(&mut *conn)
                .await?;
            let requests =
                sqlx::query("DELETE FROM follow_requests WHERE subject_id = ? AND object_id = ?")
                    .bind(subject_id)
                    .bind(object_id)
                    .execute(&mut *conn)
                    .await?;

            Ok(UnfollowOutcome {
                edge_removed: edges.rows_affected() > 0,
                request_removed: requests.rows_affected() > 0,
            })
        }
        .await;

        finish_immediate(&mut conn, result).await
    }

    /// Find an edge by the Follow activity URI that created it
    pub async fn get_follow_by_remote_id(
        &self,
        remote_id: &str,
    ) -> Result<Option<FollowEdge>, AppError> {
        let edge = sqlx::query_as::<_, FollowEdge>("SELECT * FROM follows WHERE remote_id = ?")
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(edge)
    }

    /// Actors following `actor_id`, oldest edge first
    pub async fn get_followers(&self, actor_id: &str) -> Result<Vec<Actor>, AppError> {
        let actors = sqlx::query_as::<_, Actor>(
            r#"
            SELECT a.* FROM actors a
            JOIN follows f ON f.subject_id = a.id
            WHERE f.object_id = ?
            ORDER BY f.created_at ASC
            "#,
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(actors)
    }

    /// Actors that `actor_id` follows, oldest edge first
    pub async fn get_following(&self, actor_id: &str) -> Result<Vec<Actor>, AppError> {
        let actors = sqlx::query_as::<_, Actor>(
            r#"
            SELECT a.* FROM actors a
            JOIN follows f ON f.object_id = a.id
            WHERE f.subject_id = ?
            ORDER BY f.created_at ASC
            "#,
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(actors)
    }

    pub async fn count_follows(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM follows")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Statuses
    // =========================================================================

    pub async fn insert_status(&self, status: &Status) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO statuses (id, remote_id, actor_id, content, local, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&status.id)
        .bind(&status.remote_id)
        .bind(&status.actor_id)
        .bind(&status.content)
        .bind(status.local)
        .bind(status.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_status_by_remote_id(
        &self,
        remote_id: &str,
    ) -> Result<Option<Status>, AppError> {
        let status = sqlx::query_as::<_, Status>("SELECT * FROM statuses WHERE remote_id = ?")
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(status)
    }

    /// Delete a remote status owned by `actor_id`.
    ///
    /// Local statuses are never removed through federation.
    pub async fn delete_remote_status(
        &self,
        remote_id: &str,
        actor_id: &str,
    ) -> Result<bool, AppError> {
        let deleted =
            sqlx::query("DELETE FROM statuses WHERE remote_id = ? AND actor_id = ? AND local = 0")
                .bind(remote_id)
                .bind(actor_id)
                .execute(&self.pool)
                .await?;

        Ok(deleted.rows_affected() > 0)
    }

    // =========================================================================
    // Favorites
    // =========================================================================

    pub async fn favorite_exists(&self, remote_id: &str) -> Result<bool, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM favorites WHERE remote_id = ?")
                .bind(remote_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count > 0)
    }

    pub async fn get_favorite_by_remote_id(
        &self,
        remote_id: &str,
    ) -> Result<Option<Favorite>, AppError> {
        let favorite = sqlx::query_as::<_, Favorite>("SELECT * FROM favorites WHERE remote_id = ?")
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(favorite)
    }

    /// Favorites recorded for a status, oldest first
    pub async fn get_favorites_for_status(
        &self,
        status_id: &str,
    ) -> Result<Vec<Favorite>, AppError> {
        let favorites = sqlx::query_as::<_, Favorite>(
            "SELECT * FROM favorites WHERE status_id = ? ORDER BY created_at ASC",
        )
        .bind(status_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(favorites)
    }

    /// Store a favorite and its notification atomically.
    ///
    /// # Returns
    /// `true` if the favorite was new, `false` on redelivery.
    pub async fn record_favorite(
        &self,
        favorite: &Favorite,
        notification: Option<&Notification>,
    ) -> Result<bool, AppError> {
        let mut conn = begin_immediate(&self.pool).await?;

        let result: Result<bool, AppError> = async {
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO favorites (id, remote_id, status_id, actor_id, published_at, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&favorite.id)
            .bind(&favorite.remote_id)
            .bind(&favorite.status_id)
            .bind(&favorite.actor_id)
            .bind(favorite.published_at)
            .bind(favorite.created_at)
            .execute(&mut *conn)
            .await?;

            if inserted.rows_affected() == 0 {
                return Ok(false);
            }

            if let Some(notification) = notification {
                insert_notification_on(&mut conn, notification).await?;
            }
            Ok(true)
        }
        .await;

        finish_immediate(&mut conn, result).await
    }

    /// Remove a favorite created by `actor_id`
    pub async fn delete_favorite(&self, remote_id: &str, actor_id: &str) -> Result<bool, AppError> {
        let deleted = sqlx::query("DELETE FROM favorites WHERE remote_id = ? AND actor_id = ?")
            .bind(remote_id)
            .bind(actor_id)
            .execute(&self.pool)
            .await?;

        Ok(deleted.rows_affected() > 0)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Insert a standalone notification
    pub async fn insert_notification(&self, notification: &Notification) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_notification_on(&mut conn, notification).await
    }

    /// Notifications for a recipient, newest first
    pub async fn get_notifications(
        &self,
        recipient_id: &str,
        limit: usize,
    ) -> Result<Vec<Notification>, AppError> {
        let notifications = sqlx::query_as::<_, Notification>(
            r#"
            SELECT * FROM notifications
            WHERE recipient_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(recipient_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(notifications)
    }

    pub async fn count_notifications(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM notifications")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    pub async fn mark_notification_read(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE notifications SET read = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

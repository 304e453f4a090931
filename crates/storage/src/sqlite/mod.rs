use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use futures::future::BoxFuture;
use snafu::{ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::{SegmentId, SequenceId, UserId};
use super::types::{
    ElementKind, NewSegment, NewUser, SegmentRecord, SequenceRecord, UserRecord,
};
use super::{ElementVersionStore, SegmentStore, SequenceStore, UserStore};

const SEGMENT_COLUMNS: &str =
    "id, sequence_id, position, label, text_version, image_version, audio_version";
const SEQUENCE_COLUMNS: &str = "id, user_id, name, script, created_at";

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    /// Opens (creating if needed) the database and applies migrations.
    ///
    /// The pool holds a single long-lived connection: writes are serialized, and
    /// `:memory:` databases survive for the lifetime of the storage handle.
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let in_memory = database_url.contains(":memory:");
        let mut connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(5_000));
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url = %database_url, "sqlite storage opened");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn begin(&self, stage: &'static str) -> StorageResult<Transaction<'static, Sqlite>> {
        self.pool.begin().await.context(SqliteQuerySnafu { stage })
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: String,
    username_case: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct SequenceRow {
    id: String,
    user_id: String,
    name: String,
    script: Option<String>,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct SegmentRow {
    id: String,
    sequence_id: String,
    position: i64,
    label: Option<String>,
    text_version: Option<i64>,
    image_version: Option<i64>,
    audio_version: Option<i64>,
}

/// Version table and active-pointer column for one element kind.
#[derive(Debug, Clone, Copy)]
struct ElementTable {
    table: &'static str,
    active_column: &'static str,
}

fn element_table(kind: ElementKind) -> ElementTable {
    match kind {
        ElementKind::Text => ElementTable {
            table: "segment_text",
            active_column: "text_version",
        },
        ElementKind::Image => ElementTable {
            table: "segment_image",
            active_column: "image_version",
        },
        ElementKind::Audio => ElementTable {
            table: "segment_audio",
            active_column: "audio_version",
        },
    }
}

impl UserStore for SqliteStorage {
    fn add_user(&self, input: NewUser) -> BoxFuture<'_, StorageResult<UserRecord>> {
        async move {
            let username = input.username.trim().to_string();
            ensure!(
                !username.is_empty(),
                InvariantViolationSnafu {
                    stage: "user-add-validate",
                    details: "username must not be empty".to_string(),
                }
            );

            let user_id = UserId::new_v7();
            let now = unix_timestamp_seconds();
            sqlx::query(
                "INSERT INTO users (id, username, username_case, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(user_id.to_string())
            .bind(username.to_lowercase())
            .bind(username.clone())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|source| map_write_error(source, "user-add-insert", "user"))?;

            tracing::debug!(user_id = %user_id, "user added");
            Ok(UserRecord {
                id: user_id,
                username,
                created_at_unix_seconds: i64_to_u64(now, "user-add-created-at")?,
            })
        }
        .boxed()
    }

    fn user_id_for_username<'a>(
        &'a self,
        username: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<UserId>>> {
        async move {
            let row = sqlx::query_as::<_, UserRow>(
                "SELECT id, username_case, created_at FROM users WHERE username = ?",
            )
            .bind(username.trim().to_lowercase())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "user-id-for-username",
            })?;

            row.map(|row| UserId::parse(&row.id)).transpose()
        }
        .boxed()
    }

    fn username_for_id(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<Option<String>>> {
        async move {
            let row = sqlx::query_as::<_, UserRow>(
                "SELECT id, username_case, created_at FROM users WHERE id = ?",
            )
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "username-for-id",
            })?;

            Ok(row.map(|row| user_row_to_record(row)).transpose()?.map(|user| user.username))
        }
        .boxed()
    }

    fn rename_user<'a>(
        &'a self,
        user_id: UserId,
        new_username: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>> {
        async move {
            let username = new_username.trim();
            ensure!(
                !username.is_empty(),
                InvariantViolationSnafu {
                    stage: "user-rename-validate",
                    details: "username must not be empty".to_string(),
                }
            );

            let result = sqlx::query("UPDATE users SET username = ?, username_case = ? WHERE id = ?")
                .bind(username.to_lowercase())
                .bind(username)
                .bind(user_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(|source| map_write_error(source, "user-rename-apply", "user"))?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "user-rename-missing",
                    entity: "user",
                    id: user_id.to_string(),
                }
                .fail();
            }

            Ok(())
        }
        .boxed()
    }

    fn user_exists(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<bool>> {
        async move {
            row_exists(
                &self.pool,
                "SELECT 1 FROM users WHERE id = ? LIMIT 1",
                &[user_id.to_string()],
                "user-exists-query",
            )
            .await
        }
        .boxed()
    }

    fn username_exists<'a>(&'a self, username: &'a str) -> BoxFuture<'a, StorageResult<bool>> {
        async move {
            row_exists(
                &self.pool,
                "SELECT 1 FROM users WHERE username = ? LIMIT 1",
                &[username.trim().to_lowercase()],
                "username-exists-query",
            )
            .await
        }
        .boxed()
    }

    fn upsert_api_key<'a>(
        &'a self,
        user_id: UserId,
        key_kind: &'a str,
        key_value: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>> {
        async move {
            sqlx::query(
                "INSERT INTO api_keys (user_id, key_kind, key_value) VALUES (?, ?, ?) \
                 ON CONFLICT(user_id, key_kind) DO UPDATE SET key_value = excluded.key_value",
            )
            .bind(user_id.to_string())
            .bind(key_kind)
            .bind(key_value)
            .execute(&self.pool)
            .await
            .map_err(|source| map_write_error(source, "api-key-upsert", "api_key"))?;

            Ok(())
        }
        .boxed()
    }

    fn api_key<'a>(
        &'a self,
        user_id: UserId,
        key_kind: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<String>>> {
        async move {
            sqlx::query_scalar::<_, String>(
                "SELECT key_value FROM api_keys WHERE user_id = ? AND key_kind = ?",
            )
            .bind(user_id.to_string())
            .bind(key_kind)
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "api-key-query",
            })
        }
        .boxed()
    }

    fn add_subject<'a>(
        &'a self,
        user_id: UserId,
        subject: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>> {
        async move {
            let subject = subject.trim();
            ensure!(
                !subject.is_empty(),
                InvariantViolationSnafu {
                    stage: "subject-add-validate",
                    details: "subject must not be empty".to_string(),
                }
            );

            sqlx::query("INSERT INTO subjects (user_id, subject, created_at) VALUES (?, ?, ?)")
                .bind(user_id.to_string())
                .bind(subject)
                .bind(unix_timestamp_seconds())
                .execute(&self.pool)
                .await
                .map_err(|source| map_write_error(source, "subject-add-insert", "subject"))?;

            tracing::debug!(user_id = %user_id, subject, "subject recorded");
            Ok(())
        }
        .boxed()
    }

    fn subjects(&self, user_id: UserId) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        async move {
            sqlx::query_scalar::<_, String>(
                "SELECT subject FROM subjects WHERE user_id = ? ORDER BY id",
            )
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "subject-list-query",
            })
        }
        .boxed()
    }
}

impl SequenceStore for SqliteStorage {
    fn add_sequence<'a>(
        &'a self,
        owner_id: UserId,
        name: &'a str,
    ) -> BoxFuture<'a, StorageResult<SequenceRecord>> {
        async move {
            let owner_known = row_exists(
                &self.pool,
                "SELECT 1 FROM users WHERE id = ? LIMIT 1",
                &[owner_id.to_string()],
                "sequence-add-owner-exists",
            )
            .await?;
            if !owner_known {
                return NotFoundSnafu {
                    stage: "sequence-add-owner-missing",
                    entity: "user",
                    id: owner_id.to_string(),
                }
                .fail();
            }

            let sequence_id = SequenceId::new_v7();
            let now = unix_timestamp_seconds();
            sqlx::query(
                "INSERT INTO sequences (id, user_id, name, script, created_at) VALUES (?, ?, ?, NULL, ?)",
            )
            .bind(sequence_id.to_string())
            .bind(owner_id.to_string())
            .bind(name)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|source| map_write_error(source, "sequence-add-insert", "sequence"))?;

            tracing::debug!(sequence_id = %sequence_id, owner_id = %owner_id, "sequence added");
            Ok(SequenceRecord {
                id: sequence_id,
                owner_id,
                name: name.to_string(),
                script: None,
                created_at_unix_seconds: i64_to_u64(now, "sequence-add-created-at")?,
            })
        }
        .boxed()
    }

    fn store_sequence<'a>(
        &'a self,
        owner_id: UserId,
        name: &'a str,
        script: Option<String>,
        segments: Vec<NewSegment>,
    ) -> BoxFuture<'a, StorageResult<SequenceRecord>> {
        async move {
            let mut tx = self.begin("sequence-store-begin").await?;

            let owner_known =
                sqlx::query_scalar::<_, i64>("SELECT 1 FROM users WHERE id = ? LIMIT 1")
                    .bind(owner_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "sequence-store-owner-exists",
                    })?
                    .is_some();
            if !owner_known {
                return NotFoundSnafu {
                    stage: "sequence-store-owner-missing",
                    entity: "user",
                    id: owner_id.to_string(),
                }
                .fail();
            }

            let sequence_id = SequenceId::new_v7();
            let sequence_key = sequence_id.to_string();
            let now = unix_timestamp_seconds();
            sqlx::query(
                "INSERT INTO sequences (id, user_id, name, script, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&sequence_key)
            .bind(owner_id.to_string())
            .bind(name)
            .bind(script.as_deref())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|source| map_write_error(source, "sequence-store-insert", "sequence"))?;

            insert_segments(&mut tx, &sequence_key, &segments).await?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "sequence-store-commit",
            })?;

            tracing::debug!(
                sequence_id = %sequence_id,
                owner_id = %owner_id,
                segments = segments.len(),
                "sequence stored"
            );
            Ok(SequenceRecord {
                id: sequence_id,
                owner_id,
                name: name.to_string(),
                script,
                created_at_unix_seconds: i64_to_u64(now, "sequence-store-created-at")?,
            })
        }
        .boxed()
    }

    fn replace_segments(
        &self,
        sequence_id: SequenceId,
        script: Option<String>,
        segments: Vec<NewSegment>,
    ) -> BoxFuture<'_, StorageResult<()>> {
        async move {
            let sequence_key = sequence_id.to_string();
            let mut tx = self.begin("segment-replace-begin").await?;

            let result = sqlx::query("UPDATE sequences SET script = ? WHERE id = ?")
                .bind(script)
                .bind(&sequence_key)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "segment-replace-script",
                })?;
            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "segment-replace-sequence-missing",
                    entity: "sequence",
                    id: sequence_key,
                }
                .fail();
            }

            sqlx::query("DELETE FROM segments WHERE sequence_id = ?")
                .bind(&sequence_key)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "segment-replace-clear",
                })?;

            insert_segments(&mut tx, &sequence_key, &segments).await?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "segment-replace-commit",
            })?;

            tracing::debug!(sequence_id = %sequence_id, segments = segments.len(), "segments replaced");
            Ok(())
        }
        .boxed()
    }

    fn get_sequence(
        &self,
        sequence_id: SequenceId,
    ) -> BoxFuture<'_, StorageResult<Option<SequenceRecord>>> {
        async move {
            let row = sqlx::query_as::<_, SequenceRow>(&format!(
                "SELECT {SEQUENCE_COLUMNS} FROM sequences WHERE id = ?"
            ))
            .bind(sequence_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sequence-get-query",
            })?;

            row.map(sequence_row_to_record).transpose()
        }
        .boxed()
    }

    fn list_sequences(&self, owner_id: UserId) -> BoxFuture<'_, StorageResult<Vec<SequenceRecord>>> {
        async move {
            let rows = sqlx::query_as::<_, SequenceRow>(&format!(
                "SELECT {SEQUENCE_COLUMNS} FROM sequences WHERE user_id = ? ORDER BY created_at, id"
            ))
            .bind(owner_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "sequence-list-query",
            })?;

            rows.into_iter().map(sequence_row_to_record).collect()
        }
        .boxed()
    }

    fn rename_sequence<'a>(
        &'a self,
        sequence_id: SequenceId,
        new_name: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>> {
        async move {
            let result = sqlx::query("UPDATE sequences SET name = ? WHERE id = ?")
                .bind(new_name)
                .bind(sequence_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(|source| map_write_error(source, "sequence-rename-apply", "sequence"))?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "sequence-rename-missing",
                    entity: "sequence",
                    id: sequence_id.to_string(),
                }
                .fail();
            }

            Ok(())
        }
        .boxed()
    }

    fn set_sequence_script(
        &self,
        sequence_id: SequenceId,
        script: Option<String>,
    ) -> BoxFuture<'_, StorageResult<()>> {
        async move {
            let result = sqlx::query("UPDATE sequences SET script = ? WHERE id = ?")
                .bind(script)
                .bind(sequence_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "sequence-script-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "sequence-script-missing",
                    entity: "sequence",
                    id: sequence_id.to_string(),
                }
                .fail();
            }

            Ok(())
        }
        .boxed()
    }

    fn sequence_exists(&self, sequence_id: SequenceId) -> BoxFuture<'_, StorageResult<bool>> {
        async move {
            row_exists(
                &self.pool,
                "SELECT 1 FROM sequences WHERE id = ? LIMIT 1",
                &[sequence_id.to_string()],
                "sequence-exists-query",
            )
            .await
        }
        .boxed()
    }

    fn sequence_name_exists<'a>(
        &'a self,
        owner_id: Option<UserId>,
        name: &'a str,
    ) -> BoxFuture<'a, StorageResult<bool>> {
        async move {
            match owner_id {
                Some(owner_id) => {
                    row_exists(
                        &self.pool,
                        "SELECT 1 FROM sequences WHERE name = ? AND user_id = ? LIMIT 1",
                        &[name.to_string(), owner_id.to_string()],
                        "sequence-name-exists-owner-query",
                    )
                    .await
                }
                None => {
                    row_exists(
                        &self.pool,
                        "SELECT 1 FROM sequences WHERE name = ? LIMIT 1",
                        &[name.to_string()],
                        "sequence-name-exists-query",
                    )
                    .await
                }
            }
        }
        .boxed()
    }
}

impl SegmentStore for SqliteStorage {
    fn add_segment(
        &self,
        sequence_id: SequenceId,
        position: Option<u32>,
    ) -> BoxFuture<'_, StorageResult<SegmentRecord>> {
        async move {
            let mut tx = self.begin("segment-add-begin").await?;
            let sequence_key = sequence_id.to_string();

            let sequence_known =
                sqlx::query_scalar::<_, i64>("SELECT 1 FROM sequences WHERE id = ? LIMIT 1")
                    .bind(&sequence_key)
                    .fetch_optional(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "segment-add-sequence-exists",
                    })?
                    .is_some();
            if !sequence_known {
                return NotFoundSnafu {
                    stage: "segment-add-sequence-missing",
                    entity: "sequence",
                    id: sequence_key,
                }
                .fail();
            }

            let count = count_segments_in_tx(&mut tx, &sequence_key, "segment-add-count").await?;
            let target = position.map_or(count, |position| i64::from(position).min(count));
            if target < count {
                shift_positions(&mut tx, &sequence_key, target, 1, "segment-add-shift").await?;
            }

            let segment_id = SegmentId::new_v7();
            sqlx::query(
                "INSERT INTO segments (id, sequence_id, position, text_version, image_version, audio_version) \
                 VALUES (?, ?, ?, NULL, NULL, NULL)",
            )
            .bind(segment_id.to_string())
            .bind(&sequence_key)
            .bind(target)
            .execute(&mut *tx)
            .await
            .map_err(|source| map_write_error(source, "segment-add-insert", "segment"))?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "segment-add-commit",
            })?;

            tracing::debug!(segment_id = %segment_id, sequence_id = %sequence_id, position = target, "segment added");
            Ok(SegmentRecord {
                id: segment_id,
                sequence_id,
                position: i64_to_u32(target, "segment-add-position")?,
                label: None,
                text_version: None,
                image_version: None,
                audio_version: None,
            })
        }
        .boxed()
    }

    fn get_segment(
        &self,
        segment_id: SegmentId,
    ) -> BoxFuture<'_, StorageResult<Option<SegmentRecord>>> {
        async move {
            let row = sqlx::query_as::<_, SegmentRow>(&format!(
                "SELECT {SEGMENT_COLUMNS} FROM segments WHERE id = ?"
            ))
            .bind(segment_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "segment-get-query",
            })?;

            row.map(segment_row_to_record).transpose()
        }
        .boxed()
    }

    fn get_segments(
        &self,
        sequence_id: SequenceId,
    ) -> BoxFuture<'_, StorageResult<Vec<SegmentRecord>>> {
        async move {
            let rows = sqlx::query_as::<_, SegmentRow>(&format!(
                "SELECT {SEGMENT_COLUMNS} FROM segments WHERE sequence_id = ? ORDER BY position"
            ))
            .bind(sequence_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "segment-list-query",
            })?;

            rows.into_iter().map(segment_row_to_record).collect()
        }
        .boxed()
    }

    fn segment_at_position(
        &self,
        sequence_id: SequenceId,
        position: u32,
    ) -> BoxFuture<'_, StorageResult<Option<SegmentRecord>>> {
        async move {
            let row = sqlx::query_as::<_, SegmentRow>(&format!(
                "SELECT {SEGMENT_COLUMNS} FROM segments WHERE sequence_id = ? AND position = ?"
            ))
            .bind(sequence_id.to_string())
            .bind(i64::from(position))
            .fetch_optional(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "segment-at-position-query",
            })?;

            row.map(segment_row_to_record).transpose()
        }
        .boxed()
    }

    fn segment_count(&self, sequence_id: SequenceId) -> BoxFuture<'_, StorageResult<u32>> {
        async move {
            let count =
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM segments WHERE sequence_id = ?")
                    .bind(sequence_id.to_string())
                    .fetch_one(&self.pool)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "segment-count-query",
                    })?;

            i64_to_u32(count, "segment-count-value")
        }
        .boxed()
    }

    fn move_segment(
        &self,
        segment_id: SegmentId,
        new_position: u32,
    ) -> BoxFuture<'_, StorageResult<bool>> {
        async move {
            let mut tx = self.begin("segment-move-begin").await?;
            let segment_key = segment_id.to_string();

            let Some(sequence_key) =
                sqlx::query_scalar::<_, String>("SELECT sequence_id FROM segments WHERE id = ?")
                    .bind(&segment_key)
                    .fetch_optional(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "segment-move-load",
                    })?
            else {
                return Ok(false);
            };

            let mut ordered_ids = sqlx::query_scalar::<_, String>(
                "SELECT id FROM segments WHERE sequence_id = ? ORDER BY position",
            )
            .bind(&sequence_key)
            .fetch_all(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "segment-move-order",
            })?;

            let Some(old_index) = ordered_ids.iter().position(|id| *id == segment_key) else {
                return InvariantViolationSnafu {
                    stage: "segment-move-locate",
                    details: format!("segment '{segment_key}' vanished from its sequence"),
                }
                .fail();
            };

            let last_index = ordered_ids.len() - 1;
            let target = (new_position as usize).min(last_index);
            if target != old_index {
                let moved = ordered_ids.remove(old_index);
                ordered_ids.insert(target, moved);
                rewrite_positions(&mut tx, &sequence_key, &ordered_ids, "segment-move-rewrite")
                    .await?;
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "segment-move-commit",
            })?;

            tracing::debug!(segment_id = %segment_id, from = old_index, to = target, "segment moved");
            Ok(true)
        }
        .boxed()
    }

    fn remove_segment(&self, segment_id: SegmentId) -> BoxFuture<'_, StorageResult<bool>> {
        async move {
            let mut tx = self.begin("segment-remove-begin").await?;
            let segment_key = segment_id.to_string();

            let Some((sequence_key, position)) = sqlx::query_as::<_, (String, i64)>(
                "SELECT sequence_id, position FROM segments WHERE id = ?",
            )
            .bind(&segment_key)
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "segment-remove-load",
            })?
            else {
                return Ok(false);
            };

            sqlx::query("DELETE FROM segments WHERE id = ?")
                .bind(&segment_key)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "segment-remove-delete",
                })?;

            shift_positions(&mut tx, &sequence_key, position + 1, -1, "segment-remove-shift")
                .await?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "segment-remove-commit",
            })?;

            tracing::debug!(segment_id = %segment_id, position, "segment removed");
            Ok(true)
        }
        .boxed()
    }

    fn set_segment_label<'a>(
        &'a self,
        segment_id: SegmentId,
        label: &'a str,
    ) -> BoxFuture<'a, StorageResult<()>> {
        async move {
            let result = sqlx::query("UPDATE segments SET label = ? WHERE id = ?")
                .bind(label)
                .bind(segment_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "segment-label-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "segment-label-missing",
                    entity: "segment",
                    id: segment_id.to_string(),
                }
                .fail();
            }

            Ok(())
        }
        .boxed()
    }

    fn clear_segments(&self, sequence_id: SequenceId) -> BoxFuture<'_, StorageResult<u64>> {
        async move {
            let result = sqlx::query("DELETE FROM segments WHERE sequence_id = ?")
                .bind(sequence_id.to_string())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "segment-clear",
                })?;

            Ok(result.rows_affected())
        }
        .boxed()
    }

    fn segment_exists(&self, segment_id: SegmentId) -> BoxFuture<'_, StorageResult<bool>> {
        async move {
            row_exists(
                &self.pool,
                "SELECT 1 FROM segments WHERE id = ? LIMIT 1",
                &[segment_id.to_string()],
                "segment-exists-query",
            )
            .await
        }
        .boxed()
    }

    fn position_exists(
        &self,
        sequence_id: SequenceId,
        position: u32,
    ) -> BoxFuture<'_, StorageResult<bool>> {
        async move {
            row_exists(
                &self.pool,
                "SELECT 1 FROM segments WHERE sequence_id = ? AND position = ? LIMIT 1",
                &[sequence_id.to_string(), position.to_string()],
                "position-exists-query",
            )
            .await
        }
        .boxed()
    }
}

impl ElementVersionStore for SqliteStorage {
    fn add_element_version(
        &self,
        segment_id: SegmentId,
        kind: ElementKind,
        content: String,
        activate: bool,
    ) -> BoxFuture<'_, StorageResult<u32>> {
        async move {
            let table = element_table(kind);
            let segment_key = segment_id.to_string();
            let mut tx = self.begin("element-add-begin").await?;

            let segment_known =
                sqlx::query_scalar::<_, i64>("SELECT 1 FROM segments WHERE id = ? LIMIT 1")
                    .bind(&segment_key)
                    .fetch_optional(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "element-add-segment-exists",
                    })?
                    .is_some();
            if !segment_known {
                return NotFoundSnafu {
                    stage: "element-add-segment-missing",
                    entity: "segment",
                    id: segment_key,
                }
                .fail();
            }

            let next_version = sqlx::query_scalar::<_, i64>(&format!(
                "SELECT COALESCE(MAX(version) + 1, 0) FROM {} WHERE segment_id = ?",
                table.table
            ))
            .bind(&segment_key)
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "element-add-next-version",
            })?;

            sqlx::query(&format!(
                "INSERT INTO {} (segment_id, version, content) VALUES (?, ?, ?)",
                table.table
            ))
            .bind(&segment_key)
            .bind(next_version)
            .bind(content)
            .execute(&mut *tx)
            .await
            .map_err(|source| map_write_error(source, "element-add-insert", table.table))?;

            if activate {
                sqlx::query(&format!(
                    "UPDATE segments SET {} = ? WHERE id = ?",
                    table.active_column
                ))
                .bind(next_version)
                .bind(&segment_key)
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "element-add-activate",
                })?;
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "element-add-commit",
            })?;

            i64_to_u32(next_version, "element-add-version")
        }
        .boxed()
    }

    fn set_active_version(
        &self,
        segment_id: SegmentId,
        kind: ElementKind,
        version: u32,
    ) -> BoxFuture<'_, StorageResult<bool>> {
        async move {
            let table = element_table(kind);
            let segment_key = segment_id.to_string();
            let mut tx = self.begin("element-activate-begin").await?;

            let version_known = sqlx::query_scalar::<_, i64>(&format!(
                "SELECT 1 FROM {} WHERE segment_id = ? AND version = ? LIMIT 1",
                table.table
            ))
            .bind(&segment_key)
            .bind(i64::from(version))
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "element-activate-version-exists",
            })?
            .is_some();
            if !version_known {
                return Ok(false);
            }

            let result = sqlx::query(&format!(
                "UPDATE segments SET {} = ? WHERE id = ?",
                table.active_column
            ))
            .bind(i64::from(version))
            .bind(&segment_key)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "element-activate-apply",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "element-activate-commit",
            })?;

            Ok(result.rows_affected() > 0)
        }
        .boxed()
    }

    fn element_versions(
        &self,
        segment_id: SegmentId,
        kind: ElementKind,
    ) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        async move {
            sqlx::query_scalar::<_, String>(&format!(
                "SELECT content FROM {} WHERE segment_id = ? ORDER BY version",
                element_table(kind).table
            ))
            .bind(segment_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "element-versions-query",
            })
        }
        .boxed()
    }

    fn element_content(
        &self,
        segment_id: SegmentId,
        kind: ElementKind,
        version: Option<u32>,
    ) -> BoxFuture<'_, StorageResult<Option<String>>> {
        async move {
            let table = element_table(kind);
            let query = match version {
                Some(version) => sqlx::query_scalar::<_, String>(&format!(
                    "SELECT content FROM {} WHERE segment_id = ? AND version = ?",
                    table.table
                ))
                .bind(segment_id.to_string())
                .bind(i64::from(version))
                .fetch_optional(&self.pool)
                .await,
                None => sqlx::query_scalar::<_, String>(&format!(
                    "SELECT element.content FROM {} AS element \
                     INNER JOIN segments ON element.segment_id = segments.id \
                     WHERE segments.id = ? AND element.version = segments.{}",
                    table.table, table.active_column
                ))
                .bind(segment_id.to_string())
                .fetch_optional(&self.pool)
                .await,
            };

            query.context(SqliteQuerySnafu {
                stage: "element-content-query",
            })
        }
        .boxed()
    }

    fn element_version_count(
        &self,
        segment_id: SegmentId,
        kind: ElementKind,
    ) -> BoxFuture<'_, StorageResult<u32>> {
        async move {
            let count = sqlx::query_scalar::<_, i64>(&format!(
                "SELECT COUNT(*) FROM {} WHERE segment_id = ?",
                element_table(kind).table
            ))
            .bind(segment_id.to_string())
            .fetch_one(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "element-count-query",
            })?;

            i64_to_u32(count, "element-count-value")
        }
        .boxed()
    }

    fn element_version_exists(
        &self,
        segment_id: SegmentId,
        kind: ElementKind,
        version: u32,
    ) -> BoxFuture<'_, StorageResult<bool>> {
        async move {
            let sql = format!(
                "SELECT 1 FROM {} WHERE segment_id = ? AND version = ? LIMIT 1",
                element_table(kind).table
            );
            row_exists(
                &self.pool,
                &sql,
                &[segment_id.to_string(), version.to_string()],
                "element-version-exists-query",
            )
            .await
        }
        .boxed()
    }
}

fn user_row_to_record(row: UserRow) -> StorageResult<UserRecord> {
    Ok(UserRecord {
        id: UserId::parse(&row.id)?,
        username: row.username_case,
        created_at_unix_seconds: i64_to_u64(row.created_at, "user-row-created-at")?,
    })
}

fn sequence_row_to_record(row: SequenceRow) -> StorageResult<SequenceRecord> {
    Ok(SequenceRecord {
        id: SequenceId::parse(&row.id)?,
        owner_id: UserId::parse(&row.user_id)?,
        name: row.name,
        script: row.script,
        created_at_unix_seconds: i64_to_u64(row.created_at, "sequence-row-created-at")?,
    })
}

fn segment_row_to_record(row: SegmentRow) -> StorageResult<SegmentRecord> {
    Ok(SegmentRecord {
        id: SegmentId::parse(&row.id)?,
        sequence_id: SequenceId::parse(&row.sequence_id)?,
        position: i64_to_u32(row.position, "segment-row-position")?,
        label: row.label,
        text_version: row
            .text_version
            .map(|value| i64_to_u32(value, "segment-row-text-version"))
            .transpose()?,
        image_version: row
            .image_version
            .map(|value| i64_to_u32(value, "segment-row-image-version"))
            .transpose()?,
        audio_version: row
            .audio_version
            .map(|value| i64_to_u32(value, "segment-row-audio-version"))
            .transpose()?,
    })
}

async fn row_exists(
    pool: &SqlitePool,
    sql: &str,
    binds: &[String],
    stage: &'static str,
) -> StorageResult<bool> {
    let mut query = sqlx::query_scalar::<_, i64>(sql);
    for bind in binds {
        query = query.bind(bind.as_str());
    }

    let existing = query
        .fetch_optional(pool)
        .await
        .context(SqliteQuerySnafu { stage })?;
    Ok(existing.is_some())
}

async fn count_segments_in_tx(
    tx: &mut Transaction<'static, Sqlite>,
    sequence_key: &str,
    stage: &'static str,
) -> StorageResult<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM segments WHERE sequence_id = ?")
        .bind(sequence_key)
        .fetch_one(&mut **tx)
        .await
        .context(SqliteQuerySnafu { stage })
}

/// Adds `delta` to every position `>= from` in one sequence.
///
/// The unique `(sequence_id, position)` index is checked row by row, so rows are parked
/// on distinct negative positions first and then flipped back to their final value.
async fn shift_positions(
    tx: &mut Transaction<'static, Sqlite>,
    sequence_key: &str,
    from: i64,
    delta: i64,
    stage: &'static str,
) -> StorageResult<()> {
    sqlx::query(
        "UPDATE segments SET position = -1 - (position + ?) WHERE sequence_id = ? AND position >= ?",
    )
    .bind(delta)
    .bind(sequence_key)
    .bind(from)
    .execute(&mut **tx)
    .await
    .context(SqliteQuerySnafu { stage })?;

    sqlx::query("UPDATE segments SET position = -1 - position WHERE sequence_id = ? AND position < 0")
        .bind(sequence_key)
        .execute(&mut **tx)
        .await
        .context(SqliteQuerySnafu { stage })?;

    Ok(())
}

/// Assigns position `i` to `ordered_ids[i]` for every segment of the sequence.
async fn rewrite_positions(
    tx: &mut Transaction<'static, Sqlite>,
    sequence_key: &str,
    ordered_ids: &[String],
    stage: &'static str,
) -> StorageResult<()> {
    sqlx::query("UPDATE segments SET position = -1 - position WHERE sequence_id = ?")
        .bind(sequence_key)
        .execute(&mut **tx)
        .await
        .context(SqliteQuerySnafu { stage })?;

    for (index, segment_key) in ordered_ids.iter().enumerate() {
        sqlx::query("UPDATE segments SET position = ? WHERE id = ?")
            .bind(index as i64)
            .bind(segment_key)
            .execute(&mut **tx)
            .await
            .context(SqliteQuerySnafu { stage })?;
    }

    Ok(())
}

/// Writes `segments` at positions `0..len` with their versions and active pointers.
async fn insert_segments(
    tx: &mut Transaction<'static, Sqlite>,
    sequence_key: &str,
    segments: &[NewSegment],
) -> StorageResult<()> {
    for (position, segment) in segments.iter().enumerate() {
        let segment_key = SegmentId::new_v7().to_string();
        let label = Some(segment.label.as_str()).filter(|label| !label.is_empty());
        sqlx::query(
            "INSERT INTO segments (id, sequence_id, position, label, text_version, image_version, audio_version) \
             VALUES (?, ?, ?, ?, NULL, NULL, NULL)",
        )
        .bind(&segment_key)
        .bind(sequence_key)
        .bind(position as i64)
        .bind(label)
        .execute(&mut **tx)
        .await
        .map_err(|source| map_write_error(source, "segment-batch-insert", "segment"))?;

        for kind in ElementKind::ALL {
            let table = element_table(kind);
            let history = segment.element(kind);
            for (version, content) in history.versions.iter().enumerate() {
                sqlx::query(&format!(
                    "INSERT INTO {} (segment_id, version, content) VALUES (?, ?, ?)",
                    table.table
                ))
                .bind(&segment_key)
                .bind(version as i64)
                .bind(content.as_str())
                .execute(&mut **tx)
                .await
                .map_err(|source| map_write_error(source, "segment-batch-version", table.table))?;
            }

            let Some(active) = history.active else {
                continue;
            };
            ensure!(
                (active as usize) < history.versions.len(),
                InvariantViolationSnafu {
                    stage: "segment-batch-active",
                    details: format!(
                        "{kind} version {active} of the segment at position {position} does not exist"
                    ),
                }
            );
            sqlx::query(&format!(
                "UPDATE segments SET {} = ? WHERE id = ?",
                table.active_column
            ))
            .bind(i64::from(active))
            .bind(&segment_key)
            .execute(&mut **tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "segment-batch-activate",
            })?;
        }
    }

    Ok(())
}

fn map_write_error(source: sqlx::Error, stage: &'static str, entity: &'static str) -> StorageError {
    let constraint_message = source
        .as_database_error()
        .filter(|error| error.is_unique_violation() || error.is_foreign_key_violation())
        .map(|error| error.message().to_string());

    match constraint_message {
        Some(details) => StorageError::Conflict {
            stage,
            entity,
            details,
        },
        None => StorageError::SqliteQuery { stage, source },
    }
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_secs() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn i64_to_u32(value: i64, stage: &'static str) -> StorageResult<u32> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("sqlite integer '{value}' cannot map to u32"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ElementHistory;

    async fn open_memory() -> SqliteStorage {
        SqliteStorage::open(":memory:")
            .await
            .expect("in-memory storage")
    }

    async fn seed_sequence(storage: &SqliteStorage) -> SequenceRecord {
        let owner = storage
            .add_user(NewUser {
                username: "Ada".to_string(),
            })
            .await
            .expect("user");
        storage
            .add_sequence(owner.id, "lettuce")
            .await
            .expect("sequence")
    }

    async fn ordered_ids(storage: &SqliteStorage, sequence_id: SequenceId) -> Vec<SegmentId> {
        let segments = storage.get_segments(sequence_id).await.expect("segments");
        let positions = segments
            .iter()
            .map(|segment| segment.position)
            .collect::<Vec<_>>();
        assert_eq!(positions, (0..segments.len() as u32).collect::<Vec<_>>());
        segments.into_iter().map(|segment| segment.id).collect()
    }

    #[tokio::test]
    async fn add_segment_appends_inserts_and_clamps() {
        let storage = open_memory().await;
        let sequence = seed_sequence(&storage).await;

        let first = storage.add_segment(sequence.id, None).await.expect("first");
        let second = storage.add_segment(sequence.id, None).await.expect("second");
        let front = storage
            .add_segment(sequence.id, Some(0))
            .await
            .expect("front");
        let far = storage
            .add_segment(sequence.id, Some(99))
            .await
            .expect("far");

        assert_eq!(front.position, 0);
        assert_eq!(far.position, 3);
        storage
            .set_segment_label(front.id, "lettuce_7")
            .await
            .expect("label");
        let labelled = storage
            .segment_at_position(sequence.id, 0)
            .await
            .expect("query")
            .expect("segment");
        assert_eq!(labelled.label.as_deref(), Some("lettuce_7"));
        assert_eq!(
            ordered_ids(&storage, sequence.id).await,
            vec![front.id, first.id, second.id, far.id]
        );
    }

    #[tokio::test]
    async fn move_segment_keeps_positions_dense() {
        let storage = open_memory().await;
        let sequence = seed_sequence(&storage).await;
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(storage.add_segment(sequence.id, None).await.expect("segment").id);
        }

        assert!(storage.move_segment(ids[3], 1).await.expect("move back"));
        assert_eq!(
            ordered_ids(&storage, sequence.id).await,
            vec![ids[0], ids[3], ids[1], ids[2], ids[4]]
        );

        assert!(storage.move_segment(ids[0], 4).await.expect("move forward"));
        assert_eq!(
            ordered_ids(&storage, sequence.id).await,
            vec![ids[3], ids[1], ids[2], ids[4], ids[0]]
        );
    }

    #[tokio::test]
    async fn move_segment_edges() {
        let storage = open_memory().await;
        let sequence = seed_sequence(&storage).await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(storage.add_segment(sequence.id, None).await.expect("segment").id);
        }

        assert!(storage.move_segment(ids[1], 1).await.expect("same position"));
        assert_eq!(ordered_ids(&storage, sequence.id).await, ids);

        assert!(storage.move_segment(ids[0], 50).await.expect("beyond end"));
        assert_eq!(
            ordered_ids(&storage, sequence.id).await,
            vec![ids[1], ids[2], ids[0]]
        );

        assert!(
            !storage
                .move_segment(SegmentId::new_v7(), 0)
                .await
                .expect("unknown segment")
        );
    }

    #[tokio::test]
    async fn remove_segment_closes_gap_and_drops_versions() {
        let storage = open_memory().await;
        let sequence = seed_sequence(&storage).await;
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(storage.add_segment(sequence.id, None).await.expect("segment").id);
        }
        storage
            .add_element_version(ids[1], ElementKind::Text, "gone".to_string(), true)
            .await
            .expect("version");

        assert!(storage.remove_segment(ids[1]).await.expect("remove"));
        assert_eq!(
            ordered_ids(&storage, sequence.id).await,
            vec![ids[0], ids[2], ids[3]]
        );
        assert!(!storage.segment_exists(ids[1]).await.expect("exists"));
        assert_eq!(
            storage
                .element_version_count(ids[1], ElementKind::Text)
                .await
                .expect("count"),
            0
        );
        assert!(!storage.remove_segment(ids[1]).await.expect("second remove"));
    }

    #[tokio::test]
    async fn element_versions_track_active_pointer() {
        let storage = open_memory().await;
        let sequence = seed_sequence(&storage).await;
        let segment = storage.add_segment(sequence.id, None).await.expect("segment");

        let first = storage
            .add_element_version(segment.id, ElementKind::Image, "a.png".to_string(), true)
            .await
            .expect("first");
        let second = storage
            .add_element_version(segment.id, ElementKind::Image, "b.png".to_string(), false)
            .await
            .expect("second");
        assert_eq!((first, second), (0, 1));

        let record = storage
            .get_segment(segment.id)
            .await
            .expect("query")
            .expect("segment");
        assert_eq!(record.image_version, Some(0));
        assert_eq!(record.text_version, None);
        assert_eq!(
            storage
                .element_content(segment.id, ElementKind::Image, None)
                .await
                .expect("active"),
            Some("a.png".to_string())
        );

        assert!(
            storage
                .set_active_version(segment.id, ElementKind::Image, 1)
                .await
                .expect("switch")
        );
        assert!(
            !storage
                .set_active_version(segment.id, ElementKind::Image, 7)
                .await
                .expect("missing version")
        );
        assert_eq!(
            storage
                .element_content(segment.id, ElementKind::Image, None)
                .await
                .expect("active"),
            Some("b.png".to_string())
        );
        assert_eq!(
            storage
                .element_versions(segment.id, ElementKind::Image)
                .await
                .expect("versions"),
            vec!["a.png".to_string(), "b.png".to_string()]
        );
        assert!(
            storage
                .element_version_exists(segment.id, ElementKind::Image, 1)
                .await
                .expect("exists")
        );
        assert_eq!(
            storage
                .element_content(segment.id, ElementKind::Audio, None)
                .await
                .expect("no audio"),
            None
        );
    }

    #[tokio::test]
    async fn duplicate_sequence_name_is_a_conflict() {
        let storage = open_memory().await;
        let sequence = seed_sequence(&storage).await;

        let error = storage
            .add_sequence(sequence.owner_id, "LETTUCE")
            .await
            .expect_err("duplicate");
        assert!(error.is_integrity_violation());
        assert!(
            storage
                .sequence_name_exists(Some(sequence.owner_id), "Lettuce")
                .await
                .expect("exists")
        );

        let missing_owner = storage
            .add_sequence(UserId::new_v7(), "orphan")
            .await
            .expect_err("unknown owner");
        assert!(matches!(
            missing_owner,
            StorageError::NotFound { entity: "user", .. }
        ));
    }

    #[tokio::test]
    async fn usernames_are_case_insensitive_and_keys_upsert() {
        let storage = open_memory().await;
        let user = storage
            .add_user(NewUser {
                username: "Grace".to_string(),
            })
            .await
            .expect("user");

        assert_eq!(
            storage.user_id_for_username("GRACE").await.expect("lookup"),
            Some(user.id)
        );
        assert_eq!(
            storage.username_for_id(user.id).await.expect("name"),
            Some("Grace".to_string())
        );
        let duplicate = storage
            .add_user(NewUser {
                username: "grace".to_string(),
            })
            .await
            .expect_err("duplicate");
        assert!(duplicate.is_integrity_violation());

        storage
            .upsert_api_key(user.id, "openai", "first")
            .await
            .expect("insert key");
        storage
            .upsert_api_key(user.id, "openai", "second")
            .await
            .expect("replace key");
        assert_eq!(
            storage.api_key(user.id, "openai").await.expect("key"),
            Some("second".to_string())
        );
        assert_eq!(
            storage.api_key(user.id, "elevenlabs").await.expect("key"),
            None
        );
    }

    fn history(versions: &[&str], active: Option<u32>) -> ElementHistory {
        ElementHistory {
            versions: versions.iter().map(|content| content.to_string()).collect(),
            active,
        }
    }

    fn batch_segment(label: &str, text: &str) -> NewSegment {
        NewSegment {
            label: label.to_string(),
            text: history(&[text], Some(0)),
            image: history(&[format!("{label}_0.png").as_str()], Some(0)),
            audio: ElementHistory::default(),
        }
    }

    async fn seed_owner(storage: &SqliteStorage) -> UserId {
        storage
            .add_user(NewUser {
                username: "Ada".to_string(),
            })
            .await
            .expect("user")
            .id
    }

    async fn stored_texts(storage: &SqliteStorage, sequence_id: SequenceId) -> Vec<String> {
        let mut texts = Vec::new();
        for segment in storage.get_segments(sequence_id).await.expect("segments") {
            let text = storage
                .element_content(segment.id, ElementKind::Text, None)
                .await
                .expect("text")
                .expect("active text");
            texts.push(text);
        }
        texts
    }

    #[tokio::test]
    async fn store_sequence_writes_segments_versions_and_pointers() {
        let storage = open_memory().await;
        let owner = seed_owner(&storage).await;
        let mut second = batch_segment("lettuce_1", "It is green.");
        second.text = history(&["It is green.", "It is very green."], Some(0));

        let record = storage
            .store_sequence(
                owner,
                "lettuce",
                Some("Crunchy.\nIt is green.\n".to_string()),
                vec![batch_segment("lettuce_0", "Crunchy."), second],
            )
            .await
            .expect("store");

        let segments = storage.get_segments(record.id).await.expect("segments");
        let labels = segments
            .iter()
            .map(|segment| segment.label.clone())
            .collect::<Vec<_>>();
        assert_eq!(
            labels,
            vec![Some("lettuce_0".to_string()), Some("lettuce_1".to_string())]
        );
        assert_eq!(segments[1].text_version, Some(0));
        assert_eq!(segments[1].audio_version, None);
        assert_eq!(
            storage
                .element_versions(segments[1].id, ElementKind::Text)
                .await
                .expect("versions"),
            vec!["It is green.".to_string(), "It is very green.".to_string()]
        );
        let stored = storage
            .get_sequence(record.id)
            .await
            .expect("query")
            .expect("sequence");
        assert_eq!(stored.script.as_deref(), Some("Crunchy.\nIt is green.\n"));
    }

    #[tokio::test]
    async fn failed_batch_leaves_nothing_behind() {
        let storage = open_memory().await;
        let owner = seed_owner(&storage).await;
        let mut broken = batch_segment("lettuce_1", "It is green.");
        broken.image.active = Some(3);

        let error = storage
            .store_sequence(
                owner,
                "lettuce",
                None,
                vec![batch_segment("lettuce_0", "Crunchy."), broken],
            )
            .await
            .expect_err("dangling active pointer");

        assert!(matches!(error, StorageError::InvariantViolation { .. }));
        assert!(
            !storage
                .sequence_name_exists(Some(owner), "lettuce")
                .await
                .expect("exists")
        );
        assert!(storage.list_sequences(owner).await.expect("list").is_empty());

        let retried = storage
            .store_sequence(
                owner,
                "lettuce",
                None,
                vec![batch_segment("lettuce_0", "Crunchy.")],
            )
            .await
            .expect("retry");
        assert_eq!(stored_texts(&storage, retried.id).await, vec!["Crunchy."]);
    }

    #[tokio::test]
    async fn replace_segments_rewrites_order_atomically() {
        let storage = open_memory().await;
        let owner = seed_owner(&storage).await;
        let record = storage
            .store_sequence(
                owner,
                "lettuce",
                None,
                vec![
                    batch_segment("lettuce_0", "a"),
                    batch_segment("lettuce_1", "b"),
                    batch_segment("lettuce_2", "c"),
                ],
            )
            .await
            .expect("store");

        storage
            .replace_segments(
                record.id,
                Some("c\na\nb\n".to_string()),
                vec![
                    batch_segment("lettuce_2", "c"),
                    batch_segment("lettuce_0", "a"),
                    batch_segment("lettuce_1", "b"),
                ],
            )
            .await
            .expect("replace");
        assert_eq!(stored_texts(&storage, record.id).await, vec!["c", "a", "b"]);
        ordered_ids(&storage, record.id).await;

        let mut broken = batch_segment("lettuce_0", "a");
        broken.text.active = Some(9);
        let error = storage
            .replace_segments(record.id, None, vec![batch_segment("lettuce_3", "d"), broken])
            .await
            .expect_err("dangling active pointer");
        assert!(matches!(error, StorageError::InvariantViolation { .. }));
        assert_eq!(stored_texts(&storage, record.id).await, vec!["c", "a", "b"]);
        let stored = storage
            .get_sequence(record.id)
            .await
            .expect("query")
            .expect("sequence");
        assert_eq!(stored.script.as_deref(), Some("c\na\nb\n"));

        let missing = storage
            .replace_segments(SequenceId::new_v7(), None, Vec::new())
            .await
            .expect_err("unknown sequence");
        assert!(matches!(missing, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn subjects_are_listed_oldest_first() {
        let storage = open_memory().await;
        let owner = seed_owner(&storage).await;

        storage.add_subject(owner, " Lettuce ").await.expect("first");
        storage.add_subject(owner, "Bees").await.expect("second");
        let blank = storage.add_subject(owner, "  ").await.expect_err("blank");

        assert!(matches!(blank, StorageError::InvariantViolation { .. }));
        assert_eq!(
            storage.subjects(owner).await.expect("subjects"),
            vec!["Lettuce".to_string(), "Bees".to_string()]
        );
        assert!(
            storage
                .subjects(UserId::new_v7())
                .await
                .expect("subjects")
                .is_empty()
        );
    }
}

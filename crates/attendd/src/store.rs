//! Enrolled users and their reference embeddings, in SQLite.
//!
//! Each user keeps the aligned face crop it was enrolled with (PNG), so the deep
//! model can be retrained and new deep embeddings computed without asking for
//! the photo again. Vectors are stored as little-endian `f32` blobs.

use attend_core::{Embedding, Reference, Variant};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_rusqlite::Connection;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("cannot create data directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
#[error("vector blob of {0} bytes is not a whole number of f32 values")]
pub struct BlobLengthError(usize);

/// Open a connection with the pragmas every component relies on.
pub async fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let conn = Connection::open(path).await?;
    conn.call(|conn| {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(())
    })
    .await?;
    Ok(conn)
}

/// RFC 3339 UTC with microseconds: fixed width, so text order is time order.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>, BlobLengthError> {
    if bytes.len() % 4 != 0 {
        return Err(BlobLengthError(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn blob_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Vec<f32>> {
    let bytes: Vec<u8> = row.get(idx)?;
    decode_vector(&bytes).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Blob, Box::new(e))
    })
}

/// Version column value: deep embeddings carry the artifact version, classical ones ''.
fn version_key(version: Option<&str>) -> String {
    version.unwrap_or_default().to_string()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: String,
    pub name: String,
    pub registered_at: String,
    pub updated_at: String,
}

/// A user's stored enrolment crop.
#[derive(Debug, Clone)]
pub struct StoredFace {
    pub user_id: String,
    pub crop_png: Vec<u8>,
}

/// Everything written for one registration.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub user_id: String,
    pub name: String,
    pub crop_png: Vec<u8>,
    pub embeddings: Vec<Embedding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Replaced,
    /// The user exists and replacement was not allowed; nothing was written.
    Rejected,
}

/// Registry of enrolled users.
#[derive(Clone)]
pub struct FaceStore {
    conn: Connection,
}

impl FaceStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path).await?;
        conn.call(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    user_id    TEXT PRIMARY KEY NOT NULL,
                    name       TEXT NOT NULL,
                    face_crop  BLOB NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS embeddings (
                    user_id       TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    variant       TEXT NOT NULL,
                    model_version TEXT NOT NULL,
                    vector        BLOB NOT NULL,
                    PRIMARY KEY (user_id, variant, model_version)
                );",
            )?;
            Ok(())
        })
        .await?;
        tracing::info!(path = %path.display(), "user store opened");
        Ok(Self { conn })
    }

    /// Insert or overwrite a user and replace all of its embeddings, in one transaction.
    pub async fn upsert_user(
        &self,
        enrollment: Enrollment,
        allow_replace: bool,
    ) -> Result<UpsertOutcome, StoreError> {
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists = tx
                    .query_row(
                        "SELECT 1 FROM users WHERE user_id = ?1",
                        params![enrollment.user_id],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if exists && !allow_replace {
                    return Ok(UpsertOutcome::Rejected);
                }

                let now = now_timestamp();
                tx.execute(
                    "INSERT INTO users (user_id, name, face_crop, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(user_id) DO UPDATE SET
                        name = excluded.name,
                        face_crop = excluded.face_crop,
                        updated_at = excluded.updated_at",
                    params![enrollment.user_id, enrollment.name, enrollment.crop_png, now],
                )?;
                tx.execute(
                    "DELETE FROM embeddings WHERE user_id = ?1",
                    params![enrollment.user_id],
                )?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO embeddings (user_id, variant, model_version, vector)
                         VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for embedding in &enrollment.embeddings {
                        stmt.execute(params![
                            enrollment.user_id,
                            embedding.variant.as_str(),
                            version_key(embedding.model_version.as_deref()),
                            encode_vector(&embedding.values),
                        ])?;
                    }
                }
                tx.commit()?;

                Ok(if exists {
                    UpsertOutcome::Replaced
                } else {
                    UpsertOutcome::Created
                })
            })
            .await?;
        Ok(outcome)
    }

    /// All users in enrolment order.
    pub async fn list_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        let users = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id, name, created_at, updated_at FROM users ORDER BY rowid",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(UserRecord {
                        user_id: row.get(0)?,
                        name: row.get(1)?,
                        registered_at: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(users)
    }

    pub async fn count_users(&self) -> Result<usize, StoreError> {
        let count = self
            .conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
                Ok(n as usize)
            })
            .await?;
        Ok(count)
    }

    /// Reference embeddings of one variant and model version, in enrolment order.
    pub async fn gallery(
        &self,
        variant: Variant,
        model_version: Option<&str>,
    ) -> Result<Vec<Reference>, StoreError> {
        let version = model_version.map(str::to_string);
        let gallery = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT u.user_id, u.name, e.vector
                     FROM embeddings e JOIN users u ON u.user_id = e.user_id
                     WHERE e.variant = ?1 AND e.model_version = ?2
                     ORDER BY u.rowid",
                )?;
                let rows = stmt.query_map(
                    params![variant.as_str(), version_key(version.as_deref())],
                    |row| {
                        let values = blob_column(row, 2)?;
                        Ok(Reference {
                            user_id: row.get(0)?,
                            name: row.get(1)?,
                            embedding: Embedding {
                                values,
                                variant,
                                model_version: version.clone(),
                            },
                        })
                    },
                )?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(gallery)
    }

    /// Every user's enrolment crop, in enrolment order.
    pub async fn training_set(&self) -> Result<Vec<StoredFace>, StoreError> {
        let faces = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT user_id, face_crop FROM users ORDER BY rowid")?;
                let rows = stmt.query_map([], |row| {
                    Ok(StoredFace {
                        user_id: row.get(0)?,
                        crop_png: row.get(1)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(faces)
    }

    /// Users without an embedding of the given variant and version.
    pub async fn users_missing_embedding(
        &self,
        variant: Variant,
        model_version: Option<&str>,
    ) -> Result<Vec<StoredFace>, StoreError> {
        let version = version_key(model_version);
        let faces = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT u.user_id, u.face_crop FROM users u
                     WHERE NOT EXISTS (
                        SELECT 1 FROM embeddings e
                        WHERE e.user_id = u.user_id AND e.variant = ?1 AND e.model_version = ?2
                     )
                     ORDER BY u.rowid",
                )?;
                let rows = stmt.query_map(params![variant.as_str(), version], |row| {
                    Ok(StoredFace {
                        user_id: row.get(0)?,
                        crop_png: row.get(1)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(faces)
    }

    /// Add or replace embeddings for existing users. Ids that are no longer
    /// enrolled are skipped. Returns the number written.
    pub async fn insert_embeddings(&self, embeddings: Vec<(String, Embedding)>) -> Result<usize, StoreError> {
        let written = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut written = 0usize;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR REPLACE INTO embeddings (user_id, variant, model_version, vector)
                         SELECT ?1, ?2, ?3, ?4 WHERE EXISTS (SELECT 1 FROM users WHERE user_id = ?1)",
                    )?;
                    for (user_id, embedding) in &embeddings {
                        written += stmt.execute(params![
                            user_id,
                            embedding.variant.as_str(),
                            version_key(embedding.model_version.as_deref()),
                            encode_vector(&embedding.values),
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(written)
            })
            .await?;
        Ok(written)
    }

    /// Delete deep embeddings whose model version is not in `keep`.
    pub async fn prune_deep_embeddings(&self, keep: Vec<String>) -> Result<usize, StoreError> {
        let removed = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT DISTINCT model_version FROM embeddings WHERE variant = ?1")?;
                let versions = stmt
                    .query_map(params![Variant::Deep.as_str()], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut removed = 0usize;
                for version in versions.iter().filter(|v| !keep.contains(v)) {
                    removed += conn.execute(
                        "DELETE FROM embeddings WHERE variant = ?1 AND model_version = ?2",
                        params![Variant::Deep.as_str(), version],
                    )?;
                }
                Ok(removed)
            })
            .await?;
        if removed > 0 {
            tracing::debug!(removed, "pruned stale deep embeddings");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, FaceStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FaceStore::open(&dir.path().join("attend.db")).await.unwrap();
        (dir, store)
    }

    fn enrollment(user_id: &str, name: &str, embeddings: Vec<Embedding>) -> Enrollment {
        Enrollment {
            user_id: user_id.into(),
            name: name.into(),
            crop_png: vec![1, 2, 3],
            embeddings,
        }
    }

    #[test]
    fn test_vector_blob_roundtrip() {
        let values = vec![0.5, -1.25, 3.0e-7];
        assert_eq!(decode_vector(&encode_vector(&values)).unwrap(), values);
        assert!(decode_vector(&[0, 1, 2]).is_err());
    }

    #[test]
    fn test_timestamp_fixed_width() {
        let ts = now_timestamp();
        assert_eq!(ts.len(), "2024-01-01T00:00:00.000000Z".len());
        assert!(ts.ends_with('Z'));
    }

    #[tokio::test]
    async fn test_upsert_and_list() {
        let (_dir, store) = store().await;
        let created = store
            .upsert_user(enrollment("u1", "Alice", vec![Embedding::classical(vec![1.0, 0.0])]), true)
            .await
            .unwrap();
        assert_eq!(created, UpsertOutcome::Created);
        store
            .upsert_user(enrollment("u2", "Bob", vec![Embedding::classical(vec![0.0, 1.0])]), true)
            .await
            .unwrap();

        let users = store.list_users().await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].user_id, "u1");
        assert_eq!(users[1].name, "Bob");
        assert_eq!(store.count_users().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reregistration_replaces_embeddings_and_keeps_order() {
        let (_dir, store) = store().await;
        store
            .upsert_user(
                enrollment(
                    "u1",
                    "Alice",
                    vec![Embedding::classical(vec![1.0, 0.0]), Embedding::deep(vec![1.0], "v1")],
                ),
                true,
            )
            .await
            .unwrap();
        store
            .upsert_user(enrollment("u2", "Bob", vec![Embedding::classical(vec![0.0, 1.0])]), true)
            .await
            .unwrap();

        let outcome = store
            .upsert_user(enrollment("u1", "Alicia", vec![Embedding::classical(vec![0.6, 0.8])]), true)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Replaced);

        let gallery = store.gallery(Variant::Classical, None).await.unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery[0].user_id, "u1");
        assert_eq!(gallery[0].name, "Alicia");
        assert_eq!(gallery[0].embedding.values, vec![0.6, 0.8]);
        assert!(store.gallery(Variant::Deep, Some("v1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_when_replacement_disallowed() {
        let (_dir, store) = store().await;
        store
            .upsert_user(enrollment("u1", "Alice", vec![Embedding::classical(vec![1.0])]), false)
            .await
            .unwrap();
        let outcome = store
            .upsert_user(enrollment("u1", "Mallory", vec![Embedding::classical(vec![0.0])]), false)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Rejected);
        assert_eq!(store.list_users().await.unwrap()[0].name, "Alice");
    }

    #[tokio::test]
    async fn test_gallery_filters_variant_and_version() {
        let (_dir, store) = store().await;
        store
            .upsert_user(
                enrollment(
                    "u1",
                    "Alice",
                    vec![Embedding::classical(vec![1.0, 0.0]), Embedding::deep(vec![0.0, 1.0], "v1")],
                ),
                true,
            )
            .await
            .unwrap();

        let deep = store.gallery(Variant::Deep, Some("v1")).await.unwrap();
        assert_eq!(deep.len(), 1);
        assert_eq!(deep[0].embedding.model_version.as_deref(), Some("v1"));
        assert!(store.gallery(Variant::Deep, Some("v2")).await.unwrap().is_empty());
        assert_eq!(store.gallery(Variant::Classical, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_embeddings_and_backfill() {
        let (_dir, store) = store().await;
        for id in ["u1", "u2"] {
            store
                .upsert_user(enrollment(id, id, vec![Embedding::classical(vec![1.0])]), true)
                .await
                .unwrap();
        }
        let missing = store.users_missing_embedding(Variant::Deep, Some("v1")).await.unwrap();
        assert_eq!(missing.len(), 2);
        assert_eq!(missing[0].crop_png, vec![1, 2, 3]);

        let written = store
            .insert_embeddings(vec![
                ("u1".into(), Embedding::deep(vec![0.1], "v1")),
                ("ghost".into(), Embedding::deep(vec![0.2], "v1")),
            ])
            .await
            .unwrap();
        assert_eq!(written, 1);

        let missing = store.users_missing_embedding(Variant::Deep, Some("v1")).await.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].user_id, "u2");
    }

    #[tokio::test]
    async fn test_prune_keeps_listed_versions() {
        let (_dir, store) = store().await;
        store
            .upsert_user(
                enrollment(
                    "u1",
                    "Alice",
                    vec![
                        Embedding::classical(vec![1.0]),
                        Embedding::deep(vec![0.1], "v1"),
                        Embedding::deep(vec![0.2], "v2"),
                        Embedding::deep(vec![0.3], "v3"),
                    ],
                ),
                true,
            )
            .await
            .unwrap();

        let removed = store
            .prune_deep_embeddings(vec!["v2".into(), "v3".into()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.gallery(Variant::Deep, Some("v1")).await.unwrap().is_empty());
        assert_eq!(store.gallery(Variant::Deep, Some("v3")).await.unwrap().len(), 1);
        assert_eq!(store.gallery(Variant::Classical, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_training_set_in_enrolment_order() {
        let (_dir, store) = store().await;
        for id in ["b", "a", "c"] {
            store
                .upsert_user(enrollment(id, id, vec![Embedding::classical(vec![1.0])]), true)
                .await
                .unwrap();
        }
        let ids: Vec<String> = store
            .training_set()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.user_id)
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }
}

//! SQLite-backed technique index using the sqlite-vec extension.
//!
//! Two tables: `techniques` holds the displayable fields, keyed by technique
//! id, and `technique_embeddings` holds the vector as a raw little-endian
//! f32 blob. Similarity queries join them and sort by
//! `vec_distance_cosine`, which sqlite-vec evaluates directly on the blob.
//! The store owns its embedding provider and embeds the technique's
//! `"{name}. {description}"` text on insert and the raw query text on read.

use std::mem::transmute;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Arc;
use std::sync::Once;

use tokio_rusqlite::{Connection, ffi};

use super::{HitMetadata, IndexHit, VectorIndex};
use crate::embeddings::EmbeddingProvider;
use crate::types::{PipelineError, TaxonomyEntry};

pub struct SqliteTechniqueIndex {
    conn: Connection,
    provider: Arc<dyn EmbeddingProvider>,
}

impl SqliteTechniqueIndex {
    /// Open (or create) the index at `path`. Registers the sqlite-vec
    /// extension process-wide on first use and verifies it loaded by probing
    /// `vec_version()`.
    pub async fn open(
        path: impl AsRef<Path>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, PipelineError> {
        register_sqlite_vec()?;
        let conn = Connection::open(path)
            .await
            .map_err(|err| PipelineError::Index(err.to_string()))?;

        conn.call(|conn| {
            let result = conn.query_row("select vec_version()", [], |row| row.get::<_, String>(0));
            match result {
                Ok(_) => Ok(()),
                Err(err) => Err(tokio_rusqlite::Error::Error(err)),
            }
        })
        .await
        .map_err(|err| PipelineError::Index(format!("sqlite-vec probe failed: {err}")))?;

        let index = Self { conn, provider };
        index.create_schema().await?;
        Ok(index)
    }

    async fn create_schema(&self) -> Result<(), PipelineError> {
        self.conn
            .call(|conn| -> Result<(), tokio_rusqlite::Error> {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS techniques (
                         id TEXT PRIMARY KEY,
                         name TEXT NOT NULL,
                         tactics TEXT NOT NULL,
                         description TEXT NOT NULL
                     );
                     CREATE TABLE IF NOT EXISTS technique_embeddings (
                         id TEXT PRIMARY KEY,
                         embedding BLOB NOT NULL
                     );",
                )
                .map_err(tokio_rusqlite::Error::Error)?;
                Ok(())
            })
            .await
            .map_err(|err| PipelineError::Index(err.to_string()))
    }
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn register_sqlite_vec() -> Result<(), PipelineError> {
    use std::sync::Mutex;

    static INIT: Once = Once::new();
    static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

    INIT.call_once(|| {
        let result = unsafe {
            type SqliteExtensionInit = unsafe extern "C" fn(
                *mut ffi::sqlite3,
                *mut *mut c_char,
                *const ffi::sqlite3_api_routines,
            ) -> i32;

            let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
            let init_fn: SqliteExtensionInit =
                transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
            let rc = ffi::sqlite3_auto_extension(Some(init_fn));
            if rc != 0 {
                Err(format!(
                    "failed to register sqlite-vec extension (code {rc})"
                ))
            } else {
                Ok(())
            }
        };
        *INIT_RESULT.lock().expect("init result mutex poisoned") = Some(result);
    });

    INIT_RESULT
        .lock()
        .expect("init result mutex poisoned")
        .clone()
        .expect("init was called but result not set")
        .map_err(PipelineError::Index)
}

#[async_trait::async_trait]
impl VectorIndex for SqliteTechniqueIndex {
    async fn insert(&self, entries: Vec<TaxonomyEntry>) -> Result<(), PipelineError> {
        if entries.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = entries.iter().map(TaxonomyEntry::document_text).collect();
        let embeddings = self.provider.embed_batch(&texts).await?;
        if embeddings.len() != entries.len() {
            return Err(PipelineError::Index(format!(
                "embedded {} of {} documents",
                embeddings.len(),
                entries.len()
            )));
        }

        let rows: Vec<(TaxonomyEntry, Vec<u8>)> = entries
            .into_iter()
            .zip(embeddings)
            .map(|(entry, embedding)| {
                let blob = embedding_to_blob(&embedding);
                (entry, blob)
            })
            .collect();

        self.conn
            .call(move |conn| -> Result<(), tokio_rusqlite::Error> {
                let tx = conn.transaction().map_err(tokio_rusqlite::Error::Error)?;
                for (entry, blob) in &rows {
                    tx.execute(
                        "INSERT OR REPLACE INTO techniques (id, name, tactics, description) \
                         VALUES (?1, ?2, ?3, ?4)",
                        (
                            &entry.id,
                            &entry.name,
                            entry.tactics_joined(),
                            &entry.description,
                        ),
                    )
                    .map_err(tokio_rusqlite::Error::Error)?;
                    tx.execute(
                        "INSERT OR REPLACE INTO technique_embeddings (id, embedding) \
                         VALUES (?1, ?2)",
                        (&entry.id, blob),
                    )
                    .map_err(tokio_rusqlite::Error::Error)?;
                }
                tx.commit().map_err(tokio_rusqlite::Error::Error)?;
                Ok(())
            })
            .await
            .map_err(|err| PipelineError::Index(err.to_string()))
    }

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<IndexHit>, PipelineError> {
        let query_embedding = self.provider.embed(text).await?;
        let embedding_json = serde_json::to_string(&query_embedding)
            .map_err(|err| PipelineError::Index(err.to_string()))?;

        self.conn
            .call(move |conn| -> Result<Vec<IndexHit>, tokio_rusqlite::Error> {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT t.id, t.name, t.tactics, t.description, \
                         vec_distance_cosine(e.embedding, vec_f32(?)) as distance \
                         FROM techniques t \
                         JOIN technique_embeddings e ON t.id = e.id \
                         ORDER BY distance ASC \
                         LIMIT {top_k}"
                    ))
                    .map_err(tokio_rusqlite::Error::Error)?;

                let rows = stmt
                    .query_map([&embedding_json], |row| {
                        Ok(IndexHit {
                            id: row.get(0)?,
                            metadata: HitMetadata {
                                name: row.get(1)?,
                                tactics: row.get(2)?,
                                description: row.get(3)?,
                            },
                            distance: row.get(4)?,
                        })
                    })
                    .map_err(tokio_rusqlite::Error::Error)?;

                let mut hits = Vec::new();
                for row in rows {
                    hits.push(row.map_err(tokio_rusqlite::Error::Error)?);
                }
                Ok(hits)
            })
            .await
            .map_err(|err| PipelineError::Index(err.to_string()))
    }

    async fn count(&self) -> Result<usize, PipelineError> {
        self.conn
            .call(|conn| -> Result<usize, tokio_rusqlite::Error> {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM techniques", [], |row| row.get(0))
                    .map_err(tokio_rusqlite::Error::Error)?;
                Ok(count as usize)
            })
            .await
            .map_err(|err| PipelineError::Index(err.to_string()))
    }

    async fn clear(&self) -> Result<(), PipelineError> {
        self.conn
            .call(|conn| -> Result<(), tokio_rusqlite::Error> {
                conn.execute_batch("DELETE FROM technique_embeddings; DELETE FROM techniques;")
                    .map_err(tokio_rusqlite::Error::Error)?;
                Ok(())
            })
            .await
            .map_err(|err| PipelineError::Index(err.to_string()))
    }
}

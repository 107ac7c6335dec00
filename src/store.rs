//! Storage façade: the query surface the daemon needs against a per-folder
//! embedded database, without committing to a schema. See `SPEC_FULL.md` §7 /
//! spec.md §6 ("Per-folder embedded database").
//!
//! The daemon never touches SQL directly outside this module; everywhere
//! else talks to `dyn ChunkStore`.

use crate::error::{DaemonError, DaemonResult};
use crate::types::Chunk;
use dashmap::DashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DocumentStats {
    pub file_path: PathBuf,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FolderStats {
    pub document_count: usize,
    pub chunk_count: usize,
}

/// Query/write surface a folder's embedded database must offer. Kept
/// intentionally narrow — existence checks, chunk enumeration, aggregate
/// stats — rather than a general SQL escape hatch.
pub trait ChunkStore: Send + Sync {
    fn upsert_document(&self, file_path: &Path, chunks: Vec<Chunk>) -> DaemonResult<()>;
    fn remove_document(&self, file_path: &Path) -> DaemonResult<()>;
    fn has_document(&self, file_path: &Path) -> bool;
    fn chunks_for(&self, file_path: &Path) -> DaemonResult<Vec<Chunk>>;
    fn folder_stats(&self) -> FolderStats;
}

/// Reference implementation used by default and by tests. Production
/// deployments may swap in the `sqlite-store` feature's
/// `SqliteChunkStore` without the rest of the daemon noticing.
#[derive(Debug, Default)]
pub struct InMemoryChunkStore {
    documents: DashMap<PathBuf, Vec<Chunk>>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkStore for InMemoryChunkStore {
    fn upsert_document(&self, file_path: &Path, chunks: Vec<Chunk>) -> DaemonResult<()> {
        self.documents.insert(file_path.to_path_buf(), chunks);
        Ok(())
    }

    fn remove_document(&self, file_path: &Path) -> DaemonResult<()> {
        self.documents.remove(file_path);
        Ok(())
    }

    fn has_document(&self, file_path: &Path) -> bool {
        self.documents.contains_key(file_path)
    }

    fn chunks_for(&self, file_path: &Path) -> DaemonResult<Vec<Chunk>> {
        self.documents
            .get(file_path)
            .map(|c| c.clone())
            .ok_or_else(|| DaemonError::FileMissing(file_path.to_path_buf()))
    }

    fn folder_stats(&self) -> FolderStats {
        let document_count = self.documents.len();
        let chunk_count = self.documents.iter().map(|e| e.value().len()).sum();
        FolderStats { document_count, chunk_count }
    }
}

#[cfg(feature = "sqlite-store")]
pub mod sqlite {
    use super::*;
    use rusqlite::{params, Connection};
    use std::sync::Mutex;

    /// `embeddings.db` at the folder root, per spec.md §6. Opened with a
    /// single shared connection behind a mutex — indexing is already
    /// serialized by the queue's single-writer invariant, so contention here
    /// is limited to interleaved status reads.
    pub struct SqliteChunkStore {
        conn: Mutex<Connection>,
    }

    impl SqliteChunkStore {
        pub fn open(folder_db_path: &Path) -> DaemonResult<Self> {
            let conn = Connection::open(folder_db_path)
                .map_err(|e| DaemonError::Internal(format!("opening embeddings.db: {e}")))?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS documents (
                    file_path TEXT PRIMARY KEY
                );
                 CREATE TABLE IF NOT EXISTS chunks (
                    document_path TEXT NOT NULL,
                    chunk_index INTEGER NOT NULL,
                    start_offset INTEGER NOT NULL,
                    end_offset INTEGER NOT NULL,
                    content TEXT NOT NULL,
                    params_json TEXT NOT NULL,
                    key_phrases TEXT,
                    readability_score REAL,
                    PRIMARY KEY (document_path, chunk_index)
                );",
            )
            .map_err(|e| DaemonError::Internal(format!("creating schema: {e}")))?;
            Ok(Self { conn: Mutex::new(conn) })
        }
    }

    impl ChunkStore for SqliteChunkStore {
        fn upsert_document(&self, file_path: &Path, chunks: Vec<Chunk>) -> DaemonResult<()> {
            let path_str = file_path.to_string_lossy().to_string();
            let mut conn = self.conn.lock().unwrap();
            let tx = conn
                .transaction()
                .map_err(|e| DaemonError::Internal(format!("begin tx: {e}")))?;
            tx.execute("DELETE FROM chunks WHERE document_path = ?1", params![path_str])
                .map_err(|e| DaemonError::Internal(format!("clearing old chunks: {e}")))?;
            tx.execute(
                "INSERT OR REPLACE INTO documents (file_path) VALUES (?1)",
                params![path_str],
            )
            .map_err(|e| DaemonError::Internal(format!("upserting document row: {e}")))?;
            for c in &chunks {
                let params_json = serde_json::to_string(&c.params)
                    .map_err(|e| DaemonError::Internal(format!("serializing params: {e}")))?;
                tx.execute(
                    "INSERT INTO chunks
                        (document_path, chunk_index, start_offset, end_offset, content,
                         params_json, key_phrases, readability_score)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        path_str,
                        c.chunk_index as i64,
                        c.start_offset as i64,
                        c.end_offset as i64,
                        c.content,
                        params_json,
                        c.semantic.key_phrases.join(","),
                        c.semantic.readability_score,
                    ],
                )
                .map_err(|e| DaemonError::Internal(format!("inserting chunk: {e}")))?;
            }
            tx.commit().map_err(|e| DaemonError::Internal(format!("commit tx: {e}")))?;
            Ok(())
        }

        fn remove_document(&self, file_path: &Path) -> DaemonResult<()> {
            let path_str = file_path.to_string_lossy().to_string();
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM chunks WHERE document_path = ?1", params![path_str])
                .map_err(|e| DaemonError::Internal(format!("deleting chunks: {e}")))?;
            conn.execute("DELETE FROM documents WHERE file_path = ?1", params![path_str])
                .map_err(|e| DaemonError::Internal(format!("deleting document: {e}")))?;
            Ok(())
        }

        fn has_document(&self, file_path: &Path) -> bool {
            let path_str = file_path.to_string_lossy().to_string();
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT 1 FROM documents WHERE file_path = ?1",
                params![path_str],
                |_| Ok(()),
            )
            .is_ok()
        }

        fn chunks_for(&self, file_path: &Path) -> DaemonResult<Vec<Chunk>> {
            let path_str = file_path.to_string_lossy().to_string();
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT start_offset, end_offset, content, params_json, chunk_index
                     FROM chunks WHERE document_path = ?1 ORDER BY chunk_index",
                )
                .map_err(|e| DaemonError::Internal(format!("preparing query: {e}")))?;
            let total = conn
                .query_row(
                    "SELECT COUNT(*) FROM chunks WHERE document_path = ?1",
                    params![path_str],
                    |row| row.get::<_, i64>(0),
                )
                .unwrap_or(0) as usize;
            let rows = stmt
                .query_map(params![path_str], |row| {
                    let start_offset: i64 = row.get(0)?;
                    let end_offset: i64 = row.get(1)?;
                    let content: String = row.get(2)?;
                    let params_json: String = row.get(3)?;
                    let chunk_index: i64 = row.get(4)?;
                    Ok((start_offset, end_offset, content, params_json, chunk_index))
                })
                .map_err(|e| DaemonError::Internal(format!("querying chunks: {e}")))?;

            let mut chunks = Vec::new();
            for row in rows {
                let (start_offset, end_offset, content, params_json, chunk_index) =
                    row.map_err(|e| DaemonError::Internal(format!("reading row: {e}")))?;
                let params = serde_json::from_str(&params_json)
                    .map_err(|e| DaemonError::Internal(format!("parsing params: {e}")))?;
                let token_count_estimate = crate::chunker::estimate_tokens(&content);
                chunks.push(Chunk {
                    content,
                    token_count_estimate,
                    start_offset: start_offset as usize,
                    end_offset: end_offset as usize,
                    chunk_index: chunk_index as usize,
                    total_chunks: total,
                    params,
                    semantic: Default::default(),
                });
            }
            if chunks.is_empty() {
                return Err(DaemonError::FileMissing(file_path.to_path_buf()));
            }
            Ok(chunks)
        }

        fn folder_stats(&self) -> FolderStats {
            let conn = self.conn.lock().unwrap();
            let document_count = conn
                .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get::<_, i64>(0))
                .unwrap_or(0) as usize;
            let chunk_count = conn
                .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get::<_, i64>(0))
                .unwrap_or(0) as usize;
            FolderStats { document_count, chunk_count }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::ExtractionParams;
    use crate::types::SemanticMetadata;

    fn sample_chunk(i: usize) -> Chunk {
        Chunk {
            content: format!("chunk {i}"),
            token_count_estimate: 2,
            start_offset: 0,
            end_offset: 10,
            chunk_index: i,
            total_chunks: 1,
            params: ExtractionParams::Text { version: 1, start_line: 1, end_line: 1 },
            semantic: SemanticMetadata::default(),
        }
    }

    #[test]
    fn upsert_then_query_round_trips() {
        let store = InMemoryChunkStore::new();
        let path = Path::new("/repo/a.txt");
        store.upsert_document(path, vec![sample_chunk(0), sample_chunk(1)]).unwrap();
        assert!(store.has_document(path));
        assert_eq!(store.chunks_for(path).unwrap().len(), 2);
        assert_eq!(store.folder_stats().document_count, 1);
        assert_eq!(store.folder_stats().chunk_count, 2);
    }

    #[test]
    fn remove_clears_document() {
        let store = InMemoryChunkStore::new();
        let path = Path::new("/repo/a.txt");
        store.upsert_document(path, vec![sample_chunk(0)]).unwrap();
        store.remove_document(path).unwrap();
        assert!(!store.has_document(path));
    }

    #[test]
    fn missing_document_errors() {
        let store = InMemoryChunkStore::new();
        assert!(store.chunks_for(Path::new("/nope.txt")).is_err());
    }
}

//! Per-master document memory.
//!
//! Uploaded files are chunked, embedded and persisted under
//! `<root>/<master>/storage/index.json`; the set of already-ingested files
//! lives next to it in `indexed_files.txt` and is read-modify-written around
//! each ingestion. Queries embed the question and return the top passages
//! concatenated.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::embedding::EmbeddingBackend;
use crate::readers;

const INDEX_FILE: &str = "index.json";
const RECORD_FILE: &str = "indexed_files.txt";

/// Character budget per chunk (~400 tokens at 4 chars/token).
const CHUNK_TARGET: usize = 1600;

const DEFAULT_TOP_K: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chunk {
    source: String,
    hash: String,
    text: String,
    embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedIndex {
    chunks: Vec<Chunk>,
}

pub struct DocumentIndex {
    master: String,
    storage_dir: PathBuf,
    record_path: PathBuf,
    index: PersistedIndex,
    embedder: Arc<dyn EmbeddingBackend>,
}

impl DocumentIndex {
    /// Open (or create) the master's index under `root`.
    pub fn open(root: &Path, master: &str, embedder: Arc<dyn EmbeddingBackend>) -> Result<Self> {
        let user_dir = root.join(master);
        let storage_dir = user_dir.join("storage");
        std::fs::create_dir_all(&storage_dir)
            .with_context(|| format!("failed to create index dir: {}", storage_dir.display()))?;
        let record_path = user_dir.join(RECORD_FILE);

        let index_path = storage_dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            let raw = std::fs::read_to_string(&index_path)
                .with_context(|| format!("failed to read index: {}", index_path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse index: {}", index_path.display()))?
        } else {
            PersistedIndex::default()
        };

        Ok(Self {
            master: master.to_string(),
            storage_dir,
            record_path,
            index,
            embedder,
        })
    }

    pub fn master(&self) -> &str {
        &self.master
    }

    pub fn chunk_count(&self) -> usize {
        self.index.chunks.len()
    }

    fn load_record(&self) -> BTreeSet<String> {
        let Ok(content) = std::fs::read_to_string(&self.record_path) else {
            return BTreeSet::new();
        };
        content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn save_record(&self, record: &BTreeSet<String>) -> Result<()> {
        let mut content = String::new();
        for file in record {
            content.push_str(file);
            content.push('\n');
        }
        write_atomic(&self.record_path, content.as_bytes())
    }

    fn persist(&self) -> Result<()> {
        let path = self.storage_dir.join(INDEX_FILE);
        let raw = serde_json::to_string(&self.index)?;
        write_atomic(&path, raw.as_bytes())
    }

    /// Fold new files into the existing index. Already-ingested paths and
    /// unsupported extensions are skipped; the indexed-files record is
    /// rewritten once at the end.
    pub async fn ingest_new_files(&mut self, files: &[PathBuf]) -> Result<usize> {
        let mut record = self.load_record();
        let mut ingested = 0;

        for path in files {
            let key = path.to_string_lossy().to_string();
            if record.contains(&key) {
                continue;
            }
            if !readers::is_supported(path) {
                tracing::warn!(master = %self.master, file = %key, "skipping unsupported file");
                continue;
            }
            let text = match readers::extract_text(path) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(master = %self.master, file = %key, "failed to read file: {err:#}");
                    continue;
                }
            };
            for piece in chunk_text(&text, CHUNK_TARGET) {
                let embedding = normalize(self.embedder.embed(&piece).await?);
                self.index.chunks.push(Chunk {
                    source: key.clone(),
                    hash: chunk_hash(&piece),
                    text: piece,
                    embedding,
                });
            }
            record.insert(key);
            ingested += 1;
        }

        if ingested > 0 {
            self.persist()?;
        }
        self.save_record(&record)?;
        Ok(ingested)
    }

    /// Natural-language query over the master's documents: the top passages
    /// joined into one text block. Empty index yields an empty string.
    pub async fn query(&self, question: &str) -> Result<String> {
        if self.index.chunks.is_empty() {
            return Ok(String::new());
        }
        let query = normalize(self.embedder.embed(question).await?);
        let mut scored: Vec<(f32, &Chunk)> = self
            .index
            .chunks
            .iter()
            .map(|chunk| (dot(&query, &chunk.embedding), chunk))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(DEFAULT_TOP_K);

        Ok(scored
            .into_iter()
            .map(|(_, chunk)| chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

/// Split on paragraph boundaries, packing paragraphs into chunks of at most
/// `target` characters; a single oversized paragraph is split by fixed
/// windows.
fn chunk_text(text: &str, target: usize) -> Vec<String> {
    let target = target.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if paragraph.len() > target {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let chars: Vec<char> = paragraph.chars().collect();
            for window in chars.chunks(target) {
                chunks.push(window.iter().collect());
            }
            continue;
        }
        if !current.is_empty() && current.len() + paragraph.len() + 2 > target {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn chunk_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

fn normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut values {
            *v /= norm;
        }
    }
    values
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::StubEmbedding;

    fn embedder() -> Arc<dyn EmbeddingBackend> {
        Arc::new(StubEmbedding::new(16))
    }

    #[tokio::test]
    async fn ingest_and_query_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("favorites.txt");
        std::fs::write(&doc, "Bob's favorite book is Dune by Frank Herbert.").unwrap();

        let mut index = DocumentIndex::open(dir.path(), "Bob", embedder()).unwrap();
        let ingested = index.ingest_new_files(&[doc.clone()]).await.unwrap();
        assert_eq!(ingested, 1);

        let answer = index.query("favorite book").await.unwrap();
        assert!(answer.contains("Dune"));
    }

    #[tokio::test]
    async fn reingesting_the_same_file_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("note.md");
        std::fs::write(&doc, "# Note\n\nbody").unwrap();

        let mut index = DocumentIndex::open(dir.path(), "Alice", embedder()).unwrap();
        assert_eq!(index.ingest_new_files(&[doc.clone()]).await.unwrap(), 1);
        let chunks = index.chunk_count();
        assert_eq!(index.ingest_new_files(&[doc.clone()]).await.unwrap(), 0);
        assert_eq!(index.chunk_count(), chunks);
    }

    #[tokio::test]
    async fn index_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("plan.txt");
        std::fs::write(&doc, "The heist is planned for Tuesday.").unwrap();

        {
            let mut index = DocumentIndex::open(dir.path(), "Carol", embedder()).unwrap();
            index.ingest_new_files(&[doc.clone()]).await.unwrap();
        }

        let index = DocumentIndex::open(dir.path(), "Carol", embedder()).unwrap();
        assert!(index.chunk_count() > 0);
        let answer = index.query("when is the heist").await.unwrap();
        assert!(answer.contains("Tuesday"));
    }

    #[tokio::test]
    async fn unsupported_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("blob.bin");
        std::fs::write(&doc, "binary").unwrap();

        let mut index = DocumentIndex::open(dir.path(), "Dave", embedder()).unwrap();
        assert_eq!(index.ingest_new_files(&[doc]).await.unwrap(), 0);
        assert_eq!(index.chunk_count(), 0);
    }

    #[tokio::test]
    async fn empty_index_query_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = DocumentIndex::open(dir.path(), "Eve", embedder()).unwrap();
        assert_eq!(index.query("anything").await.unwrap(), "");
    }

    #[test]
    fn chunking_packs_paragraphs() {
        let text = "para one\n\npara two\n\npara three";
        let chunks = chunk_text(text, 20);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.len() <= 20));

        let oversized = "x".repeat(50);
        let chunks = chunk_text(&oversized, 20);
        assert_eq!(chunks.len(), 3);
    }
}

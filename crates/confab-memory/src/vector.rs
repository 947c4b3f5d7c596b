//! Fuzzy memory: cosine retrieval over a per-master table of precomputed
//! summary embeddings loaded from a tab-separated file with `text` and `emb`
//! columns (`emb` rendered as `[v1, v2, ...]`).

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use crate::embedding::EmbeddingBackend;

struct MemoryRow {
    text: String,
    embedding: Vec<f32>,
}

pub struct FuzzyMemory {
    rows: Vec<MemoryRow>,
    embedder: Arc<dyn EmbeddingBackend>,
}

impl FuzzyMemory {
    /// A missing table file is legal: the memory simply holds no rows and
    /// every query returns nothing.
    pub fn load(path: &Path, embedder: Arc<dyn EmbeddingBackend>) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                rows: Vec::new(),
                embedder,
            });
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read memory table: {}", path.display()))?;
        let rows = parse_table(&content)?;
        Ok(Self { rows, embedder })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Top-k nearest memory texts by cosine similarity, best first.
    /// Returns `(score, row_index, text)` triples.
    pub async fn query(&self, text: &str, topk: usize) -> Result<Vec<(f32, usize, String)>> {
        let topk = topk.max(1);
        if self.rows.is_empty() {
            return Ok(Vec::new());
        }

        let query = normalize(self.embedder.embed(text).await?);
        let mut scored: Vec<(f32, usize)> = self
            .rows
            .iter()
            .enumerate()
            .map(|(idx, row)| (dot(&query, &row.embedding), idx))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(topk);

        Ok(scored
            .into_iter()
            .map(|(score, idx)| (score, idx, self.rows[idx].text.clone()))
            .collect())
    }
}

fn parse_table(content: &str) -> Result<Vec<MemoryRow>> {
    let mut lines = content.lines();
    let header = lines.next().ok_or_else(|| anyhow!("empty memory table"))?;
    let columns: Vec<&str> = header.split('\t').collect();
    let text_col = columns
        .iter()
        .position(|c| *c == "text")
        .ok_or_else(|| anyhow!("memory table missing 'text' column"))?;
    let emb_col = columns
        .iter()
        .position(|c| *c == "emb")
        .ok_or_else(|| anyhow!("memory table missing 'emb' column"))?;

    let mut rows = Vec::new();
    for (line_no, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let text = fields
            .get(text_col)
            .ok_or_else(|| anyhow!("memory table line {} truncated", line_no + 2))?;
        let emb_raw = fields
            .get(emb_col)
            .ok_or_else(|| anyhow!("memory table line {} truncated", line_no + 2))?;
        let embedding = normalize(parse_embedding(emb_raw)?);
        rows.push(MemoryRow {
            text: text.to_string(),
            embedding,
        });
    }
    Ok(rows)
}

fn parse_embedding(raw: &str) -> Result<Vec<f32>> {
    let inner = raw.trim().trim_start_matches('[').trim_end_matches(']');
    inner
        .split(',')
        .map(|v| {
            v.trim()
                .parse::<f32>()
                .with_context(|| format!("invalid embedding value: {v}"))
        })
        .collect()
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

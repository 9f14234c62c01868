//! Package-intelligence vector index.
//!
//! Records live in a separate SQLite file (`vectordb.db`) and are held in
//! memory for lookup; the set is small (tens of thousands of rows) and
//! read-only at runtime, the one-time bulk import happens out of band.
//! Embeddings are produced behind the `Embedder` trait; the default is a
//! deterministic hashed character-n-gram embedder, so nearest-neighbor
//! scores, the similarity floor, and the tests are all real. A model-backed
//! embedder is a drop-in replacement.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

use crate::errors::GatewayError;
use crate::extract::Ecosystem;

pub const EMBEDDING_DIM: usize = 384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageStatus {
    Malicious,
    Deprecated,
    Archived,
    Ok,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Malicious => "malicious",
            PackageStatus::Deprecated => "deprecated",
            PackageStatus::Archived => "archived",
            PackageStatus::Ok => "ok",
        }
    }

    fn from_str(s: &str) -> PackageStatus {
        match s {
            "malicious" => PackageStatus::Malicious,
            "deprecated" => PackageStatus::Deprecated,
            "archived" => PackageStatus::Archived,
            _ => PackageStatus::Ok,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageRecord {
    pub ecosystem: Ecosystem,
    pub name: String,
    pub status: PackageStatus,
    pub advisory_url: Option<String>,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct PackageMatch {
    pub record: PackageRecord,
    pub score: f32,
}

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Feature-hashing embedder over character trigrams, L2-normalized.
/// Deterministic, dependency-free, and stable across runs, which the
/// persisted index relies on.
#[derive(Default)]
pub struct HashEmbedder;

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; EMBEDDING_DIM];
        let normalized = text.to_lowercase();
        let padded: Vec<char> = format!("^{normalized}$").chars().collect();
        if padded.len() < 3 {
            return vector;
        }
        for window in padded.windows(3) {
            let mut hash: u64 = 0xcbf29ce484222325;
            for &c in window {
                hash ^= c as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
            let index = (hash % EMBEDDING_DIM as u64) as usize;
            let sign = if (hash >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        vector
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    // Both sides are L2-normalized at insert/query time.
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub struct PackageIndex {
    records: Vec<PackageRecord>,
    embedder: Box<dyn Embedder>,
    similarity_floor: f32,
    conn: Option<Mutex<Connection>>,
}

impl PackageIndex {
    /// Open (or create) the on-disk index and load all rows into memory.
    pub fn open(path: &Path, similarity_floor: f32) -> Result<Self, GatewayError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GatewayError::Config(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| GatewayError::Config(format!("open {}: {e}", path.display())))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS packages (
                ecosystem TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                advisory_url TEXT,
                embedding BLOB NOT NULL,
                PRIMARY KEY (ecosystem, name)
            )",
            [],
        )
        .map_err(|e| GatewayError::Config(format!("migrate vectordb: {e}")))?;

        let mut records = Vec::new();
        {
            let mut stmt = conn
                .prepare("SELECT ecosystem, name, status, advisory_url, embedding FROM packages")
                .map_err(|e| GatewayError::Config(format!("vectordb: {e}")))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                })
                .map_err(|e| GatewayError::Config(format!("vectordb: {e}")))?;
            for row in rows {
                let (eco, name, status, advisory_url, blob) =
                    row.map_err(|e| GatewayError::Config(format!("vectordb: {e}")))?;
                let Some(ecosystem) = Ecosystem::from_str(&eco) else {
                    tracing::warn!(ecosystem = %eco, "skipping row with unknown ecosystem");
                    continue;
                };
                records.push(PackageRecord {
                    ecosystem,
                    name,
                    status: PackageStatus::from_str(&status),
                    advisory_url,
                    embedding: decode_embedding(&blob),
                });
            }
        }
        tracing::info!(count = records.len(), "loaded package index");

        Ok(PackageIndex {
            records,
            embedder: Box::new(HashEmbedder),
            similarity_floor,
            conn: Some(Mutex::new(conn)),
        })
    }

    /// An in-memory index, for tests and for running without a volume.
    pub fn in_memory(similarity_floor: f32) -> Self {
        PackageIndex {
            records: Vec::new(),
            embedder: Box::new(HashEmbedder),
            similarity_floor,
            conn: None,
        }
    }

    /// Insert a record, embedding its name, and persist it when backed by
    /// a file.
    pub fn insert(
        &mut self,
        ecosystem: Ecosystem,
        name: &str,
        status: PackageStatus,
        advisory_url: Option<&str>,
    ) -> Result<(), GatewayError> {
        let embedding = self.embedder.embed(name);
        if let Some(conn) = &self.conn {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT OR REPLACE INTO packages (ecosystem, name, status, advisory_url, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    ecosystem.as_str(),
                    name,
                    status.as_str(),
                    advisory_url,
                    encode_embedding(&embedding),
                ],
            )
            .map_err(|e| GatewayError::Internal(format!("vectordb insert: {e}")))?;
        }
        self.records.push(PackageRecord {
            ecosystem,
            name: name.to_string(),
            status,
            advisory_url: advisory_url.map(|s| s.to_string()),
            embedding,
        });
        Ok(())
    }

    /// Nearest neighbor by cosine over the name embedding. Matches below
    /// the similarity floor are "unknown": `None`, no alert.
    pub fn lookup(&self, name: &str, ecosystem: Option<Ecosystem>) -> Option<PackageMatch> {
        let query = self.embedder.embed(name);
        let mut best: Option<PackageMatch> = None;
        for record in &self.records {
            if let Some(eco) = ecosystem {
                if record.ecosystem != eco {
                    continue;
                }
            }
            let score = cosine(&query, &record.embedding);
            if best.as_ref().map(|b| score > b.score).unwrap_or(true) {
                best = Some(PackageMatch {
                    record: record.clone(),
                    score,
                });
            }
        }
        best.filter(|m| m.score >= self.similarity_floor)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::{
    chunking::Chunk,
    error::{Error, Result},
};

const VECTORS: TableDefinition<u64, &[u8]> = TableDefinition::new("vectors");
const CHUNKS: TableDefinition<u64, &[u8]> = TableDefinition::new("chunks");

/// Header size: 4 bytes dimension + 4 bytes stored entry count.
const HEADER_SIZE: usize = 8;

/// Stores chunk vectors and chunk metadata keyed by chunk id.
///
/// Binary format per vector:
/// - 4 bytes: dimension D (u32 LE)
/// - 4 bytes: stored entry count N (u32 LE)
/// - if N == D: D * 4 bytes of f32 LE values (dense)
/// - otherwise: N pairs of (u32 LE index, f32 LE value) (sparse)
///
/// Sparse encoding is chosen when it is strictly smaller, which is the
/// common case for TF-IDF vectors.
pub struct EmbeddingDb {
    db: Database,
}

impl EmbeddingDb {
    /// Open or create a vector store at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use medrag::EmbeddingDb;
    ///
    /// let db = EmbeddingDb::open(&tmp.path().join("index.redb")).unwrap();
    /// assert!(db.load_all().unwrap().is_empty());
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(VECTORS)?;
        txn.open_table(CHUNKS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Store chunks and their vectors in a single transaction.
    pub fn batch_store(&self, entries: &[(&Chunk, &[f32])]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut vectors = txn.open_table(VECTORS)?;
            let mut chunks = txn.open_table(CHUNKS)?;
            for (chunk, vector) in entries {
                let encoded = encode_vector(vector);
                vectors.insert(chunk.chunk_id, encoded.as_slice())?;

                let json = serde_json::to_vec(chunk)?;
                chunks.insert(chunk.chunk_id, json.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Load every stored entry, ordered by chunk id.
    ///
    /// Fails with [`Error::IndexFormat`] when a vector is malformed or a
    /// chunk has no vector.
    pub fn load_all(&self) -> Result<Vec<(Chunk, Vec<f32>)>> {
        let txn = self.db.begin_read()?;
        let vectors = txn.open_table(VECTORS)?;
        let chunks = txn.open_table(CHUNKS)?;

        let mut entries = Vec::new();
        for entry in chunks.iter()? {
            let (key, value) = entry?;
            let chunk_id = key.value();
            let chunk: Chunk = serde_json::from_slice(value.value())?;

            let guard = vectors.get(chunk_id)?.ok_or_else(|| {
                Error::IndexFormat(format!("chunk {chunk_id} has no vector"))
            })?;
            let vector = decode_vector(guard.value()).ok_or_else(|| {
                Error::IndexFormat(format!(
                    "malformed vector for chunk {chunk_id}"
                ))
            })?;
            entries.push((chunk, vector));
        }

        Ok(entries)
    }
}

impl std::fmt::Debug for EmbeddingDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingDb").finish_non_exhaustive()
    }
}

pub(crate) fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let dimension = vector.len() as u32;
    let nonzero: Vec<(u32, f32)> = vector
        .iter()
        .enumerate()
        // Only +0.0 is implicit, so decoding is bit-exact.
        .filter(|(_, v)| v.to_bits() != 0)
        .map(|(i, v)| (i as u32, *v))
        .collect();

    let sparse = nonzero.len() * 2 < vector.len();
    let stored = if sparse { nonzero.len() } else { vector.len() };

    let mut bytes = Vec::with_capacity(HEADER_SIZE + stored * 8);
    bytes.extend_from_slice(&dimension.to_le_bytes());
    bytes.extend_from_slice(&(stored as u32).to_le_bytes());

    if sparse {
        for (index, value) in nonzero {
            bytes.extend_from_slice(&index.to_le_bytes());
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    } else {
        bytes.extend_from_slice(bytemuck::cast_slice(vector));
    }
    bytes
}

pub(crate) fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let dimension = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as usize;
    let stored = u32::from_le_bytes(bytes[4..8].try_into().ok()?) as usize;
    let body = &bytes[HEADER_SIZE..];

    if stored == dimension {
        if body.len() != dimension * 4 {
            return None;
        }
        return Some(
            body.chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        );
    }

    if body.len() != stored * 8 {
        return None;
    }
    let mut vector = vec![0.0f32; dimension];
    for pair in body.chunks_exact(8) {
        let index = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]])
            as usize;
        let value = f32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
        *vector.get_mut(index)? = value;
    }
    Some(vector)
}

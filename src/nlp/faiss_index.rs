//! Per-commessa FAISS index cache (spec §4.3, component C3).
//!
//! Grounded on `original_source`'s `PriceListFaissService`: inner-product
//! index over L2-normalized vectors, two files on disk per commessa — the
//! index itself plus an `_ids.npy` sidecar (spec §6 file shape) — and a
//! dimension check that degrades to an empty result rather than panicking
//! when a stale index doesn't match the current model (P9). FAISS's own
//! `IDMap` already resolves a search label straight to the catalog item id
//! (`add_with_ids` at build time), so the sidecar is not re-read into
//! memory on load; it exists on disk only so the stored id list can be
//! inspected/audited independently of the FAISS binary format, and
//! `load_index` cross-checks its row count against the index as a cheap
//! corruption check.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const INDEX_FILENAME: &str = "price_list_index.faiss";
const IDS_FILENAME: &str = "price_list_ids.npy";

struct LoadedIndex {
    index: faiss::index::IndexImpl,
    dimension: usize,
}

/// Caches one loaded FAISS handle per commessa so repeated searches in a
/// request burst don't re-read from disk.
pub struct FaissIndexCache {
    base_dir: PathBuf,
    handles: DashMap<i64, Arc<LoadedIndex>>,
}

impl FaissIndexCache {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            handles: DashMap::new(),
        }
    }

    fn index_path(&self, commessa_id: i64) -> PathBuf {
        self.base_dir.join(format!("commessa_{commessa_id}_{INDEX_FILENAME}"))
    }

    fn ids_path(&self, commessa_id: i64) -> PathBuf {
        self.base_dir.join(format!("commessa_{commessa_id}_{IDS_FILENAME}"))
    }

    pub fn index_exists(&self, commessa_id: i64) -> bool {
        self.index_path(commessa_id).exists()
    }

    /// Builds an inner-product index from `(item_id, vector)` pairs,
    /// persists it, and caches the handle. `vectors` must already be
    /// L2-normalized (inner product then equals cosine similarity).
    pub fn build_index(&self, commessa_id: i64, items: &[(i64, Vec<f32>)]) -> anyhow::Result<()> {
        if items.is_empty() {
            anyhow::bail!("nessun item da indicizzare per la commessa {commessa_id}");
        }
        let dimension = items[0].1.len();
        let mut flat_index = faiss::index_factory(dimension as u32, "IDMap,Flat", faiss::MetricType::InnerProduct)
            .map_err(|e| anyhow::anyhow!("creazione indice FAISS fallita: {e}"))?;

        let mut flattened: Vec<f32> = Vec::with_capacity(items.len() * dimension);
        let mut ids: Vec<i64> = Vec::with_capacity(items.len());
        for (item_id, vector) in items {
            if vector.len() != dimension {
                anyhow::bail!("dimensione embedding incoerente per item {item_id}");
            }
            flattened.extend_from_slice(vector);
            ids.push(*item_id);
        }

        let idx_values: Vec<faiss::Idx> = ids.iter().map(|id| faiss::Idx::new(*id as u64)).collect();
        flat_index
            .add_with_ids(&flattened, &idx_values)
            .map_err(|e| anyhow::anyhow!("inserimento vettori FAISS fallito: {e}"))?;

        std::fs::create_dir_all(&self.base_dir)?;
        faiss::write_index(&flat_index, self.index_path(commessa_id).to_string_lossy().as_ref())
            .map_err(|e| anyhow::anyhow!("scrittura indice FAISS fallita: {e}"))?;
        write_ids(&self.ids_path(commessa_id), &ids)?;

        self.handles.insert(
            commessa_id,
            Arc::new(LoadedIndex {
                index: flat_index,
                dimension,
            }),
        );
        Ok(())
    }

    pub fn load_index(&self, commessa_id: i64) -> anyhow::Result<bool> {
        if self.handles.contains_key(&commessa_id) {
            return Ok(true);
        }
        let index_path = self.index_path(commessa_id);
        if !index_path.exists() {
            return Ok(false);
        }
        let index = faiss::read_index(index_path.to_string_lossy().as_ref())
            .map_err(|e| anyhow::anyhow!("lettura indice FAISS fallita: {e}"))?;
        let dimension = index.d() as usize;

        if let Ok(ids) = read_ids(&self.ids_path(commessa_id)) {
            if ids.len() as u64 != index.ntotal() {
                tracing::warn!(
                    commessa_id,
                    sidecar_rows = ids.len(),
                    index_rows = index.ntotal(),
                    "sidecar ids fuori sincrono con l'indice FAISS"
                );
            }
        }

        self.handles.insert(commessa_id, Arc::new(LoadedIndex { index, dimension }));
        Ok(true)
    }

    /// Returns `(item_id, score)` pairs ranked by descending inner product.
    /// A dimension mismatch between `query_vector` and the stored index
    /// returns an empty vector with a warning rather than an error — the
    /// caller (catalog search) falls back to lexical search.
    pub fn search(&self, commessa_id: i64, query_vector: &[f32], k: usize) -> Vec<(i64, f32)> {
        if !self.handles.contains_key(&commessa_id) {
            if let Err(e) = self.load_index(commessa_id) {
                tracing::warn!(commessa_id, error = %e, "impossibile caricare l'indice FAISS");
                return Vec::new();
            }
        }
        let Some(handle) = self.handles.get(&commessa_id) else {
            return Vec::new();
        };
        if query_vector.len() != handle.dimension {
            tracing::warn!(
                commessa_id,
                query_dim = query_vector.len(),
                index_dim = handle.dimension,
                "dimensione query non corrisponde all'indice FAISS"
            );
            return Vec::new();
        }

        match handle.index.search(query_vector, k) {
            Ok(result) => result
                .labels
                .iter()
                .zip(result.distances.iter())
                .filter_map(|(label, score)| {
                    label.get().map(|id| (id as i64, *score))
                })
                .collect(),
            Err(e) => {
                tracing::warn!(commessa_id, error = %e, "ricerca FAISS fallita");
                Vec::new()
            }
        }
    }

    pub fn delete_index(&self, commessa_id: i64) {
        let _ = std::fs::remove_file(self.index_path(commessa_id));
        let _ = std::fs::remove_file(self.ids_path(commessa_id));
        self.handles.remove(&commessa_id);
    }
}

fn write_ids(path: &Path, ids: &[i64]) -> anyhow::Result<()> {
    let bytes: Vec<u8> = ids.iter().flat_map(|id| id.to_le_bytes()).collect();
    std::fs::write(path, bytes)?;
    Ok(())
}

fn read_ids(path: &Path) -> anyhow::Result<Vec<i64>> {
    let bytes = std::fs::read(path)?;
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| i64::from_le_bytes(chunk.try_into().unwrap()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_does_not_exist_before_build() {
        let dir = std::env::temp_dir().join("tender_faiss_test_nonexistent");
        let cache = FaissIndexCache::new(dir);
        assert!(!cache.index_exists(999));
    }

    #[test]
    fn test_search_on_missing_index_returns_empty() {
        let dir = std::env::temp_dir().join("tender_faiss_test_missing");
        let cache = FaissIndexCache::new(dir);
        let result = cache.search(42, &[0.1, 0.2, 0.3], 10);
        assert!(result.is_empty());
    }

    #[test]
    fn test_ids_roundtrip_through_file() {
        let path = std::env::temp_dir().join("tender_faiss_ids_roundtrip.bin");
        let ids = vec![1i64, 2, 3, 42];
        write_ids(&path, &ids).unwrap();
        let read_back = read_ids(&path).unwrap();
        assert_eq!(ids, read_back);
        let _ = std::fs::remove_file(&path);
    }
}

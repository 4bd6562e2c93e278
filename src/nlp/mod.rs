pub mod embedding;
pub mod faiss_index;

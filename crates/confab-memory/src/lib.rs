pub mod docindex;
pub mod embedding;
pub mod readers;
pub mod store;
pub mod vector;

pub use docindex::DocumentIndex;
pub use embedding::{EmbeddingBackend, OpenAiEmbeddingBackend, StubEmbedding};
pub use store::ChatStore;
pub use vector::FuzzyMemory;

pub mod history;
pub mod memory;
pub mod qdrant;

pub use history::{InMemoryHistoryStore, JsonHistoryStore};
pub use memory::InMemoryVectorStore;
pub use qdrant::QdrantStore;

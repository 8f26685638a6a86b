mod docs;
mod error;
mod graph;
mod queue;
mod schema;
mod search;
mod store;
mod vectors;

pub use docs::{DocRef, DocumentStore, parse_doc_path};
pub use error::{Error, Result};
pub use graph::{Direction, GraphSlice};
pub use queue::{QueueStats, retry_delay};
pub use search::{SearchFilters, SearchHit, SearchField};
pub use store::{NodeRow, Store, StoreStats, UpsertOutcome};
pub use vectors::{EmbeddingRecord, cosine_distance};

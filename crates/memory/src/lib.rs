pub mod decay;
pub mod dedup;
pub mod event_log;
pub mod persistence;
pub mod profile;
pub mod schema;
pub mod search;
pub mod store;
pub mod time;

pub use event_log::{MemoryEvent, MemoryEventLog, MemoryLogRecord};
pub use persistence::Store;
pub use profile::format_user_profile_block;
pub use schema::*;
pub use search::{cosine_similarity, hybrid_search, SearchHit, SearchOptions};
pub use store::MemoryStore;
pub use time::{is_in_window, next_occurrence};

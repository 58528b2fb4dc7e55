pub mod embedding;
pub mod gardener;
pub mod micro_profile;
pub mod scheduler;

pub use embedding::OllamaEmbeddingProvider;
pub use gardener::{DeepTickReport, Gardener, SleepTickReport};
pub use scheduler::{LoggingSink, ScheduledItemSink, Scheduler, TickReport};

#![deny(clippy::all)]

mod error;
mod event;
mod event_log;
mod frame;
mod index;
mod indexer;
mod jsonl;
mod locator;
mod recorder;
mod recovery;
mod resolver;
mod store;

pub use error::LogError;
pub use event::EventPayload;
pub use event::EventRecord;
pub use event::TabId;
pub use event::Timestamp;
pub use event::CUSTOM_EVENT_TYPE;
pub use event_log::EventIter;
pub use event_log::EventLog;
pub use event_log::LoggedEvent;
pub use event_log::RecordOffset;
pub use frame::FrameEntry;
pub use index::FrameIndex;
pub use indexer::FrameIndexer;
pub use jsonl::SyncPolicy;
pub use locator::Locator;
pub use locator::INDEX_TIMESTAMP_THRESHOLD;
pub use recorder::Appended;
pub use recorder::Recorder;
pub use recorder::RecorderStats;
pub use recovery::derive_index;
pub use recovery::reindex;
pub use recovery::verify_index;
pub use recovery::IndexVerification;
pub use resolver::Resolution;
pub use resolver::Resolver;
pub use store::FrameStore;

pub type Result<T> = std::result::Result<T, LogError>;

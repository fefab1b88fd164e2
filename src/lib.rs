//! # Content Store
//!
//! Storage layer for a small content-management system: topics, stories,
//! users and followers, plus named templates and images, persisted by one of
//! three interchangeable backends that answer the same story queries.
//!
//! ## Backends
//!
//! - **Flat-file**: one directory per record kind, `key: value` metadata
//!   files, story text in sidecar files and a text publication index,
//!   coordinated across processes with advisory file locks
//! - **Snapshot**: the whole store in memory, persisted as one JSON file
//! - **SQLite**: one table per kind with a tag join table
//!
//! The source string picks the backend: a `.json` file selects the snapshot,
//! a `sqlite:` prefix or a `.db` / `.sqlite` / `.sqlite3` suffix selects
//! SQLite and an absolute directory selects the flat-file layout.
//!
//! ## Example
//!
//! ```ignore
//! use content_store::{Store, StoreConfig, StorySet, Topic, Story};
//!
//! let mut store = Store::open(StoreConfig::new("/var/lib/site"))?;
//! store.create(Some("admin"), Some("news"))?;
//!
//! let story = Story::with_fields([("topic_id", "news"), ("title", "Hello")])?;
//! store.save_story(story);
//!
//! for entry in store.story_set(&StorySet::new().topics(["news"]).num(10)) {
//!     println!("{} {}", entry.date, entry.id);
//! }
//! ```

pub mod backend;
pub mod error;
pub mod index;
pub mod query;
pub mod records;
pub mod store;
pub mod types;

// Re-exports
pub use backend::{Backend, Entries, FsBackend, LockPolicy, MemBackend, SqliteBackend, SourceKind};
pub use error::{Result, StoreError};
pub use index::StoryEntry;
pub use query::{Order, StorySet};
pub use records::{FieldValue, Follower, Record, Story, Topic, User};
pub use store::{Store, StoreConfig};
pub use types::{slugify, valid_id, valid_resource_id, valid_tag, Date};

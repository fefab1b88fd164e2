//! Storage backends.
//!
//! Each backend persists the four record kinds, templates, images and short
//! urls in its
//! own substrate and answers [`StorySet`] queries with identical results.
//! Backends do no identifier validation and fill no defaults; that is the
//! job of [`crate::Store`].

pub mod fs;
pub mod mem;
pub mod sqlite;

use crate::error::Result;
use crate::index::StoryEntry;
use crate::query::StorySet;
use crate::records::{Follower, Story, Topic, User};
use crate::store::StoreConfig;
use std::path::Path;

pub use self::fs::{FsBackend, LockPolicy};
pub use self::mem::MemBackend;
pub use self::sqlite::SqliteBackend;

/// Lazy, finite sequence of query results.
pub type Entries<'a> = Box<dyn Iterator<Item = StoryEntry> + 'a>;

/// Contract every storage driver implements.
///
/// Lookups return `Ok(None)` for absent records. Enumerations return ids
/// sorted where the substrate allows, and never filter by visibility.
pub trait Backend: Send {
    /// Human readable name of the backend and its source.
    fn describe(&self) -> String;

    /// Initialize an empty store. Idempotent.
    fn create(&mut self) -> Result<()>;

    /// Persist pending writes.
    fn flush(&mut self) -> Result<()>;

    /// Persist pending writes and release resources.
    fn close(&mut self) -> Result<()>;

    fn load_topic(&self, id: &str) -> Result<Option<Topic>>;
    fn save_topic(&mut self, topic: &Topic) -> Result<()>;
    /// Every topic, internal ones included.
    fn topic_ids(&self) -> Result<Vec<String>>;

    fn load_story(&self, topic_id: &str, id: &str) -> Result<Option<Story>>;
    /// Store a story and update the publication index.
    fn save_story(&mut self, story: &Story) -> Result<()>;
    /// Remove every artifact of a story and its index entry.
    fn delete_story(&mut self, topic_id: &str, id: &str) -> Result<()>;
    fn story_ids(&self, topic_id: &str) -> Result<Vec<String>>;

    fn load_user(&self, id: &str) -> Result<Option<User>>;
    fn save_user(&mut self, user: &User) -> Result<()>;
    /// Every user, expired ones included.
    fn user_ids(&self) -> Result<Vec<String>>;

    fn load_follower(&self, user_id: &str, id: &str) -> Result<Option<Follower>>;
    fn save_follower(&mut self, follower: &Follower) -> Result<()>;
    fn delete_follower(&mut self, user_id: &str, id: &str) -> Result<()>;
    fn follower_ids(&self, user_id: &str) -> Result<Vec<String>>;

    fn template(&self, id: &str) -> Result<Option<String>>;
    fn save_template(&mut self, id: &str, content: &str) -> Result<()>;
    fn template_ids(&self) -> Result<Vec<String>>;

    fn image(&self, id: &str) -> Result<Option<Vec<u8>>>;
    fn save_image(&mut self, id: &str, content: &[u8]) -> Result<()>;
    fn image_ids(&self) -> Result<Vec<String>>;

    /// Target of a short url id.
    fn url(&self, id: &str) -> Result<Option<String>>;
    fn save_url(&mut self, id: &str, url: &str) -> Result<()>;
    fn url_ids(&self) -> Result<Vec<String>>;

    /// Run a query. See [`crate::query`] for the semantics.
    fn story_set<'a>(&'a self, query: &StorySet) -> Result<Entries<'a>>;

    /// Rebuild the hit ranking used by [`crate::Order::Hits`].
    fn update_ranking(&mut self) -> Result<()>;
}

/// Which backend a source identifier selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    FlatFile,
    Memory,
    Sqlite,
}

const SQLITE_PREFIX: &str = "sqlite:";
const SQLITE_SUFFIXES: &[&str] = &[".db", ".sqlite", ".sqlite3"];

impl SourceKind {
    /// Classify a source identifier. `None` for unrecognized ones.
    pub fn detect(source: &str) -> Option<Self> {
        if source.ends_with(".json") {
            Some(SourceKind::Memory)
        } else if source.starts_with(SQLITE_PREFIX)
            || SQLITE_SUFFIXES.iter().any(|s| source.ends_with(s))
        {
            Some(SourceKind::Sqlite)
        } else if Path::new(source).is_absolute() {
            Some(SourceKind::FlatFile)
        } else {
            None
        }
    }
}

/// Open the backend a source identifier selects.
pub fn open(config: &StoreConfig) -> Result<Option<Box<dyn Backend>>> {
    let source = config.source.as_str();

    let backend: Box<dyn Backend> = match SourceKind::detect(source) {
        Some(SourceKind::Memory) => Box::new(MemBackend::open(source)),
        Some(SourceKind::Sqlite) => {
            let path = source.strip_prefix(SQLITE_PREFIX).unwrap_or(source);
            Box::new(SqliteBackend::open(path)?)
        }
        Some(SourceKind::FlatFile) => Box::new(FsBackend::open(source, config.locking.clone())),
        None => {
            tracing::debug!(source, "no backend for source");
            return Ok(None);
        }
    };

    tracing::debug!(backend = %backend.describe(), "opened backend");
    Ok(Some(backend))
}

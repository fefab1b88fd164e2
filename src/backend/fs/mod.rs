//! Flat-file backend.
//!
//! Layout under the root directory:
//!
//! ```text
//! topics/<topic>.M            topic metadata
//! topics/<topic>/<story>      raw content
//! topics/<topic>/<story>.M    story metadata
//! topics/<topic>/<story>.B    rendered body
//! topics/<topic>/<story>.A    abstract
//! topics/<topic>/<story>.H    hit counter
//! topics/.INDEX               publication index
//! topics/.top_ten             hit ranking
//! users/<user>
//! followers/<user>/<md5(follower)>
//! templates/<id>
//! images/<id>
//! urls/<id>                   short url target
//! ```
//!
//! Metadata files are `key: value` lines guarded by advisory locks. The
//! publication index is rewritten through a temporary file and published
//! with a rename, so readers always see a complete index.

mod lock;

pub use lock::{acquire, release, LockMode, LockPolicy};

use super::{Backend, Entries};
use crate::error::{Result, StoreError};
use crate::index::{rank_entries, Merge, StoryEntry};
use crate::query::{Catalog, Order, Scan, StorySet};
use crate::records::{Follower, Kind, Record, Story, StoryKind, Topic, User};
use md5::{Digest, Md5};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const SUBDIRS: &[&str] = &[
    "comments",
    "sids",
    "templates",
    "topics",
    "users",
    "followers",
    "urls",
    "images",
];

const INDEX: &str = ".INDEX";
const TOP_TEN: &str = ".top_ten";
const INDEX_LOCK: &str = ".INDEX.lock";

const META_SUFFIX: &str = ".M";

/// Story fields kept in sibling files instead of the metadata file.
const STORY_SIDECARS: &[(&str, &str)] = &[
    ("content", ""),
    ("body", ".B"),
    ("abstract", ".A"),
    ("hits", ".H"),
];

/// Encode metadata as `key: value` lines.
fn encode_meta(pairs: &[(&str, String)]) -> String {
    let mut out = String::new();
    for (key, value) in pairs {
        out.push_str(&key.replace('_', "-"));
        out.push_str(": ");
        out.push_str(&value.replace('\n', "\\n"));
        out.push('\n');
    }
    out
}

/// Decode `key: value` lines. Lines without a separator are ignored; a bare
/// `key:` is an empty value.
fn decode_meta(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let line = line.strip_suffix('\r').unwrap_or(line);
            let (key, value) = match line.split_once(": ") {
                Some(kv) => kv,
                None => (line.strip_suffix(':')?, ""),
            };
            Some((key.replace('-', "_"), value.replace("\\n", "\n")))
        })
        .collect()
}

fn follower_file_name(id: &str) -> String {
    hex::encode(Md5::digest(id.as_bytes()))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn is_not_found(err: &StoreError) -> bool {
    matches!(err, StoreError::Io(e) if e.kind() == io::ErrorKind::NotFound)
}

fn read_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(true);
    options
}

fn write_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(false);
    options
}

/// Regular, non-hidden file names in `dir`, sorted. A missing directory is
/// empty.
fn list_names(dir: &Path, suffix: Option<&str>) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        match suffix {
            Some(suffix) => {
                if let Some(stem) = name.strip_suffix(suffix) {
                    names.push(stem.to_string());
                }
            }
            None => names.push(name),
        }
    }

    names.sort();
    Ok(names)
}

/// Index lines read from an open file.
///
/// Read errors end the sequence; the error is kept for writers, which must
/// not publish a merge of a partially read index.
struct IndexLines<R> {
    lines: io::Lines<R>,
    error: Option<io::Error>,
}

impl<R: BufRead> IndexLines<R> {
    fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            error: None,
        }
    }

    fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }
}

impl<R: BufRead> Iterator for IndexLines<R> {
    type Item = StoryEntry;

    fn next(&mut self) -> Option<StoryEntry> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => return Some(StoryEntry::parse_line(&line)),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read index line");
                    self.error = Some(e);
                    return None;
                }
            }
        }
    }
}

/// A pending change to the publication index.
enum IndexChange<'a> {
    Upsert(StoryEntry),
    Remove { topic_id: &'a str, id: &'a str },
}

/// Flat-file backend rooted at a directory.
pub struct FsBackend {
    root: PathBuf,
    locking: LockPolicy,
}

impl FsBackend {
    pub fn open(root: impl Into<PathBuf>, locking: LockPolicy) -> Self {
        Self {
            root: root.into(),
            locking,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn topics_dir(&self) -> PathBuf {
        self.root.join("topics")
    }

    fn index_path(&self) -> PathBuf {
        self.topics_dir().join(INDEX)
    }

    fn top_ten_path(&self) -> PathBuf {
        self.topics_dir().join(TOP_TEN)
    }

    fn topic_meta_path(&self, id: &str) -> PathBuf {
        self.topics_dir().join(format!("{id}{META_SUFFIX}"))
    }

    fn story_path(&self, topic_id: &str, id: &str) -> PathBuf {
        self.topics_dir().join(topic_id).join(id)
    }

    fn follower_dir(&self, user_id: &str) -> PathBuf {
        self.root.join("followers").join(user_id)
    }

    fn follower_path(&self, user_id: &str, id: &str) -> PathBuf {
        self.follower_dir(user_id).join(follower_file_name(id))
    }

    /// Read a metadata file under a shared lock.
    ///
    /// Missing or unreadable files are `None`; only a lock timeout is an
    /// error.
    fn read_meta(&self, path: &Path) -> Result<Option<Vec<(String, String)>>> {
        let mut file = match acquire(path, &read_options(), LockMode::Shared, &self.locking) {
            Ok(file) => file,
            Err(e @ StoreError::LockTimeout(_)) => return Err(e),
            Err(e) => {
                if !is_not_found(&e) {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable metadata");
                }
                return Ok(None);
            }
        };

        let mut text = String::new();
        if let Err(e) = file.read_to_string(&mut text) {
            tracing::warn!(path = %path.display(), error = %e, "unreadable metadata");
            return Ok(None);
        }

        Ok(Some(decode_meta(&text)))
    }

    /// Rewrite a metadata file under an exclusive lock.
    fn write_meta(&self, path: &Path, pairs: &[(&str, String)]) -> Result<()> {
        let mut file = acquire(path, &write_options(), LockMode::Exclusive, &self.locking)?;
        file.set_len(0)?;
        file.write_all(encode_meta(pairs).as_bytes())?;
        Ok(())
    }

    fn load_meta<K: Kind>(&self, path: &Path, keys: &[(&str, &str)]) -> Result<Option<Record<K>>> {
        let Some(meta) = self.read_meta(path)? else {
            return Ok(None);
        };

        let mut pairs: Vec<(String, String)> = keys
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        pairs.extend(meta);

        Ok(Some(Record::from_persisted(pairs)))
    }

    /// Publish an index file. Runs with the index lock held.
    fn publish(&self, path: &Path, entries: impl Iterator<Item = StoryEntry>) -> Result<()> {
        let tmp = self.write_temp(path, entries)?;
        self.commit(path, &tmp)
    }

    /// Write entries to `<path>.new` and fsync it.
    fn write_temp(
        &self,
        path: &Path,
        entries: impl Iterator<Item = StoryEntry>,
    ) -> Result<PathBuf> {
        let tmp = with_suffix(path, ".new");
        let mut out = BufWriter::new(File::create(&tmp)?);

        for entry in entries {
            out.write_all(entry.to_line().as_bytes())?;
            out.write_all(b"\n")?;
        }

        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(tmp)
    }

    /// Keep the current file as `<path>.old`, then rename the temporary file
    /// over it.
    fn commit(&self, path: &Path, tmp: &Path) -> Result<()> {
        let old = with_suffix(path, ".old");

        match fs::remove_file(&old) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    path = %old.display(),
                    error = %e,
                    "failed to remove backup index"
                );
            }
        }

        if path.exists() {
            if let Err(e) = fs::hard_link(path, &old) {
                tracing::warn!(path = %old.display(), error = %e, "failed to keep backup index");
            }
        }

        fs::rename(tmp, path)?;
        Ok(())
    }

    fn index_lock(&self) -> Result<File> {
        acquire(
            &self.topics_dir().join(INDEX_LOCK),
            &write_options(),
            LockMode::Exclusive,
            &self.locking,
        )
    }

    /// Run `f` with the index lock held.
    fn locked<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let guard = self.index_lock()?;
        let result = f(self);
        release(&guard);
        result
    }

    /// Stream an index file through `change` and publish the result.
    /// Returns `false` when the file does not exist. Runs with the index lock
    /// held.
    fn rewrite(&self, path: &Path, change: &IndexChange<'_>) -> Result<bool> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let mut current = IndexLines::new(BufReader::new(file));
        let tmp = match change {
            IndexChange::Upsert(entry) => {
                self.write_temp(path, Merge::insert(current.by_ref(), entry.clone()))?
            }
            IndexChange::Remove { topic_id, id } => {
                self.write_temp(path, Merge::remove(current.by_ref(), topic_id, id))?
            }
        };

        if let Some(e) = current.take_error() {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        self.commit(path, &tmp)?;
        Ok(true)
    }

    /// Apply a change to the publication index, rebuilding it when missing.
    /// Removals also drop the story from the hit ranking. Runs with the index
    /// lock held.
    fn apply_index_change(&self, change: IndexChange<'_>) -> Result<()> {
        let path = self.index_path();

        if !self.rewrite(&path, &change)? {
            let skip = match &change {
                IndexChange::Remove { topic_id, id } => Some((*topic_id, *id)),
                IndexChange::Upsert(_) => None,
            };
            let entries = self.scan_entries(skip)?;
            tracing::debug!(entries = entries.len(), "rebuilt publication index");
            self.publish(&path, entries.into_iter())?;
        }

        if let IndexChange::Remove { .. } = change {
            self.rewrite(&self.top_ten_path(), &change)?;
        }
        Ok(())
    }

    /// Write the metadata file and the sidecars of a story.
    fn write_story(&self, story: &Story) -> Result<()> {
        let base = self.story_path(story.topic_id(), story.id());

        let meta: Vec<_> = story
            .persisted()
            .into_iter()
            .filter(|(field, _)| !STORY_SIDECARS.iter().any(|(f, _)| f == field))
            .collect();
        self.write_meta(&with_suffix(&base, META_SUFFIX), &meta)?;

        for (field, suffix) in STORY_SIDECARS {
            fs::write(with_suffix(&base, suffix), story.get(field)?.as_bytes())?;
        }
        Ok(())
    }

    fn remove_story_files(&self, topic_id: &str, id: &str) -> Result<()> {
        let base = self.story_path(topic_id, id);
        remove_if_exists(&with_suffix(&base, META_SUFFIX))?;
        for (_, suffix) in STORY_SIDECARS {
            remove_if_exists(&with_suffix(&base, suffix))?;
        }
        Ok(())
    }

    /// Index entries for every story on disk, in index order.
    fn scan_entries(&self, skip: Option<(&str, &str)>) -> Result<Vec<StoryEntry>> {
        let mut entries = Vec::new();

        for topic_id in self.topic_ids()? {
            for id in self.story_ids(&topic_id)? {
                if skip == Some((topic_id.as_str(), id.as_str())) {
                    continue;
                }
                if let Some(story) = self.load_story(&topic_id, &id)? {
                    entries.push(StoryEntry::from_story(&story));
                }
            }
        }

        crate::index::sort_entries(&mut entries);
        Ok(entries)
    }

    fn read_index(&self, path: &Path) -> Result<Option<IndexLines<BufReader<File>>>> {
        match acquire(path, &read_options(), LockMode::Shared, &self.locking) {
            Ok(file) => Ok(Some(IndexLines::new(BufReader::new(file)))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn read_text(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl Catalog for FsBackend {
    fn topic_is_public(&self, topic_id: &str) -> bool {
        matches!(self.load_topic(topic_id), Ok(Some(topic)) if !topic.is_internal())
    }

    fn story_content(&self, topic_id: &str, id: &str) -> Option<String> {
        read_text(&self.story_path(topic_id, id)).ok().flatten()
    }
}

impl Backend for FsBackend {
    fn describe(&self) -> String {
        format!("FS ({})", self.root.display())
    }

    fn create(&mut self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        for dir in SUBDIRS {
            fs::create_dir_all(self.root.join(dir))?;
        }

        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.index_path())?;

        tracing::info!(root = %self.root.display(), "initialized flat-file store");
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn load_topic(&self, id: &str) -> Result<Option<Topic>> {
        self.load_meta(&self.topic_meta_path(id), &[("id", id)])
    }

    fn save_topic(&mut self, topic: &Topic) -> Result<()> {
        let dir = self.topics_dir().join(topic.id());
        if let Err(e) = fs::create_dir_all(&dir) {
            tracing::warn!(path = %dir.display(), error = %e, "failed to create topic directory");
        }
        self.write_meta(&self.topic_meta_path(topic.id()), &topic.persisted())
    }

    fn topic_ids(&self) -> Result<Vec<String>> {
        list_names(&self.topics_dir(), Some(META_SUFFIX))
    }

    fn load_story(&self, topic_id: &str, id: &str) -> Result<Option<Story>> {
        let base = self.story_path(topic_id, id);
        let keys = [("topic_id", topic_id), ("id", id)];
        let meta = with_suffix(&base, META_SUFFIX);
        let Some(mut story) = self.load_meta::<StoryKind>(&meta, &keys)? else {
            return Ok(None);
        };

        for (field, suffix) in STORY_SIDECARS {
            let text = read_text(&with_suffix(&base, suffix))?.unwrap_or_default();
            story.set(field, text)?;
        }

        Ok(Some(story))
    }

    fn save_story(&mut self, story: &Story) -> Result<()> {
        self.locked(|store| {
            store.write_story(story)?;
            store.apply_index_change(IndexChange::Upsert(StoryEntry::from_story(story)))
        })
    }

    fn delete_story(&mut self, topic_id: &str, id: &str) -> Result<()> {
        self.locked(|store| {
            store.apply_index_change(IndexChange::Remove { topic_id, id })?;
            store.remove_story_files(topic_id, id)
        })
    }

    fn story_ids(&self, topic_id: &str) -> Result<Vec<String>> {
        list_names(&self.topics_dir().join(topic_id), Some(META_SUFFIX))
    }

    fn load_user(&self, id: &str) -> Result<Option<User>> {
        self.load_meta(&self.root.join("users").join(id), &[("id", id)])
    }

    fn save_user(&mut self, user: &User) -> Result<()> {
        self.write_meta(&self.root.join("users").join(user.id()), &user.persisted())
    }

    fn user_ids(&self) -> Result<Vec<String>> {
        list_names(&self.root.join("users"), None)
    }

    fn load_follower(&self, user_id: &str, id: &str) -> Result<Option<Follower>> {
        self.load_meta(&self.follower_path(user_id, id), &[("user_id", user_id), ("id", id)])
    }

    fn save_follower(&mut self, follower: &Follower) -> Result<()> {
        let dir = self.follower_dir(follower.user_id());
        if let Err(e) = fs::create_dir_all(&dir) {
            tracing::warn!(
                path = %dir.display(),
                error = %e,
                "failed to create follower directory"
            );
        }
        self.write_meta(
            &self.follower_path(follower.user_id(), follower.id()),
            &follower.persisted(),
        )
    }

    fn delete_follower(&mut self, user_id: &str, id: &str) -> Result<()> {
        remove_if_exists(&self.follower_path(user_id, id))
    }

    fn follower_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let dir = self.follower_dir(user_id);
        let mut ids = Vec::new();

        for name in list_names(&dir, None)? {
            let Some(meta) = self.read_meta(&dir.join(&name))? else {
                continue;
            };
            if let Some((_, id)) = meta.into_iter().find(|(k, _)| k == "id") {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }

    fn template(&self, id: &str) -> Result<Option<String>> {
        read_text(&self.root.join("templates").join(id))
    }

    fn save_template(&mut self, id: &str, content: &str) -> Result<()> {
        fs::write(self.root.join("templates").join(id), content)?;
        Ok(())
    }

    fn template_ids(&self) -> Result<Vec<String>> {
        list_names(&self.root.join("templates"), None)
    }

    fn image(&self, id: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.root.join("images").join(id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_image(&mut self, id: &str, content: &[u8]) -> Result<()> {
        fs::write(self.root.join("images").join(id), content)?;
        Ok(())
    }

    fn image_ids(&self) -> Result<Vec<String>> {
        list_names(&self.root.join("images"), None)
    }

    fn url(&self, id: &str) -> Result<Option<String>> {
        let text = read_text(&self.root.join("urls").join(id))?;
        Ok(text.map(|url| url.trim_end().to_string()))
    }

    fn save_url(&mut self, id: &str, url: &str) -> Result<()> {
        let dir = self.root.join("urls");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(id), format!("{url}\n"))?;
        Ok(())
    }

    fn url_ids(&self) -> Result<Vec<String>> {
        list_names(&self.root.join("urls"), None)
    }

    fn story_set<'a>(&'a self, query: &StorySet) -> Result<Entries<'a>> {
        let path = match query.order {
            Order::Date => self.index_path(),
            Order::Hits => self.top_ten_path(),
        };

        match self.read_index(&path)? {
            Some(lines) => Ok(Box::new(Scan::new(lines, query, self))),
            None => {
                tracing::debug!(path = %path.display(), "no index to scan");
                Ok(Box::new(std::iter::empty()))
            }
        }
    }

    fn update_ranking(&mut self) -> Result<()> {
        self.locked(|store| {
            let Some(mut lines) = store.read_index(&store.index_path())? else {
                return Ok(());
            };

            let mut ranked = Vec::new();
            for entry in lines.by_ref() {
                let hits_path = with_suffix(&store.story_path(&entry.topic_id, &entry.id), ".H");
                let hits = read_text(&hits_path)?
                    .and_then(|h| h.trim().parse().ok())
                    .unwrap_or(0u64);
                ranked.push((hits, entry));
            }
            if let Some(e) = lines.take_error() {
                return Err(e.into());
            }

            let ranked = rank_entries(ranked);
            tracing::debug!(entries = ranked.len(), "rebuilt hit ranking");
            store.publish(&store.top_ten_path(), ranked.into_iter())
        })
    }
}

//! The store front.
//!
//! [`Store`] wraps whichever backend the source selects and adds what every
//! backend shares: identifier validation, story defaults and automatic ids,
//! visibility filters on listings, url shortening, bulk copy and the flush
//! lifecycle.
//!
//! Ordinary lookups and saves never fail: storage errors are logged and
//! reported as `None` / `false`. Lifecycle operations return [`Result`].

use crate::backend::{self, Backend, Entries, LockPolicy};
use crate::error::{Result, StoreError};
use crate::query::StorySet;
use crate::records::{FieldValue, Follower, Story, Topic, User};
use crate::types::{slugify, valid_id, valid_resource_id, valid_tag, Date};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Source identifier: a `.json` snapshot, a SQLite database
    /// (`sqlite:` prefix or `.db` / `.sqlite` / `.sqlite3` suffix) or an
    /// absolute directory for the flat-file backend.
    pub source: String,

    /// Lock retry behaviour of the flat-file backend.
    pub locking: LockPolicy,

    /// How often [`Store::timed_flush`] actually flushes.
    pub flush_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            locking: LockPolicy::default(),
            flush_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl StoreConfig {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }
}

/// Templates installed by [`Store::create`] when missing.
const DEFAULT_TEMPLATES: &[(&str, &str)] = &[
    ("cfg_site_name", "Welcome"),
    ("cfg_slogan", "A newly created site"),
    ("cfg_index_num", "10"),
    ("cfg_rss_num", "10"),
    ("cfg_topic_num", "10"),
    ("cfg_copyright", ""),
    ("cfg_host_name", "FILLME"),
];

/// Site-wide lists of topics, filled with the first topic on create.
const TOPIC_LIST_TEMPLATES: &[&str] =
    &["cfg_index_topics", "cfg_rss_topics", "cfg_main_menu_topics"];

const DEFAULT_USER: &str = "admin";
const DEFAULT_FORMAT: &str = "raw_html";

/// `https://site/s/1f` and `/s/1f` both name the short url `1f`.
fn last_segment(short: &str) -> &str {
    short.rsplit('/').next().unwrap_or(short)
}

/// Content store over one backend.
pub struct Store {
    config: StoreConfig,
    backend: Box<dyn Backend>,
    logged_user: String,
    last_flush: Instant,
    closed: bool,
}

impl Store {
    /// Open the backend selected by `config.source`.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let backend = backend::open(&config)?
            .ok_or_else(|| StoreError::UnsupportedSource(config.source.clone()))?;
        Ok(Self::with_backend(backend, config))
    }

    /// Wrap an already opened backend.
    pub fn with_backend(backend: Box<dyn Backend>, config: StoreConfig) -> Self {
        Self {
            config,
            backend,
            logged_user: String::new(),
            last_flush: Instant::now(),
            closed: false,
        }
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn logged_user(&self) -> &str {
        &self.logged_user
    }

    /// Author assigned to stories saved without one.
    pub fn set_logged_user(&mut self, user: impl Into<String>) {
        self.logged_user = user.into();
    }

    /// Turn a storage failure into "absent", logging it.
    fn quiet<T>(&self, op: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(
                    op,
                    backend = %self.backend.describe(),
                    error = %e,
                    "storage operation failed"
                );
                None
            }
        }
    }

    fn quiet_ids(&self, op: &str, result: Result<Vec<String>>) -> Vec<String> {
        self.quiet(op, result).unwrap_or_default()
    }

    // --- Topics ---

    pub fn topic(&self, id: &str) -> Option<Topic> {
        if !valid_id(id) {
            return None;
        }
        self.quiet("load_topic", self.backend.load_topic(id)).flatten()
    }

    pub fn save_topic(&mut self, topic: Topic) -> Option<Topic> {
        if !valid_id(topic.id()) {
            tracing::debug!(id = topic.id(), "refusing topic with invalid id");
            return None;
        }
        let result = self.backend.save_topic(&topic);
        self.quiet("save_topic", result).map(|()| topic)
    }

    /// Topic ids; internal topics only when `private`.
    pub fn topics(&self, private: bool) -> Vec<String> {
        let ids = self.quiet_ids("topic_ids", self.backend.topic_ids());
        if private {
            return ids;
        }
        ids.into_iter()
            .filter(|id| self.topic(id).is_some_and(|t| !t.is_internal()))
            .collect()
    }

    // --- Stories ---

    pub fn story(&self, topic_id: &str, id: &str) -> Option<Story> {
        if !valid_id(topic_id) || !valid_id(id) {
            return None;
        }
        self.quiet("load_story", self.backend.load_story(topic_id, id))
            .flatten()
    }

    /// Save a story into an existing topic.
    ///
    /// Assigns an id when missing, fills defaults, stamps `ctime` / `mtime`
    /// and bumps `revision`. Returns the story as stored.
    pub fn save_story(&mut self, mut story: Story) -> Option<Story> {
        if self.topic(story.topic_id()).is_none() {
            tracing::debug!(topic = story.topic_id(), "refusing story for unknown topic");
            return None;
        }

        if story.id().is_empty() {
            let id = self.new_story_id(&story);
            story.put("id", FieldValue::Text(id));
        }

        if !valid_id(story.id()) {
            tracing::debug!(id = story.id(), "refusing story with invalid id");
            return None;
        }

        if let Some(tag) = story.tags().iter().find(|t| !valid_tag(t)) {
            tracing::debug!(id = story.id(), tag = %tag.escape_debug(), "refusing story tag");
            return None;
        }

        self.fill_story_defaults(&mut story);

        let now = Date::now();
        if !story.is_set("ctime") {
            let ctime = if now.as_str() < story.date() {
                now.to_string()
            } else {
                story.date().to_string()
            };
            story.put("ctime", FieldValue::Text(ctime));
        }
        story.put("mtime", FieldValue::Text(now.to_string()));

        let revision = story.revision() + 1;
        story.put("revision", FieldValue::Text(revision.to_string()));

        let result = self.backend.save_story(&story);
        self.quiet("save_story", result).map(|()| story)
    }

    /// Slug of the title, or a date-based id, made unique within the topic.
    fn new_story_id(&self, story: &Story) -> String {
        let title = story.get("title").map(|t| slugify(&t)).unwrap_or_default();

        let base = if title.is_empty() {
            let today = Date::now();
            let n: u64 = today.as_str()[2..].parse().unwrap_or(0);
            format!("i{n:x}")
        } else {
            title
        };

        let mut id = base.clone();
        let mut seq = 1;
        while self.story(story.topic_id(), &id).is_some() {
            seq += 1;
            id = format!("{base}-{seq}");
        }
        id
    }

    fn fill_story_defaults(&self, story: &mut Story) {
        if !story.is_set("date") {
            story.put("date", FieldValue::Text(Date::now().to_string()));
        }

        if !story.is_set("format") {
            let format = self.template_or("cfg_default_format", DEFAULT_FORMAT);
            story.put("format", FieldValue::Text(format));
        }

        if !story.is_set("full_story") {
            let full = self.template_or("cfg_full_story", "0");
            story.put("full_story", FieldValue::Text(full));
        }

        if !story.is_set("revision") {
            story.put("revision", FieldValue::Text("0".into()));
        }

        if !story.is_set("userid") {
            let user = if self.logged_user.is_empty() {
                self.template_or("cfg_main_user", DEFAULT_USER)
            } else {
                self.logged_user.clone()
            };
            story.put("userid", FieldValue::Text(user));
        }
    }

    fn template_or(&self, id: &str, default: &str) -> String {
        let value = self.template(id);
        if value.is_empty() {
            default.to_string()
        } else {
            value
        }
    }

    /// Delete a story and its index entry.
    pub fn delete_story(&mut self, story: &Story) -> bool {
        let (topic_id, id) = (story.topic_id(), story.id());
        if !valid_id(topic_id) || !valid_id(id) {
            return false;
        }
        let result = self.backend.delete_story(topic_id, id);
        self.quiet("delete_story", result).is_some()
    }

    pub fn stories(&self, topic_id: &str) -> Vec<String> {
        if !valid_id(topic_id) {
            return Vec::new();
        }
        self.quiet_ids("story_ids", self.backend.story_ids(topic_id))
    }

    // --- Users ---

    pub fn user(&self, id: &str) -> Option<User> {
        if !valid_id(id) {
            return None;
        }
        self.quiet("load_user", self.backend.load_user(id)).flatten()
    }

    pub fn save_user(&mut self, user: User) -> Option<User> {
        if !valid_id(user.id()) {
            tracing::debug!(id = user.id(), "refusing user with invalid id");
            return None;
        }
        let result = self.backend.save_user(&user);
        self.quiet("save_user", result).map(|()| user)
    }

    /// User ids; expired accounts only when `private`.
    pub fn users(&self, private: bool) -> Vec<String> {
        let ids = self.quiet_ids("user_ids", self.backend.user_ids());
        if private {
            return ids;
        }

        let today = Date::now();
        ids.into_iter()
            .filter(|id| {
                self.user(id).is_some_and(|u| {
                    let xdate = u.xdate();
                    xdate.is_empty() || xdate > today.as_str()
                })
            })
            .collect()
    }

    // --- Followers ---

    pub fn follower(&self, user_id: &str, id: &str) -> Option<Follower> {
        if !valid_id(user_id) || id.is_empty() {
            return None;
        }
        self.quiet("load_follower", self.backend.load_follower(user_id, id))
            .flatten()
    }

    /// Save a follower. Both `user_id` and `id` are required.
    pub fn save_follower(&mut self, follower: Follower) -> Result<Option<Follower>> {
        if follower.user_id().is_empty() {
            return Err(StoreError::MissingField {
                kind: "follower",
                field: "user_id",
            });
        }
        if follower.id().is_empty() {
            return Err(StoreError::MissingField {
                kind: "follower",
                field: "id",
            });
        }
        if !valid_id(follower.user_id()) {
            return Ok(None);
        }

        let result = self.backend.save_follower(&follower);
        Ok(self.quiet("save_follower", result).map(|()| follower))
    }

    pub fn delete_follower(&mut self, follower: &Follower) -> bool {
        let (user_id, id) = (follower.user_id(), follower.id());
        if !valid_id(user_id) || id.is_empty() {
            return false;
        }
        let result = self.backend.delete_follower(user_id, id);
        self.quiet("delete_follower", result).is_some()
    }

    pub fn followers(&self, user_id: &str) -> Vec<String> {
        if !valid_id(user_id) {
            return Vec::new();
        }
        self.quiet_ids("follower_ids", self.backend.follower_ids(user_id))
    }

    // --- Templates ---

    /// Template text, empty when missing.
    pub fn template(&self, id: &str) -> String {
        if !valid_resource_id(id) {
            return String::new();
        }
        self.quiet("template", self.backend.template(id))
            .flatten()
            .unwrap_or_default()
    }

    pub fn save_template(&mut self, id: &str, content: &str) -> bool {
        if !valid_resource_id(id) {
            return false;
        }
        let result = self.backend.save_template(id, content);
        self.quiet("save_template", result).is_some()
    }

    pub fn templates(&self) -> Vec<String> {
        self.quiet_ids("template_ids", self.backend.template_ids())
    }

    // --- Images ---

    pub fn image(&self, id: &str) -> Option<Vec<u8>> {
        if !valid_resource_id(id) {
            return None;
        }
        self.quiet("image", self.backend.image(id)).flatten()
    }

    pub fn save_image(&mut self, id: &str, content: &[u8]) -> bool {
        if !valid_resource_id(id) {
            return false;
        }
        let result = self.backend.save_image(id, content);
        self.quiet("save_image", result).is_some()
    }

    pub fn images(&self) -> Vec<String> {
        self.quiet_ids("image_ids", self.backend.image_ids())
    }

    // --- Short urls ---

    /// Target of a short url. Accepts the id or any path ending in it; empty
    /// when unknown.
    pub fn unshorten_url(&self, short: &str) -> String {
        let id = last_segment(short);
        if !valid_resource_id(id) {
            return String::new();
        }
        self.quiet("url", self.backend.url(id))
            .flatten()
            .unwrap_or_default()
    }

    pub fn save_url(&mut self, short: &str, url: &str) -> bool {
        let id = last_segment(short);
        if !valid_resource_id(id) || url.contains(['\n', '\r']) {
            return false;
        }
        let result = self.backend.save_url(id, url);
        self.quiet("save_url", result).is_some()
    }

    /// Short id for `url`, reusing an existing one. New ids count up in hex.
    pub fn shorten_url(&mut self, url: &str) -> Option<String> {
        if url.is_empty() {
            return None;
        }

        let ids = self.urls();
        if let Some(id) = ids.iter().find(|id| self.unshorten_url(id) == url) {
            return Some(id.clone());
        }

        let mut n = ids.len() + 1;
        let mut id = format!("{n:x}");
        while ids.contains(&id) {
            n += 1;
            id = format!("{n:x}");
        }

        self.save_url(&id, url).then_some(id)
    }

    pub fn urls(&self) -> Vec<String> {
        self.quiet_ids("url_ids", self.backend.url_ids())
    }

    // --- Queries ---

    /// Lazily run a story set query. A failing backend yields nothing.
    pub fn story_set(&self, query: &StorySet) -> Entries<'_> {
        self.quiet("story_set", self.backend.story_set(query))
            .unwrap_or_else(|| Box::new(std::iter::empty()))
    }

    /// Tag to `(topic_id, story_id)` pairs over the visible (or all) stories.
    pub fn tags(&self, private: bool) -> BTreeMap<String, Vec<(String, String)>> {
        let mut tags: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();

        for entry in self.story_set(&StorySet::new().private(private)) {
            for tag in &entry.tags {
                tags.entry(tag.clone())
                    .or_default()
                    .push((entry.topic_id.clone(), entry.id.clone()));
            }
        }

        tags
    }

    // --- Lifecycle ---

    /// Initialize the store: storage layout, default configuration
    /// templates, an optional first topic and a first user if there is none.
    pub fn create(&mut self, main_user: Option<&str>, topic: Option<&str>) -> Result<()> {
        let uid = main_user.unwrap_or(DEFAULT_USER);
        if !valid_id(uid) {
            return Err(StoreError::InvalidId(uid.to_string()));
        }
        if let Some(topic) = topic {
            if !valid_id(topic) {
                return Err(StoreError::InvalidId(topic.to_string()));
            }
        }

        self.backend.create()?;

        let topic_list = topic.unwrap_or("");
        let mut defaults: Vec<(&str, &str)> = DEFAULT_TEMPLATES.to_vec();
        defaults.extend(TOPIC_LIST_TEMPLATES.iter().map(|id| (*id, topic_list)));
        defaults.push(("cfg_main_user", uid));

        for (id, content) in defaults {
            if self.backend.template(id)?.unwrap_or_default().is_empty() {
                self.backend.save_template(id, content)?;
            }
        }

        if let Some(topic) = topic {
            if self.backend.load_topic(topic)?.is_none() {
                let record = Topic::with_fields([("id", topic), ("name", topic)])?;
                self.backend.save_topic(&record)?;
            }
        }

        if self.backend.user_ids()?.is_empty() {
            let email = format!("{uid}@localhost");
            let user =
                User::with_fields([("id", uid), ("username", uid), ("email", email.as_str())])?;
            self.backend.save_user(&user)?;
        }

        tracing::info!(backend = %self.backend.describe(), user = uid, "created store");
        Ok(())
    }

    /// Copy every record, template, image and short url of `other` into this
    /// store.
    ///
    /// Records are stored as they are, so revisions and timestamps survive.
    pub fn copy(&mut self, other: &Store) -> Result<()> {
        let from = other.backend.as_ref();
        self.backend.create()?;

        let mut stories = 0usize;
        for topic_id in from.topic_ids()? {
            let Some(topic) = from.load_topic(&topic_id)? else {
                continue;
            };
            tracing::debug!(topic = %topic_id, "copying topic");
            self.backend.save_topic(&topic)?;

            for id in from.story_ids(&topic_id)? {
                if let Some(story) = from.load_story(&topic_id, &id)? {
                    self.backend.save_story(&story)?;
                    stories += 1;
                }
            }
        }

        for user_id in from.user_ids()? {
            let Some(user) = from.load_user(&user_id)? else {
                continue;
            };
            self.backend.save_user(&user)?;

            for id in from.follower_ids(&user_id)? {
                if let Some(follower) = from.load_follower(&user_id, &id)? {
                    self.backend.save_follower(&follower)?;
                }
            }
        }

        for id in from.template_ids()? {
            if let Some(content) = from.template(&id)? {
                self.backend.save_template(&id, &content)?;
            }
        }

        for id in from.image_ids()? {
            if let Some(content) = from.image(&id)? {
                self.backend.save_image(&id, &content)?;
            }
        }

        for id in from.url_ids()? {
            if let Some(url) = from.url(&id)? {
                self.backend.save_url(&id, &url)?;
            }
        }

        self.backend.update_ranking()?;
        self.flush()?;

        tracing::info!(
            from = %from.describe(),
            to = %self.backend.describe(),
            stories,
            "copied store"
        );
        Ok(())
    }

    /// Rebuild the hit ranking used by hit-ordered queries.
    pub fn rank_by_hits(&mut self) -> Result<()> {
        self.backend.update_ranking()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.backend.flush()?;
        self.last_flush = Instant::now();
        tracing::info!(backend = %self.backend.describe(), "flushed");
        Ok(())
    }

    /// Flush if `flush_interval` has elapsed since the last flush. Returns
    /// the time left until the next one.
    pub fn timed_flush(&mut self) -> Result<Duration> {
        let elapsed = self.last_flush.elapsed();
        if elapsed >= self.config.flush_interval {
            self.flush()?;
            return Ok(self.config.flush_interval);
        }
        Ok(self.config.flush_interval - elapsed)
    }

    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.backend.close()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.backend.flush() {
            tracing::warn!(backend = %self.backend.describe(), error = %e, "flush on drop failed");
        }
    }
}

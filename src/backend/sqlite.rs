//! Relational backend on SQLite.
//!
//! One table per record kind keyed by its natural key, plus a `tags` join
//! table rebuilt on every story save. Writes run inside an implicit
//! transaction that [`Backend::flush`] commits.
//!
//! Story sets are read a page at a time. Each page resumes after the sort key
//! of the last row of the previous one, so no statement outlives a page.

use super::{Backend, Entries};
use crate::error::Result;
use crate::index::StoryEntry;
use crate::query::{contains_ignore_case, Order, StorySet, Window};
use crate::records::{
    split_list, Follower, FollowerKind, Kind, Record, Story, StoryKind, Topic, TopicKind, User,
    UserKind,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Params};
use std::collections::VecDeque;

/// Rows fetched per story set page.
const PAGE_SIZE: usize = 64;

/// Sort expressions. Undated stories sort as the zero date.
const SORT_DATE: &str = "COALESCE(NULLIF(date, ''), '00000000000000')";
const SORT_HITS: &str = "COALESCE(CAST(hits AS INTEGER), 0)";

fn column_list<K: Kind>() -> String {
    K::FIELDS
        .iter()
        .map(|f| format!("\"{f}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

fn create_table_sql<K: Kind>(table: &str, key: &str) -> String {
    let columns = K::FIELDS
        .iter()
        .map(|f| format!("\"{f}\" TEXT"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {table} ({columns}, PRIMARY KEY ({key}));")
}

fn schema_sql() -> String {
    [
        create_table_sql::<TopicKind>("topics", "id"),
        create_table_sql::<StoryKind>("stories", "topic_id, id"),
        create_table_sql::<UserKind>("users", "id"),
        create_table_sql::<FollowerKind>("followers", "user_id, id"),
        "CREATE TABLE IF NOT EXISTS templates (id TEXT PRIMARY KEY, content TEXT);".to_string(),
        "CREATE TABLE IF NOT EXISTS images (id TEXT PRIMARY KEY, content BLOB);".to_string(),
        "CREATE TABLE IF NOT EXISTS urls (id TEXT PRIMARY KEY, url TEXT);".to_string(),
        "CREATE TABLE IF NOT EXISTS tags \
         (topic_id TEXT NOT NULL, id TEXT NOT NULL, tag TEXT NOT NULL);"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS stories_by_date ON stories (date);".to_string(),
        "CREATE INDEX IF NOT EXISTS tags_by_tag ON tags (tag);".to_string(),
        "CREATE INDEX IF NOT EXISTS tags_by_story ON tags (topic_id, id);".to_string(),
    ]
    .join("\n")
}

/// Filtering SQL and bound parameters for a story set, without ordering.
///
/// Content matching, offset, limit and the deadline are applied while
/// reading rows.
fn story_set_sql(query: &StorySet) -> (String, Vec<String>) {
    let content = if query.content.is_some() { "content" } else { "NULL" };
    let mut sql = format!(
        "SELECT topic_id, id, {SORT_DATE}, tags, udate, {content}, {SORT_HITS} \
         FROM stories WHERE 1 = 1"
    );
    let mut args = Vec::new();

    if let Some(topics) = &query.topics {
        if topics.is_empty() {
            sql.push_str(" AND 0");
        } else {
            let marks = vec!["?"; topics.len()].join(", ");
            sql.push_str(&format!(" AND topic_id IN ({marks})"));
            args.extend(topics.iter().cloned());
        }
    }

    if let Some(to) = &query.to {
        sql.push_str(" AND date <= ?");
        args.push(to.to_string());
    }

    if let Some(from) = &query.from {
        sql.push_str(" AND date > ?");
        args.push(from.to_string());
    }

    if !query.private {
        let today = query.reference_date().to_string();
        sql.push_str(" AND date <= ?");
        args.push(today.clone());
        sql.push_str(" AND (udate IS NULL OR udate = '' OR udate >= ?)");
        args.push(today);
        sql.push_str(
            " AND topic_id IN (SELECT id FROM topics WHERE internal IS NULL OR internal != '1')",
        );
    }

    for tag in &query.tags {
        let (negated, tag) = match tag.strip_prefix('!') {
            Some(tag) => (true, tag),
            None => (false, tag.as_str()),
        };
        sql.push_str(if negated { " AND NOT EXISTS" } else { " AND EXISTS" });
        sql.push_str(
            " (SELECT 1 FROM tags WHERE tags.topic_id = stories.topic_id \
             AND tags.id = stories.id AND tags.tag = ?)",
        );
        args.push(tag.to_string());
    }

    (sql, args)
}

/// One page of `filter` in `order`, starting after a sort key when `resume`
/// is set. The key is bound after the filter parameters.
fn page_sql(filter: &str, order: Order, resume: bool) -> String {
    let key: &[&str] = match order {
        Order::Date => &[SORT_DATE, "topic_id", "id"],
        Order::Hits => &[SORT_HITS, SORT_DATE, "topic_id", "id"],
    };

    let mut sql = filter.to_string();
    if resume {
        let marks = vec!["?"; key.len()].join(", ");
        sql.push_str(&format!(" AND ({}) < ({marks})", key.join(", ")));
    }

    let order_by = key
        .iter()
        .map(|column| format!("{column} DESC"))
        .collect::<Vec<_>>()
        .join(", ");
    sql.push_str(&format!(" ORDER BY {order_by} LIMIT {PAGE_SIZE}"));
    sql
}

/// A fetched row: its index entry and, when the query matches content, the
/// raw content.
type Row = (StoryEntry, Option<String>);

/// Lazy story set over keyset-paged queries.
struct Pages<'a> {
    conn: &'a Connection,
    filter: String,
    args: Vec<Value>,
    order: Order,
    needle: Option<String>,
    window: Window,
    rows: VecDeque<Row>,
    /// Sort key of the last fetched row.
    resume: Option<Vec<Value>>,
    last_page: bool,
    finished: bool,
}

impl<'a> Pages<'a> {
    fn new(conn: &'a Connection, query: &StorySet) -> Self {
        let (filter, args) = story_set_sql(query);
        tracing::debug!(%filter, ?args, "story set query");

        Self {
            conn,
            filter,
            args: args.into_iter().map(Value::Text).collect(),
            order: query.order,
            needle: query.content.as_ref().map(|c| c.to_lowercase()),
            window: Window::new(query),
            rows: VecDeque::new(),
            resume: None,
            last_page: false,
            finished: false,
        }
    }

    fn fetch(&mut self) -> Result<()> {
        let conn = self.conn;
        let sql = page_sql(&self.filter, self.order, self.resume.is_some());
        let mut args = self.args.clone();
        args.extend(self.resume.take().unwrap_or_default());

        let mut stmt = conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params_from_iter(args.iter()))?;
        let mut fetched = 0;

        while let Some(row) = rows.next()? {
            fetched += 1;

            let tags: Option<String> = row.get(3)?;
            let udate: Option<String> = row.get(4)?;
            let entry = StoryEntry {
                topic_id: row.get(0)?,
                id: row.get(1)?,
                date: row.get(2)?,
                tags: split_list(tags.as_deref().unwrap_or("")),
                udate: udate.unwrap_or_default(),
            };
            let hits: i64 = row.get(6)?;

            let mut key = Vec::with_capacity(4);
            if self.order == Order::Hits {
                key.push(Value::Integer(hits));
            }
            key.push(Value::Text(entry.date.clone()));
            key.push(Value::Text(entry.topic_id.clone()));
            key.push(Value::Text(entry.id.clone()));
            self.resume = Some(key);

            self.rows.push_back((entry, row.get(5)?));
        }

        if fetched < PAGE_SIZE {
            self.last_page = true;
        }
        Ok(())
    }
}

impl Iterator for Pages<'_> {
    type Item = StoryEntry;

    fn next(&mut self) -> Option<StoryEntry> {
        while !self.finished {
            if self.window.exhausted() {
                break;
            }

            let Some((entry, content)) = self.rows.pop_front() else {
                if self.last_page {
                    break;
                }
                if let Err(e) = self.fetch() {
                    tracing::warn!(error = %e, "story set page failed");
                    break;
                }
                continue;
            };

            if let Some(needle) = &self.needle {
                if !contains_ignore_case(content.as_deref().unwrap_or(""), needle) {
                    continue;
                }
            }

            if self.window.accept() {
                return Some(entry);
            }
        }

        self.finished = true;
        self.rows.clear();
        None
    }
}

/// SQLite-backed store.
pub struct SqliteBackend {
    conn: Connection,
    path: String,
}

impl SqliteBackend {
    /// Open (or create) a database file and make sure the schema exists.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let backend = Self {
            conn,
            path: path.to_string(),
        };
        backend.ensure_schema()?;
        Ok(backend)
    }

    /// A private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let backend = Self {
            conn: Connection::open_in_memory()?,
            path: ":memory:".to_string(),
        };
        backend.ensure_schema()?;
        Ok(backend)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(&schema_sql())?;
        self.add_missing_columns::<TopicKind>("topics")?;
        self.add_missing_columns::<StoryKind>("stories")?;
        self.add_missing_columns::<UserKind>("users")?;
        self.add_missing_columns::<FollowerKind>("followers")?;
        Ok(())
    }

    /// Add columns for fields a database created by an older schema lacks.
    fn add_missing_columns<K: Kind>(&self, table: &str) -> Result<()> {
        let existing = self.ids(&format!("SELECT name FROM pragma_table_info('{table}')"), [])?;

        for field in K::FIELDS {
            if !existing.iter().any(|c| c.as_str() == *field) {
                self.conn
                    .execute_batch(&format!("ALTER TABLE {table} ADD COLUMN \"{field}\" TEXT;"))?;
                tracing::info!(table, column = *field, "added column");
            }
        }
        Ok(())
    }

    /// Start the implicit write transaction if none is open.
    fn begin_write(&self) -> Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    fn load_record<K: Kind>(
        &self,
        table: &str,
        cond: &str,
        params: impl Params,
    ) -> Result<Option<Record<K>>> {
        let sql = format!("SELECT {} FROM {table} WHERE {cond}", column_list::<K>());
        let mut stmt = self.conn.prepare_cached(&sql)?;

        let pairs = stmt
            .query_row(params, |row| {
                let mut pairs = Vec::with_capacity(K::FIELDS.len());
                for (i, field) in K::FIELDS.iter().enumerate() {
                    if let Some(value) = row.get::<_, Option<String>>(i)? {
                        pairs.push((*field, value));
                    }
                }
                Ok(pairs)
            })
            .optional()?;

        Ok(pairs.map(Record::from_persisted))
    }

    fn save_record<K: Kind>(&self, table: &str, record: &Record<K>) -> Result<()> {
        let marks = vec!["?"; K::FIELDS.len()].join(", ");
        let sql = format!(
            "REPLACE INTO {table} ({}) VALUES ({marks})",
            column_list::<K>()
        );
        let values: Vec<String> = record.scalars().into_iter().map(|(_, v)| v).collect();

        self.begin_write()?;
        self.conn
            .prepare_cached(&sql)?
            .execute(params_from_iter(values.iter()))?;
        Ok(())
    }

    fn ids(&self, sql: &str, params: impl Params) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let ids = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn execute(&self, sql: &str, params: impl Params) -> Result<usize> {
        self.begin_write()?;
        Ok(self.conn.prepare_cached(sql)?.execute(params)?)
    }
}

impl Backend for SqliteBackend {
    fn describe(&self) -> String {
        format!("SQLite ({})", self.path)
    }

    fn create(&mut self) -> Result<()> {
        self.ensure_schema()?;
        tracing::info!(path = %self.path, "initialized sqlite store");
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.commit()?;
        tracing::debug!(path = %self.path, "committed");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.commit()
    }

    fn load_topic(&self, id: &str) -> Result<Option<Topic>> {
        self.load_record("topics", "id = ?1", params![id])
    }

    fn save_topic(&mut self, topic: &Topic) -> Result<()> {
        self.save_record("topics", topic)
    }

    fn topic_ids(&self) -> Result<Vec<String>> {
        self.ids("SELECT id FROM topics ORDER BY id", [])
    }

    fn load_story(&self, topic_id: &str, id: &str) -> Result<Option<Story>> {
        self.load_record("stories", "topic_id = ?1 AND id = ?2", params![topic_id, id])
    }

    fn save_story(&mut self, story: &Story) -> Result<()> {
        self.save_record("stories", story)?;

        let (topic_id, id) = (story.topic_id(), story.id());
        self.execute("DELETE FROM tags WHERE topic_id = ?1 AND id = ?2", params![topic_id, id])?;
        for tag in story.tags() {
            self.execute(
                "INSERT INTO tags (topic_id, id, tag) VALUES (?1, ?2, ?3)",
                params![topic_id, id, tag],
            )?;
        }
        Ok(())
    }

    fn delete_story(&mut self, topic_id: &str, id: &str) -> Result<()> {
        self.execute("DELETE FROM stories WHERE topic_id = ?1 AND id = ?2", params![topic_id, id])?;
        self.execute("DELETE FROM tags WHERE topic_id = ?1 AND id = ?2", params![topic_id, id])?;
        Ok(())
    }

    fn story_ids(&self, topic_id: &str) -> Result<Vec<String>> {
        self.ids("SELECT id FROM stories WHERE topic_id = ?1 ORDER BY id", params![topic_id])
    }

    fn load_user(&self, id: &str) -> Result<Option<User>> {
        self.load_record("users", "id = ?1", params![id])
    }

    fn save_user(&mut self, user: &User) -> Result<()> {
        self.save_record("users", user)
    }

    fn user_ids(&self) -> Result<Vec<String>> {
        self.ids("SELECT id FROM users ORDER BY id", [])
    }

    fn load_follower(&self, user_id: &str, id: &str) -> Result<Option<Follower>> {
        self.load_record("followers", "user_id = ?1 AND id = ?2", params![user_id, id])
    }

    fn save_follower(&mut self, follower: &Follower) -> Result<()> {
        self.save_record("followers", follower)
    }

    fn delete_follower(&mut self, user_id: &str, id: &str) -> Result<()> {
        self.execute("DELETE FROM followers WHERE user_id = ?1 AND id = ?2", params![user_id, id])?;
        Ok(())
    }

    fn follower_ids(&self, user_id: &str) -> Result<Vec<String>> {
        self.ids("SELECT id FROM followers WHERE user_id = ?1 ORDER BY id", params![user_id])
    }

    fn template(&self, id: &str) -> Result<Option<String>> {
        let content = self
            .conn
            .prepare_cached("SELECT content FROM templates WHERE id = ?1")?
            .query_row(params![id], |row| row.get::<_, Option<String>>(0))
            .optional()?;
        Ok(content.map(Option::unwrap_or_default))
    }

    fn save_template(&mut self, id: &str, content: &str) -> Result<()> {
        self.execute("REPLACE INTO templates (id, content) VALUES (?1, ?2)", params![id, content])?;
        Ok(())
    }

    fn template_ids(&self) -> Result<Vec<String>> {
        self.ids("SELECT id FROM templates ORDER BY id", [])
    }

    fn image(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let content = self
            .conn
            .prepare_cached("SELECT content FROM images WHERE id = ?1")?
            .query_row(params![id], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(content)
    }

    fn save_image(&mut self, id: &str, content: &[u8]) -> Result<()> {
        self.execute("REPLACE INTO images (id, content) VALUES (?1, ?2)", params![id, content])?;
        Ok(())
    }

    fn image_ids(&self) -> Result<Vec<String>> {
        self.ids("SELECT id FROM images ORDER BY id", [])
    }

    fn url(&self, id: &str) -> Result<Option<String>> {
        let url = self
            .conn
            .prepare_cached("SELECT url FROM urls WHERE id = ?1")?
            .query_row(params![id], |row| row.get::<_, Option<String>>(0))
            .optional()?;
        Ok(url.map(Option::unwrap_or_default))
    }

    fn save_url(&mut self, id: &str, url: &str) -> Result<()> {
        self.execute("REPLACE INTO urls (id, url) VALUES (?1, ?2)", params![id, url])?;
        Ok(())
    }

    fn url_ids(&self) -> Result<Vec<String>> {
        self.ids("SELECT id FROM urls ORDER BY id", [])
    }

    fn story_set<'a>(&'a self, query: &StorySet) -> Result<Entries<'a>> {
        let mut pages = Pages::new(&self.conn, query);
        pages.fetch()?;
        Ok(Box::new(pages))
    }

    fn update_ranking(&mut self) -> Result<()> {
        tracing::debug!("hit order is computed per query");
        Ok(())
    }
}

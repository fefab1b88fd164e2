//! Fixed-schema records.
//!
//! Every record kind is a fixed, ordered set of named fields. Values are
//! text, except for list-valued fields (story tags, topic editors) which are
//! ordered lists in memory and comma-joined scalars wherever they are
//! persisted. Naming a field outside the schema is a programming error and is
//! reported as [`StoreError::UnknownField`].

mod kinds;

pub use kinds::{
    Follower, FollowerKind, Story, StoryKind, Topic, TopicKind, User, UserKind,
};

use crate::error::{Result, StoreError};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

/// Schema of a record kind.
pub trait Kind: Clone + Default + fmt::Debug + 'static {
    /// Kind name used in errors and logs.
    const NAME: &'static str;

    /// Field names in persisted order.
    const FIELDS: &'static [&'static str];

    /// Subset of `FIELDS` holding lists.
    const LIST_FIELDS: &'static [&'static str] = &[];
}

/// A field value as handed to [`Record::set`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<&String> for FieldValue {
    fn from(s: &String) -> Self {
        FieldValue::Text(s.clone())
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(v: Vec<String>) -> Self {
        FieldValue::List(v)
    }
}

impl From<Vec<&str>> for FieldValue {
    fn from(v: Vec<&str>) -> Self {
        FieldValue::List(v.into_iter().map(String::from).collect())
    }
}

impl From<&[&str]> for FieldValue {
    fn from(v: &[&str]) -> Self {
        FieldValue::List(v.iter().map(|s| s.to_string()).collect())
    }
}

impl From<u64> for FieldValue {
    fn from(n: u64) -> Self {
        FieldValue::Text(n.to_string())
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Text(if b { "1" } else { "0" }.to_string())
    }
}

/// Split a persisted list scalar. `", "` separators are accepted.
pub(crate) fn split_list(s: &str) -> Vec<String> {
    if s.trim().is_empty() {
        return Vec::new();
    }
    s.replace(", ", ",").split(',').map(String::from).collect()
}

/// Join a list for persistence.
pub(crate) fn join_list(items: &[String]) -> String {
    items.join(",")
}

/// A record of kind `K`.
#[derive(Clone, Debug, Default)]
pub struct Record<K: Kind> {
    data: BTreeMap<&'static str, FieldValue>,
    kind: PhantomData<K>,
}

impl<K: Kind> Record<K> {
    /// An empty record; every field reads as its empty default.
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
            kind: PhantomData,
        }
    }

    /// Build a record from initial values, through the same checks as `set`.
    pub fn with_fields<I, F, V>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (F, V)>,
        F: AsRef<str>,
        V: Into<FieldValue>,
    {
        let mut record = Self::new();
        for (field, value) in fields {
            record.set(field.as_ref(), value)?;
        }
        Ok(record)
    }

    /// Rebuild a record from persisted scalars.
    ///
    /// Keys outside the schema come from foreign data, not from code, so they
    /// are skipped instead of failing the load.
    pub fn from_persisted<I, F, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (F, V)>,
        F: AsRef<str>,
        V: Into<String>,
    {
        let mut record = Self::new();
        for (field, value) in pairs {
            let field = field.as_ref();
            match Self::schema_name(field) {
                Ok(name) => record.put(name, FieldValue::Text(value.into())),
                Err(_) => tracing::debug!(kind = K::NAME, field, "skipping unknown stored field"),
            }
        }
        record
    }

    /// Name of this record kind.
    pub fn kind_name() -> &'static str {
        K::NAME
    }

    /// The fixed field set of this kind.
    pub fn fields() -> &'static [&'static str] {
        K::FIELDS
    }

    /// Whether `field` is list-valued in this kind.
    pub fn is_list_field(field: &str) -> bool {
        K::LIST_FIELDS.contains(&field)
    }

    fn schema_name(field: &str) -> Result<&'static str> {
        K::FIELDS
            .iter()
            .copied()
            .find(|name| *name == field)
            .ok_or_else(|| StoreError::UnknownField {
                kind: K::NAME,
                field: field.to_string(),
            })
    }

    /// Current value of `field`, or the empty string when unset.
    ///
    /// List fields are returned comma-joined.
    pub fn get(&self, field: &str) -> Result<Cow<'_, str>> {
        let name = Self::schema_name(field)?;
        Ok(self.scalar(name))
    }

    /// A list-valued field.
    pub fn list(&self, field: &str) -> Result<&[String]> {
        let name = Self::schema_name(field)?;
        if !Self::is_list_field(name) {
            return Err(StoreError::UnknownField {
                kind: K::NAME,
                field: format!("{field} (not a list)"),
            });
        }
        Ok(self.items(name))
    }

    /// Set `field`. Text assigned to a list field is split on commas; a list
    /// assigned to a text field is joined.
    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> Result<()> {
        let name = Self::schema_name(field)?;
        self.put(name, value.into());
        Ok(())
    }

    pub fn id(&self) -> &str {
        self.text("id")
    }

    /// Whether `field` holds a non-empty value.
    pub(crate) fn is_set(&self, name: &'static str) -> bool {
        !self.scalar(name).is_empty()
    }

    pub(crate) fn put(&mut self, name: &'static str, value: FieldValue) {
        let value = match (Self::is_list_field(name), value) {
            (true, FieldValue::Text(s)) => FieldValue::List(split_list(&s)),
            (false, FieldValue::List(items)) => FieldValue::Text(join_list(&items)),
            (_, value) => value,
        };
        self.data.insert(name, value);
    }

    /// A text field by its schema name.
    pub(crate) fn text(&self, name: &'static str) -> &str {
        debug_assert!(K::FIELDS.contains(&name), "{} has no field {name}", K::NAME);
        match self.data.get(name) {
            Some(FieldValue::Text(s)) => s,
            _ => "",
        }
    }

    /// A list field by its schema name.
    pub(crate) fn items(&self, name: &'static str) -> &[String] {
        match self.data.get(name) {
            Some(FieldValue::List(items)) => items,
            _ => &[],
        }
    }

    fn scalar(&self, name: &'static str) -> Cow<'_, str> {
        match self.data.get(name) {
            Some(FieldValue::Text(s)) => Cow::Borrowed(s),
            Some(FieldValue::List(items)) => Cow::Owned(join_list(items)),
            None => Cow::Borrowed(""),
        }
    }

    /// Fields that hold a value, in schema order, as persisted scalars.
    pub fn persisted(&self) -> Vec<(&'static str, String)> {
        K::FIELDS
            .iter()
            .filter(|name| self.data.contains_key(*name))
            .map(|name| (*name, self.scalar(name).into_owned()))
            .collect()
    }

    /// Every field in schema order, unset ones as empty strings.
    pub fn scalars(&self) -> Vec<(&'static str, String)> {
        K::FIELDS
            .iter()
            .map(|name| (*name, self.scalar(name).into_owned()))
            .collect()
    }
}

impl<K: Kind> PartialEq for Record<K> {
    fn eq(&self, other: &Self) -> bool {
        K::FIELDS
            .iter()
            .all(|name| self.scalar(name) == other.scalar(name))
    }
}

impl<K: Kind> Eq for Record<K> {}

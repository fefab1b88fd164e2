//! The four record schemas.

use super::{Kind, Record};

/// Marker for topics (story groupings).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TopicKind;

impl Kind for TopicKind {
    const NAME: &'static str = "topic";
    const FIELDS: &'static [&'static str] =
        &["id", "name", "editors", "max_stories", "internal", "description"];
    const LIST_FIELDS: &'static [&'static str] = &["editors"];
}

/// Marker for stories.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoryKind;

impl Kind for StoryKind {
    const NAME: &'static str = "story";
    const FIELDS: &'static [&'static str] = &[
        "id",
        "topic_id",
        "title",
        "date",
        "date2",
        "udate",
        "userid",
        "format",
        "hits",
        "toc",
        "has_comments",
        "full_story",
        "content",
        "description",
        "abstract",
        "body",
        "image",
        "tags",
        "redir",
        "lang",
        "reference",
        "revision",
        "ctime",
        "mtime",
        "context",
    ];
    const LIST_FIELDS: &'static [&'static str] = &["tags"];
}

/// Marker for user accounts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserKind;

impl Kind for UserKind {
    const NAME: &'static str = "user";
    const FIELDS: &'static [&'static str] = &[
        "id",
        "username",
        "email",
        "password",
        "can_upload",
        "is_admin",
        "xdate",
        "bio",
        "avatar",
        "url",
        "privkey",
        "pubkey",
    ];
}

/// Marker for followers of a user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FollowerKind;

impl Kind for FollowerKind {
    const NAME: &'static str = "follower";
    const FIELDS: &'static [&'static str] = &[
        "id", "user_id", "context", "date", "network", "ldate", "failures", "disabled",
    ];
}

pub type Topic = Record<TopicKind>;
pub type Story = Record<StoryKind>;
pub type User = Record<UserKind>;
pub type Follower = Record<FollowerKind>;

impl Record<TopicKind> {
    /// Internal topics never show up in public listings or queries.
    pub fn is_internal(&self) -> bool {
        self.text("internal") == "1"
    }
}

impl Record<StoryKind> {
    pub fn topic_id(&self) -> &str {
        self.text("topic_id")
    }

    pub fn date(&self) -> &str {
        self.text("date")
    }

    /// Unpublish date; empty when the story never expires.
    pub fn udate(&self) -> &str {
        self.text("udate")
    }

    pub fn tags(&self) -> &[String] {
        self.items("tags")
    }

    pub fn content(&self) -> &str {
        self.text("content")
    }

    /// Hit counter; unset or garbage counts as zero.
    pub fn hits(&self) -> u64 {
        self.text("hits").trim().parse().unwrap_or(0)
    }

    pub fn revision(&self) -> u64 {
        self.text("revision").trim().parse().unwrap_or(0)
    }
}

impl Record<UserKind> {
    /// Expiry date; empty when the account never expires.
    pub fn xdate(&self) -> &str {
        self.text("xdate")
    }
}

impl Record<FollowerKind> {
    pub fn user_id(&self) -> &str {
        self.text("user_id")
    }
}

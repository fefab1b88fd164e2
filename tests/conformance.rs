//! Behaviour every backend must share.
//!
//! Each check runs against the flat-file, snapshot and SQLite backends.

use content_store::{Date, Follower, Order, Store, StoreConfig, Story, StorySet, Topic, User};
use tempfile::TempDir;

fn open_flat_file(dir: &TempDir) -> Store {
    open_source(dir.path().join("site").display().to_string())
}

fn open_snapshot(dir: &TempDir) -> Store {
    open_source(dir.path().join("site.json").display().to_string())
}

fn open_sqlite(dir: &TempDir) -> Store {
    open_source(dir.path().join("site.db").display().to_string())
}

fn open_source(source: String) -> Store {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    let mut store = Store::open(StoreConfig::new(source)).unwrap();
    store.create(Some("admin"), None).unwrap();
    store
}

type Open = fn(&TempDir) -> Store;

fn add_topic(store: &mut Store, id: &str, internal: bool) {
    let topic = Topic::with_fields([
        ("id", id),
        ("name", id),
        ("internal", if internal { "1" } else { "0" }),
    ])
    .unwrap();
    store.save_topic(topic).unwrap();
}

fn add_story(store: &mut Store, topic_id: &str, id: &str, date: &str, tags: &str) -> Story {
    let story = Story::with_fields([
        ("topic_id", topic_id),
        ("id", id),
        ("title", id),
        ("date", date),
        ("tags", tags),
    ])
    .unwrap();
    store.save_story(story).unwrap()
}

fn ids(store: &Store, query: &StorySet) -> Vec<String> {
    store.story_set(query).map(|e| e.id).collect()
}

// --- Checks ---

fn story_round_trip(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    add_topic(&mut store, "news", false);

    let story = Story::with_fields([
        ("topic_id", "news"),
        ("id", "launch"),
        ("title", "Launch day"),
        ("date", "20240301120000"),
        ("udate", "20991231000000"),
        ("content", "<p>We are live.</p>\n<p>Second paragraph.</p>"),
        ("body", "<p>We are live.</p>"),
        ("abstract", "Live"),
        ("hits", "7"),
        ("tags", "release,site"),
        ("description", "The launch announcement"),
        ("date2", "20240302000000"),
        ("has_comments", "1"),
        ("lang", "en"),
    ])
    .unwrap();
    let saved = store.save_story(story).unwrap();

    let loaded = store.story("news", "launch").unwrap();
    assert_eq!(loaded, saved);
    assert_eq!(loaded.get("lang").unwrap(), "en");
    assert_eq!(loaded.get("date2").unwrap(), "20240302000000");
    assert_eq!(loaded.tags(), ["release", "site"]);
    assert_eq!(loaded.hits(), 7);
    assert_eq!(store.stories("news"), ["launch"]);
    assert!(store.story("news", "missing").is_none());
}

fn record_round_trip(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    let topic = Topic::with_fields([
        ("id", "news"),
        ("name", "News: daily"),
        ("editors", "ann,bob"),
        ("max_stories", "15"),
        ("description", "line one\nline two"),
    ])
    .unwrap();
    let topic = store.save_topic(topic).unwrap();
    assert_eq!(store.topic("news").unwrap(), topic);
    assert_eq!(store.topic("news").unwrap().list("editors").unwrap(), ["ann", "bob"]);

    let user = User::with_fields([
        ("id", "ann"),
        ("username", "Ann"),
        ("email", "ann@example.org"),
        ("is_admin", "1"),
        ("bio", ""),
    ])
    .unwrap();
    let user = store.save_user(user).unwrap();
    assert_eq!(store.user("ann").unwrap(), user);

    let follower = Follower::with_fields([
        ("user_id", "ann"),
        ("id", "https://remote.example/users/zed"),
        ("network", "activitypub"),
        ("failures", "2"),
    ])
    .unwrap();
    let follower = store.save_follower(follower).unwrap().unwrap();
    assert_eq!(
        store.follower("ann", "https://remote.example/users/zed").unwrap(),
        follower
    );
    assert!(store.user("nobody").is_none());
}

fn persists_across_reopen(open: Open) {
    let dir = TempDir::new().unwrap();
    {
        let mut store = open(&dir);
        add_topic(&mut store, "news", false);
        add_story(&mut store, "news", "kept", "20240101000000", "a");
        store.save_template("footer", "<footer/>");
        store.save_image("dot.gif", b"GIF89a\x00\x01\xff");
        store.close().unwrap();
    }

    let store = open(&dir);
    assert_eq!(store.story("news", "kept").unwrap().tags(), ["a"]);
    assert_eq!(store.template("footer"), "<footer/>");
    assert_eq!(store.image("dot.gif").unwrap(), b"GIF89a\x00\x01\xff");
    assert_eq!(ids(&store, &StorySet::new()), ["kept"]);
}

fn date_order(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    add_topic(&mut store, "news", false);
    add_topic(&mut store, "blog", false);

    add_story(&mut store, "news", "middle", "20240102000000", "");
    add_story(&mut store, "blog", "newest", "20240103000000", "");
    add_story(&mut store, "news", "oldest", "20240101000000", "");
    add_story(&mut store, "news", "tie-a", "20240102000000", "");

    assert_eq!(
        ids(&store, &StorySet::new()),
        ["newest", "tie-a", "middle", "oldest"]
    );
    assert_eq!(
        ids(&store, &StorySet::new().topics(["news"])),
        ["tie-a", "middle", "oldest"]
    );

    // Re-dating a story moves it.
    let mut moved = store.story("news", "oldest").unwrap();
    moved.set("date", "20240104000000").unwrap();
    store.save_story(moved).unwrap();
    assert_eq!(ids(&store, &StorySet::new().num(1)), ["oldest"]);
}

fn date_bounds(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    add_topic(&mut store, "news", false);
    for day in 1..=5 {
        add_story(&mut store, "news", &format!("d{day}"), &format!("2024010{day}000000"), "");
    }

    let query = StorySet::new()
        .from(Date::parse("20240102000000").unwrap())
        .to(Date::parse("20240104000000").unwrap());
    assert_eq!(ids(&store, &query), ["d4", "d3"]);
}

fn delete(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    add_topic(&mut store, "news", false);
    let doomed = add_story(&mut store, "news", "doomed", "20240101000000", "x");
    add_story(&mut store, "news", "stays", "20240102000000", "x");

    assert!(store.delete_story(&doomed));
    assert!(store.story("news", "doomed").is_none());
    assert_eq!(store.stories("news"), ["stays"]);
    assert_eq!(ids(&store, &StorySet::new()), ["stays"]);
    assert_eq!(ids(&store, &StorySet::new().tags(["x"])), ["stays"]);
}

fn tag_filters(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    add_topic(&mut store, "news", false);
    add_story(&mut store, "news", "ab", "20240103000000", "a,b");
    add_story(&mut store, "news", "a", "20240102000000", "a");
    add_story(&mut store, "news", "b", "20240101000000", "b");

    assert_eq!(ids(&store, &StorySet::new().tags(["a"])), ["ab", "a"]);
    assert_eq!(ids(&store, &StorySet::new().tags(["a", "!b"])), ["a"]);
    assert_eq!(ids(&store, &StorySet::new().tags(["a", "b"])), ["ab"]);
    assert!(ids(&store, &StorySet::new().tags(["c"])).is_empty());

    let tags = store.tags(false);
    assert_eq!(tags.keys().collect::<Vec<_>>(), ["a", "b"]);
    assert_eq!(tags["a"].len(), 2);
}

fn content_filter(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    add_topic(&mut store, "news", false);
    for (id, content) in [("x", "Rust is FAST"), ("y", "python is fine")] {
        let story = Story::with_fields([
            ("topic_id", "news"),
            ("id", id),
            ("date", "20240101000000"),
            ("content", content),
        ])
        .unwrap();
        store.save_story(story).unwrap();
    }

    assert_eq!(ids(&store, &StorySet::new().content("fast")), ["x"]);
    assert_eq!(ids(&store, &StorySet::new().content("IS")), ["y", "x"]);
}

fn visibility(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    add_topic(&mut store, "news", false);
    add_topic(&mut store, "drafts", true);

    let today = Date::now();
    add_story(&mut store, "news", "past", "20240101000000", "");
    add_story(&mut store, "news", "tomorrow", today.add_days(1).as_str(), "");
    add_story(&mut store, "drafts", "draft", "20240101000000", "");

    let expired = Story::with_fields([
        ("topic_id", "news"),
        ("id", "expired"),
        ("date", "20230101000000"),
        ("udate", today.add_days(-1).as_str()),
    ])
    .unwrap();
    store.save_story(expired).unwrap();

    assert_eq!(ids(&store, &StorySet::new()), ["past"]);

    let mut everything = ids(&store, &StorySet::new().private(true));
    everything.sort();
    assert_eq!(everything, ["draft", "expired", "past", "tomorrow"]);
}

fn pagination(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    add_topic(&mut store, "news", false);
    for n in 0..10 {
        add_story(&mut store, "news", &format!("s{n}"), &format!("202401{:02}000000", n + 1), "");
    }

    let page = ids(&store, &StorySet::new().offset(3).num(4));
    assert_eq!(page, ["s6", "s5", "s4", "s3"]);
    assert!(ids(&store, &StorySet::new().offset(20)).is_empty());
}

fn hits_order(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    add_topic(&mut store, "news", false);
    for (id, date, hits) in [
        ("quiet", "20240103000000", "1"),
        ("popular", "20240101000000", "50"),
        ("steady", "20240102000000", "10"),
    ] {
        let story = Story::with_fields([
            ("topic_id", "news"),
            ("id", id),
            ("date", date),
            ("hits", hits),
        ])
        .unwrap();
        store.save_story(story).unwrap();
    }
    store.rank_by_hits().unwrap();

    let query = StorySet::new().order(Order::Hits);
    assert_eq!(ids(&store, &query), ["popular", "steady", "quiet"]);

    // A lower bound only skips in hit order.
    let bounded = query.from(Date::parse("20240101000000").unwrap());
    assert_eq!(ids(&store, &bounded), ["steady", "quiet"]);
}

fn hits_after_delete(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    add_topic(&mut store, "news", false);
    for (id, hits) in [("doomed", "99"), ("stays", "1")] {
        let story = Story::with_fields([
            ("topic_id", "news"),
            ("id", id),
            ("date", "20240101000000"),
            ("hits", hits),
        ])
        .unwrap();
        store.save_story(story).unwrap();
    }
    store.rank_by_hits().unwrap();

    let doomed = store.story("news", "doomed").unwrap();
    assert!(store.delete_story(&doomed));

    let query = StorySet::new().order(Order::Hits);
    assert_eq!(ids(&store, &query), ["stays"]);
    assert!(store.story_set(&query).all(|e| store.story(&e.topic_id, &e.id).is_some()));
}

fn tag_separators_refused(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    add_topic(&mut store, "news", false);

    let bad = Story::with_fields([
        ("topic_id", "news"),
        ("id", "bad"),
        ("date", "20240101000000"),
        ("tags", "a,c:d"),
    ])
    .unwrap();
    assert!(store.save_story(bad).is_none());
    assert!(store.story("news", "bad").is_none());

    add_story(&mut store, "news", "good", "20240102000000", "a,c-d");
    assert_eq!(ids(&store, &StorySet::new().tags(["c-d"])), ["good"]);
    assert_eq!(ids(&store, &StorySet::new()), ["good"]);
}

fn short_urls(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    let first = store.shorten_url("https://example.org/a?b=c").unwrap();
    let second = store.shorten_url("https://example.org/d").unwrap();
    assert_eq!((first.as_str(), second.as_str()), ("1", "2"));
    assert_eq!(store.shorten_url("https://example.org/a?b=c").unwrap(), "1");

    assert_eq!(store.unshorten_url("2"), "https://example.org/d");
    assert_eq!(store.unshorten_url("https://site.example/s/1"), "https://example.org/a?b=c");
    assert_eq!(store.unshorten_url("3"), "");

    assert!(store.save_url("/s/legacy", "https://example.org/old"));
    assert_eq!(store.unshorten_url("legacy"), "https://example.org/old");

    let mut listed = store.urls();
    listed.sort();
    assert_eq!(listed, ["1", "2", "legacy"]);
}

fn private_listings(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);
    add_topic(&mut store, "news", false);
    add_topic(&mut store, "drafts", true);

    let yesterday = Date::now().add_days(-1);
    store
        .save_user(User::with_fields([("id", "former"), ("xdate", yesterday.as_str())]).unwrap())
        .unwrap();

    assert_eq!(store.topics(false), ["news"]);
    assert_eq!(store.topics(true), ["drafts", "news"]);
    assert_eq!(store.users(false), ["admin"]);
    assert_eq!(store.users(true), ["admin", "former"]);
}

fn followers(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    for id in ["https://a.example/u/1", "https://b.example/u/2"] {
        let follower = Follower::with_fields([("user_id", "admin"), ("id", id)]).unwrap();
        store.save_follower(follower).unwrap().unwrap();
    }

    let mut listed = store.followers("admin");
    listed.sort();
    assert_eq!(listed, ["https://a.example/u/1", "https://b.example/u/2"]);

    let one = store.follower("admin", "https://a.example/u/1").unwrap();
    assert!(store.delete_follower(&one));
    assert_eq!(store.followers("admin"), ["https://b.example/u/2"]);
    assert!(store.followers("nobody").is_empty());
}

fn templates_and_images(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut store = open(&dir);

    assert!(store.save_template("header", "<h1>Site</h1>"));
    assert_eq!(store.template("header"), "<h1>Site</h1>");
    assert_eq!(store.template("missing"), "");
    assert!(store.templates().contains(&"header".to_string()));

    let bytes: Vec<u8> = (0..=255).collect();
    assert!(store.save_image("all.bin", &bytes));
    assert_eq!(store.image("all.bin").unwrap(), bytes);
    assert_eq!(store.images(), ["all.bin"]);
    assert!(store.image("missing.png").is_none());
}

fn copy_into_snapshot(open: Open) {
    let dir = TempDir::new().unwrap();
    let mut source = open(&dir);
    add_topic(&mut source, "news", false);
    add_story(&mut source, "news", "one", "20240101000000", "t");
    let two = add_story(&mut source, "news", "two", "20240102000000", "t");
    source.save_story(two).unwrap();
    source.save_image("logo.png", b"\x89PNG");
    source.shorten_url("https://example.org/long").unwrap();

    let target_dir = TempDir::new().unwrap();
    let mut target = open_snapshot(&target_dir);
    target.copy(&source).unwrap();

    assert_eq!(target.story("news", "two").unwrap().revision(), 2);
    assert_eq!(ids(&target, &StorySet::new()), ["two", "one"]);
    assert_eq!(target.image("logo.png").unwrap(), b"\x89PNG");
    assert_eq!(target.unshorten_url("1"), "https://example.org/long");
    assert_eq!(target.users(true), source.users(true));
}

macro_rules! backend_tests {
    ($module:ident, $open:ident, [$($check:ident),* $(,)?]) => {
        mod $module {
            $(
                #[test]
                fn $check() {
                    super::$check(super::$open);
                }
            )*
        }
    };
}

macro_rules! conformance {
    ($($module:ident => $open:ident),* $(,)?) => {
        $(
            backend_tests!($module, $open, [
                story_round_trip,
                record_round_trip,
                persists_across_reopen,
                date_order,
                date_bounds,
                delete,
                tag_filters,
                content_filter,
                visibility,
                pagination,
                hits_order,
                hits_after_delete,
                tag_separators_refused,
                short_urls,
                private_listings,
                followers,
                templates_and_images,
                copy_into_snapshot,
            ]);
        )*
    };
}

conformance! {
    flat_file => open_flat_file,
    snapshot => open_snapshot,
    sqlite => open_sqlite,
}

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use async_trait::async_trait;
use parking_lot::Mutex;

use drive_index::drive_mem::MemDrive;
use drive_index::{
    ChangeEntry, Database, DbEvent, DbOptions, InMemoryKvStore, IndexError, IndexOptions, KvStore,
    Source, TableDef,
};

const NO_WATCH: IndexOptions = IndexOptions { watch: false };

fn define_social(db: &Database, revision: &str) {
    db.define(
        TableDef::new("profiles")
            .file_pattern("/profile.json")
            .index("name"),
    )
    .unwrap();
    db.define(
        TableDef::new("posts")
            .file_pattern("/posts/*.json")
            .index("createdAt")
            .index("*tags")
            .revision(revision),
    )
    .unwrap();
}

async fn social_db_on(store: Arc<dyn KvStore>, options: DbOptions) -> Database {
    let db = Database::new("social", store, options);
    define_social(&db, "1");
    db.open().await.unwrap();
    db
}

async fn social_db() -> Database {
    social_db_on(Arc::new(InMemoryKvStore::new()), DbOptions::default()).await
}

fn source(drive: &Arc<MemDrive>) -> Arc<dyn Source> {
    drive.clone()
}

/// Wait (bounded) for the first event matching `pred`.
async fn wait_for<F>(rx: &mut broadcast::Receiver<DbEvent>, pred: F) -> DbEvent
where
    F: Fn(&DbEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn indexes_profiles_and_posts() {
    let db = social_db().await;
    let alice = Arc::new(MemDrive::new("alice"));
    alice.put_json("/profile.json", &json!({"name": "alice"}));
    alice.put_json("/posts/1.json", &json!({"text": "hi", "createdAt": 1}));

    db.index_source(source(&alice), NO_WATCH).await.unwrap();

    assert_eq!(db.watermark("hyper://alice").await.unwrap().unwrap().version, 2);
    let profiles = db.table("profiles").unwrap();
    let posts = db.table("posts").unwrap();
    assert_eq!(profiles.count().await.unwrap(), 1);
    assert_eq!(posts.count().await.unwrap(), 1);

    let profile = profiles.get_by("name", "alice").await.unwrap().unwrap();
    assert_eq!(profile.url, "hyper://alice/profile.json");
    assert_eq!(profile.origin, "hyper://alice");
    assert_eq!(profile.path(), "/profile.json");

    let post = posts.get("hyper://alice/posts/1.json").await.unwrap().unwrap();
    assert_eq!(post.value, json!({"text": "hi", "createdAt": 1}));
    assert!(db.is_source("hyper://alice"));
    assert_eq!(db.list_sources(), vec!["hyper://alice".to_string()]);
}

#[tokio::test]
async fn second_pass_is_a_no_op() {
    let db = social_db().await;
    let alice = Arc::new(MemDrive::new("alice"));
    alice.put_json("/profile.json", &json!({"name": "alice"}));
    alice.put_json("/posts/1.json", &json!({"text": "hi", "createdAt": 1}));
    db.index_source(source(&alice), NO_WATCH).await.unwrap();

    let before = db.table("posts").unwrap().to_array().await.unwrap();
    let calls = alice.history_calls();
    let mut events = db.subscribe();

    db.index_source(source(&alice), NO_WATCH).await.unwrap();

    assert_eq!(alice.history_calls(), calls);
    assert_eq!(db.table("posts").unwrap().to_array().await.unwrap(), before);
    assert_eq!(
        events.try_recv().unwrap(),
        DbEvent::SourceIndexed {
            origin: "hyper://alice".into(),
            version: 2
        }
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn latest_mutation_per_path_wins() {
    let db = social_db().await;
    let alice = Arc::new(MemDrive::new("alice"));
    alice.put_json("/posts/1.json", &json!({"text": "first", "createdAt": 1}));
    alice.put_json("/posts/2.json", &json!({"text": "doomed", "createdAt": 2}));
    alice.put_json("/posts/1.json", &json!({"text": "second", "createdAt": 1}));
    alice.remove("/posts/2.json");
    alice.put_json("/notes.txt", &json!("not indexed"));

    db.index_source(source(&alice), NO_WATCH).await.unwrap();

    let posts = db.table("posts").unwrap();
    let all = posts.to_array().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].value["text"], "second");
    // the trailing unmatched write still moves the watermark
    assert_eq!(db.watermark("hyper://alice").await.unwrap().unwrap().version, 5);
}

#[tokio::test]
async fn incremental_pass_applies_only_new_changes() {
    let db = social_db().await;
    let alice = Arc::new(MemDrive::new("alice"));
    alice.put_json("/posts/1.json", &json!({"text": "a", "createdAt": 1, "tags": ["x"]}));
    db.index_source(source(&alice), NO_WATCH).await.unwrap();

    alice.put_json("/posts/2.json", &json!({"text": "b", "createdAt": 2, "tags": ["x", "y"]}));
    alice.remove("/posts/1.json");
    db.index_source(source(&alice), NO_WATCH).await.unwrap();

    let posts = db.table("posts").unwrap();
    let urls = posts.query().urls().await.unwrap();
    assert_eq!(urls, vec!["hyper://alice/posts/2.json".to_string()]);
    assert_eq!(posts.where_("tags").unwrap().equals("x").unwrap().count().await.unwrap(), 1);
    assert_eq!(db.watermark("hyper://alice").await.unwrap().unwrap().version, 3);
}

#[tokio::test]
async fn invalid_files_are_not_indexed_and_evict_old_records() {
    let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
    let db = Database::new("strict", store, DbOptions::default());
    db.define(
        TableDef::new("posts")
            .file_pattern("/posts/*.json")
            .validate(|v| Ok(v.get("text").is_some_and(|t| t.is_string()))),
    )
    .unwrap();
    db.open().await.unwrap();

    let alice = Arc::new(MemDrive::new("alice"));
    alice.put_json("/posts/1.json", &json!({"text": "ok"}));
    alice.put_json("/posts/2.json", &json!({"title": "no text"}));
    alice.put_bytes("/posts/3.json", b"{not json");
    db.index_source(source(&alice), NO_WATCH).await.unwrap();

    let posts = db.table("posts").unwrap();
    assert_eq!(posts.count().await.unwrap(), 1);

    alice.put_bytes("/posts/1.json", b"garbage");
    db.index_source(source(&alice), NO_WATCH).await.unwrap();
    assert_eq!(posts.count().await.unwrap(), 0);
    assert_eq!(db.watermark("hyper://alice").await.unwrap().unwrap().version, 4);
}

#[tokio::test]
async fn unindex_source_drops_every_record() {
    let db = social_db().await;
    let alice = Arc::new(MemDrive::new("alice"));
    alice.put_json("/profile.json", &json!({"name": "alice"}));
    alice.put_json("/posts/1.json", &json!({"text": "a", "createdAt": 1}));
    alice.put_json("/posts/2.json", &json!({"text": "b", "createdAt": 2}));
    let bob = Arc::new(MemDrive::new("bob"));
    bob.put_json("/profile.json", &json!({"name": "bob"}));

    db.index_sources(vec![source(&alice), source(&bob)], NO_WATCH)
        .await
        .unwrap();
    assert_eq!(db.table("posts").unwrap().count().await.unwrap(), 2);

    db.unindex_source(source(&alice)).await.unwrap();

    assert!(!db.is_source("hyper://alice"));
    assert!(db.watermark("hyper://alice").await.unwrap().is_none());
    assert_eq!(db.table("posts").unwrap().count().await.unwrap(), 0);
    let profiles = db.table("profiles").unwrap().to_array().await.unwrap();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].origin, "hyper://bob");
    assert!(db.table("profiles").unwrap().get_by("name", "alice").await.unwrap().is_none());
}

#[tokio::test]
async fn unindex_by_origin_string_uses_stored_records() {
    let db = social_db().await;
    let alice = Arc::new(MemDrive::new("alice"));
    alice.put_json("/posts/1.json", &json!({"text": "a", "createdAt": 1}));
    db.index_source(source(&alice), NO_WATCH).await.unwrap();

    db.unindex_source("hyper://alice/some/record.json").await.unwrap();
    assert_eq!(db.table("posts").unwrap().count().await.unwrap(), 0);
    assert!(db.watermarks().await.unwrap().is_empty());
}

#[tokio::test]
async fn first_open_reports_every_table() {
    let db = Database::new("fresh", Arc::new(InMemoryKvStore::new()), DbOptions::default());
    define_social(&db, "1");
    let report = db.open().await.unwrap();
    assert_eq!(report.rebuilds, vec!["profiles".to_string(), "posts".to_string()]);
    assert!(matches!(
        db.define(TableDef::new("late")),
        Err(IndexError::Schema(_))
    ));
}

#[tokio::test]
async fn changed_definition_resets_and_rebuilds() {
    let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
    let alice = Arc::new(MemDrive::new("alice"));
    alice.put_json("/profile.json", &json!({"name": "alice"}));
    alice.put_json("/posts/1.json", &json!({"text": "a", "createdAt": 1}));

    let db = social_db_on(Arc::clone(&store), DbOptions::default()).await;
    db.index_source(source(&alice), NO_WATCH).await.unwrap();
    let before = db.table("posts").unwrap().query().urls().await.unwrap();

    // same definitions: nothing to rebuild
    let same = Database::new("social", Arc::clone(&store), DbOptions::default());
    define_social(&same, "1");
    assert!(same.open().await.unwrap().rebuilds.is_empty());
    assert_eq!(same.table("posts").unwrap().count().await.unwrap(), 1);

    let bumped = Database::new("social", Arc::clone(&store), DbOptions::default());
    define_social(&bumped, "2");
    let mut events = bumped.subscribe();
    let report = bumped.open().await.unwrap();
    assert_eq!(report.rebuilds, vec!["posts".to_string()]);
    assert_eq!(events.try_recv().unwrap(), DbEvent::IndexesReset);
    assert_eq!(bumped.table("posts").unwrap().count().await.unwrap(), 0);
    assert_eq!(bumped.table("profiles").unwrap().count().await.unwrap(), 0);
    assert_eq!(bumped.watermark("hyper://alice").await.unwrap().unwrap().version, 0);

    bumped.index_source(source(&alice), NO_WATCH).await.unwrap();
    assert_eq!(bumped.table("posts").unwrap().query().urls().await.unwrap(), before);
    assert_eq!(bumped.table("profiles").unwrap().count().await.unwrap(), 1);
}

#[tokio::test]
async fn concurrent_passes_share_one_scan() {
    let db = social_db().await;
    let alice = Arc::new(MemDrive::new("alice"));
    alice.put_json("/profile.json", &json!({"name": "alice"}));
    db.index_source(source(&alice), NO_WATCH).await.unwrap();

    alice.put_json("/posts/1.json", &json!({"text": "a", "createdAt": 1}));
    alice.put_json("/posts/2.json", &json!({"text": "b", "createdAt": 2}));
    let calls = alice.history_calls();

    let (a, b) = tokio::join!(
        db.index_source(source(&alice), NO_WATCH),
        db.index_source(source(&alice), NO_WATCH)
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(alice.history_calls() - calls, 1);
    assert_eq!(db.table("posts").unwrap().count().await.unwrap(), 2);
}

#[tokio::test]
async fn small_history_window_reads_in_chunks() {
    let options = DbOptions {
        history_window: 2,
        ..DbOptions::default()
    };
    let db = social_db_on(Arc::new(InMemoryKvStore::new()), options).await;
    let alice = Arc::new(MemDrive::new("alice"));
    for i in 0..5 {
        alice.put_json(&format!("/posts/{}.json", i), &json!({"createdAt": i}));
    }

    db.index_source(source(&alice), NO_WATCH).await.unwrap();

    assert_eq!(alice.history_calls(), 3);
    assert_eq!(db.table("posts").unwrap().count().await.unwrap(), 5);
}

#[tokio::test(start_paused = true)]
async fn missing_source_is_retried_until_found() {
    let options = DbOptions {
        read_timeout: Duration::from_secs(1),
        retry_interval: Duration::from_secs(5),
        ..DbOptions::default()
    };
    let db = social_db_on(Arc::new(InMemoryKvStore::new()), options).await;
    let bob = Arc::new(MemDrive::new("bob"));
    bob.put_json("/profile.json", &json!({"name": "bob"}));
    bob.set_online(false);

    let mut events = db.subscribe();
    db.index_source(source(&bob), NO_WATCH).await.unwrap();
    wait_for(&mut events, |e| matches!(e, DbEvent::SourceMissing { .. })).await;
    assert!(db.is_source("hyper://bob"));
    assert_eq!(db.table("profiles").unwrap().count().await.unwrap(), 0);

    bob.set_online(true);
    let found = wait_for(&mut events, |e| matches!(e, DbEvent::SourceFound { .. })).await;
    assert_eq!(found.origin(), Some("hyper://bob"));
    assert_eq!(db.table("profiles").unwrap().count().await.unwrap(), 1);
    assert_eq!(db.watermark("hyper://bob").await.unwrap().unwrap().version, 1);
}

#[tokio::test(start_paused = true)]
async fn unindexing_a_missing_source_stops_the_retry_loop() {
    let options = DbOptions {
        read_timeout: Duration::from_secs(1),
        retry_interval: Duration::from_secs(5),
        ..DbOptions::default()
    };
    let db = social_db_on(Arc::new(InMemoryKvStore::new()), options).await;
    let bob = Arc::new(MemDrive::new("bob"));
    bob.put_json("/profile.json", &json!({"name": "bob"}));
    bob.set_online(false);

    db.index_source(source(&bob), NO_WATCH).await.unwrap();
    db.unindex_source(source(&bob)).await.unwrap();
    bob.set_online(true);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!db.is_source("hyper://bob"));
    assert_eq!(db.table("profiles").unwrap().count().await.unwrap(), 0);
    assert!(db.watermark("hyper://bob").await.unwrap().is_none());
}

#[tokio::test]
async fn watched_sources_reindex_on_change() {
    let db = social_db().await;
    let alice = Arc::new(MemDrive::new("alice"));
    alice.put_json("/profile.json", &json!({"name": "alice"}));
    db.index_source(source(&alice), IndexOptions::default()).await.unwrap();

    let mut events = db.subscribe();
    alice.put_json("/posts/1.json", &json!({"text": "a", "createdAt": 1}));
    wait_for(&mut events, |e| {
        matches!(e, DbEvent::IndexesUpdated { version: 2, .. })
    })
    .await;
    assert_eq!(db.table("posts").unwrap().count().await.unwrap(), 1);

    db.close().await.unwrap();
    assert!(!db.is_open());
    assert!(db.list_sources().is_empty());
}

#[tokio::test]
async fn index_and_unindex_single_files() {
    let db = social_db().await;
    let alice = Arc::new(MemDrive::new("alice"));
    alice.put_json("/posts/1.json", &json!({"text": "a", "createdAt": 1}));
    db.index_source(source(&alice), NO_WATCH).await.unwrap();

    alice.put_json("/posts/1.json", &json!({"text": "edited", "createdAt": 1}));
    db.index_file("hyper://alice/posts/1.json").await.unwrap();
    let posts = db.table("posts").unwrap();
    let post = posts.get("hyper://alice/posts/1.json").await.unwrap().unwrap();
    assert_eq!(post.value["text"], "edited");
    // the watermark only moves with full passes
    assert_eq!(db.watermark("hyper://alice").await.unwrap().unwrap().version, 1);

    db.unindex_file("hyper://alice/posts/1.json").await.unwrap();
    assert_eq!(posts.count().await.unwrap(), 0);

    assert!(matches!(
        db.index_file("not a url").await,
        Err(IndexError::Parameter(_))
    ));
}

#[tokio::test]
async fn operations_require_an_open_database() {
    let db = Database::new("closed", Arc::new(InMemoryKvStore::new()), DbOptions::default());
    define_social(&db, "1");
    let alice = Arc::new(MemDrive::new("alice"));
    assert!(matches!(
        db.index_source(source(&alice), NO_WATCH).await,
        Err(IndexError::Query(_))
    ));
}

#[tokio::test]
async fn index_progress_events_are_emitted_in_order() {
    let db = social_db().await;
    let alice = Arc::new(MemDrive::new("alice"));
    alice.put_json("/profile.json", &json!({"name": "alice"}));
    alice.put_json("/posts/1.json", &json!({"text": "a", "createdAt": 1}));
    let mut events = db.subscribe();

    db.index_source(source(&alice), NO_WATCH).await.unwrap();

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(
        names,
        vec![
            "source-indexing",
            "source-index-progress",
            "source-index-progress",
            "source-indexed",
            "indexes-updated"
        ]
    );
}

/// MemDrive whose reads of one path fail until the fault is cleared.
struct FaultyDrive {
    inner: Arc<MemDrive>,
    broken: Mutex<Option<String>>,
}

#[async_trait]
impl Source for FaultyDrive {
    fn url(&self) -> &str {
        self.inner.url()
    }

    fn version(&self) -> u64 {
        self.inner.version()
    }

    fn writable(&self) -> bool {
        self.inner.writable()
    }

    async fn read_file(&self, path: &str) -> drive_index::Result<Vec<u8>> {
        if self.broken.lock().as_deref() == Some(path) {
            return Err(IndexError::Source(format!("read error on {}", path)));
        }
        self.inner.read_file(path).await
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> drive_index::Result<()> {
        self.inner.write_file(path, data).await
    }

    async fn unlink(&self, path: &str) -> drive_index::Result<()> {
        self.inner.unlink(path).await
    }

    async fn readdir(&self, path: &str, recursive: bool) -> drive_index::Result<Vec<String>> {
        self.inner.readdir(path, recursive).await
    }

    async fn history(&self, start: u64, end: u64) -> drive_index::Result<Vec<ChangeEntry>> {
        self.inner.history(start, end).await
    }
}

#[tokio::test]
async fn failed_mutation_aborts_the_pass_and_resumes_there() {
    let db = social_db().await;
    let alice = Arc::new(MemDrive::new("alice"));
    for i in 1..=3 {
        alice.put_json(&format!("/posts/{}.json", i), &json!({"text": "t", "createdAt": i}));
    }
    let faulty = Arc::new(FaultyDrive {
        inner: alice.clone(),
        broken: Mutex::new(Some("/posts/2.json".to_string())),
    });
    let handle: Arc<dyn Source> = faulty.clone();
    let mut events = db.subscribe();

    let first = db.index_source(&handle, NO_WATCH).await;
    assert!(matches!(first, Err(IndexError::Source(_))));
    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if let DbEvent::SourceError { origin, .. } = event {
            assert_eq!(origin, "hyper://alice");
            saw_error = true;
        }
    }
    assert!(saw_error);
    assert_eq!(db.watermark("hyper://alice").await.unwrap().unwrap().version, 1);
    assert_eq!(db.table("posts").unwrap().count().await.unwrap(), 1);
    assert!(db.is_idle());
    assert!(db.is_source("hyper://alice"));

    faulty.broken.lock().take();
    db.index_source(&handle, NO_WATCH).await.unwrap();
    assert_eq!(db.watermark("hyper://alice").await.unwrap().unwrap().version, 3);
    assert_eq!(db.table("posts").unwrap().count().await.unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registration_starts_one_watcher() {
    let db = social_db().await;
    let alice = Arc::new(MemDrive::new("alice"));
    alice.put_json("/profile.json", &json!({"name": "alice"}));

    let mut set = tokio::task::JoinSet::new();
    for _ in 0..4 {
        let db = db.clone();
        let handle = source(&alice);
        set.spawn(async move { db.index_source(handle, IndexOptions { watch: true }).await });
    }
    while let Some(joined) = set.join_next().await {
        joined.unwrap().unwrap();
    }

    assert_eq!(alice.subscriber_count(), 1);
    assert_eq!(db.table("profiles").unwrap().count().await.unwrap(), 1);
    db.close().await.unwrap();
}

//! Integration tests for docmap
//!
//! Tests full flows from typed documents through the store, the change
//! feed and the search index.

use async_trait::async_trait;
use docmap::config::{FeedSettings, RetrySettings};
use docmap::feed::{
    stop_signal, Checkpoint, FeedAction, FeedCursor, FeedHandler, FileCheckpoint, MemoryOplog,
    OperationKind, Position, ReplicationLog, Tailer,
};
use docmap::search::{self, IndexDefinition, IndexSynchronizer, MemorySearch, Term};
use docmap::storage::matcher;
use docmap::{
    Document, DocumentType, FieldDescriptor, FieldType, Mapper, MemoryStore, Predicate,
    SchemaRegistry, Store, Value,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry
        .register(DocumentType::new("User").field(FieldDescriptor::string("name")))
        .unwrap();
    registry
        .register(
            DocumentType::new("Post")
                .field(FieldDescriptor::string("title").required())
                .field(FieldDescriptor::string("body"))
                .field(FieldDescriptor::bool("published").default_value(true))
                .field(FieldDescriptor::int("views").default_value(0))
                .field(FieldDescriptor::reference("author", "User"))
                .field(FieldDescriptor::list("editors", FieldType::reference("User"))),
        )
        .unwrap();
    registry
}

fn feed_settings() -> FeedSettings {
    FeedSettings {
        poll_interval_ms: 10,
        namespaces: Vec::new(),
    }
}

/// Poll a condition until it holds, failing the test after a bounded wait
macro_rules! eventually {
    ($what:expr, $check:expr) => {{
        let mut done = false;
        for _ in 0..1000 {
            if $check {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(done, "timed out waiting for {}", $what);
    }};
}

async fn save_user(mapper: &Mapper, name: &str) -> String {
    let user = mapper.registry().get("User").unwrap();
    let mut doc = Document::new(&user);
    doc.set("name", name);
    mapper.save(&mut doc).await.unwrap()
}

async fn save_post(mapper: &Mapper, title: &str, author: &str, editors: &[&str]) -> Document {
    let post = mapper.registry().get("Post").unwrap();
    let mut doc = Document::new(&post);
    doc.set("title", title)
        .set("author", author)
        .set(
            "editors",
            editors.iter().map(|e| Value::from(*e)).collect::<Vec<_>>(),
        );
    mapper.save(&mut doc).await.unwrap();
    doc
}

// =============================================================================
// Eager loading
// =============================================================================

#[tokio::test]
async fn test_eagerload_batches_one_fetch_for_all_posts() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let mapper = Mapper::new(registry(), store.clone());

    let a = save_user(&mapper, "ann").await;
    let b = save_user(&mapper, "bob").await;
    save_post(&mapper, "one", &a, &[b.as_str()]).await;
    save_post(&mapper, "two", &b, &[a.as_str(), b.as_str()]).await;
    save_post(&mapper, "three", &a, &[]).await;

    let posts = mapper
        .query("Post")
        .unwrap()
        .sort("title")
        .unwrap()
        .eagerload(&["author", "editors"], None)
        .unwrap()
        .all()
        .await
        .unwrap();
    assert_eq!(posts.len(), 3);

    let user_fetches: Vec<_> = store
        .finds()
        .await
        .into_iter()
        .filter(|(ns, _)| ns == "docmap.user")
        .collect();
    assert_eq!(user_fetches.len(), 1);
    let ids = &user_fetches[0].1["_id"]["$in"];
    assert_eq!(ids.as_array().map(Vec::len), Some(2));

    for post in &posts {
        let author = post.get("author").and_then(Value::as_document).unwrap();
        assert!(author.get("name").is_some());
        for editor in post.get("editors").and_then(Value::as_array).unwrap() {
            assert!(editor.as_document().is_some());
        }
    }
    let two = posts.iter().find(|p| p.get("title") == Some(&Value::from("two"))).unwrap();
    let editors = two.get("editors").and_then(Value::as_array).unwrap();
    assert_eq!(editors[0].as_document().and_then(|d| d.id()), Some(a.as_str()));
    assert_eq!(editors[1].as_document().and_then(|d| d.id()), Some(b.as_str()));
}

#[tokio::test]
async fn test_eagerload_rejects_mixed_targets() {
    let mut registry = registry();
    registry
        .register(
            DocumentType::new("Tagged")
                .field(FieldDescriptor::reference("owner", "User"))
                .field(FieldDescriptor::reference("post", "Post")),
        )
        .unwrap();
    let mapper = Mapper::new(registry, Arc::new(MemoryStore::new()));
    let err = mapper
        .query("Tagged")
        .unwrap()
        .eagerload(&["owner", "post"], None)
        .unwrap_err();
    assert!(matches!(err, docmap::Error::EagerloadConsistency { .. }));
}

// =============================================================================
// Change feed
// =============================================================================

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<FeedAction>>,
}

#[async_trait]
impl FeedHandler for Recorder {
    async fn handle(&self, action: FeedAction) -> docmap::Result<()> {
        self.seen.lock().await.push(action);
        Ok(())
    }
}

/// Records, then never returns for the id it is told to hang on
struct Hanging {
    seen: Arc<Mutex<Vec<FeedAction>>>,
    hang_on: serde_json::Value,
}

#[async_trait]
impl FeedHandler for Hanging {
    async fn handle(&self, action: FeedAction) -> docmap::Result<()> {
        let hang = matches!(&action, FeedAction::Delete { id } if *id == self.hang_on);
        self.seen.lock().await.push(action);
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

fn delete_ids(actions: &[FeedAction]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|a| match a {
            FeedAction::Delete { id } => id.as_str().map(str::to_string),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_tailer_skips_history_before_start() {
    init_tracing();
    let log = MemoryOplog::new();
    for id in ["h1", "h2", "h3"] {
        log.append("blog.posts", OperationKind::Delete, json!({"_id": id}), None).await;
    }

    let recorder = Arc::new(Recorder::default());
    let mut tailer = Tailer::new(Arc::new(log.clone()), &feed_settings());
    tailer.add_handler("blog.posts", OperationKind::Delete, recorder.clone());
    tailer.bootstrap().await.unwrap();
    let start = tailer.resume_token().unwrap();
    assert_eq!(start, Position(3));

    log.append("blog.posts", OperationKind::Delete, json!({"_id": "n1"}), None).await;
    log.kill_cursors().await;
    log.append("blog.posts", OperationKind::Delete, json!({"_id": "n2"}), None).await;

    let (handle, signal) = stop_signal();
    let task = tokio::spawn(async move {
        tailer.run(signal).await.map(|_| tailer.resume_token())
    });
    eventually!("two deliveries", recorder.seen.lock().await.len() >= 2);
    handle.stop();
    let token = task.await.unwrap().unwrap();

    assert_eq!(delete_ids(&recorder.seen.lock().await), vec!["n1", "n2"]);
    assert!(token.unwrap() > start);
}

#[tokio::test]
async fn test_restart_after_crash_redelivers_at_most_once() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let checkpoint_path = tmp.path().join("feed.json");
    let log = MemoryOplog::new();
    log.append_noop().await;

    // First run hangs while handling "b" and is killed
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut first = Tailer::new(Arc::new(log.clone()), &feed_settings())
        .with_checkpoint(Arc::new(FileCheckpoint::new(&checkpoint_path)));
    first.add_handler(
        "blog.posts",
        OperationKind::Delete,
        Arc::new(Hanging {
            seen: seen.clone(),
            hang_on: json!("b"),
        }),
    );
    first.bootstrap().await.unwrap();
    for id in ["a", "b", "c"] {
        log.append("blog.posts", OperationKind::Delete, json!({"_id": id}), None).await;
    }

    let (_handle, signal) = stop_signal();
    let crashed = tokio::spawn(async move { first.run(signal).await });
    eventually!("the hang", seen.lock().await.len() == 2);
    crashed.abort();
    let _ = crashed.await;
    assert_eq!(delete_ids(&seen.lock().await), vec!["a", "b"]);

    let checkpoint = FileCheckpoint::new(&checkpoint_path);
    assert_eq!(checkpoint.load().await.unwrap(), Some(Position(2)));

    // Second run resumes from the checkpoint
    let recorder = Arc::new(Recorder::default());
    let mut second = Tailer::new(Arc::new(log.clone()), &feed_settings())
        .with_checkpoint(Arc::new(checkpoint));
    second.add_handler("blog.posts", OperationKind::Delete, recorder.clone());

    let (handle, signal) = stop_signal();
    let task = tokio::spawn(async move { second.run(signal).await });
    eventually!("redelivery", recorder.seen.lock().await.len() >= 2);
    handle.stop();
    task.await.unwrap().unwrap();

    assert_eq!(delete_ids(&recorder.seen.lock().await), vec!["b", "c"]);
}

#[tokio::test]
async fn test_store_writes_reach_the_log() {
    let oplog = MemoryOplog::new();
    let store = Arc::new(MemoryStore::new().with_oplog(oplog.clone()));
    let mapper = Mapper::new(registry(), store.clone());

    let id = save_user(&mapper, "ann").await;
    let entries = {
        let mut cursor = oplog
            .open_cursor("oplog.rs", &serde_json::Map::new())
            .await
            .unwrap();
        let mut entries = Vec::new();
        while let Some(entry) = cursor.next().await.unwrap() {
            entries.push(entry);
        }
        entries
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["ns"], json!("docmap.user"));
    assert_eq!(entries[0]["o"]["_id"], json!(id));
    assert!(matcher::matches(&entries[0], &Predicate::equals("op", "i").unwrap().compile()).unwrap());
}

// =============================================================================
// Search indexing end to end
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_index_follows_the_store() {
    init_tracing();
    let oplog = MemoryOplog::new();
    let store = Arc::new(MemoryStore::new().with_oplog(oplog.clone()));
    let mapper = Mapper::new(registry(), store.clone());
    let backend = Arc::new(MemorySearch::new());

    let post_type = mapper.registry().get("Post").unwrap();
    let index = Arc::new(
        IndexDefinition::new("primary", post_type)
            .term(Term::new("title").boost(2.0))
            .term(Term::new("body"))
            .base_filter(Predicate::equals("published", true).unwrap()),
    );
    let (handle, signal) = stop_signal();
    let sync = Arc::new(
        IndexSynchronizer::new(
            index.clone(),
            mapper.clone(),
            backend.clone(),
            RetrySettings::default(),
        )
        .with_stop(signal.clone()),
    );

    let log: Arc<dyn ReplicationLog> = Arc::new(oplog.clone());
    let tasks = search::watch(&[sync], &feed_settings(), |_| Ok(Arc::clone(&log)), signal).unwrap();
    assert_eq!(tasks.len(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let author = save_user(&mapper, "ann").await;
    let post = save_post(&mapper, "Rust ownership", &author, &[]).await;
    let post_id = post.id().unwrap().to_string();
    eventually!("indexing", backend.len("docmap-post").await == 1);

    let results = search::search(&mapper, backend.as_ref(), &[&index], "rust", 1, 5, None)
        .await
        .unwrap();
    assert_eq!(results.total, 1);
    let (found, meta) = &results.hits[0];
    assert_eq!(found.id(), Some(post_id.as_str()));
    assert_eq!((meta.rank, meta.relevance), (1, 100));
    assert!(!results.has_more());

    // An update that leaves every indexed term alone costs no index write
    let views = mapper.field("Post", "views").unwrap();
    mapper
        .query("Post")
        .unwrap()
        .filter_by("id", post_id.as_str())
        .unwrap()
        .update(&views.inc(1).unwrap())
        .await
        .unwrap();

    mapper.delete(&post).await.unwrap();
    eventually!("removal", backend.len("docmap-post").await == 0);
    assert_eq!(backend.write_count().await, 2);

    handle.stop();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_search_phase_failure_is_an_empty_page() {
    let mapper = Mapper::new(registry(), Arc::new(MemoryStore::new()));
    let backend = MemorySearch::new();
    let index = IndexDefinition::new("primary", mapper.registry().get("Post").unwrap());

    // The index was never created
    let results = search::search(&mapper, &backend, &[&index], "rust", 1, 5, None)
        .await
        .unwrap();
    assert!(results.is_empty());
    assert_eq!(results.total, 0);
}

#[tokio::test]
async fn test_reindex_selected_namespaces() {
    let store = Arc::new(MemoryStore::new());
    let mapper = Mapper::new(registry(), store.clone());
    let backend = Arc::new(MemorySearch::new());
    let author = save_user(&mapper, "ann").await;
    save_post(&mapper, "alpha", &author, &[]).await;
    save_post(&mapper, "beta", &author, &[]).await;

    let posts = IndexDefinition::new("primary", mapper.registry().get("Post").unwrap())
        .term(Term::new("title"));
    let users = IndexDefinition::new("primary", mapper.registry().get("User").unwrap())
        .term(Term::new("name"));
    let synchronizers: Vec<Arc<IndexSynchronizer>> = [posts, users]
        .into_iter()
        .map(|index| {
            Arc::new(IndexSynchronizer::new(
                Arc::new(index),
                mapper.clone(),
                backend.clone(),
                RetrySettings::default(),
            ))
        })
        .collect();

    search::reindex(&synchronizers, Some(&["docmap-post"])).await.unwrap();
    assert_eq!(backend.len("docmap-post").await, 2);
    assert_eq!(backend.len("docmap-user").await, 0);
    assert_eq!(store.count("docmap.post", &serde_json::Map::new()).await.unwrap(), 2);
}

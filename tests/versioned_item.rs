use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gosub_storage::storage::types::meta_from_value;
use gosub_storage::storage::{ItemOptions, MetaMap, RemoveOptions, StorageService};
use gosub_storage::StorageError;
use serde_json::{json, Value};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn meta(v: Value) -> MetaMap {
    meta_from_value(Some(v))
}

#[tokio::test]
async fn counter_is_migrated_once_on_first_read() {
    init_logger();
    let storage = StorageService::in_memory();
    storage.set_item("local:counter", json!({"count": 5})).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let counter = storage
        .define_item::<Value>(
            "local:counter",
            ItemOptions::new().version(2).migration(2, move |mut old| {
                c.fetch_add(1, Ordering::SeqCst);
                if old.get("count").is_none() {
                    old["count"] = json!(0);
                }
                Ok(old)
            }),
        )
        .unwrap();

    assert_eq!(counter.get_value().await.unwrap(), Some(json!({"count": 5})));
    assert_eq!(counter.get_value().await.unwrap(), Some(json!({"count": 5})));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        Value::Object(storage.get_meta("local:counter").await.unwrap()),
        json!({"v": 2})
    );
}

#[tokio::test]
async fn steps_run_in_order_and_missing_steps_pass_through() {
    init_logger();
    let storage = StorageService::in_memory();
    storage.set_item("local:doc", json!([])).await.unwrap();

    let trace = Arc::new(Mutex::new(Vec::new()));
    let step = |version: u32| {
        let trace = trace.clone();
        move |mut v: Value| {
            trace.lock().unwrap().push((version, v.clone()));
            v.as_array_mut().unwrap().push(json!(version));
            Ok::<_, anyhow::Error>(v)
        }
    };

    let item = storage
        .define_item::<Value>(
            "local:doc",
            ItemOptions::new()
                .version(4)
                .migration(2, step(2))
                .migration(4, step(4)),
        )
        .unwrap();

    assert_eq!(item.get_value().await.unwrap(), Some(json!([2, 4])));
    assert_eq!(
        *trace.lock().unwrap(),
        vec![(2, json!([])), (4, json!([2]))],
        "step 3 has no function and passes the value through unchanged"
    );
    assert_eq!(
        storage.get_meta("local:doc").await.unwrap().get("v"),
        Some(&json!(4))
    );
}

#[tokio::test]
async fn full_chain_feeds_each_step_the_previous_output() {
    init_logger();
    let storage = StorageService::in_memory();
    storage.set_item("sync:n", json!(1)).await.unwrap();

    let item = storage
        .define_item::<i64>(
            "sync:n",
            ItemOptions::new()
                .version(4)
                .migration(2, |v| Ok(json!(v.as_i64().unwrap_or(0) + 10)))
                .migration_async(3, |v| async move {
                    Ok::<_, anyhow::Error>(json!(v.as_i64().unwrap_or(0) * 2))
                })
                .migration(4, |v| Ok(json!(v.as_i64().unwrap_or(0) - 1))),
        )
        .unwrap();

    assert_eq!(item.get_value().await.unwrap(), Some(21));
    assert_eq!(item.get_meta().await.unwrap().get("v"), Some(&json!(4)));
}

#[tokio::test]
async fn downgrade_is_refused_and_leaves_data_untouched() {
    init_logger();
    let storage = StorageService::in_memory();
    storage.set_item("local:prefs", json!({"dark": true})).await.unwrap();
    storage
        .set_meta("local:prefs", meta(json!({"v": 3, "owner": "sync"})))
        .await
        .unwrap();
    let before = storage.snapshot(gosub_storage::storage::Area::Local, &[]).await.unwrap();

    let reported = Arc::new(AtomicUsize::new(0));
    let r = reported.clone();
    let item = storage
        .define_item::<Value>(
            "local:prefs",
            ItemOptions::new()
                .version(2)
                .migration(2, |_| Ok(json!("must not run")))
                .on_migration_error(move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();

    match item.get_value().await {
        Err(StorageError::VersionDowngrade { key, stored, target }) => {
            assert_eq!(key, "local:prefs");
            assert_eq!((stored, target), (3, 2));
        }
        other => panic!("expected a version downgrade, got {other:?}"),
    }
    assert!(item.set_value(json!(1)).await.is_err());
    assert!(reported.load(Ordering::SeqCst) >= 1);

    let after = storage.snapshot(gosub_storage::storage::Area::Local, &[]).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn explicit_migrate_is_idempotent() {
    init_logger();
    let storage = StorageService::in_memory();
    storage.set_item("local:k", json!("old")).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let item = storage
        .define_item::<String>(
            "local:k",
            ItemOptions::new().version(2).migration(2, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(json!("new"))
            }),
        )
        .unwrap();

    item.migrate().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    item.migrate().await.unwrap();
    item.migrate().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(item.get_value().await.unwrap().as_deref(), Some("new"));
}

#[tokio::test]
async fn concurrent_first_reads_initialize_once() {
    init_logger();
    let storage = StorageService::in_memory();

    let produced = Arc::new(AtomicUsize::new(0));
    let p = produced.clone();
    let item = storage
        .define_item::<usize>(
            "local:seed",
            ItemOptions::new().init_async(move || {
                let p = p.clone();
                async move {
                    tokio::task::yield_now().await;
                    Ok::<_, anyhow::Error>(p.fetch_add(1, Ordering::SeqCst) + 100)
                }
            }),
        )
        .unwrap();

    let (a, b) = tokio::join!(item.get_value(), item.get_value());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(produced.load(Ordering::SeqCst), 1);
    assert_eq!(a, Some(100));
    assert_eq!(a, b);
    assert_eq!(storage.get_item("local:seed").await.unwrap(), Some(json!(100)));
    assert_eq!(storage.get_meta("local:seed").await.unwrap().get("v"), Some(&json!(1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_reads_initialize_once_across_threads() {
    init_logger();
    let storage = StorageService::in_memory();

    let produced = Arc::new(AtomicUsize::new(0));
    let p = produced.clone();
    let item = storage
        .define_item::<usize>(
            "local:seed",
            ItemOptions::new().init(move || p.fetch_add(1, Ordering::SeqCst)),
        )
        .unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let item = item.clone();
            tokio::spawn(async move { item.get_value().await.unwrap() })
        })
        .collect();

    let mut seen = Vec::new();
    for t in tasks {
        seen.push(t.await.unwrap());
    }

    assert_eq!(produced.load(Ordering::SeqCst), 1);
    assert!(seen.iter().all(|v| *v == Some(0)));
}

#[tokio::test]
async fn read_after_write() {
    init_logger();
    let storage = StorageService::in_memory();
    let item = storage
        .define_item("session:tabs", ItemOptions::new().fallback(Vec::<String>::new()))
        .unwrap();

    for n in 0..5 {
        let tabs: Vec<String> = (0..n).map(|i| format!("tab-{i}")).collect();
        item.set_value(tabs.clone()).await.unwrap();
        assert_eq!(item.get_value().await.unwrap(), Some(tabs));
    }
}

#[tokio::test]
async fn remove_value_and_meta() {
    init_logger();
    let storage = StorageService::in_memory();
    let item = storage
        .define_item::<u32>("local:counter", ItemOptions::new().version(2))
        .unwrap();
    item.set_value(3).await.unwrap();
    item.set_meta(meta(json!({"updated": "today"}))).await.unwrap();

    item.remove_meta(Some(&["updated".to_string()])).await.unwrap();
    assert_eq!(Value::Object(item.get_meta().await.unwrap()), json!({"v": 2}));

    item.remove_value(RemoveOptions::default()).await.unwrap();
    assert_eq!(item.get_value().await.unwrap(), None);
    assert!(!item.get_meta().await.unwrap().is_empty());

    item.set_value(4).await.unwrap();
    storage
        .remove_item("local:counter", RemoveOptions { remove_meta: true })
        .await
        .unwrap();
    assert_eq!(storage.get_item("local:counter").await.unwrap(), None);
    assert!(storage.get_meta("local:counter").await.unwrap().is_empty());
}

#[tokio::test]
async fn accessors_expose_definition() {
    let storage = StorageService::in_memory();
    let item = storage
        .define_item("managed:policy", ItemOptions::new().version(3).fallback(true))
        .unwrap();
    assert_eq!(item.key(), "managed:policy");
    assert_eq!(item.version(), 3);
    assert_eq!(item.fallback(), Some(&true));
}

#[tokio::test]
async fn item_watch_substitutes_fallback() {
    init_logger();
    let storage = StorageService::in_memory();
    let item = storage
        .define_item("local:mode", ItemOptions::new().fallback("auto".to_string()))
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _unwatch = item
        .watch(move |new, old| {
            let _ = tx.send((new, old));
        })
        .unwrap();

    item.set_value("manual".into()).await.unwrap();
    item.remove_value(RemoveOptions::default()).await.unwrap();

    let first = rx.recv().await.unwrap();
    assert_eq!(first, (Some("manual".to_string()), Some("auto".to_string())));
    let second = rx.recv().await.unwrap();
    assert_eq!(second, (Some("auto".to_string()), Some("manual".to_string())));
}

#[tokio::test]
async fn set_value_refuses_to_lower_a_newer_stored_version() {
    init_logger();
    let storage = StorageService::in_memory();
    let newer = storage
        .define_item::<u32>("local:score", ItemOptions::new().version(5))
        .unwrap();
    newer.set_value(1).await.unwrap();
    newer.remove_value(RemoveOptions::default()).await.unwrap();
    assert_eq!(storage.get_meta("local:score").await.unwrap().get("v"), Some(&json!(5)));

    let older = storage
        .define_item::<u32>("local:score", ItemOptions::new().version(2))
        .unwrap();
    match older.set_value(7).await {
        Err(StorageError::VersionDowngrade { stored, target, .. }) => {
            assert_eq!((stored, target), (5, 2));
        }
        other => panic!("expected a version downgrade, got {other:?}"),
    }

    assert_eq!(storage.get_item("local:score").await.unwrap(), None);
    assert_eq!(
        Value::Object(storage.get_meta("local:score").await.unwrap()),
        json!({"v": 5})
    );
}

#[tokio::test]
async fn abandoned_first_access_does_not_block_migrate() {
    init_logger();
    let storage = StorageService::in_memory();
    storage.set_item("local:slow", json!(1)).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let item = storage
        .define_item::<i64>(
            "local:slow",
            ItemOptions::new().version(2).migration_async(2, move |v| {
                c.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, anyhow::Error>(json!(v.as_i64().unwrap_or(0) + 1))
                }
            }),
        )
        .unwrap();

    let abandoned = tokio::time::timeout(Duration::from_millis(10), item.get_value()).await;
    assert!(abandoned.is_err());

    tokio::time::timeout(Duration::from_secs(2), item.migrate())
        .await
        .expect("migrate must not wait forever on an abandoned run")
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(item.get_value().await.unwrap(), Some(2));
    assert_eq!(item.get_meta().await.unwrap().get("v"), Some(&json!(2)));
}

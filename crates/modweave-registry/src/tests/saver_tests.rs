use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::store::{KvStore, MemoryKv, ModSaver, StoredMod};

/// A store whose writes take a while, so saves can pile up behind one.
#[derive(Default)]
struct SlowKv {
    inner: MemoryKv,
}

#[async_trait]
impl KvStore for SlowKv {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(40)).await;
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.inner.remove(key).await
    }
}

fn snapshot(n: usize) -> Vec<StoredMod> {
    // Content is irrelevant to coalescing; an empty registry suffices.
    let _ = n;
    Vec::new()
}

#[tokio::test]
async fn saves_during_a_write_coalesce_into_exactly_one_more() {
    let kv = Arc::new(SlowKv::default());
    let saver = Arc::new(ModSaver::new(Arc::clone(&kv)));

    let first = {
        let saver = Arc::clone(&saver);
        tokio::spawn(async move { saver.save(snapshot(0)).await })
    };
    // Give the first save time to take the writer slot.
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Both of these land while the first write is still in flight; they
    // collapse into a single re-run.
    saver.save(snapshot(1)).await;
    saver.save(snapshot(2)).await;

    first.await.expect("first save");
    // Wait out the deferred re-run.
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(kv.inner.write_count(), 2, "one in-flight write plus one re-run");
}

#[tokio::test]
async fn sequential_saves_each_write() {
    let kv = Arc::new(SlowKv::default());
    let saver = ModSaver::new(Arc::clone(&kv));
    saver.save(snapshot(0)).await;
    saver.save(snapshot(1)).await;
    assert_eq!(kv.inner.write_count(), 2);
}

#[tokio::test]
async fn load_of_a_missing_registry_is_empty() {
    let saver = ModSaver::new(Arc::new(MemoryKv::new()));
    assert!(saver.load().await.is_empty());
}

//! Hash store paging behaviour shared by every backend.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use repostscan::hashing::ImageHash;
use repostscan::storage::{
    HashStore, MemoryHashStore, ResilientHashStore, SqliteHashStore, StoreResilienceConfig,
};
use repostscan::{Error, Post, RowId};
use tempfile::TempDir;
use test_case::test_case;

fn post(i: u32, hashed: bool) -> Post {
    let post = Post::new(0, format!("p{i}"), "a", i64::from(i));
    if hashed {
        post.with_hash(ImageHash::from_bytes(i.to_be_bytes().to_vec()))
    } else {
        post
    }
}

/// 20 posts; every fifth has no hash yet.
fn corpus() -> Vec<Post> {
    (1..=20).map(|i| post(i, i % 5 != 0)).collect()
}

fn memory_store() -> Box<dyn HashStore> {
    let store = MemoryHashStore::new();
    for p in corpus() {
        store.insert_post(p);
    }
    Box::new(store)
}

fn sqlite_store(dir: &TempDir) -> Box<dyn HashStore> {
    let store = SqliteHashStore::new(dir.path().join("posts.db")).unwrap();
    for p in corpus() {
        store.insert_post(&p).unwrap();
    }
    Box::new(store)
}

fn stores(dir: &TempDir) -> Vec<(&'static str, Box<dyn HashStore>)> {
    vec![("memory", memory_store()), ("sqlite", sqlite_store(dir))]
}

fn scan_after(store: &dyn HashStore, limit: usize) -> (Vec<RowId>, usize) {
    let mut seen = Vec::new();
    let mut after = None;
    let mut pages = 0;
    loop {
        let page = store.page_hashes_after(after, limit).unwrap();
        pages += 1;
        seen.extend(page.rows.iter().map(|(row_id, _)| *row_id));
        if page.is_last(limit) || page.last_row_id.is_none() {
            break;
        }
        after = page.last_row_id;
    }
    (seen, pages)
}

fn expected_rows() -> Vec<RowId> {
    (1..=20).filter(|i| i % 5 != 0).collect()
}

#[test_case(1; "single row pages")]
#[test_case(3; "uneven pages")]
#[test_case(5; "page size divides corpus")]
#[test_case(100; "one page")]
fn test_keyset_scan_visits_every_hash_once(limit: usize) {
    let dir = TempDir::new().unwrap();
    for (name, store) in stores(&dir) {
        let (seen, _) = scan_after(store.as_ref(), limit);
        assert_eq!(seen, expected_rows(), "backend {name}, limit {limit}");
    }
}

#[test]
fn test_offset_pages_cover_the_corpus() {
    let dir = TempDir::new().unwrap();
    for (name, store) in stores(&dir) {
        let mut seen = Vec::new();
        let mut offset = 0;
        loop {
            let page = store.page_hashes(offset, 4).unwrap();
            if page.rows.is_empty() {
                break;
            }
            offset += page.rows.len();
            seen.extend(page.rows.into_iter().map(|(row_id, _)| row_id));
        }
        assert_eq!(seen, expected_rows(), "backend {name}");
    }
}

#[test]
fn test_count_and_lookup_agree() {
    let dir = TempDir::new().unwrap();
    for (name, store) in stores(&dir) {
        assert_eq!(store.count_hashes().unwrap(), 16, "backend {name}");

        let fetched = store.get_posts(&[3, 5, 999, 1]).unwrap();
        let ids: Vec<_> = fetched
            .iter()
            .map(|p| p.as_ref().map(|p| p.post_id.as_str().to_string()))
            .collect();
        assert_eq!(
            ids,
            vec![
                Some("p3".to_string()),
                Some("p5".to_string()),
                None,
                Some("p1".to_string())
            ],
            "backend {name}"
        );

        let hash = store.get_hash_by_post_id(&"p7".into()).unwrap().unwrap();
        assert_eq!(hash.to_hex(), "00000007");
        assert!(store.get_hash_by_post_id(&"p10".into()).unwrap().is_none());
    }
}

#[test]
fn test_updated_hash_joins_the_scan() {
    let dir = TempDir::new().unwrap();
    for (name, store) in stores(&dir) {
        store
            .update_hash(10, &ImageHash::from_bytes(vec![0, 0, 0, 10]))
            .unwrap();
        let (seen, _) = scan_after(store.as_ref(), 7);
        assert!(seen.contains(&10), "backend {name}");
        assert_eq!(seen.len(), 17, "backend {name}");
    }
}

#[test]
fn test_breaker_opens_on_unreachable_store() {
    let inner = MemoryHashStore::new();
    inner.insert_post(post(1, true));
    inner.set_unavailable(true);
    let store = ResilientHashStore::new(
        inner,
        StoreResilienceConfig::default().with_failure_threshold(2),
        "memory",
    );

    for _ in 0..2 {
        assert!(matches!(
            store.page_hashes_after(None, 10),
            Err(Error::DataSourceUnavailable { .. })
        ));
    }
    store.inner().set_unavailable(false);
    let err = store.page_hashes_after(None, 10).unwrap_err();
    assert!(err.to_string().contains("circuit"), "got {err}");
}

#[test]
fn test_resilient_store_passes_through_when_healthy() {
    let inner = MemoryHashStore::new();
    for p in corpus() {
        inner.insert_post(p);
    }
    let store = ResilientHashStore::new(inner, StoreResilienceConfig::default(), "memory");
    let (seen, pages) = scan_after(&store, 6);
    assert_eq!(seen, expected_rows());
    assert_eq!(pages, 3);
}

use super::*;
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

fn open_cache() -> DedupCache {
    let cache = DedupCache::ephemeral();
    cache.init().unwrap();
    cache
}

#[test]
fn test_unseen_then_seen() {
    let cache = open_cache();
    let fp = Fingerprint::of("this is the nominal case test");

    assert!(!cache.check_if_seen(&fp).unwrap());
    assert_ok!(cache.mark_seen(&fp));
    assert!(cache.check_if_seen(&fp).unwrap());
}

#[test]
fn test_mark_seen_is_idempotent() {
    let cache = open_cache();
    let fp = Fingerprint::of("Pod web Container app has been restarted 2 time(s)");

    assert_ok!(cache.mark_seen(&fp));
    assert_ok!(cache.mark_seen(&fp));

    assert!(cache.check_if_seen(&fp).unwrap());
    assert_eq!(cache.len().unwrap(), 1);
}

#[test]
fn test_check_does_not_mutate() {
    let cache = open_cache();
    let fp = Fingerprint::of("never marked");

    assert!(!cache.check_if_seen(&fp).unwrap());
    assert!(!cache.check_if_seen(&fp).unwrap());
    assert!(cache.is_empty().unwrap());
}

#[test]
fn test_operations_before_init_fail_fast() {
    let cache = DedupCache::ephemeral();
    let fp = Fingerprint::of("early");

    assert!(matches!(cache.check_if_seen(&fp), Err(CacheError::NotInitialized)));
    assert!(matches!(cache.mark_seen(&fp), Err(CacheError::NotInitialized)));
    assert!(matches!(
        cache.test_and_mark_seen(&fp),
        Err(CacheError::NotInitialized)
    ));
}

#[test]
fn test_double_init_rejected() {
    let cache = open_cache();
    assert_err!(cache.init());
    assert!(matches!(cache.init(), Err(CacheError::AlreadyInitialized)));
}

#[test]
fn test_close_removes_ephemeral_store() {
    let cache = open_cache();
    cache.mark_seen(&Fingerprint::of("gone after close")).unwrap();
    let path = cache.path().unwrap();
    assert!(path.exists());

    cache.close().unwrap();

    assert!(!path.exists());
    assert!(cache.path().is_none());
    assert!(matches!(
        cache.check_if_seen(&Fingerprint::of("gone after close")),
        Err(CacheError::NotInitialized)
    ));
}

#[test]
fn test_fresh_instance_after_close_is_empty() {
    let fp = Fingerprint::of("seen by the first instance");

    let first = open_cache();
    first.mark_seen(&fp).unwrap();
    first.close().unwrap();

    let second = open_cache();
    assert!(!second.check_if_seen(&fp).unwrap());
    assert!(second.is_empty().unwrap());
}

#[test]
fn test_close_twice_is_harmless() {
    let cache = open_cache();
    cache.close().unwrap();
    cache.close().unwrap();
}

#[test]
fn test_persistent_store_is_kept_on_close() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dedup");

    let cache = DedupCache::new(CacheLocation::Persistent(path.clone()));
    cache.init().unwrap();
    cache.mark_seen(&Fingerprint::of("kept")).unwrap();
    cache.close().unwrap();

    assert!(path.exists());
}

#[test]
fn test_test_and_mark_seen() {
    let cache = open_cache();
    let fp = Fingerprint::of("atomic");

    assert!(!cache.test_and_mark_seen(&fp).unwrap());
    assert!(cache.test_and_mark_seen(&fp).unwrap());
    assert!(cache.check_if_seen(&fp).unwrap());
}

#[test]
fn test_test_and_mark_seen_single_winner_under_contention() {
    let cache = Arc::new(open_cache());
    let fp = Fingerprint::of("contended message");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            std::thread::spawn(move || cache.test_and_mark_seen(&fp).unwrap())
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|already_seen| !already_seen)
        .count();

    assert_eq!(winners, 1);
}

#[test]
fn test_distinct_messages_have_distinct_fingerprints() {
    let fingerprints: HashSet<Fingerprint> = (0..5000)
        .map(|i| Fingerprint::of(&format!("Pod pod-{} Container app has been restarted {} time(s)", i, i % 7)))
        .collect();

    assert_eq!(fingerprints.len(), 5000);
}

#[test]
fn test_fingerprint_is_deterministic() {
    let a = Fingerprint::of("same text");
    let b = Fingerprint::of("same text");
    assert_eq!(a, b);
    assert_eq!(a.to_string().len(), 64);
}

#[test]
fn test_read_failure_counts_as_not_seen() {
    let fp = Fingerprint::of("Pod web Container app has been restarted 1 time(s)");

    assert!(seen_or_fail_open(&fp, Ok(true)));
    assert!(!seen_or_fail_open(&fp, Ok(false)));
    assert!(!seen_or_fail_open(
        &fp,
        Err(sled::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone")))
    ));
}

#[test]
fn test_write_failure_is_reported_and_leaves_store_untouched() {
    let cache = open_cache();
    let fp = Fingerprint::of("write fails");
    cache.fail_writes(true);

    assert!(matches!(cache.mark_seen(&fp), Err(CacheError::Store(_))));
    assert_err!(cache.test_and_mark_seen(&fp));
    assert!(!cache.check_if_seen(&fp).unwrap());

    cache.fail_writes(false);
    assert_ok!(cache.mark_seen(&fp));
    assert!(cache.check_if_seen(&fp).unwrap());
}

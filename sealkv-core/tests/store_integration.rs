//! End-to-end tests of the encrypted store against real directories.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::TestStore;
use sealkv_core::persistence::{PersistenceLayer, Record};
use sealkv_core::paths::StoragePaths;
use sealkv_core::{ErrorKind, StoreConfig};
use tokio::task::JoinSet;

#[tokio::test]
async fn test_set_get_clear_scenario() {
    let test = TestStore::new();
    let store = &test.store;

    store.set_item("token", "abc123").await.expect("set");
    assert_eq!(
        store.get_item("token").await.expect("get").as_deref(),
        Some("abc123")
    );

    store.clear().await.expect("clear");
    assert_eq!(store.get_item("token").await.expect("get"), None);
}

#[tokio::test]
async fn test_overwrite_and_unicode_values() {
    let test = TestStore::new();
    let store = &test.store;

    store.set_item("greeting", "hello").await.expect("set");
    store.set_item("greeting", "grüß dich 👋").await.expect("overwrite");
    store.set_item("empty", "").await.expect("empty value");

    assert_eq!(
        store.get_item("greeting").await.expect("get").as_deref(),
        Some("grüß dich 👋")
    );
    assert_eq!(store.get_item("empty").await.expect("get").as_deref(), Some(""));
}

#[tokio::test]
async fn test_plaintext_never_reaches_disk() {
    let test = TestStore::new();
    test.store
        .set_item("api-token", "very-secret-plaintext")
        .await
        .expect("set");

    let mut stack = vec![test.paths().store_dir().to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).expect("list") {
            let path = entry.expect("entry").path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let bytes = std::fs::read(&path).expect("read");
            assert!(
                !String::from_utf8_lossy(&bytes).contains("very-secret-plaintext"),
                "plaintext leaked in {}",
                path.display()
            );
        }
    }
}

#[tokio::test]
async fn test_every_ciphertext_and_tag_bit_flip_is_detected() {
    let test = TestStore::new();
    test.store.set_item("token", "abc123").await.expect("set");

    let path = test.record_file("token");
    let original = std::fs::read(&path).expect("read record");
    let record = Record::decode(&original).expect("decode");

    let mut tampered_records = Vec::new();
    for byte in 0..record.ciphertext.len() {
        for bit in 0..8 {
            let mut tampered = record.clone();
            tampered.ciphertext[byte] ^= 1 << bit;
            tampered_records.push(tampered);
        }
    }
    for byte in 0..record.tag.len() {
        for bit in 0..8 {
            let mut tampered = record.clone();
            tampered.tag[byte] ^= 1 << bit;
            tampered_records.push(tampered);
        }
    }
    let mut tampered = record.clone();
    tampered.nonce[0] ^= 1;
    tampered_records.push(tampered);

    for tampered in tampered_records {
        std::fs::write(&path, tampered.encode().expect("encode")).expect("write");
        let err = test.store.get_item("token").await.expect_err("tampered");
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    }

    std::fs::write(&path, &original).expect("restore");
    assert_eq!(
        test.store.get_item("token").await.expect("get").as_deref(),
        Some("abc123")
    );
}

#[tokio::test]
async fn test_record_swapped_between_keys_is_detected() {
    let test = TestStore::new();
    test.store.set_item("alice", "1").await.expect("set");
    test.store.set_item("bob", "2").await.expect("set");

    std::fs::copy(test.record_file("alice"), test.record_file("bob")).expect("copy");
    let err = test.store.get_item("bob").await.expect_err("swapped");
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
}

#[tokio::test]
async fn test_truncated_record_is_detected() {
    let test = TestStore::new();
    test.store.set_item("token", "abc123").await.expect("set");

    let path = test.record_file("token");
    let bytes = std::fs::read(&path).expect("read");
    std::fs::write(&path, &bytes[..bytes.len() / 2]).expect("truncate");

    let err = test.store.get_item("token").await.expect_err("truncated");
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let test = TestStore::new();
    let store = &test.store;

    store.remove_item("never-written").await.expect("remove missing");
    store.set_item("token", "abc123").await.expect("set");
    store.remove_item("token").await.expect("remove");
    store.remove_item("token").await.expect("remove again");

    assert_eq!(store.get_item("token").await.expect("get"), None);
    assert!(!store.contains_item("token").await.expect("contains"));
}

#[tokio::test]
async fn test_clear_keeps_master_key() {
    let test = TestStore::new();
    let store = &test.store;

    for index in 0..5 {
        store
            .set_item(&format!("key-{index}"), "value")
            .await
            .expect("set");
    }
    store.clear().await.expect("clear");

    for index in 0..5 {
        assert!(!store
            .contains_item(&format!("key-{index}"))
            .await
            .expect("contains"));
    }
    store.set_item("after", "clear").await.expect("set after clear");
    assert_eq!(
        store.get_item("after").await.expect("get").as_deref(),
        Some("clear")
    );
    assert_eq!(test.credential.seal_calls(), 1);
}

#[tokio::test]
async fn test_clear_on_empty_store() {
    let test = TestStore::new();
    test.store.clear().await.expect("clear empty");
    test.store.clear().await.expect("clear twice");
    assert_eq!(test.credential.seal_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_to_distinct_keys() {
    let test = TestStore::new();
    let store = Arc::new(test.reopen());
    store.initialize().await.expect("initialize");

    let mut tasks = JoinSet::new();
    for index in 0..100 {
        let store = Arc::clone(&store);
        tasks.spawn(async move {
            store
                .set_item(&format!("key-{index}"), &format!("value-{index}"))
                .await
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.expect("join").expect("set");
    }

    for index in 0..100 {
        assert_eq!(
            store
                .get_item(&format!("key-{index}"))
                .await
                .expect("get"),
            Some(format!("value-{index}"))
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_to_same_key() {
    let test = TestStore::new();
    let store = Arc::new(test.reopen());
    store.initialize().await.expect("initialize");

    let mut tasks = JoinSet::new();
    for index in 0..50 {
        let store = Arc::clone(&store);
        tasks.spawn(async move { store.set_item("shared", &format!("value-{index}")).await });
    }
    while let Some(result) = tasks.join_next().await {
        result.expect("join").expect("set");
    }

    let expected: HashSet<String> = (0..50).map(|index| format!("value-{index}")).collect();
    let value = store
        .get_item("shared")
        .await
        .expect("get")
        .expect("present");
    assert!(expected.contains(&value));

    let generation_dir = test.paths().generation_dir(test.current_generation());
    let names: Vec<String> = std::fs::read_dir(generation_dir)
        .expect("list")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(
        names.iter().filter(|name| StoragePaths::is_record_file(name)).count(),
        1
    );
    assert!(!names.iter().any(|name| StoragePaths::is_temp_file(name)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_set_and_remove_on_same_key() {
    let test = TestStore::new();
    let store = Arc::new(test.reopen());
    store.initialize().await.expect("initialize");

    let mut tasks = JoinSet::new();
    for index in 0..50 {
        let store = Arc::clone(&store);
        tasks.spawn(async move {
            if index % 2 == 0 {
                store.set_item("shared", &format!("value-{index}")).await
            } else {
                store.remove_item("shared").await
            }
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.expect("join").expect("set or remove");
    }

    let written: HashSet<String> = (0..50)
        .step_by(2)
        .map(|index| format!("value-{index}"))
        .collect();
    let stored = store.get_item("shared").await.expect("get");
    if let Some(value) = &stored {
        assert!(written.contains(value));
    }
    assert_eq!(store.contains_item("shared").await.expect("contains"), stored.is_some());

    let generation_dir = test.paths().generation_dir(test.current_generation());
    let names: Vec<String> = std::fs::read_dir(generation_dir)
        .expect("list")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
        .collect();
    assert!(names.iter().filter(|name| StoragePaths::is_record_file(name)).count() <= 1);
    assert!(!names.iter().any(|name| StoragePaths::is_temp_file(name)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_write_still_completes() {
    let test = TestStore::new();
    let store = Arc::new(test.reopen());
    store.initialize().await.expect("initialize");

    // Another handle on the root holds the store lock, so the write stalls
    // inside the blocking pool.
    let other = PersistenceLayer::open(test.paths()).expect("open layer");
    let pending = other.begin_generation().expect("hold store lock");

    let task = tokio::spawn({
        let store = Arc::clone(&store);
        async move { store.set_item("token", "abc123").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    task.abort();
    assert!(task.await.expect_err("aborted").is_cancelled());
    drop(pending);

    let mut stored = None;
    for _ in 0..50 {
        stored = store.get_item("token").await.expect("get");
        if stored.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stored.as_deref(), Some("abc123"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_clear_still_completes() {
    let test = TestStore::new();
    let store = Arc::new(test.reopen());
    store.set_item("token", "abc123").await.expect("set");
    let generation = test.current_generation();

    let other = PersistenceLayer::open(test.paths()).expect("open layer");
    let pending = other.begin_generation().expect("hold store lock");

    let task = tokio::spawn({
        let store = Arc::clone(&store);
        async move { store.clear().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    task.abort();
    assert!(task.await.expect_err("aborted").is_cancelled());
    drop(pending);

    // Item operations wait for the detached clear to release the store.
    assert_eq!(store.get_item("token").await.expect("get"), None);
    assert_eq!(test.current_generation(), generation + 1);

    store.set_item("token", "again").await.expect("set after clear");
    assert_eq!(
        store.get_item("token").await.expect("get").as_deref(),
        Some("again")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_racing_rotation_on_shared_root() {
    let test = TestStore::new();
    let writer = Arc::new(test.reopen());
    let rotator = test.reopen();
    writer.set_item("a", "1").await.expect("set");

    // The writer unseals the old key, then another instance rotates before
    // the record reaches disk.
    test.credential.set_prompt_delay(Duration::from_millis(300));
    let write = tokio::spawn({
        let writer = Arc::clone(&writer);
        async move { writer.set_item("b", "2").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    rotator.rotate_master_key().await.expect("rotate");
    write.await.expect("join").expect("set during rotation");
    test.credential.set_prompt_delay(Duration::ZERO);

    for store in [writer.as_ref(), &rotator] {
        assert_eq!(store.get_item("a").await.expect("get a").as_deref(), Some("1"));
        assert_eq!(store.get_item("b").await.expect("get b").as_deref(), Some("2"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_racing_rotation_on_shared_root() {
    let test = TestStore::new();
    let reader = Arc::new(test.reopen());
    let rotator = test.reopen();
    reader.set_item("a", "1").await.expect("set");

    test.credential.set_prompt_delay(Duration::from_millis(300));
    let read = tokio::spawn({
        let reader = Arc::clone(&reader);
        async move { reader.get_item("a").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    rotator.rotate_master_key().await.expect("rotate");
    assert_eq!(
        read.await.expect("join").expect("get during rotation").as_deref(),
        Some("1")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clear_races_with_writers() {
    let test = TestStore::new();
    let store = Arc::new(test.reopen());
    store.initialize().await.expect("initialize");

    let mut tasks = JoinSet::new();
    for index in 0..20 {
        let store = Arc::clone(&store);
        tasks.spawn(async move {
            store
                .set_item(&format!("key-{index}"), "value")
                .await
                .expect("set");
            if index == 10 {
                store.clear().await.expect("clear");
            }
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.expect("join");
    }

    for index in 0..20 {
        if let Some(value) = store.get_item(&format!("key-{index}")).await.expect("get") {
            assert_eq!(value, "value");
        }
    }
}

#[tokio::test]
async fn test_probe_is_independent_of_vault() {
    let test = TestStore::new();
    let store = &test.store;

    assert!(store.is_device_protected().await.expect("probe"));
    test.credential.set_active_credential(false);
    assert!(!store.is_device_protected().await.expect("probe"));
    test.credential.set_active_credential(true);
    assert!(store.is_device_protected().await.expect("probe"));

    test.credential.set_available(false);
    assert!(store.is_device_protected().await.expect("probe during outage"));

    test.credential.set_probe_available(false);
    let err = store.is_device_protected().await.expect_err("probe down");
    assert_eq!(err.kind(), ErrorKind::ProbeUnavailable);

    assert_eq!(test.credential.seal_calls(), 0);
    assert_eq!(test.credential.unseal_calls(), 0);
    assert_eq!(test.credential.probe_calls(), 5);
}

#[tokio::test]
async fn test_require_active_credential_locks_out() {
    let test = TestStore::requiring_credential();
    let store = &test.store;

    store.set_item("token", "abc123").await.expect("set");
    test.credential.set_active_credential(false);

    let err = store.set_item("token", "new").await.expect_err("set locked");
    assert_eq!(err.kind(), ErrorKind::LockedOut);
    let err = store.get_item("token").await.expect_err("get locked");
    assert_eq!(err.kind(), ErrorKind::LockedOut);
    assert_eq!(store.get_item("absent").await.expect("absent"), None);

    test.credential.set_active_credential(true);
    assert_eq!(
        store.get_item("token").await.expect("get").as_deref(),
        Some("abc123")
    );
}

#[tokio::test]
async fn test_advisory_policy_works_without_credential() {
    let test = TestStore::new();
    test.credential.set_active_credential(false);

    test.store.set_item("token", "abc123").await.expect("set");
    assert_eq!(
        test.store.get_item("token").await.expect("get").as_deref(),
        Some("abc123")
    );
}

#[tokio::test]
async fn test_locked_device_is_locked_out() {
    let test = TestStore::new();
    test.store.set_item("token", "abc123").await.expect("set");

    test.credential.set_device_locked(true);
    let err = test.store.get_item("token").await.expect_err("locked");
    assert_eq!(err.kind(), ErrorKind::LockedOut);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_credential_timeout_is_locked_out() {
    let test = TestStore::with_timeout(Duration::from_millis(50));
    let store = &test.store;

    store.set_item("token", "abc123").await.expect("set");
    test.credential.set_prompt_delay(Duration::from_millis(400));

    let err = store.get_item("token").await.expect_err("timed out");
    assert_eq!(err.kind(), ErrorKind::LockedOut);

    test.credential.set_prompt_delay(Duration::ZERO);
    assert_eq!(
        store.get_item("token").await.expect("get").as_deref(),
        Some("abc123")
    );
}

#[tokio::test]
async fn test_subsystem_outage_is_credential_unavailable() {
    let test = TestStore::new();
    test.credential.set_available(false);

    let err = test.store.set_item("token", "abc123").await.expect_err("outage");
    assert_eq!(err.kind(), ErrorKind::CredentialUnavailable);

    test.credential.set_available(true);
    test.store.set_item("token", "abc123").await.expect("set");

    test.credential.set_available(false);
    let err = test.store.get_item("token").await.expect_err("outage");
    assert_eq!(err.kind(), ErrorKind::CredentialUnavailable);
    assert!(test.store.contains_item("token").await.expect("contains"));
}

#[tokio::test]
async fn test_rotation_preserves_values_and_retires_old_key() {
    let test = TestStore::new();
    let store = &test.store;
    for (key, value) in [("a", "1"), ("b", "2"), ("c", "3")] {
        store.set_item(key, value).await.expect("set");
    }
    let old_envelope =
        std::fs::read(test.paths().metadata_path(test.current_generation())).expect("envelope");

    store.rotate_master_key().await.expect("rotate");

    for (key, value) in [("a", "1"), ("b", "2"), ("c", "3")] {
        assert_eq!(store.get_item(key).await.expect("get").as_deref(), Some(value));
    }

    let metadata_path = test.paths().metadata_path(test.current_generation());
    assert_ne!(std::fs::read(&metadata_path).expect("envelope"), old_envelope);

    std::fs::write(&metadata_path, &old_envelope).expect("restore old envelope");
    let err = store.get_item("a").await.expect_err("old key");
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
}

#[tokio::test]
async fn test_rotation_fails_closed_on_outage() {
    let test = TestStore::new();
    test.store.set_item("a", "1").await.expect("set");
    let generation = test.current_generation();

    test.credential.set_available(false);
    let err = test.store.rotate_master_key().await.expect_err("outage");
    assert_eq!(err.kind(), ErrorKind::CredentialUnavailable);
    assert_eq!(test.current_generation(), generation);

    test.credential.set_available(true);
    assert_eq!(
        test.store.get_item("a").await.expect("get").as_deref(),
        Some("1")
    );
}

#[tokio::test]
async fn test_values_survive_reopen() {
    let test = TestStore::new();
    test.store.set_item("token", "abc123").await.expect("set");
    test.store.set_item("other", "xyz").await.expect("set");

    let reopened = test.reopen();
    assert_eq!(
        reopened.get_item("token").await.expect("get").as_deref(),
        Some("abc123")
    );
    assert_eq!(
        reopened.get_item("other").await.expect("get").as_deref(),
        Some("xyz")
    );
    assert_eq!(test.credential.seal_calls(), 1);
}

#[tokio::test]
async fn test_namespaces_are_isolated() {
    let test = TestStore::new();
    let other = sealkv_core::EncryptedStorage::open(
        StoreConfig::new(&test.root).with_namespace("other"),
        test.credential.clone(),
    )
    .expect("open other");

    test.store.set_item("token", "first").await.expect("set");
    other.set_item("token", "second").await.expect("set");
    test.store.clear().await.expect("clear");

    assert_eq!(test.store.get_item("token").await.expect("get"), None);
    assert_eq!(
        other.get_item("token").await.expect("get").as_deref(),
        Some("second")
    );
}

#[tokio::test]
async fn test_cached_key_skips_unseal_until_locked() {
    let test = TestStore::with_config(|config| config.with_cache_unsealed_key(true));
    let store = &test.store;

    store.set_item("token", "abc123").await.expect("set");
    for _ in 0..3 {
        store.get_item("token").await.expect("get");
    }
    assert_eq!(test.credential.unseal_calls(), 0);

    store.lock();
    store.get_item("token").await.expect("get");
    assert_eq!(test.credential.unseal_calls(), 1);

    test.credential.set_active_credential(false);
    store.get_item("token").await.expect("get");
    store.get_item("token").await.expect("get");
    assert_eq!(test.credential.unseal_calls(), 3);
}

#[tokio::test]
async fn test_initialize_creates_key_eagerly() {
    let test = TestStore::new();
    test.store.initialize().await.expect("initialize");
    test.store.initialize().await.expect("initialize again");
    assert_eq!(test.credential.seal_calls(), 1);
    assert!(test
        .paths()
        .metadata_path(test.current_generation())
        .exists());
}

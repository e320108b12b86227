//! Encrypt → decrypt round trips through the full engine: key store,
//! admission, chunk streaming, metadata persistence and notifications.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use lockbox_core::FileIdentifier;
use lockbox_engine::CryptoObserver;
use lockbox_storage::{read_sequence, SecureRoot};

const CHUNK: u64 = 1024;

#[tokio::test]
async fn roundtrip_identity_across_chunk_boundaries() {
    let h = Harness::new(CHUNK);
    let cs = CHUNK as usize;

    for (i, size) in [0, 1, cs - 1, cs, cs + 1, 4 * cs, 3 * cs + 17]
        .into_iter()
        .enumerate()
    {
        let doc = id(&format!("doc-{i}"));
        let original = payload(size);
        let input = h.input(&format!("plain-{i}.bin"), &original);

        let artifact = h.engine.encrypt(&doc, &input, None).await.unwrap();
        let expected_chunks = size.div_ceil(cs);
        assert_eq!(artifact.chunk_count(), expected_chunks, "size {size}");
        assert_eq!(artifact.nonces.len(), artifact.tags.len());
        assert_eq!(read(&artifact.path).len(), size, "ciphertext length must equal plaintext length");

        let out = h.engine.decrypt(&doc, "bin", None).await.unwrap();
        assert_eq!(read(&out), original, "size {size}");
    }
}

#[tokio::test]
async fn three_mib_scenario() {
    let h = Harness::new(MIB);
    let doc = id("scan");
    let original = payload(3 * MIB as usize);
    let input = h.input("scan.pdf", &original);

    let artifact = h.engine.encrypt(&doc, &input, None).await.unwrap();
    assert_eq!(artifact.chunk_count(), 3);
    assert_eq!(artifact.nonces.len(), 3);
    assert_eq!(artifact.tags.len(), 3);
    assert!(artifact.nonces.iter().all(|n| n.len() == 12));
    assert!(artifact.tags.iter().all(|t| t.len() == 16));

    let ciphertext = read(&artifact.path);
    assert_eq!(ciphertext.len(), original.len());
    assert_ne!(ciphertext, original);

    let out = h.engine.decrypt(&doc, "pdf", None).await.unwrap();
    assert_eq!(out, h.root().join("scan.pdf"));
    assert_eq!(read(&out), original);
}

#[tokio::test]
async fn layout_and_persisted_metadata_match_artifact() {
    let h = Harness::new(CHUNK);
    let doc = id("report");
    let input = h.input("report.txt", &payload(5 * CHUNK as usize + 3));

    let artifact = h.engine.encrypt(&doc, &input, None).await.unwrap();
    let root = SecureRoot::resolve(&h.tmp.path().join("data")).unwrap();

    assert_eq!(artifact.path, root.artifact_path(&doc));
    assert!(artifact.path.ends_with("SecureSpace/encryptedData/report.ed"));
    assert_eq!(read_sequence(&root.nonce_path(&doc)).unwrap(), artifact.nonces);
    assert_eq!(read_sequence(&root.tag_path(&doc)).unwrap(), artifact.tags);

    let records: Vec<_> = artifact.records().collect();
    assert_eq!(records.len(), 6);
    assert_eq!(records[5].index, 5);
}

#[cfg(unix)]
#[tokio::test]
async fn artifact_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let h = Harness::new(CHUNK);
    let input = h.input("a.txt", b"private");
    let artifact = h.engine.encrypt(&id("a"), &input, None).await.unwrap();

    let mode = std::fs::metadata(&artifact.path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn nonces_unique_within_one_encryption() {
    let h = Harness::new(64);
    let input = h.input("many.bin", &payload(64 * 500));

    let artifact = h.engine.encrypt(&id("many"), &input, None).await.unwrap();
    assert_eq!(artifact.chunk_count(), 500);

    let unique: HashSet<_> = artifact.nonces.iter().collect();
    assert_eq!(unique.len(), artifact.nonces.len());
}

#[tokio::test]
async fn progress_is_monotonic_and_ends_at_one() {
    let h = Harness::new(CHUNK);
    let (rec, observer) = recorder();
    let input = h.input("p.bin", &payload(7 * CHUNK as usize + 100));

    h.engine
        .encrypt(&id("p"), &input, Some(&observer))
        .await
        .unwrap();

    let progress = rec.progress();
    assert_eq!(progress.len(), 8, "one event per chunk");
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.iter().all(|p| (0.0..=1.0).contains(p)));
    assert_eq!(*progress.last().unwrap(), 1.0);

    assert_eq!(
        rec.events(),
        vec!["encryption_started", "encryption_finished"]
    );
}

#[tokio::test]
async fn decryption_progress_ends_at_one() {
    let h = Harness::new(CHUNK);
    let input = h.input("d.bin", &payload(2 * CHUNK as usize + 1));
    h.engine.encrypt(&id("d"), &input, None).await.unwrap();

    let (rec, observer) = recorder();
    h.engine
        .decrypt(&id("d"), "bin", Some(&observer))
        .await
        .unwrap();

    let progress = rec.progress();
    assert_eq!(progress.len(), 3);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*progress.last().unwrap(), 1.0);
    assert_eq!(
        rec.events(),
        vec!["decryption_started", "decryption_finished"]
    );
}

#[tokio::test]
async fn empty_input_reports_single_full_progress() {
    let h = Harness::new(CHUNK);
    let (rec, observer) = recorder();
    let input = h.input("empty.txt", b"");

    let artifact = h
        .engine
        .encrypt(&id("empty"), &input, Some(&observer))
        .await
        .unwrap();
    assert_eq!(artifact.chunk_count(), 0);
    assert_eq!(rec.progress(), vec![1.0]);

    let out = h.engine.decrypt(&id("empty"), "txt", None).await.unwrap();
    assert!(read(&out).is_empty());
}

#[tokio::test]
async fn reencrypting_an_identifier_replaces_key_and_content() {
    let h = Harness::new(CHUNK);
    let doc = id("draft");

    let first = h.input("v1.txt", b"first draft");
    h.engine.encrypt(&doc, &first, None).await.unwrap();

    let second = h.input("v2.txt", &payload(3000));
    h.engine.encrypt(&doc, &second, None).await.unwrap();
    assert_eq!(h.keys.len(), 1, "duplicate save updates in place");

    let out = h.engine.decrypt(&doc, "txt", None).await.unwrap();
    assert_eq!(read(&out), payload(3000));
}

#[tokio::test]
async fn concurrent_jobs_on_distinct_identifiers() {
    let h = Harness::new(CHUNK);
    let mut handles = Vec::new();
    for i in 0..8 {
        let input = h.input(&format!("c{i}.bin"), &payload(1000 * (i + 1)));
        handles.push(h.engine.spawn_encrypt(id(&format!("c{i}")), input, None));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..8 {
        handles.push(h.engine.spawn_decrypt(id(&format!("c{i}")), "bin".into(), None));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let out = handle.await.unwrap().unwrap();
        assert_eq!(read(&out), payload(1000 * (i + 1)));
    }
}

#[tokio::test]
async fn same_identifier_jobs_are_serialized() {
    let h = Harness::new(64);
    let doc = id("shared");
    let input = h.input("shared.bin", &payload(64 * 200));
    h.engine.encrypt(&doc, &input, None).await.unwrap();

    // Interleaved re-encryptions and decryptions of one identifier must never
    // observe a key from one job with metadata from another.
    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(tokio::spawn({
            let engine = h.engine.clone();
            let doc = doc.clone();
            let input = input.clone();
            async move { engine.encrypt(&doc, &input, None).await.map(|_| ()) }
        }));
        handles.push(tokio::spawn({
            let engine = h.engine.clone();
            let doc = doc.clone();
            async move { engine.decrypt(&doc, "bin", None).await.map(|_| ()) }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn observer_dropped_mid_job_is_harmless() {
    let h = Harness::new(CHUNK);
    let input = h.input("o.bin", &payload(10 * CHUNK as usize));
    let (rec, observer) = recorder();

    let handle = h.engine.spawn_encrypt(id("o"), input, Some(&observer));
    drop(observer);
    drop(rec);

    handle.await.unwrap().unwrap();
}

/// Fails the test if two callbacks ever run at the same time.
#[derive(Default)]
struct Exclusive {
    busy: AtomicBool,
    overlaps: AtomicUsize,
    calls: AtomicUsize,
}

impl Exclusive {
    fn enter(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        std::thread::sleep(Duration::from_micros(200));
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl CryptoObserver for Exclusive {
    fn encryption_started(&self, _id: &FileIdentifier) {
        self.enter();
    }
    fn encryption_progress(&self, _id: &FileIdentifier, _progress: f32) {
        self.enter();
    }
    fn encryption_finished(&self, _id: &FileIdentifier) {
        self.enter();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_observer_is_never_called_concurrently() {
    let h = Harness::new(64);
    let exclusive = Arc::new(Exclusive::default());
    let observer: Arc<dyn CryptoObserver> = exclusive.clone();

    let mut handles = Vec::new();
    for i in 0..6 {
        let input = h.input(&format!("s{i}.bin"), &payload(64 * 20));
        handles.push(h.engine.spawn_encrypt(id(&format!("s{i}")), input, Some(&observer)));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // started + 20 progress + finished per job
    assert_eq!(exclusive.calls.load(Ordering::SeqCst), 6 * 22);
    assert_eq!(exclusive.overlaps.load(Ordering::SeqCst), 0);
}

proptest::proptest! {
    #![proptest_config(proptest::prelude::ProptestConfig::with_cases(24))]

    #[test]
    fn prop_roundtrip_small_chunks(
        data in proptest::collection::vec(proptest::num::u8::ANY, 0..600),
        chunk_size in 1u64..97,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let h = Harness::new(chunk_size);
            let input = h.input("prop.bin", &data);

            let artifact = h.engine.encrypt(&id("prop"), &input, None).await.unwrap();
            assert_eq!(artifact.chunk_count() as u64, (data.len() as u64).div_ceil(chunk_size));

            let out = h.engine.decrypt(&id("prop"), "out", None).await.unwrap();
            assert_eq!(read(&out), data);
        });
    }
}

//! Streaming upload: pipelined chunk PUTs, ordered acks, failure handling,
//! and verify-then-decrypt of what landed in storage.

mod common;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use common::{config_for, make_data, Server, Thumbnails, Uploads};
use courier_core::config::UploadConfig;
use courier_core::{ConversationId, CourierError, Phase, Progress, UserId};
use courier_crypto::{decrypt_file_chunked, ChunkedEncryptionResult, KeyMaterial, CHUNK_SIZE};
use courier_e2ee::{shared_file_material, E2eeSession, StreamingUploadCoordinator, UploadOutcome};
use courier_secrets::MemoryStore;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn write_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn coordinator(uploads: Uploads, fail_thumbnail: bool) -> StreamingUploadCoordinator<Arc<Uploads>, Thumbnails> {
    StreamingUploadCoordinator::new(
        Arc::new(uploads),
        Thumbnails {
            fail: fail_thumbnail,
        },
        &config_for("alice").upload,
    )
}

/// Rebuild the full result from the finalize manifest and stored objects.
fn fetch_back(uploads: &Uploads, outcome: &UploadOutcome) -> ChunkedEncryptionResult {
    let finalize = uploads.last_finalize().unwrap();
    let mut manifest = finalize.metadata.manifest.clone();
    for chunk in &outcome.manifest.chunks {
        let url = Uploads::chunk_url(&outcome.upload_id, chunk.index);
        manifest
            .attach_chunk_data(chunk.index, uploads.object(&url).unwrap())
            .unwrap();
    }
    manifest
}

#[tokio::test]
async fn upload_then_download_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let data = make_data(3 * CHUNK_SIZE + 4321);
    let path = write_file(&tmp, "holiday.jpg", &data);
    let material = KeyMaterial::new("alice-material");

    let coord = coordinator(Uploads::default(), false);
    let outcome = coord
        .upload_file(&path, &material, Vec::new(), None, None)
        .await
        .unwrap();

    let uploads = coord.uploader();
    assert_eq!(outcome.file_id, format!("file-{}", outcome.upload_id));
    assert_eq!(outcome.thumbnail_url.as_deref(), Some("https://storage.test/thumbs/1.jpg"));

    let init = uploads.init_requests.lock().unwrap()[0].clone();
    assert_eq!(init.total_chunks, 4);
    assert_eq!(init.file_size, data.len() as u64);
    assert_eq!(init.file_type, "image/jpeg");

    let finalize = uploads.last_finalize().unwrap();
    assert_eq!(finalize.metadata.chunks, 4);
    assert_eq!(finalize.metadata.original_size, data.len() as u64);
    assert_eq!(finalize.metadata.auth_tag, outcome.manifest.master_auth_tag);
    assert!(finalize.metadata.manifest.chunks.iter().all(|c| c.encrypted_data.is_none()));

    let full = fetch_back(uploads, &outcome);
    let decrypted = decrypt_file_chunked(&full, &material, None).await.unwrap();
    assert_eq!(decrypted, data);
}

#[tokio::test]
async fn acks_are_listed_in_index_order_despite_completion_order() {
    let tmp = TempDir::new().unwrap();
    let path = write_file(&tmp, "big.bin", &make_data(4 * CHUNK_SIZE));

    let coord = coordinator(
        Uploads {
            reverse_completion: true,
            ..Default::default()
        },
        false,
    );
    coord
        .upload_file(&path, &KeyMaterial::new("m"), Vec::new(), None, None)
        .await
        .unwrap();

    let finalize = coord.uploader().last_finalize().unwrap();
    let indices: Vec<u64> = finalize.chunks.iter().map(|a| a.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(finalize.chunks[2].etag.as_deref(), Some("\"etag-2\""));
    // config_for sets max_in_flight_chunks = 2
    assert_eq!(coord.uploader().max_concurrent.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn next_put_starts_before_previous_ack() {
    let tmp = TempDir::new().unwrap();
    let path = write_file(&tmp, "big.bin", &make_data(3 * CHUNK_SIZE));

    let coord = coordinator(
        Uploads {
            reverse_completion: true,
            ..Default::default()
        },
        false,
    );
    coord
        .upload_file(&path, &KeyMaterial::new("m"), Vec::new(), None, None)
        .await
        .unwrap();

    // Chunk 0 is the slowest to ack; later chunks must not wait for it.
    let uploads = coord.uploader();
    let first_ack = uploads.log_position("done 0").unwrap();
    for i in 1..3 {
        let started = uploads.log_position(&format!("start {i}")).unwrap();
        assert!(started < first_ack, "chunk {i} waited: {:?}", uploads.put_log.lock().unwrap());
    }
}

#[tokio::test]
async fn chunk_failure_aborts_without_finalize() {
    let tmp = TempDir::new().unwrap();
    let path = write_file(&tmp, "big.bin", &make_data(3 * CHUNK_SIZE));

    let coord = coordinator(
        Uploads {
            fail_chunk: Some(1),
            ..Default::default()
        },
        false,
    );
    let err = coord
        .upload_file(&path, &KeyMaterial::new("m"), Vec::new(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::Upload(msg) if msg.contains("chunk 1")));
    assert!(coord.uploader().finalized.lock().unwrap().is_empty());
}

#[tokio::test]
async fn thumbnail_failure_is_not_fatal() {
    let tmp = TempDir::new().unwrap();
    let path = write_file(&tmp, "photo.png", &make_data(1000));

    let coord = coordinator(Uploads::default(), true);
    let outcome = coord
        .upload_file(&path, &KeyMaterial::new("m"), Vec::new(), None, None)
        .await
        .unwrap();
    assert!(outcome.thumbnail_url.is_none());
    assert_eq!(coord.uploader().thumbnails.load(Ordering::SeqCst), 0);
    assert_eq!(coord.uploader().finalized.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn progress_covers_every_phase_in_order() {
    let tmp = TempDir::new().unwrap();
    let path = write_file(&tmp, "doc.pdf", &make_data(2 * CHUNK_SIZE + 1));

    let seen = Arc::new(Mutex::new(Vec::<Progress>::new()));
    let sink = seen.clone();
    let callback = move |p: &Progress| sink.lock().unwrap().push(*p);

    let coord = coordinator(Uploads::default(), false);
    coord
        .upload_file(&path, &KeyMaterial::new("m"), Vec::new(), Some(&callback), None)
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    let phases: Vec<Phase> = seen.iter().map(|p| p.phase).collect();
    for phase in [
        Phase::Thumbnail,
        Phase::Encrypting,
        Phase::Uploading,
        Phase::Finalizing,
        Phase::Complete,
    ] {
        assert!(phases.contains(&phase), "missing {phase}");
    }
    assert!(seen.windows(2).all(|w| w[0].percent <= w[1].percent));
    assert_eq!(seen.last().unwrap().percent, 100.0);
    let thumb_end = seen.iter().rfind(|p| p.phase == Phase::Thumbnail).unwrap();
    assert_eq!(thumb_end.percent, 5.0);
}

#[tokio::test]
async fn cancelled_upload_stops_before_finalize() {
    let tmp = TempDir::new().unwrap();
    let path = write_file(&tmp, "big.bin", &make_data(2 * CHUNK_SIZE));
    let token = CancellationToken::new();
    token.cancel();

    let coord = coordinator(Uploads::default(), false);
    let err = coord
        .upload_file(&path, &KeyMaterial::new("m"), Vec::new(), None, Some(&token))
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::Cancelled));
    assert!(coord.uploader().finalized.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_file_uploads_with_zero_chunks() {
    let tmp = TempDir::new().unwrap();
    let path = write_file(&tmp, "empty.txt", b"");
    let material = KeyMaterial::new("m");

    let coord = coordinator(Uploads::default(), false);
    let outcome = coord
        .upload_file(&path, &material, Vec::new(), None, None)
        .await
        .unwrap();
    assert_eq!(outcome.manifest.total_chunks, 0);
    let finalize = coord.uploader().last_finalize().unwrap();
    assert!(finalize.chunks.is_empty());
    assert!(decrypt_file_chunked(&outcome.manifest, &material, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn shared_file_is_readable_by_every_resolved_member() {
    let tmp = TempDir::new().unwrap();
    let data = make_data(CHUNK_SIZE + 99);
    let path = write_file(&tmp, "slides.pdf", &data);

    let server = Server::new();
    server.add_conversation("proj", &["alice", "bob", "mallory-no-key"]);
    let alice = E2eeSession::start(
        Arc::new(MemoryStore::new()),
        server.directory("alice"),
        &config_for("alice"),
    )
    .await
    .unwrap();
    let bob = E2eeSession::start(
        Arc::new(MemoryStore::new()),
        server.directory("bob"),
        &config_for("bob"),
    )
    .await
    .unwrap();

    let coord = StreamingUploadCoordinator::new(
        Arc::new(Uploads::default()),
        Thumbnails { fail: false },
        &UploadConfig::default(),
    );
    let outcome = alice
        .share_file(&coord, &path, &ConversationId::new("proj"), None, None)
        .await
        .unwrap();

    let finalize = coord.uploader().last_finalize().unwrap();
    let entries = &finalize.metadata.recipient_keys;
    let holders: Vec<&str> = entries.iter().map(|e| e.user_id.as_str()).collect();
    assert_eq!(holders, vec!["alice", "bob"]);

    let full = fetch_back(coord.uploader(), &outcome);
    for session in [&alice, &bob] {
        let own = session.keys().get_my_derived_key().await.unwrap();
        let material = shared_file_material(entries, session.user_id(), &own).unwrap();
        let plaintext = decrypt_file_chunked(&full, &material, None).await.unwrap();
        assert_eq!(plaintext, data, "as {}", session.user_id());
    }

    // A wrong device key cannot unwrap bob's entry.
    let other = KeyMaterial::new("not-bobs").derive();
    assert!(shared_file_material(entries, &UserId::new("bob"), &other).is_err());
}

#[tokio::test]
async fn private_upload_uses_own_key() {
    let tmp = TempDir::new().unwrap();
    let data = make_data(CHUNK_SIZE / 2);
    let path = write_file(&tmp, "notes.txt", &data);

    let server = Server::new();
    let alice = E2eeSession::start(
        Arc::new(MemoryStore::new()),
        server.directory("alice"),
        &config_for("alice"),
    )
    .await
    .unwrap();
    let coord = coordinator(Uploads::default(), false);
    let outcome = alice
        .upload_private_file(&coord, &path, None, None)
        .await
        .unwrap();

    let full = fetch_back(coord.uploader(), &outcome);
    let own = alice.keys().own_material().await.unwrap();
    assert_eq!(decrypt_file_chunked(&full, &own, None).await.unwrap(), data);
}

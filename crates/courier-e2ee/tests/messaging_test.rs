//! Session lifecycle and message encryption across several simulated users.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{config_for, Directory, Server};
use courier_core::{ConversationId, CourierError, UserId};
use courier_crypto::{DecryptedMessage, KeyMaterial, MessageEnvelope, PlaceholderReason};
use courier_e2ee::E2eeSession;
use courier_secrets::MemoryStore;

type Session = E2eeSession<Arc<MemoryStore>, Directory>;

async fn start(server: &Arc<Server>, user: &str) -> Session {
    E2eeSession::start(
        Arc::new(MemoryStore::new()),
        server.directory(user),
        &config_for(user),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn direct_message_readable_by_both_sides() {
    let server = Server::new();
    let alice = start(&server, "alice").await;
    let bob = start(&server, "bob").await;

    let envelope = alice
        .messages()
        .encrypt_message(&UserId::new("bob"), "hello")
        .await
        .unwrap();
    let json = envelope.to_json().unwrap();
    assert!(json.contains(r#""type":"direct""#));

    let sender = UserId::new("alice");
    let as_bob = bob.messages().decrypt_message(&sender, &json).await;
    let as_alice = alice.messages().decrypt_message(&sender, &json).await;
    assert_eq!(as_bob, DecryptedMessage::Plaintext("hello".into()));
    assert_eq!(as_alice, DecryptedMessage::Plaintext("hello".into()));
}

#[tokio::test]
async fn group_message_survives_one_missing_key() {
    let server = Server::new();
    server.add_conversation("team", &["alice", "bob", "carol", "dave"]);
    let alice = start(&server, "alice").await;
    let bob = start(&server, "bob").await;
    let carol = start(&server, "carol").await;
    // dave never started a session, so has no published key

    let group = alice
        .messages()
        .encrypt_message_for_group(&ConversationId::new("team"), "standup in 5")
        .await
        .unwrap();
    assert_eq!(group.skipped, vec![UserId::new("dave")]);
    assert_eq!(group.envelope.recipient_count(), 2);

    let json = group.envelope.to_json().unwrap();
    let sender = UserId::new("alice");
    for session in [&alice, &bob, &carol] {
        let msg = session.messages().decrypt_message(&sender, &json).await;
        assert_eq!(msg.text(), Some("standup in 5"), "as {}", session.user_id());
    }
}

#[tokio::test]
async fn outsider_and_garbage_become_placeholders() {
    let server = Server::new();
    server.add_conversation("pair", &["alice", "bob"]);
    let alice = start(&server, "alice").await;
    start(&server, "bob").await;
    let eve = start(&server, "eve").await;

    let group = alice
        .messages()
        .encrypt_message_for_group(&ConversationId::new("pair"), "private")
        .await
        .unwrap();
    let json = group.envelope.to_json().unwrap();
    let sender = UserId::new("alice");

    assert_eq!(
        eve.messages().decrypt_message(&sender, &json).await,
        DecryptedMessage::Placeholder(PlaceholderReason::NotARecipient)
    );
    assert_eq!(
        eve.messages().decrypt_message(&sender, "{\"type\":\"direct\"").await,
        DecryptedMessage::Placeholder(PlaceholderReason::Malformed)
    );
}

#[tokio::test]
async fn logout_turns_decryption_into_waiting_placeholder() {
    let server = Server::new();
    let alice = start(&server, "alice").await;
    start(&server, "bob").await;

    let envelope = alice
        .messages()
        .encrypt_message(&UserId::new("bob"), "before logout")
        .await
        .unwrap();
    alice.logout().await.unwrap();

    let msg = alice
        .messages()
        .decrypt_envelope(&UserId::new("alice"), &envelope)
        .await;
    assert_eq!(msg, DecryptedMessage::Placeholder(PlaceholderReason::KeysNotReady));
    assert!(matches!(
        alice.messages().encrypt_message(&UserId::new("bob"), "x").await,
        Err(CourierError::KeysNotReady)
    ));
}

#[tokio::test]
async fn unknown_recipient_fails_direct_send() {
    let server = Server::new();
    let alice = start(&server, "alice").await;
    let err = alice
        .messages()
        .encrypt_message(&UserId::new("nobody"), "hi")
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::PeerKeyUnavailable { .. }));
}

#[tokio::test]
async fn publish_failure_does_not_block_start() {
    let server = Server::new();
    server.publish_fails.store(true, Ordering::SeqCst);
    let alice = start(&server, "alice").await;
    assert!(alice.keys().is_ready());
    assert!(server.published_key("alice").is_none());
}

#[tokio::test]
async fn restart_reuses_key_and_rotation_republishes() {
    let server = Server::new();
    let store = Arc::new(MemoryStore::new());

    let first = E2eeSession::start(store.clone(), server.directory("alice"), &config_for("alice"))
        .await
        .unwrap();
    let published = server.published_key("alice").unwrap();
    drop(first);

    let second = E2eeSession::start(store, server.directory("alice"), &config_for("alice"))
        .await
        .unwrap();
    assert_eq!(server.published_key("alice").unwrap(), published);

    let rotated = second.rotate_keys().await.unwrap();
    assert_ne!(rotated, published);
    assert_eq!(server.published_key("alice").unwrap(), rotated);
}

#[tokio::test]
async fn stale_peer_key_is_refetched_after_invalidation() {
    let server = Server::new();
    let alice = start(&server, "alice").await;
    let bob = start(&server, "bob").await;
    let bob_id = UserId::new("bob");

    alice.messages().encrypt_message(&bob_id, "warm cache").await.unwrap();
    bob.rotate_keys().await.unwrap();
    alice.exchange().invalidate_peer(&bob_id);

    let envelope = alice.messages().encrypt_message(&bob_id, "after rotation").await.unwrap();
    let msg = bob
        .messages()
        .decrypt_envelope(&UserId::new("alice"), &envelope)
        .await;
    assert_eq!(msg.text(), Some("after rotation"));
}

#[tokio::test]
async fn start_requires_user_id() {
    let server = Server::new();
    let result = E2eeSession::start(
        Arc::new(MemoryStore::new()),
        server.directory(""),
        &courier_core::config::CourierConfig::default(),
    )
    .await;
    assert!(matches!(result, Err(CourierError::Config(_))));
}

#[test]
fn legacy_envelope_is_not_decrypted() {
    let env = MessageEnvelope::Legacy {
        ciphertext: "U2FsdGVkX19legacy".into(),
    };
    let msg = DecryptedMessage::open(
        &env,
        &UserId::new("bob"),
        &UserId::new("alice"),
        &KeyMaterial::new("k").derive(),
    );
    assert_eq!(msg, DecryptedMessage::Placeholder(PlaceholderReason::LegacyFormat));
}

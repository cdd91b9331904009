//! End-to-end session bootstrap / ratchet scenarios, exercised only
//! through the public API (`ProtocolAddress`, `SessionBuilder`,
//! `SessionCipher`, `KeyHelper` generators, `InMemoryStore`).

use std::sync::Arc;

use signal_ratchet_core::{
    generate_prekey, generate_signed_prekey, IdentityKeyPair, InMemoryStore, JobQueue, PreKeyBundle, ProtocolAddress,
    SessionBuilder, SessionCipher, SessionRecord, SignalError, SignalStore, StoredKeyPair,
};

struct Party {
    store: Arc<InMemoryStore>,
    identity: IdentityKeyPair,
    registration_id: u32,
}

impl Party {
    fn new(registration_id: u32) -> Self {
        let identity = IdentityKeyPair::generate();
        let store = InMemoryStore::new(StoredKeyPair::from(&identity.key_pair), registration_id);
        Self {
            store,
            identity,
            registration_id,
        }
    }

    async fn publish_bundle(&self, spk_id: u32, otpk_id: Option<u32>) -> PreKeyBundle {
        let spk = generate_signed_prekey(&self.identity, spk_id);
        self.store.insert_signed_prekey(spk_id, StoredKeyPair::from(&spk.key_pair)).await;

        let prekey = otpk_id.map(|id| {
            let pk = generate_prekey(id);
            (id, pk)
        });
        if let Some((id, pk)) = &prekey {
            self.store.insert_prekey(*id, StoredKeyPair::from(&pk.key_pair)).await;
        }

        PreKeyBundle {
            registration_id: self.registration_id,
            identity_key: self.identity.public_key(),
            signed_prekey_id: spk_id,
            signed_prekey_public: spk.key_pair.public,
            signed_prekey_signature: spk.signature,
            prekey: prekey.map(|(id, pk)| (id, pk.key_pair.public)),
        }
    }
}

/// Bootstraps Alice -> Bob as an outgoing session against a freshly
/// published bundle; returns ciphers for both directions.
async fn bootstrap(alice: &Party, bob: &Party, bob_spk_id: u32, bob_otpk_id: Option<u32>) -> (SessionCipher, SessionCipher) {
    let bundle = bob.publish_bundle(bob_spk_id, bob_otpk_id).await;

    let alice_address = ProtocolAddress::new("bob", 1);
    let bob_address = ProtocolAddress::new("alice", 1);

    let builder = SessionBuilder::new(alice.store.clone(), alice_address.clone());
    builder.init_outgoing(&bundle).await.unwrap();

    (
        SessionCipher::new(alice.store.clone(), alice_address),
        SessionCipher::new(bob.store.clone(), bob_address),
    )
}

// The first message between two parties round trips through a
// PreKeyWhisperMessage envelope.
#[tokio::test]
async fn s1_first_message_is_a_prekey_envelope_and_round_trips() {
    let alice = Party::new(1);
    let bob = Party::new(2);
    let (alice_cipher, bob_cipher) = bootstrap(&alice, &bob, 10, Some(20)).await;

    let encrypted = alice_cipher.encrypt(b"hello").await.unwrap();
    assert_eq!(encrypted.message_type, 3);

    let plaintext = bob_cipher.decrypt_prekey_whisper_message(&encrypted.body).await.unwrap();
    assert_eq!(plaintext, b"hello");
}

// Once a session is established, the reply travels as a plain
// WhisperMessage (type 1) rather than a PreKey envelope.
#[tokio::test]
async fn s2_reply_after_first_contact_is_a_plain_whisper_message() {
    let alice = Party::new(1);
    let bob = Party::new(2);
    let (alice_cipher, bob_cipher) = bootstrap(&alice, &bob, 10, Some(20)).await;

    let first = alice_cipher.encrypt(b"hello").await.unwrap();
    bob_cipher.decrypt_prekey_whisper_message(&first.body).await.unwrap();

    let reply = bob_cipher.encrypt(b"hi").await.unwrap();
    assert_eq!(reply.message_type, 1);
    let plaintext = alice_cipher.decrypt_whisper_message(&reply.body).await.unwrap();
    assert_eq!(plaintext, b"hi");
}

// Out-of-order delivery recovers via the skipped-key cache.
#[tokio::test]
async fn s3_out_of_order_delivery_recovers_all_three_messages() {
    let alice = Party::new(1);
    let bob = Party::new(2);
    let (alice_cipher, bob_cipher) = bootstrap(&alice, &bob, 10, Some(20)).await;

    let first = alice_cipher.encrypt(b"hello").await.unwrap();
    bob_cipher.decrypt_prekey_whisper_message(&first.body).await.unwrap();
    // Alice must see a reply before her own pending prekey is cleared and
    // her later sends drop down to plain whisper messages.
    let ack = bob_cipher.encrypt(b"ack").await.unwrap();
    alice_cipher.decrypt_whisper_message(&ack.body).await.unwrap();

    let m1 = alice_cipher.encrypt(b"m1").await.unwrap();
    let m2 = alice_cipher.encrypt(b"m2").await.unwrap();
    let m3 = alice_cipher.encrypt(b"m3").await.unwrap();

    let out3 = bob_cipher.decrypt_whisper_message(&m3.body).await.unwrap();
    let out1 = bob_cipher.decrypt_whisper_message(&m1.body).await.unwrap();
    let out2 = bob_cipher.decrypt_whisper_message(&m2.body).await.unwrap();

    assert_eq!(out1, b"m1");
    assert_eq!(out2, b"m2");
    assert_eq!(out3, b"m3");
}

// A 100-message gap, then delivery of the tail followed by the head.
#[tokio::test]
async fn gap_tolerance_across_a_hundred_messages() {
    let alice = Party::new(1);
    let bob = Party::new(2);
    let (alice_cipher, bob_cipher) = bootstrap(&alice, &bob, 10, Some(20)).await;

    let first = alice_cipher.encrypt(b"hello").await.unwrap();
    bob_cipher.decrypt_prekey_whisper_message(&first.body).await.unwrap();
    let ack = bob_cipher.encrypt(b"ack").await.unwrap();
    alice_cipher.decrypt_whisper_message(&ack.body).await.unwrap();

    let mut messages = Vec::new();
    for i in 0..100u32 {
        messages.push(alice_cipher.encrypt(format!("m{i}").as_bytes()).await.unwrap());
    }

    let last = messages.pop().unwrap();
    let out_last = bob_cipher.decrypt_whisper_message(&last.body).await.unwrap();
    assert_eq!(out_last, b"m99");

    for (i, msg) in messages.into_iter().enumerate() {
        let out = bob_cipher.decrypt_whisper_message(&msg.body).await.unwrap();
        assert_eq!(out, format!("m{i}").as_bytes());
    }
}

// A gap past the configured cap (2000 by default) fails with
// MessageCounterError. Uses whatever cap this test binary's global Config
// singleton ended up with, mirroring the session-record tests' approach
// to a process-wide OnceLock shared across the suite.
#[tokio::test]
async fn gap_overflow_past_the_configured_cap_fails() {
    let cap = signal_ratchet_core::config::Config::global().max_forward_jump;

    let alice = Party::new(1);
    let bob = Party::new(2);
    let (alice_cipher, bob_cipher) = bootstrap(&alice, &bob, 10, Some(20)).await;

    let first = alice_cipher.encrypt(b"hello").await.unwrap();
    bob_cipher.decrypt_prekey_whisper_message(&first.body).await.unwrap();
    let ack = bob_cipher.encrypt(b"ack").await.unwrap();
    alice_cipher.decrypt_whisper_message(&ack.body).await.unwrap();

    let mut last = None;
    for _ in 0..=(cap + 1) {
        last = Some(alice_cipher.encrypt(b"x").await.unwrap());
    }

    let err = bob_cipher.decrypt_whisper_message(&last.unwrap().body).await.unwrap_err();
    assert!(matches!(err, SignalError::MessageCounter(_)));
}

// Duplicate delivery of the same ciphertext fails the second time.
#[tokio::test]
async fn duplicate_delivery_fails_the_second_time() {
    let alice = Party::new(1);
    let bob = Party::new(2);
    let (alice_cipher, bob_cipher) = bootstrap(&alice, &bob, 10, Some(20)).await;

    let first = alice_cipher.encrypt(b"hello").await.unwrap();
    bob_cipher.decrypt_prekey_whisper_message(&first.body).await.unwrap();
    let ack = bob_cipher.encrypt(b"ack").await.unwrap();
    alice_cipher.decrypt_whisper_message(&ack.body).await.unwrap();

    let m1 = alice_cipher.encrypt(b"m1").await.unwrap();
    let m2 = alice_cipher.encrypt(b"m2").await.unwrap();

    bob_cipher.decrypt_whisper_message(&m2.body).await.unwrap();
    bob_cipher.decrypt_whisper_message(&m1.body).await.unwrap();
    let err = bob_cipher.decrypt_whisper_message(&m1.body).await.unwrap_err();
    assert!(matches!(err, SignalError::MessageCounter(_)));
}

// A tampered signature fails `init_outgoing` without touching the store.
#[tokio::test]
async fn s4_tampered_signature_rejects_init_outgoing_without_state_mutation() {
    let alice = Party::new(1);
    let bob = Party::new(2);
    let mut bundle = bob.publish_bundle(10, Some(20)).await;
    bundle.signed_prekey_signature[0] ^= 0xFF;

    let address = ProtocolAddress::new("bob", 1);
    let builder = SessionBuilder::new(alice.store.clone(), address.clone());

    let err = builder.init_outgoing(&bundle).await.unwrap_err();
    assert!(matches!(err, SignalError::InvalidSignature));
    assert!(alice.store.load_session(&address.as_key()).await.unwrap().is_none());
}

// A tampered body fails MAC; a later untampered message still succeeds.
#[tokio::test]
async fn s5_mac_tamper_fails_then_original_message_still_decrypts() {
    let alice = Party::new(1);
    let bob = Party::new(2);
    let (alice_cipher, bob_cipher) = bootstrap(&alice, &bob, 10, Some(20)).await;

    let first = alice_cipher.encrypt(b"hello").await.unwrap();
    bob_cipher.decrypt_prekey_whisper_message(&first.body).await.unwrap();
    let ack = bob_cipher.encrypt(b"ack").await.unwrap();
    alice_cipher.decrypt_whisper_message(&ack.body).await.unwrap();

    let mut tampered = alice_cipher.encrypt(b"x").await.unwrap();
    let original_body = tampered.body.clone();
    let last = tampered.body.len() - 1;
    tampered.body[last] ^= 0xFF;

    let err = bob_cipher.decrypt_whisper_message(&tampered.body).await.unwrap_err();
    assert!(matches!(err, SignalError::Mac));

    let plaintext = bob_cipher.decrypt_whisper_message(&original_body).await.unwrap();
    assert_eq!(plaintext, b"x");
}

// A session record with skipped keys and multiple archived
// sessions survives a serialize/deserialize round trip.
#[tokio::test]
async fn s10_session_record_round_trips_through_bincode() {
    let alice = Party::new(1);
    let bob = Party::new(2);
    let (alice_cipher, bob_cipher) = bootstrap(&alice, &bob, 10, Some(20)).await;

    let first = alice_cipher.encrypt(b"hello").await.unwrap();
    bob_cipher.decrypt_prekey_whisper_message(&first.body).await.unwrap();
    let ack = bob_cipher.encrypt(b"ack").await.unwrap();
    alice_cipher.decrypt_whisper_message(&ack.body).await.unwrap();

    let m1 = alice_cipher.encrypt(b"m1").await.unwrap();
    let _m2 = alice_cipher.encrypt(b"m2").await.unwrap();
    let m3 = alice_cipher.encrypt(b"m3").await.unwrap();
    // Decrypting m3 before m1 leaves a skipped key cached for m1's counter.
    bob_cipher.decrypt_whisper_message(&m3.body).await.unwrap();

    let record = bob.store.load_session("alice.1").await.unwrap().unwrap();
    let bytes = record.to_bytes().unwrap();
    let restored = SessionRecord::from_bytes(&bytes).unwrap();

    assert_eq!(restored.open_session().unwrap().registration_id, record.open_session().unwrap().registration_id);
    bob.store.store_session("alice.1", restored).await.unwrap();
    let plaintext = bob_cipher.decrypt_whisper_message(&m1.body).await.unwrap();
    assert_eq!(plaintext, b"m1");
}

// Within a bucket, jobs complete in submission order; a
// failing job does not poison the bucket.
#[tokio::test]
async fn bucket_ordering_and_failure_isolation() {
    let queue = Arc::new(JobQueue::new());
    let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

    for i in 0..3 {
        let order = order.clone();
        queue
            .run("alice.1", || async move {
                order.lock().await.push(i);
            })
            .await;
    }
    assert_eq!(*order.lock().await, vec![0, 1, 2]);

    let failed: Result<(), &'static str> = queue.run("alice.1", || async { Err("boom") }).await;
    assert!(failed.is_err());
    let recovered: Result<(), &'static str> = queue.run("alice.1", || async { Ok(()) }).await;
    assert!(recovered.is_ok());
}

// A successful PreKey decrypt consumes the one-time prekey
// exactly once; a failed decrypt never removes the prekey.
#[tokio::test]
async fn prekey_consumption_on_success_only() {
    let alice = Party::new(1);
    let bob = Party::new(2);
    let (alice_cipher, bob_cipher) = bootstrap(&alice, &bob, 10, Some(20)).await;

    assert!(bob.store.load_prekey(20).await.unwrap().is_some());

    let first = alice_cipher.encrypt(b"hello").await.unwrap();
    bob_cipher.decrypt_prekey_whisper_message(&first.body).await.unwrap();

    assert!(bob.store.load_prekey(20).await.unwrap().is_none());
}

// A PreKeyWhisperMessage whose embedded WhisperMessage fails to decrypt
// must not consume the one-time prekey.
#[tokio::test]
async fn failed_prekey_decrypt_does_not_consume_the_prekey() {
    let alice = Party::new(1);
    let bob = Party::new(2);
    let bundle = bob.publish_bundle(10, Some(20)).await;

    let alice_address = ProtocolAddress::new("bob", 1);
    let builder = SessionBuilder::new(alice.store.clone(), alice_address.clone());
    builder.init_outgoing(&bundle).await.unwrap();
    let alice_cipher = SessionCipher::new(alice.store.clone(), alice_address);
    let bob_cipher = SessionCipher::new(bob.store.clone(), ProtocolAddress::new("alice", 1));

    let mut encrypted = alice_cipher.encrypt(b"hello").await.unwrap();
    let last = encrypted.body.len() - 1;
    encrypted.body[last] ^= 0xFF;

    let err = bob_cipher.decrypt_prekey_whisper_message(&encrypted.body).await.unwrap_err();
    assert!(matches!(err, SignalError::Mac) || matches!(err, SignalError::Decrypt(_)));
    assert!(bob.store.load_prekey(20).await.unwrap().is_some());
}

// Without a one-time prekey the bundle still produces a valid session.
#[tokio::test]
async fn session_establishes_without_a_one_time_prekey() {
    let alice = Party::new(1);
    let bob = Party::new(2);
    let (alice_cipher, bob_cipher) = bootstrap(&alice, &bob, 11, None).await;

    let encrypted = alice_cipher.encrypt(b"no otpk here").await.unwrap();
    let plaintext = bob_cipher.decrypt_prekey_whisper_message(&encrypted.body).await.unwrap();
    assert_eq!(plaintext, b"no otpk here");
}

// Two concurrent encrypt calls against the same address, serialized
// through the job queue's per-bucket lock, complete without corrupting the
// session: both land on distinct counters and both decrypt cleanly on the
// peer, in either delivery order.
#[tokio::test]
async fn s6_concurrent_encrypts_through_the_queue_do_not_corrupt_the_session() {
    let alice = Party::new(1);
    let bob = Party::new(2);
    let (alice_cipher, bob_cipher) = bootstrap(&alice, &bob, 10, Some(20)).await;
    let alice_cipher = Arc::new(alice_cipher);
    let queue = Arc::new(JobQueue::new());

    let (a, b) = tokio::join!(
        {
            let cipher = alice_cipher.clone();
            let queue = queue.clone();
            async move { queue.run("bob.1", || async { cipher.encrypt(b"one").await }).await }
        },
        {
            let cipher = alice_cipher.clone();
            let queue = queue.clone();
            async move { queue.run("bob.1", || async { cipher.encrypt(b"two").await }).await }
        },
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_ne!(a.body, b.body, "concurrent sends through the same bucket must not race onto the same message key");

    let plaintext_b = bob_cipher.decrypt_prekey_whisper_message(&b.body).await.unwrap();
    let plaintext_a = bob_cipher.decrypt_prekey_whisper_message(&a.body).await.unwrap();
    assert_eq!(plaintext_a, b"one");
    assert_eq!(plaintext_b, b"two");

    let ack = bob_cipher.encrypt(b"ack").await.unwrap();
    alice_cipher.decrypt_whisper_message(&ack.body).await.unwrap();
    let sentinel = alice_cipher.encrypt(b"sentinel").await.unwrap();
    assert_eq!(sentinel.message_type, 1);
    let plaintext = bob_cipher.decrypt_whisper_message(&sentinel.body).await.unwrap();
    assert_eq!(plaintext, b"sentinel");
}

// Once Alice has seen a reply, her pending prekey is cleared and later
// sends drop the bundle envelope entirely.
#[tokio::test]
async fn no_longer_attaches_the_prekey_bundle_once_a_reply_has_been_seen() {
    let alice = Party::new(1);
    let bob = Party::new(2);
    let (alice_cipher, bob_cipher) = bootstrap(&alice, &bob, 10, Some(20)).await;

    let first = alice_cipher.encrypt(b"hello").await.unwrap();
    bob_cipher.decrypt_prekey_whisper_message(&first.body).await.unwrap();
    let ack = bob_cipher.encrypt(b"ack").await.unwrap();
    alice_cipher.decrypt_whisper_message(&ack.body).await.unwrap();

    let second = alice_cipher.encrypt(b"again").await.unwrap();
    assert_eq!(second.message_type, 1, "subsequent messages no longer carry the prekey envelope");
}

// Retransmission of the same PreKeyWhisperMessage before any reply: Bob's
// second init_incoming against the identical base key must reuse the
// existing session rather than archiving a duplicate, even though
// decrypting the already-consumed counter a second time fails.
#[tokio::test]
async fn retransmitted_prekey_message_reuses_the_existing_session() {
    let alice = Party::new(1);
    let bob = Party::new(2);
    let (alice_cipher, bob_cipher) = bootstrap(&alice, &bob, 10, Some(20)).await;

    let first = alice_cipher.encrypt(b"hello").await.unwrap();
    let plaintext = bob_cipher.decrypt_prekey_whisper_message(&first.body).await.unwrap();
    assert_eq!(plaintext, b"hello");

    let err = bob_cipher.decrypt_prekey_whisper_message(&first.body).await.unwrap_err();
    assert!(matches!(err, SignalError::MessageCounter(_)));

    let record = bob.store.load_session("alice.1").await.unwrap().unwrap();
    assert_eq!(record.archived_sessions().count(), 0, "retransmitting the same envelope must not archive a duplicate session");
}

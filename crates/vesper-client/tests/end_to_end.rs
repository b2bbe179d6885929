//! End-to-end messenger tests: two parties over a shared in-memory relay,
//! directory, and session store.

#![allow(clippy::unwrap_used)]

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use vesper_client::{InMemoryRelay, MessageId, Messenger, RelayDelivery, RelayTransport};
use vesper_core::{
    Environment, InMemoryDirectory, KeyMaterialStore, MemorySessionStore, ProtocolError,
    SessionStore, UserId,
};
use vesper_proto::{Envelope, TAG_SIZE};

/// Seeded environment: reproducible randomness, logical wall clock.
#[derive(Clone)]
struct TestEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
    clock_ms: Arc<Mutex<u64>>,
}

impl TestEnv {
    fn seeded(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            clock_ms: Arc::new(Mutex::new(0)),
        }
    }
}

impl Environment for TestEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap().fill_bytes(buffer);
    }

    fn unix_millis(&self) -> u64 {
        let mut clock = self.clock_ms.lock().unwrap();
        *clock += 1;
        *clock
    }
}

/// Shared collaborators: one key store and directory (the "server side"),
/// one session store keyed by ordered pairs, one relay.
struct World {
    env: TestEnv,
    keys: Arc<KeyMaterialStore>,
    sessions: Arc<MemorySessionStore>,
    relay: Arc<InMemoryRelay>,
}

impl World {
    fn new(seed: u64) -> Self {
        Self {
            env: TestEnv::seeded(seed),
            keys: Arc::new(KeyMaterialStore::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            relay: Arc::new(InMemoryRelay::new()),
        }
    }

    fn messenger(&self, name: &str) -> Messenger<TestEnv> {
        let messenger = Messenger::new(
            self.env.clone(),
            UserId::parse(name).unwrap(),
            Arc::clone(&self.keys),
            Arc::new(InMemoryDirectory::new(Arc::clone(&self.keys))),
            Arc::clone(&self.sessions) as Arc<dyn SessionStore>,
            Arc::clone(&self.relay) as Arc<dyn RelayTransport>,
        );
        messenger.register().unwrap();
        messenger
    }
}

fn plaintexts(inbound: &[vesper_client::Inbound]) -> Vec<Vec<u8>> {
    inbound.iter().map(|msg| msg.outcome.as_ref().unwrap().clone()).collect()
}

#[tokio::test]
async fn first_send_runs_handshake_and_delivers() {
    let world = World::new(200);
    let alice = world.messenger("alice");
    let bob = world.messenger("bob");

    let plaintext = b"Hello Bob!";
    let receipt = alice.send(bob.local(), plaintext).await.unwrap();
    assert_eq!(receipt.ciphertext_len, plaintext.len() + TAG_SIZE);
    assert!(receipt.timestamp_ms > 0);

    let inbound = bob.receive().await.unwrap();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].sender, *alice.local());
    assert_eq!(inbound[0].outcome.as_ref().unwrap(), plaintext);

    // One handshake: exactly one one-time prekey left the pool.
    let consumed =
        vesper_core::DEFAULT_ONE_TIME_POOL - world.keys.one_time_remaining(bob.local()).unwrap();
    assert_eq!(consumed, 1);
}

#[tokio::test]
async fn conversation_ratchets_across_epochs() {
    let world = World::new(201);
    let alice = world.messenger("alice");
    let bob = world.messenger("bob");

    for round in 0..4u32 {
        let ping = format!("ping {round}");
        alice.send(bob.local(), ping.as_bytes()).await.unwrap();
        assert_eq!(plaintexts(&bob.receive().await.unwrap()), vec![ping.into_bytes()]);

        let pong = format!("pong {round}");
        bob.send(alice.local(), pong.as_bytes()).await.unwrap();
        assert_eq!(plaintexts(&alice.receive().await.unwrap()), vec![pong.into_bytes()]);
    }
}

#[tokio::test]
async fn duplicate_relay_delivery_is_rejected() {
    let world = World::new(202);
    let alice = world.messenger("alice");
    let bob = world.messenger("bob");

    alice.send(bob.local(), b"once only").await.unwrap();
    let first = bob.receive().await.unwrap();
    assert!(first[0].outcome.is_ok());

    // The relay redelivers the same envelope bytes.
    let copies = world.relay.pull(bob.local(), 0).await.unwrap();
    world.relay.post(alice.local(), bob.local(), copies[0].envelope.clone()).await.unwrap();

    let second = bob.receive().await.unwrap();
    assert_eq!(second.len(), 1);
    assert!(matches!(
        second[0].outcome,
        Err(ProtocolError::ReplayDetected { .. })
    ));
}

#[tokio::test]
async fn send_to_unknown_peer_fails() {
    let world = World::new(203);
    let alice = world.messenger("alice");

    let ghost = UserId::parse("ghost").unwrap();
    let result = alice.send(&ghost, b"anyone there?").await;
    assert!(matches!(result, Err(ProtocolError::PeerUnavailable { .. })));
}

#[tokio::test]
async fn malformed_envelope_does_not_wedge_the_mailbox() {
    let world = World::new(204);
    let alice = world.messenger("alice");
    let bob = world.messenger("bob");

    world
        .relay
        .post(alice.local(), bob.local(), Bytes::from_static(b"\x01garbage"))
        .await
        .unwrap();
    alice.send(bob.local(), b"real message").await.unwrap();

    let inbound = bob.receive().await.unwrap();
    assert_eq!(inbound.len(), 2);
    assert!(matches!(
        inbound[0].outcome,
        Err(ProtocolError::MalformedEnvelope(_))
    ));
    assert_eq!(inbound[1].outcome.as_ref().unwrap(), b"real message");

    // The cursor moved past the poisoned envelope.
    assert!(bob.receive().await.unwrap().is_empty());
}

#[tokio::test]
async fn transient_transport_faults_are_retried() {
    let world = World::new(205);
    let alice = world.messenger("alice");
    let bob = world.messenger("bob");

    world.relay.inject_post_faults(2);
    alice.send(bob.local(), b"eventually").await.unwrap();

    let inbound = bob.receive().await.unwrap();
    assert_eq!(inbound[0].outcome.as_ref().unwrap(), b"eventually");
}

#[tokio::test]
async fn exhausted_retries_roll_the_session_back() {
    let world = World::new(206);
    let alice = world.messenger("alice");
    let bob = world.messenger("bob");

    world.relay.inject_post_faults(3);
    let result = alice.send(bob.local(), b"lost").await;
    assert!(matches!(result, Err(ProtocolError::Transport { .. })));

    // Nothing was committed: no session for the pair.
    assert!(world.sessions.load(alice.local(), bob.local()).await.unwrap().is_none());

    // A later send starts clean and works end to end.
    alice.send(bob.local(), b"second try").await.unwrap();
    let inbound = bob.receive().await.unwrap();
    assert_eq!(inbound[0].outcome.as_ref().unwrap(), b"second try");
}

#[tokio::test]
async fn establish_twice_is_rejected() {
    let world = World::new(207);
    let alice = world.messenger("alice");
    let bob = world.messenger("bob");

    alice.establish(bob.local()).await.unwrap();
    let second = alice.establish(bob.local()).await;
    assert!(matches!(second, Err(ProtocolError::SessionAlreadyExists { .. })));
}

#[tokio::test]
async fn rekey_rebuilds_the_responder_session() {
    let world = World::new(208);
    let alice = world.messenger("alice");
    let bob = world.messenger("bob");

    alice.send(bob.local(), b"before").await.unwrap();
    bob.receive().await.unwrap();
    bob.send(alice.local(), b"ack").await.unwrap();
    alice.receive().await.unwrap();

    alice.rekey(bob.local()).await.unwrap();
    alice.send(bob.local(), b"after rekey").await.unwrap();

    let inbound = bob.receive().await.unwrap();
    assert_eq!(inbound[0].outcome.as_ref().unwrap(), b"after rekey");
}

#[tokio::test]
async fn rekey_without_session_fails() {
    let world = World::new(209);
    let alice = world.messenger("alice");
    let bob = world.messenger("bob");

    let result = alice.rekey(bob.local()).await;
    assert!(matches!(result, Err(ProtocolError::SessionNotFound { .. })));
}

#[tokio::test]
async fn teardown_orphans_later_plain_envelopes() {
    let world = World::new(210);
    let alice = world.messenger("alice");
    let bob = world.messenger("bob");

    // A full exchange so Alice's envelopes no longer carry the handshake.
    alice.send(bob.local(), b"hello").await.unwrap();
    bob.receive().await.unwrap();
    bob.send(alice.local(), b"hi").await.unwrap();
    alice.receive().await.unwrap();
    alice.send(bob.local(), b"settled").await.unwrap();
    bob.receive().await.unwrap();

    bob.teardown(alice.local()).await.unwrap();

    alice.send(bob.local(), b"into the void").await.unwrap();
    let inbound = bob.receive().await.unwrap();
    assert!(matches!(
        inbound[0].outcome,
        Err(ProtocolError::SessionNotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_sends_on_one_pair_never_interleave() {
    let world = World::new(211);
    let alice = Arc::new(world.messenger("alice"));
    let bob = world.messenger("bob");

    let mut handles = Vec::new();
    for i in 0..4u32 {
        let alice = Arc::clone(&alice);
        let to = bob.local().clone();
        handles.push(tokio::spawn(async move {
            alice.send(&to, format!("burst {i}").as_bytes()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Chain advances were serialized: the four envelopes carry four
    // distinct consecutive counters within one epoch.
    let deliveries = world.relay.pull(bob.local(), 0).await.unwrap();
    let mut counters: Vec<u32> = deliveries
        .iter()
        .map(|d| Envelope::decode(&d.envelope).unwrap().header.counter)
        .collect();
    counters.sort_unstable();
    assert_eq!(counters, vec![0, 1, 2, 3]);

    let inbound = bob.receive().await.unwrap();
    assert_eq!(inbound.iter().filter(|msg| msg.outcome.is_ok()).count(), 4);
}

/// Relay whose posts never complete; exercises caller-supplied timeouts.
struct StallingRelay;

#[async_trait]
impl RelayTransport for StallingRelay {
    async fn post(
        &self,
        _from: &UserId,
        _to: &UserId,
        _envelope: Bytes,
    ) -> Result<MessageId, ProtocolError> {
        std::future::pending().await
    }

    async fn pull(
        &self,
        _user: &UserId,
        _since: u64,
    ) -> Result<Vec<RelayDelivery>, ProtocolError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn timeout_cancels_without_committing_state() {
    let world = World::new(212);
    let alice_id = UserId::parse("alice").unwrap();
    let bob = world.messenger("bob");

    let alice = Messenger::new(
        world.env.clone(),
        alice_id.clone(),
        Arc::clone(&world.keys),
        Arc::new(InMemoryDirectory::new(Arc::clone(&world.keys))),
        Arc::clone(&world.sessions) as Arc<dyn SessionStore>,
        Arc::new(StallingRelay) as Arc<dyn RelayTransport>,
    );
    alice.register().unwrap();

    let result = alice
        .send_with_timeout(bob.local(), b"never leaves", Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(ProtocolError::Transport { .. })));

    // Cancellation rolled everything back and released the pair lock.
    assert!(world.sessions.load(&alice_id, bob.local()).await.unwrap().is_none());
    let retry = alice
        .send_with_timeout(bob.local(), b"still stalling", Duration::from_millis(50))
        .await;
    assert!(matches!(retry, Err(ProtocolError::Transport { .. })));
}

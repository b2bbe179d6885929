//! Per-pair session state.
//!
//! One `SessionState` exists per ordered (local, remote) pair, created by
//! the handshake and mutated only by the ratchet engine. Retained prior
//! receiving chains and the skipped-key cache form a small bounded index,
//! with explicit eviction once the retention bounds are exceeded.
//!
//! State is serde-serializable so the session store can persist it as
//! opaque bytes; all key material is redacted from `Debug` output and
//! zeroized on drop.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use vesper_proto::HandshakeHeader;
use zeroize::Zeroize;

use crate::identity::UserId;

/// Largest in-chain counter gap the receiver will bridge by deriving and
/// caching intermediate message keys. Guards against maliciously large
/// gaps burning CPU and memory.
pub const MAX_SKIP: u32 = 1000;

/// Prior receiving chains kept resolvable after a DH ratchet step.
pub const MAX_RETAINED_CHAINS: usize = 4;

/// Total skipped message keys retained across all chains.
pub const MAX_CACHED_KEYS: usize = 1024;

/// A receiving chain is identified by the remote ratchet public key that
/// produced it.
pub type ChainId = [u8; 32];

/// One symmetric ratchet chain: current chain key and the counter of the
/// next message it will produce or accept.
#[derive(Clone, Serialize, Deserialize, Zeroize)]
pub struct ChainState {
    pub(crate) chain_key: [u8; 32],
    pub(crate) next_counter: u32,
}

/// A receiving chain keyed by the remote ratchet public that opened it.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct ReceivingChain {
    pub(crate) remote_key: ChainId,
    pub(crate) chain: ChainState,
}

/// Bounded cache of message keys derived for not-yet-delivered messages.
///
/// Keyed by (chain id, counter); FIFO eviction once `capacity` is
/// exceeded. A key is removed the moment it decrypts a message, so a
/// second delivery of the same counter finds nothing and is rejected.
#[derive(Clone, Serialize, Deserialize)]
pub struct SkippedKeyCache {
    keys: HashMap<(ChainId, u32), [u8; 32]>,
    order: VecDeque<(ChainId, u32)>,
    capacity: usize,
}

impl SkippedKeyCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { keys: HashMap::new(), order: VecDeque::new(), capacity }
    }

    pub(crate) fn insert(&mut self, chain: ChainId, counter: u32, key: [u8; 32]) {
        if self.keys.insert((chain, counter), key).is_none() {
            self.order.push_back((chain, counter));
        }
        while self.keys.len() > self.capacity {
            // Order entries for already-consumed keys are stale; skip them.
            let Some(entry) = self.order.pop_front() else { break };
            if let Some(mut evicted) = self.keys.remove(&entry) {
                evicted.zeroize();
            }
        }
    }

    pub(crate) fn take(&mut self, chain: &ChainId, counter: u32) -> Option<[u8; 32]> {
        self.keys.remove(&(*chain, counter))
    }

    pub(crate) fn purge_chain(&mut self, chain: &ChainId) {
        self.keys.retain(|(id, _), key| {
            let keep = id != chain;
            if !keep {
                key.zeroize();
            }
            keep
        });
        self.order.retain(|(id, _)| id != chain);
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn zeroize_keys(&mut self) {
        for key in self.keys.values_mut() {
            key.zeroize();
        }
        self.keys.clear();
        self.order.clear();
    }
}

/// Ratchet state for one ordered (local, remote) pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub(crate) local: UserId,
    pub(crate) remote: UserId,

    pub(crate) root_key: [u8; 32],

    /// Sending chain; a responder has none until its first DH ratchet.
    pub(crate) sending: Option<ChainState>,
    /// Final length of the previous sending chain epoch (PN on the wire).
    pub(crate) previous_sending_len: u32,

    /// Current local ratchet keypair.
    pub(crate) ratchet_secret: [u8; 32],
    pub(crate) ratchet_public: [u8; 32],

    /// Remote ratchet public the sending chain was derived against.
    pub(crate) remote_ratchet: Option<ChainId>,

    /// Active receiving chain (back) plus retained prior chains.
    pub(crate) receiving: VecDeque<ReceivingChain>,

    /// Message keys derived for skipped counters, bounded.
    pub(crate) skipped: SkippedKeyCache,

    /// Handshake header the initiator repeats on every envelope until its
    /// first successful decrypt proves the responder holds the session.
    pub(crate) pending_handshake: Option<HandshakeHeader>,
}

impl SessionState {
    /// Local side of the pair.
    pub fn local(&self) -> &UserId {
        &self.local
    }

    /// Remote side of the pair.
    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    /// Remote ratchet public key currently driving the sending chain.
    pub fn remote_ratchet_key(&self) -> Option<ChainId> {
        self.remote_ratchet
    }

    /// Counter the next outgoing message will carry.
    pub fn sending_counter(&self) -> u32 {
        self.sending.as_ref().map_or(0, |chain| chain.next_counter)
    }

    /// Final length of the previous sending epoch.
    pub fn previous_chain_len(&self) -> u32 {
        self.previous_sending_len
    }

    /// Number of message keys in the skipped-key cache.
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Whether outgoing envelopes still carry the handshake section.
    pub fn has_pending_handshake(&self) -> bool {
        self.pending_handshake.is_some()
    }

    pub(crate) fn receiving_index(&self, key: &ChainId) -> Option<usize> {
        self.receiving.iter().position(|chain| chain.remote_key == *key)
    }

    /// Append a new active receiving chain, evicting the oldest retained
    /// chain (and its cached keys) beyond the retention bound.
    pub(crate) fn push_receiving_chain(&mut self, remote_key: ChainId, chain: ChainState) {
        self.receiving.push_back(ReceivingChain { remote_key, chain });
        while self.receiving.len() > MAX_RETAINED_CHAINS {
            if let Some(mut evicted) = self.receiving.pop_front() {
                self.skipped.purge_chain(&evicted.remote_key);
                evicted.chain.zeroize();
            }
        }
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("root_key", &"<redacted>")
            .field("sending_counter", &self.sending_counter())
            .field("previous_sending_len", &self.previous_sending_len)
            .field("receiving_chains", &self.receiving.len())
            .field("skipped_keys", &self.skipped.len())
            .field("pending_handshake", &self.pending_handshake.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.ratchet_secret.zeroize();
        if let Some(chain) = &mut self.sending {
            chain.zeroize();
        }
        for receiving in &mut self.receiving {
            receiving.chain.zeroize();
        }
        self.skipped.zeroize_keys();
    }
}

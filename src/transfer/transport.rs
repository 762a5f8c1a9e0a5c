//! Round-addressed message transport.
//!
//! Every message is tagged with its channel name and a [`Suffix`] (usually
//! the training-iteration index), so one declared channel can be reused
//! across many rounds without collision: the pair `(channel, suffix)` is a
//! unique logical message slot. A slot is written at most once per sender
//! and consumed at most once per receiver.
//!
//! [`Endpoint`] is the per-party handle. Sends are non-blocking; receives
//! suspend until the matching slot is filled or the configured deadline
//! elapses. Messages that arrive before they are asked for are buffered by
//! slot, which gives per-channel ordering by suffix without any ordering
//! guarantee across channels.
//!
//! The transport assumes a reliable, ordered point-to-point medium. The
//! in-process [`Federation::local`] wiring over tokio mpsc channels provides
//! one such medium and is also what the protocol tests run on.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{timeout_at, Instant},
};
use tracing::{debug, trace};

use super::{AuthorizationError, ChannelRegistry, PartyId, Role, SchemaDigest};

/// The round address part of a message slot: an ordered tuple of indices.
///
/// Most protocol steps use a single element (the iteration index); nested
/// loops may push further elements.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Suffix(Vec<u64>);

impl Suffix {
    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }
}

impl From<u64> for Suffix {
    fn from(index: u64) -> Self {
        Self(vec![index])
    }
}

impl From<(u64,)> for Suffix {
    fn from(tuple: (u64,)) -> Self {
        Self(vec![tuple.0])
    }
}

impl From<(u64, u64)> for Suffix {
    fn from(tuple: (u64, u64)) -> Self {
        Self(vec![tuple.0, tuple.1])
    }
}

impl From<Vec<u64>> for Suffix {
    fn from(indices: Vec<u64>) -> Self {
        Self(indices)
    }
}

impl std::fmt::Display for Suffix {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("-"))
    }
}

/// One message in flight: a payload addressed by channel, suffix and sender,
/// stamped with the sender's channel-schema digest.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub channel: String,
    pub suffix: Suffix,
    pub sender: PartyId,
    pub schema: SchemaDigest,
    pub payload: Vec<u8>,
}

/// An error related to sending or receiving on a channel.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error("channel {0} is not declared")]
    UnknownChannel(String),

    #[error("timed out waiting for {channel}[{suffix}] from {sender}")]
    Timeout {
        channel: String,
        suffix: Suffix,
        sender: PartyId,
    },

    #[error("{channel}[{suffix}] was already sent by this party")]
    DuplicateSend { channel: String, suffix: Suffix },

    #[error("{0} uses a different channel schema")]
    SchemaMismatch(PartyId),

    #[error("payload codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("{0} is no longer reachable")]
    Disconnected(PartyId),
}

/// The transport handle of one party.
///
/// An endpoint is exclusively owned by the party's logical thread of
/// control; every suspension point of the protocol is a [`get`] or a
/// [`collect_hosts`] on it.
///
/// [`get`]: Endpoint::get
/// [`collect_hosts`]: Endpoint::collect_hosts
pub struct Endpoint {
    id: PartyId,
    n_hosts: u32,
    registry: Arc<ChannelRegistry>,
    schema: SchemaDigest,
    deadline: Duration,
    peers: HashMap<PartyId, mpsc::UnboundedSender<Envelope>>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    pending: HashMap<(String, Suffix, PartyId), Vec<u8>>,
    sent: HashSet<(String, Suffix)>,
}

impl Endpoint {
    pub fn id(&self) -> PartyId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.id.role
    }

    pub fn n_hosts(&self) -> u32 {
        self.n_hosts
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Sends `value` to every party authorized to receive on `channel`, for
    /// the message slot `(channel, suffix)`.
    ///
    /// The send is non-blocking. Writing the same slot twice is a protocol
    /// violation and fails with [`TransferError::DuplicateSend`] without
    /// reaching any peer, as does a send by a party that is not the declared
    /// source of the channel.
    pub fn remote<T: Serialize>(
        &mut self,
        channel: &str,
        value: &T,
        suffix: impl Into<Suffix>,
    ) -> Result<(), TransferError> {
        let suffix = suffix.into();
        let decl = self
            .registry
            .channel(channel)
            .ok_or_else(|| TransferError::UnknownChannel(channel.to_string()))?
            .clone();
        decl.authorize_send(self.id)?;

        if !self.sent.insert((channel.to_string(), suffix.clone())) {
            return Err(TransferError::DuplicateSend {
                channel: channel.to_string(),
                suffix,
            });
        }

        let payload = bincode::serialize(value)?;
        for (peer, tx) in &self.peers {
            if *peer == self.id || !decl.destinations.contains(&peer.role) {
                continue;
            }
            debug!(channel, suffix = %suffix, peer = %peer, "dispatching message");
            tx.send(Envelope {
                channel: channel.to_string(),
                suffix: suffix.clone(),
                sender: self.id,
                schema: self.schema,
                payload: payload.clone(),
            })
            .map_err(|_| TransferError::Disconnected(*peer))?;
        }
        Ok(())
    }

    /// Receives the message for `(channel, suffix)` from `sender`.
    ///
    /// Suspends until the slot is filled, consuming it, or fails with
    /// [`TransferError::Timeout`] once the deadline elapses. Messages for
    /// other slots that arrive in the meantime are buffered; a second
    /// envelope for a slot that is already buffered is a protocol violation
    /// and fails with [`TransferError::DuplicateSend`].
    pub async fn get<T: DeserializeOwned>(
        &mut self,
        channel: &str,
        sender: PartyId,
        suffix: impl Into<Suffix>,
    ) -> Result<T, TransferError> {
        let suffix = suffix.into();
        let decl = self
            .registry
            .channel(channel)
            .ok_or_else(|| TransferError::UnknownChannel(channel.to_string()))?;
        decl.authorize_receive(self.id, sender)?;

        let slot = (channel.to_string(), suffix.clone(), sender);
        let deadline = Instant::now() + self.deadline;
        loop {
            if let Some(payload) = self.pending.remove(&slot) {
                trace!(channel, suffix = %suffix, sender = %sender, "slot consumed");
                return Ok(bincode::deserialize(&payload)?);
            }
            let envelope = timeout_at(deadline, self.inbox.recv())
                .await
                .map_err(|_| TransferError::Timeout {
                    channel: channel.to_string(),
                    suffix: suffix.clone(),
                    sender,
                })?
                .ok_or(TransferError::Disconnected(sender))?;
            if envelope.schema != self.schema {
                return Err(TransferError::SchemaMismatch(envelope.sender));
            }
            let occupied = self
                .pending
                .insert(
                    (
                        envelope.channel.clone(),
                        envelope.suffix.clone(),
                        envelope.sender,
                    ),
                    envelope.payload,
                )
                .is_some();
            if occupied {
                return Err(TransferError::DuplicateSend {
                    channel: envelope.channel,
                    suffix: envelope.suffix,
                });
            }
        }
    }

    /// Receives the `(channel, suffix)` message of *every* registered Host.
    ///
    /// This is the Arbiter's fan-in barrier: it resolves only once all Hosts
    /// have replied for the suffix. Partial replies stay buffered; a missing
    /// reply times the whole collection out.
    pub async fn collect_hosts<T: DeserializeOwned>(
        &mut self,
        channel: &str,
        suffix: impl Into<Suffix>,
    ) -> Result<BTreeMap<u32, T>, TransferError> {
        let suffix = suffix.into();
        let mut replies = BTreeMap::new();
        for index in 0..self.n_hosts {
            let value = self
                .get(channel, PartyId::host(index), suffix.clone())
                .await?;
            replies.insert(index, value);
        }
        Ok(replies)
    }
}

/// The endpoints of a fully-wired local federation.
pub struct Federation {
    pub arbiter: Endpoint,
    pub guest: Endpoint,
    pub hosts: Vec<Endpoint>,
}

impl Federation {
    /// Wires one Arbiter, one Guest and `n_hosts` Hosts over in-process
    /// mpsc channels.
    ///
    /// Every endpoint shares the same registry and per-message deadline.
    pub fn local(n_hosts: u32, registry: Arc<ChannelRegistry>, deadline: Duration) -> Self {
        let mut ids = vec![PartyId::arbiter(), PartyId::guest()];
        ids.extend((0..n_hosts).map(PartyId::host));

        let mut senders = HashMap::new();
        let mut inboxes = Vec::new();
        for id in &ids {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(*id, tx);
            inboxes.push(rx);
        }

        let schema = registry.schema_digest();
        let mut endpoints: Vec<Endpoint> = ids
            .into_iter()
            .zip(inboxes)
            .map(|(id, inbox)| Endpoint {
                id,
                n_hosts,
                registry: Arc::clone(&registry),
                schema,
                deadline,
                peers: senders.clone(),
                inbox,
                pending: HashMap::new(),
                sent: HashSet::new(),
            })
            .collect();

        let hosts = endpoints.split_off(2);
        // UNWRAP_SAFE: the vector was built with the arbiter and guest first
        let guest = endpoints.pop().unwrap();
        let arbiter = endpoints.pop().unwrap();
        Federation {
            arbiter,
            guest,
            hosts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::channels;

    fn federation(n_hosts: u32) -> Federation {
        Federation::local(
            n_hosts,
            Arc::new(ChannelRegistry::homo()),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_remote_and_get() {
        let Federation {
            mut arbiter,
            mut guest,
            ..
        } = federation(0);

        guest
            .remote(channels::GUEST_LOSS, &0.125_f64, (3,))
            .unwrap();
        let loss: f64 = arbiter
            .get(channels::GUEST_LOSS, PartyId::guest(), (3,))
            .await
            .unwrap();
        assert_eq!(loss, 0.125);
    }

    #[tokio::test]
    async fn test_suffixes_do_not_collide() {
        let Federation {
            mut arbiter,
            mut guest,
            ..
        } = federation(0);

        guest.remote(channels::GUEST_LOSS, &1.0_f64, (0,)).unwrap();
        guest.remote(channels::GUEST_LOSS, &2.0_f64, (1,)).unwrap();

        // consuming out of order must not mix the slots up
        let second: f64 = arbiter
            .get(channels::GUEST_LOSS, PartyId::guest(), (1,))
            .await
            .unwrap();
        let first: f64 = arbiter
            .get(channels::GUEST_LOSS, PartyId::guest(), (0,))
            .await
            .unwrap();
        assert_eq!((first, second), (1.0, 2.0));
    }

    #[tokio::test]
    async fn test_duplicate_send_is_rejected() {
        let Federation {
            mut guest,
            arbiter: _arbiter,
            ..
        } = federation(0);

        guest.remote(channels::GUEST_LOSS, &1.0_f64, (0,)).unwrap();
        let err = guest
            .remote(channels::GUEST_LOSS, &1.0_f64, (0,))
            .unwrap_err();
        assert!(matches!(err, TransferError::DuplicateSend { .. }));
    }

    #[tokio::test]
    async fn test_unauthorized_send() {
        let Federation {
            mut arbiter,
            mut hosts,
            ..
        } = federation(1);

        let err = hosts[0]
            .remote(channels::GUEST_LOSS, &1.0_f64, (0,))
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Authorization(AuthorizationError::Send { .. })
        ));

        // nothing reached the arbiter
        let err = arbiter
            .get::<f64>(channels::GUEST_LOSS, PartyId::guest(), (0,))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_unauthorized_receive() {
        let Federation { mut guest, .. } = federation(1);

        let err = guest
            .get::<f64>(channels::HOST_LOSS, PartyId::host(0), (0,))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Authorization(AuthorizationError::Receive { .. })
        ));
    }

    #[tokio::test]
    async fn test_collect_hosts_waits_for_all() {
        let Federation {
            mut arbiter,
            mut hosts,
            ..
        } = federation(3);

        for (index, host) in hosts.iter_mut().enumerate() {
            host.remote(channels::HOST_LOSS, &(index as f64), (7,))
                .unwrap();
        }
        let replies: BTreeMap<u32, f64> = arbiter
            .collect_hosts(channels::HOST_LOSS, (7,))
            .await
            .unwrap();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[&0], 0.0);
        assert_eq!(replies[&2], 2.0);
    }

    #[tokio::test]
    async fn test_collect_hosts_times_out_on_partial_replies() {
        let Federation {
            mut arbiter,
            mut hosts,
            ..
        } = federation(2);

        hosts[0].remote(channels::HOST_LOSS, &1.0_f64, (0,)).unwrap();
        let err = arbiter
            .collect_hosts::<f64>(channels::HOST_LOSS, (0,))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_fan_out_reaches_guest_and_all_hosts() {
        let Federation {
            mut arbiter,
            mut guest,
            mut hosts,
        } = federation(2);

        arbiter
            .remote(channels::CONVERGE_FLAG, &true, (4,))
            .unwrap();
        let flag: bool = guest
            .get(channels::CONVERGE_FLAG, PartyId::arbiter(), (4,))
            .await
            .unwrap();
        assert!(flag);
        for host in hosts.iter_mut() {
            let flag: bool = host
                .get(channels::CONVERGE_FLAG, PartyId::arbiter(), (4,))
                .await
                .unwrap();
            assert!(flag);
        }
    }

    #[tokio::test]
    async fn test_duplicate_buffered_slot_is_rejected() {
        let registry = Arc::new(ChannelRegistry::homo());
        let Federation {
            mut arbiter,
            mut guest,
            ..
        } = Federation::local(0, Arc::clone(&registry), Duration::from_millis(200));
        // a second endpoint claiming the guest identity, wired to the same
        // arbiter
        let mut imposter = {
            let mut federation = Federation::local(0, registry, Duration::from_millis(200));
            federation.guest.peers = arbiter.peers.clone();
            federation.guest
        };

        guest.remote(channels::GUEST_LOSS, &1.0_f64, (0,)).unwrap();
        imposter
            .remote(channels::GUEST_LOSS, &2.0_f64, (0,))
            .unwrap();

        // waiting on another slot forces both envelopes through the buffer
        let err = arbiter
            .get::<f64>(channels::GUEST_LOSS, PartyId::guest(), (1,))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::DuplicateSend { .. }));
    }

    #[tokio::test]
    async fn test_schema_mismatch_fails_fast() {
        let registry = Arc::new(ChannelRegistry::homo());
        let mut stale = ChannelRegistry::homo();
        stale
            .declare("legacy", Role::Guest, &[Role::Arbiter])
            .unwrap();

        let Federation { mut arbiter, .. } =
            Federation::local(0, Arc::clone(&registry), Duration::from_millis(200));
        let Federation { mut guest, .. } = {
            // a guest wired against a different schema version
            let mut federation =
                Federation::local(0, Arc::new(stale), Duration::from_millis(200));
            federation.guest.peers = arbiter.peers.clone();
            federation
        };

        guest.remote(channels::GUEST_LOSS, &1.0_f64, (0,)).unwrap();
        let err = arbiter
            .get::<f64>(channels::GUEST_LOSS, PartyId::guest(), (0,))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SchemaMismatch(_)));
    }
}

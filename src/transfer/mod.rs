//! Role-authorized transfer channels between federation parties.
//!
//! A [`ChannelRegistry`] holds the immutable set of named channels a session
//! may use. Every channel declares exactly one sender role and a set of
//! receiver roles; the transport layer consults the registry on every send
//! and receive, so a misrouted message is rejected before it reaches a peer.
//!
//! The registry is constructed once per session and passed by reference to
//! every component; there is no process-wide channel state. All parties must
//! construct the identical registry: its [schema digest] travels with every
//! message and a mismatch fails the session fast instead of misrouting.
//!
//! [schema digest]: ChannelRegistry::schema_digest

pub mod transport;

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::hash::sha256;
use thiserror::Error;

/// The role a party plays in the federation.
///
/// The Guest holds the primary dataset, Hosts hold supplementary datasets,
/// and the Arbiter relays and aggregates without ever seeing raw data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Guest,
    Host,
    Arbiter,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Guest => write!(f, "guest"),
            Role::Host => write!(f, "host"),
            Role::Arbiter => write!(f, "arbiter"),
        }
    }
}

/// A party identity: the role plus the index distinguishing multiple hosts.
///
/// The Guest and the Arbiter always carry index `0`; each Host carries a
/// unique index assigned at session setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartyId {
    pub role: Role,
    pub index: u32,
}

impl PartyId {
    pub fn guest() -> Self {
        Self {
            role: Role::Guest,
            index: 0,
        }
    }

    pub fn host(index: u32) -> Self {
        Self {
            role: Role::Host,
            index,
        }
    }

    pub fn arbiter() -> Self {
        Self {
            role: Role::Arbiter,
            index: 0,
        }
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.role, self.index)
    }
}

/// Channel names of the horizontal-federation schema.
pub mod channels {
    pub const GUEST_UUID: &str = "guest_uuid";
    pub const HOST_UUID: &str = "host_uuid";
    pub const UUID_CONFLICT_FLAG: &str = "uuid_conflict_flag";
    pub const DH_PUBKEY: &str = "dh_pubkey";
    pub const DH_CIPHERTEXT_HOST: &str = "dh_ciphertext_host";
    pub const DH_CIPHERTEXT_GUEST: &str = "dh_ciphertext_guest";
    pub const DH_CIPHERTEXT_BC: &str = "dh_ciphertext_bc";
    pub const GUEST_PARTY_WEIGHT: &str = "guest_party_weight";
    pub const HOST_PARTY_WEIGHT: &str = "host_party_weight";
    pub const GUEST_MODEL: &str = "guest_model";
    pub const HOST_MODEL: &str = "host_model";
    pub const AGGREGATED_MODEL: &str = "aggregated_model";
    pub const GUEST_LOSS: &str = "guest_loss";
    pub const HOST_LOSS: &str = "host_loss";
    pub const AGGREGATED_LOSS: &str = "aggregated_loss";
    pub const CONVERGE_FLAG: &str = "converge_flag";
}

/// An error related to channel misuse.
///
/// Authorization failures indicate a programming or configuration error and
/// are never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("{party} is not the declared sender of channel {channel}")]
    Send { channel: String, party: PartyId },

    #[error("{party} is not a declared receiver of channel {channel}")]
    Receive { channel: String, party: PartyId },

    #[error("{party} cannot be the origin of messages on channel {channel}")]
    Origin { channel: String, party: PartyId },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("channel {0} is already declared")]
pub struct DuplicateChannel(pub String);

/// The declaration of one named channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelDecl {
    pub name: String,
    pub source: Role,
    pub destinations: Vec<Role>,
}

impl ChannelDecl {
    /// Checks that `party` may send on this channel.
    pub fn authorize_send(&self, party: PartyId) -> Result<(), AuthorizationError> {
        if party.role == self.source {
            Ok(())
        } else {
            Err(AuthorizationError::Send {
                channel: self.name.clone(),
                party,
            })
        }
    }

    /// Checks that `receiver` may consume a message sent by `sender` on this
    /// channel.
    pub fn authorize_receive(
        &self,
        receiver: PartyId,
        sender: PartyId,
    ) -> Result<(), AuthorizationError> {
        if !self.destinations.contains(&receiver.role) {
            return Err(AuthorizationError::Receive {
                channel: self.name.clone(),
                party: receiver,
            });
        }
        if sender.role != self.source {
            return Err(AuthorizationError::Origin {
                channel: self.name.clone(),
                party: sender,
            });
        }
        Ok(())
    }
}

/// A digest identifying one channel schema.
///
/// Two registries with the same declarations produce the same digest. The
/// digest is embedded in every wire envelope; a receiver drops the session
/// on the first envelope carrying a foreign digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDigest(sha256::Digest);

/// The immutable set of channels available to a session.
#[derive(Clone, Debug, Default)]
pub struct ChannelRegistry {
    decls: HashMap<String, ChannelDecl>,
}

impl ChannelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a channel. Each name may be declared at most once.
    pub fn declare(
        &mut self,
        name: &str,
        source: Role,
        destinations: &[Role],
    ) -> Result<(), DuplicateChannel> {
        if self.decls.contains_key(name) {
            return Err(DuplicateChannel(name.to_string()));
        }
        self.decls.insert(
            name.to_string(),
            ChannelDecl {
                name: name.to_string(),
                source,
                destinations: destinations.to_vec(),
            },
        );
        Ok(())
    }

    /// The channel schema of the horizontal-federation protocol: identity
    /// negotiation, key exchange, weight collection, model and loss
    /// aggregation, and the convergence flag.
    pub fn homo() -> Self {
        use self::channels::*;
        use Role::{Arbiter, Guest, Host};

        let table: &[(&str, Role, &[Role])] = &[
            (GUEST_UUID, Guest, &[Arbiter]),
            (HOST_UUID, Host, &[Arbiter]),
            (UUID_CONFLICT_FLAG, Arbiter, &[Guest, Host]),
            (DH_PUBKEY, Arbiter, &[Guest, Host]),
            (DH_CIPHERTEXT_HOST, Host, &[Arbiter]),
            (DH_CIPHERTEXT_GUEST, Guest, &[Arbiter]),
            (DH_CIPHERTEXT_BC, Arbiter, &[Guest, Host]),
            (GUEST_PARTY_WEIGHT, Guest, &[Arbiter]),
            (HOST_PARTY_WEIGHT, Host, &[Arbiter]),
            (GUEST_MODEL, Guest, &[Arbiter]),
            (HOST_MODEL, Host, &[Arbiter]),
            (AGGREGATED_MODEL, Arbiter, &[Guest, Host]),
            (GUEST_LOSS, Guest, &[Arbiter]),
            (HOST_LOSS, Host, &[Arbiter]),
            (AGGREGATED_LOSS, Arbiter, &[Guest, Host]),
            (CONVERGE_FLAG, Arbiter, &[Guest, Host]),
        ];

        let mut registry = Self::new();
        for (name, source, destinations) in table {
            // UNWRAP_SAFE: the names in the static table are distinct
            registry.declare(name, *source, destinations).unwrap();
        }
        registry
    }

    /// Looks up a channel declaration.
    pub fn channel(&self, name: &str) -> Option<&ChannelDecl> {
        self.decls.get(name)
    }

    /// The number of declared channels.
    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    /// Computes the digest of this schema.
    pub fn schema_digest(&self) -> SchemaDigest {
        let mut names: Vec<&String> = self.decls.keys().collect();
        names.sort();
        let mut input = Vec::new();
        for name in names {
            // UNWRAP_SAFE: the key was just taken from the map
            let decl = self.decls.get(name).unwrap();
            input.extend_from_slice(decl.name.as_bytes());
            input.push(b'>');
            input.extend_from_slice(decl.source.to_string().as_bytes());
            input.push(b':');
            for destination in &decl.destinations {
                input.extend_from_slice(destination.to_string().as_bytes());
                input.push(b',');
            }
            input.push(b';');
        }
        SchemaDigest(sha256::hash(&input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_homo_schema() {
        let registry = ChannelRegistry::homo();
        assert_eq!(registry.len(), 16);

        let decl = registry.channel(channels::GUEST_MODEL).unwrap();
        assert_eq!(decl.source, Role::Guest);
        assert_eq!(decl.destinations, vec![Role::Arbiter]);

        let decl = registry.channel(channels::CONVERGE_FLAG).unwrap();
        assert_eq!(decl.source, Role::Arbiter);
        assert_eq!(decl.destinations, vec![Role::Guest, Role::Host]);
    }

    #[test]
    fn test_duplicate_declaration() {
        let mut registry = ChannelRegistry::new();
        registry
            .declare("loss", Role::Guest, &[Role::Arbiter])
            .unwrap();
        assert_eq!(
            registry.declare("loss", Role::Guest, &[Role::Arbiter]),
            Err(DuplicateChannel("loss".to_string())),
        );
    }

    #[test]
    fn test_send_authorization() {
        let registry = ChannelRegistry::homo();
        let decl = registry.channel(channels::GUEST_UUID).unwrap();
        assert!(decl.authorize_send(PartyId::guest()).is_ok());
        assert_eq!(
            decl.authorize_send(PartyId::host(1)),
            Err(AuthorizationError::Send {
                channel: channels::GUEST_UUID.to_string(),
                party: PartyId::host(1),
            }),
        );
    }

    #[test]
    fn test_receive_authorization() {
        let registry = ChannelRegistry::homo();
        let decl = registry.channel(channels::UUID_CONFLICT_FLAG).unwrap();
        assert!(decl
            .authorize_receive(PartyId::host(0), PartyId::arbiter())
            .is_ok());
        // the arbiter is the sender of this channel, not a receiver
        assert!(decl
            .authorize_receive(PartyId::arbiter(), PartyId::arbiter())
            .is_err());
        // a host cannot be the origin of the conflict flag
        assert!(decl
            .authorize_receive(PartyId::guest(), PartyId::host(0))
            .is_err());
    }

    #[test]
    fn test_schema_digest() {
        assert_eq!(
            ChannelRegistry::homo().schema_digest(),
            ChannelRegistry::homo().schema_digest(),
        );

        let mut other = ChannelRegistry::homo();
        other
            .declare("extra", Role::Guest, &[Role::Arbiter])
            .unwrap();
        assert_ne!(
            ChannelRegistry::homo().schema_digest(),
            other.schema_digest(),
        );
    }
}

//! Pairwise Diffie-Hellman key agreement relayed through the Arbiter.
//!
//! The Arbiter publishes the domain parameters, collects every party's
//! public value and broadcasts the combined directory. It never parses the
//! values it relays; they stay opaque bytes on its side, so a compromised
//! relay learns nothing beyond what any network observer of a plain
//! Diffie-Hellman exchange would.
//!
//! Each Guest/Host pair ends up with the same [`SessionKey`], which seeds
//! the pad streams of the masking layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    crypto::{DhKeyPair, DhParams, SessionKey},
    transfer::{channels, transport::Endpoint, PartyId, Role},
    ProtocolError,
};

/// The broadcast directory of all published public values.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicDirectory {
    pub guest: Vec<u8>,
    pub hosts: BTreeMap<u32, Vec<u8>>,
}

/// Runs the key agreement as a Guest or Host.
///
/// Returns the session key shared with each masking peer: one key per Host
/// for the Guest, the single Guest key for a Host.
pub async fn exchange(
    endpoint: &mut Endpoint,
) -> Result<BTreeMap<PartyId, SessionKey>, ProtocolError> {
    let channel = match endpoint.role() {
        Role::Guest => channels::DH_CIPHERTEXT_GUEST,
        Role::Host => channels::DH_CIPHERTEXT_HOST,
        Role::Arbiter => {
            return Err(ProtocolError::WrongRole {
                party: endpoint.id(),
                procedure: "key exchange",
            });
        }
    };

    let params: DhParams = endpoint
        .get(channels::DH_PUBKEY, PartyId::arbiter(), (0,))
        .await?;
    params.validate()?;
    let keypair = DhKeyPair::generate(&params);
    endpoint.remote(channel, &keypair.public_bytes(), (0,))?;

    let directory: PublicDirectory = endpoint
        .get(channels::DH_CIPHERTEXT_BC, PartyId::arbiter(), (0,))
        .await?;

    let mut keys = BTreeMap::new();
    if endpoint.role() == Role::Guest {
        for (index, bytes) in &directory.hosts {
            debug!(party = %endpoint.id(), peer = %PartyId::host(*index), "deriving session key");
            keys.insert(PartyId::host(*index), keypair.agree(bytes)?);
        }
    } else {
        debug!(party = %endpoint.id(), peer = %PartyId::guest(), "deriving session key");
        keys.insert(PartyId::guest(), keypair.agree(&directory.guest)?);
    }
    info!(party = %endpoint.id(), peers = keys.len(), "key exchange complete");
    Ok(keys)
}

/// Relays the key agreement as the Arbiter.
///
/// The relayed public values are treated as opaque bytes end to end.
pub async fn relay(endpoint: &mut Endpoint) -> Result<(), ProtocolError> {
    if endpoint.role() != Role::Arbiter {
        return Err(ProtocolError::WrongRole {
            party: endpoint.id(),
            procedure: "key-exchange relay",
        });
    }

    endpoint.remote(channels::DH_PUBKEY, &DhParams::modp_2048(), (0,))?;
    let guest: Vec<u8> = endpoint
        .get(channels::DH_CIPHERTEXT_GUEST, PartyId::guest(), (0,))
        .await?;
    let hosts: BTreeMap<u32, Vec<u8>> = endpoint
        .collect_hosts(channels::DH_CIPHERTEXT_HOST, (0,))
        .await?;
    let parties = hosts.len() + 1;
    endpoint.remote(channels::DH_CIPHERTEXT_BC, &PublicDirectory { guest, hosts }, (0,))?;
    info!(parties, "public values relayed");
    Ok(())
}

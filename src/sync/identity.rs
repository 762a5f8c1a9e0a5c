//! Party-identity negotiation.
//!
//! Every Guest and Host proposes a random UUID; the Arbiter checks the
//! combined set for duplicates and broadcasts a conflict flag. On conflict
//! all parties propose fresh UUIDs under the next attempt suffix, up to a
//! configured number of attempts. With random 128-bit identifiers a conflict
//! is already vanishingly unlikely on the first attempt; the retry bound
//! only turns a misbehaving party into a clean failure instead of a livelock.

use std::collections::HashSet;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    transfer::{channels, transport::Endpoint, PartyId, Role},
    ProtocolError,
};

/// Proposes UUIDs as a Guest or Host until the Arbiter confirms one.
pub async fn negotiate(endpoint: &mut Endpoint, max_retries: u32) -> Result<Uuid, ProtocolError> {
    let channel = match endpoint.role() {
        Role::Guest => channels::GUEST_UUID,
        Role::Host => channels::HOST_UUID,
        Role::Arbiter => {
            return Err(ProtocolError::WrongRole {
                party: endpoint.id(),
                procedure: "identity negotiation",
            });
        }
    };

    for attempt in 0..max_retries {
        let uuid = Uuid::new_v4();
        debug!(party = %endpoint.id(), attempt, %uuid, "proposing uuid");
        endpoint.remote(channel, &uuid, (attempt as u64,))?;
        let conflict: bool = endpoint
            .get(
                channels::UUID_CONFLICT_FLAG,
                PartyId::arbiter(),
                (attempt as u64,),
            )
            .await?;
        if !conflict {
            info!(party = %endpoint.id(), %uuid, "uuid confirmed");
            return Ok(uuid);
        }
        warn!(party = %endpoint.id(), attempt, "uuid conflict, retrying");
    }
    Err(ProtocolError::UuidRetriesExhausted(max_retries))
}

/// Collects and validates the UUID proposals as the Arbiter.
///
/// Returns the confirmed identities, the Guest first and then the Hosts in
/// index order.
pub async fn validate(
    endpoint: &mut Endpoint,
    max_retries: u32,
) -> Result<Vec<Uuid>, ProtocolError> {
    if endpoint.role() != Role::Arbiter {
        return Err(ProtocolError::WrongRole {
            party: endpoint.id(),
            procedure: "identity validation",
        });
    }

    for attempt in 0..max_retries {
        let guest: Uuid = endpoint
            .get(channels::GUEST_UUID, PartyId::guest(), (attempt as u64,))
            .await?;
        let hosts = endpoint
            .collect_hosts::<Uuid>(channels::HOST_UUID, (attempt as u64,))
            .await?;

        let mut uuids = vec![guest];
        uuids.extend(hosts.into_iter().map(|(_, uuid)| uuid));
        let conflicted = conflict(&uuids);
        endpoint.remote(channels::UUID_CONFLICT_FLAG, &conflicted, (attempt as u64,))?;
        if !conflicted {
            info!(attempt, parties = uuids.len(), "all uuids confirmed");
            return Ok(uuids);
        }
        warn!(attempt, "duplicate uuid proposals, requesting fresh ones");
    }
    Err(ProtocolError::UuidRetriesExhausted(max_retries))
}

/// Whether the proposed identities contain a duplicate.
pub(crate) fn conflict(uuids: &[Uuid]) -> bool {
    let mut seen = HashSet::new();
    !uuids.iter().all(|uuid| seen.insert(uuid))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::transfer::{transport::Federation, ChannelRegistry};

    #[test]
    fn test_conflict_detection() {
        let first = Uuid::from_u128(1);
        let second = Uuid::from_u128(2);
        assert!(!conflict(&[]));
        assert!(!conflict(&[first, second]));
        assert!(conflict(&[first, second, first]));
    }

    #[tokio::test]
    async fn test_negotiation_confirms_distinct_uuids() {
        let Federation {
            mut arbiter,
            mut guest,
            mut hosts,
        } = Federation::local(
            2,
            Arc::new(ChannelRegistry::homo()),
            Duration::from_secs(5),
        );

        let arbiter = tokio::spawn(async move { validate(&mut arbiter, 30).await });
        let guest = tokio::spawn(async move { negotiate(&mut guest, 30).await });
        let members: Vec<_> = hosts
            .drain(..)
            .map(|mut host| tokio::spawn(async move { negotiate(&mut host, 30).await }))
            .collect();

        let confirmed = arbiter.await.unwrap().unwrap();
        assert_eq!(confirmed.len(), 3);
        assert!(!conflict(&confirmed));

        assert_eq!(guest.await.unwrap().unwrap(), confirmed[0]);
        for member in members {
            let uuid = member.await.unwrap().unwrap();
            assert!(confirmed.contains(&uuid));
        }
    }

    #[tokio::test]
    async fn test_conflicting_proposals_are_retried() {
        let Federation {
            mut arbiter,
            mut guest,
            mut hosts,
        } = Federation::local(
            1,
            Arc::new(ChannelRegistry::homo()),
            Duration::from_secs(5),
        );
        let mut host = hosts.remove(0);

        let members = tokio::spawn(async move {
            // both parties propose the same uuid on the first attempt
            let duplicate = Uuid::from_u128(7);
            guest
                .remote(channels::GUEST_UUID, &duplicate, (0,))
                .unwrap();
            host.remote(channels::HOST_UUID, &duplicate, (0,)).unwrap();
            let flag: bool = guest
                .get(channels::UUID_CONFLICT_FLAG, PartyId::arbiter(), (0,))
                .await
                .unwrap();
            assert!(flag);
            let flag: bool = host
                .get(channels::UUID_CONFLICT_FLAG, PartyId::arbiter(), (0,))
                .await
                .unwrap();
            assert!(flag);

            // distinct proposals on the second attempt
            guest
                .remote(channels::GUEST_UUID, &Uuid::from_u128(1), (1,))
                .unwrap();
            host.remote(channels::HOST_UUID, &Uuid::from_u128(2), (1,))
                .unwrap();
            let flag: bool = guest
                .get(channels::UUID_CONFLICT_FLAG, PartyId::arbiter(), (1,))
                .await
                .unwrap();
            assert!(!flag);
            let flag: bool = host
                .get(channels::UUID_CONFLICT_FLAG, PartyId::arbiter(), (1,))
                .await
                .unwrap();
            assert!(!flag);
        });

        let confirmed = validate(&mut arbiter, 30).await.unwrap();
        assert_eq!(confirmed, vec![Uuid::from_u128(1), Uuid::from_u128(2)]);
        members.await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_gives_up_after_max_retries() {
        let Federation {
            mut arbiter,
            mut guest,
            mut hosts,
        } = Federation::local(
            1,
            Arc::new(ChannelRegistry::homo()),
            Duration::from_secs(5),
        );
        let mut host = hosts.remove(0);

        let members = tokio::spawn(async move {
            // the same duplicate on every attempt
            let duplicate = Uuid::from_u128(9);
            for attempt in 0_u64..2 {
                guest
                    .remote(channels::GUEST_UUID, &duplicate, (attempt,))
                    .unwrap();
                host.remote(channels::HOST_UUID, &duplicate, (attempt,))
                    .unwrap();
                let flag: bool = guest
                    .get(channels::UUID_CONFLICT_FLAG, PartyId::arbiter(), (attempt,))
                    .await
                    .unwrap();
                assert!(flag);
                let flag: bool = host
                    .get(channels::UUID_CONFLICT_FLAG, PartyId::arbiter(), (attempt,))
                    .await
                    .unwrap();
                assert!(flag);
            }
        });

        let err = validate(&mut arbiter, 2).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UuidRetriesExhausted(2)));
        members.await.unwrap();
    }

    #[tokio::test]
    async fn test_negotiate_gives_up_when_every_attempt_conflicts() {
        let Federation {
            mut arbiter,
            mut guest,
            ..
        } = Federation::local(
            0,
            Arc::new(ChannelRegistry::homo()),
            Duration::from_secs(5),
        );

        let arbiter = tokio::spawn(async move {
            let mut proposals = Vec::new();
            for attempt in 0_u64..2 {
                let uuid: Uuid = arbiter
                    .get(channels::GUEST_UUID, PartyId::guest(), (attempt,))
                    .await
                    .unwrap();
                proposals.push(uuid);
                arbiter
                    .remote(channels::UUID_CONFLICT_FLAG, &true, (attempt,))
                    .unwrap();
            }
            proposals
        });

        let err = negotiate(&mut guest, 2).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UuidRetriesExhausted(2)));

        // every rejected attempt proposed a fresh uuid
        let proposals = arbiter.await.unwrap();
        assert_ne!(proposals[0], proposals[1]);
    }

    #[tokio::test]
    async fn test_arbiter_cannot_negotiate() {
        let Federation { mut arbiter, .. } = Federation::local(
            0,
            Arc::new(ChannelRegistry::homo()),
            Duration::from_millis(100),
        );
        assert!(matches!(
            negotiate(&mut arbiter, 1).await,
            Err(ProtocolError::WrongRole { .. }),
        ));
    }
}

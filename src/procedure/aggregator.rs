//! The per-role protocol drivers.
//!
//! A [`Member`] wraps the endpoint of the Guest or a Host. The caller owns
//! the training loop and calls, per round, `aggregate_and_broadcast`,
//! `aggregate_loss` and `converge_flag`; the member handles weighting,
//! masking and the channel traffic.
//!
//! The [`Arbiter`] owns the whole round loop: [`Arbiter::fit`] aggregates
//! the masked contributions, broadcasts the plain aggregates and decides
//! termination. The Arbiter never sees an unmasked contribution, only the
//! sum in which the pads have cancelled.

use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    mask::{Aggregation, MaskConfig, MaskedModel, MaskedScalar, Model, PadCipher},
    procedure::convergence::AbsConverge,
    settings::TrainingSettings,
    sync::{identity, key_exchange},
    transfer::{channels, transport::Endpoint, PartyId, Role},
    ProtocolError,
};

/// The protocol driver of a Guest or Host.
pub struct Member {
    endpoint: Endpoint,
    mask: MaskConfig,
    max_retries: u32,
    party_weight: f64,
    uuid: Option<Uuid>,
    cipher: Option<PadCipher>,
    /// The aggregated loss of every completed round.
    pub loss_history: Vec<f64>,
    /// Whether the Arbiter declared convergence.
    pub is_converged: bool,
    /// The index of the last completed round.
    pub n_iter: u64,
}

impl Member {
    /// Creates the Guest driver.
    pub fn guest(endpoint: Endpoint, mask: MaskConfig, max_retries: u32) -> Result<Self, ProtocolError> {
        Self::new(endpoint, mask, max_retries, Role::Guest)
    }

    /// Creates a Host driver.
    pub fn host(endpoint: Endpoint, mask: MaskConfig, max_retries: u32) -> Result<Self, ProtocolError> {
        Self::new(endpoint, mask, max_retries, Role::Host)
    }

    fn new(
        endpoint: Endpoint,
        mask: MaskConfig,
        max_retries: u32,
        role: Role,
    ) -> Result<Self, ProtocolError> {
        if endpoint.role() != role {
            return Err(ProtocolError::WrongRole {
                party: endpoint.id(),
                procedure: "member aggregation",
            });
        }
        Ok(Self {
            endpoint,
            mask,
            max_retries,
            party_weight: 1.0,
            uuid: None,
            cipher: None,
            loss_history: Vec::new(),
            is_converged: false,
            n_iter: 0,
        })
    }

    /// The identity confirmed during [`exchange_secret_keys`].
    ///
    /// [`exchange_secret_keys`]: Member::exchange_secret_keys
    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    /// Registers this party's aggregation weight with the Arbiter.
    ///
    /// The weight defaults to `1.0`; it scales this party's contribution in
    /// the weighted average the Arbiter broadcasts.
    pub fn initialize_aggregator(
        &mut self,
        party_weight: Option<f64>,
    ) -> Result<(), ProtocolError> {
        let weight = party_weight.unwrap_or(1.0);
        if !weight.is_finite() || weight <= 0.0 {
            return Err(ProtocolError::InvalidPartyWeight(weight));
        }
        self.party_weight = weight;
        let channel = match self.endpoint.role() {
            Role::Host => channels::HOST_PARTY_WEIGHT,
            _ => channels::GUEST_PARTY_WEIGHT,
        };
        self.endpoint.remote(channel, &weight, (0,))?;
        Ok(())
    }

    /// Negotiates this party's identity and derives the masking cipher from
    /// the pairwise session keys.
    pub async fn exchange_secret_keys(&mut self) -> Result<(), ProtocolError> {
        let uuid = identity::negotiate(&mut self.endpoint, self.max_retries).await?;
        self.uuid = Some(uuid);

        let keys = key_exchange::exchange(&mut self.endpoint).await?;
        let cipher = match self.endpoint.role() {
            Role::Guest => {
                // one pad stream per host, in host-index order
                PadCipher::guest(self.mask, keys.into_iter().map(|(_, key)| key).collect())
            }
            _ => {
                let key = keys
                    .into_iter()
                    .map(|(_, key)| key)
                    .next()
                    .ok_or(ProtocolError::MissingCipher)?;
                PadCipher::host(self.mask, key)
            }
        };
        self.cipher = Some(cipher);
        Ok(())
    }

    /// Sends the masked, weighted model of round `iter` and receives the
    /// aggregated model back.
    pub async fn aggregate_and_broadcast(
        &mut self,
        model: &Model,
        iter: u64,
    ) -> Result<Model, ProtocolError> {
        let cipher = self.cipher.as_ref().ok_or(ProtocolError::MissingCipher)?;
        let masked = cipher.encrypt_model(model, self.party_weight, &(iter,).into())?;
        debug!(party = %self.endpoint.id(), iter, "sending masked model");
        let channel = match self.endpoint.role() {
            Role::Host => channels::HOST_MODEL,
            _ => channels::GUEST_MODEL,
        };
        self.endpoint.remote(channel, &masked, (iter,))?;
        let aggregated = self
            .endpoint
            .get(channels::AGGREGATED_MODEL, PartyId::arbiter(), (iter,))
            .await?;
        Ok(aggregated)
    }

    /// Sends the masked, weighted loss of round `iter` and receives the
    /// aggregated loss back.
    pub async fn aggregate_loss(&mut self, loss: f64, iter: u64) -> Result<f64, ProtocolError> {
        let cipher = self.cipher.as_ref().ok_or(ProtocolError::MissingCipher)?;
        let masked = cipher.encrypt_loss(loss, self.party_weight, &(iter,).into())?;
        let channel = match self.endpoint.role() {
            Role::Host => channels::HOST_LOSS,
            _ => channels::GUEST_LOSS,
        };
        self.endpoint.remote(channel, &masked, (iter,))?;
        let aggregated: f64 = self
            .endpoint
            .get(channels::AGGREGATED_LOSS, PartyId::arbiter(), (iter,))
            .await?;
        self.loss_history.push(aggregated);
        Ok(aggregated)
    }

    /// Receives the Arbiter's convergence verdict for round `iter`.
    pub async fn converge_flag(&mut self, iter: u64) -> Result<bool, ProtocolError> {
        let converged: bool = self
            .endpoint
            .get(channels::CONVERGE_FLAG, PartyId::arbiter(), (iter,))
            .await?;
        self.n_iter = iter;
        if converged {
            info!(party = %self.endpoint.id(), iter, "training converged");
            self.is_converged = true;
        }
        Ok(converged)
    }
}

/// The protocol driver of the Arbiter.
pub struct Arbiter {
    endpoint: Endpoint,
    mask: MaskConfig,
    max_retries: u32,
    converge: AbsConverge,
    max_iterations: u64,
    total_weight: Option<f64>,
    party_uuids: Vec<Uuid>,
    /// The aggregated loss of every completed round.
    pub loss_history: Vec<f64>,
    /// Whether the last session converged before the iteration cap.
    pub is_converged: bool,
    /// The index of the last completed round.
    pub n_iter: u64,
}

impl Arbiter {
    pub fn new(
        endpoint: Endpoint,
        mask: MaskConfig,
        training: TrainingSettings,
        max_retries: u32,
    ) -> Result<Self, ProtocolError> {
        if endpoint.role() != Role::Arbiter {
            return Err(ProtocolError::WrongRole {
                party: endpoint.id(),
                procedure: "arbiter aggregation",
            });
        }
        Ok(Self {
            endpoint,
            mask,
            max_retries,
            converge: AbsConverge::new(training.eps),
            max_iterations: training.max_iterations,
            total_weight: None,
            party_uuids: Vec::new(),
            loss_history: Vec::new(),
            is_converged: false,
            n_iter: 0,
        })
    }

    /// The identities confirmed during [`exchange_secret_keys`], the Guest
    /// first and then the Hosts in index order.
    ///
    /// [`exchange_secret_keys`]: Arbiter::exchange_secret_keys
    pub fn party_uuids(&self) -> &[Uuid] {
        &self.party_uuids
    }

    /// Collects the aggregation weight of every party.
    pub async fn initialize_aggregator(&mut self) -> Result<(), ProtocolError> {
        let guest: f64 = self
            .endpoint
            .get(channels::GUEST_PARTY_WEIGHT, PartyId::guest(), (0,))
            .await?;
        let hosts = self
            .endpoint
            .collect_hosts::<f64>(channels::HOST_PARTY_WEIGHT, (0,))
            .await?;
        let total = guest + hosts.values().sum::<f64>();
        if !total.is_finite() || total <= 0.0 {
            return Err(ProtocolError::InvalidPartyWeight(total));
        }
        info!(parties = hosts.len() + 1, total_weight = total, "aggregator initialized");
        self.total_weight = Some(total);
        Ok(())
    }

    /// Validates the party identities and relays the key agreement.
    pub async fn exchange_secret_keys(&mut self) -> Result<(), ProtocolError> {
        self.party_uuids = identity::validate(&mut self.endpoint, self.max_retries).await?;
        key_exchange::relay(&mut self.endpoint).await
    }

    /// Aggregates the masked models of round `iter` and broadcasts the
    /// weighted average.
    pub async fn aggregate_and_broadcast(&mut self, iter: u64) -> Result<Model, ProtocolError> {
        let total_weight = self.total_weight.ok_or(ProtocolError::NotInitialized)?;
        let guest: MaskedModel = self
            .endpoint
            .get(channels::GUEST_MODEL, PartyId::guest(), (iter,))
            .await?;
        let hosts = self
            .endpoint
            .collect_hosts::<MaskedModel>(channels::HOST_MODEL, (iter,))
            .await?;

        let mut aggregation = Aggregation::new(self.mask);
        aggregation.aggregate_model(&guest)?;
        for masked in hosts.values() {
            aggregation.aggregate_model(masked)?;
        }
        let mut model = aggregation.into_model()?;
        for value in model.iter_mut() {
            *value /= total_weight;
        }
        debug!(iter, len = model.len(), "broadcasting aggregated model");
        self.endpoint
            .remote(channels::AGGREGATED_MODEL, &model, (iter,))?;
        Ok(model)
    }

    /// Aggregates the masked losses of round `iter` and broadcasts the
    /// weighted average.
    pub async fn aggregate_loss(&mut self, iter: u64) -> Result<f64, ProtocolError> {
        let total_weight = self.total_weight.ok_or(ProtocolError::NotInitialized)?;
        let guest: MaskedScalar = self
            .endpoint
            .get(channels::GUEST_LOSS, PartyId::guest(), (iter,))
            .await?;
        let hosts = self
            .endpoint
            .collect_hosts::<MaskedScalar>(channels::HOST_LOSS, (iter,))
            .await?;

        let mut aggregation = Aggregation::new(self.mask);
        aggregation.aggregate_loss(&guest)?;
        for masked in hosts.values() {
            aggregation.aggregate_loss(masked)?;
        }
        let loss = aggregation.into_loss()? / total_weight;
        self.endpoint
            .remote(channels::AGGREGATED_LOSS, &loss, (iter,))?;
        self.loss_history.push(loss);
        Ok(loss)
    }

    /// Runs the aggregation rounds until convergence or the iteration cap.
    pub async fn fit(&mut self) -> Result<(), ProtocolError> {
        for iter in 0..self.max_iterations {
            info!(iter, "starting aggregation round");
            self.aggregate_and_broadcast(iter).await?;
            let loss = self.aggregate_loss(iter).await?;
            let converged = self.converge.is_converge(loss);
            self.endpoint
                .remote(channels::CONVERGE_FLAG, &converged, (iter,))?;
            self.n_iter = iter;
            info!(iter, loss, converged, "round complete");
            if converged {
                self.is_converged = true;
                break;
            }
        }
        Ok(())
    }
}

/// Absolute-difference convergence criterion.
///
/// Training has converged once the absolute change of the aggregated loss
/// between two consecutive rounds falls strictly below `eps`. The first
/// round has no predecessor and is never convergent.
#[derive(Clone, Debug)]
pub struct AbsConverge {
    eps: f64,
    prev_loss: Option<f64>,
}

impl AbsConverge {
    pub fn new(eps: f64) -> Self {
        Self {
            eps,
            prev_loss: None,
        }
    }

    /// Feeds the loss of the current round and reports convergence.
    pub fn is_converge(&mut self, loss: f64) -> bool {
        let converged = match self.prev_loss {
            Some(prev) => (loss - prev).abs() < self.eps,
            None => false,
        };
        self.prev_loss = Some(loss);
        converged
    }
}

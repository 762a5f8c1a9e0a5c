use derive_more::{AsMut, AsRef, From, Index, IndexMut, Into};
use serde::{Deserialize, Serialize};

/// A flattened vector of model parameters.
///
/// Reshaping to and from the caller's tensor layout is the caller's concern;
/// the aggregation substrate only needs a flat view with a stable length.
#[derive(
    AsMut,
    AsRef,
    Clone,
    Debug,
    Default,
    From,
    Index,
    IndexMut,
    Into,
    PartialEq,
    Serialize,
    Deserialize,
)]
pub struct Model(Vec<f64>);

impl Model {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<f64> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<f64> {
        self.0.iter_mut()
    }
}

impl std::iter::FromIterator<f64> for Model {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Model {
    type Item = f64;
    type IntoIter = std::vec::IntoIter<f64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Model {
    type Item = &'a f64;
    type IntoIter = std::slice::Iter<'a, f64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

use thiserror::Error;

/// The outcome of a coalesced computation that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError<E> {
    /// The producer failed.
    ///
    /// Every caller that shared the computation receives a clone of the same error.
    #[error(transparent)]
    Producer(E),
    /// The producer stopped before settling, because it panicked or its runtime shut down.
    #[error("computation was interrupted before producing a result")]
    Interrupted,
}

impl<E> CacheError<E> {
    /// Returns the producer error, if this was one.
    pub fn into_producer(self) -> Option<E> {
        match self {
            Self::Producer(err) => Some(err),
            Self::Interrupted => None,
        }
    }
}

use std::sync::Arc;

pub mod cfg;
pub mod cmd;
pub mod codec;
pub mod dial;
pub mod engine;
pub mod logging;
pub mod mux;
pub mod report;
pub mod request;
mod stat;

pub use self::stat::WorkerStat;

/// Thread-safe producing iterators.
///
/// Unlike the [`Iterator`] this trait accepts `self` by reference and returns a
/// reference to the next item, not an [`Option`].
///
/// Think of it as an infinite thread-safe iterator.
pub trait Produce {
    /// The type of the elements being produced.
    type Item: ?Sized;

    /// Advances this producer and returns the next value.
    fn next(&self) -> &Self::Item;
}

/// Infinite cycle producing iterator, that yields the same value.
///
/// Used to share the single pre-serialized request between all connection
/// workers without copying it.
#[derive(Debug)]
pub struct OneProduce<T> {
    v: T,
}

impl<T> OneProduce<T> {
    /// Constructs a new [`OneProduce`] from the given value.
    #[inline]
    pub const fn new(v: T) -> Self {
        Self { v }
    }
}

impl<T> Produce for Arc<OneProduce<T>> {
    type Item = T;

    #[inline]
    fn next(&self) -> &Self::Item {
        &self.v
    }
}

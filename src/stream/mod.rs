//! Stream node contract
//!
//! Producers push blocks of interleaved samples synchronously to every
//! attached consumer, in attachment order. Attachment is a graph edge only:
//! an [`Outlet`] holds weak references, so a node lives exactly as long as
//! whoever owns its `Arc`.

pub mod convert;
pub mod sample;
pub mod spin;
pub mod window;

pub use convert::FormatConverter;
pub use sample::{Sample, SampleFormat};
pub use spin::SpinLock;
pub use window::Windower;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// Node-level stream configuration. Blocks carry no format metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self { sample_rate, channels }
    }

    pub fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1)
    }

    /// Number of interleaved samples in `frames` frames
    pub fn samples(&self, frames: usize) -> usize {
        frames * self.channels as usize
    }
}

/// What a bounded buffer does when an admission would exceed its capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest buffered samples, keeping the newest audio
    #[default]
    DropOldest,
    /// Keep what is buffered and discard the excess of the incoming block
    DropNewest,
}

/// Receiving side of a stream edge.
///
/// `consume` may be called from any thread the producer runs on, including
/// a hardware callback. A consumer that cannot take data must drop it
/// silently; it must never block indefinitely or panic.
pub trait Consumer<T>: Send + Sync {
    fn consume(&self, samples: &[T]);
}

/// Fan-out set of a producer
pub struct Outlet<T> {
    consumers: RwLock<Vec<Weak<dyn Consumer<T>>>>,
}

impl<T: 'static> Outlet<T> {
    pub fn new() -> Self {
        Self {
            consumers: RwLock::new(Vec::new()),
        }
    }

    /// Add a consumer. Attaching the same consumer twice delivers twice.
    pub fn attach<C: Consumer<T> + 'static>(&self, consumer: &Arc<C>) {
        let weak = Arc::downgrade(consumer);
        let weak: Weak<dyn Consumer<T>> = weak;
        self.consumers.write().push(weak);
    }

    pub fn detach_all(&self) {
        self.consumers.write().clear();
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    /// Deliver a block to every live consumer
    pub fn push(&self, samples: &[T]) {
        if samples.is_empty() {
            return;
        }
        let consumers = self.consumers.read();
        for consumer in consumers.iter() {
            if let Some(consumer) = consumer.upgrade() {
                consumer.consume(samples);
            }
        }
    }
}

impl<T: 'static> Default for Outlet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending side of a stream edge
pub trait Producer<T: 'static> {
    fn outlet(&self) -> &Outlet<T>;

    fn attach<C: Consumer<T> + 'static>(&self, consumer: &Arc<C>)
    where
        Self: Sized,
    {
        self.outlet().attach(consumer);
    }

    /// Stop all delivery from this producer
    fn detach_all(&self) {
        self.outlet().detach_all();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Collector;
    use super::*;

    struct Source {
        outlet: Outlet<i16>,
    }

    impl Producer<i16> for Source {
        fn outlet(&self) -> &Outlet<i16> {
            &self.outlet
        }
    }

    #[test]
    fn test_push_reaches_every_consumer_in_order() {
        let source = Source { outlet: Outlet::new() };
        let first = Arc::new(Collector::new());
        let second = Arc::new(Collector::new());
        source.attach(&first);
        source.attach(&second);

        source.outlet().push(&[1, 2, 3]);

        assert_eq!(first.samples(), vec![1, 2, 3]);
        assert_eq!(second.samples(), vec![1, 2, 3]);
    }

    #[test]
    fn test_duplicate_attach_duplicates_delivery() {
        let source = Source { outlet: Outlet::new() };
        let sink = Arc::new(Collector::new());
        source.attach(&sink);
        source.attach(&sink);

        source.outlet().push(&[7]);
        assert_eq!(sink.blocks().len(), 2);
    }

    #[test]
    fn test_detach_all_stops_delivery() {
        let source = Source { outlet: Outlet::new() };
        let sink = Arc::new(Collector::new());
        source.attach(&sink);
        source.detach_all();

        source.outlet().push(&[1]);
        assert!(sink.blocks().is_empty());
        assert_eq!(source.outlet().consumer_count(), 0);
    }

    #[test]
    fn test_attachment_does_not_keep_consumer_alive() {
        let source = Source { outlet: Outlet::new() };
        let sink = Arc::new(Collector::<i16>::new());
        source.attach(&sink);
        drop(sink);

        // Delivery to a dropped consumer is a silent no-op
        source.outlet().push(&[1, 2]);
        assert_eq!(source.outlet().consumer_count(), 1);
    }
}

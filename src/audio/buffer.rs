//! Sample ring for the device sink
//!
//! Decouples push-timed input (network, model) from the pull-timed output
//! callback. Cursors are monotonic and reduced modulo capacity for storage;
//! `write - read <= capacity` always holds. Overflow discards the oldest
//! buffered audio by default, underflow is padded with silence so the
//! hardware always gets exactly what it asks for.

use crate::stream::{OverflowPolicy, Sample};

/// Ring counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Samples admitted from producers
    pub written: u64,
    /// Samples discarded by the overflow policy
    pub dropped: u64,
    /// Pulls that had to be padded with silence
    pub underruns: u64,
    /// Silence samples synthesized for those pulls
    pub silence: u64,
}

pub struct SampleRing<T> {
    storage: Box<[T]>,
    read: usize,
    write: usize,
    policy: OverflowPolicy,
    stats: RingStats,
}

impl<T: Sample> SampleRing<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            storage: vec![T::SILENCE; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            policy,
            stats: RingStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Buffered samples not yet pulled
    pub fn available(&self) -> usize {
        self.write - self.read
    }

    pub fn stats(&self) -> RingStats {
        self.stats
    }

    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// Admit a block from a producer. Returns the number of samples stored.
    pub fn write(&mut self, samples: &[T]) -> usize {
        let capacity = self.capacity();
        if capacity == 0 || samples.is_empty() {
            return 0;
        }

        let samples = match self.policy {
            OverflowPolicy::DropOldest => {
                // Only the most recent `capacity` samples can survive
                let samples = if samples.len() > capacity {
                    self.stats.dropped += (samples.len() - capacity) as u64;
                    &samples[samples.len() - capacity..]
                } else {
                    samples
                };
                self.make_room(samples.len());
                samples
            }
            OverflowPolicy::DropNewest => {
                let room = capacity - self.available();
                let admitted = samples.len().min(room);
                self.stats.dropped += (samples.len() - admitted) as u64;
                &samples[..admitted]
            }
        };

        let n = samples.len();
        let w = self.write % capacity;
        let first = n.min(capacity - w);
        self.storage[w..w + first].copy_from_slice(&samples[..first]);
        if n > first {
            self.storage[..n - first].copy_from_slice(&samples[first..]);
        }
        self.write += n;
        self.stats.written += n as u64;
        n
    }

    /// Fill `out` completely, padding any shortfall with silence.
    pub fn read_into(&mut self, out: &mut [T]) {
        let capacity = self.capacity();
        if capacity == 0 {
            out.fill(T::SILENCE);
            return;
        }
        // Requests beyond capacity are served one capacity-sized chunk at a time
        for chunk in out.chunks_mut(capacity) {
            self.read_chunk(chunk);
        }
    }

    fn read_chunk(&mut self, out: &mut [T]) {
        let capacity = self.capacity();
        let required = out.len();

        let available = self.available();
        if available < required {
            self.stats.underruns += 1;
            self.append_silence(required - available);
        }

        let r = self.read % capacity;
        let first = required.min(capacity - r);
        out[..first].copy_from_slice(&self.storage[r..r + first]);
        if required > first {
            out[first..].copy_from_slice(&self.storage[..required - first]);
        }
        self.read += required;

        // Both cursors advance together, so rewinding keeps them small
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
    }

    /// Silence goes through the same admission accounting as real data
    fn append_silence(&mut self, n: usize) {
        let capacity = self.capacity();
        let n = if n > capacity {
            self.read = self.write;
            capacity
        } else {
            n
        };
        self.make_room(n);

        let w = self.write % capacity;
        let first = n.min(capacity - w);
        self.storage[w..w + first].fill(T::SILENCE);
        if n > first {
            self.storage[..n - first].fill(T::SILENCE);
        }
        self.write += n;
        self.stats.silence += n as u64;
    }

    /// Advance the read cursor so `incoming` more samples fit
    fn make_room(&mut self, incoming: usize) {
        let available = self.available();
        let capacity = self.capacity();
        if available + incoming > capacity {
            let to_drop = available + incoming - capacity;
            self.read += to_drop;
            self.stats.dropped += to_drop as u64;
        }
    }
}

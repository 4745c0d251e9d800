use serde::{Deserialize, Serialize};

use super::util;

/// Channels reserved for the collective operations. Point-to-point traffic
/// between partitions uses channel numbers below `COLLECTIVE_BASE`.
const COLLECTIVE_BASE: u32 = 1 << 16;
const BROADCAST: u32 = COLLECTIVE_BASE;
const REDUCE: u32 = COLLECTIVE_BASE + 1;
const GATHER: u32 = COLLECTIVE_BASE + 2;

/// Identifies a stream of messages between two ranks. A receive only
/// matches a message carrying the same source rank and the same tag, so two
/// exchanges in flight at the same time never see each other's data.
/// Messages with equal source and tag are delivered in the order they were
/// sent.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub iteration: usize,
    pub channel: u32,
}

impl Tag {
    pub fn new(iteration: usize, channel: u32) -> Self {
        assert!(
            channel < COLLECTIVE_BASE,
            "channel {} is reserved for collectives",
            channel
        );
        Self { iteration, channel }
    }

    fn collective(channel: u32) -> Self {
        Self {
            iteration: 0,
            channel,
        }
    }
}

/// A message in transit, labeled with its source rank and tag.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub source: usize,
    pub tag: Tag,
    pub data: Vec<u8>,
}

/// Interface for a group of processes that can exchange messages over a
/// network. The underlying transport can in principle be TCP, in-process
/// channels, or a higher level abstraction like MPI.
///
pub trait Communicator {
    /// Must be implemented to return the rank of this process within the
    /// communicator.
    fn rank(&self) -> usize;

    /// Must be implemented to return the number of peers processes in this
    /// communicator.
    fn size(&self) -> usize;

    /// Must be implemented to send a message to a peer. This method must
    /// return immediately, in other words it is not allowed to block until a
    /// matching receive is posted.
    fn send(&self, rank: usize, tag: Tag, message: Vec<u8>);

    /// Must be implemented to receive the next message sent by the given
    /// peer with the given tag. This method blocks until such a message is
    /// ready; messages from other peers or with other tags that arrive in
    /// the meantime are held until they are asked for.
    fn recv(&self, rank: usize, tag: Tag) -> Vec<u8>;

    /// Implements a binomial tree broadcast from rank 0. The message buffer
    /// must be `Some` if this is the root node, and it must be `None`
    /// otherwise.
    ///
    fn broadcast(&self, value: Option<Vec<u8>>) -> Vec<u8> {
        let r = self.rank();
        let p = self.size();
        let tag = Tag::collective(BROADCAST);

        let value = match value {
            Some(value) => value,
            None => self.recv(r - (r & r.wrapping_neg()), tag),
        };
        for level in (0..util::ceil_log2(p)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 && r + one < p {
                self.send(r + one, tag, value.clone())
            }
        }
        value
    }

    /// Implements a binomial tree reduce. All ranks return `None` except for
    /// the root, rank 0.
    ///
    fn reduce<F>(&self, f: F, mut value: Vec<u8>) -> Option<Vec<u8>>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Vec<u8>,
    {
        let r = self.rank();
        let p = self.size();
        let tag = Tag::collective(REDUCE);

        for level in 0..util::ceil_log2(p) {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 {
                if r + one < p {
                    value = f(value, self.recv(r + one, tag))
                }
            } else {
                self.send(r - one, tag, value);
                return None;
            }
        }
        Some(value)
    }

    /// Implements an all-reduce (symmetric fold) operation over a commutative
    /// binary operator.
    ///
    fn all_reduce<F>(&self, f: F, value: Vec<u8>) -> Vec<u8>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Vec<u8>,
    {
        self.broadcast(self.reduce(f, value))
    }

    /// Collect one buffer from every rank at rank 0, in rank order. All other
    /// ranks return `None`.
    ///
    fn gather(&self, value: Vec<u8>) -> Option<Vec<Vec<u8>>> {
        let tag = Tag::collective(GATHER);

        if self.rank() == 0 {
            let mut all = Vec::with_capacity(self.size());
            all.push(value);
            for source in 1..self.size() {
                all.push(self.recv(source, tag))
            }
            Some(all)
        } else {
            self.send(0, tag, value);
            None
        }
    }

    /// All-reduce of a single `f64` under the given commutative operator.
    ///
    fn all_reduce_f64<F>(&self, f: F, value: f64) -> f64
    where
        F: Fn(f64, f64) -> f64,
    {
        let bytes = self.all_reduce(
            |a, b| f(util::f64_from_bytes(&a), util::f64_from_bytes(&b)).to_le_bytes().to_vec(),
            value.to_le_bytes().to_vec(),
        );
        util::f64_from_bytes(&bytes)
    }
}

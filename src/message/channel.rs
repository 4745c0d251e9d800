use crossbeam_channel::Sender;

use super::comm::{Communicator, Envelope, Tag};
use super::mailbox::Mailbox;

/// A communicator whose peers are threads in the same process, connected by
/// unbounded crossbeam channels. Sends never block, so the transport has the
/// same non-blocking send semantics as the TCP host.
///
pub struct ChannelCommunicator {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    mailbox: Mailbox,
}

impl ChannelCommunicator {
    /// Create a fully connected group of `size` communicators. Element `r`
    /// of the returned vector has rank `r`; move each one onto its own
    /// thread.
    ///
    pub fn cluster(size: usize) -> Vec<Self> {
        let (sinks, sources): (Vec<_>, Vec<_>) =
            (0..size).map(|_| crossbeam_channel::unbounded()).unzip();

        sources
            .into_iter()
            .enumerate()
            .map(|(rank, source)| Self {
                rank,
                peers: sinks.clone(),
                mailbox: Mailbox::new(source),
            })
            .collect()
    }
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, tag: Tag, message: Vec<u8>) {
        let env = Envelope {
            source: self.rank,
            tag,
            data: message,
        };
        self.peers[rank]
            .send(env)
            .expect("peer mailbox was dropped")
    }

    fn recv(&self, rank: usize, tag: Tag) -> Vec<u8> {
        self.mailbox.recv(rank, tag)
    }
}

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use crossbeam_channel::Receiver;
use log::debug;

use super::comm::{Envelope, Tag};

/// Mailbox enforces source and tag matching on incoming messages: messages
/// which arrive before the local rank has asked for them (from a peer that
/// is already an exchange ahead, or on another face) are kept until a
/// receive with the same source and tag is posted.
pub struct Mailbox {
    inbound: Receiver<Envelope>,
    held: RefCell<HashMap<(usize, Tag), VecDeque<Vec<u8>>>>,
}

impl Mailbox {
    pub fn new(inbound: Receiver<Envelope>) -> Self {
        Self {
            inbound,
            held: RefCell::new(HashMap::new()),
        }
    }

    /// Block until a message from `source` with `tag` is available, and
    /// return it. Panics if every sender has hung up, since the matching
    /// message can then never arrive.
    pub fn recv(&self, source: usize, tag: Tag) -> Vec<u8> {
        if let Some(data) = self.take_held(source, tag) {
            return data;
        }
        loop {
            let env = self
                .inbound
                .recv()
                .expect("all peers disconnected while a receive was posted");

            if env.source == source && env.tag == tag {
                return env.data;
            }
            debug!(
                "holding message from {} with tag {:?} (waiting on {} {:?})",
                env.source, env.tag, source, tag
            );
            self.held
                .borrow_mut()
                .entry((env.source, env.tag))
                .or_insert_with(VecDeque::new)
                .push_back(env.data);
        }
    }

    /// Return the number of messages received but not yet matched.
    pub fn held_len(&self) -> usize {
        self.held.borrow().values().map(|q| q.len()).sum()
    }

    fn take_held(&self, source: usize, tag: Tag) -> Option<Vec<u8>> {
        let mut held = self.held.borrow_mut();
        let queue = held.get_mut(&(source, tag))?;
        let data = queue.pop_front();
        if queue.is_empty() {
            held.remove(&(source, tag));
        }
        data
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn envelope(source: usize, channel: u32, byte: u8) -> Envelope {
        Envelope {
            source,
            tag: Tag::new(0, channel),
            data: vec![byte],
        }
    }

    #[test]
    fn out_of_order_messages_are_held_until_matched() {
        let (sink, source) = crossbeam_channel::unbounded();
        let mailbox = Mailbox::new(source);

        sink.send(envelope(1, 2, 20)).unwrap();
        sink.send(envelope(2, 1, 10)).unwrap();
        sink.send(envelope(1, 2, 21)).unwrap();

        assert_eq!(mailbox.recv(2, Tag::new(0, 1)), vec![10]);
        assert_eq!(mailbox.held_len(), 1);
        assert_eq!(mailbox.recv(1, Tag::new(0, 2)), vec![20]);
        assert_eq!(mailbox.recv(1, Tag::new(0, 2)), vec![21]);
        assert_eq!(mailbox.held_len(), 0);
    }
}

use std::{collections::HashMap, io, thread};
use std::{io::prelude::*, thread::JoinHandle};
use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    time::Duration,
};

use log::{debug, error, info, warn};

use super::{
    backoff::ExponentialBackoff,
    comm::{Communicator, Envelope, Tag},
    mailbox::Mailbox,
    util,
};

const RETRY_WAIT_MS: Duration = Duration::from_millis(250);
const RETRY_MAX_WAIT_MS: Duration = Duration::from_millis(5000);

type Sender = crossbeam_channel::Sender<(usize, Vec<u8>)>;
type Receiver = crossbeam_channel::Receiver<Envelope>;

/// The threads behind a `TcpCommunicator`: one serial sender that owns a
/// connection to every peer it has written to, and one listener that
/// accepts peer connections and forwards decoded envelopes into a channel.
///
pub struct TcpHost {
    listen_thread: Option<thread::JoinHandle<()>>,
    send_thread: Option<thread::JoinHandle<io::Result<()>>>,
}

impl TcpHost {
    pub fn new(rank: usize, peers: Vec<SocketAddr>) -> (Self, Sender, Receiver) {
        let (send_sink, send_src): (Sender, _) = crossbeam_channel::unbounded();
        let send_thread = Self::start_serial_sender(peers.clone(), send_src);

        let (recv_sink, recv_src) = crossbeam_channel::unbounded();
        let listen_thread = Self::start_listener(peers[rank], recv_sink);

        (
            TcpHost {
                send_thread: Some(send_thread),
                listen_thread: Some(listen_thread),
            },
            send_sink,
            recv_src,
        )
    }

    /// Wait for the sender thread to flush every queued message. This
    /// returns once the `TcpCommunicator` holding the other end of the send
    /// channel has been dropped, or with the error that stopped the sender.
    pub fn join(&mut self) -> io::Result<()> {
        // The listener blocks in accept() for the lifetime of the process.
        self.listen_thread.take();

        match self.send_thread.take().map(|handle| handle.join()) {
            None | Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(e))) => Err(e),
            Some(Err(_)) => Err(io::Error::new(io::ErrorKind::Other, "TCP sender thread panicked")),
        }
    }

    /// Frames are written in order and never resent. A failed write or ack
    /// ends the thread, and the next `send` on this rank fails with it.
    fn start_serial_sender(
        peers: Vec<SocketAddr>,
        send_src: crossbeam_channel::Receiver<(usize, Vec<u8>)>,
    ) -> thread::JoinHandle<io::Result<()>> {
        thread::spawn(move || {
            let mut table: HashMap<usize, TcpStream> = HashMap::new();

            for (rank, message) in send_src {
                let client = table
                    .entry(rank)
                    .or_insert_with(|| Self::connect_with_retry(peers[rank]));

                if let Err(e) = Self::write_framed(client, &message) {
                    error!("Failed to send message to {}: {}", peers[rank], e);
                    return Err(e);
                }
            }
            info!("Sender channel closed, stopping sender thread");
            Ok(())
        })
    }

    fn write_framed(client: &mut TcpStream, message: &[u8]) -> io::Result<()> {
        let msg_sz = message.len();
        client.write_all(&msg_sz.to_le_bytes())?;
        client.write_all(message)?;
        let ack = util::read_usize(client)?;
        if ack != msg_sz {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("sent {} bytes but receiver acked {} bytes", msg_sz, ack),
            ));
        }
        Ok(())
    }

    fn start_listener(
        addr: SocketAddr,
        recv_sink: crossbeam_channel::Sender<Envelope>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            info!("Listening to: {}", addr);
            let listener = match TcpListener::bind(addr) {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to bind {}: {}", addr, e);
                    return;
                }
            };
            for stream in listener.incoming() {
                match stream.and_then(|s| s.peer_addr().map(|remote| (s, remote))) {
                    Ok((stream, remote)) => {
                        Self::handle_connection(stream, remote, recv_sink.clone());
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                }
            }
        })
    }

    fn handle_connection(
        mut stream: TcpStream,
        remote: SocketAddr,
        recv_sink: crossbeam_channel::Sender<Envelope>,
    ) -> JoinHandle<Result<(), std::io::Error>> {
        info!("Receiving connection from {}", remote);
        thread::spawn(move || loop {
            util::read_usize(&mut stream)
                .and_then(|size| util::read_bytes_vec(&mut stream, size))
                .and_then(|bytes| {
                    let num_bytes = bytes.len();
                    let env: Envelope = rmp_serde::from_slice(&bytes)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    debug!("Received {} bytes from rank {}", num_bytes, env.source);
                    recv_sink
                        .send(env)
                        .map(|()| num_bytes)
                        .map_err(|msg| io::Error::new(io::ErrorKind::Other, msg.to_string()))
                })
                .and_then(|size| stream.write_all(&size.to_le_bytes()))
                .map_err(|e| {
                    std::io::Error::new(
                        e.kind(),
                        format!("Connection from {} failed: {}", remote, e),
                    )
                })?
        })
    }

    /// Connect to a peer, retrying with exponential backoff for as long as
    /// it takes. A peer that never comes up stalls this rank; that is a
    /// deployment failure, not something to recover from.
    fn connect_with_retry(addr: SocketAddr) -> TcpStream {
        info!("Connecting to {}...", addr);
        let mut with_retries = ExponentialBackoff::new(RETRY_WAIT_MS, RETRY_MAX_WAIT_MS, 2);

        loop {
            match TcpStream::connect(&addr) {
                Ok(s) => return s,
                Err(msg) => {
                    let sleep = with_retries.next().unwrap_or(RETRY_MAX_WAIT_MS);
                    warn!("Connect to {} failed: {}; retry in {:?}", addr, msg, sleep);
                    thread::sleep(sleep);
                }
            }
        }
    }
}

/////////////////////////////////////////////////////
/////////////////////////////////////////////////////
/////////////////////////////////////////////////////
/////////////////////////////////////////////////////

/// A communicator whose peers are separate processes reachable over TCP.
/// Pair it with the `TcpHost` created for the same rank and peer list.
///
pub struct TcpCommunicator {
    rank: usize,
    num_peers: usize,
    send_sink: Option<crossbeam_channel::Sender<(usize, Vec<u8>)>>,
    mailbox: Mailbox,
}

impl TcpCommunicator {
    pub fn new(rank: usize, peers: Vec<SocketAddr>, send_sink: Sender, recv_src: Receiver) -> Self {
        let num_peers = peers.len();
        Self {
            rank,
            num_peers,
            send_sink: Some(send_sink),
            mailbox: Mailbox::new(recv_src),
        }
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.num_peers
    }

    fn send(&self, rank: usize, tag: Tag, message: Vec<u8>) {
        let env = Envelope {
            source: self.rank,
            tag,
            data: message,
        };
        let bytes = rmp_serde::to_vec(&env).expect("envelope is always encodable");
        self.send_sink
            .as_ref()
            .expect("communicator used after drop")
            .send((rank, bytes))
            .expect("TCP sender thread has stopped")
    }

    fn recv(&self, rank: usize, tag: Tag) -> Vec<u8> {
        self.mailbox.recv(rank, tag)
    }
}

impl Drop for TcpCommunicator {
    fn drop(&mut self) {
        self.send_sink.take();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn free_addresses(n: usize) -> Vec<SocketAddr> {
        let listeners: Vec<_> = (0..n)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        listeners.iter().map(|l| l.local_addr().unwrap()).collect()
    }

    #[test]
    fn ranks_exchange_and_run_collectives_over_tcp() {
        let peers = free_addresses(3);

        let procs: Vec<_> = (0..peers.len())
            .map(|rank| {
                let peers = peers.clone();
                thread::spawn(move || {
                    let (mut host, send_sink, recv_src) = TcpHost::new(rank, peers.clone());
                    let comm = TcpCommunicator::new(rank, peers, send_sink, recv_src);
                    let size = comm.size();

                    comm.send((rank + 1) % size, Tag::new(4, 7), vec![rank as u8]);
                    let from_prev = comm.recv((rank + size - 1) % size, Tag::new(4, 7));

                    let root = if rank == 0 { Some(b"hello".to_vec()) } else { None };
                    let greeting = comm.broadcast(root);
                    let gathered = comm.gather(vec![rank as u8; rank + 1]);

                    drop(comm);
                    host.join().unwrap();
                    (from_prev, greeting, gathered)
                })
            })
            .collect();

        let results: Vec<_> = procs.into_iter().map(|p| p.join().unwrap()).collect();

        for (rank, (from_prev, greeting, gathered)) in results.into_iter().enumerate() {
            assert_eq!(from_prev, vec![((rank + 2) % 3) as u8]);
            assert_eq!(greeting, b"hello".to_vec());
            if rank == 0 {
                assert_eq!(gathered, Some(vec![vec![0], vec![1, 1], vec![2, 2, 2]]));
            } else {
                assert_eq!(gathered, None);
            }
        }
    }

    #[test]
    fn unacknowledged_frame_stops_the_sender_without_resending() {
        let peers = free_addresses(2);
        let silent = TcpListener::bind(peers[1]).unwrap();

        // Accept one connection, read one frame, and hang up without an ack.
        let peer = thread::spawn(move || {
            let (mut stream, _) = silent.accept().unwrap();
            let size = util::read_usize(&mut stream).unwrap();
            util::read_bytes_vec(&mut stream, size).unwrap();
            drop(stream);
            silent
        });

        let (mut host, send_sink, recv_src) = TcpHost::new(0, peers.clone());
        let comm = TcpCommunicator::new(0, peers, send_sink, recv_src);
        comm.send(1, Tag::new(0, 1), vec![1, 2, 3]);
        drop(comm);

        assert!(host.join().is_err());

        let silent = peer.join().unwrap();
        silent.set_nonblocking(true).unwrap();
        let again = silent.accept();
        assert_eq!(again.err().map(|e| e.kind()), Some(io::ErrorKind::WouldBlock));
    }
}

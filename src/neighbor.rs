use std::collections::HashSet;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::geometry::Bounds;
use crate::message::{Communicator, Tag};
use crate::particle::{Particle, Provenance};
use crate::topology::{Coords, Face, Topology};

/// The two kinds of particle traffic that cross a face. They use disjoint
/// tag channels, so a ghost exchange can never be matched against a
/// migration exchange of the same iteration.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    Ghost,
    Migrate,
}

impl ExchangeKind {
    fn channel(self, face_tag: u32) -> u32 {
        match self {
            ExchangeKind::Ghost => 16 + face_tag,
            ExchangeKind::Migrate => 32 + face_tag,
        }
    }

    fn provenance(self) -> Provenance {
        match self {
            ExchangeKind::Ghost => Provenance::Ghost,
            ExchangeKind::Migrate => Provenance::InTransit,
        }
    }
}

/// A receive that has been posted but not yet waited on.
///
#[derive(Clone, Copy, Debug)]
struct PendingRecv {
    source: usize,
    tag: Tag,
    iteration: usize,
}

/// Interface to the particle traffic across one face of a partition.
/// Every operation is a cheap no-op on a face that lies on the outside of
/// the global domain.
///
pub trait FaceExchange {
    /// Return the face this exchanger is responsible for.
    fn face(&self) -> Face;

    /// Return the rank across the face, if there is one.
    fn neighbor_rank(&self) -> Option<usize>;

    /// Resolve the neighbor at `neighbor_coords` in the process grid. The
    /// coordinates must be the ones adjacent to `my_rank` across this face;
    /// anything else is a configuration error.
    fn set_neighbor(&mut self, topology: &Topology, my_rank: usize, neighbor_coords: Coords) -> Result<()>;

    /// Return the particles whose position lies in `bounds`, each id at most
    /// once.
    fn find_particles_in_box(&self, bounds: &Bounds, particles: &[Particle]) -> Vec<Particle>;

    /// Select the particles in `bounds`, send them to the neighbor, and post
    /// the matching receive. Returns without waiting for either.
    fn asynchronous_send_recv<C: Communicator>(
        &mut self,
        comm: &C,
        iteration: usize,
        kind: ExchangeKind,
        particles: &[Particle],
        bounds: &Bounds,
    ) -> Result<()>;

    /// Block until the posted receive has been matched.
    fn wait_to_finish<C: Communicator>(&mut self, comm: &C, iteration: usize) -> Result<()>;

    /// Move the received particles into `into`, leaving the incoming buffer
    /// empty.
    fn insert_received_particles(&mut self, into: &mut Vec<Particle>);

    /// Drain the outgoing buffer of the last completed exchange.
    fn take_sent_particles(&mut self) -> Vec<Particle>;
}

/// Particle traffic across one face of a partition, to and from exactly one
/// neighbor rank.
///
#[derive(Debug)]
pub struct NeighborComm {
    face: Face,
    rank: Option<usize>,
    send_particles: Vec<Particle>,
    recv_particles: Vec<Particle>,
    pending: Option<PendingRecv>,
}

impl NeighborComm {
    pub fn new(face: Face) -> Self {
        Self {
            face,
            rank: None,
            send_particles: Vec::new(),
            recv_particles: Vec::new(),
            pending: None,
        }
    }

    pub fn has_neighbor(&self) -> bool {
        self.rank.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn num_received(&self) -> usize {
        self.recv_particles.len()
    }
}

impl FaceExchange for NeighborComm {
    fn face(&self) -> Face {
        self.face
    }

    fn neighbor_rank(&self) -> Option<usize> {
        self.rank
    }

    fn set_neighbor(&mut self, topology: &Topology, my_rank: usize, neighbor_coords: Coords) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::Topology(format!(
                "face {:?} reconfigured while an exchange is outstanding",
                self.face
            )));
        }
        if my_rank >= topology.size() {
            return Err(Error::Topology(format!(
                "rank {} is outside a process grid of {} ranks",
                my_rank,
                topology.size()
            )));
        }
        let expected = topology.neighbor_coords(topology.coords_of(my_rank), self.face);

        if expected != neighbor_coords {
            return Err(Error::Topology(format!(
                "rank {} expects neighbor {:?} across {:?}, got {:?}",
                my_rank, expected, self.face, neighbor_coords
            )));
        }
        self.rank = topology.rank_of(neighbor_coords);
        debug!("rank {} face {:?} -> {:?}", my_rank, self.face, self.rank);
        Ok(())
    }

    fn find_particles_in_box(&self, bounds: &Bounds, particles: &[Particle]) -> Vec<Particle> {
        let mut seen = HashSet::new();
        particles
            .iter()
            .filter(|p| bounds.contains(p.position) && seen.insert(p.id))
            .cloned()
            .collect()
    }

    fn asynchronous_send_recv<C: Communicator>(
        &mut self,
        comm: &C,
        iteration: usize,
        kind: ExchangeKind,
        particles: &[Particle],
        bounds: &Bounds,
    ) -> Result<()> {
        let rank = match self.rank {
            Some(rank) => rank,
            None => return Ok(()),
        };
        if self.pending.is_some() {
            return Err(Error::RequestOutstanding {
                face: self.face,
                iteration,
            });
        }

        self.send_particles = self.find_particles_in_box(bounds, particles);
        for p in &mut self.send_particles {
            p.provenance = kind.provenance();
        }

        let bytes = rmp_serde::to_vec(&self.send_particles).map_err(|e| Error::Encode(e.to_string()))?;
        trace!(
            "[{}] {:?} {:?}: sending {} particles ({} bytes) to {}",
            iteration,
            kind,
            self.face,
            self.send_particles.len(),
            bytes.len(),
            rank
        );
        comm.send(rank, Tag::new(iteration, kind.channel(self.face.send_tag())), bytes);

        self.pending = Some(PendingRecv {
            source: rank,
            tag: Tag::new(iteration, kind.channel(self.face.recv_tag())),
            iteration,
        });
        Ok(())
    }

    fn wait_to_finish<C: Communicator>(&mut self, comm: &C, iteration: usize) -> Result<()> {
        if self.rank.is_none() {
            return Ok(());
        }
        let pending = self.pending.take().ok_or(Error::NoPendingRequest {
            face: self.face,
            iteration,
        })?;
        if pending.iteration != iteration {
            return Err(Error::NoPendingRequest {
                face: self.face,
                iteration,
            });
        }

        let bytes = comm.recv(pending.source, pending.tag);
        let received: Vec<Particle> = rmp_serde::from_slice(&bytes).map_err(|e| Error::Decode(e.to_string()))?;
        trace!(
            "[{}] {:?}: received {} particles from {}",
            iteration,
            self.face,
            received.len(),
            pending.source
        );
        self.recv_particles.extend(received);
        Ok(())
    }

    fn insert_received_particles(&mut self, into: &mut Vec<Particle>) {
        into.append(&mut self.recv_particles)
    }

    fn take_sent_particles(&mut self) -> Vec<Particle> {
        std::mem::take(&mut self.send_particles)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::{Ellipsoid, Vec3};
    use crate::message::ChannelCommunicator;

    fn particle(id: u64, x: f64) -> Particle {
        Particle::new(id, Ellipsoid::sphere(0.01), Vec3::new(x, 0.5, 0.5), 1.0)
    }

    fn two_ranks() -> Topology {
        Topology::new([2, 1, 1], Bounds::new(Vec3::ZERO, Vec3::splat(1.0))).unwrap()
    }

    #[test]
    fn boundary_face_has_no_neighbor_and_is_a_no_op() {
        let topo = two_ranks();
        let comm = ChannelCommunicator::cluster(2).remove(0);
        let mut face = NeighborComm::new(Face::XMinus);
        face.set_neighbor(&topo, 0, [-1, 0, 0]).unwrap();
        assert!(!face.has_neighbor());

        let everything = Bounds::new(Vec3::splat(-1.0), Vec3::splat(2.0));
        face.asynchronous_send_recv(&comm, 0, ExchangeKind::Ghost, &[particle(1, 0.1)], &everything)
            .unwrap();
        assert!(!face.is_pending());
        face.wait_to_finish(&comm, 0).unwrap();
        assert!(face.take_sent_particles().is_empty());
    }

    #[test]
    fn mismatched_neighbor_coords_are_rejected() {
        let topo = two_ranks();
        let mut face = NeighborComm::new(Face::XPlus);
        assert!(matches!(
            face.set_neighbor(&topo, 0, [0, 1, 0]),
            Err(Error::Topology(_))
        ));
        assert!(face.set_neighbor(&topo, 5, [1, 0, 0]).is_err());
        face.set_neighbor(&topo, 0, [1, 0, 0]).unwrap();
        assert_eq!(face.neighbor_rank(), Some(1));
    }

    #[test]
    fn find_particles_in_box_skips_duplicates() {
        let face = NeighborComm::new(Face::XPlus);
        let slab = Bounds::new(Vec3::new(0.4, 0.0, 0.0), Vec3::new(0.5, 1.0, 1.0));
        let ps = vec![particle(1, 0.45), particle(2, 0.2), particle(1, 0.45), particle(3, 0.5)];
        let ids: Vec<_> = face.find_particles_in_box(&slab, &ps).iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn issuing_twice_without_waiting_is_an_error() {
        let topo = two_ranks();
        let mut comms = ChannelCommunicator::cluster(2);
        let comm = comms.remove(0);
        let mut face = NeighborComm::new(Face::XPlus);
        face.set_neighbor(&topo, 0, [1, 0, 0]).unwrap();

        let slab = Bounds::new(Vec3::new(0.4, 0.0, 0.0), Vec3::new(0.5, 1.0, 1.0));
        face.asynchronous_send_recv(&comm, 3, ExchangeKind::Ghost, &[], &slab).unwrap();
        assert!(matches!(
            face.asynchronous_send_recv(&comm, 3, ExchangeKind::Ghost, &[], &slab),
            Err(Error::RequestOutstanding { face: Face::XPlus, iteration: 3 })
        ));
    }

    #[test]
    fn opposite_faces_of_adjacent_ranks_exchange() {
        let topo = two_ranks();
        let mut comms = ChannelCommunicator::cluster(2);
        let c1 = comms.pop().unwrap();
        let c0 = comms.pop().unwrap();

        let mut right = NeighborComm::new(Face::XPlus);
        let mut left = NeighborComm::new(Face::XMinus);
        right.set_neighbor(&topo, 0, [1, 0, 0]).unwrap();
        left.set_neighbor(&topo, 1, [0, 0, 0]).unwrap();

        let everything = Bounds::new(Vec3::splat(-1.0), Vec3::splat(2.0));
        right
            .asynchronous_send_recv(&c0, 0, ExchangeKind::Ghost, &[particle(1, 0.49)], &everything)
            .unwrap();
        left.asynchronous_send_recv(&c1, 0, ExchangeKind::Ghost, &[particle(2, 0.51)], &everything)
            .unwrap();
        right.wait_to_finish(&c0, 0).unwrap();
        left.wait_to_finish(&c1, 0).unwrap();

        let mut on_zero = Vec::new();
        let mut on_one = Vec::new();
        right.insert_received_particles(&mut on_zero);
        left.insert_received_particles(&mut on_one);

        assert_eq!(on_zero.len(), 1);
        assert_eq!(on_zero[0].id, 2);
        assert!(on_zero[0].is_ghost());
        assert_eq!(on_one[0].id, 1);
        assert_eq!(right.num_received(), 0);
    }
}

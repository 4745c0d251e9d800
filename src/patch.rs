use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::geometry::{Axis, Bounds, Vec3};
use crate::message::Communicator;
use crate::neighbor::{ExchangeKind, FaceExchange, NeighborComm};
use crate::particle::{Particle, ParticleId, Provenance};
use crate::topology::{Coords, Face, Topology};




/**
 * Where a patch is in the exchange cycle of one iteration. The sequence is
 * fixed: ghosts are exchanged one axis at a time, contact and force work
 * follows, then integration, then migration one axis at a time, then the
 * duplicate sweep, and the cycle returns to idle.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    GhostIssued(Axis),
    GhostComplete(Axis),
    ContactAndForce,
    Integrated,
    MigrateIssued(Axis),
    MigrateComplete(Axis),
    DuplicatesRemoved,
}




// ============================================================================
impl Phase {

    pub fn name(self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::GhostIssued(_) => "GhostIssued",
            Phase::GhostComplete(_) => "GhostComplete",
            Phase::ContactAndForce => "ContactAndForce",
            Phase::Integrated => "Integrated",
            Phase::MigrateIssued(_) => "MigrateIssued",
            Phase::MigrateComplete(_) => "MigrateComplete",
            Phase::DuplicatesRemoved => "DuplicatesRemoved",
        }
    }

    /**
     * Return true if `next` is the one phase allowed to follow this one.
     */
    pub fn precedes(self, next: Phase) -> bool {
        use Axis::*;
        use Phase::*;

        match (self, next) {
            (Idle, GhostIssued(X)) => true,
            (GhostIssued(a), GhostComplete(b)) => a == b,
            (GhostComplete(X), GhostIssued(Y)) => true,
            (GhostComplete(Y), GhostIssued(Z)) => true,
            (GhostComplete(Z), ContactAndForce) => true,
            (ContactAndForce, Integrated) => true,
            (Integrated, MigrateIssued(X)) => true,
            (MigrateIssued(a), MigrateComplete(b)) => a == b,
            (MigrateComplete(X), MigrateIssued(Y)) => true,
            (MigrateComplete(Y), MigrateIssued(Z)) => true,
            (MigrateComplete(Z), DuplicatesRemoved) => true,
            (DuplicatesRemoved, Idle) => true,
            _ => false,
        }
    }
}




/**
 * One rank's share of the decomposed domain: its box, the ghost width, and
 * the six face exchangers that move particles to and from adjacent ranks.
 * The patch does not own the particles themselves; the driver passes its
 * owned list in and gets ghosts (or an updated owned list) back.
 */
#[derive(Debug)]
pub struct Patch {
    rank: usize,
    coords: Coords,
    lower: Vec3,
    upper: Vec3,
    ghost_width: f64,
    iteration: usize,
    neighbors: [NeighborComm; 6],
    phase: Phase,
}




// ============================================================================
impl Patch {

    /**
     * Create the patch for `rank`, covering `[lower, upper)`. The face
     * exchangers start without neighbors; call `connect` (or the individual
     * `set_*` methods) before exchanging.
     */
    pub fn new(topology: &Topology, rank: usize, lower: Vec3, upper: Vec3, ghost_width: f64) -> Result<Self> {
        if rank >= topology.size() {
            return Err(Error::Topology(format!(
                "rank {} is outside a process grid of {} ranks",
                rank,
                topology.size()
            )));
        }
        check_ghost_width(ghost_width)?;

        Ok(Self {
            rank,
            coords: topology.coords_of(rank),
            lower,
            upper,
            ghost_width,
            iteration: 0,
            neighbors: [
                NeighborComm::new(Face::XMinus),
                NeighborComm::new(Face::XPlus),
                NeighborComm::new(Face::YMinus),
                NeighborComm::new(Face::YPlus),
                NeighborComm::new(Face::ZMinus),
                NeighborComm::new(Face::ZPlus),
            ],
            phase: Phase::Idle,
        })
    }

    /**
     * Create the patch for `rank` with its box taken from the topology, and
     * with all six faces connected.
     */
    pub fn for_rank(topology: &Topology, rank: usize, ghost_width: f64) -> Result<Self> {
        let bounds = topology.partition_bounds(topology.coords_of(rank));
        let mut patch = Self::new(topology, rank, bounds.lower, bounds.upper, ghost_width)?;
        patch.connect(topology)?;
        Ok(patch)
    }

    pub fn connect(&mut self, topology: &Topology) -> Result<()> {
        for face in Face::ALL {
            self.set_face(topology, face)?;
        }
        Ok(())
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn coords(&self) -> Coords {
        self.coords
    }

    pub fn bounds(&self) -> Bounds {
        Bounds::new(self.lower, self.upper)
    }

    pub fn ghost_width(&self) -> f64 {
        self.ghost_width
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn neighbor(&self, face: Face) -> &NeighborComm {
        &self.neighbors[face.index()]
    }

    pub fn contains(&self, position: Vec3) -> bool {
        self.bounds().contains(position)
    }




    /**
     * Move to the next phase of the iteration, or fail if `next` does not
     * follow the current phase.
     */
    pub fn advance(&mut self, next: Phase) -> Result<()> {
        if !self.phase.precedes(next) {
            return Err(Error::PhaseOrder {
                from: self.phase.name(),
                to: next.name(),
            });
        }
        self.phase = next;
        Ok(())
    }

    /**
     * Called by the driver once ghosts are complete and it starts contact
     * detection and force computation.
     */
    pub fn begin_contact(&mut self) -> Result<()> {
        self.advance(Phase::ContactAndForce)
    }

    /**
     * Called by the driver once owned particles have been integrated.
     */
    pub fn finish_integration(&mut self) -> Result<()> {
        self.advance(Phase::Integrated)
    }

    /**
     * Reset the box for a new iteration. Ghost and migration slabs are
     * derived from the box and the ghost width on every exchange, so this
     * is all that is needed when the container moves or the ghost width
     * changes.
     */
    pub fn update(&mut self, iteration: usize, lower: Vec3, upper: Vec3, ghost_width: f64) -> Result<()> {
        check_ghost_width(ghost_width)?;
        self.iteration = iteration;
        self.lower = lower;
        self.upper = upper;
        self.ghost_width = ghost_width;
        debug!(
            "[{}] rank {} box {:?} .. {:?} ghost width {}",
            iteration, self.rank, lower, upper, ghost_width
        );
        Ok(())
    }




    // ------------------------------------------------------------------------
    // Neighbor configuration

    pub fn set_x_minus(&mut self, topology: &Topology) -> Result<()> {
        self.set_face(topology, Face::XMinus)
    }

    pub fn set_x_plus(&mut self, topology: &Topology) -> Result<()> {
        self.set_face(topology, Face::XPlus)
    }

    pub fn set_y_minus(&mut self, topology: &Topology) -> Result<()> {
        self.set_face(topology, Face::YMinus)
    }

    pub fn set_y_plus(&mut self, topology: &Topology) -> Result<()> {
        self.set_face(topology, Face::YPlus)
    }

    pub fn set_z_minus(&mut self, topology: &Topology) -> Result<()> {
        self.set_face(topology, Face::ZMinus)
    }

    pub fn set_z_plus(&mut self, topology: &Topology) -> Result<()> {
        self.set_face(topology, Face::ZPlus)
    }

    fn set_face(&mut self, topology: &Topology, face: Face) -> Result<()> {
        let neighbor_coords = topology.neighbor_coords(self.coords, face);
        self.neighbors[face.index()].set_neighbor(topology, self.rank, neighbor_coords)
    }




    // ------------------------------------------------------------------------
    // Ghost exchange

    /**
     * Return the slab of width `ghost_width` just inside the given face,
     * extended by the ghost width on the two other axes so that particles
     * already received across those axes are relayed onward.
     */
    pub fn ghost_slab(&self, face: Face) -> Bounds {
        let axis = face.axis();
        let outer = self.bounds().extend_all(self.ghost_width);
        let mut lower = outer.lower;
        let mut upper = outer.upper;

        if face.is_plus() {
            lower.set(axis, (self.upper.get(axis) - self.ghost_width).max(self.lower.get(axis)));
            upper.set(axis, self.upper.get(axis));
        } else {
            lower.set(axis, self.lower.get(axis));
            upper.set(axis, (self.lower.get(axis) + self.ghost_width).min(self.upper.get(axis)));
        }
        Bounds::new(lower, upper)
    }

    pub fn send_recv_ghost_x_minus<C: Communicator>(&mut self, comm: &C, particles: &[Particle]) -> Result<()> {
        self.send_recv_ghost(comm, Face::XMinus, particles)
    }

    pub fn send_recv_ghost_x_plus<C: Communicator>(&mut self, comm: &C, particles: &[Particle]) -> Result<()> {
        self.send_recv_ghost(comm, Face::XPlus, particles)
    }

    pub fn send_recv_ghost_y_minus<C: Communicator>(&mut self, comm: &C, particles: &[Particle]) -> Result<()> {
        self.send_recv_ghost(comm, Face::YMinus, particles)
    }

    pub fn send_recv_ghost_y_plus<C: Communicator>(&mut self, comm: &C, particles: &[Particle]) -> Result<()> {
        self.send_recv_ghost(comm, Face::YPlus, particles)
    }

    pub fn send_recv_ghost_z_minus<C: Communicator>(&mut self, comm: &C, particles: &[Particle]) -> Result<()> {
        self.send_recv_ghost(comm, Face::ZMinus, particles)
    }

    pub fn send_recv_ghost_z_plus<C: Communicator>(&mut self, comm: &C, particles: &[Particle]) -> Result<()> {
        self.send_recv_ghost(comm, Face::ZPlus, particles)
    }

    pub fn send_recv_ghost<C: Communicator>(&mut self, comm: &C, face: Face, particles: &[Particle]) -> Result<()> {
        let slab = self.ghost_slab(face);
        let iteration = self.iteration;
        self.neighbors[face.index()].asynchronous_send_recv(comm, iteration, ExchangeKind::Ghost, particles, &slab)
    }

    pub fn wait_to_finish_x<C: Communicator>(&mut self, comm: &C) -> Result<()> {
        self.wait_to_finish(comm, Axis::X)
    }

    pub fn wait_to_finish_y<C: Communicator>(&mut self, comm: &C) -> Result<()> {
        self.wait_to_finish(comm, Axis::Y)
    }

    pub fn wait_to_finish_z<C: Communicator>(&mut self, comm: &C) -> Result<()> {
        self.wait_to_finish(comm, Axis::Z)
    }

    /**
     * Block until both faces of the given axis have received. The outgoing
     * buffers are kept until the next exchange on that face, so a migration
     * can still find out what it sent.
     */
    pub fn wait_to_finish<C: Communicator>(&mut self, comm: &C, axis: Axis) -> Result<()> {
        let iteration = self.iteration;
        let (minus, plus) = Face::pair(axis);
        self.neighbors[minus.index()].wait_to_finish(comm, iteration)?;
        self.neighbors[plus.index()].wait_to_finish(comm, iteration)?;
        Ok(())
    }

    /**
     * Append everything received on all six faces to `into`.
     */
    pub fn insert_received_particles(&mut self, into: &mut Vec<Particle>) {
        for neighbor in self.neighbors.iter_mut() {
            neighbor.insert_received_particles(into);
        }
    }

    /**
     * Run the full ghost exchange for this iteration, and return the ghost
     * set: every particle owned by another rank that lies within the ghost
     * width of this box, including ones owned by edge- and
     * corner-adjacent ranks.
     *
     * The axes are exchanged in order X, Y, Z. Both faces of an axis are
     * issued before either is waited on, and what arrived on one axis is
     * offered to the next, which is how corner particles reach diagonal
     * neighbors without a 26-neighbor stencil. The axes must stay
     * serialised: if all six faces were issued before any wait, the Y and
     * Z exchanges could not forward what arrives on X.
     */
    pub fn communicate_ghosts<C: Communicator>(&mut self, comm: &C, owned: &[Particle]) -> Result<Vec<Particle>> {
        let mut ghosts: Vec<Particle> = Vec::new();

        for axis in Axis::ALL {
            self.advance(Phase::GhostIssued(axis))?;

            let (minus, plus) = Face::pair(axis);
            let candidates = self.near_faces(axis, owned, &ghosts);
            self.send_recv_ghost(comm, minus, &candidates)?;
            self.send_recv_ghost(comm, plus, &candidates)?;
            self.wait_to_finish(comm, axis)?;

            self.advance(Phase::GhostComplete(axis))?;

            for face in [minus, plus] {
                let neighbor = &mut self.neighbors[face.index()];
                neighbor.take_sent_particles();
                neighbor.insert_received_particles(&mut ghosts);
            }
        }
        Self::remove_duplicates(&mut ghosts);

        for p in &mut ghosts {
            p.provenance = Provenance::Ghost;
        }
        debug!("[{}] rank {} holds {} ghosts", self.iteration, self.rank, ghosts.len());
        Ok(ghosts)
    }

    /**
     * Owned particles and ghosts that fall in either ghost slab of the given
     * axis. Everything else would be filtered out by the face exchangers
     * anyway.
     */
    fn near_faces(&self, axis: Axis, owned: &[Particle], ghosts: &[Particle]) -> Vec<Particle> {
        let (minus, plus) = Face::pair(axis);
        let slabs = [self.ghost_slab(minus), self.ghost_slab(plus)];

        owned
            .iter()
            .chain(ghosts.iter())
            .filter(|p| slabs.iter().any(|s| s.contains(p.position)))
            .cloned()
            .collect()
    }




    // ------------------------------------------------------------------------
    // Migration

    /**
     * Return the region just outside the given face: particles found there
     * after integration belong to the neighbor across it. The region is
     * `neighbor_width` deep, and extended by `neighbor_width` on the two
     * other axes so that particles leaving through an edge or corner are
     * passed on along the next axis. Particles that moved farther than
     * `neighbor_width` in one step are not picked up.
     */
    pub fn migrate_slab(&self, face: Face, neighbor_width: f64) -> Bounds {
        let axis = face.axis();
        let outer = self.bounds().extend_all(neighbor_width);
        let mut lower = outer.lower;
        let mut upper = outer.upper;

        if face.is_plus() {
            lower.set(axis, self.upper.get(axis));
        } else {
            upper.set(axis, self.lower.get(axis));
        }
        Bounds::new(lower, upper)
    }

    pub fn send_recv_migrate_x_minus<C: Communicator>(
        &mut self,
        comm: &C,
        neighbor_width: f64,
        particles: &[Particle],
    ) -> Result<()> {
        self.send_recv_migrate(comm, Face::XMinus, neighbor_width, particles)
    }

    pub fn send_recv_migrate_x_plus<C: Communicator>(
        &mut self,
        comm: &C,
        neighbor_width: f64,
        particles: &[Particle],
    ) -> Result<()> {
        self.send_recv_migrate(comm, Face::XPlus, neighbor_width, particles)
    }

    pub fn send_recv_migrate_y_minus<C: Communicator>(
        &mut self,
        comm: &C,
        neighbor_width: f64,
        particles: &[Particle],
    ) -> Result<()> {
        self.send_recv_migrate(comm, Face::YMinus, neighbor_width, particles)
    }

    pub fn send_recv_migrate_y_plus<C: Communicator>(
        &mut self,
        comm: &C,
        neighbor_width: f64,
        particles: &[Particle],
    ) -> Result<()> {
        self.send_recv_migrate(comm, Face::YPlus, neighbor_width, particles)
    }

    pub fn send_recv_migrate_z_minus<C: Communicator>(
        &mut self,
        comm: &C,
        neighbor_width: f64,
        particles: &[Particle],
    ) -> Result<()> {
        self.send_recv_migrate(comm, Face::ZMinus, neighbor_width, particles)
    }

    pub fn send_recv_migrate_z_plus<C: Communicator>(
        &mut self,
        comm: &C,
        neighbor_width: f64,
        particles: &[Particle],
    ) -> Result<()> {
        self.send_recv_migrate(comm, Face::ZPlus, neighbor_width, particles)
    }

    pub fn send_recv_migrate<C: Communicator>(
        &mut self,
        comm: &C,
        face: Face,
        neighbor_width: f64,
        particles: &[Particle],
    ) -> Result<()> {
        let slab = self.migrate_slab(face, neighbor_width);
        let iteration = self.iteration;
        self.neighbors[face.index()].asynchronous_send_recv(comm, iteration, ExchangeKind::Migrate, particles, &slab)
    }

    /**
     * Hand every owned particle that has left the box to the rank that now
     * owns it, and adopt the particles that have entered. On return `owned`
     * holds exactly the particles whose position is in this box, plus any
     * that left the global domain through a face with no neighbor (those
     * stay where they are). `neighbor_width` bounds how far outside the box
     * a departing particle is looked for.
     *
     * A particle is removed from the sender's list only after the exchange
     * it left on has completed.
     */
    pub fn migrate<C: Communicator>(&mut self, comm: &C, neighbor_width: f64, owned: &mut Vec<Particle>) -> Result<()> {
        let mut arrived: Vec<Particle> = Vec::new();
        let mut num_departed = 0;

        for axis in Axis::ALL {
            self.advance(Phase::MigrateIssued(axis))?;

            let (minus, plus) = Face::pair(axis);
            let bounds = self.bounds();
            let candidates: Vec<Particle> = owned
                .iter()
                .chain(arrived.iter())
                .filter(|p| !bounds.contains(p.position))
                .cloned()
                .collect();
            self.send_recv_migrate(comm, minus, neighbor_width, &candidates)?;
            self.send_recv_migrate(comm, plus, neighbor_width, &candidates)?;
            self.wait_to_finish(comm, axis)?;

            self.advance(Phase::MigrateComplete(axis))?;

            let mut departed: HashSet<ParticleId> = HashSet::new();

            for face in [minus, plus] {
                let neighbor = &mut self.neighbors[face.index()];
                departed.extend(neighbor.take_sent_particles().iter().map(|p| p.id));
                neighbor.insert_received_particles(&mut arrived);
            }
            num_departed += departed.len();
            owned.retain(|p| !departed.contains(&p.id));
            arrived.retain(|p| !departed.contains(&p.id));
        }

        let num_arrived = arrived.len();

        for mut p in arrived {
            p.provenance = Provenance::Owned;
            owned.push(p);
        }
        Self::remove_duplicates(owned);
        self.advance(Phase::DuplicatesRemoved)?;
        self.advance(Phase::Idle)?;

        if num_departed + num_arrived > 0 {
            info!(
                "[{}] rank {}: {} particles left, {} arrived, {} owned",
                self.iteration,
                self.rank,
                num_departed,
                num_arrived,
                owned.len()
            );
        }
        Ok(())
    }

    /**
     * Collapse particles sharing an id into one entry. The entry stays at
     * the position of the first copy in the list and takes the value of the
     * last copy, which is the most recently received one.
     */
    pub fn remove_duplicates(particles: &mut Vec<Particle>) {
        let mut index: HashMap<ParticleId, usize> = HashMap::with_capacity(particles.len());
        let mut unique: Vec<Particle> = Vec::with_capacity(particles.len());

        for p in particles.drain(..) {
            match index.entry(p.id) {
                Entry::Occupied(slot) => unique[*slot.get()] = p,
                Entry::Vacant(slot) => {
                    slot.insert(unique.len());
                    unique.push(p);
                }
            }
        }
        *particles = unique;
    }
}




// ============================================================================
fn check_ghost_width(ghost_width: f64) -> Result<()> {
    if ghost_width.is_finite() && ghost_width > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            key: "ghostWidth".to_string(),
            value: ghost_width.to_string(),
        })
    }
}

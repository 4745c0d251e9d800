use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bond::{find_peri_dem_bonds, PeriDemBond};
use crate::boundary::{container_bounds, Boundary, BoundaryKind, BoundaryStats};
use crate::config::RunConfig;
use crate::contact::{apply_contact_forces, find_contacts, ForceLaw, LinearSpringDashpot};
use crate::error::{Error, Result};
use crate::geometry::{Axis, Vec3};
use crate::integrate::{integrate_particles, integrate_points};
use crate::message::Communicator;
use crate::particle::{Particle, ParticleId, PeriPoint, Provenance};
use crate::patch::Patch;
use crate::snapshot::{Snapshot, SnapshotWriter};
use crate::topology::Topology;

/// How the particle-point bonds act on the peridynamic points.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Coupling {
    /// Bonds exert forces on both ends; points are integrated.
    Force,
    /// Points ride on their bond anchors; no bond force is computed.
    Kinematic,
}

/// How the container walls are driven after each step.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Loading {
    /// Every moving wall is servo-controlled toward the confining pressure.
    Servo,
    /// Plane strain: the moving Z walls close at `loading_rate`, the Y walls
    /// never move, and the X walls are servo-controlled. Displacement
    /// control needs a constant step, so the run uses the fixed `timeStep`.
    PlaneStrain { loading_rate: f64 },
}

const PROGRESS_INTERVAL: usize = 10;

/// The per-rank time loop. Each rank owns the particles in its patch of the
/// domain, and holds a full copy of the walls, the peridynamic points, and
/// the bonds. Replicated state is kept identical on every rank by applying
/// the same reduced data everywhere:
///
/// - point accelerations are summed over ranks before points are integrated
/// - a bond broken on the rank owning its particle is broken everywhere
/// - wall statistics are merged over ranks before the servo moves the walls
///
/// Every public method that communicates is collective: all ranks must call
/// it, in the same order.
///
pub struct Simulation<C: Communicator, L: ForceLaw = LinearSpringDashpot> {
    comm: C,
    config: RunConfig,
    topology: Topology,
    patch: Patch,
    law: L,
    owned: Vec<Particle>,
    ghosts: Vec<Particle>,
    boundaries: Vec<Boundary>,
    points: Vec<PeriPoint>,
    bonds: Vec<PeriDemBond>,
    coupling: Coupling,
    loading: Loading,
    iteration: usize,
    last_step: Option<usize>,
    time: f64,
    dt: f64,
    stop: Arc<AtomicBool>,
}

impl<C: Communicator> Simulation<C> {
    pub fn new(comm: C, config: RunConfig) -> Result<Self> {
        Self::with_law(comm, config, LinearSpringDashpot)
    }
}

impl<C: Communicator, L: ForceLaw> Simulation<C, L> {
    /// Create an empty simulation on this rank. Fails if the process grid
    /// does not match the communicator size.
    ///
    pub fn with_law(comm: C, config: RunConfig, law: L) -> Result<Self> {
        config.topology.validate(comm.size())?;

        let topology = config.topology.clone();
        let patch = Patch::for_rank(&topology, comm.rank(), config.ghost_width)?;
        let iteration = config.start_step;
        let dt = config.time_step.max;

        Ok(Self {
            comm,
            config,
            topology,
            patch,
            law,
            owned: Vec::new(),
            ghosts: Vec::new(),
            boundaries: Vec::new(),
            points: Vec::new(),
            bonds: Vec::new(),
            coupling: Coupling::Force,
            loading: Loading::Servo,
            iteration,
            last_step: None,
            time: 0.0,
            dt,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    /// The next iteration to run.
    ///
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn time_step(&self) -> f64 {
        self.dt
    }

    pub fn owned(&self) -> &[Particle] {
        &self.owned
    }

    /// Ghosts are only populated between the ghost exchange and migration
    /// of an iteration; outside `step` this is always empty.
    ///
    pub fn ghosts(&self) -> &[Particle] {
        &self.ghosts
    }

    pub fn boundaries(&self) -> &[Boundary] {
        &self.boundaries
    }

    pub fn points(&self) -> &[PeriPoint] {
        &self.points
    }

    pub fn bonds(&self) -> &[PeriDemBond] {
        &self.bonds
    }

    pub fn coupling(&self) -> Coupling {
        self.coupling
    }

    pub fn loading(&self) -> Loading {
        self.loading
    }

    pub fn set_loading(&mut self, loading: Loading) {
        self.loading = loading;
    }

    /// The flag that requests a graceful stop. Any rank may set it; the run
    /// stops on the same iteration everywhere.
    ///
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn set_stop_flag(&mut self, stop: Arc<AtomicBool>) {
        self.stop = stop;
    }

    /// Distribute the initial state from rank 0. Every rank receives the
    /// walls and the peridynamic points, and keeps the particles whose
    /// center lies in its patch; particles outside the domain go to the
    /// nearest patch. `input` is only read on rank 0.
    ///
    pub fn scatter(&mut self, input: Option<Snapshot>) -> Result<()> {
        let root = if self.comm.rank() == 0 {
            Some(encode(&input.unwrap_or_default())?)
        } else {
            None
        };
        let snapshot: Snapshot = decode(&self.comm.broadcast(root))?;
        let rank = self.comm.rank();
        let topology = &self.topology;

        self.owned = snapshot
            .particles
            .into_iter()
            .filter(|p| topology.rank_containing(p.position) == rank)
            .map(|mut p| {
                p.provenance = Provenance::Owned;
                p
            })
            .collect();
        self.points = snapshot.points;
        self.boundaries = snapshot.boundaries;

        info!(
            "rank {} owns {} of {} particles ({} points, {} walls)",
            rank,
            self.owned.len(),
            snapshot.num_particles,
            self.points.len(),
            self.boundaries.len()
        );
        Ok(())
    }

    /// Bond every point lying within `search_distance` of an owned
    /// particle's surface, then share the bonds so that every rank holds
    /// the full list in the same order. Returns the number of bonds.
    ///
    pub fn couple(&mut self, search_distance: f64, coupling: Coupling) -> Result<usize> {
        let local = find_peri_dem_bonds(
            &self.owned,
            &self.points,
            self.config.bond_stretch_limit,
            self.config.bond_stiffness,
            search_distance,
        );
        let mut bonds: Vec<PeriDemBond> = self.all_gather(&local)?.into_iter().flatten().collect();
        bonds.sort_by_key(|b| (b.particle, b.point));

        self.bonds = bonds;
        self.coupling = coupling;
        info!("{} particle-point bonds, {:?} coupling", self.bonds.len(), coupling);
        Ok(self.bonds.len())
    }

    /// Run one iteration: ghost exchange, timestep, contact and forces,
    /// integration, wall update, and migration. On return every particle
    /// is owned by exactly one rank and no ghosts are held.
    ///
    pub fn step(&mut self) -> Result<()> {
        let bounds = self.topology.partition_bounds(self.patch.coords());
        self.patch
            .update(self.iteration, bounds.lower, bounds.upper, self.config.ghost_width)?;

        self.ghosts = self.patch.communicate_ghosts(&self.comm, &self.owned)?;

        let control = self.config.time_step;
        self.dt = match self.loading {
            Loading::PlaneStrain { .. } => control.max,
            Loading::Servo => {
                let local_dt = control.estimate(&self.owned).min(control.estimate(&self.ghosts));
                self.comm.all_reduce_f64(f64::min, local_dt)
            }
        };

        self.patch.begin_contact()?;
        self.compute_forces()?;

        integrate_particles(&mut self.owned, self.dt);

        match self.coupling {
            Coupling::Force => integrate_points(&mut self.points, self.dt),
            Coupling::Kinematic => self.apply_bond_boundaries()?,
        }
        self.patch.finish_integration()?;
        self.update_boundaries()?;

        // A servo-driven container moves the cuts; migrate against the new
        // box so owned particles end the iteration inside it.
        let moved = self.topology.partition_bounds(self.patch.coords());
        if moved != self.patch.bounds() {
            self.patch
                .update(self.iteration, moved.lower, moved.upper, self.config.ghost_width)?;
        }
        self.patch.migrate(&self.comm, self.config.ghost_width, &mut self.owned)?;
        self.ghosts.clear();

        debug!(
            "[{}] rank {} dt {:e} t {:e} owned {}",
            self.iteration,
            self.rank(),
            self.dt,
            self.time,
            self.owned.len()
        );
        self.last_step = Some(self.iteration);
        self.time += self.dt;
        self.iteration += 1;
        Ok(())
    }

    /// Run iterations up to and including `end_step`, writing a snapshot
    /// after every iteration that is a multiple of `snapshot_interval`. If
    /// a stop is requested, the run ends early with a final snapshot. The
    /// writer is only used on rank 0. Returns the final state on rank 0.
    ///
    pub fn run(&mut self, mut writer: Option<&mut dyn SnapshotWriter>) -> Result<Option<Snapshot>> {
        let interval = self.config.snapshot_interval;
        let end = self.config.end_step;
        let mut last_written = None;

        info!(
            "rank {} running iterations {} ..= {} on patch {:?}",
            self.rank(),
            self.iteration,
            end,
            self.patch.bounds()
        );

        while self.iteration <= end {
            if self.stop_requested() {
                warn!("[{}] stop requested, writing final snapshot", self.iteration);
                break;
            }
            let iteration = self.iteration;
            self.step()?;

            if iteration % PROGRESS_INTERVAL == 0 {
                self.report_progress();
            }

            if iteration % interval == 0 {
                let snapshot = self.snapshot()?;
                if let (Some(snapshot), Some(writer)) = (&snapshot, writer.as_mut()) {
                    writer.write(snapshot)?;
                }
                last_written = Some(iteration);
            }
        }

        let snapshot = self.snapshot()?;

        if last_written.is_none() || last_written != self.last_step {
            if let (Some(snapshot), Some(writer)) = (&snapshot, writer.as_mut()) {
                writer.write(snapshot)?;
            }
        }
        Ok(snapshot)
    }

    /// Collect the owned particles of every rank at rank 0, with the points
    /// and walls, labelled with the last completed iteration. Returns
    /// `None` on every other rank.
    ///
    pub fn snapshot(&self) -> Result<Option<Snapshot>> {
        let parts = match self.comm.gather(encode(&self.owned)?) {
            Some(parts) => parts,
            None => return Ok(None),
        };
        let mut particles = Vec::new();

        for part in parts {
            particles.extend(decode::<Vec<Particle>>(&part)?);
        }
        let iteration = self.last_step.unwrap_or(self.config.start_step);

        Ok(Some(
            Snapshot::new(iteration, self.time, particles)
                .with_points(self.points.clone())
                .with_boundaries(self.boundaries.clone()),
        ))
    }

    fn report_progress(&self) {
        if self.rank() != 0 {
            return;
        }
        if let Some(container) = container_bounds(&self.boundaries) {
            let e = container.extent();
            let contacts: usize = self.boundaries.iter().map(|b| b.stats().num_contacts).sum();
            info!(
                "[{}] t {:e} container {:.6} x {:.6} x {:.6}, {} wall contacts",
                self.iteration - 1,
                self.time,
                e.x,
                e.y,
                e.z,
                contacts
            );
        }
    }

    fn stop_requested(&self) -> bool {
        let local = if self.stop.load(Ordering::Relaxed) { 1.0 } else { 0.0 };
        self.comm.all_reduce_f64(f64::max, local) > 0.0
    }

    fn compute_forces(&mut self) -> Result<()> {
        let gravity = Vec3::new(0.0, 0.0, -self.config.gravity);

        for p in &mut self.owned {
            p.clear_force();
            if p.alive {
                p.add_force(gravity * p.mass);
            }
        }
        for q in &mut self.points {
            q.acceleration = Vec3::ZERO;
        }

        let contacts = find_contacts(&self.owned, &self.ghosts);
        apply_contact_forces(&mut self.owned, &self.ghosts, &contacts, &self.law);

        for b in &mut self.boundaries {
            b.clear_boundary_contacts();
            b.find_probable_contacts(&self.owned);
            b.resolve_contacts(&mut self.owned, &self.law);
            b.update_stat_force();
        }
        debug!(
            "[{}] rank {}: {} particle contacts, {} ghosts",
            self.iteration,
            self.rank(),
            contacts.len(),
            self.ghosts.len()
        );

        if self.coupling == Coupling::Force && !self.bonds.is_empty() {
            self.apply_bond_forces()?;
        }
        Ok(())
    }

    /// Each bond is applied on the rank owning its particle. The point
    /// accelerations and the alive flags are then combined over ranks.
    ///
    fn apply_bond_forces(&mut self) -> Result<()> {
        let owned_index = index_by_id(self.owned.iter().map(|p| p.id));
        let point_index = index_by_id(self.points.iter().map(|q| q.id));

        for bond in &mut self.bonds {
            if let (Some(&i), Some(&j)) = (owned_index.get(&bond.particle), point_index.get(&bond.point)) {
                bond.apply_bond_force(&mut self.owned[i], &mut self.points[j]);
            }
        }

        let accelerations: Vec<Vec3> = self.points.iter().map(|q| q.acceleration).collect();
        let alive: Vec<bool> = self.bonds.iter().map(|b| b.is_alive()).collect();
        let num_alive = alive.iter().filter(|&&a| a).count();
        let mut total = vec![Vec3::ZERO; self.points.len()];

        for (accelerations, alive) in self.all_gather(&(accelerations, alive))? {
            for (sum, a) in total.iter_mut().zip(accelerations) {
                *sum += a;
            }
            for (bond, alive) in self.bonds.iter_mut().zip(alive) {
                if !alive {
                    bond.kill();
                }
            }
        }
        for (q, a) in self.points.iter_mut().zip(total) {
            q.acceleration = a;
        }

        let remaining = self.bonds.iter().filter(|b| b.is_alive()).count();

        if remaining < num_alive {
            info!("[{}] {} bonds broke, {} remain", self.iteration, num_alive - remaining, remaining);
        }
        Ok(())
    }

    /// Move every bonded point onto its anchor. When several ranks move the
    /// same point, the highest rank wins, identically everywhere.
    ///
    fn apply_bond_boundaries(&mut self) -> Result<()> {
        if self.bonds.is_empty() {
            return Ok(());
        }
        let owned_index = index_by_id(self.owned.iter().map(|p| p.id));
        let point_index = index_by_id(self.points.iter().map(|q| q.id));
        let mut moved: Vec<Option<Vec3>> = vec![None; self.points.len()];

        for bond in self.bonds.iter().filter(|b| b.is_alive()) {
            if let (Some(&i), Some(&j)) = (owned_index.get(&bond.particle), point_index.get(&bond.point)) {
                let mut point = self.points[j].clone();
                bond.apply_bond_boundary(&self.owned[i], &mut point);
                moved[j] = Some(point.position);
            }
        }
        for share in self.all_gather(&moved)? {
            for (q, position) in self.points.iter_mut().zip(share) {
                if let Some(position) = position {
                    q.set_position(position);
                }
            }
        }
        Ok(())
    }

    /// Merge the wall statistics over ranks, then move the moving walls as
    /// the loading mode says. If the walls form a container, the domain
    /// follows it.
    ///
    fn update_boundaries(&mut self) -> Result<()> {
        if self.boundaries.is_empty() {
            return Ok(());
        }
        let local: Vec<BoundaryStats> = self.boundaries.iter().map(|b| *b.stats()).collect();
        let shares = self.all_gather(&local)?;

        for (i, b) in self.boundaries.iter_mut().enumerate() {
            let total = shares
                .iter()
                .filter_map(|share| share.get(i))
                .fold(BoundaryStats::default(), |acc, s| acc.merge(s));
            b.set_stat_force(total);
        }

        let servo = self.config.servo;
        let loading = self.loading;

        if servo.is_none() && loading == Loading::Servo {
            return Ok(());
        }
        let container = match container_bounds(&self.boundaries) {
            Some(container) => container,
            None => return Ok(()),
        };
        let extent = container.extent();
        let dt = self.dt;

        for b in &mut self.boundaries {
            let face = match b.face {
                Some(face) => face,
                None => continue,
            };
            let area = extent.x * extent.y * extent.z / extent.get(face.axis());

            match (loading, face.axis()) {
                (Loading::PlaneStrain { .. }, Axis::Y) => {}
                (Loading::PlaneStrain { loading_rate }, Axis::Z) => {
                    if b.kind == BoundaryKind::Moving {
                        b.translate(-loading_rate * dt);
                    }
                }
                _ => {
                    if let Some(servo) = servo {
                        b.servo(servo.target_pressure, area, servo.gain, servo.max_speed, dt);
                    }
                }
            }
        }
        if let Some(domain) = container_bounds(&self.boundaries) {
            self.topology = self.topology.with_domain(domain)?;
        }
        Ok(())
    }

    /// Every rank's `local` value, in rank order, on every rank.
    ///
    fn all_gather<T: Serialize + DeserializeOwned>(&self, local: &T) -> Result<Vec<T>> {
        let root = match self.comm.gather(encode(local)?) {
            Some(parts) => Some(encode(&parts)?),
            None => None,
        };
        let parts: Vec<Vec<u8>> = decode(&self.comm.broadcast(root))?;
        parts.iter().map(|part| decode(part)).collect()
    }
}

fn index_by_id<I: Iterator<Item = ParticleId>>(ids: I) -> HashMap<ParticleId, usize> {
    ids.enumerate().map(|(i, id)| (id, i)).collect()
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
}

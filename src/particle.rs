use serde::{Deserialize, Serialize};

use crate::geometry::{Ellipsoid, Orientation, Vec3};

pub type ParticleId = u64;

/// Where a particle copy came from, from the point of view of the partition
/// holding it.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Owned by this partition; the only copy that is ever integrated.
    Owned,
    /// Read-only replica of a particle owned by a neighbor, visible for
    /// contact detection during a single iteration.
    Ghost,
    /// Packed into a migration buffer, between two owners.
    InTransit,
}

/// Contact material parameters carried by each particle.
///
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub normal_stiffness: f64,
    pub tangential_stiffness: f64,
    pub normal_damping: f64,
    pub friction: f64,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            normal_stiffness: 1.0e6,
            tangential_stiffness: 5.0e5,
            normal_damping: 0.0,
            friction: 0.5,
        }
    }
}

/// A rigid discrete element with an ellipsoidal shape.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub id: ParticleId,
    pub shape: Ellipsoid,
    pub position: Vec3,
    pub orientation: Orientation,
    pub velocity: Vec3,
    pub omega: Vec3,
    pub force: Vec3,
    pub moment: Vec3,
    pub mass: f64,
    pub inertia: Vec3,
    pub material: Material,
    pub alive: bool,
    pub provenance: Provenance,
}

impl Particle {
    /// Create an owned particle at rest, with mass and inertia computed from
    /// the shape and the given density.
    ///
    pub fn new(id: ParticleId, shape: Ellipsoid, position: Vec3, density: f64) -> Self {
        let mass = density * shape.volume();
        Self {
            id,
            shape,
            position,
            orientation: Orientation::default(),
            velocity: Vec3::ZERO,
            omega: Vec3::ZERO,
            force: Vec3::ZERO,
            moment: Vec3::ZERO,
            mass,
            inertia: shape.principal_inertia(mass),
            material: Material::default(),
            alive: true,
            provenance: Provenance::Owned,
        }
    }

    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn is_ghost(&self) -> bool {
        self.provenance == Provenance::Ghost
    }

    pub fn local_to_global(&self, v: Vec3) -> Vec3 {
        self.orientation.local_to_global(v)
    }

    pub fn global_to_local(&self, v: Vec3) -> Vec3 {
        self.orientation.global_to_local(v)
    }

    /// Distance from the center to the surface, along the global unit
    /// direction `d`.
    ///
    pub fn radius_along(&self, d: Vec3) -> f64 {
        self.shape.radial_distance(self.global_to_local(d))
    }

    /// Largest projection of the surface onto the global unit direction `d`.
    ///
    pub fn support_along(&self, d: Vec3) -> f64 {
        self.shape.support_distance(self.global_to_local(d))
    }

    pub fn clear_force(&mut self) {
        self.force = Vec3::ZERO;
        self.moment = Vec3::ZERO;
    }

    pub fn add_force(&mut self, f: Vec3) {
        self.force += f;
    }

    /// Add a force acting at the global point `at`, together with its moment
    /// about the particle center.
    ///
    pub fn add_force_at(&mut self, f: Vec3, at: Vec3) {
        self.force += f;
        self.moment += (at - self.position).cross(f);
    }

    /// Grow (or shrink) the particle about its center, keeping its density.
    ///
    pub fn expand(&mut self, percent: f64) {
        let factor = 1.0 + percent;
        let density = self.mass / self.shape.volume();
        self.shape = self.shape.scale(factor);
        self.mass = density * self.shape.volume();
        self.inertia = self.shape.principal_inertia(self.mass);
    }
}

/// A peridynamic material point. Only the kinematic state needed by the
/// coupling bonds and the integrator is kept here; the bond-based PD
/// constitutive law lives outside this crate.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeriPoint {
    pub id: ParticleId,
    pub initial_position: Vec3,
    pub position: Vec3,
    pub velocity: Vec3,
    pub acceleration: Vec3,
    pub mass: f64,
}

impl PeriPoint {
    pub fn new(id: ParticleId, position: Vec3, mass: f64) -> Self {
        Self {
            id,
            initial_position: position,
            position,
            velocity: Vec3::ZERO,
            acceleration: Vec3::ZERO,
            mass,
        }
    }

    pub fn add_acceleration_by_force(&mut self, f: Vec3) {
        self.acceleration += f / self.mass;
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }
}

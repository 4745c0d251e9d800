use serde::{Deserialize, Serialize};

use crate::geometry::Vec3;
use crate::particle::{Particle, ParticleId, PeriPoint};

/// Coupling between a rigid particle and a peridynamic material point. The
/// bond pulls the point toward an anchor fixed in the particle's body frame,
/// and breaks for good once it has been stretched past its limit.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeriDemBond {
    pub particle: ParticleId,
    pub point: ParticleId,
    anchor: Vec3,
    initial: Vec3,
    current: Vec3,
    alive: bool,
    stretch_limit: f64,
    stiffness: f64,
}

impl PeriDemBond {
    /// Create a bond from the current configuration: the anchor is
    /// `projector` expressed in the particle's body frame, and the reference
    /// bond vector runs from the projector to the point. Returns `None` if
    /// the point sits on the projector, since a zero-length reference bond
    /// has no defined stretch.
    ///
    pub fn new(
        particle: &Particle,
        point: &PeriPoint,
        projector: Vec3,
        stretch_limit: f64,
        stiffness: f64,
    ) -> Option<Self> {
        let initial = point.position - projector;

        if !(initial.norm() > 0.0) {
            return None;
        }
        Some(Self {
            particle: particle.id,
            point: point.id,
            anchor: particle.global_to_local(projector - particle.position),
            initial,
            current: initial,
            alive: true,
            stretch_limit,
            stiffness,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Mark the bond broken. There is no way back.
    ///
    pub fn kill(&mut self) {
        self.alive = false;
    }

    pub fn anchor(&self) -> Vec3 {
        self.anchor
    }

    pub fn initial(&self) -> Vec3 {
        self.initial
    }

    pub fn current(&self) -> Vec3 {
        self.current
    }

    /// Global position of the anchor for the particle's current pose.
    ///
    pub fn projector(&self, particle: &Particle) -> Vec3 {
        particle.local_to_global(self.anchor) + particle.position
    }

    /// Engineering stretch of the current bond vector.
    ///
    pub fn stretch(&self) -> f64 {
        let l0 = self.initial.norm();
        (self.current.norm() - l0) / l0
    }

    /// Update the bond from the current particle pose and point position,
    /// and apply the bond force: the particle is pulled toward the point and
    /// the point toward the anchor. A bond stretched beyond its limit dies
    /// here and applies nothing.
    ///
    /// The bond is stiffer when it is compressed along its reference
    /// direction (`40 k`) than when it is stretched along it
    /// (`10 k / (1 + limit)`).
    ///
    pub fn apply_bond_force(&mut self, particle: &mut Particle, point: &mut PeriPoint) {
        if !self.alive {
            return;
        }
        self.current = point.position - self.projector(particle);

        if self.stretch() > self.stretch_limit {
            self.alive = false;
            return;
        }

        let l0 = self.initial.norm();
        let bond_n = self.initial.normalize() * (self.current.dot(self.initial) / l0);
        let bond_t = self.current - bond_n;

        let mut k = self.stiffness * 40.0;

        if bond_n.norm() - l0 > 0.0 {
            k = self.stiffness / (1.0 + self.stretch_limit) * 10.0;
        }
        let fn_ = (bond_n - self.initial) * k;
        let ft = bond_t * k;

        point.add_acceleration_by_force(-fn_ - ft);
        particle.add_force(fn_ + ft);
    }

    /// Prescribed-motion coupling: while the bond is alive, the point rides
    /// on the anchor with no force computed.
    ///
    pub fn apply_bond_boundary(&self, particle: &Particle, point: &mut PeriPoint) {
        if self.alive {
            point.set_position(self.projector(particle));
        }
    }
}

/// Build the initial coupling: one bond for every (particle, point) pair
/// where the point lies outside the particle and within `search_distance`
/// of its surface, measured along the line from the particle center. The
/// anchor is the surface point on that line.
///
pub fn find_peri_dem_bonds(
    particles: &[Particle],
    points: &[PeriPoint],
    stretch_limit: f64,
    stiffness: f64,
    search_distance: f64,
) -> Vec<PeriDemBond> {
    let mut bonds = Vec::new();

    for p in particles.iter().filter(|p| p.alive) {
        let reach = p.shape.max_radius() + search_distance;

        for q in points {
            let d = q.position - p.position;
            let dist = d.norm();

            if dist == 0.0 || dist > reach {
                continue;
            }
            let dir = d / dist;
            let surface = p.radius_along(dir);
            let gap = dist - surface;

            if gap > 0.0 && gap <= search_distance {
                let projector = p.position + dir * surface;
                bonds.extend(PeriDemBond::new(p, q, projector, stretch_limit, stiffness));
            }
        }
    }
    bonds
}

/// Drop the points that lie inside a particle, since they are occupied by
/// rigid material. Returns the number removed.
///
pub fn remove_inside_points(particles: &[Particle], points: &mut Vec<PeriPoint>) -> usize {
    let before = points.len();

    points.retain(|q| {
        !particles.iter().filter(|p| p.alive).any(|p| {
            let d = q.position - p.position;
            let dist = d.norm();
            dist == 0.0 || (dist <= p.shape.max_radius() && dist < p.radius_along(d / dist))
        })
    });
    before - points.len()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::Ellipsoid;
    use approx::assert_relative_eq;

    fn setup() -> (Particle, PeriPoint, PeriDemBond) {
        let particle = Particle::new(1, Ellipsoid::sphere(1.0), Vec3::ZERO, 1.0);
        let point = PeriPoint::new(10, Vec3::new(1.5, 0.0, 0.0), 2.0);
        let bond = PeriDemBond::new(&particle, &point, Vec3::new(1.0, 0.0, 0.0), 0.5, 100.0).unwrap();
        (particle, point, bond)
    }

    #[test]
    fn unstretched_bond_applies_no_force() {
        let (mut particle, mut point, mut bond) = setup();
        bond.apply_bond_force(&mut particle, &mut point);
        assert!(bond.is_alive());
        assert_relative_eq!(particle.force.norm(), 0.0);
        assert_relative_eq!(point.acceleration.norm(), 0.0);
    }

    #[test]
    fn stretched_bond_pulls_both_ends_together() {
        let (mut particle, mut point, mut bond) = setup();
        point.position = Vec3::new(1.6, 0.0, 0.0);
        bond.apply_bond_force(&mut particle, &mut point);

        // stretched along the reference direction: k = 100 / 1.5 * 10
        let k = 100.0 / 1.5 * 10.0;
        assert_relative_eq!(particle.force.x, 0.1 * k, epsilon = 1e-9);
        assert_relative_eq!(point.acceleration.x, -0.1 * k / 2.0, epsilon = 1e-9);
        assert_relative_eq!(bond.stretch(), 0.2, epsilon = 1e-12);
    }

    #[test]
    fn compressed_bond_uses_the_stiff_branch() {
        let (mut particle, mut point, mut bond) = setup();
        point.position = Vec3::new(1.4, 0.0, 0.0);
        bond.apply_bond_force(&mut particle, &mut point);
        assert_relative_eq!(particle.force.x, -0.1 * 4000.0, epsilon = 1e-9);
    }

    #[test]
    fn tangential_offset_gives_tangential_force() {
        let (mut particle, mut point, mut bond) = setup();
        point.position = Vec3::new(1.5, 0.1, 0.0);
        bond.apply_bond_force(&mut particle, &mut point);
        assert_relative_eq!(particle.force.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(particle.force.y, 0.1 * 4000.0, epsilon = 1e-9);
    }

    #[test]
    fn broken_bond_never_revives() {
        let (mut particle, mut point, mut bond) = setup();
        point.position = Vec3::new(2.0, 0.0, 0.0);
        bond.apply_bond_force(&mut particle, &mut point);
        assert!(!bond.is_alive());
        assert_eq!(particle.force, Vec3::ZERO);

        point.position = Vec3::new(1.5, 0.0, 0.0);
        bond.apply_bond_force(&mut particle, &mut point);
        assert!(!bond.is_alive());
        assert_eq!(particle.force, Vec3::ZERO);
    }

    #[test]
    fn point_follows_rotated_anchor() {
        let (mut particle, mut point, bond) = setup();
        particle.orientation = particle
            .orientation
            .rotate(Vec3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2));
        particle.position = Vec3::new(0.0, 0.0, 1.0);
        bond.apply_bond_boundary(&particle, &mut point);
        assert_relative_eq!(point.position.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(point.position.y, 1.0, epsilon = 1e-12);
        assert_relative_eq!(point.position.z, 1.0, epsilon = 1e-12);

        let mut dead = bond.clone();
        dead.kill();
        let before = point.position;
        particle.position = Vec3::ZERO;
        dead.apply_bond_boundary(&particle, &mut point);
        assert_eq!(point.position, before);
    }

    #[test]
    fn bonds_are_found_near_the_surface_only() {
        let particles = vec![Particle::new(1, Ellipsoid::sphere(1.0), Vec3::ZERO, 1.0)];
        let points = vec![
            PeriPoint::new(1, Vec3::new(1.05, 0.0, 0.0), 1.0),
            PeriPoint::new(2, Vec3::new(0.0, 1.5, 0.0), 1.0),
            PeriPoint::new(3, Vec3::new(0.5, 0.0, 0.0), 1.0),
        ];
        let bonds = find_peri_dem_bonds(&particles, &points, 0.5, 1.0, 0.1);
        assert_eq!(bonds.len(), 1);
        assert_eq!(bonds[0].point, 1);
        assert_relative_eq!(bonds[0].initial().x, 0.05, epsilon = 1e-12);
        assert_relative_eq!(bonds[0].anchor().x, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn points_inside_particles_are_removed() {
        let particles = vec![Particle::new(1, Ellipsoid::new(1.0, 0.5, 0.5), Vec3::ZERO, 1.0)];
        let mut points = vec![
            PeriPoint::new(1, Vec3::new(0.9, 0.0, 0.0), 1.0),
            PeriPoint::new(2, Vec3::new(0.0, 0.9, 0.0), 1.0),
            PeriPoint::new(3, Vec3::ZERO, 1.0),
        ];
        assert_eq!(remove_inside_points(&particles, &mut points), 2);
        assert_eq!(points[0].id, 2);
    }
}

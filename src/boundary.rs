use serde::{Deserialize, Serialize};

use crate::contact::{ContactGeometry, ForceLaw};
use crate::geometry::{Bounds, Vec3};
use crate::particle::{Particle, ParticleId};
use crate::topology::Face;




/**
 * How a boundary behaves. A fixed wall never moves; a moving wall may be
 * displaced along its normal by servo control; a periodic boundary takes no
 * part in contact.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryKind {
    Fixed,
    Moving,
    Periodic,
}




/**
 * One resolved particle-wall contact, as pushed by the contact resolver.
 */
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundaryContact {
    pub particle: ParticleId,
    pub point: Vec3,
    pub normal_force: Vec3,
    pub tangential_force: Vec3,
    pub penetration: f64,
}




/**
 * Force statistics for one boundary and one iteration.
 */
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundaryStats {
    pub num_contacts: usize,
    pub normal_force: Vec3,
    pub tangential_force: Vec3,
    pub penetration: f64,
}




// ============================================================================
impl BoundaryStats {

    /**
     * Combine the statistics of two disjoint contact sets (from two ranks).
     * Forces add; the mean penetration is weighted by contact count.
     */
    pub fn merge(&self, other: &BoundaryStats) -> BoundaryStats {
        let num_contacts = self.num_contacts + other.num_contacts;
        let penetration = if num_contacts == 0 {
            0.0
        } else {
            (self.penetration * self.num_contacts as f64 + other.penetration * other.num_contacts as f64)
                / num_contacts as f64
        };
        BoundaryStats {
            num_contacts,
            normal_force: self.normal_force + other.normal_force,
            tangential_force: self.tangential_force + other.tangential_force,
            penetration,
        }
    }
}




/**
 * A planar wall. The normal points out of the region the particles occupy,
 * so a particle center on the inside has a negative signed distance.
 *
 * The candidate and contact lists are transient: they are rebuilt every
 * iteration and are not part of the boundary's persistent state.
 */
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Boundary {
    pub id: usize,
    pub kind: BoundaryKind,
    pub face: Option<Face>,
    normal: Vec3,
    point: Vec3,
    #[serde(skip)]
    probable: Vec<usize>,
    #[serde(skip)]
    contacts: Vec<BoundaryContact>,
    #[serde(skip)]
    stats: BoundaryStats,
}




// ============================================================================
impl Boundary {

    pub fn new(id: usize, kind: BoundaryKind, normal: Vec3, point: Vec3) -> Self {
        Self {
            id,
            kind,
            face: None,
            normal: normal.normalize(),
            point,
            probable: Vec::new(),
            contacts: Vec::new(),
            stats: BoundaryStats::default(),
        }
    }

    /**
     * The six walls of a rectangular container, one per face, with ids
     * 0..6 in face order.
     */
    pub fn container(bounds: &Bounds, kind: BoundaryKind) -> Vec<Boundary> {
        Face::ALL
            .iter()
            .map(|&face| {
                let axis = face.axis();
                let (normal, point) = if face.is_plus() {
                    (Vec3::unit(axis), bounds.upper)
                } else {
                    (-Vec3::unit(axis), bounds.lower)
                };
                let mut wall = Boundary::new(face.index(), kind, normal, point);
                wall.face = Some(face);
                wall
            })
            .collect()
    }

    pub fn normal(&self) -> Vec3 {
        self.normal
    }

    pub fn point(&self) -> Vec3 {
        self.point
    }

    pub fn stats(&self) -> &BoundaryStats {
        &self.stats
    }

    pub fn contacts(&self) -> &[BoundaryContact] {
        &self.contacts
    }

    pub fn probable_contacts(&self) -> &[usize] {
        &self.probable
    }

    /**
     * Position of the wall along its own normal axis. For a container wall
     * this is the coordinate of the face.
     */
    pub fn offset(&self) -> f64 {
        self.point.dot(self.normal)
    }

    pub fn signed_distance(&self, x: Vec3) -> f64 {
        (x - self.point).dot(self.normal)
    }




    pub fn clear_stat_force(&mut self) {
        self.stats = BoundaryStats::default();
    }

    pub fn push_contact(&mut self, contact: BoundaryContact) {
        self.contacts.push(contact);
    }

    /**
     * Recompute the statistics from the contact list. The mean penetration
     * is left at zero when there are no contacts.
     */
    pub fn update_stat_force(&mut self) {
        self.clear_stat_force();
        self.stats.num_contacts = self.contacts.len();

        for c in &self.contacts {
            self.stats.normal_force += c.normal_force;
            self.stats.tangential_force += c.tangential_force;
            self.stats.penetration += c.penetration;
        }
        if self.stats.num_contacts != 0 {
            self.stats.penetration /= self.stats.num_contacts as f64;
        }
    }

    /**
     * Replace the local statistics, e.g. with the sum over all ranks.
     */
    pub fn set_stat_force(&mut self, stats: BoundaryStats) {
        self.stats = stats;
    }

    pub fn clear_boundary_contacts(&mut self) {
        self.probable.clear();
        self.contacts.clear();
    }




    /**
     * Record the particles whose bounding sphere reaches the wall. Indices
     * refer to `particles`, which must be the list later passed to
     * `resolve_contacts`.
     */
    pub fn find_probable_contacts(&mut self, particles: &[Particle]) {
        self.probable.clear();

        if self.kind == BoundaryKind::Periodic {
            return;
        }
        for (index, p) in particles.iter().enumerate() {
            if p.alive && self.signed_distance(p.position) + p.shape.max_radius() > 0.0 {
                self.probable.push(index);
            }
        }
    }

    /**
     * Compute the wall force on every candidate that actually penetrates
     * the plane, apply it, and record the contact.
     */
    pub fn resolve_contacts<L: ForceLaw>(&mut self, particles: &mut [Particle], law: &L) {
        let n = self.normal;

        for &index in &self.probable {
            let p = &mut particles[index];
            let reach = p.support_along(n);
            let penetration = self.signed_distance(p.position) + reach;

            if penetration <= 0.0 {
                continue;
            }
            let geometry = ContactGeometry {
                normal: -n,
                overlap: penetration,
                point: p.position + n * (reach - 0.5 * penetration),
            };
            let (normal_force, tangential_force) = law.boundary_force(p, &geometry);
            p.add_force_at(normal_force + tangential_force, geometry.point);

            self.contacts.push(BoundaryContact {
                particle: p.id,
                point: geometry.point,
                normal_force,
                tangential_force,
                penetration,
            });
        }
    }

    /**
     * Move a `Moving` wall along its normal so that the pressure it carries
     * tracks `target_pressure`. The wall moves inward while the measured
     * pressure is below the target and outward while it is above, at a
     * speed proportional to the difference, capped at `max_speed`. Returns
     * the displacement along the outward normal.
     */
    pub fn servo(&mut self, target_pressure: f64, area: f64, gain: f64, max_speed: f64, dt: f64) -> f64 {
        if self.kind != BoundaryKind::Moving || area <= 0.0 {
            return 0.0;
        }
        let pressure = self.stats.normal_force.dot(self.normal).abs() / area;
        let speed = (gain * (pressure - target_pressure)).max(-max_speed).min(max_speed);
        let displacement = speed * dt;
        self.translate(displacement);
        displacement
    }

    /**
     * Move the wall by `displacement` along its outward normal.
     */
    pub fn translate(&mut self, displacement: f64) {
        self.point += self.normal * displacement;
    }
}




/**
 * The box enclosed by a set of container walls, if the set contains one
 * wall per face.
 */
pub fn container_bounds(boundaries: &[Boundary]) -> Option<Bounds> {
    let mut lower = [None; 3];
    let mut upper = [None; 3];

    for b in boundaries {
        if let Some(face) = b.face {
            let i = face.axis().index();
            let x = b.point.get(face.axis());
            if face.is_plus() {
                upper[i] = Some(x);
            } else {
                lower[i] = Some(x);
            }
        }
    }
    Some(Bounds::new(
        Vec3::new(lower[0]?, lower[1]?, lower[2]?),
        Vec3::new(upper[0]?, upper[1]?, upper[2]?),
    ))
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::contact::LinearSpringDashpot;
    use crate::geometry::Ellipsoid;
    use approx::assert_relative_eq;

    fn floor() -> Boundary {
        Boundary::new(0, BoundaryKind::Fixed, Vec3::new(0.0, 0.0, -1.0), Vec3::ZERO)
    }

    fn contact(fz: f64, ft: f64, penetration: f64) -> BoundaryContact {
        BoundaryContact {
            particle: 0,
            point: Vec3::ZERO,
            normal_force: Vec3::new(0.0, 0.0, fz),
            tangential_force: Vec3::new(ft, 0.0, 0.0),
            penetration,
        }
    }

    #[test]
    fn stats_sum_forces_and_average_penetration() {
        let mut b = floor();
        b.push_contact(contact(1.0, 0.5, 0.01));
        b.push_contact(contact(3.0, 0.25, 0.03));
        b.update_stat_force();

        assert_eq!(b.stats().num_contacts, 2);
        assert_eq!(b.stats().normal_force, Vec3::new(0.0, 0.0, 4.0));
        assert_eq!(b.stats().tangential_force, Vec3::new(0.75, 0.0, 0.0));
        assert_relative_eq!(b.stats().penetration, 0.02, epsilon = 1e-12);
    }

    #[test]
    fn stats_with_no_contacts_are_zero() {
        let mut b = floor();
        b.update_stat_force();
        assert_eq!(b.stats(), &BoundaryStats::default());
        assert_eq!(b.stats().penetration, 0.0);
    }

    #[test]
    fn clearing_contacts_drops_both_lists() {
        let mut b = floor();
        let ps = vec![Particle::new(1, Ellipsoid::sphere(0.1), Vec3::new(0.0, 0.0, 0.05), 1.0)];
        b.find_probable_contacts(&ps);
        b.push_contact(contact(1.0, 0.0, 0.01));
        assert_eq!(b.probable_contacts().len(), 1);

        b.clear_boundary_contacts();
        assert!(b.probable_contacts().is_empty());
        assert!(b.contacts().is_empty());
    }

    #[test]
    fn penetrating_particle_is_pushed_off_the_wall() {
        let mut b = floor();
        let mut ps = vec![
            Particle::new(1, Ellipsoid::sphere(0.1), Vec3::new(0.0, 0.0, 0.05), 1.0),
            Particle::new(2, Ellipsoid::sphere(0.1), Vec3::new(1.0, 0.0, 0.5), 1.0),
        ];
        b.find_probable_contacts(&ps);
        b.resolve_contacts(&mut ps, &LinearSpringDashpot);
        b.update_stat_force();

        assert_eq!(b.stats().num_contacts, 1);
        assert_relative_eq!(b.stats().penetration, 0.05, epsilon = 1e-12);
        assert!(ps[0].force.z > 0.0);
        assert_eq!(ps[1].force, Vec3::ZERO);
    }

    #[test]
    fn periodic_boundaries_have_no_contacts() {
        let mut b = Boundary::new(0, BoundaryKind::Periodic, Vec3::new(0.0, 0.0, -1.0), Vec3::ZERO);
        let ps = vec![Particle::new(1, Ellipsoid::sphere(0.1), Vec3::new(0.0, 0.0, 0.05), 1.0)];
        b.find_probable_contacts(&ps);
        assert!(b.probable_contacts().is_empty());
    }

    #[test]
    fn servo_moves_wall_inward_when_pressure_is_low() {
        let mut b = Boundary::new(0, BoundaryKind::Moving, Vec3::new(1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0));
        b.set_stat_force(BoundaryStats {
            num_contacts: 1,
            normal_force: Vec3::new(-10.0, 0.0, 0.0),
            ..BoundaryStats::default()
        });
        let dx = b.servo(100.0, 1.0, 0.01, 0.5, 0.1);
        assert!(dx < 0.0);
        assert_relative_eq!(b.point().x, 1.0 + dx);

        let mut fixed = floor();
        assert_eq!(fixed.servo(100.0, 1.0, 0.01, 0.5, 0.1), 0.0);
    }

    #[test]
    fn merged_stats_weight_penetration_by_count() {
        let a = BoundaryStats {
            num_contacts: 1,
            normal_force: Vec3::new(1.0, 0.0, 0.0),
            tangential_force: Vec3::ZERO,
            penetration: 0.1,
        };
        let b = BoundaryStats {
            num_contacts: 3,
            normal_force: Vec3::new(2.0, 0.0, 0.0),
            tangential_force: Vec3::ZERO,
            penetration: 0.2,
        };
        let m = a.merge(&b);
        assert_eq!(m.num_contacts, 4);
        assert_eq!(m.normal_force.x, 3.0);
        assert_relative_eq!(m.penetration, 0.175, epsilon = 1e-12);
        assert_eq!(BoundaryStats::default().merge(&BoundaryStats::default()).penetration, 0.0);
    }

    #[test]
    fn container_walls_enclose_their_box() {
        let bounds = Bounds::new(Vec3::ZERO, Vec3::new(1.0, 2.0, 3.0));
        let walls = Boundary::container(&bounds, BoundaryKind::Fixed);
        assert_eq!(walls.len(), 6);
        assert!(walls.iter().all(|w| w.signed_distance(bounds.center()) < 0.0));
        assert_eq!(container_bounds(&walls), Some(bounds));
        assert_eq!(container_bounds(&walls[..5]), None);
    }
}

use std::collections::HashMap;

use crate::geometry::Vec3;
use crate::particle::Particle;

/// Where and how deeply two shapes overlap. `normal` is the unit vector
/// along which the force on the first body acts (pointing away from the
/// second body, or out of a wall), and `point` is the contact point in
/// global coordinates.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ContactGeometry {
    pub normal: Vec3,
    pub overlap: f64,
    pub point: Vec3,
}

/// Interface to a contact force model. Both methods return the normal and
/// tangential parts of the force acting on the first body; the caller
/// applies the reaction.
///
pub trait ForceLaw {
    fn contact_force(&self, a: &Particle, b: &Particle, geometry: &ContactGeometry) -> (Vec3, Vec3);

    fn boundary_force(&self, p: &Particle, geometry: &ContactGeometry) -> (Vec3, Vec3);
}

/// Linear spring with a normal dashpot, and Coulomb sliding friction in the
/// tangential direction. The stiffness, damping and friction come from the
/// particles' materials: pair values are the mean of the two (the smaller
/// friction coefficient wins).
///
#[derive(Clone, Copy, Debug, Default)]
pub struct LinearSpringDashpot;

impl LinearSpringDashpot {
    fn force(kn: f64, gn: f64, mu: f64, overlap: f64, normal: Vec3, relative_velocity: Vec3) -> (Vec3, Vec3) {
        if overlap <= 0.0 {
            return (Vec3::ZERO, Vec3::ZERO);
        }
        let vn = relative_velocity.dot(normal);
        let fn_mag = (kn * overlap - gn * vn).max(0.0);
        let vt = relative_velocity - normal * vn;
        let vt_mag = vt.norm();

        let ft = if vt_mag < 1e-12 {
            Vec3::ZERO
        } else {
            vt * (-mu * fn_mag / vt_mag)
        };
        (normal * fn_mag, ft)
    }
}

impl ForceLaw for LinearSpringDashpot {
    fn contact_force(&self, a: &Particle, b: &Particle, geometry: &ContactGeometry) -> (Vec3, Vec3) {
        let kn = 0.5 * (a.material.normal_stiffness + b.material.normal_stiffness);
        let gn = 0.5 * (a.material.normal_damping + b.material.normal_damping);
        let mu = a.material.friction.min(b.material.friction);
        let relative_velocity = surface_velocity(a, geometry.point) - surface_velocity(b, geometry.point);
        Self::force(kn, gn, mu, geometry.overlap, geometry.normal, relative_velocity)
    }

    fn boundary_force(&self, p: &Particle, geometry: &ContactGeometry) -> (Vec3, Vec3) {
        let m = &p.material;
        let relative_velocity = surface_velocity(p, geometry.point);
        Self::force(
            m.normal_stiffness,
            m.normal_damping,
            m.friction,
            geometry.overlap,
            geometry.normal,
            relative_velocity,
        )
    }
}

/// Velocity of the material point of `p` at the global position `at`.
///
pub fn surface_velocity(p: &Particle, at: Vec3) -> Vec3 {
    p.velocity + p.omega.cross(at - p.position)
}

/// Overlap of two particles, measured along the line joining their
/// centers. Returns `None` when they do not touch, or when the centers
/// coincide and no normal can be defined.
///
pub fn overlap_geometry(a: &Particle, b: &Particle) -> Option<ContactGeometry> {
    let d = b.position - a.position;
    let dist = d.norm();

    if dist == 0.0 {
        return None;
    }
    let n = d / dist;
    let ra = a.radius_along(n);
    let rb = b.radius_along(-n);
    let overlap = ra + rb - dist;

    if overlap <= 0.0 {
        return None;
    }
    Some(ContactGeometry {
        normal: -n,
        overlap,
        point: a.position + n * (ra - 0.5 * overlap),
    })
}

/// A touching pair. Both indices refer to the concatenation of the owned
/// particles followed by the ghosts; `i` is always an owned particle.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Contact {
    pub i: usize,
    pub j: usize,
    pub geometry: ContactGeometry,
}

/// Uniform hash grid for the broad phase. Cells are keyed by their integer
/// coordinates, so particles outside the partition box (ghosts) need no
/// special handling.
///
pub struct CellGrid {
    cell_size: f64,
    cells: HashMap<[i64; 3], Vec<usize>>,
}

impl CellGrid {
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size,
            cells: HashMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    fn cell_of(&self, position: Vec3) -> [i64; 3] {
        [
            (position.x / self.cell_size).floor() as i64,
            (position.y / self.cell_size).floor() as i64,
            (position.z / self.cell_size).floor() as i64,
        ]
    }

    pub fn insert(&mut self, index: usize, position: Vec3) {
        let cell = self.cell_of(position);
        self.cells.entry(cell).or_insert_with(Vec::new).push(index);
    }

    /// Indices stored in the 3x3x3 block of cells around `position`.
    ///
    pub fn potential_collisions(&self, position: Vec3) -> Vec<usize> {
        let [i, j, k] = self.cell_of(position);
        let mut neighbors = Vec::new();

        for di in -1..=1 {
            for dj in -1..=1 {
                for dk in -1..=1 {
                    if let Some(cell) = self.cells.get(&[i + di, j + dj, k + dk]) {
                        neighbors.extend_from_slice(cell);
                    }
                }
            }
        }
        neighbors
    }
}

/// Find every touching pair among the owned particles and between owned
/// particles and ghosts. Ghost-ghost pairs are skipped: neither body
/// belongs to this partition. Dead particles take no part in contact.
///
pub fn find_contacts(owned: &[Particle], ghosts: &[Particle]) -> Vec<Contact> {
    let all = || owned.iter().chain(ghosts.iter());
    let max_radius = all().map(|p| p.shape.max_radius()).fold(0.0, f64::max);

    if max_radius <= 0.0 {
        return Vec::new();
    }
    let mut grid = CellGrid::new(2.0 * max_radius);

    for (index, p) in all().enumerate() {
        if p.alive {
            grid.insert(index, p.position);
        }
    }

    let particle = |index: usize| {
        if index < owned.len() {
            &owned[index]
        } else {
            &ghosts[index - owned.len()]
        }
    };
    let mut contacts = Vec::new();

    for (i, a) in owned.iter().enumerate().filter(|(_, p)| p.alive) {
        let mut candidates = grid.potential_collisions(a.position);
        candidates.sort_unstable();

        for j in candidates.into_iter().filter(|&j| j > i) {
            if let Some(geometry) = overlap_geometry(a, particle(j)) {
                contacts.push(Contact { i, j, geometry });
            }
        }
    }
    contacts
}

/// Accumulate the contact forces for the given pairs. Both bodies of an
/// owned-owned pair are loaded; for an owned-ghost pair only the owned body
/// is, since the ghost's owner computes the mirror contact itself.
///
pub fn apply_contact_forces<L: ForceLaw>(owned: &mut [Particle], ghosts: &[Particle], contacts: &[Contact], law: &L) {
    let n = owned.len();

    for c in contacts {
        if c.j < n {
            let (fn_, ft) = law.contact_force(&owned[c.i], &owned[c.j], &c.geometry);
            let f = fn_ + ft;
            owned[c.i].add_force_at(f, c.geometry.point);
            owned[c.j].add_force_at(-f, c.geometry.point);
        } else {
            let (fn_, ft) = law.contact_force(&owned[c.i], &ghosts[c.j - n], &c.geometry);
            owned[c.i].add_force_at(fn_ + ft, c.geometry.point);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::Ellipsoid;
    use crate::particle::Provenance;
    use approx::assert_relative_eq;

    fn sphere(id: u64, x: f64) -> Particle {
        Particle::new(id, Ellipsoid::sphere(0.1), Vec3::new(x, 0.0, 0.0), 1000.0)
    }

    #[test]
    fn separated_spheres_do_not_touch() {
        assert!(overlap_geometry(&sphere(1, 0.0), &sphere(2, 0.25)).is_none());
        assert!(overlap_geometry(&sphere(1, 0.0), &sphere(2, 0.0)).is_none());
    }

    #[test]
    fn overlapping_spheres_push_apart() {
        let a = sphere(1, 0.0);
        let b = sphere(2, 0.15);
        let g = overlap_geometry(&a, &b).unwrap();
        assert_relative_eq!(g.overlap, 0.05, epsilon = 1e-12);
        assert_relative_eq!(g.normal.x, -1.0);
        assert_relative_eq!(g.point.x, 0.075, epsilon = 1e-12);

        let (fn_, ft) = LinearSpringDashpot.contact_force(&a, &b, &g);
        assert!(fn_.x < 0.0);
        assert_eq!(ft, Vec3::ZERO);
    }

    #[test]
    fn owned_pair_forces_are_equal_and_opposite() {
        let mut owned = vec![sphere(1, 0.0), sphere(2, 0.15).with_velocity(Vec3::new(0.0, 1.0, 0.0))];
        let contacts = find_contacts(&owned, &[]);
        assert_eq!(contacts.len(), 1);

        apply_contact_forces(&mut owned, &[], &contacts, &LinearSpringDashpot);
        let total = owned[0].force + owned[1].force;
        assert_relative_eq!(total.norm(), 0.0, epsilon = 1e-9);
        assert!(owned[0].force.y > 0.0);
    }

    #[test]
    fn ghosts_are_not_loaded() {
        let mut owned = vec![sphere(1, 0.0)];
        let mut ghost = sphere(2, 0.15);
        ghost.provenance = Provenance::Ghost;
        let ghosts = vec![ghost.clone(), {
            let mut g = sphere(3, 0.3);
            g.provenance = Provenance::Ghost;
            g
        }];

        let contacts = find_contacts(&owned, &ghosts);
        assert_eq!(contacts.len(), 1);
        assert_eq!((contacts[0].i, contacts[0].j), (0, 1));

        apply_contact_forces(&mut owned, &ghosts, &contacts, &LinearSpringDashpot);
        assert!(owned[0].force.x < 0.0);
        assert_eq!(ghosts[0], ghost);
    }

    #[test]
    fn dead_particles_have_no_contacts() {
        let mut owned = vec![sphere(1, 0.0), sphere(2, 0.15)];
        owned[1].alive = false;
        assert!(find_contacts(&owned, &[]).is_empty());
    }

    #[test]
    fn cell_grid_finds_neighbors_across_cell_faces() {
        let mut grid = CellGrid::new(1.0);
        grid.insert(0, Vec3::new(0.9, 0.0, 0.0));
        grid.insert(1, Vec3::new(1.1, 0.0, 0.0));
        grid.insert(2, Vec3::new(5.0, 0.0, 0.0));
        let mut found = grid.potential_collisions(Vec3::new(0.9, 0.0, 0.0));
        found.sort_unstable();
        assert_eq!(found, vec![0, 1]);
    }
}

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::{Axis, Bounds, Vec3};




/// Integer coordinates of a process on the logical Cartesian grid.
pub type Coords = [i64; 3];




/**
 * One of the six faces of a partition box.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Face {
    XMinus,
    XPlus,
    YMinus,
    YPlus,
    ZMinus,
    ZPlus,
}




// ============================================================================
impl Face {

    pub const ALL: [Face; 6] = [
        Face::XMinus,
        Face::XPlus,
        Face::YMinus,
        Face::YPlus,
        Face::ZMinus,
        Face::ZPlus,
    ];

    pub fn axis(self) -> Axis {
        match self {
            Face::XMinus | Face::XPlus => Axis::X,
            Face::YMinus | Face::YPlus => Axis::Y,
            Face::ZMinus | Face::ZPlus => Axis::Z,
        }
    }

    pub fn is_plus(self) -> bool {
        matches!(self, Face::XPlus | Face::YPlus | Face::ZPlus)
    }

    /**
     * The step (-1 or +1) taken along this face's axis to reach the
     * neighbor.
     */
    pub fn offset(self) -> i64 {
        if self.is_plus() {
            1
        } else {
            -1
        }
    }

    pub fn opposite(self) -> Face {
        match self {
            Face::XMinus => Face::XPlus,
            Face::XPlus => Face::XMinus,
            Face::YMinus => Face::YPlus,
            Face::YPlus => Face::YMinus,
            Face::ZMinus => Face::ZPlus,
            Face::ZPlus => Face::ZMinus,
        }
    }

    pub fn pair(axis: Axis) -> (Face, Face) {
        match axis {
            Axis::X => (Face::XMinus, Face::XPlus),
            Axis::Y => (Face::YMinus, Face::YPlus),
            Axis::Z => (Face::ZMinus, Face::ZPlus),
        }
    }

    /**
     * Index of this face in a six-element array, in the order of
     * `Face::ALL`.
     */
    pub fn index(self) -> usize {
        2 * self.axis().index() + self.is_plus() as usize
    }

    /**
     * The message tag used by a rank *sending* across this face. The
     * receiving rank sees the message arrive on the opposite face, so it
     * posts its receive with `face.opposite().send_tag()`.
     */
    pub fn send_tag(self) -> u32 {
        self.index() as u32 + 1
    }

    pub fn recv_tag(self) -> u32 {
        self.opposite().send_tag()
    }
}




/**
 * A logical 3D grid of processes, together with the global domain it
 * decomposes. Ranks are numbered in row-major order with the z coordinate
 * varying fastest. The grid is not periodic: faces on the outside of the
 * domain have no neighbor.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    dims: [usize; 3],
    domain: Bounds,
}




// ============================================================================
impl Topology {

    pub fn new(dims: [usize; 3], domain: Bounds) -> Result<Self> {
        if dims.iter().any(|&d| d == 0) {
            return Err(Error::Topology(format!("process grid {:?} has an empty axis", dims)));
        }
        if domain.volume() <= 0.0 {
            return Err(Error::Topology(format!("domain {:?} has no volume", domain)));
        }
        Ok(Self { dims, domain })
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn domain(&self) -> &Bounds {
        &self.domain
    }

    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    /**
     * Check that this grid can be laid over a communicator of the given
     * size.
     */
    pub fn validate(&self, num_ranks: usize) -> Result<()> {
        if self.size() != num_ranks {
            return Err(Error::Topology(format!(
                "process grid {:?} needs {} ranks but the communicator has {}",
                self.dims,
                self.size(),
                num_ranks
            )));
        }
        Ok(())
    }

    pub fn contains_coords(&self, coords: Coords) -> bool {
        coords
            .iter()
            .zip(self.dims.iter())
            .all(|(&c, &d)| c >= 0 && (c as usize) < d)
    }

    /**
     * Return the rank at the given coordinates, or `None` if the coordinates
     * are outside the process grid.
     */
    pub fn rank_of(&self, coords: Coords) -> Option<usize> {
        if !self.contains_coords(coords) {
            return None;
        }
        let [i, j, k] = coords;
        let [_, ny, nz] = self.dims;
        Some((i as usize * ny + j as usize) * nz + k as usize)
    }

    pub fn coords_of(&self, rank: usize) -> Coords {
        let [_, ny, nz] = self.dims;
        let k = rank % nz;
        let j = (rank / nz) % ny;
        let i = rank / (ny * nz);
        [i as i64, j as i64, k as i64]
    }

    pub fn neighbor_coords(&self, coords: Coords, face: Face) -> Coords {
        let mut n = coords;
        n[face.axis().index()] += face.offset();
        n
    }

    /**
     * Return the sub-box of the global domain owned by the process at the
     * given coordinates. Adjacent boxes share their faces exactly, so the
     * boxes tile the domain.
     */
    pub fn partition_bounds(&self, coords: Coords) -> Bounds {
        let extent = self.domain.extent();
        let mut lower = self.domain.lower;
        let mut upper = self.domain.upper;

        for axis in Axis::ALL {
            let n = self.dims[axis.index()];
            let c = coords[axis.index()] as usize;
            let d = extent.get(axis) / n as f64;
            lower.set(axis, self.domain.lower.get(axis) + d * c as f64);
            if c + 1 < n {
                upper.set(axis, self.domain.lower.get(axis) + d * (c + 1) as f64);
            }
        }
        Bounds::new(lower, upper)
    }

    /**
     * Return the same grid laid over a new domain (for problems where the
     * container grows or shrinks).
     */
    pub fn with_domain(&self, domain: Bounds) -> Result<Self> {
        Self::new(self.dims, domain)
    }

    /**
     * Return the rank whose partition contains the given point. Points
     * outside the domain are assigned to the nearest partition.
     */
    pub fn rank_containing(&self, p: Vec3) -> usize {
        let extent = self.domain.extent();
        let mut coords = [0; 3];

        for axis in Axis::ALL {
            let n = self.dims[axis.index()] as i64;
            let f = (p.get(axis) - self.domain.lower.get(axis)) / extent.get(axis);
            coords[axis.index()] = ((f * n as f64).floor() as i64).max(0).min(n - 1);
        }
        self.coords_of_unchecked(coords)
    }

    fn coords_of_unchecked(&self, coords: Coords) -> usize {
        let [i, j, k] = coords;
        let [_, ny, nz] = self.dims;
        (i as usize * ny + j as usize) * nz + k as usize
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use approx::assert_relative_eq;

    fn unit_cube() -> Bounds {
        Bounds::new(Vec3::ZERO, Vec3::splat(1.0))
    }

    #[test]
    fn rank_and_coords_round_trip() {
        let topo = Topology::new([2, 3, 4], unit_cube()).unwrap();
        for rank in 0..topo.size() {
            assert_eq!(topo.rank_of(topo.coords_of(rank)), Some(rank));
        }
        assert_eq!(topo.rank_of([2, 0, 0]), None);
        assert_eq!(topo.rank_of([0, -1, 0]), None);
    }

    #[test]
    fn opposite_faces_pair_tags() {
        for face in Face::ALL {
            assert_eq!(face.send_tag(), face.opposite().recv_tag());
            assert_ne!(face.send_tag(), face.recv_tag());
            assert_eq!(Face::ALL[face.index()], face);
        }
    }

    #[test]
    fn partitions_tile_the_domain() {
        let domain = Bounds::new(Vec3::new(-1.0, 0.0, 2.0), Vec3::new(2.0, 1.5, 3.0));
        let topo = Topology::new([3, 2, 2], domain).unwrap();
        let boxes: Vec<_> = (0..topo.size())
            .map(|r| topo.partition_bounds(topo.coords_of(r)))
            .collect();

        let total: f64 = boxes.iter().map(|b| b.volume()).sum();
        assert_relative_eq!(total, domain.volume(), epsilon = 1e-12);

        for (i, a) in boxes.iter().enumerate() {
            for b in &boxes[..i] {
                assert_relative_eq!(a.overlap_volume(b), 0.0, epsilon = 1e-12);
            }
        }
        assert_eq!(boxes.last().unwrap().upper, domain.upper);
    }

    #[test]
    fn grid_size_must_match_communicator() {
        let topo = Topology::new([2, 1, 1], unit_cube()).unwrap();
        assert!(topo.validate(2).is_ok());
        assert!(matches!(topo.validate(3), Err(Error::Topology(_))));
        assert!(Topology::new([0, 1, 1], unit_cube()).is_err());
    }

    #[test]
    fn points_are_assigned_to_their_partition() {
        let topo = Topology::new([2, 1, 1], unit_cube()).unwrap();
        assert_eq!(topo.rank_containing(Vec3::new(0.49, 0.5, 0.5)), 0);
        assert_eq!(topo.rank_containing(Vec3::new(0.51, 0.5, 0.5)), 1);
        assert_eq!(topo.rank_containing(Vec3::new(1.2, 0.5, 0.5)), 1);
    }
}

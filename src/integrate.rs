use log::warn;

use crate::geometry::Vec3;
use crate::particle::{Particle, PeriPoint};

/// Bounds and safety factor for the adaptive timestep.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeStepControl {
    pub max: f64,
    pub min: f64,
    pub safety: f64,
}

impl TimeStepControl {
    /// Return the largest stable timestep for the given particles, clamped
    /// to `[min, max]`. Two limits apply to each particle: the contact
    /// oscillation period `sqrt(m / k)`, and the time to travel a tenth of
    /// its smallest semi-axis. Ghosts should be included, since they take
    /// part in contact.
    ///
    pub fn estimate(&self, particles: &[Particle]) -> f64 {
        let mut dt = self.max;

        for p in particles.iter().filter(|p| p.alive) {
            let k = p.material.normal_stiffness.max(p.material.tangential_stiffness);

            if k > 0.0 && p.mass > 0.0 {
                dt = dt.min(self.safety * (p.mass / k).sqrt());
            }
            let speed = p.velocity.norm();

            if speed > 0.0 {
                dt = dt.min(self.safety * 0.1 * p.shape.min_radius() / speed);
            }
        }

        if dt < self.min {
            warn!("stable timestep {:e} is below the minimum {:e}", dt, self.min);
            self.min
        } else {
            dt
        }
    }
}

/// Advance owned particles one step with the central difference scheme:
/// velocities are updated from the accumulated force and moment, then
/// positions and orientations from the new velocities.
///
pub fn integrate_particles(particles: &mut [Particle], dt: f64) {
    for p in particles.iter_mut().filter(|p| p.alive) {
        debug_assert!(!p.is_ghost(), "ghost particles are never integrated");

        p.velocity += p.force / p.mass * dt;
        p.position += p.velocity * dt;

        // Angular update in the body frame, where the inertia is diagonal.
        let m = p.global_to_local(p.moment);
        let w = p.global_to_local(p.omega);
        let i = p.inertia;
        let w = Vec3::new(
            w.x + (m.x - (i.z - i.y) * w.y * w.z) / i.x * dt,
            w.y + (m.y - (i.x - i.z) * w.z * w.x) / i.y * dt,
            w.z + (m.z - (i.y - i.x) * w.x * w.y) / i.z * dt,
        );
        p.omega = p.local_to_global(w);
        p.orientation = p.orientation.rotate(p.omega * dt);
    }
}

/// Advance peridynamic points one step from their accumulated acceleration.
///
pub fn integrate_points(points: &mut [PeriPoint], dt: f64) {
    for q in points.iter_mut() {
        q.velocity += q.acceleration * dt;
        q.position += q.velocity * dt;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::Ellipsoid;
    use approx::assert_relative_eq;

    fn control() -> TimeStepControl {
        TimeStepControl {
            max: 1.0,
            min: 1e-9,
            safety: 0.5,
        }
    }

    #[test]
    fn timestep_is_limited_by_contact_stiffness() {
        let mut p = Particle::new(1, Ellipsoid::sphere(0.1), Vec3::ZERO, 1000.0);
        p.material.normal_stiffness = 1e6;
        p.material.tangential_stiffness = 1e5;
        let expected = 0.5 * (p.mass / 1e6).sqrt();
        assert_relative_eq!(control().estimate(&[p]), expected);
    }

    #[test]
    fn timestep_is_clamped_to_its_bounds() {
        assert_eq!(control().estimate(&[]), 1.0);

        let mut p = Particle::new(1, Ellipsoid::sphere(0.1), Vec3::ZERO, 1000.0);
        p.velocity = Vec3::new(1e12, 0.0, 0.0);
        assert_eq!(control().estimate(&[p]), 1e-9);
    }

    #[test]
    fn free_particle_moves_under_constant_force() {
        let mut ps = vec![Particle::new(1, Ellipsoid::sphere(0.1), Vec3::ZERO, 1.0)];
        let mass = ps[0].mass;
        ps[0].add_force(Vec3::new(mass, 0.0, 0.0));
        integrate_particles(&mut ps, 0.1);
        assert_relative_eq!(ps[0].velocity.x, 0.1, epsilon = 1e-12);
        assert_relative_eq!(ps[0].position.x, 0.01, epsilon = 1e-12);
        assert_eq!(ps[0].omega, Vec3::ZERO);
    }

    #[test]
    fn dead_particles_stay_put() {
        let mut p = Particle::new(1, Ellipsoid::sphere(0.1), Vec3::ZERO, 1.0).with_velocity(Vec3::splat(1.0));
        p.alive = false;
        let mut ps = vec![p];
        integrate_particles(&mut ps, 0.1);
        assert_eq!(ps[0].position, Vec3::ZERO);
    }

    #[test]
    fn points_integrate_their_acceleration() {
        let mut qs = vec![PeriPoint::new(1, Vec3::ZERO, 1.0)];
        qs[0].add_acceleration_by_force(Vec3::new(0.0, 2.0, 0.0));
        integrate_points(&mut qs, 0.5);
        assert_relative_eq!(qs[0].velocity.y, 1.0);
        assert_relative_eq!(qs[0].position.y, 0.5);
    }
}

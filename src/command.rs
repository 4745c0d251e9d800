use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::ArgEnum;
use log::info;

use crate::bond::remove_inside_points;
use crate::boundary::container_bounds;
use crate::config::{Parameters, RunConfig};
use crate::error::{Error, Result};
use crate::geometry::{Axis, Bounds, Vec3};
use crate::message::Communicator;
use crate::particle::Particle;
use crate::simulation::{Coupling, Loading, Simulation};
use crate::snapshot::{read_boundaries, read_particles, read_points, CborSnapshotWriter, Snapshot, SnapshotWriter};




/**
 * The simulations that can be launched from the command line. Each one
 * reads its inputs on rank 0 from the data files named in the parameter
 * file, and writes its outputs under `outputFolder`.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, ArgEnum)]
pub enum Command {
    /// Run the time loop from a prepared particle assembly and container.
    ProceedFromPreset,
    /// Remove the particles that stick out of the container.
    TrimParticles,
    /// Expand the particles inside a cavity box, then run the time loop.
    CavityExpansion,
    /// Couple a peridynamic body to the particles and run the time loop.
    PeridynamicsPullOut,
    /// Compress a confined assembly in plane strain at a fixed timestep.
    PlaneStrainLoading,
}




// ============================================================================
impl Command {

    pub fn name(self) -> &'static str {
        match self {
            Command::ProceedFromPreset => "proceed-from-preset",
            Command::TrimParticles => "trim-particles",
            Command::CavityExpansion => "cavity-expansion",
            Command::PeridynamicsPullOut => "peridynamics-pull-out",
            Command::PlaneStrainLoading => "plane-strain-loading",
        }
    }

    /**
     * Run the command on this rank. Every rank of the communicator must
     * call this with the same parameters. Returns the final state on rank
     * 0 and `None` elsewhere.
     */
    pub fn execute<C: Communicator>(self, comm: C, params: &Parameters, stop: Arc<AtomicBool>) -> Result<Option<Snapshot>> {
        info!("rank {} of {} executing {}", comm.rank(), comm.size(), self.name());

        match self {
            Command::ProceedFromPreset => {
                let input = match comm.rank() {
                    0 => Some(read_preset(params)?),
                    _ => None,
                };
                deposit(comm, params, input, None, Loading::Servo, stop)
            }
            Command::TrimParticles => match comm.rank() {
                0 => trim_particles(params).map(Some),
                _ => Ok(None),
            },
            Command::CavityExpansion => {
                let input = match comm.rank() {
                    0 => Some(cavity_expansion(params)?),
                    _ => None,
                };
                deposit(comm, params, input, None, Loading::Servo, stop)
            }
            Command::PeridynamicsPullOut => {
                let input = match comm.rank() {
                    0 => Some(read_pull_out(params)?),
                    _ => None,
                };
                let search_distance = params.get_positive("bondSearchDistance")?;
                let coupling = coupling_mode(params)?;
                deposit(comm, params, input, Some((search_distance, coupling)), Loading::Servo, stop)
            }
            Command::PlaneStrainLoading => {
                params.get_f64("sigmaConf")?;
                let loading_rate = params.get_positive("loadingRate")?;
                let input = match comm.rank() {
                    0 => Some(read_preset(params)?),
                    _ => None,
                };
                deposit(comm, params, input, None, Loading::PlaneStrain { loading_rate }, stop)
            }
        }
    }
}




// ============================================================================
fn deposit<C: Communicator>(
    comm: C,
    params: &Parameters,
    input: Option<Snapshot>,
    bonds: Option<(f64, Coupling)>,
    loading: Loading,
    stop: Arc<AtomicBool>,
) -> Result<Option<Snapshot>> {
    let config = RunConfig::from_parameters(params)?;

    let mut writer = match comm.rank() {
        0 => Some(CborSnapshotWriter::new(&config.output_folder, "particle")?),
        _ => None,
    };
    let mut sim = Simulation::new(comm, config)?;
    sim.set_stop_flag(stop);
    sim.set_loading(loading);
    sim.scatter(input)?;

    if let Some((search_distance, coupling)) = bonds {
        sim.couple(search_distance, coupling)?;
    }
    let last = sim.run(writer.as_mut().map(|w| w as &mut dyn SnapshotWriter))?;

    if let (Some(writer), Some(last)) = (&writer, &last) {
        writer.write_named("particle_end", last)?;
    }
    Ok(last)
}

fn read_preset(params: &Parameters) -> Result<Snapshot> {
    let particles = read_particles(params.get_path("particleFile")?)?;
    let boundaries = read_boundaries(params.get_path("boundaryFile")?)?;
    Ok(Snapshot::new(0, 0.0, particles).with_boundaries(boundaries))
}

fn read_pull_out(params: &Parameters) -> Result<Snapshot> {
    let snapshot = read_preset(params)?;
    let mut points = read_points(params.get_path("periFile")?)?;
    let removed = remove_inside_points(&snapshot.particles, &mut points);
    info!("{} peridynamic points, {} inside particles removed", points.len(), removed);
    Ok(snapshot.with_points(points))
}

/**
 * The bond coupling named by the optional `couplingMode` key: `force`
 * (the default) or `kinematic`.
 */
fn coupling_mode(params: &Parameters) -> Result<Coupling> {
    if !params.contains("couplingMode") {
        return Ok(Coupling::Force);
    }
    match params.get_str("couplingMode")? {
        "force" => Ok(Coupling::Force),
        "kinematic" => Ok(Coupling::Kinematic),
        other => Err(Error::InvalidParameter {
            key: "couplingMode".to_string(),
            value: other.to_string(),
        }),
    }
}

fn trim_particles(params: &Parameters) -> Result<Snapshot> {
    let boundaries = read_boundaries(params.get_path("boundaryFile")?)?;
    let container = match container_bounds(&boundaries) {
        Some(container) => container,
        None => params.domain()?,
    };
    let particles = read_particles(params.get_path("particleFile")?)?;
    let before = particles.len();
    let kept = trim(&container, particles);

    info!("trimmed {} of {} particles to {:?}", before - kept.len(), before, container);

    let snapshot = Snapshot::new(0, 0.0, kept).with_boundaries(boundaries);
    let writer = CborSnapshotWriter::new(params.get_path("outputFolder")?, "particle")?;
    writer.write_named("trim_particle_end", &snapshot)?;
    Ok(snapshot)
}

fn cavity_expansion(params: &Parameters) -> Result<Snapshot> {
    let percent = params.get_f64("expandPercent")?;
    let cavity = params.get_box("cavity")?;
    let mut particles = read_particles(params.get_path("particleFile")?)?;
    let boundaries = read_boundaries(params.get_path("boundaryFile")?)?;
    let expanded = expand_cavity(&cavity, percent, &mut particles);

    info!("expanded {} particles in the cavity by {}", expanded.len(), percent);

    let writer = CborSnapshotWriter::new(params.get_path("outputFolder")?, "particle")?;
    writer.write_named("cavity_particle_ini", &Snapshot::new(0, 0.0, expanded))?;

    let snapshot = Snapshot::new(0, 0.0, particles).with_boundaries(boundaries);
    writer.write_named("expand_particle_ini", &snapshot)?;
    Ok(snapshot)
}




/**
 * Keep the particles whose bounding sphere lies entirely inside the
 * container.
 */
pub fn trim(container: &Bounds, particles: Vec<Particle>) -> Vec<Particle> {
    particles
        .into_iter()
        .filter(|p| {
            let r = Vec3::splat(p.shape.max_radius());
            container.contains_closed(p.position - r) && container.contains_closed(p.position + r)
        })
        .collect()
}

/**
 * Grow every particle whose center is strictly inside the cavity by the
 * given fraction, and return copies of the grown particles.
 */
pub fn expand_cavity(cavity: &Bounds, percent: f64, particles: &mut [Particle]) -> Vec<Particle> {
    let mut expanded = Vec::new();

    for p in particles.iter_mut() {
        let inside = Axis::ALL.iter().all(|&axis| {
            let x = p.position.get(axis);
            x > cavity.lower.get(axis) && x < cavity.upper.get(axis)
        });
        if inside {
            p.expand(percent);
            expanded.push(p.clone());
        }
    }
    expanded
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::boundary::{Boundary, BoundaryKind};
    use crate::config::test::sample_parameters;
    use crate::geometry::Ellipsoid;
    use crate::message::ChannelCommunicator;
    use crate::snapshot::write_cbor;
    use approx::assert_relative_eq;
    use std::path::PathBuf;

    fn sphere(id: u64, x: f64, r: f64) -> Particle {
        Particle::new(id, Ellipsoid::sphere(r), Vec3::new(x, 0.5, 0.5), 1.0)
    }

    fn unit_box() -> Bounds {
        Bounds::new(Vec3::ZERO, Vec3::splat(1.0))
    }

    fn scratch_folder(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("peridem-command-{}-{}", name, std::process::id()))
    }

    #[test]
    fn trim_drops_particles_crossing_the_walls() {
        let kept = trim(&unit_box(), vec![sphere(1, 0.5, 0.1), sphere(2, 0.05, 0.1), sphere(3, 0.9, 0.1)]);
        assert_eq!(kept.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn cavity_expansion_only_touches_strictly_interior_particles() {
        let cavity = Bounds::new(Vec3::new(0.4, 0.0, 0.0), Vec3::new(0.6, 1.0, 1.0));
        let mut particles = vec![sphere(1, 0.5, 0.1), sphere(2, 0.4, 0.1), sphere(3, 0.8, 0.1)];
        let expanded = expand_cavity(&cavity, 0.5, &mut particles);

        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].id, 1);
        assert_relative_eq!(particles[0].shape.a, 0.15, epsilon = 1e-12);
        assert_eq!(particles[1].shape, Ellipsoid::sphere(0.1));
    }

    #[test]
    fn unknown_coupling_mode_is_rejected() {
        let mut params = Parameters::default();
        assert_eq!(coupling_mode(&params).unwrap(), Coupling::Force);
        params.insert("couplingMode", "kinematic");
        assert_eq!(coupling_mode(&params).unwrap(), Coupling::Kinematic);
        params.insert("couplingMode", "glue");
        assert!(matches!(coupling_mode(&params), Err(Error::InvalidParameter { .. })));
    }

    #[test]
    fn trim_command_writes_the_trimmed_assembly() {
        let folder = scratch_folder("trim");
        std::fs::create_dir_all(&folder).unwrap();

        let particle_file = folder.join("particles.cbor");
        let boundary_file = folder.join("walls.cbor");
        write_cbor(&particle_file, &Snapshot::new(0, 0.0, vec![sphere(1, 0.5, 0.1), sphere(2, 0.95, 0.1)])).unwrap();
        write_cbor(
            &boundary_file,
            &Snapshot::new(0, 0.0, vec![]).with_boundaries(Boundary::container(&unit_box(), BoundaryKind::Fixed)),
        )
        .unwrap();

        let mut params = Parameters::default();
        params.insert("particleFile", particle_file.to_string_lossy().to_string());
        params.insert("boundaryFile", boundary_file.to_string_lossy().to_string());
        params.insert("outputFolder", folder.join("out").to_string_lossy().to_string());

        let comm = ChannelCommunicator::cluster(1).pop().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let trimmed = Command::TrimParticles.execute(comm, &params, stop).unwrap().unwrap();

        assert_eq!(trimmed.num_particles, 1);
        let written = read_particles(folder.join("out").join("trim_particle_end.cbor")).unwrap();
        assert_eq!(written[0].id, 1);

        std::fs::remove_dir_all(&folder).unwrap();
    }

    #[test]
    fn plane_strain_command_runs_with_the_fixed_step() {
        let folder = scratch_folder("plane-strain");
        std::fs::create_dir_all(&folder).unwrap();

        let particle_file = folder.join("particles.cbor");
        let boundary_file = folder.join("walls.cbor");
        write_cbor(&particle_file, &Snapshot::new(0, 0.0, vec![sphere(1, 0.5, 0.05)])).unwrap();
        write_cbor(
            &boundary_file,
            &Snapshot::new(0, 0.0, vec![]).with_boundaries(Boundary::container(&unit_box(), BoundaryKind::Moving)),
        )
        .unwrap();

        let mut params = sample_parameters();
        params.insert("mpiProcX", 1);
        params.insert("endStep", 4);
        params.insert("particleFile", particle_file.to_string_lossy().to_string());
        params.insert("boundaryFile", boundary_file.to_string_lossy().to_string());
        params.insert("outputFolder", folder.join("out").to_string_lossy().to_string());

        let comm = ChannelCommunicator::cluster(1).pop().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let missing = Command::PlaneStrainLoading.execute(comm, &params, stop.clone());
        assert!(matches!(missing, Err(Error::MissingParameter(_))));

        params.insert("sigmaConf", 1e3);
        params.insert("servoGain", 1e-3);
        params.insert("servoMaxSpeed", 0.1);
        params.insert("loadingRate", 0.5);

        let comm = ChannelCommunicator::cluster(1).pop().unwrap();
        let last = Command::PlaneStrainLoading.execute(comm, &params, stop).unwrap().unwrap();
        let container = container_bounds(&last.boundaries).unwrap();

        assert_eq!(last.iteration, 4);
        assert_relative_eq!(last.time, 4e-3, epsilon = 1e-12);
        assert_relative_eq!(container.extent().z, 1.0 - 2.0 * 0.5 * 4e-3, epsilon = 1e-9);
        assert!(folder.join("out").join("particle_end.cbor").exists());

        std::fs::remove_dir_all(&folder).unwrap();
    }
}

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::boundary::Boundary;
use crate::error::{Error, Result};
use crate::particle::{Particle, PeriPoint};




/**
 * Everything needed to restart or inspect a run at one iteration: the
 * owned particles of every rank, the peridynamic points, and the walls.
 * Input data files use the same layout, with whichever parts they need.
 */
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub iteration: usize,
    pub time: f64,
    pub num_particles: usize,
    pub particles: Vec<Particle>,
    pub points: Vec<PeriPoint>,
    pub boundaries: Vec<Boundary>,
}




// ============================================================================
impl Snapshot {

    pub fn new(iteration: usize, time: f64, mut particles: Vec<Particle>) -> Self {
        particles.sort_by_key(|p| p.id);
        Self {
            iteration,
            time,
            num_particles: particles.len(),
            particles,
            points: Vec::new(),
            boundaries: Vec::new(),
        }
    }

    pub fn with_points(mut self, points: Vec<PeriPoint>) -> Self {
        self.points = points;
        self
    }

    pub fn with_boundaries(mut self, boundaries: Vec<Boundary>) -> Self {
        self.boundaries = boundaries;
        self
    }

    /**
     * Check that the particle list agrees with the recorded count.
     */
    pub fn validate(&self) -> Result<()> {
        if self.num_particles != self.particles.len() {
            return Err(Error::ParticleCount {
                expected: self.num_particles,
                found: self.particles.len(),
            });
        }
        Ok(())
    }
}




/**
 * Receives a consistent, fully migrated view of the owned particles at a
 * given iteration. Only rank 0 ever holds a writer.
 */
pub trait SnapshotWriter {
    fn write(&mut self, snapshot: &Snapshot) -> Result<()>;
}




/**
 * Collects snapshots in memory.
 */
impl SnapshotWriter for Vec<Snapshot> {
    fn write(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.push(snapshot.clone());
        Ok(())
    }
}




/**
 * Writes each snapshot to `<folder>/<prefix>_<NNN>.cbor`, numbering them
 * in the order they are written.
 */
pub struct CborSnapshotWriter {
    folder: PathBuf,
    prefix: String,
    count: usize,
}




// ============================================================================
impl CborSnapshotWriter {

    /**
     * Create the writer, creating `folder` (and its parents) if needed.
     */
    pub fn new<P: AsRef<Path>>(folder: P, prefix: &str) -> Result<Self> {
        let folder = folder.as_ref().to_path_buf();
        fs::create_dir_all(&folder).map_err(|e| Error::io(&folder, e))?;
        info!("writing snapshots to {}", folder.display());

        Ok(Self {
            folder,
            prefix: prefix.to_string(),
            count: 0,
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn path_for(&self, index: usize) -> PathBuf {
        self.folder.join(format!("{}_{:03}.cbor", self.prefix, index))
    }

    /**
     * Write a snapshot under an explicit name (e.g. a final state), outside
     * the numbered sequence.
     */
    pub fn write_named(&self, name: &str, snapshot: &Snapshot) -> Result<PathBuf> {
        let path = self.folder.join(format!("{}.cbor", name));
        write_cbor(&path, snapshot)?;
        Ok(path)
    }
}

impl SnapshotWriter for CborSnapshotWriter {
    fn write(&mut self, snapshot: &Snapshot) -> Result<()> {
        let path = self.path_for(self.count);
        write_cbor(&path, snapshot)?;
        info!(
            "[{}] wrote {} particles to {}",
            snapshot.iteration,
            snapshot.particles.len(),
            path.display()
        );
        self.count += 1;
        Ok(())
    }
}




// ============================================================================
pub fn write_cbor<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut buffer = BufWriter::new(file);
    ciborium::ser::into_writer(value, &mut buffer).map_err(|e| Error::Encode(format!("{}: {:?}", path.display(), e)))?;
    buffer.flush().map_err(|e| Error::io(path, e))
}

pub fn read_cbor<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    ciborium::de::from_reader(BufReader::new(file)).map_err(|e| Error::Decode(format!("{}: {:?}", path.display(), e)))
}

pub fn read_snapshot<P: AsRef<Path>>(path: P) -> Result<Snapshot> {
    let snapshot: Snapshot = read_cbor(path)?;
    snapshot.validate()?;
    Ok(snapshot)
}

pub fn read_particles<P: AsRef<Path>>(path: P) -> Result<Vec<Particle>> {
    Ok(read_snapshot(path)?.particles)
}

pub fn read_points<P: AsRef<Path>>(path: P) -> Result<Vec<PeriPoint>> {
    Ok(read_snapshot(path)?.points)
}

pub fn read_boundaries<P: AsRef<Path>>(path: P) -> Result<Vec<Boundary>> {
    Ok(read_snapshot(path)?.boundaries)
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::geometry::{Bounds, Vec3};
use crate::integrate::TimeStepControl;
use crate::topology::Topology;

/// Named scalar parameters and data-file names, read once at startup from
/// a flat JSON object such as
///
/// ```json
/// { "ghostWidth": 0.05, "endStep": 1000, "particleFile": "particles.cbor" }
/// ```
///
/// Lookups of required keys fail with `Error::MissingParameter`; physical
/// parameters are never defaulted.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters {
    values: BTreeMap<String, Value>,
}

impl Parameters {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Decode(e.to_string()))
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Encode(e.to_string()))
    }

    pub fn insert<V: Into<Value>>(&mut self, key: &str, value: V) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn value(&self, key: &str) -> Result<&Value> {
        self.values
            .get(key)
            .ok_or_else(|| Error::MissingParameter(key.to_string()))
    }

    fn invalid(key: &str, value: &Value) -> Error {
        Error::InvalidParameter {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn get_f64(&self, key: &str) -> Result<f64> {
        let value = self.value(key)?;
        value.as_f64().ok_or_else(|| Self::invalid(key, value))
    }

    pub fn get_usize(&self, key: &str) -> Result<usize> {
        let value = self.value(key)?;
        value
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| Self::invalid(key, value))
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        let value = self.value(key)?;
        value.as_str().ok_or_else(|| Self::invalid(key, value))
    }

    pub fn get_path(&self, key: &str) -> Result<PathBuf> {
        self.get_str(key).map(PathBuf::from)
    }

    /// Look up an optional key. A key that is present but of the wrong type
    /// is still an error.
    ///
    pub fn get_f64_opt(&self, key: &str) -> Result<Option<f64>> {
        if self.contains(key) {
            self.get_f64(key).map(Some)
        } else {
            Ok(None)
        }
    }

    /// A strictly positive, finite number.
    ///
    pub fn get_positive(&self, key: &str) -> Result<f64> {
        let x = self.get_f64(key)?;

        if x.is_finite() && x > 0.0 {
            Ok(x)
        } else {
            Err(Self::invalid(key, &Value::from(x)))
        }
    }

    /// The box given by the six keys `<prefix>MinX` ... `<prefix>MaxZ`.
    ///
    pub fn get_box(&self, prefix: &str) -> Result<Bounds> {
        let get = |suffix: &str| self.get_f64(&format!("{}{}", prefix, suffix));
        Ok(Bounds::new(
            Vec3::new(get("MinX")?, get("MinY")?, get("MinZ")?),
            Vec3::new(get("MaxX")?, get("MaxY")?, get("MaxZ")?),
        ))
    }

    /// The global domain, from `Xmin` ... `Zmax`.
    ///
    pub fn domain(&self) -> Result<Bounds> {
        Ok(Bounds::new(
            Vec3::new(self.get_f64("Xmin")?, self.get_f64("Ymin")?, self.get_f64("Zmin")?),
            Vec3::new(self.get_f64("Xmax")?, self.get_f64("Ymax")?, self.get_f64("Zmax")?),
        ))
    }

    /// The process grid over the global domain, from `mpiProcX/Y/Z`.
    ///
    pub fn topology(&self) -> Result<Topology> {
        let dims = [
            self.get_usize("mpiProcX")?,
            self.get_usize("mpiProcY")?,
            self.get_usize("mpiProcZ")?,
        ];
        Topology::new(dims, self.domain()?)
    }
}

/// Servo control of moving walls toward a confining pressure.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ServoConfig {
    pub target_pressure: f64,
    pub gain: f64,
    pub max_speed: f64,
}

/// The run parameters the time loop needs, validated.
///
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub topology: Topology,
    pub ghost_width: f64,
    pub time_step: TimeStepControl,
    pub start_step: usize,
    pub end_step: usize,
    pub snapshot_interval: usize,
    pub gravity: f64,
    pub bond_stretch_limit: f64,
    pub bond_stiffness: f64,
    pub servo: Option<ServoConfig>,
    pub output_folder: PathBuf,
}

impl RunConfig {
    pub fn from_parameters(params: &Parameters) -> Result<Self> {
        let time_step = TimeStepControl {
            max: params.get_positive("timeStep")?,
            min: params.get_positive("minTimeStep")?,
            safety: params.get_positive("timeStepSafety")?,
        };
        if time_step.min > time_step.max {
            return Err(Error::InvalidParameter {
                key: "minTimeStep".to_string(),
                value: time_step.min.to_string(),
            });
        }

        let start_step = params.get_usize("startStep")?;
        let end_step = params.get_usize("endStep")?;
        let snapshot_interval = params.get_usize("snapshotInterval")?;

        if snapshot_interval == 0 {
            return Err(Error::InvalidParameter {
                key: "snapshotInterval".to_string(),
                value: "0".to_string(),
            });
        }

        let servo = match params.get_f64_opt("sigmaConf")? {
            Some(target_pressure) => Some(ServoConfig {
                target_pressure,
                gain: params.get_positive("servoGain")?,
                max_speed: params.get_positive("servoMaxSpeed")?,
            }),
            None => None,
        };

        Ok(Self {
            topology: params.topology()?,
            ghost_width: params.get_positive("ghostWidth")?,
            time_step,
            start_step,
            end_step,
            snapshot_interval,
            gravity: params.get_f64_opt("gravity")?.unwrap_or(0.0),
            bond_stretch_limit: params.get_positive("bondStretchLimit")?,
            bond_stiffness: params.get_positive("bondStiffness")?,
            servo,
            output_folder: params.get_path("outputFolder")?,
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) fn sample_parameters() -> Parameters {
        Parameters::from_json_str(
            r#"{
                "Xmin": 0.0, "Ymin": 0.0, "Zmin": 0.0,
                "Xmax": 1.0, "Ymax": 1.0, "Zmax": 1.0,
                "mpiProcX": 2, "mpiProcY": 1, "mpiProcZ": 1,
                "ghostWidth": 0.1,
                "timeStep": 1e-3, "minTimeStep": 1e-9, "timeStepSafety": 0.5,
                "startStep": 1, "endStep": 10, "snapshotInterval": 5,
                "bondStretchLimit": 0.5, "bondStiffness": 100.0,
                "outputFolder": "out"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn run_config_reads_every_key() {
        let config = RunConfig::from_parameters(&sample_parameters()).unwrap();
        assert_eq!(config.topology.dims(), [2, 1, 1]);
        assert_eq!(config.ghost_width, 0.1);
        assert_eq!(config.end_step, 10);
        assert_eq!(config.gravity, 0.0);
        assert!(config.servo.is_none());
        assert_eq!(config.output_folder, PathBuf::from("out"));
    }

    #[test]
    fn missing_required_key_is_reported_by_name() {
        let mut params = sample_parameters();
        params.values.remove("ghostWidth");
        match RunConfig::from_parameters(&params) {
            Err(Error::MissingParameter(key)) => assert_eq!(key, "ghostWidth"),
            other => panic!("expected a missing parameter, got {:?}", other),
        }
    }

    #[test]
    fn wrong_types_and_ranges_are_rejected() {
        let mut params = sample_parameters();
        params.insert("ghostWidth", "wide");
        assert!(matches!(
            RunConfig::from_parameters(&params),
            Err(Error::InvalidParameter { .. })
        ));

        let mut params = sample_parameters();
        params.insert("ghostWidth", -1.0);
        assert!(RunConfig::from_parameters(&params).is_err());

        let mut params = sample_parameters();
        params.insert("snapshotInterval", 0);
        assert!(RunConfig::from_parameters(&params).is_err());
    }

    #[test]
    fn servo_needs_its_gains_when_enabled() {
        let mut params = sample_parameters();
        params.insert("sigmaConf", 1e5);
        assert!(matches!(
            RunConfig::from_parameters(&params),
            Err(Error::MissingParameter(_))
        ));
        params.insert("servoGain", 1e-6);
        params.insert("servoMaxSpeed", 0.1);
        let servo = RunConfig::from_parameters(&params).unwrap().servo.unwrap();
        assert_eq!(servo.target_pressure, 1e5);
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        assert!(matches!(Parameters::from_json_str("{"), Err(Error::Decode(_))));
    }
}

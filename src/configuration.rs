use config::Config;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use tracing::*;

use crate::error::{Error, Result};

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub robot: RobotConfiguration,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl AppConfig {
    pub fn load_config(config: &Option<PathBuf>) -> anyhow::Result<Self> {
        let settings = if let Some(config) = config {
            info!("Using configuration from {:?}", config);
            Config::builder()
                .add_source(config::Environment::with_prefix("APP").separator("__"))
                .add_source(config::File::with_name(
                    config
                        .to_str()
                        .ok_or_else(|| anyhow::anyhow!("Failed to convert path"))?,
                ))
                .build()?
        } else {
            info!("Using default configuration");
            Config::builder()
                .add_source(config::Environment::with_prefix("APP").separator("__"))
                .add_source(config::File::with_name("config/settings"))
                .build()?
        };

        Ok(settings.try_deserialize()?)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub auth_key: String,
}

/// Deadlines per operation class, stored as milliseconds in configuration
/// files.
#[derive(Deserialize, Debug, Clone)]
pub struct Timeouts {
    #[serde(default = "default_discovery_ms")]
    pub discovery_ms: u64,
    #[serde(default = "default_initialize_ms")]
    pub initialize_ms: u64,
    #[serde(default = "default_command_ms")]
    pub command_ms: u64,
    #[serde(default = "default_camera_pull_ms")]
    pub camera_pull_ms: u64,
    /// Attempts per command before the send is declared failed
    #[serde(default = "default_command_attempts")]
    pub command_attempts: u32,
}

fn default_discovery_ms() -> u64 {
    2000
}

fn default_initialize_ms() -> u64 {
    5000
}

fn default_command_ms() -> u64 {
    500
}

fn default_camera_pull_ms() -> u64 {
    5000
}

fn default_command_attempts() -> u32 {
    3
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            discovery_ms: default_discovery_ms(),
            initialize_ms: default_initialize_ms(),
            command_ms: default_command_ms(),
            camera_pull_ms: default_camera_pull_ms(),
            command_attempts: default_command_attempts(),
        }
    }
}

impl Timeouts {
    pub fn discovery(&self) -> Duration {
        Duration::from_millis(self.discovery_ms)
    }

    pub fn initialize(&self) -> Duration {
        Duration::from_millis(self.initialize_ms)
    }

    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn camera_pull(&self) -> Duration {
        Duration::from_millis(self.camera_pull_ms)
    }
}

/// Immutable drivetrain geometry. Shared read-only by the drive mapper,
/// never mutated after validation.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RobotConfiguration {
    /// Body speed limit applied to every velocity component before projection
    pub max_speed: f32,
    pub actuators: Vec<ActuatorConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ActuatorConfig {
    pub id: String,
    /// Mounting position relative to the robot center, meters
    pub position: Vector2<f32>,
    /// Direction the wheel rolls in when commanded positive, degrees in the
    /// body frame
    pub roll_axis_degrees: f32,
    pub max_speed: f32,
    #[serde(default)]
    pub inverted: bool,
}

impl ActuatorConfig {
    pub fn roll_axis(&self) -> Vector2<f32> {
        let radians = self.roll_axis_degrees.to_radians();
        Vector2::new(radians.cos(), radians.sin())
    }

    pub fn sign(&self) -> f32 {
        if self.inverted {
            -1.0
        } else {
            1.0
        }
    }
}

impl RobotConfiguration {
    pub fn validate(&self) -> Result<()> {
        if self.actuators.is_empty() {
            return Err(Error::Configuration(
                "configuration contains no actuators".to_owned(),
            ));
        }
        if !self.max_speed.is_finite() || self.max_speed <= 0.0 {
            return Err(Error::Configuration(format!(
                "max_speed must be positive, got {}",
                self.max_speed
            )));
        }
        for actuator in &self.actuators {
            if !actuator.max_speed.is_finite() || actuator.max_speed <= 0.0 {
                return Err(Error::Configuration(format!(
                    "actuator {} has non-positive max_speed {}",
                    actuator.id, actuator.max_speed
                )));
            }
            if !actuator.roll_axis_degrees.is_finite() {
                return Err(Error::Configuration(format!(
                    "actuator {} has invalid roll axis",
                    actuator.id
                )));
            }
        }
        Ok(())
    }

    /// Four wheel mecanum layout matching the stock robot. Roller axes at
    /// 45 degrees, mirrored left to right.
    pub fn default_mecanum() -> Self {
        fn wheel(id: &str, x: f32, y: f32, roll_axis_degrees: f32) -> ActuatorConfig {
            ActuatorConfig {
                id: id.to_owned(),
                position: Vector2::new(x, y),
                roll_axis_degrees,
                max_speed: 100.0,
                inverted: false,
            }
        }

        Self {
            max_speed: 100.0,
            actuators: vec![
                wheel("left_front", 0.1, 0.15, 45.0),
                wheel("right_front", 0.1, -0.15, -45.0),
                wheel("left_rear", -0.1, 0.15, -45.0),
                wheel("right_rear", -0.1, -0.15, 45.0),
            ],
        }
    }
}

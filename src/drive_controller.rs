//! Public motion API.
//!
//! Semantic motion verbs reduce to one body-frame velocity triple, get
//! projected onto the actuators through the configured kinematics and go out
//! through the session's ordered dispatcher. Stop takes the priority path.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use tracing::*;

use crate::{
    camera::CameraStream,
    configuration::RobotConfiguration,
    error::Result,
    kinematics::{ActuatorCommand, BodyVelocity, RigidBodyKinematics, WheelKinematics},
    session::Session,
};

/// Closed set of motion intents. Every variant reduces to a body velocity,
/// checked at compile time instead of dispatching on method names.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionCommand {
    Straight(f32),
    Side(f32),
    Diagonal { forward: f32, side: f32 },
    Rotate(f32),
    Velocity(BodyVelocity),
    Stop,
}

impl MotionCommand {
    pub fn body_velocity(&self) -> BodyVelocity {
        match *self {
            MotionCommand::Straight(speed) => BodyVelocity::new(speed, 0.0, 0.0),
            MotionCommand::Side(speed) => BodyVelocity::new(0.0, speed, 0.0),
            MotionCommand::Diagonal { forward, side } => BodyVelocity::new(forward, side, 0.0),
            MotionCommand::Rotate(speed) => BodyVelocity::new(0.0, 0.0, speed),
            MotionCommand::Velocity(velocity) => velocity,
            MotionCommand::Stop => BodyVelocity::zero(),
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, MotionCommand::Stop)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    Idle,
    Moving,
}

pub struct DriveController {
    session: Arc<Session>,
    config: RobotConfiguration,
    kinematics: Box<dyn WheelKinematics>,
    state: Mutex<DriveState>,
    // bumped by every stop so a superseded command cannot flip the state
    // back to Moving after the stop resolved
    stop_epoch: AtomicU64,
}

impl DriveController {
    pub fn new(session: Arc<Session>, config: RobotConfiguration) -> Result<Self> {
        Self::with_kinematics(session, config, Box::new(RigidBodyKinematics))
    }

    /// Lets integrators plug a drivetrain specific wheel mixing in place of
    /// the rigid body projection.
    pub fn with_kinematics(
        session: Arc<Session>,
        config: RobotConfiguration,
        kinematics: Box<dyn WheelKinematics>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            session,
            config,
            kinematics,
            state: Mutex::new(DriveState::Idle),
            stop_epoch: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> DriveState {
        *self.state.lock().unwrap()
    }

    pub async fn straight(&self, speed: f32) -> Result<()> {
        self.submit(MotionCommand::Straight(speed)).await
    }

    pub async fn side(&self, speed: f32) -> Result<()> {
        self.submit(MotionCommand::Side(speed)).await
    }

    pub async fn diagonal(&self, forward: f32, side: f32) -> Result<()> {
        self.submit(MotionCommand::Diagonal { forward, side }).await
    }

    pub async fn rotate(&self, speed: f32) -> Result<()> {
        self.submit(MotionCommand::Rotate(speed)).await
    }

    pub async fn drive(&self, forward: f32, side: f32, angular: f32) -> Result<()> {
        self.submit(MotionCommand::Velocity(BodyVelocity::new(
            forward, side, angular,
        )))
        .await
    }

    /// Always succeeds locally; reaching the hardware is best effort even
    /// when the session is broken.
    pub async fn stop(&self) -> Result<()> {
        self.stop_epoch.fetch_add(1, Ordering::SeqCst);
        let command = ActuatorCommand::stopped(self.config.actuators.len());
        if let Err(error) = self.session.send_stop(command).await {
            warn!("Stop did not reach the controller: {}", error);
        }
        *self.state.lock().unwrap() = DriveState::Idle;
        Ok(())
    }

    /// Takes the session's camera stream. Once per session.
    pub fn camera(&self) -> Result<CameraStream> {
        self.session.camera_stream()
    }

    pub async fn submit(&self, command: MotionCommand) -> Result<()> {
        if command.is_stop() {
            return self.stop().await;
        }
        let epoch = self.stop_epoch.load(Ordering::SeqCst);
        let velocity = command.body_velocity().clamped(self.config.max_speed);
        let actuator_command = self.kinematics.project(&self.config, velocity);
        match self.session.send_command(actuator_command).await {
            Ok(()) => {
                // a stop that preempted this command resolves both callers;
                // the stop owns the final state then
                let mut state = self.state.lock().unwrap();
                if self.stop_epoch.load(Ordering::SeqCst) == epoch {
                    *state = DriveState::Moving;
                }
                Ok(())
            }
            Err(error) => {
                // the dispatcher already pushed a best effort stop
                *self.state.lock().unwrap() = DriveState::Idle;
                Err(error)
            }
        }
    }
}

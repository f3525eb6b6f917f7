use nalgebra::Vector2;

use crate::configuration::RobotConfiguration;

/// Robot relative motion intent. Forward and lateral are linear rates,
/// angular is positive counterclockwise.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BodyVelocity {
    pub forward: f32,
    pub lateral: f32,
    pub angular: f32,
}

impl BodyVelocity {
    pub fn new(forward: f32, lateral: f32, angular: f32) -> Self {
        Self {
            forward,
            lateral,
            angular,
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.forward == 0.0 && self.lateral == 0.0 && self.angular == 0.0
    }

    /// Component-wise clamp applied before projecting onto the wheels.
    pub fn clamped(&self, limit: f32) -> Self {
        Self {
            forward: self.forward.clamp(-limit, limit),
            lateral: self.lateral.clamp(-limit, limit),
            angular: self.angular.clamp(-limit, limit),
        }
    }
}

/// Per actuator target speeds, index aligned with the actuator list in
/// [`RobotConfiguration`]. Consumed once by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorCommand {
    targets: Vec<f32>,
}

impl ActuatorCommand {
    pub fn new(targets: Vec<f32>) -> Self {
        Self { targets }
    }

    pub fn stopped(actuator_count: usize) -> Self {
        Self {
            targets: vec![0.0; actuator_count],
        }
    }

    pub fn targets(&self) -> &[f32] {
        &self.targets
    }

    pub fn is_all_zero(&self) -> bool {
        self.targets.iter().all(|target| *target == 0.0)
    }
}

/// Projection from a body velocity to actuator targets. The concrete wheel
/// mixing depends entirely on the drivetrain geometry, so it is pluggable;
/// [`RigidBodyKinematics`] covers differential, omni and mecanum layouts
/// through configuration alone.
pub trait WheelKinematics: Send + Sync {
    fn project(&self, config: &RobotConfiguration, velocity: BodyVelocity) -> ActuatorCommand;
}

/// Standard rigid body projection: the velocity of the contact point at each
/// actuator position is projected onto that actuator's roll axis.
#[derive(Debug, Default)]
pub struct RigidBodyKinematics;

impl WheelKinematics for RigidBodyKinematics {
    fn project(&self, config: &RobotConfiguration, velocity: BodyVelocity) -> ActuatorCommand {
        let targets = config
            .actuators
            .iter()
            .map(|actuator| {
                // linear velocity at the wheel mount, v + omega x p
                let at_wheel = Vector2::new(
                    velocity.forward - velocity.angular * actuator.position.y,
                    velocity.lateral + velocity.angular * actuator.position.x,
                );
                let target = at_wheel.dot(&actuator.roll_axis()) * actuator.sign();
                target.clamp(-actuator.max_speed, actuator.max_speed)
            })
            .collect();
        ActuatorCommand::new(targets)
    }
}

#![doc = include_str!("../README.md")]
pub mod camera;
pub mod configuration;
mod dispatcher;
pub mod drive_controller;
pub mod error;
pub mod kinematics;
pub mod protocol;
pub mod session;
pub mod util;

//! # mocap-ctrl - Motion-capture driven quadrotor stabilization loop
//!
//! Closes the loop between a 6DOF motion-capture feed and a quadrotor's
//! attitude/thrust inputs. Provides:
//! - Frame decoding from the Y-up capture frame into a Z-up control frame
//! - Sliding-window Butterworth smoothing and short-gap extrapolation
//! - A cascaded PID bank: lateral position, heading, altitude and vertical velocity
//! - A timing-gated orchestrator that emits exactly one command per feedback frame
//!
//! ## Quick Start
//! ```no_run
//! use mocap_ctrl::{link, ControlConfig, LoopOrchestrator};
//!
//! let config = ControlConfig::from_env().unwrap();
//! let (links, peer) = link::channels(64);
//! let mut orchestrator = LoopOrchestrator::new(config, links).unwrap();
//!
//! // `peer` goes to the capture bridge, operator and actuator client.
//! let kill = orchestrator.kill_switch();
//! std::thread::spawn(move || {
//!     let _bridge = peer;
//!     std::thread::sleep(std::time::Duration::from_secs(10));
//!     kill.store(true, std::sync::atomic::Ordering::Relaxed);
//! });
//! orchestrator.run().unwrap();
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod protocol;
pub mod decoder;
pub mod filter;
pub mod history;
pub mod pid;
pub mod cascade;
pub mod link;
pub mod orchestrator;

pub use cascade::ControlCascade;
pub use config::ControlConfig;
pub use error::ControlError;
pub use history::FrameHistory;
pub use orchestrator::LoopOrchestrator;
pub use pid::{PidRp, PidV};
pub use types::*;

/// Result type alias for control-loop operations.
pub type Result<T> = std::result::Result<T, ControlError>;

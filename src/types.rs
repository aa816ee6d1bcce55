use serde::{Deserialize, Serialize};

/// Schema version stamped on every outbound command.
pub const COMMAND_VERSION: u32 = 1;

/// One motion-capture sample as it arrived on the feedback channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    /// Position [x, y, z] in meters, motion-capture frame (Y up).
    pub position: [f64; 3],
    /// Orientation quaternion [qx, qy, qz, qw].
    pub quaternion: [f64; 4],
    /// Host receive time in seconds since the link epoch.
    pub timestamp_s: f64,
    /// Whether the rigid body was tracked in this frame.
    pub detected: bool,
    /// Inter-frame delta reported by the tracker, if any.
    pub delta: Option<f64>,
}

impl RawSample {
    /// A tracked sample with identity orientation.
    pub fn tracked(position: [f64; 3], timestamp_s: f64) -> Self {
        Self {
            position,
            quaternion: [0.0, 0.0, 0.0, 1.0],
            timestamp_s,
            detected: true,
            delta: None,
        }
    }

    /// A sample where tracking was lost.
    pub fn lost(timestamp_s: f64) -> Self {
        Self {
            position: [0.0; 3],
            quaternion: [0.0, 0.0, 0.0, 1.0],
            timestamp_s,
            detected: false,
            delta: None,
        }
    }
}

/// Vehicle pose in the control frame (Z up).
///
/// Positions in meters, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
    pub roll: f64,
    pub pitch: f64,
}

impl Pose {
    /// Number of state channels carried by a pose.
    pub const DIM: usize = 6;

    /// Channel order is [x, y, z, yaw, roll, pitch].
    pub fn to_array(&self) -> [f64; Self::DIM] {
        [self.x, self.y, self.z, self.yaw, self.roll, self.pitch]
    }

    pub fn from_array(arr: &[f64; Self::DIM]) -> Self {
        Pose {
            x: arr[0],
            y: arr[1],
            z: arr[2],
            yaw: arr[3],
            roll: arr[4],
            pitch: arr[5],
        }
    }
}

/// A pose that went through the smoothing stage, stamped with its sample time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilteredPose {
    pub pose: Pose,
    pub timestamp_s: f64,
}

/// Actuator command, device units. Thrust is a percentage in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Ctrl {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub thrust: f64,
}

/// Outbound command message. Built fresh every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub version: u32,
    pub ctrl: Ctrl,
}

impl Command {
    pub fn new(roll: f64, pitch: f64, yaw: f64, thrust: f64) -> Self {
        Command {
            version: COMMAND_VERSION,
            ctrl: Ctrl {
                roll,
                pitch,
                yaw,
                thrust,
            },
        }
    }

    /// The all-zero heartbeat sent on hold, kill and shutdown.
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }

    pub fn is_zero(&self) -> bool {
        self.ctrl == Ctrl::default()
    }
}

/// Operator set-points.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SetPoints {
    /// Heading set-point in degrees.
    pub yaw: f64,
    /// Set-point for the x-position (roll) controller.
    pub roll: f64,
    /// Set-point for the y-position (pitch) controller.
    pub pitch: f64,
    /// Vertical velocity feed-forward added to the altitude loop output.
    pub velocity: f64,
}

/// Inbound set-point message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetPointMessage {
    #[serde(rename = "set-points")]
    pub set_points: SetPoints,
}

/// Per-update term breakdown of a PID controller.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PidTerms {
    #[serde(rename = "P")]
    pub p: f64,
    #[serde(rename = "I")]
    pub i: f64,
    #[serde(rename = "D")]
    pub d: f64,
    #[serde(rename = "E")]
    pub error: f64,
    #[serde(rename = "SP")]
    pub set_point: f64,
    #[serde(rename = "OUT")]
    pub output: f64,
}

/// Telemetry record pushed by a controller after each update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub name: String,
    pub data: PidTerms,
}

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No valid feedback seen yet.
    Init,
    /// Motor ramp in progress.
    WindUp,
    /// Cascade running, commands are live.
    Active,
    /// Commands zeroed, controllers reset.
    Hold,
}

bitflags::bitflags! {
    /// Why a cycle held instead of running the cascade.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HoldReason: u8 {
        /// The estimator produced no pose.
        const NO_DATA        = 1 << 0;
        /// Cycle interval outside [min_step, max_step].
        const OUT_OF_WINDOW  = 1 << 1;
        /// The feedback frame was malformed.
        const DECODE_FAILURE = 1 << 2;
        /// The motor ramp ran during this cycle.
        const WIND_UP        = 1 << 3;
        /// Kill signal observed.
        const CANCELLED      = 1 << 4;
    }
}

/// Outcome of one control cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub mode: Mode,
    /// Empty when the cycle was active.
    pub hold: HoldReason,
    pub command: Command,
}

use crate::types::{Pose, RawSample};
use nalgebra::{Quaternion, UnitQuaternion};

/// Converts motion-capture samples into control-frame poses.
///
/// The motion-capture system reports a Y-up frame. The control frame is Z-up:
///
/// ```text
/// x_ctrl =  x_mocap
/// y_ctrl = -z_mocap
/// z_ctrl =  y_mocap
/// ```
///
/// This is a proper rotation, so the quaternion vector part is remapped the
/// same way and the result is still a valid rotation.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameDecoder;

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder
    }

    /// Decode a sample into a pose.
    ///
    /// The quaternion must be finite and non-zero; `protocol::decode_frame`
    /// rejects frames that are not before they get here.
    pub fn decode(&self, sample: &RawSample) -> Pose {
        let [x, y, z] = remap_axes(sample.position);
        let [qx, qy, qz, qw] = remap_quaternion(sample.quaternion);
        let [roll, pitch, yaw] = quaternion_to_euler(qw, qx, qy, qz);
        Pose {
            x,
            y,
            z,
            yaw,
            roll,
            pitch,
        }
    }
}

/// Y-up motion-capture axes to Z-up control axes.
pub fn remap_axes(v: [f64; 3]) -> [f64; 3] {
    [v[0], -v[2], v[1]]
}

/// Apply the axis remap to a `[qx, qy, qz, qw]` quaternion.
pub fn remap_quaternion(q: [f64; 4]) -> [f64; 4] {
    let [vx, vy, vz] = remap_axes([q[0], q[1], q[2]]);
    [vx, vy, vz, q[3]]
}

/// Quaternion [w, x, y, z] to Euler angles [roll, pitch, yaw] in degrees.
///
/// Z-Y-X (yaw, then pitch, then roll) intrinsic sequence.
pub fn quaternion_to_euler(w: f64, x: f64, y: f64, z: f64) -> [f64; 3] {
    let q = UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z));
    let (roll, pitch, yaw) = q.euler_angles();
    [roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees()]
}

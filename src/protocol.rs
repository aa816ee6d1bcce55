use crate::types::{Command, RawSample, SetPointMessage, SetPoints, TelemetryRecord};
use crate::{ControlError, Result};

// -- Feedback frame geometry --
// [x, y, z, qx, qy, qz, qw, delta, detected]
pub const FRAME_LEN: usize = 9;
pub const IDX_POSITION: usize = 0;
pub const IDX_QUATERNION: usize = 3;
pub const IDX_DELTA: usize = 7;
pub const IDX_DETECTED: usize = 8;

/// Fixed token acknowledging every feedback frame.
pub const REPLY_TOKEN: &[u8] = b"Ack";

/// Quaternions shorter than this are treated as degenerate.
pub const MIN_QUAT_NORM: f64 = 1e-6;

/// Decode a flat feedback frame into a RawSample stamped with `timestamp_s`.
///
/// Frame layout:
/// - `[0..3]`: position x, y, z (meters, motion-capture frame)
/// - `[3..7]`: quaternion qx, qy, qz, qw
/// - `[7]`: inter-frame delta reported by the tracker (<= 0 or NaN = absent)
/// - `[8]`: detected flag (non-zero = tracked)
///
/// Orientation and position are only checked on tracked frames; a lost frame
/// carries whatever the tracker left in those slots.
pub fn decode_frame(frame: &[f64], timestamp_s: f64) -> Result<RawSample> {
    if frame.len() != FRAME_LEN {
        return Err(ControlError::Decode(format!(
            "expected {} values, got {}",
            FRAME_LEN,
            frame.len()
        )));
    }

    let detected_raw = frame[IDX_DETECTED];
    if !detected_raw.is_finite() {
        return Err(ControlError::Decode("detected flag is not finite".into()));
    }
    let detected = detected_raw != 0.0;

    let position = [
        frame[IDX_POSITION],
        frame[IDX_POSITION + 1],
        frame[IDX_POSITION + 2],
    ];
    let quaternion = [
        frame[IDX_QUATERNION],
        frame[IDX_QUATERNION + 1],
        frame[IDX_QUATERNION + 2],
        frame[IDX_QUATERNION + 3],
    ];

    if detected {
        if !position.iter().all(|v| v.is_finite()) {
            return Err(ControlError::Decode(format!(
                "non-finite position {:?}",
                position
            )));
        }
        if !quaternion.iter().all(|v| v.is_finite()) {
            return Err(ControlError::Decode(format!(
                "non-finite quaternion {:?}",
                quaternion
            )));
        }
        let norm = quaternion.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm < MIN_QUAT_NORM {
            return Err(ControlError::Decode("zero-norm quaternion".into()));
        }
    }

    let delta = Some(frame[IDX_DELTA]).filter(|d| d.is_finite() && *d > 0.0);

    Ok(RawSample {
        position,
        quaternion,
        timestamp_s,
        detected,
        delta,
    })
}

/// Encode a RawSample back into the flat frame layout.
pub fn encode_frame(sample: &RawSample) -> Vec<f64> {
    let mut frame = Vec::with_capacity(FRAME_LEN);
    frame.extend_from_slice(&sample.position);
    frame.extend_from_slice(&sample.quaternion);
    frame.push(sample.delta.unwrap_or(0.0));
    frame.push(if sample.detected { 1.0 } else { 0.0 });
    frame
}

/// Parse a `{"set-points": {...}}` message.
pub fn parse_set_points(text: &str) -> Result<SetPoints> {
    let msg: SetPointMessage = serde_json::from_str(text)?;
    let sp = msg.set_points;
    if ![sp.yaw, sp.roll, sp.pitch, sp.velocity]
        .iter()
        .all(|v| v.is_finite())
    {
        return Err(ControlError::Decode(format!("non-finite set-point {:?}", sp)));
    }
    Ok(sp)
}

/// Encode a set-point message, the counterpart of `parse_set_points`.
pub fn encode_set_points(set_points: &SetPoints) -> String {
    let msg = SetPointMessage {
        set_points: *set_points,
    };
    serde_json::to_string(&msg).unwrap_or_default()
}

/// Encode a command as `{"version":1,"ctrl":{"roll","pitch","yaw","thrust"}}`.
pub fn encode_command(command: &Command) -> String {
    serde_json::to_string(command).unwrap_or_default()
}

/// Encode a telemetry record as `{"name":..,"data":{"P","I","D","E","SP","OUT"}}`.
pub fn encode_telemetry(record: &TelemetryRecord) -> String {
    serde_json::to_string(record).unwrap_or_default()
}

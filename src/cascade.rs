use crate::config::ControlConfig;
use crate::pid::{PidRp, PidV};
use crate::types::{Pose, SetPoints};
use crate::Result;
use crossbeam_channel::Sender;
use std::time::Instant;

/// Normalize an angle in degrees into [-180, 180).
pub fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = (angle + 540.0).rem_euclid(360.0) - 180.0;
    // rem_euclid can round up to exactly 360 for tiny negative remainders.
    if wrapped >= 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

/// Altitude-loop memory carried between active cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AltitudeMemory {
    pub prev_z: Option<f64>,
    pub prev_vz: f64,
    pub prev_t: Option<Instant>,
}

impl AltitudeMemory {
    pub fn clear(&mut self) {
        *self = AltitudeMemory::default();
    }
}

/// Shaped cascade outputs for one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawOutputs {
    /// Heading-corrected roll command.
    pub roll: f64,
    /// Heading-corrected pitch command.
    pub pitch: f64,
    /// Yaw command clamped to ±yaw_cap.
    pub yaw: f64,
    /// Thrust in percent.
    pub thrust: f64,
    /// Vertical velocity requested by the altitude loop (m/s).
    pub velocity_cmd: f64,
    /// Measured vertical velocity (m/s).
    pub vertical_speed: f64,
}

/// The controller bank and the way it is chained.
///
/// ```text
/// x ──► roll PID ──┐
///                  ├─► heading correction ─► roll, pitch
/// y ──► pitch PID ─┘
/// wrap(yaw − yaw_sp) ─► yaw PID ─► clamp ±yaw_cap ─► yaw
/// z ──► position PID ─► clamp ±velocity_cap ─► velocity PID set-point
/// ż ──► velocity PID ─► + hover_bias ─► clamp ─► ×100 ─► thrust
/// ```
#[derive(Debug)]
pub struct ControlCascade {
    roll: PidRp,
    pitch: PidRp,
    yaw: PidRp,
    position: PidRp,
    velocity: PidV,
    yaw_cap: f64,
    velocity_cap: f64,
    min_thrust_frac: f64,
    max_thrust_frac: f64,
    hover_bias: f64,
    nominal_dt: f64,
}

impl ControlCascade {
    /// Build every controller from `config`. When `telemetry` is given each
    /// controller publishes its terms on it.
    pub fn new(
        config: &ControlConfig,
        telemetry: Option<Sender<String>>,
    ) -> Result<ControlCascade> {
        let dt = config.nominal_dt_s;
        let mut roll = PidRp::new("roll", &config.roll, dt)?;
        let mut pitch = PidRp::new("pitch", &config.pitch, dt)?;
        let mut yaw = PidRp::new("yaw", &config.yaw, dt)?;
        let mut position = PidRp::new("position", &config.position, dt)?;
        let mut velocity = PidV::new("velocity", &config.velocity, dt)?;

        if let Some(tx) = telemetry {
            roll = roll.with_telemetry(tx.clone());
            pitch = pitch.with_telemetry(tx.clone());
            yaw = yaw.with_telemetry(tx.clone());
            position = position.with_telemetry(tx.clone());
            velocity = velocity.with_telemetry(tx);
        }

        Ok(ControlCascade {
            roll,
            pitch,
            yaw,
            position,
            velocity,
            yaw_cap: config.yaw_cap,
            velocity_cap: config.velocity_cap,
            min_thrust_frac: config.min_thrust_frac,
            max_thrust_frac: config.max_thrust_frac,
            hover_bias: config.hover_bias,
            nominal_dt: config.nominal_dt_s,
        })
    }

    /// Push operator set-points into the lateral controllers.
    pub fn apply_set_points(&mut self, set_points: &SetPoints) {
        self.roll.set_set_point(set_points.roll);
        self.pitch.set_set_point(set_points.pitch);
    }

    /// Run every controller once against `pose`.
    pub fn step(
        &mut self,
        pose: &Pose,
        set_points: &SetPoints,
        altitude: &mut AltitudeMemory,
        now: Instant,
    ) -> RawOutputs {
        // Attitude
        let roll_sp = self.roll.update_at(pose.x, now);
        let pitch_sp = self.pitch.update_at(pose.y, now);
        let yaw_out = self
            .yaw
            .update_at(wrap_degrees(pose.yaw - set_points.yaw), now);

        // Altitude -> velocity -> thrust
        let velocity_cmd = (self.position.update_at(pose.z, now) + set_points.velocity)
            .clamp(-self.velocity_cap, self.velocity_cap);
        self.velocity.set_set_point(velocity_cmd);

        let dt = match altitude.prev_t {
            Some(prev) => {
                let dt = now.saturating_duration_since(prev).as_secs_f64();
                if dt > 0.0 {
                    dt
                } else {
                    self.nominal_dt
                }
            }
            None => self.nominal_dt,
        };
        let vertical_speed = match altitude.prev_z {
            Some(prev_z) => (pose.z - prev_z) / dt,
            None => 0.0,
        };
        let thrust_raw = self.velocity.update_at(vertical_speed, now) + self.hover_bias;

        altitude.prev_z = Some(pose.z);
        altitude.prev_vz = vertical_speed;
        altitude.prev_t = Some(now);

        // Output shaping
        let thrust = thrust_raw.clamp(self.min_thrust_frac, self.max_thrust_frac) * 100.0;
        let yaw = yaw_out.clamp(-self.yaw_cap, self.yaw_cap);

        // Rotate the world-frame lateral demand into the body frame.
        let (sin, cos) = (-pose.yaw.to_radians()).sin_cos();
        let roll = pitch_sp * sin + roll_sp * cos;
        let pitch = pitch_sp * cos - roll_sp * sin;

        log::debug!(
            "Cascade: roll={:.2} pitch={:.2} yaw={:.2} thrust={:.2} vz_cmd={:.3} vz={:.3} dt={:.4}",
            roll,
            pitch,
            yaw,
            thrust,
            velocity_cmd,
            vertical_speed,
            dt
        );

        RawOutputs {
            roll,
            pitch,
            yaw,
            thrust,
            velocity_cmd,
            vertical_speed,
        }
    }

    /// Zero every integrator and difference history.
    pub fn reset(&mut self) {
        self.roll.reset();
        self.pitch.reset();
        self.yaw.reset();
        self.position.reset();
        self.velocity.reset();
    }

    /// Re-prime every controller's timestamp.
    pub fn reset_dt_at(&mut self, now: Instant) {
        self.roll.reset_dt_at(now);
        self.pitch.reset_dt_at(now);
        self.yaw.reset_dt_at(now);
        self.position.reset_dt_at(now);
        self.velocity.reset_dt_at(now);
    }

    /// The accumulate-and-clamp controllers: roll, pitch, yaw, position.
    pub fn rp_controllers(&self) -> [&PidRp; 4] {
        [&self.roll, &self.pitch, &self.yaw, &self.position]
    }

    pub fn roll(&self) -> &PidRp {
        &self.roll
    }

    pub fn pitch(&self) -> &PidRp {
        &self.pitch
    }

    pub fn yaw(&self) -> &PidRp {
        &self.yaw
    }

    pub fn position(&self) -> &PidRp {
        &self.position
    }

    pub fn velocity(&self) -> &PidV {
        &self.velocity
    }

    /// True when no controller carries integrator or difference history.
    pub fn is_reset(&self) -> bool {
        self.rp_controllers()
            .iter()
            .all(|pid| pid.integrator() == 0.0 && pid.last_error() == 0.0)
            && self.velocity.history() == (0.0, 0.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpGains;
    use std::time::Duration;

    fn cascade() -> ControlCascade {
        ControlCascade::new(&ControlConfig::default(), None).unwrap()
    }

    #[test]
    fn test_wrap_range() {
        let mut angle = -1000.0;
        while angle <= 1000.0 {
            let mut sp = -1000.0;
            while sp <= 1000.0 {
                let w = wrap_degrees(angle - sp);
                assert!((-180.0..180.0).contains(&w), "wrap({}) = {}", angle - sp, w);
                sp += 7.25;
            }
            angle += 3.5;
        }
        assert_eq!(wrap_degrees(180.0), -180.0);
        assert_eq!(wrap_degrees(-180.0), -180.0);
        assert_eq!(wrap_degrees(190.0), -170.0);
        assert_eq!(wrap_degrees(540.0), -180.0);
    }

    #[test]
    fn test_worked_hover_example() {
        let mut cascade = cascade();
        let mut altitude = AltitudeMemory::default();
        let pose = Pose {
            z: 0.5,
            ..Pose::default()
        };
        let out = cascade.step(&pose, &SetPoints::default(), &mut altitude, Instant::now());
        assert_eq!(out.velocity_cmd, 0.0);
        assert_eq!(out.vertical_speed, 0.0);
        assert_eq!(out.thrust, 50.0);
        assert_eq!(out.roll, 0.0);
        assert_eq!(out.pitch, 0.0);
        assert_eq!(out.yaw, 0.0);
        assert_eq!(altitude.prev_z, Some(0.5));
    }

    #[test]
    fn test_thrust_is_clamped() {
        let mut cascade = cascade();
        let mut altitude = AltitudeMemory::default();
        let start = Instant::now();

        // Far below the altitude set-point: thrust saturates high.
        let low = Pose {
            z: -50.0,
            ..Pose::default()
        };
        for k in 0..20 {
            let now = start + Duration::from_millis(8 * k);
            let out = cascade.step(&low, &SetPoints::default(), &mut altitude, now);
            assert!(out.thrust <= 80.0 + 1e-9);
            assert!(out.thrust >= 40.0 - 1e-9);
            assert!(out.velocity_cmd.abs() <= 10.0);
        }

        let mut cascade = self::cascade();
        let mut altitude = AltitudeMemory::default();
        let high = Pose {
            z: 50.0,
            ..Pose::default()
        };
        let out = cascade.step(&high, &SetPoints::default(), &mut altitude, start);
        assert!(out.thrust >= 40.0 - 1e-9);
        assert_eq!(out.velocity_cmd, -10.0);
    }

    #[test]
    fn test_yaw_is_capped_and_wrapped() {
        let mut config = ControlConfig::default();
        config.yaw = RpGains::new(5.0, 0.0, 0.0);
        let mut cascade = ControlCascade::new(&config, None).unwrap();
        let mut altitude = AltitudeMemory::default();

        // 170 - (-170) = 340 wraps to -20: the short way round.
        let pose = Pose {
            yaw: 170.0,
            z: 0.5,
            ..Pose::default()
        };
        let sp = SetPoints {
            yaw: -170.0,
            ..SetPoints::default()
        };
        let out = cascade.step(&pose, &sp, &mut altitude, Instant::now());
        assert!((out.yaw - 100.0).abs() < 1e-9);

        config.yaw = RpGains::new(50.0, 0.0, 0.0);
        let mut cascade = ControlCascade::new(&config, None).unwrap();
        let pose = Pose {
            yaw: 90.0,
            z: 0.5,
            ..Pose::default()
        };
        let out = cascade.step(&pose, &SetPoints::default(), &mut altitude, Instant::now());
        assert_eq!(out.yaw, -200.0);
    }

    #[test]
    fn test_heading_correction_rotates_lateral_demand() {
        let mut config = ControlConfig::default();
        config.roll = RpGains::new(1.0, 0.0, 0.0);
        config.pitch = RpGains::new(1.0, 0.0, 0.0);
        config.yaw = RpGains::new(0.0, 0.0, 0.0);
        let mut cascade = ControlCascade::new(&config, None).unwrap();
        let mut altitude = AltitudeMemory::default();

        // x error of +1 only, vehicle turned 90 degrees.
        let pose = Pose {
            x: -1.0,
            yaw: 90.0,
            z: 0.5,
            ..Pose::default()
        };
        let now = Instant::now();
        let out = cascade.step(&pose, &SetPoints::default(), &mut altitude, now);
        // roll_sp = 1, pitch_sp = 0: roll_corr = cos(-90°) ≈ 0, pitch_corr = -sin(-90°) = 1.
        assert!(out.roll.abs() < 1e-9);
        assert!((out.pitch - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_vertical_speed_from_altitude_memory() {
        let mut cascade = cascade();
        let mut altitude = AltitudeMemory::default();
        let start = Instant::now();
        let sp = SetPoints::default();
        let at = |z: f64| Pose {
            z,
            ..Pose::default()
        };
        cascade.step(&at(0.5), &sp, &mut altitude, start);
        let out = cascade.step(
            &at(0.51),
            &sp,
            &mut altitude,
            start + Duration::from_millis(10),
        );
        assert!((out.vertical_speed - 1.0).abs() < 1e-9);
        assert!((altitude.prev_vz - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_points_and_reset() {
        let mut cascade = cascade();
        cascade.apply_set_points(&SetPoints {
            roll: 0.3,
            pitch: -0.2,
            ..SetPoints::default()
        });
        assert_eq!(cascade.roll().set_point(), 0.3);
        assert_eq!(cascade.pitch().set_point(), -0.2);

        let mut altitude = AltitudeMemory::default();
        let start = Instant::now();
        let pose = Pose {
            z: 0.2,
            ..Pose::default()
        };
        for k in 0..5 {
            let now = start + Duration::from_millis(8 * k);
            cascade.step(&pose, &SetPoints::default(), &mut altitude, now);
        }
        assert!(!cascade.is_reset());
        cascade.reset();
        assert!(cascade.is_reset());
    }
}

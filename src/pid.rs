use crate::config::{check_rp, check_v, RpGains, VGains};
use crate::protocol;
use crate::types::{PidTerms, TelemetryRecord};
use crate::{ControlError, Result};
use crossbeam_channel::{Sender, TrySendError};
use std::time::Instant;

/// Seconds elapsed since `prev`, or `nominal` when there is no usable interval.
fn step_dt(prev: Option<Instant>, now: Instant, nominal: f64) -> f64 {
    match prev {
        Some(prev) => {
            let dt = now.saturating_duration_since(prev).as_secs_f64();
            if dt.is_finite() && dt > 0.0 {
                dt
            } else {
                nominal
            }
        }
        None => nominal,
    }
}

fn clamp_opt(value: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    let value = match max {
        Some(max) if value > max => max,
        _ => value,
    };
    match min {
        Some(min) if value < min => min,
        _ => value,
    }
}

/// Best-effort telemetry push. Never blocks; a full channel drops the record,
/// a closed channel detaches the sink.
fn publish(slot: &mut Option<Sender<String>>, name: &str, terms: PidTerms) {
    let Some(sender) = slot.as_ref() else {
        return;
    };
    let record = TelemetryRecord {
        name: name.to_string(),
        data: terms,
    };
    match sender.try_send(protocol::encode_telemetry(&record)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            log::trace!("{}: telemetry channel full, dropping record", name);
        }
        Err(TrySendError::Disconnected(_)) => {
            log::info!("{}: telemetry channel disconnected, detaching", name);
            *slot = None;
        }
    }
}

/// Accumulate-and-clamp PID.
///
/// The integrator sums raw error (not error·dt) and is clamped after every
/// accumulation; its output contribution is `integrator · ki · dt`.
#[derive(Debug)]
pub struct PidRp {
    name: String,
    kp: f64,
    ki: f64,
    kd: f64,
    set_point: f64,
    set_point_min: Option<f64>,
    set_point_max: Option<f64>,
    integrator: f64,
    integrator_min: f64,
    integrator_max: f64,
    last_error: f64,
    last_value: f64,
    prev_t: Option<Instant>,
    nominal_dt: f64,
    terms: PidTerms,
    telemetry: Option<Sender<String>>,
}

impl PidRp {
    pub fn new(name: &str, gains: &RpGains, nominal_dt: f64) -> Result<PidRp> {
        check_rp(name, gains)?;
        if !(nominal_dt.is_finite() && nominal_dt > 0.0) {
            return Err(ControlError::Config(format!(
                "{}: nominal dt must be positive",
                name
            )));
        }
        let mut pid = PidRp {
            name: name.to_string(),
            kp: gains.kp,
            ki: gains.ki,
            kd: gains.kd,
            set_point: 0.0,
            set_point_min: gains.set_point_min,
            set_point_max: gains.set_point_max,
            integrator: 0.0,
            integrator_min: gains.integrator_min,
            integrator_max: gains.integrator_max,
            last_error: 0.0,
            last_value: 0.0,
            prev_t: None,
            nominal_dt,
            terms: PidTerms::default(),
            telemetry: None,
        };
        pid.set_set_point(gains.set_point);
        Ok(pid)
    }

    /// Publish a telemetry record on every update.
    pub fn with_telemetry(mut self, sender: Sender<String>) -> Self {
        self.telemetry = Some(sender);
        self
    }

    /// Update against the wall clock.
    pub fn update(&mut self, measurement: f64) -> f64 {
        self.update_at(measurement, Instant::now())
    }

    /// Update with an explicit time of measurement.
    pub fn update_at(&mut self, measurement: f64, now: Instant) -> f64 {
        let dt = step_dt(self.prev_t, now, self.nominal_dt);
        self.prev_t = Some(now);

        let error = self.set_point - measurement;
        let p = self.kp * error;
        let i = self.integrator * self.ki * dt;
        let d = self.kd * (error - self.last_error) / dt;

        self.integrator = (self.integrator + error).clamp(self.integrator_min, self.integrator_max);
        self.last_error = error;
        self.last_value = measurement;

        let output = p + i + d;
        self.terms = PidTerms {
            p,
            i,
            d,
            error,
            set_point: self.set_point,
            output,
        };
        publish(&mut self.telemetry, &self.name, self.terms);
        output
    }

    /// Re-prime the timestamp without touching the integrator, so the next
    /// update does not see the gap as one long step.
    pub fn reset_dt(&mut self) {
        self.reset_dt_at(Instant::now());
    }

    pub fn reset_dt_at(&mut self, now: Instant) {
        self.prev_t = Some(now);
    }

    /// Zero the integrator and the derivative history.
    pub fn reset(&mut self) {
        self.integrator = 0.0;
        self.last_error = 0.0;
        self.last_value = 0.0;
        self.terms = PidTerms::default();
    }

    pub fn set_set_point(&mut self, set_point: f64) {
        self.set_point = clamp_opt(set_point, self.set_point_min, self.set_point_max);
    }

    /// Retune in place. Integrator and history are kept.
    pub fn set_gains(&mut self, kp: f64, ki: f64, kd: f64) -> Result<()> {
        let gains = RpGains {
            kp,
            ki,
            kd,
            integrator_min: self.integrator_min,
            integrator_max: self.integrator_max,
            set_point: self.set_point,
            set_point_min: self.set_point_min,
            set_point_max: self.set_point_max,
        };
        check_rp(&self.name, &gains)?;
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_point(&self) -> f64 {
        self.set_point
    }

    pub fn integrator(&self) -> f64 {
        self.integrator
    }

    pub fn last_error(&self) -> f64 {
        self.last_error
    }

    pub fn last_value(&self) -> f64 {
        self.last_value
    }

    /// Term breakdown of the most recent update.
    pub fn terms(&self) -> PidTerms {
        self.terms
    }
}

/// Difference-equation ("velocity algorithm") PID.
///
/// ```text
/// u = u1 + kp·[(1 + dt/Ti + Td/dt)·e − (1 + 2·Td/dt)·e1 + Td·e2/dt]
/// ```
///
/// with `Ti = kp/ki` and `Td = kd/kp`. The saturated output is what feeds
/// back as `u1`.
#[derive(Debug)]
pub struct PidV {
    name: String,
    kp: f64,
    ki: f64,
    kd: f64,
    ti: f64,
    td: f64,
    set_point: f64,
    set_point_min: Option<f64>,
    set_point_max: Option<f64>,
    saturate_min: Option<f64>,
    saturate_max: Option<f64>,
    u1: f64,
    e1: f64,
    e2: f64,
    prev_t: Option<Instant>,
    nominal_dt: f64,
    terms: PidTerms,
    telemetry: Option<Sender<String>>,
}

fn time_constants(name: &str, kp: f64, ki: f64, kd: f64) -> Result<(f64, f64)> {
    if kp == 0.0 || ki == 0.0 || !(kp.is_finite() && ki.is_finite() && kd.is_finite()) {
        return Err(ControlError::Config(format!(
            "{}: velocity-form PID needs finite, non-zero kp and ki (kp={}, ki={})",
            name, kp, ki
        )));
    }
    Ok((kp / ki, kd / kp))
}

impl PidV {
    pub fn new(name: &str, gains: &VGains, nominal_dt: f64) -> Result<PidV> {
        check_v(name, gains)?;
        if !(nominal_dt.is_finite() && nominal_dt > 0.0) {
            return Err(ControlError::Config(format!(
                "{}: nominal dt must be positive",
                name
            )));
        }
        let (ti, td) = time_constants(name, gains.kp, gains.ki, gains.kd)?;
        let mut pid = PidV {
            name: name.to_string(),
            kp: gains.kp,
            ki: gains.ki,
            kd: gains.kd,
            ti,
            td,
            set_point: 0.0,
            set_point_min: gains.set_point_min,
            set_point_max: gains.set_point_max,
            saturate_min: gains.saturate_min,
            saturate_max: gains.saturate_max,
            u1: 0.0,
            e1: 0.0,
            e2: 0.0,
            prev_t: None,
            nominal_dt,
            terms: PidTerms::default(),
            telemetry: None,
        };
        pid.set_set_point(gains.set_point);
        Ok(pid)
    }

    pub fn with_telemetry(mut self, sender: Sender<String>) -> Self {
        self.telemetry = Some(sender);
        self
    }

    pub fn update(&mut self, measurement: f64) -> f64 {
        self.update_at(measurement, Instant::now())
    }

    pub fn update_at(&mut self, measurement: f64, now: Instant) -> f64 {
        let dt = step_dt(self.prev_t, now, self.nominal_dt);
        self.prev_t = Some(now);

        let e = self.set_point - measurement;
        let (e1, e2, td) = (self.e1, self.e2, self.td);

        let delta = self.kp
            * ((1.0 + dt / self.ti + td / dt) * e - (1.0 + 2.0 * td / dt) * e1 + (td * e2) / dt);
        let u = clamp_opt(self.u1 + delta, self.saturate_min, self.saturate_max);

        self.e2 = e1;
        self.e1 = e;
        self.u1 = u;

        self.terms = PidTerms {
            p: self.kp * (e - e1),
            i: self.kp * dt / self.ti * e,
            d: self.kp * td / dt * (e - 2.0 * e1 + e2),
            error: e,
            set_point: self.set_point,
            output: u,
        };
        publish(&mut self.telemetry, &self.name, self.terms);
        u
    }

    pub fn reset_dt(&mut self) {
        self.reset_dt_at(Instant::now());
    }

    pub fn reset_dt_at(&mut self, now: Instant) {
        self.prev_t = Some(now);
    }

    /// Zero the output and error history.
    pub fn reset(&mut self) {
        self.u1 = 0.0;
        self.e1 = 0.0;
        self.e2 = 0.0;
        self.terms = PidTerms::default();
    }

    pub fn set_set_point(&mut self, set_point: f64) {
        self.set_point = clamp_opt(set_point, self.set_point_min, self.set_point_max);
    }

    pub fn set_kp(&mut self, kp: f64) -> Result<()> {
        let (ti, td) = time_constants(&self.name, kp, self.ki, self.kd)?;
        self.kp = kp;
        self.ti = ti;
        self.td = td;
        Ok(())
    }

    pub fn set_ki(&mut self, ki: f64) -> Result<()> {
        let (ti, td) = time_constants(&self.name, self.kp, ki, self.kd)?;
        self.ki = ki;
        self.ti = ti;
        self.td = td;
        Ok(())
    }

    pub fn set_kd(&mut self, kd: f64) -> Result<()> {
        let (ti, td) = time_constants(&self.name, self.kp, self.ki, kd)?;
        self.kd = kd;
        self.ti = ti;
        self.td = td;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_point(&self) -> f64 {
        self.set_point
    }

    /// Integral time constant `kp/ki`.
    pub fn ti(&self) -> f64 {
        self.ti
    }

    /// Derivative time constant `kd/kp`.
    pub fn td(&self) -> f64 {
        self.td
    }

    /// `(u1, e1, e2)`.
    pub fn history(&self) -> (f64, f64, f64) {
        (self.u1, self.e1, self.e2)
    }

    pub fn terms(&self) -> PidTerms {
        self.terms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const DT: f64 = 8e-3;

    fn rp(kp: f64, ki: f64, kd: f64) -> PidRp {
        let gains = RpGains::new(kp, ki, kd).with_integrator_limits(-5.0, 5.0);
        PidRp::new("test", &gains, DT).unwrap()
    }

    fn ticks(start: Instant, n: usize) -> impl Iterator<Item = Instant> {
        (1..=n).map(move |k| start + Duration::from_secs_f64(DT * k as f64))
    }

    #[test]
    fn test_zero_error_first_update_is_exactly_zero() {
        let gains = RpGains::new(35.0, 0.3, 8.0).with_set_point(0.5);
        let mut pid = PidRp::new("roll", &gains, DT).unwrap();
        assert_eq!(pid.update(0.5), 0.0);
        let terms = pid.terms();
        assert_eq!((terms.p, terms.i, terms.d), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_integrator_clamps_under_sustained_error() {
        let (kp, ki, kd) = (35.0, 0.3, 8.0);
        let mut pid = rp(kp, ki, kd);
        pid.set_set_point(1.0);

        let start = Instant::now();
        let mut last = 0.0;
        for now in ticks(start, 1000) {
            last = pid.update_at(0.0, now);
            assert!(pid.integrator() <= 5.0);
        }
        assert_eq!(pid.integrator(), 5.0);
        // Constant error: no derivative, integrator pinned at its maximum.
        let bound = kp * 1.0 + 5.0 * ki * DT;
        assert!(last <= bound + 1e-9, "output {} exceeds {}", last, bound);

        pid.set_set_point(-1.0);
        for now in ticks(start + Duration::from_secs(10), 1000) {
            pid.update_at(0.0, now);
            assert!(pid.integrator() >= -5.0);
        }
        assert_eq!(pid.integrator(), -5.0);
    }

    #[test]
    fn test_integral_term_uses_previous_accumulator() {
        let mut pid = rp(0.0, 1.0, 0.0);
        pid.set_set_point(1.0);
        let start = Instant::now();
        pid.reset_dt_at(start);

        // First call: accumulator was 0 going in.
        let out = pid.update_at(0.0, start + Duration::from_millis(10));
        assert_eq!(out, 0.0);
        assert_eq!(pid.integrator(), 1.0);

        let out = pid.update_at(0.0, start + Duration::from_millis(20));
        assert!((out - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_zero_dt_falls_back_to_nominal() {
        let mut pid = rp(0.0, 0.0, 1.0);
        let now = Instant::now();
        pid.reset_dt_at(now);
        pid.set_set_point(1.0);
        let out = pid.update_at(0.0, now);
        assert!(out.is_finite());
        assert!((out - 1.0 / DT).abs() < 1e-9);
    }

    #[test]
    fn test_reset_dt_keeps_integrator() {
        let mut pid = rp(1.0, 1.0, 0.0);
        pid.set_set_point(1.0);
        let start = Instant::now();
        for now in ticks(start, 3) {
            pid.update_at(0.0, now);
        }
        pid.reset_dt_at(start + Duration::from_secs(5));
        assert_eq!(pid.integrator(), 3.0);

        pid.reset();
        assert_eq!(pid.integrator(), 0.0);
        assert_eq!(pid.last_error(), 0.0);
    }

    #[test]
    fn test_set_point_bounds() {
        let mut gains = RpGains::new(1.0, 0.0, 0.0);
        gains.set_point_min = Some(-1.0);
        gains.set_point_max = Some(2.0);
        let mut pid = PidRp::new("bounded", &gains, DT).unwrap();
        pid.set_set_point(10.0);
        assert_eq!(pid.set_point(), 2.0);
        pid.set_set_point(-10.0);
        assert_eq!(pid.set_point(), -1.0);
    }

    #[test]
    fn test_telemetry_is_best_effort() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let mut pid = rp(1.0, 0.0, 0.0).with_telemetry(tx);
        pid.set_set_point(1.0);

        // Second and third records hit a full channel and are dropped.
        pid.update(0.0);
        pid.update(0.5);
        pid.update(0.75);
        assert_eq!(rx.len(), 1);

        let record: TelemetryRecord = serde_json::from_str(&rx.recv().unwrap()).unwrap();
        assert_eq!(record.name, "test");
        assert_eq!(record.data.error, 1.0);
        assert_eq!(record.data.set_point, 1.0);

        drop(rx);
        pid.update(0.0);
        assert!(pid.telemetry.is_none());
    }

    #[test]
    fn test_velocity_form_rejects_zero_ki() {
        let gains = VGains::new(0.25, 0.0, 0.1);
        assert!(matches!(
            PidV::new("velocity", &gains, DT),
            Err(ControlError::Config(_))
        ));

        let mut pid = PidV::new("velocity", &VGains::new(0.25, 0.1, 0.1), DT).unwrap();
        assert!(pid.set_kp(0.0).is_err());
        assert_eq!(pid.ti(), 0.25 / 0.1);
    }

    #[test]
    fn test_velocity_form_recurrence() {
        let (kp, ki, kd) = (2.0, 0.5, 0.1);
        let mut pid = PidV::new("v", &VGains::new(kp, ki, kd), DT).unwrap();
        pid.set_set_point(1.0);
        let (ti, td) = (kp / ki, kd / kp);

        let start = Instant::now();
        pid.reset_dt_at(start);
        let mut expected_u = 0.0;
        let (mut e1, mut e2) = (0.0, 0.0);
        for (k, now) in ticks(start, 5).enumerate() {
            let measurement = 0.1 * k as f64;
            let e = 1.0 - measurement;
            expected_u += kp
                * ((1.0 + DT / ti + td / DT) * e - (1.0 + 2.0 * td / DT) * e1 + td * e2 / DT);
            e2 = e1;
            e1 = e;
            let u = pid.update_at(measurement, now);
            assert!((u - expected_u).abs() < 1e-9);
        }
    }

    #[test]
    fn test_velocity_form_zero_dt_is_finite() {
        let mut pid = PidV::new("v", &VGains::new(0.25, 1e-10, 1e-10), DT).unwrap();
        let now = Instant::now();
        pid.reset_dt_at(now);
        pid.set_set_point(1.0);
        assert!(pid.update_at(0.0, now).is_finite());
    }

    #[test]
    fn test_velocity_form_saturation_feeds_back() {
        let mut gains = VGains::new(1.0, 1.0, 0.0);
        gains.saturate_max = Some(0.5);
        gains.saturate_min = Some(-0.5);
        let mut pid = PidV::new("v", &gains, DT).unwrap();
        pid.set_set_point(10.0);

        let start = Instant::now();
        for now in ticks(start, 50) {
            assert!(pid.update_at(0.0, now) <= 0.5);
        }
        assert_eq!(pid.history().0, 0.5);

        pid.reset();
        assert_eq!(pid.history(), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_set_gains_rejects_non_finite() {
        let mut pid = rp(1.0, 0.0, 0.0);
        pid.set_set_point(1.0);
        assert!(matches!(
            pid.set_gains(f64::NAN, 0.0, 0.0),
            Err(ControlError::Config(_))
        ));
        assert!(pid.set_gains(1.0, f64::INFINITY, 0.0).is_err());
        assert_eq!(pid.update(0.0), 1.0);

        pid.set_gains(2.0, 0.0, 0.0).unwrap();
        pid.reset();
        assert_eq!(pid.update(0.0), 2.0);
    }
}

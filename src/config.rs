use crate::{ControlError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Prefix for every environment override.
pub const ENV_PREFIX: &str = "MOCAP_CTRL_";

/// Upper bound on wind-up ramp steps.
pub const MAX_WIND_UP_STEPS: usize = 100_000;

/// Upper bound on the time the wind-up ramp may block the loop.
pub const MAX_WIND_UP_DURATION: Duration = Duration::from_secs(60);

/// Gains and limits for an accumulate-and-clamp controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RpGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integrator_min: f64,
    pub integrator_max: f64,
    pub set_point: f64,
    #[serde(default)]
    pub set_point_min: Option<f64>,
    #[serde(default)]
    pub set_point_max: Option<f64>,
}

impl RpGains {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            integrator_min: -20000.0,
            integrator_max: 20000.0,
            set_point: 0.0,
            set_point_min: None,
            set_point_max: None,
        }
    }

    pub fn with_integrator_limits(mut self, min: f64, max: f64) -> Self {
        self.integrator_min = min;
        self.integrator_max = max;
        self
    }

    pub fn with_set_point(mut self, set_point: f64) -> Self {
        self.set_point = set_point;
        self
    }
}

/// Gains and limits for a difference-equation controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub set_point: f64,
    #[serde(default)]
    pub set_point_min: Option<f64>,
    #[serde(default)]
    pub set_point_max: Option<f64>,
    #[serde(default)]
    pub saturate_min: Option<f64>,
    #[serde(default)]
    pub saturate_max: Option<f64>,
}

impl VGains {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            set_point: 0.0,
            set_point_min: None,
            set_point_max: None,
            saturate_min: None,
            saturate_max: None,
        }
    }
}

/// Butterworth low-pass parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub cutoff_hz: f64,
    pub sample_rate_hz: f64,
    pub order: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            cutoff_hz: 10.0,
            sample_rate_hz: 120.0,
            order: 4,
        }
    }
}

/// Frame history / estimator parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Run the low-pass stage. When off, poses pass through unchanged.
    pub filtering: bool,
    /// Predict poses across tracking loss. Off: a lost frame holds the loop.
    pub extrapolating: bool,
    /// Consecutive undetected frames that may be bridged by extrapolation.
    pub extrapolation_max: u32,
    /// Sliding window length, also the filter's warm-up length.
    pub buffer_capacity: usize,
    pub filter: FilterConfig,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            filtering: true,
            extrapolating: false,
            extrapolation_max: 5,
            buffer_capacity: 100,
            filter: FilterConfig::default(),
        }
    }
}

/// Startup motor ramp, thrust in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindUpConfig {
    pub enabled: bool,
    pub start_thrust: f64,
    pub end_thrust: f64,
    pub increment: f64,
    pub interval_ms: u64,
}

impl Default for WindUpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_thrust: 25.0,
            end_thrust: 45.0,
            increment: 0.01,
            interval_ms: 10,
        }
    }
}

impl WindUpConfig {
    /// Thrust values of every ramp step, strictly increasing, `end_thrust` excluded.
    pub fn ramp(&self) -> Vec<f64> {
        if !self.enabled || self.increment <= 0.0 || self.start_thrust >= self.end_thrust {
            return Vec::new();
        }
        let steps = (self.step_count() as usize).min(MAX_WIND_UP_STEPS);
        (0..steps)
            .map(|i| self.start_thrust + i as f64 * self.increment)
            .collect()
    }

    /// Number of ramp steps, unbounded and before the enabled check.
    fn step_count(&self) -> f64 {
        // The epsilon keeps an exact multiple from gaining a step through rounding.
        ((self.end_thrust - self.start_thrust) / self.increment - 1e-9)
            .ceil()
            .max(0.0)
    }

    /// Time the ramp blocks the loop for.
    pub fn duration(&self) -> Duration {
        let steps = (self.step_count() as usize).min(MAX_WIND_UP_STEPS);
        self.interval()
            .checked_mul(steps as u32)
            .unwrap_or(Duration::MAX)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Complete configuration of the control loop.
///
/// Defaults are the gains and limits the loop was last flown with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub roll: RpGains,
    pub pitch: RpGains,
    pub yaw: RpGains,
    /// Altitude controller, outputs a vertical velocity command.
    pub position: RpGains,
    /// Vertical velocity controller, outputs a thrust fraction.
    pub velocity: VGains,
    /// Substitute for a zero or missing time step.
    pub nominal_dt_s: f64,
    /// Accepted cycle interval window.
    pub min_step_s: f64,
    pub max_step_s: f64,
    pub yaw_cap: f64,
    pub velocity_cap: f64,
    pub min_thrust_frac: f64,
    pub max_thrust_frac: f64,
    pub hover_bias: f64,
    pub estimator: EstimatorConfig,
    pub wind_up: WindUpConfig,
    /// Feedback receive timeout, bounds how long a kill signal can go unseen.
    pub feedback_poll_ms: u64,
    /// Upper bound on a blocking command send.
    pub command_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            roll: RpGains::new(35.0, 0.3, 8.0).with_integrator_limits(-5.0, 5.0),
            pitch: RpGains::new(35.0, 0.3, 8.0).with_integrator_limits(-5.0, 5.0),
            yaw: RpGains::new(5.0, 0.0, 0.35).with_integrator_limits(-5.0, 5.0),
            position: RpGains::new(0.6, 0.0075, 0.25)
                .with_integrator_limits(-100.0 / 0.035, 100.0 / 0.035)
                .with_set_point(0.5),
            velocity: VGains::new(0.25, 1e-10, 1e-10),
            nominal_dt_s: 8e-3,
            min_step_s: 7e-3,
            max_step_s: 9e-3,
            yaw_cap: 200.0,
            velocity_cap: 10.0,
            min_thrust_frac: 0.40,
            max_thrust_frac: 0.80,
            hover_bias: 0.50,
            estimator: EstimatorConfig::default(),
            wind_up: WindUpConfig::default(),
            feedback_poll_ms: 100,
            command_timeout_ms: 5,
        }
    }
}

impl ControlConfig {
    /// Defaults, then an optional JSON file named by `MOCAP_CTRL_CONFIG`,
    /// then individual `MOCAP_CTRL_*` overrides. Validated before returning.
    pub fn from_env() -> Result<ControlConfig> {
        let mut config = match std::env::var(format!("{}CONFIG", ENV_PREFIX)) {
            Ok(path) if !path.trim().is_empty() => {
                let text = std::fs::read_to_string(path.trim()).map_err(|e| {
                    ControlError::Config(format!("cannot read {}: {}", path.trim(), e))
                })?;
                Self::from_json(&text)?
            }
            _ => ControlConfig::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        log::info!("Control configuration loaded: {:?}", config);
        Ok(config)
    }

    /// Parse a (possibly partial) JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<ControlConfig> {
        serde_json::from_str(text).map_err(|e| ControlError::Config(e.to_string()))
    }

    /// Apply `MOCAP_CTRL_*` overrides. `lookup` maps a full variable name to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        self.min_step_s = read_env_f64(var("MIN_STEP_S"), self.min_step_s);
        self.max_step_s = read_env_f64(var("MAX_STEP_S"), self.max_step_s);
        self.nominal_dt_s = read_env_f64(var("NOMINAL_DT_S"), self.nominal_dt_s);
        self.yaw_cap = read_env_f64(var("YAW_CAP"), self.yaw_cap);
        self.velocity_cap = read_env_f64(var("VELOCITY_CAP"), self.velocity_cap);
        self.min_thrust_frac = read_env_f64(var("MIN_THRUST"), self.min_thrust_frac);
        self.max_thrust_frac = read_env_f64(var("MAX_THRUST"), self.max_thrust_frac);
        self.hover_bias = read_env_f64(var("HOVER_BIAS"), self.hover_bias);
        self.position.set_point = read_env_f64(var("ALTITUDE"), self.position.set_point);

        let est = &mut self.estimator;
        est.filtering = read_env_bool(var("FILTERING"), est.filtering);
        est.extrapolating = read_env_bool(var("EXTRAPOLATING"), est.extrapolating);
        est.extrapolation_max =
            read_env_parse(var("EXTRAPOLATION_MAX"), est.extrapolation_max);
        est.buffer_capacity = read_env_parse(var("BUFFER_CAPACITY"), est.buffer_capacity);
        est.filter.cutoff_hz = read_env_f64(var("FILTER_CUTOFF_HZ"), est.filter.cutoff_hz);
        est.filter.sample_rate_hz =
            read_env_f64(var("FILTER_SAMPLE_RATE_HZ"), est.filter.sample_rate_hz);
        est.filter.order = read_env_parse(var("FILTER_ORDER"), est.filter.order);

        self.wind_up.enabled = read_env_bool(var("WIND_UP"), self.wind_up.enabled);
        self.wind_up.interval_ms =
            read_env_parse(var("WIND_UP_INTERVAL_MS"), self.wind_up.interval_ms);
        self.feedback_poll_ms = read_env_parse(var("FEEDBACK_POLL_MS"), self.feedback_poll_ms);
        self.command_timeout_ms =
            read_env_parse(var("COMMAND_TIMEOUT_MS"), self.command_timeout_ms);
    }

    /// Reject configurations the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (name, g) in [
            ("roll", &self.roll),
            ("pitch", &self.pitch),
            ("yaw", &self.yaw),
            ("position", &self.position),
        ] {
            check_rp(name, g)?;
        }
        check_v("velocity", &self.velocity)?;

        check(
            self.nominal_dt_s.is_finite() && self.nominal_dt_s > 0.0,
            "nominal_dt_s must be positive",
        )?;
        check(
            self.min_step_s.is_finite()
                && self.max_step_s.is_finite()
                && self.min_step_s >= 0.0
                && self.min_step_s <= self.max_step_s,
            "step window must satisfy 0 <= min_step_s <= max_step_s",
        )?;
        check(
            self.yaw_cap.is_finite() && self.yaw_cap > 0.0,
            "yaw_cap must be positive",
        )?;
        check(
            self.velocity_cap.is_finite() && self.velocity_cap > 0.0,
            "velocity_cap must be positive",
        )?;
        check(
            self.min_thrust_frac >= 0.0
                && self.min_thrust_frac <= self.max_thrust_frac
                && self.max_thrust_frac <= 1.0,
            "thrust bounds must satisfy 0 <= min_thrust_frac <= max_thrust_frac <= 1",
        )?;
        check(self.hover_bias.is_finite(), "hover_bias must be finite")?;

        let est = &self.estimator;
        check(est.buffer_capacity >= 1, "buffer_capacity must be at least 1")?;
        if est.filtering {
            let f = &est.filter;
            check(f.order >= 1, "filter order must be at least 1")?;
            check(
                f.sample_rate_hz.is_finite() && f.sample_rate_hz > 0.0,
                "filter sample rate must be positive",
            )?;
            check(
                f.cutoff_hz > 0.0 && f.cutoff_hz < f.sample_rate_hz / 2.0,
                "filter cutoff must lie in (0, sample_rate / 2)",
            )?;
        }

        let w = &self.wind_up;
        if w.enabled {
            check(
                w.increment.is_finite() && w.increment > 0.0,
                "wind-up increment must be positive",
            )?;
            check(
                (0.0..=100.0).contains(&w.start_thrust) && (0.0..=100.0).contains(&w.end_thrust),
                "wind-up thrust must lie in [0, 100]",
            )?;
            check(
                w.step_count() <= MAX_WIND_UP_STEPS as f64,
                "wind-up ramp has too many steps",
            )?;
            check(
                w.duration() <= MAX_WIND_UP_DURATION,
                "wind-up ramp takes too long",
            )?;
        }

        check(self.feedback_poll_ms > 0, "feedback_poll_ms must be positive")?;
        Ok(())
    }

    pub fn nominal_dt(&self) -> Duration {
        Duration::from_secs_f64(self.nominal_dt_s)
    }

    pub fn feedback_poll(&self) -> Duration {
        Duration::from_millis(self.feedback_poll_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn check(ok: bool, msg: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(ControlError::Config(msg.to_string()))
    }
}

fn check_bounds(name: &str, what: &str, min: Option<f64>, max: Option<f64>) -> Result<()> {
    if let (Some(lo), Some(hi)) = (min, max) {
        if lo > hi {
            return Err(ControlError::Config(format!(
                "{}: {} min {} exceeds max {}",
                name, what, lo, hi
            )));
        }
    }
    Ok(())
}

pub(crate) fn check_rp(name: &str, g: &RpGains) -> Result<()> {
    if ![g.kp, g.ki, g.kd, g.set_point].iter().all(|v| v.is_finite()) {
        return Err(ControlError::Config(format!("{}: gains must be finite", name)));
    }
    if g.integrator_min > g.integrator_max {
        return Err(ControlError::Config(format!(
            "{}: integrator_min {} exceeds integrator_max {}",
            name, g.integrator_min, g.integrator_max
        )));
    }
    check_bounds(name, "set-point", g.set_point_min, g.set_point_max)
}

pub(crate) fn check_v(name: &str, g: &VGains) -> Result<()> {
    if ![g.kp, g.ki, g.kd, g.set_point].iter().all(|v| v.is_finite()) {
        return Err(ControlError::Config(format!("{}: gains must be finite", name)));
    }
    if g.kp == 0.0 || g.ki == 0.0 {
        return Err(ControlError::Config(format!(
            "{}: velocity-form PID needs non-zero kp and ki (Ti = kp/ki, Td = kd/kp)",
            name
        )));
    }
    check_bounds(name, "set-point", g.set_point_min, g.set_point_max)?;
    check_bounds(name, "saturation", g.saturate_min, g.saturate_max)
}

fn read_env_bool(value: Option<String>, default: bool) -> bool {
    value
        .and_then(|v| {
            let v = v.trim().to_ascii_lowercase();
            match v.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        })
        .unwrap_or(default)
}

fn read_env_f64(value: Option<String>, default: f64) -> f64 {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn read_env_parse<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

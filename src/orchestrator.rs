use crate::cascade::{AltitudeMemory, ControlCascade};
use crate::config::ControlConfig;
use crate::history::FrameHistory;
use crate::link::{Feedback, LoopLinks};
use crate::protocol;
use crate::types::{Command, CycleReport, FilteredPose, HoldReason, Mode, SetPoints};
use crate::{ControlError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cross-cycle memory owned by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    /// Consecutive active cycles since the last hold.
    pub detect_counter: u32,
    /// Time the previous cycle ran.
    pub last_cycle: Option<Instant>,
    pub altitude: AltitudeMemory,
    pub motors_wound: bool,
}

/// Drives the control loop: one cycle per feedback frame.
///
/// ```text
/// Init ──first pose──► WindUp ──ramp done──► Active ◄──► Hold
/// ```
///
/// A cycle is active only when the interval since the previous cycle lies in
/// `[min_step_s, max_step_s]` and the estimator produced a pose. Anything else
/// holds: a zero command goes out and every controller is reset. Every cycle
/// emits exactly one command.
pub struct LoopOrchestrator {
    config: ControlConfig,
    history: FrameHistory,
    cascade: ControlCascade,
    state: LoopState,
    mode: Mode,
    set_points: SetPoints,
    links: LoopLinks,
    epoch: Instant,
    kill: Arc<AtomicBool>,
    cycles: u64,
}

impl LoopOrchestrator {
    /// Validate `config` and build the pipeline. Configuration errors are
    /// only ever reported here.
    pub fn new(config: ControlConfig, links: LoopLinks) -> Result<LoopOrchestrator> {
        config.validate()?;
        let history = FrameHistory::new(&config.estimator)?;
        let cascade = ControlCascade::new(&config, links.telemetry.clone())?;
        // Nothing to ramp: the motors count as wound from the start.
        let motors_wound = !config.wind_up.enabled;
        log::info!(
            "Control loop ready: step window [{:.4}, {:.4}]s, filtering={}, extrapolating={}",
            config.min_step_s,
            config.max_step_s,
            config.estimator.filtering,
            config.estimator.extrapolating
        );

        Ok(LoopOrchestrator {
            config,
            history,
            cascade,
            state: LoopState {
                motors_wound,
                ..LoopState::default()
            },
            mode: Mode::Init,
            set_points: SetPoints::default(),
            links,
            epoch: Instant::now(),
            kill: Arc::new(AtomicBool::new(false)),
            cycles: 0,
        })
    }

    /// Use an externally owned kill flag.
    pub fn with_kill_switch(mut self, kill: Arc<AtomicBool>) -> Self {
        self.kill = kill;
        self
    }

    /// Flag that stops `run` at the top of its next iteration.
    pub fn kill_switch(&self) -> Arc<AtomicBool> {
        self.kill.clone()
    }

    /// Run until the kill flag is set or the feedback channel closes.
    ///
    /// Either way the loop ends with a single zero command.
    pub fn run(&mut self) -> Result<()> {
        log::info!("Control loop running");
        let poll = self.config.feedback_poll();

        loop {
            if self.kill.load(Ordering::Relaxed) {
                log::info!("Kill signal received after {} cycles", self.cycles);
                self.shutdown(Instant::now());
                return Ok(());
            }

            match self.links.recv_feedback(poll) {
                Feedback::Frame(frame) => {
                    self.cycle(&frame, Instant::now());
                }
                Feedback::Idle => continue,
                Feedback::Disconnected => {
                    log::warn!("Feedback channel disconnected, stopping");
                    self.shutdown(Instant::now());
                    return Err(ControlError::ChannelDisconnected);
                }
            }
        }
    }

    /// Run one control cycle for a raw feedback frame received at `now`.
    pub fn cycle(&mut self, frame: &[f64], now: Instant) -> CycleReport {
        self.cycles += 1;
        let timestamp_s = now.saturating_duration_since(self.epoch).as_secs_f64();

        let sample = match protocol::decode_frame(frame, timestamp_s) {
            Ok(sample) => Some(sample),
            Err(e) => {
                log::warn!("Discarding feedback frame: {}", e);
                None
            }
        };
        self.links.ack();

        let mut hold = HoldReason::empty();
        let pose = match &sample {
            Some(sample) => {
                log::trace!("Received: {:?}", sample);
                self.history.update(sample)
            }
            None => {
                hold |= HoldReason::DECODE_FAILURE;
                None
            }
        };
        if sample.is_some() && pose.is_none() {
            hold |= HoldReason::NO_DATA;
        }

        if pose.is_some() && !self.state.motors_wound {
            self.wind_up();
            hold |= HoldReason::WIND_UP;
        }

        if let Some(sp) = self.links.drain_set_points() {
            log::debug!("Set points: {:?}", sp);
            self.set_points = sp;
            self.cascade.apply_set_points(&sp);
        }

        let step = self
            .state
            .last_cycle
            .map(|prev| now.saturating_duration_since(prev).as_secs_f64());
        self.state.last_cycle = Some(now);
        let in_window = matches!(
            step,
            Some(s) if s >= self.config.min_step_s && s <= self.config.max_step_s
        );
        if !in_window {
            hold |= HoldReason::OUT_OF_WINDOW;
        }
        log::trace!("Time step: {:?}s", step);

        let command = match pose {
            Some(pose) if hold.is_empty() => self.activate(&pose, now),
            _ => self.hold(hold, now),
        };

        self.links
            .send_command(&command, self.config.command_timeout());

        CycleReport {
            mode: self.mode,
            hold,
            command,
        }
    }

    fn activate(&mut self, pose: &FilteredPose, now: Instant) -> Command {
        if self.mode != Mode::Active {
            log::info!("Tracking acquired, control active");
        }
        self.mode = Mode::Active;
        self.state.detect_counter = self.state.detect_counter.saturating_add(1);

        let p = &pose.pose;
        log::debug!(
            "State: x={:.3} y={:.3} z={:.3} yaw={:.1} roll={:.1} pitch={:.1}",
            p.x,
            p.y,
            p.z,
            p.yaw,
            p.roll,
            p.pitch
        );
        let out = self
            .cascade
            .step(p, &self.set_points, &mut self.state.altitude, now);
        Command::new(out.roll, out.pitch, out.yaw, out.thrust)
    }

    fn hold(&mut self, reason: HoldReason, now: Instant) -> Command {
        if self.mode == Mode::Active {
            log::info!("Holding: {:?}", reason);
        } else {
            log::debug!("Holding: {:?}", reason);
        }
        if self.state.motors_wound {
            self.mode = Mode::Hold;
        }
        self.reset_controllers(now);
        self.state.detect_counter = 0;
        Command::zero()
    }

    fn reset_controllers(&mut self, now: Instant) {
        self.cascade.reset_dt_at(now);
        self.cascade.reset();
        self.state.altitude.clear();
    }

    /// Ramp thrust up with attitude held at zero. Runs once.
    fn wind_up(&mut self) {
        self.mode = Mode::WindUp;
        let ramp = self.config.wind_up.ramp();
        let interval = self.config.wind_up.interval();
        log::info!("Motors winding up ({} steps)...", ramp.len());

        for thrust in ramp {
            self.links
                .send_command(&Command::new(0.0, 0.0, 0.0, thrust), self.config.command_timeout());
            if !interval.is_zero() {
                std::thread::sleep(interval);
            }
        }

        self.state.motors_wound = true;
        log::info!("Motors wound");
    }

    /// Prepare a stopped loop for another `run`: clear the kill flag and
    /// forget every pose, controller history and cycle timestamp. The wind-up
    /// ramp runs again on the next pose.
    pub fn rearm(&mut self) {
        self.kill.store(false, Ordering::Relaxed);
        self.history.reset();
        self.reset_controllers(Instant::now());
        self.state = LoopState {
            motors_wound: !self.config.wind_up.enabled,
            ..LoopState::default()
        };
        self.mode = Mode::Init;
        log::info!("Control loop re-armed");
    }

    /// Reset every controller and emit a single zero command.
    pub fn shutdown(&mut self, now: Instant) -> CycleReport {
        self.mode = Mode::Hold;
        self.reset_controllers(now);
        self.state.detect_counter = 0;
        let command = Command::zero();
        self.links
            .send_command(&command, self.config.command_timeout());
        log::info!("Vehicle killed");
        CycleReport {
            mode: self.mode,
            hold: HoldReason::CANCELLED,
            command,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn cascade(&self) -> &ControlCascade {
        &self.cascade
    }

    pub fn history(&self) -> &FrameHistory {
        &self.history
    }

    pub fn set_points(&self) -> SetPoints {
        self.set_points
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}

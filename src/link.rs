use crate::protocol;
use crate::types::{Command, SetPoints};
use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};
use std::time::Duration;

/// Upper bound on set-point messages consumed in one cycle.
pub const MAX_SET_POINT_DRAIN: usize = 1024;

/// Channel endpoints held by the control loop.
///
/// - `feedback` / `reply`: request/reply with the motion-capture bridge
/// - `set_points`: operator input, drained without blocking
/// - `commands`: actuator commands, send bounded by a timeout
/// - `telemetry`: per-controller term records, best effort
pub struct LoopLinks {
    pub feedback: Receiver<Vec<f64>>,
    pub reply: Sender<&'static [u8]>,
    pub set_points: Receiver<String>,
    pub commands: Sender<String>,
    pub telemetry: Option<Sender<String>>,
}

/// The other ends: motion-capture bridge, operator, actuator client, plotter.
pub struct PeerLinks {
    pub feedback: Sender<Vec<f64>>,
    pub reply: Receiver<&'static [u8]>,
    pub set_points: Sender<String>,
    pub commands: Receiver<String>,
    pub telemetry: Receiver<String>,
}

/// Create a connected pair of endpoints, each channel bounded to `capacity`.
pub fn channels(capacity: usize) -> (LoopLinks, PeerLinks) {
    let (feedback_tx, feedback_rx) = crossbeam_channel::bounded(capacity);
    let (reply_tx, reply_rx) = crossbeam_channel::bounded(capacity);
    let (sp_tx, sp_rx) = crossbeam_channel::bounded(capacity);
    let (cmd_tx, cmd_rx) = crossbeam_channel::bounded(capacity);
    let (tel_tx, tel_rx) = crossbeam_channel::bounded(capacity);

    (
        LoopLinks {
            feedback: feedback_rx,
            reply: reply_tx,
            set_points: sp_rx,
            commands: cmd_tx,
            telemetry: Some(tel_tx),
        },
        PeerLinks {
            feedback: feedback_tx,
            reply: reply_rx,
            set_points: sp_tx,
            commands: cmd_rx,
            telemetry: tel_rx,
        },
    )
}

/// Result of waiting for a feedback frame.
#[derive(Debug)]
pub enum Feedback {
    Frame(Vec<f64>),
    /// Nothing arrived within the poll interval.
    Idle,
    Disconnected,
}

impl LoopLinks {
    /// Block for the next feedback frame, at most `timeout`.
    pub fn recv_feedback(&self, timeout: Duration) -> Feedback {
        match self.feedback.recv_timeout(timeout) {
            Ok(frame) => Feedback::Frame(frame),
            Err(RecvTimeoutError::Timeout) => Feedback::Idle,
            Err(RecvTimeoutError::Disconnected) => Feedback::Disconnected,
        }
    }

    /// Acknowledge a feedback frame. Never blocks.
    pub fn ack(&self) {
        if let Err(e) = self.reply.try_send(protocol::REPLY_TOKEN) {
            match e {
                TrySendError::Full(_) => log::trace!("Reply channel full, dropping ack"),
                TrySendError::Disconnected(_) => log::trace!("Reply channel disconnected"),
            }
        }
    }

    /// Consume every pending set-point message and return the last valid one.
    pub fn drain_set_points(&self) -> Option<SetPoints> {
        let mut latest = None;
        for _ in 0..MAX_SET_POINT_DRAIN {
            match self.set_points.try_recv() {
                Ok(text) => match protocol::parse_set_points(&text) {
                    Ok(sp) => latest = Some(sp),
                    Err(e) => log::warn!("Dropping set-point message: {}", e),
                },
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        latest
    }

    /// Send a command, waiting at most `timeout`. Returns whether it was delivered.
    pub fn send_command(&self, command: &Command, timeout: Duration) -> bool {
        match self
            .commands
            .send_timeout(protocol::encode_command(command), timeout)
        {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                log::warn!("Command channel backpressure, command dropped");
                false
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                log::warn!("Command channel disconnected, command dropped");
                false
            }
        }
    }
}

/// Errors surfaced by the control pipeline.
///
/// Only `Config` may abort the process, and only at construction time.
/// Everything else is recovered inside the loop and degrades to a hold cycle.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Malformed feedback frame: {0}")]
    Decode(String),

    #[error("Malformed set-point message: {0}")]
    SetPoint(#[from] serde_json::Error),

    #[error("Feedback channel disconnected")]
    ChannelDisconnected,
}

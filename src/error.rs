use thiserror::Error;

/// Error taxonomy of the daemon. Backend primitives deliberately report
/// plain success/failure; these variants are used at the seams above them.
#[derive(Error, Debug)]
pub enum UsbModedError {
    #[error("required path or config entry missing: {0}")]
    ConfigAbsent(String),

    #[error("sysfs io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("request denied for uid {uid}: {reason}")]
    PolicyDenied { uid: u32, reason: String },

    #[error("could not reach mode {0}")]
    TransitionFailed(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

//! Local IPC between the service and user helpers.

pub mod codec;
pub mod integrity;
pub mod protocol;
pub mod rate_limit;

pub use codec::{BoxedWriter, CodecError, EnvelopeReader, EnvelopeWriter, SessionKey, framed};
pub use protocol::{
    AuthRequest, AuthResponse, Capabilities, DesktopStartRequest, DesktopStartResponse,
    DesktopStopRequest, Envelope, IpcCommand, IpcCommandResult, MAX_MESSAGE_SIZE, MenuItem,
    MessageType, NotifyRequest, NotifyResult, PROTOCOL_VERSION, TrayAction, TrayUpdate,
};
pub use integrity::{current_binary_hash, file_sha256};
pub use rate_limit::RateLimiter;

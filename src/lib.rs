//! Client-side control and data manager for network-attached radios.
//!
//! A radio exposes a line-oriented TCP control channel (sequenced commands,
//! replies and unsolicited status) and streams binary frames to a UDP port the
//! client announces. This crate owns both: [`Session`] drives the control
//! channel lifecycle, correlates replies to commands and fans status events out
//! to subscribers, while a separate stream lane demultiplexes datagrams to
//! per-stream consumers.
//!
//! Transports are injected through the [`Transport`] trait; [`TokioTransport`]
//! speaks real sockets and [`MemoryTransport`] keeps everything in-process.

pub mod build_info;
pub mod config;
pub mod control;
pub mod diagnostic;
pub mod e2e_common;
pub mod protocol;
pub mod registry;
pub mod sdk;
pub mod session;
pub mod stream;
pub mod transport;

pub use build_info::BuildInfo;
pub use config::{ConfigError, SessionConfig, DEFAULT_UDP_PORT};
pub use control::{CommandError, CommandResult};
pub use diagnostic::{Diagnostic, TerminationReason};
pub use protocol::{
    LineDialect, MessageSeverity, ProtocolViolation, RadioMessage, Reply, StatusEvent,
};
pub use registry::{StatusListener, SubscriptionHandle, ANY_CATEGORY};
pub use sdk::{ClientError, RadioClient};
pub use session::{RadioIdentity, Session, SessionError, SessionState, SessionStateError};
pub use stream::{
    ConsumerHandle, DemuxStats, FrameError, FrameKind, FramePayload, MeterReading, MeterUnits,
    StreamConsumer, StreamFrame,
};
pub use transport::{MemoryRadio, MemoryTransport, TokioTransport, Transport, TransportError};

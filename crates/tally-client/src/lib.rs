//! Client side of the realtime channel: pluggable transports, the
//! negotiator that picks between them, and a passive stability monitor.

pub mod backoff;
pub mod error;
pub mod monitor;
pub mod negotiator;
pub mod transport;

pub use error::ClientError;
pub use negotiator::{ConnectionState, NegotiatorConfig, NegotiatorEvent, NegotiatorHandle};
pub use transport::{Endpoint, HttpTransports, Transport, TransportEvent, TransportFactory, TransportKind};

//! Outbound mail delivery
//!
//! This crate provides:
//! - The delivery engine, which turns a stored mail record into a message,
//!   sends it and records the outcome
//! - Retry with linear backoff for failed sends
//! - Deliverability filtering of recipients
//! - Threading headers, including Outlook's `Thread-Index`
//! - Pluggable transports
//! - A dispatcher that delivers queued mail in the background

mod config;
mod dispatcher;
mod engine;
mod error;
pub mod headers;
pub mod policy;
mod recipients;
pub mod transport;

pub use config::DeliveryConfig;
pub use dispatcher::{Claim, DispatchSummary, Dispatcher, DispatcherConfig};
pub use engine::{DeliveryOutcome, Mailer, TRANSPORT_AGENT};
pub use error::{
    AttemptError, DeliveryError, PreconditionError, ProtocolError, TransientError, TransportError,
};
pub use headers::{ThreadHeaders, thread_index, thread_index_at};
pub use policy::RetryPolicy;
pub use recipients::deliverable_emails;
pub use transport::{
    Address, LogTransport, MemoryTransport, OutgoingMessage, Transport, TransportKind,
};

//! Core of a unidirectional, reliable, ordered file-transfer sender over
//! UDP: packet codec, RTT estimation, performance metrics, transport, and
//! the Multi-Signal Adaptive congestion-control/reliability engine.
//!
//! The receiver, the datagram socket primitive's peer side, CLI
//! invocation plumbing beyond flag parsing, and log formatting are all
//! external collaborators — this crate only implements the sender's wire
//! contract and send-side state machine.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod packet;
pub mod rtt;
pub mod transport;

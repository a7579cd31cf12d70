//! Error taxonomy for the sender, per the fatal/local-recovery split in
//! the design: only a handful of variants ever propagate past the
//! engine, the rest are handled where they occur.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("no payload found; searched: {searched:?}")]
    PayloadNotFound { searched: Vec<PathBuf> },

    #[error("failed to set up transport: {0}")]
    TransportSetupFailure(#[source] std::io::Error),

    #[error("malformed packet: fewer than {} header bytes", crate::packet::SEQ_ID_SIZE)]
    MalformedPacket,

    #[error("timed out waiting for an acknowledgement")]
    Timeout,

    #[error("failed to send datagram: {0}")]
    TransportSendFailure(#[source] std::io::Error),

    #[error("failed to receive datagram: {0}")]
    TransportReceiveFailure(#[source] std::io::Error),
}

//! Loads the payload, constructs the engine, runs it to completion, and
//! emits metrics — the only piece of the core that touches the
//! filesystem.

use std::fs;
use std::time::Duration;

use tracing::{error, info};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::SenderError;
use crate::transport::UdpTransport;

/// Conservative initial receive timeout before any RTT sample exists,
/// matching the reference sender's `sock.settimeout(1.0)`.
const INITIAL_TIMEOUT: Duration = Duration::from_secs(1);

pub fn run(config: Config) -> Result<(), SenderError> {
    let payload = load_payload(&config)?;
    info!(bytes = payload.len(), receiver = %config.receiver, "loaded payload");

    let transport = UdpTransport::bind(config.receiver, INITIAL_TIMEOUT)?;
    let mut engine = Engine::new(transport, &payload);

    let result = engine.run();
    match &result {
        Ok(()) => {
            println!("{}", engine.metrics().format_csv());
        }
        Err(e) => {
            error!(error = %e, "transfer failed");
        }
    }
    result
}

fn load_payload(config: &Config) -> Result<Vec<u8>, SenderError> {
    let candidates = config.payload_candidates();
    for path in &candidates {
        if path.exists() {
            return fs::read(path).map_err(|_| SenderError::PayloadNotFound {
                searched: candidates.clone(),
            });
        }
    }
    Err(SenderError::PayloadNotFound { searched: candidates })
}

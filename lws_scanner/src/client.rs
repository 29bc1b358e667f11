//! The request/response message socket to the full-node peer.
//!
//! Messages are newline-delimited JSON envelopes. The socket operates with
//! short poll ticks: every send and receive loops over sub-second timeouts,
//! observing the cancellation channel and the running flag between ticks, so
//! a blocked worker reacts to shutdown within one tick.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Cancel, Error, POLL_TICK, SEND_TIMEOUT};

/// Hard cap on a single response frame. A response that would not fit is
/// reported as `ExceededBlockchainBuffer` rather than buffered without
/// bound.
const MAX_FRAME_BYTES: usize = 128 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct RequestEnvelope<'a, T> {
    id: u64,
    method: &'a str,
    params: &'a T,
}

#[derive(Deserialize)]
struct ResponseEnvelope<T> {
    id: u64,
    result: T,
}

/// A connection to the full-node peer.
pub struct DaemonClient {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    next_id: u64,
    pending_id: Option<u64>,
}

impl DaemonClient {
    /// Connects to the peer at `addr` (`host:port`).
    pub fn connect(addr: &str) -> Result<Self, Error> {
        let target = addr
            .to_socket_addrs()
            .map_err(|_| Error::DaemonConnectionFailure)?
            .next()
            .ok_or(Error::DaemonConnectionFailure)?;
        let stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)
            .map_err(|_| Error::DaemonConnectionFailure)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(POLL_TICK))?;
        stream.set_write_timeout(Some(POLL_TICK))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(DaemonClient {
            writer: stream,
            reader,
            next_id: 0,
            pending_id: None,
        })
    }

    /// Serializes and sends one request envelope. Waits at most the send
    /// timeout, in cancel-aware ticks.
    ///
    /// The socket carries one request/response exchange at a time; sending
    /// while a response is still owed is an error.
    pub fn send_request<T: Serialize>(
        &mut self,
        method: &str,
        params: &T,
        cancel: &Cancel,
    ) -> Result<(), Error> {
        if self.pending_id.is_some() {
            return Err(Error::PeerMismatch("request already in flight"));
        }
        let id = self.next_id;
        self.next_id += 1;

        let mut body = serde_json::to_vec(&RequestEnvelope { id, method, params })?;
        body.push(b'\n');
        debug!(method, id, bytes = body.len(), "sending request");

        let start = Instant::now();
        let mut written = 0;
        while written < body.len() {
            cancel.check()?;
            if SEND_TIMEOUT <= start.elapsed() {
                return Err(Error::DaemonConnectionFailure);
            }
            match self.writer.write(&body[written..]) {
                Ok(0) => return Err(Error::DaemonConnectionFailure),
                Ok(n) => written += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        self.pending_id = Some(id);
        Ok(())
    }

    /// Receives and decodes the response to the last sent request, waiting
    /// at most `timeout` in cancel-aware ticks.
    ///
    /// A timeout leaves the request outstanding: the peer may still answer
    /// it, so the caller can call `recv_response` again and the reply will
    /// be matched against the same id. Anything that corrupts the exchange
    /// (socket failure, undecodable frame, wrong id) clears it.
    pub fn recv_response<T: DeserializeOwned>(
        &mut self,
        timeout: Duration,
        cancel: &Cancel,
    ) -> Result<T, Error> {
        let expected = self
            .pending_id
            .ok_or(Error::PeerMismatch("response awaited without a request"))?;

        let line = match self.recv_frame(timeout, cancel) {
            Ok(line) => line,
            Err(e @ (Error::DaemonConnectionFailure | Error::AbortScan)) => return Err(e),
            Err(e) => {
                self.pending_id = None;
                return Err(e);
            }
        };
        self.pending_id = None;

        let envelope: ResponseEnvelope<T> = serde_json::from_slice(&line)?;
        if envelope.id != expected {
            return Err(Error::PeerMismatch("response id does not match request"));
        }
        Ok(envelope.result)
    }

    fn recv_frame(&mut self, timeout: Duration, cancel: &Cancel) -> Result<Vec<u8>, Error> {
        let start = Instant::now();
        let mut line = Vec::new();
        loop {
            cancel.check()?;
            if timeout <= start.elapsed() {
                return Err(Error::DaemonConnectionFailure);
            }

            let (consumed, complete) = match self.reader.fill_buf() {
                Ok([]) => return Err(Error::DaemonConnectionFailure),
                Ok(buf) => match buf.iter().position(|&b| b == b'\n') {
                    Some(at) => {
                        line.extend_from_slice(&buf[..at]);
                        (at + 1, true)
                    }
                    None => {
                        line.extend_from_slice(buf);
                        (buf.len(), false)
                    }
                },
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(Error::Io(e)),
            };

            self.reader.consume(consumed);
            if complete {
                return Ok(line);
            }
            if MAX_FRAME_BYTES < line.len() {
                return Err(Error::ExceededBlockchainBuffer);
            }
        }
    }
}

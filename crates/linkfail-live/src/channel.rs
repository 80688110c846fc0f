//! Duplex text-line channel over TCP.
//!
//! Writes happen on the caller's thread. Reads happen on one background
//! thread started by [`LineChannel::on_line`], which hands every line to a
//! callback. The line `done` ends the channel: the reader stops and the
//! channel's [`ShutdownSignal`] fires. A read or write failure is logged
//! and fires the same signal, so a broken peer shuts down this component
//! and nothing else.

use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use linkfail_sim::ShutdownSignal;
use tracing::{debug, info, warn};

use crate::error::{LiveError, Result};

/// The line that terminates a live component.
pub const DONE: &str = "done";

pub struct LineChannel {
    stream: TcpStream,
    writer: BufWriter<TcpStream>,
    peer: SocketAddr,
    reader: Option<JoinHandle<()>>,
    signal: ShutdownSignal,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for LineChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineChannel")
            .field("peer", &self.peer)
            .field("reading", &self.reader.is_some())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl LineChannel {
    /// Connects to `host:port`.
    pub fn connect(host: &str, port: u16, signal: ShutdownSignal) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        debug!(host, port, "line channel connected");
        Self::from_stream(stream, signal)
    }

    /// Wraps an accepted connection.
    pub fn from_stream(stream: TcpStream, signal: ShutdownSignal) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let writer = BufWriter::new(stream.try_clone()?);
        Ok(Self {
            stream,
            writer,
            peer,
            reader: None,
            signal,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Writes `line` followed by a newline and flushes.
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        if self.is_closed() {
            return Err(LiveError::Closed(format!("send to {} after close", self.peer)));
        }
        if let Err(error) = write_line(&mut self.writer, line) {
            warn!(peer = %self.peer, error = %error, "line channel write failed");
            self.signal.trigger();
            return Err(error.into());
        }
        Ok(())
    }

    /// Starts the reader thread. `callback` sees every line except `done`,
    /// with the line ending stripped.
    pub fn on_line<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(&str) + Send + 'static,
    {
        if self.reader.is_some() {
            return Err(LiveError::Closed(format!("reader for {} already running", self.peer)));
        }
        let mut reader = BufReader::new(self.stream.try_clone()?);
        let signal = self.signal.clone();
        let closed = Arc::clone(&self.closed);
        let peer = self.peer;

        let handle = thread::Builder::new()
            .name(format!("line-reader-{peer}"))
            .spawn(move || {
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) => {
                            if !closed.load(Ordering::SeqCst) {
                                debug!(peer = %peer, "peer closed the line channel");
                                signal.trigger();
                            }
                            return;
                        }
                        Ok(_) => {
                            let text = line.trim_end_matches(['\r', '\n']);
                            if text.trim() == DONE {
                                info!(peer = %peer, "received done");
                                signal.trigger();
                                return;
                            }
                            callback(text);
                        }
                        Err(error) if error.kind() == ErrorKind::Interrupted => {}
                        Err(error) => {
                            if !closed.load(Ordering::SeqCst) {
                                warn!(peer = %peer, error = %error, "line channel read failed");
                                signal.trigger();
                            }
                            return;
                        }
                    }
                }
            })?;
        self.reader = Some(handle);
        Ok(())
    }

    /// Shuts the socket down and waits for the reader thread. Idempotent.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.writer.flush();
        if let Err(error) = self.stream.shutdown(Shutdown::Both) {
            if error.kind() != ErrorKind::NotConnected {
                debug!(peer = %self.peer, error = %error, "socket shutdown failed");
            }
        }
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!(peer = %self.peer, "line reader panicked");
            }
        }
    }
}

fn write_line(writer: &mut impl Write, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

impl Drop for LineChannel {
    fn drop(&mut self) {
        self.close();
    }
}

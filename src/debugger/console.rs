//! Line-oriented access to a text console.
//!
//! A background reader thread forwards raw bytes over a channel. All reads
//! on the console side are bounded by a timeout and wake up immediately when
//! the campaign is cancelled.

use crossbeam_channel::{select, unbounded, Receiver, TryRecvError};
use log::{debug, trace};
use regex::Regex;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::thread::{spawn, JoinHandle};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

type Closer = Box<dyn FnOnce() + Send>;

pub struct Console {
    name: String,
    writer: Box<dyn Write + Send>,
    data: Receiver<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
    closer: Option<Closer>,
    /// Trailing bytes of a character split across reads.
    partial: Vec<u8>,
    /// Received but not yet consumed by an `expect`.
    pending: String,
    transcript: String,
    timeout: Duration,
    cancel: CancelToken,
}

impl Console {
    /// Wraps a reader/writer pair. Reading happens on a dedicated thread.
    pub fn spawn<R, W>(name: &str, mut reader: R, writer: W, timeout: Duration, cancel: CancelToken) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (sender, receiver) = unbounded();
        let handle = spawn(move || {
            let mut buffer = [0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(count) => {
                        if sender.send(buffer[..count].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Self {
            name: name.to_string(),
            writer: Box::new(writer),
            data: receiver,
            reader: Some(handle),
            closer: None,
            partial: Vec::new(),
            pending: String::new(),
            transcript: String::new(),
            timeout,
            cancel,
        }
    }

    /// Opens a telnet-style TCP session.
    pub fn tcp(name: &str, address: &str, port: u16, timeout: Duration, cancel: CancelToken) -> Result<Self> {
        let socket = (address, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::LinkUnavailable(format!("cannot resolve {address}:{port}")))?;
        let stream = TcpStream::connect_timeout(&socket, timeout)
            .map_err(|e| Error::LinkUnavailable(format!("{address}:{port}: {e}")))?;
        let reader = stream.try_clone()?;
        let shutdown = stream.try_clone()?;
        let console = Self::spawn(name, reader, stream, timeout, cancel).with_closer(move || {
            let _ = shutdown.shutdown(Shutdown::Both);
        });
        Ok(console)
    }

    /// Registers a hook that unblocks the reader thread on close.
    pub fn with_closer<F>(mut self, closer: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.closer = Some(Box::new(closer));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn write_str(&mut self, text: &str) -> Result<()> {
        trace!("[{}] <- {:?}", self.name, text);
        self.writer.write_all(text.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    /// Adds local text (e.g. a sent command) to the transcript.
    pub fn note(&mut self, text: &str) {
        self.transcript.push_str(text);
    }

    /// Returns everything received so far without blocking.
    pub fn read_lazy(&mut self) -> String {
        loop {
            match self.data.try_recv() {
                Ok(bytes) => self.receive(&bytes),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.flush_partial();
                    break;
                }
            }
        }
        std::mem::take(&mut self.pending)
    }

    /// Waits until one of `patterns` matches the unread output.
    ///
    /// The earliest match wins. Returns the index of the matching pattern and
    /// the consumed text up to and including the match.
    pub fn expect(&mut self, patterns: &[Regex]) -> Result<(usize, String)> {
        self.cancel.check()?;
        let deadline = Instant::now() + self.timeout;
        let data = self.data.clone();
        let wake = self.cancel.receiver().clone();
        loop {
            if let Some((index, end)) = self.earliest_match(patterns) {
                let rest = self.pending.split_off(end);
                let consumed = std::mem::replace(&mut self.pending, rest);
                return Ok((index, consumed));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            select! {
                recv(data) -> message => match message {
                    Ok(bytes) => self.receive(&bytes),
                    Err(_) => {
                        self.flush_partial();
                        return Err(Error::protocol(
                            format!("{} closed", self.name),
                            format!("waiting for {}", describe(patterns)),
                        ))
                    }
                },
                recv(wake) -> _ => return Err(Error::Interrupted),
                default(remaining) => {
                    return Err(Error::Timeout(format!(
                        "{} waiting for {} after {:?}",
                        self.name,
                        describe(patterns),
                        self.timeout
                    )))
                }
            }
        }
    }

    pub fn expect_literal(&mut self, literal: &str) -> Result<String> {
        let pattern = Regex::new(&regex::escape(literal)).map_err(|e| Error::Config(e.to_string()))?;
        self.expect(&[pattern]).map(|(_, text)| text)
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn take_transcript(&mut self) -> String {
        std::mem::take(&mut self.transcript)
    }

    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
        if let Some(handle) = self.reader.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);
        let text = take_utf8(&mut self.partial);
        self.push_text(&text);
    }

    /// Gives up on an incomplete character once the stream has ended.
    fn flush_partial(&mut self) {
        if !self.partial.is_empty() {
            let text = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            self.push_text(&text);
        }
    }

    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        debug!("[{}] {}", self.name, text.trim_end());
        self.pending.push_str(text);
        self.transcript.push_str(text);
    }

    fn earliest_match(&self, patterns: &[Regex]) -> Option<(usize, usize)> {
        patterns
            .iter()
            .enumerate()
            .filter_map(|(index, pattern)| pattern.find(&self.pending).map(|found| (index, found.start(), found.end())))
            .min_by_key(|(_, start, _)| *start)
            .map(|(index, _, end)| (index, end))
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.close();
    }
}

/// Decodes the complete characters at the front of `bytes`.
///
/// An incomplete sequence at the end stays in `bytes` for the next read.
/// Invalid sequences decode to U+FFFD.
fn take_utf8(bytes: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut rest: &[u8] = bytes;
    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                rest = &[];
            }
            Err(error) => {
                let (valid, after) = rest.split_at(error.valid_up_to());
                text.push_str(&String::from_utf8_lossy(valid));
                match error.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    }
                    None => {
                        rest = after;
                        break;
                    }
                }
            }
        }
    }
    let consumed = bytes.len() - rest.len();
    bytes.drain(..consumed);
    text
}

fn describe(patterns: &[Regex]) -> String {
    patterns.iter().map(|pattern| format!("'{}'", pattern.as_str())).collect::<Vec<_>>().join(" | ")
}

/// Compiles a list of patterns, reporting the offending one on failure.
pub fn compile_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern.as_ref()).map_err(|e| Error::Config(format!("bad pattern '{}': {}", pattern.as_ref(), e)))
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::testing::{responder, scripted, SharedWriter};
    use super::*;
    use crossbeam_channel::{bounded, Sender};

    /// Blocks until its sender is dropped.
    struct Silent(Receiver<()>);

    impl Read for Silent {
        fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    fn silent() -> (Silent, Sender<()>) {
        let (sender, receiver) = bounded(0);
        (Silent(receiver), sender)
    }

    fn patterns(list: &[&str]) -> Vec<Regex> {
        compile_patterns(list).unwrap()
    }

    #[test]
    fn earliest_match_wins() {
        let (mut console, _) = scripted("boot ok\r\nlogin: root\r\n# ", Duration::from_secs(2), CancelToken::new());
        let (index, text) = console.expect(&patterns(&["# ", "login: "])).unwrap();
        assert_eq!(index, 1);
        assert_eq!(text, "boot ok\r\nlogin: ");
        let (index, text) = console.expect(&patterns(&["# "])).unwrap();
        assert_eq!(index, 0);
        assert_eq!(text, "root\r\n# ");
        assert_eq!(console.transcript(), "boot ok\r\nlogin: root\r\n# ");
    }

    #[test]
    fn closed_stream_is_protocol_error() {
        let (mut console, _) = scripted("partial", Duration::from_secs(2), CancelToken::new());
        let result = console.expect(&patterns(&["never"]));
        assert!(matches!(result, Err(Error::Protocol { .. })));
    }

    #[test]
    fn silent_stream_times_out() {
        let (reader, _keep_open) = silent();
        let mut console = Console::spawn(
            "silent",
            reader,
            SharedWriter::default(),
            Duration::from_millis(50),
            CancelToken::new(),
        );
        assert!(matches!(console.expect(&patterns(&["x"])), Err(Error::Timeout(_))));
    }

    #[test]
    fn cancel_unblocks_expect() {
        let (reader, _keep_open) = silent();
        let cancel = CancelToken::new();
        let mut console = Console::spawn("silent", reader, SharedWriter::default(), Duration::from_secs(60), cancel.clone());
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            cancel.cancel();
        });
        let start = Instant::now();
        assert!(matches!(console.expect(&patterns(&["x"])), Err(Error::Interrupted)));
        assert!(start.elapsed() < Duration::from_secs(10));
        trigger.join().unwrap();
    }

    #[test]
    fn replies_follow_written_lines() {
        let (mut console, writer) = responder("P2020>", &["reply\r\nP2020>"], Duration::from_secs(2), CancelToken::new());
        console.expect_literal("P2020>").unwrap();
        assert_eq!(console.read_lazy(), "");
        console.write_str("halt 0 1\r\n").unwrap();
        assert_eq!(console.expect_literal("P2020>").unwrap(), "reply\r\nP2020>");
        assert_eq!(writer.contents(), "halt 0 1\r\n");
    }

    #[test]
    fn characters_split_across_reads() {
        let (mut console, _) = scripted("", Duration::from_secs(2), CancelToken::new());
        console.receive(b"caf\xc3");
        console.receive(b"\xa9 \xe2\x82");
        console.receive(b"\xac\r\n");
        assert_eq!(console.read_lazy(), "café €\r\n");
        assert_eq!(console.transcript(), "café €\r\n");
    }

    #[test]
    fn invalid_bytes_are_replaced() {
        let mut bytes = b"ok\xff\xfe!\xf0\x9f".to_vec();
        assert_eq!(take_utf8(&mut bytes), "ok\u{fffd}\u{fffd}!");
        assert_eq!(bytes, b"\xf0\x9f");
    }
}

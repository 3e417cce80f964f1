//! Tail of a supervised process's captured stdout/stderr.
use std::fmt;

/// Hard ceiling on bytes fetched per tail, whatever line count was asked for.
pub const MAX_BYTES_TO_READ: u64 = 50 * 1024;

const STDERR_BANNER: &str = "-------LAST LINES OF STDERR---------";
const STDOUT_BANNER: &str = "-------LAST LINES OF STDOUT---------";
const END_BANNER: &str = "-----------------END----------------";

/// Which captured stream to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Result of a tail call against the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogChunk {
    /// The most recent bytes of the log.
    pub bytes: String,
    /// Log size at the time of the call.
    pub offset: u64,
    /// True when the log held more than was returned, so `bytes` may begin
    /// mid-line.
    pub overflow: bool,
}

#[derive(Debug)]
pub enum LogAccessError {
    /// Could not reach the supervisor.
    Transport(String),
    /// The supervisor answered with a non-success HTTP status.
    Status { code: u16 },
    /// The supervisor returned an XML-RPC fault (e.g. BAD_NAME).
    Fault { code: i64, message: String },
    /// The response could not be decoded.
    Decode(String),
}

impl fmt::Display for LogAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogAccessError::Transport(msg) => write!(f, "supervisor transport error: {msg}"),
            LogAccessError::Status { code } => write!(f, "supervisor returned HTTP {code}"),
            LogAccessError::Fault { code, message } => {
                write!(f, "supervisor fault {code}: {message}")
            }
            LogAccessError::Decode(msg) => write!(f, "bad supervisor response: {msg}"),
        }
    }
}

impl std::error::Error for LogAccessError {}

/// Read access to the logs the supervisor captures for its children.
pub trait LogAccess {
    /// Fetch up to `length` of the most recent bytes of a process's log.
    async fn tail_log(
        &self,
        stream: Stream,
        process_key: &str,
        offset: u64,
        length: u64,
    ) -> Result<LogChunk, LogAccessError>;
}

/// Bounded tail window over one captured stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TailWindow {
    pub text: String,
    pub total_bytes: u64,
    pub overflow: bool,
}

impl TailWindow {
    /// Keep the last `n + 1` newline-separated segments.
    ///
    /// Text ending in a newline has an empty final segment, so `n` requested
    /// lines yields `n` full lines plus the trailing newline. When the window
    /// started mid-line and the selection reaches back to that fragment, the
    /// fragment is dropped.
    pub fn last_lines(&self, n: usize) -> String {
        let segments: Vec<&str> = self.text.split('\n').collect();
        let mut start = segments.len().saturating_sub(n.saturating_add(1));
        if self.overflow && start == 0 && segments.len() > 1 {
            start = 1;
        }
        segments[start..].join("\n")
    }
}

pub struct TailReader<L> {
    access: L,
}

impl<L: LogAccess> TailReader<L> {
    pub fn new(access: L) -> Self {
        Self { access }
    }

    /// Fetch the tail window, never asking for more than [`MAX_BYTES_TO_READ`].
    pub async fn tail(
        &self,
        stream: Stream,
        process_key: &str,
        max_bytes: u64,
    ) -> Result<TailWindow, LogAccessError> {
        let length = max_bytes.min(MAX_BYTES_TO_READ);
        let chunk = self
            .access
            .tail_log(stream, process_key, 0, length)
            .await?;
        Ok(TailWindow {
            text: chunk.bytes,
            total_bytes: chunk.offset,
            overflow: chunk.overflow,
        })
    }

    /// Last `n` lines of a stream, or empty text if the log can't be read.
    pub async fn last_lines(&self, stream: Stream, process_key: &str, n: usize) -> String {
        match self.tail(stream, process_key, MAX_BYTES_TO_READ).await {
            Ok(window) => {
                tracing::debug!(
                    process = process_key,
                    %stream,
                    total_bytes = window.total_bytes,
                    overflow = window.overflow,
                    "read process log tail"
                );
                window.last_lines(n)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    process = process_key,
                    %stream,
                    "failed to read process log, reporting without it"
                );
                String::new()
            }
        }
    }

    #[cfg(test)]
    pub fn access(&self) -> &L {
        &self.access
    }
}

/// Wrap tail text in the banner lines used in combined reports.
pub fn banner_block(stream: Stream, text: &str) -> String {
    let banner = match stream {
        Stream::Stderr => STDERR_BANNER,
        Stream::Stdout => STDOUT_BANNER,
    };
    format!("\n{banner}\n{text}\n{END_BANNER}\n")
}

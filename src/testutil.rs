//! In-memory collaborators for unit tests.
use crate::sink::{AlertSink, SinkError};
use crate::tail::{LogAccess, LogAccessError, LogChunk, Stream};
use std::cell::RefCell;
use std::collections::BTreeMap;

type TailCall = (Stream, String, u64, u64);

/// Serves fixed stdout/stderr text and records every tail request.
#[derive(Default)]
pub struct FakeLogs {
    stdout: String,
    stderr: String,
    fail: bool,
    calls: RefCell<Vec<TailCall>>,
}

impl FakeLogs {
    pub fn new(stderr: &str, stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            ..Default::default()
        }
    }

    pub fn with_stderr(stderr: &str) -> Self {
        Self::new(stderr, "")
    }

    pub fn with_stdout(stdout: &str) -> Self {
        Self::new("", stdout)
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<TailCall> {
        self.calls.borrow().clone()
    }
}

impl LogAccess for FakeLogs {
    async fn tail_log(
        &self,
        stream: Stream,
        process_key: &str,
        offset: u64,
        length: u64,
    ) -> Result<LogChunk, LogAccessError> {
        self.calls
            .borrow_mut()
            .push((stream, process_key.to_string(), offset, length));
        if self.fail {
            return Err(LogAccessError::Fault {
                code: 10,
                message: "BAD_NAME".to_string(),
            });
        }
        let text = match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        };
        Ok(LogChunk {
            bytes: text.clone(),
            offset: text.len() as u64,
            overflow: false,
        })
    }
}

/// One recorded `AlertSink::send` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentAlert {
    pub title: String,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
}

/// Records alerts; optionally fails every send after recording it.
#[derive(Default)]
pub struct FakeSink {
    fail: bool,
    sent: RefCell<Vec<SentAlert>>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<SentAlert> {
        self.sent.borrow().clone()
    }
}

impl AlertSink for FakeSink {
    async fn send(
        &self,
        title: &str,
        body: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), SinkError> {
        self.sent.borrow_mut().push(SentAlert {
            title: title.to_string(),
            body: body.to_string(),
            metadata: metadata.clone(),
        });
        if self.fail {
            return Err(SinkError::Status {
                code: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

//! Supervisor event-listener protocol.
//!
//! The supervisor talks to a listener over stdio. Each cycle the listener
//! announces `READY`, reads one header line of `key:value` tokens, reads
//! exactly `len` bytes of payload, and answers with a `RESULT` frame.
//! Every command read must be answered exactly once or the supervisor stops
//! delivering events to this listener.
use std::collections::BTreeMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Token written before each read to ask for the next event.
pub const READY_TOKEN: &[u8] = b"READY\n";

/// Acknowledgement frame for a processed event.
pub const OK_FRAME: &[u8] = b"RESULT 2\nOK";

/// Errors that break protocol framing.
///
/// None of these are recoverable: once framing is lost the listener cannot
/// find the next header boundary, so the process exits and lets the
/// supervisor restart it.
#[derive(Debug)]
pub enum ProtocolError {
    /// The supervisor closed the inbound stream between commands.
    Closed,
    /// A header token had no `key:value` separator.
    MalformedHeader { line: String },
    /// The header carried no `len` key.
    MissingLength { line: String },
    /// The `len` value was not a byte count.
    InvalidLength { value: String },
    /// The stream ended before the declared payload was read.
    TruncatedPayload { expected: usize },
    /// Reading or writing the stdio streams failed.
    Io(std::io::Error),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Closed => write!(f, "supervisor closed the event stream"),
            ProtocolError::MalformedHeader { line } => {
                write!(f, "malformed event header: {line:?}")
            }
            ProtocolError::MissingLength { line } => {
                write!(f, "event header has no len field: {line:?}")
            }
            ProtocolError::InvalidLength { value } => {
                write!(f, "invalid payload length {value:?}")
            }
            ProtocolError::TruncatedPayload { expected } => {
                write!(f, "event stream ended before {expected} payload bytes were read")
            }
            ProtocolError::Io(e) => write!(f, "I/O error on event stream: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

/// Parse a line of space-separated `key:value` tokens.
///
/// Keys the listener does not know about are kept. Only the first `:` splits
/// a token, so values may themselves contain colons.
pub fn parse_tokens(line: &str) -> Result<BTreeMap<String, String>, ProtocolError> {
    line.split_whitespace()
        .map(|token| {
            token
                .split_once(':')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| ProtocolError::MalformedHeader {
                    line: line.trim_end().to_string(),
                })
        })
        .collect()
}

/// One event delivered by the supervisor: header fields plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub headers: BTreeMap<String, String>,
    pub payload: String,
}

impl Command {
    /// The event class, e.g. `PROCESS_STATE_EXITED` or `TICK_60`.
    pub fn event_name(&self) -> &str {
        self.headers.get("eventname").map(String::as_str).unwrap_or("")
    }
}

/// Parsed payload of a process-state event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPayload {
    pub fields: BTreeMap<String, String>,
    /// Anything after the first payload line (log events carry data here).
    pub data: String,
}

impl EventPayload {
    /// Parse the payload's first line as `key:value` tokens.
    ///
    /// Unlike the header, a stray token here does not break framing, so it is
    /// skipped rather than rejected.
    pub fn parse(payload: &str) -> Self {
        let (first, data) = payload.split_once('\n').unwrap_or((payload, ""));
        let mut fields = BTreeMap::new();
        for token in first.split_whitespace() {
            match token.split_once(':') {
                Some((k, v)) => {
                    fields.insert(k.to_string(), v.to_string());
                }
                None => tracing::debug!(token, "skipping payload token without separator"),
            }
        }
        Self {
            fields,
            data: data.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Name the supervisor uses for this process: `group:name`, or bare `name`.
    pub fn process_key(&self) -> String {
        let name = self.get("processname").unwrap_or("");
        match self.get("groupname") {
            Some(group) if !group.is_empty() => format!("{group}:{name}"),
            _ => name.to_string(),
        }
    }
}

/// Both halves of the stdio protocol.
pub struct Channel<R, W> {
    input: R,
    output: W,
}

impl<R, W> Channel<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Signal readiness and block until a full command has arrived.
    pub async fn wait(&mut self) -> Result<Command, ProtocolError> {
        self.output.write_all(READY_TOKEN).await?;
        self.output.flush().await?;

        let mut line = String::new();
        if self.input.read_line(&mut line).await? == 0 {
            return Err(ProtocolError::Closed);
        }

        let headers = parse_tokens(&line)?;
        let len_value = headers
            .get("len")
            .ok_or_else(|| ProtocolError::MissingLength {
                line: line.trim_end().to_string(),
            })?;
        let len: usize = len_value
            .parse()
            .map_err(|_| ProtocolError::InvalidLength {
                value: len_value.clone(),
            })?;

        // Grow with the data actually received; `len` is not trusted for sizing.
        let mut payload = Vec::new();
        let read = (&mut self.input)
            .take(len as u64)
            .read_to_end(&mut payload)
            .await?;
        if read < len {
            return Err(ProtocolError::TruncatedPayload { expected: len });
        }

        Ok(Command {
            headers,
            payload: String::from_utf8_lossy(&payload).into_owned(),
        })
    }

    /// Answer the last command with `OK`.
    pub async fn acknowledge(&mut self) -> Result<(), ProtocolError> {
        self.output.write_all(OK_FRAME).await?;
        self.output.flush().await?;
        Ok(())
    }

    #[cfg(test)]
    pub fn output(&self) -> &W {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(input: &[u8]) -> Channel<&[u8], Vec<u8>> {
        Channel::new(input, Vec::new())
    }

    #[test]
    fn test_parse_tokens_preserves_unknown_keys() {
        let headers = parse_tokens("ver:3.0 server:supervisor len:0 eventname:TICK_60\n").unwrap();
        assert_eq!(headers.get("ver").unwrap(), "3.0");
        assert_eq!(headers.get("server").unwrap(), "supervisor");
        assert_eq!(headers.get("eventname").unwrap(), "TICK_60");
    }

    #[test]
    fn test_parse_tokens_splits_on_first_colon() {
        let headers = parse_tokens("name:grp:proc").unwrap();
        assert_eq!(headers.get("name").unwrap(), "grp:proc");
    }

    #[test]
    fn test_parse_tokens_rejects_bare_token() {
        let err = parse_tokens("eventname:TICK_60 garbage len:0").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedHeader { .. }));
    }

    #[test]
    fn test_payload_fields_and_process_key() {
        let payload =
            EventPayload::parse("processname:proc groupname:grp from_state:RUNNING expected:0 pid:123");
        assert_eq!(payload.get("processname"), Some("proc"));
        assert_eq!(payload.get("from_state"), Some("RUNNING"));
        assert_eq!(payload.get("expected"), Some("0"));
        assert_eq!(payload.get("pid"), Some("123"));
        assert_eq!(payload.process_key(), "grp:proc");
        assert!(payload.data.is_empty());
    }

    #[test]
    fn test_payload_without_group_uses_bare_name() {
        let payload = EventPayload::parse("processname:web expected:1");
        assert_eq!(payload.process_key(), "web");
    }

    #[test]
    fn test_payload_keeps_data_after_first_line() {
        let payload = EventPayload::parse("processname:web channel:stdout\nhello\nworld");
        assert_eq!(payload.get("channel"), Some("stdout"));
        assert_eq!(payload.data, "hello\nworld");
    }

    #[test]
    fn test_payload_skips_bare_tokens() {
        let payload = EventPayload::parse("processname:web oops pid:7");
        assert_eq!(payload.fields.len(), 2);
    }

    #[tokio::test]
    async fn test_wait_reads_header_and_payload() {
        let body = "processname:proc groupname:grp from_state:RUNNING expected:0 pid:123";
        let input = format!(
            "ver:3.0 len:{} eventname:PROCESS_STATE_EXITED\n{body}",
            body.len()
        );
        let mut ch = channel(input.as_bytes());

        let cmd = ch.wait().await.unwrap();
        assert_eq!(cmd.event_name(), "PROCESS_STATE_EXITED");
        assert_eq!(cmd.payload, body);
        assert_eq!(ch.output().as_slice(), READY_TOKEN);
    }

    #[tokio::test]
    async fn test_wait_reads_consecutive_commands() {
        let input = b"eventname:TICK_60 len:4\nwheneventname:TICK_60 len:0\n";
        let mut ch = channel(input);

        assert_eq!(ch.wait().await.unwrap().payload, "when");
        ch.acknowledge().await.unwrap();
        assert_eq!(ch.wait().await.unwrap().payload, "");
        ch.acknowledge().await.unwrap();

        assert_eq!(
            ch.output().as_slice(),
            b"READY\nRESULT 2\nOKREADY\nRESULT 2\nOK".as_slice()
        );
    }

    #[tokio::test]
    async fn test_wait_missing_len_is_fatal() {
        let mut ch = channel(b"eventname:TICK_60\n");
        let err = ch.wait().await.unwrap_err();
        assert!(matches!(err, ProtocolError::MissingLength { .. }));
    }

    #[tokio::test]
    async fn test_wait_non_numeric_len_is_fatal() {
        let mut ch = channel(b"eventname:TICK_60 len:ten\n");
        let err = ch.wait().await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidLength { .. }));
        assert!(err.to_string().contains("ten"));
    }

    #[tokio::test]
    async fn test_wait_short_payload_is_fatal() {
        let mut ch = channel(b"eventname:PROCESS_STATE_EXITED len:50\nexpected:0");
        let err = ch.wait().await.unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedPayload { expected: 50 }));
    }

    #[tokio::test]
    async fn test_wait_huge_len_is_truncated_not_allocated() {
        let mut ch = channel(b"eventname:PROCESS_STATE_EXITED len:99999999999999
expected:0");
        let err = ch.wait().await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::TruncatedPayload {
                expected: 99999999999999
            }
        ));
    }

    #[tokio::test]
    async fn test_wait_on_closed_stream() {
        let mut ch = channel(b"");
        assert!(matches!(ch.wait().await.unwrap_err(), ProtocolError::Closed));
    }

    #[tokio::test]
    async fn test_acknowledge_frame() {
        let mut ch = channel(b"");
        ch.acknowledge().await.unwrap();
        assert_eq!(ch.output().as_slice(), b"RESULT 2\nOK");
    }
}

//! XML-RPC client for the supervisor's log-tail methods.
//!
//! The supervisor publishes its RPC endpoint in `SUPERVISOR_SERVER_URL`,
//! either `http://host:port` or `unix:///path/to/supervisor.sock`. Requests
//! go to `/RPC2`. Only the calls the listener needs are implemented.
use crate::tail::{LogAccess, LogAccessError, LogChunk, Stream};
use base64::Engine;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const RPC_PATH: &str = "/RPC2";

static FAULT_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<name>faultCode</name>\s*<value>\s*<(?:int|i4)>(-?\d+)</(?:int|i4)>").unwrap()
});
static FAULT_STRING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<name>faultString</name>\s*<value>\s*(?:<string>)?(.*?)(?:</string>)?\s*</value>")
        .unwrap()
});
static VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<value>\s*(?:<string>(.*?)</string>|<string\s*/>|<(?:int|i4)>(-?\d+)</(?:int|i4)>|<boolean>([01])</boolean>|([^<]*))\s*</value>",
    )
    .unwrap()
});

/// A scalar from an XML-RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RpcValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Transport {
    Http(url::Url),
    Unix(PathBuf),
}

/// Supervisor log access over XML-RPC.
pub struct SupervisorRpc {
    transport: Transport,
    timeout: Duration,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl SupervisorRpc {
    pub fn new(
        server_url: &str,
        username: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self, LogAccessError> {
        let transport = parse_server_url(server_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LogAccessError::Transport(format!("http client error: {e}")))?;
        Ok(Self {
            transport,
            timeout,
            username,
            password,
            client,
        })
    }

    async fn call(&self, method: &str, params: &[RpcParam<'_>]) -> Result<Vec<RpcValue>, LogAccessError> {
        let body = method_call(method, params);
        tracing::debug!(method, "calling supervisor");
        let response = match &self.transport {
            Transport::Http(base) => self.post_http(base, body).await?,
            Transport::Unix(path) => self.post_unix(path, &body).await?,
        };
        parse_response(&response)
    }

    async fn post_http(&self, base: &url::Url, body: String) -> Result<String, LogAccessError> {
        let endpoint = base
            .join(RPC_PATH)
            .map_err(|e| LogAccessError::Transport(e.to_string()))?;
        let mut request = self
            .client
            .post(endpoint)
            .header("Content-Type", "text/xml")
            .body(body);
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_ref());
        }
        let resp = request
            .send()
            .await
            .map_err(|e| LogAccessError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(LogAccessError::Status {
                code: resp.status().as_u16(),
            });
        }
        resp.text()
            .await
            .map_err(|e| LogAccessError::Transport(e.to_string()))
    }

    // reqwest has no Unix socket support, so the request is framed by hand.
    // The whole exchange shares one deadline, like the HTTP client's timeout.
    async fn post_unix(&self, path: &Path, body: &str) -> Result<String, LogAccessError> {
        let request = http_request(body, self.auth_header().as_deref());
        let exchange = async {
            let mut stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(|e| LogAccessError::Transport(format!("{}: {e}", path.display())))?;
            stream
                .write_all(request.as_bytes())
                .await
                .map_err(|e| LogAccessError::Transport(e.to_string()))?;

            let mut raw = Vec::new();
            stream
                .read_to_end(&mut raw)
                .await
                .map_err(|e| LogAccessError::Transport(e.to_string()))?;
            Ok::<_, LogAccessError>(raw)
        };

        let raw = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                LogAccessError::Transport(format!(
                    "{}: no response within {}s",
                    path.display(),
                    self.timeout.as_secs_f64()
                ))
            })??;
        split_http_response(&String::from_utf8_lossy(&raw))
    }

    fn auth_header(&self) -> Option<String> {
        let user = self.username.as_ref()?;
        let pass = self.password.as_deref().unwrap_or("");
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        Some(format!("Basic {token}"))
    }
}

impl LogAccess for SupervisorRpc {
    async fn tail_log(
        &self,
        stream: Stream,
        process_key: &str,
        offset: u64,
        length: u64,
    ) -> Result<LogChunk, LogAccessError> {
        let method = match stream {
            Stream::Stdout => "supervisor.tailProcessStdoutLog",
            Stream::Stderr => "supervisor.tailProcessStderrLog",
        };
        let values = self
            .call(
                method,
                &[
                    RpcParam::Str(process_key),
                    RpcParam::Int(offset),
                    RpcParam::Int(length),
                ],
            )
            .await?;
        chunk_from_values(values)
    }
}

#[derive(Debug, Clone, Copy)]
enum RpcParam<'a> {
    Str(&'a str),
    Int(u64),
}

fn parse_server_url(server_url: &str) -> Result<Transport, LogAccessError> {
    let parsed = url::Url::parse(server_url)
        .map_err(|e| LogAccessError::Transport(format!("bad server url {server_url:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(Transport::Http(parsed)),
        "unix" => Ok(Transport::Unix(PathBuf::from(parsed.path()))),
        other => Err(LogAccessError::Transport(format!(
            "unsupported server url scheme {other:?}"
        ))),
    }
}

fn method_call(method: &str, params: &[RpcParam<'_>]) -> String {
    let mut xml = format!(
        "<?xml version=\"1.0\"?>\n<methodCall>\n<methodName>{}</methodName>\n<params>\n",
        escape(method)
    );
    for param in params {
        let value = match param {
            RpcParam::Str(s) => format!("<string>{}</string>", escape(s)),
            RpcParam::Int(n) => format!("<int>{n}</int>"),
        };
        xml.push_str(&format!("<param><value>{value}</value></param>\n"));
    }
    xml.push_str("</params>\n</methodCall>\n");
    xml
}

fn http_request(body: &str, authorization: Option<&str>) -> String {
    let mut request = format!(
        "POST {RPC_PATH} HTTP/1.0\r\nHost: localhost\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n",
        body.len()
    );
    if let Some(auth) = authorization {
        request.push_str(&format!("Authorization: {auth}\r\n"));
    }
    request.push_str("\r\n");
    request.push_str(body);
    request
}

fn split_http_response(raw: &str) -> Result<String, LogAccessError> {
    let (head, body) = raw
        .split_once("\r\n\r\n")
        .ok_or_else(|| LogAccessError::Decode("no HTTP header terminator".to_string()))?;
    let code = head
        .lines()
        .next()
        .and_then(|status| status.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| LogAccessError::Decode("no HTTP status line".to_string()))?;
    if !(200..300).contains(&code) {
        return Err(LogAccessError::Status { code });
    }
    Ok(body.to_string())
}

fn parse_response(xml: &str) -> Result<Vec<RpcValue>, LogAccessError> {
    if xml.contains("<fault>") {
        let code = FAULT_CODE
            .captures(xml)
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(0);
        let message = FAULT_STRING
            .captures(xml)
            .map(|c| unescape(&c[1]))
            .unwrap_or_default();
        return Err(LogAccessError::Fault { code, message });
    }

    let values = VALUE
        .captures_iter(xml)
        .map(|c| {
            if let Some(s) = c.get(1) {
                RpcValue::Str(unescape(s.as_str()))
            } else if let Some(n) = c.get(2) {
                RpcValue::Int(n.as_str().parse().unwrap_or(0))
            } else if let Some(b) = c.get(3) {
                RpcValue::Bool(b.as_str() == "1")
            } else {
                RpcValue::Str(unescape(c.get(4).map_or("", |m| m.as_str())))
            }
        })
        .collect();
    Ok(values)
}

fn chunk_from_values(values: Vec<RpcValue>) -> Result<LogChunk, LogAccessError> {
    match values.as_slice() {
        [RpcValue::Str(bytes), RpcValue::Int(offset), RpcValue::Bool(overflow)] => Ok(LogChunk {
            bytes: bytes.clone(),
            offset: u64::try_from(*offset).unwrap_or(0),
            overflow: *overflow,
        }),
        other => Err(LogAccessError::Decode(format!(
            "expected [string, int, boolean], got {other:?}"
        ))),
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

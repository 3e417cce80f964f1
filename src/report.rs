//! Turn an actionable event into alert text.
use crate::classify::Action;
use crate::protocol::EventPayload;
use crate::sink::alert_title;
use crate::tail::{banner_block, LogAccess, Stream, TailReader};
use std::collections::BTreeMap;

/// How an immediate report lays out its tails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStyle {
    /// One message body with banner-wrapped tails; fingerprint over the body.
    Combined,
    /// Header and tails as separate fields; fingerprint over the tails only.
    Split,
}

/// Header plus whatever tails were requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub header: String,
    pub stderr: Option<String>,
    pub stdout: Option<String>,
}

/// A fully rendered alert, ready for the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub title: String,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
}

impl Notification {
    /// Header followed by banner-wrapped stderr and stdout tails.
    pub fn combined(&self) -> String {
        let mut msg = format!("{}\n\n", self.header);
        if let Some(stderr) = &self.stderr {
            msg.push_str(&banner_block(Stream::Stderr, stderr));
        }
        if let Some(stdout) = &self.stdout {
            msg.push_str(&banner_block(Stream::Stdout, stdout));
        }
        msg
    }

    pub fn render(&self, style: ReportStyle, label: &str) -> Outgoing {
        match style {
            ReportStyle::Combined => {
                let body = self.combined();
                Outgoing {
                    title: alert_title(label, &body),
                    body,
                    metadata: BTreeMap::new(),
                }
            }
            ReportStyle::Split => self.render_split(label),
        }
    }

    // The last stderr line usually names the error, so it is repeated in its
    // own field. Banners never reach the fingerprint.
    fn render_split(&self, label: &str) -> Outgoing {
        let stderr = self.stderr.as_deref().unwrap_or("");
        let stdout = self.stdout.as_deref().unwrap_or("");
        let stderr_last_line = stderr.lines().last().unwrap_or("").to_string();

        let mut metadata = BTreeMap::new();
        metadata.insert("header".to_string(), self.header.clone());
        metadata.insert("stderr".to_string(), stderr.to_string());
        metadata.insert("stderr_last_line".to_string(), stderr_last_line);
        metadata.insert("stdout".to_string(), stdout.to_string());

        Outgoing {
            title: alert_title(label, &format!("{stderr}{stdout}")),
            body: self.header.clone(),
            metadata,
        }
    }
}

/// Collects the context for a report.
#[derive(Debug, Clone, Copy)]
pub struct Reporter {
    stderr_lines: usize,
    stdout_lines: usize,
}

impl Reporter {
    pub fn new(stderr_lines: usize, stdout_lines: usize) -> Self {
        Self {
            stderr_lines,
            stdout_lines,
        }
    }

    /// Build the notification for `action`; a line count of 0 skips that tail.
    pub async fn build<L: LogAccess>(
        &self,
        tails: &TailReader<L>,
        action: Action,
        payload: &EventPayload,
    ) -> Notification {
        let key = payload.process_key();
        let header = match action {
            Action::ReportFatal => format!("Process {key} failed to start too many times"),
            _ => format!("Process {key} exited unexpectedly"),
        };

        let stderr = if self.stderr_lines > 0 {
            Some(tails.last_lines(Stream::Stderr, &key, self.stderr_lines).await)
        } else {
            None
        };
        let stdout = if self.stdout_lines > 0 {
            Some(tails.last_lines(Stream::Stdout, &key, self.stdout_lines).await)
        } else {
            None
        };

        Notification {
            header,
            stderr,
            stdout,
        }
    }
}

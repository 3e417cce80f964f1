//! Time-windowed batching of alerts, flushed on supervisor tick events.
use crate::sink::alert_title;
use chrono::{DateTime, Local};

/// Number of characters of a flushed batch shown in the listener's own log.
const PREVIEW_LEN: usize = 76;

/// Minutes between ticks for a `TICK_<seconds>` event name.
pub fn tick_minutes(event_name: &str) -> Option<f64> {
    let secs: u32 = event_name.strip_prefix("TICK_")?.parse().ok()?;
    if secs == 0 {
        return None;
    }
    Some(f64::from(secs) / 60.0)
}

#[derive(Debug, Clone)]
struct BatchEntry {
    at: DateTime<Local>,
    text: String,
}

/// A consolidated batch ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flush {
    pub title: String,
    pub body: String,
    pub count: usize,
}

impl Flush {
    pub fn preview(&self) -> String {
        self.body.chars().take(PREVIEW_LEN).collect()
    }
}

/// In-memory batch of report texts, owned by the single listener loop.
#[derive(Debug)]
pub struct Batcher {
    label: &'static str,
    interval_mins: f64,
    tick_mins: f64,
    elapsed_mins: f64,
    entries: Vec<BatchEntry>,
}

impl Batcher {
    pub fn new(label: &'static str, interval_mins: f64, tick_mins: f64) -> Self {
        Self {
            label,
            interval_mins,
            tick_mins,
            elapsed_mins: 0.0,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, at: DateTime<Local>, text: String) {
        self.entries.push(BatchEntry { at, text });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Account for one tick. Once the interval has elapsed the batch is
    /// drained and the counter reset, and a [`Flush`] is returned if there was
    /// anything to send. The batch is empty afterwards either way.
    pub fn tick(&mut self) -> Option<Flush> {
        self.elapsed_mins += self.tick_mins;
        if self.elapsed_mins < self.interval_mins {
            tracing::debug!(
                elapsed_mins = self.elapsed_mins,
                interval_mins = self.interval_mins,
                pending = self.entries.len(),
                "tick before batch interval, holding"
            );
            return None;
        }
        self.elapsed_mins = 0.0;

        let entries = std::mem::take(&mut self.entries);
        if entries.is_empty() {
            return None;
        }

        let body = entries
            .iter()
            .map(|e| format!("{} -- {}", asctime(&e.at), e.text))
            .collect::<Vec<_>>()
            .join("\n");
        // Timestamps change on every occurrence; only the texts identify it.
        let stable = entries
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        Some(Flush {
            title: alert_title(self.label, &stable),
            body,
            count: entries.len(),
        })
    }
}

/// `YYYY-MM-DD HH:MM:SS,mmm`, the supervisor's log timestamp format.
fn asctime(at: &DateTime<Local>) -> String {
    at.format("%Y-%m-%d %H:%M:%S,%3f").to_string()
}

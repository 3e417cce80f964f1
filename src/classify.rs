//! Decide what a supervisor event means to the listener.
use crate::protocol::EventPayload;

pub const PROCESS_STATE_EXITED: &str = "PROCESS_STATE_EXITED";
pub const PROCESS_STATE_FATAL: &str = "PROCESS_STATE_FATAL";

/// Which transitions the listener cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Unexpected exits (`PROCESS_STATE_EXITED` with `expected:0`).
    Crash,
    /// Start-up failures (`PROCESS_STATE_FATAL`).
    Fatal,
    /// Collect `events` into a batch and flush on `tick_event`. Exits still
    /// go through the `expected` check.
    Batch {
        tick_event: String,
        events: Vec<String>,
    },
}

/// Outcome of classifying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Ignore,
    ReportCrash,
    ReportFatal,
    FlushTick,
}

impl Action {
    /// Label used in alert titles.
    pub fn label(&self) -> &'static str {
        match self {
            Action::ReportCrash => "CRASH",
            Action::ReportFatal => "FATAL",
            Action::Ignore | Action::FlushTick => "",
        }
    }
}

/// Classify an event by name and payload.
pub fn classify(mode: &Mode, event_name: &str, payload: &EventPayload) -> Action {
    match mode {
        Mode::Crash => {
            if event_name != PROCESS_STATE_EXITED {
                Action::Ignore
            } else if exit_was_expected(payload.get("expected")) {
                Action::Ignore
            } else {
                Action::ReportCrash
            }
        }
        Mode::Fatal => {
            if event_name == PROCESS_STATE_FATAL {
                Action::ReportFatal
            } else {
                Action::Ignore
            }
        }
        Mode::Batch { tick_event, events } => {
            if event_name == tick_event {
                Action::FlushTick
            } else if !events.iter().any(|e| e == event_name) {
                Action::Ignore
            } else if event_name == PROCESS_STATE_EXITED {
                if exit_was_expected(payload.get("expected")) {
                    Action::Ignore
                } else {
                    Action::ReportCrash
                }
            } else {
                Action::ReportFatal
            }
        }
    }
}

/// Interpret the payload's `expected` field as an integer truth value.
///
/// `"0"` and `"00"` are false, any other integer is true. A missing or
/// non-integer value counts as unexpected so the exit still gets reported.
pub fn exit_was_expected(raw: Option<&str>) -> bool {
    let Some(raw) = raw else {
        tracing::warn!("exit event has no expected field, treating as unexpected");
        return false;
    };
    match raw.trim().parse::<i64>() {
        Ok(value) => value != 0,
        Err(_) => {
            tracing::warn!(expected = raw, "unparseable expected field, treating as unexpected");
            false
        }
    }
}

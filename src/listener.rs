//! The listener loop: wait, classify, report or batch, acknowledge.
use crate::batch::Batcher;
use crate::classify::{classify, Action, Mode};
use crate::config::ListenerConfig;
use crate::protocol::{Channel, Command, EventPayload, ProtocolError};
use crate::report::{ReportStyle, Reporter};
use crate::sink::AlertSink;
use crate::tail::{LogAccess, TailReader};
use chrono::Local;
use tokio::io::{AsyncBufRead, AsyncWrite};

/// Where actionable reports go.
enum Delivery {
    /// Send each report before acknowledging its event.
    Immediate(ReportStyle),
    /// Queue reports and send them together on a flush tick.
    Batched(Batcher),
}

/// What handling one command amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ignored,
    Sent,
    SendFailed,
    Queued,
    Held,
}

/// One listener process: a protocol engine driven by a classifier mode.
pub struct Listener<R, W, L, S> {
    channel: Channel<R, W>,
    mode: Mode,
    reporter: Reporter,
    delivery: Delivery,
    tails: TailReader<L>,
    sink: S,
}

impl<R, W, L, S> Listener<R, W, L, S>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    L: LogAccess,
    S: AlertSink,
{
    pub fn new(config: &ListenerConfig, channel: Channel<R, W>, logs: L, sink: S) -> Self {
        let delivery = match &config.batch {
            Some(batch) => Delivery::Batched(Batcher::new(
                Action::ReportFatal.label(),
                batch.interval_mins,
                batch.tick_mins,
            )),
            None => Delivery::Immediate(config.style),
        };
        Self {
            channel,
            mode: config.mode.clone(),
            reporter: Reporter::new(config.stderr_lines, config.stdout_lines),
            delivery,
            tails: TailReader::new(logs),
            sink,
        }
    }

    /// Serve events until the supervisor closes the stream.
    ///
    /// Only protocol errors end the loop; everything else is logged and the
    /// event is still acknowledged.
    pub async fn run(&mut self) -> Result<(), ProtocolError> {
        loop {
            match self.run_once().await {
                Ok(_) => {}
                Err(ProtocolError::Closed) => {
                    tracing::info!("event stream closed, exiting");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One full protocol cycle.
    pub async fn run_once(&mut self) -> Result<Outcome, ProtocolError> {
        let command = self.channel.wait().await?;
        let outcome = self.handle(&command).await;
        self.channel.acknowledge().await?;
        Ok(outcome)
    }

    async fn handle(&mut self, command: &Command) -> Outcome {
        let event_name = command.event_name();
        let payload = EventPayload::parse(&command.payload);
        let action = classify(&self.mode, event_name, &payload);
        tracing::debug!(
            event = event_name,
            ?action,
            data_bytes = payload.data.len(),
            "classified event"
        );

        match action {
            Action::Ignore => Outcome::Ignored,
            Action::FlushTick => self.flush().await,
            Action::ReportCrash | Action::ReportFatal => {
                let notification = self.reporter.build(&self.tails, action, &payload).await;
                match &mut self.delivery {
                    Delivery::Batched(batcher) => {
                        let text = notification.combined();
                        tracing::info!(
                            process = %payload.process_key(),
                            pending = batcher.len() + 1,
                            "queued report for next batch"
                        );
                        batcher.push(Local::now(), text);
                        Outcome::Queued
                    }
                    Delivery::Immediate(style) => {
                        let out = notification.render(*style, action.label());
                        tracing::info!(
                            process = %payload.process_key(),
                            kind = action.label(),
                            "unexpected transition, notifying sentry"
                        );
                        self.deliver(&out.title, &out.body, &out.metadata).await
                    }
                }
            }
        }
    }

    async fn flush(&mut self) -> Outcome {
        let Delivery::Batched(batcher) = &mut self.delivery else {
            return Outcome::Ignored;
        };
        // The batch is already drained here; a failed send is not retried.
        let Some(flush) = batcher.tick() else {
            return Outcome::Held;
        };
        tracing::info!(
            count = flush.count,
            preview = %flush.preview(),
            "sending sentry notification"
        );
        self.deliver(&flush.title, &flush.body, &Default::default())
            .await
    }

    async fn deliver(
        &self,
        title: &str,
        body: &str,
        metadata: &std::collections::BTreeMap<String, String>,
    ) -> Outcome {
        match self.sink.send(title, body, metadata).await {
            Ok(()) => {
                tracing::debug!(title, "alert delivered");
                Outcome::Sent
            }
            Err(e) => {
                tracing::error!(error = %e, title, "error notifying sentry");
                Outcome::SendFailed
            }
        }
    }

    #[cfg(test)]
    fn channel(&self) -> &Channel<R, W> {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchSettings, SentrySettings, SupervisorSettings};
    use crate::protocol::{OK_FRAME, READY_TOKEN};
    use crate::sink::fingerprint;
    use crate::testutil::{FakeLogs, FakeSink};
    use std::time::Duration;

    const EXIT_UNEXPECTED: &str = "processname:foo groupname:bar from_state:RUNNING expected:0 pid:1";
    const EXIT_EXPECTED: &str = "processname:foo groupname:bar from_state:RUNNING expected:1 pid:1";
    const FATAL: &str = "processname:foo groupname:bar from_state:BACKOFF";

    fn frame(event: &str, payload: &str) -> String {
        format!("ver:3.0 server:supervisor serial:1 pool:listener poolserial:1 eventname:{event} len:{}\n{payload}", payload.len())
    }

    fn config(mode: Mode, style: ReportStyle, lines: usize) -> ListenerConfig {
        let batch = match mode {
            Mode::Batch { .. } => Some(BatchSettings {
                interval_mins: 1.0,
                tick_mins: 1.0,
            }),
            _ => None,
        };
        ListenerConfig {
            mode,
            style,
            stderr_lines: lines,
            stdout_lines: lines,
            batch,
            sentry: SentrySettings {
                dsn: "https://key@sentry.io/1".to_string(),
                logger: "superlance".to_string(),
                string_max_length: 4096,
                timeout: Duration::from_secs(1),
            },
            supervisor: SupervisorSettings {
                server_url: Some("unix:///tmp/supervisor.sock".to_string()),
                username: None,
                password: None,
                timeout: Duration::from_secs(1),
            },
        }
    }

    fn batch_mode() -> Mode {
        Mode::Batch {
            tick_event: "TICK_60".to_string(),
            events: vec!["PROCESS_STATE_FATAL".to_string()],
        }
    }

    fn listener<'a>(
        cfg: &ListenerConfig,
        input: &'a [u8],
        logs: FakeLogs,
        sink: FakeSink,
    ) -> Listener<&'a [u8], Vec<u8>, FakeLogs, FakeSink> {
        Listener::new(cfg, Channel::new(input, Vec::new()), logs, sink)
    }

    fn acks(l: &Listener<&[u8], Vec<u8>, FakeLogs, FakeSink>) -> usize {
        let out = l.channel().output();
        out.windows(OK_FRAME.len()).filter(|w| *w == OK_FRAME).count()
    }

    #[tokio::test]
    async fn test_unrelated_event_is_ignored_and_acknowledged() {
        let input = frame("PROCESS_STATE_STOPPED", EXIT_UNEXPECTED);
        let cfg = config(Mode::Crash, ReportStyle::Combined, 10);
        let mut l = listener(&cfg, input.as_bytes(), FakeLogs::default(), FakeSink::new());

        assert_eq!(l.run_once().await.unwrap(), Outcome::Ignored);
        assert_eq!(acks(&l), 1);
        assert!(l.sink.sent().is_empty());
        assert!(l.tails.access().calls().is_empty());

        let out = l.channel().output();
        assert!(out.starts_with(READY_TOKEN));
        assert!(out.ends_with(OK_FRAME));
    }

    #[tokio::test]
    async fn test_fatal_mode_ignores_exits() {
        let input = frame("PROCESS_STATE_EXITED", EXIT_UNEXPECTED);
        let cfg = config(Mode::Fatal, ReportStyle::Split, 10);
        let mut l = listener(&cfg, input.as_bytes(), FakeLogs::default(), FakeSink::new());

        assert_eq!(l.run_once().await.unwrap(), Outcome::Ignored);
        assert_eq!(acks(&l), 1);
        assert!(l.sink.sent().is_empty());
        assert!(l.tails.access().calls().is_empty());
    }

    #[tokio::test]
    async fn test_batch_mode_ignores_other_tick_rates() {
        let input = format!("{}{}", frame("TICK_5", "when:1"), frame("PROCESS_STATE_FATAL", FATAL));
        let cfg = config(batch_mode(), ReportStyle::Combined, 0);
        let mut l = listener(&cfg, input.as_bytes(), FakeLogs::default(), FakeSink::new());

        assert_eq!(l.run_once().await.unwrap(), Outcome::Ignored);
        assert_eq!(acks(&l), 1);
        assert!(l.sink.sent().is_empty());

        // A TICK_5 must not have advanced the TICK_60 interval or flushed.
        assert_eq!(l.run_once().await.unwrap(), Outcome::Queued);
        assert!(l.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_batched_exits_skip_expected_and_read_as_crashes() {
        let input = format!(
            "{}{}{}",
            frame("PROCESS_STATE_EXITED", EXIT_EXPECTED),
            frame("PROCESS_STATE_EXITED", EXIT_UNEXPECTED),
            frame("TICK_60", ""),
        );
        let cfg = config(
            Mode::Batch {
                tick_event: "TICK_60".to_string(),
                events: vec!["PROCESS_STATE_EXITED".to_string()],
            },
            ReportStyle::Combined,
            0,
        );
        let mut l = listener(&cfg, input.as_bytes(), FakeLogs::default(), FakeSink::new());

        assert_eq!(l.run_once().await.unwrap(), Outcome::Ignored);
        assert_eq!(l.run_once().await.unwrap(), Outcome::Queued);
        assert_eq!(l.run_once().await.unwrap(), Outcome::Sent);

        let sent = l.sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains(" -- Process bar:foo exited unexpectedly"));
        assert!(!sent[0].body.contains("failed to start"));
        assert_eq!(acks(&l), 3);
    }

    #[tokio::test]
    async fn test_expected_exit_is_ignored() {
        let input = frame("PROCESS_STATE_EXITED", EXIT_EXPECTED);
        let cfg = config(Mode::Crash, ReportStyle::Combined, 10);
        let mut l = listener(&cfg, input.as_bytes(), FakeLogs::default(), FakeSink::new());

        assert_eq!(l.run_once().await.unwrap(), Outcome::Ignored);
        assert!(l.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_crash_sends_combined_report_before_ack() {
        let input = frame("PROCESS_STATE_EXITED", EXIT_UNEXPECTED);
        let cfg = config(Mode::Crash, ReportStyle::Combined, 2);
        let logs = FakeLogs::new("e1\ne2\ne3\n", "o1\n");
        let mut l = listener(&cfg, input.as_bytes(), logs, FakeSink::new());

        assert_eq!(l.run_once().await.unwrap(), Outcome::Sent);
        let sent = l.sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.starts_with("Process bar:foo exited unexpectedly\n\n"));
        assert!(sent[0].body.contains("e2\ne3\n"));
        assert!(!sent[0].body.contains("e1"));
        assert_eq!(
            sent[0].title,
            format!("Supervisor CRASH: {}", fingerprint(&sent[0].body))
        );
        assert_eq!(acks(&l), 1);
    }

    #[tokio::test]
    async fn test_fatal_report_uses_split_fields() {
        let input = frame("PROCESS_STATE_FATAL", FATAL);
        let cfg = config(Mode::Fatal, ReportStyle::Split, 10);
        let logs = FakeLogs::new("boot\nImportError: x\n", "");
        let mut l = listener(&cfg, input.as_bytes(), logs, FakeSink::new());

        assert_eq!(l.run_once().await.unwrap(), Outcome::Sent);
        let sent = l.sink.sent();
        assert!(sent[0].title.starts_with("Supervisor FATAL: "));
        assert_eq!(sent[0].body, "Process bar:foo failed to start too many times");
        assert_eq!(sent[0].metadata["stderr_last_line"], "ImportError: x");
    }

    #[tokio::test]
    async fn test_repeated_failures_share_a_title() {
        let input = format!(
            "{}{}",
            frame("PROCESS_STATE_EXITED", EXIT_UNEXPECTED),
            frame("PROCESS_STATE_EXITED", EXIT_UNEXPECTED)
        );
        let cfg = config(Mode::Crash, ReportStyle::Split, 10);
        let mut l = listener(&cfg, input.as_bytes(), FakeLogs::with_stderr("boom\n"), FakeSink::new());

        l.run_once().await.unwrap();
        l.run_once().await.unwrap();
        let sent = l.sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].title, sent[1].title);
    }

    #[tokio::test]
    async fn test_sink_failure_still_acknowledges() {
        let input = frame("PROCESS_STATE_EXITED", EXIT_UNEXPECTED);
        let cfg = config(Mode::Crash, ReportStyle::Combined, 10);
        let mut l = listener(&cfg, input.as_bytes(), FakeLogs::default(), FakeSink::failing());

        assert_eq!(l.run_once().await.unwrap(), Outcome::SendFailed);
        assert_eq!(acks(&l), 1);
    }

    #[tokio::test]
    async fn test_log_failure_still_reports() {
        let input = frame("PROCESS_STATE_EXITED", EXIT_UNEXPECTED);
        let cfg = config(Mode::Crash, ReportStyle::Combined, 10);
        let mut l = listener(&cfg, input.as_bytes(), FakeLogs::failing(), FakeSink::new());

        assert_eq!(l.run_once().await.unwrap(), Outcome::Sent);
        assert_eq!(l.sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_tick_report_tick() {
        let input = format!(
            "{}{}{}",
            frame("TICK_60", "when:1700000000"),
            frame("PROCESS_STATE_FATAL", FATAL),
            frame("TICK_60", "when:1700000060"),
        );
        let cfg = config(batch_mode(), ReportStyle::Combined, 10);
        let mut l = listener(&cfg, input.as_bytes(), FakeLogs::with_stderr("nope\n"), FakeSink::new());

        assert_eq!(l.run_once().await.unwrap(), Outcome::Held);
        assert_eq!(acks(&l), 1);
        assert!(l.sink.sent().is_empty());

        assert_eq!(l.run_once().await.unwrap(), Outcome::Queued);
        assert_eq!(acks(&l), 2);
        assert!(l.sink.sent().is_empty());

        assert_eq!(l.run_once().await.unwrap(), Outcome::Sent);
        assert_eq!(acks(&l), 3);
        let sent = l.sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].title.starts_with("Supervisor FATAL: "));
        assert!(sent[0]
            .body
            .contains(" -- Process bar:foo failed to start too many times"));
        assert!(sent[0].body.contains("nope"));
    }

    #[tokio::test]
    async fn test_batch_is_cleared_even_when_send_fails() {
        let input = format!(
            "{}{}{}",
            frame("PROCESS_STATE_FATAL", FATAL),
            frame("TICK_60", ""),
            frame("TICK_60", ""),
        );
        let cfg = config(batch_mode(), ReportStyle::Combined, 0);
        let mut l = listener(&cfg, input.as_bytes(), FakeLogs::default(), FakeSink::failing());

        assert_eq!(l.run_once().await.unwrap(), Outcome::Queued);
        assert_eq!(l.run_once().await.unwrap(), Outcome::SendFailed);
        assert_eq!(l.run_once().await.unwrap(), Outcome::Held);
        assert_eq!(l.sink.sent().len(), 1);
        assert_eq!(acks(&l), 3);
    }

    #[tokio::test]
    async fn test_batch_groups_several_reports() {
        let input = format!(
            "{}{}{}",
            frame("PROCESS_STATE_FATAL", FATAL),
            frame("PROCESS_STATE_FATAL", "processname:web groupname:web"),
            frame("TICK_60", ""),
        );
        let cfg = config(batch_mode(), ReportStyle::Combined, 0);
        let mut l = listener(&cfg, input.as_bytes(), FakeLogs::default(), FakeSink::new());

        for _ in 0..3 {
            l.run_once().await.unwrap();
        }
        let sent = l.sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("Process bar:foo"));
        assert!(sent[0].body.contains("Process web:web"));
    }

    #[tokio::test]
    async fn test_run_stops_cleanly_when_stream_closes() {
        let input = format!(
            "{}{}",
            frame("PROCESS_STATE_EXITED", EXIT_EXPECTED),
            frame("PROCESS_STATE_EXITED", EXIT_UNEXPECTED)
        );
        let cfg = config(Mode::Crash, ReportStyle::Combined, 0);
        let mut l = listener(&cfg, input.as_bytes(), FakeLogs::default(), FakeSink::new());

        l.run().await.unwrap();
        assert_eq!(acks(&l), 2);
        assert_eq!(l.sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_run_fails_on_protocol_desync() {
        let input = format!("{}eventname:TICK_60\n", frame("TICK_60", ""));
        let cfg = config(Mode::Crash, ReportStyle::Combined, 0);
        let mut l = listener(&cfg, input.as_bytes(), FakeLogs::default(), FakeSink::new());

        let err = l.run().await.unwrap_err();
        assert!(matches!(err, ProtocolError::MissingLength { .. }));
        assert_eq!(acks(&l), 1);
    }
}

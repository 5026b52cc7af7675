//! Asynchronous measurement protocol built on status-byte polling.
//!
//! The instrument is armed so that operation-complete events raise the
//! request-service bit of the status byte (`*ESE 1; *SRE 32`). A triggered
//! measurement is then `INITiate;*OPC` followed by polling `*STB?` until the
//! RQS/MSS bit appears, at which point `*ESR?` is read to clear the event.
//! Polling keeps the session free for other traffic between polls, unlike a
//! blocking `*OPC?` query.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{esr, status, ScpiSession};
use crate::error::{ScpiError, ScpiResult};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Status-byte driven trigger/detect state machine for one instrument.
pub struct TriggerProtocol {
    session: ScpiSession,
    trig_cmd: String,
    poll_interval: Duration,
    last_event_status: AtomicU8,
}

impl TriggerProtocol {
    /// Protocol with the standard `INITiate;*OPC` trigger command.
    pub fn new(session: ScpiSession) -> Self {
        Self {
            session,
            trig_cmd: "INITiate;*OPC".to_string(),
            poll_interval: POLL_INTERVAL,
            last_event_status: AtomicU8::new(0),
        }
    }

    /// Replace the trigger command (some instruments need e.g.
    /// `INITiate:IMMediate;*OPC` or a subsystem-specific arm).
    pub fn with_trig_command(mut self, cmd: &str) -> Self {
        self.trig_cmd = cmd.to_string();
        self
    }

    /// Replace the 50 ms poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Arm the instrument: clear status, route operation-complete events to
    /// the status byte.
    pub async fn init(&self) -> ScpiResult<()> {
        self.session.clear_status().await?;
        self.session.write("*ESE 1;*SRE 32").await
    }

    /// Event status register captured by the last successful detect.
    pub fn last_event_status(&self) -> u8 {
        self.last_event_status.load(Ordering::Relaxed)
    }

    /// Drain stale completion state left by an aborted or timed-out
    /// measurement, so the next detect cannot fire on an old event.
    async fn cleanup(&self) -> ScpiResult<()> {
        let esr_val = self.session.event_status().await?;
        if esr_val & esr::OPC != 0 {
            warn!(
                resource = %self.session.resource(),
                "unread operation-complete event cleared before trigger"
            );
        }
        let mut polls = 0;
        loop {
            let stb = self.session.read_status_byte().await?;
            if stb & status::RQS == 0 {
                break;
            }
            warn!(
                resource = %self.session.resource(),
                stb, "stale service request cleared before trigger"
            );
            self.session.event_status().await?;
            polls += 1;
            if polls >= 8 {
                return Err(ScpiError::InstrumentError {
                    code: 0,
                    message: "service request stuck on; status model misconfigured".into(),
                });
            }
        }
        Ok(())
    }

    /// Start a measurement. Returns immediately; pair with
    /// [`detect`](Self::detect) or [`wait_after_trig`](Self::wait_after_trig).
    pub async fn trig(&self) -> ScpiResult<()> {
        self.cleanup().await?;
        debug!(resource = %self.session.resource(), cmd = %self.trig_cmd, "trigger");
        self.session.write(&self.trig_cmd).await
    }

    /// Poll for completion for at most `max_time`.
    ///
    /// Returns `Ok(true)` when the operation completed (the event status
    /// register has been read and is available through
    /// [`last_event_status`](Self::last_event_status)); `Ok(false)` when the
    /// window expired without completion.
    pub async fn detect(&self, max_time: Duration) -> ScpiResult<bool> {
        let start = Instant::now();
        loop {
            let stb = self.session.read_status_byte().await?;
            if stb & status::RQS != 0 {
                let esr_val = self.session.event_status().await?;
                self.last_event_status.store(esr_val, Ordering::Relaxed);
                debug!(
                    resource = %self.session.resource(),
                    stb, esr = esr_val, "operation complete"
                );
                return Ok(true);
            }
            if start.elapsed() >= max_time {
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Poll until completion or error out after `timeout`.
    pub async fn wait_after_trig(&self, timeout: Duration) -> ScpiResult<()> {
        if self.detect(timeout).await? {
            Ok(())
        } else {
            Err(ScpiError::TriggerTimeout(timeout))
        }
    }

    /// Trigger and wait for completion.
    pub async fn run_and_wait(&self, timeout: Duration) -> ScpiResult<()> {
        self.trig().await?;
        self.wait_after_trig(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockHandle;
    use crate::transport::MockTransport;

    fn proto() -> (TriggerProtocol, MockHandle) {
        let t = MockTransport::new();
        let h = t.handle();
        let p = TriggerProtocol::new(ScpiSession::new(Box::new(t)))
            .with_poll_interval(Duration::from_millis(1));
        (p, h)
    }

    #[tokio::test]
    async fn init_arms_the_status_model() {
        let (p, h) = proto();
        p.init().await.unwrap();
        assert_eq!(h.transcript(), vec!["*CLS", "*ESE 1;*SRE 32"]);
    }

    #[tokio::test]
    async fn run_and_wait_polls_until_rqs_then_reads_esr() {
        let (p, h) = proto();
        h.set_reply("*ESR?", "1");
        h.queue_reply("*ESR?", "0"); // cleanup read before the trigger
        h.queue_reply("*STB?", "0"); // cleanup poll
        h.queue_reply("*STB?", "0");
        h.queue_reply("*STB?", "0");
        h.set_reply("*STB?", "96"); // RQS | ESB once the sweep finishes

        p.run_and_wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(p.last_event_status(), 1);

        let transcript = h.transcript();
        assert!(transcript.contains(&"INITiate;*OPC".to_string()));
        // One cleanup poll, two idle detect polls, one completed poll.
        assert_eq!(transcript.iter().filter(|c| *c == "*STB?").count(), 4);
    }

    #[tokio::test]
    async fn detect_window_expiry_is_not_an_error() {
        let (p, h) = proto();
        h.set_reply("*STB?", "0");
        assert!(!p.detect(Duration::from_millis(5)).await.unwrap());
    }

    #[tokio::test]
    async fn wait_after_trig_times_out() {
        let (p, h) = proto();
        h.set_reply("*STB?", "0");
        let err = p
            .wait_after_trig(Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ScpiError::TriggerTimeout(_)));
    }

    #[tokio::test]
    async fn cleanup_drains_a_stale_service_request() {
        let (p, h) = proto();
        h.queue_reply("*ESR?", "1"); // stale unread completion
        h.queue_reply("*STB?", "64"); // stale RQS still raised
        h.queue_reply("*ESR?", "0"); // drained by cleanup
        h.set_reply("*STB?", "0");
        h.set_reply("*ESR?", "0");

        p.trig().await.unwrap();
        assert!(h.saw("INITiate;*OPC"));
    }

    #[tokio::test]
    async fn stuck_service_request_is_an_error() {
        let (p, h) = proto();
        h.set_reply("*ESR?", "0");
        h.set_reply("*STB?", "64"); // never clears
        let err = p.trig().await.unwrap_err();
        assert!(matches!(err, ScpiError::InstrumentError { .. }));
    }

    #[tokio::test]
    async fn custom_trigger_command() {
        let t = MockTransport::new();
        let h = t.handle();
        let p = TriggerProtocol::new(ScpiSession::new(Box::new(t)))
            .with_trig_command("INITiate:IMMediate;*OPC");
        h.set_reply("*ESR?", "0");
        h.set_reply("*STB?", "0");
        p.trig().await.unwrap();
        assert!(h.saw("INITiate:IMMediate;*OPC"));
    }
}

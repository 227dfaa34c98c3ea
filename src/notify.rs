//! Delivery of risk alerts to the outside world.
//!
//! The engine only hands alerts to an `AlertDispatcher`; a background task
//! fans them out to the configured sinks, so a slow sink never blocks a run.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{AlertLevel, RiskAlert};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, alert: &RiskAlert) -> Result<(), String>;
}

/// Writes alerts to the structured log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &RiskAlert) -> Result<(), String> {
        let level = match alert.level {
            AlertLevel::Info => Level::Info,
            AlertLevel::Warning => Level::Warn,
            AlertLevel::Critical => Level::Error,
        };
        log(
            level,
            Domain::Risk,
            "alert",
            obj(&[
                ("message", v_str(&alert.message)),
                ("reasons", v_str(&alert.reasons.join(","))),
                ("equity", v_num(alert.equity)),
            ]),
        );
        Ok(())
    }
}

/// POSTs each alert as JSON.
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self { client: Client::new(), url: url.into() }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &RiskAlert) -> Result<(), String> {
        let resp = self.client.post(&self.url).json(alert).send().await.map_err(|e| e.to_string())?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook returned {}", resp.status()))
        }
    }
}

/// Collects alerts into a channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RiskAlert>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RiskAlert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn deliver(&self, alert: &RiskAlert) -> Result<(), String> {
        self.tx.send(alert.clone()).map_err(|_| "receiver dropped".to_string())
    }
}

/// Cheap, cloneable handle runs use to raise alerts.
#[derive(Clone)]
pub struct AlertDispatcher {
    tx: mpsc::UnboundedSender<RiskAlert>,
}

impl AlertDispatcher {
    /// Returns false once the fan-out task has stopped.
    pub fn dispatch(&self, alert: &RiskAlert) -> bool {
        self.tx.send(alert.clone()).is_ok()
    }
}

/// Spawn the fan-out task on the current tokio runtime. A failing sink is
/// logged and skipped; the others still receive the alert.
pub fn spawn_dispatcher(sinks: Vec<Arc<dyn NotificationSink>>) -> (AlertDispatcher, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<RiskAlert>();
    let handle = tokio::spawn(async move {
        while let Some(alert) = rx.recv().await {
            for sink in &sinks {
                if let Err(e) = sink.deliver(&alert).await {
                    log(
                        Level::Warn,
                        Domain::System,
                        "notify_failed",
                        obj(&[("sink", v_str(sink.name())), ("error", v_str(&e))]),
                    );
                }
            }
        }
    });
    (AlertDispatcher { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AlertKind;

    struct Failing;

    #[async_trait]
    impl NotificationSink for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _alert: &RiskAlert) -> Result<(), String> {
            Err("down".into())
        }
    }

    fn kill_alert() -> RiskAlert {
        RiskAlert {
            level: AlertLevel::Critical,
            kind: AlertKind::StateTransition { from: "normal".into(), to: "killed".into() },
            reasons: vec!["daily_loss".into()],
            equity: 9_499.0,
            message: "killswitch.triggered".into(),
        }
    }

    #[tokio::test]
    async fn failing_sink_does_not_starve_others() {
        let (channel, mut rx) = ChannelSink::new();
        let sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(Failing), Arc::new(LogSink), Arc::new(channel)];
        let (dispatcher, handle) = spawn_dispatcher(sinks);
        assert!(dispatcher.dispatch(&kill_alert()));
        let got = rx.recv().await.unwrap();
        assert!(got.is_kill());
        drop(dispatcher);
        handle.await.unwrap();
    }
}

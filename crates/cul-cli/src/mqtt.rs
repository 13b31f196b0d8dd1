use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cul_somfy::Publisher;

use crate::router::Inbound;

const REQUEST_CAPACITY: usize = 256;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Deserialize)]
pub struct MqttCfg {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_s")]
    pub keep_alive_s: u64,
}

impl Default for MqttCfg {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_s: default_keep_alive_s(),
        }
    }
}

fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 1883 }
fn default_client_id() -> String { "cul2mqtt".into() }
fn default_keep_alive_s() -> u64 { 60 }

pub fn check(cfg: &MqttCfg) -> Result<()> {
    anyhow::ensure!(!cfg.host.is_empty(), "mqtt.host missing");
    anyhow::ensure!(cfg.port > 0, "mqtt.port invalid");
    anyhow::ensure!(!cfg.client_id.is_empty(), "mqtt.client_id missing");
    anyhow::ensure!((5..=3600).contains(&cfg.keep_alive_s), "mqtt.keep_alive_s should be 5..=3600");
    anyhow::ensure!(
        cfg.username.is_some() == cfg.password.is_some(),
        "mqtt.username and mqtt.password go together"
    );
    Ok(())
}

pub fn connect(cfg: &MqttCfg) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_s));
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(user.clone(), pass.clone());
    }
    info!("mqtt: broker {}:{} as {}", cfg.host, cfg.port, cfg.client_id);
    AsyncClient::new(opts, REQUEST_CAPACITY)
}

/// Publishes through the session's request queue without waiting for the broker.
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        debug!("mqtt: publish {} = {}", topic, payload);
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes().to_vec())
            .with_context(|| format!("publish {}", topic))
    }
}

/// Drives the event loop until cancelled. Every (re)connect subscribes to
/// `<prefix>/#` and is reported so the devices get announced again.
pub async fn session(
    client: AsyncClient,
    mut events: EventLoop,
    prefix: String,
    tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) {
    let filter = format!("{}/#", prefix);

    loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = events.poll() => ev,
        };

        match ev {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt: connected, subscribing {}", filter);
                if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                    error!("mqtt: subscribe {} failed: {}", filter, e);
                }
                if tx.send(Inbound::Connected).await.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let msg = Inbound::Message { topic: p.topic, payload: p.payload.to_vec() };
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt: {}; reconnecting in {:?}", e, RECONNECT_DELAY);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    // flush the DISCONNECT, but never hang on a dead broker
    if client.try_disconnect().is_ok() {
        let _ = tokio::time::timeout(Duration::from_secs(1), events.poll()).await;
    }
    info!("mqtt: session closed");
}

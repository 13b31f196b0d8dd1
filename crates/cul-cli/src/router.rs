use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error, info};

use cul_proto::topic::component_of;
use cul_serial::RfLine;
use cul_somfy::ShutterProtocolHandler;

/// Everything the gateway loop reacts to, in arrival order.
#[derive(Debug)]
pub enum Inbound {
    /// MQTT session (re)established.
    Connected,
    Message { topic: String, payload: Vec<u8> },
    Rf(RfLine),
}

/// Source of a received RF line, by its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfKind {
    Somfy,
    LaCrosse,
    Unknown,
}

impl RfKind {
    pub fn classify(line: &str) -> Self {
        if line.starts_with("YsA") {
            RfKind::Somfy
        } else if line.starts_with("N01") {
            RfKind::LaCrosse
        } else {
            RfKind::Unknown
        }
    }
}

/// Hands MQTT messages to the component named in the topic and RF lines to
/// the protocol their prefix belongs to.
pub struct Router {
    prefix: String,
    somfy: Option<Arc<ShutterProtocolHandler>>,
}

impl Router {
    pub fn new(prefix: &str, somfy: Option<Arc<ShutterProtocolHandler>>) -> Self {
        Self { prefix: prefix.to_string(), somfy }
    }

    /// `Err` only for failures that must end the process.
    pub async fn handle(&self, msg: Inbound) -> Result<()> {
        match msg {
            Inbound::Connected => self.announce().await,
            Inbound::Message { topic, payload } => self.on_mqtt(&topic, &payload).await?,
            Inbound::Rf(line) => self.on_rf(&line),
        }
        Ok(())
    }

    pub async fn announce(&self) {
        if let Some(somfy) = &self.somfy {
            somfy.announce().await;
        }
    }

    async fn on_mqtt(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let Some(component) = component_of(&self.prefix, topic) else {
            debug!("router: no component in {}", topic);
            return Ok(());
        };

        // other components share the prefix; those messages are not ours
        if let Some(somfy) = &self.somfy {
            if component == ShutterProtocolHandler::component_name() {
                somfy.on_message(topic, payload).await?;
            }
        }
        Ok(())
    }

    fn on_rf(&self, line: &RfLine) {
        let text = line.text.as_str();
        if text.is_empty() {
            return;
        }
        match RfKind::classify(text) {
            RfKind::Somfy => match &self.somfy {
                Some(somfy) => somfy.on_rf_message(text),
                None => debug!("rf: somfy disabled, dropping {}", text),
            },
            RfKind::LaCrosse => info!("rf: lacrosse {} at {}", text, line.ts),
            RfKind::Unknown => error!("rf: cannot handle {}", text),
        }
    }

    pub async fn shutdown(&self) {
        if let Some(somfy) = &self.somfy {
            somfy.shutdown().await;
        }
    }
}

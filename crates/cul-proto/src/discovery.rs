use serde::{Deserialize, Serialize};

/// Home Assistant MQTT cover discovery payload.
///
/// See <https://www.home-assistant.io/integrations/cover.mqtt/>. Somfy RTS gives no
/// feedback, so state and position are published optimistically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverConfig {
    #[serde(rename = "~")]
    pub base: String,
    pub command_topic: String,
    pub payload_open: String,
    pub payload_close: String,
    pub payload_stop: String,
    pub position_topic: String,
    pub state_topic: String,
    pub optimistic: bool,
    pub device_class: String,
    pub name: String,
    pub unique_id: String,
}

impl CoverConfig {
    pub fn somfy(base: &str, address: &str, name: &str, device_class: &str) -> Self {
        Self {
            base: base.to_string(),
            command_topic: "~/set".into(),
            payload_open: "OPEN".into(),
            payload_close: "CLOSE".into(),
            payload_stop: "STOP".into(),
            position_topic: format!("{base}/position"),
            state_topic: format!("{base}/state"),
            optimistic: true,
            device_class: device_class.to_string(),
            name: name.to_string(),
            unique_id: format!("somfy_{address}"),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

mod bridge;
mod payload;

pub use bridge::{MqttBridge, MqttBridgeConfig};
pub use payload::{decode_payload, parse_topic, MqttPoint, TOPIC_PATTERN};

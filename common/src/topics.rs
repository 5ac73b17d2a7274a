pub const TOPIC_PREFIX: &str = "iot/device";

pub const SUFFIX_COMMAND: &str = "command";
pub const SUFFIX_CONFIG: &str = "config";
pub const SUFFIX_FIRMWARE_UPDATE: &str = "firmware/update";
pub const SUFFIX_SENSOR_DATA: &str = "sensor/data";
pub const SUFFIX_STATUS: &str = "status";
pub const SUFFIX_HEARTBEAT: &str = "heartbeat";

/// Inbound channels a device subscribes to after every broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Command,
    Config,
    FirmwareUpdate,
}

impl Channel {
    pub const INBOUND: [Channel; 3] = [Channel::Command, Channel::Config, Channel::FirmwareUpdate];

    fn suffix(self) -> &'static str {
        match self {
            Self::Command => SUFFIX_COMMAND,
            Self::Config => SUFFIX_CONFIG,
            Self::FirmwareUpdate => SUFFIX_FIRMWARE_UPDATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    device_id: String,
    command: String,
    config: String,
    firmware_update: String,
    sensor_data: String,
    status: String,
    heartbeat: String,
}

impl DeviceTopics {
    pub fn new(device_id: &str) -> Self {
        let topic = |suffix: &str| format!("{TOPIC_PREFIX}/{device_id}/{suffix}");
        Self {
            device_id: device_id.to_string(),
            command: topic(Channel::Command.suffix()),
            config: topic(Channel::Config.suffix()),
            firmware_update: topic(Channel::FirmwareUpdate.suffix()),
            sensor_data: topic(SUFFIX_SENSOR_DATA),
            status: topic(SUFFIX_STATUS),
            heartbeat: topic(SUFFIX_HEARTBEAT),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn inbound(&self, channel: Channel) -> &str {
        match channel {
            Channel::Command => &self.command,
            Channel::Config => &self.config,
            Channel::FirmwareUpdate => &self.firmware_update,
        }
    }

    pub fn subscriptions(&self) -> [&str; 3] {
        Channel::INBOUND.map(|channel| self.inbound(channel))
    }

    pub fn channel_for(&self, topic: &str) -> Option<Channel> {
        Channel::INBOUND
            .into_iter()
            .find(|channel| self.inbound(*channel) == topic)
    }

    pub fn sensor_data(&self) -> &str {
        &self.sensor_data
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn heartbeat(&self) -> &str {
        &self.heartbeat
    }
}

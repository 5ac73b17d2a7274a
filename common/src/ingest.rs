use thiserror::Error;
use tracing::{info, warn};

use crate::{
    message::{
        decode, CommandAction, ControlMessage, DecodeError, FirmwareDescriptor, FirmwareRequest,
    },
    state::DeviceState,
    topics::Channel,
    types::{Mode, RelayId, RelayState},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] DecodeError),
    #[error("invalid mode `{0}` (expected auto, manual or schedule)")]
    InvalidMode(String),
}

/// What an inbound message did to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    Relay {
        relay: RelayId,
        state: RelayState,
        changed: bool,
    },
    Mode {
        mode: Mode,
        changed: bool,
    },
    StartUpdate(FirmwareDescriptor),
    CancelUpdate,
    Ignored,
}

/// Decodes one inbound message and applies it to `state`. Errors leave the
/// state untouched; the caller drops the message.
pub fn handle_message(
    state: &mut DeviceState,
    channel: Channel,
    payload: &[u8],
) -> Result<Ingested, IngestError> {
    let message = decode(channel, payload).inspect_err(|err| {
        warn!("dropping malformed {channel:?} message: {err}");
    })?;

    match message {
        ControlMessage::Command(action) => Ok(apply_command(state, action)),
        ControlMessage::ConfigUpdate(requested) => {
            let Some(mode) = Mode::parse(&requested) else {
                warn!("rejecting config update with invalid mode `{requested}`");
                return Err(IngestError::InvalidMode(requested));
            };
            let changed = state.set_mode(mode);
            if changed {
                info!("mode set to {}", mode.as_str());
            }
            Ok(Ingested::Mode { mode, changed })
        }
        ControlMessage::FirmwareUpdate(FirmwareRequest::Start(descriptor)) => {
            info!(
                "firmware update requested: version {} from {}",
                descriptor.version_label(),
                descriptor.source_url.as_deref().unwrap_or("<missing url>")
            );
            Ok(Ingested::StartUpdate(descriptor))
        }
        ControlMessage::FirmwareUpdate(FirmwareRequest::Cancel) => Ok(Ingested::CancelUpdate),
        ControlMessage::FirmwareUpdate(FirmwareRequest::Other(action)) => {
            warn!(
                "ignoring firmware message with action {}",
                action.as_deref().unwrap_or("<none>")
            );
            Ok(Ingested::Ignored)
        }
    }
}

fn apply_command(state: &mut DeviceState, action: CommandAction) -> Ingested {
    let (relay, target) = match action {
        CommandAction::PumpOn => (RelayId::Pump, RelayState::Active),
        CommandAction::PumpOff => (RelayId::Pump, RelayState::Inactive),
        CommandAction::Relay2On => (RelayId::Relay2, RelayState::Active),
        CommandAction::Relay2Off => (RelayId::Relay2, RelayState::Inactive),
        CommandAction::Unknown(action) => {
            warn!("ignoring unknown command action `{action}`");
            return Ingested::Ignored;
        }
    };

    // Remote commands bypass the mode gate.
    let changed = state.set_relay(relay, target);
    info!("{} set to {} by remote command", relay.as_str(), target.as_str());
    Ingested::Relay {
        relay,
        state: target,
        changed,
    }
}

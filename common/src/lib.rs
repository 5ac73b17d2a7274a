pub mod automation;
pub mod config;
pub mod connectivity;
pub mod ingest;
pub mod message;
pub mod ota;
pub mod ports;
pub mod state;
pub mod topics;
pub mod types;

pub use automation::{AutomationEngine, Decision, Rule};
pub use config::{
    AutomationConfig, ConnectivityConfig, HeatStressGuard, NetworkConfig, OtaConfig,
    RuntimeConfig, TelemetryConfig,
};
pub use connectivity::{
    BrokerError, ConnectivityEvent, ConnectivityPort, ConnectivitySupervisor, Interrupted,
    LinkError,
};
pub use ingest::{handle_message, IngestError, Ingested};
pub use message::{CommandAction, ControlMessage, DecodeError, FirmwareDescriptor, FirmwareRequest};
pub use ota::{
    FirmwareBody, FirmwareResponse, OtaError, OtaEvent, OtaPipeline, OtaPlatform, OtaReport,
    OtaStage, PartitionError, ReadPoll, SessionSignal, TransportError, UpdateRegion,
};
pub use ports::{RelayDriver, SensorSource, SoilCalibration};
pub use state::DeviceState;
pub use topics::*;
pub use types::{
    HeartbeatPayload, Mode, RelayCommand, RelayId, RelayState, SensorDataPayload,
    SensorSnapshot, SensorUnavailable, StatusPayload,
};

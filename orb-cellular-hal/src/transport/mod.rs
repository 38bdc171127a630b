//! The boundary between the HAL and whatever actually talks to the modem.
//!
//! The HAL never assumes a wire format. It only needs a way to send a
//! [`Command`] and eventually get a [`Response`] (or an error), plus a stream of
//! unsolicited [`Indication`]s delivered at most once per logical event.

use crate::{
    device::OperatingMode,
    profile::{PdpProfile, ProfileId},
    registration::RegistrationState,
    session::{IpConfig, IpFamily},
    telemetry::{
        CellLocation, DeviceIdentity, InterfaceStatus, NetworkScanResult,
        PacketStats, PlmnInfo, RadioTechnology, RatSet, SignalInfo,
    },
    uicc::{CardStatus, UiccSlot},
};
use async_trait::async_trait;
use std::time::Duration;

pub mod mmcli;

#[async_trait]
pub trait Transport: 'static + Send + Sync {
    async fn send(&self, command: Command) -> Result<Response, TransportError>;

    /// Stream of unsolicited events. Called once by the orchestrator when it
    /// starts.
    fn indications(&self) -> flume::Receiver<Indication>;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("modem rejected command: {0}")]
    Rejected(String),
    #[error("unexpected response, wanted {0}")]
    Unexpected(&'static str),
    #[error("modem control channel unavailable")]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OpenDevice,
    CloseDevice,
    SetOperatingMode(OperatingMode),
    ReadSlots,
    SelectSlot(u32),
    SetSimPower { slot: u32, enable: bool },
    Attach,
    Detach,
    ReadRegistration,
    ReadProfiles,
    WriteProfile(PdpProfile),
    DeleteProfile(ProfileId),
    StartSession { family: IpFamily, profile: PdpProfile },
    StopSession(IpFamily),
    ReadIpConfig(IpFamily),
    ReadSignal,
    ReadCellLocation,
    ReadPlmn,
    ReadPacketStats,
    ReadDeviceIdentity,
    ReadInterfaceStatus,
    ScanNetworks,
    ReadRadioTechnology,
    SetPreferredRadioTechnology(RatSet),
}

impl Command {
    /// Short name used in logs, avoids dumping credentials carried by profiles.
    pub fn name(&self) -> &'static str {
        match self {
            Command::OpenDevice => "open-device",
            Command::CloseDevice => "close-device",
            Command::SetOperatingMode(_) => "set-operating-mode",
            Command::ReadSlots => "read-slots",
            Command::SelectSlot(_) => "select-slot",
            Command::SetSimPower { .. } => "set-sim-power",
            Command::Attach => "attach",
            Command::Detach => "detach",
            Command::ReadRegistration => "read-registration",
            Command::ReadProfiles => "read-profiles",
            Command::WriteProfile(_) => "write-profile",
            Command::DeleteProfile(_) => "delete-profile",
            Command::StartSession { .. } => "start-session",
            Command::StopSession(_) => "stop-session",
            Command::ReadIpConfig(_) => "read-ip-config",
            Command::ReadSignal => "read-signal",
            Command::ReadCellLocation => "read-cell-location",
            Command::ReadPlmn => "read-plmn",
            Command::ReadPacketStats => "read-packet-stats",
            Command::ReadDeviceIdentity => "read-device-identity",
            Command::ReadInterfaceStatus => "read-interface-status",
            Command::ScanNetworks => "scan-networks",
            Command::ReadRadioTechnology => "read-radio-technology",
            Command::SetPreferredRadioTechnology(_) => "set-preferred-rat",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Done,
    DeviceOpened {
        device_name: String,
        wan_ifname: String,
        mode: OperatingMode,
    },
    Slots(Vec<UiccSlot>),
    SlotSelected {
        slot_name: String,
        slot_type: String,
    },
    Registration(RegistrationState),
    Profiles(Vec<PdpProfile>),
    IpConfig(IpConfig),
    Signal(SignalInfo),
    CellLocation(CellLocation),
    Plmn(PlmnInfo),
    PacketStats(PacketStats),
    DeviceIdentity(DeviceIdentity),
    InterfaceStatus(InterfaceStatus),
    Networks(Vec<NetworkScanResult>),
    RadioTechnology(RadioTechnology),
}

/// Unwraps a [`Response`] into the payload of the expected variant, or a
/// [`TransportError::Unexpected`].
macro_rules! expect_response {
    ($response:expr, $variant:ident) => {
        match $response {
            $crate::transport::Response::$variant => Ok(()),
            _ => Err($crate::transport::TransportError::Unexpected(stringify!(
                $variant
            ))),
        }
    };
    ($response:expr, $variant:ident($binding:ident)) => {
        match $response {
            $crate::transport::Response::$variant($binding) => Ok($binding),
            _ => Err($crate::transport::TransportError::Unexpected(stringify!(
                $variant
            ))),
        }
    };
}

pub(crate) use expect_response;

#[derive(Debug, Clone, PartialEq)]
pub enum Indication {
    DeviceDetected,
    DeviceRemoved,
    CardStatus { slot: u32, status: CardStatus },
    CardInserted { slot: u32 },
    Registration(RegistrationState),
    SessionDropped(IpFamily),
}

//! Notifications delivered to the upstream consumer.
//!
//! Each notification kind is a single-method trait. Closures of the matching
//! shape implement them, so most consumers never name these traits.
//! Handlers run on the orchestrator's owner task and must not block.

use crate::{
    device::{DetectionStatus, DeviceOpenStatus, OperatingMode},
    error::HalError,
    profile::{PdpType, ProfileId, ProfileStatus},
    registration::RegistrationState,
    session::{IpConfig, IpFamily, IpReadyStatus, PacketServiceStatus},
    uicc::SlotStatus,
};
use std::sync::Arc;
use tracing::warn;

/// Acknowledgement returned by every handler. A non-OK ack is logged, it never
/// rolls back the state change it was notified about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceOpened {
    pub device_name: String,
    pub wan_ifname: String,
    pub status: DeviceOpenStatus,
    pub mode: OperatingMode,
    pub error: Option<HalError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRemoved {
    pub device_name: String,
    pub status: DetectionStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotStatusEvent {
    pub slot_name: String,
    pub slot_type: String,
    pub slot_num: Option<u32>,
    pub status: SlotStatus,
    pub error: Option<HalError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileStatusEvent {
    pub profile_id: Option<ProfileId>,
    pub pdp_type: PdpType,
    pub status: ProfileStatus,
    pub error: Option<HalError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacketServiceEvent {
    pub device_name: String,
    pub ip_type: IpFamily,
    pub status: PacketServiceStatus,
    pub error: Option<HalError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IpReadyEvent {
    pub ip_type: IpFamily,
    pub status: IpReadyStatus,
    /// Present when `status` is [`IpReadyStatus::Ready`].
    pub config: Option<IpConfig>,
}

macro_rules! handler {
    ($(#[$meta:meta])* $name:ident, $method:ident, $event:ty) => {
        $(#[$meta])*
        pub trait $name: 'static + Send + Sync {
            fn $method(&self, event: $event) -> Ack;
        }

        impl<F> $name for F
        where
            F: Fn($event) -> Ack + 'static + Send + Sync,
        {
            fn $method(&self, event: $event) -> Ack {
                self(event)
            }
        }
    };
}

handler!(
    /// Open progress and outcome of the modem device, also used to report
    /// operating mode changes.
    DeviceOpenedHandler,
    on_device_opened,
    DeviceOpened
);
handler!(DeviceRemovedHandler, on_device_removed, DeviceRemoved);
handler!(SlotStatusHandler, on_slot_status, SlotStatusEvent);
handler!(
    /// Standing subscription to NAS registration changes.
    RegistrationHandler,
    on_registration,
    RegistrationState
);
handler!(ProfileStatusHandler, on_profile_status, ProfileStatusEvent);
handler!(PacketServiceHandler, on_packet_service, PacketServiceEvent);
handler!(IpReadyHandler, on_ip_ready, IpReadyEvent);

/// The two handlers attached to a data session.
#[derive(Clone)]
pub struct SessionHandlers {
    pub packet_service: Arc<dyn PacketServiceHandler>,
    pub ip_ready: Arc<dyn IpReadyHandler>,
}

impl SessionHandlers {
    pub fn new(
        packet_service: impl PacketServiceHandler,
        ip_ready: impl IpReadyHandler,
    ) -> Self {
        Self {
            packet_service: Arc::new(packet_service),
            ip_ready: Arc::new(ip_ready),
        }
    }
}

impl std::fmt::Debug for SessionHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionHandlers")
    }
}

/// Logs a non-OK acknowledgement. Returns the ack for chaining.
pub(crate) fn acked(kind: &'static str, ack: Ack) -> Ack {
    if ack != Ack::Ok {
        warn!(callback = kind, "consumer returned a non-OK acknowledgement");
    }

    ack
}

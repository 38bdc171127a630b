use crate::callbacks::{acked, IpReadyEvent, PacketServiceEvent, SessionHandlers};
use crate::error::HalError;
use crate::profile::{PdpProfile, ProfileId};
use derive_more::Display;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const MIN_MTU: u32 = 1280;
pub const MAX_MTU: u32 = 9000;

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum IpFamily {
    #[display("IPv4")]
    Ipv4 = 1,
    #[display("IPv6")]
    Ipv6,
}

/// Which families a start/stop request covers.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum IpPreference {
    #[default]
    #[display("IPv4")]
    Ipv4,
    #[display("IPv6")]
    Ipv6,
    #[display("IPv4v6")]
    Ipv4Ipv6,
}

impl IpPreference {
    pub fn families(self) -> &'static [IpFamily] {
        match self {
            IpPreference::Ipv4 => &[IpFamily::Ipv4],
            IpPreference::Ipv6 => &[IpFamily::Ipv6],
            IpPreference::Ipv4Ipv6 => &[IpFamily::Ipv4, IpFamily::Ipv6],
        }
    }
}

impl From<IpFamily> for IpPreference {
    fn from(value: IpFamily) -> Self {
        match value {
            IpFamily::Ipv4 => IpPreference::Ipv4,
            IpFamily::Ipv6 => IpPreference::Ipv6,
        }
    }
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Connected,
    IpReady,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketServiceStatus {
    Disconnected = 1,
    Connected,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpReadyStatus {
    NotReady = 1,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpConfig {
    pub wan_ifname: String,
    pub ip_type: Option<IpFamily>,
    pub address: String,
    pub subnet_mask: String,
    pub gateway: String,
    pub dns1: String,
    pub dns2: String,
    pub domains: String,
    pub mtu: u32,
}

impl IpConfig {
    /// Keeps the MTU inside the range a WAN interface accepts.
    pub fn sanitized(mut self, family: IpFamily, default_mtu: u32) -> Self {
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            if self.mtu != 0 {
                warn!(mtu = self.mtu, "reported mtu out of range, using {default_mtu}");
            }
            self.mtu = default_mtu;
        }
        self.ip_type = Some(family);

        self
    }
}

struct Session {
    state: SessionState,
    profile_id: Option<ProfileId>,
    handlers: SessionHandlers,
    config: Option<IpConfig>,
}

/// What the consumer asked for, kept across registration loss so the session
/// can be brought back.
#[derive(Debug, Clone)]
pub(crate) struct Intent {
    pub profile: PdpProfile,
    pub handlers: SessionHandlers,
    pub attempts: u32,
}

/// Per-family data session state machines.
#[derive(Default)]
pub(crate) struct SessionController {
    sessions: BTreeMap<IpFamily, Session>,
    intents: BTreeMap<IpFamily, Intent>,
}

impl SessionController {
    pub fn state(&self, family: IpFamily) -> SessionState {
        self.sessions
            .get(&family)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    pub fn ip_config(&self, family: IpFamily) -> Option<IpConfig> {
        self.sessions.get(&family).and_then(|s| s.config.clone())
    }

    pub fn is_active(&self, family: IpFamily) -> bool {
        self.state(family) != SessionState::Idle
    }

    pub fn active(&self) -> Vec<IpFamily> {
        self.sessions.keys().copied().collect()
    }

    pub fn bound_to(&self, id: ProfileId) -> Vec<IpFamily> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.profile_id == Some(id))
            .map(|(f, _)| *f)
            .collect()
    }

    pub fn begin(&mut self, family: IpFamily, profile: PdpProfile, handlers: SessionHandlers) {
        info!(%family, apn = %profile.apn, "starting data session");
        self.sessions.insert(
            family,
            Session {
                state: SessionState::Starting,
                profile_id: profile.id,
                handlers: handlers.clone(),
                config: None,
            },
        );

        let attempts = self.intents.get(&family).map(|i| i.attempts).unwrap_or(0);
        self.intents.insert(
            family,
            Intent {
                profile,
                handlers,
                attempts,
            },
        );
    }

    pub fn connected(&mut self, family: IpFamily, device_name: &str) {
        let Some(session) = self.sessions.get_mut(&family) else {
            return;
        };

        session.state = SessionState::Connected;
        acked(
            "packet-service",
            session.handlers.packet_service.on_packet_service(PacketServiceEvent {
                device_name: device_name.to_owned(),
                ip_type: family,
                status: PacketServiceStatus::Connected,
                error: None,
            }),
        );
    }

    pub fn ip_ready(&mut self, family: IpFamily, config: IpConfig) {
        let Some(session) = self.sessions.get_mut(&family) else {
            return;
        };

        info!(%family, address = %config.address, mtu = config.mtu, "ip configuration ready");
        session.state = SessionState::IpReady;
        session.config = Some(config.clone());
        if let Some(intent) = self.intents.get_mut(&family) {
            intent.attempts = 0;
        }

        acked(
            "ip-ready",
            session.handlers.ip_ready.on_ip_ready(IpReadyEvent {
                ip_type: family,
                status: IpReadyStatus::Ready,
                config: Some(config),
            }),
        );
    }

    /// Forces the family back to `Idle`. Retracts the IP configuration if one
    /// was delivered and reports the disconnect. Returns false if the family
    /// was already idle, in which case nothing is reported.
    pub fn down(&mut self, family: IpFamily, device_name: &str, error: Option<HalError>) -> bool {
        let Some(session) = self.sessions.remove(&family) else {
            return false;
        };

        info!(%family, from = %session.state, error = ?error, "data session down");

        if session.state == SessionState::IpReady {
            acked(
                "ip-ready",
                session.handlers.ip_ready.on_ip_ready(IpReadyEvent {
                    ip_type: family,
                    status: IpReadyStatus::NotReady,
                    config: None,
                }),
            );
        }

        acked(
            "packet-service",
            session.handlers.packet_service.on_packet_service(PacketServiceEvent {
                device_name: device_name.to_owned(),
                ip_type: family,
                status: PacketServiceStatus::Disconnected,
                error,
            }),
        );

        true
    }

    pub fn forget(&mut self, family: IpFamily) {
        self.intents.remove(&family);
    }

    pub fn forget_profile(&mut self, id: ProfileId) {
        self.intents.retain(|_, i| i.profile.id != Some(id));
    }

    pub fn forget_all(&mut self) {
        self.intents.clear();
    }

    /// Idle families the consumer still wants up and that have attempts left.
    /// Counts the attempt.
    pub fn take_restarts(&mut self, max_attempts: u32) -> Vec<(IpFamily, Intent)> {
        let mut out = Vec::new();
        for (family, intent) in &mut self.intents {
            if self.sessions.contains_key(family) {
                continue;
            }

            if intent.attempts >= max_attempts {
                continue;
            }

            intent.attempts += 1;
            out.push((*family, intent.clone()));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{Ack, IpReadyEvent, PacketServiceEvent};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, PartialEq)]
    enum Seen {
        Packet(PacketServiceStatus),
        Ip(IpReadyStatus),
    }

    fn handlers(seen: &Arc<Mutex<Vec<Seen>>>) -> SessionHandlers {
        let p = seen.clone();
        let i = seen.clone();
        SessionHandlers::new(
            move |ev: PacketServiceEvent| {
                p.lock().unwrap().push(Seen::Packet(ev.status));
                Ack::Ok
            },
            move |ev: IpReadyEvent| {
                i.lock().unwrap().push(Seen::Ip(ev.status));
                Ack::Ok
            },
        )
    }

    fn profile() -> PdpProfile {
        PdpProfile::builder().id(ProfileId(1)).apn("em").build()
    }

    #[test]
    fn it_walks_the_session_state_machine() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut sc = SessionController::default();

        sc.begin(IpFamily::Ipv4, profile(), handlers(&seen));
        assert_eq!(sc.state(IpFamily::Ipv4), SessionState::Starting);
        assert_eq!(sc.state(IpFamily::Ipv6), SessionState::Idle);

        sc.connected(IpFamily::Ipv4, "modem");
        sc.ip_ready(
            IpFamily::Ipv4,
            IpConfig {
                address: "10.0.0.2".into(),
                mtu: 1500,
                ..Default::default()
            },
        );
        assert_eq!(sc.state(IpFamily::Ipv4), SessionState::IpReady);
        assert_eq!(sc.bound_to(ProfileId(1)), vec![IpFamily::Ipv4]);

        assert!(sc.down(IpFamily::Ipv4, "modem", None));
        assert!(!sc.down(IpFamily::Ipv4, "modem", None));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Seen::Packet(PacketServiceStatus::Connected),
                Seen::Ip(IpReadyStatus::Ready),
                Seen::Ip(IpReadyStatus::NotReady),
                Seen::Packet(PacketServiceStatus::Disconnected),
            ]
        );
    }

    #[test]
    fn restarts_are_bounded_and_reset_once_ip_is_ready() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut sc = SessionController::default();

        sc.begin(IpFamily::Ipv6, profile(), handlers(&seen));
        assert!(sc.take_restarts(2).is_empty(), "active sessions are not restarted");

        sc.down(IpFamily::Ipv6, "modem", None);
        assert_eq!(sc.take_restarts(2).len(), 1);
        assert_eq!(sc.take_restarts(2).len(), 1);
        assert!(sc.take_restarts(2).is_empty());

        sc.begin(IpFamily::Ipv6, profile(), handlers(&seen));
        sc.connected(IpFamily::Ipv6, "modem");
        sc.ip_ready(IpFamily::Ipv6, IpConfig::default());
        sc.down(IpFamily::Ipv6, "modem", None);
        assert_eq!(sc.take_restarts(2).len(), 1);

        sc.forget(IpFamily::Ipv6);
        assert!(sc.take_restarts(2).is_empty());
    }

    #[test]
    fn out_of_range_mtu_is_replaced() {
        let cfg = IpConfig {
            mtu: 65535,
            ..Default::default()
        }
        .sanitized(IpFamily::Ipv4, 1500);

        assert_eq!(cfg.mtu, 1500);
        assert_eq!(cfg.ip_type, Some(IpFamily::Ipv4));
    }
}

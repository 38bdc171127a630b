//! Point-in-time, read-only modem telemetry.

use crate::registration::{NasStatus, RegisteredService, RoamingStatus};
use derive_more::Display;
use std::{collections::BTreeSet, fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalInfo {
    /// dBm
    pub rssi: i32,
    /// dB
    pub rsrq: i32,
    /// dBm
    pub rsrp: i32,
    /// dB
    pub snr: i32,
    /// dBm
    pub tx_power: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellLocation {
    pub global_cell_id: u64,
    pub band: u32,
    pub serving_cell_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlmnInfo {
    pub name: String,
    pub mcc: u16,
    pub mnc: u16,
    pub registration: NasStatus,
    pub service: RegisteredService,
    pub roaming: RoamingStatus,
    pub area_code: u32,
    pub cell_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_sent_dropped: u64,
    pub packets_received_dropped: u64,
    pub upstream_max_bit_rate: u64,
    pub downstream_max_bit_rate: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    pub imei: String,
    pub imei_sv: String,
    pub firmware_version: String,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum InterfaceStatus {
    Up = 1,
    Down,
    #[default]
    Unknown,
    Dormant,
    NotPresent,
    LowerLayerDown,
    Error,
}

impl InterfaceStatus {
    /// Statuses under which a session that claims to be IP ready is stale.
    pub fn is_broken(self) -> bool {
        matches!(
            self,
            InterfaceStatus::Down
                | InterfaceStatus::NotPresent
                | InterfaceStatus::LowerLayerDown
                | InterfaceStatus::Error
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkScanResult {
    pub name: String,
    pub mcc: u16,
    pub mnc: u16,
    pub allowed: bool,
}

/// Radio access technologies, in the order the legacy strings list them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rat {
    Gprs,
    Edge,
    Umts,
    UmtsHspa,
    Cdma2000OneX,
    Cdma2000Hrpd,
    Lte,
    Nr,
}

impl Rat {
    pub const ALL: [Rat; 8] = [
        Rat::Gprs,
        Rat::Edge,
        Rat::Umts,
        Rat::UmtsHspa,
        Rat::Cdma2000OneX,
        Rat::Cdma2000Hrpd,
        Rat::Lte,
        Rat::Nr,
    ];

    pub fn as_legacy_str(self) -> &'static str {
        match self {
            Rat::Gprs => "GPRS",
            Rat::Edge => "EDGE",
            Rat::Umts => "UMTS",
            Rat::UmtsHspa => "UMTSHSPA",
            Rat::Cdma2000OneX => "CDMA20001X",
            Rat::Cdma2000Hrpd => "CDMA2000HRPD",
            Rat::Lte => "LTE",
            Rat::Nr => "NR",
        }
    }
}

impl fmt::Display for Rat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_legacy_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown radio access technology: {0}")]
pub struct UnknownRat(pub String);

impl FromStr for Rat {
    type Err = UnknownRat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        Rat::ALL
            .into_iter()
            .find(|r| r.as_legacy_str().eq_ignore_ascii_case(token))
            .ok_or_else(|| UnknownRat(token.to_owned()))
    }
}

/// A set of radio access technologies. The comma separated legacy form is
/// only produced at the boundary via [`RatSet::to_legacy_string`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RatSet(BTreeSet<Rat>);

impl RatSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rat: Rat) -> bool {
        self.0.insert(rat)
    }

    pub fn contains(&self, rat: Rat) -> bool {
        self.0.contains(&rat)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Rat> + '_ {
        self.0.iter().copied()
    }

    pub fn to_legacy_string(&self) -> String {
        self.iter()
            .map(Rat::as_legacy_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromIterator<Rat> for RatSet {
    fn from_iter<T: IntoIterator<Item = Rat>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Rat; N]> for RatSet {
    fn from(value: [Rat; N]) -> Self {
        value.into_iter().collect()
    }
}

impl fmt::Display for RatSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_legacy_string())
    }
}

impl FromStr for RatSet {
    type Err = UnknownRat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(Rat::from_str)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RadioTechnology {
    pub current: RatSet,
    pub preferred: RatSet,
    pub supported: RatSet,
}

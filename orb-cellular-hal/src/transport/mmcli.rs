//! [`Transport`] backed by ModemManager's `mmcli`.
//!
//! ModemManager has no push interface on the command line, so indications are
//! synthesised by polling the modem and diffing what was observed.

use super::{Command, Indication, Response, Transport, TransportError};
use crate::{
    device::OperatingMode,
    profile::{PdpAuthentication, PdpProfile, PdpType, ProfileId},
    registration::{NasStatus, RegisteredService, RegistrationState, RoamingStatus},
    session::{IpConfig, IpFamily},
    telemetry::{
        CellLocation, DeviceIdentity, InterfaceStatus, NetworkScanResult, PacketStats,
        PlmnInfo, RadioTechnology, Rat, RatSet, SignalInfo,
    },
    uicc::{CardStatus, UiccApplication, UiccSlot},
    utils::{run_cmd, State},
};
use async_trait::async_trait;
use color_eyre::{
    eyre::{bail, ContextCompat},
    Result,
};
use derive_more::Display;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::BTreeSet,
    io,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};
use tokio::{fs, task, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Display, Debug, Clone, PartialEq, Eq)]
pub struct ModemId(String);

impl ModemId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u32> for ModemId {
    fn from(value: u32) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modem {
    pub id: ModemId,
    pub vendor: String,
    pub model: String,
}

pub struct ModemManagerCli {
    modem: State<Option<ModemId>>,
    sysfs: PathBuf,
    connect_timeout: Duration,
    indications: flume::Receiver<Indication>,
    cancel: CancellationToken,
}

#[bon::bon]
impl ModemManagerCli {
    /// Starts the poller that produces indications. Must be called from
    /// within a tokio runtime.
    #[builder(finish_fn = spawn)]
    pub fn new(
        #[builder(default = Duration::from_secs(5))] poll_interval: Duration,
        #[builder(default = PathBuf::from("/sys"), into)] sysfs: PathBuf,
        /// Passed to `--simple-connect`.
        #[builder(default = Duration::from_secs(30))]
        connect_timeout: Duration,
    ) -> Self {
        let modem = State::new(None);
        let cancel = CancellationToken::new();
        let (tx, rx) = flume::unbounded();

        task::spawn(poll(modem.clone(), tx, poll_interval, cancel.clone()));

        Self {
            modem,
            sysfs,
            connect_timeout,
            indications: rx,
            cancel,
        }
    }
}

impl Drop for ModemManagerCli {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Transport for ModemManagerCli {
    async fn send(&self, command: Command) -> Result<Response, TransportError> {
        let modem = self
            .modem
            .read(Option::clone)
            .ok_or(TransportError::Unavailable)?;

        self.execute(&modem, command)
            .await
            .map_err(|e| TransportError::Rejected(format!("{e:#}")))
    }

    fn indications(&self) -> flume::Receiver<Indication> {
        self.indications.clone()
    }
}

impl ModemManagerCli {
    async fn execute(&self, modem: &ModemId, command: Command) -> Result<Response> {
        let m = modem.as_str();

        let resp = match command {
            Command::OpenDevice => {
                mmcli(&["-m", m, "--enable"]).await?;
                let info = mmcli_json(&["-m", m, "-J"]).await?;
                let (device_name, wan_ifname, mode) = parse_device(&info)?;

                Response::DeviceOpened {
                    device_name,
                    wan_ifname,
                    mode,
                }
            }

            Command::CloseDevice => Response::Done,

            Command::SetOperatingMode(mode) => {
                let args: &[&str] = match mode {
                    OperatingMode::Online => &["--set-power-state-on", "--enable"],
                    OperatingMode::Offline => &["--disable"],
                    OperatingMode::LowPower => &["--set-power-state-low"],
                    OperatingMode::Reset => &["--reset"],
                    OperatingMode::FactoryReset => &["--factory-reset=000000"],
                };

                for arg in args {
                    mmcli(&["-m", m, arg]).await?;
                }

                Response::Done
            }

            Command::ReadSlots => Response::Slots(self.slots(m).await?),

            Command::SelectSlot(index) => {
                let info = mmcli_json(&["-m", m, "-J"]).await?;
                if primary_slot(&info) != Some(index) {
                    let arg = format!("--set-primary-sim-slot={}", index + 1);
                    mmcli(&["-m", m, &arg]).await?;
                }

                let slot = self
                    .slots(m)
                    .await?
                    .into_iter()
                    .find(|s| s.index == index)
                    .wrap_err_with(|| format!("slot {index} disappeared"))?;

                Response::SlotSelected {
                    slot_name: format!("slot{}", index + 1),
                    slot_type: slot.application.to_string(),
                }
            }

            Command::SetSimPower { .. } => {
                bail!("sim power control is not supported by ModemManager")
            }

            Command::Attach => {
                mmcli(&["-m", m, "--3gpp-set-packet-service-state=attached"]).await?;
                Response::Done
            }

            Command::Detach => {
                mmcli(&["-m", m, "--3gpp-set-packet-service-state=detached"]).await?;
                Response::Done
            }

            Command::ReadRegistration => {
                let info = mmcli_json(&["-m", m, "-J"]).await?;
                Response::Registration(parse_registration(&info))
            }

            Command::ReadProfiles => {
                let list = mmcli_json(&["-m", m, "--3gpp-profile-manager-list", "-J"]).await?;
                Response::Profiles(parse_profiles(&list))
            }

            Command::WriteProfile(profile) => {
                let arg = format!(
                    "--3gpp-profile-manager-set={}",
                    profile_settings(&profile)?
                );
                mmcli(&["-m", m, &arg]).await?;

                Response::Done
            }

            Command::DeleteProfile(id) => {
                let arg = format!("--3gpp-profile-manager-delete=profile-id={id}");
                mmcli(&["-m", m, &arg]).await?;

                Response::Done
            }

            Command::StartSession { family, profile } => {
                let timeout = format!("--timeout={}", self.connect_timeout.as_secs());
                let connect = format!("--simple-connect={}", connect_settings(family, &profile));
                mmcli(&["-m", m, &timeout, &connect]).await?;

                Response::Done
            }

            Command::StopSession(family) => {
                for (id, bearer) in bearers(m).await? {
                    if bearer.connected && bearer.families.contains(&family) {
                        mmcli(&["-b", &id, "--disconnect"]).await?;
                    }
                }

                Response::Done
            }

            Command::ReadIpConfig(family) => {
                let config = bearers(m)
                    .await?
                    .into_iter()
                    .filter(|(_, b)| b.connected)
                    .find_map(|(_, b)| match family {
                        IpFamily::Ipv4 => b.ipv4,
                        IpFamily::Ipv6 => b.ipv6,
                    })
                    .wrap_err_with(|| format!("no connected bearer carries {family}"))?;

                Response::IpConfig(config)
            }

            Command::ReadSignal => {
                let out = mmcli(&["-m", m, "--signal-get", "-J"]).await?;
                Response::Signal(parse_signal(&out)?)
            }

            Command::ReadCellLocation => {
                let loc = self.location(m).await?;
                Response::CellLocation(loc.cell_location())
            }

            Command::ReadPlmn => {
                let info = mmcli_json(&["-m", m, "-J"]).await?;
                let loc = self
                    .location(m)
                    .await
                    .inspect_err(|e| debug!("failed to read location: {e}"))
                    .unwrap_or_default();

                Response::Plmn(parse_plmn(&info, &loc))
            }

            Command::ReadPacketStats => {
                let info = mmcli_json(&["-m", m, "-J"]).await?;
                let (_, wan, _) = parse_device(&info)?;
                Response::PacketStats(read_packet_stats(&self.sysfs, &wan).await?)
            }

            Command::ReadDeviceIdentity => {
                let info = mmcli_json(&["-m", m, "-J"]).await?;
                Response::DeviceIdentity(parse_identity(&info)?)
            }

            Command::ReadInterfaceStatus => {
                let info = mmcli_json(&["-m", m, "-J"]).await?;
                let (_, wan, _) = parse_device(&info)?;
                Response::InterfaceStatus(read_operstate(&self.sysfs, &wan).await?)
            }

            Command::ScanNetworks => {
                let scan = mmcli_json(&["-m", m, "--3gpp-scan", "--timeout=300", "-J"]).await?;
                Response::Networks(parse_scan(&scan))
            }

            Command::ReadRadioTechnology => {
                let info = mmcli_json(&["-m", m, "-J"]).await?;
                Response::RadioTechnology(parse_radio_technology(&info))
            }

            Command::SetPreferredRadioTechnology(rats) => {
                let (allowed, preferred) = modes_for(&rats);
                if allowed.is_empty() {
                    bail!("no ModemManager mode covers {rats}");
                }

                let allowed = format!("--set-allowed-modes={}", allowed.join("|"));
                let mut args = vec!["-m", m, allowed.as_str()];
                let preferred = preferred.map(|p| format!("--set-preferred-mode={p}"));
                if let Some(preferred) = &preferred {
                    args.push(preferred.as_str());
                }

                mmcli(&args).await?;

                Response::Done
            }
        };

        Ok(resp)
    }

    async fn slots(&self, m: &str) -> Result<Vec<UiccSlot>> {
        let info = mmcli_json(&["-m", m, "-J"]).await?;
        let primary = primary_slot(&info);
        let blocked = is_blocked(&info);
        let msisdn = info
            .pointer("/modem/generic/own-numbers")
            .and_then(Value::as_array)
            .and_then(|n| n.first()?.as_str())
            .unwrap_or_default()
            .to_owned();

        let mut slots = Vec::new();
        for (index, sim) in sim_paths(&info).into_iter().enumerate() {
            let index = index as u32;
            let sim = match sim {
                Some(id) => Some(parse_sim_info(&mmcli(&["-i", &id, "-J"]).await?)?),
                None => None,
            };

            let primary = primary == Some(index);
            slots.push(uicc_slot(index, sim.as_ref(), primary, primary && blocked, &msisdn));
        }

        Ok(slots)
    }

    async fn location(&self, m: &str) -> Result<Location> {
        let out = mmcli(&["-m", m, "--location-get", "--output-json"]).await?;
        parse_location(&out)
    }
}

async fn mmcli(args: &[&str]) -> Result<String> {
    run_cmd("mmcli", args).await
}

async fn mmcli_json(args: &[&str]) -> Result<Value> {
    let output = mmcli(args).await?;
    Ok(serde_json::from_str(&output)?)
}

async fn bearers(m: &str) -> Result<Vec<(String, Bearer)>> {
    let info = mmcli_json(&["-m", m, "-J"]).await?;
    let mut out = Vec::new();
    for id in bearer_ids(&info) {
        let bearer = mmcli(&["-b", &id, "-J"]).await?;
        out.push((id, parse_bearer(&bearer)?));
    }

    Ok(out)
}

// Polling

/// What one poll saw of the modem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Observed {
    modem: Option<ModemId>,
    registration: Option<RegistrationState>,
    /// Card presence per slot index.
    sims: Vec<bool>,
    primary: Option<u32>,
    blocked: bool,
    connected: BTreeSet<IpFamily>,
}

async fn poll(
    modem: State<Option<ModemId>>,
    sink: flume::Sender<Indication>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("starting modem manager poller");
    let mut seen = Observed::default();

    loop {
        match observe().await {
            Ok(next) => {
                modem.write(|m| *m = next.modem.clone());

                for indication in diff(&seen, &next) {
                    debug!(?indication, "synthesised modem indication");
                    if sink.send(indication).is_err() {
                        return;
                    }
                }

                seen = next;
            }

            Err(e) => warn!("failed to poll modem manager: {e}"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = time::sleep(interval) => {}
        }
    }
}

async fn observe() -> Result<Observed> {
    let list = mmcli(&["-L"]).await?;
    let Some(modem) = parse_mmcli_modem_list(&list).into_iter().next() else {
        return Ok(Observed::default());
    };

    let info = mmcli_json(&["-m", modem.id.as_str(), "-J"]).await?;
    let mut connected = BTreeSet::new();
    for id in bearer_ids(&info) {
        let bearer = parse_bearer(&mmcli(&["-b", &id, "-J"]).await?)?;
        if bearer.connected {
            connected.extend(bearer.families);
        }
    }

    Ok(Observed {
        modem: Some(modem.id),
        registration: Some(parse_registration(&info)),
        sims: sim_paths(&info).iter().map(Option::is_some).collect(),
        primary: primary_slot(&info),
        blocked: is_blocked(&info),
        connected,
    })
}

/// Indications that explain the change from `prev` to `next`. Card and
/// bearer changes are only reported for the same modem, a new modem starts
/// from a clean slate.
fn diff(prev: &Observed, next: &Observed) -> Vec<Indication> {
    let mut out = Vec::new();

    if prev.modem != next.modem {
        if prev.modem.is_some() {
            out.push(Indication::DeviceRemoved);
        }

        if next.modem.is_some() {
            out.push(Indication::DeviceDetected);
            out.extend(next.registration.map(Indication::Registration));
        }

        return out;
    }

    if next.modem.is_none() {
        return out;
    }

    if next.registration != prev.registration
        && let Some(state) = next.registration
    {
        out.push(Indication::Registration(state));
    }

    let slots = prev.sims.len().max(next.sims.len());
    for slot in 0..slots {
        let was = prev.sims.get(slot).copied().unwrap_or_default();
        let is = next.sims.get(slot).copied().unwrap_or_default();
        let slot = slot as u32;

        match (was, is) {
            (false, true) => out.push(Indication::CardInserted { slot }),
            (true, false) => out.push(Indication::CardStatus {
                slot,
                status: CardStatus::Empty,
            }),
            _ => {}
        }
    }

    if next.blocked
        && !prev.blocked
        && let Some(slot) = next.primary
    {
        out.push(Indication::CardStatus {
            slot,
            status: CardStatus::Blocked,
        });
    }

    for family in prev.connected.difference(&next.connected) {
        out.push(Indication::SessionDropped(*family));
    }

    out
}

// Parsing

macro_rules! jerr {
    ($s:expr) => {
        format!("could not get {}", $s)
    };
}

/// String field at `pointer`, with ModemManager's `--` placeholder treated as
/// missing.
fn field<'a>(json: &'a Value, pointer: &str) -> Option<&'a str> {
    json.pointer(pointer)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "--")
}

fn strings<'a>(json: &'a Value, pointer: &str) -> Vec<&'a str> {
    json.pointer(pointer)
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn parse_mmcli_modem_list(str: &str) -> Vec<Modem> {
    static RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^/org/freedesktop/ModemManager\d+/Modem/(?P<id>\d+)\s+\[(?P<vendor>[^\]]+)\]\s+(?P<model>.+)$")
            .expect("modem list regex is valid")
    });

    str.trim()
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("/org/freedesktop"))
        .filter_map(|line| {
            let captures = RE.captures(line)?;
            let id = captures.name("id")?.as_str().parse::<u32>().ok()?;
            let vendor = captures.name("vendor")?.as_str().to_string();
            let model = captures.name("model")?.as_str().to_string();

            Some(Modem {
                id: ModemId::from(id),
                vendor,
                model,
            })
        })
        .collect()
}

fn parse_device(json: &Value) -> Result<(String, String, OperatingMode)> {
    let model = field(json, "/modem/generic/model").wrap_err(jerr!("modem.generic.model"))?;
    let name = match field(json, "/modem/generic/manufacturer") {
        Some(manufacturer) => format!("{manufacturer} {model}"),
        None => model.to_owned(),
    };

    let wan = strings(json, "/modem/generic/ports")
        .into_iter()
        .find_map(|p| p.strip_suffix(" (net)"))
        .wrap_err(jerr!("modem.generic.ports net port"))?
        .to_owned();

    let mode = if field(json, "/modem/generic/power-state") == Some("low") {
        OperatingMode::LowPower
    } else if field(json, "/modem/generic/state") == Some("disabled") {
        OperatingMode::Offline
    } else {
        OperatingMode::Online
    };

    Ok((name, wan, mode))
}

fn parse_registration(json: &Value) -> RegistrationState {
    let (status, roaming) = match field(json, "/modem/3gpp/registration-state") {
        Some("home") => (NasStatus::Registered, RoamingStatus::Off),
        Some("roaming") => (NasStatus::Registered, RoamingStatus::On),
        Some("searching") => (NasStatus::Registering, RoamingStatus::Off),
        _ => (NasStatus::NotRegistered, RoamingStatus::Off),
    };

    let attached = field(json, "/modem/3gpp/packet-service-state") == Some("attached");
    let service = match (status, attached) {
        (NasStatus::Registered, true) => RegisteredService::CsPs,
        (NasStatus::Registered, false) => RegisteredService::Cs,
        (_, true) => RegisteredService::Ps,
        _ => RegisteredService::None,
    };

    RegistrationState {
        status,
        roaming,
        service,
    }
}

/// SIM object id per slot, `None` for an empty slot.
fn sim_paths(json: &Value) -> Vec<Option<String>> {
    let id = |path: &str| -> Option<String> {
        let id = path.rsplit('/').next()?;
        (!id.is_empty()).then(|| id.to_owned())
    };

    let slots = strings(json, "/modem/generic/sim-slots");
    if !slots.is_empty() {
        return slots.into_iter().map(id).collect();
    }

    vec![field(json, "/modem/generic/sim").and_then(id)]
}

/// Zero based index of the active slot.
fn primary_slot(json: &Value) -> Option<u32> {
    match field(json, "/modem/generic/primary-sim-slot") {
        Some(slot) => slot.parse::<u32>().ok()?.checked_sub(1),
        None => Some(0),
    }
}

fn is_blocked(json: &Value) -> bool {
    matches!(
        field(json, "/modem/generic/unlock-required"),
        Some("sim-puk") | Some("sim-puk2")
    )
}

fn bearer_ids(json: &Value) -> Vec<String> {
    strings(json, "/modem/generic/bearers")
        .into_iter()
        .filter_map(|p| p.rsplit('/').next())
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SimInfo {
    iccid: String,
    operator_name: String,
    active: bool,
    esim: bool,
}

fn parse_sim_info(str: &str) -> Result<SimInfo> {
    let json: Value = serde_json::from_str(str)?;

    let iccid = field(&json, "/sim/properties/iccid")
        .wrap_err(jerr!("sim.properties.iccid"))?
        .to_string();

    Ok(SimInfo {
        iccid,
        operator_name: field(&json, "/sim/properties/operator-name")
            .unwrap_or_default()
            .to_string(),
        active: field(&json, "/sim/properties/active") != Some("no"),
        esim: field(&json, "/sim/properties/sim-type") == Some("esim"),
    })
}

fn uicc_slot(
    index: u32,
    sim: Option<&SimInfo>,
    primary: bool,
    blocked: bool,
    msisdn: &str,
) -> UiccSlot {
    let Some(sim) = sim else {
        return UiccSlot {
            index,
            slot_enabled: true,
            ..Default::default()
        };
    };

    UiccSlot {
        index,
        slot_enabled: true,
        card_present: true,
        card_enabled: sim.active,
        application: if sim.esim {
            UiccApplication::Esim
        } else {
            UiccApplication::Usim
        },
        status: if blocked {
            CardStatus::Blocked
        } else {
            CardStatus::Valid
        },
        mno_name: sim.operator_name.clone(),
        iccid: sim.iccid.clone(),
        msisdn: if primary {
            msisdn.to_owned()
        } else {
            String::new()
        },
        ..Default::default()
    }
}

fn parse_signal(str: &str) -> Result<SignalInfo> {
    let json: Value = serde_json::from_str(str)?;

    let get = |f: &str| -> Option<f64> {
        ["5g", "lte", "gsm", "umts", "cdma1x", "evdo"]
            .iter()
            .find_map(|access_tech| {
                json["modem"]["signal"][access_tech][f]
                    .as_str()
                    .and_then(|x| x.parse().ok())
            })
    };

    let dbm = |v: Option<f64>| v.map(|v| v.round() as i32).unwrap_or_default();

    Ok(SignalInfo {
        rssi: dbm(get("rssi")),
        rsrq: dbm(get("rsrq")),
        rsrp: dbm(get("rsrp")),
        snr: dbm(get("snr").or_else(|| get("sinr"))),
        tx_power: dbm(get("tx-power")),
    })
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
struct Location {
    cid: Option<String>,
    lac: Option<String>,
    mcc: Option<String>,
    mnc: Option<String>,
    tac: Option<String>,
}

impl Location {
    fn hex(v: &Option<String>) -> Option<u64> {
        u64::from_str_radix(v.as_deref()?, 16).ok()
    }

    fn cell_id(&self) -> u64 {
        Self::hex(&self.cid).unwrap_or_default()
    }

    fn area_code(&self) -> u32 {
        Self::hex(&self.tac)
            .filter(|tac| *tac != 0)
            .or_else(|| Self::hex(&self.lac))
            .unwrap_or_default() as u32
    }

    /// The low byte of an E-UTRAN cell id identifies the cell within its
    /// eNodeB.
    fn cell_location(&self) -> CellLocation {
        CellLocation {
            global_cell_id: self.cell_id(),
            band: 0,
            serving_cell_id: self.cell_id() & 0xff,
        }
    }
}

fn parse_location(str: &str) -> Result<Location> {
    let mut json: Value = serde_json::from_str(str)?;
    let json = json["modem"]["location"]["3gpp"].take();
    let loc = serde_json::from_value(json)?;

    Ok(loc)
}

fn parse_plmn(json: &Value, loc: &Location) -> PlmnInfo {
    let registration = parse_registration(json);
    let code = field(json, "/modem/3gpp/operator-code").unwrap_or_default();
    let (mcc, mnc) = if code.len() >= 5 {
        code.split_at(3)
    } else {
        ("", "")
    };

    PlmnInfo {
        name: field(json, "/modem/3gpp/operator-name")
            .unwrap_or_default()
            .to_owned(),
        mcc: mcc.parse().unwrap_or_default(),
        mnc: mnc.parse().unwrap_or_default(),
        registration: registration.status,
        service: registration.service,
        roaming: registration.roaming,
        area_code: loc.area_code(),
        cell_id: loc.cell_id(),
    }
}

fn parse_identity(json: &Value) -> Result<DeviceIdentity> {
    let imei = field(json, "/modem/3gpp/imei")
        .or_else(|| field(json, "/modem/generic/equipment-identifier"))
        .wrap_err(jerr!("modem.3gpp.imei"))?;

    Ok(DeviceIdentity {
        imei: imei.to_owned(),
        imei_sv: String::new(),
        firmware_version: field(json, "/modem/generic/revision")
            .unwrap_or_default()
            .to_owned(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Bearer {
    connected: bool,
    families: Vec<IpFamily>,
    ipv4: Option<IpConfig>,
    ipv6: Option<IpConfig>,
}

fn parse_bearer(str: &str) -> Result<Bearer> {
    let json: Value = serde_json::from_str(str)?;
    let connected = field(&json, "/bearer/status/connected") == Some("yes");
    let interface = field(&json, "/bearer/status/interface")
        .unwrap_or_default()
        .to_owned();

    let families = match field(&json, "/bearer/properties/ip-type") {
        Some("ipv6") => vec![IpFamily::Ipv6],
        Some("ipv4v6") => vec![IpFamily::Ipv4, IpFamily::Ipv6],
        _ => vec![IpFamily::Ipv4],
    };

    let config = |family: IpFamily, key: &str| -> Option<IpConfig> {
        let base = format!("/bearer/{key}");
        let address = field(&json, &format!("{base}/address"))?.to_owned();
        let prefix = field(&json, &format!("{base}/prefix"))
            .and_then(|p| p.parse::<u8>().ok())
            .unwrap_or_default();
        let dns = strings(&json, &format!("{base}/dns"));

        Some(IpConfig {
            wan_ifname: interface.clone(),
            ip_type: Some(family),
            address,
            subnet_mask: match family {
                IpFamily::Ipv4 => ipv4_netmask(prefix).to_string(),
                IpFamily::Ipv6 => prefix.to_string(),
            },
            gateway: field(&json, &format!("{base}/gateway"))
                .unwrap_or_default()
                .to_owned(),
            dns1: dns.first().copied().unwrap_or_default().to_owned(),
            dns2: dns.get(1).copied().unwrap_or_default().to_owned(),
            domains: String::new(),
            mtu: field(&json, &format!("{base}/mtu"))
                .and_then(|m| m.parse().ok())
                .unwrap_or_default(),
        })
    };

    Ok(Bearer {
        connected,
        ipv4: config(IpFamily::Ipv4, "ipv4-config"),
        ipv6: config(IpFamily::Ipv6, "ipv6-config"),
        families,
    })
}

fn ipv4_netmask(prefix: u8) -> Ipv4Addr {
    let prefix = u32::from(prefix.min(32));
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);

    Ipv4Addr::from(mask)
}

fn ip_type(pdp_type: PdpType) -> Result<&'static str> {
    Ok(match pdp_type {
        PdpType::Ipv4 => "ipv4",
        PdpType::Ipv6 => "ipv6",
        PdpType::Ipv4OrIpv6 => "ipv4v6",
        PdpType::Ppp => bail!("PPP contexts are not supported by ModemManager"),
    })
}

fn auth(authentication: PdpAuthentication) -> &'static str {
    match authentication {
        PdpAuthentication::None => "none",
        PdpAuthentication::Pap => "pap",
        PdpAuthentication::Chap => "chap",
    }
}

fn profile_settings(profile: &PdpProfile) -> Result<String> {
    let id = profile.id.wrap_err("profile has no id")?;
    let mut settings = vec![
        format!("profile-id={id}"),
        format!("apn={}", profile.apn),
        format!("ip-type={}", ip_type(profile.pdp_type)?),
        format!("allowed-auth={}", auth(profile.authentication)),
        format!(
            "apn-type={}",
            if profile.is_default { "default" } else { "internet" }
        ),
    ];

    if !profile.name.is_empty() {
        settings.push(format!("profile-name={}", profile.name));
    }

    if !profile.username.is_empty() {
        settings.push(format!("user={}", profile.username));
        settings.push(format!("password={}", profile.password));
    }

    if profile.apn_disabled {
        settings.push("enabled=no".to_owned());
    }

    Ok(settings.join(","))
}

fn connect_settings(family: IpFamily, profile: &PdpProfile) -> String {
    let mut settings = vec![
        format!("apn={}", profile.apn),
        format!(
            "ip-type={}",
            match family {
                IpFamily::Ipv4 => "ipv4",
                IpFamily::Ipv6 => "ipv6",
            }
        ),
        format!("allowed-auth={}", auth(profile.authentication)),
    ];

    if !profile.username.is_empty() {
        settings.push(format!("user={}", profile.username));
        settings.push(format!("password={}", profile.password));
    }

    if profile.no_roaming {
        settings.push("allow-roaming=no".to_owned());
    }

    settings.join(",")
}

fn parse_profiles(json: &Value) -> Vec<PdpProfile> {
    let Some(list) = json
        .pointer("/modem/3gpp/profile-manager/list")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    list.iter()
        .filter_map(|entry| {
            let id = field(entry, "/profile-id")?.parse::<u32>().ok()?;
            let pdp_type = match field(entry, "/ip-type") {
                Some("ipv6") => PdpType::Ipv6,
                Some("ipv4v6") => PdpType::Ipv4OrIpv6,
                _ => PdpType::Ipv4,
            };
            let authentication = match field(entry, "/allowed-auth") {
                Some(a) if a.contains("chap") => PdpAuthentication::Chap,
                Some(a) if a.contains("pap") => PdpAuthentication::Pap,
                _ => PdpAuthentication::None,
            };

            Some(
                PdpProfile::builder()
                    .id(ProfileId(id))
                    .pdp_context(id)
                    .pdp_type(pdp_type)
                    .authentication(authentication)
                    .name(field(entry, "/profile-name").unwrap_or_default())
                    .apn(field(entry, "/apn").unwrap_or_default())
                    .username(field(entry, "/user").unwrap_or_default())
                    .password(field(entry, "/password").unwrap_or_default())
                    .apn_disabled(field(entry, "/enabled") == Some("no"))
                    .is_default(
                        field(entry, "/apn-type").is_some_and(|t| t.contains("default")),
                    )
                    .build(),
            )
        })
        .collect()
}

/// Entries look like
/// `operator-code: 26202, operator-name: vodafone.de, access-technologies: lte, availability: available`.
fn parse_scan(json: &Value) -> Vec<NetworkScanResult> {
    strings(json, "/modem/3gpp/scan-networks")
        .into_iter()
        .filter_map(|entry| {
            let get = |key: &str| {
                entry.split(", ").find_map(|kv| {
                    let (k, v) = kv.split_once(':')?;
                    (k.trim() == key).then(|| v.trim())
                })
            };

            let code = get("operator-code")?;
            if code.len() < 5 {
                return None;
            }
            let (mcc, mnc) = code.split_at(3);

            Some(NetworkScanResult {
                name: get("operator-name").unwrap_or_default().to_owned(),
                mcc: mcc.parse().ok()?,
                mnc: mnc.parse().ok()?,
                allowed: get("availability") != Some("forbidden"),
            })
        })
        .collect()
}

const MODES: [(&str, &[Rat]); 4] = [
    ("2g", &[Rat::Gprs, Rat::Edge]),
    ("3g", &[Rat::Umts, Rat::UmtsHspa]),
    ("4g", &[Rat::Lte]),
    ("5g", &[Rat::Nr]),
];

fn rats_of_mode(mode: &str) -> &'static [Rat] {
    MODES
        .iter()
        .find(|(m, _)| *m == mode.trim())
        .map(|(_, rats)| *rats)
        .unwrap_or_default()
}

fn rat_of_access_tech(tech: &str) -> Option<Rat> {
    Some(match tech {
        "gsm" | "gsm-compact" | "gprs" => Rat::Gprs,
        "edge" => Rat::Edge,
        "umts" => Rat::Umts,
        "hsdpa" | "hsupa" | "hspa" | "hspa-plus" => Rat::UmtsHspa,
        "1xrtt" => Rat::Cdma2000OneX,
        "evdo0" | "evdoa" | "evdob" => Rat::Cdma2000Hrpd,
        "lte" | "lte-cat-m" | "lte-nb-iot" => Rat::Lte,
        "5gnr" => Rat::Nr,
        _ => return None,
    })
}

/// Splits `allowed: 2g, 3g, 4g; preferred: 4g` into both sets.
fn parse_modes(modes: &str) -> (RatSet, RatSet) {
    let mut allowed = RatSet::new();
    let mut preferred = RatSet::new();

    for part in modes.split(';') {
        let Some((key, value)) = part.split_once(':') else {
            continue;
        };

        let target = match key.trim() {
            "allowed" => &mut allowed,
            "preferred" => &mut preferred,
            _ => continue,
        };

        for mode in value.split(',') {
            for rat in rats_of_mode(mode) {
                target.insert(*rat);
            }
        }
    }

    (allowed, preferred)
}

fn parse_radio_technology(json: &Value) -> RadioTechnology {
    let current = strings(json, "/modem/generic/access-technologies")
        .into_iter()
        .flat_map(|t| t.split(','))
        .filter_map(|t| rat_of_access_tech(t.trim()))
        .collect();

    let (_, preferred) = parse_modes(field(json, "/modem/generic/current-modes").unwrap_or_default());

    let supported = strings(json, "/modem/generic/supported-modes")
        .into_iter()
        .flat_map(|m| parse_modes(m).0.iter().collect::<Vec<_>>())
        .collect();

    RadioTechnology {
        current,
        preferred,
        supported,
    }
}

/// ModemManager modes covering `rats`, and the newest of them as preferred
/// mode when more than one is allowed.
fn modes_for(rats: &RatSet) -> (Vec<&'static str>, Option<&'static str>) {
    let allowed: Vec<_> = MODES
        .iter()
        .filter(|(_, covered)| covered.iter().any(|r| rats.contains(*r)))
        .map(|(mode, _)| *mode)
        .collect();

    let preferred = if allowed.len() > 1 {
        allowed.last().copied()
    } else {
        None
    };

    (allowed, preferred)
}

async fn read_counter(dir: &Path, name: &str) -> Result<u64> {
    let value = fs::read_to_string(dir.join(name)).await?;
    Ok(value.trim().parse()?)
}

async fn read_packet_stats(sysfs: &Path, wan: &str) -> Result<PacketStats> {
    let dir = sysfs.join("class").join("net").join(wan).join("statistics");

    Ok(PacketStats {
        bytes_sent: read_counter(&dir, "tx_bytes").await?,
        bytes_received: read_counter(&dir, "rx_bytes").await?,
        packets_sent: read_counter(&dir, "tx_packets").await?,
        packets_received: read_counter(&dir, "rx_packets").await?,
        packets_sent_dropped: read_counter(&dir, "tx_dropped").await?,
        packets_received_dropped: read_counter(&dir, "rx_dropped").await?,
        upstream_max_bit_rate: 0,
        downstream_max_bit_rate: 0,
    })
}

fn parse_operstate(state: &str) -> InterfaceStatus {
    match state.trim() {
        "up" => InterfaceStatus::Up,
        "down" => InterfaceStatus::Down,
        "dormant" => InterfaceStatus::Dormant,
        "notpresent" => InterfaceStatus::NotPresent,
        "lowerlayerdown" => InterfaceStatus::LowerLayerDown,
        _ => InterfaceStatus::Unknown,
    }
}

async fn read_operstate(sysfs: &Path, wan: &str) -> Result<InterfaceStatus> {
    let path = sysfs.join("class").join("net").join(wan).join("operstate");

    match fs::read_to_string(path).await {
        Ok(state) => Ok(parse_operstate(&state)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(InterfaceStatus::NotPresent),
        Err(e) => {
            warn!("failed to read {wan} operstate: {e}");
            Ok(InterfaceStatus::Error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEM_INFO: &str = r#"{"modem":{"3gpp":{"imei":"353338976168895","operator-code":"26202","operator-name":"vodafone.de","packet-service-state":"attached","registration-state":"roaming"},"generic":{"access-technologies":["lte"],"bearers":["/org/freedesktop/ModemManager1/Bearer/1"],"current-modes":"allowed: 2g, 3g, 4g; preferred: 4g","equipment-identifier":"353338976168895","manufacturer":"Telit","model":"LE910C4-WWXD","own-numbers":["+4915112345678"],"ports":["cdc-wdm0 (qmi)","ttyUSB0 (ignored)","ttyUSB1 (at)","wwan0 (net)"],"power-state":"on","primary-sim-slot":"1","revision":"25.30.608  1  [Nov 14 2023 07:00:00]","sim":"/org/freedesktop/ModemManager1/SIM/0","sim-slots":["/org/freedesktop/ModemManager1/SIM/0","/"],"state":"connected","supported-modes":["allowed: 2g; preferred: none","allowed: 3g, 4g; preferred: 4g"],"unlock-required":"sim-pin2"}}}"#;

    fn modem_info() -> Value {
        serde_json::from_str(MODEM_INFO).unwrap()
    }

    #[test]
    fn it_parses_modem_list() {
        let val1 = "Found 1 modems:
        /org/freedesktop/ModemManager1/Modem/0 [Telit] LE910C4-WWXD
        /org/freedesktop/ModemManager1/Modem/2 [Sierra Wireless, Incorporated] MC8705";

        assert_eq!(
            parse_mmcli_modem_list(val1),
            vec![
                Modem {
                    id: ModemId::from(0),
                    vendor: "Telit".to_string(),
                    model: "LE910C4-WWXD".to_string(),
                },
                Modem {
                    id: ModemId::from(2),
                    vendor: "Sierra Wireless, Incorporated".to_string(),
                    model: "MC8705".to_string(),
                },
            ]
        );
        assert_eq!(parse_mmcli_modem_list("No modems were found"), vec![]);
        assert_eq!(parse_mmcli_modem_list(""), vec![]);
    }

    #[test]
    fn it_parses_device_and_registration() {
        let info = modem_info();

        let (name, wan, mode) = parse_device(&info).unwrap();
        assert_eq!(name, "Telit LE910C4-WWXD");
        assert_eq!(wan, "wwan0");
        assert_eq!(mode, OperatingMode::Online);

        assert_eq!(
            parse_registration(&info),
            RegistrationState {
                status: NasStatus::Registered,
                roaming: RoamingStatus::On,
                service: RegisteredService::CsPs,
            }
        );
    }

    #[test]
    fn it_parses_sim_slots() {
        let info = modem_info();

        assert_eq!(sim_paths(&info), vec![Some("0".to_string()), None]);
        assert_eq!(primary_slot(&info), Some(0));
        assert!(!is_blocked(&info));
        assert_eq!(bearer_ids(&info), vec!["1".to_string()]);

        let sim = parse_sim_info(r#"{"sim":{"dbus-path":"/org/freedesktop/ModemManager1/SIM/0","properties":{"active":"yes","eid":"--","iccid":"89883030000111825060","imsi":"295050905643977","operator-code":"29505","operator-name":"FL1","sim-type":"--"}}}"#).unwrap();
        let slot = uicc_slot(0, Some(&sim), true, false, "+4915112345678");

        assert!(slot.is_usable());
        assert_eq!(slot.iccid, "89883030000111825060");
        assert_eq!(slot.mno_name, "FL1");
        assert_eq!(slot.msisdn, "+4915112345678");
        assert_eq!(slot.application, UiccApplication::Usim);

        let empty = uicc_slot(1, None, false, false, "");
        assert!(!empty.card_present);
        assert_eq!(empty.status, CardStatus::Empty);
    }

    #[test]
    fn it_parses_signal() {
        let val = r#"{"modem":{"signal":{"5g":{"error-rate":"--","rsrp":"--","rsrq":"-14.00","snr":"--"},"cdma1x":{"ecio":"--","error-rate":"--","rssi":"-69.00"},"gsm":{"error-rate":"--","rssi":"-69.0"},"lte":{"error-rate":"--","rsrp":"-104.00","rsrq":"--","rssi":"--","snr":"2.00"},"refresh":{"rate":"10"}}}}"#;

        assert_eq!(
            parse_signal(val).unwrap(),
            SignalInfo {
                rssi: -69,
                rsrq: -14,
                rsrp: -104,
                snr: 2,
                tx_power: 0,
            }
        );
    }

    #[test]
    fn it_parses_location_and_plmn() {
        let val = r#"{"modem":{"location":{"3gpp":{"cid":"0197763E","lac":"0000","mcc":"262","mnc":"03","tac":"00C945"},"gps":{"altitude":"--"}}}}"#;
        let loc = parse_location(val).unwrap();

        assert_eq!(
            loc.cell_location(),
            CellLocation {
                global_cell_id: 0x0197763E,
                band: 0,
                serving_cell_id: 0x3E,
            }
        );

        let plmn = parse_plmn(&modem_info(), &loc);
        assert_eq!(plmn.name, "vodafone.de");
        assert_eq!((plmn.mcc, plmn.mnc), (262, 2));
        assert_eq!(plmn.area_code, 0xC945);
        assert_eq!(plmn.roaming, RoamingStatus::On);
    }

    #[test]
    fn it_parses_bearers() {
        let val = r#"{"bearer":{"dbus-path":"/org/freedesktop/ModemManager1/Bearer/1","ipv4-config":{"address":"10.64.12.7","dns":["10.74.210.210","10.74.210.211"],"gateway":"10.64.12.8","method":"static","mtu":"1430","prefix":"30"},"ipv6-config":{"address":"--","dns":[],"gateway":"--","method":"--","mtu":"--","prefix":"--"},"properties":{"apn":"em","ip-type":"ipv4"},"status":{"connected":"yes","interface":"wwan0"}}}"#;

        let bearer = parse_bearer(val).unwrap();
        assert!(bearer.connected);
        assert_eq!(bearer.families, vec![IpFamily::Ipv4]);
        assert_eq!(bearer.ipv6, None);
        assert_eq!(
            bearer.ipv4,
            Some(IpConfig {
                wan_ifname: "wwan0".into(),
                ip_type: Some(IpFamily::Ipv4),
                address: "10.64.12.7".into(),
                subnet_mask: "255.255.255.252".into(),
                gateway: "10.64.12.8".into(),
                dns1: "10.74.210.210".into(),
                dns2: "10.74.210.211".into(),
                domains: String::new(),
                mtu: 1430,
            })
        );
    }

    #[test]
    fn it_converts_between_rats_and_modes() {
        let radio = parse_radio_technology(&modem_info());

        assert_eq!(radio.current, RatSet::from([Rat::Lte]));
        assert_eq!(radio.preferred, RatSet::from([Rat::Lte]));
        assert_eq!(radio.supported.to_legacy_string(), "GPRS,EDGE,UMTS,UMTSHSPA,LTE");

        assert_eq!(
            modes_for(&RatSet::from([Rat::Umts, Rat::Lte])),
            (vec!["3g", "4g"], Some("4g"))
        );
        assert_eq!(modes_for(&RatSet::from([Rat::Lte])), (vec!["4g"], None));
    }

    #[test]
    fn it_renders_and_parses_profiles() {
        let profile = PdpProfile::builder()
            .id(ProfileId(2))
            .apn("em")
            .authentication(PdpAuthentication::Pap)
            .username("user")
            .password("secret")
            .is_default(true)
            .build();

        assert_eq!(
            profile_settings(&profile).unwrap(),
            "profile-id=2,apn=em,ip-type=ipv4,allowed-auth=pap,apn-type=default,user=user,password=secret"
        );

        let list: Value = serde_json::from_str(r#"{"modem":{"3gpp":{"profile-manager":{"list":[{"profile-id":"2","apn":"em","ip-type":"ipv4v6","apn-type":"default","allowed-auth":"pap","user":"user","password":"secret"},{"profile-id":"--","apn":"broken"}]}}}}"#).unwrap();
        let parsed = parse_profiles(&list);

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, Some(ProfileId(2)));
        assert_eq!(parsed[0].pdp_type, PdpType::Ipv4OrIpv6);
        assert!(parsed[0].is_default);
    }

    #[test]
    fn it_parses_scan_results() {
        let scan: Value = serde_json::from_str(r#"{"modem":{"3gpp":{"scan-networks":["operator-code: 26201, operator-name: Telekom.de, access-technologies: lte, availability: available","operator-code: 26203, operator-name: o2 - de, access-technologies: lte, availability: forbidden"]}}}"#).unwrap();

        assert_eq!(
            parse_scan(&scan),
            vec![
                NetworkScanResult {
                    name: "Telekom.de".into(),
                    mcc: 262,
                    mnc: 1,
                    allowed: true,
                },
                NetworkScanResult {
                    name: "o2 - de".into(),
                    mcc: 262,
                    mnc: 3,
                    allowed: false,
                },
            ]
        );
    }

    #[test]
    fn it_synthesises_indications_from_polls() {
        let registered = RegistrationState {
            status: NasStatus::Registered,
            ..Default::default()
        };
        let first = Observed {
            modem: Some(ModemId::from(0)),
            registration: Some(registered),
            sims: vec![true, false],
            primary: Some(0),
            blocked: false,
            connected: BTreeSet::from([IpFamily::Ipv4]),
        };

        assert_eq!(
            diff(&Observed::default(), &first),
            vec![Indication::DeviceDetected, Indication::Registration(registered)]
        );
        assert_eq!(diff(&first, &first), vec![]);

        let second = Observed {
            registration: Some(RegistrationState::default()),
            sims: vec![true, true],
            blocked: true,
            connected: BTreeSet::new(),
            ..first.clone()
        };
        assert_eq!(
            diff(&first, &second),
            vec![
                Indication::Registration(RegistrationState::default()),
                Indication::CardInserted { slot: 1 },
                Indication::CardStatus {
                    slot: 0,
                    status: CardStatus::Blocked,
                },
                Indication::SessionDropped(IpFamily::Ipv4),
            ]
        );

        assert_eq!(
            diff(&second, &Observed::default()),
            vec![Indication::DeviceRemoved]
        );
    }

    #[test]
    fn it_maps_operstate() {
        assert_eq!(parse_operstate("up\n"), InterfaceStatus::Up);
        assert_eq!(parse_operstate("lowerlayerdown"), InterfaceStatus::LowerLayerDown);
        assert_eq!(parse_operstate("weird"), InterfaceStatus::Unknown);
        assert!(parse_operstate("down").is_broken());
    }
}

//! The public face of the HAL.
//!
//! [`CellularHal`] is a cheap handle around two tasks: an owner task that
//! holds every state machine and processes requests and transport
//! indications one at a time, and a pump that forwards indications to it.
//! Synchronous queries never reach the owner, they read the [`Snapshot`] the
//! owner publishes after every change.

use crate::{
    callbacks::{
        DeviceOpenedHandler, DeviceRemovedHandler, IpReadyHandler, PacketServiceHandler,
        ProfileStatusHandler, RegistrationHandler, SessionHandlers, SlotStatusHandler,
    },
    config::Config,
    device::{DeviceState, ModemDevice, OperatingMode},
    error::{Conflict, HalError, Missing, Precondition, Result},
    profile::{PdpProfile, ProfileTable},
    registration::RegistrationState,
    session::{IpConfig, IpFamily, IpPreference, SessionState},
    telemetry::{
        CellLocation, DeviceIdentity, InterfaceStatus, NetworkScanResult, PacketStats,
        PlmnInfo, RadioTechnology, RatSet, SignalInfo,
    },
    transport::{expect_response, Command, Response, Transport},
    uicc::{CardStatus, SlotStatus, UiccSlot},
    utils::{retry_on_timeout, State},
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{task, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod owner;

pub type Tasks = Vec<JoinHandle<color_eyre::Result<()>>>;

/// Consistent view of everything the owner task knows, replaced wholesale on
/// every change.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub device_state: DeviceState,
    pub device: Option<ModemDevice>,
    pub slots: Vec<UiccSlot>,
    pub selected_slot: Option<u32>,
    pub slot_status: SlotStatus,
    pub registration: RegistrationState,
    pub profiles: Arc<ProfileTable>,
    pub sessions: BTreeMap<IpFamily, SessionState>,
    pub ip_configs: BTreeMap<IpFamily, IpConfig>,
}

impl Snapshot {
    pub fn is_present(&self) -> bool {
        !matches!(
            self.device_state,
            DeviceState::NotPresent | DeviceState::Removed
        )
    }

    fn ensure_present(&self) -> Result<()> {
        if self.is_present() {
            Ok(())
        } else {
            Err(HalError::DeviceAbsent)
        }
    }

    fn ensure_device_ready(&self) -> Result<()> {
        self.ensure_present()?;
        if self.device_state != DeviceState::Ready {
            return Err(HalError::PreconditionNotMet(Precondition::DeviceNotReady));
        }

        Ok(())
    }

    fn ensure_slot_ready(&self) -> Result<()> {
        self.ensure_device_ready()?;
        if self.slot_status != SlotStatus::Ready {
            return Err(HalError::PreconditionNotMet(Precondition::SlotNotReady));
        }

        Ok(())
    }

    fn selected(&self) -> Result<&UiccSlot> {
        self.ensure_present()?;
        self.selected_slot
            .and_then(|index| self.slots.iter().find(|s| s.index == index))
            .ok_or(HalError::PreconditionNotMet(Precondition::SlotNotSelected))
    }

    fn session_state(&self, family: IpFamily) -> SessionState {
        self.sessions.get(&family).copied().unwrap_or_default()
    }
}

pub(crate) enum Request {
    OpenDevice {
        opened: Arc<dyn DeviceOpenedHandler>,
        removed: Arc<dyn DeviceRemovedHandler>,
    },
    SetOperatingMode(OperatingMode),
    SelectSlot(Arc<dyn SlotStatusHandler>),
    SetSimPower {
        slot: u32,
        enable: bool,
    },
    MonitorRegistration(Arc<dyn RegistrationHandler>),
    Attach,
    Detach,
    CreateProfile {
        profile: Option<PdpProfile>,
        handler: Arc<dyn ProfileStatusHandler>,
    },
    ModifyProfile {
        profile: PdpProfile,
        handler: Arc<dyn ProfileStatusHandler>,
    },
    DeleteProfile {
        profile: PdpProfile,
        handler: Arc<dyn ProfileStatusHandler>,
    },
    StartNetwork {
        families: Vec<IpFamily>,
        profile: PdpProfile,
        handlers: SessionHandlers,
    },
    StopNetwork(IpPreference),
}

/// Sends one command, bounded by `timeout` and aborted as soon as `token` is
/// cancelled by a device removal.
pub(crate) async fn call(
    transport: &dyn Transport,
    command: Command,
    timeout: Duration,
    token: &CancellationToken,
) -> Result<Response> {
    let name = command.name();
    debug!(command = name, "sending command to modem");

    tokio::select! {
        _ = token.cancelled() => {
            debug!(command = name, "command cancelled by device removal");
            Err(HalError::DeviceAbsent)
        }

        res = time::timeout(timeout, transport.send(command)) => match res {
            Ok(res) => res.map_err(HalError::from),
            Err(_) => {
                warn!(command = name, ?timeout, "command timed out");
                Err(HalError::TransportTimeout(timeout))
            }
        },
    }
}

pub struct CellularHal {
    transport: Arc<dyn Transport>,
    config: Config,
    requests: flume::Sender<Request>,
    snapshot: State<Snapshot>,
    device_token: State<CancellationToken>,
    shutdown: CancellationToken,
    tasks: Tasks,
}

impl CellularHal {
    /// Starts the owner and indication pump tasks. Must be called from within
    /// a tokio runtime.
    pub fn spawn(transport: impl Transport, config: Config) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let snapshot = State::new(Snapshot::default());
        let device_token = State::new(CancellationToken::new());
        let shutdown = CancellationToken::new();

        let (requests_tx, requests_rx) = flume::unbounded();
        let (indications_tx, indications_rx) = flume::unbounded();

        info!(?config, "starting cellular hal");

        let pump = task::spawn(owner::pump(
            transport.indications(),
            indications_tx,
            device_token.clone(),
            shutdown.clone(),
        ));

        let owner = owner::Owner::new(
            transport.clone(),
            config.clone(),
            snapshot.clone(),
            device_token.clone(),
        );
        let owner = task::spawn(owner.run(requests_rx, indications_rx, shutdown.clone()));

        Self {
            transport,
            config,
            requests: requests_tx,
            snapshot,
            device_token,
            shutdown,
            tasks: vec![pump, owner],
        }
    }

    /// Stops both tasks. Live sessions are stopped and the control interface
    /// is closed before the owner exits.
    pub async fn shutdown(self) -> color_eyre::Result<()> {
        info!("shutting down cellular hal");
        self.shutdown.cancel();

        for handle in self.tasks {
            handle.await??;
        }

        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read(Snapshot::clone)
    }

    fn submit(&self, request: Request) -> Result<()> {
        self.requests.send(request).map_err(|_| {
            warn!("cellular hal owner task is not running");
            HalError::DeviceAbsent
        })
    }

    // Device lifecycle

    pub fn is_device_present(&self) -> bool {
        self.snapshot.read(Snapshot::is_present)
    }

    pub fn is_control_interface_opened(&self) -> bool {
        self.snapshot.read(|s| {
            s.device_state == DeviceState::Ready
                && s.device.as_ref().is_some_and(|d| d.control_opened)
        })
    }

    pub fn device_state(&self) -> DeviceState {
        self.snapshot.read(|s| s.device_state)
    }

    pub fn device(&self) -> Option<ModemDevice> {
        self.snapshot.read(|s| s.device.clone())
    }

    /// Opens the modem control interface. Progress and outcome are reported to
    /// `opened`; `removed` fires if the modem is unplugged afterwards.
    pub fn open_device(
        &self,
        opened: impl DeviceOpenedHandler,
        removed: impl DeviceRemovedHandler,
    ) -> Result<()> {
        self.snapshot.read(|s| {
            s.ensure_present()?;
            match s.device_state {
                DeviceState::Opening => {
                    return Err(HalError::PreconditionNotMet(Precondition::OpenInProgress));
                }
                DeviceState::Ready => {
                    return Err(HalError::PreconditionNotMet(Precondition::AlreadyOpen));
                }
                _ => {}
            }

            Ok(())
        })?;

        self.submit(Request::OpenDevice {
            opened: Arc::new(opened),
            removed: Arc::new(removed),
        })
    }

    pub fn set_operating_config(&self, mode: OperatingMode) -> Result<()> {
        self.snapshot.read(Snapshot::ensure_device_ready)?;
        self.submit(Request::SetOperatingMode(mode))
    }

    pub fn reset(&self) -> Result<()> {
        self.set_operating_config(OperatingMode::Reset)
    }

    pub fn factory_reset(&self) -> Result<()> {
        self.set_operating_config(OperatingMode::FactoryReset)
    }

    // SIM / UICC

    pub fn select_slot(&self, handler: impl SlotStatusHandler) -> Result<()> {
        self.snapshot.read(Snapshot::ensure_device_ready)?;
        self.submit(Request::SelectSlot(Arc::new(handler)))
    }

    /// Acknowledges the submission only. The resulting slot state shows up in
    /// [`CellularHal::slot_info`] after the follow-up refresh.
    pub fn set_sim_power(&self, slot: u32, enable: bool) -> Result<()> {
        self.snapshot.read(|s| {
            s.ensure_device_ready()?;
            let info = s
                .slots
                .iter()
                .find(|x| x.index == slot)
                .ok_or(HalError::NotFound(Missing::Slot(slot)))?;

            if !info.card_present {
                return Err(HalError::PreconditionNotMet(Precondition::CardAbsent));
            }

            Ok(())
        })?;

        self.submit(Request::SetSimPower { slot, enable })
    }

    pub fn total_slots(&self) -> Result<u32> {
        self.snapshot.read(|s| {
            s.ensure_present()?;
            Ok(s.slots.len() as u32)
        })
    }

    pub fn slot_info(&self, index: u32) -> Result<UiccSlot> {
        self.snapshot.read(|s| {
            s.ensure_present()?;
            s.slots
                .iter()
                .find(|x| x.index == index)
                .cloned()
                .ok_or(HalError::NotFound(Missing::Slot(index)))
        })
    }

    pub fn active_card_status(&self) -> Result<CardStatus> {
        self.snapshot.read(|s| s.selected().map(|slot| slot.status))
    }

    pub fn iccid(&self) -> Result<String> {
        self.snapshot.read(|s| s.selected().map(|slot| slot.iccid.clone()))
    }

    pub fn msisdn(&self) -> Result<String> {
        self.snapshot.read(|s| s.selected().map(|slot| slot.msisdn.clone()))
    }

    // Registration

    /// Standing subscription. The current state is delivered right away, then
    /// every change until the device is removed.
    pub fn monitor_registration(&self, handler: impl RegistrationHandler) -> Result<()> {
        self.snapshot.read(Snapshot::ensure_device_ready)?;
        self.submit(Request::MonitorRegistration(Arc::new(handler)))
    }

    pub fn registration(&self) -> RegistrationState {
        self.snapshot.read(|s| s.registration)
    }

    pub fn attach(&self) -> Result<()> {
        self.snapshot.read(Snapshot::ensure_slot_ready)?;
        self.submit(Request::Attach)
    }

    pub fn detach(&self) -> Result<()> {
        self.snapshot.read(Snapshot::ensure_slot_ready)?;
        self.submit(Request::Detach)
    }

    // Profiles

    /// Creates `profile`, allocating an id if it has none. `None` resolves
    /// the current default profile instead.
    pub fn create_profile(
        &self,
        profile: Option<PdpProfile>,
        handler: impl ProfileStatusHandler,
    ) -> Result<()> {
        self.snapshot.read(Snapshot::ensure_slot_ready)?;
        self.submit(Request::CreateProfile {
            profile,
            handler: Arc::new(handler),
        })
    }

    pub fn modify_profile(
        &self,
        profile: Option<PdpProfile>,
        handler: impl ProfileStatusHandler,
    ) -> Result<()> {
        let profile =
            profile.ok_or(HalError::PreconditionNotMet(Precondition::ProfileRequired))?;
        self.snapshot.read(Snapshot::ensure_slot_ready)?;
        self.submit(Request::ModifyProfile {
            profile,
            handler: Arc::new(handler),
        })
    }

    pub fn delete_profile(
        &self,
        profile: PdpProfile,
        handler: impl ProfileStatusHandler,
    ) -> Result<()> {
        self.snapshot.read(Snapshot::ensure_slot_ready)?;
        self.submit(Request::DeleteProfile {
            profile,
            handler: Arc::new(handler),
        })
    }

    pub fn list_profiles(&self) -> Result<Vec<PdpProfile>> {
        self.snapshot.read(|s| {
            s.ensure_present()?;
            Ok(s.profiles.list())
        })
    }

    pub fn profile_table_version(&self) -> u64 {
        self.snapshot.read(|s| s.profiles.version())
    }

    // Data sessions

    /// Brings up a data session for every family in `ip`. Preconditions are
    /// checked here, everything after that is reported to the handlers.
    /// `None` uses the default profile of the configured profile type.
    pub fn start_network(
        &self,
        ip: IpPreference,
        profile: Option<PdpProfile>,
        packet_service: impl PacketServiceHandler,
        ip_ready: impl IpReadyHandler,
    ) -> Result<()> {
        let profile = self.snapshot.read(|s| {
            s.ensure_slot_ready()?;
            if !s.registration.is_registered() {
                return Err(HalError::PreconditionNotMet(Precondition::NotRegistered));
            }

            if let Some(family) = ip
                .families()
                .iter()
                .find(|f| s.session_state(**f) != SessionState::Idle)
            {
                return Err(HalError::ResourceConflict(Conflict::SessionActive(*family)));
            }

            match profile {
                Some(p) => Ok(p),
                None => s
                    .profiles
                    .default_profile(self.config.profile_type)
                    .cloned()
                    .ok_or(HalError::NotFound(Missing::DefaultProfile)),
            }
        })?;

        self.submit(Request::StartNetwork {
            families: ip.families().to_vec(),
            profile,
            handlers: SessionHandlers::new(packet_service, ip_ready),
        })
    }

    /// Idempotent. Families that are not running are skipped silently.
    pub fn stop_network(&self, ip: IpPreference) -> Result<()> {
        self.submit(Request::StopNetwork(ip))
    }

    pub fn session_state(&self, family: IpFamily) -> SessionState {
        self.snapshot.read(|s| s.session_state(family))
    }

    pub fn ip_config(&self, family: IpFamily) -> Option<IpConfig> {
        self.snapshot.read(|s| s.ip_configs.get(&family).cloned())
    }

    // Telemetry

    async fn query(&self, command: Command) -> Result<Response> {
        self.snapshot.read(Snapshot::ensure_device_ready)?;
        let token = self.device_token.read(CancellationToken::clone);

        retry_on_timeout(
            self.config.query_attempts,
            self.config.query_backoff,
            || {
                call(
                    self.transport.as_ref(),
                    command.clone(),
                    self.config.command_timeout,
                    &token,
                )
            },
        )
        .await
    }

    pub async fn signal_info(&self) -> Result<SignalInfo> {
        let resp = self.query(Command::ReadSignal).await?;
        Ok(expect_response!(resp, Signal(s))?)
    }

    pub async fn cell_location(&self) -> Result<CellLocation> {
        let resp = self.query(Command::ReadCellLocation).await?;
        Ok(expect_response!(resp, CellLocation(l))?)
    }

    pub async fn plmn_info(&self) -> Result<PlmnInfo> {
        let resp = self.query(Command::ReadPlmn).await?;
        Ok(expect_response!(resp, Plmn(p))?)
    }

    pub async fn packet_stats(&self) -> Result<PacketStats> {
        let resp = self.query(Command::ReadPacketStats).await?;
        Ok(expect_response!(resp, PacketStats(p))?)
    }

    pub async fn device_identity(&self) -> Result<DeviceIdentity> {
        let resp = self.query(Command::ReadDeviceIdentity).await?;
        Ok(expect_response!(resp, DeviceIdentity(d))?)
    }

    pub async fn interface_status(&self) -> Result<InterfaceStatus> {
        let resp = self.query(Command::ReadInterfaceStatus).await?;
        Ok(expect_response!(resp, InterfaceStatus(s))?)
    }

    pub async fn radio_technology(&self) -> Result<RadioTechnology> {
        let resp = self.query(Command::ReadRadioTechnology).await?;
        Ok(expect_response!(resp, RadioTechnology(r))?)
    }

    /// Single attempt bounded by `scan_timeout`.
    pub async fn available_networks(&self) -> Result<Vec<NetworkScanResult>> {
        self.snapshot.read(Snapshot::ensure_device_ready)?;
        let token = self.device_token.read(CancellationToken::clone);

        let resp = call(
            self.transport.as_ref(),
            Command::ScanNetworks,
            self.config.scan_timeout,
            &token,
        )
        .await?;

        Ok(expect_response!(resp, Networks(n))?)
    }

    pub async fn set_preferred_radio_technology(&self, rats: RatSet) -> Result<()> {
        self.snapshot.read(Snapshot::ensure_device_ready)?;
        let token = self.device_token.read(CancellationToken::clone);

        info!(%rats, "setting preferred radio access technologies");
        let resp = call(
            self.transport.as_ref(),
            Command::SetPreferredRadioTechnology(rats),
            self.config.command_timeout,
            &token,
        )
        .await?;

        Ok(expect_response!(resp, Done)?)
    }
}

use super::{call, Request, Snapshot};
use crate::{
    callbacks::{
        acked, DeviceOpened, DeviceOpenedHandler, DeviceRemovedHandler,
        PacketServiceEvent, ProfileStatusHandler, SessionHandlers,
    },
    config::Config,
    device::{DeviceManager, DeviceOpenStatus, DeviceState, OperatingMode},
    error::{Conflict, HalError, Missing, Precondition, Result},
    profile::{
        notify as profile_status, DeleteInUsePolicy, PdpProfile, ProfileStatus,
        ProfileTable,
    },
    registration::{RegistrationMonitor, RegistrationState, Transition},
    session::{IpFamily, PacketServiceStatus, SessionController, SessionState},
    transport::{expect_response, Command, Indication, Response, Transport, TransportError},
    uicc::UiccManager,
    utils::{retry_on_timeout, State},
};
use std::sync::Arc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type DeviceHandlers = (Arc<dyn DeviceOpenedHandler>, Arc<dyn DeviceRemovedHandler>);

fn done(res: Result<Response>) -> Result<()> {
    Ok(expect_response!(res?, Done)?)
}

/// Forwards transport indications to the owner. A removal cancels the
/// current device token right away so the owner's in-flight command is
/// aborted instead of running into its timeout.
pub(super) async fn pump(
    source: flume::Receiver<Indication>,
    sink: flume::Sender<Indication>,
    device_token: State<CancellationToken>,
    shutdown: CancellationToken,
) -> color_eyre::Result<()> {
    loop {
        let indication = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),

            ind = source.recv_async() => match ind {
                Ok(ind) => ind,
                Err(_) => {
                    warn!("transport indication stream closed");
                    return Ok(());
                }
            },
        };

        if indication == Indication::DeviceRemoved {
            device_token.write(|token| {
                token.cancel();
                *token = CancellationToken::new();
            });
        }

        if sink.send(indication).is_err() {
            return Ok(());
        }
    }
}

pub(super) struct Owner {
    transport: Arc<dyn Transport>,
    config: Config,
    snapshot: State<Snapshot>,
    device_token: State<CancellationToken>,
    device: DeviceManager,
    uicc: UiccManager,
    registration: RegistrationMonitor,
    profiles: Arc<ProfileTable>,
    sessions: SessionController,
    /// Open handlers carried over a reset until the modem is detected again.
    reopen: Option<DeviceHandlers>,
}

impl Owner {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Config,
        snapshot: State<Snapshot>,
        device_token: State<CancellationToken>,
    ) -> Self {
        Self {
            transport,
            config,
            snapshot,
            device_token,
            device: DeviceManager::default(),
            uicc: UiccManager::default(),
            registration: RegistrationMonitor::default(),
            profiles: Arc::default(),
            sessions: SessionController::default(),
            reopen: None,
        }
    }

    pub async fn run(
        mut self,
        requests: flume::Receiver<Request>,
        indications: flume::Receiver<Indication>,
        shutdown: CancellationToken,
    ) -> color_eyre::Result<()> {
        let refresh_every = self.config.slot_refresh_interval;
        let mut refresh = time::interval_at(Instant::now() + refresh_every, refresh_every);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let health_every = self.config.health_interval;
        let mut health = time::interval_at(Instant::now() + health_every, health_every);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pumping = true;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                ind = indications.recv_async(), if pumping => match ind {
                    Ok(ind) => self.on_indication(ind).await,
                    Err(_) => pumping = false,
                },

                req = requests.recv_async() => match req {
                    Ok(req) => self.on_request(req).await,
                    Err(_) => {
                        info!("every cellular hal handle was dropped");
                        break;
                    }
                },

                _ = refresh.tick() => self.refresh_slots().await,

                _ = health.tick() => self.health_check().await,
            }
        }

        self.close().await;

        Ok(())
    }

    fn token(&self) -> CancellationToken {
        self.device_token.read(CancellationToken::clone)
    }

    async fn send(&self, command: Command) -> Result<Response> {
        let token = self.token();
        call(
            self.transport.as_ref(),
            command,
            self.config.command_timeout,
            &token,
        )
        .await
    }

    /// Idempotent read, retried on timeout.
    async fn query(&self, command: Command) -> Result<Response> {
        let token = self.token();
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

    fn publish(&self) {
        let families = [IpFamily::Ipv4, IpFamily::Ipv6];
        let snapshot = Snapshot {
            device_state: self.device.state(),
            device: self.device.device().cloned(),
            slots: self.uicc.slots().to_vec(),
            selected_slot: self.uicc.selected(),
            slot_status: self.uicc.status(),
            registration: self.registration.current(),
            profiles: self.profiles.clone(),
            sessions: families
                .into_iter()
                .map(|f| (f, self.sessions.state(f)))
                .collect(),
            ip_configs: families
                .into_iter()
                .filter_map(|f| Some((f, self.sessions.ip_config(f)?)))
                .collect(),
        };

        self.snapshot.write(|s| *s = snapshot);
    }

    fn is_present(&self) -> bool {
        !matches!(
            self.device.state(),
            DeviceState::NotPresent | DeviceState::Removed
        )
    }

    fn session_preconditions(&self) -> Result<()> {
        if !self.is_present() {
            return Err(HalError::DeviceAbsent);
        }

        if !self.device.is_ready() {
            return Err(HalError::PreconditionNotMet(Precondition::DeviceNotReady));
        }

        if !self.uicc.is_ready() {
            return Err(HalError::PreconditionNotMet(Precondition::SlotNotReady));
        }

        if !self.registration.is_registered() {
            return Err(HalError::PreconditionNotMet(Precondition::NotRegistered));
        }

        Ok(())
    }

    async fn on_indication(&mut self, indication: Indication) {
        debug!(?indication, "modem indication");

        match indication {
            Indication::DeviceDetected => {
                self.device.detected();
                self.publish();

                if let Some((opened, removed)) = self.reopen.take() {
                    info!("modem is back after a reset, reopening");
                    self.open(opened, removed).await;
                }
            }

            Indication::DeviceRemoved => self.device_removed(),

            Indication::CardStatus { slot, status } => {
                if self.uicc.card_status(slot, status) {
                    self.sessions_down(HalError::PreconditionNotMet(
                        Precondition::NoUsableCard,
                    ));
                }
            }

            Indication::CardInserted { slot } => {
                info!(slot, "uicc card inserted");
                if self.uicc.card_inserted(slot)
                    && let Some(handler) = self.uicc.handler()
                {
                    self.uicc.begin_select(handler);
                    self.publish();
                    self.run_selection().await;
                }
            }

            Indication::Registration(state) => self.on_registration(state).await,

            Indication::SessionDropped(family) => {
                let device_name = self.device.name();
                let error = HalError::TransportRejected("session dropped by network".into());
                if self.sessions.down(family, &device_name, Some(error)) {
                    warn!(%family, "data session dropped by the network");
                }
            }
        }

        self.publish();
    }

    async fn on_request(&mut self, request: Request) {
        match request {
            Request::OpenDevice { opened, removed } => self.open(opened, removed).await,

            Request::SetOperatingMode(mode) => self.set_operating_mode(mode).await,

            Request::SelectSlot(handler) => {
                self.uicc.begin_select(handler);
                self.publish();
                self.run_selection().await;
            }

            Request::SetSimPower { slot, enable } => self.set_sim_power(slot, enable).await,

            Request::MonitorRegistration(handler) => self.registration.subscribe(handler),

            Request::Attach => self.packet_service(Command::Attach).await,

            Request::Detach => self.packet_service(Command::Detach).await,

            Request::CreateProfile { profile, handler } => {
                self.create_profile(profile, handler).await
            }

            Request::ModifyProfile { profile, handler } => {
                self.modify_profile(profile, handler).await
            }

            Request::DeleteProfile { profile, handler } => {
                self.delete_profile(profile, handler).await
            }

            Request::StartNetwork {
                families,
                profile,
                handlers,
            } => {
                for family in families {
                    self.start_session(family, profile.clone(), handlers.clone())
                        .await;
                }
            }

            Request::StopNetwork(ip) => {
                for family in ip.families() {
                    self.stop_session(*family).await;
                }
            }
        }

        self.publish();
    }

    // Device

    async fn open(
        &mut self,
        opened: Arc<dyn DeviceOpenedHandler>,
        removed: Arc<dyn DeviceRemovedHandler>,
    ) {
        let refused = if !self.is_present() {
            Some(HalError::DeviceAbsent)
        } else if self.device.is_ready() {
            Some(HalError::PreconditionNotMet(Precondition::AlreadyOpen))
        } else {
            None
        };

        if let Some(error) = refused {
            warn!(%error, "refusing to open modem");
            let device = self.device.device();
            acked(
                "device-opened",
                opened.on_device_opened(DeviceOpened {
                    device_name: self.device.name(),
                    wan_ifname: device.map(|d| d.wan_ifname.clone()).unwrap_or_default(),
                    status: DeviceOpenStatus::NotReady,
                    mode: device.map(|d| d.mode).unwrap_or_default(),
                    error: Some(error),
                }),
            );

            return;
        }

        self.device.begin_open(opened, removed);
        self.publish();

        let token = self.token();
        let mut backoff = self.config.open_backoff;
        let mut attempt = 1;

        let outcome = loop {
            let res = call(
                self.transport.as_ref(),
                Command::OpenDevice,
                self.config.command_timeout,
                &token,
            )
            .await;

            let err = match res {
                Ok(Response::DeviceOpened {
                    device_name,
                    wan_ifname,
                    mode,
                }) => break Ok((device_name, wan_ifname, mode)),
                Ok(_) => HalError::from(TransportError::Unexpected("DeviceOpened")),
                Err(e) => e,
            };

            if err == HalError::DeviceAbsent || attempt >= self.config.open_attempts {
                break Err(err);
            }

            warn!(attempt, error = %err, ?backoff, "failed to open modem, retrying");
            tokio::select! {
                _ = token.cancelled() => break Err(HalError::DeviceAbsent),
                _ = time::sleep(backoff) => {}
            }

            backoff *= 2;
            attempt += 1;
        };

        match outcome {
            Ok((device_name, wan_ifname, mode)) => {
                self.device.open_succeeded(device_name, wan_ifname, mode);
                self.publish();
                self.apply_preferred_rat().await;
            }

            Err(e) => {
                error!(error = %e, attempts = attempt, "failed to open modem");
                self.device.open_failed(e);
            }
        }
    }

    async fn apply_preferred_rat(&mut self) {
        let Some(rats) = self.config.preferred_rat.clone() else {
            return;
        };

        info!(%rats, "applying preferred radio access technologies");
        if let Err(e) = done(self.send(Command::SetPreferredRadioTechnology(rats)).await) {
            warn!(error = %e, "failed to apply preferred radio access technologies");
        }
    }

    async fn set_operating_mode(&mut self, mode: OperatingMode) {
        if !self.device.is_ready() {
            self.device.mode_change_failed(HalError::PreconditionNotMet(
                Precondition::DeviceNotReady,
            ));

            return;
        }

        info!(%mode, "changing operating mode");
        match done(self.send(Command::SetOperatingMode(mode)).await) {
            Ok(()) if matches!(mode, OperatingMode::Reset | OperatingMode::FactoryReset) => {
                info!(%mode, "modem is restarting, waiting for it to come back");
                self.reopen = self.device.handlers();
            }

            Ok(()) => self.device.mode_changed(mode),

            Err(e) => {
                warn!(%mode, error = %e, "failed to change operating mode");
                self.device.mode_change_failed(e);
            }
        }
    }

    /// Forces every dependent state machine to its terminal state, then
    /// reports the removal.
    fn device_removed(&mut self) {
        if !self.is_present() {
            debug!("ignoring removal of a modem that is not present");
            return;
        }

        let device_name = self.device.name();
        for family in self.sessions.active() {
            self.sessions
                .down(family, &device_name, Some(HalError::DeviceAbsent));
        }
        self.sessions.forget_all();

        self.uicc.reset();
        self.registration.reset();
        self.profiles = Arc::new(ProfileTable::from_profiles(
            Vec::new(),
            self.profiles.version() + 1,
        ));

        self.device.removed();
    }

    // SIM / UICC

    async fn read_slots(&mut self) -> Result<()> {
        let resp = self.query(Command::ReadSlots).await?;
        let slots = expect_response!(resp, Slots(s))?;
        self.uicc.set_slots(slots);

        Ok(())
    }

    async fn run_selection(&mut self) {
        if let Err(e) = self.read_slots().await {
            self.uicc.select_failed(e);
            return;
        }

        let index = match self.uicc.choose(self.config.preferred_slot) {
            Ok(index) => index,
            Err(e) => {
                self.uicc.select_failed(e);
                return;
            }
        };

        info!(slot = index, "selecting uicc slot");
        self.uicc.selecting(index);
        self.publish();

        match self.send(Command::SelectSlot(index)).await {
            Ok(Response::SlotSelected {
                slot_name,
                slot_type,
            }) => {
                self.uicc.select_succeeded(index, slot_name, slot_type);
                self.publish();
                self.slot_ready().await;
            }

            Ok(_) => self
                .uicc
                .select_failed(TransportError::Unexpected("SlotSelected").into()),

            Err(e) => self.uicc.select_failed(e),
        }
    }

    async fn slot_ready(&mut self) {
        self.resync_profiles().await;
        self.read_registration().await;
    }

    async fn set_sim_power(&mut self, slot: u32, enable: bool) {
        info!(slot, enable, "setting sim power");
        if let Err(e) = done(self.send(Command::SetSimPower { slot, enable }).await) {
            warn!(slot, enable, error = %e, "failed to set sim power");
        }

        self.refresh_slots().await;
    }

    async fn refresh_slots(&mut self) {
        if !self.device.is_ready() {
            return;
        }

        if let Err(e) = self.read_slots().await {
            warn!(error = %e, "failed to refresh uicc slots");
            return;
        }

        if self.uicc.revalidate() {
            self.sessions_down(HalError::PreconditionNotMet(Precondition::NoUsableCard));
        }

        self.publish();
    }

    // Registration

    async fn read_registration(&mut self) {
        let state = self
            .query(Command::ReadRegistration)
            .await
            .and_then(|r| Ok(expect_response!(r, Registration(s))?));

        match state {
            Ok(state) => self.on_registration(state).await,
            Err(e) => warn!(error = %e, "failed to read registration state"),
        }
    }

    async fn on_registration(&mut self, state: RegistrationState) {
        if !self.device.is_ready() {
            debug!(%state, "ignoring registration update, modem is not open");
            return;
        }

        match self.registration.observe(state) {
            Transition::Lost => {
                self.sessions_down(HalError::PreconditionNotMet(Precondition::NotRegistered))
            }

            Transition::Gained => {
                self.publish();
                self.recover_sessions().await;
            }

            Transition::Changed | Transition::Unchanged => {}
        }
    }

    async fn packet_service(&mut self, command: Command) {
        let name = command.name();
        if let Err(e) = done(self.send(command).await) {
            warn!(command = name, error = %e, "packet service request failed");
            return;
        }

        self.read_registration().await;
    }

    // Profiles

    async fn create_profile(
        &mut self,
        profile: Option<PdpProfile>,
        handler: Arc<dyn ProfileStatusHandler>,
    ) {
        let Some(profile) = profile else {
            match self.profiles.default_profile(self.config.profile_type) {
                Some(default) => profile_status(
                    &handler,
                    default.id,
                    default.pdp_type,
                    ProfileStatus::Ready,
                    None,
                ),
                None => profile_status(
                    &handler,
                    None,
                    Default::default(),
                    ProfileStatus::NotReady,
                    Some(HalError::NotFound(Missing::DefaultProfile)),
                ),
            }

            return;
        };

        let id = match profile.id {
            Some(id) if self.profiles.get(id).is_some() => {
                profile_status(
                    &handler,
                    Some(id),
                    profile.pdp_type,
                    ProfileStatus::NotReady,
                    Some(HalError::ResourceConflict(Conflict::DuplicateProfileId(id))),
                );

                return;
            }
            Some(id) => id,
            None => self.profiles.next_free_id(),
        };

        info!(%id, apn = %profile.apn, "creating pdp profile");
        self.store_profile(
            PdpProfile {
                id: Some(id),
                ..profile
            },
            &handler,
        )
        .await;
    }

    async fn modify_profile(
        &mut self,
        profile: PdpProfile,
        handler: Arc<dyn ProfileStatusHandler>,
    ) {
        let error = match profile.id {
            None => Some(HalError::NotFound(Missing::ProfileId)),
            Some(id) if self.profiles.get(id).is_none() => {
                Some(HalError::NotFound(Missing::Profile(id)))
            }
            Some(_) => None,
        };

        if let Some(error) = error {
            profile_status(
                &handler,
                profile.id,
                profile.pdp_type,
                ProfileStatus::NotReady,
                Some(error),
            );

            return;
        }

        info!(id = ?profile.id, apn = %profile.apn, "modifying pdp profile");
        self.store_profile(profile, &handler).await;
    }

    /// Writes `profile` and every default it demotes. The in-memory table is
    /// only replaced once all writes went through.
    async fn store_profile(
        &mut self,
        profile: PdpProfile,
        handler: &Arc<dyn ProfileStatusHandler>,
    ) {
        let (id, pdp_type) = (profile.id, profile.pdp_type);
        profile_status(handler, id, pdp_type, ProfileStatus::Configuring, None);

        let writes = self.profiles.plan_upsert(&profile);
        let mut written = Vec::with_capacity(writes.len());

        for record in writes {
            if let Err(e) = done(self.send(Command::WriteProfile(record.clone())).await) {
                error!(profile = ?record.id, error = %e, "failed to write pdp profile");
                if !written.is_empty() {
                    self.resync_profiles().await;
                }

                profile_status(handler, id, pdp_type, ProfileStatus::NotReady, Some(e));
                return;
            }

            written.push(record);
        }

        self.profiles = Arc::new(self.profiles.with_upserts(written));
        self.publish();
        profile_status(handler, id, pdp_type, ProfileStatus::Ready, None);
    }

    async fn delete_profile(
        &mut self,
        profile: PdpProfile,
        handler: Arc<dyn ProfileStatusHandler>,
    ) {
        let Some(id) = profile.id else {
            profile_status(
                &handler,
                None,
                profile.pdp_type,
                ProfileStatus::NotReady,
                Some(HalError::NotFound(Missing::ProfileId)),
            );

            return;
        };

        let Some(pdp_type) = self.profiles.get(id).map(|p| p.pdp_type) else {
            profile_status(
                &handler,
                Some(id),
                profile.pdp_type,
                ProfileStatus::NotReady,
                Some(HalError::NotFound(Missing::Profile(id))),
            );

            return;
        };

        let bound = self.sessions.bound_to(id);
        if !bound.is_empty() {
            match self.config.delete_in_use {
                DeleteInUsePolicy::Reject => {
                    warn!(%id, "refusing to delete pdp profile bound to a data session");
                    profile_status(
                        &handler,
                        Some(id),
                        pdp_type,
                        ProfileStatus::NotReady,
                        Some(HalError::ResourceConflict(Conflict::ProfileInUse(id))),
                    );

                    return;
                }

                DeleteInUsePolicy::TearDown => {
                    info!(%id, "tearing down data sessions bound to deleted pdp profile");
                    for family in bound {
                        self.stop_session(family).await;
                    }
                }
            }
        }

        self.sessions.forget_profile(id);
        profile_status(&handler, Some(id), pdp_type, ProfileStatus::Configuring, None);

        match done(self.send(Command::DeleteProfile(id)).await) {
            Ok(()) => {
                info!(%id, "pdp profile deleted");
                self.profiles = Arc::new(self.profiles.without(id));
                self.publish();
                profile_status(&handler, Some(id), pdp_type, ProfileStatus::Deleted, None);
            }

            Err(e) => {
                error!(%id, error = %e, "failed to delete pdp profile");
                self.resync_profiles().await;
                profile_status(&handler, Some(id), pdp_type, ProfileStatus::NotReady, Some(e));
            }
        }
    }

    /// Replaces the table with what the modem actually stores.
    async fn resync_profiles(&mut self) {
        let profiles = self
            .query(Command::ReadProfiles)
            .await
            .and_then(|r| Ok(expect_response!(r, Profiles(p))?));

        match profiles {
            Ok(profiles) => {
                info!(count = profiles.len(), "loaded pdp profiles");
                self.profiles = Arc::new(ProfileTable::from_profiles(
                    profiles,
                    self.profiles.version() + 1,
                ));
            }

            Err(e) => warn!(error = %e, "failed to read pdp profiles"),
        }
    }

    // Data sessions

    async fn start_session(
        &mut self,
        family: IpFamily,
        profile: PdpProfile,
        handlers: SessionHandlers,
    ) {
        if self.sessions.is_active(family) {
            warn!(%family, "data session already active, ignoring start");
            return;
        }

        if let Err(e) = self.session_preconditions() {
            acked(
                "packet-service",
                handlers
                    .packet_service
                    .on_packet_service(PacketServiceEvent {
                        device_name: self.device.name(),
                        ip_type: family,
                        status: PacketServiceStatus::Disconnected,
                        error: Some(e),
                    }),
            );

            return;
        }

        self.sessions.begin(family, profile.clone(), handlers);
        self.publish();
        self.bring_up(family, profile).await;

        // failed caller starts are not retried
        if !self.sessions.is_active(family) {
            self.sessions.forget(family);
        }
    }

    async fn bring_up(&mut self, family: IpFamily, profile: PdpProfile) {
        let device_name = self.device.name();

        if let Err(e) = done(self.send(Command::StartSession { family, profile }).await) {
            error!(%family, error = %e, "failed to start data session");
            self.sessions.down(family, &device_name, Some(e));
            return;
        }

        self.sessions.connected(family, &device_name);
        self.publish();

        let config = self
            .query(Command::ReadIpConfig(family))
            .await
            .and_then(|r| Ok(expect_response!(r, IpConfig(c))?));

        match config {
            Ok(mut config) => {
                if config.wan_ifname.is_empty()
                    && let Some(device) = self.device.device()
                {
                    config.wan_ifname = device.wan_ifname.clone();
                }

                let config = config.sanitized(family, self.config.default_mtu);
                self.sessions.ip_ready(family, config);
            }

            Err(e) => {
                error!(%family, error = %e, "failed to read ip configuration");
                if let Err(stop_err) = done(self.send(Command::StopSession(family)).await) {
                    debug!(%family, error = %stop_err, "failed to stop half-open session");
                }

                self.sessions.down(family, &device_name, Some(e));
            }
        }
    }

    async fn stop_session(&mut self, family: IpFamily) {
        self.sessions.forget(family);
        if !self.sessions.is_active(family) {
            debug!(%family, "data session not running, nothing to stop");
            return;
        }

        info!(%family, "stopping data session");
        if let Err(e) = done(self.send(Command::StopSession(family)).await) {
            warn!(%family, error = %e, "modem failed to stop data session, dropping it anyway");
        }

        let device_name = self.device.name();
        self.sessions.down(family, &device_name, None);
    }

    /// Takes every live session down, keeping what the consumer asked for so
    /// it can be restarted.
    fn sessions_down(&mut self, error: HalError) {
        let device_name = self.device.name();
        for family in self.sessions.active() {
            self.sessions
                .down(family, &device_name, Some(error.clone()));
        }
    }

    async fn recover_sessions(&mut self) {
        if self.session_preconditions().is_err() {
            return;
        }

        let restarts = self
            .sessions
            .take_restarts(self.config.session_restart_attempts);

        for (family, intent) in restarts {
            let profile = intent
                .profile
                .id
                .and_then(|id| self.profiles.get(id).cloned())
                .unwrap_or(intent.profile);

            info!(%family, attempt = intent.attempts, apn = %profile.apn, "restarting data session");
            self.sessions.begin(family, profile.clone(), intent.handlers);
            self.publish();
            self.bring_up(family, profile).await;
        }
    }

    async fn health_check(&mut self) {
        if !self.device.is_ready() {
            return;
        }

        let ready: Vec<_> = self
            .sessions
            .active()
            .into_iter()
            .filter(|f| self.sessions.state(*f) == SessionState::IpReady)
            .collect();

        if !ready.is_empty() {
            let status = self
                .query(Command::ReadInterfaceStatus)
                .await
                .and_then(|r| Ok(expect_response!(r, InterfaceStatus(s))?));

            match status {
                Ok(status) if status.is_broken() => {
                    warn!(%status, "wan interface is unusable, dropping data sessions");
                    let device_name = self.device.name();
                    for family in ready {
                        let error = HalError::TransportRejected(format!("wan interface {status}"));
                        self.sessions.down(family, &device_name, Some(error));
                    }

                    // restart on the next tick
                    self.publish();
                    return;
                }

                Ok(status) => debug!(%status, "wan interface healthy"),

                Err(e) => debug!(error = %e, "failed to read wan interface status"),
            }
        }

        self.recover_sessions().await;
        self.publish();
    }

    async fn close(&mut self) {
        for family in self.sessions.active() {
            self.stop_session(family).await;
        }
        self.sessions.forget_all();

        if self.device.device().is_some_and(|d| d.control_opened) {
            if let Err(e) = done(self.send(Command::CloseDevice).await) {
                warn!(error = %e, "failed to close modem control interface");
            }
        }

        self.device.closed();
        self.registration.reset();
        self.publish();

        info!("cellular hal stopped");
    }
}

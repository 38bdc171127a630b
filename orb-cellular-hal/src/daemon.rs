//! Keeps the modem online: opens it when it shows up, selects a slot and
//! brings the default data session up whenever the modem is registered.

use crate::{
    callbacks::{Ack, DeviceOpened, DeviceRemoved, IpReadyEvent, PacketServiceEvent, SlotStatusEvent},
    device::{DetectionStatus, DeviceOpenStatus, DeviceState},
    orchestrator::CellularHal,
    registration::RegistrationState,
    session::{IpPreference, IpReadyStatus, SessionState},
    uicc::SlotStatus,
};
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug)]
enum Event {
    Opened(DeviceOpened),
    Slot(SlotStatusEvent),
    Registration(RegistrationState),
}

/// Runs until the returned future is dropped. Sessions are started for the
/// families in the HAL's configured ip preference. `poll` is how often a
/// stalled bring-up is retried.
#[bon::builder(finish_fn = run)]
pub async fn supervise(hal: &CellularHal, poll: Duration) {
    let ip = hal.config().ip_preference;
    let (tx, rx) = flume::unbounded();
    let mut tick = time::interval(poll);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(%ip, ?poll, "supervising modem");

    loop {
        tokio::select! {
            _ = tick.tick() => retry(hal, ip, &tx),
            Ok(event) = rx.recv_async() => on_event(hal, ip, &tx, event),
        }
    }
}

fn retry(hal: &CellularHal, ip: IpPreference, tx: &flume::Sender<Event>) {
    let snapshot = hal.snapshot();
    match snapshot.device_state {
        DeviceState::Detected => open(hal, tx),
        DeviceState::Ready if snapshot.slot_status == SlotStatus::NotReady => select(hal, tx),
        DeviceState::Ready if snapshot.registration.is_registered() => start(hal, ip),
        _ => {}
    }
}

fn on_event(hal: &CellularHal, ip: IpPreference, tx: &flume::Sender<Event>, event: Event) {
    match event {
        Event::Opened(e) => match e.status {
            DeviceOpenStatus::Ready => {
                info!(device = %e.device_name, wan = %e.wan_ifname, "modem opened");
                select(hal, tx);
            }
            DeviceOpenStatus::InProgress => info!("opening modem"),
            DeviceOpenStatus::NotReady => match e.error {
                Some(err) => warn!(error = %err, "modem not ready"),
                None => info!(mode = %e.mode, "modem mode changed"),
            },
        },

        Event::Slot(e) => match (e.status, e.error) {
            (SlotStatus::Ready, _) => {
                info!(slot = %e.slot_name, slot_type = %e.slot_type, "uicc slot selected");
                let tx = tx.clone();
                let res = hal.monitor_registration(move |state: RegistrationState| {
                    tx.send(Event::Registration(state)).ok();
                    Ack::Ok
                });

                if let Err(err) = res {
                    warn!(error = %err, "failed to monitor registration");
                }

                if hal.registration().is_registered() {
                    start(hal, ip);
                }
            }
            (SlotStatus::NotReady, Some(err)) => warn!(error = %err, "no usable slot"),
            (status, _) => info!(%status, "uicc slot status"),
        },

        Event::Registration(state) => {
            info!(%state, "registration changed");
            if state.is_registered() {
                start(hal, ip);
            }
        }
    }
}

fn open(hal: &CellularHal, tx: &flume::Sender<Event>) {
    let tx = tx.clone();
    let res = hal.open_device(
        move |e: DeviceOpened| {
            tx.send(Event::Opened(e)).ok();
            Ack::Ok
        },
        |e: DeviceRemoved| {
            if e.status == DetectionStatus::Removed {
                warn!(device = %e.device_name, "modem removed");
            }
            Ack::Ok
        },
    );

    if let Err(e) = res {
        warn!(error = %e, "failed to open modem");
    }
}

fn select(hal: &CellularHal, tx: &flume::Sender<Event>) {
    let tx = tx.clone();
    let res = hal.select_slot(move |e: SlotStatusEvent| {
        tx.send(Event::Slot(e)).ok();
        Ack::Ok
    });

    if let Err(e) = res {
        warn!(error = %e, "failed to select slot");
    }
}

fn start(hal: &CellularHal, ip: IpPreference) {
    let idle = ip
        .families()
        .iter()
        .all(|f| hal.session_state(*f) == SessionState::Idle);

    if !idle {
        return;
    }

    let res = hal.start_network(
        ip,
        None,
        |e: PacketServiceEvent| {
            match e.error {
                Some(err) => warn!(family = %e.ip_type, status = %e.status, device = %e.device_name, error = %err, "packet service"),
                None => info!(family = %e.ip_type, status = %e.status, device = %e.device_name, "packet service"),
            }
            Ack::Ok
        },
        |e: IpReadyEvent| {
            if let (IpReadyStatus::Ready, Some(config)) = (e.status, &e.config) {
                info!(
                    family = %e.ip_type,
                    wan = %config.wan_ifname,
                    address = %config.address,
                    netmask = %config.subnet_mask,
                    gateway = %config.gateway,
                    "ip ready"
                );
            }
            Ack::Ok
        },
    );

    if let Err(e) = res {
        warn!(error = %e, "failed to start data session");
    }
}

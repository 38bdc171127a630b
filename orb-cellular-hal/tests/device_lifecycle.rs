use fixture::{
    eventually, recorder, registered, settle, unregistered, FakeModem, Fixture, Stage,
};
use orb_cellular_hal::{
    callbacks::{
        Ack, DeviceOpened, DeviceRemoved, IpReadyEvent, PacketServiceEvent, SlotStatusEvent,
    },
    device::{DeviceOpenStatus, DeviceState, OperatingMode},
    error::{HalError, Precondition},
    registration::{NasStatus, RegistrationState},
    session::{IpFamily, IpPreference, PacketServiceStatus, SessionState},
    transport::{Indication, TransportError},
    uicc::SlotStatus,
    Config,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};


#[test_log::test(tokio::test)]
async fn it_rejects_open_while_no_modem_is_present() {
    // Arrange
    let fx = Fixture::builder().stage(Stage::Absent).run().await;
    let (opened_handler, opened) = recorder::<DeviceOpened>();
    let (removed_handler, _removed) = recorder::<DeviceRemoved>();

    // Act
    let res = fx.hal.open_device(opened_handler, removed_handler);
    settle().await;

    // Assert
    assert_eq!(res, Err(HalError::DeviceAbsent));
    assert!(opened.drain().is_empty());
    assert!(fx.modem.commands().is_empty());
    assert!(!fx.hal.is_device_present());
}

#[tokio::test]
async fn it_opens_a_detected_modem() {
    // Arrange
    let fx = Fixture::builder().stage(Stage::Detected).run().await;
    let (opened_handler, opened) = recorder::<DeviceOpened>();
    let (removed_handler, _removed) = recorder::<DeviceRemoved>();

    // Act
    fx.hal.open_device(opened_handler, removed_handler).unwrap();

    // Assert
    let first = opened.next().await;
    let second = opened.next().await;
    assert_eq!(first.status, DeviceOpenStatus::InProgress);
    assert_eq!(second.status, DeviceOpenStatus::Ready);
    assert_eq!(second.device_name, "Telit LE910C4-WWXD");
    assert_eq!(second.wan_ifname, "wwan0");
    assert_eq!(second.error, None);

    assert_eq!(fx.hal.device_state(), DeviceState::Ready);
    assert!(fx.hal.is_control_interface_opened());
    assert_eq!(fx.hal.device().unwrap().mode, OperatingMode::Online);
}

#[tokio::test(start_paused = true)]
async fn it_gives_up_opening_after_the_configured_attempts() {
    // Arrange
    let modem = FakeModem::default();
    modem.fail("open-device", TransportError::Rejected("port busy".into()));
    let config = Config::builder()
        .open_attempts(3)
        .open_backoff(Duration::from_secs(1))
        .build();

    let fx = Fixture::builder()
        .modem(modem)
        .config(config)
        .stage(Stage::Detected)
        .run()
        .await;
    let (opened_handler, opened) = recorder::<DeviceOpened>();
    let (removed_handler, _removed) = recorder::<DeviceRemoved>();

    // Act
    fx.hal.open_device(opened_handler, removed_handler).unwrap();

    // Assert
    let outcome = opened
        .until(|e| e.status != DeviceOpenStatus::InProgress)
        .await;
    assert_eq!(outcome.status, DeviceOpenStatus::NotReady);
    assert_eq!(
        outcome.error,
        Some(HalError::TransportRejected("port busy".into()))
    );
    assert_eq!(fx.modem.count("open-device"), 3);
    assert_eq!(fx.hal.device_state(), DeviceState::Detected);
}

#[tokio::test(start_paused = true)]
async fn it_bounds_a_hanging_open_by_the_command_timeout() {
    // Arrange
    let modem = FakeModem::default();
    modem.update(|m| {
        m.delays.insert("open-device", Duration::from_secs(3600));
    });
    let config = Config::builder()
        .command_timeout(Duration::from_secs(2))
        .open_attempts(1)
        .build();

    let fx = Fixture::builder()
        .modem(modem)
        .config(config)
        .stage(Stage::Detected)
        .run()
        .await;
    let (opened_handler, opened) = recorder::<DeviceOpened>();
    let (removed_handler, _removed) = recorder::<DeviceRemoved>();

    // Act
    fx.hal.open_device(opened_handler, removed_handler).unwrap();
    eventually(|| fx.hal.device_state() == DeviceState::Opening).await;
    assert_eq!(
        fx.hal.open_device(|_: DeviceOpened| Ack::Error, |_: DeviceRemoved| Ack::Error),
        Err(HalError::PreconditionNotMet(Precondition::OpenInProgress))
    );

    // Assert
    let outcome = opened
        .until(|e| e.status != DeviceOpenStatus::InProgress)
        .await;
    assert_eq!(
        outcome.error,
        Some(HalError::TransportTimeout(Duration::from_secs(2)))
    );
}

#[tokio::test]
async fn removal_fails_dependent_state_before_reporting_the_removal() {
    // Arrange
    let modem = FakeModem::default();
    modem.update(|m| m.registration = unregistered());
    let fx = Fixture::builder()
        .modem(modem)
        .stage(Stage::Detected)
        .run()
        .await;
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    let r = order.clone();
    fx.hal
        .open_device(
            |_: DeviceOpened| Ack::Ok,
            move |e: DeviceRemoved| {
                r.lock().unwrap().push(format!("removed {}", e.device_name));
                Ack::Ok
            },
        )
        .unwrap();
    eventually(|| fx.hal.device_state() == DeviceState::Ready).await;

    let (slot_handler, slot) = recorder::<SlotStatusEvent>();
    fx.hal.select_slot(slot_handler).unwrap();
    slot.until(|e| e.status == SlotStatus::Ready).await;
    eventually(|| fx.modem.count("read-registration") > 0).await;

    let (registration_handler, registration) = recorder::<RegistrationState>();
    fx.hal.monitor_registration(registration_handler).unwrap();
    assert_eq!(registration.next().await.status, NasStatus::NotRegistered);

    fx.modem.indicate(Indication::Registration(RegistrationState {
        status: NasStatus::Registering,
        ..unregistered()
    }));
    fx.modem.indicate(Indication::Registration(registered()));
    assert_eq!(registration.next().await.status, NasStatus::Registering);
    assert_eq!(registration.next().await.status, NasStatus::Registered);
    eventually(|| fx.hal.registration().is_registered()).await;

    let (ip_ready_handler, _ip_ready) = recorder::<IpReadyEvent>();
    fx.hal
        .start_network(
            IpPreference::Ipv4,
            None,
            move |e: PacketServiceEvent| {
                o.lock()
                    .unwrap()
                    .push(format!("{} {:?}", e.status, e.error));
                Ack::Ok
            },
            ip_ready_handler,
        )
        .unwrap();
    eventually(|| fx.hal.session_state(IpFamily::Ipv4) == SessionState::IpReady).await;

    // Act
    fx.modem.indicate(Indication::DeviceRemoved);

    // Assert
    let slot_event = slot.until(|e| e.status == SlotStatus::NotReady).await;
    assert_eq!(slot_event.error, Some(HalError::DeviceAbsent));

    eventually(|| order.lock().unwrap().len() == 3).await;
    assert_eq!(
        *order.lock().unwrap(),
        vec![
            format!("{} None", PacketServiceStatus::Connected),
            format!(
                "{} {:?}",
                PacketServiceStatus::Disconnected,
                Some(HalError::DeviceAbsent)
            ),
            "removed Telit LE910C4-WWXD".to_string(),
        ]
    );

    assert!(!fx.hal.is_device_present());
    assert_eq!(fx.hal.session_state(IpFamily::Ipv4), SessionState::Idle);
    assert_eq!(fx.hal.slot_info(0), Err(HalError::DeviceAbsent));
    assert_eq!(fx.hal.list_profiles(), Err(HalError::DeviceAbsent));
    assert!(!fx.hal.registration().is_registered());

    fx.modem.indicate(Indication::Registration(registered()));
    settle().await;
    assert!(registration.drain().is_empty());
}

#[tokio::test]
async fn opening_an_open_modem_is_refused_and_leaves_sessions_alone() {
    // Arrange
    let fx = Fixture::builder().run().await;
    let session = fx.online(IpPreference::Ipv4).await;
    session.packet_service.drain();
    fx.modem
        .fail("open-device", TransportError::Rejected("port busy".into()));
    let (opened_handler, opened) = recorder::<DeviceOpened>();
    let (removed_handler, _removed) = recorder::<DeviceRemoved>();

    // Act
    let res = fx.hal.open_device(opened_handler, removed_handler);
    settle().await;

    // Assert
    assert_eq!(
        res,
        Err(HalError::PreconditionNotMet(Precondition::AlreadyOpen))
    );
    assert!(opened.drain().is_empty());
    assert!(session.packet_service.drain().is_empty());
    assert_eq!(fx.modem.count("open-device"), 1);
    assert_eq!(fx.hal.device_state(), DeviceState::Ready);
    assert_eq!(fx.hal.session_state(IpFamily::Ipv4), SessionState::IpReady);
    assert!(fx.hal.ip_config(IpFamily::Ipv4).is_some());
}

#[tokio::test]
async fn it_reopens_the_modem_after_a_reset() {
    // Arrange
    let fx = Fixture::builder().stage(Stage::Opened).run().await;

    // Act
    fx.hal.reset().unwrap();
    eventually(|| fx.modem.count("set-operating-mode") == 1).await;
    settle().await;
    fx.modem.indicate(Indication::DeviceRemoved);
    fx.modem.indicate(Indication::DeviceDetected);

    // Assert
    let removed = fx.removed.next().await;
    assert_eq!(removed.device_name, "Telit LE910C4-WWXD");

    let reopened = fx
        .opened
        .until(|e| e.status == DeviceOpenStatus::Ready)
        .await;
    assert_eq!(reopened.wan_ifname, "wwan0");
    assert_eq!(fx.modem.count("open-device"), 2);
    assert_eq!(fx.hal.device_state(), DeviceState::Ready);
}

#[tokio::test]
async fn it_reports_operating_mode_changes_to_the_open_handler() {
    // Arrange
    let fx = Fixture::builder().stage(Stage::Opened).run().await;

    // Act
    fx.hal.set_operating_config(OperatingMode::LowPower).unwrap();

    // Assert
    let event = fx.opened.next().await;
    assert_eq!(event.status, DeviceOpenStatus::Ready);
    assert_eq!(event.mode, OperatingMode::LowPower);
    assert_eq!(fx.hal.device().unwrap().mode, OperatingMode::LowPower);
}

#[tokio::test]
async fn shutdown_stops_sessions_and_closes_the_modem() {
    // Arrange
    let fx = Fixture::builder().run().await;
    let session = fx.online(IpPreference::Ipv4).await;
    let modem = fx.modem.clone();

    // Act
    fx.hal.shutdown().await.unwrap();

    // Assert
    let down = session
        .packet_service
        .until(|e| e.status == PacketServiceStatus::Disconnected)
        .await;
    assert_eq!(down.error, None);
    assert!(modem.sessions().is_empty());
    assert_eq!(modem.count("close-device"), 1);
}

use fixture::{default_profile, recorder, settle, FakeModem, Fixture};
use orb_cellular_hal::{
    callbacks::ProfileStatusEvent,
    error::{Conflict, HalError, Missing, Precondition},
    profile::{DeleteInUsePolicy, PdpProfile, ProfileId, ProfileStatus},
    session::{IpFamily, IpPreference, PacketServiceStatus, SessionState},
    transport::{Command, TransportError},
    Config,
};


fn roaming_profile() -> PdpProfile {
    PdpProfile::builder()
        .name("roaming")
        .apn("internet.roam")
        .no_roaming(false)
        .build()
}

#[tokio::test]
async fn created_profiles_show_up_in_the_list() {
    // Arrange
    let fx = Fixture::builder().run().await;
    let version = fx.hal.profile_table_version();
    let (handler, events) = recorder::<ProfileStatusEvent>();

    // Act
    fx.hal
        .create_profile(Some(roaming_profile()), handler)
        .unwrap();

    // Assert
    let configuring = events.next().await;
    let ready = events.next().await;
    assert_eq!(configuring.status, ProfileStatus::Configuring);
    assert_eq!(ready.status, ProfileStatus::Ready);
    assert_eq!(ready.profile_id, Some(ProfileId(2)));
    assert_eq!(ready.error, None);

    let listed = fx.hal.list_profiles().unwrap();
    let created = listed
        .iter()
        .find(|p| p.id == Some(ProfileId(2)))
        .unwrap();
    assert_eq!(
        *created,
        PdpProfile {
            id: Some(ProfileId(2)),
            ..roaming_profile()
        }
    );
    assert_eq!(listed.len(), 2);
    assert!(fx.hal.profile_table_version() > version);
}

#[tokio::test]
async fn it_refuses_to_create_a_duplicate_id() {
    // Arrange
    let fx = Fixture::builder().run().await;
    let (handler, events) = recorder::<ProfileStatusEvent>();

    // Act
    fx.hal
        .create_profile(
            Some(PdpProfile {
                id: Some(ProfileId(1)),
                ..roaming_profile()
            }),
            handler,
        )
        .unwrap();

    // Assert
    let outcome = events.next().await;
    assert_eq!(outcome.status, ProfileStatus::NotReady);
    assert_eq!(
        outcome.error,
        Some(HalError::ResourceConflict(Conflict::DuplicateProfileId(
            ProfileId(1)
        )))
    );
    assert_eq!(fx.modem.count("write-profile"), 0);
}

#[tokio::test]
async fn a_new_default_demotes_the_previous_one() {
    // Arrange
    let fx = Fixture::builder().run().await;
    let (handler, events) = recorder::<ProfileStatusEvent>();
    let replacement = PdpProfile {
        is_default: true,
        ..roaming_profile()
    };

    // Act
    fx.hal.create_profile(Some(replacement), handler).unwrap();

    // Assert
    events.until(|e| e.status == ProfileStatus::Ready).await;

    let defaults: Vec<_> = fx
        .hal
        .list_profiles()
        .unwrap()
        .into_iter()
        .filter(|p| p.is_default)
        .collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].id, Some(ProfileId(2)));
    assert_eq!(fx.modem.count("write-profile"), 2);
}

#[tokio::test]
async fn creating_without_a_profile_resolves_the_default() {
    // Arrange
    let fx = Fixture::builder().run().await;
    let (handler, events) = recorder::<ProfileStatusEvent>();

    // Act
    fx.hal.create_profile(None, handler).unwrap();

    // Assert
    let outcome = events.next().await;
    assert_eq!(outcome.status, ProfileStatus::Ready);
    assert_eq!(outcome.profile_id, Some(ProfileId(1)));
    assert_eq!(fx.modem.count("write-profile"), 0);
}

#[tokio::test]
async fn modify_requires_a_profile_and_an_existing_id() {
    // Arrange
    let fx = Fixture::builder().run().await;
    let (missing_handler, _missing) = recorder::<ProfileStatusEvent>();
    let (unknown_handler, unknown) = recorder::<ProfileStatusEvent>();

    // Act
    let missing = fx.hal.modify_profile(None, missing_handler);
    fx.hal
        .modify_profile(
            Some(PdpProfile {
                id: Some(ProfileId(42)),
                ..roaming_profile()
            }),
            unknown_handler,
        )
        .unwrap();

    // Assert
    assert_eq!(
        missing,
        Err(HalError::PreconditionNotMet(Precondition::ProfileRequired))
    );
    assert_eq!(
        unknown.next().await.error,
        Some(HalError::NotFound(Missing::Profile(ProfileId(42))))
    );
}

#[tokio::test]
async fn a_failed_write_leaves_the_table_untouched() {
    // Arrange
    let fx = Fixture::builder().run().await;
    fx.modem
        .fail("write-profile", TransportError::Rejected("storage full".into()));
    let before = fx.hal.list_profiles().unwrap();
    let (handler, events) = recorder::<ProfileStatusEvent>();

    // Act
    fx.hal
        .modify_profile(
            Some(PdpProfile {
                apn: "other".into(),
                ..default_profile()
            }),
            handler,
        )
        .unwrap();

    // Assert
    let outcome = events
        .until(|e| e.status != ProfileStatus::Configuring)
        .await;
    assert_eq!(outcome.status, ProfileStatus::NotReady);
    assert_eq!(
        outcome.error,
        Some(HalError::TransportRejected("storage full".into()))
    );
    assert_eq!(fx.hal.list_profiles().unwrap(), before);
}

#[tokio::test]
async fn deleting_a_profile_in_use_tears_its_sessions_down() {
    // Arrange
    let fx = Fixture::builder().run().await;
    let session = fx.online(IpPreference::Ipv4).await;
    let (handler, events) = recorder::<ProfileStatusEvent>();

    // Act
    fx.hal.delete_profile(default_profile(), handler).unwrap();

    // Assert
    let down = session
        .packet_service
        .until(|e| e.status == PacketServiceStatus::Disconnected)
        .await;
    assert_eq!(down.error, None);

    let deleted = events
        .until(|e| e.status != ProfileStatus::Configuring)
        .await;
    assert_eq!(deleted.status, ProfileStatus::Deleted);
    assert_eq!(fx.hal.session_state(IpFamily::Ipv4), SessionState::Idle);
    assert!(fx.hal.list_profiles().unwrap().is_empty());

    let commands = fx.modem.commands();
    let stop = commands
        .iter()
        .position(|c| *c == Command::StopSession(IpFamily::Ipv4))
        .unwrap();
    let delete = commands
        .iter()
        .position(|c| *c == Command::DeleteProfile(ProfileId(1)))
        .unwrap();
    assert!(stop < delete);
}

#[tokio::test]
async fn deleting_a_profile_in_use_can_be_rejected() {
    // Arrange
    let config = Config::builder()
        .delete_in_use(DeleteInUsePolicy::Reject)
        .build();
    let fx = Fixture::builder()
        .modem(FakeModem::default())
        .config(config)
        .run()
        .await;
    let _session = fx.online(IpPreference::Ipv4).await;
    let (handler, events) = recorder::<ProfileStatusEvent>();

    // Act
    fx.hal.delete_profile(default_profile(), handler).unwrap();

    // Assert
    let outcome = events.next().await;
    assert_eq!(outcome.status, ProfileStatus::NotReady);
    assert_eq!(
        outcome.error,
        Some(HalError::ResourceConflict(Conflict::ProfileInUse(ProfileId(
            1
        ))))
    );
    settle().await;
    assert_eq!(fx.hal.session_state(IpFamily::Ipv4), SessionState::IpReady);
    assert_eq!(fx.modem.count("delete-profile"), 0);
}

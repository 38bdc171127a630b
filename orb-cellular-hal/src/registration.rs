use crate::callbacks::{acked, RegistrationHandler};
use derive_more::Display;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum NasStatus {
    #[default]
    NotRegistered = 1,
    Registering,
    Registered,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RoamingStatus {
    #[default]
    Off = 1,
    On,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RegisteredService {
    #[default]
    None = 0,
    Ps,
    Cs,
    CsPs,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[display("{status} (roaming {roaming}, service {service})")]
pub struct RegistrationState {
    pub status: NasStatus,
    pub roaming: RoamingStatus,
    pub service: RegisteredService,
}

impl RegistrationState {
    pub fn is_registered(&self) -> bool {
        self.status == NasStatus::Registered
    }
}

/// What an observed registration state change means for data sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Unchanged,
    Changed,
    Gained,
    Lost,
}

/// Tracks NAS registration as reported by the transport and forwards changes
/// to the subscribed handler. Duplicate reports are coalesced.
#[derive(Default)]
pub(crate) struct RegistrationMonitor {
    current: RegistrationState,
    handler: Option<Arc<dyn RegistrationHandler>>,
}

impl RegistrationMonitor {
    pub fn current(&self) -> RegistrationState {
        self.current
    }

    pub fn is_registered(&self) -> bool {
        self.current.is_registered()
    }

    /// Installs the standing subscription and replays the current state once.
    pub fn subscribe(&mut self, handler: Arc<dyn RegistrationHandler>) {
        acked("registration", handler.on_registration(self.current));
        self.handler = Some(handler);
    }

    pub fn observe(&mut self, next: RegistrationState) -> Transition {
        if next == self.current {
            debug!(state = %next, "coalescing duplicate registration state");
            return Transition::Unchanged;
        }

        let was_registered = self.current.is_registered();
        info!(from = %self.current, to = %next, "registration changed");
        self.current = next;

        if let Some(handler) = &self.handler {
            acked("registration", handler.on_registration(next));
        }

        match (was_registered, next.is_registered()) {
            (false, true) => Transition::Gained,
            (true, false) => Transition::Lost,
            _ => Transition::Changed,
        }
    }

    /// Ends the subscription without delivering anything further.
    pub fn reset(&mut self) {
        self.handler = None;
        self.current = RegistrationState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::Ack;
    use std::sync::Mutex;

    fn state(status: NasStatus) -> RegistrationState {
        RegistrationState {
            status,
            ..Default::default()
        }
    }

    #[test]
    fn it_coalesces_duplicates_and_reports_transitions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();

        let mut rm = RegistrationMonitor::default();
        rm.subscribe(Arc::new(move |st: RegistrationState| {
            s.lock().unwrap().push(st.status);
            Ack::Ok
        }));

        assert_eq!(rm.observe(state(NasStatus::Registering)), Transition::Changed);
        assert_eq!(rm.observe(state(NasStatus::Registering)), Transition::Unchanged);
        assert_eq!(rm.observe(state(NasStatus::Registered)), Transition::Gained);

        let roaming = RegistrationState {
            status: NasStatus::Registered,
            roaming: RoamingStatus::On,
            service: RegisteredService::Ps,
        };
        assert_eq!(rm.observe(roaming), Transition::Changed);
        assert_eq!(rm.observe(state(NasStatus::NotRegistered)), Transition::Lost);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                NasStatus::NotRegistered,
                NasStatus::Registering,
                NasStatus::Registered,
                NasStatus::Registered,
                NasStatus::NotRegistered,
            ]
        );
    }

    #[test]
    fn reset_ends_the_subscription() {
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();

        let mut rm = RegistrationMonitor::default();
        rm.subscribe(Arc::new(move |_: RegistrationState| {
            *c.lock().unwrap() += 1;
            Ack::Ok
        }));
        rm.reset();
        rm.observe(state(NasStatus::Registered));

        assert_eq!(*count.lock().unwrap(), 1);
    }
}

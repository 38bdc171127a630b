use crate::{profile::ProfileId, session::IpFamily, transport::TransportError};
use derive_more::Display;
use std::time::Duration;

pub type Result<T, E = HalError> = std::result::Result<T, E>;

/// Every failure surfaced by the HAL, either as a synchronous return value or
/// in the `error` field of a callback record.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    #[error("precondition not met: {0}")]
    PreconditionNotMet(Precondition),
    #[error("not found: {0}")]
    NotFound(Missing),
    #[error("transport timed out after {}ms", .0.as_millis())]
    TransportTimeout(Duration),
    #[error("transport rejected request: {0}")]
    TransportRejected(String),
    #[error("resource conflict: {0}")]
    ResourceConflict(Conflict),
    #[error("no modem device present")]
    DeviceAbsent,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    #[display("device is not ready")]
    DeviceNotReady,
    #[display("device open already in progress")]
    OpenInProgress,
    #[display("device is already open")]
    AlreadyOpen,
    #[display("uicc slot is not ready")]
    SlotNotReady,
    #[display("no uicc slot is selected")]
    SlotNotSelected,
    #[display("no slot holds a usable card")]
    NoUsableCard,
    #[display("no card present in slot")]
    CardAbsent,
    #[display("not registered on the network")]
    NotRegistered,
    #[display("a profile is required")]
    ProfileRequired,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    #[display("profile {_0}")]
    Profile(ProfileId),
    #[display("profile without an id")]
    ProfileId,
    #[display("default profile")]
    DefaultProfile,
    #[display("uicc slot {_0}")]
    Slot(u32),
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    #[display("profile id {_0} already exists")]
    DuplicateProfileId(ProfileId),
    #[display("profile {_0} is bound to an active session")]
    ProfileInUse(ProfileId),
    #[display("{_0} session already active")]
    SessionActive(IpFamily),
}

impl From<TransportError> for HalError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Timeout(after) => HalError::TransportTimeout(after),
            TransportError::Rejected(reason) => HalError::TransportRejected(reason),
            TransportError::Unexpected(what) => {
                HalError::TransportRejected(format!("unexpected response: {what}"))
            }
            TransportError::Unavailable => HalError::DeviceAbsent,
        }
    }
}

impl HalError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HalError::TransportTimeout(_))
    }
}

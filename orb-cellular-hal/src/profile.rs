use crate::callbacks::{acked, ProfileStatusEvent, ProfileStatusHandler};
use crate::error::HalError;
use derive_more::Display;
use std::{collections::BTreeMap, fmt, sync::Arc};

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProfileId(pub u32);

impl From<u32> for ProfileId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ProfileType {
    #[default]
    #[display("3GPP")]
    ThreeGpp = 0,
    #[display("3GPP2")]
    ThreeGpp2,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PdpType {
    #[default]
    #[display("IPv4")]
    Ipv4 = 0,
    #[display("PPP")]
    Ppp,
    #[display("IPv6")]
    Ipv6,
    #[display("IPv4v6")]
    Ipv4OrIpv6,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PdpAuthentication {
    #[default]
    None = 0,
    Pap,
    Chap,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PdpNetworkConfig {
    #[default]
    Nas = 1,
    Dhcp,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProfileStatus {
    NotReady = 1,
    Configuring,
    Ready,
    Deleted,
}

/// What happens when a profile bound to a live session is deleted.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeleteInUsePolicy {
    /// Fail the deletion with a resource conflict.
    Reject,
    /// Take the sessions down first, then delete.
    #[default]
    TearDown,
}

#[derive(Clone, PartialEq, Eq, bon::Builder)]
pub struct PdpProfile {
    /// `None` until the profile table assigns one on creation.
    pub id: Option<ProfileId>,
    #[builder(default)]
    pub profile_type: ProfileType,
    #[builder(default = 1)]
    pub pdp_context: u32,
    #[builder(default)]
    pub pdp_type: PdpType,
    #[builder(default)]
    pub authentication: PdpAuthentication,
    #[builder(default)]
    pub network_config: PdpNetworkConfig,
    #[builder(default, into)]
    pub name: String,
    #[builder(into)]
    pub apn: String,
    #[builder(default, into)]
    pub username: String,
    #[builder(default, into)]
    pub password: String,
    #[builder(default, into)]
    pub proxy: String,
    #[builder(default)]
    pub proxy_port: u16,
    #[builder(default)]
    pub no_roaming: bool,
    #[builder(default)]
    pub apn_disabled: bool,
    #[builder(default)]
    pub is_default: bool,
}

impl fmt::Debug for PdpProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdpProfile")
            .field("id", &self.id)
            .field("profile_type", &self.profile_type)
            .field("pdp_context", &self.pdp_context)
            .field("pdp_type", &self.pdp_type)
            .field("authentication", &self.authentication)
            .field("network_config", &self.network_config)
            .field("name", &self.name)
            .field("apn", &self.apn)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("proxy", &self.proxy)
            .field("proxy_port", &self.proxy_port)
            .field("no_roaming", &self.no_roaming)
            .field("apn_disabled", &self.apn_disabled)
            .field("is_default", &self.is_default)
            .finish()
    }
}

/// Versioned profile table. Never mutated in place: every change produces a
/// new table with a bumped version that replaces the published one wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileTable {
    version: u64,
    profiles: BTreeMap<ProfileId, PdpProfile>,
}

impl ProfileTable {
    /// Builds a table from records read back from storage. Records without an
    /// id are dropped.
    pub fn from_profiles(profiles: Vec<PdpProfile>, version: u64) -> Self {
        let profiles = profiles
            .into_iter()
            .filter_map(|p| Some((p.id?, p)))
            .collect();

        Self { version, profiles }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn get(&self, id: ProfileId) -> Option<&PdpProfile> {
        self.profiles.get(&id)
    }

    pub fn list(&self) -> Vec<PdpProfile> {
        self.profiles.values().cloned().collect()
    }

    pub fn default_profile(&self, profile_type: ProfileType) -> Option<&PdpProfile> {
        self.profiles
            .values()
            .find(|p| p.is_default && p.profile_type == profile_type)
    }

    /// Lowest positive id not in use.
    pub fn next_free_id(&self) -> ProfileId {
        let mut candidate = 1;
        for id in self.profiles.keys() {
            if id.0 != candidate {
                break;
            }
            candidate += 1;
        }

        ProfileId(candidate)
    }

    /// Records that must be written to store `profile`: the profile itself,
    /// followed by every other default of the same type with its default flag
    /// cleared.
    pub fn plan_upsert(&self, profile: &PdpProfile) -> Vec<PdpProfile> {
        let mut writes = vec![profile.clone()];

        if profile.is_default {
            writes.extend(
                self.profiles
                    .values()
                    .filter(|p| {
                        p.id != profile.id
                            && p.is_default
                            && p.profile_type == profile.profile_type
                    })
                    .map(|p| PdpProfile {
                        is_default: false,
                        ..p.clone()
                    }),
            );
        }

        writes
    }

    pub fn with_upserts(&self, writes: impl IntoIterator<Item = PdpProfile>) -> Self {
        let mut profiles = self.profiles.clone();
        for p in writes {
            if let Some(id) = p.id {
                profiles.insert(id, p);
            }
        }

        Self {
            version: self.version + 1,
            profiles,
        }
    }

    pub fn without(&self, id: ProfileId) -> Self {
        let mut profiles = self.profiles.clone();
        profiles.remove(&id);

        Self {
            version: self.version + 1,
            profiles,
        }
    }
}

pub(crate) fn notify(
    handler: &Arc<dyn ProfileStatusHandler>,
    profile_id: Option<ProfileId>,
    pdp_type: PdpType,
    status: ProfileStatus,
    error: Option<HalError>,
) {
    acked(
        "profile-status",
        handler.on_profile_status(ProfileStatusEvent {
            profile_id,
            pdp_type,
            status,
            error,
        }),
    );
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::digest;

// Thread identity. SOLO ids are derived from the two parties, GROUP ids are random.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ThreadId(pub String);

impl ThreadId {
    /// Deterministic id of the two-party thread between `a` and `b`.
    ///
    /// Either party computes the same value.
    pub fn solo(a: &str, b: &str) -> Self {
        Self(digest::solo_thread_digest(a, b))
    }

    pub fn new_group() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadKind {
    Solo,
    Group,
}

impl ThreadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Solo => "solo",
            Self::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "solo" => Some(Self::Solo),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Platform of a logged-in device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    Android,
    Ios,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "android" => Some(Self::Android),
            "ios" => Some(Self::Ios),
            _ => None,
        }
    }

    /// Which token slot a push service writes on this platform, if any.
    pub fn push_slot(&self, service: PushService) -> Option<PushSlot> {
        match (self, service) {
            (Self::Android, PushService::Fcm) => Some(PushSlot::Primary),
            (Self::Ios, PushService::ApnsVoip) => Some(PushSlot::Primary),
            (Self::Ios, PushService::ApnsRemote) => Some(PushSlot::Secondary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushService {
    Fcm,
    ApnsVoip,
    ApnsRemote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushSlot {
    Primary,
    Secondary,
}

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solo_thread_id_is_order_independent() {
        let ab = ThreadId::solo("+14155550100", "+447700900123");
        let ba = ThreadId::solo("+447700900123", "+14155550100");
        assert_eq!(ab, ba);
        assert_eq!(ab.as_str().len(), 64);
    }

    #[test]
    fn solo_thread_id_differs_per_pair() {
        let ab = ThreadId::solo("alice", "bob");
        let ac = ThreadId::solo("alice", "carol");
        assert_ne!(ab, ac);
    }

    #[test]
    fn push_slot_per_platform() {
        assert_eq!(
            DeviceKind::Android.push_slot(PushService::Fcm),
            Some(PushSlot::Primary)
        );
        assert_eq!(DeviceKind::Android.push_slot(PushService::ApnsVoip), None);
        assert_eq!(
            DeviceKind::Ios.push_slot(PushService::ApnsRemote),
            Some(PushSlot::Secondary)
        );
        assert_eq!(DeviceKind::Ios.push_slot(PushService::Fcm), None);
    }
}

//! Vendor compatibility workarounds applied to login responses.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// What a quirk does to a negotiated channel.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuirkAction {
    /// Use half of the request limit the target granted.
    HalveRequestLimit,
    /// Never use more than this many credits.
    CapRequestLimit(u32),
}

/// A workaround keyed on the identity the target's I/O controller reports.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quirk {
    /// IEEE OUI of the I/O controller vendor.
    pub vendor_id: u32,
    /// Subsystem device id of the I/O controller.
    pub subsystem_id: u32,
    /// Adjustment applied when both ids match.
    pub action: QuirkAction,
}

impl Quirk {
    /// Returns `true` if this quirk applies to the given controller identity.
    pub fn matches(&self, vendor_id: u32, subsystem_id: u32) -> bool {
        self.vendor_id == vendor_id && self.subsystem_id == subsystem_id
    }

    fn apply(&self, limit: u32) -> u32 {
        match self.action {
            QuirkAction::HalveRequestLimit => limit / 2,
            QuirkAction::CapRequestLimit(cap) => limit.min(cap),
        }
    }
}

/// The quirk table shipped by default.
///
/// Targets reporting vendor `0x0002c9` with subsystem `0x5a44` overrun their receive queue when
/// driven at the full limit they advertise.
pub fn default_quirks() -> Vec<Quirk> {
    vec![Quirk {
        vendor_id: 0x0002c9,
        subsystem_id: 0x5a44,
        action: QuirkAction::HalveRequestLimit,
    }]
}

/// Apply every matching quirk in `quirks` to `limit`. The result is never below one.
pub fn adjust_request_limit(quirks: &[Quirk], vendor_id: u32, subsystem_id: u32, limit: u32) -> u32 {
    let adjusted = quirks
        .iter()
        .filter(|q| q.matches(vendor_id, subsystem_id))
        .fold(limit, |limit, q| {
            tracing::debug!(vendor_id, subsystem_id, action = ?q.action, "applying target quirk");
            q.apply(limit)
        });
    if limit > 0 {
        adjusted.max(1)
    } else {
        0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_table_halves_known_target() {
        let quirks = default_quirks();
        assert_eq!(adjust_request_limit(&quirks, 0x0002c9, 0x5a44, 64), 32);
        assert_eq!(adjust_request_limit(&quirks, 0x0002c9, 0x6282, 64), 64);
        assert_eq!(adjust_request_limit(&quirks, 0x0002c9, 0x5a44, 1), 1);
    }

    #[test]
    fn quirks_compose() {
        let mut quirks = default_quirks();
        quirks.push(Quirk {
            vendor_id: 0x0002c9,
            subsystem_id: 0x5a44,
            action: QuirkAction::CapRequestLimit(10),
        });
        assert_eq!(adjust_request_limit(&quirks, 0x0002c9, 0x5a44, 64), 10);
        assert_eq!(adjust_request_limit(&quirks, 0x0002c9, 0x5a44, 12), 6);
    }
}

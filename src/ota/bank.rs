// Bank identifiers and the persisted per-bank record

use core::fmt;
use serde::{Deserialize, Serialize};

/// One of the two fixed image slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BankId {
    A,
    B,
}

impl BankId {
    pub const ALL: [BankId; 2] = [BankId::A, BankId::B];

    /// The bank that is not `self`.
    pub fn other(self) -> BankId {
        match self {
            BankId::A => BankId::B,
            BankId::B => BankId::A,
        }
    }

    pub fn index(self) -> usize {
        match self {
            BankId::A => 0,
            BankId::B => 1,
        }
    }

    /// Partition label in the ESP-IDF partition table.
    pub fn partition_label(self) -> &'static str {
        match self {
            BankId::A => "ota_0",
            BankId::B => "ota_1",
        }
    }
}

impl fmt::Display for BankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BankId::A => f.write_str("A"),
            BankId::B => f.write_str("B"),
        }
    }
}

/// Persisted lifecycle state of a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BankState {
    /// Never written, or erased.
    #[default]
    Empty,
    /// Freshly installed, on probation until the first post-boot diagnostic passes.
    Unverified,
    /// Passed its post-boot diagnostic.
    Confirmed,
    /// Partially written, failed finalize, or failed its diagnostic.
    Invalid,
}

impl BankState {
    /// Whether the bootloader may be pointed at a bank in this state.
    pub fn is_bootable(self) -> bool {
        matches!(self, BankState::Unverified | BankState::Confirmed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BankState::Empty => "empty",
            BankState::Unverified => "unverified",
            BankState::Confirmed => "confirmed",
            BankState::Invalid => "invalid",
        }
    }
}

impl fmt::Display for BankState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The small fixed record kept per bank in non-volatile storage, outside the image region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BankRecord {
    pub state: BankState,
    pub boot_target: bool,
}

impl BankRecord {
    pub fn new(state: BankState, boot_target: bool) -> Self {
        Self { state, boot_target }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

//! Two-bank image store contract.
//!
//! Implementations translate whatever the underlying flash API reports into
//! [`StoreError`] and enforce two rules on their own:
//!
//! - single writer: at most one [`WriteSession`] is open system-wide;
//! - the boot target is never a bank whose state is `invalid` or `empty`.

use thiserror::Error;

use super::bank::{BankId, BankState};
use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no second image bank available (single-bank partition table)")]
    NoBankAvailable,
    #[error("a write session is already open on bank {bank}")]
    SessionAlreadyOpen { bank: BankId },
    #[error("write session for bank {bank} is not the open session")]
    UnknownSession { bank: BankId },
    #[error("bank {bank} is the boot target and cannot be rewritten")]
    BankIsBootTarget { bank: BankId },
    #[error("image exceeds bank {bank} capacity of {capacity} bytes")]
    CapacityExceeded { bank: BankId, capacity: usize },
    #[error("flash write to bank {bank} failed at offset {offset}: {reason}")]
    WriteFault {
        bank: BankId,
        offset: usize,
        reason: String,
    },
    #[error("image in bank {bank} is incomplete: {reason}")]
    IncompleteImage { bank: BankId, reason: String },
    #[error("bank {bank} cannot be the boot target while {state}")]
    InvalidBootTarget { bank: BankId, state: BankState },
    #[error("state record of bank {bank} unavailable: {reason}")]
    StateIo { bank: BankId, reason: String },
    #[error("flash operation failed: {reason}")]
    Medium { reason: String },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::SessionAlreadyOpen { .. }
            | StoreError::UnknownSession { .. }
            | StoreError::BankIsBootTarget { .. }
            | StoreError::InvalidBootTarget { .. } => ErrorKind::Protocol,
            StoreError::CapacityExceeded { .. } | StoreError::IncompleteImage { .. } => {
                ErrorKind::Input
            }
            StoreError::NoBankAvailable
            | StoreError::WriteFault { .. }
            | StoreError::StateIo { .. }
            | StoreError::Medium { .. } => ErrorKind::Medium,
        }
    }
}

/// Exclusive, forward-only write handle on one bank.
///
/// Not `Clone`: `finalize` and `abort` consume it, so a finished session cannot be reused.
#[derive(Debug, PartialEq, Eq)]
pub struct WriteSession {
    bank: BankId,
    written: usize,
    token: u32,
}

impl WriteSession {
    /// For `ImageStore` implementations; `token` identifies the open session inside the store.
    pub fn new(bank: BankId, token: u32) -> Self {
        Self {
            bank,
            written: 0,
            token,
        }
    }

    pub fn bank(&self) -> BankId {
        self.bank
    }

    /// Bytes appended so far; also the offset of the next write.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn advance(&mut self, len: usize) {
        self.written += len;
    }
}

pub trait ImageStore {
    /// The bank the bootloader will load next.
    fn current_boot_bank(&self) -> Result<BankId, StoreError>;

    /// The bank the CPU is executing from.
    ///
    /// Differs from the boot target after a commit that has not rebooted yet, or
    /// when the bootloader could not load the boot target and fell back.
    fn running_bank(&self) -> Result<BankId, StoreError> {
        self.current_boot_bank()
    }

    /// The bank that is not the boot target; always the write target for a new update.
    fn next_writable_bank(&self) -> Result<BankId, StoreError>;

    fn capacity(&self, bank: BankId) -> usize;

    /// Opens the single write session. Fails fast with `SessionAlreadyOpen` instead of queuing.
    fn begin_write(&mut self, bank: BankId) -> Result<WriteSession, StoreError>;

    /// Appends sequentially. A `WriteFault` means the whole session must be aborted.
    fn write_chunk(&mut self, session: &mut WriteSession, bytes: &[u8]) -> Result<(), StoreError>;

    /// Verifies the written image, marks it `unverified` and repoints the boot target to it.
    ///
    /// On failure the bank is left `invalid` and the boot target does not move.
    fn finalize(&mut self, session: WriteSession) -> Result<(), StoreError>;

    /// Discards the session; the bank becomes `invalid`, the boot target does not move.
    fn abort(&mut self, session: WriteSession) -> Result<(), StoreError>;

    fn bank_state(&self, bank: BankId) -> Result<BankState, StoreError>;

    /// Durable across reboot. Refuses to make the boot target `invalid` or `empty`.
    fn set_bank_state(&mut self, bank: BankId, state: BankState) -> Result<(), StoreError>;

    /// Repoints the boot target. Refuses banks that are not bootable.
    ///
    /// The repoint is the last fallible step: an error means the boot target did not move.
    fn set_boot_bank(&mut self, bank: BankId) -> Result<(), StoreError>;
}

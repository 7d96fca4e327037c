//! Simulated two-bank flash for host runs and tests.
//!
//! Mirrors the ESP store's behaviour: erase-on-begin, forward-only writes,
//! finalize gated by an image check, durable per-bank records. Faults can be
//! injected for the write path, for record I/O, for repointing the boot target
//! and for the bootloader loading the boot target.

use log::{debug, warn};

use super::bank::{BankId, BankRecord, BankState};
use super::image::{self, ImageError};
use super::store::{ImageStore, StoreError, WriteSession};

/// Structural check run by `finalize`.
pub type ImageCheck = fn(&[u8]) -> Result<(), ImageError>;

/// Full ESP image walk: segments, checksum and appended digest.
pub fn structural_check(bytes: &[u8]) -> Result<(), ImageError> {
    image::verify_image(bytes).map(|_| ())
}

/// Accepts anything that passes the upload header gate.
pub fn header_check(bytes: &[u8]) -> Result<(), ImageError> {
    image::check_header(bytes)
        .map(|_| ())
        .map_err(ImageError::from)
}

#[derive(Debug, Clone, Default)]
struct SimBank {
    data: Vec<u8>,
    record: BankRecord,
}

#[derive(Debug, Clone, Copy)]
struct OpenWrite {
    bank: BankId,
    token: u32,
}

#[derive(Debug, Clone)]
pub struct MemoryImageStore {
    banks: [SimBank; 2],
    capacity: usize,
    single_bank: bool,
    open: Option<OpenWrite>,
    next_token: u32,
    check: ImageCheck,
    write_fault_at: Option<usize>,
    state_fault: bool,
    record_write_faults: [bool; 2],
    repoint_fault: bool,
    boot_load_fault: bool,
    // None: executing the boot target
    running: Option<BankId>,
    bytes_programmed: usize,
}

impl MemoryImageStore {
    /// Provisioned device: bank A holds a confirmed factory image and is the boot target.
    pub fn new(capacity: usize) -> Self {
        let mut banks: [SimBank; 2] = Default::default();
        banks[BankId::A.index()].record = BankRecord::new(BankState::Confirmed, true);

        Self {
            banks,
            capacity,
            single_bank: false,
            open: None,
            next_token: 1,
            check: structural_check,
            write_fault_at: None,
            state_fault: false,
            record_write_faults: [false; 2],
            repoint_fault: false,
            boot_load_fault: false,
            running: None,
            bytes_programmed: 0,
        }
    }

    /// Degenerate partition table with only one application bank.
    pub fn single_bank(capacity: usize) -> Self {
        Self {
            single_bank: true,
            ..Self::new(capacity)
        }
    }

    pub fn with_check(mut self, check: ImageCheck) -> Self {
        self.check = check;
        self
    }

    /// Overwrites a bank's record, e.g. to stage a device that just switched images.
    pub fn with_record(mut self, bank: BankId, record: BankRecord) -> Self {
        self.banks[bank.index()].record = record;
        self
    }

    /// The next write that would cross `offset` fails with `WriteFault` (one-shot).
    pub fn fail_writes_at(&mut self, offset: usize) {
        self.write_fault_at = Some(offset);
    }

    /// Makes every record read/write fail until cleared.
    pub fn fail_state_io(&mut self, failing: bool) {
        self.state_fault = failing;
    }

    /// Makes writes of one bank's record fail until cleared; reads keep working.
    pub fn fail_record_writes(&mut self, bank: BankId, failing: bool) {
        self.record_write_faults[bank.index()] = failing;
    }

    /// Makes `set_boot_bank` fail to repoint until cleared.
    pub fn fail_repoint(&mut self, failing: bool) {
        self.repoint_fault = failing;
    }

    /// On the next reboot the bootloader cannot load the boot target and starts the other bank.
    pub fn fail_next_boot_load(&mut self) {
        self.boot_load_fault = true;
    }

    pub fn record(&self, bank: BankId) -> BankRecord {
        self.banks[bank.index()].record
    }

    pub fn bank_data(&self, bank: BankId) -> &[u8] {
        &self.banks[bank.index()].data
    }

    /// Total bytes ever programmed into either bank.
    pub fn bytes_programmed(&self) -> usize {
        self.bytes_programmed
    }

    pub fn is_session_open(&self) -> bool {
        self.open.is_some()
    }

    /// Power cycle: RAM-only state (the open session) is lost, records survive.
    pub fn reboot(&mut self) {
        if let Some(open) = self.open.take() {
            warn!("Power lost with bank {} mid-write", open.bank);
        }
        self.running = None;
        if std::mem::take(&mut self.boot_load_fault) {
            if let Ok(boot) = self.current_boot_bank() {
                warn!("Bank {} failed to load, bootloader started bank {}", boot, boot.other());
                self.running = Some(boot.other());
            }
        }
    }

    fn claim(&self, session: &WriteSession) -> Result<(), StoreError> {
        match self.open {
            Some(open) if open.token == session.token() && open.bank == session.bank() => Ok(()),
            _ => Err(StoreError::UnknownSession {
                bank: session.bank(),
            }),
        }
    }

    fn record_io(&self, bank: BankId) -> Result<(), StoreError> {
        if self.state_fault {
            return Err(StoreError::StateIo {
                bank,
                reason: "simulated NVS failure".into(),
            });
        }
        Ok(())
    }

    fn record_write(&self, bank: BankId) -> Result<(), StoreError> {
        self.record_io(bank)?;
        if self.record_write_faults[bank.index()] {
            return Err(StoreError::StateIo {
                bank,
                reason: "simulated NVS write failure".into(),
            });
        }
        Ok(())
    }

    fn point_boot_at(&mut self, bank: BankId) {
        self.banks[bank.index()].record.boot_target = true;
        self.banks[bank.other().index()].record.boot_target = false;
    }
}

impl ImageStore for MemoryImageStore {
    fn current_boot_bank(&self) -> Result<BankId, StoreError> {
        BankId::ALL
            .into_iter()
            .find(|bank| self.banks[bank.index()].record.boot_target)
            .ok_or_else(|| StoreError::Medium {
                reason: "no bank marked as boot target".into(),
            })
    }

    fn running_bank(&self) -> Result<BankId, StoreError> {
        match self.running {
            Some(bank) => Ok(bank),
            None => self.current_boot_bank(),
        }
    }

    fn next_writable_bank(&self) -> Result<BankId, StoreError> {
        if self.single_bank {
            return Err(StoreError::NoBankAvailable);
        }
        Ok(self.current_boot_bank()?.other())
    }

    fn capacity(&self, _bank: BankId) -> usize {
        self.capacity
    }

    fn begin_write(&mut self, bank: BankId) -> Result<WriteSession, StoreError> {
        if let Some(open) = self.open {
            return Err(StoreError::SessionAlreadyOpen { bank: open.bank });
        }
        if self.current_boot_bank()? == bank {
            return Err(StoreError::BankIsBootTarget { bank });
        }
        self.record_write(bank)?;

        let slot = &mut self.banks[bank.index()];
        slot.data.clear();
        slot.record.state = BankState::Invalid;

        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        self.open = Some(OpenWrite { bank, token });
        debug!("Opened write session {} on bank {}", token, bank);

        Ok(WriteSession::new(bank, token))
    }

    fn write_chunk(&mut self, session: &mut WriteSession, bytes: &[u8]) -> Result<(), StoreError> {
        self.claim(session)?;
        let bank = session.bank();
        let offset = session.written();

        if offset + bytes.len() > self.capacity {
            return Err(StoreError::CapacityExceeded {
                bank,
                capacity: self.capacity,
            });
        }
        if let Some(at) = self.write_fault_at {
            if offset + bytes.len() > at {
                self.write_fault_at = None;
                return Err(StoreError::WriteFault {
                    bank,
                    offset,
                    reason: "simulated flash fault".into(),
                });
            }
        }

        self.banks[bank.index()].data.extend_from_slice(bytes);
        self.bytes_programmed += bytes.len();
        session.advance(bytes.len());
        Ok(())
    }

    fn finalize(&mut self, session: WriteSession) -> Result<(), StoreError> {
        self.claim(&session)?;
        self.open = None;
        let bank = session.bank();

        if let Err(e) = (self.check)(&self.banks[bank.index()].data) {
            self.banks[bank.index()].record.state = BankState::Invalid;
            return Err(StoreError::IncompleteImage {
                bank,
                reason: e.to_string(),
            });
        }

        self.record_write(bank)?;
        self.banks[bank.index()].record.state = BankState::Unverified;
        self.point_boot_at(bank);
        Ok(())
    }

    fn abort(&mut self, session: WriteSession) -> Result<(), StoreError> {
        self.claim(&session)?;
        self.open = None;

        let slot = &mut self.banks[session.bank().index()];
        slot.data.clear();
        slot.record.state = BankState::Invalid;
        Ok(())
    }

    fn bank_state(&self, bank: BankId) -> Result<BankState, StoreError> {
        self.record_io(bank)?;
        Ok(self.banks[bank.index()].record.state)
    }

    fn set_bank_state(&mut self, bank: BankId, state: BankState) -> Result<(), StoreError> {
        self.record_write(bank)?;
        let record = &mut self.banks[bank.index()].record;
        if record.boot_target && !state.is_bootable() {
            return Err(StoreError::InvalidBootTarget { bank, state });
        }
        record.state = state;
        Ok(())
    }

    fn set_boot_bank(&mut self, bank: BankId) -> Result<(), StoreError> {
        let state = self.bank_state(bank)?;
        if !state.is_bootable() {
            return Err(StoreError::InvalidBootTarget { bank, state });
        }
        self.record_write(bank)?;
        if self.repoint_fault {
            return Err(StoreError::Medium {
                reason: "simulated otadata write failure".into(),
            });
        }
        self.point_boot_at(bank);
        Ok(())
    }
}

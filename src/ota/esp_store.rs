// Image store backed by the ESP-IDF OTA API and NVS bank records

use core::ffi::c_void;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_boot_partition,
    esp_ota_get_running_partition, esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write,
    esp_partition_find_first, esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_0,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_1, esp_partition_t,
    esp_partition_type_t_ESP_PARTITION_TYPE_APP, EspError, ESP_ERR_OTA_VALIDATE_FAILED,
    OTA_SIZE_UNKNOWN,
};
use log::{error, info, warn};

use super::bank::{BankId, BankRecord, BankState};
use super::store::{ImageStore, StoreError, WriteSession};

const BANK_NAMESPACE: &str = "ota_banks";

// Partition table entries live in flash-mapped memory for the whole program run.
#[derive(Clone, Copy)]
struct Partition(*const esp_partition_t);

unsafe impl Send for Partition {}

impl Partition {
    fn address(&self) -> u32 {
        unsafe { (*self.0).address }
    }

    fn size(&self) -> usize {
        unsafe { (*self.0).size as usize }
    }
}

struct OpenWrite {
    bank: BankId,
    token: u32,
    handle: esp_ota_handle_t,
}

pub struct EspImageStore {
    partitions: [Option<Partition>; 2],
    nvs: EspNvs<NvsDefault>,
    open: Option<OpenWrite>,
    next_token: u32,
}

impl EspImageStore {
    pub fn new(nvs_partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let find = |subtype| {
            let p = unsafe {
                esp_partition_find_first(
                    esp_partition_type_t_ESP_PARTITION_TYPE_APP,
                    subtype,
                    core::ptr::null(),
                )
            };
            (!p.is_null()).then_some(Partition(p))
        };

        let partitions = [
            find(esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_0),
            find(esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_1),
        ];
        for bank in BankId::ALL {
            match partitions[bank.index()] {
                Some(p) => info!(
                    "Bank {} = {} at 0x{:08x}, {} KB",
                    bank,
                    bank.partition_label(),
                    p.address(),
                    p.size() / 1024
                ),
                None => warn!("Bank {} ({}) missing from partition table", bank, bank.partition_label()),
            }
        }

        Ok(Self {
            partitions,
            nvs: EspNvs::new(nvs_partition, BANK_NAMESPACE, true)?,
            open: None,
            next_token: 1,
        })
    }

    fn bank_at(&self, p: *const esp_partition_t) -> Option<BankId> {
        if p.is_null() {
            return None;
        }
        let address = unsafe { (*p).address };
        BankId::ALL
            .into_iter()
            .find(|bank| self.partitions[bank.index()].map(|q| q.address()) == Some(address))
    }

    fn partition(&self, bank: BankId) -> Result<Partition, StoreError> {
        self.partitions[bank.index()].ok_or(StoreError::NoBankAvailable)
    }

    fn record_key(bank: BankId) -> &'static str {
        match bank {
            BankId::A => "bank_a",
            BankId::B => "bank_b",
        }
    }

    fn read_record(&self, bank: BankId) -> Result<Option<BankRecord>, StoreError> {
        let io = |reason: String| StoreError::StateIo { bank, reason };
        let mut buf = [0u8; 64];
        match self
            .nvs
            .get_blob(Self::record_key(bank), &mut buf)
            .map_err(|e| io(e.to_string()))?
        {
            Some(data) => BankRecord::from_json(data)
                .map(Some)
                .map_err(|e| io(e.to_string())),
            None => Ok(None),
        }
    }

    fn write_record(&mut self, bank: BankId, record: BankRecord) -> Result<(), StoreError> {
        let io = |reason: String| StoreError::StateIo { bank, reason };
        let json = record.to_json().map_err(|e| io(e.to_string()))?;
        self.nvs
            .set_blob(Self::record_key(bank), &json)
            .map_err(|e| io(e.to_string()))
    }

    fn update_record(&mut self, bank: BankId, state: BankState, boot_target: bool) -> Result<(), StoreError> {
        self.write_record(bank, BankRecord::new(state, boot_target))
    }

    // Boot selection lives in otadata; a stale flag here is cosmetic.
    fn clear_boot_flag(&mut self, bank: BankId) {
        let cleared = match self.read_record(bank) {
            Ok(Some(record)) if record.boot_target => self.update_record(bank, record.state, false),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = cleared {
            warn!("Bank {} still flagged as boot target: {}", bank, e);
        }
    }

    fn claim(&self, session: &WriteSession) -> Result<esp_ota_handle_t, StoreError> {
        match &self.open {
            Some(open) if open.token == session.token() && open.bank == session.bank() => Ok(open.handle),
            _ => Err(StoreError::UnknownSession {
                bank: session.bank(),
            }),
        }
    }
}

fn medium(e: EspError) -> StoreError {
    StoreError::Medium {
        reason: e.to_string(),
    }
}

impl ImageStore for EspImageStore {
    fn current_boot_bank(&self) -> Result<BankId, StoreError> {
        self.bank_at(unsafe { esp_ota_get_boot_partition() })
            .ok_or_else(|| StoreError::Medium {
                reason: "boot partition is not an OTA bank".into(),
            })
    }

    fn running_bank(&self) -> Result<BankId, StoreError> {
        self.bank_at(unsafe { esp_ota_get_running_partition() })
            .ok_or_else(|| StoreError::Medium {
                reason: "running partition is not an OTA bank".into(),
            })
    }

    fn next_writable_bank(&self) -> Result<BankId, StoreError> {
        let target = self.current_boot_bank()?.other();
        self.partition(target)?;
        Ok(target)
    }

    fn capacity(&self, bank: BankId) -> usize {
        self.partitions[bank.index()].map(|p| p.size()).unwrap_or(0)
    }

    fn begin_write(&mut self, bank: BankId) -> Result<WriteSession, StoreError> {
        if let Some(open) = &self.open {
            return Err(StoreError::SessionAlreadyOpen { bank: open.bank });
        }
        // after a commit the running image is no longer the boot target but must not be erased either
        if bank == self.current_boot_bank()? || self.running_bank().ok() == Some(bank) {
            return Err(StoreError::BankIsBootTarget { bank });
        }
        let partition = self.partition(bank)?;

        // invalid until finalize succeeds, so a power cut mid-write never looks bootable
        self.update_record(bank, BankState::Invalid, false)?;

        let mut handle: esp_ota_handle_t = 0;
        esp!(unsafe { esp_ota_begin(partition.0, OTA_SIZE_UNKNOWN as usize, &mut handle) }).map_err(medium)?;

        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        self.open = Some(OpenWrite { bank, token, handle });
        info!("Erased bank {}, ready for {} KB", bank, partition.size() / 1024);
        Ok(WriteSession::new(bank, token))
    }

    fn write_chunk(&mut self, session: &mut WriteSession, bytes: &[u8]) -> Result<(), StoreError> {
        let handle = self.claim(session)?;
        let bank = session.bank();
        let capacity = self.capacity(bank);
        if session.written() + bytes.len() > capacity {
            return Err(StoreError::CapacityExceeded { bank, capacity });
        }

        esp!(unsafe { esp_ota_write(handle, bytes.as_ptr() as *const c_void, bytes.len()) }).map_err(
            |e| StoreError::WriteFault {
                bank,
                offset: session.written(),
                reason: e.to_string(),
            },
        )?;
        session.advance(bytes.len());
        Ok(())
    }

    fn finalize(&mut self, session: WriteSession) -> Result<(), StoreError> {
        let handle = self.claim(&session)?;
        let bank = session.bank();
        let partition = self.partition(bank)?;
        // esp_ota_end releases the handle whatever it returns
        self.open = None;

        let code = unsafe { esp_ota_end(handle) };
        if code == ESP_ERR_OTA_VALIDATE_FAILED as i32 {
            return Err(StoreError::IncompleteImage {
                bank,
                reason: "image validation failed".into(),
            });
        }
        esp!(code).map_err(medium)?;

        self.update_record(bank, BankState::Unverified, true)?;
        // last fallible step: once otadata points here the commit has happened
        if let Err(e) = esp!(unsafe { esp_ota_set_boot_partition(partition.0) }) {
            if let Err(revert) = self.update_record(bank, BankState::Invalid, false) {
                error!("Bank {} record left as unverified after failed repoint: {}", bank, revert);
            }
            return Err(medium(e));
        }
        self.clear_boot_flag(bank.other());
        Ok(())
    }

    fn abort(&mut self, session: WriteSession) -> Result<(), StoreError> {
        let handle = self.claim(&session)?;
        self.open = None;
        let aborted = esp!(unsafe { esp_ota_abort(handle) }).map_err(medium);
        self.update_record(session.bank(), BankState::Invalid, false)?;
        aborted
    }

    fn bank_state(&self, bank: BankId) -> Result<BankState, StoreError> {
        match self.read_record(bank)? {
            Some(record) => Ok(record.state),
            // a factory-flashed image has no record yet
            None if self.current_boot_bank()? == bank || self.running_bank().ok() == Some(bank) => {
                Ok(BankState::Confirmed)
            }
            None => Ok(BankState::Empty),
        }
    }

    fn set_bank_state(&mut self, bank: BankId, state: BankState) -> Result<(), StoreError> {
        let boot_target = self.current_boot_bank()? == bank;
        if boot_target && !state.is_bootable() {
            return Err(StoreError::InvalidBootTarget { bank, state });
        }
        self.update_record(bank, state, boot_target)
    }

    fn set_boot_bank(&mut self, bank: BankId) -> Result<(), StoreError> {
        let state = self.bank_state(bank)?;
        if !state.is_bootable() {
            return Err(StoreError::InvalidBootTarget { bank, state });
        }
        let partition = self.partition(bank)?;

        self.update_record(bank, state, true)?;
        if let Err(e) = esp!(unsafe { esp_ota_set_boot_partition(partition.0) }) {
            if let Err(revert) = self.update_record(bank, state, false) {
                error!("Bank {} still flagged as boot target after failed repoint: {}", bank, revert);
            }
            return Err(medium(e));
        }
        self.clear_boot_flag(bank.other());
        Ok(())
    }
}

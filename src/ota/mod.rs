// OTA (Over-The-Air) update module

pub mod bank;
pub mod events;
pub mod image;
pub mod manager;
pub mod memory;
pub mod source;
pub mod store;
pub mod watch;

#[cfg(feature = "esp")]
pub mod esp_store;

pub use bank::{BankId, BankRecord, BankState};
pub use events::{LogObserver, TransferEvent, TransferObserver, TransferState};
pub use image::{HeaderError, ImageError};
pub use manager::{SessionOutcome, TransferEngine, TransferError, TransferReport, UpdateStatus};
pub use memory::MemoryImageStore;
pub use source::{ChunkSource, ReadSource};
pub use store::{ImageStore, StoreError, WriteSession};
pub use watch::{CancelReason, SessionWatch};

#[cfg(feature = "esp")]
pub use esp_store::EspImageStore;

// OTA update flow:
// 1. Boot validation settles any bank left on probation
// 2. Upload streams into the non-running bank, gated on the image header
// 3. Finalize checks the image and repoints the boot target
// 4. Restart; the next boot runs the new bank on probation

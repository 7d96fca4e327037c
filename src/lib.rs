//! Two-bank firmware update over a local access point.
//!
//! A device boots, settles any bank left on probation ([`boot::validate_boot`]),
//! then opens a soft-AP with an upload page. One upload at a time streams into
//! the non-running bank through [`ota::TransferEngine`]; a committed image boots
//! on probation and is either confirmed or rolled back on the next start.
//!
//! Everything outside `network::ap`, `network::web_server`, `system` and
//! `ota::esp_store` is hardware independent and tested on the host against
//! [`ota::MemoryImageStore`]. The ESP-IDF parts need the `esp` feature.

pub mod boot;
pub mod boot_diagnostics;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod ota;
#[cfg(feature = "esp")]
pub mod system;
pub mod templates;

pub use boot::{validate_boot, BootError, BootOutcome, BootValidated, Restart};
pub use boot_diagnostics::{AlwaysHealthy, Diagnostic, DiagnosticResult};
pub use config::OtaConfig;
pub use error::ErrorKind;

pub mod reset;

pub use reset::{reset_reason, schedule_restart, EspRestart};

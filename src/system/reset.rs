/// Restart helpers and reset-reason reporting
use log::info;
use std::time::Duration;

use crate::boot::Restart;

/// Immediate `esp_restart`; used by boot validation after a rollback.
#[derive(Debug, Default, Clone, Copy)]
pub struct EspRestart;

impl Restart for EspRestart {
    fn restart(&mut self) {
        info!("Restarting system...");
        log::logger().flush();
        unsafe { esp_idf_sys::esp_restart() }
    }
}

/// Restarts from a helper thread so the HTTP response can flush first.
pub fn schedule_restart(delay: Duration) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("restart".into())
        .stack_size(4096)
        .spawn(move || {
            std::thread::sleep(delay);
            EspRestart.restart();
        })?;
    Ok(())
}

/// Get the last reset reason as a string
pub fn reset_reason() -> &'static str {
    let reason = unsafe { esp_idf_sys::esp_reset_reason() };

    match reason {
        esp_idf_sys::esp_reset_reason_t_ESP_RST_POWERON => "Power-on",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_EXT => "External pin",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SW => "Software reset",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_PANIC => "Panic",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_INT_WDT => "Interrupt watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_TASK_WDT => "Task watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_WDT => "Other watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => "Deep sleep",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_BROWNOUT => "Brownout",
        _ => "Unknown",
    }
}

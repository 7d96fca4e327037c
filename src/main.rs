use anyhow::{bail, Result};
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};
use esp_idf_sys as _; // Binstart
use log::{error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use esp32_ap_ota::boot::validate_boot;
use esp32_ap_ota::boot_diagnostics::{log_heap_stats, HeapDiagnostic};
use esp32_ap_ota::network::ap::AccessPoint;
use esp32_ap_ota::network::web_server::OtaWebServer;
use esp32_ap_ota::network::IdleWatchdog;
use esp32_ap_ota::ota::{EspImageStore, LogObserver, TransferEngine};
use esp32_ap_ota::system::{reset_reason, EspRestart};
use esp32_ap_ota::{config, logging};

// Generate ESP-IDF app descriptor
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

// Below this the probation boot counts as unhealthy
const MIN_FREE_HEAP_KB: u32 = 40;

fn main() -> Result<()> {
    esp_idf_svc::sys::link_patches();
    logging::init_logger(log::LevelFilter::Info)?;

    info!("ESP32 AP OTA {} - boot reason: {}", env!("CARGO_PKG_VERSION"), reset_reason());

    let nvs = EspDefaultNvsPartition::take()?;
    let mut store = EspImageStore::new(nvs.clone())?;

    // nothing network-facing exists until this resolves
    let outcome = match validate_boot(&mut store, &mut HeapDiagnostic::new(MIN_FREE_HEAP_KB), &mut EspRestart) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("BOOT: {} ({}), refusing to continue", e, e.kind());
            return Err(e.into());
        }
    };
    let Some(validated) = outcome.proceed() else {
        bail!("rollback restart returned");
    };
    info!("BOOT: running bank {}", validated.bank());

    let config = config::load_or_default(nvs.clone());
    if !logging::set_max_level_from_str(&config.log_level) {
        warn!("Ignoring unknown log level '{}'", config.log_level);
    }

    let mut engine = TransferEngine::new(store, validated);
    engine.set_observer(Box::new(LogObserver));
    let watch = engine.watch();
    let engine = Arc::new(Mutex::new(engine));

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let mut access_point = Some(AccessPoint::start(peripherals.modem, sys_loop, nvs, &config)?);
    let mut server = Some(OtaWebServer::start(engine, &config)?);
    log_heap_stats("update mode ready");

    let watchdog = match config.idle_timeout() {
        Some(timeout) => Some(IdleWatchdog::spawn(watch, timeout, Duration::from_secs(1))?),
        None => {
            info!("OTA idle timeout disabled");
            None
        }
    };

    loop {
        std::thread::sleep(Duration::from_secs(5));

        let expired = watchdog.as_ref().is_some_and(|w| w.expired());
        if expired && server.is_some() {
            info!("Update window closed, shutting down access point");
            drop(server.take());
            if let Some(ap) = access_point.take() {
                if let Err(e) = ap.stop() {
                    warn!("Failed to stop access point: {:?}", e);
                }
            }
        }
    }
}

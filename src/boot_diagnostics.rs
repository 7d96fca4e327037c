/// Post-boot health checks used to decide whether a freshly switched bank is kept
use log::info;
#[cfg(feature = "esp")]
use log::warn;

use crate::ota::BankId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticResult {
    pub ok: bool,
    pub reason: Option<String>,
}

impl DiagnosticResult {
    pub fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// Device-specific health check run once on the first boot of an unverified bank.
pub trait Diagnostic {
    fn run(&mut self, bank: BankId) -> DiagnosticResult;
}

impl<F> Diagnostic for F
where
    F: FnMut(BankId) -> DiagnosticResult,
{
    fn run(&mut self, bank: BankId) -> DiagnosticResult {
        self(bank)
    }
}

/// Getting far enough to run the validator counts as healthy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysHealthy;

impl Diagnostic for AlwaysHealthy {
    fn run(&mut self, bank: BankId) -> DiagnosticResult {
        info!("BOOT: Bank {} reached application start", bank);
        DiagnosticResult::ok()
    }
}

/// Fails the probation boot when the heap is already below a floor at startup.
#[cfg(feature = "esp")]
pub struct HeapDiagnostic {
    min_free_kb: u32,
}

#[cfg(feature = "esp")]
impl HeapDiagnostic {
    pub fn new(min_free_kb: u32) -> Self {
        Self { min_free_kb }
    }
}

#[cfg(feature = "esp")]
impl Diagnostic for HeapDiagnostic {
    fn run(&mut self, bank: BankId) -> DiagnosticResult {
        let free = unsafe { esp_idf_sys::esp_get_free_heap_size() } / 1024;
        let min = unsafe { esp_idf_sys::esp_get_minimum_free_heap_size() } / 1024;
        info!("BOOT: Bank {} heap - Free: {} KB, Min: {} KB", bank, free, min);

        if min < self.min_free_kb {
            warn!("BOOT: Critical min heap on bank {}: {} KB", bank, min);
            return DiagnosticResult::failed(format!(
                "minimum free heap {} KB below {} KB",
                min, self.min_free_kb
            ));
        }
        DiagnosticResult::ok()
    }
}

/// Monitor heap during runtime
#[cfg(feature = "esp")]
pub fn log_heap_stats(context: &str) {
    let free = unsafe { esp_idf_sys::esp_get_free_heap_size() };
    let min = unsafe { esp_idf_sys::esp_get_minimum_free_heap_size() };
    info!("HEAP [{}]: Free: {} KB, Min: {} KB", context, free / 1024, min / 1024);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_diagnostics() {
        let mut seen = None;
        let mut check = |bank: BankId| {
            seen = Some(bank);
            DiagnosticResult::failed("sensor bus dead")
        };
        let result = check.run(BankId::B);
        assert!(!result.ok);
        assert_eq!(result.reason.as_deref(), Some("sensor bus dead"));
        assert_eq!(seen, Some(BankId::B));
    }

    #[test]
    fn default_check_passes() {
        assert_eq!(AlwaysHealthy.run(BankId::A), DiagnosticResult::ok());
    }
}

// Boot Validator - settles probation of the running bank before anything else runs

use log::{error, info, warn};
use thiserror::Error;

use crate::boot_diagnostics::Diagnostic;
use crate::error::ErrorKind;
use crate::ota::{BankId, BankState, ImageStore, StoreError};

/// Proof that boot validation resolved without a rollback. Required to build a transfer engine.
#[derive(Debug)]
pub struct BootValidated {
    bank: BankId,
}

impl BootValidated {
    pub fn bank(&self) -> BankId {
        self.bank
    }

    #[cfg(test)]
    pub(crate) fn for_tests(bank: BankId) -> Self {
        Self { bank }
    }
}

#[derive(Debug)]
pub enum BootOutcome {
    /// Running bank was not on probation; nothing changed.
    Steady(BootValidated),
    /// Diagnostic passed; the running bank is now confirmed.
    Confirmed(BootValidated),
    /// The bootloader could not load `abandoned` and started the other bank.
    /// `abandoned` is now invalid and the boot target follows the running bank.
    Recovered { validated: BootValidated, abandoned: BankId },
    /// Diagnostic failed; the boot target was moved to `to` and a restart was requested.
    RolledBack { from: BankId, to: BankId, reason: String },
    /// Diagnostic failed but the other bank holds nothing bootable. The running bank stays unverified.
    NoFallback { validated: BootValidated, reason: String },
}

impl BootOutcome {
    /// The engine token, unless the device is on its way to a restart.
    pub fn proceed(self) -> Option<BootValidated> {
        match self {
            BootOutcome::Steady(token) | BootOutcome::Confirmed(token) => Some(token),
            BootOutcome::Recovered { validated, .. } => Some(validated),
            BootOutcome::NoFallback { validated, .. } => Some(validated),
            BootOutcome::RolledBack { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootError {
    #[error("cannot read boot state: {0}")]
    StateRead(#[source] StoreError),
    #[error("cannot persist state of bank {bank}: {source}")]
    StateWrite {
        bank: BankId,
        #[source]
        source: StoreError,
    },
    #[error("cannot repoint boot target to bank {bank}: {source}")]
    Repoint {
        bank: BankId,
        #[source]
        source: StoreError,
    },
}

impl BootError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::FatalBoot
    }
}

/// Reboots the device. On hardware this never returns.
pub trait Restart {
    fn restart(&mut self);
}

impl<F: FnMut()> Restart for F {
    fn restart(&mut self) {
        self()
    }
}

/// Runs once per boot, before networking or the transfer engine exist.
///
/// Any record I/O failure is returned as a [`BootError`]; the caller must not continue booting.
pub fn validate_boot<S, D, R>(store: &mut S, diagnostic: &mut D, restart: &mut R) -> Result<BootOutcome, BootError>
where
    S: ImageStore + ?Sized,
    D: Diagnostic + ?Sized,
    R: Restart + ?Sized,
{
    let boot = store.current_boot_bank().map_err(BootError::StateRead)?;
    let bank = store.running_bank().map_err(BootError::StateRead)?;

    let mut abandoned = None;
    if bank != boot {
        // the image selected for this boot never executed, so it cannot be judged by the diagnostic
        warn!("BOOT: Bank {} did not start, bootloader fell back to bank {}", boot, bank);
        store
            .set_boot_bank(bank)
            .map_err(|source| BootError::Repoint { bank, source })?;
        store
            .set_bank_state(boot, BankState::Invalid)
            .map_err(|source| BootError::StateWrite { bank: boot, source })?;
        abandoned = Some(boot);
    }

    let state = store.bank_state(bank).map_err(BootError::StateRead)?;

    if state != BankState::Unverified {
        info!("BOOT: Bank {} is {}, no validation needed", bank, state);
        let validated = BootValidated { bank };
        return Ok(match abandoned {
            Some(abandoned) => BootOutcome::Recovered { validated, abandoned },
            None => BootOutcome::Steady(validated),
        });
    }

    info!("BOOT: Bank {} is on probation, running diagnostic", bank);
    let result = diagnostic.run(bank);

    if result.ok {
        store
            .set_bank_state(bank, BankState::Confirmed)
            .map_err(|source| BootError::StateWrite { bank, source })?;
        info!("BOOT: Bank {} confirmed", bank);
        return Ok(BootOutcome::Confirmed(BootValidated { bank }));
    }

    let reason = result.reason.unwrap_or_else(|| "diagnostic failed".into());
    let fallback = bank.other();
    let fallback_state = store.bank_state(fallback).map_err(BootError::StateRead)?;

    if !fallback_state.is_bootable() {
        error!(
            "BOOT: Bank {} failed diagnostic ({}) but bank {} is {}; staying on bank {}",
            bank, reason, fallback, fallback_state, bank
        );
        return Ok(BootOutcome::NoFallback {
            validated: BootValidated { bank },
            reason,
        });
    }

    warn!("BOOT: Bank {} failed diagnostic: {}. Rolling back to bank {}", bank, reason, fallback);

    // repoint first so the boot target is never an invalid bank
    store
        .set_boot_bank(fallback)
        .map_err(|source| BootError::Repoint {
            bank: fallback,
            source,
        })?;
    store
        .set_bank_state(bank, BankState::Invalid)
        .map_err(|source| BootError::StateWrite { bank, source })?;

    error!("BOOT: Restarting into bank {} ({})", fallback, fallback_state);
    restart.restart();

    Ok(BootOutcome::RolledBack {
        from: bank,
        to: fallback,
        reason,
    })
}

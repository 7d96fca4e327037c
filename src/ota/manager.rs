// Transfer Engine - streams one untrusted upload into the non-running bank

use heapless::Vec as HVec;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use super::bank::{BankId, BankState};
use super::events::{TransferEvent, TransferObserver, TransferState};
use super::image::{self, HeaderError, MIN_HEADER_LEN};
use super::source::ChunkSource;
use super::store::{ImageStore, StoreError, WriteSession};
use super::watch::{CancelReason, SessionWatch};
use crate::boot::BootValidated;
use crate::error::ErrorKind;

const PROGRESS_LOG_STEP: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Pending,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("an upload is already in progress for bank {bank}")]
    SessionActive { bank: BankId },
    #[error("no upload in progress")]
    NoSession,
    #[error("bank {bank} is still on probation; overwriting bank {target} would destroy the only confirmed image")]
    FallbackUnverified { bank: BankId, target: BankId },
    #[error("invalid firmware format: {source}")]
    InvalidHeader {
        bank: BankId,
        received: usize,
        #[source]
        source: HeaderError,
    },
    #[error("no firmware data received")]
    EmptyUpload { bank: BankId },
    #[error("upload ended after {received} bytes, before the image header was complete")]
    Truncated { bank: BankId, received: usize },
    #[error("upload cancelled after {received} bytes: {reason}")]
    Cancelled {
        bank: BankId,
        received: usize,
        reason: CancelReason,
    },
    #[error("file reception failed after {received} bytes: {reason}")]
    Transport {
        bank: BankId,
        received: usize,
        reason: String,
    },
    #[error("{source}")]
    Store {
        bank: Option<BankId>,
        received: usize,
        #[source]
        source: StoreError,
    },
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::SessionActive { .. }
            | TransferError::NoSession
            | TransferError::FallbackUnverified { .. } => ErrorKind::Protocol,
            TransferError::InvalidHeader { .. }
            | TransferError::EmptyUpload { .. }
            | TransferError::Truncated { .. }
            | TransferError::Cancelled { .. } => ErrorKind::Input,
            TransferError::Transport { .. } => ErrorKind::Medium,
            TransferError::Store { source, .. } => source.kind(),
        }
    }

    pub fn bank(&self) -> Option<BankId> {
        match self {
            TransferError::SessionActive { bank }
            | TransferError::InvalidHeader { bank, .. }
            | TransferError::EmptyUpload { bank }
            | TransferError::Truncated { bank, .. }
            | TransferError::Cancelled { bank, .. }
            | TransferError::Transport { bank, .. } => Some(*bank),
            TransferError::FallbackUnverified { target, .. } => Some(*target),
            TransferError::Store { bank, .. } => *bank,
            TransferError::NoSession => None,
        }
    }

    pub fn bytes_received(&self) -> usize {
        match self {
            TransferError::InvalidHeader { received, .. }
            | TransferError::Truncated { received, .. }
            | TransferError::Cancelled { received, .. }
            | TransferError::Transport { received, .. }
            | TransferError::Store { received, .. } => *received,
            _ => 0,
        }
    }

    fn store(bank: Option<BankId>, received: usize, source: StoreError) -> Self {
        TransferError::Store {
            bank,
            received,
            source,
        }
    }
}

/// Successful commit: the bank is the new boot target and a restart will activate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub bank: BankId,
    pub bytes: usize,
}

/// Snapshot for status endpoints and UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateStatus {
    Idle,
    Receiving { bank: BankId, received: usize },
    Committed { bank: BankId, bytes: usize },
    Aborted { kind: ErrorKind, reason: String, bytes: usize },
    TimedOut { bytes: usize },
}

struct TransferSession {
    bank: BankId,
    write: WriteSession,
    received: usize,
    staged: HVec<u8, MIN_HEADER_LEN>,
    validated: bool,
}

pub struct TransferEngine<S: ImageStore> {
    store: S,
    session: Option<TransferSession>,
    state: TransferState,
    outcome: Option<SessionOutcome>,
    last_status: UpdateStatus,
    observer: Option<Box<dyn TransferObserver>>,
    watch: Arc<SessionWatch>,
}

impl<S: ImageStore> TransferEngine<S> {
    /// Only reachable once boot validation has resolved.
    pub fn new(store: S, _validated: BootValidated) -> Self {
        Self {
            store,
            session: None,
            state: TransferState::Idle,
            outcome: None,
            last_status: UpdateStatus::Idle,
            observer: None,
            watch: Arc::new(SessionWatch::new()),
        }
    }

    pub fn set_observer(&mut self, observer: Box<dyn TransferObserver>) {
        self.observer = Some(observer);
    }

    pub fn watch(&self) -> Arc<SessionWatch> {
        Arc::clone(&self.watch)
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// `None` before the first session; `Pending` while one is open.
    pub fn last_outcome(&self) -> Option<SessionOutcome> {
        self.outcome
    }

    pub fn is_receiving(&self) -> bool {
        self.session.is_some()
    }

    pub fn status(&self) -> UpdateStatus {
        match &self.session {
            Some(session) => UpdateStatus::Receiving {
                bank: session.bank,
                received: session.received,
            },
            None => self.last_status.clone(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Direct store access; must not be used to touch the bank of an open session.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Aborts any open session and hands the store back.
    pub fn into_store(mut self) -> S {
        self.cancel(CancelReason::Requested);
        self.store
    }

    /// Opens a write session on the non-running bank.
    pub fn begin(&mut self) -> Result<BankId, TransferError> {
        if let Some(session) = &self.session {
            return Err(TransferError::SessionActive { bank: session.bank });
        }

        let store_err = |e| TransferError::store(None, 0, e);
        let target = self.store.next_writable_bank().map_err(store_err)?;
        let boot = self.store.current_boot_bank().map_err(store_err)?;

        let boot_state = self.store.bank_state(boot).map_err(store_err)?;
        let target_state = self.store.bank_state(target).map_err(store_err)?;
        if boot_state == BankState::Unverified && target_state == BankState::Confirmed {
            warn!(
                "Refusing update: bank {} is unverified and bank {} holds the only confirmed image",
                boot, target
            );
            return Err(TransferError::FallbackUnverified { bank: boot, target });
        }

        let write = self
            .store
            .begin_write(target)
            .map_err(|e| TransferError::store(Some(target), 0, e))?;

        info!("Starting OTA update. Boot bank: {}, target bank: {}", boot, target);

        self.session = Some(TransferSession {
            bank: target,
            write,
            received: 0,
            staged: HVec::new(),
            validated: false,
        });
        self.outcome = Some(SessionOutcome::Pending);
        self.watch.started();
        self.emit(TransferEvent::Started { bank: target });
        self.set_state(TransferState::Receiving);

        Ok(target)
    }

    /// Feeds one transport chunk. Returns the cumulative byte count.
    ///
    /// Any failure aborts the session before returning.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<usize, TransferError> {
        let mut session = self.session.take().ok_or(TransferError::NoSession)?;

        match self.ingest(&mut session, chunk) {
            Ok(()) => {
                let received = session.received;
                self.session = Some(session);
                Ok(received)
            }
            Err(e) => Err(self.abort_session(session, e)),
        }
    }

    /// End of stream: commit if a validated image was written, abort otherwise.
    pub fn finish(&mut self) -> Result<TransferReport, TransferError> {
        let session = self.session.take().ok_or(TransferError::NoSession)?;
        let bank = session.bank;
        let received = session.received;

        if let Some(reason) = self.watch.take_cancel() {
            let e = TransferError::Cancelled {
                bank,
                received,
                reason,
            };
            return Err(self.abort_session(session, e));
        }
        if received == 0 {
            return Err(self.abort_session(session, TransferError::EmptyUpload { bank }));
        }
        if !session.validated {
            return Err(self.abort_session(session, TransferError::Truncated { bank, received }));
        }

        info!("Total firmware size received: {} bytes", received);
        self.set_state(TransferState::Committing);

        match self.store.finalize(session.write) {
            Ok(()) => {
                info!("Bank {} committed as boot target ({} bytes)", bank, received);
                self.outcome = Some(SessionOutcome::Committed);
                self.last_status = UpdateStatus::Committed {
                    bank,
                    bytes: received,
                };
                self.watch.finished();
                self.emit(TransferEvent::Committed {
                    bank,
                    bytes: received,
                });
                self.set_state(TransferState::Idle);
                Ok(TransferReport {
                    bank,
                    bytes: received,
                })
            }
            Err(e) => {
                // finalize already left the bank invalid and the boot target untouched
                self.set_state(TransferState::Aborting);
                let e = TransferError::store(Some(bank), received, e);
                self.conclude_aborted(&e);
                Err(e)
            }
        }
    }

    /// Explicit cancel or idle timeout. No-op (returns `None`) when nothing is in flight.
    pub fn cancel(&mut self, reason: CancelReason) -> Option<TransferError> {
        let session = self.session.take()?;
        let e = TransferError::Cancelled {
            bank: session.bank,
            received: session.received,
            reason,
        };
        Some(self.abort_session(session, e))
    }

    /// The transport reported an error instead of end-of-stream. No-op without a session.
    pub fn fail(&mut self, reason: impl Into<String>) -> Option<TransferError> {
        let session = self.session.take()?;
        let e = TransferError::Transport {
            bank: session.bank,
            received: session.received,
            reason: reason.into(),
        };
        Some(self.abort_session(session, e))
    }

    /// Drives a whole request: begin, every chunk, then commit or abort.
    pub fn run_upload<C: ChunkSource>(&mut self, source: &mut C) -> Result<TransferReport, TransferError> {
        self.begin()?;

        loop {
            match source.next_chunk() {
                Ok(Some(chunk)) => {
                    self.write_chunk(chunk)?;
                }
                Ok(None) => return self.finish(),
                Err(e) => {
                    error!("File reception failed: {}", e);
                    return Err(self
                        .fail(e.to_string())
                        .unwrap_or(TransferError::NoSession));
                }
            }
        }
    }

    fn ingest(&mut self, session: &mut TransferSession, chunk: &[u8]) -> Result<(), TransferError> {
        if let Some(reason) = self.watch.take_cancel() {
            return Err(TransferError::Cancelled {
                bank: session.bank,
                received: session.received,
                reason,
            });
        }
        if chunk.is_empty() {
            return Ok(());
        }

        let before = session.received;
        session.received += chunk.len();
        self.watch.touch(session.received);

        let body = if session.validated {
            chunk
        } else {
            match self.stage_header(session, chunk)? {
                Some(rest) => rest,
                None => return Ok(()),
            }
        };
        self.program(session, body)?;

        if before / PROGRESS_LOG_STEP != session.received / PROGRESS_LOG_STEP {
            info!("Received {} bytes", session.received);
        }
        self.emit(TransferEvent::Progress {
            bank: session.bank,
            received: session.received,
        });
        Ok(())
    }

    // Holds leading bytes in RAM until the header can be judged; nothing reaches flash before that.
    fn stage_header<'c>(
        &mut self,
        session: &mut TransferSession,
        chunk: &'c [u8],
    ) -> Result<Option<&'c [u8]>, TransferError> {
        let reject = |session: &TransferSession, source| TransferError::InvalidHeader {
            bank: session.bank,
            received: session.received,
            source,
        };

        if session.staged.is_empty() && !image::magic_matches(chunk[0]) {
            return Err(reject(&*session, HeaderError::BadMagic { found: chunk[0] }));
        }

        let take = (MIN_HEADER_LEN - session.staged.len()).min(chunk.len());
        // capacity is MIN_HEADER_LEN, take never exceeds what is left
        let _ = session.staged.extend_from_slice(&chunk[..take]);
        if session.staged.len() < MIN_HEADER_LEN {
            debug!("Staged {} header bytes", session.staged.len());
            return Ok(None);
        }

        let header = image::check_header(&session.staged).map_err(|e| reject(&*session, e))?;
        info!(
            "Firmware header validation passed: {} segments, entry 0x{:08x}, chip 0x{:04x}",
            header.segment_count, header.entry_addr, header.chip_id
        );
        debug!("First 10 bytes: {:02x?}", &session.staged[..10]);
        session.validated = true;
        self.emit(TransferEvent::HeaderAccepted {
            bank: session.bank,
            segments: header.segment_count,
            entry_addr: header.entry_addr,
        });

        let staged = core::mem::take(&mut session.staged);
        self.program(session, &staged)?;
        Ok(Some(&chunk[take..]))
    }

    fn program(&mut self, session: &mut TransferSession, bytes: &[u8]) -> Result<(), TransferError> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.store
            .write_chunk(&mut session.write, bytes)
            .map_err(|e| TransferError::store(Some(session.bank), session.received, e))
    }

    fn abort_session(&mut self, session: TransferSession, e: TransferError) -> TransferError {
        self.set_state(TransferState::Aborting);
        if let Err(abort_err) = self.store.abort(session.write) {
            // bank stays non-bootable either way; report the first failure
            error!("Abort of bank {} failed: {}", session.bank, abort_err);
        }
        self.conclude_aborted(&e);
        e
    }

    fn conclude_aborted(&mut self, e: &TransferError) {
        error!(
            "OTA aborted (bank {}, {} bytes): {}",
            e.bank().map(|b| b.to_string()).unwrap_or_else(|| "-".into()),
            e.bytes_received(),
            e
        );

        self.outcome = Some(SessionOutcome::Aborted);
        self.last_status = match e {
            TransferError::Cancelled {
                reason: CancelReason::IdleTimeout,
                received,
                ..
            } => UpdateStatus::TimedOut { bytes: *received },
            _ => UpdateStatus::Aborted {
                kind: e.kind(),
                reason: e.to_string(),
                bytes: e.bytes_received(),
            },
        };
        self.watch.finished();
        self.emit(TransferEvent::Aborted {
            bank: e.bank(),
            bytes: e.bytes_received(),
            kind: e.kind(),
            reason: e.to_string(),
        });
        self.set_state(TransferState::Idle);
    }

    fn set_state(&mut self, state: TransferState) {
        if self.state != state {
            self.state = state;
            self.emit(TransferEvent::State { state });
        }
    }

    fn emit(&mut self, event: TransferEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer.on_event(&event);
        }
    }
}

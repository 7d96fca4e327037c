// Transfer notifications for whoever hosts the engine (UI, telemetry, tests)

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::mpsc::Sender;

use super::bank::BankId;
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Idle,
    Receiving,
    Committing,
    Aborting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    State {
        state: TransferState,
    },
    Started {
        bank: BankId,
    },
    HeaderAccepted {
        bank: BankId,
        segments: u8,
        entry_addr: u32,
    },
    Progress {
        bank: BankId,
        received: usize,
    },
    Committed {
        bank: BankId,
        bytes: usize,
    },
    Aborted {
        bank: Option<BankId>,
        bytes: usize,
        kind: ErrorKind,
        reason: String,
    },
}

pub trait TransferObserver: Send {
    fn on_event(&mut self, event: &TransferEvent);
}

/// Channel sink; a dropped receiver just stops delivery.
impl TransferObserver for Sender<TransferEvent> {
    fn on_event(&mut self, event: &TransferEvent) {
        let _ = self.send(event.clone());
    }
}

/// Mirrors transitions into the log; progress only at debug level.
#[derive(Debug, Default)]
pub struct LogObserver;

impl TransferObserver for LogObserver {
    fn on_event(&mut self, event: &TransferEvent) {
        match event {
            TransferEvent::State { state } => debug!("OTA state -> {:?}", state),
            TransferEvent::Progress { received, .. } => debug!("OTA progress: {} bytes", received),
            TransferEvent::Started { bank } => info!("OTA: writing bank {}", bank),
            TransferEvent::HeaderAccepted { segments, .. } => info!("OTA: image header ok ({} segments)", segments),
            TransferEvent::Committed { bank, bytes } => info!("OTA: bank {} ready, {} bytes", bank, bytes),
            TransferEvent::Aborted { kind, reason, .. } => warn!("OTA: aborted ({}): {}", kind, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn channel_observer_forwards_and_survives_hangup() {
        let (mut tx, rx) = channel();
        tx.on_event(&TransferEvent::Started { bank: BankId::B });
        assert_eq!(rx.recv().unwrap(), TransferEvent::Started { bank: BankId::B });

        drop(rx);
        tx.on_event(&TransferEvent::State {
            state: TransferState::Idle,
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_string(&TransferEvent::Progress {
            bank: BankId::A,
            received: 65536,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"progress","bank":"A","received":65536}"#);
    }
}

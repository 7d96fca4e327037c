// HTTP-facing rendering of upload results

use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::ota::{BankId, CancelReason, StoreError, TransferError, TransferReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    RequestTimeout,
    Conflict,
    PayloadTooLarge,
    StorageFailure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::StorageFailure => "STORAGE_FAILURE",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::NotFound => 404,
            ErrorCode::RequestTimeout => 408,
            ErrorCode::Conflict => 409,
            ErrorCode::PayloadTooLarge => 413,
            ErrorCode::StorageFailure => 500,
        }
    }

    pub fn for_transfer(error: &TransferError) -> Self {
        match error {
            TransferError::SessionActive { .. }
            | TransferError::NoSession
            | TransferError::FallbackUnverified { .. } => ErrorCode::Conflict,
            TransferError::InvalidHeader { .. }
            | TransferError::EmptyUpload { .. }
            | TransferError::Truncated { .. } => ErrorCode::BadRequest,
            TransferError::Cancelled {
                reason: CancelReason::IdleTimeout,
                ..
            } => ErrorCode::RequestTimeout,
            TransferError::Cancelled { .. } => ErrorCode::Conflict,
            TransferError::Transport { .. } => ErrorCode::StorageFailure,
            TransferError::Store { source, .. } => match source {
                StoreError::CapacityExceeded { .. } => ErrorCode::PayloadTooLarge,
                StoreError::IncompleteImage { .. } => ErrorCode::BadRequest,
                StoreError::SessionAlreadyOpen { .. }
                | StoreError::UnknownSession { .. }
                | StoreError::BankIsBootTarget { .. } => ErrorCode::Conflict,
                _ => ErrorCode::StorageFailure,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bank: Option<BankId>,
    pub bytes_received: usize,
    pub request_id: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ApiError,
}

#[derive(Debug, Serialize)]
struct CommitBody {
    status: &'static str,
    bank: BankId,
    bytes: usize,
    rebooting: bool,
}

/// Status line plus JSON body, independent of the HTTP server in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub status: u16,
    pub body: String,
}

impl UploadResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::from_error(ErrorResponse {
            error: ApiError {
                code: code.as_str(),
                message: message.into(),
                bank: None,
                bytes_received: 0,
                request_id: generate_request_id(),
            },
        }, code)
    }

    fn from_error(body: ErrorResponse, code: ErrorCode) -> Self {
        let body = serde_json::to_string(&body)
            .unwrap_or_else(|_| format!(r#"{{"error":{{"code":"{}"}}}}"#, code.as_str()));
        Self {
            status: code.status(),
            body,
        }
    }
}

pub fn upload_response(result: &Result<TransferReport, TransferError>, rebooting: bool) -> UploadResponse {
    match result {
        Ok(report) => {
            let body = CommitBody {
                status: "committed",
                bank: report.bank,
                bytes: report.bytes,
                rebooting,
            };
            UploadResponse {
                status: 200,
                body: serde_json::to_string(&body).unwrap_or_else(|_| r#"{"status":"committed"}"#.into()),
            }
        }
        Err(e) => {
            let code = ErrorCode::for_transfer(e);
            UploadResponse::from_error(
                ErrorResponse {
                    error: ApiError {
                        code: code.as_str(),
                        message: e.to_string(),
                        bank: e.bank(),
                        bytes_received: e.bytes_received(),
                        request_id: generate_request_id(),
                    },
                },
                code,
            )
        }
    }
}

fn generate_request_id() -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u32;

    format!("req_{:08x}{:04x}", timestamp, count & 0xFFFF)
}

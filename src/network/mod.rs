pub mod response;
pub mod timeout;

#[cfg(feature = "esp")]
pub mod ap;
#[cfg(feature = "esp")]
pub mod web_server;

pub use response::{upload_response, ErrorCode, UploadResponse};
pub use timeout::{IdleWatchdog, WatchdogAction};

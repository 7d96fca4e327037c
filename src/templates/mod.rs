// HTML templates for web server

/// Firmware upload page served at `/`
pub const UPLOAD_PAGE: &str = include_str!("upload.html");

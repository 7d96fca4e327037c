use anyhow::Result;
use esp_idf_svc::http::server::{Configuration, EspHttpConnection, EspHttpServer, Request};
use esp_idf_svc::http::Method;
use embedded_svc::io::Read;
use esp_idf_svc::io::Write;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use crate::config::OtaConfig;
use crate::network::ap::PORTAL_URL;
use crate::network::response::{upload_response, ErrorCode, UploadResponse};
use crate::ota::{ChunkSource, ImageStore, SessionWatch, TransferEngine};
use crate::system::reset::schedule_restart;

/// Request body as a chunk stream; transport errors surface as their debug text.
pub struct HttpChunkSource<'r, R> {
    reader: &'r mut R,
    buffer: Vec<u8>,
}

impl<'r, R: Read> HttpChunkSource<'r, R> {
    pub fn new(reader: &'r mut R, buffer_size: usize) -> Self {
        Self {
            reader,
            buffer: vec![0u8; buffer_size.max(1)],
        }
    }
}

impl<'r, R: Read> ChunkSource for HttpChunkSource<'r, R> {
    type Error = String;

    fn next_chunk(&mut self) -> Result<Option<&[u8]>, String> {
        match self.reader.read(&mut self.buffer) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(&self.buffer[..n])),
            Err(e) => Err(format!("{:?}", e)),
        }
    }
}

pub struct OtaWebServer {
    _server: EspHttpServer<'static>,
}

impl OtaWebServer {
    pub fn start<S>(engine: Arc<Mutex<TransferEngine<S>>>, config: &OtaConfig) -> Result<Self>
    where
        S: ImageStore + Send + 'static,
    {
        let watch = engine
            .lock()
            .map_err(|_| anyhow::anyhow!("transfer engine lock poisoned"))?
            .watch();

        let mut server = EspHttpServer::new(&Configuration {
            stack_size: 10240,
            max_uri_handlers: 8,
            max_open_sockets: 4,
            uri_match_wildcard: true,
            lru_purge_enable: true,
            ..Default::default()
        })?;

        server.fn_handler("/", Method::Get, |req| {
            let mut response = req.into_response(
                200,
                Some("OK"),
                &[("Content-Type", "text/html; charset=utf-8")],
            )?;
            response.write_all(crate::templates::UPLOAD_PAGE.as_bytes())?;
            Ok::<(), anyhow::Error>(())
        })?;

        let upload_engine = engine.clone();
        let buffer_size = config.recv_buffer_size;
        let auto_reboot = config.auto_reboot;
        let restart_delay = Duration::from_millis(config.restart_delay_ms as u64);
        server.fn_handler("/ota_update", Method::Post, move |mut req| {
            // a second upload is rejected, never queued behind the first
            let mut engine = match upload_engine.try_lock() {
                Ok(engine) => engine,
                Err(TryLockError::WouldBlock) => {
                    log::warn!("Rejecting upload: another update is in progress");
                    let busy = UploadResponse::error(ErrorCode::Conflict, "an update is already in progress");
                    return send_json(req, busy.status, &busy.body);
                }
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            };

            if let Some(len) = req.header("Content-Length") {
                log::info!("OTA upload started, announced size: {} bytes", len);
            }

            let result = {
                let mut source = HttpChunkSource::new(&mut req, buffer_size);
                engine.run_upload(&mut source)
            };
            drop(engine);

            let rebooting = result.is_ok() && auto_reboot;
            let response = upload_response(&result, rebooting);
            send_json(req, response.status, &response.body)?;

            if rebooting {
                log::info!("Firmware update complete, rebooting in {} ms", restart_delay.as_millis());
                schedule_restart(restart_delay)?;
            }
            Ok(())
        })?;

        let status_engine = engine;
        let status_watch: Arc<SessionWatch> = watch;
        server.fn_handler("/api/ota/status", Method::Get, move |req| {
            let body = match status_engine.try_lock() {
                Ok(engine) => serde_json::to_string(&engine.status())?,
                // engine is busy streaming; the shared watch still knows the byte count
                Err(_) => format!(
                    r#"{{"status":"receiving","received":{}}}"#,
                    status_watch.received()
                ),
            };
            send_json(req, 200, &body)
        })?;

        server.fn_handler("/api/*", Method::Get, |req| {
            let missing = UploadResponse::error(ErrorCode::NotFound, format!("no such endpoint: {}", req.uri()));
            send_json(req, missing.status, &missing.body)
        })?;

        server.fn_handler("/*", Method::Get, |req| {
            req.into_response(302, Some("Found"), &[("Location", PORTAL_URL)])?
                .flush()?;
            Ok::<(), anyhow::Error>(())
        })?;

        log::info!("OTA web server listening on port 80");
        Ok(Self { _server: server })
    }
}

fn send_json(req: Request<&mut EspHttpConnection<'_>>, status: u16, body: &str) -> Result<()> {
    let mut response = req.into_response(
        status,
        None,
        &[("Content-Type", "application/json"), ("Connection", "close")],
    )?;
    response.write_all(body.as_bytes())?;
    Ok(())
}

//! Live-view and control HTTP surface.
//!
//! Plain `TcpListener`, one thread per connection. Routes:
//! - `GET /health`, `GET /cameras`, `GET /detections?limit=`
//! - `GET /frame?camera_id=` (single JPEG), `GET /video_feed?camera_id=` (MJPEG)
//! - `POST /cameras/start_all`, `POST /cameras/stop_all`
//! - `POST /cameras/start?camera_id=`, `POST /cameras/stop?camera_id=`
//! - `POST /tracking/reset`

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::fleet::FleetOrchestrator;
use crate::storage::SharedRecordStore;

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_DETECTIONS_LIMIT: usize = 50;
const MAX_DETECTIONS_LIMIT: usize = 1000;
const LIVE_JPEG_QUALITY: u8 = 80;
const MJPEG_BOUNDARY: &str = "frame";
const MJPEG_FRAME_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Shared state handed to every connection thread.
#[derive(Clone)]
struct ApiContext {
    fleet: Arc<FleetOrchestrator>,
    records: SharedRecordStore,
    shutdown: Arc<AtomicBool>,
}

pub struct ApiServer {
    cfg: ApiConfig,
    fleet: Arc<FleetOrchestrator>,
    records: SharedRecordStore,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, fleet: Arc<FleetOrchestrator>, records: SharedRecordStore) -> Self {
        Self {
            cfg,
            fleet,
            records,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = ApiContext {
            fleet: self.fleet,
            records: self.records,
            shutdown: shutdown.clone(),
        };
        let join = std::thread::Builder::new()
            .name("api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, ctx) {
                    log::error!("live-view api stopped: {}", err);
                }
            })
            .map_err(|e| anyhow!("failed to spawn api thread: {}", e))?;

        log::info!("live-view api listening on http://{}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, ctx: ApiContext) -> Result<()> {
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name("api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx) {
                            log::warn!("api request failed: {}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("api connection dropped: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, ctx: &ApiContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    let route = (request.method.as_str(), request.path.as_str());
    match route {
        ("GET", "/health") => {
            let body = serde_json::json!({
                "status": "ok",
                "cameras": ctx.fleet.camera_ids().len(),
            });
            write_json(&mut stream, 200, &body)
        }
        ("GET", "/cameras") => write_json(&mut stream, 200, &ctx.fleet.status()),
        ("GET", "/detections") => {
            let limit = request
                .query("limit")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(DEFAULT_DETECTIONS_LIMIT)
                .min(MAX_DETECTIONS_LIMIT);
            let rows = {
                let mut store = ctx
                    .records
                    .lock()
                    .map_err(|_| anyhow!("record store lock poisoned"))?;
                match request.query("camera_id") {
                    Some(camera) => store.recent_for_camera(&camera, limit)?,
                    None => store.recent(limit)?,
                }
            };
            write_json(&mut stream, 200, &rows)
        }
        ("GET", "/frame") => {
            let Some(camera) = request.query("camera_id") else {
                return write_error(&mut stream, 400, "missing camera_id");
            };
            match ctx.fleet.live_jpeg(&camera, LIVE_JPEG_QUALITY) {
                Ok(Some(jpeg)) => write_response(&mut stream, 200, "image/jpeg", &jpeg),
                Ok(None) => write_error(&mut stream, 404, "no frame yet"),
                Err(err) => write_error(&mut stream, 404, &err.to_string()),
            }
        }
        ("GET", "/video_feed") => {
            let Some(camera) = request.query("camera_id") else {
                return write_error(&mut stream, 400, "missing camera_id");
            };
            if let Err(err) = ctx.fleet.live_frame(&camera) {
                return write_error(&mut stream, 404, &err.to_string());
            }
            stream_mjpeg(&mut stream, ctx, &camera)
        }
        ("POST", "/cameras/start_all") => {
            let started = ctx.fleet.start_all()?;
            write_json(&mut stream, 200, &serde_json::json!({ "started": started }))
        }
        ("POST", "/cameras/stop_all") => {
            ctx.fleet.stop_all()?;
            write_json(&mut stream, 200, &serde_json::json!({ "status": "stopped" }))
        }
        ("POST", "/cameras/start") | ("POST", "/cameras/stop") => {
            let Some(camera) = request.query("camera_id") else {
                return write_error(&mut stream, 400, "missing camera_id");
            };
            let result = if request.path.ends_with("start") {
                ctx.fleet.start(&camera)
            } else {
                ctx.fleet.stop(&camera)
            };
            match result {
                Ok(()) => write_json(&mut stream, 200, &ctx.fleet.camera_status(&camera)?),
                Err(err) => write_error(&mut stream, 404, &err.to_string()),
            }
        }
        ("POST", "/tracking/reset") => {
            ctx.fleet.reset_all_tracking()?;
            write_json(&mut stream, 200, &serde_json::json!({ "status": "reset" }))
        }
        (_, "/health")
        | (_, "/cameras")
        | (_, "/detections")
        | (_, "/frame")
        | (_, "/video_feed")
        | (_, "/tracking/reset") => write_error(&mut stream, 405, "method not allowed"),
        _ => write_error(&mut stream, 404, "not found"),
    }
}

/// Push the camera's live frame as `multipart/x-mixed-replace` until the client goes
/// away or the server shuts down.
fn stream_mjpeg(stream: &mut TcpStream, ctx: &ApiContext, camera: &str) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\n\
         Cache-Control: no-store\r\nConnection: close\r\n\r\n",
        MJPEG_BOUNDARY
    );
    stream.write_all(header.as_bytes())?;

    let mut last_sequence = None;
    while !ctx.shutdown.load(Ordering::SeqCst) {
        if let Some(frame) = ctx.fleet.live_frame(camera)? {
            if last_sequence != Some(frame.sequence) {
                last_sequence = Some(frame.sequence);
                let jpeg = frame.encode_jpeg(LIVE_JPEG_QUALITY)?;
                let part = format!(
                    "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                    MJPEG_BOUNDARY,
                    jpeg.len()
                );
                // A write error means the viewer disconnected.
                if stream.write_all(part.as_bytes()).is_err()
                    || stream.write_all(&jpeg).is_err()
                    || stream.write_all(b"\r\n").is_err()
                {
                    break;
                }
            }
        }
        std::thread::sleep(MJPEG_FRAME_INTERVAL);
    }
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    HttpRequest::parse_request_line(request_line)
}

fn write_json<T: Serialize>(stream: &mut TcpStream, status: u16, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_error(stream: &mut TcpStream, status: u16, message: &str) -> Result<()> {
    write_json(stream, status, &serde_json::json!({ "error": message }))
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug, PartialEq)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
}

impl HttpRequest {
    fn parse_request_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
        let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (raw_path, HashMap::new()),
        };
        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            query,
        })
    }

    fn query(&self, key: &str) -> Option<String> {
        self.query.get(key).filter(|v| !v.is_empty()).cloned()
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

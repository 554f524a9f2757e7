//! Read-only debug HTTP surface: `/healthz`, `/status`, `/player`, `/field`.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use land_node::{FieldError, LandStatusHandle};
use land_proto::{FieldTile, Position};
use serde::Serialize;
use tracing::{debug, warn};

const ACCEPT_IDLE: Duration = Duration::from_millis(20);
const READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct StatusServer {
    local_addr: SocketAddr,
    stop_tx: Sender<()>,
    error_rx: Receiver<String>,
    join_handle: Option<JoinHandle<()>>,
}

impl StatusServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Reports an accept-loop failure or an unexpected exit.
    pub fn poll_error(&mut self) -> Option<String> {
        match self.error_rx.try_recv() {
            Ok(err) => Some(format!("status server failed: {err}")),
            Err(TryRecvError::Disconnected) if self.join_handle.is_some() => {
                Some("status server exited unexpectedly".to_string())
            }
            Err(_) => None,
        }
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn start_status_server(bind: &str, handle: LandStatusHandle) -> Result<StatusServer, String> {
    let listener = TcpListener::bind(bind)
        .map_err(|err| format!("failed to bind status server at {bind}: {err}"))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| format!("failed to read status server address: {err}"))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| format!("failed to set status server listener nonblocking: {err}"))?;

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let (error_tx, error_rx) = mpsc::channel::<String>();
    let join_handle = thread::Builder::new()
        .name("land-status".to_string())
        .spawn(move || {
            if let Err(err) = run_status_server_loop(listener, stop_rx, handle) {
                let _ = error_tx.send(err);
            }
        })
        .map_err(|err| format!("failed to spawn status server: {err}"))?;

    Ok(StatusServer {
        local_addr,
        stop_tx,
        error_rx,
        join_handle: Some(join_handle),
    })
}

fn run_status_server_loop(
    listener: TcpListener,
    stop_rx: Receiver<()>,
    handle: LandStatusHandle,
) -> Result<(), String> {
    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return Ok(()),
            Err(TryRecvError::Empty) => {}
        }

        match listener.accept() {
            Ok((stream, _addr)) => {
                let handle = handle.clone();
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &handle) {
                        warn!(error = %err, "status connection failed");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE);
            }
            Err(err) => return Err(format!("status server accept failed: {err}")),
        }
    }
}

fn handle_connection(mut stream: TcpStream, handle: &LandStatusHandle) -> Result<(), String> {
    stream
        .set_nonblocking(false)
        .map_err(|err| format!("failed to set blocking mode: {err}"))?;
    stream
        .set_read_timeout(Some(READ_TIMEOUT))
        .map_err(|err| format!("failed to set read timeout: {err}"))?;

    let mut buffer = [0_u8; 8192];
    let bytes = stream
        .read(&mut buffer)
        .map_err(|err| format!("failed to read request: {err}"))?;
    if bytes == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..bytes]);
    let mut parts = request.lines().next().unwrap_or_default().split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();
    let response = route(method, target, handle);
    debug!(method, target, status = response.status, "status request");
    write_json_response(&mut stream, &response)
        .map_err(|err| format!("failed to write {} response: {err}", response.status))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Response {
    status: u16,
    body: Vec<u8>,
    head_only: bool,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec_pretty(value) {
            Ok(body) => Self {
                status,
                body,
                head_only: false,
            },
            Err(err) => Self::error(500, &format!("encode response failed: {err}")),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": message }).to_string().into_bytes(),
            head_only: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct PlayerResponse {
    id: String,
    #[serde(flatten)]
    position: Position,
}

#[derive(Debug, Serialize)]
struct FieldResponse {
    row: usize,
    col: usize,
    #[serde(flatten)]
    tile: FieldTile,
}

fn route(method: &str, target: &str, handle: &LandStatusHandle) -> Response {
    if method.is_empty() {
        return Response::error(400, "bad request");
    }
    let head_only = method.eq_ignore_ascii_case("HEAD");
    if !method.eq_ignore_ascii_case("GET") && !head_only {
        return Response::error(405, "method not allowed");
    }

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let query = parse_query(query);
    let mut response = match path {
        "/healthz" => Response::json(200, &serde_json::json!({ "ok": true })),
        "/status" => Response::json(200, &handle.snapshot()),
        "/player" => player_response(&query, handle),
        "/field" => field_response(&query, handle),
        _ => Response::error(404, "not found"),
    };
    response.head_only = head_only;
    response
}

fn player_response(query: &BTreeMap<String, String>, handle: &LandStatusHandle) -> Response {
    let Some(id) = query.get("id").filter(|id| !id.is_empty()) else {
        return Response::error(400, "id is required");
    };
    match handle.player(id) {
        Some(position) => Response::json(
            200,
            &PlayerResponse {
                id: id.clone(),
                position,
            },
        ),
        None => Response::error(404, &format!("player {id} not found")),
    }
}

fn field_response(query: &BTreeMap<String, String>, handle: &LandStatusHandle) -> Response {
    let row = match query_index(query, "row") {
        Ok(row) => row,
        Err(response) => return response,
    };
    let col = match query_index(query, "col") {
        Ok(col) => col,
        Err(response) => return response,
    };
    match handle.field_tile(row, col) {
        Ok(Some(tile)) => Response::json(200, &FieldResponse { row, col, tile }),
        Ok(None) => Response::error(404, &format!("tile {row}:{col} not loaded")),
        Err(err @ FieldError::OutOfRange { .. }) => Response::error(400, &err.to_string()),
        Err(err) => Response::error(500, &err.to_string()),
    }
}

/// Missing or empty parameters read as 0.
fn query_index(query: &BTreeMap<String, String>, key: &str) -> Result<usize, Response> {
    match query.get(key).map(String::as_str) {
        None | Some("") => Ok(0),
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|err| Response::error(400, &format!("{key} is {err}"))),
    }
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.to_string(), value.to_string())
        })
        .collect()
}

fn write_json_response(stream: &mut TcpStream, response: &Response) -> std::io::Result<()> {
    let status_text = match response.status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    let headers = format!(
        "HTTP/1.1 {} {status_text}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        response.body.len()
    );
    stream.write_all(headers.as_bytes())?;
    if !response.head_only {
        stream.write_all(&response.body)?;
    }
    stream.flush()
}

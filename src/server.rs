// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Rejection, StoreError};
use crate::lifecycle::LifecycleController;
use crate::protocol::{QueryRequest, QueryResponse, SensorMessage, SensorReply};

/// Sensor and query listeners in front of a running store
pub struct StoreServer {
    controller: Arc<LifecycleController>,
    sensor_listener: TcpListener,
    query_listener: TcpListener,
    max_line_bytes: usize,
}

impl StoreServer {
    /// Bind both listeners at the configured addresses
    pub async fn bind(controller: Arc<LifecycleController>) -> Result<Self> {
        let server_config = controller.config().server.clone();

        let sensor_listener = TcpListener::bind(&server_config.sensor_listen)
            .await
            .with_context(|| {
                format!("Failed to bind sensor listener on {}", server_config.sensor_listen)
            })?;
        let query_listener = TcpListener::bind(&server_config.query_listen)
            .await
            .with_context(|| {
                format!("Failed to bind query listener on {}", server_config.query_listen)
            })?;

        info!("Sensor interface listening on {}", sensor_listener.local_addr()?);
        info!("Query interface listening on {}", query_listener.local_addr()?);

        Ok(Self {
            controller,
            sensor_listener,
            query_listener,
            max_line_bytes: server_config.max_line_bytes,
        })
    }

    pub fn sensor_addr(&self) -> Result<SocketAddr> {
        Ok(self.sensor_listener.local_addr()?)
    }

    pub fn query_addr(&self) -> Result<SocketAddr> {
        Ok(self.query_listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips to true or its sender goes away.
    /// Each connection is served on its own task.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.sensor_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let controller = self.controller.clone();
                        let max_line_bytes = self.max_line_bytes;
                        tokio::spawn(async move {
                            let result =
                                handle_sensor(controller, stream, peer, max_line_bytes).await;
                            if let Err(e) = result {
                                error!("Error on sensor connection {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept sensor connection: {}", e),
                },
                accepted = self.query_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let controller = self.controller.clone();
                        let max_line_bytes = self.max_line_bytes;
                        tokio::spawn(async move {
                            let result =
                                handle_query(controller, stream, peer, max_line_bytes).await;
                            if let Err(e) = result {
                                error!("Error on query connection {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept query connection: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Listeners closed");
        Ok(())
    }
}

enum Line {
    Complete,
    TooLong,
    Eof,
}

/// Read one newline-terminated line of at most `max` bytes into `buf`.
/// The remainder of a longer line is discarded.
async fn read_line_bounded<R>(
    reader: &mut BufReader<R>,
    buf: &mut Vec<u8>,
    max: usize,
) -> Result<Line>
where
    R: AsyncRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader).take(max as u64 + 1).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if n <= max || buf.ends_with(b"\n") {
        return Ok(Line::Complete);
    }

    buf.clear();
    loop {
        let (consumed, done) = {
            let available = reader.fill_buf().await?;
            match available.iter().position(|b| *b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), available.is_empty()),
            }
        };
        reader.consume(consumed);
        if done {
            return Ok(Line::TooLong);
        }
    }
}

async fn write_reply<W, T>(writer: &mut W, reply: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(reply)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Per-connection sensor state
struct SensorConnection {
    peer: String,
    default_sensor: Option<String>,
    sessions: HashMap<String, Uuid>,
    accepted: u64,
    rejected: u64,
    said_bye: bool,
}

async fn handle_sensor(
    controller: Arc<LifecycleController>,
    stream: TcpStream,
    peer: SocketAddr,
    max_line_bytes: usize,
) -> Result<()> {
    debug!("Sensor connection from {}", peer);
    let mut conn = SensorConnection {
        peer: peer.to_string(),
        default_sensor: None,
        sessions: HashMap::new(),
        accepted: 0,
        rejected: 0,
        said_bye: false,
    };

    let result = sensor_loop(&controller, stream, &mut conn, max_line_bytes).await;

    if !conn.said_bye {
        for (sensor_id, session_id) in conn.sessions.drain() {
            controller.sessions().drop_session(&sensor_id, session_id);
        }
    }
    debug!(
        "Sensor connection {} ended: {} accepted, {} rejected",
        peer, conn.accepted, conn.rejected
    );
    result
}

async fn sensor_loop(
    controller: &LifecycleController,
    stream: TcpStream,
    conn: &mut SensorConnection,
    max_line_bytes: usize,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        match read_line_bounded(&mut reader, &mut line, max_line_bytes).await? {
            Line::Eof => return Ok(()),
            Line::TooLong => {
                warn!("Sensor {} sent a line over {} bytes", conn.peer, max_line_bytes);
                let reply = SensorReply::error(format!("line exceeds {} bytes", max_line_bytes));
                write_reply(&mut write_half, &reply).await?;
                continue;
            }
            Line::Complete => {}
        }
        let text = match std::str::from_utf8(&line) {
            Ok(text) => text.trim(),
            Err(e) => {
                warn!("Sensor {} sent a line that is not UTF-8", conn.peer);
                let reply = SensorReply::error(format!("invalid message: {}", e));
                write_reply(&mut write_half, &reply).await?;
                continue;
            }
        };
        if text.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<SensorMessage>(text) {
            Ok(message) => sensor_message(controller, conn, message).await,
            Err(e) => SensorReply::error(format!("invalid message: {}", e)),
        };
        write_reply(&mut write_half, &reply).await?;

        if conn.said_bye {
            return Ok(());
        }
    }
}

async fn sensor_message(
    controller: &LifecycleController,
    conn: &mut SensorConnection,
    message: SensorMessage,
) -> SensorReply {
    let registry = controller.sessions();

    match message {
        SensorMessage::Hello { sensor_id } => {
            if sensor_id.trim().is_empty() {
                return SensorReply::rejected(Rejection::EmptySensorId);
            }
            let session_id = registry.open(&sensor_id, Some(&conn.peer));
            conn.sessions.insert(sensor_id.clone(), session_id);
            conn.default_sensor = Some(sensor_id);
            SensorReply::Ready { session_id }
        }

        SensorMessage::Capture(capture) => {
            let (explicit, raw) = capture.into_raw();
            let sensor_id = explicit.or_else(|| conn.default_sensor.clone()).unwrap_or_default();
            if !sensor_id.trim().is_empty() && !conn.sessions.contains_key(&sensor_id) {
                let session_id = registry.touch(&sensor_id, Some(&conn.peer));
                conn.sessions.insert(sensor_id.clone(), session_id);
            }

            // Runs to completion even if the peer has already gone away
            match controller.gateway().submit(&sensor_id, raw).await {
                Ok(record_id) => {
                    registry.record_accepted(&sensor_id);
                    conn.accepted += 1;
                    SensorReply::Accepted { record_id }
                }
                Err(StoreError::Rejected(rejection)) => {
                    registry.record_rejected(&sensor_id);
                    conn.rejected += 1;
                    SensorReply::rejected(rejection)
                }
                Err(e) => {
                    conn.rejected += 1;
                    SensorReply::error(e.to_string())
                }
            }
        }

        SensorMessage::Bye => {
            for (sensor_id, session_id) in conn.sessions.drain() {
                registry.close(&sensor_id, session_id);
            }
            conn.said_bye = true;
            SensorReply::Goodbye {
                accepted: conn.accepted,
                rejected: conn.rejected,
            }
        }
    }
}

async fn handle_query(
    controller: Arc<LifecycleController>,
    stream: TcpStream,
    peer: SocketAddr,
    max_line_bytes: usize,
) -> Result<()> {
    debug!("Query connection from {}", peer);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        match read_line_bounded(&mut reader, &mut line, max_line_bytes).await? {
            Line::Eof => return Ok(()),
            Line::TooLong => {
                let reply = QueryResponse::error(format!("line exceeds {} bytes", max_line_bytes));
                write_reply(&mut write_half, &reply).await?;
                continue;
            }
            Line::Complete => {}
        }
        let text = match std::str::from_utf8(&line) {
            Ok(text) => text.trim(),
            Err(e) => {
                let reply = QueryResponse::error(format!("invalid request: {}", e));
                write_reply(&mut write_half, &reply).await?;
                continue;
            }
        };
        if text.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<QueryRequest>(text) {
            Ok(request) => query_request(&controller, request).await,
            Err(e) => QueryResponse::error(format!("invalid request: {}", e)),
        };
        write_reply(&mut write_half, &response).await?;
    }
}

async fn query_request(controller: &LifecycleController, request: QueryRequest) -> QueryResponse {
    match request {
        QueryRequest::Get { record_id } => match controller.query().get(record_id).await {
            Ok(record) => QueryResponse::Record { record },
            Err(e) => QueryResponse::error(e.to_string()),
        },
        QueryRequest::Status => QueryResponse::Status(controller.status()),
        overlap => {
            let Some(query) = overlap.as_overlap() else {
                return QueryResponse::error("unsupported request");
            };
            match controller.query().run(&query).await {
                Ok(records) => QueryResponse::records(records),
                Err(e) => {
                    warn!("Overlap query failed: {}", e);
                    QueryResponse::error(e.to_string())
                }
            }
        }
    }
}

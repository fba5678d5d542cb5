//! Newline-delimited JSON transport for devices.
//!
//! Each line is one request tagged by `op`; each request gets exactly one response line.
//! A connection that sent `subscribe` additionally receives `{"command":...}` lines
//! whenever the engine publishes a command for that device.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineError, Entity};
use crate::limits::MAX_FRAME_LEN;
use crate::model::{DeviceCommand, Ms};
use crate::observability;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("encode: {0}")]
    Json(#[from] serde_json::Error),
}

/// One inbound line, or the marker for a line that blew the length limit.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    TooLong,
}

/// `LinesCodec` that reports an over-long line as a frame instead of an error, so the
/// stream keeps going: the codec discards the rest of that line on its own.
pub struct DeviceCodec {
    lines: LinesCodec,
}

impl DeviceCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_FRAME_LEN),
        }
    }
}

impl Default for DeviceCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn frame(result: Result<Option<String>, LinesCodecError>) -> Result<Option<Frame>, LinesCodecError> {
    match result {
        Ok(line) => Ok(line.map(Frame::Line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::TooLong)),
        Err(e) => Err(e),
    }
}

impl Decoder for DeviceCodec {
    type Item = Frame;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, LinesCodecError> {
        frame(self.lines.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, LinesCodecError> {
        frame(self.lines.decode_eof(buf))
    }
}

impl Encoder<String> for DeviceCodec {
    type Error = LinesCodecError;

    fn encode(&mut self, line: String, buf: &mut BytesMut) -> Result<(), LinesCodecError> {
        self.lines.encode(line, buf)
    }
}

/// A device request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    ReportStatus {
        resource_id: String,
        status: String,
        timestamp: Ms,
        #[serde(default)]
        first_connection: bool,
    },
    AutoRelease {
        resource_id: String,
        #[serde(default)]
        reason: Option<String>,
        timestamp: Ms,
    },
    GetStatus {
        resource_id: String,
    },
    Subscribe {
        resource_id: String,
    },
}

impl Request {
    fn op(&self) -> &'static str {
        match self {
            Request::ReportStatus { .. } => "report_status",
            Request::AutoRelease { .. } => "auto_release",
            Request::GetStatus { .. } => "get_status",
            Request::Subscribe { .. } => "subscribe",
        }
    }
}

fn ok(mut body: Value) -> Value {
    if let Value::Object(map) = &mut body {
        map.insert("ok".into(), Value::Bool(true));
    }
    body
}

fn error_response(e: &EngineError) -> Value {
    json!({ "ok": false, "kind": e.kind(), "error": e.to_string() })
}

/// Run one request against the engine. `subscription` is replaced on `subscribe`.
pub async fn execute(
    engine: &Engine,
    request: Request,
    subscription: &mut Option<broadcast::Receiver<DeviceCommand>>,
) -> Result<Value, EngineError> {
    match request {
        Request::ReportStatus {
            resource_id,
            status,
            timestamp,
            first_connection,
        } => {
            let report = engine
                .report_status(&resource_id, &status, timestamp, first_connection)
                .await?;
            Ok(ok(json!({
                "resource_id": resource_id,
                "previous": report.previous,
                "status": report.current,
                "auto_activated": report.auto_activated,
            })))
        }
        Request::AutoRelease {
            resource_id,
            reason,
            timestamp,
        } => {
            let closed = engine
                .process_auto_release(&resource_id, reason.as_deref(), timestamp)
                .await?;
            let ids: Vec<String> = closed.iter().map(|r| r.id.to_string()).collect();
            Ok(ok(json!({ "resource_id": resource_id, "closed": ids })))
        }
        Request::GetStatus { resource_id } => {
            let view = engine.get_status(&resource_id).await?;
            Ok(ok(serde_json::to_value(view).map_err(|e| {
                EngineError::InvalidState(format!("failed to encode status: {e}"))
            })?))
        }
        Request::Subscribe { resource_id } => {
            if !engine.device_exists(&resource_id) {
                return Err(EngineError::NotFound {
                    entity: Entity::Resource,
                    id: resource_id,
                });
            }
            *subscription = Some(engine.notify.subscribe(&resource_id));
            debug!(device = %resource_id, "device subscribed to commands");
            Ok(ok(json!({ "subscribed": resource_id })))
        }
    }
}

/// Parse and run one line, always producing a response.
async fn handle_line(
    engine: &Engine,
    line: &str,
    subscription: &mut Option<broadcast::Receiver<DeviceCommand>>,
) -> Value {
    let request = match serde_json::from_str::<Request>(line) {
        Ok(r) => r,
        Err(e) => {
            metrics::counter!(observability::GATEWAY_REQUESTS_TOTAL, "op" => "unknown", "status" => "invalid_argument")
                .increment(1);
            return error_response(&EngineError::InvalidArgument(format!("malformed request: {e}")));
        }
    };
    let op = request.op();
    let result = execute(engine, request, subscription).await;
    metrics::counter!(observability::GATEWAY_REQUESTS_TOTAL, "op" => op, "status" => observability::status_label(&result))
        .increment(1);
    match result {
        Ok(body) => body,
        Err(e) => {
            debug!(op, "request failed: {e}");
            error_response(&e)
        }
    }
}

async fn next_command(
    subscription: &mut Option<broadcast::Receiver<DeviceCommand>>,
) -> Result<DeviceCommand, RecvError> {
    match subscription {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Serve one device connection until it closes or `cancel` fires.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    cancel: CancellationToken,
) -> Result<(), GatewayError> {
    let mut framed = Framed::new(socket, DeviceCodec::new());
    let mut subscription: Option<broadcast::Receiver<DeviceCommand>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framed.next() => {
                let response = match frame {
                    None => break,
                    Some(Ok(Frame::Line(line))) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        handle_line(&engine, &line, &mut subscription).await
                    }
                    Some(Ok(Frame::TooLong)) => {
                        warn!("request line over {MAX_FRAME_LEN} bytes discarded");
                        metrics::counter!(observability::GATEWAY_REQUESTS_TOTAL, "op" => "unknown", "status" => "invalid_argument")
                            .increment(1);
                        error_response(&EngineError::InvalidArgument("request too long".into()))
                    }
                    Some(Err(e)) => return Err(e.into()),
                };
                framed.send(serde_json::to_string(&response)?).await?;
            }
            command = next_command(&mut subscription) => {
                match command {
                    Ok(command) => framed.send(serde_json::to_string(&command)?).await?,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "device fell behind on commands");
                    }
                    Err(RecvError::Closed) => {
                        debug!("command channel closed");
                        subscription = None;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Accept loop. At most `max_connections` connections are served at once; extra
/// ones are dropped. On cancel, stops accepting and waits up to `drain` for open
/// connections to finish.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<Engine>,
    max_connections: usize,
    drain: Duration,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(max_connections));

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                debug!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = process_connection(socket, engine, cancel).await {
                        error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = cancel.cancelled() => {
                info!("stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(drain);
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_op() {
        let r: Request = serde_json::from_str(
            r#"{"op":"report_status","resource_id":"lab-01","status":"LIVRE","timestamp":1700000000000,"first_connection":true}"#,
        )
        .unwrap();
        assert_eq!(
            r,
            Request::ReportStatus {
                resource_id: "lab-01".into(),
                status: "LIVRE".into(),
                timestamp: 1_700_000_000_000,
                first_connection: true,
            }
        );

        let r: Request =
            serde_json::from_str(r#"{"op":"auto_release","resource_id":"lab-01","timestamp":5}"#).unwrap();
        assert_eq!(r.op(), "auto_release");
        assert!(matches!(r, Request::AutoRelease { reason: None, .. }));

        let r: Request = serde_json::from_str(r#"{"op":"get_status","resource_id":"x"}"#).unwrap();
        assert_eq!(r.op(), "get_status");
        let r: Request = serde_json::from_str(r#"{"op":"subscribe","resource_id":"x"}"#).unwrap();
        assert_eq!(r.op(), "subscribe");
    }

    #[test]
    fn first_connection_defaults_to_false() {
        let r: Request = serde_json::from_str(
            r#"{"op":"report_status","resource_id":"lab-01","status":"FREE","timestamp":1}"#,
        )
        .unwrap();
        assert!(matches!(r, Request::ReportStatus { first_connection: false, .. }));
    }

    #[test]
    fn rejects_unknown_ops_and_missing_fields() {
        assert!(serde_json::from_str::<Request>(r#"{"op":"reboot","resource_id":"x"}"#).is_err());
        assert!(serde_json::from_str::<Request>(r#"{"op":"report_status","resource_id":"x"}"#).is_err());
        assert!(serde_json::from_str::<Request>("not json").is_err());
    }

    #[test]
    fn error_response_shape() {
        let v = error_response(&EngineError::InvalidArgument("unknown device status: X".into()));
        assert_eq!(v["ok"], false);
        assert_eq!(v["kind"], "invalid_argument");
        assert_eq!(v["error"], "invalid argument: unknown device status: X");
    }

    #[test]
    fn codec_turns_long_lines_into_frames() {
        let mut codec = DeviceCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'x'; MAX_FRAME_LEN + 1]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::TooLong));
        buf.extend_from_slice(b"xxx\n{\"op\":\"get_status\",\"resource_id\":\"a\"}\n");
        // The rest of the long line is skipped; the next line comes through intact
        let mut next = codec.decode(&mut buf).unwrap();
        while next.is_none() {
            next = codec.decode(&mut buf).unwrap();
        }
        assert_eq!(
            next,
            Some(Frame::Line(r#"{"op":"get_status","resource_id":"a"}"#.into()))
        );
    }

    #[test]
    fn ok_marks_body() {
        let v = ok(json!({ "status": "FREE" }));
        assert_eq!(v["ok"], true);
        assert_eq!(v["status"], "FREE");
    }
}

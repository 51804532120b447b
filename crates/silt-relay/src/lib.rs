//! Silt Relay - a stateless frame forwarder.
//!
//! Peers without a reachable listener attach with a long-lived REGISTER
//! stream. Clients open a short-lived stream per request; the relay
//! forwards the payload to the attached peer and routes the response back
//! by correlation id. The only state is the live stream map.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use silt_proto::{Frame, FrameKind};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How long a forwarded request may wait for its response before the
/// relay gives up on the attached peer.
const PENDING_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Errors from running the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Listener or stream failure.
    #[error("transport: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded.
    #[error("frame: {0}")]
    Frame(#[from] serde_json::Error),
}

/// Write handle and lifetime token for one attached peer.
struct Attached {
    frames: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    generation: u64,
}

/// The relay server.
#[derive(Default)]
pub struct Server {
    /// Attached peers by hex node id.
    attached: Mutex<HashMap<String, Attached>>,
    /// Waiting clients by request id.
    pending: Mutex<HashMap<String, oneshot::Sender<Frame>>>,
    /// Monotonic attachment counter; disambiguates re-registrations.
    generations: Mutex<u64>,
}

impl Server {
    /// Creates a relay server.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Binds and runs the accept loop until the token fires. Returns the
    /// bound address through the callback-free two-step: bind, then serve.
    pub async fn listen(
        self: &Arc<Self>,
        addr: &str,
        cancel: CancellationToken,
    ) -> Result<SocketAddr, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "relay listening");

        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("relay stopped");
                        return;
                    }
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { return };
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            let _ = server.handle_conn(stream, peer).await;
                        });
                    }
                }
            }
        });
        Ok(local)
    }

    /// Dispatches a fresh connection on its first frame.
    async fn handle_conn(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), RelayError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }
        let Ok(first) = serde_json::from_str::<Frame>(line.trim_end()) else {
            return Ok(());
        };

        match first.kind {
            FrameKind::Register => self.handle_attach(reader, write_half, first).await,
            FrameKind::ClientRequest => self.handle_client(reader, write_half, first).await,
            FrameKind::Whoami => {
                let frame = Frame::new(FrameKind::Whoami)
                    .with_req_id(first.req_id)
                    .with_payload(
                        silt_proto::RpcMessage::new(
                            silt_proto::RpcKind::Ping,
                            silt_proto::Contact::default(),
                        )
                        .with_value(peer.ip().to_string().into_bytes()),
                    );
                write_frame(&mut write_half, &frame).await
            }
            _ => Ok(()),
        }
    }

    /// Serves an attached peer: writes forwarded requests from the
    /// channel, reads DELIVER_RESPONSE frames, and routes them to the
    /// waiting client. Re-registration closes the previous stream.
    async fn handle_attach(
        self: &Arc<Self>,
        mut reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
        mut write_half: tokio::net::tcp::OwnedWriteHalf,
        first: Frame,
    ) -> Result<(), RelayError> {
        if first.target_id.is_empty() {
            return Ok(());
        }
        let id = first.target_id;
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<Frame>(64);
        let generation = {
            let mut counter = self.generations.lock();
            *counter += 1;
            *counter
        };

        {
            let mut attached = self.attached.lock();
            if let Some(previous) = attached.insert(
                id.clone(),
                Attached {
                    frames: tx,
                    cancel: cancel.clone(),
                    generation,
                },
            ) {
                previous.cancel.cancel();
            }
        }
        info!(node = %&id[..id.len().min(8)], "node attached");

        // Writes run in their own task: interleaving a forward with a
        // partially read response line would corrupt the stream.
        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => return,
                    forwarded = rx.recv() => {
                        let Some(frame) = forwarded else { return };
                        if write_frame(&mut write_half, &frame).await.is_err() {
                            writer_cancel.cancel();
                            return;
                        }
                    }
                }
            }
        });

        let result: Result<(), RelayError> = async {
            let mut line = String::new();
            loop {
                line.clear();
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    read = reader.read_line(&mut line) => {
                        if read? == 0 {
                            return Ok(());
                        }
                        let Ok(frame) = serde_json::from_str::<Frame>(line.trim_end()) else {
                            continue;
                        };
                        if frame.kind != FrameKind::DeliverResponse {
                            continue;
                        }
                        let waiter = self.pending.lock().remove(&frame.req_id);
                        if let Some(waiter) = waiter {
                            let response = Frame::new(FrameKind::ClientResponse)
                                .with_req_id(frame.req_id);
                            let response = match frame.payload {
                                Some(payload) => response.with_payload(payload),
                                None => response,
                            };
                            let _ = waiter.send(response);
                        }
                    }
                }
            }
        }
        .await;
        cancel.cancel();
        writer.abort();

        // Detach only if this stream is still the registered one; a newer
        // registration must not be removed by the stream it replaced.
        {
            let mut attached = self.attached.lock();
            if attached.get(&id).is_some_and(|a| a.generation == generation) {
                attached.remove(&id);
            }
        }
        debug!(node = %&id[..id.len().min(8)], "node detached");
        result
    }

    /// Serves one client request: forwards it to the attached target and
    /// answers with the correlated response.
    async fn handle_client(
        self: &Arc<Self>,
        _reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
        mut write_half: tokio::net::tcp::OwnedWriteHalf,
        first: Frame,
    ) -> Result<(), RelayError> {
        let req_id = first.req_id.clone();
        if first.target_id.is_empty() || req_id.is_empty() {
            let frame = Frame::new(FrameKind::ClientResponse)
                .with_req_id(req_id)
                .with_error("bad request");
            return write_frame(&mut write_half, &frame).await;
        }

        let forward = self
            .attached
            .lock()
            .get(&first.target_id)
            .map(|a| a.frames.clone());
        let Some(forward) = forward else {
            let frame = Frame::new(FrameKind::ClientResponse)
                .with_req_id(req_id)
                .with_error("target not attached");
            return write_frame(&mut write_half, &frame).await;
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(req_id.clone(), tx);

        let deliver = Frame::new(FrameKind::DeliverRequest)
            .with_req_id(req_id.clone())
            .with_payload(first.payload.unwrap_or_else(|| {
                silt_proto::RpcMessage::new(
                    silt_proto::RpcKind::Ping,
                    silt_proto::Contact::default(),
                )
            }));
        if forward.send(deliver).await.is_err() {
            self.pending.lock().remove(&req_id);
            let frame = Frame::new(FrameKind::ClientResponse)
                .with_req_id(req_id)
                .with_error("forward failed");
            return write_frame(&mut write_half, &frame).await;
        }

        // The waiter is bounded so a dead target cannot leak pending
        // entries; clients enforce their own, shorter RPC deadline.
        match tokio::time::timeout(PENDING_TIMEOUT, rx).await {
            Ok(Ok(response)) => write_frame(&mut write_half, &response).await,
            _ => {
                self.pending.lock().remove(&req_id);
                let frame = Frame::new(FrameKind::ClientResponse)
                    .with_req_id(req_id)
                    .with_error("target did not respond");
                write_frame(&mut write_half, &frame).await
            }
        }
    }

    /// Number of currently attached peers.
    pub fn attached_count(&self) -> usize {
        self.attached.lock().len()
    }
}

async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), RelayError> {
    let mut out = serde_json::to_vec(frame)?;
    out.push(b'\n');
    writer.write_all(&out).await?;
    Ok(())
}

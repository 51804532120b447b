//! Relay client: long-lived attachment for inbound delivery, one-shot
//! dials through a relay, and WHOAMI external-address discovery.

use std::sync::Arc;

use silt_proto::{Frame, FrameKind, RpcMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::node::Node;
use crate::DhtError;

impl Node {
    /// Establishes a long-lived connection to an inbound relay and serves
    /// incoming DELIVER_REQUEST frames over the attached stream through
    /// the shared request handler. Returns when the stream closes or the
    /// token is cancelled.
    pub async fn attach_relay(
        self: &Arc<Self>,
        cancel: CancellationToken,
        relay_addr: &str,
    ) -> Result<(), DhtError> {
        let stream = TcpStream::connect(relay_addr).await?;
        *self.relay_addr.write() = relay_addr.to_string();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let register = Frame::new(FrameKind::Register).with_target(self.id.to_hex());
        write_frame(&mut write_half, &register).await?;
        info!(id = %&self.id.to_hex()[..8], relay = relay_addr, "attached to relay");

        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("relay attachment stopped");
                    return Ok(());
                }
                read = reader.read_line(&mut line) => read,
            };
            let n = read?;
            if n == 0 {
                return Err(DhtError::Protocol("relay stream closed".into()));
            }
            let Ok(frame) = serde_json::from_str::<Frame>(line.trim_end()) else {
                continue;
            };
            if frame.kind != FrameKind::DeliverRequest {
                continue;
            }
            let Some(payload) = frame.payload else {
                continue;
            };
            if let Some(resp) = self.handle_request(payload).await {
                let deliver = Frame::new(FrameKind::DeliverResponse)
                    .with_req_id(frame.req_id)
                    .with_payload(resp);
                write_frame(&mut write_half, &deliver).await?;
            }
        }
    }

    /// Performs a single RPC against a peer reachable only through a
    /// relay, correlating the response by request id.
    pub async fn dial_rpc_via_relay(
        &self,
        relay_addr: &str,
        target_id: &str,
        req: RpcMessage,
    ) -> Result<RpcMessage, DhtError> {
        let deadline = self.config.rpc_timeout;
        let req_id = self.new_req_id();
        let call = async {
            let stream = TcpStream::connect(relay_addr).await?;
            let (read_half, mut write_half) = stream.into_split();

            let frame = Frame::new(FrameKind::ClientRequest)
                .with_req_id(req_id.clone())
                .with_target(target_id)
                .with_payload(req);
            write_frame(&mut write_half, &frame).await?;

            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(DhtError::Protocol("relay closed connection".into()));
            }
            let resp: Frame = serde_json::from_str(line.trim_end())?;
            if resp.kind != FrameKind::ClientResponse || resp.req_id != req_id {
                return Err(DhtError::Protocol("unexpected relay response".into()));
            }
            if !resp.error.is_empty() {
                return Err(DhtError::Relay(resp.error));
            }
            resp.payload
                .ok_or_else(|| DhtError::Protocol("relay response without payload".into()))
        };
        timeout(deadline, call).await.map_err(|_| DhtError::Timeout)?
    }

    /// Asks a relay for this node's externally observed host.
    pub async fn whoami(&self, relay_addr: &str) -> Result<String, DhtError> {
        let deadline = self.config.rpc_timeout;
        let req_id = self.new_req_id();
        let call = async {
            let stream = TcpStream::connect(relay_addr).await?;
            let (read_half, mut write_half) = stream.into_split();

            let frame = Frame::new(FrameKind::Whoami).with_req_id(req_id.clone());
            write_frame(&mut write_half, &frame).await?;

            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(DhtError::Protocol("relay closed connection".into()));
            }
            let resp: Frame = serde_json::from_str(line.trim_end())?;
            if resp.kind != FrameKind::Whoami || resp.req_id != req_id {
                return Err(DhtError::Protocol("unexpected relay response".into()));
            }
            if !resp.error.is_empty() {
                return Err(DhtError::Relay(resp.error));
            }
            let host = resp
                .payload
                .map(|p| String::from_utf8_lossy(&p.value).into_owned())
                .unwrap_or_default();
            Ok(host)
        };
        timeout(deadline, call).await.map_err(|_| DhtError::Timeout)?
    }

    fn new_req_id(&self) -> String {
        format!(
            "{}-{}",
            &self.id.to_hex()[..8],
            rand::random::<u64>()
        )
    }
}

async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), DhtError> {
    let mut out = serde_json::to_vec(frame)?;
    out.push(b'\n');
    writer.write_all(&out).await?;
    Ok(())
}

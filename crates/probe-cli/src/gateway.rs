//! MAVLink gateway: one connection shared by three flows.
//!
//! A blocking reader thread routes incoming traffic: payload requests
//! (V2_EXTENSION with our message type) to the request channel, everything
//! else to the telemetry source. Outbound typed frames are encoded with the
//! probe-proto wire codec, length-prefixed and chunked into V2_EXTENSION
//! payloads.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mavlink::common::{MavMessage, V2_EXTENSION_DATA};
use mavlink::{MavConnection, MavHeader};
use parking_lot::Mutex;
use probe_proto::wire;
use probe_proto::{ClientRequest, GatewayLink, LinkFrame};
use probe_telemetry::AutopilotPort;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// V2_EXTENSION message types carrying sigprobe traffic.
pub const FRAME_MESSAGE_TYPE: u16 = 0x5350;
pub const REQUEST_MESSAGE_TYPE: u16 = 0x5351;

const EXT_PAYLOAD: usize = 249;

pub type Conn = Arc<dyn MavConnection<MavMessage> + Send + Sync>;

/// Split a length-prefixed buffer into extension-message payload chunks.
fn chunks(buf: &[u8]) -> Vec<[u8; EXT_PAYLOAD]> {
    let mut framed = Vec::with_capacity(2 + buf.len());
    framed.extend_from_slice(&(buf.len() as u16).to_le_bytes());
    framed.extend_from_slice(buf);

    framed
        .chunks(EXT_PAYLOAD)
        .map(|c| {
            let mut out = [0u8; EXT_PAYLOAD];
            out[..c.len()].copy_from_slice(c);
            out
        })
        .collect()
}

/// Extract one logical buffer from reassembled extension payloads.
fn unchunk(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 2 {
        return None;
    }
    let len = u16::from_le_bytes([data[0], data[1]]) as usize;
    data.get(2..2 + len).map(|d| d.to_vec())
}

struct Sequencer {
    header: Mutex<MavHeader>,
}

impl Sequencer {
    fn new(system_id: u8, component_id: u8) -> Self {
        Self {
            header: Mutex::new(MavHeader {
                system_id,
                component_id,
                sequence: 0,
            }),
        }
    }

    fn next(&self) -> MavHeader {
        let mut h = self.header.lock();
        h.sequence = h.sequence.wrapping_add(1);
        *h
    }
}

/// Outbound half: typed frames onto the MAVLink link.
pub struct MavGateway {
    conn: Conn,
    seq: Sequencer,
}

impl MavGateway {
    pub fn new(conn: Conn, system_id: u8, component_id: u8) -> Self {
        Self {
            conn,
            seq: Sequencer::new(system_id, component_id),
        }
    }

    pub async fn send_message(&self, msg: MavMessage) -> Result<()> {
        let conn = self.conn.clone();
        let header = self.seq.next();
        tokio::task::spawn_blocking(move || conn.send(&header, &msg))
            .await
            .context("send task")?
            .context("mavlink send")?;
        Ok(())
    }

    async fn send_buffer(&self, message_type: u16, buf: &[u8]) -> Result<()> {
        for payload in chunks(buf) {
            self.send_message(MavMessage::V2_EXTENSION(V2_EXTENSION_DATA {
                message_type,
                target_network: 0,
                target_system: 0,
                target_component: 0,
                payload,
            }))
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl GatewayLink for MavGateway {
    async fn send(&self, frame: LinkFrame) -> Result<()> {
        self.send_buffer(FRAME_MESSAGE_TYPE, &wire::encode_frame(&frame))
            .await
    }
}

/// Telemetry-side port fed by the reader thread.
pub struct RoutedPort {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(MavHeader, MavMessage)>>,
    conn: Conn,
    seq: Sequencer,
}

#[async_trait]
impl AutopilotPort for RoutedPort {
    async fn recv(&self) -> Result<(MavHeader, MavMessage)> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .context("mavlink reader thread gone")
    }

    async fn send(&self, msg: MavMessage) -> Result<()> {
        let conn = self.conn.clone();
        let header = self.seq.next();
        tokio::task::spawn_blocking(move || conn.send(&header, &msg))
            .await
            .context("send task")?
            .context("mavlink send")?;
        Ok(())
    }
}

pub struct Link {
    pub gateway: Arc<MavGateway>,
    pub telemetry_port: Arc<RoutedPort>,
    pub requests: mpsc::UnboundedReceiver<ClientRequest>,
}

/// Start the shared reader thread and build the three link endpoints.
/// Requests spanning multiple extension messages are reassembled in order;
/// interleaving from multiple ground stations is not supported.
pub fn start_link(conn: Conn, system_id: u8, component_id: u8) -> Link {
    let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
    let (request_tx, request_rx) = mpsc::unbounded_channel();

    {
        let conn = conn.clone();
        std::thread::spawn(move || {
            let mut pending: Vec<u8> = Vec::new();
            loop {
                let (header, msg) = match conn.recv() {
                    Ok(x) => x,
                    Err(e) => {
                        warn!("mavlink recv failed: {e}");
                        std::thread::sleep(std::time::Duration::from_millis(50));
                        continue;
                    }
                };
                match msg {
                    MavMessage::V2_EXTENSION(ext)
                        if ext.message_type == REQUEST_MESSAGE_TYPE =>
                    {
                        pending.extend_from_slice(&ext.payload);
                        if let Some(buf) = unchunk(&pending) {
                            pending.clear();
                            match wire::decode_request(&buf) {
                                Ok(req) => {
                                    if request_tx.send(req).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    debug!("undecodable request dropped: {e}");
                                }
                            }
                        }
                    }
                    other => {
                        if telemetry_tx.send((header, other)).is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    Link {
        gateway: Arc::new(MavGateway::new(conn.clone(), system_id, component_id)),
        telemetry_port: Arc::new(RoutedPort {
            rx: tokio::sync::Mutex::new(telemetry_rx),
            conn,
            seq: Sequencer::new(system_id, component_id),
        }),
        requests: request_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_buffer_is_one_chunk() {
        let buf = vec![1u8, 2, 3];
        let cs = chunks(&buf);
        assert_eq!(cs.len(), 1);
        assert_eq!(unchunk(&cs[0]).unwrap(), buf);
    }

    #[test]
    fn large_buffer_round_trips_across_chunks() {
        let buf: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        let cs = chunks(&buf);
        assert_eq!(cs.len(), 3);
        let mut joined = Vec::new();
        for c in &cs {
            joined.extend_from_slice(c);
        }
        assert_eq!(unchunk(&joined).unwrap(), buf);
    }

    #[test]
    fn unchunk_rejects_short_input() {
        assert_eq!(unchunk(&[1]), None);
        assert_eq!(unchunk(&[10, 0, 1, 2]), None, "payload shorter than prefix");
    }
}

//! Two-node fragmentation simulator.
//!
//! Node A sends a series of random-length messages to node B over a lossy
//! simulated link. Each fragment is dropped with a configurable probability;
//! a dropped fragment fails its send completion, which aborts the message on
//! A and leaves B to time the reassembly out.
//!
//! # Usage
//!
//! ```bash
//! SIM_MESSAGES=20 SIM_DROP_PERCENT=5 cargo run --bin fragment-sim -- config.json
//! ```
//!
//! The optional JSON file holds a [`FragmentationConfig`]; missing fields
//! take their defaults.

use std::time::Duration;

use aps_fragmentation::{
    ApsFrame, Destination, Fragmentation, FragmentationConfig, IncomingOutcome, MessageSent,
    NodeId, Transport, TransportError, WindowAck,
};
use log::{debug, error, info, warn};
use rand_core::{OsRng, RngCore};

const NODE_A: NodeId = NodeId::new(0x0001);
const NODE_B: NodeId = NodeId::new(0x0002);

/// Payload bytes per fragment on the simulated link.
const LINK_MTU: usize = 82;
/// Per-hop latency of the simulated link.
const LINK_LATENCY: Duration = Duration::from_millis(5);
const RETRY_TIMEOUT_MS: u32 = 50;

/// One side of the simulated link.
struct SimTransport {
    sequence: u8,
    outbox: Vec<(ApsFrame, Vec<u8>)>,
    acks_sent: u32,
    completed: u32,
    failed: u32,
}

impl SimTransport {
    fn new() -> Self {
        Self {
            sequence: 0,
            outbox: Vec::new(),
            acks_sent: 0,
            completed: 0,
            failed: 0,
        }
    }
}

impl Transport for SimTransport {
    fn next_sequence(&mut self) -> u8 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    fn max_fragment_payload(&self, _destination: Destination, _frame: &ApsFrame) -> usize {
        LINK_MTU
    }

    fn send_fragment(
        &mut self,
        _destination: Destination,
        frame: &ApsFrame,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.outbox.push((*frame, data.to_vec()));
        Ok(())
    }

    fn retry_timeout_ms(&self, _node: NodeId) -> u32 {
        RETRY_TIMEOUT_MS
    }

    fn send_window_ack(&mut self, sender: NodeId, frame: &ApsFrame, ack: WindowAck) {
        debug!(
            "Ack to {} seq {}: base {} mask {:08b}",
            sender, frame.sequence, ack.window_base, ack.mask
        );
        self.acks_sent += 1;
    }

    fn send_oversize_response(&mut self, sender: NodeId, frame: &ApsFrame) {
        warn!("Oversize response to {} for seq {}", sender, frame.sequence);
    }

    fn message_sent(&mut self, report: MessageSent<'_>) {
        match report.status {
            Ok(()) => self.completed += 1,
            Err(e) => {
                warn!("Message seq {} failed: {}", report.tag.sequence(), e);
                self.failed += 1;
            }
        }
    }

    fn fragmentation_active(&mut self, active: bool) {
        debug!("Fragmentation active: {}", active);
    }
}

fn load_config() -> Result<FragmentationConfig, String> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(FragmentationConfig::default());
    };
    let text = std::fs::read_to_string(&path).map_err(|e| format!("{}: {}", path, e))?;
    let config: FragmentationConfig =
        serde_json::from_str(&text).map_err(|e| format!("{}: {}", path, e))?;
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn env_or(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn random_payload(rng: &mut OsRng, max_len: usize) -> Vec<u8> {
    let len = 1 + rng.next_u32() as usize % max_len;
    let mut payload = vec![0; len];
    rng.fill_bytes(&mut payload);
    payload
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    let messages = env_or("SIM_MESSAGES", 10);
    let drop_percent = env_or("SIM_DROP_PERCENT", 5).min(100);

    info!("=== Fragmentation simulator ===");
    info!(
        "window {}, buffer {} bytes, {} messages, {}% loss",
        config.window_size, config.buffer_capacity, messages, drop_percent
    );

    let (mut node_a, mut node_b) = match (Fragmentation::new(config), Fragmentation::new(config)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    let mut link_a = SimTransport::new();
    let mut link_b = SimTransport::new();
    let mut rng = OsRng;
    let mut delivered = 0u32;

    for n in 0..messages {
        let payload = random_payload(&mut rng, config.buffer_capacity);
        let mut frame = ApsFrame::new(0x0104, 0xFC00, 1, 1);
        if let Err(e) =
            node_a.send_fragmented(&mut link_a, Destination::Direct(NODE_B), &mut frame, &payload)
        {
            warn!("Message {} not sent: {}", n, e);
            continue;
        }

        while node_a.is_in_progress() {
            tokio::time::sleep(LINK_LATENCY).await;
            for (mut frame, data) in std::mem::take(&mut link_a.outbox) {
                let status = if rng.next_u32() % 100 < drop_percent {
                    debug!("Dropped fragment {} of seq {}", frame.fragment_index(), frame.sequence);
                    Err(TransportError::DeliveryFailed)
                } else {
                    if let IncomingOutcome::Reassembled(message) =
                        node_b.on_incoming_message(&mut link_b, &mut frame, NODE_A, &data)
                    {
                        if message == payload.as_slice() {
                            delivered += 1;
                        } else {
                            error!("Message {} reassembled with wrong contents", n);
                        }
                    }
                    Ok(())
                };
                let _ = node_a.on_message_sent(&mut link_a, &frame, status);
            }
        }

        // Let abandoned reassemblies on B run out
        while let Some(deadline) = node_b.next_deadline() {
            tokio::time::sleep_until(deadline.into()).await;
            let expired = node_b.poll_timeouts(&mut link_b);
            if expired > 0 {
                info!("B abandoned {} reassemblies", expired);
            }
        }
    }

    info!(
        "Sent {} ok / {} failed, {} delivered, {} acks",
        link_a.completed, link_a.failed, delivered, link_b.acks_sent
    );
    info!("A stats: {}", node_a.stats().to_json());
    info!("B stats: {}", node_b.stats().to_json());
}

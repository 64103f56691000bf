//! Packet pump: the read → resolve → write loop.
//!
//! The pump owns a single "should process" flag. `start` begins a
//! self-resubmitting loop that reads a batch of packets, dispatches each to
//! the resolver on its own task, and writes every produced response back
//! tagged with the originating packet's protocol family. `stop` flips the
//! flag; in-flight resolutions from the last batch may still complete, and
//! their writes become silent no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hickory_proto::op::Message;

use crate::stats::{ActivityRecorder, RequestOutcome};
use crate::tunnel::{PacketResolver, ProtocolFamily, TunnelHost};

/// Drives the packet read/resolve/write lifecycle for one tunnel session.
pub struct PacketPump {
    should_process: Arc<AtomicBool>,
}

impl PacketPump {
    pub fn new() -> Self {
        Self {
            should_process: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.should_process.load(Ordering::SeqCst)
    }

    /// Start the pump loop. The loop runs until `stop` is called; a stop
    /// racing an in-flight batch drops that batch's responses instead of
    /// erroring.
    pub fn start<H, R>(
        &self,
        host: Arc<H>,
        resolver: Arc<R>,
        recorder: Option<Arc<dyn ActivityRecorder>>,
    ) where
        H: TunnelHost,
        R: PacketResolver,
    {
        self.should_process.store(true, Ordering::SeqCst);
        let flag = Arc::clone(&self.should_process);

        tokio::spawn(async move {
            tracing::info!("Packet pump started");
            loop {
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                let (packets, families) = host.read_packets().await;
                for (i, packet) in packets.into_iter().enumerate() {
                    let family = families.get(i).copied().unwrap_or(ProtocolFamily::Ipv4);
                    dispatch(
                        packet,
                        family,
                        Arc::clone(&host),
                        Arc::clone(&resolver),
                        recorder.clone(),
                        Arc::clone(&flag),
                    );
                }
            }
            tracing::info!("Packet pump stopped");
        });
    }

    /// Mark the pump stopped. Responses still in flight are discarded.
    pub fn stop(&self) {
        self.should_process.store(false, Ordering::SeqCst);
    }
}

impl Default for PacketPump {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve one packet on its own task so a slow upstream never delays the
/// rest of the batch.
fn dispatch<H, R>(
    packet: Vec<u8>,
    family: ProtocolFamily,
    host: Arc<H>,
    resolver: Arc<R>,
    recorder: Option<Arc<dyn ActivityRecorder>>,
    flag: Arc<AtomicBool>,
) where
    H: TunnelHost,
    R: PacketResolver,
{
    tokio::spawn(async move {
        let started = Instant::now();
        let response = resolver.resolve(&packet).await;

        if let Some(recorder) = &recorder {
            recorder.record_request(
                &query_domain(&packet),
                RequestOutcome {
                    answered: response.is_some(),
                    encrypted: resolver.is_encrypted(),
                    blocked: false,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                },
            );
        }

        if let Some(response) = response {
            // A pump stopped mid-resolution drops the write.
            if flag.load(Ordering::SeqCst) {
                host.write_packets(vec![response], vec![family]).await;
            } else {
                tracing::trace!("Dropping response resolved after pump stop");
            }
        }
    });
}

fn query_domain(packet: &[u8]) -> String {
    Message::from_vec(packet)
        .ok()
        .and_then(|m| m.queries().first().map(|q| q.name().to_string()))
        .unwrap_or_default()
}

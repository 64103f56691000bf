//! Mock tunnel collaborators shared by the tunnel subsystem tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use tokio::sync::Semaphore;

use crate::error::TunnelError;
use crate::tunnel::negotiator::{SettingsApplyError, TunnelNetworkSettings};
use crate::tunnel::{PacketResolver, ProtocolFamily, SystemDnsProvider, TunnelHost};

/// Serialize a minimal A query for the given domain.
pub fn build_query(domain: &str) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(7);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(
        Name::from_utf8(domain).unwrap(),
        RecordType::A,
    ));
    message.to_vec().unwrap()
}

/// Scripted outcome for one `apply_settings` call.
pub enum ApplyScript {
    Ok,
    Cancelled,
    Fail,
}

/// Records every boundary call; reads are scripted, and unscripted reads
/// pend forever like a quiet tunnel.
pub struct MockHost {
    cancel_all_applies: bool,
    apply_script: Mutex<VecDeque<ApplyScript>>,
    applies: Mutex<Vec<Option<TunnelNetworkSettings>>>,
    reads: Mutex<VecDeque<(Vec<Vec<u8>>, Vec<ProtocolFamily>)>>,
    writes: Mutex<Vec<(Vec<u8>, ProtocolFamily)>>,
    cancels: Mutex<Vec<Option<String>>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            cancel_all_applies: false,
            apply_script: Mutex::new(VecDeque::new()),
            applies: Mutex::new(Vec::new()),
            reads: Mutex::new(VecDeque::new()),
            writes: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
        }
    }

    /// A host whose every settings application is cancelled by the user.
    pub fn cancelling() -> Self {
        Self {
            cancel_all_applies: true,
            ..Self::new()
        }
    }

    /// Script the outcomes of upcoming `apply_settings` calls. Calls past
    /// the end of the script succeed.
    pub fn script_applies(&self, script: Vec<ApplyScript>) {
        *self.apply_script.lock().unwrap() = script.into();
    }

    pub fn queue_read(&self, packets: Vec<Vec<u8>>, families: Vec<ProtocolFamily>) {
        self.reads.lock().unwrap().push_back((packets, families));
    }

    pub fn applied_settings(&self) -> Vec<Option<TunnelNetworkSettings>> {
        self.applies.lock().unwrap().clone()
    }

    pub fn written_packets(&self) -> Vec<(Vec<u8>, ProtocolFamily)> {
        self.writes.lock().unwrap().clone()
    }

    /// Error kinds passed to `cancel`, `None` for a plain cancellation.
    pub fn cancel_calls(&self) -> Vec<Option<String>> {
        self.cancels.lock().unwrap().clone()
    }
}

impl TunnelHost for MockHost {
    async fn apply_settings(
        &self,
        settings: Option<TunnelNetworkSettings>,
    ) -> Result<(), SettingsApplyError> {
        self.applies.lock().unwrap().push(settings);
        if self.cancel_all_applies {
            return Err(SettingsApplyError::Cancelled);
        }
        match self.apply_script.lock().unwrap().pop_front() {
            None | Some(ApplyScript::Ok) => Ok(()),
            Some(ApplyScript::Cancelled) => Err(SettingsApplyError::Cancelled),
            Some(ApplyScript::Fail) => Err(SettingsApplyError::Other("apply failed".into())),
        }
    }

    async fn read_packets(&self) -> (Vec<Vec<u8>>, Vec<ProtocolFamily>) {
        let next = self.reads.lock().unwrap().pop_front();
        match next {
            Some(batch) => batch,
            None => std::future::pending().await,
        }
    }

    async fn write_packets(&self, packets: Vec<Vec<u8>>, families: Vec<ProtocolFamily>) {
        let mut writes = self.writes.lock().unwrap();
        for (packet, family) in packets.into_iter().zip(families) {
            writes.push((packet, family));
        }
    }

    fn cancel(&self, error: Option<TunnelError>) {
        self.cancels
            .lock()
            .unwrap()
            .push(error.map(|e| e.kind().to_string()));
    }
}

/// Returns scripted system DNS server lists; the final entry repeats once
/// the script is exhausted.
pub struct MockSystemDns {
    responses: Mutex<VecDeque<Vec<String>>>,
}

impl MockSystemDns {
    pub fn new(responses: Vec<Vec<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }
}

impl SystemDnsProvider for MockSystemDns {
    async fn system_dns_servers(&self) -> Vec<String> {
        let mut queue = self.responses.lock().unwrap();
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap_or_default()
        }
    }
}

/// Canned resolver; optionally gated so tests can control when a resolution
/// completes relative to a pump stop.
pub struct MockResolver {
    response: Option<Vec<u8>>,
    gate: Option<Semaphore>,
}

impl MockResolver {
    /// Answers every query with the given bytes.
    pub fn answering(response: Vec<u8>) -> Self {
        Self {
            response: Some(response),
            gate: None,
        }
    }

    /// Never produces a response.
    pub fn silent() -> Self {
        Self {
            response: None,
            gate: None,
        }
    }

    /// Holds every resolution until `release` is called.
    pub fn gated(response: Vec<u8>) -> Self {
        Self {
            response: Some(response),
            gate: Some(Semaphore::new(0)),
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(usize::MAX >> 4);
        }
    }
}

impl PacketResolver for MockResolver {
    async fn resolve(&self, _request: &[u8]) -> Option<Vec<u8>> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.ok()?;
        }
        self.response.clone()
    }

    fn is_encrypted(&self) -> bool {
        false
    }
}

//! Chunking of outbound messages and reassembly of inbound ones.
//!
//! There is no end marker on the wire: a chunk shorter than the usable
//! payload size ends a transfer. A message whose length is an exact
//! multiple of that size is therefore followed by an empty chunk.

use crate::gatt::{Lane, ATT_HEADER_SIZE};

/// Usable bytes per GATT write or notification for a given MTU.
pub fn max_payload(mtu: u16) -> usize {
    usize::from(mtu.saturating_sub(ATT_HEADER_SIZE))
}

/// How an encoded message goes out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Fits in one write to the RX characteristic.
    Single(Vec<u8>),
    /// Written in order to the RX-large characteristic.
    Chunked(Vec<Vec<u8>>),
}

/// Split `payload` for a link with `max_payload` usable bytes per write.
pub fn split(payload: &[u8], max_payload: usize) -> Outbound {
    if max_payload == 0 || payload.len() < max_payload {
        return Outbound::Single(payload.to_vec());
    }

    let mut chunks: Vec<Vec<u8>> = payload.chunks(max_payload).map(<[u8]>::to_vec).collect();
    if payload.len() % max_payload == 0 {
        chunks.push(Vec::new());
    }
    Outbound::Chunked(chunks)
}

/// Result of feeding one inbound chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    Complete(Vec<u8>),
    /// More chunks follow; read TX-large again.
    Incomplete,
}

/// Per-lane accumulation buffers for TX-large traffic.
#[derive(Debug, Default)]
pub struct Reassembler {
    network: Vec<u8>,
    mqtt: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer(&mut self, lane: Lane) -> &mut Vec<u8> {
        match lane {
            Lane::NetworkConfig => &mut self.network,
            Lane::MqttProxy => &mut self.mqtt,
        }
    }

    pub fn push(&mut self, lane: Lane, chunk: &[u8], max_payload: usize) -> Reassembly {
        let buffer = self.buffer(lane);
        buffer.extend_from_slice(chunk);
        if max_payload == 0 || chunk.len() < max_payload {
            Reassembly::Complete(std::mem::take(buffer))
        } else {
            Reassembly::Incomplete
        }
    }

    pub fn pending(&self, lane: Lane) -> usize {
        match lane {
            Lane::NetworkConfig => self.network.len(),
            Lane::MqttProxy => self.mqtt.len(),
        }
    }

    pub fn clear(&mut self) {
        self.network.clear();
        self.mqtt.clear();
    }
}

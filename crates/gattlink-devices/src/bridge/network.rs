//! Network-config bridge.
//!
//! Stateless: requests are encoded for the device and responses decoded
//! into app events. Networks from one delivery batch are reported saved
//! first (by slot), then unsaved by signal strength.

use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::codec::{NetworkMessage, ScannedNetwork};
use crate::event::NetworkConfigResponse;

/// Requests the app may send to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkRequest {
    List(crate::codec::ListNetworkRequest),
    Save(crate::codec::SaveNetworkRequest),
    Edit(crate::codec::EditNetworkRequest),
    Delete(crate::codec::DeleteNetworkRequest),
}

impl NetworkRequest {
    pub fn into_message(self) -> NetworkMessage {
        match self {
            NetworkRequest::List(r) => NetworkMessage::ListRequest(r),
            NetworkRequest::Save(r) => NetworkMessage::SaveRequest(r),
            NetworkRequest::Edit(r) => NetworkMessage::EditRequest(r),
            NetworkRequest::Delete(r) => NetworkMessage::DeleteRequest(r),
        }
    }

    pub fn encode(self) -> Vec<u8> {
        self.into_message().encode()
    }
}

/// Report order for listed networks.
pub fn network_order(a: &ScannedNetwork, b: &ScannedNetwork) -> Ordering {
    match (a.is_saved(), b.is_saved()) {
        (true, true) => a.index.cmp(&b.index),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => b.rssi.cmp(&a.rssi),
    }
}

/// Decode one batch of complete messages from the device.
///
/// Undecodable messages are dropped. Listed networks are reordered among
/// themselves; other responses keep their arrival position.
pub fn decode_batch(messages: &[Vec<u8>]) -> Vec<NetworkConfigResponse> {
    let mut responses: Vec<NetworkConfigResponse> = messages
        .iter()
        .filter_map(|bytes| match NetworkMessage::decode(bytes) {
            Ok(message) => to_response(message),
            Err(e) => {
                warn!(error = %e, "Dropping undecodable network-config message");
                None
            }
        })
        .collect();
    order_networks(&mut responses);
    responses
}

fn to_response(message: NetworkMessage) -> Option<NetworkConfigResponse> {
    match message {
        NetworkMessage::ListResponse(network) => Some(NetworkConfigResponse::Network(network)),
        NetworkMessage::SaveResponse(r) => Some(NetworkConfigResponse::Saved(r)),
        NetworkMessage::EditResponse(r) => Some(NetworkConfigResponse::Edited(r)),
        NetworkMessage::DeleteResponse(r) => Some(NetworkConfigResponse::Deleted(r)),
        request => {
            debug!(message_type = request.message_type(), "Ignoring request from device");
            None
        }
    }
}

fn order_networks(responses: &mut [NetworkConfigResponse]) {
    let slots: Vec<usize> = responses
        .iter()
        .enumerate()
        .filter(|(_, r)| matches!(r, NetworkConfigResponse::Network(_)))
        .map(|(i, _)| i)
        .collect();
    if slots.len() < 2 {
        return;
    }

    let mut networks: Vec<ScannedNetwork> = slots
        .iter()
        .filter_map(|&i| match &responses[i] {
            NetworkConfigResponse::Network(n) => Some(n.clone()),
            _ => None,
        })
        .collect();
    networks.sort_by(network_order);

    for (slot, network) in slots.into_iter().zip(networks) {
        responses[slot] = NetworkConfigResponse::Network(network);
    }
}

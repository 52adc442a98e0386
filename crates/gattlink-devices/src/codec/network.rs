//! Wi-Fi provisioning messages.

use super::{keys, CborMap, DecodeError, MapBuilder};

/// Type codes carried in the `w` key.
pub mod message_type {
    pub const LIST_NETWORK_REQ: u64 = 1;
    pub const LIST_NETWORK_RESP: u64 = 2;
    pub const SAVE_NETWORK_REQ: u64 = 3;
    pub const SAVE_NETWORK_RESP: u64 = 4;
    pub const EDIT_NETWORK_REQ: u64 = 5;
    pub const EDIT_NETWORK_RESP: u64 = 6;
    pub const DELETE_NETWORK_REQ: u64 = 7;
    pub const DELETE_NETWORK_RESP: u64 = 8;
}

/// Wi-Fi security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityType {
    Open,
    Wep,
    Wpa,
    Wpa2,
    NotSupported,
}

impl SecurityType {
    pub fn code(self) -> u64 {
        match self {
            SecurityType::Open => 0,
            SecurityType::Wep => 1,
            SecurityType::Wpa => 2,
            SecurityType::Wpa2 => 3,
            SecurityType::NotSupported => 4,
        }
    }

    /// Unknown codes map to `NotSupported`.
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => SecurityType::Open,
            1 => SecurityType::Wep,
            2 => SecurityType::Wpa,
            3 => SecurityType::Wpa2,
            _ => SecurityType::NotSupported,
        }
    }
}

/// Ask the device to scan, returning up to `max_networks` results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListNetworkRequest {
    pub max_networks: u32,
    pub timeout_secs: u32,
}

/// One network reported by the device in answer to a list request.
///
/// `index` is the saved-network slot; networks that are visible but not
/// saved carry a negative index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedNetwork {
    pub status: u32,
    pub ssid: String,
    pub bssid: Vec<u8>,
    pub security: SecurityType,
    pub hidden: bool,
    pub rssi: i32,
    pub connected: bool,
    pub index: i32,
}

impl ScannedNetwork {
    pub fn is_saved(&self) -> bool {
        self.index >= 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveNetworkRequest {
    pub index: i32,
    pub ssid: String,
    pub bssid: Vec<u8>,
    pub psk: String,
    pub security: SecurityType,
}

/// Move a saved network to another priority slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditNetworkRequest {
    pub index: i32,
    pub new_index: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteNetworkRequest {
    pub index: i32,
}

/// Status-only answer to save, edit and delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkOperationResponse {
    pub status: u32,
}

/// A message on the network-config channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    ListRequest(ListNetworkRequest),
    ListResponse(ScannedNetwork),
    SaveRequest(SaveNetworkRequest),
    SaveResponse(NetworkOperationResponse),
    EditRequest(EditNetworkRequest),
    EditResponse(NetworkOperationResponse),
    DeleteRequest(DeleteNetworkRequest),
    DeleteResponse(NetworkOperationResponse),
}

impl NetworkMessage {
    pub fn message_type(&self) -> u64 {
        match self {
            NetworkMessage::ListRequest(_) => message_type::LIST_NETWORK_REQ,
            NetworkMessage::ListResponse(_) => message_type::LIST_NETWORK_RESP,
            NetworkMessage::SaveRequest(_) => message_type::SAVE_NETWORK_REQ,
            NetworkMessage::SaveResponse(_) => message_type::SAVE_NETWORK_RESP,
            NetworkMessage::EditRequest(_) => message_type::EDIT_NETWORK_REQ,
            NetworkMessage::EditResponse(_) => message_type::EDIT_NETWORK_RESP,
            NetworkMessage::DeleteRequest(_) => message_type::DELETE_NETWORK_REQ,
            NetworkMessage::DeleteResponse(_) => message_type::DELETE_NETWORK_RESP,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let map = MapBuilder::new().uint(keys::TYPE, self.message_type());
        let map = match self {
            NetworkMessage::ListRequest(m) => map
                .uint(keys::MAX_NETWORKS, u64::from(m.max_networks))
                .uint(keys::TIMEOUT, u64::from(m.timeout_secs)),
            NetworkMessage::ListResponse(m) => map
                .uint(keys::STATUS, u64::from(m.status))
                .text(keys::SSID, &m.ssid)
                .bytes(keys::BSSID, &m.bssid)
                .uint(keys::SECURITY, m.security.code())
                .bool(keys::HIDDEN, m.hidden)
                .int(keys::RSSI, i64::from(m.rssi))
                .bool(keys::CONNECTED, m.connected)
                .int(keys::INDEX, i64::from(m.index)),
            NetworkMessage::SaveRequest(m) => map
                .int(keys::INDEX, i64::from(m.index))
                .text(keys::SSID, &m.ssid)
                .bytes(keys::BSSID, &m.bssid)
                .text(keys::PSK, &m.psk)
                .uint(keys::SECURITY, m.security.code()),
            NetworkMessage::EditRequest(m) => map
                .int(keys::INDEX, i64::from(m.index))
                .int(keys::NEW_INDEX, i64::from(m.new_index)),
            NetworkMessage::DeleteRequest(m) => map.int(keys::INDEX, i64::from(m.index)),
            NetworkMessage::SaveResponse(m)
            | NetworkMessage::EditResponse(m)
            | NetworkMessage::DeleteResponse(m) => map.uint(keys::STATUS, u64::from(m.status)),
        };
        map.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let map = CborMap::parse(bytes)?;
        let status = |map: &CborMap| -> Result<NetworkOperationResponse, DecodeError> {
            Ok(NetworkOperationResponse {
                status: map.u32(keys::STATUS)?,
            })
        };

        let message = match map.uint(keys::TYPE)? {
            message_type::LIST_NETWORK_REQ => NetworkMessage::ListRequest(ListNetworkRequest {
                max_networks: map.u32(keys::MAX_NETWORKS)?,
                timeout_secs: map.u32(keys::TIMEOUT)?,
            }),
            message_type::LIST_NETWORK_RESP => NetworkMessage::ListResponse(ScannedNetwork {
                status: map.u32(keys::STATUS)?,
                ssid: map.text(keys::SSID)?,
                bssid: map.bytes(keys::BSSID)?,
                security: SecurityType::from_code(map.uint(keys::SECURITY)?),
                hidden: map.bool(keys::HIDDEN)?,
                rssi: map.i32(keys::RSSI)?,
                connected: map.bool(keys::CONNECTED)?,
                index: map.i32(keys::INDEX)?,
            }),
            message_type::SAVE_NETWORK_REQ => NetworkMessage::SaveRequest(SaveNetworkRequest {
                index: map.i32(keys::INDEX)?,
                ssid: map.text(keys::SSID)?,
                bssid: map.bytes(keys::BSSID)?,
                psk: map.text(keys::PSK)?,
                security: SecurityType::from_code(map.uint(keys::SECURITY)?),
            }),
            message_type::SAVE_NETWORK_RESP => NetworkMessage::SaveResponse(status(&map)?),
            message_type::EDIT_NETWORK_REQ => NetworkMessage::EditRequest(EditNetworkRequest {
                index: map.i32(keys::INDEX)?,
                new_index: map.i32(keys::NEW_INDEX)?,
            }),
            message_type::EDIT_NETWORK_RESP => NetworkMessage::EditResponse(status(&map)?),
            message_type::DELETE_NETWORK_REQ => {
                NetworkMessage::DeleteRequest(DeleteNetworkRequest {
                    index: map.i32(keys::INDEX)?,
                })
            }
            message_type::DELETE_NETWORK_RESP => NetworkMessage::DeleteResponse(status(&map)?),
            other => return Err(DecodeError::UnknownType(other)),
        };
        Ok(message)
    }
}

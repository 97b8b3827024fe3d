use crate::parser::errors::OpResult;
use bitcoin::bech32::{self, u5, ToBase32, Variant};
use bitcoin::util::base58;
use bitcoin::Network;
use serde::{Deserialize, Serialize};

///
/// The spending template an address was derived from.
///
/// `PubkeyHash` and `Pubkey` share the same textual form: a bare public
/// key output is indexed under the hash160 of its key.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressKind {
    PubkeyHash,
    Pubkey,
    ScriptHash,
    WitnessKeyHash,
    WitnessScriptHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressPayload {
    Hash20([u8; 20]),
    Hash32([u8; 32]),
}

impl AddressPayload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AddressPayload::Hash20(h) => h,
            AddressPayload::Hash32(h) => h,
        }
    }
}

/// A typed address payload, rendered to text per network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub kind: AddressKind,
    pub payload: AddressPayload,
}

impl Address {
    pub fn new(kind: AddressKind, payload: AddressPayload) -> Self {
        Address { kind, payload }
    }

    pub fn hash20(kind: AddressKind, bytes: &[u8]) -> Self {
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes[..20]);
        Address::new(kind, AddressPayload::Hash20(arr))
    }

    pub fn hash32(kind: AddressKind, bytes: &[u8]) -> Self {
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes[..32]);
        Address::new(kind, AddressPayload::Hash32(arr))
    }

    ///
    /// Render the address: Base58Check for key and script hashes,
    /// Bech32 witness version 0 for segwit programs.
    ///
    pub fn encode(&self, network: Network) -> OpResult<String> {
        match self.kind {
            AddressKind::PubkeyHash | AddressKind::Pubkey => {
                Ok(base58_with_version(pubkey_version(network), self.payload.as_bytes()))
            }
            AddressKind::ScriptHash => {
                Ok(base58_with_version(script_version(network), self.payload.as_bytes()))
            }
            AddressKind::WitnessKeyHash | AddressKind::WitnessScriptHash => {
                let mut data = vec![u5::try_from_u8(0)?];
                data.extend(self.payload.as_bytes().to_base32());
                Ok(bech32::encode(bech32_hrp(network), data, Variant::Bech32)?)
            }
        }
    }
}

fn base58_with_version(version: u8, payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(payload.len() + 1);
    data.push(version);
    data.extend_from_slice(payload);
    base58::check_encode_slice(&data)
}

fn pubkey_version(network: Network) -> u8 {
    match network {
        Network::Bitcoin => 0,
        _ => 111,
    }
}

fn script_version(network: Network) -> u8 {
    match network {
        Network::Bitcoin => 5,
        _ => 196,
    }
}

fn bech32_hrp(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "bc",
        Network::Regtest => "bcrt",
        _ => "tb",
    }
}

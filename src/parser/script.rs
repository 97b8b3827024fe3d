use crate::parser::address::{Address, AddressKind};
use crate::parser::errors::{OpError, OpErrorKind, OpResult};
use bitcoin_hashes::{hash160, Hash};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;
use Token::{Op, Push};

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_NOP: u8 = 0x61;
const OP_RETURN: u8 = 0x6a;
const OP_DROP: u8 = 0x75;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_HASH256: u8 = 0xaa;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

const MAX_MULTISIG_KEYS: u32 = 20;

///
/// Different types of output scripts recognised by the classifier.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScriptType {
    Pay2MultiSig,
    Pay2PublicKey,
    Pay2PublicKeyHash,
    Pay2ScriptHash,
    Pay2WitnessPublicKeyHash,
    Pay2WitnessScriptHash,
    Unspendable,
    NotRecognised,
}

///
/// `ScriptInfo` stores the addresses extracted from an output script
/// and how many of them must sign to spend it.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptInfo {
    pub addresses: Vec<Address>,
    pub pattern: ScriptType,
    pub required_signers: u32,
}

impl ScriptInfo {
    fn single(address: Address, pattern: ScriptType) -> Self {
        ScriptInfo {
            addresses: vec![address],
            pattern,
            required_signers: 1,
        }
    }

    fn empty(pattern: ScriptType) -> Self {
        ScriptInfo {
            addresses: Vec::new(),
            pattern,
            required_signers: 1,
        }
    }
}

/// One instruction of a script, data pushes normalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Push(&'a [u8]),
    Op(u8),
}

///
/// Split a script into instructions. Returns `None` if a push
/// would read past the end of the script.
///
fn tokenize(script: &[u8]) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < script.len() {
        let op = script[i];
        i += 1;
        let len = match op {
            1..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let n = *script.get(i)? as usize;
                i += 1;
                n
            }
            OP_PUSHDATA2 => {
                let n = LittleEndian::read_u16(script.get(i..i + 2)?) as usize;
                i += 2;
                n
            }
            OP_PUSHDATA4 => {
                let n = LittleEndian::read_u32(script.get(i..i + 4)?) as usize;
                i += 4;
                n
            }
            _ => {
                tokens.push(Op(op));
                continue;
            }
        };
        let end = i.checked_add(len)?;
        tokens.push(Push(script.get(i..end)?));
        i = end;
    }
    Some(tokens)
}

///
/// Classify an output script. Never fails: scripts matching no
/// template come back as `ScriptType::NotRecognised`.
///
pub fn evaluate_script(script: &[u8]) -> ScriptInfo {
    let tokens = match tokenize(script) {
        Some(tokens) => tokens,
        None => return ScriptInfo::empty(ScriptType::NotRecognised),
    };
    let mut rest = tokens.as_slice();
    loop {
        match rest {
            // nothing left but decorations
            [] => return ScriptInfo::empty(ScriptType::Unspendable),
            [Push(_), Op(OP_DROP), tail @ ..] => rest = tail,
            [Op(OP_RETURN), ..] | [Push(_)] => {
                return ScriptInfo::empty(ScriptType::Unspendable)
            }
            _ => return match_templates(rest),
        }
    }
}

///
/// Classify, turning `NotRecognised` into an `UnknownScript` error
/// unless the caller tolerates unknown scripts.
///
pub fn classify(script: &[u8], tolerate_unknown: bool) -> OpResult<ScriptInfo> {
    let info = evaluate_script(script);
    if info.pattern == ScriptType::NotRecognised && !tolerate_unknown {
        return Err(OpError::new(OpErrorKind::UnknownScript)
            .join_msg(&format!("unrecognised script of {} bytes", script.len())));
    }
    Ok(info)
}

fn match_templates(tokens: &[Token]) -> ScriptInfo {
    match tokens {
        [Op(OP_DUP), Op(OP_HASH160), Push(h), Op(OP_EQUALVERIFY), Op(OP_CHECKSIG)]
        | [Op(OP_DUP), Op(OP_HASH160), Push(h), Op(OP_EQUALVERIFY), Op(OP_CHECKSIG), Op(OP_NOP)]
        | [Op(OP_DUP), Op(OP_DUP), Op(OP_HASH160), Op(OP_DROP), Op(OP_HASH160), Push(h), Op(OP_EQUALVERIFY), Op(OP_CHECKSIG)]
            if h.len() == 20 =>
        {
            ScriptInfo::single(
                Address::hash20(AddressKind::PubkeyHash, h),
                ScriptType::Pay2PublicKeyHash,
            )
        }
        [Op(OP_HASH256), Push(guard), Op(OP_EQUALVERIFY), Op(OP_DUP), Op(OP_HASH160), Push(h), Op(OP_EQUALVERIFY), Op(OP_CHECKSIG)]
            if guard.len() == 32 && h.len() == 20 =>
        {
            ScriptInfo::single(
                Address::hash20(AddressKind::PubkeyHash, h),
                ScriptType::Pay2PublicKeyHash,
            )
        }
        [Push(pk), Op(OP_CHECKSIG)] if is_pubkey(pk) => {
            ScriptInfo::single(pubkey_address(pk), ScriptType::Pay2PublicKey)
        }
        [Op(OP_HASH160), Push(h), Op(OP_EQUAL)] if h.len() == 20 => ScriptInfo::single(
            Address::hash20(AddressKind::ScriptHash, h),
            ScriptType::Pay2ScriptHash,
        ),
        [Op(OP_0), Push(h)] if h.len() == 20 => ScriptInfo::single(
            Address::hash20(AddressKind::WitnessKeyHash, h),
            ScriptType::Pay2WitnessPublicKeyHash,
        ),
        [Op(OP_0), Push(h)] if h.len() == 32 => ScriptInfo::single(
            Address::hash32(AddressKind::WitnessScriptHash, h),
            ScriptType::Pay2WitnessScriptHash,
        ),
        _ => multisig(tokens).unwrap_or_else(|| ScriptInfo::empty(ScriptType::NotRecognised)),
    }
}

///
/// Bare `M <pk>... N CHECKMULTISIG`.
///
/// M is only checked against `0 <= M <= N`, so a zero threshold is
/// accepted as it is on chain.
///
fn multisig(tokens: &[Token]) -> Option<ScriptInfo> {
    if tokens.len() < 4 || *tokens.last()? != Op(OP_CHECKMULTISIG) {
        return None;
    }
    let n = decode_number(&tokens[tokens.len() - 2])?;
    if n < 1 || n > MAX_MULTISIG_KEYS || tokens.len() != n as usize + 3 {
        return None;
    }
    let m = decode_number(&tokens[0])?;
    if m > n {
        return None;
    }
    let mut addresses = Vec::with_capacity(n as usize);
    for token in &tokens[1..tokens.len() - 2] {
        match token {
            Push(pk) if is_pubkey(pk) => addresses.push(pubkey_address(pk)),
            _ => return None,
        }
    }
    Some(ScriptInfo {
        addresses,
        pattern: ScriptType::Pay2MultiSig,
        required_signers: m,
    })
}

/// Small-int opcode or a 1 to 4 byte little-endian push.
fn decode_number(token: &Token) -> Option<u32> {
    match token {
        Op(OP_0) => Some(0),
        Op(op) if (OP_1..=OP_16).contains(op) => Some((op - OP_1 + 1) as u32),
        Push(data) if !data.is_empty() && data.len() <= 4 => {
            Some(LittleEndian::read_uint(data, data.len()) as u32)
        }
        _ => None,
    }
}

#[inline]
fn is_pubkey(data: &[u8]) -> bool {
    data.len() == 33 || data.len() == 65
}

#[inline]
fn pubkey_address(pk: &[u8]) -> Address {
    let pkh = hash160::Hash::hash(pk);
    Address::hash20(AddressKind::Pubkey, &pkh[..])
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ScriptType::Pay2MultiSig => write!(f, "Pay2MultiSig"),
            ScriptType::Pay2PublicKey => write!(f, "Pay2PublicKey"),
            ScriptType::Pay2PublicKeyHash => write!(f, "Pay2PublicKeyHash"),
            ScriptType::Pay2ScriptHash => write!(f, "Pay2ScriptHash"),
            ScriptType::Pay2WitnessPublicKeyHash => write!(f, "Pay2WitnessPublicKeyHash"),
            ScriptType::Pay2WitnessScriptHash => write!(f, "Pay2WitnessScriptHash"),
            ScriptType::Unspendable => write!(f, "Unspendable"),
            ScriptType::NotRecognised => write!(f, "NotRecognised"),
        }
    }
}

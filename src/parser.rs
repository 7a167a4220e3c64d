/// Block and Transaction Deserialization
///
/// Parses raw block bytes into header + transaction list, keeping the
/// original byte span of every transaction so re-serialization is
/// byte-identical. Witness data is preserved so txid and wtxid can be
/// reported separately.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use sha2::{Digest, Sha256};

use crate::error::ChainError;
use crate::types::{Outpoint, TxHash, ZERO_HASH};

pub const HEADER_SIZE: usize = 80;

/// Sequence values at or above this opt out of replace-by-fee.
pub const SEQUENCE_FINAL_RBF: u32 = 0xFFFF_FFFE;

pub fn sha256d(data: &[u8]) -> TxHash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// The 80-byte wire header plus its hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    pub bytes: [u8; 80],
}

impl RawHeader {
    pub fn from_slice(data: &[u8]) -> Result<RawHeader, ChainError> {
        if data.len() < HEADER_SIZE {
            return Err(ChainError::MalformedBlock(format!(
                "header truncated at {} bytes",
                data.len()
            )));
        }
        let mut bytes = [0u8; 80];
        bytes.copy_from_slice(&data[..HEADER_SIZE]);
        Ok(RawHeader { bytes })
    }

    pub fn hash(&self) -> TxHash {
        sha256d(&self.bytes)
    }

    pub fn version(&self) -> i32 {
        i32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    pub fn prev_hash(&self) -> TxHash {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.bytes[4..36]);
        out
    }

    pub fn merkle_root(&self) -> TxHash {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.bytes[36..68]);
        out
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_le_bytes([self.bytes[68], self.bytes[69], self.bytes[70], self.bytes[71]])
    }

    pub fn bits(&self) -> u32 {
        u32::from_le_bytes([self.bytes[72], self.bytes[73], self.bytes[74], self.bytes[75]])
    }

    pub fn nonce(&self) -> u32 {
        u32::from_le_bytes([self.bytes[76], self.bytes[77], self.bytes[78], self.bytes[79]])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTxIn {
    pub outpoint: Outpoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl ParsedTxIn {
    pub fn is_coinbase(&self) -> bool {
        self.outpoint.txid == ZERO_HASH && self.outpoint.index == u32::MAX
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTxOut {
    pub value: u64,
    pub script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTx {
    /// Full serialization, witness included. The authoritative bytes.
    pub raw: Vec<u8>,
    pub txid: TxHash,
    pub wtxid: TxHash,
    pub version: i32,
    pub inputs: Vec<ParsedTxIn>,
    pub outputs: Vec<ParsedTxOut>,
    pub lock_time: u32,
    pub has_witness: bool,
}

impl ParsedTx {
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase()
    }

    /// Replace-by-fee marker: any input signals a non-final sequence.
    pub fn signals_rbf(&self) -> bool {
        self.inputs.iter().any(|i| i.sequence < SEQUENCE_FINAL_RBF)
    }

    pub fn total_output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ParsedBlock {
    pub header: RawHeader,
    pub txs: Vec<ParsedTx>,
    /// Serialized size of the whole block.
    pub size: usize,
}

impl ParsedBlock {
    pub fn hash(&self) -> TxHash {
        self.header.hash()
    }

    /// Byte-identical re-serialization of the parsed block.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        out.extend_from_slice(&self.header.bytes);
        write_varint(&mut out, self.txs.len() as u64);
        for tx in &self.txs {
            out.extend_from_slice(&tx.raw);
        }
        out
    }
}

pub fn read_varint(cursor: &mut Cursor<&[u8]>) -> Result<u64, std::io::Error> {
    let first = cursor.read_u8()?;
    let value = match first {
        0x00..=0xfc => u64::from(first),
        0xfd => u64::from(cursor.read_u16::<LittleEndian>()?),
        0xfe => u64::from(cursor.read_u32::<LittleEndian>()?),
        0xff => cursor.read_u64::<LittleEndian>()?,
    };
    Ok(value)
}

pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: u64) -> Result<Vec<u8>, ChainError> {
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if len > remaining {
        return Err(ChainError::MalformedBlock(format!(
            "declared length {} exceeds remaining {}",
            len, remaining
        )));
    }
    let mut buf = vec![0u8; len as usize];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| ChainError::MalformedBlock(e.to_string()))?;
    Ok(buf)
}

fn malformed<T>(e: impl ToString) -> Result<T, ChainError> {
    Err(ChainError::MalformedBlock(e.to_string()))
}

/// Deserialize one transaction starting at the cursor position. The cursor
/// is left at the first byte past the transaction.
pub fn parse_tx(cursor: &mut Cursor<&[u8]>) -> Result<ParsedTx, ChainError> {
    let start = cursor.position() as usize;
    let version = cursor
        .read_i32::<LittleEndian>()
        .or_else(malformed)?;

    // Segwit marker: zero input count followed by flag 0x01.
    let mut input_count = read_varint(cursor).map_err(|e| ChainError::MalformedBlock(e.to_string()))?;
    let mut has_witness = false;
    if input_count == 0 {
        let flag = cursor.read_u8().or_else(malformed)?;
        if flag != 0x01 {
            return Err(ChainError::MalformedBlock(format!(
                "bad segwit flag {:#x}",
                flag
            )));
        }
        has_witness = true;
        input_count = read_varint(cursor).map_err(|e| ChainError::MalformedBlock(e.to_string()))?;
    }
    if input_count == 0 {
        return Err(ChainError::MalformedBlock("transaction with no inputs".into()));
    }

    let mut inputs = Vec::with_capacity(input_count.min(1024) as usize);
    for _ in 0..input_count {
        let mut txid = [0u8; 32];
        cursor.read_exact(&mut txid).or_else(malformed)?;
        let index = cursor.read_u32::<LittleEndian>().or_else(malformed)?;
        let script_len = read_varint(cursor).map_err(|e| ChainError::MalformedBlock(e.to_string()))?;
        let script_sig = read_bytes(cursor, script_len)?;
        let sequence = cursor.read_u32::<LittleEndian>().or_else(malformed)?;
        inputs.push(ParsedTxIn {
            outpoint: Outpoint::new(txid, index),
            script_sig,
            sequence,
            witness: Vec::new(),
        });
    }

    let output_count = read_varint(cursor).map_err(|e| ChainError::MalformedBlock(e.to_string()))?;
    let mut outputs = Vec::with_capacity(output_count.min(1024) as usize);
    for _ in 0..output_count {
        let value = cursor.read_u64::<LittleEndian>().or_else(malformed)?;
        let script_len = read_varint(cursor).map_err(|e| ChainError::MalformedBlock(e.to_string()))?;
        let script = read_bytes(cursor, script_len)?;
        outputs.push(ParsedTxOut { value, script });
    }

    let witness_start = cursor.position() as usize;
    if has_witness {
        for input in inputs.iter_mut() {
            let item_count = read_varint(cursor).map_err(|e| ChainError::MalformedBlock(e.to_string()))?;
            let mut items = Vec::with_capacity(item_count.min(64) as usize);
            for _ in 0..item_count {
                let item_len = read_varint(cursor).map_err(|e| ChainError::MalformedBlock(e.to_string()))?;
                items.push(read_bytes(cursor, item_len)?);
            }
            input.witness = items;
        }
    }
    let witness_end = cursor.position() as usize;

    let lock_time = cursor.read_u32::<LittleEndian>().or_else(malformed)?;
    let end = cursor.position() as usize;

    let full = cursor.get_ref();
    let raw = full[start..end].to_vec();
    let wtxid = sha256d(&raw);

    // txid always hashes the stripped serialization.
    let txid = if has_witness {
        let mut stripped = Vec::with_capacity(raw.len());
        stripped.extend_from_slice(&full[start..start + 4]);
        // Skip the two marker bytes after the version.
        stripped.extend_from_slice(&full[start + 6..witness_start]);
        stripped.extend_from_slice(&full[witness_end..end]);
        sha256d(&stripped)
    } else {
        wtxid
    };

    Ok(ParsedTx {
        raw,
        txid,
        wtxid,
        version,
        inputs,
        outputs,
        lock_time,
        has_witness,
    })
}

pub fn parse_tx_bytes(data: &[u8]) -> Result<ParsedTx, ChainError> {
    let mut cursor = Cursor::new(data);
    let tx = parse_tx(&mut cursor)?;
    if cursor.position() as usize != data.len() {
        return Err(ChainError::MalformedBlock(format!(
            "{} trailing bytes after transaction",
            data.len() - cursor.position() as usize
        )));
    }
    Ok(tx)
}

/// Deserialize a full raw block. The claimed contents must consume the
/// buffer exactly.
pub fn parse_block(data: &[u8]) -> Result<ParsedBlock, ChainError> {
    let header = RawHeader::from_slice(data)?;
    let mut cursor = Cursor::new(data);
    cursor.set_position(HEADER_SIZE as u64);

    let tx_count = read_varint(&mut cursor).map_err(|e| ChainError::MalformedBlock(e.to_string()))?;
    if tx_count == 0 {
        return Err(ChainError::MalformedBlock("block with no transactions".into()));
    }

    let mut txs = Vec::with_capacity(tx_count.min(16_384) as usize);
    for _ in 0..tx_count {
        txs.push(parse_tx(&mut cursor)?);
    }

    if cursor.position() as usize != data.len() {
        return Err(ChainError::MalformedBlock(format!(
            "declared contents end at {} but block is {} bytes",
            cursor.position(),
            data.len()
        )));
    }

    Ok(ParsedBlock {
        header,
        txs,
        size: data.len(),
    })
}

/// Minimal transaction builder used by the admission path and tests to
/// assemble well-formed raw transactions.
pub struct TxBuilder {
    version: i32,
    inputs: Vec<(Outpoint, Vec<u8>, u32)>,
    outputs: Vec<(u64, Vec<u8>)>,
    lock_time: u32,
}

impl TxBuilder {
    pub fn new() -> Self {
        Self {
            version: 2,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
        }
    }

    pub fn input(mut self, outpoint: Outpoint, script_sig: Vec<u8>, sequence: u32) -> Self {
        self.inputs.push((outpoint, script_sig, sequence));
        self
    }

    pub fn output(mut self, value: u64, script: Vec<u8>) -> Self {
        self.outputs.push((value, script));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut out, self.inputs.len() as u64);
        for (outpoint, script_sig, sequence) in &self.inputs {
            out.extend_from_slice(&outpoint.txid);
            out.extend_from_slice(&outpoint.index.to_le_bytes());
            write_varint(&mut out, script_sig.len() as u64);
            out.extend_from_slice(script_sig);
            out.extend_from_slice(&sequence.to_le_bytes());
        }
        write_varint(&mut out, self.outputs.len() as u64);
        for (value, script) in &self.outputs {
            out.extend_from_slice(&value.to_le_bytes());
            write_varint(&mut out, script.len() as u64);
            out.extend_from_slice(script);
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out
    }
}

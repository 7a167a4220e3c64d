/// Store Key Helpers
///
/// Centralized helpers for the column-family key formats. One routing
/// prefix byte per record type, big-endian heights so range scans walk in
/// height order, and length-prefixed scripthashes so a shorter hash can
/// never alias a longer one's prefix range.
///
/// KEY FORMATS:
/// - headers:  'h' + hash(32)                  -> HeaderRecord
///             'i' + be_height(4)              -> main-branch hash
/// - blkdata:  'b' + be_height(4)              -> BlockDataRecord
/// - stxo:     'S' + be_height(4) + le_tx(2) + le_out(2) -> StxoRecord
///             'O' + txid(32) + le_index(4)    -> OutpointRef
/// - subssh:   'A' + len(1) + scripthash + be_height(4)  -> Vec<SubSshEntry>
/// - ssh:      'B' + len(1) + scripthash       -> SshRecord
/// - txhints:  'T' + txid[0..4]                -> Vec<TxPosition>
/// - zeroconf: 'Z' + txid(32)                  -> ZcPersistRecord
/// - history:  'N' + len(1) + scripthash       -> txio count (u64)
/// - any CF:   'P'                             -> ProgressRecord
/// - headers:  'V'                             -> schema version (u32)

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::types::TxHash;

pub const PROGRESS_KEY: [u8; 1] = [b'P'];
pub const SCHEMA_KEY: [u8; 1] = [b'V'];

pub fn header_key(hash: &TxHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'h');
    key.extend_from_slice(hash);
    key
}

pub fn height_index_key(height: u32) -> Vec<u8> {
    let mut key = vec![b'i', 0, 0, 0, 0];
    BigEndian::write_u32(&mut key[1..5], height);
    key
}

pub fn blkdata_key(height: u32) -> Vec<u8> {
    let mut key = vec![b'b', 0, 0, 0, 0];
    BigEndian::write_u32(&mut key[1..5], height);
    key
}

pub fn stxo_key(height: u32, tx_index: u16, out_index: u16) -> Vec<u8> {
    let mut key = vec![0u8; 9];
    key[0] = b'S';
    BigEndian::write_u32(&mut key[1..5], height);
    LittleEndian::write_u16(&mut key[5..7], tx_index);
    LittleEndian::write_u16(&mut key[7..9], out_index);
    key
}

pub fn outpoint_key(txid: &TxHash, index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(37);
    key.push(b'O');
    key.extend_from_slice(txid);
    let mut idx = [0u8; 4];
    LittleEndian::write_u32(&mut idx, index);
    key.extend_from_slice(&idx);
    key
}

pub fn subssh_prefix(scripthash: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + scripthash.len());
    key.push(b'A');
    key.push(scripthash.len() as u8);
    key.extend_from_slice(scripthash);
    key
}

pub fn subssh_key(scripthash: &[u8], height: u32) -> Vec<u8> {
    let mut key = subssh_prefix(scripthash);
    let mut h = [0u8; 4];
    BigEndian::write_u32(&mut h, height);
    key.extend_from_slice(&h);
    key
}

/// Height encoded in a subssh key, given the scripthash length.
pub fn subssh_key_height(key: &[u8]) -> Option<u32> {
    if key.len() < 7 || key[0] != b'A' {
        return None;
    }
    let hash_len = key[1] as usize;
    if key.len() != 2 + hash_len + 4 {
        return None;
    }
    Some(BigEndian::read_u32(&key[2 + hash_len..]))
}

pub fn ssh_key(scripthash: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + scripthash.len());
    key.push(b'B');
    key.push(scripthash.len() as u8);
    key.extend_from_slice(scripthash);
    key
}

pub fn txhint_key(txid: &TxHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.push(b'T');
    key.extend_from_slice(&txid[0..4]);
    key
}

pub fn zc_key(txid: &TxHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'Z');
    key.extend_from_slice(txid);
    key
}

pub fn txio_count_key(scripthash: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + scripthash.len());
    key.push(b'N');
    key.push(scripthash.len() as u8);
    key.extend_from_slice(scripthash);
    key
}

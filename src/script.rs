/// Output Script Handling
///
/// Two concerns: deriving the scripthash index key from an output script,
/// and evaluating an input (script_sig + witness) against the output it
/// spends during zero-confirmation admission.
///
/// SCRIPTHASH KEY FORMAT (one type byte + payload):
/// - 0x00 + hash160       P2PKH / P2PK (same address space)
/// - 0x01 + hash160       P2SH
/// - 0x02 + 20 bytes      P2WPKH program
/// - 0x03 + 32 bytes      P2WSH program
/// - 0x04 + hash160(raw)  everything else, keyed by script digest

use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use sha2::{Digest, Sha256};

use crate::error::ZcError;
use crate::parser::{write_varint, ParsedTx};
use crate::types::ScriptHash;

const OP_0: u8 = 0x00;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_RETURN: u8 = 0x6a;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Standard script templates the engine resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptKind {
    P2pkh([u8; 20]),
    P2pk(Vec<u8>),
    P2sh([u8; 20]),
    P2wpkh([u8; 20]),
    P2wsh([u8; 32]),
    Multisig { m: usize, keys: Vec<Vec<u8>> },
    OpReturn,
    Nonstandard,
}

pub fn classify(script: &[u8]) -> ScriptKind {
    // P2PKH: OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        let mut h = [0u8; 20];
        h.copy_from_slice(&script[3..23]);
        return ScriptKind::P2pkh(h);
    }
    // P2SH: OP_HASH160 <20> OP_EQUAL
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL {
        let mut h = [0u8; 20];
        h.copy_from_slice(&script[2..22]);
        return ScriptKind::P2sh(h);
    }
    // P2WPKH: OP_0 <20>
    if script.len() == 22 && script[0] == OP_0 && script[1] == 20 {
        let mut h = [0u8; 20];
        h.copy_from_slice(&script[2..22]);
        return ScriptKind::P2wpkh(h);
    }
    // P2WSH: OP_0 <32>
    if script.len() == 34 && script[0] == OP_0 && script[1] == 32 {
        let mut h = [0u8; 32];
        h.copy_from_slice(&script[2..34]);
        return ScriptKind::P2wsh(h);
    }
    // P2PK: <33|65> OP_CHECKSIG
    if (script.len() == 35 && script[0] == 33 || script.len() == 67 && script[0] == 65)
        && script[script.len() - 1] == OP_CHECKSIG
    {
        return ScriptKind::P2pk(script[1..script.len() - 1].to_vec());
    }
    if !script.is_empty() && script[0] == OP_RETURN {
        return ScriptKind::OpReturn;
    }
    // Bare multisig: OP_m <keys...> OP_n OP_CHECKMULTISIG
    if script.len() > 3
        && script[script.len() - 1] == OP_CHECKMULTISIG
        && (OP_1..=OP_16).contains(&script[0])
    {
        if let Some(kind) = parse_multisig(script) {
            return kind;
        }
    }
    ScriptKind::Nonstandard
}

fn parse_multisig(script: &[u8]) -> Option<ScriptKind> {
    let m = (script[0] - OP_1 + 1) as usize;
    let n_op = script[script.len() - 2];
    if !(OP_1..=OP_16).contains(&n_op) {
        return None;
    }
    let n = (n_op - OP_1 + 1) as usize;
    let mut keys = Vec::with_capacity(n);
    let mut pos = 1;
    for _ in 0..n {
        let len = *script.get(pos)? as usize;
        if len != 33 && len != 65 {
            return None;
        }
        keys.push(script.get(pos + 1..pos + 1 + len)?.to_vec());
        pos += 1 + len;
    }
    if pos != script.len() - 2 || m > n {
        return None;
    }
    Some(ScriptKind::Multisig { m, keys })
}

/// Index key for an output script. OP_RETURN outputs carry no balance and
/// yield `None`.
pub fn scripthash_of(script: &[u8]) -> Option<ScriptHash> {
    let mut key;
    match classify(script) {
        ScriptKind::P2pkh(h) => {
            key = vec![0x00];
            key.extend_from_slice(&h);
        }
        ScriptKind::P2pk(pubkey) => {
            key = vec![0x00];
            key.extend_from_slice(&hash160(&pubkey));
        }
        ScriptKind::P2sh(h) => {
            key = vec![0x01];
            key.extend_from_slice(&h);
        }
        ScriptKind::P2wpkh(h) => {
            key = vec![0x02];
            key.extend_from_slice(&h);
        }
        ScriptKind::P2wsh(h) => {
            key = vec![0x03];
            key.extend_from_slice(&h);
        }
        ScriptKind::OpReturn => return None,
        ScriptKind::Multisig { .. } | ScriptKind::Nonstandard => {
            key = vec![0x04];
            key.extend_from_slice(&hash160(script));
        }
    }
    Some(key)
}

/// Split a script into push items; `None` for anything but pure pushes.
fn push_items(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut items = Vec::new();
    let mut pos = 0usize;
    while pos < script.len() {
        let op = script[pos];
        pos += 1;
        let len = match op {
            0x01..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let l = *script.get(pos)? as usize;
                pos += 1;
                l
            }
            OP_PUSHDATA2 => {
                let l = u16::from_le_bytes([*script.get(pos)?, *script.get(pos + 1)?]) as usize;
                pos += 2;
                l
            }
            OP_PUSHDATA4 => {
                let l = u32::from_le_bytes([
                    *script.get(pos)?,
                    *script.get(pos + 1)?,
                    *script.get(pos + 2)?,
                    *script.get(pos + 3)?,
                ]) as usize;
                pos += 4;
                l
            }
            OP_0 => {
                items.push(Vec::new());
                continue;
            }
            _ => return None,
        };
        items.push(script.get(pos..pos + len)?.to_vec());
        pos += len;
    }
    Some(items)
}

/// Legacy SIGHASH_ALL digest for `input_index` with `script_code` standing
/// in for the spent script.
pub fn legacy_sighash_all(tx: &ParsedTx, input_index: usize, script_code: &[u8]) -> [u8; 32] {
    let mut ser = Vec::new();
    ser.extend_from_slice(&tx.version.to_le_bytes());
    write_varint(&mut ser, tx.inputs.len() as u64);
    for (i, input) in tx.inputs.iter().enumerate() {
        ser.extend_from_slice(&input.outpoint.txid);
        ser.extend_from_slice(&input.outpoint.index.to_le_bytes());
        if i == input_index {
            write_varint(&mut ser, script_code.len() as u64);
            ser.extend_from_slice(script_code);
        } else {
            ser.push(0x00);
        }
        ser.extend_from_slice(&input.sequence.to_le_bytes());
    }
    write_varint(&mut ser, tx.outputs.len() as u64);
    for output in &tx.outputs {
        ser.extend_from_slice(&output.value.to_le_bytes());
        write_varint(&mut ser, output.script.len() as u64);
        ser.extend_from_slice(&output.script);
    }
    ser.extend_from_slice(&tx.lock_time.to_le_bytes());
    ser.extend_from_slice(&1u32.to_le_bytes()); // SIGHASH_ALL
    crate::parser::sha256d(&ser)
}

/// BIP143 SIGHASH_ALL digest for segwit v0 inputs.
pub fn bip143_sighash_all(
    tx: &ParsedTx,
    input_index: usize,
    script_code: &[u8],
    value: u64,
) -> [u8; 32] {
    let mut prevouts = Vec::new();
    let mut sequences = Vec::new();
    for input in &tx.inputs {
        prevouts.extend_from_slice(&input.outpoint.txid);
        prevouts.extend_from_slice(&input.outpoint.index.to_le_bytes());
        sequences.extend_from_slice(&input.sequence.to_le_bytes());
    }
    let mut outputs = Vec::new();
    for output in &tx.outputs {
        outputs.extend_from_slice(&output.value.to_le_bytes());
        write_varint(&mut outputs, output.script.len() as u64);
        outputs.extend_from_slice(&output.script);
    }

    let input = &tx.inputs[input_index];
    let mut ser = Vec::new();
    ser.extend_from_slice(&tx.version.to_le_bytes());
    ser.extend_from_slice(&crate::parser::sha256d(&prevouts));
    ser.extend_from_slice(&crate::parser::sha256d(&sequences));
    ser.extend_from_slice(&input.outpoint.txid);
    ser.extend_from_slice(&input.outpoint.index.to_le_bytes());
    write_varint(&mut ser, script_code.len() as u64);
    ser.extend_from_slice(script_code);
    ser.extend_from_slice(&value.to_le_bytes());
    ser.extend_from_slice(&input.sequence.to_le_bytes());
    ser.extend_from_slice(&crate::parser::sha256d(&outputs));
    ser.extend_from_slice(&tx.lock_time.to_le_bytes());
    ser.extend_from_slice(&1u32.to_le_bytes());
    crate::parser::sha256d(&ser)
}

fn p2pkh_script_code(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut code = vec![OP_DUP, OP_HASH160, 20];
    code.extend_from_slice(pubkey_hash);
    code.push(OP_EQUALVERIFY);
    code.push(OP_CHECKSIG);
    code
}

fn check_signature(
    secp: &Secp256k1<VerifyOnly>,
    sig_bytes: &[u8],
    pubkey_bytes: &[u8],
    digest: &[u8; 32],
) -> Result<(), ZcError> {
    if sig_bytes.is_empty() {
        return Err(ZcError::ScriptInvalid("empty signature".into()));
    }
    // Trailing byte is the sighash type; only SIGHASH_ALL is admitted.
    let (der, hashtype) = sig_bytes.split_at(sig_bytes.len() - 1);
    if hashtype[0] != 0x01 {
        return Err(ZcError::ScriptInvalid(format!(
            "unsupported sighash type {:#x}",
            hashtype[0]
        )));
    }
    let sig = Signature::from_der(der)
        .map_err(|e| ZcError::ScriptInvalid(format!("bad der signature: {}", e)))?;
    let pubkey = PublicKey::from_slice(pubkey_bytes)
        .map_err(|e| ZcError::ScriptInvalid(format!("bad pubkey: {}", e)))?;
    let msg = Message::from_slice(digest).map_err(|e| ZcError::ScriptInvalid(e.to_string()))?;
    secp.verify_ecdsa(&msg, &sig, &pubkey)
        .map_err(|_| ZcError::ScriptInvalid("signature check failed".into()))
}

fn check_multisig(
    secp: &Secp256k1<VerifyOnly>,
    m: usize,
    keys: &[Vec<u8>],
    sigs: &[Vec<u8>],
    digest: &[u8; 32],
) -> Result<(), ZcError> {
    if sigs.len() < m {
        return Err(ZcError::ScriptInvalid(format!(
            "{} signatures for {}-of-{}",
            sigs.len(),
            m,
            keys.len()
        )));
    }
    // Signatures must match key order; walk both lists once.
    let mut matched = 0usize;
    let mut key_iter = keys.iter();
    'sigs: for sig in sigs.iter().take(m) {
        for key in key_iter.by_ref() {
            if check_signature(secp, sig, key, digest).is_ok() {
                matched += 1;
                continue 'sigs;
            }
        }
        break;
    }
    if matched < m {
        return Err(ZcError::ScriptInvalid("multisig threshold not met".into()));
    }
    Ok(())
}

/// Validate one input of `tx` against the output script and value it spends.
pub fn verify_input(
    secp: &Secp256k1<VerifyOnly>,
    tx: &ParsedTx,
    input_index: usize,
    spent_script: &[u8],
    spent_value: u64,
) -> Result<(), ZcError> {
    let input = &tx.inputs[input_index];
    match classify(spent_script) {
        ScriptKind::P2pkh(pubkey_hash) => {
            let items = push_items(&input.script_sig)
                .ok_or_else(|| ZcError::ScriptInvalid("script_sig is not push-only".into()))?;
            let [sig, pubkey] = items.as_slice() else {
                return Err(ZcError::ScriptInvalid("p2pkh wants <sig> <pubkey>".into()));
            };
            if hash160(pubkey) != pubkey_hash {
                return Err(ZcError::ScriptInvalid("pubkey hash mismatch".into()));
            }
            let digest = legacy_sighash_all(tx, input_index, spent_script);
            check_signature(secp, sig, pubkey, &digest)
        }
        ScriptKind::P2pk(pubkey) => {
            let items = push_items(&input.script_sig)
                .ok_or_else(|| ZcError::ScriptInvalid("script_sig is not push-only".into()))?;
            let [sig] = items.as_slice() else {
                return Err(ZcError::ScriptInvalid("p2pk wants <sig>".into()));
            };
            let digest = legacy_sighash_all(tx, input_index, spent_script);
            check_signature(secp, sig, &pubkey, &digest)
        }
        ScriptKind::P2sh(script_hash) => {
            let mut items = push_items(&input.script_sig)
                .ok_or_else(|| ZcError::ScriptInvalid("script_sig is not push-only".into()))?;
            let redeem = items
                .pop()
                .ok_or_else(|| ZcError::ScriptInvalid("empty p2sh script_sig".into()))?;
            if hash160(&redeem) != script_hash {
                return Err(ZcError::ScriptInvalid("redeem script hash mismatch".into()));
            }
            match classify(&redeem) {
                ScriptKind::Multisig { m, keys } => {
                    // Leading OP_0 pads CHECKMULTISIG's off-by-one pop.
                    let sigs: Vec<Vec<u8>> =
                        items.into_iter().filter(|i| !i.is_empty()).collect();
                    let digest = legacy_sighash_all(tx, input_index, &redeem);
                    check_multisig(secp, m, &keys, &sigs, &digest)
                }
                _ => Err(ZcError::ScriptInvalid("unsupported redeem script".into())),
            }
        }
        ScriptKind::P2wpkh(pubkey_hash) => {
            let [sig, pubkey] = input.witness.as_slice() else {
                return Err(ZcError::ScriptInvalid("p2wpkh wants 2 witness items".into()));
            };
            if hash160(pubkey) != pubkey_hash {
                return Err(ZcError::ScriptInvalid("witness pubkey hash mismatch".into()));
            }
            let code = p2pkh_script_code(&pubkey_hash);
            let digest = bip143_sighash_all(tx, input_index, &code, spent_value);
            check_signature(secp, sig, pubkey, &digest)
        }
        ScriptKind::P2wsh(script_hash) => {
            let Some((witness_script, sig_items)) = input.witness.split_last() else {
                return Err(ZcError::ScriptInvalid("empty p2wsh witness".into()));
            };
            if sha256(witness_script) != script_hash {
                return Err(ZcError::ScriptInvalid("witness script hash mismatch".into()));
            }
            match classify(witness_script) {
                ScriptKind::Multisig { m, keys } => {
                    let sigs: Vec<Vec<u8>> = sig_items
                        .iter()
                        .filter(|i| !i.is_empty())
                        .cloned()
                        .collect();
                    let digest =
                        bip143_sighash_all(tx, input_index, witness_script, spent_value);
                    check_multisig(secp, m, &keys, &sigs, &digest)
                }
                _ => Err(ZcError::ScriptInvalid("unsupported witness script".into())),
            }
        }
        ScriptKind::Multisig { m, keys } => {
            let items = push_items(&input.script_sig)
                .ok_or_else(|| ZcError::ScriptInvalid("script_sig is not push-only".into()))?;
            let sigs: Vec<Vec<u8>> = items.into_iter().filter(|i| !i.is_empty()).collect();
            let digest = legacy_sighash_all(tx, input_index, spent_script);
            check_multisig(secp, m, &keys, &sigs, &digest)
        }
        ScriptKind::OpReturn => Err(ZcError::ScriptInvalid("spend of op_return output".into())),
        ScriptKind::Nonstandard => {
            Err(ZcError::ScriptInvalid("nonstandard output script".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_tx_bytes, TxBuilder};
    use crate::types::Outpoint;
    use secp256k1::{All, SecretKey};

    fn keypair(byte: u8) -> (SecretKey, PublicKey, Secp256k1<All>) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        (sk, pk, secp)
    }

    fn p2pkh_script(pubkey: &PublicKey) -> Vec<u8> {
        p2pkh_script_code(&hash160(&pubkey.serialize()))
    }

    #[test]
    fn test_classify_standard_templates() {
        let (_, pk, _) = keypair(7);
        let script = p2pkh_script(&pk);
        assert!(matches!(classify(&script), ScriptKind::P2pkh(_)));

        let mut p2sh = vec![OP_HASH160, 20];
        p2sh.extend_from_slice(&[0xAB; 20]);
        p2sh.push(OP_EQUAL);
        assert_eq!(classify(&p2sh), ScriptKind::P2sh([0xAB; 20]));

        let mut wpkh = vec![OP_0, 20];
        wpkh.extend_from_slice(&[0xCD; 20]);
        assert_eq!(classify(&wpkh), ScriptKind::P2wpkh([0xCD; 20]));

        assert_eq!(classify(&[OP_RETURN, 0x01, 0xFF]), ScriptKind::OpReturn);
        assert_eq!(classify(&[0x99, 0x98]), ScriptKind::Nonstandard);
    }

    #[test]
    fn test_scripthash_keys_are_typed() {
        let (_, pk, _) = keypair(9);
        let pkh_key = scripthash_of(&p2pkh_script(&pk)).unwrap();
        assert_eq!(pkh_key.len(), 21);
        assert_eq!(pkh_key[0], 0x00);

        let mut wsh = vec![OP_0, 32];
        wsh.extend_from_slice(&[0x11; 32]);
        let wsh_key = scripthash_of(&wsh).unwrap();
        assert_eq!(wsh_key.len(), 33);
        assert_eq!(wsh_key[0], 0x03);

        assert!(scripthash_of(&[OP_RETURN]).is_none());
    }

    #[test]
    fn test_p2pkh_spend_verifies() {
        let (sk, pk, secp) = keypair(3);
        let spent_script = p2pkh_script(&pk);

        let unsigned = TxBuilder::new()
            .input(Outpoint::new([0x42; 32], 0), vec![], 0xFFFF_FFFF)
            .output(40_000, spent_script.clone())
            .build();
        let template = parse_tx_bytes(&unsigned).unwrap();

        let digest = legacy_sighash_all(&template, 0, &spent_script);
        let msg = Message::from_slice(&digest).unwrap();
        let mut sig = secp.sign_ecdsa(&msg, &sk).serialize_der().to_vec();
        sig.push(0x01);

        let mut script_sig = vec![sig.len() as u8];
        script_sig.extend_from_slice(&sig);
        script_sig.push(33);
        script_sig.extend_from_slice(&pk.serialize());

        let signed = TxBuilder::new()
            .input(Outpoint::new([0x42; 32], 0), script_sig, 0xFFFF_FFFF)
            .output(40_000, spent_script.clone())
            .build();
        let tx = parse_tx_bytes(&signed).unwrap();

        let verify = Secp256k1::verification_only();
        verify_input(&verify, &tx, 0, &spent_script, 50_000).unwrap();
    }

    #[test]
    fn test_p2pkh_wrong_key_rejected() {
        let (_, pk, _) = keypair(3);
        let (other_sk, other_pk, secp) = keypair(4);
        let spent_script = p2pkh_script(&pk);

        let unsigned = TxBuilder::new()
            .input(Outpoint::new([0x42; 32], 0), vec![], 0xFFFF_FFFF)
            .output(40_000, spent_script.clone())
            .build();
        let template = parse_tx_bytes(&unsigned).unwrap();
        let digest = legacy_sighash_all(&template, 0, &spent_script);
        let msg = Message::from_slice(&digest).unwrap();
        let mut sig = secp.sign_ecdsa(&msg, &other_sk).serialize_der().to_vec();
        sig.push(0x01);

        let mut script_sig = vec![sig.len() as u8];
        script_sig.extend_from_slice(&sig);
        script_sig.push(33);
        script_sig.extend_from_slice(&other_pk.serialize());

        let signed = TxBuilder::new()
            .input(Outpoint::new([0x42; 32], 0), script_sig, 0xFFFF_FFFF)
            .output(40_000, spent_script.clone())
            .build();
        let tx = parse_tx_bytes(&signed).unwrap();

        let verify = Secp256k1::verification_only();
        assert!(matches!(
            verify_input(&verify, &tx, 0, &spent_script, 50_000),
            Err(ZcError::ScriptInvalid(_))
        ));
    }

    #[test]
    fn test_nonstandard_spend_rejected() {
        let raw = TxBuilder::new()
            .input(Outpoint::new([0x55; 32], 0), vec![0x00], 0xFFFF_FFFF)
            .output(1_000, vec![0x51])
            .build();
        let tx = parse_tx_bytes(&raw).unwrap();
        let verify = Secp256k1::verification_only();
        assert!(verify_input(&verify, &tx, 0, &[0x99, 0x98], 2_000).is_err());
    }
}

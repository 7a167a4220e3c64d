/// Test Fixtures
///
/// Deterministic hand-built regtest chains. Addresses are single letters
/// ('A'..='Z'), each backed by a fixed secp keypair, paid through real
/// p2pkh scripts and spent with real signatures so the admission path's
/// script evaluation runs for real in tests.

use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};

use crate::db::ProgressRecord;
use crate::parser::{parse_block, parse_tx_bytes, write_varint, ParsedBlock, ParsedTx, TxBuilder};
use crate::script::{hash160, legacy_sighash_all};
use crate::types::{BlockLocation, Outpoint, ScriptHash, TxHash, COIN, ZERO_HASH};

/// Regtest difficulty bits; every block carries the same work.
pub const EASY_BITS: u32 = 0x207fffff;
/// Stronger bits for building a heavier fork.
pub const STRONG_BITS: u32 = 0x206fffff;

pub fn keypair_for(owner: char) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[owner as u8; 32]).unwrap();
    let pk = PublicKey::from_secret_key(&secp, &sk);
    (sk, pk)
}

pub fn p2pkh_script(owner: char) -> Vec<u8> {
    let (_, pk) = keypair_for(owner);
    let mut script = vec![0x76, 0xa9, 20];
    script.extend_from_slice(&hash160(&pk.serialize()));
    script.push(0x88);
    script.push(0xac);
    script
}

pub fn scripthash_for(owner: char) -> ScriptHash {
    crate::script::scripthash_of(&p2pkh_script(owner)).unwrap()
}

fn owner_of_script(script: &[u8]) -> Option<char> {
    ('A'..='Z').find(|&c| p2pkh_script(c) == script)
}

pub struct TestChain {
    secp: Secp256k1<All>,
    /// Main-lineage blocks by height, as currently mined.
    pub blocks: Vec<ParsedBlock>,
    /// Every block ever mined, in the order it hits the blk file. Forked
    /// branches append here even after the lineage rewinds.
    pub file_order: Vec<ParsedBlock>,
    tip_hash: TxHash,
    bits: u32,
    nonce_counter: u32,
    offset: u64,
    locations: Vec<BlockLocation>,
}

impl TestChain {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
            blocks: Vec::new(),
            file_order: Vec::new(),
            tip_hash: ZERO_HASH,
            bits: EASY_BITS,
            nonce_counter: 0,
            offset: 0,
            locations: Vec::new(),
        }
    }

    /// Difficulty for subsequently mined blocks; lower bits mean a heavier
    /// chain, which is how the fork fixtures out-work the original branch.
    pub fn set_bits(&mut self, bits: u32) {
        self.bits = bits;
    }

    pub fn tip_hash(&self) -> TxHash {
        self.tip_hash
    }

    pub fn next_height(&self) -> u32 {
        self.blocks.len() as u32
    }

    fn coinbase(&self, owner: char, height: u32) -> ParsedTx {
        // Height in the coinbase script keeps every coinbase txid unique.
        let mut tag = vec![0x04];
        tag.extend_from_slice(&height.to_le_bytes());
        let raw = TxBuilder::new()
            .input(Outpoint::new(ZERO_HASH, u32::MAX), tag, 0xFFFF_FFFF)
            .output(50 * COIN, p2pkh_script(owner))
            .build();
        parse_tx_bytes(&raw).unwrap()
    }

    fn assemble(&mut self, prev: TxHash, txs: Vec<ParsedTx>) -> ParsedBlock {
        self.nonce_counter += 1;
        let mut raw = Vec::new();
        let mut header = [0u8; 80];
        header[0..4].copy_from_slice(&2i32.to_le_bytes());
        header[4..36].copy_from_slice(&prev);
        // Merkle root slot carries the first txid; nothing validates it,
        // but it keeps headers distinct per tx set.
        header[36..68].copy_from_slice(&txs[0].txid);
        header[68..72].copy_from_slice(&self.nonce_counter.to_le_bytes());
        header[72..76].copy_from_slice(&self.bits.to_le_bytes());
        header[76..80].copy_from_slice(&self.nonce_counter.to_le_bytes());
        raw.extend_from_slice(&header);
        write_varint(&mut raw, txs.len() as u64);
        for tx in &txs {
            raw.extend_from_slice(&tx.raw);
        }
        parse_block(&raw).unwrap()
    }

    fn push(&mut self, block: ParsedBlock) {
        let size = block.size as u32;
        self.locations.push(BlockLocation {
            file_number: 0,
            offset: self.offset + 8,
            size,
        });
        self.offset += 8 + size as u64;
        self.tip_hash = block.hash();
        self.file_order.push(block.clone());
        self.blocks.push(block);
    }

    /// Mine a block with a coinbase paying `owner` plus the given
    /// transactions, extending the tip.
    pub fn mine_block(&mut self, owner: char, mut txs: Vec<ParsedTx>) -> ParsedBlock {
        let height = self.next_height();
        let mut all = vec![self.coinbase(owner, height)];
        all.append(&mut txs);
        let block = self.assemble(self.tip_hash, all);
        self.push(block.clone());
        block
    }

    /// Mine a block whose coinbase pays `owner`, extending the tip.
    pub fn mine_to(&mut self, owner: char) -> ParsedBlock {
        self.mine_block(owner, Vec::new())
    }

    /// Mine a block with a coinbase to 'M' plus the given transactions.
    pub fn mine_with(&mut self, txs: Vec<ParsedTx>) -> ParsedBlock {
        self.mine_block('M', txs)
    }

    /// Drop mined blocks above `height` so an alternate branch can be mined
    /// from there. Returns the orphaned blocks.
    pub fn fork_at(&mut self, height: u32) -> Vec<ParsedBlock> {
        let keep = (height + 1) as usize;
        let orphaned = self.blocks.split_off(keep);
        self.locations.truncate(keep);
        self.tip_hash = self
            .blocks
            .last()
            .map(|b| b.hash())
            .unwrap_or(ZERO_HASH);
        orphaned
    }

    /// Signed p2pkh spend of `prev_tx`'s output `vout`, paying `to`.
    pub fn spend(&self, prev_tx: &ParsedTx, vout: u32, to: char, value: u64) -> ParsedTx {
        self.spend_with_sequence(prev_tx, vout, to, value, 0xFFFF_FFFF)
    }

    /// Same, signalling replace-by-fee via the sequence number.
    pub fn spend_rbf(&self, prev_tx: &ParsedTx, vout: u32, to: char, value: u64) -> ParsedTx {
        self.spend_with_sequence(prev_tx, vout, to, value, 0xFFFF_FFFD)
    }

    pub fn spend_with_sequence(
        &self,
        prev_tx: &ParsedTx,
        vout: u32,
        to: char,
        value: u64,
        sequence: u32,
    ) -> ParsedTx {
        self.spend_many(&[(prev_tx, vout)], &[(to, value)], sequence)
    }

    /// Multi-input, multi-output signed spend.
    pub fn spend_many(
        &self,
        inputs: &[(&ParsedTx, u32)],
        outputs: &[(char, u64)],
        sequence: u32,
    ) -> ParsedTx {
        let mut builder = TxBuilder::new();
        for (prev_tx, vout) in inputs {
            builder = builder.input(
                Outpoint::new(prev_tx.txid, *vout),
                Vec::new(),
                sequence,
            );
        }
        for (to, value) in outputs {
            builder = builder.output(*value, p2pkh_script(*to));
        }
        let template = parse_tx_bytes(&builder.build()).unwrap();

        let mut builder = TxBuilder::new();
        for (i, (prev_tx, vout)) in inputs.iter().enumerate() {
            let spent_script = &prev_tx.outputs[*vout as usize].script;
            let owner = owner_of_script(spent_script).expect("spend of unknown test owner");
            let (sk, pk) = keypair_for(owner);

            let digest = legacy_sighash_all(&template, i, spent_script);
            let msg = Message::from_slice(&digest).unwrap();
            let mut sig = self.secp.sign_ecdsa(&msg, &sk).serialize_der().to_vec();
            sig.push(0x01);

            let mut script_sig = vec![sig.len() as u8];
            script_sig.extend_from_slice(&sig);
            script_sig.push(33);
            script_sig.extend_from_slice(&pk.serialize());

            builder = builder.input(
                Outpoint::new(prev_tx.txid, *vout),
                script_sig,
                sequence,
            );
        }
        for (to, value) in outputs {
            builder = builder.output(*value, p2pkh_script(*to));
        }
        parse_tx_bytes(&builder.build()).unwrap()
    }

    pub fn location_at(&self, height: u32) -> BlockLocation {
        self.locations[height as usize]
    }

    pub fn progress_at(&self, height: u32) -> ProgressRecord {
        let loc = self.location_at(height);
        ProgressRecord {
            top_height: height,
            top_hash: self.blocks[height as usize].hash(),
            file_number: loc.file_number,
            file_offset: loc.offset + loc.size as u64,
        }
    }

    /// Write every mined block (orphaned branches included) as a
    /// blk00000.dat the block file reader can scan.
    pub fn write_blk_file(&self, dir: &std::path::Path, magic: [u8; 4]) {
        use std::io::Write;
        std::fs::create_dir_all(dir).unwrap();
        let mut f = std::fs::File::create(dir.join("blk00000.dat")).unwrap();
        for block in &self.file_order {
            let raw = block.serialize();
            f.write_all(&magic).unwrap();
            f.write_all(&(raw.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&raw).unwrap();
        }
    }
}

impl Default for TestChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Scriptable stand-in for the local node.
pub struct MockNode {
    state: std::sync::Mutex<MockNodeState>,
}

#[derive(Default)]
struct MockNodeState {
    pushed: Vec<Vec<u8>>,
    rpc_sent: Vec<Vec<u8>>,
    fail_peer: bool,
    fail_rpc: bool,
    suppress_echo: bool,
    chain_height: Option<u32>,
}

impl MockNode {
    pub fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(MockNodeState {
                chain_height: Some(0),
                ..Default::default()
            }),
        }
    }

    pub fn fail_peer_push(&self, fail: bool) {
        self.state.lock().unwrap().fail_peer = fail;
    }

    pub fn fail_rpc(&self, fail: bool) {
        self.state.lock().unwrap().fail_rpc = fail;
    }

    pub fn suppress_echo(&self, suppress: bool) {
        self.state.lock().unwrap().suppress_echo = suppress;
    }

    pub fn set_chain_height(&self, height: Option<u32>) {
        self.state.lock().unwrap().chain_height = height;
    }

    pub fn pushed_count(&self) -> usize {
        self.state.lock().unwrap().pushed.len()
    }

    pub fn rpc_sent_count(&self) -> usize {
        self.state.lock().unwrap().rpc_sent.len()
    }
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::node::NodeInterface for MockNode {
    fn push_tx(&self, raw: &[u8]) -> Result<(), crate::error::BroadcastError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_peer {
            return Err(crate::error::BroadcastError::PeerUnreachable);
        }
        state.pushed.push(raw.to_vec());
        Ok(())
    }

    fn has_seen_tx(&self, txid: &TxHash) -> bool {
        let state = self.state.lock().unwrap();
        if state.suppress_echo {
            return false;
        }
        state
            .pushed
            .iter()
            .any(|raw| parse_tx_bytes(raw).map(|t| t.txid == *txid).unwrap_or(false))
    }

    fn send_raw_tx_rpc(&self, raw: &[u8]) -> Result<(), crate::error::BroadcastError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_rpc {
            return Err(crate::error::BroadcastError::RpcRejected(
                "mock rejection".into(),
            ));
        }
        state.rpc_sent.push(raw.to_vec());
        Ok(())
    }

    fn estimate_fee(&self, n_blocks: u32, conservative: bool) -> Result<u64, crate::error::BroadcastError> {
        let base: u64 = if conservative { 20_000 } else { 12_000 };
        Ok(base.saturating_sub(n_blocks as u64 * 100).max(1_000))
    }

    fn node_connected(&self) -> bool {
        !self.state.lock().unwrap().fail_peer
    }

    fn rpc_connected(&self) -> bool {
        !self.state.lock().unwrap().fail_rpc
    }

    fn chain_height(&self) -> Option<u32> {
        self.state.lock().unwrap().chain_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::scripthash_of;
    use secp256k1::Secp256k1;

    #[test]
    fn test_chain_links_headers() {
        let mut chain = TestChain::new();
        let b0 = chain.mine_to('A');
        let b1 = chain.mine_to('B');
        assert_eq!(b1.header.prev_hash(), b0.hash());
        assert_eq!(chain.next_height(), 2);
    }

    #[test]
    fn test_spends_verify_against_outputs() {
        let mut chain = TestChain::new();
        let b0 = chain.mine_to('A');
        let spend = chain.spend(&b0.txs[0], 0, 'B', 49 * COIN);

        let verify = Secp256k1::verification_only();
        crate::script::verify_input(
            &verify,
            &spend,
            0,
            &b0.txs[0].outputs[0].script,
            b0.txs[0].outputs[0].value,
        )
        .unwrap();
        assert_eq!(
            scripthash_of(&spend.outputs[0].script).unwrap(),
            scripthash_for('B')
        );
    }

    #[test]
    fn test_fork_rewinds_tip() {
        let mut chain = TestChain::new();
        chain.mine_to('A');
        let b1 = chain.mine_to('B');
        chain.mine_to('C');

        let orphaned = chain.fork_at(1);
        assert_eq!(orphaned.len(), 1);
        assert_eq!(chain.tip_hash(), b1.hash());
        let b2a = chain.mine_to('D');
        assert_eq!(b2a.header.prev_hash(), b1.hash());
    }
}

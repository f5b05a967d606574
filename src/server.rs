use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::block::Block;
use crate::errors::{NodeError, Result};
use crate::mempool::Mempool;
use crate::message::{
    AddrMsg, BlockMsg, GetBlocksMsg, GetDataMsg, InvMsg, Message, TxMsg, VersionMsg, KIND_BLOCK,
    KIND_TX,
};
use crate::transaction::Transaction;
use crate::utxoset::UTXOSet;

/// The bootstrap peer every fresh node talks to first. Central by
/// convention only; there is no handshake.
pub const CENTRAL_NODE: &str = "localhost:3000";

/// Deadlines on a single message exchange; half-open connections must
/// not pin handler threads forever.
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A mining node starts working once the pool holds this many entries.
const MIN_POOL_FOR_MINING: usize = 2;

/// Upper bound on transactions drained from the pool per mined block.
const MINE_BATCH_SIZE: usize = 64;

/// The node server. One handler thread per inbound connection; each
/// shared value carries its own lock, nothing else is mutable.
#[derive(Clone)]
pub struct Server {
    node_address: String,
    mining_address: String,
    inner: Arc<ServerInner>,
}

struct ServerInner {
    known_nodes: Mutex<Vec<String>>,
    blocks_in_transit: Mutex<Vec<Vec<u8>>>,
    mempool: Mempool,
    utxo: UTXOSet,
}

impl Server {
    pub fn new(node_id: &str, mining_address: &str, utxo: UTXOSet) -> Server {
        Server {
            node_address: format!("localhost:{}", node_id),
            mining_address: mining_address.to_string(),
            inner: Arc::new(ServerInner {
                known_nodes: Mutex::new(vec![CENTRAL_NODE.to_string()]),
                blocks_in_transit: Mutex::new(Vec::new()),
                mempool: Mempool::new(),
                utxo,
            }),
        }
    }

    /// Accept loop. Non-central nodes announce their version to the
    /// central node first, which kicks off chain sync.
    pub fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.node_address)?;
        info!("server listening on {}", self.node_address);
        if self.node_address != CENTRAL_NODE {
            self.send_version(CENTRAL_NODE)?;
        }
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = self.clone();
                    thread::spawn(move || {
                        if let Err(e) = server.handle_connection(stream) {
                            warn!("dropping request: {}", e);
                        }
                    });
                }
                Err(e) => warn!("accept failed: {}", e),
            }
        }
        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let mut request = Vec::new();
        stream.read_to_end(&mut request)?;
        drop(stream);

        let message = Message::decode(&request)?;
        debug!("received {} command", message.cmd());
        match message {
            Message::Addr(msg) => self.handle_addr(msg),
            Message::Block(msg) => self.handle_block(msg),
            Message::GetBlocks(msg) => self.handle_get_blocks(msg),
            Message::GetData(msg) => self.handle_get_data(msg),
            Message::Inv(msg) => self.handle_inv(msg),
            Message::Tx(msg) => self.handle_tx(msg),
            Message::Version(msg) => self.handle_version(msg),
        }
    }

    // ---------------- sending ----------------

    /// One-shot send. An unreachable peer is pruned from the known-nodes
    /// list rather than treated as an error.
    fn send_data(&self, addr: &str, message: &Message) -> Result<()> {
        if addr == self.node_address {
            return Ok(());
        }
        let mut stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(_) => {
                warn!("{} is not available, removing it from known nodes", addr);
                self.inner
                    .known_nodes
                    .lock()
                    .unwrap()
                    .retain(|node| node != addr);
                return Ok(());
            }
        };
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        stream.write_all(&message.encode()?)?;
        Ok(())
    }

    fn send_version(&self, addr: &str) -> Result<()> {
        let best_height = self.inner.utxo.blockchain.get_best_height()?;
        info!("sending version (height {}) to {}", best_height, addr);
        self.send_data(
            addr,
            &Message::Version(VersionMsg {
                best_height,
                addr_from: self.node_address.clone(),
            }),
        )
    }

    fn send_get_blocks(&self, addr: &str) -> Result<()> {
        info!("requesting block list from {}", addr);
        self.send_data(
            addr,
            &Message::GetBlocks(GetBlocksMsg {
                addr_from: self.node_address.clone(),
            }),
        )
    }

    fn send_inv(&self, addr: &str, kind: &str, items: Vec<Vec<u8>>) -> Result<()> {
        info!("sending inv ({}, {} items) to {}", kind, items.len(), addr);
        self.send_data(
            addr,
            &Message::Inv(InvMsg {
                addr_from: self.node_address.clone(),
                kind: kind.to_string(),
                items,
            }),
        )
    }

    fn send_get_data(&self, addr: &str, kind: &str, id: Vec<u8>) -> Result<()> {
        debug!("requesting {} {} from {}", kind, hex::encode(&id), addr);
        self.send_data(
            addr,
            &Message::GetData(GetDataMsg {
                addr_from: self.node_address.clone(),
                kind: kind.to_string(),
                id,
            }),
        )
    }

    fn send_block(&self, addr: &str, block: &Block) -> Result<()> {
        info!("sending block {} to {}", hex::encode(block.get_hash()), addr);
        self.send_data(
            addr,
            &Message::Block(BlockMsg {
                addr_from: self.node_address.clone(),
                block: block.serialize()?,
            }),
        )
    }

    fn send_tx(&self, addr: &str, tx: &Transaction) -> Result<()> {
        info!("sending tx {} to {}", hex::encode(&tx.id), addr);
        self.send_data(
            addr,
            &Message::Tx(TxMsg {
                addr_from: self.node_address.clone(),
                transaction: tx.serialize()?,
            }),
        )
    }

    /// Shares our peer list. The reference flow never triggers this; it
    /// exists for completeness of the message family.
    pub fn send_addr(&self, addr: &str) -> Result<()> {
        let mut addr_list = self.known_nodes();
        addr_list.push(self.node_address.clone());
        self.send_data(addr, &Message::Addr(AddrMsg { addr_list }))
    }

    // ---------------- receiving ----------------

    fn handle_addr(&self, msg: AddrMsg) -> Result<()> {
        info!("received {} peer addresses", msg.addr_list.len());
        {
            let mut nodes = self.inner.known_nodes.lock().unwrap();
            for addr in msg.addr_list {
                if !nodes.contains(&addr) {
                    nodes.push(addr);
                }
            }
        }
        for node in self.known_nodes() {
            if let Err(e) = self.send_get_blocks(&node) {
                warn!("getblocks to {} failed: {}", node, e);
            }
        }
        Ok(())
    }

    fn handle_version(&self, msg: VersionMsg) -> Result<()> {
        info!(
            "received version from {} with height {}",
            msg.addr_from, msg.best_height
        );
        let my_height = self.inner.utxo.blockchain.get_best_height()?;
        if my_height < msg.best_height {
            self.send_get_blocks(&msg.addr_from)?;
        } else if my_height > msg.best_height {
            self.send_version(&msg.addr_from)?;
        }
        let mut nodes = self.inner.known_nodes.lock().unwrap();
        if !nodes.contains(&msg.addr_from) {
            nodes.push(msg.addr_from);
        }
        Ok(())
    }

    fn handle_get_blocks(&self, msg: GetBlocksMsg) -> Result<()> {
        let hashes = self.inner.utxo.blockchain.get_block_hashes()?;
        self.send_inv(&msg.addr_from, KIND_BLOCK, hashes)
    }

    fn handle_get_data(&self, msg: GetDataMsg) -> Result<()> {
        match msg.kind.as_str() {
            KIND_BLOCK => {
                let block = self.inner.utxo.blockchain.get_block(&msg.id)?;
                self.send_block(&msg.addr_from, &block)
            }
            KIND_TX => {
                let txid = hex::encode(&msg.id);
                match self.inner.mempool.get(&txid) {
                    Some(tx) => self.send_tx(&msg.addr_from, &tx),
                    None => {
                        // nothing sensible to answer with; drop the request
                        warn!("{} asked for unknown mempool tx {}", msg.addr_from, txid);
                        Ok(())
                    }
                }
            }
            other => Err(NodeError::Protocol(format!("unknown getdata kind {:?}", other))),
        }
    }

    fn handle_inv(&self, msg: InvMsg) -> Result<()> {
        info!(
            "received inv ({}, {} items) from {}",
            msg.kind,
            msg.items.len(),
            msg.addr_from
        );
        if msg.items.is_empty() {
            return Ok(());
        }
        match msg.kind.as_str() {
            KIND_BLOCK => {
                let first = msg.items[0].clone();
                *self.inner.blocks_in_transit.lock().unwrap() = msg.items[1..].to_vec();
                self.send_get_data(&msg.addr_from, KIND_BLOCK, first)
            }
            KIND_TX => {
                let txid = &msg.items[0];
                if !self.inner.mempool.contains(&hex::encode(txid)) {
                    self.send_get_data(&msg.addr_from, KIND_TX, txid.clone())?;
                }
                Ok(())
            }
            other => Err(NodeError::Protocol(format!("unknown inv kind {:?}", other))),
        }
    }

    fn handle_block(&self, msg: BlockMsg) -> Result<()> {
        let block = Block::deserialize(&msg.block)?;
        info!(
            "received block {} from {}",
            hex::encode(block.get_hash()),
            msg.addr_from
        );
        self.inner.utxo.blockchain.add_block(block)?;

        let next = {
            let mut in_transit = self.inner.blocks_in_transit.lock().unwrap();
            if in_transit.is_empty() {
                None
            } else {
                Some(in_transit.remove(0))
            }
        };
        match next {
            Some(hash) => self.send_get_data(&msg.addr_from, KIND_BLOCK, hash),
            None => {
                // download finished, derive the index from the new chain
                self.inner.utxo.reindex()
            }
        }
    }

    fn handle_tx(&self, msg: TxMsg) -> Result<()> {
        let tx = Transaction::deserialize(&msg.transaction)?;
        info!("received tx {} from {}", hex::encode(&tx.id), msg.addr_from);
        let txid = tx.id.clone();
        self.inner.mempool.insert(tx);

        if self.node_address == CENTRAL_NODE {
            for node in self.known_nodes() {
                if node != self.node_address && node != msg.addr_from {
                    self.send_inv(&node, KIND_TX, vec![txid.clone()])?;
                }
            }
        }
        if !self.mining_address.is_empty() && self.inner.mempool.len() >= MIN_POOL_FOR_MINING {
            self.mine_pending_transactions()?;
        }
        Ok(())
    }

    // ---------------- mining ----------------

    /// Drains the pool in bounded batches and mines until it runs dry.
    /// Transactions arriving while a block is being mined are picked up
    /// by the next round instead of recursing.
    fn mine_pending_transactions(&self) -> Result<()> {
        loop {
            let candidates = self.inner.mempool.take_batch(MINE_BATCH_SIZE);
            if candidates.is_empty() {
                return Ok(());
            }
            let mut txs = Vec::new();
            for tx in candidates {
                match self.inner.utxo.blockchain.verify_transaction(&tx) {
                    Ok(true) => txs.push(tx),
                    Ok(false) => warn!("dropping invalid tx {}", hex::encode(&tx.id)),
                    Err(e) => warn!("dropping tx {}: {}", hex::encode(&tx.id), e),
                }
            }
            if txs.is_empty() {
                error!("all transactions invalid");
                return Ok(());
            }

            let cbtx = Transaction::new_coinbase(&self.mining_address, String::new())?;
            txs.push(cbtx);

            let new_block = self.inner.utxo.blockchain.mine_block(txs)?;
            self.inner.utxo.reindex()?;
            info!("mined block {}", hex::encode(new_block.get_hash()));

            for node in self.known_nodes() {
                if node != self.node_address {
                    self.send_inv(&node, KIND_BLOCK, vec![new_block.get_hash().to_vec()])?;
                }
            }
            if self.inner.mempool.len() < MIN_POOL_FOR_MINING {
                return Ok(());
            }
        }
    }

    fn known_nodes(&self) -> Vec<String> {
        self.inner.known_nodes.lock().unwrap().clone()
    }
}

/// One-shot transaction submission used by `send` without `-mine`:
/// connect to the central node, push the tx, hang up.
pub fn send_transaction(center: &str, node_address: &str, tx: &Transaction) -> Result<()> {
    let message = Message::Tx(TxMsg {
        addr_from: node_address.to_string(),
        transaction: tx.serialize()?,
    });
    let mut stream = TcpStream::connect(center)
        .map_err(|e| NodeError::Io(format!("central node {} unreachable: {}", center, e)))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    stream.write_all(&message.encode()?)?;
    info!("sent tx {} to {}", hex::encode(&tx.id), center);
    Ok(())
}

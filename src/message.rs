use serde::{Deserialize, Serialize};

use crate::errors::{NodeError, Result};

/// Width of the command field at the front of every message.
pub const CMD_LEN: usize = 12;

/// Inventory and getdata payloads carry one of these two kind strings.
pub const KIND_BLOCK: &str = "block";
pub const KIND_TX: &str = "tx";

/// One peer message. On the wire this is the zero-padded ASCII command
/// followed by the bincode encoding of the matching payload struct; the
/// whole TCP connection carries exactly one message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Addr(AddrMsg),
    Block(BlockMsg),
    GetBlocks(GetBlocksMsg),
    GetData(GetDataMsg),
    Inv(InvMsg),
    Tx(TxMsg),
    Version(VersionMsg),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AddrMsg {
    pub addr_list: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockMsg {
    pub addr_from: String,
    pub block: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GetBlocksMsg {
    pub addr_from: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GetDataMsg {
    pub addr_from: String,
    pub kind: String,
    pub id: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InvMsg {
    pub addr_from: String,
    pub kind: String,
    pub items: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxMsg {
    pub addr_from: String,
    pub transaction: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VersionMsg {
    pub best_height: u64,
    pub addr_from: String,
}

fn cmd_to_bytes(cmd: &str) -> [u8; CMD_LEN] {
    let mut bytes = [0u8; CMD_LEN];
    bytes[..cmd.len()].copy_from_slice(cmd.as_bytes());
    bytes
}

fn bytes_to_cmd(bytes: &[u8]) -> Result<String> {
    let cmd: Vec<u8> = bytes.iter().copied().filter(|&b| b != 0).collect();
    String::from_utf8(cmd).map_err(|_| NodeError::Protocol("command is not ascii".to_string()))
}

impl Message {
    pub fn cmd(&self) -> &'static str {
        match self {
            Message::Addr(_) => "addr",
            Message::Block(_) => "block",
            Message::GetBlocks(_) => "getblocks",
            Message::GetData(_) => "getdata",
            Message::Inv(_) => "inv",
            Message::Tx(_) => "tx",
            Message::Version(_) => "version",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Message::Addr(m) => bincode::serialize(m),
            Message::Block(m) => bincode::serialize(m),
            Message::GetBlocks(m) => bincode::serialize(m),
            Message::GetData(m) => bincode::serialize(m),
            Message::Inv(m) => bincode::serialize(m),
            Message::Tx(m) => bincode::serialize(m),
            Message::Version(m) => bincode::serialize(m),
        }?;
        let mut request = cmd_to_bytes(self.cmd()).to_vec();
        request.extend_from_slice(&payload);
        Ok(request)
    }

    pub fn decode(request: &[u8]) -> Result<Message> {
        if request.len() < CMD_LEN {
            return Err(NodeError::Protocol(format!(
                "truncated message of {} bytes",
                request.len()
            )));
        }
        let cmd = bytes_to_cmd(&request[..CMD_LEN])?;
        let payload = &request[CMD_LEN..];
        let message = match cmd.as_str() {
            "addr" => Message::Addr(bincode::deserialize(payload)?),
            "block" => Message::Block(bincode::deserialize(payload)?),
            "getblocks" => Message::GetBlocks(bincode::deserialize(payload)?),
            "getdata" => Message::GetData(bincode::deserialize(payload)?),
            "inv" => Message::Inv(bincode::deserialize(payload)?),
            "tx" => Message::Tx(bincode::deserialize(payload)?),
            "version" => Message::Version(bincode::deserialize(payload)?),
            unknown => {
                return Err(NodeError::Protocol(format!("unknown command {:?}", unknown)))
            }
        };
        Ok(message)
    }
}

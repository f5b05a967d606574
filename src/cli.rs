use std::env;

use clap::{arg, value_parser, Command};
use log::info;

use crate::blockchain::Blockchain;
use crate::errors::{NodeError, Result};
use crate::server::{self, Server, CENTRAL_NODE};
use crate::transaction::Transaction;
use crate::utxoset::UTXOSet;
use crate::wallet::{self, Wallets};

/// Command dispatcher. Every subcommand needs NODE_ID from the
/// environment; it selects the database, the wallet file and the listen
/// port.
pub fn run() -> Result<()> {
    let node_id = env::var("NODE_ID").map_err(|_| {
        NodeError::Config("NODE_ID environment variable is not set".to_string())
    })?;

    let matches = Command::new("picochain")
        .version("0.1")
        .about("a bitcoin-style blockchain node for learning purposes")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("getbalance")
                .about("get the balance for an address")
                .arg(arg!(--address <ADDRESS> "The address to get balance for")),
        )
        .subcommand(
            Command::new("createblockchain")
                .about("create a blockchain and send the genesis reward to an address")
                .arg(arg!(--address <ADDRESS> "The address to send genesis block reward to")),
        )
        .subcommand(
            Command::new("send")
                .about("send coins, optionally mining the block right away")
                .arg(arg!(--from <FROM> "Source wallet address"))
                .arg(arg!(--to <TO> "Destination wallet address"))
                .arg(
                    arg!(--amount <AMOUNT> "Amount to send")
                        .value_parser(value_parser!(i64)),
                )
                .arg(arg!(--mine "Mine immediately on this node")),
        )
        .subcommand(Command::new("printchain").about("print all blocks, tip to genesis"))
        .subcommand(Command::new("createwallet").about("generate a new keypair"))
        .subcommand(Command::new("listaddresses").about("list the addresses in the wallet file"))
        .subcommand(Command::new("reindexutxo").about("rebuild the UTXO index"))
        .subcommand(
            Command::new("startnode")
                .about("start a node on localhost:NODE_ID")
                .arg(arg!(--miner <ADDRESS> "Enable mining and send rewards to ADDRESS").required(false))
                .arg(arg!(--"strict-parent" "Reject blocks whose parent is unknown")),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("getbalance", sub)) => {
            let address = sub.get_one::<String>("address").unwrap();
            cmd_get_balance(address, &node_id)
        }
        Some(("createblockchain", sub)) => {
            let address = sub.get_one::<String>("address").unwrap();
            cmd_create_blockchain(address, &node_id)
        }
        Some(("send", sub)) => {
            let from = sub.get_one::<String>("from").unwrap();
            let to = sub.get_one::<String>("to").unwrap();
            let amount = *sub.get_one::<i64>("amount").unwrap();
            let mine_now = sub.get_flag("mine");
            cmd_send(from, to, amount, &node_id, mine_now)
        }
        Some(("printchain", _)) => cmd_print_chain(&node_id),
        Some(("createwallet", _)) => cmd_create_wallet(&node_id),
        Some(("listaddresses", _)) => cmd_list_addresses(&node_id),
        Some(("reindexutxo", _)) => cmd_reindex_utxo(&node_id),
        Some(("startnode", sub)) => {
            let miner = sub
                .get_one::<String>("miner")
                .map(String::as_str)
                .unwrap_or("");
            cmd_start_node(&node_id, miner, sub.get_flag("strict-parent"))
        }
        _ => unreachable!("subcommand_required is set"),
    }
}

fn cmd_get_balance(address: &str, node_id: &str) -> Result<()> {
    if !wallet::validate_address(address) {
        return Err(NodeError::InvalidAddress(address.to_string()));
    }
    let bc = Blockchain::open(node_id)?;
    let utxo_set = UTXOSet { blockchain: bc };
    let pub_key_hash = wallet::pub_key_hash_from_address(address)?;
    let utxos = utxo_set.find_utxo(&pub_key_hash)?;
    let balance: i64 = utxos.outputs.iter().map(|out| out.value).sum();
    println!("Balance of {}: {}", address, balance);
    Ok(())
}

fn cmd_create_blockchain(address: &str, node_id: &str) -> Result<()> {
    if !wallet::validate_address(address) {
        return Err(NodeError::InvalidAddress(address.to_string()));
    }
    let bc = Blockchain::create(address, node_id)?;
    let utxo_set = UTXOSet { blockchain: bc };
    utxo_set.reindex()?;
    println!("Finished!");
    Ok(())
}

fn cmd_send(from: &str, to: &str, amount: i64, node_id: &str, mine_now: bool) -> Result<()> {
    if !wallet::validate_address(from) {
        return Err(NodeError::InvalidAddress(from.to_string()));
    }
    if !wallet::validate_address(to) {
        return Err(NodeError::InvalidAddress(to.to_string()));
    }
    if amount <= 0 {
        return Err(NodeError::InvalidTransaction(
            "amount must be positive".to_string(),
        ));
    }
    let bc = Blockchain::open(node_id)?;
    let utxo_set = UTXOSet { blockchain: bc };
    let wallets = Wallets::open(node_id)?;
    let sender = wallets
        .get_wallet(from)
        .ok_or_else(|| NodeError::NotFound(format!("wallet for {}", from)))?;
    let tx = Transaction::new_utxo(sender, to, amount, &utxo_set)?;
    if mine_now {
        let cbtx = Transaction::new_coinbase(from, String::new())?;
        let block = utxo_set.blockchain.mine_block(vec![cbtx, tx])?;
        utxo_set.update(&block)?;
    } else {
        let node_address = format!("localhost:{}", node_id);
        server::send_transaction(CENTRAL_NODE, &node_address, &tx)?;
    }
    println!("Success!");
    Ok(())
}

fn cmd_print_chain(node_id: &str) -> Result<()> {
    let bc = Blockchain::open(node_id)?;
    for block in bc.iter()? {
        println!("{}", block);
        println!("PoW: {}\n", block.validate()?);
    }
    Ok(())
}

fn cmd_create_wallet(node_id: &str) -> Result<()> {
    let mut wallets = Wallets::open(node_id)?;
    let address = wallets.create_wallet()?;
    wallets.save_file(node_id)?;
    println!("New address is: {}", address);
    Ok(())
}

fn cmd_list_addresses(node_id: &str) -> Result<()> {
    let wallets = Wallets::open(node_id)?;
    for address in wallets.get_all_addresses() {
        println!("{}", address);
    }
    Ok(())
}

fn cmd_reindex_utxo(node_id: &str) -> Result<()> {
    let bc = Blockchain::open(node_id)?;
    let utxo_set = UTXOSet { blockchain: bc };
    utxo_set.reindex()?;
    let count = utxo_set.count_transactions()?;
    println!("Done! There are {} transactions in the UTXO set.", count);
    Ok(())
}

fn cmd_start_node(node_id: &str, miner: &str, strict_parent: bool) -> Result<()> {
    if !miner.is_empty() {
        if !wallet::validate_address(miner) {
            return Err(NodeError::InvalidAddress(miner.to_string()));
        }
        println!("Mining is on. Address to receive rewards: {}", miner);
    }
    info!("starting node {}", node_id);
    let bc = Blockchain::open(node_id)?.with_strict_parent(strict_parent);
    let utxo_set = UTXOSet { blockchain: bc };
    let server = Server::new(node_id, miner, utxo_set);
    server.start()
}

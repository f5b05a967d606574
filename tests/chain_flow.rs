//! End-to-end scenarios driven through the library: genesis funding,
//! local send-and-mine, boundary amounts and index consistency.

use picochain::blockchain::Blockchain;
use picochain::errors::NodeError;
use picochain::transaction::{Transaction, SUBSIDY};
use picochain::utxoset::UTXOSet;
use picochain::wallet::{self, Wallet};

fn balance(utxo_set: &UTXOSet, wallet: &Wallet) -> i64 {
    utxo_set
        .find_utxo(&wallet::hash_pub_key(&wallet.public_key))
        .unwrap()
        .outputs
        .iter()
        .map(|out| out.value)
        .sum()
}

fn total_indexed(utxo_set: &UTXOSet) -> i64 {
    utxo_set
        .blockchain
        .find_utxo()
        .unwrap()
        .values()
        .flat_map(|outs| outs.outputs.iter())
        .map(|out| out.value)
        .sum()
}

fn fresh_chain(dir: &tempfile::TempDir) -> (UTXOSet, Wallet) {
    let owner = Wallet::new().unwrap();
    let path = dir.path().join("blocks");
    let bc = Blockchain::create_at(path.to_str().unwrap(), &owner.get_address()).unwrap();
    let utxo_set = UTXOSet { blockchain: bc };
    utxo_set.reindex().unwrap();
    (utxo_set, owner)
}

#[test]
fn genesis_pays_the_founder() {
    let dir = tempfile::tempdir().unwrap();
    let (utxo_set, owner) = fresh_chain(&dir);
    assert_eq!(balance(&utxo_set, &owner), SUBSIDY);
    assert_eq!(utxo_set.blockchain.get_best_height().unwrap(), 0);
}

#[test]
fn send_and_mine_locally() {
    let dir = tempfile::tempdir().unwrap();
    let (utxo_set, sender) = fresh_chain(&dir);
    let receiver = Wallet::new().unwrap();

    let tx = Transaction::new_utxo(&sender, &receiver.get_address(), 7, &utxo_set).unwrap();
    let cbtx = Transaction::new_coinbase(&sender.get_address(), String::new()).unwrap();
    let block = utxo_set.blockchain.mine_block(vec![cbtx, tx]).unwrap();
    utxo_set.update(&block).unwrap();

    assert_eq!(balance(&utxo_set, &receiver), 7);
    // 13 change plus a fresh 20 coinbase
    assert_eq!(balance(&utxo_set, &sender), SUBSIDY - 7 + SUBSIDY);
    // all value in circulation originates from coinbases
    assert_eq!(total_indexed(&utxo_set), 2 * SUBSIDY);
}

#[test]
fn exact_amount_produces_no_change_output() {
    let dir = tempfile::tempdir().unwrap();
    let (utxo_set, sender) = fresh_chain(&dir);
    let receiver = Wallet::new().unwrap();

    let tx = Transaction::new_utxo(&sender, &receiver.get_address(), SUBSIDY, &utxo_set).unwrap();
    assert_eq!(tx.vout.len(), 1);
    assert_eq!(tx.vout[0].value, SUBSIDY);

    let cbtx = Transaction::new_coinbase(&sender.get_address(), String::new()).unwrap();
    let block = utxo_set.blockchain.mine_block(vec![cbtx, tx]).unwrap();
    utxo_set.update(&block).unwrap();
    assert_eq!(balance(&utxo_set, &receiver), SUBSIDY);
    assert_eq!(balance(&utxo_set, &sender), SUBSIDY);
}

#[test]
fn overspending_fails_with_insufficient_funds() {
    let dir = tempfile::tempdir().unwrap();
    let (utxo_set, sender) = fresh_chain(&dir);
    let receiver = Wallet::new().unwrap();

    let result = Transaction::new_utxo(&sender, &receiver.get_address(), SUBSIDY + 1, &utxo_set);
    match result {
        Err(NodeError::InsufficientFunds { have, need }) => {
            assert_eq!(have, SUBSIDY);
            assert_eq!(need, SUBSIDY + 1);
        }
        other => panic!("expected InsufficientFunds, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn chained_spends_verify_against_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let (utxo_set, alice) = fresh_chain(&dir);
    let bob = Wallet::new().unwrap();
    let carol = Wallet::new().unwrap();

    // alice -> bob
    let tx1 = Transaction::new_utxo(&alice, &bob.get_address(), 15, &utxo_set).unwrap();
    assert!(utxo_set.blockchain.verify_transaction(&tx1).unwrap());
    let cb1 = Transaction::new_coinbase(&alice.get_address(), String::new()).unwrap();
    let block1 = utxo_set.blockchain.mine_block(vec![cb1, tx1]).unwrap();
    utxo_set.update(&block1).unwrap();

    // bob -> carol out of the freshly received coins
    let tx2 = Transaction::new_utxo(&bob, &carol.get_address(), 10, &utxo_set).unwrap();
    assert!(utxo_set.blockchain.verify_transaction(&tx2).unwrap());
    let cb2 = Transaction::new_coinbase(&bob.get_address(), String::new()).unwrap();
    let block2 = utxo_set.blockchain.mine_block(vec![cb2, tx2]).unwrap();
    utxo_set.update(&block2).unwrap();

    assert_eq!(balance(&utxo_set, &carol), 10);
    assert_eq!(balance(&utxo_set, &bob), 15 - 10 + SUBSIDY);
    assert_eq!(balance(&utxo_set, &alice), SUBSIDY - 15 + SUBSIDY);
    assert_eq!(utxo_set.blockchain.get_best_height().unwrap(), 2);
}

#[test]
fn reindex_agrees_with_incremental_updates() {
    let dir = tempfile::tempdir().unwrap();
    let (utxo_set, alice) = fresh_chain(&dir);
    let bob = Wallet::new().unwrap();

    for amount in [3, 5, 7] {
        let tx = Transaction::new_utxo(&alice, &bob.get_address(), amount, &utxo_set).unwrap();
        let cbtx = Transaction::new_coinbase(&alice.get_address(), String::new()).unwrap();
        let block = utxo_set.blockchain.mine_block(vec![cbtx, tx]).unwrap();
        utxo_set.update(&block).unwrap();
    }
    let alice_before = balance(&utxo_set, &alice);
    let bob_before = balance(&utxo_set, &bob);

    utxo_set.reindex().unwrap();

    assert_eq!(balance(&utxo_set, &alice), alice_before);
    assert_eq!(balance(&utxo_set, &bob), bob_before);
    assert_eq!(bob_before, 3 + 5 + 7);
    // three mined blocks plus genesis
    assert_eq!(total_indexed(&utxo_set), 4 * SUBSIDY);
}

#[test]
fn mining_rejects_tampered_transactions() {
    let dir = tempfile::tempdir().unwrap();
    let (utxo_set, sender) = fresh_chain(&dir);
    let receiver = Wallet::new().unwrap();

    let mut tx = Transaction::new_utxo(&sender, &receiver.get_address(), 5, &utxo_set).unwrap();
    tx.vout[0].value = 19;
    assert!(!utxo_set.blockchain.verify_transaction(&tx).unwrap());
    assert!(utxo_set.blockchain.mine_block(vec![tx]).is_err());
}

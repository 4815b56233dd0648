//! End-to-end scenarios across the ledger, VM, persistence and sync layers

use std::time::Duration;

use ember_blockchain::chain::Blockchain;
use ember_blockchain::contract::program;
use ember_blockchain::error::ChainError;
use ember_blockchain::storage::PersistentStore;
use ember_blockchain::sync::NetworkManager;
use ember_blockchain::types::Transaction;

fn transfer(chain: &Blockchain, from: &str, to: &str, amount: f64, gas_price: f64) -> Transaction {
    Transaction::new(from, to, amount, gas_price, chain.expected_nonce(from)).finalize(from, "sig")
}

#[test]
fn genesis_plus_one_transfer() {
    let chain = Blockchain::new();
    chain.create_account("A", 100.0);
    chain.create_account("B", 0.0);

    let tx = transfer(&chain, "A", "B", 10.0, 1.0);
    chain.submit_transaction(tx).unwrap();
    chain.mine_block(10).unwrap();

    assert_eq!(chain.get_balance("A"), 89.0);
    assert_eq!(chain.get_balance("B"), 10.0);
    assert_eq!(chain.chain_height(), 2);
    assert!(chain.is_chain_valid());
}

#[test]
fn replay_rejection() {
    let chain = Blockchain::new();
    chain.create_account("A", 100.0);
    chain.create_account("B", 0.0);

    let tx = transfer(&chain, "A", "B", 10.0, 1.0);
    chain.submit_transaction(tx.clone()).unwrap();
    let second = chain.submit_transaction(tx);
    assert!(matches!(second, Err(ChainError::ReplayDetected)));
    assert_eq!(chain.mempool_size(), 1);
}

#[test]
fn merkle_tamper_detected_after_reload() {
    let tmp = tempfile::tempdir().unwrap();
    let store = PersistentStore::open(tmp.path()).unwrap();

    let chain = Blockchain::new();
    chain.attach_store(store.clone());
    chain.create_account("A", 100.0);
    chain.create_account("B", 0.0);
    chain.submit_transaction(transfer(&chain, "A", "B", 10.0, 1.0)).unwrap();
    chain.mine_block(10).unwrap();

    // flip one character of a persisted amount
    let mut blocks = store.load_blocks().unwrap();
    blocks[1].transactions[0].amount = 90.0;
    store.save_blocks(&blocks).unwrap();

    let reloaded = Blockchain::new();
    reloaded.attach_store(store);
    assert!(reloaded.restore().unwrap());
    assert!(!reloaded.is_chain_valid());
}

#[test]
fn longest_chain_convergence_across_three_nodes() {
    let manager = NetworkManager::new();
    manager.create_node("alice", 0);
    let bob = manager.create_node("bob", 0);
    manager.create_node("charlie", 0);

    manager.connect_peers("alice", "bob");
    manager.connect_peers("bob", "charlie");
    manager.connect_peers("charlie", "alice");

    bob.blockchain().mine_block(10).unwrap();
    bob.blockchain().mine_block(10).unwrap();
    assert_eq!(bob.blockchain().chain_height(), 3);

    manager.start_monitor();
    assert!(manager.wait_for_sync(Duration::from_secs(15)));

    let heights = manager.get_chain_heights();
    assert_eq!(heights["alice"], 3);
    assert_eq!(heights["bob"], 3);
    assert_eq!(heights["charlie"], 3);

    let roots = manager.get_state_roots();
    assert_eq!(roots["alice"], roots["bob"]);
    assert_eq!(roots["bob"], roots["charlie"]);
    assert!(manager.is_state_synced());

    for node in manager.all_nodes() {
        assert!(node.blockchain().is_chain_valid());
    }
    manager.stop_all_nodes();
}

#[test]
fn contract_counter_three_calls() {
    let chain = Blockchain::new();
    chain.create_account("0xcreator", 100.0);

    let address = chain
        .deploy_contract("0xcreator", "Counter", "vm", program::counter_program())
        .unwrap();

    for _ in 0..3 {
        let outcome = chain.call_contract(&address, "0xcreator", None).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.gas_used, 58);
    }

    let contract = chain.get_contract(&address).unwrap();
    assert_eq!(contract.get_storage("counter").as_integer().unwrap(), 3);
}

#[test]
fn nonce_gap_blocks_are_never_appended() {
    let chain = Blockchain::new();
    chain.create_account("S", 100.0);
    chain.create_account("R", 0.0);

    let first = Transaction::new("S", "R", 1.0, 0.0, 0).finalize("S", "sig");
    let gapped = Transaction::new("S", "R", 1.0, 0.0, 2).finalize("S", "sig");
    chain.submit_transaction(first).unwrap();
    chain.submit_transaction(gapped).unwrap();

    let err = chain.mine_block(10).unwrap_err();
    assert!(matches!(err, ChainError::InvalidBlock(_)));
    assert_eq!(chain.chain_height(), 1);
    assert!(chain.is_chain_valid());
}

#[test]
fn state_roots_deterministic_across_nodes_applying_same_blocks() {
    let left = Blockchain::new();
    let right = Blockchain::new();
    left.create_account("A", 100.0);
    left.create_account("B", 0.0);
    right.create_account("A", 100.0);
    right.create_account("B", 0.0);

    let tx = transfer(&left, "A", "B", 25.0, 0.0);
    left.submit_transaction(tx.clone()).unwrap();
    let block = left.mine_block(10).unwrap();

    right.apply_synced_block(block).unwrap();

    assert_eq!(left.state_root(), right.state_root());
    assert_eq!(left.chain_height(), right.chain_height());
}

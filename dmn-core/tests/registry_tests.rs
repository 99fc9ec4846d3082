//! Registry lifecycle tests driven through the manager

mod common;

use common::*;
use dmn_core::query::{self, ListFilter, STATUS_ENABLED, STATUS_POSE_BANNED};
use dmn_core::*;
use tempfile::TempDir;

/// Spending a collateral removes its entry; disconnecting the spend brings
/// the entry back exactly as it was
#[test]
fn test_collateral_spend_and_disconnect_restore_entry() {
    let mut chain = TestChain::activated();
    let collateral = chain.register(1);
    chain.mine(vec![]).unwrap();

    let before = chain.tip().get(&collateral).cloned().unwrap();
    let snapshot_before = chain.tip().to_bytes().unwrap();

    let spend = chain.spend_tx(collateral);
    let transition = chain.mine(vec![spend]).unwrap();
    assert!(!chain.tip().contains(&collateral));
    assert_eq!(transition.undo.changes.len(), 1);
    assert_eq!(transition.undo.changes[0].prior.as_ref(), Some(&before));

    let restored = chain.disconnect().unwrap();
    assert_eq!(restored.get(&collateral), Some(&before));
    assert_eq!(restored.to_bytes().unwrap(), snapshot_before);
}

/// Every entry is backed by a registration and an unspent collateral
#[test]
fn test_membership_follows_registrations_and_spends() {
    let mut chain = TestChain::activated();
    let a = chain.register(1);
    let b = chain.register(2);
    let c = chain.register(3);
    assert_eq!(chain.tip().len(), 3);

    let spend_b = chain.spend_tx(b);
    chain.mine(vec![spend_b]).unwrap();

    let members: Vec<OutPoint> = chain.tip().iter().map(|e| e.collateral).collect();
    let mut expected = vec![a, c];
    expected.sort();
    assert_eq!(members, expected);

    for entry in chain.tip().iter() {
        assert_ne!(entry.registration_txid, Hash256::ZERO);
        assert!(entry.registered_height >= ACTIVATION_HEIGHT);
    }
}

/// Registrations ahead of activation are rejected and leave the tip alone
#[test]
fn test_registration_before_activation_rejected() {
    let mut chain = TestChain::new();
    chain.mine(vec![]).unwrap();

    let collateral = chain.fund(1);
    let tx = chain.registration_tx(1, collateral);
    let tip = chain.tip().clone();

    let result = chain.mine(vec![tx]);
    assert!(matches!(result, Err(DmnError::BelowActivation { .. })));
    assert!(result.unwrap_err().is_block_invalid());
    assert_eq!(chain.tip(), &tip);
    assert_eq!(chain.manager.gate().next_height(), 2);
}

/// A block that fails part way through changes nothing
#[test]
fn test_failed_block_is_atomic() {
    let mut chain = TestChain::activated();
    let first = chain.register(1);
    let tip = chain.tip().clone();

    // A fresh registration followed by one reusing the first service
    let ok_collateral = chain.fund(2);
    let ok = chain.registration_tx(2, ok_collateral);
    let dup_collateral = chain.fund(3);
    let inputs = vec![chain.fresh_outpoint()];
    let mut payload = chain.registration_payload(3, dup_collateral, &inputs);
    payload.service = chain.tip().get(&first).unwrap().service;
    let dup = special_tx(
        specialtx::TRANSACTION_PROVIDER_REGISTER,
        inputs,
        vec![],
        SpecialTx::Registration(payload),
    );

    let block = Block::new(
        tip.block_hash(),
        tip.height() + 1,
        1,
        REWARD,
        vec![Transaction::new(0, vec![], vec![], vec![1]), ok, dup],
    );
    let err = chain.connect(block).unwrap_err();
    assert!(matches!(err, DmnError::DuplicateService(_)));
    assert_eq!(err.reject_reason(), "bad-protx-dup-addr");
    assert_eq!(chain.tip(), &tip);
    assert!(!chain.tip().contains(&ok_collateral));
}

/// Revocation bans and clears operator fields; a service update revives
#[test]
fn test_revocation_then_service_update_revives() {
    let mut chain = TestChain::activated();
    let collateral = chain.register(1);

    let revoke = chain.revocation_tx(collateral, 2);
    chain.mine(vec![revoke]).unwrap();
    let revoked_at = chain.height();

    let entry = chain.tip().get(&collateral).unwrap();
    assert!(!entry.is_valid());
    assert_eq!(entry.pose_ban_height, Some(revoked_at));
    assert_eq!(entry.revocation_reason, 2);
    assert!(entry.service.is_null());
    assert_eq!(entry.protocol_version, 0);
    assert_eq!(query::info(chain.tip(), &collateral).unwrap().status, STATUS_POSE_BANNED);
    assert!(query::list(chain.tip(), ListFilter::Valid).is_empty());

    let update = chain.service_update_tx(collateral, service(42));
    chain.mine(vec![update]).unwrap();
    let revived_at = chain.height();

    let entry = chain.tip().get(&collateral).unwrap();
    assert!(entry.is_valid());
    assert_eq!(entry.service, service(42));
    assert_eq!(entry.pose_revived_height, Some(revived_at));
    assert_eq!(query::info(chain.tip(), &collateral).unwrap().status, STATUS_ENABLED);
    assert_eq!(query::list(chain.tip(), ListFilter::Valid).len(), 1);

    // Unwinding both blocks restores the registration as first connected
    chain.disconnect().unwrap();
    chain.disconnect().unwrap();
    let entry = chain.tip().get(&collateral).unwrap();
    assert!(entry.is_valid());
    assert_eq!(entry.service, service(1));
    assert_eq!(entry.pose_revived_height, None);
}

/// Service updates may not take another entry's address
#[test]
fn test_service_update_to_taken_address_rejected() {
    let mut chain = TestChain::activated();
    let a = chain.register(1);
    chain.register(2);

    let update = chain.service_update_tx(a, service(2));
    let err = chain.mine(vec![update]).unwrap_err();
    assert!(matches!(err, DmnError::DuplicateService(_)));

    // Re-announcing its own address is fine
    let update = chain.service_update_tx(a, service(1));
    chain.mine(vec![update]).unwrap();
}

/// A registration may fund its collateral from its own outputs
#[test]
fn test_internal_collateral_registration() {
    let mut chain = TestChain::activated();
    let funding = chain.fund(9);
    let tx = chain.internal_registration_tx(5, vec![funding]);
    let collateral = tx.outpoint(0);

    chain.mine(vec![tx]).unwrap();
    let entry = chain.tip().get(&collateral).unwrap();
    assert_eq!(entry.collateral_height, chain.height());
    assert!(entry.is_valid());
}

/// Every active block commits to the snapshot it produces
#[test]
fn test_commitment_tracks_snapshot() {
    let mut chain = TestChain::activated();
    chain.register(1);
    chain.register(2);

    let height = chain.height();
    let block = chain.blocks.get(&height).cloned().unwrap();
    let coinbase = block.coinbase().unwrap();
    let Some(SpecialTx::Commitment(payload)) = specialtx::decode_transaction(coinbase).unwrap() else {
        panic!("coinbase carries no commitment");
    };
    assert_eq!(payload.height, height);
    assert_eq!(payload.merkle_root_mn_list, compute_root(chain.tip()));
    verify_commitment(chain.tip(), &payload).unwrap();
}

/// A reopened file-backed registry resumes at the same tip and can still
/// disconnect blocks connected before the restart
#[test]
fn test_restart_resumes_tip_and_undo() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.storage.data_dir = dir.path().to_path_buf();

    let store = FileUndoStore::from_config(&config.storage).unwrap();
    let manager = MasternodeManager::open(config.clone(), store, GENESIS).unwrap();
    let mut chain = TestChain::from_manager(manager);
    chain.activate();
    let collateral = chain.register(1);
    let spend = chain.spend_tx(collateral);
    chain.mine(vec![spend]).unwrap();

    let tip = chain.tip().clone();
    let gate = chain.manager.gate().clone();
    drop(chain);

    let store = FileUndoStore::from_config(&config.storage).unwrap();
    let mut manager = MasternodeManager::open(config, store, GENESIS).unwrap();
    assert_eq!(manager.tip(), &tip);
    assert_eq!(manager.gate(), &gate);
    assert_eq!(manager.activation_state(), ActivationState::Active);
    query::verify_integrity(&manager).unwrap();

    let restored = manager.disconnect_tip().unwrap();
    assert!(restored.contains(&collateral));
}

/// A registry opened against another genesis refuses to load
#[test]
fn test_reopen_with_other_genesis_fails() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.storage.data_dir = dir.path().to_path_buf();

    let store = FileUndoStore::from_config(&config.storage).unwrap();
    MasternodeManager::open(config.clone(), store, GENESIS).unwrap();

    let store = FileUndoStore::from_config(&config.storage).unwrap();
    let result = MasternodeManager::open(config, store, Hash256([0x01; 32]));
    assert!(matches!(result, Err(DmnError::Storage(_))));
}

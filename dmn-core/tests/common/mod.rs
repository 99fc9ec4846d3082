//! Chain builder shared by the integration tests

#![allow(dead_code)]

use dmn_core::query::BlockSource;
use dmn_core::specialtx::{
    CommitmentPayload, RegistrationPayload, RevocationPayload, ServiceUpdatePayload, SpecialTx,
    TRANSACTION_COINBASE, TRANSACTION_PROVIDER_REGISTER, TRANSACTION_PROVIDER_UPDATE_REVOKE,
    TRANSACTION_PROVIDER_UPDATE_SERVICE,
};
use dmn_core::transaction::{inputs_hash, TRANSACTION_NORMAL};
use dmn_core::*;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Block reward used by every test block
pub const REWARD: Amount = 10 * COIN;

/// First height at which the test deployment is active
pub const ACTIVATION_HEIGHT: BlockHeight = 12;

/// Genesis hash of every test chain
pub const GENESIS: Hash256 = Hash256([0x6e; 32]);

/// Four-block windows, three signals to lock in, active from height 12
pub fn test_config() -> DmnConfig {
    let mut config = DmnConfig::default();
    config.activation = ActivationConfig {
        window_size: 4,
        threshold: 3,
        start_height: 0,
        timeout_height: 10_000,
        signal_bit: 3,
    };
    config.registry.payment_confirmations = 2;
    config.registry.max_reorg_depth = 100;
    config
}

/// How a built block pays the masternode share
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payout {
    /// Pay the selected entry
    Correct,
    /// Pay the right amount to a script nobody registered
    Wrong,
}

pub fn owner_key(seed: u8) -> KeyId {
    KeyId([seed; 20])
}

pub fn operator_key(seed: u8) -> KeyId {
    let mut key = [0xee; 20];
    key[0] = seed;
    KeyId(key)
}

pub fn service(seed: u8) -> Service {
    Service::from(SocketAddr::from(([10, 0, 0, seed], 9999)))
}

pub fn payout_script(seed: u8) -> Script {
    Script(vec![0x76, 0xa9, seed])
}

pub fn collateral_script(seed: u8) -> Script {
    Script(vec![0xc0, seed])
}

/// A chain of blocks driven through a `MasternodeManager`
pub struct TestChain<S: UndoStore = MemoryUndoStore> {
    pub manager: MasternodeManager<S>,
    pub coins: HashMap<OutPoint, Coin>,
    pub sporks: SporkValues,
    /// Active chain blocks by height, genesis excluded
    pub blocks: HashMap<BlockHeight, Block>,
    nonce: u32,
}

impl TestChain<MemoryUndoStore> {
    /// Chain at genesis with an in-memory store
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: DmnConfig) -> Self {
        let manager = MasternodeManager::open(config, MemoryUndoStore::new(), GENESIS).unwrap();
        Self::from_manager(manager)
    }

    /// Chain whose next block is the first with the deployment active
    pub fn activated() -> Self {
        let mut chain = Self::new();
        chain.activate();
        chain
    }
}

impl<S: UndoStore> TestChain<S> {
    pub fn from_manager(manager: MasternodeManager<S>) -> Self {
        Self {
            manager,
            coins: HashMap::new(),
            sporks: SporkValues::default(),
            blocks: HashMap::new(),
            nonce: 0,
        }
    }

    pub fn tip(&self) -> &Snapshot {
        self.manager.tip()
    }

    pub fn height(&self) -> BlockHeight {
        self.manager.tip_height()
    }

    /// Mine signalling blocks until the next block is active
    pub fn activate(&mut self) {
        while self.height() + 1 < ACTIVATION_HEIGHT {
            self.mine(vec![]).unwrap();
        }
        assert_eq!(
            self.manager.gate().state_at(ACTIVATION_HEIGHT),
            Some(ActivationState::Active)
        );
    }

    /// An outpoint nobody else uses
    pub fn fresh_outpoint(&mut self) -> OutPoint {
        self.nonce += 1;
        let mut data = b"fresh".to_vec();
        data.extend_from_slice(&self.nonce.to_le_bytes());
        OutPoint::new(Hash256::sha256d(&data), 0)
    }

    /// Create an unspent collateral-sized output confirmed at the tip
    pub fn fund(&mut self, seed: u8) -> OutPoint {
        let outpoint = self.fresh_outpoint();
        self.coins.insert(
            outpoint,
            Coin {
                value: self.manager.config().registry.collateral_amount,
                script: collateral_script(seed),
                height: self.height(),
            },
        );
        outpoint
    }

    pub fn registration_payload(&self, seed: u8, collateral: OutPoint, inputs: &[OutPoint]) -> RegistrationPayload {
        RegistrationPayload {
            version: 1,
            collateral_outpoint: collateral,
            collateral_amount: self.manager.config().registry.collateral_amount,
            collateral_script: collateral_script(seed),
            service: service(seed),
            protocol_version: 70210,
            owner_key: owner_key(seed),
            operator_key: operator_key(seed),
            voting_key: owner_key(seed),
            operator_reward: 0,
            payout_script: payout_script(seed),
            inputs_hash: inputs_hash(inputs),
        }
    }

    /// Registration of entry `seed` backed by `collateral`
    pub fn registration_tx(&mut self, seed: u8, collateral: OutPoint) -> Transaction {
        let inputs = vec![self.fresh_outpoint()];
        let payload = self.registration_payload(seed, collateral, &inputs);
        special_tx(TRANSACTION_PROVIDER_REGISTER, inputs, vec![], SpecialTx::Registration(payload))
    }

    /// Registration whose collateral is output 0 of the transaction itself,
    /// spending `inputs`
    pub fn internal_registration_tx(&mut self, seed: u8, inputs: Vec<OutPoint>) -> Transaction {
        let mut payload = self.registration_payload(seed, OutPoint::new(Hash256::ZERO, 0), &inputs);
        payload.inputs_hash = inputs_hash(&inputs);
        let collateral = TxOut::new(
            self.manager.config().registry.collateral_amount,
            collateral_script(seed),
        );
        special_tx(
            TRANSACTION_PROVIDER_REGISTER,
            inputs,
            vec![collateral],
            SpecialTx::Registration(payload),
        )
    }

    pub fn service_update_tx(&mut self, collateral: OutPoint, new_service: Service) -> Transaction {
        let inputs = vec![self.fresh_outpoint()];
        let payload = ServiceUpdatePayload {
            version: 1,
            collateral_outpoint: collateral,
            service: new_service,
            protocol_version: 70210,
            operator_payout_script: Script::new(),
            inputs_hash: inputs_hash(&inputs),
        };
        special_tx(TRANSACTION_PROVIDER_UPDATE_SERVICE, inputs, vec![], SpecialTx::ServiceUpdate(payload))
    }

    pub fn revocation_tx(&mut self, collateral: OutPoint, reason: u16) -> Transaction {
        let inputs = vec![self.fresh_outpoint()];
        let payload = RevocationPayload {
            version: 1,
            collateral_outpoint: collateral,
            reason,
            inputs_hash: inputs_hash(&inputs),
        };
        special_tx(TRANSACTION_PROVIDER_UPDATE_REVOKE, inputs, vec![], SpecialTx::Revocation(payload))
    }

    /// Ordinary transaction spending `outpoint`
    pub fn spend_tx(&mut self, outpoint: OutPoint) -> Transaction {
        let marker = self.fresh_outpoint();
        Transaction::new(
            TRANSACTION_NORMAL,
            vec![outpoint],
            vec![TxOut::new(1, Script(marker.txid.0.to_vec()))],
            vec![],
        )
    }

    fn context(&self) -> BlockContext<'_> {
        BlockContext {
            gate: self.manager.gate(),
            params: &self.manager.config().registry,
            coins: &self.coins,
            sporks: self.sporks,
        }
    }

    fn coinbase(&self, height: BlockHeight, root: Option<Hash256>, payout: Payout) -> Transaction {
        let mut outputs = Vec::new();
        if let Some(entry) = self.manager.next_payee().and_then(|p| self.tip().get(&p)) {
            let selector = self.manager.selector();
            match payout {
                Payout::Correct => outputs = selector.expected_outputs(entry, REWARD),
                Payout::Wrong => {
                    outputs.push(TxOut::new(selector.masternode_payment(REWARD), Script(vec![0xde, 0xad])));
                }
            }
        }
        outputs.push(TxOut::new(1, Script(vec![0x51])));

        match root {
            Some(merkle_root_mn_list) => special_tx(
                TRANSACTION_COINBASE,
                vec![],
                outputs,
                SpecialTx::Commitment(CommitmentPayload {
                    version: 1,
                    height,
                    merkle_root_mn_list,
                }),
            ),
            None => Transaction::new(TRANSACTION_NORMAL, vec![], outputs, height.to_le_bytes().to_vec()),
        }
    }

    /// Block on the active tip carrying `txs`, with the commitment its
    /// transactions produce
    pub fn build_block(&self, txs: Vec<Transaction>, payout: Payout) -> Block {
        let prev = self.tip();
        let height = prev.height() + 1;
        let version = 1u32 << self.manager.config().activation.signal_bit;
        let active = self.manager.gate().state_at(height) == Some(ActivationState::Active);

        let assemble = |root: Option<Hash256>| {
            let mut transactions = vec![self.coinbase(height, root, payout)];
            transactions.extend(txs.iter().cloned());
            Block::new(prev.block_hash(), height, version, REWARD, transactions)
        };

        if !active {
            return assemble(None);
        }
        // An invalid template keeps the zero root; connecting it reports why
        let draft = assemble(Some(Hash256::ZERO));
        let root = expected_commitment(prev, &draft, &self.context())
            .map_or(Hash256::ZERO, |commitment| commitment.merkle_root_mn_list);
        assemble(Some(root))
    }

    /// Connect a prepared block
    pub fn connect(&mut self, block: Block) -> Result<Transition> {
        let transition = self.manager.connect_block(&block, &self.coins, self.sporks)?;
        self.blocks.insert(block.height, block);
        Ok(transition)
    }

    /// Build and connect a correctly paying block
    pub fn mine(&mut self, txs: Vec<Transaction>) -> Result<Transition> {
        let block = self.build_block(txs, Payout::Correct);
        self.connect(block)
    }

    /// Fund, register and confirm entry `seed`
    pub fn register(&mut self, seed: u8) -> OutPoint {
        let collateral = self.fund(seed);
        let tx = self.registration_tx(seed, collateral);
        self.mine(vec![tx]).unwrap();
        collateral
    }

    pub fn disconnect(&mut self) -> Result<Snapshot> {
        let height = self.height();
        let snapshot = self.manager.disconnect_tip()?;
        self.blocks.remove(&height);
        Ok(snapshot)
    }
}

/// Transaction carrying an encoded special payload
pub fn special_tx(tx_type: u16, inputs: Vec<OutPoint>, outputs: Vec<TxOut>, payload: SpecialTx) -> Transaction {
    Transaction::new(tx_type, inputs, outputs, payload.encode().unwrap())
}

impl<S: UndoStore> BlockSource for TestChain<S> {
    fn block(&self, height: BlockHeight) -> Result<Option<Block>> {
        Ok(self.blocks.get(&height).cloned())
    }

    fn coin_view(&self, _height: BlockHeight) -> &dyn CoinView {
        &self.coins
    }
}

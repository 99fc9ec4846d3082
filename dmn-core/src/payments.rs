//! Deterministic payee selection
//!
//! The entry owed the masternode share of block `h` is chosen from the
//! snapshot at `h - 1`: among valid entries registered at least
//! `payment_confirmations` blocks before `h`, the one paid longest ago,
//! ties broken by canonical collateral order.

use crate::config::RegistryConfig;
use crate::snapshot::{MasternodeEntry, Snapshot};
use crate::transaction::{Transaction, TxOut};
use crate::types::{Amount, BlockHeight, OutPoint};

/// Operator reward is expressed in hundredths of a percent
pub const OPERATOR_REWARD_DENOMINATOR: u64 = 10_000;

/// Chooses and predicts payees from snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentSelector {
    payment_confirmations: u32,
    reward_percent: u8,
}

/// Sort key of one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueuePosition {
    paid_height: BlockHeight,
    collateral: OutPoint,
}

impl PaymentSelector {
    /// Selector with explicit parameters
    pub fn new(payment_confirmations: u32, reward_percent: u8) -> Self {
        Self {
            payment_confirmations,
            reward_percent,
        }
    }

    /// Selector following a registry configuration
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.payment_confirmations, config.masternode_reward_percent)
    }

    /// Blocks to wait after registration before an entry can be paid
    pub fn payment_confirmations(&self) -> u32 {
        self.payment_confirmations
    }

    /// Whether `entry` can be paid by the block at `height`
    pub fn is_eligible(&self, entry: &MasternodeEntry, height: BlockHeight) -> bool {
        entry.is_valid()
            && u64::from(height)
                >= u64::from(entry.registered_height) + u64::from(self.payment_confirmations)
    }

    fn position(entry: &MasternodeEntry) -> QueuePosition {
        // A revived entry queues behind entries paid before its revival
        let paid_height = match entry.pose_revived_height {
            Some(revived) if revived > entry.last_paid_height => revived,
            _ => entry.last_paid_height,
        };
        QueuePosition {
            paid_height,
            collateral: entry.collateral,
        }
    }

    /// Payee of the block following `snapshot`
    pub fn winner(&self, snapshot: &Snapshot) -> Option<OutPoint> {
        self.winner_at(snapshot, snapshot.height().saturating_add(1))
    }

    /// Payee of the block at `height`, built on `snapshot`
    pub fn winner_at(&self, snapshot: &Snapshot, height: BlockHeight) -> Option<OutPoint> {
        snapshot
            .iter()
            .filter(|entry| self.is_eligible(entry, height))
            .map(Self::position)
            .min()
            .map(|position| position.collateral)
    }

    /// Payee `offset` blocks after `snapshot`, assuming no registry change
    /// other than the payments themselves. Offset 1 is `winner`.
    pub fn predict(&self, snapshot: &Snapshot, offset: u32) -> Option<OutPoint> {
        if offset == 0 {
            return None;
        }
        self.projected_payees(snapshot, offset)
            .get(offset as usize - 1)
            .copied()
            .flatten()
    }

    /// Payees of the next `count` blocks after `snapshot`.
    ///
    /// Each projected payment moves the payee to the back of the queue
    /// before the next height is considered. `None` marks heights with no
    /// eligible entry.
    pub fn projected_payees(&self, snapshot: &Snapshot, count: u32) -> Vec<Option<OutPoint>> {
        let mut queue: Vec<(QueuePosition, BlockHeight)> = snapshot
            .iter()
            .filter(|entry| entry.is_valid())
            .map(|entry| (Self::position(entry), entry.registered_height))
            .collect();

        let mut payees = Vec::with_capacity(count as usize);
        for step in 1..=count {
            let Some(height) = snapshot.height().checked_add(step) else {
                break;
            };
            let confirmations = u64::from(self.payment_confirmations);
            let next = queue
                .iter_mut()
                .filter(|(_, registered)| u64::from(height) >= u64::from(*registered) + confirmations)
                .min_by_key(|(position, _)| *position);

            match next {
                Some((position, _)) => {
                    payees.push(Some(position.collateral));
                    position.paid_height = height;
                }
                None => payees.push(None),
            }
        }
        payees
    }

    /// Masternode share of a block reward
    pub fn masternode_payment(&self, block_reward: Amount) -> Amount {
        masternode_payment(block_reward, self.reward_percent)
    }

    /// Outputs a coinbase must contain to pay `entry` out of `block_reward`
    pub fn expected_outputs(&self, entry: &MasternodeEntry, block_reward: Amount) -> Vec<TxOut> {
        let payment = self.masternode_payment(block_reward);

        let operator_share = if entry.operator_reward > 0 && !entry.operator_payout_script.is_empty() {
            let share = u128::from(payment) * u128::from(entry.operator_reward)
                / u128::from(OPERATOR_REWARD_DENOMINATOR);
            Amount::try_from(share).unwrap_or(payment)
        } else {
            0
        };

        let mut outputs = vec![TxOut::new(payment - operator_share, entry.payout_script.clone())];
        if operator_share > 0 {
            outputs.push(TxOut::new(operator_share, entry.operator_payout_script.clone()));
        }
        outputs
    }
}

/// `percent` of `block_reward`, rounded down
pub fn masternode_payment(block_reward: Amount, percent: u8) -> Amount {
    let share = u128::from(block_reward) * u128::from(percent) / 100;
    // percent is at most 100 after config validation
    Amount::try_from(share).unwrap_or(block_reward)
}

/// Whether `coinbase` carries every expected payment output
pub fn check_coinbase_payee(coinbase: &Transaction, expected: &[TxOut]) -> bool {
    let mut remaining: Vec<&TxOut> = coinbase.outputs.iter().collect();
    for output in expected {
        match remaining.iter().position(|candidate| *candidate == output) {
            Some(index) => {
                remaining.swap_remove(index);
            }
            None => return false,
        }
    }
    true
}

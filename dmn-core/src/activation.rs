//! Staged activation of masternode special transactions
//!
//! Blocks are grouped into fixed windows of `window_size` heights. The
//! deployment state of a window is derived from the state of the previous
//! window and the number of blocks in it that signalled support. Every
//! block in a window shares that window's state.

use crate::config::ActivationConfig;
use crate::specialtx::SpecialTxKind;
use crate::types::BlockHeight;
use crate::{DmnError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Deployment state of the special transaction rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationState {
    /// Before the start height
    Defined,
    /// Counting signals per window
    Started,
    /// Threshold met, active after one more window
    LockedIn,
    /// Special transactions accepted
    Active,
    /// Timed out without locking in
    Failed,
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivationState::Defined => "defined",
            ActivationState::Started => "started",
            ActivationState::LockedIn => "locked_in",
            ActivationState::Active => "active",
            ActivationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a registration passed the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationAdmission {
    /// Collateral was confirmed before the deployment became active
    Grandfathered,
    /// Collateral was confirmed while the deployment was active
    Fresh,
}

/// Externally resolved feature flags, as heights from which they apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SporkValues {
    /// Height from which the registry is authoritative for payments
    pub deterministic_mns_height: Option<BlockHeight>,
    /// Height from which wrong payees invalidate blocks
    pub payment_enforcement_height: Option<BlockHeight>,
}

impl SporkValues {
    /// Both switches on from genesis
    pub fn enforcing() -> Self {
        Self {
            deterministic_mns_height: Some(0),
            payment_enforcement_height: Some(0),
        }
    }

    /// Whether the registry drives payments and listings at `height`
    pub fn deterministic_active(&self, height: BlockHeight) -> bool {
        self.deterministic_mns_height.is_some_and(|h| height >= h)
    }

    /// Whether payee mismatches are rejected at `height`
    pub fn enforcement_active(&self, height: BlockHeight) -> bool {
        self.payment_enforcement_height.is_some_and(|h| height >= h)
    }
}

/// Activation state machine fed by block signals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationGate {
    params: ActivationConfig,
    /// Signal flag of every connected block, indexed by height
    signals: Vec<bool>,
    /// State of every window whose predecessor is complete
    states: Vec<ActivationState>,
}

impl ActivationGate {
    /// Create a gate with no blocks connected
    pub fn new(params: ActivationConfig) -> Self {
        Self {
            params,
            signals: Vec::new(),
            states: vec![ActivationState::Defined],
        }
    }

    /// Rebuild a gate from stored signals
    pub fn from_signals(params: ActivationConfig, signals: &[bool]) -> Result<Self> {
        let mut gate = Self::new(params);
        for (height, signalled) in signals.iter().enumerate() {
            gate.push_block(height as BlockHeight, *signalled)?;
        }
        Ok(gate)
    }

    /// Deployment parameters
    pub fn params(&self) -> &ActivationConfig {
        &self.params
    }

    /// Recorded signals
    pub fn signals(&self) -> &[bool] {
        &self.signals
    }

    /// Height of the next block to push
    pub fn next_height(&self) -> BlockHeight {
        self.signals.len() as BlockHeight
    }

    /// Record the signal of the block at `height`
    pub fn push_block(&mut self, height: BlockHeight, signalled: bool) -> Result<()> {
        if height != self.next_height() {
            return Err(DmnError::NonContiguousBlock {
                expected: self.next_height().to_string(),
                found: height.to_string(),
            });
        }

        self.signals.push(signalled);

        let window = self.params.window_size as usize;
        if self.signals.len() % window == 0 {
            let completed = self.signals.len() / window - 1;
            let current = self.states[completed];
            let count = self.signals[completed * window..].iter().filter(|s| **s).count() as u32;
            let next_start = self.signals.len() as u64;
            let next = self.transition(current, count, next_start);
            if next != current {
                info!(
                    "Activation state {} -> {} from height {}",
                    current, next, next_start
                );
            }
            self.states.push(next);
        }

        Ok(())
    }

    /// Forget the signal of the most recent block
    pub fn pop_block(&mut self) -> Option<bool> {
        let signalled = self.signals.pop()?;
        let window = self.params.window_size as usize;
        self.states.truncate(self.signals.len() / window + 1);
        Some(signalled)
    }

    fn transition(&self, current: ActivationState, count: u32, next_start: u64) -> ActivationState {
        let timeout = u64::from(self.params.timeout_height);
        match current {
            ActivationState::Defined => {
                if next_start >= timeout {
                    ActivationState::Failed
                } else if next_start >= u64::from(self.params.start_height) {
                    ActivationState::Started
                } else {
                    ActivationState::Defined
                }
            }
            ActivationState::Started => {
                if count >= self.params.threshold {
                    ActivationState::LockedIn
                } else if next_start >= timeout {
                    ActivationState::Failed
                } else {
                    ActivationState::Started
                }
            }
            ActivationState::LockedIn => ActivationState::Active,
            state @ (ActivationState::Active | ActivationState::Failed) => state,
        }
    }

    /// State at `height`, known for every height up to the end of the
    /// window containing the next block
    pub fn state_at(&self, height: BlockHeight) -> Option<ActivationState> {
        let window = height / self.params.window_size;
        self.states.get(window as usize).copied()
    }

    /// First height at which the deployment is active
    pub fn activation_height(&self) -> Option<BlockHeight> {
        self.states
            .iter()
            .position(|state| *state == ActivationState::Active)
            .map(|window| window as BlockHeight * self.params.window_size)
    }

    /// Whether a special transaction of `kind` is accepted at `height`
    pub fn is_accepted(&self, kind: SpecialTxKind, height: BlockHeight) -> bool {
        self.check(kind, height).is_ok()
    }

    /// Reject special transactions before the deployment is active
    pub fn check(&self, _kind: SpecialTxKind, height: BlockHeight) -> Result<()> {
        match self.state_at(height) {
            Some(ActivationState::Active) => Ok(()),
            state => Err(DmnError::NotYetActive {
                height,
                state: state.unwrap_or(ActivationState::Defined),
            }),
        }
    }

    /// Admit a registration at `height` whose collateral was confirmed at
    /// `collateral_height`.
    ///
    /// Collateral confirmed before the activation height stays acceptable.
    /// The returned admission only labels which case applied; both are
    /// accepted on equal terms.
    pub fn check_registration(
        &self,
        height: BlockHeight,
        collateral_height: BlockHeight,
    ) -> Result<RegistrationAdmission> {
        match self.state_at(height) {
            Some(ActivationState::Active) => {}
            state => {
                return Err(DmnError::BelowActivation {
                    height,
                    state: state.unwrap_or(ActivationState::Defined),
                })
            }
        }

        if collateral_height > height {
            return Err(DmnError::InvalidCollateral(format!(
                "collateral confirmed at {} after registration height {}",
                collateral_height, height
            )));
        }

        match self.activation_height() {
            Some(active_from) if collateral_height < active_from => Ok(RegistrationAdmission::Grandfathered),
            _ => Ok(RegistrationAdmission::Fresh),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ActivationConfig {
        ActivationConfig {
            window_size: 4,
            threshold: 3,
            start_height: 4,
            timeout_height: 40,
            signal_bit: 3,
        }
    }

    fn feed(gate: &mut ActivationGate, signals: &[bool]) {
        for s in signals {
            let height = gate.next_height();
            gate.push_block(height, *s).unwrap();
        }
    }

    #[test]
    fn test_full_activation_path() {
        let mut gate = ActivationGate::new(params());
        assert_eq!(gate.state_at(0), Some(ActivationState::Defined));

        // window 0 complete -> window 1 starts at the start height
        feed(&mut gate, &[false; 4]);
        assert_eq!(gate.state_at(4), Some(ActivationState::Started));

        // window 1 signals 3/4 -> locked in for window 2
        feed(&mut gate, &[true, true, false, true]);
        assert_eq!(gate.state_at(8), Some(ActivationState::LockedIn));
        assert!(!gate.is_accepted(SpecialTxKind::Registration, 8));

        // one grace window later it is active
        feed(&mut gate, &[false; 4]);
        assert_eq!(gate.state_at(12), Some(ActivationState::Active));
        assert_eq!(gate.activation_height(), Some(12));
        assert!(gate.is_accepted(SpecialTxKind::ServiceUpdate, 12));
        assert!(gate.is_accepted(SpecialTxKind::Registration, 15));
    }

    #[test]
    fn test_below_threshold_stays_started() {
        let mut gate = ActivationGate::new(params());
        feed(&mut gate, &[false; 4]);
        feed(&mut gate, &[true, true, false, false]);
        assert_eq!(gate.state_at(8), Some(ActivationState::Started));
    }

    #[test]
    fn test_timeout_fails() {
        let mut config = params();
        config.timeout_height = 12;
        let mut gate = ActivationGate::new(config);
        feed(&mut gate, &[false; 12]);
        assert_eq!(gate.state_at(12), Some(ActivationState::Failed));

        // failed is terminal
        feed(&mut gate, &[true; 8]);
        assert_eq!(gate.state_at(20), Some(ActivationState::Failed));
        assert_eq!(gate.activation_height(), None);
    }

    #[test]
    fn test_pop_block_restores_state() {
        let mut gate = ActivationGate::new(params());
        feed(&mut gate, &[false, false, false, false, true, true, true]);
        let before = gate.clone();
        feed(&mut gate, &[true]);
        assert_eq!(gate.state_at(8), Some(ActivationState::LockedIn));
        assert_eq!(gate.pop_block(), Some(true));
        assert_eq!(gate, before);
        assert_eq!(gate.state_at(8), None);
    }

    #[test]
    fn test_push_rejects_gaps() {
        let mut gate = ActivationGate::new(params());
        assert!(matches!(
            gate.push_block(3, true),
            Err(DmnError::NonContiguousBlock { .. })
        ));
    }

    #[test]
    fn test_not_yet_active_error() {
        let gate = ActivationGate::new(params());
        let err = gate.check(SpecialTxKind::Revocation, 1).unwrap_err();
        assert!(matches!(
            err,
            DmnError::NotYetActive { height: 1, state: ActivationState::Defined }
        ));
    }

    #[test]
    fn test_grandfathered_registration() {
        let mut gate = ActivationGate::new(params());
        feed(&mut gate, &[false, false, false, false, true, true, true, true, false, false, false, false]);

        assert_eq!(
            gate.check_registration(13, 2).unwrap(),
            RegistrationAdmission::Grandfathered
        );
        assert_eq!(gate.check_registration(13, 12).unwrap(), RegistrationAdmission::Fresh);
        assert!(matches!(
            gate.check_registration(9, 2),
            Err(DmnError::BelowActivation { .. })
        ));
        assert!(matches!(
            gate.check_registration(13, 14),
            Err(DmnError::InvalidCollateral(_))
        ));
    }

    #[test]
    fn test_from_signals_matches_incremental() {
        let signals = [false, false, false, false, true, true, true, false, false];
        let mut gate = ActivationGate::new(params());
        feed(&mut gate, &signals);
        assert_eq!(ActivationGate::from_signals(params(), &signals).unwrap(), gate);
    }

    #[test]
    fn test_spork_values() {
        let sporks = SporkValues {
            deterministic_mns_height: Some(10),
            payment_enforcement_height: None,
        };
        assert!(!sporks.deterministic_active(9));
        assert!(sporks.deterministic_active(10));
        assert!(!sporks.enforcement_active(1_000));
        assert!(SporkValues::enforcing().enforcement_active(0));
    }
}

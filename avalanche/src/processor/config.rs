use crate::{
    delegation::Delegation,
    peers, proof::{Proof, StakeParams},
    quorum,
    types::{Amount, COIN},
    voting::{Thresholds, VOTE_WINDOW},
};
use avalanche_cryptography::PrivateKey;
use std::time::Duration;
use thiserror::Error;

/// Lowest accepted value of [Config::stale_vote_threshold].
pub const MIN_STALE_VOTE_THRESHOLD: u32 = 140;

/// Invalid configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("min quorum connected stake ratio must be in [0, 1], got {0}")]
    ConnectedStakeRatio(f64),
    #[error("min quorum node count must be above the vote window ({VOTE_WINDOW}), got {0}")]
    QuorumNodeCount(usize),
    #[error("stale vote threshold must be at least {MIN_STALE_VOTE_THRESHOLD}, got {0}")]
    StaleVoteThreshold(u32),
    #[error("stale vote factor must be greater than zero")]
    StaleVoteFactor,
    #[error("stake utxo confirmations must be greater than zero")]
    StakeConfirmations,
    #[error("max element poll must be greater than zero")]
    MaxElementPoll,
    #[error("max inflight poll must be greater than zero")]
    MaxInflightPoll,
    #[error("finalization and invalidation scores must be greater than zero")]
    Score,
    #[error("staking preconsensus requires staking rewards")]
    StakingPreconsensus,
    #[error("the avalanche proof requires a master key or a delegation")]
    MissingMasterKey,
    #[error("the master key does not match the proof")]
    MasterKeyMismatch,
    #[error("a delegation requires a proof")]
    DelegationWithoutProof,
    #[error("the delegation does not match the proof")]
    DelegationProofMismatch,
    #[error("the delegated key does not match the session key")]
    DelegationKeyMismatch,
}

/// Configuration of the avalanche processor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Minimum total stake of known proofs before the quorum can be established.
    pub min_quorum_stake: Amount,

    /// Minimum fraction of the known stake that must be connected.
    pub min_quorum_connected_stake_ratio: f64,

    /// Minimum number of nodes that must have sent their proofs.
    pub min_avaproofs_node_count: usize,

    /// Minimum number of attached nodes required to poll.
    ///
    /// Must exceed [VOTE_WINDOW]: a vote record only counts a node that is not among its last
    /// [VOTE_WINDOW] voters, so with fewer nodes the window fills up and nothing finalizes.
    pub min_quorum_node_count: usize,

    /// Votes without finalizing after which a vote record is dropped.
    pub stale_vote_threshold: u32,

    /// A record is not stale while its votes stay below `confidence * stale_vote_factor`.
    pub stale_vote_factor: u32,

    /// Confidence at which an accepted item is finalized.
    pub finalization_score: u16,

    /// Confidence at which a rejected item is invalidated.
    pub invalidation_score: u16,

    /// Minimum amount of every proof stake.
    pub stake_utxo_dust_threshold: Amount,

    /// Minimum confirmations of every proof stake.
    pub stake_utxo_confirmations: u32,

    /// Delay requested from pollers between two polls.
    pub cooldown: Duration,

    /// How long to wait for a poll response.
    pub query_timeout: Duration,

    /// Minimum time between two replacements of a proof by a conflicting one.
    pub conflicting_proof_cooldown: Duration,

    /// Maximum number of items in a poll.
    pub max_element_poll: usize,

    /// Maximum number of polls in flight for one item.
    pub max_inflight_poll: u8,

    /// Whether mempool transactions are polled.
    pub preconsensus: bool,

    /// Whether a staking reward winner is computed for every tip once the quorum is established.
    pub staking_rewards: bool,

    /// Whether stake contenders are polled.
    pub staking_preconsensus: bool,

    /// Maximum number of addresses sent in answer to `getavaaddr`.
    pub max_addr_to_send: usize,

    /// Whether peers are dumped on shutdown and loaded on startup.
    pub persist_peers: bool,

    /// Reorgs at least this deep are parked automatically.
    pub park_deep_reorg_depth: Option<u32>,

    /// Proof of the local node.
    pub proof: Option<Proof>,

    /// Master key of the local proof.
    pub master_key: Option<PrivateKey>,

    /// Delegation from the local proof to the session key.
    pub delegation: Option<Delegation>,

    /// Key signing hellos and responses (generated if absent).
    pub session_key: Option<PrivateKey>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_quorum_stake: 0,
            min_quorum_connected_stake_ratio: 0.8,
            min_avaproofs_node_count: 8,
            min_quorum_node_count: VOTE_WINDOW + 1,
            stale_vote_threshold: 4096,
            stale_vote_factor: 64,
            finalization_score: 128,
            invalidation_score: 128,
            stake_utxo_dust_threshold: 100_000_000 * COIN,
            stake_utxo_confirmations: 2016,
            cooldown: Duration::from_millis(100),
            query_timeout: Duration::from_secs(10),
            conflicting_proof_cooldown: Duration::from_secs(60),
            max_element_poll: 16,
            max_inflight_poll: 10,
            preconsensus: false,
            staking_rewards: false,
            staking_preconsensus: false,
            max_addr_to_send: 100,
            persist_peers: true,
            park_deep_reorg_depth: Some(2),
            proof: None,
            master_key: None,
            delegation: None,
            session_key: None,
        }
    }
}

impl Config {
    /// Check every value, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = self.min_quorum_connected_stake_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::ConnectedStakeRatio(ratio));
        }
        if self.min_quorum_node_count <= VOTE_WINDOW {
            return Err(ConfigError::QuorumNodeCount(self.min_quorum_node_count));
        }
        if self.stale_vote_threshold < MIN_STALE_VOTE_THRESHOLD {
            return Err(ConfigError::StaleVoteThreshold(self.stale_vote_threshold));
        }
        if self.stale_vote_factor == 0 {
            return Err(ConfigError::StaleVoteFactor);
        }
        if self.stake_utxo_confirmations == 0 {
            return Err(ConfigError::StakeConfirmations);
        }
        if self.max_element_poll == 0 {
            return Err(ConfigError::MaxElementPoll);
        }
        if self.max_inflight_poll == 0 {
            return Err(ConfigError::MaxInflightPoll);
        }
        if self.finalization_score == 0 || self.invalidation_score == 0 {
            return Err(ConfigError::Score);
        }
        if self.staking_preconsensus && !self.staking_rewards {
            return Err(ConfigError::StakingPreconsensus);
        }

        match (&self.proof, &self.delegation) {
            (None, Some(_)) => return Err(ConfigError::DelegationWithoutProof),
            (None, None) => {}
            (Some(proof), None) => {
                let master = self.master_key.as_ref().ok_or(ConfigError::MissingMasterKey)?;
                if master.public_key() != *proof.master() {
                    return Err(ConfigError::MasterKeyMismatch);
                }
            }
            (Some(proof), Some(delegation)) => {
                if delegation.proof_id() != proof.id() {
                    return Err(ConfigError::DelegationProofMismatch);
                }
                let session = self
                    .session_key
                    .as_ref()
                    .ok_or(ConfigError::DelegationKeyMismatch)?;
                if session.public_key() != *delegation.delegated_pubkey() {
                    return Err(ConfigError::DelegationKeyMismatch);
                }
            }
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            finalization_score: self.finalization_score,
            invalidation_score: self.invalidation_score,
            stale_vote_threshold: self.stale_vote_threshold,
            stale_vote_factor: self.stale_vote_factor,
            max_inflight_poll: self.max_inflight_poll,
        }
    }

    pub fn stake_params(&self) -> StakeParams {
        StakeParams {
            dust_threshold: self.stake_utxo_dust_threshold,
            confirmations: self.stake_utxo_confirmations,
        }
    }

    pub fn peers(&self) -> peers::Config {
        peers::Config {
            stake: self.stake_params(),
            conflicting_proof_cooldown: self.conflicting_proof_cooldown,
            dangling_timeout: peers::DANGLING_TIMEOUT,
            max_immature_proofs: peers::MAX_IMMATURE_PROOFS,
        }
    }

    pub fn quorum(&self) -> quorum::Config {
        quorum::Config {
            min_quorum_stake: self.min_quorum_stake,
            min_connected_stake_ratio: self.min_quorum_connected_stake_ratio,
            min_avaproofs_node_count: self.min_avaproofs_node_count,
            min_node_count: self.min_quorum_node_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::ProofBuilder;
    use crate::types::OutPoint;
    use bytes::Bytes;

    fn proof(master: &PrivateKey) -> Proof {
        let mut builder = ProofBuilder::new(0, 0, master.clone(), Bytes::new());
        builder.add_utxo(OutPoint::default(), 1, 0, false, PrivateKey::from_seed(9));
        builder.build()
    }

    #[test]
    fn test_default_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_numeric_bounds() {
        let cases = [
            (
                Config {
                    min_quorum_connected_stake_ratio: 1.5,
                    ..Config::default()
                },
                ConfigError::ConnectedStakeRatio(1.5),
            ),
            (
                Config {
                    min_quorum_node_count: VOTE_WINDOW,
                    ..Config::default()
                },
                ConfigError::QuorumNodeCount(VOTE_WINDOW),
            ),
            (
                Config {
                    stale_vote_threshold: 139,
                    ..Config::default()
                },
                ConfigError::StaleVoteThreshold(139),
            ),
            (
                Config {
                    stale_vote_factor: 0,
                    ..Config::default()
                },
                ConfigError::StaleVoteFactor,
            ),
            (
                Config {
                    stake_utxo_confirmations: 0,
                    ..Config::default()
                },
                ConfigError::StakeConfirmations,
            ),
            (
                Config {
                    staking_preconsensus: true,
                    ..Config::default()
                },
                ConfigError::StakingPreconsensus,
            ),
        ];
        for (config, expected) in cases {
            assert_eq!(config.validate(), Err(expected));
        }
        let nan = Config {
            min_quorum_connected_stake_ratio: f64::NAN,
            ..Config::default()
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_local_identity() {
        let master = PrivateKey::from_seed(0);
        let session = PrivateKey::from_seed(1);
        let local = proof(&master);

        let mut config = Config {
            proof: Some(local.clone()),
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MissingMasterKey));
        config.master_key = Some(session.clone());
        assert_eq!(config.validate(), Err(ConfigError::MasterKeyMismatch));
        config.master_key = Some(master.clone());
        assert_eq!(config.validate(), Ok(()));

        let delegation = Delegation::from_proof(&local)
            .delegate(&master, session.public_key())
            .unwrap();
        config.master_key = None;
        config.delegation = Some(delegation.clone());
        assert_eq!(config.validate(), Err(ConfigError::DelegationKeyMismatch));
        config.session_key = Some(session);
        assert_eq!(config.validate(), Ok(()));

        config.proof = Some(proof(&PrivateKey::from_seed(5)));
        assert_eq!(config.validate(), Err(ConfigError::DelegationProofMismatch));
        config.proof = None;
        assert_eq!(config.validate(), Err(ConfigError::DelegationWithoutProof));
    }
}

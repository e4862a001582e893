//! Transaction, block and chain validation
//!
//! All checks here are read-only predicates over a chain store and a UTXO
//! set; callers decide which locks to hold while running them.

use crate::core::amount::Amount;
use crate::core::block::{Block, DEFAULT_DIFFICULTY};
use crate::core::blockchain::{ChainError, ChainStore};
use crate::core::transaction::Transaction;
use crate::storage::UtxoSet;
use std::collections::HashSet;
use thiserror::Error;

/// Rule violations found while validating a transaction or block
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Transaction {txn_id} spends unknown UTXO {key}")]
    MissingUtxo { txn_id: String, key: String },
    #[error("Transaction {0} has a negative output")]
    NegativeOutput(String),
    #[error("Transaction {0} has a negative fee")]
    NegativeFee(String),
    #[error("Transaction {txn_id} spends {inputs} but outputs {outputs} with fee {fee}")]
    Insolvent {
        txn_id: String,
        inputs: Amount,
        outputs: Amount,
        fee: Amount,
    },
    #[error("Transaction {0} amounts overflow")]
    Overflow(String),
    #[error("Transaction ID {0} does not match its content")]
    IdMismatch(String),
    #[error("Transaction {0} input/output counts do not match its lists")]
    SizeMismatch(String),
    #[error("UTXO {key} is spent twice (transaction {txn_id})")]
    DoubleSpend { txn_id: String, key: String },
    #[error("Parent block {0} is not in the chain")]
    UnknownParent(String),
    #[error("Stored parent hash {stored} does not match declared parent {declared}")]
    ParentMismatch { declared: String, stored: String },
    #[error("Invalid height: expected {expected}, got {got}")]
    InvalidHeight { expected: u64, got: u64 },
    #[error("Invalid merkle root")]
    InvalidMerkleRoot,
    #[error("Block hash does not match its header")]
    InvalidBlockHash,
    #[error("Block hash lacks {0} leading zeros")]
    InsufficientWork(u32),
    #[error("Block difficulty {got} is below the required {required}")]
    DifficultyTooLow { required: u32, got: u32 },
    #[error("Block has no coinbase transaction")]
    MissingCoinbase,
    #[error("Invalid coinbase: {0}")]
    InvalidCoinbase(String),
    #[error("Zero-input transaction {0} outside the coinbase position")]
    UnexpectedCoinbase(String),
    #[error("Invalid genesis block: {0}")]
    InvalidGenesis(String),
}

/// Consensus parameters shared by validation and mining
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedgerParams {
    /// Minimum difficulty a block must declare
    pub difficulty: u32,
    /// Value a coinbase may mint on top of the block's fees
    pub block_reward: Amount,
}

impl Default for LedgerParams {
    fn default() -> Self {
        Self {
            difficulty: DEFAULT_DIFFICULTY,
            block_reward: Amount::ZERO,
        }
    }
}

impl LedgerParams {
    pub fn with_difficulty(difficulty: u32) -> Self {
        Self {
            difficulty,
            ..Self::default()
        }
    }
}

fn checked_total<'a>(
    txn_id: &str,
    mut amounts: impl Iterator<Item = &'a Amount>,
) -> Result<Amount, ValidationError> {
    amounts.try_fold(Amount::ZERO, |acc, value| {
        acc.checked_add(*value)
            .ok_or_else(|| ValidationError::Overflow(txn_id.to_string()))
    })
}

/// Check a spending transaction against the UTXO set
///
/// Every input must reference an existing UTXO (once), no output may be
/// negative, and outputs plus fee may not exceed the inputs. Returns the
/// resolved input total.
pub fn validate_transaction(txn: &Transaction, utxos: &UtxoSet) -> Result<Amount, ValidationError> {
    if txn.is_coinbase() {
        return Err(ValidationError::UnexpectedCoinbase(txn.id.clone()));
    }
    if !txn.sizes_match() {
        return Err(ValidationError::SizeMismatch(txn.id.clone()));
    }
    if !txn.verify_id() {
        return Err(ValidationError::IdMismatch(txn.id.clone()));
    }

    let mut seen = HashSet::new();
    let mut values = Vec::with_capacity(txn.inputs.len());
    for key in txn.spent_keys() {
        let utxo = utxos.get(&key).ok_or_else(|| ValidationError::MissingUtxo {
            txn_id: txn.id.clone(),
            key: key.clone(),
        })?;
        values.push(utxo.value);
        if !seen.insert(key.clone()) {
            return Err(ValidationError::DoubleSpend {
                txn_id: txn.id.clone(),
                key,
            });
        }
    }
    let inputs = checked_total(&txn.id, values.iter())?;

    if txn.outputs.iter().any(|output| output.value.is_negative()) {
        return Err(ValidationError::NegativeOutput(txn.id.clone()));
    }
    if txn.fee.is_negative() {
        return Err(ValidationError::NegativeFee(txn.id.clone()));
    }

    let outputs = checked_total(&txn.id, txn.outputs.iter().map(|output| &output.value))?;
    let spent = outputs
        .checked_add(txn.fee)
        .ok_or_else(|| ValidationError::Overflow(txn.id.clone()))?;
    if spent > inputs {
        return Err(ValidationError::Insolvent {
            txn_id: txn.id.clone(),
            inputs,
            outputs,
            fee: txn.fee,
        });
    }

    Ok(inputs)
}

fn validate_coinbase(
    coinbase: &Transaction,
    fees: Amount,
    params: &LedgerParams,
) -> Result<(), ValidationError> {
    if !coinbase.sizes_match() {
        return Err(ValidationError::SizeMismatch(coinbase.id.clone()));
    }
    if !coinbase.verify_id() {
        return Err(ValidationError::IdMismatch(coinbase.id.clone()));
    }
    if coinbase.fee != Amount::ZERO {
        return Err(ValidationError::InvalidCoinbase("fee must be zero".into()));
    }
    if coinbase.outputs.iter().any(|output| output.value.is_negative()) {
        return Err(ValidationError::NegativeOutput(coinbase.id.clone()));
    }

    let paid = checked_total(&coinbase.id, coinbase.outputs.iter().map(|output| &output.value))?;
    let allowed = fees
        .checked_add(params.block_reward)
        .ok_or_else(|| ValidationError::Overflow(coinbase.id.clone()))?;
    if paid > allowed {
        return Err(ValidationError::InvalidCoinbase(format!(
            "pays {} but only {} is available",
            paid, allowed
        )));
    }
    Ok(())
}

/// Validate a block against its parent in the chain and the UTXO set
pub fn validate_block(
    block: &Block,
    chain: &ChainStore,
    utxos: &UtxoSet,
    params: &LedgerParams,
) -> Result<(), ValidationError> {
    check_linkage(block, chain)?;

    if !block.verify_hash() {
        return Err(ValidationError::InvalidBlockHash);
    }
    check_difficulty(block, params)?;
    if !block.is_valid_pow() {
        return Err(ValidationError::InsufficientWork(block.difficulty));
    }

    check_body(block, utxos, params)
}

/// Validate an unmined candidate: every block rule except proof of work
pub fn validate_candidate(
    block: &Block,
    chain: &ChainStore,
    utxos: &UtxoSet,
    params: &LedgerParams,
) -> Result<(), ValidationError> {
    check_linkage(block, chain)?;
    check_difficulty(block, params)?;
    check_body(block, utxos, params)
}

fn check_difficulty(block: &Block, params: &LedgerParams) -> Result<(), ValidationError> {
    if block.difficulty < params.difficulty {
        return Err(ValidationError::DifficultyTooLow {
            required: params.difficulty,
            got: block.difficulty,
        });
    }
    Ok(())
}

fn check_linkage(block: &Block, chain: &ChainStore) -> Result<(), ValidationError> {
    let parent = chain
        .get(&block.previous_hash)
        .ok_or_else(|| ValidationError::UnknownParent(block.previous_hash.clone()))?;
    if parent.hash != block.previous_hash {
        return Err(ValidationError::ParentMismatch {
            declared: block.previous_hash.clone(),
            stored: parent.hash.clone(),
        });
    }
    if block.height != parent.height + 1 {
        return Err(ValidationError::InvalidHeight {
            expected: parent.height + 1,
            got: block.height,
        });
    }
    Ok(())
}

fn check_body(block: &Block, utxos: &UtxoSet, params: &LedgerParams) -> Result<(), ValidationError> {
    if !block.verify_merkle_root() {
        return Err(ValidationError::InvalidMerkleRoot);
    }

    let coinbase = block.coinbase_tx().ok_or(ValidationError::MissingCoinbase)?;

    let mut spent = HashSet::new();
    let mut fees = Amount::ZERO;
    for txn in block.regular_transactions() {
        validate_transaction(txn, utxos)?;
        for key in txn.spent_keys() {
            if !spent.insert(key.clone()) {
                return Err(ValidationError::DoubleSpend {
                    txn_id: txn.id.clone(),
                    key,
                });
            }
        }
        fees = fees
            .checked_add(txn.fee)
            .ok_or_else(|| ValidationError::Overflow(txn.id.clone()))?;
    }

    validate_coinbase(coinbase, fees, params)
}

/// Check the fixed shape of the genesis block
pub fn validate_genesis(block: &Block) -> Result<(), ValidationError> {
    if block.height != 0 {
        return Err(ValidationError::InvalidGenesis(format!(
            "height {}",
            block.height
        )));
    }
    if !block.previous_hash.is_empty() {
        return Err(ValidationError::InvalidGenesis("has a parent".into()));
    }
    if !block.transactions.is_empty() {
        return Err(ValidationError::InvalidGenesis("has transactions".into()));
    }
    if !block.verify_hash() {
        return Err(ValidationError::InvalidBlockHash);
    }
    Ok(())
}

/// Validate the whole chain from genesis to tip
///
/// Blocks are replayed oldest-first against a scratch UTXO set so each one
/// is checked against the outputs that existed when it was appended.
pub fn validate_chain(chain: &ChainStore, params: &LedgerParams) -> Result<(), ChainError> {
    replay(chain, params, None)
}

/// Validate one stored block as of its position in the chain
///
/// Replays the chain from genesis up to and including `hash`.
pub fn validate_chain_block(
    chain: &ChainStore,
    hash: &str,
    params: &LedgerParams,
) -> Result<(), ChainError> {
    if !chain.contains(hash) {
        return Err(ChainError::UnknownBlock(hash.to_string()));
    }
    replay(chain, params, Some(hash))
}

fn replay(chain: &ChainStore, params: &LedgerParams, stop_at: Option<&str>) -> Result<(), ChainError> {
    let mut blocks = chain.walk_from_tip()?;
    blocks.reverse();

    let mut scratch = UtxoSet::new();
    for block in blocks {
        let checked = if block.height == 0 {
            validate_genesis(block)
        } else {
            validate_block(block, chain, &scratch, params)
        };
        checked.map_err(|source| ChainError::Integrity {
            hash: block.hash.clone(),
            source,
        })?;
        if stop_at == Some(block.hash.as_str()) {
            return Ok(());
        }
        scratch.apply_block(block);
    }

    match stop_at {
        Some(hash) => Err(ChainError::UnknownBlock(hash.to_string())),
        None => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::transaction::{TransactionInput, TransactionOutput};
    use crate::crypto::utxo_key;
    use chrono::{TimeZone, Utc};

    pub(crate) fn coins(value: &str) -> Amount {
        value.parse().unwrap()
    }

    /// Mine a block on top of the chain tip paying its fees to `miner`
    pub(crate) fn mine_on(chain: &ChainStore, miner: &str, txns: Vec<Transaction>, difficulty: u32) -> Block {
        let tip = chain.tip().unwrap();
        let fees: Amount = txns.iter().map(|txn| txn.fee).sum();
        let mut all = vec![Transaction::coinbase(miner, fees)];
        all.extend(txns);
        let mut block = Block::new(tip.height + 1, tip.hash.clone(), all, difficulty);
        while !block.is_valid_pow() {
            block.nonce += 1;
            block.hash = block.calculate_hash();
        }
        block
    }

    fn funded(values: &[&str]) -> (UtxoSet, Vec<String>) {
        let mut set = UtxoSet::new();
        let mut keys = Vec::new();
        for (i, value) in values.iter().enumerate() {
            let funding = Transaction::with_timestamp(
                Vec::new(),
                vec![TransactionOutput::new("alice", coins(value))],
                Amount::ZERO,
                Utc.timestamp_opt(i as i64, 0).unwrap(),
            );
            keys.push(utxo_key(&funding.id, 0));
            set.apply_transaction(&funding);
        }
        (set, keys)
    }

    fn spend_all(set: &UtxoSet, keys: &[String], out: &str, fee: &str) -> Transaction {
        let inputs = keys
            .iter()
            .map(|key| {
                let utxo = set.get(key).unwrap();
                TransactionInput::new(utxo.txn_id.clone(), utxo.index)
            })
            .collect();
        Transaction::new(
            inputs,
            vec![TransactionOutput::new("bob", coins(out))],
            coins(fee),
        )
    }

    #[test]
    fn test_valid_transaction() {
        let (set, keys) = funded(&["4", "3", "3"]);
        let txn = spend_all(&set, &keys, "9.5", "0.01");
        assert_eq!(validate_transaction(&txn, &set), Ok(coins("10")));
    }

    #[test]
    fn test_rejects_overspend() {
        let (set, keys) = funded(&["4", "3", "3"]);
        let txn = spend_all(&set, &keys, "9.995", "0.01");
        assert!(matches!(
            validate_transaction(&txn, &set),
            Err(ValidationError::Insolvent { .. })
        ));

        // Exactly spending everything is allowed
        let txn = spend_all(&set, &keys, "9.99", "0.01");
        assert!(validate_transaction(&txn, &set).is_ok());
    }

    #[test]
    fn test_rejects_overflowing_outputs() {
        let (set, keys) = funded(&["1"]);
        let utxo = set.get(&keys[0]).unwrap();
        let huge = Amount::from_units(i64::MAX);
        let txn = Transaction::new(
            vec![TransactionInput::new(utxo.txn_id.clone(), utxo.index)],
            vec![
                TransactionOutput::new("bob", huge),
                TransactionOutput::new("carol", huge),
            ],
            Amount::ZERO,
        );
        assert_eq!(
            validate_transaction(&txn, &set),
            Err(ValidationError::Overflow(txn.id.clone()))
        );
    }

    #[test]
    fn test_rejects_missing_utxo() {
        let set = UtxoSet::new();
        let txn = Transaction::new(
            vec![TransactionInput::new("nowhere", 0)],
            vec![TransactionOutput::new("bob", coins("1"))],
            Amount::ZERO,
        );
        assert!(matches!(
            validate_transaction(&txn, &set),
            Err(ValidationError::MissingUtxo { .. })
        ));
    }

    #[test]
    fn test_rejects_negative_output_and_fee() {
        let (set, keys) = funded(&["5"]);
        let txn = spend_all(&set, &keys, "-1", "0");
        assert!(matches!(
            validate_transaction(&txn, &set),
            Err(ValidationError::NegativeOutput(_))
        ));

        let txn = spend_all(&set, &keys, "1", "-0.5");
        assert!(matches!(
            validate_transaction(&txn, &set),
            Err(ValidationError::NegativeFee(_))
        ));
    }

    #[test]
    fn test_rejects_tampered_and_duplicate_inputs() {
        let (set, keys) = funded(&["5"]);
        let mut txn = spend_all(&set, &keys, "1", "0");
        txn.outputs[0].value = coins("2");
        assert!(matches!(
            validate_transaction(&txn, &set),
            Err(ValidationError::IdMismatch(_))
        ));

        let doubled = vec![keys[0].clone(), keys[0].clone()];
        let txn = spend_all(&set, &doubled, "1", "0");
        assert!(matches!(
            validate_transaction(&txn, &set),
            Err(ValidationError::DoubleSpend { .. })
        ));
    }

    #[test]
    fn test_rejects_bare_coinbase_transaction() {
        let txn = Transaction::coinbase("mallory", coins("100"));
        assert!(matches!(
            validate_transaction(&txn, &UtxoSet::new()),
            Err(ValidationError::UnexpectedCoinbase(_))
        ));
    }

    #[test]
    fn test_valid_block() {
        let chain = ChainStore::with_genesis();
        let (set, keys) = funded(&["10"]);
        let txn = spend_all(&set, &keys, "9", "1");
        let block = mine_on(&chain, "miner", vec![txn], 1);

        assert_eq!(
            validate_block(&block, &chain, &set, &LedgerParams::with_difficulty(1)),
            Ok(())
        );
    }

    #[test]
    fn test_block_linkage_checks() {
        let chain = ChainStore::with_genesis();
        let set = UtxoSet::new();
        let params = LedgerParams::with_difficulty(1);

        let mut orphan = mine_on(&chain, "miner", Vec::new(), 1);
        orphan.previous_hash = "missing".into();
        assert!(matches!(
            validate_block(&orphan, &chain, &set, &params),
            Err(ValidationError::UnknownParent(_))
        ));

        let mut wrong_height = mine_on(&chain, "miner", Vec::new(), 1);
        wrong_height.height = 5;
        assert!(matches!(
            validate_block(&wrong_height, &chain, &set, &params),
            Err(ValidationError::InvalidHeight { expected: 1, got: 5 })
        ));
    }

    #[test]
    fn test_block_header_checks() {
        let chain = ChainStore::with_genesis();
        let set = UtxoSet::new();

        let block = mine_on(&chain, "miner", Vec::new(), 1);
        assert!(matches!(
            validate_block(&block, &chain, &set, &LedgerParams::with_difficulty(2)),
            Err(ValidationError::DifficultyTooLow { required: 2, got: 1 })
        ));

        let mut unmined = Block::new(1, chain.tip().unwrap().hash.clone(), block.transactions.clone(), 1);
        while unmined.is_valid_pow() {
            unmined.nonce += 1;
            unmined.hash = unmined.calculate_hash();
        }
        assert_eq!(
            validate_block(&unmined, &chain, &set, &LedgerParams::with_difficulty(1)),
            Err(ValidationError::InsufficientWork(1))
        );

        let mut forged = block.clone();
        forged.hash = "0".repeat(64);
        assert_eq!(
            validate_block(&forged, &chain, &set, &LedgerParams::with_difficulty(1)),
            Err(ValidationError::InvalidBlockHash)
        );
    }

    #[test]
    fn test_candidate_skips_proof_of_work() {
        let chain = ChainStore::with_genesis();
        let (set, keys) = funded(&["10"]);
        let txn = spend_all(&set, &keys, "9", "1");
        let tip = chain.tip().unwrap();
        let candidate = Block::new(
            1,
            tip.hash.clone(),
            vec![Transaction::coinbase("miner", coins("1")), txn],
            64,
        );
        let params = LedgerParams::with_difficulty(1);

        assert_eq!(validate_candidate(&candidate, &chain, &set, &params), Ok(()));
        assert_eq!(
            validate_block(&candidate, &chain, &set, &params),
            Err(ValidationError::InsufficientWork(64))
        );
    }

    #[test]
    fn test_coinbase_rules() {
        let chain = ChainStore::with_genesis();
        let (set, keys) = funded(&["10"]);
        let txn = spend_all(&set, &keys, "9", "1");
        let params = LedgerParams::with_difficulty(0);

        // Coinbase claiming more than the fees
        let tip = chain.tip().unwrap();
        let greedy = Block::new(
            1,
            tip.hash.clone(),
            vec![Transaction::coinbase("miner", coins("2")), txn.clone()],
            0,
        );
        assert!(matches!(
            validate_block(&greedy, &chain, &set, &params),
            Err(ValidationError::InvalidCoinbase(_))
        ));

        // The same claim is fine with a block reward
        let rewarded = LedgerParams {
            difficulty: 0,
            block_reward: coins("1"),
        };
        assert_eq!(validate_block(&greedy, &chain, &set, &rewarded), Ok(()));

        // No coinbase at all
        let bare = Block::new(1, tip.hash.clone(), vec![txn], 0);
        assert_eq!(
            validate_block(&bare, &chain, &set, &params),
            Err(ValidationError::MissingCoinbase)
        );
    }

    #[test]
    fn test_intra_block_double_spend() {
        let chain = ChainStore::with_genesis();
        let (set, keys) = funded(&["10"]);
        let first = spend_all(&set, &keys, "9", "1");
        let second = spend_all(&set, &keys, "8", "2");
        let block = mine_on(&chain, "miner", vec![first, second], 0);

        assert!(matches!(
            validate_block(&block, &chain, &set, &LedgerParams::with_difficulty(0)),
            Err(ValidationError::DoubleSpend { .. })
        ));
    }

    #[test]
    fn test_validate_chain_replays_history() {
        let params = LedgerParams::with_difficulty(1);
        let mut chain = ChainStore::with_genesis();

        // Block 1 mints 3 coins to alice through the block reward
        let rewarded = LedgerParams {
            difficulty: 1,
            block_reward: coins("3"),
        };
        let tip = chain.tip().unwrap().clone();
        let mut first = Block::new(1, tip.hash, vec![Transaction::coinbase("alice", coins("3"))], 1);
        while !first.is_valid_pow() {
            first.nonce += 1;
            first.hash = first.calculate_hash();
        }
        let minted = first.transactions[0].clone();
        chain.append_to_tip(first).unwrap();

        // Block 2 spends that output, so it no longer exists at the tip
        let spend = Transaction::new(
            vec![TransactionInput::new(minted.id.clone(), 0)],
            vec![TransactionOutput::new("bob", coins("2.5"))],
            coins("0.5"),
        );
        let second = mine_on(&chain, "miner", vec![spend], 1);
        chain.append_to_tip(second).unwrap();

        assert_eq!(validate_chain(&chain, &rewarded), Ok(()));

        // Without the reward the first block over-pays its coinbase
        let hash = chain.walk_from_tip().unwrap()[1].hash.clone();
        assert!(matches!(
            validate_chain(&chain, &params),
            Err(ChainError::Integrity { hash: h, source: ValidationError::InvalidCoinbase(_) }) if h == hash
        ));
    }

    #[test]
    fn test_validate_single_stored_block() {
        let params = LedgerParams::with_difficulty(1);
        let mut chain = ChainStore::with_genesis();
        let first = mine_on(&chain, "miner", Vec::new(), 1);
        let first_hash = first.hash.clone();
        chain.append_to_tip(first).unwrap();

        let genesis_hash = chain.genesis().unwrap().hash.clone();
        assert_eq!(validate_chain_block(&chain, &genesis_hash, &params), Ok(()));
        assert_eq!(validate_chain_block(&chain, &first_hash, &params), Ok(()));
        assert_eq!(
            validate_chain_block(&chain, "missing", &params),
            Err(ChainError::UnknownBlock("missing".into()))
        );
    }

    #[test]
    fn test_genesis_shape() {
        assert_eq!(validate_genesis(&Block::genesis()), Ok(()));

        let mut genesis = Block::genesis();
        genesis.height = 1;
        assert!(matches!(
            validate_genesis(&genesis),
            Err(ValidationError::InvalidGenesis(_))
        ));
    }
}

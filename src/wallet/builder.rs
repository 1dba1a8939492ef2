//! TransactionBuilder - input selection, fee estimation, change.
//!
//! Selection is largest-first (ties broken by outpoint) so the same UTXO set
//! always yields the same transaction. The fee depends on the input count, so
//! it is re-estimated after every input is added; a spend is accepted only
//! once the inputs cover `amount + fee(inputs, outputs)` for the final shape.

use crate::chain::UnspentOutput;
use crate::error::ServiceError;
use bitcoin::{absolute, transaction, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use std::collections::HashSet;

/// Relay reference fee rate in sat/vB (1000 sat/kvB).
pub const REFERENCE_MIN_FEE_RATE: u64 = 1;
/// Outputs below this are non-standard.
pub const DUST_LIMIT: u64 = 546;
/// Upper bound on the fee multiplier (1000 sat/vB).
pub const MAX_FEE_MULTIPLIER: u64 = 1_000;

// P2WPKH sizes in virtual bytes (overhead is 10.5, rounded up).
const TX_OVERHEAD_VB: u64 = 11;
const INPUT_VB: u64 = 68;
const OUTPUT_VB: u64 = 31;

pub fn estimate_vsize(inputs: usize, outputs: usize) -> u64 {
    TX_OVERHEAD_VB
        .saturating_add(INPUT_VB.saturating_mul(inputs as u64))
        .saturating_add(OUTPUT_VB.saturating_mul(outputs as u64))
}

/// Amounts must be standard (not dust) and representable (at most 21M BTC).
pub fn check_amount(amount: u64) -> Result<(), ServiceError> {
    if amount < DUST_LIMIT || amount > Amount::MAX_MONEY.to_sat() {
        return Err(ServiceError::InvalidAmount { amount, dust_limit: DUST_LIMIT });
    }
    Ok(())
}

/// An assembled, unsigned spend plus the exact outputs it consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateTransaction {
    pub inputs: Vec<UnspentOutput>,
    pub recipient: TxOut,
    pub change: Option<TxOut>,
    pub fee: u64,
    pub vsize: u64,
    /// sat/vB
    pub fee_rate: u64,
}

impl CandidateTransaction {
    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|u| u.amount_sat).sum()
    }

    pub fn amount(&self) -> u64 {
        self.recipient.value.to_sat()
    }

    pub fn change_amount(&self) -> u64 {
        self.change.as_ref().map(|c| c.value.to_sat()).unwrap_or(0)
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.inputs.iter().map(|u| u.outpoint).collect()
    }

    pub fn to_unsigned_tx(&self) -> Transaction {
        let input = self
            .inputs
            .iter()
            .map(|u| TxIn {
                previous_output: u.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect();
        let mut output = vec![self.recipient.clone()];
        output.extend(self.change.clone());
        Transaction { version: transaction::Version::TWO, lock_time: absolute::LockTime::ZERO, input, output }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionBuilder {
    fee_rate: u64,
}

impl TransactionBuilder {
    /// Fee rate = reference minimum × `fee_multiplier`, the multiplier
    /// clamped to `1..=MAX_FEE_MULTIPLIER`.
    pub fn new(fee_multiplier: u64) -> Self {
        let multiplier = fee_multiplier.clamp(1, MAX_FEE_MULTIPLIER);
        if multiplier != fee_multiplier {
            tracing::warn!(requested = fee_multiplier, used = multiplier, "Fee multiplier clamped");
        }
        Self { fee_rate: REFERENCE_MIN_FEE_RATE * multiplier }
    }

    pub fn fee_rate(&self) -> u64 { self.fee_rate }

    pub fn fee_for(&self, inputs: usize, outputs: usize) -> u64 {
        self.fee_rate.saturating_mul(estimate_vsize(inputs, outputs))
    }

    pub fn build(
        &self,
        destination: &ScriptBuf,
        amount: u64,
        available: &[UnspentOutput],
        change_script: ScriptBuf,
    ) -> Result<CandidateTransaction, ServiceError> {
        check_amount(amount)?;
        let max_money = Amount::MAX_MONEY.to_sat();

        let mut seen = HashSet::new();
        let mut ordered: Vec<&UnspentOutput> = available
            .iter()
            .filter(|u| u.amount_sat > 0 && u.amount_sat <= max_money && seen.insert(u.outpoint))
            .collect();
        ordered.sort_by(|a, b| b.amount_sat.cmp(&a.amount_sat).then(a.outpoint.cmp(&b.outpoint)));
        let available_total = ordered.iter().fold(0u64, |sum, u| sum.saturating_add(u.amount_sat));

        let recipient = TxOut { value: Amount::from_sat(amount), script_pubkey: destination.clone() };
        let mut selected: Vec<UnspentOutput> = Vec::new();
        let mut total = 0u64;

        for utxo in &ordered {
            selected.push((*utxo).clone());
            total = total.saturating_add(utxo.amount_sat);
            let n = selected.len();

            let fee_with_change = self.fee_for(n, 2);
            if total >= amount.saturating_add(fee_with_change).saturating_add(DUST_LIMIT) {
                let change = total - amount - fee_with_change;
                return Ok(CandidateTransaction {
                    inputs: selected,
                    recipient,
                    change: Some(TxOut { value: Amount::from_sat(change), script_pubkey: change_script }),
                    fee: fee_with_change,
                    vsize: estimate_vsize(n, 2),
                    fee_rate: self.fee_rate,
                });
            }

            // Leftover too small for a change output goes to the fee.
            if total >= amount.saturating_add(self.fee_for(n, 1)) {
                return Ok(CandidateTransaction {
                    inputs: selected,
                    recipient,
                    change: None,
                    fee: total - amount,
                    vsize: estimate_vsize(n, 1),
                    fee_rate: self.fee_rate,
                });
            }
        }

        let required = if ordered.is_empty() { amount } else { amount.saturating_add(self.fee_for(ordered.len(), 1)) };
        Err(ServiceError::InsufficientFunds { required, available: available_total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    fn utxo(tag: u8, vout: u32, amount_sat: u64) -> UnspentOutput {
        UnspentOutput {
            outpoint: OutPoint { txid: Txid::from_byte_array([tag; 32]), vout },
            amount_sat,
            script_pubkey: ScriptBuf::new(),
            confirmations: 1,
        }
    }

    fn dest() -> ScriptBuf { ScriptBuf::from_bytes(vec![0x00, 0x14, 0xaa]) }
    fn change() -> ScriptBuf { ScriptBuf::from_bytes(vec![0x00, 0x14, 0xcc]) }

    #[test]
    fn single_utxo_with_change() {
        let builder = TransactionBuilder::new(3);
        let tx = builder.build(&dest(), 546, &[utxo(1, 0, 10_000)], change()).unwrap();

        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.amount(), 546);
        assert_eq!(tx.vsize, 141);
        assert_eq!(tx.fee, 423);
        assert_eq!(tx.change_amount(), 10_000 - 546 - 423);
        assert_eq!(tx.input_total(), tx.amount() + tx.change_amount() + tx.fee);
    }

    #[test]
    fn empty_wallet_reports_amount_only() {
        let builder = TransactionBuilder::new(3);
        let err = builder.build(&dest(), 546, &[], change()).unwrap_err();
        assert!(matches!(err, ServiceError::InsufficientFunds { required: 546, available: 0 }));
    }

    #[test]
    fn insufficient_includes_fee_for_all_inputs() {
        let builder = TransactionBuilder::new(3);
        let err = builder.build(&dest(), 546, &[utxo(1, 0, 300), utxo(2, 0, 200)], change()).unwrap_err();
        assert!(matches!(err, ServiceError::InsufficientFunds { required: 1_080, available: 500 }));
    }

    #[test]
    fn largest_first_avoids_small_first_input() {
        // A naive "first output" strategy would pick the 600 and fail.
        let builder = TransactionBuilder::new(3);
        let tx = builder.build(&dest(), 546, &[utxo(1, 0, 600), utxo(2, 0, 5_000)], change()).unwrap();
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.inputs[0].amount_sat, 5_000);
    }

    #[test]
    fn fee_reestimated_for_extra_inputs() {
        let builder = TransactionBuilder::new(3);
        let utxos = [utxo(1, 0, 600), utxo(2, 0, 600), utxo(3, 0, 600)];
        let tx = builder.build(&dest(), 546, &utxos, change()).unwrap();

        assert_eq!(tx.inputs.len(), 2);
        assert!(tx.change.is_none());
        assert!(tx.fee >= builder.fee_for(2, 1));
        assert_eq!(tx.fee, 1_200 - 546);
    }

    #[test]
    fn dust_change_folds_into_fee() {
        let builder = TransactionBuilder::new(1);
        // 781 - 546 - fee(1,1)=110 leaves 125: below dust, so no change output.
        let tx = builder.build(&dest(), 546, &[utxo(1, 0, 781)], change()).unwrap();
        assert!(tx.change.is_none());
        assert_eq!(tx.fee, 781 - 546);
    }

    #[test]
    fn deterministic_tie_break() {
        let builder = TransactionBuilder::new(3);
        let a = [utxo(9, 0, 5_000), utxo(3, 1, 5_000)];
        let b = [utxo(3, 1, 5_000), utxo(9, 0, 5_000)];
        let ta = builder.build(&dest(), 546, &a, change()).unwrap();
        let tb = builder.build(&dest(), 546, &b, change()).unwrap();
        assert_eq!(ta.outpoints(), tb.outpoints());
        assert_eq!(ta.inputs[0].outpoint.txid, Txid::from_byte_array([3; 32]));
    }

    #[test]
    fn duplicate_outpoints_used_once() {
        let builder = TransactionBuilder::new(3);
        let u = utxo(1, 0, 700);
        let err = builder.build(&dest(), 546, &[u.clone(), u], change()).unwrap_err();
        assert!(matches!(err, ServiceError::InsufficientFunds { available: 700, .. }));
    }

    #[test]
    fn dust_amount_rejected() {
        let builder = TransactionBuilder::new(3);
        let err = builder.build(&dest(), 100, &[utxo(1, 0, 10_000)], change()).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidAmount { amount: 100, .. }));
    }

    #[test]
    fn amount_above_max_money_rejected() {
        let builder = TransactionBuilder::new(3);
        let err = builder.build(&dest(), u64::MAX - 100, &[utxo(1, 0, 10_000)], change()).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidAmount { amount, .. } if amount == u64::MAX - 100));

        let max = Amount::MAX_MONEY.to_sat();
        assert!(builder.build(&dest(), max + 1, &[utxo(1, 0, 10_000)], change()).is_err());
    }

    #[test]
    fn huge_fee_multiplier_is_clamped() {
        let builder = TransactionBuilder::new(u64::MAX / 50);
        assert_eq!(builder.fee_rate(), MAX_FEE_MULTIPLIER);
        // 1000 sat/vB on 141 vB is far more than the wallet holds.
        let err = builder.build(&dest(), 546, &[utxo(1, 0, 10_000)], change()).unwrap_err();
        assert!(matches!(err, ServiceError::InsufficientFunds { available: 10_000, .. }));
        assert_eq!(TransactionBuilder::new(0).fee_rate(), 1);
    }

    #[test]
    fn oversized_outputs_never_wrap_totals() {
        let builder = TransactionBuilder::new(3);
        let max = Amount::MAX_MONEY.to_sat();
        let utxos = [utxo(1, 0, u64::MAX), utxo(2, 0, u64::MAX - 1), utxo(3, 0, max), utxo(4, 0, max)];
        let tx = builder.build(&dest(), max, &utxos, change()).unwrap();

        // The two impossible outputs are ignored; two 21M BTC inputs fund it.
        assert_eq!(tx.inputs.len(), 2);
        assert_eq!(tx.input_total(), tx.amount() + tx.change_amount() + tx.fee);
        assert_eq!(tx.change_amount(), max - tx.fee);
    }

    #[test]
    fn unsigned_tx_matches_candidate() {
        let builder = TransactionBuilder::new(3);
        let candidate = builder.build(&dest(), 546, &[utxo(1, 0, 10_000)], change()).unwrap();
        let tx = candidate.to_unsigned_tx();
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[0].value.to_sat(), 546);
        assert_eq!(tx.output[1].script_pubkey, change());
    }
}

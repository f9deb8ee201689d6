//! Wallet state (§3) and the pure mapping from a confirmed ledger operation
//! to a wallet mutation, used by the wallet watcher (§4.6). The watcher
//! itself (the long-lived stream consumer) lives in `starlight-agent`,
//! since it needs the store and the task basket; this module is the pure
//! "what does this operation do to my wallet" core so it can be unit
//! tested without any I/O.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use starlight_common::LedgerAddress;

use crate::ledger::{Cursor, LedgerOperation, OperationKind};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub amount: u64,
    pub pending: u64,
    pub authorized: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub address: LedgerAddress,
    pub native_balance: u64,
    pub reserve: u64,
    pub seqnum: u64,
    pub cursor: Cursor,
    /// asset code -> balance. Native XLM is tracked separately via
    /// `native_balance`.
    pub balances: BTreeMap<String, AssetBalance>,
    pub erased: bool,
}

impl Wallet {
    pub fn new(address: LedgerAddress) -> Self {
        Wallet {
            address,
            native_balance: 0,
            reserve: 0,
            seqnum: 0,
            cursor: Cursor::default(),
            balances: BTreeMap::new(),
            erased: false,
        }
    }
}

/// What applying one operation did, so the caller can decide whether to
/// publish an `Account`-type `Update` (§4.6: "Each applied operation
/// advances cursor and publishes an Account-type Update").
#[derive(Clone, Debug, PartialEq)]
pub enum WalletEffect {
    Applied,
    /// Applied, but `reserve`/`native_balance` were only set to a
    /// provisional value (or left untouched); the caller holds the
    /// `LedgerClient` this pure function doesn't, and must `load_account`
    /// to refresh those fields with the authoritative ledger state before
    /// committing (§4.6 `CreateAccount`'s reserve, `ChangeTrust` limit-0's
    /// reserve release, and `AccountMerge`-as-destination's credited
    /// amount all need this).
    AppliedNeedsReload,
    /// `AccountMerge` with this wallet's address as the *source*: the
    /// caller must erase the whole `agent` bucket tree and republish an
    /// initial `Update` (§4.6, §9 Open Question (c): cursor resets to
    /// empty on the rebuilt agent).
    Erase,
    Ignored,
}

/// Applies one confirmed operation to `wallet` in place, following the
/// recognized-operation-kind table in §4.6. Returns what happened so the
/// caller can decide which `Update` to publish. Never advances `cursor`
/// itself — the caller does that once per confirmed *transaction*, after
/// all of its operations have been applied, matching the spec's per-tx
/// advance.
///
/// Only operations sourced from our own account move our balances
/// directly; `AccountMerge` as *destination* is the one exception, handled
/// by inspecting `op.kind` regardless of source. `issuer_requires_auth` is
/// only consulted for a nonzero-limit `ChangeTrust`: since this function
/// has no ledger access, the caller must look up the issuer's `authRequired`
/// flag itself and pass the result in (§4.6).
pub fn apply_operation(wallet: &mut Wallet, op: &LedgerOperation, issuer_requires_auth: bool) -> WalletEffect {
    match &op.kind {
        OperationKind::CreateAccount {
            destination,
            starting_balance,
        } => {
            if *destination == wallet.address {
                wallet.native_balance = *starting_balance;
                wallet.seqnum = 0;
                WalletEffect::AppliedNeedsReload
            } else {
                WalletEffect::Ignored
            }
        }
        OperationKind::Payment {
            destination,
            asset,
            amount,
        } => {
            if *destination != wallet.address {
                return WalletEffect::Ignored;
            }
            match asset {
                None => wallet.native_balance += amount,
                Some(code) => {
                    wallet.balances.entry(code.clone()).or_default().amount += amount;
                }
            }
            WalletEffect::Applied
        }
        OperationKind::AccountMerge { destination } => {
            if op.source == wallet.address {
                WalletEffect::Erase
            } else if *destination == wallet.address {
                // The merged amount isn't in this operation record; the
                // caller re-fetches the account balance via `load_account`.
                WalletEffect::AppliedNeedsReload
            } else {
                WalletEffect::Ignored
            }
        }
        OperationKind::ChangeTrust {
            asset_code,
            limit,
            ..
        } => {
            if op.source != wallet.address {
                return WalletEffect::Ignored;
            }
            if *limit == 0 {
                wallet.balances.remove(asset_code);
                WalletEffect::AppliedNeedsReload
            } else {
                wallet.balances.entry(asset_code.clone()).or_insert(AssetBalance {
                    authorized: !issuer_requires_auth,
                    ..AssetBalance::default()
                });
                WalletEffect::Applied
            }
        }
        OperationKind::AllowTrust {
            trustor,
            asset_code,
            authorized,
        } => {
            if *trustor != wallet.address {
                return WalletEffect::Ignored;
            }
            if let Some(balance) = wallet.balances.get_mut(asset_code) {
                balance.authorized = *authorized;
                WalletEffect::Applied
            } else {
                WalletEffect::Ignored
            }
        }
        OperationKind::SetOptions { .. } => WalletEffect::Ignored,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(byte: u8) -> LedgerAddress {
        LedgerAddress::from_public_key_bytes([byte; 32])
    }

    #[test]
    fn create_account_sets_balance() {
        let mut wallet = Wallet::new(addr(1));
        let op = LedgerOperation {
            source: addr(2),
            operation_index: 0,
            kind: OperationKind::CreateAccount {
                destination: addr(1),
                starting_balance: 10_000,
            },
        };
        assert_eq!(
            apply_operation(&mut wallet, &op, false),
            WalletEffect::AppliedNeedsReload
        );
        assert_eq!(wallet.native_balance, 10_000);
    }

    #[test]
    fn payment_credits_native_balance() {
        let mut wallet = Wallet::new(addr(1));
        let op = LedgerOperation {
            source: addr(2),
            operation_index: 0,
            kind: OperationKind::Payment {
                destination: addr(1),
                asset: None,
                amount: 500,
            },
        };
        apply_operation(&mut wallet, &op, false);
        assert_eq!(wallet.native_balance, 500);
    }

    #[test]
    fn account_merge_as_source_erases() {
        let mut wallet = Wallet::new(addr(1));
        let op = LedgerOperation {
            source: addr(1),
            operation_index: 0,
            kind: OperationKind::AccountMerge {
                destination: addr(2),
            },
        };
        assert_eq!(apply_operation(&mut wallet, &op, false), WalletEffect::Erase);
    }

    #[test]
    fn account_merge_as_destination_needs_reload() {
        let mut wallet = Wallet::new(addr(1));
        let op = LedgerOperation {
            source: addr(2),
            operation_index: 0,
            kind: OperationKind::AccountMerge {
                destination: addr(1),
            },
        };
        assert_eq!(
            apply_operation(&mut wallet, &op, false),
            WalletEffect::AppliedNeedsReload
        );
    }

    #[test]
    fn change_trust_zero_limit_removes_trustline_and_needs_reload() {
        let mut wallet = Wallet::new(addr(1));
        wallet
            .balances
            .insert("USD".to_string(), AssetBalance::default());
        let op = LedgerOperation {
            source: addr(1),
            operation_index: 0,
            kind: OperationKind::ChangeTrust {
                asset_code: "USD".to_string(),
                asset_issuer: addr(3),
                limit: 0,
            },
        };
        assert_eq!(
            apply_operation(&mut wallet, &op, false),
            WalletEffect::AppliedNeedsReload
        );
        assert!(!wallet.balances.contains_key("USD"));
    }

    #[test]
    fn change_trust_nonzero_limit_honors_issuer_auth_required() {
        let mut wallet = Wallet::new(addr(1));
        let op = LedgerOperation {
            source: addr(1),
            operation_index: 0,
            kind: OperationKind::ChangeTrust {
                asset_code: "USD".to_string(),
                asset_issuer: addr(3),
                limit: 1_000,
            },
        };
        apply_operation(&mut wallet, &op, true);
        assert!(!wallet.balances["USD"].authorized);
    }

    #[test]
    fn change_trust_nonzero_limit_without_auth_required_is_preauthorized() {
        let mut wallet = Wallet::new(addr(1));
        let op = LedgerOperation {
            source: addr(1),
            operation_index: 0,
            kind: OperationKind::ChangeTrust {
                asset_code: "USD".to_string(),
                asset_issuer: addr(3),
                limit: 1_000,
            },
        };
        apply_operation(&mut wallet, &op, false);
        assert!(wallet.balances["USD"].authorized);
    }

    #[test]
    fn allow_trust_flips_authorized() {
        let mut wallet = Wallet::new(addr(1));
        wallet
            .balances
            .insert("USD".to_string(), AssetBalance::default());
        let op = LedgerOperation {
            source: addr(2),
            operation_index: 0,
            kind: OperationKind::AllowTrust {
                trustor: addr(1),
                asset_code: "USD".to_string(),
                authorized: true,
            },
        };
        apply_operation(&mut wallet, &op, false);
        assert!(wallet.balances["USD"].authorized);
    }

    #[test]
    fn unrelated_operation_is_ignored() {
        let mut wallet = Wallet::new(addr(1));
        let before = wallet.clone();
        let op = LedgerOperation {
            source: addr(2),
            operation_index: 0,
            kind: OperationKind::Payment {
                destination: addr(3),
                asset: None,
                amount: 100,
            },
        };
        assert_eq!(
            apply_operation(&mut wallet, &op, false),
            WalletEffect::Ignored
        );
        assert_eq!(wallet, before);
    }
}

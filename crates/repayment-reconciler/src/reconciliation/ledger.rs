//! Oldest-due-first allocation of a payment across obligation buckets.
//!
//! The applier is pure: it stages updated obligations and ledger lines but
//! persists nothing. The caller hands the result to the store as one
//! [`UnitOfWork`](super::store::UnitOfWork).

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::domain::{LedgerBucket, Money, Obligation, ObligationId};

/// What happens to funds left after every outstanding obligation is paid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverpaymentPolicy {
    /// Keep the remainder as customer credit.
    #[default]
    Credit,
    /// Refuse the whole payment.
    Reject,
}

impl OverpaymentPolicy {
    pub const fn label(self) -> &'static str {
        match self {
            OverpaymentPolicy::Credit => "credit",
            OverpaymentPolicy::Reject => "reject",
        }
    }
}

impl FromStr for OverpaymentPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "credit" | "store_credit" => Ok(OverpaymentPolicy::Credit),
            "reject" | "refuse" => Ok(OverpaymentPolicy::Reject),
            other => Err(format!("unknown overpayment policy '{other}'")),
        }
    }
}

/// Order in which a single obligation's buckets absorb funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketPriority([LedgerBucket; 3]);

impl BucketPriority {
    pub fn new(order: [LedgerBucket; 3]) -> Result<Self, String> {
        let mut seen = Vec::with_capacity(3);
        for bucket in order {
            if bucket == LedgerBucket::Credit {
                return Err("credit is not an obligation bucket".to_string());
            }
            if seen.contains(&bucket) {
                return Err(format!("bucket '{bucket}' listed twice"));
            }
            seen.push(bucket);
        }
        Ok(Self(order))
    }

    pub fn order(&self) -> &[LedgerBucket; 3] {
        &self.0
    }
}

impl Default for BucketPriority {
    fn default() -> Self {
        Self([
            LedgerBucket::LateFee,
            LedgerBucket::Interest,
            LedgerBucket::Principal,
        ])
    }
}

impl FromStr for BucketPriority {
    type Err = String;

    /// Parses `late_fee>interest>principal`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let buckets = raw
            .split('>')
            .map(|part| {
                LedgerBucket::from_label(part).ok_or_else(|| format!("unknown bucket '{}'", part.trim()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let order: [LedgerBucket; 3] = buckets
            .try_into()
            .map_err(|_| format!("expected three buckets in '{raw}'"))?;
        Self::new(order)
    }
}

impl fmt::Display for BucketPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [first, second, third] = self.0;
        write!(f, "{first}>{second}>{third}")
    }
}

/// Per-channel allocation rules passed explicitly into the applier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPolicy {
    pub overpayment: OverpaymentPolicy,
    pub bucket_priority: BucketPriority,
}

/// One staged allocation; becomes a `LedgerEntry` on commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerLine {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obligation_id: Option<ObligationId>,
    pub bucket: LedgerBucket,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub lines: Vec<LedgerLine>,
    /// Only the obligations that received funds, with refreshed status.
    pub obligations: Vec<Obligation>,
    pub credit: Money,
}

impl Allocation {
    pub fn total(&self) -> Money {
        self.lines.iter().map(|line| line.amount).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("payment amount must be positive, got {0}")]
    NonPositiveAmount(Money),
    #[error("no outstanding obligation to apply the payment to")]
    NoOutstandingObligation,
    #[error("overpayment rejected: amount {amount} exceeds outstanding {outstanding}")]
    OverpaymentRejected { amount: Money, outstanding: Money },
    #[error("allocated {allocated} does not match payment amount {expected}")]
    Mismatch { expected: Money, allocated: Money },
}

#[derive(Debug, Clone, Default)]
pub struct LedgerApplier {
    policy: ChannelPolicy,
}

impl LedgerApplier {
    pub fn new(policy: ChannelPolicy) -> Self {
        Self { policy }
    }

    pub fn allocate(
        &self,
        amount: Money,
        obligations: &[Obligation],
        as_of: NaiveDate,
    ) -> Result<Allocation, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::NonPositiveAmount(amount));
        }

        let mut open: Vec<Obligation> = obligations
            .iter()
            .filter(|item| item.outstanding().is_positive())
            .cloned()
            .collect();
        if open.is_empty() {
            return Err(LedgerError::NoOutstandingObligation);
        }
        open.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));

        let outstanding: Money = open.iter().map(Obligation::outstanding).sum();
        if amount > outstanding && self.policy.overpayment == OverpaymentPolicy::Reject {
            return Err(LedgerError::OverpaymentRejected {
                amount,
                outstanding,
            });
        }

        let mut remaining = amount;
        let mut lines = Vec::new();
        let mut touched = Vec::new();

        for mut obligation in open {
            if remaining.is_zero() {
                break;
            }

            let mut received = false;
            for &bucket in self.policy.bucket_priority.order() {
                let Some(balance) = obligation.bucket_mut(bucket) else {
                    continue;
                };
                let applied = remaining.min(balance.outstanding());
                if !applied.is_positive() {
                    continue;
                }
                balance.paid += applied;
                remaining -= applied;
                received = true;
                lines.push(LedgerLine {
                    obligation_id: Some(obligation.id.clone()),
                    bucket,
                    amount: applied,
                });
                if remaining.is_zero() {
                    break;
                }
            }

            if received {
                obligation.refresh_status(as_of);
                touched.push(obligation);
            }
        }

        let credit = remaining;
        if credit.is_positive() {
            lines.push(LedgerLine {
                obligation_id: None,
                bucket: LedgerBucket::Credit,
                amount: credit,
            });
        }

        let allocation = Allocation {
            lines,
            obligations: touched,
            credit,
        };

        let allocated = allocation.total();
        if allocated != amount {
            return Err(LedgerError::Mismatch {
                expected: amount,
                allocated,
            });
        }

        Ok(allocation)
    }
}

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Amount in integer minor currency units (sen for IDR).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    pub const ZERO: Money = Money(0);
    /// Largest single payment accepted from any channel (10 trillion rupiah in sen).
    pub const MAX_PAYMENT: Money = Money(1_000_000_000_000_000);

    pub const fn minor_units(self) -> i64 {
        self.0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.copied().sum()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(pub String);

impl Currency {
    pub fn idr() -> Self {
        Self("IDR".to_string())
    }

    pub fn normalized(raw: &str) -> Self {
        Self(raw.trim().to_ascii_uppercase())
    }
}

impl Default for Currency {
    fn default() -> Self {
        Self::idr()
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// External payment source delivering notifications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Bca,
    Ovo,
    Dana,
    Credgenics,
    Other(String),
}

impl Channel {
    pub fn slug(&self) -> &str {
        match self {
            Channel::Bca => "bca",
            Channel::Ovo => "ovo",
            Channel::Dana => "dana",
            Channel::Credgenics => "credgenics",
            Channel::Other(name) => name.as_str(),
        }
    }

    pub fn from_slug(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bca" => Channel::Bca,
            "ovo" => Channel::Ovo,
            "dana" => Channel::Dana,
            "credgenics" => Channel::Credgenics,
            other => Channel::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl Serialize for Channel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.slug())
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.trim().is_empty() {
            return Err(serde::de::Error::custom("channel must not be empty"));
        }
        Ok(Channel::from_slug(&raw))
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Channel-issued reference (VA request id, auth code, order id); unique per channel.
    ExternalReference
);
string_id!(TransactionId);
string_id!(CustomerId);
string_id!(ObligationId);
string_id!(LedgerEntryId);

/// Lifecycle of an inbound payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl TransactionStatus {
    pub const fn label(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Processed => "processed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Processed)
    }

    pub fn transition(self, next: TransactionStatus) -> Result<TransactionStatus, InvalidTransition> {
        use TransactionStatus::*;

        match (self, next) {
            (Pending, Processing)
            | (Failed, Processing)
            | (Processing, Processed)
            | (Processing, Failed) => Ok(next),
            (from, to) => Err(InvalidTransition { from, to }),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transaction cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: TransactionStatus,
    pub to: TransactionStatus,
}

/// Internal record of one inbound payment, keyed by `(channel, external_reference)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub id: TransactionId,
    pub channel: Channel,
    pub external_reference: ExternalReference,
    pub customer_id: CustomerId,
    pub amount: Money,
    pub currency: Currency,
    pub status: TransactionStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalized inbound payment, independent of the channel's wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentNotification {
    pub channel: Channel,
    pub external_reference: ExternalReference,
    /// Virtual account number, wallet phone, or partner loan account.
    pub account_key: String,
    pub amount: Money,
    #[serde(default)]
    pub currency: Currency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
}

/// Ledger buckets; `Credit` holds funds not allocated to any obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBucket {
    LateFee,
    Interest,
    Principal,
    Credit,
}

impl LedgerBucket {
    pub const fn label(self) -> &'static str {
        match self {
            LedgerBucket::LateFee => "late_fee",
            LedgerBucket::Interest => "interest",
            LedgerBucket::Principal => "principal",
            LedgerBucket::Credit => "credit",
        }
    }

    pub fn from_label(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "late_fee" | "latefee" => Some(LedgerBucket::LateFee),
            "interest" => Some(LedgerBucket::Interest),
            "principal" => Some(LedgerBucket::Principal),
            "credit" => Some(LedgerBucket::Credit),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketBalance {
    pub due: Money,
    pub paid: Money,
}

impl BucketBalance {
    pub fn new(due: Money) -> Self {
        Self {
            due,
            paid: Money::ZERO,
        }
    }

    pub fn outstanding(&self) -> Money {
        if self.paid >= self.due {
            Money::ZERO
        } else {
            self.due - self.paid
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationStatus {
    Unpaid,
    PartiallyPaid,
    Paid,
    Overdue,
}

impl ObligationStatus {
    pub const fn label(self) -> &'static str {
        match self {
            ObligationStatus::Unpaid => "unpaid",
            ObligationStatus::PartiallyPaid => "partially_paid",
            ObligationStatus::Paid => "paid",
            ObligationStatus::Overdue => "overdue",
        }
    }
}

/// Installment owed by a customer, split into late-fee, interest, and principal buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obligation {
    pub id: ObligationId,
    pub customer_id: CustomerId,
    pub due_date: NaiveDate,
    pub late_fee: BucketBalance,
    pub interest: BucketBalance,
    pub principal: BucketBalance,
    pub status: ObligationStatus,
    /// Bumped on every committed mutation; commits carrying a stale version are refused.
    #[serde(default)]
    pub version: u64,
}

impl Obligation {
    pub fn new(
        id: ObligationId,
        customer_id: CustomerId,
        due_date: NaiveDate,
        principal: Money,
        interest: Money,
        late_fee: Money,
    ) -> Self {
        Self {
            id,
            customer_id,
            due_date,
            late_fee: BucketBalance::new(late_fee),
            interest: BucketBalance::new(interest),
            principal: BucketBalance::new(principal),
            status: ObligationStatus::Unpaid,
            version: 0,
        }
    }

    pub fn bucket(&self, bucket: LedgerBucket) -> Option<&BucketBalance> {
        match bucket {
            LedgerBucket::LateFee => Some(&self.late_fee),
            LedgerBucket::Interest => Some(&self.interest),
            LedgerBucket::Principal => Some(&self.principal),
            LedgerBucket::Credit => None,
        }
    }

    pub fn bucket_mut(&mut self, bucket: LedgerBucket) -> Option<&mut BucketBalance> {
        match bucket {
            LedgerBucket::LateFee => Some(&mut self.late_fee),
            LedgerBucket::Interest => Some(&mut self.interest),
            LedgerBucket::Principal => Some(&mut self.principal),
            LedgerBucket::Credit => None,
        }
    }

    pub fn due_amount(&self) -> Money {
        self.late_fee.due + self.interest.due + self.principal.due
    }

    pub fn paid_amount(&self) -> Money {
        self.late_fee.paid + self.interest.paid + self.principal.paid
    }

    pub fn outstanding(&self) -> Money {
        self.late_fee.outstanding() + self.interest.outstanding() + self.principal.outstanding()
    }

    pub fn is_settled(&self) -> bool {
        self.outstanding().is_zero()
    }

    /// Recompute `status` from the bucket balances as seen on `as_of`.
    pub fn refresh_status(&mut self, as_of: NaiveDate) {
        self.status = if self.is_settled() {
            ObligationStatus::Paid
        } else if self.due_date < as_of {
            ObligationStatus::Overdue
        } else if self.paid_amount().is_positive() {
            ObligationStatus::PartiallyPaid
        } else {
            ObligationStatus::Unpaid
        };
    }
}

/// Immutable allocation record; the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub transaction_id: TransactionId,
    pub customer_id: CustomerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obligation_id: Option<ObligationId>,
    pub bucket: LedgerBucket,
    pub amount: Money,
    pub recorded_at: DateTime<Utc>,
}

//! Wire shapes posted by each payment channel, normalized into a
//! [`PaymentNotification`].

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{Channel, Currency, ExternalReference, Money, PaymentNotification};

/// Western Indonesia Time, the offset BCA and OVO stamp their local timestamps with.
const WIB_OFFSET_SECONDS: i32 = 7 * 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum ChannelPayload {
    Bca(BcaVirtualAccountPayment),
    Ovo(OvoPushNotification),
    Dana(DanaRepaymentNotification),
    Credgenics(CredgenicsPayment),
}

/// BCA virtual-account payment flag. The VA number is company code + customer number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BcaVirtualAccountPayment {
    pub company_code: String,
    pub customer_number: String,
    pub request_id: String,
    /// Decimal string, e.g. `"150000.00"`.
    pub paid_amount: String,
    #[serde(default)]
    pub currency_code: Option<String>,
    /// `dd/MM/yyyy HH:mm:ss`, Jakarta time.
    pub transaction_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OvoPushNotification {
    pub auth_code: String,
    pub phone: String,
    /// Whole rupiah.
    pub amount: i64,
    /// `yyyy-MM-dd HH:mm:ss`, Jakarta time.
    pub transaction_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DanaRepaymentNotification {
    pub order_id: String,
    pub dana_customer_id: String,
    pub amount: DanaAmount,
    #[serde(default)]
    pub finished_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DanaAmount {
    pub value: String,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredgenicsPayment {
    pub payment_reference: String,
    pub loan_account: String,
    pub amount_minor: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizationError {
    #[error("field '{0}' must not be empty")]
    EmptyField(&'static str),
    #[error("invalid amount '{raw}': {reason}")]
    InvalidAmount { raw: String, reason: &'static str },
    #[error("amount must be positive")]
    NonPositiveAmount,
    #[error("amount {amount} exceeds the single-payment limit of {limit}")]
    AmountAboveLimit { amount: Money, limit: Money },
    #[error("invalid timestamp '{raw}'")]
    InvalidTimestamp { raw: String },
    #[error("payload for channel '{found}' posted to channel '{expected}'")]
    ChannelMismatch { expected: Channel, found: Channel },
}

impl ChannelPayload {
    pub fn channel(&self) -> Channel {
        match self {
            ChannelPayload::Bca(_) => Channel::Bca,
            ChannelPayload::Ovo(_) => Channel::Ovo,
            ChannelPayload::Dana(_) => Channel::Dana,
            ChannelPayload::Credgenics(_) => Channel::Credgenics,
        }
    }

    pub fn normalize(self) -> Result<PaymentNotification, NormalizationError> {
        let notification = match self {
            ChannelPayload::Bca(payload) => {
                let request_id = required("request_id", &payload.request_id)?;
                let company_code = required("company_code", &payload.company_code)?;
                let customer_number = required("customer_number", &payload.customer_number)?;
                PaymentNotification {
                    channel: Channel::Bca,
                    external_reference: ExternalReference::new(request_id),
                    account_key: format!("{company_code}{customer_number}"),
                    amount: parse_decimal_amount(&payload.paid_amount)?,
                    currency: payload
                        .currency_code
                        .as_deref()
                        .map(Currency::normalized)
                        .unwrap_or_default(),
                    paid_at: Some(parse_local_timestamp(
                        &payload.transaction_date,
                        "%d/%m/%Y %H:%M:%S",
                    )?),
                }
            }
            ChannelPayload::Ovo(payload) => {
                let amount = payload
                    .amount
                    .checked_mul(100)
                    .map(Money)
                    .ok_or_else(|| NormalizationError::InvalidAmount {
                        raw: payload.amount.to_string(),
                        reason: "out of range",
                    })?;
                PaymentNotification {
                    channel: Channel::Ovo,
                    external_reference: ExternalReference::new(required(
                        "auth_code",
                        &payload.auth_code,
                    )?),
                    account_key: normalize_phone(required("phone", &payload.phone)?),
                    amount,
                    currency: Currency::idr(),
                    paid_at: Some(parse_local_timestamp(
                        &payload.transaction_date,
                        "%Y-%m-%d %H:%M:%S",
                    )?),
                }
            }
            ChannelPayload::Dana(payload) => PaymentNotification {
                channel: Channel::Dana,
                external_reference: ExternalReference::new(required(
                    "order_id",
                    &payload.order_id,
                )?),
                account_key: required("dana_customer_id", &payload.dana_customer_id)?.to_string(),
                amount: parse_decimal_amount(&payload.amount.value)?,
                currency: Currency::normalized(required(
                    "amount.currency",
                    &payload.amount.currency,
                )?),
                paid_at: payload.finished_time,
            },
            ChannelPayload::Credgenics(payload) => PaymentNotification {
                channel: Channel::Credgenics,
                external_reference: ExternalReference::new(required(
                    "payment_reference",
                    &payload.payment_reference,
                )?),
                account_key: required("loan_account", &payload.loan_account)?.to_string(),
                amount: Money(payload.amount_minor),
                currency: payload
                    .currency
                    .as_deref()
                    .map(Currency::normalized)
                    .unwrap_or_default(),
                paid_at: payload.paid_at,
            },
        };

        check_amount(notification.amount)?;
        Ok(notification)
    }
}

/// Amounts must be positive and no larger than [`Money::MAX_PAYMENT`].
pub fn check_amount(amount: Money) -> Result<(), NormalizationError> {
    if !amount.is_positive() {
        return Err(NormalizationError::NonPositiveAmount);
    }
    if amount > Money::MAX_PAYMENT {
        return Err(NormalizationError::AmountAboveLimit {
            amount,
            limit: Money::MAX_PAYMENT,
        });
    }
    Ok(())
}

fn required<'a>(field: &'static str, value: &'a str) -> Result<&'a str, NormalizationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(NormalizationError::EmptyField(field))
    } else {
        Ok(trimmed)
    }
}

/// Local `08xx` numbers and `+628xx` numbers map to the same wallet.
fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    match digits.strip_prefix('0') {
        Some(rest) => format!("62{rest}"),
        None => digits,
    }
}

/// Parse a decimal string with at most two fractional digits into minor units.
pub fn parse_decimal_amount(raw: &str) -> Result<Money, NormalizationError> {
    let invalid = |reason| NormalizationError::InvalidAmount {
        raw: raw.to_string(),
        reason,
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }
    if trimmed.starts_with('-') {
        return Err(NormalizationError::NonPositiveAmount);
    }

    let (whole, fraction) = match trimmed.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (trimmed, ""),
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("not a decimal number"));
    }
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("not a decimal number"));
    }
    if fraction.len() > 2 {
        return Err(invalid("more than two fractional digits"));
    }

    let whole: i64 = whole.parse().map_err(|_| invalid("out of range"))?;
    let mut fraction_units: i64 = if fraction.is_empty() {
        0
    } else {
        fraction.parse().map_err(|_| invalid("out of range"))?
    };
    if fraction.len() == 1 {
        fraction_units *= 10;
    }

    whole
        .checked_mul(100)
        .and_then(|units| units.checked_add(fraction_units))
        .map(Money)
        .ok_or_else(|| invalid("out of range"))
}

fn parse_local_timestamp(raw: &str, format: &str) -> Result<DateTime<Utc>, NormalizationError> {
    let invalid = || NormalizationError::InvalidTimestamp {
        raw: raw.to_string(),
    };
    let naive = NaiveDateTime::parse_from_str(raw.trim(), format).map_err(|_| invalid())?;
    let offset = FixedOffset::east_opt(WIB_OFFSET_SECONDS).ok_or_else(invalid)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(invalid)
}

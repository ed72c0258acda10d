use std::io::Write;

use serde::Serialize;

use super::domain::LedgerEntry;

#[derive(Debug, Serialize)]
struct LedgerCsvRow<'a> {
    entry_id: &'a str,
    transaction_id: &'a str,
    customer_id: &'a str,
    obligation_id: &'a str,
    bucket: &'static str,
    amount_minor: i64,
    recorded_at: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditExportError {
    #[error("failed to write ledger CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to flush ledger CSV: {0}")]
    Io(#[from] std::io::Error),
}

/// Write the ledger as CSV, one row per entry, in insertion order.
pub fn write_ledger_csv<W: Write>(entries: &[LedgerEntry], writer: W) -> Result<(), AuditExportError> {
    let mut csv = csv::Writer::from_writer(writer);
    for entry in entries {
        csv.serialize(LedgerCsvRow {
            entry_id: entry.id.as_str(),
            transaction_id: entry.transaction_id.as_str(),
            customer_id: entry.customer_id.as_str(),
            obligation_id: entry
                .obligation_id
                .as_ref()
                .map(|id| id.as_str())
                .unwrap_or(""),
            bucket: entry.bucket.label(),
            amount_minor: entry.amount.minor_units(),
            recorded_at: entry.recorded_at.to_rfc3339(),
        })?;
    }
    csv.flush()?;
    Ok(())
}

pub fn ledger_csv(entries: &[LedgerEntry]) -> Result<String, AuditExportError> {
    let mut buffer = Vec::new();
    write_ledger_csv(entries, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

//! Payee-side invoice book.
//!
//! One secret preimage per incoming transaction. The commitment goes back
//! in SELECT_ACK; the preimage leaves the book only once delivery is
//! confirmed, and never after the invoice was cancelled.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tgp_core::{HashLock, Preimage, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Open,
    Revealed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub transaction_id: TransactionId,
    pub amount: u64,
    pub preimage: Preimage,
    pub hash_lock: HashLock,
    pub status: InvoiceStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InvoiceError {
    #[error("invoice already exists for {0}")]
    Duplicate(TransactionId),
    #[error("no invoice for {0}")]
    NotFound(TransactionId),
    #[error("invoice for {0} was cancelled")]
    Cancelled(TransactionId),
}

#[derive(Default)]
pub struct InvoiceBook {
    invoices: DashMap<TransactionId, Invoice>,
}

impl InvoiceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an invoice with a fresh preimage and return its commitment.
    pub fn create(
        &self,
        id: TransactionId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<HashLock, InvoiceError> {
        use dashmap::mapref::entry::Entry;
        match self.invoices.entry(id) {
            Entry::Occupied(_) => Err(InvoiceError::Duplicate(id)),
            Entry::Vacant(slot) => {
                let preimage = Preimage::random();
                let hash_lock = preimage.commitment();
                slot.insert(Invoice {
                    transaction_id: id,
                    amount,
                    preimage,
                    hash_lock,
                    status: InvoiceStatus::Open,
                    created_at: now,
                });
                tracing::debug!(transaction_id = %id, hash = %hash_lock, "invoice created");
                Ok(hash_lock)
            }
        }
    }

    /// Hand out the preimage. Repeated reveals return the same preimage.
    pub fn reveal(&self, id: TransactionId) -> Result<Preimage, InvoiceError> {
        let mut invoice = self.invoices.get_mut(&id).ok_or(InvoiceError::NotFound(id))?;
        if invoice.status == InvoiceStatus::Cancelled {
            return Err(InvoiceError::Cancelled(id));
        }
        invoice.status = InvoiceStatus::Revealed;
        Ok(invoice.preimage.clone())
    }

    /// Cancel an open invoice. Returns false if it was already revealed.
    pub fn cancel(&self, id: TransactionId) -> bool {
        match self.invoices.get_mut(&id) {
            Some(mut invoice) if invoice.status != InvoiceStatus::Revealed => {
                invoice.status = InvoiceStatus::Cancelled;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: TransactionId) -> Option<Invoice> {
        self.invoices.get(&id).map(|i| i.value().clone())
    }

    pub fn remove(&self, id: TransactionId) -> Option<Invoice> {
        self.invoices.remove(&id).map(|(_, i)| i)
    }

    pub fn restore(&self, invoice: Invoice) {
        self.invoices.insert(invoice.transaction_id, invoice);
    }

    pub fn len(&self) -> usize {
        self.invoices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invoices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reveal_matches_commitment() {
        let book = InvoiceBook::new();
        let id = TransactionId::new();
        let hash = book.create(id, 95, Utc::now()).unwrap();
        let preimage = book.reveal(id).unwrap();
        assert!(hash.verify(&preimage));
        assert_eq!(book.get(id).unwrap().status, InvoiceStatus::Revealed);
        assert_eq!(book.create(id, 95, Utc::now()), Err(InvoiceError::Duplicate(id)));
    }

    #[test]
    fn test_cancelled_invoice_never_reveals() {
        let book = InvoiceBook::new();
        let id = TransactionId::new();
        book.create(id, 10, Utc::now()).unwrap();
        assert!(book.cancel(id));
        assert_eq!(book.reveal(id), Err(InvoiceError::Cancelled(id)));
    }

    #[test]
    fn test_cannot_cancel_after_reveal() {
        let book = InvoiceBook::new();
        let id = TransactionId::new();
        book.create(id, 10, Utc::now()).unwrap();
        book.reveal(id).unwrap();
        assert!(!book.cancel(id));
        assert!(book.reveal(id).is_ok());
    }
}

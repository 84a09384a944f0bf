//! RocksDB storage backend for the gateway.
//!
//! Records are stored as JSON, one column family per kind. Everything a
//! restarted gateway needs to resume or safely abort in-flight work lives
//! here: the Adj-RIB-In, transactions and their HTLCs, and relay/payee
//! participant records with the payee's invoices.

use anyhow::Result;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tgp_core::{DomainId, TransactionId};
use tgp_routing::{LearnedRoute, LocalRoute};
use tgp_settlement::{Htlc, TransactionRecord};

use crate::invoice::Invoice;
use crate::participant::ParticipantRecord;

/// Column family names for different data types.
pub const CF_RIB_IN: &str = "rib_in";
pub const CF_LOCAL_RIB: &str = "local_rib";
pub const CF_TRANSACTIONS: &str = "transactions";
pub const CF_HTLCS: &str = "htlcs";
pub const CF_PARTICIPANTS: &str = "participants";

/// A participant record together with the payee's invoice, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredParticipant {
    pub record: ParticipantRecord,
    #[serde(default)]
    pub invoice: Option<Invoice>,
}

/// RocksDB-backed storage for the gateway.
pub struct Storage {
    db: DB,
}

fn rib_prefix(dest: &DomainId) -> Vec<u8> {
    let mut key = dest.as_str().as_bytes().to_vec();
    key.push(0);
    key
}

fn htlc_key(id: TransactionId, hop: u32) -> Vec<u8> {
    format!("{}:{:010}", id, hop).into_bytes()
}

impl Storage {
    /// Open or create a RocksDB database at the given path with column families.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_RIB_IN, Options::default()),
            ColumnFamilyDescriptor::new(CF_LOCAL_RIB, Options::default()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Options::default()),
            ColumnFamilyDescriptor::new(CF_HTLCS, Options::default()),
            ColumnFamilyDescriptor::new(CF_PARTICIPANTS, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;

        Ok(Self { db })
    }

    /// Put a value into a column family.
    pub fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| anyhow::anyhow!("column family '{}' not found", cf_name))?;
        self.db.put_cf(cf, key, value)?;
        Ok(())
    }

    /// Get a value from a column family.
    pub fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| anyhow::anyhow!("column family '{}' not found", cf_name))?;
        let value = self.db.get_cf(cf, key)?;
        Ok(value)
    }

    /// Delete a key from a column family.
    pub fn delete(&self, cf_name: &str, key: &[u8]) -> Result<()> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| anyhow::anyhow!("column family '{}' not found", cf_name))?;
        self.db.delete_cf(cf, key)?;
        Ok(())
    }

    fn put_json<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(cf_name, key, &bytes)
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        match self.get(cf_name, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every value under `prefix` (the whole column family for an empty one).
    fn scan_json<T: DeserializeOwned>(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let cf = self
            .db
            .cf_handle(cf_name)
            .ok_or_else(|| anyhow::anyhow!("column family '{}' not found", cf_name))?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// Replace everything stored for `dest`: its Adj-RIB-In entries and its
    /// Local-RIB entry.
    pub fn replace_routes(
        &self,
        dest: &DomainId,
        routes: &[LearnedRoute],
        best: Option<&LocalRoute>,
    ) -> Result<()> {
        let rib_in = self
            .db
            .cf_handle(CF_RIB_IN)
            .ok_or_else(|| anyhow::anyhow!("column family '{}' not found", CF_RIB_IN))?;
        let local = self
            .db
            .cf_handle(CF_LOCAL_RIB)
            .ok_or_else(|| anyhow::anyhow!("column family '{}' not found", CF_LOCAL_RIB))?;

        let prefix = rib_prefix(dest);
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(rib_in, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(rib_in, key);
        }
        for route in routes {
            let mut key = prefix.clone();
            key.extend_from_slice(route.peer.as_str().as_bytes());
            batch.put_cf(rib_in, key, serde_json::to_vec(route)?);
        }
        match best {
            Some(best) => batch.put_cf(local, dest.as_str().as_bytes(), serde_json::to_vec(best)?),
            None => batch.delete_cf(local, dest.as_str().as_bytes()),
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn load_adj_rib_in(&self) -> Result<Vec<LearnedRoute>> {
        self.scan_json(CF_RIB_IN, &[])
    }

    pub fn load_local_rib(&self) -> Result<Vec<LocalRoute>> {
        self.scan_json(CF_LOCAL_RIB, &[])
    }

    pub fn put_transaction(&self, record: &TransactionRecord) -> Result<()> {
        self.put_json(CF_TRANSACTIONS, record.id().to_string().as_bytes(), record)
    }

    pub fn get_transaction(&self, id: TransactionId) -> Result<Option<TransactionRecord>> {
        self.get_json(CF_TRANSACTIONS, id.to_string().as_bytes())
    }

    pub fn load_transactions(&self) -> Result<Vec<TransactionRecord>> {
        self.scan_json(CF_TRANSACTIONS, &[])
    }

    pub fn put_htlc(&self, htlc: &Htlc) -> Result<()> {
        self.put_json(CF_HTLCS, &htlc_key(htlc.transaction_id, htlc.hop), htlc)
    }

    pub fn load_htlcs(&self) -> Result<Vec<Htlc>> {
        self.scan_json(CF_HTLCS, &[])
    }

    pub fn put_participant(&self, stored: &StoredParticipant) -> Result<()> {
        self.put_json(
            CF_PARTICIPANTS,
            stored.record.transaction_id.to_string().as_bytes(),
            stored,
        )
    }

    pub fn delete_participant(&self, id: TransactionId) -> Result<()> {
        self.delete(CF_PARTICIPANTS, id.to_string().as_bytes())
    }

    pub fn load_participants(&self) -> Result<Vec<StoredParticipant>> {
        self.scan_json(CF_PARTICIPANTS, &[])
    }
}

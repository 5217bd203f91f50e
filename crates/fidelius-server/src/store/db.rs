use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::RngCore;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::debug;

use super::model::{PayloadLimits, Secret, SecretRecord};
use crate::clock::{Clock, SystemClock};
use crate::error::SecretError;

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");
/// `(expires_at, id)` so a sweep can range-scan everything already expired.
const SECRETS_BY_EXPIRY: TableDefinition<(i64, &str), ()> =
    TableDefinition::new("secrets_by_expiry");

/// Random bytes per secret id (128 bits).
const ID_BYTES: usize = 16;

/// Thread-safe handle to the redb store.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    limits: PayloadLimits,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, limits: PayloadLimits) -> Result<Self> {
        Self::open_with_clock(path, limits, Arc::new(SystemClock))
    }

    /// Open (or create) the database at `path`, reading time from `clock`.
    pub fn open_with_clock(
        path: &Path,
        limits: PayloadLimits,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(SECRETS_BY_EXPIRY)?;
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            limits,
            clock,
        })
    }

    pub fn limits(&self) -> PayloadLimits {
        self.limits
    }

    /// Store a new secret and return its freshly generated id.
    ///
    /// Validation happens before the database is touched, so a rejected
    /// payload leaves no trace.
    pub fn create(
        &self,
        ciphertext: &str,
        nonce: &str,
        ttl: Duration,
    ) -> Result<String, SecretError> {
        self.validate(ciphertext, nonce, ttl)?;
        Ok(self.insert(ciphertext, nonce, ttl)?)
    }

    /// Atomically read and delete a secret.
    ///
    /// Returns `None` if the id is unknown, already consumed, or expired. An
    /// expired row is deleted on the way out. redb admits one write
    /// transaction at a time, so of any number of concurrent callers for the
    /// same id at most one sees `Some`.
    pub fn consume(&self, id: &str) -> Result<Option<Secret>, SecretError> {
        Ok(self.take(id)?)
    }

    /// Delete every row whose expiry is strictly in the past.
    /// Returns the number of rows removed.
    pub fn sweep(&self) -> Result<usize, SecretError> {
        Ok(self.remove_expired()?)
    }

    /// Number of rows currently stored, including expired rows not yet swept.
    pub fn len(&self) -> Result<usize, SecretError> {
        Ok(self.count_rows()? as usize)
    }

    pub fn is_empty(&self) -> Result<bool, SecretError> {
        Ok(self.len()? == 0)
    }

    fn count_rows(&self) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        Ok(table.len()?)
    }

    fn validate(&self, ciphertext: &str, nonce: &str, ttl: Duration) -> Result<(), SecretError> {
        if ciphertext.trim().is_empty() || nonce.trim().is_empty() {
            return Err(SecretError::Validation("invalid_payload"));
        }
        if ciphertext.len() > self.limits.max_ciphertext_len {
            return Err(SecretError::Validation("ciphertext_too_large"));
        }
        if nonce.len() > self.limits.max_nonce_len {
            return Err(SecretError::Validation("nonce_too_large"));
        }
        let fits = i64::try_from(ttl.as_secs())
            .ok()
            .and_then(|secs| self.clock.now_secs().checked_add(secs))
            .is_some();
        if ttl.as_secs() == 0 || !fits {
            return Err(SecretError::Validation("invalid_ttl"));
        }
        Ok(())
    }

    fn insert(&self, ciphertext: &str, nonce: &str, ttl: Duration) -> Result<String> {
        let now = self.clock.now_secs();
        let ttl_secs = i64::try_from(ttl.as_secs()).context("ttl out of range")?;
        let record = SecretRecord {
            ciphertext: ciphertext.to_owned(),
            nonce: nonce.to_owned(),
            created_at: now,
            expires_at: now.saturating_add(ttl_secs),
        };
        let bytes = encode(&record)?;

        let write_txn = self.db.begin_write()?;
        let id = {
            let mut table = write_txn.open_table(SECRETS)?;
            let mut id = generate_id();
            while table.get(id.as_str())?.is_some() {
                id = generate_id();
            }
            table.insert(id.as_str(), bytes.as_slice())?;

            let mut index = write_txn.open_table(SECRETS_BY_EXPIRY)?;
            index.insert((record.expires_at, id.as_str()), ())?;
            id
        };
        write_txn.commit()?;

        debug!(expires_at = record.expires_at, "stored secret");
        Ok(id)
    }

    fn take(&self, id: &str) -> Result<Option<Secret>> {
        // Dropping the transaction without commit rolls every change back,
        // so any error below leaves the row in place.
        let write_txn = self.db.begin_write()?;
        // Read time only once we hold the writer lock.
        let now = self.clock.now_secs();
        let record = {
            let mut table = write_txn.open_table(SECRETS)?;
            let raw_bytes: Option<Vec<u8>> =
                table.remove(id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => None,
                Some(bytes) => {
                    let record = decode(&bytes)?;
                    let mut index = write_txn.open_table(SECRETS_BY_EXPIRY)?;
                    index.remove((record.expires_at, id))?;
                    Some(record)
                }
            }
        };

        let Some(record) = record else {
            // Nothing was written; let the transaction abort on drop.
            return Ok(None);
        };
        write_txn.commit()?;

        if record.is_expired(now) {
            debug!("lazy-evicted expired secret");
            Ok(None)
        } else {
            debug!("burned secret after read");
            Ok(Some(record.into()))
        }
    }

    fn remove_expired(&self) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let now = self.clock.now_secs();
        let removed = {
            let mut index = write_txn.open_table(SECRETS_BY_EXPIRY)?;
            let mut expired: Vec<(i64, String)> = Vec::new();
            for item in index.range(..(now, ""))? {
                let (k, _) = item?;
                let (expires_at, id) = k.value();
                expired.push((expires_at, id.to_owned()));
            }

            let mut table = write_txn.open_table(SECRETS)?;
            let mut removed = 0usize;
            for (expires_at, id) in &expired {
                index.remove((*expires_at, id.as_str()))?;
                if table.remove(id.as_str())?.is_some() {
                    removed += 1;
                }
            }
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }
}

/// 128 random bits from the thread-local CSPRNG, hex encoded.
fn generate_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(record, bincode::config::standard()).context("bincode encode")
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    if bytes.is_empty() {
        anyhow::bail!("empty record");
    }
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode")?;
    Ok(record)
}

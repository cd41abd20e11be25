//! Persistence layer.
//!
//! Loads and atomically saves the Portfolio ledger document. Saves go to a
//! sibling temp file that is fsynced and renamed over the target, so
//! readers only ever see a complete old or complete new document.

use std::fs::Permissions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::types::{Portfolio, TraderError};

/// Handle on the ledger file.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn path_str(&self) -> String {
        self.path.display().to_string()
    }

    fn corrupt(&self, message: impl Into<String>) -> TraderError {
        TraderError::CorruptLedger {
            path: self.path_str(),
            message: message.into(),
        }
    }

    fn persist_error(&self, message: impl Into<String>) -> TraderError {
        TraderError::Persist {
            path: self.path_str(),
            message: message.into(),
        }
    }

    /// Load the ledger. Returns `None` if the file doesn't exist (fresh start).
    pub fn load(&self) -> Result<Option<Portfolio>, TraderError> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No ledger found, starting fresh");
            return Ok(None);
        }

        let json = std::fs::read_to_string(&self.path)
            .map_err(|e| self.corrupt(format!("unreadable: {e}")))?;
        if json.trim().is_empty() {
            return Err(self.corrupt("file is empty"));
        }

        let portfolio: Portfolio = serde_json::from_str(&json)
            .map_err(|e| self.corrupt(format!("undecodable: {e}")))?;
        portfolio
            .check_invariants()
            .map_err(|e| self.corrupt(e.to_string()))?;

        info!(
            path = %self.path.display(),
            cash = %format!("${:.2}", portfolio.cash),
            positions = portfolio.holdings.len(),
            trades = portfolio.trade_history.len(),
            "Ledger loaded from disk"
        );
        Ok(Some(portfolio))
    }

    /// Write the ledger atomically. On failure the previous file is intact.
    pub fn save(&self, portfolio: &Portfolio) -> Result<(), TraderError> {
        let json = serde_json::to_string_pretty(portfolio)
            .map_err(|e| self.persist_error(format!("serialise: {e}")))?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        // Dropping the temp file on any error path removes it.
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| self.persist_error(format!("create temp file: {e}")))?;
        tmp.write_all(json.as_bytes())
            .and_then(|_| tmp.write_all(b"\n"))
            .map_err(|e| self.persist_error(format!("write: {e}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| self.persist_error(format!("fsync: {e}")))?;

        // Temp files are created owner-only; keep the ledger readable by the
        // same users as before.
        let permissions = match std::fs::metadata(&self.path) {
            Ok(meta) => Some(meta.permissions()),
            Err(_) => new_ledger_permissions(),
        };
        if let Some(permissions) = permissions {
            tmp.as_file()
                .set_permissions(permissions)
                .map_err(|e| self.persist_error(format!("set permissions: {e}")))?;
        }
        tmp.persist(&self.path)
            .map_err(|e| self.persist_error(format!("rename: {}", e.error)))?;

        debug!(path = %self.path.display(), bytes = json.len(), "Ledger saved");
        Ok(())
    }
}

#[cfg(unix)]
fn new_ledger_permissions() -> Option<Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn new_ledger_permissions() -> Option<Permissions> {
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Holding, TradeAction, TradeRecord};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn sample() -> Portfolio {
        let mut p = Portfolio::new(dec!(50000));
        p.cash = dec!(48500.25);
        p.holdings.insert(
            "ASML".into(),
            Holding {
                symbol: "ASML".into(),
                shares: 2,
                average_cost: dec!(749.875),
            },
        );
        p.trade_history.push(TradeRecord {
            timestamp: Utc::now(),
            symbol: "ASML".into(),
            action: TradeAction::Buy,
            quantity: 2,
            price: dec!(749.875),
            reason: "Lithography demand".into(),
        });
        let point = p.valuation_at(&HashMap::new(), Utc::now());
        p.valuation_history.push(point);
        p
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("portfolio.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("portfolio.json"));
        let p = sample();
        store.save(&p).unwrap();
        assert_eq!(store.load().unwrap(), Some(p));
    }

    #[test]
    fn test_save_replaces_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("portfolio.json"));
        store.save(&Portfolio::new(dec!(100))).unwrap();
        store.save(&sample()).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(store.load().unwrap().unwrap().cash, dec!(48500.25));
    }

    #[test]
    fn test_decimals_stored_as_strings() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("portfolio.json"));
        store.save(&sample()).unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"cash\": \"48500.25\""));
        assert!(raw.contains("\"average_cost\": \"749.875\""));
    }

    #[test]
    fn test_undecodable_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portfolio.json");
        std::fs::write(&path, "{\"cash\": ").unwrap();
        let err = LedgerStore::new(&path).load().unwrap_err();
        assert!(matches!(err, TraderError::CorruptLedger { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_empty_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portfolio.json");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            LedgerStore::new(&path).load(),
            Err(TraderError::CorruptLedger { .. })
        ));
    }

    #[test]
    fn test_invariant_violation_on_load_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("portfolio.json"));
        let mut p = sample();
        p.cash = dec!(-5);
        let json = serde_json::to_string(&p).unwrap();
        std::fs::write(store.path(), json).unwrap();
        assert!(matches!(store.load(), Err(TraderError::CorruptLedger { .. })));
    }

    #[test]
    fn test_save_into_missing_dir_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("nope").join("portfolio.json"));
        let err = store.save(&sample()).unwrap_err();
        assert!(matches!(err, TraderError::Persist { .. }));
        assert_eq!(err.exit_code(), 4);
    }

    #[cfg(unix)]
    fn mode(path: &Path) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[cfg(unix)]
    #[test]
    fn test_save_keeps_existing_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("portfolio.json"));
        std::fs::write(store.path(), "{}").unwrap();
        std::fs::set_permissions(store.path(), Permissions::from_mode(0o640)).unwrap();

        store.save(&sample()).unwrap();
        assert_eq!(mode(store.path()), 0o640);
    }

    #[cfg(unix)]
    #[test]
    fn test_new_ledger_is_world_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new(dir.path().join("portfolio.json"));
        store.save(&sample()).unwrap();
        assert_eq!(mode(store.path()), 0o644);
        store.save(&Portfolio::new(dec!(1))).unwrap();
        assert_eq!(mode(store.path()), 0o644);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_save_keeps_prior_document() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let ledger_dir = dir.path().join("ledger");
        std::fs::create_dir(&ledger_dir).unwrap();
        let store = LedgerStore::new(ledger_dir.join("portfolio.json"));
        store.save(&sample()).unwrap();
        let before = std::fs::read(store.path()).unwrap();

        std::fs::set_permissions(&ledger_dir, Permissions::from_mode(0o555)).unwrap();
        // Privileged users ignore directory mode bits.
        let writable = std::fs::File::create(ledger_dir.join(".writable")).is_ok();
        let result = (!writable).then(|| store.save(&Portfolio::new(dec!(1))));
        std::fs::set_permissions(&ledger_dir, Permissions::from_mode(0o755)).unwrap();
        let Some(result) = result else { return };

        let err = result.unwrap_err();
        assert!(matches!(err, TraderError::Persist { .. }));
        assert_eq!(err.exit_code(), 4);
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
        let entries: Vec<_> = std::fs::read_dir(&ledger_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}

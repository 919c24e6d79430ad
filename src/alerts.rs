use crate::database::{AlertUpdate, Store, StoreError};
use crate::diagnosis::Alert;
use chrono::NaiveDateTime;
use std::collections::{HashMap, HashSet};

/// upper bound on unresolved rows read back at startup
const RESTORE_LIMIT: usize = 10_000;

/// Outcome of one reconciliation cycle
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// newly persisted alerts, ids bound
    pub created: Vec<Alert>,
    /// ids of auto-resolved alerts
    pub resolved: Vec<i64>,
}

/// Keeps at most one unresolved alert per signature
pub struct AlertManager {
    pub name: String,
    active: HashMap<String, i64>,
    /// registry rebuilt from rows a previous run left unresolved
    restored: bool,
}

impl AlertManager {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            active: HashMap::new(),
            restored: false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, signature: &str) -> bool {
        self.active.contains_key(signature)
    }

    /// Registers alerts left unresolved in the store by a previous run. The newest row
    /// per signature is kept, older duplicates are resolved.
    pub fn restore(&mut self, store: &mut dyn Store, now: NaiveDateTime) -> Result<usize, StoreError> {
        //newest first
        for alert in store.list_alerts(RESTORE_LIMIT, true)? {
            let id = match alert.id {
                Some(id) => id,
                None => continue,
            };
            let signature = alert.signature();
            match self.active.get(&signature) {
                Some(newer) if *newer != id => {
                    info!(
                        "{}: resolving duplicate alert #{} (kept #{})",
                        self.name, id, newer
                    );
                    if let Err(e) = store.update_alert(id, AlertUpdate::Resolved(now)) {
                        error!("{}: cannot resolve alert #{}: {}", self.name, id, e);
                    }
                }
                _ => {
                    self.active.insert(signature, id);
                }
            }
        }
        self.restored = true;
        info!(
            "{}: {} unresolved alert(s) taken over from store",
            self.name,
            self.active.len()
        );
        Ok(self.active.len())
    }

    /// Persists candidates with unseen signatures and resolves registered
    /// signatures which did not show up this cycle.
    pub fn reconcile(
        &mut self,
        candidates: Vec<Alert>,
        store: &mut dyn Store,
        now: NaiveDateTime,
    ) -> Reconciliation {
        if !self.restored {
            if let Err(e) = self.restore(store, now) {
                warn!("{}: cannot read unresolved alerts yet: {}", self.name, e);
            }
        }

        let mut outcome = Reconciliation::default();
        let mut seen = HashSet::new();

        for mut alert in candidates {
            let signature = alert.signature();
            //first candidate wins within a cycle
            if !seen.insert(signature.clone()) || self.active.contains_key(&signature) {
                continue;
            }
            match store.insert_alert(&alert) {
                Ok(id) => {
                    alert.id = Some(id);
                    info!("{}: new alert #{}: {}", self.name, id, alert);
                    self.active.insert(signature, id);
                    outcome.created.push(alert);
                }
                Err(e) => {
                    //not registered, so the next occurrence retries the insert
                    error!("{}: cannot persist alert {:?}: {}", self.name, signature, e);
                }
            }
        }

        let gone: Vec<(String, i64)> = self
            .active
            .iter()
            .filter(|(signature, _)| !seen.contains(*signature))
            .map(|(signature, id)| (signature.clone(), *id))
            .collect();
        for (signature, id) in gone {
            match store.update_alert(id, AlertUpdate::Resolved(now)) {
                Ok(()) => {
                    info!("{}: alert #{} auto-resolved ({})", self.name, id, signature);
                    self.active.remove(&signature);
                    outcome.resolved.push(id);
                }
                Err(StoreError::UnknownAlert(_)) => {
                    warn!("{}: alert #{} vanished from store, forgetting it", self.name, id);
                    self.active.remove(&signature);
                }
                Err(e) => {
                    error!("{}: cannot resolve alert #{}: {}", self.name, id, e);
                }
            }
        }

        outcome
    }

    pub fn acknowledge(
        &mut self,
        id: i64,
        store: &mut dyn Store,
        now: NaiveDateTime,
    ) -> Result<(), StoreError> {
        store.update_alert(id, AlertUpdate::Acknowledged(now))?;
        info!("{}: alert #{} acknowledged", self.name, id);
        Ok(())
    }

    /// Soft delete; a condition still present afterwards raises a fresh alert
    pub fn delete(
        &mut self,
        id: i64,
        store: &mut dyn Store,
        now: NaiveDateTime,
    ) -> Result<(), StoreError> {
        store.update_alert(id, AlertUpdate::Deleted(now))?;
        self.active.retain(|_, active_id| *active_id != id);
        info!("{}: alert #{} deleted", self.name, id);
        Ok(())
    }
}

//! Converge the listener registry on the desired configuration.
//!
//! A pass validates every enabled record, coalesces records that share a
//! bind address into one spec (union of their vhost maps, lowest id owns the
//! socket), then stops, updates and starts listeners to match. Passes are
//! serialized; [`Reconciler::is_reloading`] reports one in progress.

use crate::engine::EngineContext;
use crate::error::ConfigError;
use crate::listener::{BindKey, ListenerRecord, ListenerSpec, Protocol, VHostMapping};
use crate::registry::ListenerRegistry;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Listeners that bound a new socket
    pub started: Vec<i64>,
    /// Listeners whose socket was released
    pub stopped: Vec<i64>,
    /// Listeners whose vhosts or targets changed in place
    pub updated: Vec<i64>,
    /// `(merged id, owning id)` for records folded into another listener
    pub coalesced: Vec<(i64, i64)>,
    /// Records left out, with the reason
    pub skipped: Vec<(i64, String)>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.updated.is_empty()
    }
}

/// One socket's worth of desired configuration
struct Desired {
    spec: ListenerSpec,
    members: Vec<i64>,
}

impl Desired {
    /// Fold another listener on the same bind into this one. The owner's
    /// static target stays the fallback; vhosts already present win.
    fn absorb(&mut self, other: ListenerSpec) {
        for (hostname, entry) in other.vhosts {
            self.spec.vhosts.entry(hostname).or_insert(entry);
        }
        if self.spec.error_page_html.is_none() {
            self.spec.error_page_html = other.error_page_html;
        }
        self.members.push(other.id);
    }

    fn accepts(&self, other: &ListenerSpec) -> bool {
        self.spec.listen_protocol == other.listen_protocol
            && self.spec.tls_passthrough == other.tls_passthrough
    }
}

/// Releases the reloading flag when a pass ends, even by panic
struct ReloadingGuard<'a>(&'a AtomicBool);

impl Drop for ReloadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Reconciler {
    registry: Arc<ListenerRegistry>,
    ctx: Arc<EngineContext>,
    lock: Mutex<()>,
    reloading: AtomicBool,
}

impl Reconciler {
    pub fn new(registry: Arc<ListenerRegistry>, ctx: Arc<EngineContext>) -> Self {
        Self {
            registry,
            ctx,
            lock: Mutex::new(()),
            reloading: AtomicBool::new(false),
        }
    }

    pub fn is_reloading(&self) -> bool {
        self.reloading.load(Ordering::SeqCst)
    }

    pub async fn reconcile(&self, listeners: &[ListenerRecord], mappings: &[VHostMapping]) -> ReconcileReport {
        let _lock = self.lock.lock().await;
        self.reloading.store(true, Ordering::SeqCst);
        let _guard = ReloadingGuard(&self.reloading);

        let mut report = ReconcileReport::default();
        let desired = plan(listeners, mappings, &mut report);

        let targets: HashSet<String> = desired
            .values()
            .filter(|want| want.spec.listen_protocol != Protocol::Udp)
            .flat_map(|want| want.spec.targets())
            .map(|target| target.addr())
            .collect();
        for target in &targets {
            self.ctx.health.register(target);
        }
        self.ctx.health.retain_known(&targets);

        // strict vhosts: only mapped hostnames may trigger issuance
        if self.ctx.config.strict_vhosts {
            let hostnames = desired
                .values()
                .flat_map(|want| want.spec.vhosts.keys().cloned())
                .collect();
            self.ctx.certs.restrict_issuance(Some(hostnames));
        } else {
            self.ctx.certs.restrict_issuance(None);
        }

        // stop what is no longer wanted, and listeners whose kind changed
        for key in self.registry.bind_keys() {
            let restart = match desired.get(&key) {
                None => true,
                Some(want) => self.registry.kind_of(&key) != Some(want.spec.kind()),
            };
            if restart {
                if let Some(members) = self.registry.stop(&key).await {
                    report.stopped.extend(members);
                }
            }
        }

        for (key, want) in desired {
            let id = want.spec.id;

            match self.registry.current(&key) {
                Some((current, members)) => {
                    if *current == want.spec && members == want.members {
                        debug!(id, bind = %key, "Listener unchanged");
                        continue;
                    }
                    if self.registry.update(want.spec, want.members) {
                        info!(id, bind = %key, "Listener updated in place");
                        report.updated.push(id);
                    }
                }
                None => match self.registry.start(want.spec, want.members, &self.ctx).await {
                    Ok(_) => report.started.push(id),
                    Err(e) => {
                        warn!(id, bind = %key, error = %e, "Failed to start listener");
                        report.skipped.push((id, format!("{:#}", e)));
                    }
                },
            }
        }

        // a restarted listener shows up in both lists; report it once
        report.stopped.retain(|id| !report.started.contains(id));
        report.stopped.sort_unstable();
        report.skipped.sort();

        info!(
            started = report.started.len(),
            stopped = report.stopped.len(),
            updated = report.updated.len(),
            skipped = report.skipped.len(),
            "Listeners reconciled"
        );
        report
    }
}

/// Validate records and group them by bind address. Lower ids win
/// conflicts.
fn plan(
    listeners: &[ListenerRecord],
    mappings: &[VHostMapping],
    report: &mut ReconcileReport,
) -> BTreeMap<BindKey, Desired> {
    let mut records: Vec<&ListenerRecord> = listeners.iter().filter(|r| r.enabled).collect();
    records.sort_by_key(|r| r.id);

    let mut desired: BTreeMap<BindKey, Desired> = BTreeMap::new();
    for record in records {
        let spec = match ListenerSpec::from_record(record, mappings) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(id = record.id, error = %e, "Skipping invalid listener");
                report.skipped.push((record.id, e.to_string()));
                continue;
            }
        };

        let key = spec.bind_key();
        match desired.get_mut(&key) {
            None => {
                let id = spec.id;
                desired.insert(key, Desired { spec, members: vec![id] });
            }
            Some(owner) if owner.accepts(&spec) => {
                debug!(id = spec.id, owner = owner.spec.id, bind = %key, "Coalescing listener");
                report.coalesced.push((spec.id, owner.spec.id));
                owner.absorb(spec);
            }
            Some(owner) => {
                let e = ConfigError::BindConflict {
                    id: spec.id,
                    bind: key.to_string(),
                    owner: owner.spec.id,
                };
                warn!(error = %e, "Skipping listener");
                report.skipped.push((spec.id, e.to_string()));
            }
        }
    }
    desired
}

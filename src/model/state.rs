//! Model State Manager: publishes snapshots and hands out at most one
//! mutable working copy at a time.
//!
//! Readers load the current `Arc<ModelSnapshot>` from an [`ArcSwap`] and never
//! wait on a fine-tune. The single writer path (`commit`, `rollback`) is
//! serialised by a lease slot claimed with a compare-and-swap; a second
//! claimant fails immediately with [`Error::Busy`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info, warn};

use super::network::{is_running_statistic, Classifier};
use super::snapshot::ModelSnapshot;
use super::Mode;
use crate::classes::ClassSet;
use crate::error::{Error, Result};

const IDLE: u64 = 0;

/// Claim on the manager's exclusivity slot. Dropping an unreleased lease
/// frees the slot, so a panicking or cancelled fine-tune cannot wedge the
/// manager.
#[derive(Debug)]
struct Lease {
    id: u64,
    slot: Arc<AtomicU64>,
    released: bool,
}

impl Lease {
    fn acquire(slot: &Arc<AtomicU64>, id: u64) -> Result<Self> {
        match slot.compare_exchange(IDLE, id, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(Self {
                id,
                slot: Arc::clone(slot),
                released: false,
            }),
            Err(active_lease) => Err(Error::Busy { active_lease }),
        }
    }

    fn is_active_in(&self, slot: &Arc<AtomicU64>) -> bool {
        !self.released && Arc::ptr_eq(&self.slot, slot) && slot.load(Ordering::Acquire) == self.id
    }

    fn release(mut self) {
        self.free();
    }

    fn free(&mut self) {
        if !self.released {
            // Only clear the slot if it still holds this lease
            let _ = self
                .slot
                .compare_exchange(self.id, IDLE, Ordering::AcqRel, Ordering::Acquire);
            self.released = true;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            warn!("Lease {} dropped without commit or abort; releasing", self.id);
            self.free();
        }
    }
}

/// Private, trainable clone of a snapshot's parameters.
///
/// Owned by exactly one fine-tune operation and never visible to readers.
/// Consumed by [`ModelStateManager::commit`] or [`ModelStateManager::abort`].
pub struct WorkingCopy {
    lease: Lease,
    base_version: u64,
    mode: Mode,
    varmap: VarMap,
    network: Classifier,
    classes: Arc<ClassSet>,
    device: Device,
}

impl WorkingCopy {
    fn checkout(lease: Lease, base: &ModelSnapshot) -> Result<Self> {
        let varmap = VarMap::new();
        {
            let mut vars = varmap
                .data()
                .lock()
                .map_err(|_| Error::internal("variable map lock poisoned"))?;
            for (name, tensor) in base.parameters() {
                vars.insert(name.clone(), Var::from_tensor(&tensor.copy()?)?);
            }
        }
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, base.device());
        let network = Classifier::new(base.config(), vb)?;

        Ok(Self {
            lease,
            base_version: base.version(),
            mode: Mode::Training {
                update_norm_statistics: true,
            },
            varmap,
            network,
            classes: base.shared_classes(),
            device: base.device().clone(),
        })
    }

    /// Identifier of the exclusivity claim this copy holds
    pub fn lease(&self) -> u64 {
        self.lease.id
    }

    /// Version of the snapshot this copy was cloned from
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn classes(&self) -> &ClassSet {
        &self.classes
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Logits under the working copy's current mode
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.network.forward_t(xs, self.mode)?)
    }

    /// Variables an optimiser may update; normalisation running statistics
    /// are excluded
    pub fn trainable_vars(&self) -> Result<Vec<Var>> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::internal("variable map lock poisoned"))?;
        let mut named: Vec<(&String, &Var)> = vars
            .iter()
            .filter(|(name, _)| !is_running_statistic(name))
            .collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        Ok(named.into_iter().map(|(_, var)| var.clone()).collect())
    }

    /// Detached copies of every parameter, running statistics included
    fn freeze(&self) -> Result<HashMap<String, Tensor>> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::internal("variable map lock poisoned"))?;
        vars.iter()
            .map(|(name, var)| -> Result<(String, Tensor)> {
                Ok((name.clone(), var.as_tensor().copy()?.detach()))
            })
            .collect()
    }
}

impl std::fmt::Debug for WorkingCopy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingCopy")
            .field("lease", &self.lease.id)
            .field("base_version", &self.base_version)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Owner of the current published snapshot
pub struct ModelStateManager {
    current: ArcSwap<ModelSnapshot>,
    /// One-level rollback target
    previous: ArcSwapOption<ModelSnapshot>,
    slot: Arc<AtomicU64>,
    next_lease: AtomicU64,
}

impl ModelStateManager {
    /// Start serving `initial` as the current snapshot
    pub fn new(initial: ModelSnapshot) -> Self {
        info!("Publishing initial snapshot v{}", initial.version());
        Self {
            current: ArcSwap::from_pointee(initial),
            previous: ArcSwapOption::empty(),
            slot: Arc::new(AtomicU64::new(IDLE)),
            next_lease: AtomicU64::new(IDLE + 1),
        }
    }

    /// The presently published snapshot. Never blocks.
    pub fn current_snapshot(&self) -> Arc<ModelSnapshot> {
        self.current.load_full()
    }

    pub fn current_version(&self) -> u64 {
        self.current.load().version()
    }

    /// Version of the rollback target, if any
    pub fn previous_version(&self) -> Option<u64> {
        self.previous.load().as_ref().map(|s| s.version())
    }

    pub fn is_fine_tune_active(&self) -> bool {
        self.slot.load(Ordering::Acquire) != IDLE
    }

    fn claim(&self) -> Result<Lease> {
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        Lease::acquire(&self.slot, id)
    }

    /// Check out a private trainable copy of the current snapshot.
    ///
    /// Fails fast with `Busy` while another working copy is outstanding.
    pub fn begin_fine_tune(&self) -> Result<WorkingCopy> {
        let lease = self.claim()?;
        let base = self.current.load_full();
        let working = WorkingCopy::checkout(lease, &base)?;
        debug!(
            "Checked out working copy (lease {}) from v{}",
            working.lease(),
            working.base_version()
        );
        Ok(working)
    }

    /// Publish the working copy as the next snapshot version.
    ///
    /// Snapshots obtained before the swap keep their old parameters. A copy
    /// whose lease is not this manager's active one is rejected with
    /// `StaleWorkingCopy`.
    pub fn commit(&self, working: WorkingCopy) -> Result<Arc<ModelSnapshot>> {
        if !working.lease.is_active_in(&self.slot) {
            return Err(Error::StaleWorkingCopy {
                lease: working.lease(),
            });
        }

        let parameters = working.freeze()?;
        let current = self.current.load_full();
        let snapshot = Arc::new(ModelSnapshot::new(
            current.version() + 1,
            parameters,
            Arc::clone(&working.classes),
            current.config().dropout,
            &working.device,
        )?);

        self.previous.store(Some(Arc::clone(&current)));
        self.current.store(Arc::clone(&snapshot));

        let WorkingCopy { lease, .. } = working;
        let lease_id = lease.id;
        lease.release();

        info!(
            "Committed snapshot v{} (lease {}, replaces v{})",
            snapshot.version(),
            lease_id,
            current.version()
        );
        Ok(snapshot)
    }

    /// Discard a working copy without publishing it
    pub fn abort(&self, working: WorkingCopy) {
        let WorkingCopy {
            lease,
            base_version,
            ..
        } = working;
        info!(
            "Aborted working copy (lease {}) based on v{}",
            lease.id, base_version
        );
        lease.release();
    }

    /// Republish the previous snapshot's parameters as a new version.
    ///
    /// Only one level of history is kept; the replaced snapshot becomes the
    /// new rollback target.
    pub fn rollback(&self) -> Result<Arc<ModelSnapshot>> {
        let lease = self.claim()?;
        let Some(previous) = self.previous.load_full() else {
            lease.release();
            return Err(Error::NoPreviousSnapshot);
        };
        let current = self.current.load_full();
        let restored = match previous.republish(current.version() + 1) {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                lease.release();
                return Err(e);
            }
        };

        self.previous.store(Some(Arc::clone(&current)));
        self.current.store(Arc::clone(&restored));
        lease.release();

        info!(
            "Rolled back to parameters of v{} as v{}",
            previous.version(),
            restored.version()
        );
        Ok(restored)
    }
}

impl std::fmt::Debug for ModelStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelStateManager")
            .field("current_version", &self.current_version())
            .field("previous_version", &self.previous_version())
            .field("fine_tune_active", &self.is_fine_tune_active())
            .finish()
    }
}

// ============================================================================
// File: src/backends/cache/mod.rs
// ----------------------------------------------------------------------------
// Cache backend: bounded pool of pre-fetched base VMs over any inner
// backend, refilled by a background task. Hides the inner backend's
// fetch latency behind a queue of already-paused VMs.
// ============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

use crate::config::VMConfig;
use crate::error::{FactoryError, FactoryResult};
use crate::vm::Vm;

use super::trait_def::{BaseVmBackend, PoolVmStatus};

/// Bounded-pool decorator over another backend
///
/// Invariants: pooled entries plus in-flight refill fetches never exceed
/// the capacity, and an entry handed to a caller is never re-enqueued.
/// The pop in [`BaseVmBackend::get_base_vm`] is cancel-safe: a caller that
/// gives up while waiting leaves the queue untouched.
#[derive(Debug)]
pub struct CacheBackend {
    inner: Arc<dyn BaseVmBackend>,
    capacity: usize,

    queue: Arc<Mutex<VecDeque<Vm>>>,
    /// One permit per queued entry; closed on shutdown to wake waiters
    ready: Arc<Semaphore>,
    /// Free pool slots; the refill task takes one before each fetch
    slots: Arc<Semaphore>,

    /// Occupancy record per pool slot: the queued VM, or the last VM handed
    /// out of that slot until its replenishment arrives
    statuses: Arc<Mutex<HashMap<String, PoolVmStatus>>>,

    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    refill: Mutex<Option<JoinHandle<()>>>,
}

impl CacheBackend {
    /// Wrap `inner` with a pool of `capacity` pre-fetched VMs
    ///
    /// Spawns the background refill task immediately; the pool starts
    /// filling before the first caller arrives.
    pub fn new(inner: Arc<dyn BaseVmBackend>, capacity: usize) -> Arc<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let backend = Arc::new(Self {
            inner,
            capacity,
            queue: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            ready: Arc::new(Semaphore::new(0)),
            slots: Arc::new(Semaphore::new(capacity)),
            statuses: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
            shutdown,
            refill: Mutex::new(None),
        });

        let task = tokio::spawn(Self::refill_loop(backend.clone(), shutdown_rx));
        *backend.lock_refill() = Some(task);

        backend
    }

    /// Number of entries currently queued
    pub fn pooled(&self) -> usize {
        self.lock_queue().len()
    }

    /// Pool capacity the backend was built with
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn refill_loop(backend: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let slot = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                permit = backend.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let config = backend.inner.config();
            let vm = match backend.inner.get_base_vm(&config).await {
                Ok(vm) => vm,
                Err(e) => {
                    log::error!(
                        "pool refill from {} backend failed, stopping refill: {e}",
                        backend.inner.backend_type()
                    );
                    break;
                }
            };

            // Never enqueue past a shutdown; nothing would drain it.
            if *shutdown_rx.borrow() {
                if let Err(e) = vm.stop().await {
                    log::warn!("failed to stop VM {} fetched during shutdown: {e}", vm.id());
                }
                break;
            }

            {
                let mut statuses = backend.lock_statuses();
                // This entry replenishes a handed-out slot; evict that
                // slot's stale record so the map never outgrows the pool.
                if statuses.len() >= backend.capacity {
                    let stale = statuses
                        .iter()
                        .find(|(_, s)| s.occupied)
                        .map(|(id, _)| id.clone());
                    if let Some(stale) = stale {
                        statuses.remove(&stale);
                    }
                }
                statuses.insert(
                    vm.id().to_string(),
                    PoolVmStatus {
                        occupied: false,
                        vm: vm.status(),
                    },
                );
            }
            backend.lock_queue().push_back(vm);
            // The slot stays taken until the entry is popped.
            slot.forget();
            backend.ready.add_permits(1);
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Vm>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_statuses(&self) -> std::sync::MutexGuard<'_, HashMap<String, PoolVmStatus>> {
        self.statuses.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_refill(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.refill.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BaseVmBackend for CacheBackend {
    fn config(&self) -> VMConfig {
        self.inner.config()
    }

    async fn get_base_vm(&self, _config: &VMConfig) -> FactoryResult<Vm> {
        // Cancel-safe: acquire takes nothing from the queue until it
        // resolves, and no await sits between acquire and pop.
        let permit = self
            .ready
            .acquire()
            .await
            .map_err(|_| FactoryError::PoolClosed)?;
        permit.forget();

        let vm = self.lock_queue().pop_front().ok_or(FactoryError::PoolClosed)?;
        if let Some(entry) = self.lock_statuses().get_mut(vm.id()) {
            entry.occupied = true;
        }
        // Free the slot so the refill task replenishes what was consumed.
        self.slots.add_permits(1);

        Ok(vm)
    }

    async fn close(&self) -> FactoryResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown.send(true);
        self.ready.close();
        self.slots.close();

        let task = self.lock_refill().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("pool refill task aborted: {e}");
            }
        }

        // Stop every queued-but-unclaimed VM.
        loop {
            let vm = self.lock_queue().pop_front();
            let Some(vm) = vm else { break };
            if let Err(e) = vm.stop().await {
                log::warn!("failed to stop pooled VM {}: {e}", vm.id());
            }
        }
        self.lock_statuses().clear();

        self.inner.close().await
    }

    fn vm_status(&self) -> FactoryResult<Vec<PoolVmStatus>> {
        let statuses = self.lock_statuses();
        Ok(statuses.values().cloned().collect())
    }

    fn backend_type(&self) -> &'static str {
        "cache"
    }
}

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use cloudmirror_core::CloudPath;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock request for {0} was dropped before it was granted")]
    Abandoned(CloudPath),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Read,
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => f.write_str("read"),
            LockMode::Write => f.write_str("write"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStep {
    pub path: CloudPath,
    pub mode: LockMode,
}

impl LockStep {
    /// Read on every ancestor from the root down, then `mode` on `path`.
    pub fn chain(path: &CloudPath, mode: LockMode) -> Vec<LockStep> {
        let mut steps: Vec<LockStep> = path
            .ancestors()
            .into_iter()
            .map(|ancestor| LockStep {
                path: ancestor,
                mode: LockMode::Read,
            })
            .collect();
        steps.push(LockStep {
            path: path.clone(),
            mode,
        });
        steps
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockNodeInfo {
    pub path: CloudPath,
    pub parent: Option<CloudPath>,
    pub mode: Option<LockMode>,
    pub holders: usize,
    pub queued: usize,
}

struct Waiter {
    id: u64,
    mode: LockMode,
    grant: oneshot::Sender<()>,
}

struct LockNode {
    parent: Option<CloudPath>,
    mode: Option<LockMode>,
    holders: usize,
    queue: VecDeque<Waiter>,
}

impl LockNode {
    fn new(path: &CloudPath) -> Self {
        Self {
            parent: path.parent(),
            mode: None,
            holders: 0,
            queue: VecDeque::new(),
        }
    }

    fn is_compatible(&self, mode: LockMode) -> bool {
        match self.mode {
            None => true,
            Some(LockMode::Read) => mode == LockMode::Read,
            Some(LockMode::Write) => false,
        }
    }

    fn is_idle(&self) -> bool {
        self.holders == 0 && self.queue.is_empty()
    }

    fn hold(&mut self, mode: LockMode) {
        self.holders += 1;
        self.mode = Some(mode);
    }

    fn unhold(&mut self) {
        self.holders = self.holders.saturating_sub(1);
        if self.holders == 0 {
            self.mode = None;
        }
    }

    /// Grants queued requests from the front while they are compatible.
    fn admit(&mut self, path: &CloudPath) {
        while let Some(front) = self.queue.front() {
            if !self.is_compatible(front.mode) {
                break;
            }
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            if waiter.grant.send(()).is_ok() {
                self.hold(waiter.mode);
                debug!(%path, mode = %waiter.mode, waiter = waiter.id, "lock granted from queue");
            }
        }
    }
}

#[derive(Default)]
struct Index {
    nodes: HashMap<CloudPath, LockNode>,
    next_waiter: u64,
}

/// Multi-granularity path lock.
///
/// Nodes live in one index keyed by path and guarded by a single mutex, so
/// node creation, admission and eviction are atomic per path. A node is
/// evicted as soon as it has neither holders nor queued waiters.
#[derive(Clone, Default)]
pub struct PathLockGraph {
    index: Arc<Mutex<Index>>,
}

impl PathLockGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests `mode` on the single node for `path`. The request is queued
    /// before this returns, so FIFO order follows call order.
    pub fn lock(&self, path: &CloudPath, mode: LockMode) -> LockTicket {
        let mut index = self.index();
        index.next_waiter += 1;
        let id = index.next_waiter;
        let node = index
            .nodes
            .entry(path.clone())
            .or_insert_with(|| LockNode::new(path));

        let receiver = if node.queue.is_empty() && node.is_compatible(mode) {
            node.hold(mode);
            debug!(%path, %mode, waiter = id, "lock granted");
            None
        } else {
            let (grant, receiver) = oneshot::channel();
            node.queue.push_back(Waiter { id, mode, grant });
            debug!(%path, %mode, waiter = id, queued = node.queue.len(), "lock queued");
            Some(receiver)
        };

        LockTicket {
            graph: self.clone(),
            path: path.clone(),
            mode,
            id,
            receiver,
            settled: false,
        }
    }

    pub fn acquire(&self, path: &CloudPath, mode: LockMode) -> PendingLocks {
        self.acquire_plan(LockStep::chain(path, mode))
    }

    /// Takes `steps` strictly in the given order, each only after the previous
    /// one was granted. The first step is queued immediately.
    pub fn acquire_plan(&self, steps: Vec<LockStep>) -> PendingLocks {
        let graph = self.clone();
        let mut steps = steps.into_iter();
        let first = steps.next().map(|step| graph.lock(&step.path, step.mode));
        let fut = async move {
            let mut held = HeldLocks::default();
            if let Some(ticket) = first {
                held.guards.push(ticket.granted().await?);
            }
            for step in steps {
                let guard = graph.lock(&step.path, step.mode).granted().await?;
                held.guards.push(guard);
            }
            Ok(held)
        };
        PendingLocks {
            inner: Box::pin(fut),
        }
    }

    pub fn contains(&self, path: &CloudPath) -> bool {
        self.index().nodes.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.index().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index().nodes.is_empty()
    }

    pub fn holders(&self, path: &CloudPath) -> usize {
        self.index()
            .nodes
            .get(path)
            .map_or(0, |node| node.holders)
    }

    pub fn queued(&self, path: &CloudPath) -> usize {
        self.index()
            .nodes
            .get(path)
            .map_or(0, |node| node.queue.len())
    }

    pub fn node(&self, path: &CloudPath) -> Option<LockNodeInfo> {
        let index = self.index();
        index.nodes.get(path).map(|node| LockNodeInfo {
            path: path.clone(),
            parent: node.parent.clone(),
            mode: node.mode,
            holders: node.holders,
            queued: node.queue.len(),
        })
    }

    fn release(&self, path: &CloudPath, mode: LockMode) {
        let mut index = self.index();
        let Some(node) = index.nodes.get_mut(path) else {
            return;
        };
        node.unhold();
        debug!(%path, %mode, holders = node.holders, "lock released");
        node.admit(path);
        if node.is_idle() {
            index.nodes.remove(path);
            debug!(%path, "lock node evicted");
        }
    }

    fn abandon(&self, path: &CloudPath, mode: LockMode, id: u64) {
        let mut index = self.index();
        let Some(node) = index.nodes.get_mut(path) else {
            return;
        };
        match node.queue.iter().position(|waiter| waiter.id == id) {
            Some(pos) => {
                node.queue.remove(pos);
                debug!(%path, %mode, waiter = id, "queued lock request abandoned");
            }
            // Already granted: the dropped ticket owns a hold.
            None => node.unhold(),
        }
        node.admit(path);
        if node.is_idle() {
            index.nodes.remove(path);
            debug!(%path, "lock node evicted");
        }
    }
}

/// A request on one node; resolves into a [`NodeGuard`] once granted.
/// Dropping an ungranted ticket withdraws the request.
pub struct LockTicket {
    graph: PathLockGraph,
    path: CloudPath,
    mode: LockMode,
    id: u64,
    receiver: Option<oneshot::Receiver<()>>,
    settled: bool,
}

impl LockTicket {
    pub fn is_granted(&self) -> bool {
        self.receiver.is_none()
    }

    /// The receiver stays inside the ticket while it is awaited, so a ticket
    /// dropped mid-wait withdraws under the index lock before the receiver
    /// goes away. A grant sent in between then lands as a hold we own.
    pub async fn granted(mut self) -> Result<NodeGuard, LockError> {
        let outcome = match self.receiver.as_mut() {
            Some(receiver) => receiver.await,
            None => Ok(()),
        };
        self.receiver = None;
        self.settled = true;
        outcome.map_err(|_| LockError::Abandoned(self.path.clone()))?;
        Ok(NodeGuard {
            graph: self.graph.clone(),
            path: self.path.clone(),
            mode: self.mode,
        })
    }
}

impl Drop for LockTicket {
    fn drop(&mut self) {
        if !self.settled {
            self.graph.abandon(&self.path, self.mode, self.id);
        }
    }
}

/// One held lock on one node; released on drop.
pub struct NodeGuard {
    graph: PathLockGraph,
    path: CloudPath,
    mode: LockMode,
}

impl NodeGuard {
    pub fn path(&self) -> &CloudPath {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        self.graph.release(&self.path, self.mode);
    }
}

/// Every lock of a plan, released deepest-first on drop.
#[derive(Default)]
pub struct HeldLocks {
    guards: Vec<NodeGuard>,
}

impl HeldLocks {
    pub fn steps(&self) -> Vec<LockStep> {
        self.guards
            .iter()
            .map(|guard| LockStep {
                path: guard.path.clone(),
                mode: guard.mode,
            })
            .collect()
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

/// Not-yet-granted lock plan. Dropping it releases whatever part of the plan
/// was already granted and withdraws the pending request.
pub struct PendingLocks {
    inner: BoxFuture<'static, Result<HeldLocks, LockError>>,
}

impl Future for PendingLocks {
    type Output = Result<HeldLocks, LockError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

#[cfg(test)]
#[path = "graph_tests.rs"]
mod tests;

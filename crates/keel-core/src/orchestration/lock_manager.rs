use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::models::{CoreError, CoreErrorKind, ManagerId, TaskId};
use crate::orchestration::OrchestrationResult;

struct Waiter {
    task_id: TaskId,
    admit: oneshot::Sender<()>,
    /// Set once the ticket's owner is waiting for admission.
    listening: bool,
}

#[derive(Default)]
struct Lane {
    holder: Option<TaskId>,
    waiters: VecDeque<Waiter>,
}

impl Lane {
    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.waiters.is_empty()
    }

    fn contains(&self, task_id: TaskId) -> bool {
        self.holder == Some(task_id) || self.waiters.iter().any(|w| w.task_id == task_id)
    }

    /// Admits the head of the queue when the lane is free and the head is
    /// listening. A head that is not listening yet keeps everyone behind it
    /// waiting.
    fn admit_head(&mut self, manager: &ManagerId) {
        while self.holder.is_none() {
            match self.waiters.front() {
                Some(head) if head.listening => {}
                _ => return,
            }
            let Some(waiter) = self.waiters.pop_front() else {
                return;
            };
            if waiter.admit.send(()).is_ok() {
                self.holder = Some(waiter.task_id);
                tracing::trace!(manager = %manager, task_id = %waiter.task_id, "manager lock admitted");
            }
        }
    }
}

/// One lane per manager: at most one holder, everyone else waits in arrival
/// order. `enqueue` only records the arrival position, synchronously, so
/// arrival order is the order of `enqueue` calls. The lock itself is handed
/// out inside [`LockTicket::wait`].
#[derive(Clone, Default)]
pub struct ResourceLockManager {
    lanes: Arc<Mutex<HashMap<ManagerId, Lane>>>,
}

impl ResourceLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, manager: &ManagerId, task_id: TaskId) -> OrchestrationResult<LockTicket> {
        let mut lanes = self.lanes();
        let lane = lanes.entry(manager.clone()).or_default();

        if lane.contains(task_id) {
            return Err(lock_error(
                manager,
                task_id,
                CoreErrorKind::Internal,
                "task is already holding or waiting for this manager lock",
            ));
        }

        let (admit, admitted) = oneshot::channel();
        lane.waiters.push_back(Waiter {
            task_id,
            admit,
            listening: false,
        });

        Ok(LockTicket {
            locks: self.clone(),
            manager: manager.clone(),
            task_id,
            admitted: Some(admitted),
        })
    }

    pub async fn acquire(
        &self,
        manager: &ManagerId,
        task_id: TaskId,
        wait_timeout: Option<Duration>,
    ) -> OrchestrationResult<LockGuard> {
        self.enqueue(manager, task_id)?.wait(wait_timeout).await
    }

    /// Frees the lock and admits the next listening waiter. Returns false
    /// when `task_id` was not the holder.
    pub fn release(&self, manager: &ManagerId, task_id: TaskId) -> bool {
        let mut lanes = self.lanes();
        let Some(lane) = lanes.get_mut(manager) else {
            return false;
        };
        if lane.holder != Some(task_id) {
            return false;
        }

        lane.holder = None;
        lane.admit_head(manager);

        if lane.is_idle() {
            lanes.remove(manager);
        }
        true
    }

    /// Removes a ticket that has not been admitted yet. Its pending `wait`
    /// resolves with `Cancelled`.
    pub fn withdraw(&self, manager: &ManagerId, task_id: TaskId) -> bool {
        let mut lanes = self.lanes();
        let Some(lane) = lanes.get_mut(manager) else {
            return false;
        };
        let before = lane.waiters.len();
        lane.waiters.retain(|waiter| waiter.task_id != task_id);
        let withdrawn = lane.waiters.len() != before;
        if withdrawn {
            lane.admit_head(manager);
        }

        if lane.is_idle() {
            lanes.remove(manager);
        }
        withdrawn
    }

    pub fn holder(&self, manager: &ManagerId) -> Option<TaskId> {
        self.lanes().get(manager).and_then(|lane| lane.holder)
    }

    pub fn waiting(&self, manager: &ManagerId) -> Vec<TaskId> {
        self.lanes()
            .get(manager)
            .map(|lane| lane.waiters.iter().map(|waiter| waiter.task_id).collect())
            .unwrap_or_default()
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<ManagerId, Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listen(&self, manager: &ManagerId, task_id: TaskId) {
        let mut lanes = self.lanes();
        let Some(lane) = lanes.get_mut(manager) else {
            return;
        };
        if let Some(waiter) = lane.waiters.iter_mut().find(|w| w.task_id == task_id) {
            waiter.listening = true;
        }
        lane.admit_head(manager);
    }

    /// A ticket dropped before it was turned into a guard gives up its place,
    /// or the lock itself if it had already been admitted.
    fn abandon(&self, manager: &ManagerId, task_id: TaskId) {
        if !self.withdraw(manager, task_id) {
            self.release(manager, task_id);
        }
    }
}

#[must_use = "a ticket holds a place in the manager queue until waited on or dropped"]
pub struct LockTicket {
    locks: ResourceLockManager,
    manager: ManagerId,
    task_id: TaskId,
    admitted: Option<oneshot::Receiver<()>>,
}

impl LockTicket {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn manager(&self) -> &ManagerId {
        &self.manager
    }

    /// Resolves once this ticket is at the head of its lane and the lane is
    /// free. A withdrawn ticket resolves with `Cancelled`; an expired wait
    /// gives up its place and resolves with `LockTimeout`.
    pub async fn wait(mut self, wait_timeout: Option<Duration>) -> OrchestrationResult<LockGuard> {
        self.locks.listen(&self.manager, self.task_id);

        // The receiver stays inside the ticket while waiting, so a caller that
        // drops this future still releases whatever it was handed.
        let Some(admitted) = self.admitted.as_mut() else {
            return Err(lock_error(
                &self.manager,
                self.task_id,
                CoreErrorKind::Internal,
                "lock ticket was already consumed",
            ));
        };

        let outcome = match wait_timeout {
            Some(limit) => match tokio::time::timeout(limit, admitted).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.admitted = None;
                    if !self.locks.withdraw(&self.manager, self.task_id)
                        && self.locks.holder(&self.manager) == Some(self.task_id)
                    {
                        return Ok(self.into_guard());
                    }
                    return Err(lock_error(
                        &self.manager,
                        self.task_id,
                        CoreErrorKind::LockTimeout,
                        &format!("manager lock was not admitted within {}ms", limit.as_millis()),
                    ));
                }
            },
            None => admitted.await,
        };
        self.admitted = None;

        match outcome {
            Ok(()) => Ok(self.into_guard()),
            Err(_) => Err(lock_error(
                &self.manager,
                self.task_id,
                CoreErrorKind::Cancelled,
                "ticket was withdrawn before the lock was admitted",
            )),
        }
    }

    fn into_guard(mut self) -> LockGuard {
        self.admitted = None;
        LockGuard {
            locks: self.locks.clone(),
            manager: self.manager.clone(),
            task_id: self.task_id,
            released: false,
        }
    }
}

impl Drop for LockTicket {
    fn drop(&mut self) {
        if self.admitted.is_some() {
            self.locks.abandon(&self.manager, self.task_id);
        }
    }
}

/// Proof of holding a manager lock. Released explicitly or on drop.
pub struct LockGuard {
    locks: ResourceLockManager,
    manager: ManagerId,
    task_id: TaskId,
    released: bool,
}

impl LockGuard {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.locks.release(&self.manager, self.task_id);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn lock_error(
    manager: &ManagerId,
    task_id: TaskId,
    kind: CoreErrorKind,
    message: &str,
) -> CoreError {
    CoreError {
        manager: Some(manager.clone()),
        task_id: Some(task_id),
        action: None,
        kind,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ResourceLockManager;
    use crate::models::{CoreErrorKind, ManagerId, TaskId};

    #[tokio::test]
    async fn waiters_are_admitted_in_arrival_order() {
        let locks = ResourceLockManager::new();
        let npm = ManagerId::new("npm");

        let first = locks.enqueue(&npm, TaskId(1)).unwrap();
        let second = locks.enqueue(&npm, TaskId(2)).unwrap();
        let third = locks.enqueue(&npm, TaskId(3)).unwrap();
        assert_eq!(locks.holder(&npm), None);
        assert_eq!(locks.waiting(&npm), vec![TaskId(1), TaskId(2), TaskId(3)]);

        let guard = first.wait(None).await.unwrap();
        assert_eq!(locks.holder(&npm), Some(TaskId(1)));
        guard.release();
        assert_eq!(locks.holder(&npm), None);

        // The third ticket listens first but still queues behind the second.
        let third = tokio::spawn(third.wait(None));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(locks.holder(&npm), None);

        let guard = second.wait(None).await.unwrap();
        assert_eq!(guard.task_id(), TaskId(2));
        drop(guard);

        let guard = third.await.unwrap().unwrap();
        assert_eq!(guard.task_id(), TaskId(3));
    }

    #[test]
    fn enqueue_records_arrival_without_taking_the_lock() {
        let locks = ResourceLockManager::new();
        let npm = ManagerId::new("npm");

        let ticket = locks.enqueue(&npm, TaskId(1)).unwrap();
        assert_eq!(locks.holder(&npm), None);
        assert!(locks.withdraw(&npm, TaskId(1)));
        assert_eq!(locks.holder(&npm), None);
        assert!(locks.waiting(&npm).is_empty());
        drop(ticket);
        assert_eq!(locks.holder(&npm), None);
    }

    #[tokio::test]
    async fn distinct_managers_do_not_contend() {
        let locks = ResourceLockManager::new();
        let _npm = locks.acquire(&ManagerId::new("npm"), TaskId(1), None).await.unwrap();
        let pipx = locks
            .acquire(&ManagerId::new("pipx"), TaskId(2), Some(Duration::from_millis(10)))
            .await;
        assert!(pipx.is_ok());
    }

    #[tokio::test]
    async fn withdrawn_ticket_is_skipped_and_never_admitted() {
        let locks = ResourceLockManager::new();
        let npm = ManagerId::new("npm");

        let holder = locks.acquire(&npm, TaskId(1), None).await.unwrap();
        let withdrawn = locks.enqueue(&npm, TaskId(2)).unwrap();
        let next = locks.enqueue(&npm, TaskId(3)).unwrap();

        assert!(locks.withdraw(&npm, TaskId(2)));
        let error = withdrawn.wait(None).await.err().unwrap();
        assert_eq!(error.kind, CoreErrorKind::Cancelled);

        let next = tokio::spawn(next.wait(None));
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(holder);
        let guard = next.await.unwrap().unwrap();
        assert_eq!(guard.task_id(), TaskId(3));
        assert_eq!(locks.holder(&npm), Some(TaskId(3)));
    }

    #[tokio::test]
    async fn bounded_wait_surfaces_lock_timeout_and_leaves_the_queue() {
        let locks = ResourceLockManager::new();
        let npm = ManagerId::new("npm");

        let _holder = locks.acquire(&npm, TaskId(1), None).await.unwrap();
        let error = locks
            .acquire(&npm, TaskId(2), Some(Duration::from_millis(20)))
            .await
            .err()
            .unwrap();
        assert_eq!(error.kind, CoreErrorKind::LockTimeout);
        assert_eq!(error.task_id, Some(TaskId(2)));
        assert!(locks.waiting(&npm).is_empty());
    }

    #[test]
    fn reentrant_enqueue_is_rejected() {
        let locks = ResourceLockManager::new();
        let npm = ManagerId::new("npm");
        let _ticket = locks.enqueue(&npm, TaskId(1)).unwrap();
        assert!(locks.enqueue(&npm, TaskId(1)).is_err());
    }

    #[tokio::test]
    async fn dropped_ticket_gives_up_its_place() {
        let locks = ResourceLockManager::new();
        let npm = ManagerId::new("npm");
        let first = locks.enqueue(&npm, TaskId(1)).unwrap();
        let waiting = locks.enqueue(&npm, TaskId(2)).unwrap();

        drop(waiting);
        assert_eq!(locks.waiting(&npm), vec![TaskId(1)]);
        drop(first);
        assert!(locks.waiting(&npm).is_empty());

        let guard = locks.acquire(&npm, TaskId(3), None).await.unwrap();
        drop(guard);
        assert_eq!(locks.holder(&npm), None);
    }
}

//! Pending actions of a unit of work.
//!
//! The queue keeps one ordered sequence per [`ActionKind`]. Sorting orders
//! entity inserts parent-first and deletes child-first using the foreign-key
//! references found on the live entities; ties keep discovery order.
//! Execution walks the kinds in [`ActionKind::PIPELINE`] order, one statement
//! at a time, and stops at the first failure.

use crate::action::{Action, ActionKind, EntityInsertAction};
use crate::context::PersistenceContext;
use crate::entity::EntityRef;
use flushline_core::{Connection, Cx, Dialect, Error, Outcome, try_outcome};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Error type for action queue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Pending inserts reference each other in a cycle.
    CycleDetected {
        /// Entities involved in the cycle.
        entities: Vec<String>,
    },
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::CycleDetected { entities } => {
                write!(f, "Insert dependency cycle detected: {}", entities.join(" -> "))
            }
        }
    }
}

impl std::error::Error for QueueError {}

impl From<QueueError> for Error {
    fn from(e: QueueError) -> Self {
        Error::Custom(e.to_string())
    }
}

/// Number of actions per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionCounts {
    counts: [usize; ActionKind::PIPELINE.len()],
}

impl ActionCounts {
    pub fn get(&self, kind: ActionKind) -> usize {
        self.counts[kind as usize]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    fn record(&mut self, kind: ActionKind) {
        self.counts[kind as usize] += 1;
    }
}

/// Ordered pending actions, one sequence per kind.
#[derive(Debug)]
pub struct ActionQueue {
    queues: [Vec<Action>; ActionKind::PIPELINE.len()],
    /// Entities whose identity insert is held back until the next flush.
    unresolved_inserts: HashSet<EntityRef>,
    dialect: Dialect,
    batch_size: usize,
}

impl ActionQueue {
    pub fn new(dialect: Dialect, batch_size: usize) -> Self {
        Self {
            queues: Default::default(),
            unresolved_inserts: HashSet::new(),
            dialect,
            batch_size,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn queue(&self, kind: ActionKind) -> &Vec<Action> {
        &self.queues[kind as usize]
    }

    fn queue_mut(&mut self, kind: ActionKind) -> &mut Vec<Action> {
        &mut self.queues[kind as usize]
    }

    /// Pending actions of one kind, in their current order.
    pub fn actions(&self, kind: ActionKind) -> &[Action] {
        self.queue(kind)
    }

    /// Queue an action.
    ///
    /// An identity insert that is not delayed runs right away, after every
    /// insert already queued, so the entity's generated id is available to
    /// the caller when this returns.
    #[tracing::instrument(level = "debug", skip_all, fields(kind = action.kind().as_str(), entity = ?action.entity()))]
    pub async fn add_action<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        ctx: &mut PersistenceContext,
        action: Action,
    ) -> Outcome<(), Error> {
        if let Action::Insert(insert) = &action {
            if insert.identity && !insert.delayed {
                tracing::debug!("Executing early identity insert");
                try_outcome!(self.execute_inserts(cx, conn, ctx).await);
                return action
                    .execute(cx, conn, ctx, self.dialect, self.batch_size)
                    .await;
            }
        }
        self.enqueue(action);
        Outcome::Ok(())
    }

    /// Append an action to its kind's sequence without executing anything.
    pub fn enqueue(&mut self, action: Action) {
        if let Action::Insert(insert) = &action {
            if insert.delayed {
                self.unresolved_inserts.insert(insert.entity.clone());
            }
        }
        self.queue_mut(action.kind()).push(action);
    }

    /// Drop the actions a flush schedules for itself: updates and collection
    /// actions. Inserts and deletes scheduled by persist and remove stay.
    pub fn discard_flush_actions(&mut self) {
        for kind in [
            ActionKind::Update,
            ActionKind::QueuedOperation,
            ActionKind::CollectionRemove,
            ActionKind::CollectionUpdate,
            ActionKind::CollectionRecreate,
        ] {
            self.queue_mut(kind).clear();
        }
    }

    /// Execute every queued insert now, parent-first.
    pub async fn execute_inserts<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        ctx: &mut PersistenceContext,
    ) -> Outcome<(), Error> {
        if self.queue(ActionKind::Insert).is_empty() {
            return Outcome::Ok(());
        }
        try_outcome!(result self.sort_inserts());
        let inserts = std::mem::take(self.queue_mut(ActionKind::Insert));
        self.unresolved_inserts.clear();
        for action in &inserts {
            try_outcome!(
                action
                    .execute(cx, conn, ctx, self.dialect, self.batch_size)
                    .await
            );
        }
        Outcome::Ok(())
    }

    /// Whether an insert for `entity` is queued.
    pub fn has_insert_for(&self, entity: &EntityRef) -> bool {
        self.queue(ActionKind::Insert)
            .iter()
            .any(|a| a.entity() == entity)
    }

    /// Whether a delete for `entity` is queued.
    pub fn has_delete_for(&self, entity: &EntityRef) -> bool {
        self.queue(ActionKind::Delete)
            .iter()
            .any(|a| a.entity() == entity)
    }

    /// Whether `entity` waits on a delayed identity insert.
    pub fn is_unresolved_insert(&self, entity: &EntityRef) -> bool {
        self.unresolved_inserts.contains(entity)
    }

    /// Drop the queued insert for `entity`, returning it.
    pub fn unschedule_insert(&mut self, entity: &EntityRef) -> Option<EntityInsertAction> {
        self.unresolved_inserts.remove(entity);
        let queue = self.queue_mut(ActionKind::Insert);
        let index = queue.iter().position(|a| a.entity() == entity)?;
        match queue.remove(index) {
            Action::Insert(insert) => Some(insert),
            _ => None,
        }
    }

    /// Drop the queued delete for `entity`.
    pub fn unschedule_delete(&mut self, entity: &EntityRef) -> bool {
        let queue = self.queue_mut(ActionKind::Delete);
        let before = queue.len();
        queue.retain(|a| a.entity() != entity);
        queue.len() != before
    }

    /// Drop every queued action that targets or is owned by `entity`.
    pub fn unschedule_all(&mut self, entity: &EntityRef) {
        self.unresolved_inserts.remove(entity);
        for queue in &mut self.queues {
            queue.retain(|a| a.entity() != entity);
        }
    }

    /// Pre-execution bookkeeping for collection actions.
    ///
    /// Actions on the inverse side of a bidirectional association issue no
    /// statements; the owning to-one carries the membership. They are dropped
    /// here, along with duplicate actions for the same collection.
    pub fn prepare_actions(&mut self) {
        for kind in [
            ActionKind::QueuedOperation,
            ActionKind::CollectionRemove,
            ActionKind::CollectionUpdate,
            ActionKind::CollectionRecreate,
        ] {
            let mut seen = HashSet::new();
            let mut dropped = 0_usize;
            self.queue_mut(kind).retain(|action| {
                let Some(collection) = action.collection() else {
                    return true;
                };
                if collection.mapping.inverse {
                    if kind == ActionKind::QueuedOperation {
                        collection
                            .owner()
                            .update_collection(&collection.collection.property, |bag| {
                                bag.drain_queued();
                            });
                    }
                    dropped += 1;
                    return false;
                }
                let keep = seen.insert(collection.collection.clone());
                if !keep {
                    dropped += 1;
                }
                keep
            });
            if dropped > 0 {
                tracing::debug!(kind = kind.as_str(), dropped, "Dropped collection actions");
            }
        }
    }

    /// Order inserts parent-first and deletes child-first.
    ///
    /// With `order_updates`, updates are ordered by entity name and id so
    /// concurrent flushes lock rows in the same order.
    pub fn sort_actions(&mut self, order_updates: bool) -> Result<(), Error> {
        self.sort_inserts()?;
        self.sort_deletes();
        if order_updates {
            self.queue_mut(ActionKind::Update)
                .sort_by_cached_key(|a| (a.entity().entity_name(), a.entity().id().to_string()));
        }
        Ok(())
    }

    fn sort_inserts(&mut self) -> Result<(), Error> {
        let inserts = std::mem::take(self.queue_mut(ActionKind::Insert));
        // An insert depends on the inserts of the entities it references.
        let edges = reference_edges(&inserts, false);
        match stable_topological_order(inserts.len(), &edges) {
            Ok(order) => {
                *self.queue_mut(ActionKind::Insert) = reorder(inserts, &order);
                Ok(())
            }
            Err(remaining) => {
                let entities = remaining
                    .iter()
                    .map(|&i| format!("{:?}", inserts[i].entity()))
                    .collect();
                *self.queue_mut(ActionKind::Insert) = inserts;
                Err(QueueError::CycleDetected { entities }.into())
            }
        }
    }

    fn sort_deletes(&mut self) {
        let deletes = std::mem::take(self.queue_mut(ActionKind::Delete));
        // A referenced entity is deleted after the entities referencing it.
        let edges = reference_edges(&deletes, true);
        *self.queue_mut(ActionKind::Delete) =
            match stable_topological_order(deletes.len(), &edges) {
                Ok(order) => reorder(deletes, &order),
                Err(remaining) => {
                    tracing::warn!(
                        cycle = remaining.len(),
                        "Delete dependency cycle, keeping discovery order"
                    );
                    deletes
                }
            };
    }

    /// Order collection actions by role, keeping discovery order within a
    /// role.
    pub fn sort_collection_actions(&mut self) {
        for kind in [
            ActionKind::QueuedOperation,
            ActionKind::CollectionRemove,
            ActionKind::CollectionUpdate,
            ActionKind::CollectionRecreate,
        ] {
            self.queue_mut(kind)
                .sort_by(|a, b| match (a.collection(), b.collection()) {
                    (Some(a), Some(b)) => a.role.cmp(&b.role),
                    _ => std::cmp::Ordering::Equal,
                });
        }
    }

    /// Run every queued action in pipeline order.
    ///
    /// The first failure stops execution; the queue is cleared either way.
    #[tracing::instrument(level = "debug", skip_all, fields(pending = self.len()))]
    pub async fn execute_actions<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        ctx: &mut PersistenceContext,
    ) -> Outcome<ActionCounts, Error> {
        let mut counts = ActionCounts::default();
        self.unresolved_inserts.clear();

        for kind in ActionKind::PIPELINE {
            let actions = std::mem::take(self.queue_mut(kind));
            if actions.is_empty() {
                continue;
            }
            tracing::debug!(kind = kind.as_str(), count = actions.len(), "Executing actions");
            for action in &actions {
                match action
                    .execute(cx, conn, ctx, self.dialect, self.batch_size)
                    .await
                {
                    Outcome::Ok(()) => counts.record(kind),
                    other => {
                        let discarded = self.len();
                        self.clear();
                        tracing::warn!(
                            kind = kind.as_str(),
                            executed = counts.total(),
                            discarded,
                            "Action failed, discarding remaining actions"
                        );
                        return match other {
                            Outcome::Err(e) => Outcome::Err(e),
                            Outcome::Cancelled(r) => Outcome::Cancelled(r),
                            Outcome::Panicked(p) => Outcome::Panicked(p),
                            Outcome::Ok(()) => Outcome::Ok(counts),
                        };
                    }
                }
            }
        }
        Outcome::Ok(counts)
    }

    /// Pending actions per kind.
    pub fn counts(&self) -> ActionCounts {
        let mut counts = ActionCounts::default();
        for kind in ActionKind::PIPELINE {
            counts.counts[kind as usize] = self.queue(kind).len();
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(Vec::is_empty)
    }

    /// Whether anything besides delayed identity inserts is queued.
    pub fn has_unresolved_only(&self) -> bool {
        !self.unresolved_inserts.is_empty() && self.len() == self.unresolved_inserts.len()
    }

    pub fn clear(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
        self.unresolved_inserts.clear();
    }
}

/// Dependency edges `(before, after)` between entity actions derived from
/// the to-one references of the live entities.
///
/// Without `reverse`, a referenced entity comes first; with it, the
/// referencing entity does.
fn reference_edges(actions: &[Action], reverse: bool) -> Vec<(usize, usize)> {
    let index: HashMap<&EntityRef, usize> = actions
        .iter()
        .enumerate()
        .map(|(i, a)| (a.entity(), i))
        .collect();

    let mut edges = Vec::new();
    for (i, action) in actions.iter().enumerate() {
        let persister = match action {
            Action::Insert(a) => &a.persister,
            Action::Delete(a) => &a.persister,
            _ => continue,
        };
        for association in persister.to_one_associations() {
            let Some(target) = action.entity().entity(&association.name) else {
                continue;
            };
            if let Some(&j) = index.get(&target) {
                if i != j {
                    edges.push(if reverse { (i, j) } else { (j, i) });
                }
            }
        }
    }
    edges
}

/// Kahn's algorithm, always emitting the lowest ready index first so that
/// unconstrained actions keep their discovery order.
///
/// On a cycle, returns the indexes that could not be ordered.
fn stable_topological_order(len: usize, edges: &[(usize, usize)]) -> Result<Vec<usize>, Vec<usize>> {
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); len];
    let mut in_degree = vec![0_usize; len];
    for &(before, after) in edges {
        successors[before].push(after);
        in_degree[after] += 1;
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..len)
        .filter(|&i| in_degree[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(len);
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &next in &successors[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() == len {
        Ok(order)
    } else {
        Err((0..len).filter(|&i| in_degree[i] > 0).collect())
    }
}

fn reorder(actions: Vec<Action>, order: &[usize]) -> Vec<Action> {
    let mut slots: Vec<Option<Action>> = actions.into_iter().map(Some).collect();
    order.iter().filter_map(|&i| slots[i].take()).collect()
}

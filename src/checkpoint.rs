//! Checkpoint store
//!
//! Snapshots of the forward stepper taken every fixed number of steps. Records
//! are kept in an arena in chronological order: index 0 is the root at the
//! initial time, the last index is the newest checkpoint at the integration
//! frontier. Walking from the frontier back to the root is plain index
//! decrement.

use crate::nvector::{AllocError, NVector};
use crate::solver::{IntegrationError, Rkf78, SavedHistory, StepData};
use serde::Serialize;
use tracing::debug;

/// Immutable snapshot of stepper state covering `[t0, t1]`
#[derive(Debug, Clone)]
pub struct Checkpoint<V> {
    id: usize,
    root: bool,
    t0: f64,
    t1: f64,
    data: StepData,
    zn: SavedHistory<V>,
    znq: Option<SavedHistory<V>>,
}

impl<V: NVector> Checkpoint<V> {
    /// Root snapshot: solution slot only, order 1, zero step size.
    pub(crate) fn root(id: usize, stepper: &Rkf78<V>) -> Result<Self, AllocError> {
        let zn = &stepper.history()[0];
        let znq = stepper
            .quad_history()
            .map(|h| SavedHistory::leading(&h[0]))
            .transpose()?;
        let mut data = *stepper.data();
        data.q = 1;
        data.qu = 1;
        data.h = 0.0;
        data.hprime = 0.0;
        data.hu = 0.0;
        Ok(Self {
            id,
            root: true,
            t0: data.tn,
            t1: data.tn,
            data,
            zn: SavedHistory::leading(zn)?,
            znq,
        })
    }

    /// Full snapshot of the current state. Nothing is returned unless every
    /// slot was copied.
    pub(crate) fn capture(id: usize, stepper: &Rkf78<V>) -> Result<Self, AllocError> {
        let data = *stepper.data();
        let zn = stepper.save_history()?;
        let znq = stepper.save_quad_history()?;
        Ok(Self {
            id,
            root: false,
            t0: data.tn,
            t1: data.tn,
            data,
            zn,
            znq,
        })
    }

    /// Put `stepper` back at `t0`.
    ///
    /// The root goes through a full reinitialization with the recorded first
    /// step `h0u`; any other checkpoint is loaded as a hot restart.
    pub(crate) fn restore_into(&self, stepper: &mut Rkf78<V>, h0u: f64) -> Result<(), IntegrationError> {
        if self.root {
            stepper.set_init_step(h0u);
            stepper.reinit(self.t0, &self.zn.slots()[0])?;
            if let Some(znq) = &self.znq {
                stepper.quad_reinit(&znq.slots()[0])?;
            }
            Ok(())
        } else {
            stepper.load_state(&self.data, &self.zn, self.znq.as_ref())
        }
    }

    /// Creation id
    pub fn id(&self) -> usize {
        self.id
    }

    /// True for the checkpoint at the initial time
    pub fn is_root(&self) -> bool {
        self.root
    }

    /// Start of the covered interval
    pub fn t0(&self) -> f64 {
        self.t0
    }

    /// End of the covered interval
    pub fn t1(&self) -> f64 {
        self.t1
    }

    pub(crate) fn set_t1(&mut self, t1: f64) {
        self.t1 = t1;
    }

    /// Saved scalar state
    pub fn data(&self) -> &StepData {
        &self.data
    }

    /// Saved solution history
    pub fn history(&self) -> &SavedHistory<V> {
        &self.zn
    }

    /// Saved quadrature history
    pub fn quad_history(&self) -> Option<&SavedHistory<V>> {
        self.znq.as_ref()
    }

    /// Vectors owned by this record
    pub fn owned_vectors(&self) -> usize {
        self.zn.owned_vectors() + self.znq.as_ref().map_or(0, |h| h.owned_vectors())
    }
}

/// Checkpoint metadata for inspection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointInfo {
    /// Creation id
    pub id: usize,
    /// Id of the chronologically previous checkpoint
    pub previous: Option<usize>,
    /// Start of the interval
    pub t0: f64,
    /// End of the interval
    pub t1: f64,
    /// Step count at capture
    pub nst: u64,
    /// History order at capture
    pub order: usize,
    /// Step size at capture
    pub step: f64,
}

/// Arena of checkpoints in chronological order
#[derive(Debug, Clone)]
pub struct CheckpointStore<V> {
    records: Vec<Checkpoint<V>>,
    next_id: usize,
}

impl<V: NVector> Default for CheckpointStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: NVector> CheckpointStore<V> {
    /// Empty store
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            next_id: 0,
        }
    }

    /// Drop every record and capture `stepper` as the new root
    pub fn init_root(&mut self, stepper: &Rkf78<V>) -> Result<&Checkpoint<V>, AllocError> {
        self.clear();
        let root = Checkpoint::root(self.next_id, stepper)?;
        self.push(root);
        Ok(&self.records[0])
    }

    /// Capture the current state and append it at the frontier.
    ///
    /// Returns the index of the new record. On allocation failure the store
    /// is left unchanged.
    pub fn push_current(&mut self, stepper: &Rkf78<V>) -> Result<usize, AllocError> {
        let ck = Checkpoint::capture(self.next_id, stepper)?;
        debug!(id = ck.id, t0 = ck.t0, order = ck.data.q, "checkpoint created");
        Ok(self.push(ck))
    }

    /// Append a record at the frontier
    pub fn push(&mut self, ck: Checkpoint<V>) -> usize {
        self.next_id = self.next_id.max(ck.id + 1);
        self.records.push(ck);
        self.records.len() - 1
    }

    /// Newest record
    pub fn head(&self) -> Option<&Checkpoint<V>> {
        self.records.last()
    }

    /// Newest record, mutable
    pub(crate) fn head_mut(&mut self) -> Option<&mut Checkpoint<V>> {
        self.records.last_mut()
    }

    /// Index of the newest record
    pub fn head_index(&self) -> Option<usize> {
        self.records.len().checked_sub(1)
    }

    /// Record at chronological index
    pub fn get(&self, index: usize) -> Option<&Checkpoint<V>> {
        self.records.get(index)
    }

    /// Index of the chronologically previous record
    pub fn previous(&self, index: usize) -> Option<usize> {
        index.checked_sub(1).filter(|&i| i < self.records.len())
    }

    /// Number of records, root included
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when not even a root exists
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records from the frontier back to the root
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &Checkpoint<V>> {
        self.records.iter().rev()
    }

    /// Remove the newest record, returning how many vectors it owned
    pub fn delete_head(&mut self) -> Option<usize> {
        self.records.pop().map(|ck| ck.owned_vectors())
    }

    /// Remove every record
    pub fn clear(&mut self) {
        while self.delete_head().is_some() {}
    }

    /// Metadata of every record, newest first
    pub fn info(&self) -> Vec<CheckpointInfo> {
        self.records
            .iter()
            .enumerate()
            .rev()
            .map(|(i, ck)| CheckpointInfo {
                id: ck.id,
                previous: i.checked_sub(1).map(|p| self.records[p].id),
                t0: ck.t0,
                t1: ck.t1,
                nst: ck.data.nst,
                order: ck.data.q,
                step: ck.data.h,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::{OdeSystem, RhsError, Task, Tolerances};

    struct Decay;

    impl OdeSystem<Vec<f64>> for Decay {
        fn rhs(&self, _t: f64, y: &Vec<f64>, ydot: &mut Vec<f64>) -> Result<(), RhsError> {
            ydot[0] = -y[0];
            Ok(())
        }
    }

    fn stepper() -> Rkf78<Vec<f64>> {
        let mut s = Rkf78::new(Tolerances::new(1e-9, 1e-9));
        s.init(0.0, &vec![1.0]).unwrap();
        s
    }

    #[test]
    fn test_root_is_first_order_without_spare() {
        let s = stepper();
        let mut store = CheckpointStore::new();
        let root = store.init_root(&s).unwrap();
        assert!(root.is_root());
        assert_eq!(root.t0(), 0.0);
        assert_eq!(root.data().q, 1);
        assert_eq!(root.data().h, 0.0);
        assert_eq!(root.history().slots().len(), 1);
        assert!(root.history().spare().is_none());
        assert_eq!(root.owned_vectors(), 1);
    }

    #[test]
    fn test_root_with_quadratures_owns_one_quad_slot() {
        let mut s = stepper();
        s.quad_init(&vec![0.0], None).unwrap();
        let mut store = CheckpointStore::new();
        let root = store.init_root(&s).unwrap();
        assert_eq!(root.quad_history().map(|h| h.slots().len()), Some(1));
        assert_eq!(root.owned_vectors(), 2);
    }

    #[test]
    fn test_capture_keeps_active_slots_and_spare() {
        let mut s = stepper();
        let mut y = vec![0.0];
        for _ in 0..3 {
            s.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        }
        let mut store = CheckpointStore::new();
        store.init_root(&s).unwrap();
        let idx = store.push_current(&s).unwrap();
        let ck = store.get(idx).unwrap();
        let q = s.data().q;

        assert_eq!(idx, 1);
        assert_eq!(ck.t0(), s.t());
        assert_eq!(ck.history().slots().len(), q + 1);
        assert_eq!(ck.history().spare().is_some(), q < s.max_order());
        assert_eq!(ck.history().slots()[0], s.history()[0]);
    }

    #[test]
    fn test_store_navigation_and_info() {
        let mut s = stepper();
        let mut y = vec![0.0];
        let mut store = CheckpointStore::new();
        store.init_root(&s).unwrap();
        for _ in 0..2 {
            let t = s.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap().0;
            store.head_mut().unwrap().set_t1(t);
            store.push_current(&s).unwrap();
        }

        assert_eq!(store.len(), 3);
        assert_eq!(store.head_index(), Some(2));
        assert_eq!(store.previous(2), Some(1));
        assert_eq!(store.previous(0), None);

        let ids: Vec<usize> = store.iter_newest_first().map(|ck| ck.id()).collect();
        assert_eq!(ids, vec![2, 1, 0]);

        let info = store.info();
        assert_eq!(info.len(), 3);
        assert_eq!(info[0].previous, Some(1));
        assert_eq!(info[2].previous, None);
        // Consecutive intervals share their boundary
        assert_eq!(info[1].t1, info[0].t0);
        assert_eq!(info[2].t1, info[1].t0);
    }

    #[test]
    fn test_delete_head_reports_owned_vectors() {
        let mut s = stepper();
        let mut y = vec![0.0];
        let mut store = CheckpointStore::new();
        store.init_root(&s).unwrap();
        s.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        store.push_current(&s).unwrap();

        let expected = store.head().unwrap().owned_vectors();
        assert_eq!(store.delete_head(), Some(expected));
        assert_eq!(store.delete_head(), Some(1));
        assert_eq!(store.delete_head(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_ids_keep_increasing_after_delete() {
        let mut s = stepper();
        let mut y = vec![0.0];
        let mut store = CheckpointStore::new();
        store.init_root(&s).unwrap();
        s.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        store.push_current(&s).unwrap();
        store.delete_head();
        let idx = store.push_current(&s).unwrap();
        assert_eq!(store.get(idx).unwrap().id(), 2);
    }

    #[test]
    fn test_restore_non_root_matches_capture() {
        let mut s = stepper();
        let mut y = vec![0.0];
        for _ in 0..3 {
            s.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        }
        let mut store = CheckpointStore::new();
        store.init_root(&s).unwrap();
        let idx = store.push_current(&s).unwrap();
        let captured = *s.data();

        for _ in 0..3 {
            s.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        }
        store.get(idx).unwrap().restore_into(&mut s, 0.0).unwrap();
        assert_eq!(*s.data(), captured);
    }

    #[test]
    fn test_restore_root_reinitializes() {
        let mut s = stepper();
        let mut store = CheckpointStore::new();
        store.init_root(&s).unwrap();
        let mut y = vec![0.0];
        s.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        let h0 = s.initial_step();

        store.get(0).unwrap().restore_into(&mut s, h0).unwrap();
        assert_eq!(s.t(), 0.0);
        assert_eq!(s.data().nst, 0);
        assert_eq!(s.history()[0], vec![1.0]);

        s.solve(&Decay, 10.0, Task::OneStep, &mut y).unwrap();
        assert_eq!(s.initial_step(), h0);
    }
}

#[cfg(test)]
mod checklist_test;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::candidate::{Candidate, CandidatePair, CandidatePairState};

/// Lifecycle of a single media stream's check list, per §4.5's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckListState {
    Running,
    Completed,
    Failed,
}

impl From<u8> for CheckListState {
    fn from(v: u8) -> Self {
        match v {
            1 => CheckListState::Completed,
            2 => CheckListState::Failed,
            _ => CheckListState::Running,
        }
    }
}

/// Owns the pair sequence and triggered-check FIFO for one media stream. All pairs in a single
/// `CheckList` belong to that stream; a multi-stream agent owns one `CheckList` per stream.
///
/// The pair sequence and FIFO share one lock (§5's "each `CheckList` guards its pair sequence and
/// triggered FIFO with an internal lock"); individual `CandidatePair` state is carried in atomics
/// so read-mostly scheduling decisions (priority ordering, picking the next check) don't need to
/// hold it.
pub struct CheckList {
    pub stream: String,
    pairs: AsyncMutex<Vec<Arc<CandidatePair>>>,
    triggered: AsyncMutex<VecDeque<Arc<CandidatePair>>>,
    selected: AsyncMutex<HashMap<u16, Arc<CandidatePair>>>,
    state: AtomicU8,
}

impl CheckList {
    #[must_use]
    pub fn new(stream: impl Into<String>) -> Self {
        CheckList {
            stream: stream.into(),
            pairs: AsyncMutex::new(Vec::new()),
            triggered: AsyncMutex::new(VecDeque::new()),
            selected: AsyncMutex::new(HashMap::new()),
            state: AtomicU8::new(CheckListState::Running as u8),
        }
    }

    #[must_use]
    pub fn state(&self) -> CheckListState {
        self.state.load(Ordering::SeqCst).into()
    }

    pub fn set_state(&self, s: CheckListState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    /// Forms the Cartesian product of `locals` × `remotes`, keeping only pairs whose transports
    /// match and whose address families match, and appends them to the check list. Candidates
    /// that already have an equal pair present are skipped, which is how duplicate bases --
    /// multiple local candidates whose host base would otherwise be paired twice against the same
    /// remote -- are pruned.
    pub async fn form_pairs(
        &self,
        locals: &[Arc<dyn Candidate + Send + Sync>],
        remotes: &[Arc<dyn Candidate + Send + Sync>],
        controlling: bool,
    ) {
        let mut pairs = self.pairs.lock().await;
        for local in locals {
            for remote in remotes {
                let lnt = local.network_type();
                let rnt = remote.network_type();
                if lnt.is_tcp() != rnt.is_tcp() || lnt.is_ipv4() != rnt.is_ipv4() {
                    continue;
                }
                if pairs
                    .iter()
                    .any(|p| p.local.equal(&**local) && p.remote.equal(&**remote))
                {
                    continue;
                }
                pairs.push(Arc::new(CandidatePair::new(local.clone(), remote.clone(), controlling)));
            }
        }
    }

    /// Assigns initial states per §4.5: within each foundation group (local foundation + remote
    /// foundation), the pair with the lowest component id -- ties broken by highest priority --
    /// becomes `Waiting`; every other pair in the check list starts `Frozen`.
    pub async fn freeze_by_foundation(&self) {
        let pairs = self.pairs.lock().await;
        let mut groups: HashMap<String, Vec<&Arc<CandidatePair>>> = HashMap::new();
        for p in pairs.iter() {
            let foundation = format!("{}{}", p.local.foundation(), p.remote.foundation());
            groups.entry(foundation).or_default().push(p);
        }

        for group in groups.values() {
            if let Some(winner) = group.iter().min_by(|a, b| {
                a.local
                    .component()
                    .cmp(&b.local.component())
                    .then(b.priority().cmp(&a.priority()))
            }) {
                winner.state.store(CandidatePairState::Waiting as u8, Ordering::SeqCst);
                for p in group {
                    if !Arc::ptr_eq(p, winner) {
                        p.state.store(CandidatePairState::Frozen as u8, Ordering::SeqCst);
                    }
                }
            }
        }
    }

    /// Enqueues `pair` as a triggered check, adding it to the list first if absent. Used both for
    /// pairs implied by an inbound Binding Request (§4.5 "Triggered checks") and for peer-reflexive
    /// pairs learned from a success response.
    pub async fn schedule_triggered(&self, pair: Arc<CandidatePair>) {
        {
            let mut pairs = self.pairs.lock().await;
            if !pairs
                .iter()
                .any(|p| p.local.equal(&*pair.local) && p.remote.equal(&*pair.remote))
            {
                pairs.push(pair.clone());
            }
        }
        pair.state.store(CandidatePairState::Waiting as u8, Ordering::SeqCst);
        self.triggered.lock().await.push_back(pair);
    }

    /// Drains the next pair to check per the scheduling algorithm in §4.5: a triggered pair if the
    /// FIFO is non-empty, else the highest-priority `Waiting` pair, else the highest-priority
    /// `Frozen` pair (promoted to `Waiting`). Marks the returned pair `In-Progress`.
    pub async fn next_check(&self) -> Option<Arc<CandidatePair>> {
        {
            let mut triggered = self.triggered.lock().await;
            while let Some(pair) = triggered.pop_front() {
                if pair.state.load(Ordering::SeqCst) != CandidatePairState::Failed as u8 {
                    pair.state.store(CandidatePairState::InProgress as u8, Ordering::SeqCst);
                    return Some(pair);
                }
            }
        }

        let pairs = self.pairs.lock().await;
        let waiting = pairs
            .iter()
            .filter(|p| p.state.load(Ordering::SeqCst) == CandidatePairState::Waiting as u8)
            .max_by_key(|p| p.priority());

        if let Some(pair) = waiting {
            pair.state.store(CandidatePairState::InProgress as u8, Ordering::SeqCst);
            return Some(pair.clone());
        }

        let frozen = pairs
            .iter()
            .filter(|p| p.state.load(Ordering::SeqCst) == CandidatePairState::Frozen as u8)
            .max_by_key(|p| p.priority());

        if let Some(pair) = frozen {
            pair.state.store(CandidatePairState::InProgress as u8, Ordering::SeqCst);
            return Some(pair.clone());
        }

        None
    }

    /// Unfreezes every `Frozen` pair sharing `foundation` with a pair that just succeeded, per the
    /// foundation-grouped freezing algorithm: success on one member of a foundation group clears
    /// the others to retry opportunistically rather than waiting their turn.
    pub async fn unfreeze_foundation(&self, foundation: &str) {
        let pairs = self.pairs.lock().await;
        for p in pairs.iter() {
            let pf = format!("{}{}", p.local.foundation(), p.remote.foundation());
            if pf == foundation && p.state.load(Ordering::SeqCst) == CandidatePairState::Frozen as u8 {
                p.state.store(CandidatePairState::Waiting as u8, Ordering::SeqCst);
            }
        }
    }

    /// Re-stamps every pair currently in the list (and any still sitting in the triggered FIFO)
    /// with the agent's new role, per §4.5's "recompute pair priorities" step of role-conflict
    /// resolution. Must be called on every registered check list whenever [`Stack::set_role`]
    /// flips the agent's role, or stale pairs keep ordering themselves under the old G/D
    /// assignment.
    pub async fn set_role(&self, controlling: bool) {
        for p in self.pairs.lock().await.iter() {
            p.set_controlling(controlling);
        }
        for p in self.triggered.lock().await.iter() {
            p.set_controlling(controlling);
        }
    }

    /// Finds an existing pair with the given local/remote candidates, by value equality.
    pub async fn find_pair(
        &self,
        local: &Arc<dyn Candidate + Send + Sync>,
        remote: &Arc<dyn Candidate + Send + Sync>,
    ) -> Option<Arc<CandidatePair>> {
        let pairs = self.pairs.lock().await;
        pairs
            .iter()
            .find(|p| p.local.equal(&**local) && p.remote.equal(&**remote))
            .cloned()
    }

    /// Inserts a freshly synthesized pair (e.g. around a newly learned peer-reflexive candidate)
    /// directly, bypassing pair formation -- used when a success response's mapped address didn't
    /// match any known local candidate.
    pub async fn insert_pair(&self, pair: Arc<CandidatePair>) {
        self.pairs.lock().await.push(pair);
    }

    /// Marks `pair`'s component as having a nominated, selected pair. Per §4.5's nomination
    /// confirmation: removes every `Waiting`/`Frozen` pair in the same component from both the
    /// pair sequence and the triggered FIFO, and cancels (by marking `Failed`, so in-flight
    /// retransmit loops observe cancellation on their next check) every `In-Progress` pair in that
    /// component whose priority is lower than `pair`'s. The component's selected pair becomes
    /// `pair`.
    pub async fn handle_nomination(&self, pair: Arc<CandidatePair>) {
        let component = pair.local.component();

        {
            let mut pairs = self.pairs.lock().await;
            for p in pairs.iter() {
                if p.local.component() != component || Arc::ptr_eq(p, &pair) {
                    continue;
                }
                let state = p.state.load(Ordering::SeqCst);
                if state == CandidatePairState::InProgress as u8 && p.priority() < pair.priority() {
                    p.state.store(CandidatePairState::Failed as u8, Ordering::SeqCst);
                }
            }
            pairs.retain(|p| {
                Arc::ptr_eq(p, &pair) || p.local.component() != component || {
                    let state = p.state.load(Ordering::SeqCst);
                    state != CandidatePairState::Waiting as u8 && state != CandidatePairState::Frozen as u8
                }
            });
        }

        {
            let mut triggered = self.triggered.lock().await;
            triggered.retain(|p| p.local.component() != component || Arc::ptr_eq(p, &pair));
        }

        pair.nominated.store(true, Ordering::SeqCst);
        self.selected.lock().await.insert(component, pair);
    }

    #[must_use]
    pub async fn selected_pair(&self, component: u16) -> Option<Arc<CandidatePair>> {
        self.selected.lock().await.get(&component).cloned()
    }

    /// Recomputes `Running -> Completed`/`Running -> Failed` per §4.5: completed once every
    /// component named by `components` has a selected pair; failed once no pair is `Waiting` or
    /// `In-Progress` and no component has a selected pair. Leaves `Completed`/`Failed` check lists
    /// untouched -- terminal states don't revert.
    pub async fn update_state(&self, components: &HashSet<u16>) {
        if self.state() != CheckListState::Running {
            return;
        }

        let selected = self.selected.lock().await;
        if !components.is_empty() && components.iter().all(|c| selected.contains_key(c)) {
            self.set_state(CheckListState::Completed);
            return;
        }
        drop(selected);

        let pairs = self.pairs.lock().await;
        let has_active = pairs.iter().any(|p| {
            let s = p.state.load(Ordering::SeqCst);
            s == CandidatePairState::Waiting as u8 || s == CandidatePairState::InProgress as u8
        });
        let selected = self.selected.lock().await;
        if !has_active && selected.is_empty() {
            self.set_state(CheckListState::Failed);
        }
    }

    #[must_use]
    pub async fn len(&self) -> usize {
        self.pairs.lock().await.len()
    }

    #[must_use]
    pub async fn is_empty(&self) -> bool {
        self.pairs.lock().await.is_empty()
    }

    /// Returns pairs in non-increasing priority order, per the codec-adjacent "check list priority"
    /// testable property.
    pub async fn ordered_pairs(&self) -> Vec<Arc<CandidatePair>> {
        let mut pairs = self.pairs.lock().await.clone();
        pairs.sort_by_key(|p| std::cmp::Reverse(p.priority()));
        pairs
    }
}

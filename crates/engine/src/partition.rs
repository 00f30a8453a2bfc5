//! The partition (vbucket) actor.
//!
//! One long-running task owns each partition's state. Two inbound
//! channels feed it: the command channel for request dispatch and the
//! apply channel for synchronous critical sections run under actor
//! identity. While suspended, only the apply channel is serviced —
//! that is the mechanism the split-range coordinator uses to hold
//! destination partitions.
//!
//! Long streaming operations (range-get, changes-since) snapshot the
//! ordered trees (cheap `Arc` clones) and run on auxiliary tasks so the
//! actor stays responsive; they report stats back through `apply` and
//! take over delivery of the final response.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use cask_store::BucketStore;
use cask_types::{
    Item, Mutation, OpCode, PartitionConfig, PartitionId, PartitionStats, Request, Response,
    SplitRange, SplitRangePart, Status, VBucketState, MAX_PARTITIONS,
};

use crate::broadcast::{Broadcaster, MUTATION_BROADCAST_BUFFER};
use crate::bucket::BucketInner;
use crate::refresh;
use crate::seq::partition_seq_key;

pub(crate) type ApplyFn = Box<dyn FnOnce(&mut PartitionState) + Send>;

pub(crate) struct Command {
    pub req: Request,
    pub sink: Option<mpsc::Sender<Response>>,
    pub resp: oneshot::Sender<Option<Response>>,
}

const COMMAND_CHANNEL_DEPTH: usize = 64;
const APPLY_CHANNEL_DEPTH: usize = 16;

/// The state owned by a partition's actor. Reachable from outside only
/// through [`Partition::apply`].
pub struct PartitionState {
    pub(crate) vbid: PartitionId,
    pub(crate) items: BTreeMap<Bytes, Arc<Item>>,
    pub(crate) changes: BTreeMap<u64, Arc<Item>>,
    pub(crate) cas: u64,
    pub(crate) state: VBucketState,
    pub(crate) config: Option<PartitionConfig>,
    pub(crate) stats: PartitionStats,
    pub(crate) suspended: bool,
    pub(crate) closed: bool,
    pub(crate) views_store: Option<Arc<BucketStore>>,
    pub(crate) bucket: Weak<BucketInner>,
    pub(crate) observer: Broadcaster<Mutation>,
    pub(crate) staleness: Arc<AtomicI64>,
    pub(crate) views_lock: Arc<tokio::sync::Mutex<()>>,
    pub(crate) available: watch::Sender<()>,
    self_cmd: mpsc::WeakSender<Command>,
    self_apply: mpsc::WeakSender<ApplyFn>,
}

impl PartitionState {
    /// Partition id.
    pub fn vbid(&self) -> PartitionId {
        self.vbid
    }

    /// Current operational state.
    pub fn vb_state(&self) -> VBucketState {
        self.state
    }

    /// Replaces the operational state, returning the old one.
    pub fn set_vb_state(&mut self, state: VBucketState) -> VBucketState {
        std::mem::replace(&mut self.state, state)
    }

    /// Live item count.
    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Change-log record count, tombstones included.
    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// The CAS counter: the value the next mutation will take.
    pub fn current_cas(&self) -> u64 {
        self.cas
    }

    /// Key-range configuration, if set.
    pub fn config(&self) -> Option<&PartitionConfig> {
        self.config.as_ref()
    }

    /// Operation counters.
    pub fn stats(&self) -> &PartitionStats {
        &self.stats
    }

    /// Whether the command channel is currently being ignored.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Rebuilds a handle to this partition from inside the actor.
    pub(crate) fn handle(&self) -> Option<Partition> {
        Some(Partition {
            vbid: self.vbid,
            cmd_tx: self.self_cmd.upgrade()?,
            apply_tx: self.self_apply.upgrade()?,
            observer: self.observer.clone(),
            staleness: self.staleness.clone(),
            views_lock: self.views_lock.clone(),
            bucket: self.bucket.clone(),
        })
    }

    fn check_range(&mut self, key: &[u8]) -> Option<Response> {
        let config = self.config.as_ref()?;
        if config.contains(key) {
            return None;
        }
        self.stats.err_not_my_range += 1;
        Some(Response::status(Status::NotMyRange))
    }

    fn op_get(&mut self, op: OpCode, req: &Request) -> (Option<Response>, Option<Mutation>) {
        self.stats.gets += 1;
        if let Some(res) = self.check_range(&req.key) {
            return (Some(res), None);
        }
        let Some(item) = self.items.get(&req.key).cloned() else {
            self.stats.get_misses += 1;
            if op.is_quiet() {
                return (None, None);
            }
            return (Some(Response::status(Status::KeyEnoent)), None);
        };
        let body = item.data.clone().unwrap_or_default();
        self.stats.value_bytes_outgoing += body.len() as u64;
        let mut res = Response { cas: item.cas, flag: item.flag, body, ..Default::default() };
        if op.wants_key() {
            res.key = req.key.clone();
        }
        (Some(res), None)
    }

    fn op_set(&mut self, op: OpCode, req: &Request) -> (Option<Response>, Option<Mutation>) {
        self.stats.sets += 1;
        if let Some(res) = self.check_range(&req.key) {
            return (Some(res), None);
        }
        let old = self.items.get(&req.key).cloned();
        if req.cas != 0 {
            let old_cas = old.as_ref().map_or(0, |i| i.cas);
            if old_cas != req.cas {
                return (Some(Response::status(Status::Einval)), None);
            }
        }

        let item_cas = self.cas;
        self.cas += 1;

        let item = Arc::new(Item {
            key: req.key.clone(),
            flag: req.flag,
            exp: req.exp,
            cas: item_cas,
            data: Some(req.body.clone()),
        });
        self.stats.value_bytes_incoming += req.body.len() as u64;

        self.items.insert(req.key.clone(), item.clone());
        self.changes.insert(item_cas, item);
        match old {
            // The superseded change record is pruned to bound growth.
            Some(old) => {
                self.changes.remove(&old.cas);
                self.stats.updates += 1;
            }
            None => {
                self.stats.creates += 1;
                self.stats.items += 1;
            }
        }

        let mutation =
            Mutation { vbid: self.vbid, key: req.key.clone(), cas: item_cas, deleted: false };
        if op.is_quiet() {
            (None, Some(mutation))
        } else {
            (Some(Response::with_cas(item_cas)), Some(mutation))
        }
    }

    fn op_delete(&mut self, op: OpCode, req: &Request) -> (Option<Response>, Option<Mutation>) {
        self.stats.deletes += 1;
        if let Some(res) = self.check_range(&req.key) {
            return (Some(res), None);
        }
        let Some(old) = self.items.get(&req.key).cloned() else {
            if op.is_quiet() {
                return (None, None);
            }
            return (Some(Response::status(Status::KeyEnoent)), None);
        };
        if req.cas != 0 && req.cas != old.cas {
            return (Some(Response::status(Status::Einval)), None);
        }

        let cas = self.cas;
        self.cas += 1;

        self.stats.items -= 1;
        self.items.remove(&req.key);
        // The tombstone is retained; earlier records for the key are not
        // pruned here, so a changes-since stream sees both the last
        // write and the delete.
        self.changes.insert(
            cas,
            Arc::new(Item { key: req.key.clone(), flag: 0, exp: 0, cas, data: None }),
        );

        let mutation = Mutation { vbid: self.vbid, key: req.key.clone(), cas, deleted: true };
        (Some(Response::ok()), Some(mutation))
    }

    fn op_get_config(&mut self) -> (Option<Response>, Option<Mutation>) {
        let body = self
            .config
            .as_ref()
            .and_then(|c| serde_json::to_vec(c).ok())
            .unwrap_or_else(|| b"{}".to_vec());
        (Some(Response { body: body.into(), ..Default::default() }), None)
    }

    fn op_set_config(&mut self, req: &Request) -> (Option<Response>, Option<Mutation>) {
        if !req.body.is_empty() {
            match serde_json::from_slice::<PartitionConfig>(&req.body) {
                Ok(config) => {
                    self.config = Some(config);
                    return (Some(Response::ok()), None);
                }
                Err(error) => {
                    warn!(vbid = self.vbid, %error, "error decoding vbucket config");
                }
            }
        }
        (Some(Response::status(Status::Einval)), None)
    }

    /// Streams change-log records above `req.cas` on an auxiliary task,
    /// finishing with a terminator response that has an empty key.
    fn op_changes_since(&mut self, cmd: Command) {
        let Command { req, sink, resp } = cmd;
        let Some(sink) = sink else {
            let _ = resp.send(Some(Response::error(
                Status::Einval,
                "changes-since requires a stream",
            )));
            return;
        };
        let since = req.cas;
        let snapshot: Vec<Arc<Item>> =
            self.changes.range((Excluded(since), Unbounded)).map(|(_, i)| i.clone()).collect();
        let opcode = req.opcode;
        let vbid = self.vbid;

        tokio::spawn(async move {
            for item in snapshot {
                let record = Response {
                    opcode,
                    key: item.key.clone(),
                    cas: item.cas,
                    ..Default::default()
                };
                if sink.send(record).await.is_err() {
                    warn!(vbid, "error sending changes-since stream");
                    let _ = resp.send(Some(Response::fatal()));
                    return;
                }
            }
            let _ = resp.send(Some(Response { opcode, cas: since, ..Default::default() }));
        });
    }

    /// Streams items ascending from the request key on an auxiliary
    /// task. Extras (end key, limit, flags) are accepted on the wire but
    /// not honoured.
    fn op_rget(&mut self, cmd: Command) {
        self.stats.rgets += 1;
        let Command { req, sink, resp } = cmd;
        let snapshot: Vec<Arc<Item>> =
            self.items.range(req.key.clone()..).map(|(_, i)| i.clone()).collect();
        let opcode = req.opcode;
        let vbid = self.vbid;
        let apply = self.self_apply.clone();

        tokio::spawn(async move {
            let mut result = Response { opcode, cas: req.cas, ..Default::default() };
            let mut results = 0u64;
            let mut bytes_out = 0u64;
            if let Some(sink) = sink {
                for item in snapshot {
                    let record = Response {
                        opcode,
                        key: item.key.clone(),
                        cas: item.cas,
                        flag: item.flag,
                        body: item.data.clone().unwrap_or_default(),
                        ..Default::default()
                    };
                    let len = record.body.len() as u64;
                    if sink.send(record).await.is_err() {
                        warn!(vbid, "error sending rget stream");
                        result = Response::fatal();
                        break;
                    }
                    results += 1;
                    bytes_out += len;
                }
            }
            if let Some(apply) = apply.upgrade() {
                let _ = apply
                    .send(Box::new(move |st: &mut PartitionState| {
                        st.stats.rget_results += results;
                        st.stats.value_bytes_outgoing += bytes_out;
                    }))
                    .await;
            }
            let _ = resp.send(Some(result));
        });
    }

    fn publish_mutation(&mut self, mutation: Mutation) {
        self.observer.submit(mutation.clone());
        if let Some(bucket) = self.bucket.upgrade() {
            bucket.seq.publish(partition_seq_key(self.vbid), mutation.cas as i64);
        }
        self.mark_stale();
    }

    /// Bumps the staleness counter; the 0→1 crossing registers this
    /// partition with the shared view refresher.
    fn mark_stale(&mut self) {
        if self.staleness.fetch_add(1, AtomicOrdering::SeqCst) + 1 != 1 {
            return;
        }
        let (Some(bucket), Some(handle)) = (self.bucket.upgrade(), self.handle()) else {
            return;
        };
        bucket.refresher.register(self.available.subscribe(), refresh::make_refresh_work(handle));
    }
}

/// Copies entries whose item keys fall in `[min, max)`; an empty bound
/// leaves that side open.
fn key_in_range(key: &[u8], min: &Bytes, max: &Bytes) -> bool {
    if !min.is_empty() && key < &min[..] {
        return false;
    }
    if !max.is_empty() && key >= &max[..] {
        return false;
    }
    true
}

async fn op_split_range(state: &mut PartitionState, req: &Request) -> Response {
    if req.body.is_empty() {
        return Response::status(Status::Einval);
    }
    match serde_json::from_slice::<SplitRange>(&req.body) {
        Ok(sr) => split_range(state, sr.splits).await,
        Err(error) => Response::error(
            Status::Einval,
            format!("error decoding split-range json: {error}"),
        ),
    }
}

/// Atomically transfers key ranges to destination partitions.
///
/// Destinations are acquired in ascending vbid order (the stable sort
/// also makes duplicate ids adjacent); each must be `Dead` and is held
/// via its suspended flag while the copy runs. On any failure the
/// source is untouched and everything held resumes; destinations that
/// were created stay behind for operator cleanup.
async fn split_range(state: &mut PartitionState, mut splits: Vec<SplitRangePart>) -> Response {
    if splits.is_empty() {
        return Response::error(Status::Einval, "need at least 1 split");
    }
    splits.sort_by_key(|s| s.vbucket_id);
    let mut max = -1i64;
    for split in &splits {
        if split.vbucket_id < 0 || split.vbucket_id as usize >= MAX_PARTITIONS {
            return Response::error(
                Status::Einval,
                format!("vbucket id {} out of range", split.vbucket_id),
            );
        }
        if i64::from(split.vbucket_id) <= max || split.vbucket_id as PartitionId == state.vbid {
            return Response::error(
                Status::Einval,
                format!("vbucket id {} is duplicate", split.vbucket_id),
            );
        }
        max = i64::from(split.vbucket_id);
    }

    let Some(bucket) = state.bucket.upgrade() else {
        return Response::error(Status::Einval, "error split-range, bucket is gone");
    };

    let resume = |held: Vec<Partition>| async move {
        for dst in held {
            let _ = dst.apply(|st| st.suspended = false).await;
        }
    };

    // Acquisition pass: ascending vbid order prevents deadlock between
    // two concurrent splits with overlapping destinations.
    let mut held: Vec<Partition> = Vec::with_capacity(splits.len());
    for split in &splits {
        let vbid = split.vbucket_id as PartitionId;
        let dst = bucket.create_or_get_partition(vbid);
        let acquired = dst
            .apply(|st| {
                if st.state == VBucketState::Dead && !st.suspended {
                    st.suspended = true;
                    true
                } else {
                    false
                }
            })
            .await;
        if acquired != Some(true) {
            resume(held).await;
            return Response::error(
                Status::Einval,
                format!("error split-range, vbucket: {vbid}, state not initially dead"),
            );
        }
        held.push(dst);
    }

    // Copy pass: every destination is held, so each just takes its range.
    for (split, dst) in splits.iter().zip(held.iter()) {
        let min = split.min_key_inclusive.clone();
        let max = split.max_key_exclusive.clone();
        let items: BTreeMap<Bytes, Arc<Item>> = state
            .items
            .iter()
            .filter(|(k, _)| key_in_range(k, &min, &max))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let changes: BTreeMap<u64, Arc<Item>> = state
            .changes
            .iter()
            .filter(|(_, item)| key_in_range(&item.key, &min, &max))
            .map(|(c, v)| (*c, v.clone()))
            .collect();
        let cas = state.cas;
        let vb_state = state.state;
        let config = PartitionConfig { min_key_inclusive: min, max_key_exclusive: max };

        let applied = dst
            .apply(move |st| {
                st.items = items;
                st.changes = changes;
                st.cas = cas;
                st.state = vb_state;
                st.config = Some(config);
            })
            .await;
        if applied.is_none() {
            let vbid = dst.vbid();
            resume(held).await;
            return Response::error(
                Status::Einval,
                format!("error split-range, vbucket {vbid} went away"),
            );
        }
    }

    resume(held).await;

    debug!(vbid = state.vbid, parts = splits.len(), "split-range transferred");
    state.items = BTreeMap::new();
    state.changes = BTreeMap::new();
    state.state = VBucketState::Dead;
    state.config = Some(PartitionConfig::default());
    Response::ok()
}

async fn handle_command(state: &mut PartitionState, cmd: Command) {
    state.stats.ops += 1;
    if let Some(bucket) = state.bucket.upgrade() {
        bucket.note_activity();
    }

    let Some(op) = OpCode::from_u8(cmd.req.opcode) else {
        state.stats.unknowns += 1;
        let _ = cmd.resp.send(Some(Response::error(
            Status::UnknownCommand,
            format!("unknown command {:#04x}", cmd.req.opcode),
        )));
        return;
    };

    match op {
        OpCode::Get | OpCode::GetK | OpCode::GetQ | OpCode::GetKQ => {
            let out = state.op_get(op, &cmd.req);
            finish(state, cmd, out);
        }
        OpCode::Set | OpCode::SetQ => {
            let out = state.op_set(op, &cmd.req);
            finish(state, cmd, out);
        }
        OpCode::Delete | OpCode::DeleteQ => {
            let out = state.op_delete(op, &cmd.req);
            finish(state, cmd, out);
        }
        OpCode::RGet => state.op_rget(cmd),
        OpCode::ChangesSince => state.op_changes_since(cmd),
        OpCode::GetVBucketConfig => {
            let out = state.op_get_config();
            finish(state, cmd, out);
        }
        OpCode::SetVBucketConfig => {
            let out = state.op_set_config(&cmd.req);
            finish(state, cmd, out);
        }
        OpCode::SplitRange => {
            let res = op_split_range(state, &cmd.req).await;
            let _ = cmd.resp.send(Some(res));
        }
    }
}

fn finish(
    state: &mut PartitionState,
    cmd: Command,
    out: (Option<Response>, Option<Mutation>),
) {
    let (res, mutation) = out;
    if let Some(mutation) = mutation {
        state.publish_mutation(mutation);
    }
    let _ = cmd.resp.send(res);
}

/// Services only the apply channel until the suspended flag clears.
/// Returns `false` when the actor should stop.
async fn service_suspended(
    state: &mut PartitionState,
    apply_rx: &mut mpsc::Receiver<ApplyFn>,
) -> bool {
    while let Some(f) = apply_rx.recv().await {
        f(state);
        if state.closed {
            return false;
        }
        if !state.suspended {
            return true;
        }
    }
    false
}

async fn run_actor(
    mut state: PartitionState,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut apply_rx: mpsc::Receiver<ApplyFn>,
) {
    loop {
        tokio::select! {
            applied = apply_rx.recv() => match applied {
                Some(f) => {
                    f(&mut state);
                    if state.closed {
                        break;
                    }
                    if state.suspended && !service_suspended(&mut state, &mut apply_rx).await {
                        break;
                    }
                }
                None => break,
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => handle_command(&mut state, cmd).await,
                None => break,
            },
        }
    }
    debug!(vbid = state.vbid, "partition actor stopped");
}

/// Handle to a partition's actor. Cloning is cheap; the actor stops
/// when it is told to close or when every handle is dropped.
#[derive(Clone)]
pub struct Partition {
    vbid: PartitionId,
    cmd_tx: mpsc::Sender<Command>,
    apply_tx: mpsc::Sender<ApplyFn>,
    observer: Broadcaster<Mutation>,
    pub(crate) staleness: Arc<AtomicI64>,
    pub(crate) views_lock: Arc<tokio::sync::Mutex<()>>,
    pub(crate) bucket: Weak<BucketInner>,
}

impl Partition {
    /// Spawns a partition actor in the `Dead` state.
    pub(crate) fn spawn(vbid: PartitionId, bucket: Weak<BucketInner>) -> Partition {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (apply_tx, apply_rx) = mpsc::channel(APPLY_CHANNEL_DEPTH);
        let observer = Broadcaster::new(MUTATION_BROADCAST_BUFFER);
        let staleness = Arc::new(AtomicI64::new(0));
        let views_lock = Arc::new(tokio::sync::Mutex::new(()));
        let (available, _) = watch::channel(());

        let state = PartitionState {
            vbid,
            items: BTreeMap::new(),
            changes: BTreeMap::new(),
            cas: 0,
            state: VBucketState::Dead,
            config: None,
            stats: PartitionStats::default(),
            suspended: false,
            closed: false,
            views_store: None,
            bucket: bucket.clone(),
            observer: observer.clone(),
            staleness: staleness.clone(),
            views_lock: views_lock.clone(),
            available,
            self_cmd: cmd_tx.downgrade(),
            self_apply: apply_tx.downgrade(),
        };
        tokio::spawn(run_actor(state, cmd_rx, apply_rx));

        Partition { vbid, cmd_tx, apply_tx, observer, staleness, views_lock, bucket }
    }

    /// Partition id.
    pub fn vbid(&self) -> PartitionId {
        self.vbid
    }

    /// Runs `f` under actor identity and returns its result, or `None`
    /// if the actor has stopped.
    pub async fn apply<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut PartitionState) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let boxed: ApplyFn = Box::new(move |state| {
            let _ = tx.send(f(state));
        });
        self.apply_tx.send(boxed).await.ok()?;
        rx.await.ok()
    }

    /// Dispatches a request and awaits its response. `None` means a
    /// quiet opcode suppressed the response (or the actor is gone).
    pub async fn dispatch(&self, req: Request) -> Option<Response> {
        self.dispatch_inner(req, None).await
    }

    /// Dispatches a streaming request; per-record responses go to
    /// `sink`, and the returned response is the stream terminator.
    pub async fn dispatch_stream(
        &self,
        req: Request,
        sink: mpsc::Sender<Response>,
    ) -> Option<Response> {
        self.dispatch_inner(req, Some(sink)).await
    }

    async fn dispatch_inner(
        &self,
        req: Request,
        sink: Option<mpsc::Sender<Response>>,
    ) -> Option<Response> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx.send(Command { req, sink, resp }).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Convenience read of one key.
    pub async fn get(&self, key: impl Into<Bytes>) -> Option<Response> {
        self.dispatch(Request::new(OpCode::Get, key)).await
    }

    /// Stops servicing the command channel until [`resume`](Self::resume).
    pub async fn suspend(&self) {
        let _ = self.apply(|state| state.suspended = true).await;
    }

    /// Resumes command servicing.
    pub async fn resume(&self) {
        let _ = self.apply(|state| state.suspended = false).await;
    }

    /// Current operational state.
    pub async fn state(&self) -> Option<VBucketState> {
        self.apply(|state| state.vb_state()).await
    }

    /// Sets the operational state, returning the previous one.
    pub async fn set_state(&self, new: VBucketState) -> Option<VBucketState> {
        self.apply(move |state| state.set_vb_state(new)).await
    }

    /// Snapshot of the operation counters.
    pub async fn stats(&self) -> Option<PartitionStats> {
        self.apply(|state| state.stats.clone()).await
    }

    /// Accumulates this partition's counters into `dest` if it is
    /// active. The opaque `_key` selector is accepted and ignored.
    pub async fn add_stats(&self, dest: &mut PartitionStats, _key: &str) {
        let snapshot = self
            .apply(|state| {
                (state.vb_state() == VBucketState::Active).then(|| state.stats.clone())
            })
            .await;
        if let Some(Some(stats)) = snapshot {
            dest.add(&stats);
        }
    }

    /// Subscribes to this partition's mutation events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Mutation> {
        self.observer.subscribe()
    }

    /// Unindexed mutations pending for this partition.
    pub fn staleness(&self) -> i64 {
        self.staleness.load(AtomicOrdering::SeqCst)
    }

    /// Tells the actor to stop after the in-flight message.
    pub async fn close(&self) {
        let _ = self.apply(|state| state.closed = true).await;
    }
}

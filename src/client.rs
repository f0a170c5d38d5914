//! The request multiplexer.
//!
//! One `Client` owns the whole per-process client state: the coordinator
//! link, the adopted topology snapshot, one channel per storage instance,
//! and the queue of in-flight operations. Submissions route, enqueue, and
//! eagerly send; `flush` runs readiness cycles until every queued
//! operation has retired through its continuation.
//!
//! The model is single-threaded cooperative. Continuations run
//! synchronously inside `flush` (or inside a failed submission); they may
//! submit further operations but must not call `flush` again.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::coord::{CoordLink, LinkError, TcpCoordLink};
use crate::error::ClientError;
use crate::frame::{self, MessageType, ReplyRead};
use crate::hash::key_hash64;
use crate::pending::{GetCallback, MutateCallback, OpRoute, PendingGet, PendingMutate, PendingOp};
use crate::topology::TopologySnapshot;
use crate::types::{Instance, RegionId, Status};
use crate::wire::{Bitfield, put_byte_string, put_value_list};

/// Reconnect attempts per readiness cycle before `flush` gives up on the
/// coordinator. The classification of the final failed attempt wins.
const COORD_RETRIES: usize = 7;

struct ClientInner {
    coord: Box<dyn CoordLink>,
    topology: TopologySnapshot,
    channels: HashMap<Instance, Rc<Channel>>,
    /// In-flight operations in submission order. `None` is a tombstone for
    /// an entry that retired mid-cycle; the head is compacted after each
    /// cycle.
    queue: VecDeque<Option<Box<dyn PendingOp>>>,
    max_frame_bytes: usize,
    initialized: bool,
    flushing: bool,
}

/// Handle to one client instance. Clones share state, so a continuation
/// may capture a clone and submit follow-up operations from inside
/// `flush`.
#[derive(Clone)]
pub struct Client {
    inner: Rc<RefCell<ClientInner>>,
}

enum OpKind {
    Get(GetCallback),
    Mutate(MessageType, MutateCallback),
}

impl OpKind {
    fn fail(self, status: Status) {
        match self {
            OpKind::Get(callback) => callback(status, Vec::new()),
            OpKind::Mutate(_, callback) => callback(status),
        }
    }
}

enum SubmitOutcome {
    Sent,
    /// Refused before anything reached the wire.
    Refused(OpKind, Status),
    /// The eager send died; the entry was removed again and the pending
    /// retires with a disconnect.
    SendFailed(Box<dyn PendingOp>),
}

enum SlotAction {
    Skip,
    Retire(Box<dyn PendingOp>, Status),
    Deliver(Box<dyn PendingOp>, usize, u8, Bytes),
}

impl Client {
    pub fn new(mut coord: Box<dyn CoordLink>, config: &ClientConfig) -> Self {
        coord.set_announce(&config.announce);
        Self {
            inner: Rc::new(RefCell::new(ClientInner {
                coord,
                topology: TopologySnapshot::default(),
                channels: HashMap::new(),
                queue: VecDeque::new(),
                max_frame_bytes: config.max_frame_bytes,
                initialized: false,
                flushing: false,
            })),
        }
    }

    /// Connect a [`TcpCoordLink`] to the configured coordinator.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(Box::new(TcpCoordLink::new(config.coordinator)), config)
    }

    /// Bring the coordinator link up and adopt the first topology
    /// snapshot. Idempotent after the first success.
    pub fn connect(&self) -> Result<(), ClientError> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        if inner.initialized {
            return Ok(());
        }

        match inner.coord.connect() {
            Ok(()) => {}
            Err(LinkError::Connect(err)) => {
                return Err(ClientError::Coordinator(format!("connect failed: {err}")));
            }
            Err(err) => return Err(ClientError::Logic(err.to_string())),
        }

        loop {
            if let Err(err) = inner.coord.step(1, None) {
                return Err(link_class(err));
            }
            if inner.coord.unacknowledged() {
                inner.topology = inner.coord.snapshot().clone();
                inner.coord.acknowledge();
                info!(version = inner.topology.version(), "adopted initial topology");
                break;
            }
        }

        inner.initialized = true;
        Ok(())
    }

    /// Read the values stored under `key`. The continuation receives the
    /// values only on [`Status::Success`]; otherwise the list is empty.
    pub fn get(
        &self,
        space: &str,
        key: impl Into<Bytes>,
        callback: impl FnOnce(Status, Vec<Bytes>) + 'static,
    ) {
        let key = key.into();
        let mut body = Vec::new();
        put_byte_string(&mut body, &key);
        self.add_reqrep(
            space,
            &key,
            MessageType::ReqGet,
            body,
            OpKind::Get(Box::new(callback)),
        );
    }

    /// Store `values` under `key`, replacing the whole row.
    pub fn put(
        &self,
        space: &str,
        key: impl Into<Bytes>,
        values: Vec<Bytes>,
        callback: impl FnOnce(Status) + 'static,
    ) {
        let key = key.into();
        let mut body = Vec::new();
        put_byte_string(&mut body, &key);
        put_value_list(&mut body, &values);
        self.add_reqrep(
            space,
            &key,
            MessageType::ReqPut,
            body,
            OpKind::Mutate(MessageType::RespPut, Box::new(callback)),
        );
    }

    /// Delete the row stored under `key`.
    pub fn del(&self, space: &str, key: impl Into<Bytes>, callback: impl FnOnce(Status) + 'static) {
        let key = key.into();
        let mut body = Vec::new();
        put_byte_string(&mut body, &key);
        self.add_reqrep(
            space,
            &key,
            MessageType::ReqDel,
            body,
            OpKind::Mutate(MessageType::RespDel, Box::new(callback)),
        );
    }

    /// Overwrite a subset of the row's attributes by name. Names that are
    /// not dimensions of the space fail with [`Status::BadDimension`]
    /// before anything reaches the network.
    pub fn update(
        &self,
        space: &str,
        key: impl Into<Bytes>,
        values: BTreeMap<String, Bytes>,
        callback: impl FnOnce(Status) + 'static,
    ) {
        let key = key.into();
        let prepared = {
            let inner = self.inner.borrow();
            build_update_body(&inner.topology, space, &key, &values)
        };
        match prepared {
            Err(status) => callback(status),
            Ok(body) => self.add_reqrep(
                space,
                &key,
                MessageType::ReqUpdate,
                body,
                OpKind::Mutate(MessageType::RespUpdate, Box::new(callback)),
            ),
        }
    }

    /// Operations still awaiting a terminal event.
    pub fn pending_ops(&self) -> usize {
        self.inner
            .borrow()
            .queue
            .iter()
            .filter(|entry| entry.is_some())
            .count()
    }

    fn add_reqrep(
        &self,
        space: &str,
        key: &Bytes,
        send_type: MessageType,
        body: Vec<u8>,
        op: OpKind,
    ) {
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            submit(&mut inner, space, key, send_type, &body, op)
        };
        // The interior borrow is released before any continuation runs.
        match outcome {
            SubmitOutcome::Sent => {}
            SubmitOutcome::Refused(op, status) => op.fail(status),
            SubmitOutcome::SendFailed(pending) => pending.complete(Status::Disconnect),
        }
    }

    /// Drain the pending queue: every queued operation retires through its
    /// continuation before this returns `Ok`. Must not be called from a
    /// continuation.
    pub fn flush(&self) -> Result<(), ClientError> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.flushing {
                return Err(ClientError::Logic(
                    "flush re-entered from a continuation".to_string(),
                ));
            }
            inner.flushing = true;
        }
        let result = self.run_cycles();
        self.inner.borrow_mut().flushing = false;
        result
    }

    fn run_cycles(&self) -> Result<(), ClientError> {
        loop {
            if self.inner.borrow().queue.is_empty() {
                return Ok(());
            }

            self.ensure_coordinator()?;

            // Operations still holding a channel that died in an earlier
            // cycle retire now, before they could stall the readiness
            // wait.
            let stragglers = self.sweep_failed_channels();
            if !stragglers.is_empty() {
                for pending in stragglers {
                    pending.complete(Status::Disconnect);
                }
                self.compact_head();
                continue;
            }

            // One readiness slot per live pending, the coordinator last.
            let slots: Vec<(usize, Rc<Channel>)> = {
                let inner = self.inner.borrow();
                inner
                    .queue
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, entry)| {
                        entry
                            .as_ref()
                            .map(|p| (idx, Rc::clone(&p.route().chan)))
                    })
                    .collect()
            };

            let mut revents: Vec<PollFlags> = Vec::with_capacity(slots.len() + 1);
            {
                let inner = self.inner.borrow();
                let Some(coord_fd) = inner.coord.readiness_fd() else {
                    return Err(ClientError::Logic(
                        "coordinator link exposes no readiness handle".to_string(),
                    ));
                };
                let mut pfds: Vec<PollFd> = slots
                    .iter()
                    .map(|(_, chan)| PollFd::new(chan.stream().as_fd(), PollFlags::POLLIN))
                    .collect();
                pfds.push(PollFd::new(coord_fd, PollFlags::POLLIN));

                poll(&mut pfds, PollTimeout::NONE)
                    .map_err(|err| ClientError::Logic(format!("readiness wait failed: {err}")))?;
                for pfd in &pfds {
                    revents.push(pfd.revents().unwrap_or(PollFlags::empty()));
                }
            }
            let coord_ready = !revents
                .pop()
                .unwrap_or(PollFlags::empty())
                .is_empty();

            // Coordinator first: a topology change invalidates routing
            // decisions, so it preempts per-channel work this cycle.
            if coord_ready {
                let mut inner = self.inner.borrow_mut();
                if let Err(err) = inner.coord.step(1, Some(Duration::ZERO)) {
                    return Err(link_class(err));
                }
            }
            if let Some(reassigned) = self.adopt_topology() {
                for pending in reassigned {
                    warn!(
                        instance = %pending.route().instance,
                        nonce = pending.route().nonce,
                        "destination reassigned by new topology"
                    );
                    pending.complete(Status::Reconfigure);
                }
                self.compact_head();
                continue;
            }

            for (slot, (qidx, chan)) in slots.iter().enumerate() {
                let action = self.process_slot(*qidx, chan, revents[slot]);
                match action {
                    SlotAction::Skip => {}
                    SlotAction::Retire(pending, status) => pending.complete(status),
                    SlotAction::Deliver(pending, at, reply_type, body) => {
                        if let Some(next) = pending.deliver(Status::Success, reply_type, body) {
                            self.inner.borrow_mut().queue[at] = Some(next);
                        }
                    }
                }
            }

            self.compact_head();
        }
    }

    fn ensure_coordinator(&self) -> Result<(), ClientError> {
        let mut inner = self.inner.borrow_mut();
        for attempt in 1..=COORD_RETRIES {
            if inner.coord.connected() {
                break;
            }
            match inner.coord.connect() {
                Ok(()) => {}
                Err(err) => {
                    warn!(attempt, error = %err, "coordinator reconnect failed");
                    if attempt == COORD_RETRIES {
                        return Err(link_class(err));
                    }
                }
            }
        }
        Ok(())
    }

    /// Adopt an unacknowledged snapshot and pull out every live pending
    /// whose destination it invalidated.
    fn adopt_topology(&self) -> Option<Vec<Box<dyn PendingOp>>> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        if !inner.coord.unacknowledged() {
            return None;
        }
        inner.topology = inner.coord.snapshot().clone();
        inner.coord.acknowledge();
        info!(version = inner.topology.version(), "adopted topology snapshot");

        let mut reassigned = Vec::new();
        for entry in inner.queue.iter_mut() {
            let stale = entry.as_ref().is_some_and(|p| {
                inner.topology.instance_for(&p.route().entity) != Some(p.route().instance)
            });
            if stale && let Some(pending) = entry.take() {
                reassigned.push(pending);
            }
        }
        Some(reassigned)
    }

    fn sweep_failed_channels(&self) -> Vec<Box<dyn PendingOp>> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let mut dead = Vec::new();
        for entry in inner.queue.iter_mut() {
            let failed = entry
                .as_ref()
                .is_some_and(|p| p.route().chan.is_failed());
            if failed && let Some(pending) = entry.take() {
                evict(&mut inner.channels, &pending.route().chan, pending.route().instance);
                dead.push(pending);
            }
        }
        dead
    }

    fn process_slot(&self, qidx: usize, chan: &Rc<Channel>, events: PollFlags) -> SlotAction {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;

        let instance = match inner.queue.get(qidx).and_then(|e| e.as_ref()) {
            Some(pending) => pending.route().instance,
            // Retired earlier this cycle by a reply on a sibling slot.
            None => return SlotAction::Skip,
        };

        if chan.is_failed() {
            evict(&mut inner.channels, chan, instance);
            return match inner.queue[qidx].take() {
                Some(pending) => SlotAction::Retire(pending, Status::Disconnect),
                None => SlotAction::Skip,
            };
        }

        if events.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
            warn!(instance = %instance, "channel hangup");
            chan.fail();
            evict(&mut inner.channels, chan, instance);
            return match inner.queue[qidx].take() {
                Some(pending) => SlotAction::Retire(pending, Status::Disconnect),
                None => SlotAction::Skip,
            };
        }

        if !events.contains(PollFlags::POLLIN) {
            return SlotAction::Skip;
        }

        match frame::read_reply(chan.stream(), inner.max_frame_bytes) {
            Ok(ReplyRead::NotReady) => SlotAction::Skip,
            Err(err) => {
                warn!(instance = %instance, error = %err, "reply read failed");
                chan.fail();
                evict(&mut inner.channels, chan, instance);
                match inner.queue[qidx].take() {
                    Some(pending) => SlotAction::Retire(pending, Status::Disconnect),
                    None => SlotAction::Skip,
                }
            }
            Ok(ReplyRead::Frame { header, body }) => {
                chan.learn_id(header.to);

                let matched = inner.queue.iter().position(|entry| {
                    entry.as_ref().is_some_and(|p| {
                        let route = p.route();
                        Rc::ptr_eq(&route.chan, chan)
                            && header.from_version == route.instance.inbound_version
                            && header.to_version == 0
                            && header.from == route.entity
                            && header.to == chan.id()
                            && header.nonce == route.nonce
                    })
                });
                match matched {
                    Some(at) => match inner.queue[at].take() {
                        Some(pending) => {
                            debug!(instance = %instance, nonce = header.nonce, "reply dispatched");
                            SlotAction::Deliver(pending, at, header.msg_type, body)
                        }
                        None => SlotAction::Skip,
                    },
                    None => {
                        debug!(
                            instance = %instance,
                            nonce = header.nonce,
                            "reply matched no pending; dropped"
                        );
                        SlotAction::Skip
                    }
                }
            }
        }
    }

    fn compact_head(&self) {
        let mut inner = self.inner.borrow_mut();
        while matches!(inner.queue.front(), Some(None)) {
            inner.queue.pop_front();
        }
    }
}

fn submit(
    inner: &mut ClientInner,
    space: &str,
    key: &Bytes,
    send_type: MessageType,
    body: &[u8],
    op: OpKind,
) -> SubmitOutcome {
    let Some(space_id) = inner.topology.space_id(space) else {
        return SubmitOutcome::Refused(op, Status::NotASpace);
    };

    let region = RegionId::point_leader(space_id, key_hash64(key));
    let Some(entity) = inner.topology.head_of(region) else {
        warn!(space, region = %region, "no region head for key");
        return SubmitOutcome::Refused(op, Status::ConnectFail);
    };
    let Some(instance) = inner.topology.instance_for(&entity) else {
        warn!(space, entity = %entity, "region head has no live instance");
        return SubmitOutcome::Refused(op, Status::ConnectFail);
    };

    let chan = match inner.channels.get(&instance) {
        Some(chan) => Rc::clone(chan),
        None => match Channel::open(instance) {
            Ok(chan) => {
                let chan = Rc::new(chan);
                inner.channels.insert(instance, Rc::clone(&chan));
                chan
            }
            Err(err) => {
                warn!(instance = %instance, error = %err, "channel open failed");
                return SubmitOutcome::Refused(op, Status::ConnectFail);
            }
        },
    };

    let nonce = chan.assign_nonce();
    let request = frame::encode_request(
        send_type,
        &chan.id(),
        &entity,
        instance.inbound_version,
        nonce,
        body,
    );
    debug!(
        space,
        request = send_type.as_str(),
        instance = %instance,
        nonce,
        "operation submitted"
    );

    let route = OpRoute {
        chan: Rc::clone(&chan),
        entity,
        instance,
        nonce,
    };
    let pending: Box<dyn PendingOp> = match op {
        OpKind::Get(callback) => Box::new(PendingGet::new(route, callback)),
        OpKind::Mutate(expected, callback) => Box::new(PendingMutate::new(route, expected, callback)),
    };
    inner.queue.push_back(Some(pending));

    if let Err(err) = write_frame(chan.stream(), &request) {
        warn!(instance = %instance, error = %err, "eager send failed");
        chan.fail();
        evict(&mut inner.channels, &chan, instance);
        // The entry appended just above comes straight back off the tail;
        // nothing else can have appended in between.
        if let Some(pending) = inner.queue.pop_back().flatten() {
            return SubmitOutcome::SendFailed(pending);
        }
    }
    SubmitOutcome::Sent
}

fn build_update_body(
    topology: &TopologySnapshot,
    space: &str,
    key: &Bytes,
    values: &BTreeMap<String, Bytes>,
) -> Result<Vec<u8>, Status> {
    let Some(space_id) = topology.space_id(space) else {
        return Err(Status::NotASpace);
    };
    let Some(dimensions) = topology.dimensions(space_id) else {
        return Err(Status::NotASpace);
    };

    // One bit and one dense slot per non-key dimension; absent attributes
    // stay unset with an empty value.
    let arity = dimensions.len().saturating_sub(1);
    let mut bits = Bitfield::new(arity);
    let mut dense: Vec<Bytes> = vec![Bytes::new(); arity];
    for (position, name) in dimensions.iter().enumerate().skip(1) {
        if let Some(value) = values.get(name) {
            bits.set(position - 1);
            dense[position - 1] = value.clone();
        }
    }

    for name in values.keys() {
        if !dimensions[1..].iter().any(|dim| dim == name) {
            return Err(Status::BadDimension);
        }
    }

    let mut body = Vec::new();
    put_byte_string(&mut body, key);
    bits.encode(&mut body);
    put_value_list(&mut body, &dense);
    Ok(body)
}

fn write_frame(stream: &TcpStream, request: &[u8]) -> std::io::Result<()> {
    let mut writer = stream;
    writer.write_all(request)
}

fn evict(channels: &mut HashMap<Instance, Rc<Channel>>, chan: &Rc<Channel>, instance: Instance) {
    // A continuation may already have replaced the dead channel with a
    // fresh one to the same instance; only evict our own.
    if channels
        .get(&instance)
        .is_some_and(|current| Rc::ptr_eq(current, chan))
    {
        channels.remove(&instance);
    }
}

fn link_class(err: LinkError) -> ClientError {
    match err {
        LinkError::Connect(err) => ClientError::Coordinator(format!("connect failed: {err}")),
        LinkError::Disconnect(reason) => ClientError::Coordinator(reason),
        LinkError::Shutdown => ClientError::Logic("coordinator shut down".to_string()),
        LinkError::Logic(reason) => ClientError::Logic(reason),
    }
}

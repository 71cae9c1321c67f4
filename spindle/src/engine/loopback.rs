use crate::engine::{
    Address, BulkAccess, BulkBuffer, BulkOp, EngineCompletion, EngineError, EngineEvent,
    EngineOp, Envelope, LOOPBACK_PROTOCOL, NetworkEngine, RemoteRegion,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

/// In-process network: a namespace of endpoints and the bulk regions they
/// expose. Engines bound to the same fabric can reach each other.
#[derive(Debug, Default)]
pub struct Fabric {
    endpoints: DashMap<String, Arc<Endpoint>>,
    regions: DashMap<u64, Region>,
    next_region: AtomicU64,
    next_anonymous: AtomicU64,
}

#[derive(Debug, Clone)]
struct Region {
    owner: String,
    buffer: BulkBuffer,
    access: BulkAccess,
}

impl Fabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The fabric `loopback://` addresses resolve against.
    pub fn global() -> Arc<Self> {
        static GLOBAL: LazyLock<Arc<Fabric>> = LazyLock::new(Fabric::new);
        Arc::clone(&GLOBAL)
    }

    pub fn num_endpoints(&self) -> usize {
        self.endpoints.len()
    }

    fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(name).map(|e| Arc::clone(e.value()))
    }

    fn region(&self, id: u64) -> Result<Region, EngineError> {
        self.regions
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::InvalidRegion(id))
    }

    fn transfer(
        &self,
        op: BulkOp,
        local: &RemoteRegion,
        local_offset: usize,
        remote: &RemoteRegion,
        remote_offset: usize,
        size: usize,
    ) -> Result<usize, EngineError> {
        let local_region = self.region(local.id)?;
        let remote_region = self.region(remote.id)?;

        let (src, src_offset, dst, dst_offset) = match op {
            BulkOp::Pull => {
                if !remote_region.access.readable() {
                    return Err(EngineError::AccessDenied(remote.id));
                }
                (remote_region, remote_offset, local_region, local_offset)
            }
            BulkOp::Push => {
                if !remote_region.access.writable() {
                    return Err(EngineError::AccessDenied(remote.id));
                }
                (local_region, local_offset, remote_region, remote_offset)
            }
        };

        // Copy out first so a region transferring onto itself never holds two
        // locks on the same buffer.
        let bytes = {
            let src = src.buffer.lock();
            check_bounds(src_offset, size, src.len())?;
            src[src_offset..src_offset + size].to_vec()
        };

        let mut dst = dst.buffer.lock();
        check_bounds(dst_offset, size, dst.len())?;
        dst[dst_offset..dst_offset + size].copy_from_slice(&bytes);

        Ok(size)
    }
}

fn check_bounds(offset: usize, size: usize, len: usize) -> Result<(), EngineError> {
    match offset.checked_add(size) {
        Some(end) if end <= len => Ok(()),
        _ => Err(EngineError::OutOfBounds { offset, size, len }),
    }
}

#[derive(Debug)]
struct Endpoint {
    queue: Mutex<Queue>,
    ready: Condvar,
}

#[derive(Debug, Default)]
struct Queue {
    completions: VecDeque<EngineCompletion>,

    /// Inbound messages with the instant they become deliverable.
    inbox: VecDeque<(Instant, Envelope)>,

    /// Receive buffers posted by the owner, consumed one per message.
    posted: VecDeque<(EngineOp, u64)>,

    interrupted: bool,

    closed: bool,
}

impl Queue {
    fn deliver(&mut self, now: Instant) {
        while !self.posted.is_empty() && self.inbox.front().is_some_and(|(at, _)| *at <= now) {
            let (Some((op, token)), Some((_, envelope))) =
                (self.posted.pop_front(), self.inbox.pop_front())
            else {
                break;
            };

            self.completions.push_back(EngineCompletion {
                op,
                token,
                event: EngineEvent::Received(envelope),
            });
        }
    }

    fn next_delivery(&self) -> Option<Instant> {
        if self.posted.is_empty() {
            return None;
        }
        self.inbox.front().map(|(at, _)| *at)
    }
}

impl Endpoint {
    fn new() -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
        }
    }

    fn push_completion(&self, completion: EngineCompletion) {
        self.queue.lock().completions.push_back(completion);
        self.ready.notify_all();
    }

    /// Returns false if the endpoint is closed.
    fn push_inbound(&self, at: Instant, envelope: Envelope) -> bool {
        let mut queue = self.queue.lock();
        if queue.closed {
            return false;
        }
        queue.inbox.push_back((at, envelope));
        drop(queue);

        self.ready.notify_all();
        true
    }
}

/// A [`NetworkEngine`] bound to one endpoint of a [`Fabric`].
#[derive(Debug)]
pub struct LoopbackEngine {
    fabric: Arc<Fabric>,
    name: String,
    endpoint: Arc<Endpoint>,
    latency: Duration,
    next_op: AtomicU64,
}

impl LoopbackEngine {
    /// Binds `name` on `fabric`. An empty name picks a unique anonymous one.
    pub fn bind(fabric: &Arc<Fabric>, name: &str) -> Result<Self, EngineError> {
        let name = if name.is_empty() {
            let n = fabric.next_anonymous.fetch_add(1, Ordering::Relaxed);
            format!("anonymous-{n}")
        } else {
            name.to_string()
        };

        let endpoint = Arc::new(Endpoint::new());
        match fabric.endpoints.entry(name.clone()) {
            Entry::Occupied(_) => return Err(EngineError::AddressInUse(name)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&endpoint));
            }
        }

        Ok(Self {
            fabric: Arc::clone(fabric),
            name,
            endpoint,
            latency: Duration::ZERO,
            next_op: AtomicU64::new(1),
        })
    }

    /// Delays delivery of every message this engine sends.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn next_op(&self) -> EngineOp {
        EngineOp(self.next_op.fetch_add(1, Ordering::Relaxed))
    }

    fn resolve(&self, target: &Address) -> Option<Arc<Endpoint>> {
        let protocol = target.as_str().split_once("://").map(|(p, _)| p);
        if protocol != Some(LOOPBACK_PROTOCOL) {
            return None;
        }
        self.fabric.endpoint(target.name())
    }
}

impl NetworkEngine for LoopbackEngine {
    fn self_address(&self) -> Address {
        Address::new(LOOPBACK_PROTOCOL, &self.name)
    }

    fn lookup(&self, name: &str) -> Result<Address, EngineError> {
        let name = name
            .strip_prefix(LOOPBACK_PROTOCOL)
            .and_then(|rest| rest.strip_prefix("://"))
            .unwrap_or(name);

        if self.fabric.endpoints.contains_key(name) {
            Ok(Address::new(LOOPBACK_PROTOCOL, name))
        } else {
            Err(EngineError::UnknownAddress(name.to_string()))
        }
    }

    fn submit_send(
        &self,
        envelope: Envelope,
        target: &Address,
        token: u64,
    ) -> Result<EngineOp, EngineError> {
        if self.endpoint.queue.lock().closed {
            return Err(EngineError::Closed);
        }

        let op = self.next_op();
        let delivered = self
            .resolve(target)
            .is_some_and(|peer| peer.push_inbound(Instant::now() + self.latency, envelope));

        // Delivery failures surface asynchronously, like a real transport.
        let result = if delivered {
            Ok(())
        } else {
            Err(EngineError::Unreachable(target.to_string()))
        };

        self.endpoint.push_completion(EngineCompletion {
            op,
            token,
            event: EngineEvent::Sent(result),
        });

        Ok(op)
    }

    fn submit_receive_buffer(&self, token: u64) -> Result<EngineOp, EngineError> {
        let op = self.next_op();

        let mut queue = self.endpoint.queue.lock();
        if queue.closed {
            return Err(EngineError::Closed);
        }
        queue.posted.push_back((op, token));
        drop(queue);

        self.endpoint.ready.notify_all();
        Ok(op)
    }

    fn poll(&self, timeout: Duration) -> Result<Vec<EngineCompletion>, EngineError> {
        // `None` when the timeout does not fit in an instant: wait until woken.
        let deadline = Instant::now().checked_add(timeout);
        let mut queue = self.endpoint.queue.lock();

        loop {
            let now = Instant::now();
            queue.deliver(now);

            if !queue.completions.is_empty() {
                queue.interrupted = false;
                return Ok(queue.completions.drain(..).collect());
            }

            if queue.closed {
                return Err(EngineError::Closed);
            }

            if std::mem::take(&mut queue.interrupted) || deadline.is_some_and(|at| now >= at) {
                return Ok(Vec::new());
            }

            let wake_at = match (queue.next_delivery(), deadline) {
                (Some(at), Some(deadline)) => Some(at.min(deadline)),
                (at, deadline) => at.or(deadline),
            };
            match wake_at {
                Some(at) => {
                    self.endpoint.ready.wait_until(&mut queue, at);
                }
                None => self.endpoint.ready.wait(&mut queue),
            }
        }
    }

    fn cancel(&self, op: EngineOp) -> Result<(), EngineError> {
        let mut queue = self.endpoint.queue.lock();

        // Sends and transfers complete at submission, only posted receive
        // buffers can still be withdrawn.
        if let Some(pos) = queue.posted.iter().position(|(posted, _)| *posted == op) {
            if let Some((op, token)) = queue.posted.remove(pos) {
                queue.completions.push_back(EngineCompletion {
                    op,
                    token,
                    event: EngineEvent::Cancelled,
                });
            }
        }

        Ok(())
    }

    fn interrupt(&self) {
        self.endpoint.queue.lock().interrupted = true;
        self.endpoint.ready.notify_all();
    }

    fn register_region(
        &self,
        buffer: BulkBuffer,
        access: BulkAccess,
    ) -> Result<RemoteRegion, EngineError> {
        let id = self.fabric.next_region.fetch_add(1, Ordering::Relaxed);
        let len = buffer.lock().len();

        self.fabric.regions.insert(
            id,
            Region {
                owner: self.name.clone(),
                buffer,
                access,
            },
        );

        Ok(RemoteRegion {
            owner: self.self_address(),
            id,
            len,
            access,
        })
    }

    fn deregister_region(&self, region: &RemoteRegion) -> Result<(), EngineError> {
        self.fabric
            .regions
            .remove(&region.id)
            .map(|_| ())
            .ok_or(EngineError::InvalidRegion(region.id))
    }

    fn submit_transfer(
        &self,
        op: BulkOp,
        local: &RemoteRegion,
        local_offset: usize,
        remote: &RemoteRegion,
        remote_offset: usize,
        size: usize,
        token: u64,
    ) -> Result<EngineOp, EngineError> {
        if self.endpoint.queue.lock().closed {
            return Err(EngineError::Closed);
        }

        let engine_op = self.next_op();
        let result = self
            .fabric
            .transfer(op, local, local_offset, remote, remote_offset, size);

        self.endpoint.push_completion(EngineCompletion {
            op: engine_op,
            token,
            event: EngineEvent::Transferred(result),
        });

        Ok(engine_op)
    }

    fn close(&self) {
        let mut queue = self.endpoint.queue.lock();
        if std::mem::replace(&mut queue.closed, true) {
            return;
        }
        queue.posted.clear();
        queue.inbox.clear();
        drop(queue);
        self.endpoint.ready.notify_all();

        self.fabric
            .endpoints
            .remove_if(&self.name, |_, e| Arc::ptr_eq(e, &self.endpoint));
        self.fabric.regions.retain(|_, r| r.owner != self.name);
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcId;
    use anyhow::{Result, anyhow};

    fn request(origin: &LoopbackEngine, seq: u64, payload: &[u8]) -> Envelope {
        Envelope::Request {
            origin: origin.self_address(),
            rpc_id: RpcId::new(1),
            seq,
            payload: payload.to_vec(),
        }
    }

    fn drain(engine: &LoopbackEngine) -> Result<Vec<EngineCompletion>> {
        Ok(engine.poll(Duration::ZERO)?)
    }

    #[test]
    fn test_send_and_receive() -> Result<()> {
        let fabric = Fabric::new();
        let a = LoopbackEngine::bind(&fabric, "a")?;
        let b = LoopbackEngine::bind(&fabric, "b")?;

        b.submit_receive_buffer(99)?;
        let target = a.lookup("b")?;
        a.submit_send(request(&a, 5, b"hi"), &target, 7)?;

        let sent = drain(&a)?;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].token, 7);
        assert!(matches!(sent[0].event, EngineEvent::Sent(Ok(()))));

        let received = drain(&b)?;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].token, 99);
        match &received[0].event {
            EngineEvent::Received(Envelope::Request { seq, payload, .. }) => {
                assert_eq!(*seq, 5);
                assert_eq!(payload, b"hi");
            }
            other => return Err(anyhow!("unexpected event {other:?}")),
        }
        Ok(())
    }

    #[test]
    fn test_message_waits_for_receive_buffer() -> Result<()> {
        let fabric = Fabric::new();
        let a = LoopbackEngine::bind(&fabric, "a")?;
        let b = LoopbackEngine::bind(&fabric, "b")?;

        a.submit_send(request(&a, 1, b""), &a.lookup("b")?, 0)?;
        assert!(drain(&b)?.is_empty());

        b.submit_receive_buffer(1)?;
        assert_eq!(drain(&b)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_latency_delays_delivery() -> Result<()> {
        let fabric = Fabric::new();
        let a = LoopbackEngine::bind(&fabric, "a")?.with_latency(Duration::from_millis(30));
        let b = LoopbackEngine::bind(&fabric, "b")?;
        b.submit_receive_buffer(1)?;

        let start = Instant::now();
        a.submit_send(request(&a, 1, b""), &a.lookup("b")?, 0)?;
        assert!(drain(&b)?.is_empty());

        let received = b.poll(Duration::from_secs(2))?;
        assert_eq!(received.len(), 1);
        assert!(start.elapsed() >= Duration::from_millis(30));
        Ok(())
    }

    #[test]
    fn test_unreachable_peer_fails_asynchronously() -> Result<()> {
        let fabric = Fabric::new();
        let a = LoopbackEngine::bind(&fabric, "a")?;
        let b = LoopbackEngine::bind(&fabric, "b")?;
        let target = a.lookup("b")?;
        b.close();

        a.submit_send(request(&a, 1, b""), &target, 3)?;
        let sent = drain(&a)?;
        assert!(matches!(
            &sent[0].event,
            EngineEvent::Sent(Err(EngineError::Unreachable(_)))
        ));
        assert!(matches!(a.lookup("b"), Err(EngineError::UnknownAddress(_))));
        Ok(())
    }

    #[test]
    fn test_bind_twice_fails() -> Result<()> {
        let fabric = Fabric::new();
        let _a = LoopbackEngine::bind(&fabric, "a")?;
        assert!(matches!(
            LoopbackEngine::bind(&fabric, "a"),
            Err(EngineError::AddressInUse(_))
        ));
        Ok(())
    }

    #[test]
    fn test_interrupt_unblocks_poll() -> Result<()> {
        let fabric = Fabric::new();
        let a = Arc::new(LoopbackEngine::bind(&fabric, "a")?);

        let poller = Arc::clone(&a);
        let start = Instant::now();
        let handle = std::thread::spawn(move || poller.poll(Duration::from_secs(10)));

        std::thread::sleep(Duration::from_millis(20));
        a.interrupt();

        let completions = handle.join().map_err(|_| anyhow!("poller panicked"))??;
        assert!(completions.is_empty());
        assert!(start.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[test]
    fn test_unbounded_poll_waits_for_interrupt() -> Result<()> {
        let fabric = Fabric::new();
        let a = Arc::new(LoopbackEngine::bind(&fabric, "unbounded")?);

        let poller = Arc::clone(&a);
        let handle = std::thread::spawn(move || poller.poll(Duration::MAX));

        std::thread::sleep(Duration::from_millis(20));
        a.interrupt();

        let completions = handle.join().map_err(|_| anyhow!("poller panicked"))??;
        assert!(completions.is_empty());
        Ok(())
    }

    #[test]
    fn test_cancel_posted_receive() -> Result<()> {
        let fabric = Fabric::new();
        let a = LoopbackEngine::bind(&fabric, "a")?;
        let op = a.submit_receive_buffer(11)?;
        a.cancel(op)?;

        let completions = drain(&a)?;
        assert_eq!(completions.len(), 1);
        assert!(matches!(completions[0].event, EngineEvent::Cancelled));
        Ok(())
    }

    #[test]
    fn test_bulk_pull_and_push() -> Result<()> {
        let fabric = Fabric::new();
        let a = LoopbackEngine::bind(&fabric, "a")?;
        let b = LoopbackEngine::bind(&fabric, "b")?;

        let remote_buf: BulkBuffer = Arc::new(Mutex::new(b"abcdef".to_vec()));
        let local_buf: BulkBuffer = Arc::new(Mutex::new(vec![0; 4]));
        let remote = b.register_region(remote_buf.clone(), BulkAccess::ReadWrite)?;
        let local = a.register_region(local_buf.clone(), BulkAccess::ReadWrite)?;

        a.submit_transfer(BulkOp::Pull, &local, 0, &remote, 2, 4, 1)?;
        assert_eq!(&*local_buf.lock(), b"cdef");

        local_buf.lock().copy_from_slice(b"WXYZ");
        a.submit_transfer(BulkOp::Push, &local, 1, &remote, 0, 3, 2)?;
        assert_eq!(&*remote_buf.lock(), b"XYZdef");

        let done = drain(&a)?;
        assert!(
            done.iter()
                .all(|c| matches!(c.event, EngineEvent::Transferred(Ok(_))))
        );
        Ok(())
    }

    #[test]
    fn test_bulk_access_and_bounds_checked() -> Result<()> {
        let fabric = Fabric::new();
        let a = LoopbackEngine::bind(&fabric, "a")?;

        let read_only = a.register_region(Arc::new(Mutex::new(vec![1; 4])), BulkAccess::ReadOnly)?;
        let local = a.register_region(Arc::new(Mutex::new(vec![0; 4])), BulkAccess::ReadWrite)?;

        a.submit_transfer(BulkOp::Push, &local, 0, &read_only, 0, 4, 1)?;
        a.submit_transfer(BulkOp::Pull, &local, 2, &read_only, 0, 4, 2)?;

        let done = drain(&a)?;
        assert!(matches!(
            done[0].event,
            EngineEvent::Transferred(Err(EngineError::AccessDenied(_)))
        ));
        assert!(matches!(
            done[1].event,
            EngineEvent::Transferred(Err(EngineError::OutOfBounds { .. }))
        ));
        Ok(())
    }
}

//! Per-reactor idle-connection tracking: one bucket per distinct idle
//! threshold, each bucket a generational-arena-backed intrusive doubly
//! linked list ordered oldest-activity-first. Grounded on
//! `handy::event_base.cc`'s `idleConns_: map<int, list<IdleNode>>` plus the
//! Design Notes' call for "a generational index into an arena" as the
//! stable-handle strategy (`std::list`'s splice-preserving iterators have
//! no safe equivalent in stable-Rust std, so a slab with prev/next indices
//! plays the same role).

use std::collections::HashMap;

use crate::tcp_conn::TcpConnHandle;

type Slot = u32;
type Generation = u32;

/// A stable handle into a bucket, valid until `unregister` or the owning
/// `EventBase` is dropped. Invalidated (and safely ignored) if the slot was
/// reused in the meantime - the generation counter catches that.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdleId {
    pub bucket_seconds: i64,
    slot: Slot,
    generation: Generation,
}

struct Node {
    conn: TcpConnHandle,
    updated_seconds: i64,
    cb: Box<dyn FnMut(&TcpConnHandle)>,
    prev: Option<Slot>,
    next: Option<Slot>,
    generation: Generation,
    live: bool,
}

/// One idle-threshold bucket: a slab of nodes plus head/tail of the
/// intrusive list ordered oldest (head) to most-recently-touched (tail).
#[derive(Default)]
struct Bucket {
    nodes: Vec<Node>,
    free: Vec<Slot>,
    head: Option<Slot>,
    tail: Option<Slot>,
}

impl Bucket {
    fn push_tail(&mut self, conn: TcpConnHandle, updated_seconds: i64, cb: Box<dyn FnMut(&TcpConnHandle)>) -> (Slot, Generation) {
        let node = Node {
            conn,
            updated_seconds,
            cb,
            prev: self.tail,
            next: None,
            generation: 0,
            live: true,
        };
        let slot = if let Some(slot) = self.free.pop() {
            let gen = self.nodes[slot as usize].generation + 1;
            let mut node = node;
            node.generation = gen;
            self.nodes[slot as usize] = node;
            slot
        } else {
            let slot = self.nodes.len() as Slot;
            self.nodes.push(node);
            slot
        };
        if let Some(tail) = self.tail {
            self.nodes[tail as usize].next = Some(slot);
        } else {
            self.head = Some(slot);
        }
        self.tail = Some(slot);
        (slot, self.nodes[slot as usize].generation)
    }

    fn unlink(&mut self, slot: Slot) {
        let (prev, next) = {
            let n = &self.nodes[slot as usize];
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.nodes[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n as usize].prev = prev,
            None => self.tail = prev,
        }
    }

    fn splice_to_tail(&mut self, slot: Slot) {
        if self.tail == Some(slot) {
            return;
        }
        self.unlink(slot);
        let node = &mut self.nodes[slot as usize];
        node.prev = self.tail;
        node.next = None;
        if let Some(tail) = self.tail {
            self.nodes[tail as usize].next = Some(slot);
        } else {
            self.head = Some(slot);
        }
        self.tail = Some(slot);
    }

    fn remove(&mut self, slot: Slot) {
        self.unlink(slot);
        self.nodes[slot as usize].live = false;
        self.free.push(slot);
    }
}

#[derive(Default)]
pub struct IdleBuckets {
    buckets: HashMap<i64, Bucket>,
}

impl IdleBuckets {
    pub fn new() -> IdleBuckets {
        IdleBuckets::default()
    }

    pub fn register(
        &mut self,
        seconds: i64,
        conn: TcpConnHandle,
        now_seconds: i64,
        cb: Box<dyn FnMut(&TcpConnHandle)>,
    ) -> IdleId {
        let bucket = self.buckets.entry(seconds).or_default();
        let (slot, generation) = bucket.push_tail(conn, now_seconds, cb);
        IdleId {
            bucket_seconds: seconds,
            slot,
            generation,
        }
    }

    pub fn unregister(&mut self, id: IdleId) {
        if let Some(bucket) = self.buckets.get_mut(&id.bucket_seconds) {
            if let Some(node) = bucket.nodes.get(id.slot as usize) {
                if node.live && node.generation == id.generation {
                    bucket.remove(id.slot);
                }
            }
        }
    }

    pub fn update(&mut self, id: IdleId, now_seconds: i64) {
        if let Some(bucket) = self.buckets.get_mut(&id.bucket_seconds) {
            if let Some(node) = bucket.nodes.get_mut(id.slot as usize) {
                if node.live && node.generation == id.generation {
                    node.updated_seconds = now_seconds;
                    bucket.splice_to_tail(id.slot);
                }
            }
        }
    }

    /// Sweeps every bucket, invoking the callback for each node whose last
    /// activity is at least that bucket's threshold old, refreshing and
    /// splicing it to the tail as it goes (mirroring `callIdles`'s
    /// "pretend this was just touched" behavior so a node isn't fired every
    /// tick until its connection produces real activity).
    pub fn sweep(&mut self, now_seconds: i64) {
        for (seconds, bucket) in self.buckets.iter_mut() {
            loop {
                let Some(head) = bucket.head else { break };
                let node = &bucket.nodes[head as usize];
                if node.updated_seconds + seconds > now_seconds {
                    break;
                }
                bucket.nodes[head as usize].updated_seconds = now_seconds;
                bucket.splice_to_tail(head);
                let conn = bucket.nodes[head as usize].conn.clone();
                (bucket.nodes[head as usize].cb)(&conn);
            }
        }
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|b| b.head.is_none())
    }
}

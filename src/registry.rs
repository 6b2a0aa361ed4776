//! The socket registry: an insertion-ordered doubly linked list plus a
//! direct-indexed id table, per §3/§4.2.
//!
//! Per the Design Note "Raw pointers in source / back-references", the
//! original's `next`/`prev` pointers become stored [`SocketId`]s and the
//! `referrer` weak back-pointer becomes `Option<SocketId>` validated
//! through `find(id, version)`.

use log::warn;

use crate::error::{Error, Result};
use crate::socket::{Generation, Socket, SocketFlags, SocketId, MAX_SOCKET_IDS};

struct Slot {
    socket: Socket,
    next: Option<SocketId>,
    prev: Option<SocketId>,
}

pub struct SocketRegistry {
    slots: Vec<Option<Slot>>,
    root: Option<SocketId>,
    last: Option<SocketId>,
    next_id_hint: u16,
    next_version: Generation,
    count: usize,
}

impl SocketRegistry {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_SOCKET_IDS);
        slots.resize_with(MAX_SOCKET_IDS, || None);
        SocketRegistry {
            slots,
            root: None,
            last: None,
            next_id_hint: 0,
            next_version: Generation(0),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Assigns the next free id (rolling counter, skipping occupied slots)
    /// and bumps the version counter. Fails if the id space is exhausted.
    fn unique_id(&mut self) -> Result<(SocketId, Generation)> {
        if self.count >= MAX_SOCKET_IDS {
            return Err(Error::internal("socket id space exhausted"));
        }
        let mut candidate = self.next_id_hint;
        loop {
            if self.slots[candidate as usize].is_none() {
                break;
            }
            candidate = candidate.wrapping_add(1) % (MAX_SOCKET_IDS as u16);
        }
        self.next_id_hint = candidate.wrapping_add(1) % (MAX_SOCKET_IDS as u16);
        let version = self.next_version;
        self.next_version = self.next_version.next();
        Ok((SocketId(candidate), version))
    }

    /// Appends `socket` to the tail of the chain, assigning its id/version
    /// and marking it enqueued. Fails on a socket that already thinks it's
    /// enqueued.
    pub fn enqueue(&mut self, mut socket: Socket) -> Result<SocketId> {
        if socket.is_enqueued() {
            return Err(Error::internal("double enqueue"));
        }
        let (id, version) = self.unique_id()?;
        socket.id = id;
        socket.version = version;
        socket.flags.insert(SocketFlags::ENQUEUED);

        let prev = self.last;
        let slot = Slot {
            socket,
            next: None,
            prev,
        };
        self.slots[id.index()] = Some(slot);

        if let Some(prev_id) = prev {
            if let Some(prev_slot) = self.slots[prev_id.index()].as_mut() {
                prev_slot.next = Some(id);
            }
        } else {
            self.root = Some(id);
        }
        self.last = Some(id);
        self.count += 1;
        Ok(id)
    }

    /// Unlinks `id` from the chain and removes it from the table. Returns
    /// the owned socket. Double dequeue fails with a diagnostic.
    pub fn dequeue(&mut self, id: SocketId) -> Result<Socket> {
        let Some(slot) = self.slots[id.index()].take() else {
            return Err(Error::internal(format!("double dequeue of socket {:?}", id)));
        };
        let Slot { mut socket, next, prev } = slot;

        match prev {
            Some(prev_id) => {
                if let Some(prev_slot) = self.slots[prev_id.index()].as_mut() {
                    prev_slot.next = next;
                }
            }
            None => self.root = next,
        }
        match next {
            Some(next_id) => {
                if let Some(next_slot) = self.slots[next_id.index()].as_mut() {
                    next_slot.prev = prev;
                }
            }
            None => self.last = prev,
        }

        socket.flags.remove(SocketFlags::ENQUEUED);
        self.count -= 1;
        Ok(socket)
    }

    pub fn get(&self, id: SocketId) -> Option<&Socket> {
        self.slots[id.index()].as_ref().map(|s| &s.socket)
    }

    pub fn get_mut(&mut self, id: SocketId) -> Option<&mut Socket> {
        self.slots[id.index()].as_mut().map(|s| &mut s.socket)
    }

    /// `sock_find`: looks up `id`; if `version` is given, requires a match.
    pub fn find(&self, id: SocketId, version: Option<Generation>) -> Option<&Socket> {
        let sock = self.get(id)?;
        match version {
            Some(v) if sock.version != v => None,
            _ => Some(sock),
        }
    }

    /// Ids in chain order, root to last.
    pub fn ids_in_order(&self) -> Vec<SocketId> {
        let mut out = Vec::with_capacity(self.count);
        let mut cur = self.root;
        while let Some(id) = cur {
            out.push(id);
            cur = self.slots[id.index()].as_ref().and_then(|s| s.next);
        }
        out
    }

    fn last_listener(&self) -> Option<SocketId> {
        let mut cur = self.root;
        let mut last_listener = None;
        while let Some(id) = cur {
            let slot = self.slots[id.index()].as_ref().unwrap();
            if slot.socket.is_listening() {
                last_listener = Some(id);
            }
            cur = slot.next;
        }
        last_listener
    }

    /// Moves the tail node to just after the last listener, producing
    /// round-robin fairness across non-listening sockets while listeners
    /// stay clustered at the head.
    pub fn rechain(&mut self) {
        let Some(tail_id) = self.last else { return };
        let Some(anchor) = self.last_listener() else { return };
        if anchor == tail_id {
            return;
        }
        // already immediately after anchor?
        if self.slots[anchor.index()].as_ref().and_then(|s| s.next) == Some(tail_id) {
            return;
        }

        // Unlink tail.
        let tail_prev = self.slots[tail_id.index()].as_ref().unwrap().prev;
        match tail_prev {
            Some(p) => self.slots[p.index()].as_mut().unwrap().next = None,
            None => self.root = None,
        }
        self.last = tail_prev;

        // Splice tail in right after anchor.
        let anchor_next = self.slots[anchor.index()].as_ref().unwrap().next;
        self.slots[tail_id.index()].as_mut().unwrap().prev = Some(anchor);
        self.slots[tail_id.index()].as_mut().unwrap().next = anchor_next;
        self.slots[anchor.index()].as_mut().unwrap().next = Some(tail_id);
        if let Some(next_id) = anchor_next {
            self.slots[next_id.index()].as_mut().unwrap().prev = Some(tail_id);
        } else {
            self.last = Some(tail_id);
        }
    }

    /// `sock_shutdown`: invokes `disconnected`, dequeues, and returns the
    /// socket so the caller can finish dropping its transport. Idempotent:
    /// returns `Ok(None)` if the socket is already gone.
    pub fn shutdown(&mut self, id: SocketId) -> Result<Option<Socket>> {
        if self.slots[id.index()].is_none() {
            return Ok(None);
        }
        if let Some(slot) = self.slots[id.index()].as_mut() {
            if let Some(disconnected) = slot.socket.callbacks.disconnected {
                disconnected(&mut slot.socket);
            }
        }
        self.dequeue(id).map(Some)
    }

    /// Iterates until the list is empty, shutting each socket down.
    pub fn shutdown_all(&mut self) {
        while let Some(id) = self.last.or(self.root) {
            if let Err(e) = self.shutdown(id) {
                warn!("registry: error shutting down socket {:?}: {}", id, e);
                break;
            }
        }
    }

    /// All ids currently flagged `killed`, for the drain step at the end
    /// of a loop iteration.
    pub fn killed_ids(&self) -> Vec<SocketId> {
        self.ids_in_order()
            .into_iter()
            .filter(|id| self.get(*id).map(|s| s.is_killed()).unwrap_or(false))
            .collect()
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        SocketRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use std::time::Instant;

    fn sock() -> Socket {
        Socket::new(Transport::test_null(), Instant::now())
    }

    #[test]
    fn enqueue_assigns_id_and_reaches_table_and_chain() {
        let mut reg = SocketRegistry::new();
        let id = reg.enqueue(sock()).unwrap();
        assert!(reg.get(id).unwrap().is_enqueued());
        assert_eq!(reg.ids_in_order(), vec![id]);
    }

    #[test]
    fn double_enqueue_without_dequeue_fails() {
        let mut reg = SocketRegistry::new();
        let id = reg.enqueue(sock()).unwrap();
        let mut already = reg.dequeue(id).unwrap();
        already.flags.insert(SocketFlags::ENQUEUED);
        assert!(reg.enqueue(already).is_err());
    }

    #[test]
    fn double_dequeue_fails_with_diagnostic() {
        let mut reg = SocketRegistry::new();
        let id = reg.enqueue(sock()).unwrap();
        reg.dequeue(id).unwrap();
        assert!(reg.dequeue(id).is_err());
    }

    #[test]
    fn chain_order_survives_many_enqueues() {
        let mut reg = SocketRegistry::new();
        let ids: Vec<_> = (0..10).map(|_| reg.enqueue(sock()).unwrap()).collect();
        assert_eq!(reg.ids_in_order(), ids);
    }

    #[test]
    fn version_disambiguates_reused_id() {
        let mut reg = SocketRegistry::new();
        let id1 = reg.enqueue(sock()).unwrap();
        let v1 = reg.get(id1).unwrap().version;
        reg.dequeue(id1).unwrap();
        // Force reuse of the same id by filling the hint back to 0.
        let id2 = reg.enqueue(sock()).unwrap();
        if id2 == id1 {
            let v2 = reg.get(id2).unwrap().version;
            assert_ne!(v1, v2);
            assert!(reg.find(id2, Some(v1)).is_none());
            assert!(reg.find(id2, Some(v2)).is_some());
        }
    }

    #[test]
    fn rechain_moves_tail_after_last_listener() {
        let mut reg = SocketRegistry::new();
        let mut listener = sock();
        listener.flags.insert(SocketFlags::LISTENING);
        let l_id = reg.enqueue(listener).unwrap();
        let a = reg.enqueue(sock()).unwrap();
        let b = reg.enqueue(sock()).unwrap();
        assert_eq!(reg.ids_in_order(), vec![l_id, a, b]);
        reg.rechain();
        // tail (b) moves to right after the last listener (l_id)
        assert_eq!(reg.ids_in_order(), vec![l_id, b, a]);
    }

    #[test]
    fn shutdown_all_drains_registry_and_is_idempotent_per_socket() {
        let mut reg = SocketRegistry::new();
        reg.enqueue(sock()).unwrap();
        reg.enqueue(sock()).unwrap();
        reg.shutdown_all();
        assert_eq!(reg.len(), 0);
        assert!(reg.ids_in_order().is_empty());
    }
}

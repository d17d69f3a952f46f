use std::{marker::PhantomData, ptr::NonNull};

use crate::Pointer;

/// Linked list node. Block and slab headers embed their list links by being
/// `Node<T>` themselves, see [`crate::header::Header`].
pub(crate) struct Node<T> {
    pub next: Pointer<Node<T>>,
    pub prev: Pointer<Node<T>>,
    pub data: T,
}

impl<T> Node<T> {
    /// Writes a detached node holding `data` at `address` and returns it.
    /// Since it cannot do allocations (WE ARE THE ALLOCATOR!) the caller
    /// supplies the address, which must be valid, writable and aligned for
    /// `Node<T>`. Linking into a list is a separate step; see
    /// [`LinkedList::push_front`].
    pub unsafe fn write(address: NonNull<u8>, data: T) -> NonNull<Node<T>> {
        let node = address.cast::<Node<T>>();
        node.as_ptr().write(Node {
            next: None,
            prev: None,
            data,
        });
        node
    }
}

/// Doubly linked list over nodes that live inside the memory blocks they
/// describe. The list never owns or allocates nodes; it only threads
/// pointers through headers that were placement-written with
/// [`Node::write`]. Every thread-side list (slabs, large blocks) and every
/// arena shard keeps one of these; the head is the "current" element and
/// new elements always enter at the front, so the tail ages into the
/// reclamation candidate.
pub(crate) struct LinkedList<T> {
    pub head: Pointer<Node<T>>,
    pub tail: Pointer<Node<T>>,
    pub len: usize,
    marker: PhantomData<T>,
}

impl<T> LinkedList<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn first(&self) -> Pointer<Node<T>> {
        self.head
    }

    /// Links a detached node at the front. `node` must have been written
    /// with [`Node::write`] (or previously removed from a list) and must
    /// not currently be linked anywhere.
    pub unsafe fn push_front(&mut self, mut node: NonNull<Node<T>>) {
        node.as_mut().next = self.head;
        node.as_mut().prev = None;

        match self.head {
            Some(mut head) => head.as_mut().prev = Some(node),
            None => self.tail = Some(node),
        }

        self.head = Some(node);
        self.len += 1;
    }

    /// Unlinks `node` from the list. `node` must be an element of this
    /// list.
    pub unsafe fn remove(&mut self, node: NonNull<Node<T>>) {
        if self.len == 1 {
            self.head = None;
            self.tail = None;
        } else if Some(node) == self.head {
            let mut next = node.as_ref().next.unwrap();
            next.as_mut().prev = None;
            self.head = Some(next);
        } else if Some(node) == self.tail {
            let mut prev = node.as_ref().prev.unwrap();
            prev.as_mut().next = None;
            self.tail = Some(prev);
        } else {
            let mut next = node.as_ref().next.unwrap();
            let mut prev = node.as_ref().prev.unwrap();
            prev.as_mut().next = Some(next);
            next.as_mut().prev = Some(prev);
        }

        self.len -= 1;
    }

    /// Makes `node` the head, keeping everything else in order. Used to
    /// promote a secondary element that just supplied an allocation so the
    /// next fast path hits it first.
    pub unsafe fn move_to_front(&mut self, node: NonNull<Node<T>>) {
        if Some(node) == self.head {
            return;
        }
        self.remove(node);
        self.push_front(node);
    }
}

//! Doubly linked list whose nodes live in a slab and link to each other by index.
//!
//! Both the chunk list and the block sequence of every chunk are kept in one
//! of these. Nodes never move once inserted, so a [`NodeId`] stays valid until
//! the node is removed, which is what lets an allocated block handle point back
//! at its block without holding a pointer into the chunk.

/// Stable index of a node inside a [`List`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Index of a neighbouring node, if any.
pub(crate) type Link = Option<NodeId>;

#[derive(Debug)]
pub(crate) struct Node<T> {
    /// Index of the next node of the list
    pub next: Link,
    /// Index of the previous node of the list
    pub prev: Link,
    /// Element of the node
    pub data: T,
}

#[derive(Debug)]
pub(crate) struct List<T> {
    slots: Vec<Option<Node<T>>>,
    /// Slots emptied by `remove`, reused by the next insertion.
    vacant: Vec<usize>,
    head: Link,
    tail: Link,
    len: usize,
}

pub(crate) struct Iter<'a, T> {
    list: &'a List<T>,
    current: Link,
    remaining: usize,
}

impl<T> List<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link {
        self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.node(id).map(|node| &node.data)
    }

    #[inline]
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .map(|node| &mut node.data)
    }

    #[inline]
    pub fn next(&self, id: NodeId) -> Link {
        self.node(id).and_then(|node| node.next)
    }

    #[inline]
    pub fn prev(&self, id: NodeId) -> Link {
        self.node(id).and_then(|node| node.prev)
    }

    fn node(&self, id: NodeId) -> Option<&Node<T>> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<T> {
        match self.slots.get_mut(id.0).and_then(Option::as_mut) {
            Some(node) => node,
            None => panic!("list node {} is not linked", id.0),
        }
    }

    fn store(&mut self, node: Node<T>) -> NodeId {
        match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                NodeId(index)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    /// Appends a new node at the tail of the list and returns its index.
    pub fn append(&mut self, data: T) -> NodeId {
        let prev = self.tail;
        let id = self.store(Node {
            next: None,
            prev,
            data,
        });

        match prev {
            Some(tail) => self.node_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }

        self.tail = Some(id);
        self.len += 1;

        id
    }

    /// Inserts a new node right after `after` and returns its index.
    pub fn insert_after(&mut self, after: NodeId, data: T) -> NodeId {
        let next = self.node_mut(after).next;
        let id = self.store(Node {
            next,
            prev: Some(after),
            data,
        });

        self.node_mut(after).next = Some(id);
        match next {
            Some(next) => self.node_mut(next).prev = Some(id),
            None => self.tail = Some(id),
        }

        self.len += 1;

        id
    }

    /// Unlinks `id` from the list, repairing its neighbours, and returns its element.
    pub fn remove(&mut self, id: NodeId) -> T {
        let node = match self.slots.get_mut(id.0).and_then(Option::take) {
            Some(node) => node,
            None => panic!("list node {} is not linked", id.0),
        };

        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }

        self.vacant.push(id.0);
        self.len -= 1;

        node.data
    }

    /// Index of the first element matching `predicate`, in list order.
    pub fn position<F>(&self, mut predicate: F) -> Link
    where
        F: FnMut(&T) -> bool,
    {
        let mut current = self.head;
        while let Some(id) = current {
            let node = self.node(id)?;
            if predicate(&node.data) {
                return Some(id);
            }
            current = node.next;
        }
        None
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            current: self.head,
            remaining: self.len,
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.list.node(self.current?)?;

        self.current = node.next;
        self.remaining -= 1;

        Some(&node.data)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> IntoIterator for &'a List<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

//! Byte trie over normalized paths.
//!
//! Nodes live in an arena and point at each other by index. Each node keeps its literal
//! children in an edge list sorted by byte and its `*` child apart, so lookup can fall
//! back to the wildcard when the literal descent fails. Slots of pruned nodes are recycled
//! by later insertions.

use crate::router::route::RouteEntry;
use http::Method;
use std::collections::HashMap;

const ROOT: usize = 0;
const WILDCARD: u8 = b'*';

/// method → accept type → entry
pub(crate) type Handlers = HashMap<Method, HashMap<String, RouteEntry>>;

#[derive(Debug)]
struct Node {
    key: u8,
    parent: Option<usize>,
    edges: Vec<(u8, usize)>,
    wildcard: Option<usize>,
    /// Set on nodes that terminate a route.
    route: Option<Handlers>,
}

impl Node {
    fn new(key: u8, parent: Option<usize>) -> Self {
        Self { key, parent, edges: Vec::new(), wildcard: None, route: None }
    }

    fn is_leaf(&self) -> bool {
        self.edges.is_empty() && self.wildcard.is_none()
    }
}

#[derive(Debug)]
pub(crate) struct Trie {
    nodes: Vec<Node>,
    free: Vec<usize>,
}

impl Default for Trie {
    fn default() -> Self {
        Self { nodes: vec![Node::new(0, None)], free: Vec::new() }
    }
}

impl Trie {
    fn child(&self, node: usize, key: u8) -> Option<usize> {
        let node = &self.nodes[node];
        if key == WILDCARD {
            return node.wildcard;
        }
        node.edges.binary_search_by_key(&key, |(k, _)| *k).ok().map(|i| node.edges[i].1)
    }

    fn add_child(&mut self, parent: usize, key: u8) -> usize {
        let fresh = Node::new(key, Some(parent));
        let child = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = fresh;
                slot
            }
            None => {
                self.nodes.push(fresh);
                self.nodes.len() - 1
            }
        };

        let node = &mut self.nodes[parent];
        if key == WILDCARD {
            node.wildcard = Some(child);
        } else if let Err(i) = node.edges.binary_search_by_key(&key, |(k, _)| *k) {
            node.edges.insert(i, (key, child));
        }
        child
    }

    fn unlink(&mut self, parent: usize, child: usize) {
        let key = self.nodes[child].key;
        let node = &mut self.nodes[parent];
        if key == WILDCARD {
            node.wildcard = None;
        } else if let Ok(i) = node.edges.binary_search_by_key(&key, |(k, _)| *k) {
            node.edges.remove(i);
        }
    }

    /// Returns the node terminating `normalized` with its handlers, creating both as needed.
    pub(crate) fn insert(&mut self, normalized: &str) -> (usize, &mut Handlers) {
        let mut current = ROOT;
        for &key in normalized.as_bytes() {
            current = match self.child(current, key) {
                Some(child) => child,
                None => self.add_child(current, key),
            };
        }
        (current, self.nodes[current].route.get_or_insert_with(HashMap::new))
    }

    pub(crate) fn handlers(&self, node: usize) -> Option<&Handlers> {
        self.nodes.get(node).and_then(|node| node.route.as_ref())
    }

    pub(crate) fn handlers_mut(&mut self, node: usize) -> Option<&mut Handlers> {
        self.nodes.get_mut(node).and_then(|node| node.route.as_mut())
    }

    /// Finds the route node for a raw request path.
    pub(crate) fn find(&self, path: &str) -> Option<usize> {
        self.find_from(path.as_bytes(), Some(0), ROOT)
    }

    /// `index` is `None` once a wildcard skipped to the end of the path.
    fn find_from(&self, path: &[u8], index: Option<usize>, current: usize) -> Option<usize> {
        let index = match index {
            Some(index) if index < path.len() => index,
            _ => return self.nodes[current].route.is_some().then_some(current),
        };

        let found = self.child(current, path[index]).and_then(|child| self.find_from(path, Some(index + 1), child));
        if found.is_some() {
            return found;
        }

        let wildcard = self.nodes[current].wildcard?;
        let node = &self.nodes[wildcard];
        if node.route.is_some() && node.is_leaf() {
            return Some(wildcard);
        }

        let next_slash = path[index..].iter().position(|b| *b == b'/').map(|n| index + n);
        self.find_from(path, next_slash, wildcard)
    }

    /// The route node stored under exactly this normalized path.
    pub(crate) fn find_exact(&self, normalized: &str) -> Option<usize> {
        let mut current = ROOT;
        for &key in normalized.as_bytes() {
            current = self.child(current, key)?;
        }
        self.nodes[current].route.is_some().then_some(current)
    }

    /// Drops the route at `node` and prunes the branch nodes nothing needs any more.
    pub(crate) fn remove(&mut self, node: usize) {
        self.nodes[node].route = None;

        let mut current = node;
        while let Some(parent) = self.nodes[current].parent {
            let removable = self.nodes[current].route.is_none() && self.nodes[current].is_leaf();
            if !removable {
                break;
            }
            self.unlink(parent, current);
            self.nodes[current] = Node::new(0, None);
            self.free.push(current);
            current = parent;
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    /// Every reachable route node, breadth first.
    pub(crate) fn route_nodes(&self) -> Vec<usize> {
        let mut found = Vec::new();
        let mut queue = std::collections::VecDeque::from([ROOT]);
        while let Some(current) = queue.pop_front() {
            let node = &self.nodes[current];
            queue.extend(node.edges.iter().map(|(_, child)| *child));
            queue.extend(node.wildcard);
            if node.route.is_some() {
                found.push(current);
            }
        }
        found
    }

    #[cfg(test)]
    fn path_of(&self, mut node: usize) -> String {
        let mut bytes = Vec::new();
        while let Some(parent) = self.nodes[node].parent {
            bytes.push(self.nodes[node].key);
            node = parent;
        }
        bytes.reverse();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

//! Routing between hosts.
//!
//! Explicit routes take precedence. Otherwise the route with the fewest hops in the topology graph is used,
//! ties are broken by the order in which edges were declared.

use std::collections::{BTreeMap, VecDeque};

use crate::{error::PlatformError, host::HostId, link::LinkId};

pub type NodeId = usize;

#[derive(Default)]
pub struct Routing {
    node_by_name: BTreeMap<String, NodeId>,
    node_names: Vec<String>,
    adjacency: Vec<Vec<(NodeId, LinkId)>>,
    host_nodes: BTreeMap<HostId, NodeId>,
    explicit: BTreeMap<(HostId, HostId), Vec<LinkId>>,
    cache: BTreeMap<(HostId, HostId), Option<Vec<LinkId>>>,
}

impl Routing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node to the topology graph.
    pub fn add_node(&mut self, name: &str) -> Result<NodeId, PlatformError> {
        if self.node_by_name.contains_key(name) {
            return Err(PlatformError::DuplicateName(name.to_string()));
        }
        let id = self.node_names.len();
        self.node_by_name.insert(name.to_string(), id);
        self.node_names.push(name.to_string());
        self.adjacency.push(Vec::new());
        Ok(id)
    }

    /// Adds a host node to the topology graph.
    pub fn add_host_node(&mut self, host: HostId, name: &str) -> Result<NodeId, PlatformError> {
        let node = self.add_node(name)?;
        self.host_nodes.insert(host, node);
        Ok(node)
    }

    pub fn node(&self, name: &str) -> Result<NodeId, PlatformError> {
        self.node_by_name
            .get(name)
            .copied()
            .ok_or_else(|| PlatformError::UnknownNode(name.to_string()))
    }

    /// Connects two nodes with a link. Links are bidirectional.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, link: LinkId) {
        self.adjacency[from].push((to, link));
        self.adjacency[to].push((from, link));
        self.cache.clear();
    }

    /// Declares an explicit route between two hosts.
    pub fn add_route(&mut self, src: HostId, dst: HostId, links: Vec<LinkId>, symmetric: bool) {
        if symmetric {
            let mut reversed = links.clone();
            reversed.reverse();
            self.explicit.insert((dst, src), reversed);
        }
        self.explicit.insert((src, dst), links);
        self.cache.clear();
    }

    /// Returns the list of links between two different hosts, `None` if they are not connected.
    pub fn route(&mut self, src: HostId, dst: HostId) -> Option<Vec<LinkId>> {
        if let Some(links) = self.explicit.get(&(src, dst)) {
            return Some(links.clone());
        }
        if let Some(cached) = self.cache.get(&(src, dst)) {
            return cached.clone();
        }
        let route = match (self.host_nodes.get(&src), self.host_nodes.get(&dst)) {
            (Some(&from), Some(&to)) => self.shortest_path(from, to),
            _ => None,
        };
        self.cache.insert((src, dst), route.clone());
        route
    }

    fn shortest_path(&self, from: NodeId, to: NodeId) -> Option<Vec<LinkId>> {
        let mut previous: Vec<Option<(NodeId, LinkId)>> = vec![None; self.adjacency.len()];
        let mut visited = vec![false; self.adjacency.len()];
        let mut queue = VecDeque::new();
        visited[from] = true;
        queue.push_back(from);
        while let Some(node) = queue.pop_front() {
            if node == to {
                break;
            }
            for &(next, link) in self.adjacency[node].iter() {
                if !visited[next] {
                    visited[next] = true;
                    previous[next] = Some((node, link));
                    queue.push_back(next);
                }
            }
        }
        if !visited[to] {
            return None;
        }
        let mut links = Vec::new();
        let mut node = to;
        while let Some((prev, link)) = previous[node] {
            links.push(link);
            node = prev;
        }
        links.reverse();
        Some(links)
    }
}

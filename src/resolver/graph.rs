// src/resolver/graph.rs

//! Job ordering graph
//!
//! One node per job (node 0 is reserved so job `i` is node `i + 1`). Edges
//! point from the job that must run first to the job that depends on it.
//! Strongly connected components are applied as one unit; components are
//! emitted in a deterministic topological order.

use super::Job;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

/// Which rule produced an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgePhase {
    /// Provider installed before requirer
    Install,
    /// Requirer erased before provider
    Erase,
    /// Collection membership
    Collection,
}

/// Sort key within a component: info troves, then packages before
/// components, then name and version
pub fn order_key(job: &Job) -> (bool, bool, String, String) {
    let tuple = job.primary();
    let name = job.name().to_string();
    let version = tuple.map(|t| t.version.freeze()).unwrap_or_default();
    let is_info = tuple.is_some_and(|t| t.is_info());
    let is_component = tuple.is_some_and(|t| t.is_component());
    (!is_info, is_component, name, version)
}

/// Ordering graph over a job list
#[derive(Debug)]
pub struct JobGraph {
    keys: Vec<(bool, bool, String, String)>,
    /// (from, to) node pairs with the phases that produced them
    edges: BTreeMap<(usize, usize), BTreeSet<EdgePhase>>,
}

impl JobGraph {
    pub fn new(jobs: &[Job]) -> Self {
        let mut keys = vec![(false, false, String::new(), String::new())];
        keys.extend(jobs.iter().map(order_key));
        Self {
            keys,
            edges: BTreeMap::new(),
        }
    }

    /// Node id of job index `job`
    pub fn node(job: usize) -> usize {
        job + 1
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    /// `before` must run before `after`
    pub fn add_edge(&mut self, before: usize, after: usize, phase: EdgePhase) {
        if before == after || before == 0 || after == 0 {
            return;
        }
        self.edges.entry((before, after)).or_default().insert(phase);
    }

    pub fn has_edge(&self, before: usize, after: usize) -> bool {
        self.edges.contains_key(&(before, after))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Drop pairs of edges that point opposite ways and come only from
    /// opposite dependency phases
    ///
    /// Removing A needs B still present while installing A needs B first;
    /// with both sides updated together neither constrains the other.
    pub fn cancel_opposing(&mut self) {
        let mut cancel = Vec::new();
        for ((a, b), phases) in &self.edges {
            if a > b {
                continue;
            }
            let Some(back) = self.edges.get(&(*b, *a)) else {
                continue;
            };
            let forward_only_one = phases.len() == 1 && !phases.contains(&EdgePhase::Collection);
            let back_only_one = back.len() == 1 && !back.contains(&EdgePhase::Collection);
            if forward_only_one && back_only_one && phases != back {
                cancel.push((*a, *b));
            }
        }
        for (a, b) in cancel {
            tracing::debug!("cancelling opposing edges between jobs {} and {}", a - 1, b - 1);
            self.edges.remove(&(a, b));
            self.edges.remove(&(b, a));
        }
    }

    /// Pull components with no ordering of their own into the same
    /// component as their package
    pub fn tie_leaves(&mut self, jobs: &[Job]) {
        let mut packages: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, job) in jobs.iter().enumerate() {
            if let Some(t) = job.primary()
                && !t.is_component()
            {
                packages.entry(t.name.as_str()).or_insert(Self::node(i));
            }
        }
        for (i, job) in jobs.iter().enumerate() {
            let Some(t) = job.primary() else { continue };
            if !t.is_component() {
                continue;
            }
            let Some(&parent) = packages.get(t.package_name()) else {
                continue;
            };
            let node = Self::node(i);
            let disconnected = !self.edges.keys().any(|(a, b)| *a == node || *b == node);
            if disconnected {
                self.add_edge(parent, node, EdgePhase::Collection);
                self.add_edge(node, parent, EdgePhase::Collection);
            }
        }
    }

    fn adjacency(&self, reverse: bool) -> Vec<Vec<usize>> {
        let mut adj = vec![Vec::new(); self.len()];
        for (a, b) in self.edges.keys() {
            if reverse {
                adj[*b].push(*a);
            } else {
                adj[*a].push(*b);
            }
        }
        for list in &mut adj {
            list.sort_unstable();
        }
        adj
    }

    /// Kosaraju; returns the component index of every node
    fn components(&self) -> (Vec<usize>, usize) {
        let n = self.len();
        let forward = self.adjacency(false);
        let backward = self.adjacency(true);

        // first pass: finish order on the forward graph
        let mut visited = vec![false; n];
        let mut finished = Vec::with_capacity(n);
        for start in 1..n {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let mut stack = vec![(start, 0usize)];
            while let Some((node, next)) = stack.last_mut() {
                if let Some(&child) = forward[*node].get(*next) {
                    *next += 1;
                    if !visited[child] {
                        visited[child] = true;
                        stack.push((child, 0));
                    }
                } else {
                    finished.push(*node);
                    stack.pop();
                }
            }
        }

        // second pass: reverse graph in reverse finish order
        let mut component = vec![usize::MAX; n];
        let mut count = 0;
        for &start in finished.iter().rev() {
            if component[start] != usize::MAX {
                continue;
            }
            component[start] = count;
            let mut stack = vec![start];
            while let Some(node) = stack.pop() {
                for &child in &backward[node] {
                    if component[child] == usize::MAX {
                        component[child] = count;
                        stack.push(child);
                    }
                }
            }
            count += 1;
        }
        (component, count)
    }

    /// Job indexes grouped into components, in execution order
    pub fn order(&self) -> Vec<Vec<usize>> {
        let (component, count) = self.components();

        let mut members: Vec<Vec<usize>> = vec![Vec::new(); count];
        for node in 1..self.len() {
            members[component[node]].push(node);
        }
        for list in &mut members {
            list.sort_by(|a, b| self.keys[*a].cmp(&self.keys[*b]).then(a.cmp(b)));
        }

        let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
        let mut in_degree = vec![0usize; count];
        for (a, b) in self.edges.keys() {
            let (ca, cb) = (component[*a], component[*b]);
            if ca != cb && successors[ca].insert(cb) {
                in_degree[cb] += 1;
            }
        }

        // Kahn with the smallest leading member first among ready components
        let sort_key = |c: usize| {
            let lead = members[c][0];
            (self.keys[lead].clone(), lead, c)
        };
        let mut ready = BinaryHeap::new();
        for c in 0..count {
            if in_degree[c] == 0 {
                ready.push(Reverse(sort_key(c)));
            }
        }
        let mut out = Vec::with_capacity(count);
        while let Some(Reverse((_, _, c))) = ready.pop() {
            out.push(members[c].iter().map(|node| node - 1).collect());
            for &next in &successors[c] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(sort_key(next)));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::Flavor;
    use crate::trove::TroveTuple;
    use crate::version::Version;

    fn tuple(name: &str) -> TroveTuple {
        TroveTuple::new(
            name,
            Version::parse("/conary.example.com@rpl:1/1.0-1-1").unwrap(),
            Flavor::empty(),
        )
    }

    fn installs(names: &[&str]) -> Vec<Job> {
        names.iter().map(|n| Job::install(tuple(n))).collect()
    }

    #[test]
    fn test_provider_first() {
        let jobs = installs(&["a:runtime", "b:runtime"]);
        let mut graph = JobGraph::new(&jobs);
        // b provides what a requires
        graph.add_edge(JobGraph::node(1), JobGraph::node(0), EdgePhase::Install);
        assert_eq!(graph.order(), vec![vec![1], vec![0]]);
    }

    #[test]
    fn test_cycle_sorted_within_component() {
        let jobs = installs(&["zed:runtime", "info-zed:user", "zed"]);
        let mut graph = JobGraph::new(&jobs);
        graph.add_edge(1, 2, EdgePhase::Install);
        graph.add_edge(2, 3, EdgePhase::Install);
        graph.add_edge(3, 1, EdgePhase::Install);
        // info first, then the package, then its component
        assert_eq!(graph.order(), vec![vec![1, 2, 0]]);
    }

    #[test]
    fn test_independent_jobs_are_deterministic() {
        let jobs = installs(&["c:lib", "a:lib", "b:lib"]);
        let graph = JobGraph::new(&jobs);
        let first = graph.order();
        assert_eq!(first, vec![vec![1], vec![2], vec![0]]);
        assert_eq!(first, JobGraph::new(&jobs).order());
    }

    #[test]
    fn test_opposing_phases_cancel() {
        let jobs = installs(&["a:runtime", "b:runtime"]);
        let mut graph = JobGraph::new(&jobs);
        graph.add_edge(1, 2, EdgePhase::Install);
        graph.add_edge(2, 1, EdgePhase::Erase);
        graph.cancel_opposing();
        assert_eq!(graph.edge_count(), 0);

        let mut graph = JobGraph::new(&jobs);
        graph.add_edge(1, 2, EdgePhase::Install);
        graph.add_edge(2, 1, EdgePhase::Install);
        graph.cancel_opposing();
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_leaf_tied_to_package() {
        let jobs = installs(&["foo:runtime", "foo", "bar:lib"]);
        let mut graph = JobGraph::new(&jobs);
        graph.tie_leaves(&jobs);
        assert!(graph.has_edge(2, 1));
        assert!(graph.has_edge(1, 2));
        let order = graph.order();
        assert!(order.contains(&vec![1, 0]));
    }
}

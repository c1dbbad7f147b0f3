//! Classical graph algorithms over a read snapshot of a [`GraphEngine`].
//!
//! Every entry point copies the live structure into a compact, key-ordered
//! [`DiGraph`] first, so results are deterministic and the engine lock is
//! only held for the duration of the call. Vertex arguments that do not
//! resolve fail with `NotFound`; inputs with no answer fail with `NotExist`.
//!
//! [`GraphEngine`]: crate::store::GraphEngine

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};

use ordered_float::OrderedFloat;
use petgraph::algo::{astar, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use serde_json::{json, Value};

use crate::error::{GraphError, Result};
use crate::store::GraphView;

const FLOW_EPSILON: f64 = 1e-9;

struct DenseEdge<'a> {
    key: &'a str,
    from: usize,
    to: usize,
    weight: f64,
}

/// Key-ordered copy of the graph: node `i` is `keys[i]`, edge weight `j` is `edges[j]`.
struct Dense<'a> {
    keys: Vec<&'a str>,
    edges: Vec<DenseEdge<'a>>,
    graph: DiGraph<(), usize>,
    /// Cheapest directed edge between an ordered pair.
    cheapest: HashMap<(usize, usize), usize>,
}

impl<'a> Dense<'a> {
    fn new(view: &GraphView<'a>) -> Dense<'a> {
        let graph = view.graph;
        let mut keys: Vec<&'a str> = graph.node_indices().map(|n| view.key(n)).collect();
        keys.sort_unstable();
        let pos: HashMap<&str, usize> = keys.iter().enumerate().map(|(i, k)| (*k, i)).collect();

        let mut edges: Vec<DenseEdge<'a>> = graph
            .edge_indices()
            .filter_map(|e| {
                let (s, t) = graph.edge_endpoints(e)?;
                let data = &graph[e];
                Some(DenseEdge {
                    key: data.key.as_str(),
                    from: pos[view.key(s)],
                    to: pos[view.key(t)],
                    weight: data.weight,
                })
            })
            .collect();
        edges.sort_unstable_by(|a, b| a.key.cmp(b.key));

        let mut dense_graph = DiGraph::with_capacity(keys.len(), edges.len());
        for _ in 0..keys.len() {
            dense_graph.add_node(());
        }
        let mut cheapest: HashMap<(usize, usize), usize> = HashMap::new();
        for (id, e) in edges.iter().enumerate() {
            dense_graph.add_edge(NodeIndex::new(e.from), NodeIndex::new(e.to), id);
            cheapest
                .entry((e.from, e.to))
                .and_modify(|best| {
                    if e.weight < edges[*best].weight {
                        *best = id;
                    }
                })
                .or_insert(id);
        }

        Dense {
            keys,
            edges,
            graph: dense_graph,
            cheapest,
        }
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn index_of(&self, key: &str) -> Result<usize> {
        self.keys
            .binary_search(&key)
            .map_err(|_| GraphError::NotFound(key.to_string()))
    }

    fn names(&self, nodes: impl IntoIterator<Item = usize>) -> Vec<&'a str> {
        nodes.into_iter().map(|i| self.keys[i]).collect()
    }

    /// Edge keys along a node path, taking the cheapest edge for each hop.
    fn hop_edges(&self, nodes: &[usize]) -> Vec<&'a str> {
        nodes
            .windows(2)
            .filter_map(|w| self.cheapest.get(&(w[0], w[1])))
            .map(|&id| self.edges[id].key)
            .collect()
    }

    /// Undirected simple view: no self-loops, parallel edges collapsed.
    fn neighbors(&self) -> Vec<BTreeSet<usize>> {
        let mut adj = vec![BTreeSet::new(); self.len()];
        for e in self.edges.iter().filter(|e| e.from != e.to) {
            adj[e.from].insert(e.to);
            adj[e.to].insert(e.from);
        }
        adj
    }

    fn components(&self) -> Vec<Vec<usize>> {
        let mut uf = UnionFind::new(self.len());
        for e in &self.edges {
            uf.union(e.from, e.to);
        }
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..self.len() {
            groups.entry(uf.find(i)).or_default().push(i);
        }
        let mut sets: Vec<Vec<usize>> = groups.into_values().collect();
        sets.sort_by_key(|set| set[0]);
        sets
    }
}

pub fn shortest_path(view: &GraphView<'_>, from: &str, to: &str, radius: Option<f64>) -> Result<Value> {
    let dense = Dense::new(view);
    let (s, t) = (dense.index_of(from)?, dense.index_of(to)?);
    if s == t {
        return Err(GraphError::NotExist);
    }
    let (weight, path) = astar(
        &dense.graph,
        NodeIndex::new(s),
        |n| n.index() == t,
        |e| dense.edges[*e.weight()].weight,
        |_| 0.0,
    )
    .ok_or(GraphError::NotExist)?;
    if radius.is_some_and(|r| weight > r) {
        return Err(GraphError::NotExist);
    }

    let nodes: Vec<usize> = path.iter().map(|n| n.index()).collect();
    let mut result = json!({
        "weight": weight,
        "edges": dense.hop_edges(&nodes),
        "start_vertex": from,
        "end_vertex": to,
    });
    if let Some(r) = radius {
        result["radius"] = json!(r);
    }
    Ok(result)
}

/// Up to `k` simple paths in ascending weight order, each at most `max_hops` edges.
pub fn k_shortest_paths(
    view: &GraphView<'_>,
    from: &str,
    to: &str,
    k: usize,
    max_hops: Option<usize>,
) -> Result<Value> {
    if k == 0 {
        return Err(GraphError::BadArgument("k must be positive".to_string()));
    }
    let dense = Dense::new(view);
    let (s, t) = (dense.index_of(from)?, dense.index_of(to)?);
    let hop_limit = max_hops.unwrap_or_else(|| dense.len().saturating_sub(1));

    let mut outgoing = vec![Vec::new(); dense.len()];
    for (id, e) in dense.edges.iter().enumerate() {
        outgoing[e.from].push(id);
    }

    let mut found = Vec::new();
    let mut heap = BinaryHeap::new();
    let mut seq = 0u64;
    heap.push(Reverse((OrderedFloat(0.0), seq, vec![s], Vec::<usize>::new())));
    while let Some(Reverse((cost, _, nodes, edges))) = heap.pop() {
        let last = nodes[nodes.len() - 1];
        if last == t && !edges.is_empty() {
            found.push(json!({
                "weight": cost.into_inner(),
                "path": edges.iter().map(|&id| dense.edges[id].key).collect::<Vec<_>>(),
            }));
            if found.len() == k {
                break;
            }
            continue;
        }
        if edges.len() >= hop_limit {
            continue;
        }
        for &id in &outgoing[last] {
            let next = dense.edges[id].to;
            if nodes.contains(&next) {
                continue;
            }
            let mut nodes = nodes.clone();
            nodes.push(next);
            let mut edges = edges.clone();
            edges.push(id);
            seq += 1;
            heap.push(Reverse((cost + dense.edges[id].weight, seq, nodes, edges)));
        }
    }

    let mut result = json!({
        "k": k,
        "start_vertex": from,
        "end_vertex": to,
        "paths": found,
    });
    if let Some(hops) = max_hops {
        result["max_hops"] = json!(hops);
    }
    Ok(result)
}

/// Tour over a complete graph, built from a preorder walk of its minimum
/// spanning tree (within twice the optimum for metric weights).
pub fn hamiltonian_cycle(view: &GraphView<'_>) -> Result<Value> {
    let dense = Dense::new(view);
    let n = dense.len();
    if n < 3 {
        return Err(GraphError::NotExist);
    }
    let mut w = vec![vec![f64::INFINITY; n]; n];
    for e in dense.edges.iter().filter(|e| e.from != e.to) {
        let cell = &mut w[e.from][e.to];
        *cell = cell.min(e.weight);
        w[e.to][e.from] = w[e.from][e.to];
    }
    if (0..n).any(|i| (0..n).any(|j| i != j && w[i][j].is_infinite())) {
        return Err(GraphError::NotExist);
    }

    // Prim from vertex 0.
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut parent = vec![usize::MAX; n];
    let mut children = vec![Vec::new(); n];
    best[0] = 0.0;
    for _ in 0..n {
        let Some(u) = (0..n)
            .filter(|&i| !in_tree[i])
            .min_by(|&a, &b| best[a].total_cmp(&best[b]))
        else {
            break;
        };
        in_tree[u] = true;
        if parent[u] != usize::MAX {
            children[parent[u]].push(u);
        }
        for v in 0..n {
            if !in_tree[v] && w[u][v] < best[v] {
                best[v] = w[u][v];
                parent[v] = u;
            }
        }
    }

    let mut tour = Vec::with_capacity(n);
    let mut stack = vec![0];
    while let Some(u) = stack.pop() {
        tour.push(u);
        stack.extend(children[u].iter().rev());
    }
    let weight: f64 = tour
        .iter()
        .zip(tour.iter().cycle().skip(1))
        .map(|(&a, &b)| w[a][b])
        .sum();

    Ok(json!({"cycle": dense.names(tour), "weight": weight}))
}

pub fn eulerian_circuit(view: &GraphView<'_>) -> Result<Value> {
    let dense = Dense::new(view);
    let mut adj = dense.neighbors();
    if dense.len() == 0 || dense.components().len() != 1 || adj.iter().any(|a| a.len() % 2 == 1) {
        return Err(GraphError::NotExist);
    }

    let mut circuit = Vec::new();
    let mut stack = vec![0];
    while let Some(&v) = stack.last() {
        let next = adj[v].iter().next().copied();
        match next {
            Some(u) => {
                adj[v].remove(&u);
                adj[u].remove(&v);
                stack.push(u);
            }
            None => {
                circuit.push(v);
                stack.pop();
            }
        }
    }
    circuit.reverse();
    Ok(json!({"circuit": dense.names(circuit)}))
}

/// Edmonds–Karp; edge weights are capacities.
pub fn max_flow(view: &GraphView<'_>, source: &str, sink: &str) -> Result<Value> {
    let dense = Dense::new(view);
    let (s, t) = (dense.index_of(source)?, dense.index_of(sink)?);
    if s == t {
        return Err(GraphError::BadArgument("source and sink must differ".to_string()));
    }

    // Arc 2i is edge i forward, arc 2i+1 its residual twin.
    let arcs = dense.edges.len() * 2;
    let mut cap = vec![0.0; arcs];
    let mut head = vec![0usize; arcs];
    let mut flow = vec![0.0; arcs];
    let mut adj = vec![Vec::new(); dense.len()];
    for (i, e) in dense.edges.iter().enumerate() {
        cap[2 * i] = e.weight.max(0.0);
        head[2 * i] = e.to;
        head[2 * i + 1] = e.from;
        adj[e.from].push(2 * i);
        adj[e.to].push(2 * i + 1);
    }

    let mut total = 0.0;
    loop {
        let mut via = vec![None; dense.len()];
        let mut queue = VecDeque::from([s]);
        while let Some(u) = queue.pop_front() {
            if u == t {
                break;
            }
            for &a in &adj[u] {
                let v = head[a];
                if v != s && via[v].is_none() && cap[a] - flow[a] > FLOW_EPSILON {
                    via[v] = Some(a);
                    queue.push_back(v);
                }
            }
        }
        if via[t].is_none() {
            break;
        }

        let mut bottleneck = f64::INFINITY;
        let mut v = t;
        while let Some(a) = via[v] {
            bottleneck = bottleneck.min(cap[a] - flow[a]);
            v = head[a ^ 1];
        }
        let mut v = t;
        while let Some(a) = via[v] {
            flow[a] += bottleneck;
            flow[a ^ 1] -= bottleneck;
            v = head[a ^ 1];
        }
        total += bottleneck;
    }

    let per_edge: serde_json::Map<String, Value> = dense
        .edges
        .iter()
        .enumerate()
        .map(|(i, e)| (e.key.to_string(), json!(flow[2 * i])))
        .collect();
    Ok(json!({"flow": per_edge, "maximum_flow_value": total}))
}

/// Colours of a greedy colouring that visits vertices by descending degree.
pub fn chromatic_number(view: &GraphView<'_>) -> Value {
    let dense = Dense::new(view);
    let adj = dense.neighbors();
    let mut order: Vec<usize> = (0..dense.len()).collect();
    order.sort_by_key(|&v| Reverse(adj[v].len()));

    let mut colour: Vec<Option<usize>> = vec![None; dense.len()];
    for v in order {
        let taken: BTreeSet<usize> = adj[v].iter().filter_map(|&u| colour[u]).collect();
        colour[v] = (0..).find(|c| !taken.contains(c));
    }
    let count = colour.iter().flatten().max().map_or(0, |c| c + 1);
    json!({"chromatic_number": count})
}

/// Kruskal over the undirected view; a spanning forest when disconnected.
pub fn minimum_spanning_tree(view: &GraphView<'_>) -> Value {
    let dense = Dense::new(view);
    let mut order: Vec<usize> = (0..dense.edges.len()).collect();
    order.sort_by(|&a, &b| dense.edges[a].weight.total_cmp(&dense.edges[b].weight));

    let mut uf = UnionFind::new(dense.len());
    let mut chosen = Vec::new();
    let mut cost = 0.0;
    for id in order {
        let e = &dense.edges[id];
        if e.from != e.to && uf.union(e.from, e.to) {
            chosen.push(e.key);
            cost += e.weight;
        }
    }
    json!({"edge_set": chosen, "spanning_tree_cost": cost})
}

fn undirected_pairs(dense: &Dense<'_>) -> BTreeSet<(usize, usize)> {
    dense
        .edges
        .iter()
        .map(|e| (e.from.min(e.to), e.from.max(e.to)))
        .collect()
}

/// Repeatedly takes the vertex covering the most uncovered edges.
pub fn greedy_vertex_cover(view: &GraphView<'_>) -> Value {
    let dense = Dense::new(view);
    let mut pairs = undirected_pairs(&dense);
    let mut cover = BTreeSet::new();
    while !pairs.is_empty() {
        let mut degree = vec![0usize; dense.len()];
        for &(a, b) in &pairs {
            degree[a] += 1;
            if a != b {
                degree[b] += 1;
            }
        }
        let Some(pick) = (0..dense.len()).max_by_key(|&v| (degree[v], Reverse(v))) else {
            break;
        };
        cover.insert(pick);
        pairs.retain(|&(a, b)| a != pick && b != pick);
    }
    json!({"cover_set": dense.names(cover)})
}

/// Takes both endpoints of every edge not yet covered.
pub fn approx_vertex_cover(view: &GraphView<'_>) -> Value {
    let dense = Dense::new(view);
    let mut cover = BTreeSet::new();
    for (a, b) in undirected_pairs(&dense) {
        if !cover.contains(&a) && !cover.contains(&b) {
            cover.insert(a);
            cover.insert(b);
        }
    }
    json!({"cover_set": dense.names(cover)})
}

pub fn connected_set(view: &GraphView<'_>, key: &str) -> Result<Value> {
    let dense = Dense::new(view);
    let v = dense.index_of(key)?;
    let set = dense
        .components()
        .into_iter()
        .find(|c| c.contains(&v))
        .unwrap_or_else(|| vec![v]);
    Ok(json!({"connected_set": dense.names(set)}))
}

pub fn connected_sets(view: &GraphView<'_>) -> Value {
    let dense = Dense::new(view);
    let sets: Vec<Vec<&str>> = dense
        .components()
        .into_iter()
        .map(|c| dense.names(c))
        .collect();
    json!({"connected_sets": sets})
}

/// Weak connectivity. An empty graph is not connected.
pub fn is_connected(view: &GraphView<'_>) -> bool {
    Dense::new(view).components().len() == 1
}

/// Path existence ignoring edge direction.
pub fn path_exists(view: &GraphView<'_>, from: &str, to: &str) -> Result<bool> {
    let dense = Dense::new(view);
    let (a, b) = (dense.index_of(from)?, dense.index_of(to)?);
    Ok(dense.components().iter().any(|c| c.contains(&a) && c.contains(&b)))
}

/// Bron–Kerbosch with pivoting over the undirected view.
pub fn maximal_cliques(view: &GraphView<'_>, biggest_only: bool) -> Value {
    let dense = Dense::new(view);
    let adj = dense.neighbors();
    let mut cliques = Vec::new();
    bron_kerbosch(
        &adj,
        Vec::new(),
        (0..dense.len()).collect(),
        BTreeSet::new(),
        &mut cliques,
    );
    if biggest_only {
        let max = cliques.iter().map(Vec::len).max().unwrap_or(0);
        cliques.retain(|c| c.len() == max);
    }
    cliques.sort();
    let named: Vec<Vec<&str>> = cliques.into_iter().map(|c| dense.names(c)).collect();
    json!({"cliques": named})
}

fn bron_kerbosch(
    adj: &[BTreeSet<usize>],
    clique: Vec<usize>,
    mut candidates: BTreeSet<usize>,
    mut excluded: BTreeSet<usize>,
    out: &mut Vec<Vec<usize>>,
) {
    if candidates.is_empty() && excluded.is_empty() {
        let mut clique = clique;
        clique.sort_unstable();
        out.push(clique);
        return;
    }
    let pivot = candidates
        .union(&excluded)
        .max_by_key(|&&u| candidates.intersection(&adj[u]).count())
        .copied();
    let branch: Vec<usize> = match pivot {
        Some(u) => candidates.difference(&adj[u]).copied().collect(),
        None => candidates.iter().copied().collect(),
    };
    for v in branch {
        let mut next = clique.clone();
        next.push(v);
        bron_kerbosch(
            adj,
            next,
            candidates.intersection(&adj[v]).copied().collect(),
            excluded.intersection(&adj[v]).copied().collect(),
            out,
        );
        candidates.remove(&v);
        excluded.insert(v);
    }
}

/// Floyd–Warshall. With a source, also lists its shortest path to every
/// reachable vertex.
pub fn all_pairs_shortest_paths(view: &GraphView<'_>, source: Option<&str>) -> Result<Value> {
    let dense = Dense::new(view);
    let n = dense.len();
    let src = source.map(|k| dense.index_of(k)).transpose()?;

    let mut dist = vec![vec![f64::INFINITY; n]; n];
    let mut next: Vec<Vec<Option<usize>>> = vec![vec![None; n]; n];
    for i in 0..n {
        dist[i][i] = 0.0;
        next[i][i] = Some(i);
    }
    for (&(a, b), &id) in &dense.cheapest {
        if a != b && dense.edges[id].weight < dist[a][b] {
            dist[a][b] = dense.edges[id].weight;
            next[a][b] = Some(b);
        }
    }
    for k in 0..n {
        for i in 0..n {
            if dist[i][k].is_infinite() {
                continue;
            }
            for j in 0..n {
                let through = dist[i][k] + dist[k][j];
                if through < dist[i][j] {
                    dist[i][j] = through;
                    next[i][j] = next[i][k];
                }
            }
        }
    }

    let mut diameter = 0.0f64;
    let mut count = 0usize;
    for (i, row) in dist.iter().enumerate() {
        for (j, d) in row.iter().enumerate() {
            if i != j && d.is_finite() {
                diameter = diameter.max(*d);
                count += 1;
            }
        }
    }
    let mut result = json!({"diameter": diameter, "shortest_path_count": count});

    if let Some(s) = src {
        let paths: Vec<Value> = (0..n)
            .filter(|&j| j != s && dist[s][j].is_finite())
            .map(|j| {
                let mut nodes = vec![s];
                let mut at = s;
                while at != j {
                    match next[at][j] {
                        Some(step) => {
                            nodes.push(step);
                            at = step;
                        }
                        None => break,
                    }
                }
                json!({
                    "weight": dist[s][j],
                    "edges": dense.hop_edges(&nodes),
                    "start_vertex": dense.keys[s],
                    "end_vertex": dense.keys[j],
                })
            })
            .collect();
        result["source_vertex"] = json!(dense.keys[s]);
        result["paths"] = json!(paths);
    }
    Ok(result)
}

fn cyclic_components(dense: &Dense<'_>) -> Vec<Vec<usize>> {
    let self_loop: BTreeSet<usize> = dense
        .edges
        .iter()
        .filter(|e| e.from == e.to)
        .map(|e| e.from)
        .collect();
    tarjan_scc(&dense.graph)
        .into_iter()
        .map(|scc| scc.into_iter().map(|n| n.index()).collect::<Vec<_>>())
        .filter(|scc| scc.len() > 1 || scc.iter().any(|v| self_loop.contains(v)))
        .collect()
}

/// Every vertex that lies on some directed cycle.
pub fn cycles(view: &GraphView<'_>) -> Value {
    let dense = Dense::new(view);
    let members: BTreeSet<usize> = cyclic_components(&dense).into_iter().flatten().collect();
    json!({"cycles": dense.names(members)})
}

/// Every vertex sharing a directed cycle with `key`.
pub fn cycles_through(view: &GraphView<'_>, key: &str) -> Result<Value> {
    let dense = Dense::new(view);
    let v = dense.index_of(key)?;
    let members: BTreeSet<usize> = cyclic_components(&dense)
        .into_iter()
        .find(|scc| scc.contains(&v))
        .unwrap_or_default()
        .into_iter()
        .collect();
    Ok(json!({"vertex": key, "cycles": dense.names(members)}))
}

use hashbrown::{HashMap, HashSet};

use crate::error::{BuildError, BuildResult};
use crate::node::NodeId;

pub type Edges = HashMap<NodeId, Vec<NodeId>>;
pub type PriorityMap = HashMap<NodeId, i64>;

/// Inserts `id` keeping `list` sorted. Returns `false` if it was already there.
pub fn insert_sorted(list: &mut Vec<NodeId>, id: NodeId) -> bool {
    match list.binary_search(&id) {
        Ok(_) => false,
        Err(index) => {
            list.insert(index, id);
            true
        }
    }
}

pub fn add_edge(edges: &mut Edges, from: NodeId, to: NodeId) -> bool {
    insert_sorted(edges.entry(from).or_default(), to)
}

/// Longest path to a sink for every node: leaves get 1, everything else one
/// more than its highest child. `pinned_last` is forced to `i64::MIN`.
///
/// Iterative DFS with memoization, so deep chains do not grow the stack and
/// shared descendants are visited once.
pub fn prioritize<'a, I>(
    nodes: I,
    edges: &'a Edges,
    pinned_last: Option<&NodeId>,
) -> BuildResult<PriorityMap>
where
    I: IntoIterator<Item = &'a NodeId>,
{
    let mut roots: Vec<&NodeId> = nodes.into_iter().collect();
    roots.sort();

    let mut priorities = PriorityMap::with_capacity(roots.len());
    let mut on_stack: HashSet<&NodeId> = HashSet::new();
    let mut stack: Vec<(&NodeId, usize)> = Vec::new();

    for root in roots {
        if priorities.contains_key(root) {
            continue;
        }
        on_stack.insert(root);
        stack.push((root, 0));

        while let Some(top) = stack.last_mut() {
            let (node, child_index) = *top;
            top.1 += 1;

            let children = edges.get(node).map(Vec::as_slice).unwrap_or_default();
            if let Some(child) = children.get(child_index) {
                if priorities.contains_key(child) {
                    continue;
                }
                if !on_stack.insert(child) {
                    return Err(BuildError::CycleDetected {
                        node_id: child.clone(),
                    });
                }
                stack.push((child, 0));
                continue;
            }

            let priority = 1 + children
                .iter()
                .map(|child| priorities[child])
                .max()
                .unwrap_or(0);
            priorities.insert(node.clone(), priority);
            on_stack.remove(node);
            stack.pop();
        }
    }

    if let Some(pinned) = pinned_last {
        priorities.insert(pinned.clone(), i64::MIN);
    }

    Ok(priorities)
}

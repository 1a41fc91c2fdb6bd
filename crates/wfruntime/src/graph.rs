use petgraph::algo::{has_path_connecting, tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{BTreeSet, HashMap, HashSet};
use wfcore::{
    expr, Bindings, DefinitionError, EdgeKind, NodeError, NodeId, NodeSpec, NodeType,
    WorkflowDefinition,
};

/// Validated, indexed view of a workflow definition.
#[derive(Debug)]
pub struct WorkflowGraph {
    graph: DiGraph<NodeId, EdgeKind>,
    /// Same nodes and indices as `graph`, without loop-back edges.
    forward: DiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
    start: NodeId,
    loop_bodies: HashSet<NodeId>,
}

/// Why a node is being routed onward.
#[derive(Debug, Clone, Copy)]
pub enum Route<'a> {
    /// Decision or checkpoint picked a label.
    Branch(&'a str),
    /// Ordinary node succeeded.
    Success,
    /// Node failed with `continueOnError`.
    Failure,
}

impl WorkflowGraph {
    /// Builds the graph and checks the structural rules a run depends on.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, DefinitionError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node in &definition.nodes {
            if index.contains_key(&node.id) {
                return Err(DefinitionError::DuplicateNode(node.id.clone()));
            }
            let idx = graph.add_node(node.id.clone());
            index.insert(node.id.clone(), idx);
        }

        let starts: Vec<&NodeSpec> = definition.start_nodes().collect();
        let start = match starts.as_slice() {
            [] => return Err(DefinitionError::NoStartNode),
            [only] => only.id.clone(),
            many => return Err(DefinitionError::MultipleStartNodes(many.len())),
        };

        for node in &definition.nodes {
            if node.node_type.routes_by_label() && node.edges.is_empty() {
                return Err(DefinitionError::InvalidEdge {
                    from: node.id.clone(),
                    reason: format!("{} node has no outgoing edges", node.node_type),
                });
            }
            for edge in &node.edges {
                let to = index
                    .get(&edge.to)
                    .ok_or_else(|| DefinitionError::NodeNotFound(edge.to.clone()))?;
                if edge.to == start {
                    return Err(DefinitionError::InvalidEdge {
                        from: node.id.clone(),
                        reason: "edges may not re-enter the start node".to_string(),
                    });
                }
                if !node.node_type.routes_by_label() {
                    if let Some(condition) = &edge.condition {
                        wfcore::validate_expression(&node.id, condition).map_err(|e| {
                            DefinitionError::InvalidEdge {
                                from: node.id.clone(),
                                reason: e.to_string(),
                            }
                        })?;
                    }
                }
                graph.add_edge(index[&node.id], *to, edge.kind);
            }
        }

        // Forward and failure edges alone must form a DAG.
        let forward = graph.filter_map(
            |_, id| Some(id.clone()),
            |_, kind| (*kind != EdgeKind::LoopBack).then_some(()),
        );
        if let Err(cycle) = toposort(&forward, None) {
            return Err(DefinitionError::UnmarkedCycle(forward[cycle.node_id()].clone()));
        }

        let mut reaches_end = false;
        let mut dfs = Dfs::new(&graph, index[&start]);
        while let Some(idx) = dfs.next(&graph) {
            let id = &graph[idx];
            if definition
                .find_node(id)
                .map(|n| n.node_type == NodeType::End)
                .unwrap_or(false)
            {
                reaches_end = true;
                break;
            }
        }
        if !reaches_end {
            return Err(DefinitionError::UnreachableEnd);
        }

        let mut loop_bodies = HashSet::new();
        for component in tarjan_scc(&graph) {
            let on_cycle = component.len() > 1
                || graph.contains_edge(component[0], component[0]);
            if on_cycle {
                loop_bodies.extend(component.iter().map(|idx| graph[*idx].clone()));
            }
        }

        Ok(Self {
            graph,
            forward,
            index,
            start,
            loop_bodies,
        })
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    /// Nodes on a cycle keep one result per iteration.
    pub fn is_loop_body(&self, node_id: &str) -> bool {
        self.loop_bodies.contains(node_id)
    }

    /// Frontier nodes that another frontier node can still reach along
    /// forward edges. These wait until every live branch has arrived or been
    /// pruned, so a join runs once.
    pub fn held_back(&self, frontier: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        frontier
            .iter()
            .filter(|target| {
                frontier
                    .iter()
                    .any(|from| from != *target && self.reaches(from, target))
            })
            .cloned()
            .collect()
    }

    fn reaches(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(a), Some(b)) => has_path_connecting(&self.forward, *a, *b, None),
            _ => false,
        }
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }
}

/// Next nodes to admit after `spec` finished along `route`.
pub fn successors(
    spec: &NodeSpec,
    route: Route<'_>,
    bindings: &Bindings,
) -> Result<Vec<NodeId>, NodeError> {
    let mut next: Vec<NodeId> = Vec::new();
    let mut push = |to: &NodeId| {
        if !next.contains(to) {
            next.push(to.clone());
        }
    };
    let routable = || spec.edges.iter().filter(|e| e.kind != EdgeKind::Failure);

    match route {
        Route::Branch(label) => {
            let matched: Vec<_> = routable()
                .filter(|e| e.condition.as_deref() == Some(label))
                .collect();
            let chosen = if matched.is_empty() {
                routable().filter(|e| e.condition.is_none()).collect()
            } else {
                matched
            };
            if chosen.is_empty() {
                return Err(NodeError::ExecutionFailed(format!(
                    "no edge from '{}' matches branch '{}'",
                    spec.id, label
                )));
            }
            chosen.into_iter().for_each(|e| push(&e.to));
        }
        Route::Success => {
            for edge in routable() {
                let take = match &edge.condition {
                    None => true,
                    Some(condition) => expr::is_truthy(&bindings.evaluate(condition)?),
                };
                if take {
                    push(&edge.to);
                }
            }
        }
        Route::Failure => {
            let failure: Vec<_> = spec
                .edges
                .iter()
                .filter(|e| e.kind == EdgeKind::Failure)
                .collect();
            if failure.is_empty() {
                routable()
                    .filter(|e| e.condition.is_none())
                    .for_each(|e| push(&e.to));
            } else {
                failure.into_iter().for_each(|e| push(&e.to));
            }
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use wfcore::Edge;

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "Linear")
            .with_node(NodeSpec::new("start", NodeType::Start).to("agentA"))
            .with_node(NodeSpec::new("agentA", NodeType::Agent).to("end"))
            .with_node(NodeSpec::new("end", NodeType::End))
    }

    fn looping() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "Loop")
            .with_node(NodeSpec::new("start", NodeType::Start).to("body"))
            .with_node(NodeSpec::new("body", NodeType::Transform).to("check"))
            .with_node(
                NodeSpec::new("check", NodeType::Decision)
                    .with_edge(Edge::loop_back("body", "true"))
                    .with_edge(Edge::branch("end", "false")),
            )
            .with_node(NodeSpec::new("end", NodeType::End))
    }

    #[test]
    fn accepts_linear_and_marked_loops() {
        let g = WorkflowGraph::build(&linear()).unwrap();
        assert_eq!(g.start(), "start");
        assert!(!g.is_loop_body("agentA"));

        let g = WorkflowGraph::build(&looping()).unwrap();
        assert!(g.is_loop_body("body"));
        assert!(g.is_loop_body("check"));
        assert!(!g.is_loop_body("end"));
    }

    #[test]
    fn rejects_malformed_graphs() {
        let mut no_start = linear();
        no_start.nodes.remove(0);
        assert_eq!(
            WorkflowGraph::build(&no_start).unwrap_err(),
            DefinitionError::NoStartNode
        );

        let two_starts = linear().with_node(NodeSpec::new("start2", NodeType::Start).to("end"));
        assert_eq!(
            WorkflowGraph::build(&two_starts).unwrap_err(),
            DefinitionError::MultipleStartNodes(2)
        );

        let unreachable = WorkflowDefinition::new("wf", "Dead end")
            .with_node(NodeSpec::new("start", NodeType::Start).to("agentA"))
            .with_node(NodeSpec::new("agentA", NodeType::Agent))
            .with_node(NodeSpec::new("end", NodeType::End));
        assert_eq!(
            WorkflowGraph::build(&unreachable).unwrap_err(),
            DefinitionError::UnreachableEnd
        );

        let mut unmarked = looping();
        unmarked.nodes[2].edges[0].kind = EdgeKind::Forward;
        assert!(matches!(
            WorkflowGraph::build(&unmarked).unwrap_err(),
            DefinitionError::UnmarkedCycle(_)
        ));

        let dangling = linear().with_node(NodeSpec::new("x", NodeType::Tool).to("ghost"));
        assert_eq!(
            WorkflowGraph::build(&dangling).unwrap_err(),
            DefinitionError::NodeNotFound("ghost".into())
        );
    }

    #[test]
    fn routes_branches_conditions_and_failures() {
        let decision = NodeSpec::new("d", NodeType::Decision)
            .with_edge(Edge::branch("yes", "true"))
            .with_edge(Edge::branch("no", "false"));
        let empty = Bindings::default();
        assert_eq!(successors(&decision, Route::Branch("true"), &empty).unwrap(), vec!["yes"]);
        assert!(successors(&decision, Route::Branch("maybe"), &empty).is_err());

        let mut scope = Map::new();
        scope.insert("score".into(), json!(7));
        let bindings = Bindings::from_map(scope);
        let fan_out = NodeSpec::new("a", NodeType::Agent)
            .to("always")
            .with_edge(Edge {
                condition: Some("score > 5".into()),
                ..Edge::new("high")
            })
            .with_edge(Edge {
                condition: Some("score <= 5".into()),
                ..Edge::new("low")
            })
            .with_edge(Edge::on_failure("recover"));
        assert_eq!(
            successors(&fan_out, Route::Success, &bindings).unwrap(),
            vec!["always", "high"]
        );
        assert_eq!(
            successors(&fan_out, Route::Failure, &bindings).unwrap(),
            vec!["recover"]
        );

        let skip = NodeSpec::new("b", NodeType::Tool).to("next");
        assert_eq!(successors(&skip, Route::Failure, &empty).unwrap(), vec!["next"]);
    }

    #[test]
    fn joins_wait_for_longer_branches() {
        let uneven = WorkflowDefinition::new("wf", "Uneven")
            .with_node(NodeSpec::new("start", NodeType::Start).to("a").to("b"))
            .with_node(NodeSpec::new("a", NodeType::Transform).to("join"))
            .with_node(NodeSpec::new("b", NodeType::Transform).to("c"))
            .with_node(NodeSpec::new("c", NodeType::Transform).to("join"))
            .with_node(NodeSpec::new("join", NodeType::Transform).to("end"))
            .with_node(NodeSpec::new("end", NodeType::End));
        let g = WorkflowGraph::build(&uneven).unwrap();

        let frontier: BTreeSet<NodeId> = ["join".to_string(), "c".to_string()].into();
        assert_eq!(g.held_back(&frontier), BTreeSet::from(["join".to_string()]));

        let frontier: BTreeSet<NodeId> = ["a".to_string(), "b".to_string()].into();
        assert!(g.held_back(&frontier).is_empty());

        // loop-back edges do not hold anything back
        let g = WorkflowGraph::build(&looping()).unwrap();
        let frontier: BTreeSet<NodeId> = ["body".to_string(), "check".to_string()].into();
        assert_eq!(g.held_back(&frontier), BTreeSet::from(["check".to_string()]));
    }
}

use std::collections::{HashMap, HashSet};

use stack_types::{EngineError, StackSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Dependency graph derived from a `StackSpec`. Nodes are agent ids; an
/// edge runs from a producer to each of its consumers (the union of
/// `dependsOn` and `inputFrom`).
#[derive(Debug, Clone)]
pub struct Dag {
    order: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: HashMap<String, HashSet<String>>,
    dependents: HashMap<String, HashSet<String>>,
    topo_order: Vec<String>,
}

impl Dag {
    /// Validates `spec` and builds its dependency graph. Fails with
    /// `InvalidSpec` (or its `CycleDetected` subclass) rather than panicking
    /// on any malformed input.
    pub fn build(spec: &StackSpec) -> Result<Self, EngineError> {
        if spec.agents.is_empty() {
            return Err(EngineError::InvalidSpec("stack has no agents".to_string()));
        }

        let mut index = HashMap::new();
        let mut order = Vec::with_capacity(spec.agents.len());
        for agent in &spec.agents {
            if agent.id.is_empty() {
                return Err(EngineError::InvalidSpec("agent id must not be empty".to_string()));
            }
            if index.insert(agent.id.clone(), order.len()).is_some() {
                return Err(EngineError::InvalidSpec(format!("duplicate agent id: {}", agent.id)));
            }
            order.push(agent.id.clone());
        }

        let mut dependencies: HashMap<String, HashSet<String>> =
            order.iter().map(|id| (id.clone(), HashSet::new())).collect();
        let mut dependents: HashMap<String, HashSet<String>> =
            order.iter().map(|id| (id.clone(), HashSet::new())).collect();

        for agent in &spec.agents {
            let mut deps = HashSet::new();
            for upstream in agent.depends_on.iter().chain(agent.input_from.iter()) {
                if !index.contains_key(upstream) {
                    return Err(EngineError::InvalidSpec(format!(
                        "agent '{}' references unknown upstream '{upstream}'",
                        agent.id
                    )));
                }
                deps.insert(upstream.clone());
            }
            for upstream in &deps {
                dependents.get_mut(upstream).unwrap().insert(agent.id.clone());
            }
            dependencies.insert(agent.id.clone(), deps);
        }

        detect_cycle(&order, &dependencies)?;

        if !order.iter().any(|id| dependencies[id].is_empty()) {
            return Err(EngineError::InvalidSpec(
                "no agent has zero dependencies; graph has no entry point".to_string(),
            ));
        }

        let topo_order = stable_topological_sort(&order, &index, &dependencies, &dependents);

        Ok(Self { order, index, dependencies, dependents, topo_order })
    }

    pub fn nodes(&self) -> &[String] {
        &self.order
    }

    pub fn dependencies_of(&self, id: &str) -> Option<&HashSet<String>> {
        self.dependencies.get(id)
    }

    pub fn topological_order(&self) -> &[String] {
        &self.topo_order
    }

    /// Nodes whose dependencies are all in `completed` and which are
    /// themselves not yet in `completed`, in spec-declared order.
    pub fn ready_nodes(&self, completed: &HashSet<String>) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| !completed.contains(*id))
            .filter(|id| self.dependencies[*id].iter().all(|dep| completed.contains(dep)))
            .cloned()
            .collect()
    }

    /// Nodes that directly depend on `id`.
    pub fn dependents_of(&self, id: &str) -> Option<&HashSet<String>> {
        self.dependents.get(id)
    }

    /// Every node transitively downstream of `id`, `id` excluded.
    pub fn downstream_of(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.dependents.get(id).into_iter().flatten().map(|s| s.as_str()).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.to_string()) {
                if let Some(more) = self.dependents.get(next) {
                    stack.extend(more.iter().map(|s| s.as_str()));
                }
            }
        }
        seen
    }

    /// Graphviz `dot` rendering, useful when debugging a misbehaving spec.
    pub fn dot(&self) -> String {
        let mut out = String::from("digraph stack {\n");
        for id in &self.order {
            out.push_str(&format!("  \"{id}\";\n"));
        }
        for id in &self.order {
            for dep in &self.dependencies[id] {
                out.push_str(&format!("  \"{dep}\" -> \"{id}\";\n"));
            }
        }
        out.push_str("}\n");
        out
    }

    #[allow(dead_code)]
    fn spec_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }
}

fn detect_cycle(order: &[String], dependencies: &HashMap<String, HashSet<String>>) -> Result<(), EngineError> {
    let mut color: HashMap<&str, Color> = order.iter().map(|id| (id.as_str(), Color::White)).collect();
    let mut stack_path = Vec::new();

    for start in order {
        if color[start.as_str()] == Color::White {
            visit(start, dependencies, &mut color, &mut stack_path)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    id: &'a str,
    dependencies: &'a HashMap<String, HashSet<String>>,
    color: &mut HashMap<&'a str, Color>,
    path: &mut Vec<String>,
) -> Result<(), EngineError> {
    color.insert(id, Color::Gray);
    path.push(id.to_string());
    for dep in &dependencies[id] {
        match color.get(dep.as_str()) {
            Some(Color::Gray) => {
                let mut cycle = path.clone();
                cycle.push(dep.clone());
                return Err(EngineError::CycleDetected(cycle));
            }
            Some(Color::Black) => continue,
            _ => visit(dep.as_str(), dependencies, color, path)?,
        }
    }
    path.pop();
    color.insert(id, Color::Black);
    Ok(())
}

fn stable_topological_sort(
    order: &[String],
    index: &HashMap<String, usize>,
    dependencies: &HashMap<String, HashSet<String>>,
    dependents: &HashMap<String, HashSet<String>>,
) -> Vec<String> {
    let mut remaining: HashMap<&str, usize> =
        order.iter().map(|id| (id.as_str(), dependencies[id].len())).collect();
    let mut result = Vec::with_capacity(order.len());
    let mut ready: Vec<&str> = order.iter().filter(|id| remaining[id.as_str()] == 0).map(|s| s.as_str()).collect();
    ready.sort_by_key(|id| index[*id]);

    while !ready.is_empty() {
        ready.sort_by_key(|id| index[*id]);
        let next = ready.remove(0);
        result.push(next.to_string());
        if let Some(children) = dependents.get(next) {
            for child in children {
                let entry = remaining.get_mut(child.as_str()).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    ready.push(child.as_str());
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use stack_types::AgentSpec;
    use std::collections::HashMap as Map;

    fn agent(id: &str, deps: &[&str]) -> AgentSpec {
        AgentSpec {
            id: id.to_string(),
            uses: "noop".to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            input_from: HashSet::new(),
            input_key: None,
            params: Map::new(),
        }
    }

    fn spec(agents: Vec<AgentSpec>) -> StackSpec {
        StackSpec { name: "s".to_string(), description: String::new(), version: "1".to_string(), agents }
    }

    #[test]
    fn linear_pipeline_topo_order_matches_spec_order() {
        let dag = Dag::build(&spec(vec![agent("A", &[]), agent("B", &["A"]), agent("C", &["B"])])).unwrap();
        assert_eq!(dag.topological_order(), &["A".to_string(), "B".to_string(), "C".to_string()]);
    }

    #[test]
    fn diamond_ready_nodes_surface_both_branches() {
        let dag = Dag::build(&spec(vec![
            agent("A", &[]),
            agent("B", &["A"]),
            agent("C", &["A"]),
            agent("D", &["B", "C"]),
        ]))
        .unwrap();
        let mut completed = HashSet::new();
        completed.insert("A".to_string());
        let ready = dag.ready_nodes(&completed);
        assert_eq!(ready, vec!["B".to_string(), "C".to_string()]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut a = agent("A", &[]);
        a.depends_on.insert("B".to_string());
        let b = agent("B", &["A"]);
        let err = Dag::build(&spec(vec![a, b])).unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected(_)));
    }

    #[test]
    fn unknown_dependency_is_invalid_spec() {
        let err = Dag::build(&spec(vec![agent("A", &["missing"])])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSpec(_)));
    }

    #[test]
    fn empty_spec_is_invalid() {
        let err = Dag::build(&spec(vec![])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSpec(_)));
    }

    #[test]
    fn duplicate_id_is_invalid_spec() {
        let err = Dag::build(&spec(vec![agent("A", &[]), agent("A", &[])])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSpec(_)));
    }
}

//! The immutable call graph the engine is started with.

use crate::core::{NodeKind, ResourceRequest};
use crate::errors::GraphError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Scheduling modifiers declared on a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Modifiers {
    /// Must run on the supervisor host even under a cluster job mode.
    pub local: bool,
    /// Runs before anything else and must succeed first.
    pub preflight: bool,
    /// Outputs may be reclaimed by VDR.
    pub volatile: bool,
    /// The node is switched off and counts as satisfied.
    pub disabled: bool,
}

/// A named output another node consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Producer node.
    pub source: String,
    /// Output name, a path relative to the producer's files directory.
    pub output: String,
    /// Argument the value is bound to; the output name when absent.
    #[serde(default)]
    pub arg: Option<String>,
}

impl Binding {
    /// Creates a binding to `source`'s `output`.
    #[must_use]
    pub fn new(source: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
            arg: None,
        }
    }

    /// Binds the value to `arg` instead of the output name.
    #[must_use]
    pub fn to_arg(mut self, arg: impl Into<String>) -> Self {
        self.arg = Some(arg.into());
        self
    }

    /// The argument this binding fills.
    #[must_use]
    pub fn arg_name(&self) -> &str {
        self.arg.as_deref().unwrap_or(&self.output)
    }
}

/// An output a node declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDecl {
    /// Path relative to the node's files directory.
    pub name: String,
    /// Pipeline-level output that VDR must keep.
    #[serde(default)]
    pub is_final: bool,
}

/// The executable that runs a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCode {
    /// Executable followed by its fixed arguments.
    pub command: Vec<String>,
}

/// One node of the call graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSpec {
    /// Fully-qualified name, the path in the call graph.
    pub fqname: String,
    /// Stage or pipeline.
    pub kind: NodeKind,
    /// Declared resources.
    pub resources: ResourceRequest,
    /// Scheduling modifiers.
    pub modifiers: Modifiers,
    /// Whether the stage has a split phase.
    pub split: bool,
    /// Whether the stage declares a join phase.
    pub join: bool,
    /// Worker executable, for stages.
    pub code: StageCode,
    /// Arguments written to `_args`.
    pub args: serde_json::Map<String, serde_json::Value>,
    /// Outputs of other nodes this node consumes.
    pub bindings: Vec<Binding>,
    /// Extra ordering dependencies without data.
    pub depends_on: Vec<String>,
    /// Outputs this node produces.
    pub outputs: Vec<OutputDecl>,
    /// Children, for pipelines.
    pub children: Vec<String>,
}

impl NodeSpec {
    /// Creates a stage node running `command`.
    #[must_use]
    pub fn stage(fqname: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            fqname: fqname.into(),
            code: StageCode { command },
            ..Self::default()
        }
    }

    /// Creates a pipeline node over `children`.
    #[must_use]
    pub fn pipeline(fqname: impl Into<String>, children: Vec<String>) -> Self {
        Self {
            fqname: fqname.into(),
            kind: NodeKind::Pipeline,
            children,
            ..Self::default()
        }
    }

    /// Sets the resource request.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    /// Declares split and join phases.
    #[must_use]
    pub fn with_split(mut self, join: bool) -> Self {
        self.split = true;
        self.join = join;
        self
    }

    /// Sets the modifiers.
    #[must_use]
    pub fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// Adds an argument.
    #[must_use]
    pub fn with_arg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    /// Adds a binding to another node's output.
    #[must_use]
    pub fn with_binding(mut self, source: impl Into<String>, output: impl Into<String>) -> Self {
        self.bindings.push(Binding::new(source, output));
        self
    }

    /// Declares an output.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, is_final: bool) -> Self {
        self.outputs.push(OutputDecl {
            name: name.into(),
            is_final,
        });
        self
    }

    /// Nodes that must complete before this one is ready.
    #[must_use]
    pub fn prenodes(&self) -> BTreeSet<&str> {
        self.bindings
            .iter()
            .map(|b| b.source.as_str())
            .chain(self.depends_on.iter().map(String::as_str))
            .collect()
    }
}

/// The call graph of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallGraph {
    /// Name of the top-level pipeline.
    pub name: String,
    /// Every node, stages and pipelines.
    pub nodes: Vec<NodeSpec>,
}

impl CallGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    /// Adds a node.
    #[must_use]
    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, fqname: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.fqname == fqname)
    }

    /// Leaf stages in dependency order.
    pub fn stage_order(&self) -> Result<Vec<&NodeSpec>, GraphError> {
        Ok(self
            .evaluation_order()?
            .into_iter()
            .filter(|n| n.kind == NodeKind::Stage)
            .collect())
    }

    /// Every node, producers before consumers and children before parents.
    ///
    /// Fails on duplicate names, dangling references and cycles.
    pub fn evaluation_order(&self) -> Result<Vec<&NodeSpec>, GraphError> {
        let mut by_name: HashMap<&str, &NodeSpec> = HashMap::new();
        for node in &self.nodes {
            if by_name.insert(node.fqname.as_str(), node).is_some() {
                return Err(GraphError::DuplicateNode(node.fqname.clone()));
            }
        }
        for node in &self.nodes {
            for dep in node.prenodes().into_iter().chain(node.children.iter().map(String::as_str)) {
                if !by_name.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        node: node.fqname.clone(),
                        dependency: dep.to_string(),
                    });
                }
            }
        }

        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut path = Vec::new();
        for node in &self.nodes {
            visit(node.fqname.as_str(), &by_name, &mut done, &mut path, &mut order)?;
        }
        Ok(order
            .into_iter()
            .filter_map(|name| by_name.get(name).copied())
            .collect())
    }
}

fn visit<'a>(
    name: &'a str,
    nodes: &HashMap<&'a str, &'a NodeSpec>,
    done: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
    order: &mut Vec<&'a str>,
) -> Result<(), GraphError> {
    if done.contains(name) {
        return Ok(());
    }
    if let Some(start) = path.iter().position(|n| *n == name) {
        let mut cycle: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
        cycle.push(name.to_string());
        return Err(GraphError::Cycle(cycle));
    }
    path.push(name);
    if let Some(node) = nodes.get(name) {
        let deps = node
            .prenodes()
            .into_iter()
            .chain(node.children.iter().map(String::as_str));
        for dep in deps {
            visit(dep, nodes, done, path, order)?;
        }
    }
    path.pop();
    done.insert(name);
    order.push(name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd() -> Vec<String> {
        vec!["/bin/true".to_string()]
    }

    #[test]
    fn test_stage_order_respects_bindings() {
        let graph = CallGraph::new("p")
            .with_node(NodeSpec::stage("p.C", cmd()).with_binding("p.B", "out.txt"))
            .with_node(NodeSpec::stage("p.A", cmd()).with_output("out.txt", false))
            .with_node(NodeSpec::stage("p.B", cmd()).with_binding("p.A", "out.txt"))
            .with_node(NodeSpec::pipeline("p", vec!["p.A".into(), "p.B".into(), "p.C".into()]));
        let order: Vec<&str> = graph
            .stage_order()
            .unwrap()
            .into_iter()
            .map(|n| n.fqname.as_str())
            .collect();
        assert_eq!(order, vec!["p.A", "p.B", "p.C"]);
    }

    #[test]
    fn test_evaluation_order_puts_children_first() {
        let graph = CallGraph::new("p")
            .with_node(NodeSpec::pipeline("p", vec!["p.A".into()]))
            .with_node(NodeSpec::stage("p.A", cmd()));
        let order: Vec<&str> = graph
            .evaluation_order()
            .unwrap()
            .into_iter()
            .map(|n| n.fqname.as_str())
            .collect();
        assert_eq!(order, vec!["p.A", "p"]);
    }

    #[test]
    fn test_binding_arg_name() {
        assert_eq!(Binding::new("p.A", "out.txt").arg_name(), "out.txt");
        assert_eq!(Binding::new("p.A", "out.txt").to_arg("reads").arg_name(), "reads");
    }

    #[test]
    fn test_cycle_detected() {
        let graph = CallGraph::new("p")
            .with_node(NodeSpec::stage("p.A", cmd()).with_binding("p.B", "x"))
            .with_node(NodeSpec::stage("p.B", cmd()).with_binding("p.A", "y"));
        let err = graph.stage_order().unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle(vec!["p.A".into(), "p.B".into(), "p.A".into()])
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let graph = CallGraph::new("p")
            .with_node(NodeSpec::stage("p.A", cmd()).with_binding("p.Z", "x"));
        assert!(matches!(
            graph.stage_order(),
            Err(GraphError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_node() {
        let graph = CallGraph::new("p")
            .with_node(NodeSpec::stage("p.A", cmd()))
            .with_node(NodeSpec::stage("p.A", cmd()));
        assert_eq!(
            graph.stage_order().unwrap_err(),
            GraphError::DuplicateNode("p.A".into())
        );
    }

    #[test]
    fn test_deserialize_sparse_node() {
        let node: NodeSpec = serde_json::from_str(
            r#"{"fqname":"p.A","code":{"command":["/bin/stage"]},"split":true,"join":true,
                "resources":{"threads":2,"mem_gb":4}}"#,
        )
        .unwrap();
        assert!(node.split);
        assert_eq!(node.resources.threads, 2);
        assert!(node.bindings.is_empty());
    }
}

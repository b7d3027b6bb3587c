use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use petgraph::visit::Dfs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::script::ScriptHost;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("reading {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("parsing {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("invalid flow `{flow}`: {reason}")]
    Invalid { flow: String, reason: String },
}

impl FlowError {
    fn invalid(flow: &str, reason: impl Into<String>) -> Self {
        FlowError::Invalid {
            flow: flow.to_string(),
            reason: reason.into(),
        }
    }
}

/// A conversation graph. Node names are unique within the flow.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Flow {
    /// Defaults to the file stem when loaded from disk.
    #[serde(default)]
    pub name: String,
    pub start_node: String,
    pub nodes: BTreeMap<String, Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Node {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_enter: Vec<Action>,
    /// When false the node's transitions are evaluated right after entering it.
    #[serde(default = "default_wait_for_input")]
    pub wait_for_input: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<Transition>,
}

fn default_wait_for_input() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Sends one text message; `{{context.x}}` and `{{event.x}}` are substituted.
    Say { text: String },
    Set { key: String, value: Value },
    /// Rhai code; writes to `context` are kept.
    Script { code: String },
}

/// Both `flow` and `node` empty ends the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Transition {
    #[serde(default = "default_condition")]
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

fn default_condition() -> String {
    "true".to_string()
}

impl Transition {
    pub fn to_node(node: impl Into<String>) -> Self {
        Self {
            condition: default_condition(),
            flow: None,
            node: Some(node.into()),
        }
    }

    pub fn end() -> Self {
        Self {
            condition: default_condition(),
            flow: None,
            node: None,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    pub fn ends_conversation(&self) -> bool {
        self.flow.is_none() && self.node.is_none()
    }
}

/// Where a transition leads once resolved against the flow set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node { flow: String, node: String },
    End,
}

impl Flow {
    pub fn new(name: impl Into<String>, start_node: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_node: start_node.into(),
            nodes: BTreeMap::new(),
        }
    }

    pub fn with_node(mut self, name: impl Into<String>, node: Node) -> Self {
        self.nodes.insert(name.into(), node);
        self
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Reads a `.json`, `.yaml` or `.yml` flow file.
    pub fn load_from_file(path: &Path) -> Result<Flow, FlowError> {
        let display = path.display().to_string();
        let contents = fs::read_to_string(path).map_err(|e| FlowError::Io {
            path: display.clone(),
            reason: e.to_string(),
        })?;
        let ext = path
            .extension()
            .and_then(|os| os.to_str())
            .unwrap_or_default()
            .to_lowercase();

        let mut flow: Flow = match ext.as_str() {
            "json" => serde_json::from_str(&contents).map_err(|e| FlowError::Parse {
                path: display.clone(),
                reason: e.to_string(),
            })?,
            "yaml" | "yml" => serde_yaml_bw::from_str(&contents).map_err(|e| FlowError::Parse {
                path: display.clone(),
                reason: e.to_string(),
            })?,
            other => {
                return Err(FlowError::Parse {
                    path: display,
                    reason: format!("unsupported extension `{other}` (expected json, yaml or yml)"),
                });
            }
        };

        if flow.name.is_empty() {
            flow.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
        }
        Ok(flow)
    }

    /// Checks everything that can be checked without the rest of the bot's
    /// flows: start node, same-flow targets and script syntax.
    pub fn validate(&self, scripts: &ScriptHost) -> Result<(), FlowError> {
        if self.name.is_empty() {
            return Err(FlowError::invalid("<unnamed>", "flow has no name"));
        }
        if !self.nodes.contains_key(&self.start_node) {
            return Err(FlowError::invalid(
                &self.name,
                format!("start node `{}` does not exist", self.start_node),
            ));
        }
        for (node_name, node) in &self.nodes {
            for action in &node.on_enter {
                if let Action::Script { code } = action {
                    scripts.check_script(code).map_err(|reason| {
                        FlowError::invalid(&self.name, format!("node `{node_name}` script: {reason}"))
                    })?;
                }
            }
            for transition in &node.next {
                scripts.check_condition(&transition.condition).map_err(|reason| {
                    FlowError::invalid(&self.name, format!("node `{node_name}` condition: {reason}"))
                })?;
                if transition.flow.is_none() {
                    if let Some(target) = &transition.node {
                        if !self.nodes.contains_key(target) {
                            return Err(FlowError::invalid(
                                &self.name,
                                format!("node `{node_name}` points at missing node `{target}`"),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// The validated flows of one bot.
#[derive(Debug, Clone, Default)]
pub struct FlowSet {
    flows: HashMap<String, Flow>,
}

impl FlowSet {
    /// Validates every flow and every cross-flow target, then checks
    /// connectivity on the combined graph.
    pub fn compile(flows: Vec<Flow>, scripts: &ScriptHost) -> Result<FlowSet, FlowError> {
        let mut by_name = HashMap::with_capacity(flows.len());
        for flow in flows {
            flow.validate(scripts)?;
            if by_name.contains_key(&flow.name) {
                return Err(FlowError::invalid(&flow.name, "defined twice"));
            }
            by_name.insert(flow.name.clone(), flow);
        }
        let set = FlowSet { flows: by_name };

        for flow in set.flows.values() {
            for (node_name, node) in &flow.nodes {
                for transition in &node.next {
                    set.resolve(&flow.name, transition).map_err(|reason| {
                        FlowError::invalid(&flow.name, format!("node `{node_name}`: {reason}"))
                    })?;
                }
            }
        }

        set.warn_unreachable();
        Ok(set)
    }

    pub fn get(&self, flow: &str) -> Option<&Flow> {
        self.flows.get(flow)
    }

    pub fn node(&self, flow: &str, node: &str) -> Option<&Node> {
        self.flows.get(flow).and_then(|f| f.node(node))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flows.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Resolves a transition taken from a node of `from_flow`.
    pub fn resolve(&self, from_flow: &str, transition: &Transition) -> Result<Target, String> {
        if transition.ends_conversation() {
            return Ok(Target::End);
        }
        let flow_name = transition.flow.as_deref().unwrap_or(from_flow);
        let flow = self
            .flows
            .get(flow_name)
            .ok_or_else(|| format!("unknown flow `{flow_name}`"))?;
        let node = transition.node.as_deref().unwrap_or(&flow.start_node);
        if !flow.nodes.contains_key(node) {
            return Err(format!("flow `{flow_name}` has no node `{node}`"));
        }
        Ok(Target::Node {
            flow: flow_name.to_string(),
            node: node.to_string(),
        })
    }

    fn warn_unreachable(&self) {
        let mut graph: StableDiGraph<(String, String), ()> = StableDiGraph::new();
        let mut index_of: HashMap<(String, String), NodeIndex> = HashMap::new();

        for flow in self.flows.values() {
            for node in flow.nodes.keys() {
                let key = (flow.name.clone(), node.clone());
                index_of.insert(key.clone(), graph.add_node(key));
            }
        }
        for flow in self.flows.values() {
            for (node_name, node) in &flow.nodes {
                let from = index_of[&(flow.name.clone(), node_name.clone())];
                for transition in &node.next {
                    if let Ok(Target::Node { flow: to_flow, node: to_node }) = self.resolve(&flow.name, transition) {
                        if let Some(&to) = index_of.get(&(to_flow, to_node)) {
                            graph.add_edge(from, to, ());
                        }
                    }
                }
            }
        }

        let mut reachable = HashSet::new();
        for flow in self.flows.values() {
            if let Some(&start) = index_of.get(&(flow.name.clone(), flow.start_node.clone())) {
                let mut dfs = Dfs::new(&graph, start);
                while let Some(ix) = dfs.next(&graph) {
                    reachable.insert(ix);
                }
            }
        }
        for (key, ix) in &index_of {
            if !reachable.contains(ix) {
                warn!(flow = %key.0, node = %key.1, "node is unreachable from any start node");
            }
        }
    }
}

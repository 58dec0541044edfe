//! The file registry and the concrete task graph produced by rule expansion.
//!
//! Every path mentioned by any rule is interned into a single [`FileRegistry`]
//! so that two rules referencing the same path share one [`FileNode`]. A file
//! knows its producer task (at most one) and its consumer tasks; those edges
//! are the dependency graph the scheduler walks.

use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::DiGraph;
use serde::Serialize;

use crate::command::resolve_argv;
use crate::error::ExpandError;
use crate::expand::{VarTable, expand_list, expand_outputs};

/// Stable identity of a task within a run. Queue membership in the scheduler
/// is keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub(crate) usize);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable identity of an interned file path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub(crate) usize);

/// An abstract rule template: multi-valued output, input and command
/// expressions as written in the rule file. Stateless after parsing;
/// consumed only by [`expand_rule`].
#[derive(Debug, Clone)]
pub struct Rule {
    pub outputs: Vec<String>,
    pub inputs: Vec<String>,
    pub commands: Vec<String>,
    /// 1-based rule file line, for diagnostics.
    pub line: usize,
}

/// A unique artifact path together with its position in the dependency
/// graph.
#[derive(Debug)]
pub struct FileNode {
    path: Utf8PathBuf,
    producer: Option<TaskId>,
    consumers: Vec<TaskId>,
}

impl FileNode {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The task producing this file, or `None` for external/pre-existing
    /// inputs.
    pub fn producer(&self) -> Option<TaskId> {
        self.producer
    }

    pub fn consumers(&self) -> &[TaskId] {
        &self.consumers
    }
}

/// Global file table keyed by path, mutated in place by rule expansion.
#[derive(Debug, Default)]
pub struct FileRegistry {
    index: HashMap<Utf8PathBuf, FileId>,
    nodes: Vec<FileNode>,
}

impl FileRegistry {
    /// Returns the existing id for a known path, or creates a fresh node.
    pub(crate) fn intern(&mut self, path: &str) -> FileId {
        if let Some(&id) = self.index.get(Utf8Path::new(path)) {
            return id;
        }

        let id = FileId(self.nodes.len());
        let path = Utf8PathBuf::from(path);
        self.index.insert(path.clone(), id);
        self.nodes.push(FileNode {
            path,
            producer: None,
            consumers: Vec::new(),
        });
        id
    }

    pub fn get(&self, id: FileId) -> &FileNode {
        &self.nodes[id.0]
    }

    pub fn path(&self, id: FileId) -> &Utf8Path {
        &self.nodes[id.0].path
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileNode> {
        self.nodes.iter()
    }
}

/// Scheduler-visible lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Waiting,
    Running,
    Success,
    Fail,
    /// An input's producer failed; the task never ran.
    DepFail,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Fail | Self::DepFail)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
            Self::DepFail => "DEPFAIL",
        };
        f.write_str(s)
    }
}

/// A concrete instantiation of a rule: resolved file references and argument
/// vectors. Status and command cursor are owned exclusively by the scheduler
/// once the task exists.
#[derive(Debug)]
pub struct Task {
    pub(crate) inputs: Vec<FileId>,
    pub(crate) outputs: Vec<FileId>,
    pub(crate) commands: Vec<Vec<String>>,
    rule: usize,
    status: TaskStatus,
    pub(crate) cursor: usize,
}

impl Task {
    pub fn inputs(&self) -> &[FileId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[FileId] {
        &self.outputs
    }

    /// Resolved argument vectors, executed in order.
    pub fn commands(&self) -> &[Vec<String>] {
        &self.commands
    }

    /// Index of the originating rule template.
    pub fn rule_index(&self) -> usize {
        self.rule
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    pub(crate) fn label(&self, registry: &FileRegistry) -> String {
        match self.outputs.first() {
            Some(&id) => registry.path(id).to_string(),
            None => format!("rule #{}", self.rule),
        }
    }
}

/// Cartesian-expands one rule template into concrete tasks, interning every
/// referenced path and wiring producer/consumer edges.
///
/// Realization order is deterministic (first-seen variables, values in
/// declaration order), so repeated runs over unchanged input produce an
/// identical task ordering.
pub(crate) fn expand_rule(
    rule_index: usize,
    rule: &Rule,
    registry: &mut FileRegistry,
    vars: &VarTable,
    tasks: &mut Vec<Task>,
) -> Result<(), ExpandError> {
    for realization in expand_outputs(&rule.outputs, vars)? {
        let inputs = expand_list(&rule.inputs, &realization.scope, vars)?;
        let raw_commands = expand_list(&rule.commands, &realization.scope, vars)?;

        let input_refs: Vec<&str> = inputs.iter().map(String::as_str).collect();
        let output_refs: Vec<&str> = realization.outputs.iter().map(String::as_str).collect();

        let mut commands = Vec::with_capacity(raw_commands.len());
        for cmd in &raw_commands {
            let argv = resolve_argv(cmd, &input_refs, &output_refs, &realization.scope, vars)?;
            if !argv.is_empty() {
                commands.push(argv);
            }
        }

        let id = TaskId(tasks.len());
        let input_ids: Vec<FileId> = inputs.iter().map(|p| registry.intern(p)).collect();
        let output_ids: Vec<FileId> = realization
            .outputs
            .iter()
            .map(|p| registry.intern(p))
            .collect();

        for &fid in &output_ids {
            let node = &mut registry.nodes[fid.0];
            if node.producer.is_some() {
                return Err(ExpandError::DuplicateProducer {
                    path: node.path.clone(),
                });
            }
            node.producer = Some(id);
        }

        for &fid in &input_ids {
            let node = &mut registry.nodes[fid.0];
            if !node.consumers.contains(&id) {
                node.consumers.push(id);
            }
        }

        tasks.push(Task {
            inputs: input_ids,
            outputs: output_ids,
            commands,
            rule: rule_index,
            status: TaskStatus::Waiting,
            cursor: 0,
        });
    }

    Ok(())
}

/// Builds the producer → consumer task graph, with the connecting file on
/// each edge. Consumed by [`crate::Project::plan`] for topological ordering
/// and cycle diagnostics.
pub(crate) fn task_graph(tasks: &[Task], registry: &FileRegistry) -> DiGraph<TaskId, FileId> {
    let mut graph = DiGraph::new();
    let nodes: Vec<_> = (0..tasks.len()).map(|i| graph.add_node(TaskId(i))).collect();

    for (i, task) in tasks.iter().enumerate() {
        for &fid in &task.inputs {
            if let Some(producer) = registry.get(fid).producer {
                graph.add_edge(nodes[producer.0], nodes[i], fid);
            }
        }
    }

    graph
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand_source(text: &str) -> Result<(FileRegistry, Vec<Task>), ExpandError> {
        let (rules, vars) = crate::rulefile::parse(text).unwrap();
        let mut registry = FileRegistry::default();
        let mut tasks = Vec::new();

        for (i, rule) in rules.iter().enumerate() {
            expand_rule(i, rule, &mut registry, &vars, &mut tasks)?;
        }

        Ok((registry, tasks))
    }

    fn paths(registry: &FileRegistry, ids: &[FileId]) -> Vec<String> {
        ids.iter().map(|&id| registry.path(id).to_string()).collect()
    }

    #[test]
    fn multi_valued_output_variable_yields_one_task_per_value() {
        let (registry, tasks) =
            expand_source("VAR = 1 2 3\nout_${VAR} : in\n\tgen in out_${VAR}\n").unwrap();

        assert_eq!(tasks.len(), 3);
        for (task, n) in tasks.iter().zip(["1", "2", "3"]) {
            let out = format!("out_{n}");
            assert_eq!(paths(&registry, &task.outputs), [out.clone()]);
            assert_eq!(task.commands[0], ["gen", "in", out.as_str()]);
        }

        // all three tasks consume the same interned file
        let shared = tasks[0].inputs[0];
        assert!(tasks.iter().all(|t| t.inputs == [shared]));
        assert_eq!(registry.get(shared).consumers().len(), 3);
    }

    #[test]
    fn multi_valued_input_variable_widens_one_task() {
        let (registry, tasks) =
            expand_source("VAR = 1 2 3\nmerged : part_${VAR}\n\tmerge $< ${>0}\n").unwrap();

        assert_eq!(tasks.len(), 1);
        assert_eq!(
            paths(&registry, &tasks[0].inputs),
            ["part_1", "part_2", "part_3"]
        );
        assert_eq!(
            tasks[0].commands,
            [["merge", "part_1", "part_2", "part_3", "merged"]]
        );
    }

    #[test]
    fn producer_and_consumers_are_wired() {
        let (registry, tasks) = expand_source("mid : in\n\ta\nout : mid\n\tb\n").unwrap();

        let mid = tasks[0].outputs[0];
        assert_eq!(registry.get(mid).producer(), Some(TaskId(0)));
        assert_eq!(registry.get(mid).consumers(), [TaskId(1)]);

        let external = tasks[0].inputs[0];
        assert_eq!(registry.get(external).producer(), None);
    }

    #[test]
    fn second_producer_for_a_path_fails_fast() {
        let err = expand_source("out : a\n\tx\nout : b\n\ty\n").unwrap_err();
        assert!(matches!(err, ExpandError::DuplicateProducer { path } if path == "out"));
    }

    #[test]
    fn fanned_out_rules_may_share_inputs_but_not_outputs() {
        // no variable in the outputs, so one realization only
        let (_, tasks) = expand_source("V = 1 2\nsame : in_${V}\n\tx\n").unwrap();
        assert_eq!(tasks.len(), 1);

        // fanning out duplicates the fixed output across realizations
        let err = expand_source("V = 1 2\nfixed other_${V} : in\n\tx\n").unwrap_err();
        assert!(matches!(err, ExpandError::DuplicateProducer { path } if path == "fixed"));
    }

    #[test]
    fn blank_commands_are_dropped() {
        let (_, tasks) = expand_source("out : in\n\t${SPACE}\nSPACE =\n").unwrap();
        // ${SPACE} resolves to an empty string, leaving no argv
        assert!(tasks[0].commands.is_empty());
    }

    #[test]
    fn task_graph_edges_follow_files() {
        let (registry, tasks) = expand_source("mid : in\n\ta\nout : mid\n\tb\n").unwrap();
        let graph = task_graph(&tasks, &registry);

        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);

        let order = petgraph::algo::toposort(&graph, None).unwrap();
        let order: Vec<_> = order.into_iter().map(|ix| graph[ix]).collect();
        assert_eq!(order, [TaskId(0), TaskId(1)]);
    }
}

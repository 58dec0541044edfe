#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod backend;
mod command;
mod error;
mod expand;
mod graph;
mod hash;
mod rulefile;
mod scheduler;
mod store;

use std::io::Write;
use std::sync::atomic::AtomicBool;

use camino::Utf8Path;

pub use crate::backend::{ExecutionBackend, JobHandle, JobState, LocalBackend};
pub use crate::error::{
    ExpandError, KumadeError, LoadError, ParseError, PlanError, ScheduleError, StoreError,
};
pub use crate::expand::VarTable;
pub use crate::graph::{FileId, FileNode, FileRegistry, Rule, Task, TaskId, TaskStatus};
pub use crate::scheduler::{ReportEntry, RunOptions, RunReport};
pub use crate::store::{SignatureMap, SignatureMode, SignatureStore};

/// A parsed and fully expanded rule file: the global variable table, the
/// interned file registry and the concrete task graph, ready to be scheduled.
#[derive(Debug)]
pub struct Project {
    vars: VarTable,
    rules: Vec<Rule>,
    registry: FileRegistry,
    tasks: Vec<Task>,
}

impl Project {
    /// Reads and expands a rule file. Parse and expansion errors abort the
    /// whole load before any task exists.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, LoadError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_source(&text)
    }

    /// Like [`Project::load`], for rule file text already in memory.
    pub fn from_source(text: &str) -> Result<Self, LoadError> {
        let (rules, vars) = rulefile::parse(text)?;

        let mut registry = FileRegistry::default();
        let mut tasks = Vec::new();

        for (i, rule) in rules.iter().enumerate() {
            graph::expand_rule(i, rule, &mut registry, &vars, &mut tasks)?;
        }

        Ok(Self {
            vars,
            rules,
            registry,
            tasks,
        })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    pub fn variables(&self) -> &VarTable {
        &self.vars
    }

    /// Paths no task produces. They must exist in the filesystem before a
    /// run can complete.
    pub fn external_inputs(&self) -> Vec<&Utf8Path> {
        self.registry
            .iter()
            .filter(|file| file.producer().is_none())
            .map(FileNode::path)
            .collect()
    }

    /// Topologically ordered dry-run listing of the task graph. Fails when
    /// the producer/consumer edges contain a cycle.
    pub fn plan(&self) -> Result<Vec<TaskId>, PlanError> {
        let graph = graph::task_graph(&self.tasks, &self.registry);

        match petgraph::algo::toposort(&graph, None) {
            Ok(order) => Ok(order.into_iter().map(|ix| graph[ix]).collect()),
            Err(cycle) => {
                let id = graph[cycle.node_id()];
                Err(PlanError::Cycle {
                    task: self.tasks[id.0].label(&self.registry),
                })
            }
        }
    }

    /// Renders the concrete task graph in Makefile syntax, listing
    /// producer-less files as required preconditions.
    pub fn export_makefile(&self, mut w: impl Write) -> std::io::Result<()> {
        let external = self.external_inputs();
        if !external.is_empty() {
            writeln!(w, "# files expected to pre-exist:")?;
            for path in external {
                writeln!(w, "#   {path}")?;
            }
            writeln!(w)?;
        }

        for task in &self.tasks {
            let outputs: Vec<_> = task
                .outputs()
                .iter()
                .map(|&id| self.registry.path(id).as_str())
                .collect();
            let inputs: Vec<_> = task
                .inputs()
                .iter()
                .map(|&id| self.registry.path(id).as_str())
                .collect();

            writeln!(w, "{}: {}", outputs.join(" "), inputs.join(" "))?;
            for argv in task.commands() {
                writeln!(w, "\t{}", argv.join(" "))?;
            }
            writeln!(w)?;
        }

        Ok(())
    }

    /// Drives every task to a terminal state against the given backend and
    /// returns the full status table. Task failures do not abort the run;
    /// they appear in the report.
    pub fn run<B: ExecutionBackend>(
        &mut self,
        backend: &mut B,
        options: RunOptions,
    ) -> Result<RunReport, ScheduleError> {
        scheduler::Scheduler::new(&mut self.tasks, &self.registry, backend, &options).run(None)
    }

    /// Like [`Project::run`], with a caller-held abort flag. When the flag is
    /// set, in-flight backend submissions are cancelled best-effort and all
    /// non-terminal tasks fail.
    pub fn run_with_abort<B: ExecutionBackend>(
        &mut self,
        backend: &mut B,
        options: RunOptions,
        abort: &AtomicBool,
    ) -> Result<RunReport, ScheduleError> {
        scheduler::Scheduler::new(&mut self.tasks, &self.registry, backend, &options)
            .run(Some(abort))
    }
}

/// Installs a `tracing` subscriber reading the `RUST_LOG` environment
/// variable.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    struct Sandbox {
        dir: tempfile::TempDir,
    }

    impl Sandbox {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn path(&self, name: &str) -> String {
            self.dir.path().join(name).to_str().unwrap().to_string()
        }

        fn project(&self, text: &str) -> Project {
            let root = self.dir.path().to_str().unwrap();
            Project::from_source(&text.replace("@/", &format!("{root}/"))).unwrap()
        }

        fn options(&self) -> RunOptions {
            RunOptions {
                store_path: self.path("sigs.json").into(),
                poll_interval: Duration::from_millis(5),
                progress: false,
                ..RunOptions::default()
            }
        }
    }

    #[test]
    fn copies_through_the_local_backend_end_to_end() {
        let sandbox = Sandbox::new();
        fs::write(sandbox.path("in1"), "hello").unwrap();

        let mut project =
            sandbox.project("@/out1 @/out2 : @/in1\n\tcp ${<0} ${>0}\n\tcp ${<0} ${>1}\n");
        let mut backend = LocalBackend::new();
        let report = project.run(&mut backend, sandbox.options()).unwrap();

        assert!(report.is_success(), "{report}");
        assert_eq!(fs::read_to_string(sandbox.path("out1")).unwrap(), "hello");
        assert_eq!(fs::read_to_string(sandbox.path("out2")).unwrap(), "hello");
    }

    #[test]
    fn plan_orders_producers_before_consumers() {
        let sandbox = Sandbox::new();
        let project = sandbox.project("@/out : @/mid\n\tb\n@/mid : @/in\n\ta\n");

        let order = project.plan().unwrap();
        let out_task = TaskId(0);
        let mid_task = TaskId(1);
        assert_eq!(order, [mid_task, out_task]);
    }

    #[test]
    fn plan_reports_cycles() {
        let sandbox = Sandbox::new();
        let project = sandbox.project("@/a : @/b\n\tx\n@/b : @/a\n\ty\n");

        assert!(matches!(project.plan(), Err(PlanError::Cycle { .. })));
    }

    #[test]
    fn makefile_export_lists_preconditions_and_tasks() {
        let project = Project::from_source("V = 1 2\nout_${V} : in_${V}\n\tgen ${<0} ${>0}\n")
            .unwrap();

        let mut rendered = Vec::new();
        project.export_makefile(&mut rendered).unwrap();
        let rendered = String::from_utf8(rendered).unwrap();

        assert!(rendered.contains("#   in_1"));
        assert!(rendered.contains("#   in_2"));
        assert!(rendered.contains("out_1: in_1"));
        assert!(rendered.contains("\tgen in_2 out_2"));
    }

    #[test]
    fn expansion_errors_abort_the_load() {
        let err = Project::from_source("out : in\n\tcp ${<0} ${>5}\n").unwrap_err();
        assert!(matches!(
            err,
            LoadError::Expand(ExpandError::IndexOutOfRange { index: 5, .. })
        ));

        let err = Project::from_source("out_${NOPE} : in\n\tx\n").unwrap_err();
        assert!(matches!(err, LoadError::Expand(ExpandError::UnknownVariable { .. })));
    }

    #[test]
    fn external_inputs_are_the_producerless_files() {
        let project = Project::from_source("mid : in\n\ta\nout : mid extra\n\tb\n").unwrap();
        let mut external: Vec<_> = project
            .external_inputs()
            .into_iter()
            .map(Utf8Path::to_string)
            .collect();
        external.sort();

        assert_eq!(external, ["extra", "in"]);
    }
}

//! Execution planning for tasks with upstream work. `deps` and `uses`
//! entries form a directed acyclic graph of invocations; the plan orders it
//! into stages, each stage depending only on earlier ones, with the
//! requested task as the final sink.

use crate::core::config::Config;
use crate::core::context::{Invocation, RunContext};
use crate::core::env_manager::EnvVarsManager;
use crate::core::tasks::Task;
use crate::errors::{ExecutionError, PoeResult, ResolveError};
use crate::system::executor;

use std::collections::{HashMap, HashSet};
use std::path::Path;

/// One planned invocation plus whether its stdout feeds a `uses` consumer.
/// The same invocation may appear twice, once captured and once not; each
/// distinct pair runs exactly once.
#[derive(Debug)]
struct Node {
    invocation: Invocation,
    capture: bool,
    /// Indices of the nodes that must finish before this one starts.
    needs: Vec<usize>,
}

/// A staged execution plan rooted at one requested task.
#[derive(Debug)]
pub struct ExecutionGraph {
    nodes: Vec<Node>,
    stages: Vec<Vec<usize>>,
    sink: usize,
}

impl ExecutionGraph {
    /// Walks the upstream closure of `sink` and builds the staged plan.
    /// Invocation entries expand against the run's base environment, so the
    /// plan is fixed before anything executes.
    pub fn build(
        ctx: &RunContext<'_>,
        sink: &Task,
        sink_args: &[String],
        sink_capture: bool,
    ) -> PoeResult<Self> {
        let mut builder = Builder {
            config: ctx.config,
            env: &ctx.base_env,
            nodes: Vec::new(),
            index: HashMap::new(),
        };
        let mut ancestors = HashSet::new();
        let sink_invocation = Invocation::new(sink.name.clone(), sink_args.to_vec());
        let sink_index = builder.visit(sink, sink_invocation, sink_capture, &mut ancestors)?;
        let stages = stage(&builder.nodes);
        log::debug!(
            "Planned {} invocation(s) in {} stage(s) for '{}'",
            builder.nodes.len(),
            stages.len(),
            sink.name
        );
        Ok(Self {
            nodes: builder.nodes,
            stages,
            sink: sink_index,
        })
    }

    /// Runs the plan stage by stage. Any non-sink failure aborts the run
    /// with an error; the sink's exit code becomes the plan's.
    pub fn execute(
        &self,
        ctx: &mut RunContext<'_>,
        sink: &Task,
        sink_args: &[String],
        parent_env: Option<&EnvVarsManager>,
        default_cwd: Option<&Path>,
    ) -> PoeResult<i32> {
        ctx.multistage = self.nodes.len() > 1;
        let config = ctx.config;
        let mut first = true;

        for stage in &self.stages {
            for &index in stage {
                if index == self.sink {
                    continue;
                }
                let node = &self.nodes[index];
                executor::check_cancelled(&ctx.cancel)?;

                // A captured invocation may already have run inside an
                // earlier nested plan; its committed output is reusable.
                if node.capture && ctx.has_task_output(&node.invocation) {
                    log::debug!("Reusing captured output of '{}'", node.invocation);
                    continue;
                }

                let Some(task) = config.lookup(&node.invocation.task) else {
                    return Err(ResolveError::UnknownTask(node.invocation.task.clone()).into());
                };
                if !first {
                    ctx.ui.separator();
                }
                first = false;
                let code = task.run_body(ctx, &node.invocation.args, None, None, node.capture)?;
                if code != 0 {
                    return Err(ExecutionError::TaskFailed {
                        task: node.invocation.task.clone(),
                        code,
                    }
                    .into());
                }
            }
        }

        if !first {
            ctx.ui.separator();
        }
        let capture = self.nodes[self.sink].capture;
        sink.run_body(ctx, sink_args, parent_env, default_cwd, capture)
    }
}

struct Builder<'a> {
    config: &'a Config,
    env: &'a EnvVarsManager,
    nodes: Vec<Node>,
    index: HashMap<(Invocation, bool), usize>,
}

impl Builder<'_> {
    /// Post-order DFS: upstream nodes are pushed before the tasks that need
    /// them, `deps` before `uses`, both in declaration order. `ancestors`
    /// tracks the open path for cycle detection.
    fn visit(
        &mut self,
        task: &Task,
        invocation: Invocation,
        capture: bool,
        ancestors: &mut HashSet<Invocation>,
    ) -> PoeResult<usize> {
        let key = (invocation.clone(), capture);
        if let Some(&index) = self.index.get(&key) {
            return Ok(index);
        }
        if !ancestors.insert(invocation.clone()) {
            return Err(ResolveError::CyclicDependency {
                task: invocation.task.clone(),
            }
            .into());
        }

        let (deps, uses) = task.upstream(self.env)?;
        let mut needs = Vec::with_capacity(deps.len() + uses.len());
        for dep in deps {
            needs.push(self.visit_invocation(dep, false, ancestors)?);
        }
        for (_, used) in uses {
            needs.push(self.visit_invocation(used, true, ancestors)?);
        }

        ancestors.remove(&invocation);

        let index = self.nodes.len();
        self.nodes.push(Node {
            invocation,
            capture,
            needs,
        });
        self.index.insert(key, index);
        Ok(index)
    }

    fn visit_invocation(
        &mut self,
        invocation: Invocation,
        capture: bool,
        ancestors: &mut HashSet<Invocation>,
    ) -> PoeResult<usize> {
        let Some(task) = self.config.lookup(&invocation.task) else {
            return Err(ResolveError::UnknownTask(invocation.task.clone()).into());
        };
        self.visit(task, invocation, capture, ancestors)
    }
}

/// Repeated topological selection: each stage takes every unplaced node
/// whose needs are all placed. Discovery order within a stage keeps
/// declaration order stable.
fn stage(nodes: &[Node]) -> Vec<Vec<usize>> {
    let mut placed = vec![false; nodes.len()];
    let mut stages = Vec::new();
    loop {
        let current: Vec<usize> = (0..nodes.len())
            .filter(|&index| {
                !placed[index] && nodes[index].needs.iter().all(|&need| placed[need])
            })
            .collect();
        if current.is_empty() {
            break;
        }
        for &index in &current {
            placed[index] = true;
        }
        stages.push(current);
    }
    stages
}

// MARK: --- UNIT TESTS ---

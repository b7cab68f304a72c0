//! Planner: turns a Charter into the task DAG.
//!
//! Every module gets an implement task. Modules that declare an interface
//! also get a freeze task that waits on their own implementation. A module
//! that uses another waits on the other's freeze task when it has one, and
//! on its implement task otherwise.
//!
//! Planning is all-or-nothing: any [`PlanError`] means no tasks exist.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::charter::Charter;
use crate::core::{DependencyKind, Task, TaskDAG, TaskId};
use crate::error::PlanError;
use crate::klog_debug;

pub fn build_plan(charter: &Charter) -> Result<TaskDAG, PlanError> {
    if charter.modules.is_empty() {
        return Err(PlanError::EmptyCharter);
    }

    let mut seen = HashSet::new();
    for module in &charter.modules {
        if !seen.insert(module.name.as_str()) {
            return Err(PlanError::DuplicateModule(module.name.clone()));
        }
    }

    for module in &charter.modules {
        for dependency in &module.uses {
            if !seen.contains(dependency.as_str()) {
                return Err(PlanError::UnknownDependency {
                    module: module.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    check_cycles(charter)?;

    let mut dag = TaskDAG::new();
    for module in &charter.modules {
        dag.add_task(Task::implement(module));
        if module.has_interface() {
            dag.add_task(Task::freeze(module));
        }
    }

    let link = |dag: &mut TaskDAG, from: TaskId, to: TaskId, kind: DependencyKind| {
        dag.add_dependency(&from, &to, kind)
            .map_err(|_| PlanError::Cycle {
                modules: vec![from.module.clone(), to.module.clone()],
            })
    };

    for module in &charter.modules {
        if module.has_interface() {
            link(
                &mut dag,
                TaskId::implement(&module.name),
                TaskId::freeze(&module.name),
                DependencyKind::OwnImplementation,
            )?;
        }
        for dependency in &module.uses {
            let declares_interface = charter
                .module(dependency)
                .is_some_and(|d| d.has_interface());
            let (from, kind) = if declares_interface {
                (TaskId::freeze(dependency), DependencyKind::Interface)
            } else {
                (TaskId::implement(dependency), DependencyKind::Implementation)
            };
            link(&mut dag, from, TaskId::implement(&module.name), kind)?;
        }
    }

    klog_debug!(
        "build_plan charter={} tasks={} dependencies={}",
        charter.name,
        dag.task_count(),
        dag.dependency_count()
    );
    Ok(dag)
}

/// Reject cyclic module usage, naming every module on a cycle.
fn check_cycles(charter: &Charter) -> Result<(), PlanError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for module in &charter.modules {
        index.insert(module.name.as_str(), graph.add_node(module.name.as_str()));
    }
    for module in &charter.modules {
        let to = index[module.name.as_str()];
        for dependency in &module.uses {
            graph.add_edge(index[dependency.as_str()], to, ());
        }
    }

    let mut members = BTreeSet::new();
    for component in tarjan_scc(&graph) {
        let cyclic = component.len() > 1
            || component
                .first()
                .is_some_and(|&n| graph.find_edge(n, n).is_some());
        if cyclic {
            members.extend(component.iter().map(|&n| graph[n].to_string()));
        }
    }

    if members.is_empty() {
        Ok(())
    } else {
        Err(PlanError::Cycle {
            modules: members.into_iter().collect(),
        })
    }
}

/// Human-readable plan, one task per line in dependency order.
pub fn render_plan(dag: &TaskDAG) -> String {
    let mut out = String::new();
    let ordered = match dag.topological_order() {
        Ok(tasks) => tasks,
        Err(_) => dag.all_tasks(),
    };
    for task in ordered {
        out.push_str(&task.id.to_string());
        if !task.deps.is_empty() {
            let deps: Vec<String> = task.deps.iter().map(ToString::to_string).collect();
            out.push_str(&format!("  <- {}", deps.join(", ")));
        }
        out.push('\n');
    }
    out
}

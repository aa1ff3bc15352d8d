// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{DagFile, RawDagFile};
use crate::errors::{DagflowError, Result};

/// Turn a raw definition into a validated [`DagFile`].
///
/// `default_name` is used when the file does not set `name` (the loader
/// passes the file stem).
pub fn into_dag_file(default_name: &str, raw: RawDagFile) -> Result<DagFile> {
    validate_raw(&raw)?;
    Ok(DagFile::new_unchecked(default_name.to_string(), raw))
}

fn validate_raw(raw: &RawDagFile) -> Result<()> {
    ensure_has_steps(raw)?;
    validate_step_dependencies(raw)?;
    validate_acyclic(raw)?;
    Ok(())
}

fn ensure_has_steps(raw: &RawDagFile) -> Result<()> {
    if raw.step.is_empty() {
        return Err(DagflowError::Config(
            "definition must contain at least one [step.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_step_dependencies(raw: &RawDagFile) -> Result<()> {
    for (name, step) in raw.step.iter() {
        for dep in step.depends.iter() {
            if !raw.step.contains_key(dep) {
                return Err(DagflowError::UnknownDependency {
                    step: name.clone(),
                    depends_on: dep.clone(),
                });
            }
            if dep == name {
                return Err(DagflowError::Cycle(name.clone()));
            }
        }
    }
    Ok(())
}

fn validate_acyclic(raw: &RawDagFile) -> Result<()> {
    // Edge direction: dep -> step. For
    //   [step.load]
    //   depends = ["extract"]
    // we add edge extract -> load.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in raw.step.keys() {
        graph.add_node(name.as_str());
    }

    for (name, step) in raw.step.iter() {
        for dep in step.depends.iter() {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(DagflowError::Cycle(cycle.node_id().to_string())),
    }
}

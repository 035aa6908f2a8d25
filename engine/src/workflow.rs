//! The workflow registry: the set of tasks and data objects a run operates
//! on, and the DAG inferred from which task produces which data object.

use crate::{
    data::DataObject,
    error::EngineError,
    task::Task,
};
use std::{collections::BTreeMap, sync::Arc};
use taskgraph_dag::Dag;
use taskgraph_uri::{Uri, UriRegistry};

pub struct Workflow {
    tasks: UriRegistry<Arc<Task>>,
    objects: UriRegistry<DataObject>,
    dag: Dag,
}

impl Workflow {
    pub fn new() -> Self {
        Workflow {
            tasks: UriRegistry::new(),
            objects: UriRegistry::new(),
            dag: Dag::new(),
        }
    }

    /// Registers `task`, along with a [`DataObject`] for each of its
    /// declared inputs, outputs, and mutables that isn't already known. A
    /// task body holds closures, which can't be compared by value, so a
    /// second registration under a task URI that is already in use is
    /// always treated as a conflicting duplicate; the same URI showing up
    /// as a data reference from more than one task (a shared input, say)
    /// is not — it's just the same object seen twice.
    pub fn add_task(&mut self, task: Task) -> Result<(), EngineError> {
        let uri = task.uri().clone();
        let task = Arc::new(task);
        self.tasks.insert_if_new(uri, task.clone(), |_| false)?;

        for data_uri in task
            .inputs()
            .iter()
            .chain(task.outputs())
            .chain(task.mutables())
        {
            self.objects
                .insert_if_new(data_uri.clone(), DataObject::referenced(data_uri.clone()), |_| true)?;
        }
        Ok(())
    }

    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = Task>) -> Result<(), EngineError> {
        for task in tasks {
            self.add_task(task)?;
        }
        Ok(())
    }

    pub fn add_object(&mut self, object: DataObject) -> Result<(), EngineError> {
        let uri = object.uri().clone();
        self.objects.insert_if_new(uri, object, |_| true)?;
        Ok(())
    }

    pub fn remove_task(&mut self, uri: &Uri) -> Result<(), EngineError> {
        self.tasks.remove(uri)?;
        Ok(())
    }

    pub fn remove_object(&mut self, uri: &Uri) -> Result<(), EngineError> {
        self.objects.remove(uri)?;
        Ok(())
    }

    pub fn task(&self, uri: &Uri) -> Option<&Arc<Task>> {
        self.tasks.get(uri)
    }

    pub fn tasks(&self) -> impl Iterator<Item = (&Uri, &Arc<Task>)> {
        self.tasks.iter()
    }

    pub fn object(&self, uri: &Uri) -> Option<&DataObject> {
        self.objects.get(uri)
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    /// (Re)builds the dependency graph from the currently registered tasks:
    /// a task depends on whichever other registered task produces one of
    /// its declared inputs or mutables. An input/mutable with no known
    /// producer is assumed to be externally supplied and contributes no
    /// edge. If more than one task claims the same output, the
    /// lexicographically smallest task URI is treated as the producer for
    /// graph purposes; the scheduler's scan-time collision check is what
    /// actually rejects the conflict.
    pub fn build(&mut self) -> Result<(), EngineError> {
        let mut producers: BTreeMap<Uri, Uri> = BTreeMap::new();
        for (task_uri, task) in self.tasks.iter() {
            for output in task.outputs() {
                producers
                    .entry(output.clone())
                    .and_modify(|existing| {
                        if task_uri < existing {
                            *existing = task_uri.clone();
                        }
                    })
                    .or_insert_with(|| task_uri.clone());
            }
        }

        let mut dag = Dag::new();
        for (task_uri, _) in self.tasks.iter() {
            dag.add_node(task_uri.clone());
        }
        for (task_uri, task) in self.tasks.iter() {
            for data_uri in task.inputs().iter().chain(task.mutables()) {
                if let Some(producer) = producers.get(data_uri) {
                    if producer != task_uri {
                        dag.add_edge(task_uri, producer);
                    }
                }
            }
        }
        self.dag = dag;
        Ok(())
    }
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_task_registers_its_declared_data_objects() {
        let mut workflow = Workflow::new();
        workflow
            .add_task(
                Task::thread(Uri::task("build"), |_ctx| true)
                    .inputs(vec![Uri::file("/src.rs")])
                    .outputs(vec![Uri::file("/build.out")])
                    .mutables(vec![Uri::state("lock")])
                    .build(),
            )
            .unwrap();

        assert!(workflow.object(&Uri::file("/src.rs")).is_some());
        assert!(workflow.object(&Uri::file("/build.out")).is_some());
        assert!(workflow.object(&Uri::state("lock")).is_some());
    }

    #[test]
    fn sharing_a_data_reference_across_tasks_is_not_a_duplicate_error() {
        let mut workflow = Workflow::new();
        workflow
            .add_task(
                Task::thread(Uri::task("a"), |_ctx| true)
                    .outputs(vec![Uri::file("/shared.out")])
                    .build(),
            )
            .unwrap();
        workflow
            .add_task(
                Task::thread(Uri::task("b"), |_ctx| true)
                    .inputs(vec![Uri::file("/shared.out")])
                    .build(),
            )
            .unwrap();
    }

    #[test]
    fn build_adds_an_edge_for_a_mutable_with_no_matching_input() {
        let mut workflow = Workflow::new();
        workflow
            .add_task(
                Task::thread(Uri::task("writer"), |_ctx| true)
                    .outputs(vec![Uri::state("shared")])
                    .build(),
            )
            .unwrap();
        workflow
            .add_task(
                Task::thread(Uri::task("mutator"), |_ctx| true)
                    .mutables(vec![Uri::state("shared")])
                    .build(),
            )
            .unwrap();

        workflow.build().unwrap();
        let prereqs = workflow.dag().transitive_prereqs(&Uri::task("mutator")).unwrap();
        assert!(prereqs.contains(&Uri::task("writer")));
    }
}

use futures::future;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::common::{ExecutionContext, ExecutionError};
use crate::logging;
use crate::runner::matrix::{expand_matrix, format_combination_name};
use crate::runner::run_context::{job_executor, lock, RunContext, StepResult};
use crate::runner::{Config, Run};
use crate::workflow::{parse_workflow, Workflow};

/// Drives one workflow: builds the execution plan from `needs`, expands each
/// job's matrix, and runs one [`RunContext`] per job instantiation. Jobs in
/// the same plan stage run concurrently and share only the config.
pub struct Runner {
    config: Arc<Config>,
    event_json: String,
}

#[derive(Debug)]
pub struct ExecutionReport {
    pub jobs: Vec<JobReport>,
}

impl ExecutionReport {
    pub fn success(&self) -> bool {
        self.jobs.iter().all(|job| job.success)
    }
}

#[derive(Debug)]
pub struct JobReport {
    pub name: String,
    pub success: bool,
    pub error: Option<String>,
    pub outputs: IndexMap<String, String>,
    pub steps: HashMap<String, StepResult>,
}

impl Runner {
    pub fn new(config: Config) -> Result<Runner, ExecutionError> {
        let event_json = match &config.event_path {
            Some(path) => std::fs::read_to_string(path)?,
            None => "{}".to_string(),
        };
        Ok(Runner {
            config: Arc::new(config),
            event_json,
        })
    }

    pub async fn execute_workflow_file(
        &self,
        path: &Path,
    ) -> Result<ExecutionReport, ExecutionError> {
        let workflow = Arc::new(parse_workflow(path)?);
        self.execute_workflow(workflow).await
    }

    pub async fn execute_workflow(
        &self,
        workflow: Arc<Workflow>,
    ) -> Result<ExecutionReport, ExecutionError> {
        logging::info(&format!("Executing workflow: {}", workflow.name));
        let plan = plan_stages(&workflow)?;

        let mut jobs = Vec::new();
        for stage in plan {
            let mut handles = Vec::new();
            for job_id in &stage {
                let job = &workflow.jobs[job_id];
                let combinations =
                    expand_matrix(job.strategy.as_ref().and_then(|s| s.matrix.as_ref()))?;
                let total = combinations.len();

                for (index, combination) in combinations.into_iter().enumerate() {
                    let name = if total > 1 {
                        format!("{}-{}", job_id, index + 1)
                    } else {
                        job_id.clone()
                    };
                    if !combination.is_empty() {
                        logging::info(&format!(
                            "Expanded {}",
                            format_combination_name(job_id, &combination)
                        ));
                    }

                    let matrix: HashMap<String, serde_json::Value> = combination
                        .iter()
                        .map(|(key, value)| (key.clone(), yaml_to_json(value)))
                        .collect();

                    let rc = RunContext::new(
                        self.config.clone(),
                        Run::new(workflow.clone(), job_id.clone()),
                        matrix,
                        self.event_json.clone(),
                        name.clone(),
                    )
                    .into_handle();
                    handles.push((name, rc));
                }
            }

            let stage_futures = handles.iter().map(|(name, rc)| {
                let ctx = ExecutionContext::new().with_job(name.clone());
                let executor = job_executor(rc);
                async move { executor.run(&ctx).await }
            });
            let results = future::join_all(stage_futures).await;

            let mut stage_failed = false;
            for ((name, rc), result) in handles.into_iter().zip(results) {
                let guard = lock(&rc);
                if result.is_err() {
                    stage_failed = true;
                }
                jobs.push(JobReport {
                    name,
                    success: result.is_ok(),
                    error: result.err().map(|err| err.to_string()),
                    outputs: guard.job_outputs.clone(),
                    steps: guard.step_results.clone(),
                });
            }

            // dependent stages cannot run on top of a failed stage
            if stage_failed {
                break;
            }
        }

        Ok(ExecutionReport { jobs })
    }
}

/// Level-order execution plan: each stage contains jobs whose `needs` are
/// all satisfied by earlier stages. Declaration order is kept within a
/// stage.
pub fn plan_stages(workflow: &Workflow) -> Result<Vec<Vec<String>>, ExecutionError> {
    for (job_id, job) in &workflow.jobs {
        if let Some(needs) = &job.needs {
            for needed in needs.as_slice() {
                if !workflow.jobs.contains_key(needed) {
                    return Err(ExecutionError::Config(format!(
                        "Job '{}' depends on non-existent job '{}'",
                        job_id, needed
                    )));
                }
            }
        }
    }

    let mut remaining: Vec<String> = workflow.jobs.keys().cloned().collect();
    let mut done: HashSet<String> = HashSet::new();
    let mut stages = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .iter()
            .filter(|job_id| {
                workflow.jobs[*job_id]
                    .needs
                    .as_ref()
                    .map(|needs| needs.as_slice().iter().all(|needed| done.contains(needed)))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        if ready.is_empty() {
            return Err(ExecutionError::Config(
                "Circular dependency detected in workflow jobs".to_string(),
            ));
        }

        remaining.retain(|job_id| !ready.contains(job_id));
        done.extend(ready.iter().cloned());
        stages.push(ready);
    }

    Ok(stages)
}

fn yaml_to_json(value: &serde_yaml::Value) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_workflow_str;

    #[test]
    fn test_plan_stages_levels_by_needs() {
        let workflow = parse_workflow_str(
            r#"
name: plan
on: push
jobs:
  a:
    runs-on: ubuntu-latest
    steps: [{run: echo a}]
  b:
    runs-on: ubuntu-latest
    needs: a
    steps: [{run: echo b}]
  c:
    runs-on: ubuntu-latest
    needs: [a]
    steps: [{run: echo c}]
  d:
    runs-on: ubuntu-latest
    needs: [b, c]
    steps: [{run: echo d}]
"#,
        )
        .unwrap();

        let plan = plan_stages(&workflow).unwrap();
        assert_eq!(plan, vec![
            vec!["a".to_string()],
            vec!["b".to_string(), "c".to_string()],
            vec!["d".to_string()],
        ]);
    }

    #[test]
    fn test_plan_stages_rejects_unknown_needs() {
        let workflow = parse_workflow_str(
            r#"
name: plan
on: push
jobs:
  a:
    runs-on: ubuntu-latest
    needs: ghost
    steps: [{run: echo a}]
"#,
        )
        .unwrap();

        let err = plan_stages(&workflow).unwrap_err();
        assert!(err.to_string().contains("non-existent"));
    }

    #[test]
    fn test_plan_stages_rejects_cycles() {
        let workflow = parse_workflow_str(
            r#"
name: plan
on: push
jobs:
  a:
    runs-on: ubuntu-latest
    needs: b
    steps: [{run: echo a}]
  b:
    runs-on: ubuntu-latest
    needs: a
    steps: [{run: echo b}]
"#,
        )
        .unwrap();

        let err = plan_stages(&workflow).unwrap_err();
        assert!(err.to_string().contains("Circular"));
    }
}

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::common::ExecutionError;

#[derive(Debug, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub name: String,
    #[serde(skip, default)]
    pub on: Vec<String>,
    #[serde(rename = "on", default)]
    on_raw: serde_yaml::Value,
    #[serde(default, deserialize_with = "de_string_map")]
    pub env: HashMap<String, String>,
    pub jobs: IndexMap<String, Job>,
}

#[derive(Debug, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "runs-on", default)]
    pub runs_on: Option<StringOrList>,
    #[serde(default)]
    pub needs: Option<StringOrList>,
    #[serde(rename = "if", default, deserialize_with = "de_expr")]
    pub if_expr: String,
    #[serde(default, deserialize_with = "de_string_map")]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub outputs: IndexMap<String, String>,
    #[serde(default)]
    pub container: Option<ContainerBlock>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
}

impl Job {
    /// The interpolatable runner labels, in declaration order.
    pub fn runs_on(&self) -> Option<&[String]> {
        self.runs_on.as_ref().map(|r| r.as_slice())
    }

    pub fn container(&self) -> Option<&JobContainer> {
        match &self.container {
            Some(ContainerBlock::Spec(c)) => Some(c),
            _ => None,
        }
    }

    /// The raw container image, treating a bare string as `image:`.
    pub fn container_image(&self) -> Option<&str> {
        match &self.container {
            Some(ContainerBlock::Image(image)) => Some(image),
            Some(ContainerBlock::Spec(c)) => Some(&c.image),
            None => None,
        }
    }
}

/// A value that may be written as a single string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    Single(String),
    Multiple(Vec<String>),
}

impl StringOrList {
    pub fn as_slice(&self) -> &[String] {
        match self {
            StringOrList::Single(s) => std::slice::from_ref(s),
            StringOrList::Multiple(list) => list,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ContainerBlock {
    Image(String),
    Spec(JobContainer),
}

#[derive(Debug, Deserialize)]
pub struct JobContainer {
    pub image: String,
    #[serde(default)]
    pub options: String,
    #[serde(default, deserialize_with = "de_string_map")]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct Strategy {
    #[serde(default)]
    pub matrix: Option<serde_yaml::Value>,
    #[serde(rename = "fail-fast", default)]
    pub fail_fast: Option<bool>,
    #[serde(rename = "max-parallel", default)]
    pub max_parallel: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Step {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub uses: Option<String>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(rename = "if", default, deserialize_with = "de_expr")]
    pub if_expr: String,
    #[serde(default, deserialize_with = "de_string_map")]
    pub with: HashMap<String, String>,
    #[serde(default, deserialize_with = "de_string_map")]
    pub env: HashMap<String, String>,
    #[serde(rename = "continue-on-error", default)]
    pub continue_on_error: bool,
    #[serde(rename = "working-directory", default)]
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    Run,
    UsesLocalAction,
    UsesDockerImage,
    UsesActionRemote,
    Invalid,
}

impl Step {
    pub fn step_type(&self) -> StepType {
        if self.run.is_some() {
            StepType::Run
        } else if let Some(uses) = &self.uses {
            if uses.starts_with("docker://") {
                StepType::UsesDockerImage
            } else if uses.starts_with("./") || uses.starts_with(".\\") {
                StepType::UsesLocalAction
            } else {
                StepType::UsesActionRemote
            }
        } else {
            StepType::Invalid
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{}", name)
        } else if let Some(uses) = &self.uses {
            write!(f, "{}", uses)
        } else if let Some(run) = &self.run {
            write!(f, "{}", run.lines().next().unwrap_or(""))
        } else {
            write!(f, "{}", self.id)
        }
    }
}

/// A reference to an action hosted on a forge: `org/repo[/path]@ref`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAction {
    pub org: String,
    pub repo: String,
    pub path: String,
    pub git_ref: Option<String>,
}

impl RemoteAction {
    pub fn parse(uses: &str) -> Option<RemoteAction> {
        if uses.starts_with("docker://") || uses.starts_with("./") {
            return None;
        }
        let (spec, git_ref) = match uses.split_once('@') {
            Some((spec, r)) => (spec, Some(r.to_string())),
            None => (uses, None),
        };
        let mut parts = spec.splitn(3, '/');
        let org = parts.next()?.to_string();
        let repo = parts.next()?.to_string();
        if org.is_empty() || repo.is_empty() {
            return None;
        }
        let path = parts.next().unwrap_or("").to_string();
        Some(RemoteAction {
            org,
            repo,
            path,
            git_ref,
        })
    }

    pub fn is_checkout(&self) -> bool {
        self.org == "actions" && self.repo == "checkout"
    }

    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.org, self.repo)
    }

    pub fn clone_url(&self, instance: &str) -> String {
        format!("https://{}/{}/{}", instance, self.org, self.repo)
    }
}

/// A reusable action definition (`action.yml`).
#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub inputs: IndexMap<String, ActionInput>,
    #[serde(default)]
    pub outputs: IndexMap<String, ActionOutput>,
    pub runs: ActionRuns,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionInput {
    #[serde(default, deserialize_with = "de_opt_scalar")]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionOutput {
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionRuns {
    pub using: String,
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

pub fn parse_workflow(path: &Path) -> Result<Workflow, ExecutionError> {
    let content = fs::read_to_string(path)?;
    parse_workflow_str(&content)
}

pub fn parse_workflow_str(content: &str) -> Result<Workflow, ExecutionError> {
    let mut workflow: Workflow = serde_yaml::from_str(content)?;
    workflow.on = normalize_triggers(&workflow.on_raw)?;
    Ok(workflow)
}

/// Load an action definition from a directory containing `action.yml` or
/// `action.yaml`.
pub fn parse_action(dir: &Path) -> Result<Action, ExecutionError> {
    let action_yaml = dir.join("action.yml");
    let action_yaml_alt = dir.join("action.yaml");

    let action_file = if action_yaml.exists() {
        action_yaml
    } else if action_yaml_alt.exists() {
        action_yaml_alt
    } else {
        return Err(ExecutionError::Config(format!(
            "No action.yml or action.yaml found in {}",
            dir.display()
        )));
    };

    let content = fs::read_to_string(&action_file)?;
    let action: Action = serde_yaml::from_str(&content)?;
    Ok(action)
}

fn normalize_triggers(on_value: &serde_yaml::Value) -> Result<Vec<String>, ExecutionError> {
    let mut triggers = Vec::new();

    match on_value {
        serde_yaml::Value::Null => {}
        // on: push
        serde_yaml::Value::String(event) => {
            triggers.push(event.clone());
        }
        // on: [push, pull_request]
        serde_yaml::Value::Sequence(events) => {
            for event in events {
                if let Some(event_str) = event.as_str() {
                    triggers.push(event_str.to_string());
                }
            }
        }
        // on: {push: {branches: [main]}}
        serde_yaml::Value::Mapping(events_map) => {
            for (event, _) in events_map {
                if let Some(event_str) = event.as_str() {
                    triggers.push(event_str.to_string());
                }
            }
        }
        _ => {
            return Err(ExecutionError::Parse(
                "'on' section has invalid format".to_string(),
            ));
        }
    }

    Ok(triggers)
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}

// YAML lets users write numbers and booleans where the runner wants strings
// (`with: {fetch-depth: 0}`); accept any scalar and stringify it.
fn de_string_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: HashMap<String, serde_yaml::Value> = HashMap::deserialize(deserializer)?;
    let mut map = HashMap::with_capacity(raw.len());
    for (key, value) in raw {
        let value = scalar_to_string(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("non-scalar value for '{}'", key)))?;
        map.insert(key, value);
    }
    Ok(map)
}

fn de_expr<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_yaml::Value::deserialize(deserializer)?;
    scalar_to_string(&raw).ok_or_else(|| serde::de::Error::custom("non-scalar if expression"))
}

fn de_opt_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_yaml::Value::deserialize(deserializer)?;
    if raw.is_null() {
        return Ok(None);
    }
    scalar_to_string(&raw)
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom("non-scalar default value"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKFLOW: &str = r#"
name: CI
on: [push, pull_request]
env:
  GLOBAL: "1"
jobs:
  lint:
    runs-on: ubuntu-latest
    if: github.event_name == 'push'
    steps:
      - name: Check out
        uses: actions/checkout@v2
        with:
          fetch-depth: 0
      - id: fmt
        run: cargo fmt --check
        continue-on-error: true
  build:
    runs-on: [self-hosted, linux]
    needs: lint
    container:
      image: ubuntu:20.04
      options: --hostname builder
    outputs:
      artifact: ${{ steps.pack.outputs.file }}
    steps:
      - run: make
"#;

    #[test]
    fn test_parse_workflow_shapes() {
        let workflow = parse_workflow_str(WORKFLOW).unwrap();
        assert_eq!(workflow.name, "CI");
        assert_eq!(workflow.on, vec!["push", "pull_request"]);
        assert_eq!(workflow.env.get("GLOBAL").unwrap(), "1");

        let lint = &workflow.jobs["lint"];
        assert_eq!(lint.runs_on().unwrap(), ["ubuntu-latest"]);
        assert_eq!(lint.if_expr, "github.event_name == 'push'");
        assert_eq!(lint.steps[0].with.get("fetch-depth").unwrap(), "0");
        assert!(lint.steps[1].continue_on_error);
        assert_eq!(lint.steps[1].id, "fmt");

        let build = &workflow.jobs["build"];
        assert_eq!(build.runs_on().unwrap(), ["self-hosted", "linux"]);
        assert_eq!(build.container().unwrap().options, "--hostname builder");
        assert_eq!(
            build.outputs.get("artifact").unwrap(),
            "${{ steps.pack.outputs.file }}"
        );
    }

    #[test]
    fn test_step_types() {
        let run = Step {
            run: Some("echo hi".to_string()),
            ..Default::default()
        };
        assert_eq!(run.step_type(), StepType::Run);

        let local = Step {
            uses: Some("./actions/setup".to_string()),
            ..Default::default()
        };
        assert_eq!(local.step_type(), StepType::UsesLocalAction);

        let docker = Step {
            uses: Some("docker://alpine:3.19".to_string()),
            ..Default::default()
        };
        assert_eq!(docker.step_type(), StepType::UsesDockerImage);

        let remote = Step {
            uses: Some("actions/checkout@v2".to_string()),
            ..Default::default()
        };
        assert_eq!(remote.step_type(), StepType::UsesActionRemote);

        assert_eq!(Step::default().step_type(), StepType::Invalid);
    }

    #[test]
    fn test_remote_action_parsing() {
        let action = RemoteAction::parse("actions/checkout@v2").unwrap();
        assert_eq!(action.org, "actions");
        assert_eq!(action.repo, "checkout");
        assert_eq!(action.git_ref.as_deref(), Some("v2"));
        assert!(action.is_checkout());

        let nested = RemoteAction::parse("org/repo/path/to/action@main").unwrap();
        assert_eq!(nested.path, "path/to/action");
        assert!(!nested.is_checkout());
        assert_eq!(nested.clone_url("github.com"), "https://github.com/org/repo");

        assert!(RemoteAction::parse("./local/action").is_none());
        assert!(RemoteAction::parse("docker://alpine").is_none());
    }

    #[test]
    fn test_parse_composite_action() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("action.yml"),
            r#"
name: Greet
inputs:
  who:
    default: world
runs:
  using: composite
  steps:
    - run: echo "hello ${{ inputs.who }}"
      shell: bash
"#,
        )
        .unwrap();

        let action = parse_action(dir.path()).unwrap();
        assert_eq!(action.runs.using, "composite");
        assert_eq!(action.inputs["who"].default.as_deref(), Some("world"));
        assert_eq!(action.runs.steps.len(), 1);
    }
}

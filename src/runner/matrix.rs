use indexmap::IndexMap;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::HashMap;

use crate::common::ExecutionError;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MatrixConfig {
    #[serde(flatten)]
    pub parameters: IndexMap<String, Value>,
    #[serde(default)]
    pub include: Vec<HashMap<String, Value>>,
    #[serde(default)]
    pub exclude: Vec<HashMap<String, Value>>,
}

/// One concrete assignment of matrix parameters for a job instantiation.
pub type MatrixCombination = IndexMap<String, Value>;

/// Expands a `strategy.matrix` value into the list of combinations a job
/// runs with: the Cartesian product of the parameter arrays, minus `exclude`
/// matches, plus `include` entries. A job without a matrix yields one empty
/// combination.
pub fn expand_matrix(matrix: Option<&Value>) -> Result<Vec<MatrixCombination>, ExecutionError> {
    let matrix = match matrix {
        Some(value) => value,
        None => return Ok(vec![MatrixCombination::new()]),
    };

    let config: MatrixConfig = serde_yaml::from_value(matrix.clone())
        .map_err(|e| ExecutionError::Parse(format!("Invalid matrix: {}", e)))?;

    let mut combinations = Vec::new();
    generate_combinations(&config.parameters, 0, &mut MatrixCombination::new(), &mut combinations);
    combinations.retain(|combination| !is_excluded(combination, &config.exclude));

    for include_item in &config.include {
        let mut combination = MatrixCombination::new();
        for (key, value) in include_item {
            combination.insert(key.clone(), value.clone());
        }
        combinations.push(combination);
    }

    if combinations.is_empty() {
        return Err(ExecutionError::Config(
            "Matrix produced no combinations after applying filters".to_string(),
        ));
    }

    Ok(combinations)
}

fn generate_combinations(
    parameters: &IndexMap<String, Value>,
    depth: usize,
    current: &mut MatrixCombination,
    out: &mut Vec<MatrixCombination>,
) {
    if depth == parameters.len() {
        out.push(current.clone());
        return;
    }

    let (name, value) = match parameters.get_index(depth) {
        Some(entry) => entry,
        None => return,
    };

    // non-sequence parameters act as a single-element axis
    let values: Vec<Value> = match value {
        Value::Sequence(items) => items.clone(),
        other => vec![other.clone()],
    };

    for value in values {
        current.insert(name.clone(), value);
        generate_combinations(parameters, depth + 1, current, out);
    }
    current.shift_remove(name);
}

fn is_excluded(combination: &MatrixCombination, exclude: &[HashMap<String, Value>]) -> bool {
    exclude.iter().any(|pattern| {
        !pattern.is_empty()
            && pattern
                .iter()
                .all(|(key, value)| combination.get(key) == Some(value))
    })
}

/// Formats a combination for display, e.g. `build (os: ubuntu, node: 14)`.
pub fn format_combination_name(job_name: &str, combination: &MatrixCombination) -> String {
    if combination.is_empty() {
        return job_name.to_string();
    }
    let params = combination
        .iter()
        .map(|(k, v)| format!("{}: {}", k, value_to_string(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} ({})", job_name, params)
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Sequence(seq) => {
            let items = seq.iter().map(value_to_string).collect::<Vec<_>>().join(", ");
            format!("[{}]", items)
        }
        Value::Mapping(map) => {
            let items = map
                .iter()
                .filter_map(|(k, v)| {
                    k.as_str().map(|k| format!("{}: {}", k, value_to_string(v)))
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("{{{}}}", items)
        }
        _ => "unknown".to_string(),
    }
}

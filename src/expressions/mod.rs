mod eval;

pub use eval::EvalValue;

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::common::ExecutionError;
use crate::logging;
use eval::Evaluator;

/// Matches a `${{ ... }}` expression block, capturing the inner expression.
pub static EXPRESSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\{\s*(.+?)\s*\}\}").unwrap());

/// Matches a token that is exactly one logical/comparison operator.
pub static OPERATOR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:==|!=|<=|>=|<|>|&&|\|\||!)$").unwrap());

/// Evaluates expressions against a set of named context objects (`github`,
/// `env`, `matrix`, `steps`, `job`, `runner`, `inputs`, `secrets`). A fresh
/// evaluator is bound per step so lookups always see current state.
#[derive(Clone, Default)]
pub struct ExpressionEvaluator {
    contexts: HashMap<String, serde_json::Value>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        ExpressionEvaluator {
            contexts: HashMap::new(),
        }
    }

    pub fn with_context(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.contexts.insert(name.into(), value);
        self
    }

    pub fn context(&self, name: &str) -> Option<&serde_json::Value> {
        self.contexts.get(name)
    }

    /// Evaluate a bare expression (no `${{ }}` wrapper), returning its
    /// textual value and whether the value was of string type.
    pub fn evaluate(&self, expr: &str) -> Result<(String, bool), ExecutionError> {
        let value = Evaluator::evaluate(expr, &self.contexts)?;
        Ok((value.as_text(), value.is_string()))
    }

    /// Replace every `${{ ... }}` block in `input` with its evaluated text.
    /// Evaluation failures are logged and substitute an empty string.
    pub fn interpolate(&self, input: &str) -> String {
        EXPRESSION_PATTERN
            .replace_all(input, |caps: &regex::Captures| {
                let expr = &caps[1];
                match self.evaluate(expr) {
                    Ok((text, _)) => text,
                    Err(err) => {
                        logging::warning(&format!("Unable to interpolate '{}': {}", expr, err));
                        String::new()
                    }
                }
            })
            .into_owned()
    }

    /// Like [`interpolate`], but when the whole input is a single expression
    /// block also reports whether the evaluated value was a string. The
    /// boolean gate needs this to decide whether a `"false"` result must be
    /// re-quoted.
    pub fn interpolate_with_string_check(&self, input: &str) -> (String, bool) {
        let trimmed = input.trim();
        if let Some(caps) = EXPRESSION_PATTERN.captures(trimmed) {
            if let Some(whole) = caps.get(0) {
                if whole.start() == 0 && whole.end() == trimmed.len() {
                    match self.evaluate(&caps[1]) {
                        Ok((text, is_string)) => return (text, is_string),
                        Err(err) => {
                            logging::warning(&format!(
                                "Unable to interpolate '{}': {}",
                                trimmed, err
                            ));
                            return (String::new(), false);
                        }
                    }
                }
            }
        }
        (self.interpolate(input), false)
    }
}

use std::collections::HashMap;

use crate::common::ExecutionError;

/// A value produced by expression evaluation. The coercion rules mirror the
/// JavaScript-flavoured semantics of the upstream expression language:
/// `Boolean('false')` is true, `'' == 0` is true, and so on.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Json(serde_json::Value),
}

impl EvalValue {
    pub fn truthy(&self) -> bool {
        match self {
            EvalValue::Null => false,
            EvalValue::Bool(b) => *b,
            EvalValue::Number(n) => *n != 0.0 && !n.is_nan(),
            EvalValue::Str(s) => !s.is_empty(),
            EvalValue::Json(v) => !v.is_null(),
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, EvalValue::Str(_))
    }

    /// The textual rendering used for interpolation results.
    pub fn as_text(&self) -> String {
        match self {
            EvalValue::Null => "null".to_string(),
            EvalValue::Bool(b) => b.to_string(),
            EvalValue::Number(n) => format_number(*n),
            EvalValue::Str(s) => s.clone(),
            EvalValue::Json(v) => v.to_string(),
        }
    }

    fn as_number(&self) -> f64 {
        match self {
            EvalValue::Null => 0.0,
            EvalValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            EvalValue::Number(n) => *n,
            EvalValue::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            EvalValue::Json(_) => f64::NAN,
        }
    }

    fn loose_eq(&self, other: &EvalValue) -> bool {
        match (self, other) {
            (EvalValue::Null, EvalValue::Null) => true,
            (EvalValue::Null, _) | (_, EvalValue::Null) => false,
            (EvalValue::Str(a), EvalValue::Str(b)) => a == b,
            (EvalValue::Bool(a), EvalValue::Bool(b)) => a == b,
            // mixed types compare numerically, the way the upstream
            // evaluator coerces them ('false' == false is false: NaN)
            _ => {
                let (a, b) = (self.as_number(), other.as_number());
                !a.is_nan() && !b.is_nan() && a == b
            }
        }
    }

    fn compare(&self, other: &EvalValue) -> Option<std::cmp::Ordering> {
        if let (EvalValue::Str(a), EvalValue::Str(b)) = (self, other) {
            return Some(a.cmp(b));
        }
        let (a, b) = (self.as_number(), other.as_number());
        a.partial_cmp(&b)
    }
}

impl From<&serde_json::Value> for EvalValue {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => EvalValue::Null,
            serde_json::Value::Bool(b) => EvalValue::Bool(*b),
            serde_json::Value::Number(n) => EvalValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => EvalValue::Str(s.clone()),
            other => EvalValue::Json(other.clone()),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(f64),
    Ident(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExecutionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    if i >= chars.len() {
                        return Err(ExecutionError::Expression(format!(
                            "unterminated string in '{}'",
                            input
                        )));
                    }
                    // '' escapes a single quote inside a string literal
                    if chars[i] == '\'' {
                        if i + 1 < chars.len() && chars[i + 1] == '\'' {
                            value.push('\'');
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    value.push(chars[i]);
                    i += 1;
                }
                tokens.push(Token::Str(value));
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(ExecutionError::Expression(format!(
                        "unexpected '=' in '{}'",
                        input
                    )));
                }
            }
            '!' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if i + 1 < chars.len() && chars[i + 1] == '&' {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(ExecutionError::Expression(format!(
                        "unexpected '&' in '{}'",
                        input
                    )));
                }
            }
            '|' => {
                if i + 1 < chars.len() && chars[i + 1] == '|' {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(ExecutionError::Expression(format!(
                        "unexpected '|' in '{}'",
                        input
                    )));
                }
            }
            c if c.is_ascii_digit() || (c == '-' && next_is_digit(&chars, i)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text.parse::<f64>().map_err(|_| {
                    ExecutionError::Expression(format!("invalid number '{}'", text))
                })?;
                tokens.push(Token::Num(num));
            }
            // identifiers may contain hyphens (step and job ids do); there
            // is no arithmetic in this language so '-' is unambiguous here
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(ExecutionError::Expression(format!(
                    "unexpected character '{}' in '{}'",
                    other, input
                )));
            }
        }
    }

    Ok(tokens)
}

fn next_is_digit(chars: &[char], i: usize) -> bool {
    chars.get(i + 1).map(|c| c.is_ascii_digit()).unwrap_or(false)
}

/// Recursive-descent evaluator over the expression subset the engine feeds
/// it. Context roots (`env`, `github`, `matrix`, ...) are resolved against
/// the provided context map; unknown lookups yield null rather than errors,
/// matching the tolerant upstream behaviour.
pub struct Evaluator<'a> {
    tokens: Vec<Token>,
    pos: usize,
    contexts: &'a HashMap<String, serde_json::Value>,
}

impl<'a> Evaluator<'a> {
    pub fn evaluate(
        expr: &str,
        contexts: &'a HashMap<String, serde_json::Value>,
    ) -> Result<EvalValue, ExecutionError> {
        let tokens = tokenize(expr)?;
        if tokens.is_empty() {
            return Ok(EvalValue::Null);
        }
        let mut eval = Evaluator {
            tokens,
            pos: 0,
            contexts,
        };
        let value = eval.or_expr()?;
        if eval.pos != eval.tokens.len() {
            return Err(ExecutionError::Expression(format!(
                "trailing tokens in '{}'",
                expr
            )));
        }
        Ok(value)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExecutionError> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            other => Err(ExecutionError::Expression(format!(
                "expected {:?}, found {:?}",
                expected, other
            ))),
        }
    }

    fn or_expr(&mut self) -> Result<EvalValue, ExecutionError> {
        let mut left = self.and_expr()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let right = self.and_expr()?;
            // || yields its first truthy operand, like the upstream runtime
            if !left.truthy() {
                left = right;
            }
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<EvalValue, ExecutionError> {
        let mut left = self.equality_expr()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let right = self.equality_expr()?;
            if left.truthy() {
                left = right;
            }
        }
        Ok(left)
    }

    fn equality_expr(&mut self) -> Result<EvalValue, ExecutionError> {
        let mut left = self.relational_expr()?;
        loop {
            let negate = match self.peek() {
                Some(Token::Eq) => false,
                Some(Token::Ne) => true,
                _ => break,
            };
            self.advance();
            let right = self.relational_expr()?;
            let equal = left.loose_eq(&right);
            left = EvalValue::Bool(if negate { !equal } else { equal });
        }
        Ok(left)
    }

    fn relational_expr(&mut self) -> Result<EvalValue, ExecutionError> {
        let mut left = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => Token::Lt,
                Some(Token::Le) => Token::Le,
                Some(Token::Gt) => Token::Gt,
                Some(Token::Ge) => Token::Ge,
                _ => break,
            };
            self.advance();
            let right = self.unary_expr()?;
            let result = match left.compare(&right) {
                Some(ordering) => match op {
                    Token::Lt => ordering.is_lt(),
                    Token::Le => ordering.is_le(),
                    Token::Gt => ordering.is_gt(),
                    Token::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                },
                None => false,
            };
            left = EvalValue::Bool(result);
        }
        Ok(left)
    }

    fn unary_expr(&mut self) -> Result<EvalValue, ExecutionError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let value = self.unary_expr()?;
            return Ok(EvalValue::Bool(!value.truthy()));
        }
        self.primary_expr()
    }

    fn primary_expr(&mut self) -> Result<EvalValue, ExecutionError> {
        match self.advance() {
            Some(Token::Str(s)) => self.postfix(EvalValue::Str(s)),
            Some(Token::Num(n)) => Ok(EvalValue::Number(n)),
            Some(Token::LParen) => {
                let value = self.or_expr()?;
                self.expect(Token::RParen)?;
                self.postfix(value)
            }
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    let args = self.call_args()?;
                    let value = self.call_function(&name, args)?;
                    return self.postfix(value);
                }
                match name.as_str() {
                    "true" => Ok(EvalValue::Bool(true)),
                    "false" => Ok(EvalValue::Bool(false)),
                    "null" => Ok(EvalValue::Null),
                    _ => {
                        let root = match self.contexts.get(&name) {
                            Some(value) => EvalValue::from(value),
                            None => EvalValue::Null,
                        };
                        self.postfix(root)
                    }
                }
            }
            other => Err(ExecutionError::Expression(format!(
                "unexpected token {:?}",
                other
            ))),
        }
    }

    fn call_args(&mut self) -> Result<Vec<EvalValue>, ExecutionError> {
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.or_expr()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                other => {
                    return Err(ExecutionError::Expression(format!(
                        "expected ',' or ')', found {:?}",
                        other
                    )))
                }
            }
        }
        Ok(args)
    }

    fn postfix(&mut self, mut value: EvalValue) -> Result<EvalValue, ExecutionError> {
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let key = match self.advance() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(ExecutionError::Expression(format!(
                                "expected property name, found {:?}",
                                other
                            )))
                        }
                    };
                    value = index_value(&value, &EvalValue::Str(key));
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let key = self.or_expr()?;
                    self.expect(Token::RBracket)?;
                    value = index_value(&value, &key);
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn call_function(
        &self,
        name: &str,
        args: Vec<EvalValue>,
    ) -> Result<EvalValue, ExecutionError> {
        match name {
            "Boolean" => {
                let arg = args.first().cloned().unwrap_or(EvalValue::Null);
                Ok(EvalValue::Bool(arg.truthy()))
            }
            "contains" => Ok(EvalValue::Bool(match args.as_slice() {
                [EvalValue::Json(serde_json::Value::Array(items)), needle] => items
                    .iter()
                    .any(|item| EvalValue::from(item).loose_eq(needle)),
                [haystack, needle] => haystack
                    .as_text()
                    .to_lowercase()
                    .contains(&needle.as_text().to_lowercase()),
                _ => false,
            })),
            "startsWith" => Ok(EvalValue::Bool(match args.as_slice() {
                [haystack, prefix] => haystack
                    .as_text()
                    .to_lowercase()
                    .starts_with(&prefix.as_text().to_lowercase()),
                _ => false,
            })),
            "endsWith" => Ok(EvalValue::Bool(match args.as_slice() {
                [haystack, suffix] => haystack
                    .as_text()
                    .to_lowercase()
                    .ends_with(&suffix.as_text().to_lowercase()),
                _ => false,
            })),
            "always" => Ok(EvalValue::Bool(true)),
            "cancelled" => Ok(EvalValue::Bool(false)),
            "success" => Ok(EvalValue::Bool(self.job_status() != "failure")),
            "failure" => Ok(EvalValue::Bool(self.job_status() == "failure")),
            other => Err(ExecutionError::Expression(format!(
                "unknown function '{}'",
                other
            ))),
        }
    }

    fn job_status(&self) -> String {
        self.contexts
            .get("job")
            .and_then(|job| job.get("status"))
            .and_then(|status| status.as_str())
            .unwrap_or("success")
            .to_string()
    }
}

fn index_value(value: &EvalValue, key: &EvalValue) -> EvalValue {
    let json = match value {
        EvalValue::Json(v) => v,
        _ => return EvalValue::Null,
    };
    match json {
        serde_json::Value::Object(map) => map
            .get(&key.as_text())
            .map(EvalValue::from)
            .unwrap_or(EvalValue::Null),
        serde_json::Value::Array(items) => {
            let idx = key.as_number();
            if idx.is_nan() || idx < 0.0 {
                return EvalValue::Null;
            }
            items
                .get(idx as usize)
                .map(EvalValue::from)
                .unwrap_or(EvalValue::Null)
        }
        _ => EvalValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contexts() -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert(
            "env".to_string(),
            json!({"FLAG": "false", "NAME": "runlet", "EMPTY": ""}),
        );
        map.insert(
            "github".to_string(),
            json!({
                "event_name": "push",
                "event": {"pull_request": {"base": {"ref": "main"}}},
                "ref": "refs/heads/main",
            }),
        );
        map.insert("matrix".to_string(), json!({"node": 14}));
        map.insert("job".to_string(), json!({"status": "success"}));
        map
    }

    fn eval(expr: &str) -> EvalValue {
        Evaluator::evaluate(expr, &contexts()).unwrap()
    }

    #[test]
    fn test_literals_and_lookups() {
        assert_eq!(eval("'hello'"), EvalValue::Str("hello".to_string()));
        assert_eq!(eval("42"), EvalValue::Number(42.0));
        assert_eq!(eval("true"), EvalValue::Bool(true));
        assert_eq!(eval("env.NAME"), EvalValue::Str("runlet".to_string()));
        assert_eq!(
            eval("github.event.pull_request.base.ref"),
            EvalValue::Str("main".to_string())
        );
        assert_eq!(eval("env.MISSING"), EvalValue::Null);
        assert_eq!(eval("env['NAME']"), EvalValue::Str("runlet".to_string()));
    }

    #[test]
    fn test_boolean_coercion_quirks() {
        // the string 'false' is a non-empty string, hence truthy
        assert_eq!(eval("Boolean('false')"), EvalValue::Bool(true));
        assert_eq!(eval("Boolean('')"), EvalValue::Bool(false));
        assert_eq!(eval("Boolean(0)"), EvalValue::Bool(false));
        assert_eq!(eval("Boolean(null)"), EvalValue::Bool(false));
        assert_eq!(eval("Boolean(env.MISSING)"), EvalValue::Bool(false));
    }

    #[test]
    fn test_loose_equality() {
        assert_eq!(eval("'false' == 'false'"), EvalValue::Bool(true));
        // mixed string/boolean comparison goes through numbers: NaN
        assert_eq!(eval("'false' == false"), EvalValue::Bool(false));
        assert_eq!(eval("'' == 0"), EvalValue::Bool(true));
        assert_eq!(eval("'14' == 14"), EvalValue::Bool(true));
        assert_eq!(eval("matrix.node == 14"), EvalValue::Bool(true));
        assert_eq!(eval("env.FLAG != 'false'"), EvalValue::Bool(false));
    }

    #[test]
    fn test_logical_operators_return_operands() {
        assert_eq!(eval("'a' && 'b'"), EvalValue::Str("b".to_string()));
        assert_eq!(eval("'' || 'fallback'"), EvalValue::Str("fallback".to_string()));
        assert_eq!(eval("!env.EMPTY"), EvalValue::Bool(true));
        assert_eq!(eval("!env.NAME"), EvalValue::Bool(false));
    }

    #[test]
    fn test_relational_operators() {
        assert_eq!(eval("1 < 2"), EvalValue::Bool(true));
        assert_eq!(eval("2 <= 2"), EvalValue::Bool(true));
        assert_eq!(eval("'b' > 'a'"), EvalValue::Bool(true));
        assert_eq!(eval("matrix.node >= 15"), EvalValue::Bool(false));
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval("contains('Hello World', 'world')"), EvalValue::Bool(true));
        assert_eq!(eval("startsWith('refs/heads/main', 'refs/heads')"), EvalValue::Bool(true));
        assert_eq!(eval("endsWith(github.ref, 'main')"), EvalValue::Bool(true));
        assert_eq!(eval("always()"), EvalValue::Bool(true));
        assert_eq!(eval("success()"), EvalValue::Bool(true));
        assert_eq!(eval("failure()"), EvalValue::Bool(false));
        assert_eq!(eval("cancelled()"), EvalValue::Bool(false));
    }

    #[test]
    fn test_hyphenated_identifiers() {
        let mut ctx = contexts();
        ctx.insert(
            "steps".to_string(),
            json!({"build-step": {"outputs": {"artifact": "out.tar"}}}),
        );
        let value = Evaluator::evaluate("steps.build-step.outputs.artifact", &ctx).unwrap();
        assert_eq!(value, EvalValue::Str("out.tar".to_string()));
    }

    #[test]
    fn test_errors() {
        assert!(Evaluator::evaluate("'unterminated", &contexts()).is_err());
        assert!(Evaluator::evaluate("env.NAME ==", &contexts()).is_err());
        assert!(Evaluator::evaluate("nosuchfn()", &contexts()).is_err());
    }
}

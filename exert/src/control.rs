//! Conditions for If/While exertions.
//!
//! A condition is a JEXL expression over named variables. Each variable is
//! bound to a path in either the exertion's local context or an explicit
//! shared context. Every identifier the expression reads must be bound;
//! unbound identifiers are rejected before evaluation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{shared_serde, Context, SharedContext};
use crate::error::ConditionError;

/// Where a variable's value is read from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BindingScope {
    /// The If's own context, or the While body's context.
    Local,
    /// An explicitly shared context.
    Shared(#[serde(with = "shared_serde")] SharedContext),
}

/// Binds an expression variable to a context path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VarBinding {
    pub name: String,
    pub path: String,
    pub scope: BindingScope,
}

/// A boolean JEXL expression with its variable bindings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Condition {
    pub expression: String,
    pub bindings: Vec<VarBinding>,
}

impl Condition {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            bindings: Vec::new(),
        }
    }

    /// Bind `name` to `path` in the local scope.
    pub fn bind(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.push_binding(name.into(), path.into(), BindingScope::Local);
        self
    }

    /// Bind `name` to `path` in `context`.
    pub fn bind_shared(
        mut self,
        name: impl Into<String>,
        path: impl Into<String>,
        context: &SharedContext,
    ) -> Self {
        self.push_binding(name.into(), path.into(), BindingScope::Shared(context.clone()));
        self
    }

    fn push_binding(&mut self, name: String, path: String, scope: BindingScope) {
        self.bindings.retain(|b| b.name != name);
        self.bindings.push(VarBinding { name, path, scope });
    }

    pub fn binding(&self, name: &str) -> Option<&VarBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    /// Top-level identifiers the expression reads, in first-use order.
    pub fn variables(&self) -> Vec<String> {
        scan_identifiers(&self.expression)
    }

    /// Fail on the first identifier with no binding.
    pub fn check_bound(&self) -> Result<(), ConditionError> {
        match self
            .variables()
            .into_iter()
            .find(|v| self.binding(v).is_none())
        {
            Some(variable) => Err(ConditionError::UnboundVariable {
                expression: self.expression.clone(),
                variable,
            }),
            None => Ok(()),
        }
    }

    /// Resolve every binding and evaluate the expression.
    ///
    /// Non-boolean results follow JavaScript truthiness.
    pub fn evaluate(&self, local: &Context) -> Result<bool, ConditionError> {
        self.check_bound()?;
        let mut scope = Map::new();
        for binding in &self.bindings {
            scope.insert(binding.name.clone(), self.read(binding, local)?);
        }
        let scope = Value::Object(scope);

        let result = jexl_eval::Evaluator::new()
            .eval_in_context(&self.expression, &scope)
            .map_err(|e| ConditionError::Evaluation {
                expression: self.expression.clone(),
                message: e.to_string(),
            })?;
        tracing::trace!(expression = %self.expression, %result, "condition evaluated");
        Ok(truthy(&result))
    }

    /// Read the current value of a bound variable.
    pub fn read(&self, binding: &VarBinding, local: &Context) -> Result<Value, ConditionError> {
        let value = match &binding.scope {
            BindingScope::Local => local.get(&binding.path),
            BindingScope::Shared(ctx) => ctx.read().get(&binding.path),
        };
        value.map_err(|source| ConditionError::Binding {
            variable: binding.name.clone(),
            source,
        })
    }

    /// Add `amount` to the numeric value bound to `variable`.
    pub fn increment(
        &self,
        variable: &str,
        amount: f64,
        local: &mut Context,
    ) -> Result<f64, ConditionError> {
        let binding = self
            .binding(variable)
            .ok_or_else(|| ConditionError::UnboundVariable {
                expression: self.expression.clone(),
                variable: variable.to_string(),
            })?;
        let to_binding_error = |source| ConditionError::Binding {
            variable: variable.to_string(),
            source,
        };
        let next = match &binding.scope {
            BindingScope::Local => {
                let next = local.get_f64(&binding.path).map_err(to_binding_error)? + amount;
                local.assign(&binding.path, next).map_err(to_binding_error)?;
                next
            }
            BindingScope::Shared(ctx) => {
                let mut guard = ctx.write();
                let next = guard.get_f64(&binding.path).map_err(to_binding_error)? + amount;
                guard.assign(&binding.path, next).map_err(to_binding_error)?;
                next
            }
        };
        Ok(next)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

const KEYWORDS: &[&str] = &["true", "false", "null", "in"];

/// Identifiers read as variables: skips string literals, numbers,
/// keywords, property accesses after `.`, and transforms after `|`.
fn scan_identifiers(expression: &str) -> Vec<String> {
    let chars: Vec<char> = expression.chars().collect();
    let mut found: Vec<String> = Vec::new();
    let mut previous: Option<char> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            i += 1;
            while i < chars.len() && chars[i] != c {
                if chars[i] == '\\' {
                    i += 1;
                }
                i += 1;
            }
            i += 1;
            previous = Some(c);
        } else if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
            previous = Some('0');
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            let member = matches!(previous, Some('.') | Some('|'));
            if !member && !KEYWORDS.contains(&ident.as_str()) && !found.contains(&ident) {
                found.push(ident);
            }
            previous = Some('a');
        } else {
            if !c.is_whitespace() {
                previous = Some(c);
            }
            i += 1;
        }
    }
    found
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use exert::{Context, Provider};
use parking_lot::Mutex;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Started,
    Finished,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub provider: String,
    pub selector: String,
    /// Name of the context the provider ran against.
    pub context: String,
    pub phase: Phase,
}

/// Ordered log of provider invocations, shared between providers.
#[derive(Clone, Default)]
pub struct InvocationLog {
    entries: Arc<Mutex<Vec<Invocation>>>,
}

impl InvocationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, provider: &str, selector: &str, context: &str, phase: Phase) {
        self.entries.lock().push(Invocation {
            provider: provider.to_string(),
            selector: selector.to_string(),
            context: context.to_string(),
            phase,
        });
    }

    pub fn entries(&self) -> Vec<Invocation> {
        self.entries.lock().clone()
    }

    /// Context names in the order their invocations started.
    pub fn started(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|i| i.phase == Phase::Started)
            .map(|i| i.context.clone())
            .collect()
    }

    pub fn position(&self, context: &str, phase: Phase) -> Option<usize> {
        self.entries
            .lock()
            .iter()
            .position(|i| i.context == context && i.phase == phase)
    }

    pub fn assert_finished_before_started(&self, first: &str, then: &str) {
        let finished = self.position(first, Phase::Finished);
        let started = self.position(then, Phase::Started);
        match (finished, started) {
            (Some(f), Some(s)) => assert!(
                f < s,
                "{then} started at {s} before {first} finished at {f}: {:?}",
                self.entries()
            ),
            _ => panic!(
                "missing invocations for {first} or {then}: {:?}",
                self.entries()
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Arithmetic over every `arg/*` input of the context, in declaration
/// order. Selectors: `add`, `subtract`, `multiply`, `divide`, `average`.
#[derive(Clone)]
pub struct Arithmetic {
    name: String,
    delay: Duration,
    log: Option<InvocationLog>,
}

impl Arithmetic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            log: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_log(mut self, log: InvocationLog) -> Self {
        self.log = Some(log);
        self
    }

    fn operands(context: &Context) -> anyhow::Result<Vec<f64>> {
        let paths: Vec<String> = context
            .input_paths()
            .into_iter()
            .filter(|p| p.starts_with("arg/"))
            .map(str::to_string)
            .collect();
        if paths.is_empty() {
            anyhow::bail!("context '{}' has no arg/* inputs", context.name());
        }
        paths
            .iter()
            .map(|p| context.get_f64(p).map_err(anyhow::Error::from))
            .collect()
    }

    fn log(&self, selector: &str, context: &Context, phase: Phase) {
        if let Some(log) = &self.log {
            log.record(&self.name, selector, context.name(), phase);
        }
    }
}

#[async_trait]
impl Provider for Arithmetic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, selector: &str, context: &mut Context) -> anyhow::Result<Option<Value>> {
        self.log(selector, context, Phase::Started);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let operands = Self::operands(context)?;
        let (first, rest) = operands
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("no operands"))?;
        let result = match selector {
            "add" => operands.iter().sum(),
            "subtract" => rest.iter().fold(*first, |acc, x| acc - x),
            "multiply" => operands.iter().product(),
            "divide" => {
                if rest.iter().any(|x| *x == 0.0) {
                    anyhow::bail!("division by zero");
                }
                rest.iter().fold(*first, |acc, x| acc / x)
            }
            "average" => operands.iter().sum::<f64>() / operands.len() as f64,
            other => anyhow::bail!("unknown selector '{other}'"),
        };
        tracing::debug!(provider = %self.name, selector, result, "arithmetic evaluated");

        self.log(selector, context, Phase::Finished);
        Ok(Some(Value::from(result)))
    }
}

/// Always fails with the configured message.
#[derive(Clone)]
pub struct Failing {
    name: String,
    message: String,
}

impl Failing {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Provider for Failing {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _selector: &str, _context: &mut Context) -> anyhow::Result<Option<Value>> {
        anyhow::bail!("{}", self.message)
    }
}

/// Panics on every invocation. Exercises panic isolation in PAR jobs.
#[derive(Clone)]
pub struct Panicking {
    name: String,
}

impl Panicking {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Provider for Panicking {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, selector: &str, _context: &mut Context) -> anyhow::Result<Option<Value>> {
        panic!("{} panicked in {selector}", self.name)
    }
}

/// Writes `value` to `path` directly, ignoring the selector. Exercises
/// direction checks on provider writes.
#[derive(Clone)]
pub struct Writer {
    name: String,
    path: String,
    value: Value,
}

impl Writer {
    pub fn new(name: impl Into<String>, path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl Provider for Writer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _selector: &str, context: &mut Context) -> anyhow::Result<Option<Value>> {
        context.set_value(&self.path, self.value.clone())?;
        Ok(None)
    }
}

/// Adds `amount` to the number at `path` on every invocation and returns
/// the new value. The path must be writable (`Out` or `InOut`).
#[derive(Clone)]
pub struct Incrementer {
    name: String,
    path: String,
    amount: f64,
}

impl Incrementer {
    pub fn new(name: impl Into<String>, path: impl Into<String>, amount: f64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            amount,
        }
    }
}

#[async_trait]
impl Provider for Incrementer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _selector: &str, context: &mut Context) -> anyhow::Result<Option<Value>> {
        let next = context.get_f64(&self.path)? + self.amount;
        context.set_value(&self.path, next)?;
        Ok(Some(Value::from(next)))
    }
}

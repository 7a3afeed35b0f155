//! Reference pipeline: a cloud spend review.
//!
//! `triage` classifies the request, `usage_data` and `cost_data` gather
//! figures through their tools, `optimizer` turns them into
//! recommendations, and `reporter` summarizes. The tools return synthetic
//! figures derived from the account name.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::agent::{AgentContract, AgentRegistry, StageError, StageInput};
use conduit_core::context::ExecutionContext;
use conduit_core::stage::StageKind;
use conduit_core::tools::{Tool, ToolError, ToolRegistry};
use serde_json::{json, Value};

/// Stage names in pipeline order.
pub const STAGES: [&str; 5] = ["triage", "usage_data", "cost_data", "optimizer", "reporter"];

/// Agents of the reference pipeline.
pub fn agents() -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry.register(Arc::new(Triage));
    registry.register(Arc::new(Gather {
        name: "usage_data",
        tool: "usage_lookup",
    }));
    registry.register(Arc::new(Gather {
        name: "cost_data",
        tool: "cost_lookup",
    }));
    registry.register(Arc::new(Optimizer));
    registry.register(Arc::new(Reporter));
    registry
}

/// Tools the reference pipeline calls.
pub fn tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(UsageLookup));
    registry.register(Arc::new(CostLookup));
    registry
}

fn account_of(request: &Value) -> Result<&str, StageError> {
    request
        .get("account")
        .and_then(Value::as_str)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| StageError::Failed("request has no `account`".into()))
}

/// Stable pseudo-random figure in `0..modulo` derived from `seed`.
fn figure(seed: &str, modulo: u64) -> u64 {
    seed.bytes()
        .fold(17_u64, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(b)))
        % modulo
}

struct Triage;

#[async_trait]
impl AgentContract for Triage {
    fn name(&self) -> &str {
        "triage"
    }

    fn stage_kind(&self) -> StageKind {
        StageKind::Triage
    }

    async fn execute(
        &self,
        _context: &ExecutionContext,
        input: StageInput<'_>,
    ) -> Result<Value, StageError> {
        let account = account_of(input.request)?;
        let question = input
            .request
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let intent = if question.contains("report") { "report" } else { "optimize" };
        input.progress.thinking(&format!("classified request as `{intent}`"));
        Ok(json!({ "account": account, "intent": intent }))
    }
}

/// Data stage that forwards the account to one lookup tool.
struct Gather {
    name: &'static str,
    tool: &'static str,
}

#[async_trait]
impl AgentContract for Gather {
    fn name(&self) -> &str {
        self.name
    }

    fn stage_kind(&self) -> StageKind {
        StageKind::Data
    }

    fn required_tools(&self) -> Vec<String> {
        vec![self.tool.to_owned()]
    }

    async fn execute(
        &self,
        _context: &ExecutionContext,
        input: StageInput<'_>,
    ) -> Result<Value, StageError> {
        let account = account_of(input.request)?;
        Ok(input.tools.invoke(self.tool, json!({ "account": account })).await?)
    }
}

struct Optimizer;

#[async_trait]
impl AgentContract for Optimizer {
    fn name(&self) -> &str {
        "optimizer"
    }

    fn stage_kind(&self) -> StageKind {
        StageKind::Optimization
    }

    async fn execute(
        &self,
        _context: &ExecutionContext,
        input: StageInput<'_>,
    ) -> Result<Value, StageError> {
        let usage = input
            .upstream
            .get("usage_data")
            .ok_or_else(|| StageError::Failed("usage figures missing".into()))?;
        let cost = input
            .upstream
            .get("cost_data")
            .ok_or_else(|| StageError::Failed("cost figures missing".into()))?;
        let hours = usage["hours"].as_f64().unwrap_or_default();
        let utilization = usage["utilization"].as_f64().unwrap_or_default();
        let rate = cost["hourly_rate"].as_f64().unwrap_or_default();

        let mut recommendations = Vec::new();
        if utilization < 0.4 {
            let savings = hours * rate * (1.0 - utilization) * 0.5;
            input.progress.partial(json!({ "rightsizing_savings": savings }));
            recommendations.push(json!({
                "action": "rightsize",
                "monthly_savings": savings,
            }));
        }
        if hours > 600.0 {
            recommendations.push(json!({
                "action": "reserve_capacity",
                "monthly_savings": hours * rate * 0.3,
            }));
        }
        Ok(json!({ "recommendations": recommendations }))
    }
}

struct Reporter;

#[async_trait]
impl AgentContract for Reporter {
    fn name(&self) -> &str {
        "reporter"
    }

    fn stage_kind(&self) -> StageKind {
        StageKind::Reporting
    }

    async fn execute(
        &self,
        _context: &ExecutionContext,
        input: StageInput<'_>,
    ) -> Result<Value, StageError> {
        let recommendations = input
            .upstream
            .get("optimizer")
            .and_then(|o| o["recommendations"].as_array())
            .map_or(0, Vec::len);
        let account = account_of(input.request)?;
        Ok(json!({
            "summary": format!("{recommendations} recommendation(s) for {account}"),
            "recommendations": recommendations,
        }))
    }
}

fn lookup_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "account": { "type": "string" } },
        "required": ["account"],
    })
}

fn account_input<'a>(tool: &str, input: &'a Value) -> Result<&'a str, ToolError> {
    input["account"].as_str().ok_or_else(|| ToolError::InvalidInput {
        tool: tool.to_owned(),
        message: "`account` must be a string".into(),
    })
}

struct UsageLookup;

#[async_trait]
impl Tool for UsageLookup {
    fn name(&self) -> &str {
        "usage_lookup"
    }

    fn input_schema(&self) -> Value {
        lookup_schema()
    }

    async fn call(&self, input: Value) -> Result<Value, ToolError> {
        let account = account_input(self.name(), &input)?;
        #[allow(clippy::cast_precision_loss)]
        let utilization = figure(account, 90) as f64 / 100.0 + 0.05;
        Ok(json!({
            "account": account,
            "hours": 400 + figure(account, 344),
            "utilization": utilization,
        }))
    }
}

struct CostLookup;

#[async_trait]
impl Tool for CostLookup {
    fn name(&self) -> &str {
        "cost_lookup"
    }

    fn input_schema(&self) -> Value {
        lookup_schema()
    }

    async fn call(&self, input: Value) -> Result<Value, ToolError> {
        let account = account_input(self.name(), &input)?;
        #[allow(clippy::cast_precision_loss)]
        let hourly_rate = (10 + figure(account, 90)) as f64 / 100.0;
        Ok(json!({
            "account": account,
            "hourly_rate": hourly_rate,
            "currency": "USD",
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::ids::{ThreadId, UserId};
    use conduit_runtime::engine::RunRequest;
    use conduit_runtime::record::RunStatus;
    use conduit_runtime::{Runtime, RuntimeConfig, RuntimeDeps, StartRun};

    fn make_runtime() -> Runtime {
        let (runtime, _events) = Runtime::new(RuntimeDeps {
            config: RuntimeConfig::default(),
            agents: Arc::new(agents()),
            tools: Arc::new(tools()),
            archive: None,
        });
        runtime
    }

    fn request(input: Value) -> StartRun {
        StartRun::new(
            UserId::from("alice"),
            ThreadId::from("t1"),
            RunRequest {
                stages: STAGES.iter().map(|s| (*s).to_owned()).collect(),
                input,
            },
        )
    }

    #[test]
    fn figures_are_stable() {
        assert_eq!(figure("acme", 1000), figure("acme", 1000));
        assert!(figure("acme", 10) < 10);
    }

    #[tokio::test]
    async fn full_pipeline_completes() {
        let runtime = make_runtime();
        let started = runtime
            .start_run(request(json!({ "account": "acme", "question": "where can we save?" })))
            .unwrap();
        assert_eq!(started.stages.len(), STAGES.len());
        let outcome = started.join.await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(outcome.failed_stages.is_empty());
    }

    #[tokio::test]
    async fn missing_account_fails_the_run() {
        let runtime = make_runtime();
        let started = runtime.start_run(request(json!({}))).unwrap();
        let outcome = started.join.await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.failed_stages.contains(&"triage".to_owned()));
    }

    #[tokio::test]
    async fn lookup_tools_validate_input() {
        let err = UsageLookup.call(json!({ "account": 3 })).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput { .. }));
        let out = CostLookup.call(json!({ "account": "acme" })).await.unwrap();
        assert_eq!(out["currency"], "USD");
    }
}

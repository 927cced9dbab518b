use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::clock::SessionClock;
use crate::data::McpCallRecord;
use crate::error::TarsyError;
use crate::hookbus::HookBus;
use crate::iteration::react::{is_done_sentinel, parse_react, Directive};
use crate::llm::{LlmClient, LlmRequest, LlmToolSchema};
use crate::types::{IterationStrategy, StageStatus};

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
const SOFT_RETRY_BUDGET: u32 = 2;
const LLM_TIMEOUT: Duration = Duration::from_secs(60);
const MCP_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves a prefixed tool name (`server_id__tool_name`) to the MCP server
/// that owns it and invokes it there. Implemented over `McpConnectionPool`
/// in production; mocked directly in iteration-controller tests.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn call(&self, prefixed_name: &str, arguments: Value) -> Result<(String, Value), TarsyError>;
}

pub struct StageOutcome {
    pub status: StageStatus,
    pub analysis: Option<String>,
    pub mcp_results: HashMap<String, Vec<McpCallRecord>>,
    pub error: Option<String>,
}

impl StageOutcome {
    fn success(analysis: Option<String>, mcp_results: HashMap<String, Vec<McpCallRecord>>) -> Self {
        Self { status: StageStatus::Success, analysis, mcp_results, error: None }
    }

    fn error(message: String, mcp_results: HashMap<String, Vec<McpCallRecord>>) -> Self {
        Self { status: StageStatus::Error, analysis: None, mcp_results, error: Some(message) }
    }
}

/// Runs one stage's bounded iteration loop: call the model, act on what it
/// says, repeat until it produces a final answer, exhausts `max_iterations`,
/// or is cancelled. Every strategy shares this one loop; only how a
/// completion is interpreted (native tool call vs free-text Action) and
/// whether a final answer is recorded as analysis differs.
#[allow(clippy::too_many_arguments)]
pub async fn run_stage(
    llm: &dyn LlmClient,
    dispatcher: &dyn ToolDispatcher,
    hookbus: &HookBus,
    clock: &SessionClock,
    cancellation: &CancellationToken,
    model: &str,
    strategy: IterationStrategy,
    mut messages: Vec<Value>,
    tools: Vec<LlmToolSchema>,
    max_iterations: u32,
) -> StageOutcome {
    let mut mcp_results: HashMap<String, Vec<McpCallRecord>> = HashMap::new();
    let mut soft_retries = 0u32;

    for iteration in 0..max_iterations {
        if cancellation.is_cancelled() {
            return StageOutcome::error("cancelled".into(), mcp_results);
        }

        let request = LlmRequest {
            model: model.to_string(),
            messages: messages.clone(),
            tools: if strategy.uses_native_tool_calls() { tools.clone() } else { Vec::new() },
        };
        let ts_us = clock.now_us();

        let completion = tokio::select! {
            _ = cancellation.cancelled() => return StageOutcome::error("cancelled".into(), mcp_results),
            res = tokio::time::timeout(LLM_TIMEOUT, llm.complete(request.clone())) => res,
        };

        let completion = match completion {
            Ok(Ok(c)) => {
                hookbus
                    .emit_llm(
                        ts_us,
                        json!(request.messages),
                        c.text.clone(),
                        c.tool_call.as_ref().map(|t| json!(t)),
                        c.usage,
                        None,
                    )
                    .await;
                c
            }
            Ok(Err(e)) => {
                hookbus.emit_llm(ts_us, json!(request.messages), None, None, None, Some(e.to_string())).await;
                if iteration + 1 >= max_iterations {
                    return StageOutcome::error(e.to_string(), mcp_results);
                }
                continue;
            }
            Err(_elapsed) => {
                hookbus.emit_llm(ts_us, json!(request.messages), None, None, None, Some("llm call timed out".into())).await;
                if iteration + 1 >= max_iterations {
                    return StageOutcome::error("llm call timed out".into(), mcp_results);
                }
                continue;
            }
        };

        if strategy.uses_native_tool_calls() {
            if let Some(tool_call) = completion.tool_call {
                let tool_call_id = tool_call.id.clone().unwrap_or_default();
                messages.push(json!({
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": tool_call_id.clone(),
                        "type": "function",
                        "function": { "name": tool_call.name.clone(), "arguments": tool_call.arguments.to_string() },
                    }],
                }));

                let observation = call_tool(dispatcher, hookbus, clock, cancellation, &tool_call.name, tool_call.arguments, &mut mcp_results).await;
                let content = match observation {
                    Ok(v) => v.to_string(),
                    Err(e) if e.recoverable() => e.to_string(),
                    Err(e) => return StageOutcome::error(e.to_string(), mcp_results),
                };
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": content,
                }));
                continue;
            }

            if let Some(text) = completion.text {
                return StageOutcome::success(Some(text), mcp_results);
            }

            soft_retries += 1;
            if soft_retries > SOFT_RETRY_BUDGET {
                return StageOutcome::error("unparseable llm response: no tool call or content".into(), mcp_results);
            }
            messages.push(json!({ "role": "user", "content": "Respond with either a tool call or a final answer." }));
            continue;
        }

        let text = completion.text.unwrap_or_default();
        messages.push(json!({ "role": "assistant", "content": text }));

        match parse_react(&text) {
            Some(Directive::ToolCall { name, arguments }) if strategy.allows_tools() => {
                let observation = call_tool(dispatcher, hookbus, clock, cancellation, &name, arguments, &mut mcp_results).await;
                match observation {
                    Ok(v) => messages.push(json!({ "role": "user", "content": format!("Observation: {v}") })),
                    Err(e) if e.recoverable() => messages.push(json!({ "role": "user", "content": format!("Observation: {e}") })),
                    Err(e) => return StageOutcome::error(e.to_string(), mcp_results),
                }
            }
            Some(Directive::FinalAnswer(answer)) => {
                if strategy == IterationStrategy::ReactTools {
                    if is_done_sentinel(&answer) {
                        return StageOutcome::success(None, mcp_results);
                    }
                    soft_retries += 1;
                    if soft_retries > SOFT_RETRY_BUDGET {
                        return StageOutcome::error("unparseable llm response: expected DONE".into(), mcp_results);
                    }
                    messages.push(json!({ "role": "user", "content": "Reply with DONE on its own line once data collection is complete." }));
                } else if strategy.produces_analysis() {
                    return StageOutcome::success(Some(answer), mcp_results);
                }
            }
            _ => {
                soft_retries += 1;
                if soft_retries > SOFT_RETRY_BUDGET {
                    return StageOutcome::error(format!("unparseable llm response: {text}"), mcp_results);
                }
                messages.push(json!({
                    "role": "user",
                    "content": "Could not parse a directive. Respond with Action/Action Input or Final Answer.",
                }));
            }
        }
    }

    StageOutcome::error("iteration budget exhausted".into(), mcp_results)
}

async fn call_tool(
    dispatcher: &dyn ToolDispatcher,
    hookbus: &HookBus,
    clock: &SessionClock,
    cancellation: &CancellationToken,
    prefixed_name: &str,
    arguments: Value,
    mcp_results: &mut HashMap<String, Vec<McpCallRecord>>,
) -> Result<Value, TarsyError> {
    let ts_us = clock.now_us();

    let outcome = tokio::select! {
        _ = cancellation.cancelled() => Err(TarsyError::Cancelled),
        res = tokio::time::timeout(MCP_TIMEOUT, dispatcher.call(prefixed_name, arguments.clone())) => {
            res.map_err(|_| TarsyError::Timeout(format!("mcp call to '{prefixed_name}' timed out")))?
        }
    };

    match outcome {
        Ok((server_id, result)) => {
            hookbus.emit_mcp(ts_us, server_id.clone(), prefixed_name, arguments.clone(), Some(result.clone()), None).await;
            mcp_results
                .entry(server_id)
                .or_default()
                .push(McpCallRecord::success(prefixed_name.to_string(), arguments, result.clone(), ts_us));
            Ok(result)
        }
        Err(e) => {
            hookbus.emit_mcp(ts_us, "unknown", prefixed_name, arguments.clone(), None, Some(e.to_string())).await;
            mcp_results
                .entry("unknown".to_string())
                .or_default()
                .push(McpCallRecord::failure(prefixed_name.to_string(), arguments, e.to_string(), ts_us));
            Err(e)
        }
    }
}

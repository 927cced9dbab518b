use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentRuntime;
use crate::audit::{AlertSessionRow, AuditStore, NewAlertSession, NewStageExecution, Page, SessionFilter, SessionTimeline};
use crate::chain::ChainRegistry;
use crate::clock::SessionClock;
use crate::data::{AlertProcessingData, StageResult};
use crate::hookbus::{self, HookBus, LifecycleKind};
use crate::llm::LlmClient;
use crate::mcp::{McpBackend, McpConnectionPool, McpRegistry};
use crate::runbook::RunbookFetcher;
use crate::types::{IterationStrategy, SessionStatus, StageStatus};

pub struct AlertService {
    chains: ChainRegistry,
    agents: crate::agent::AgentRegistry,
    mcp_registry: McpRegistry,
    mcp_pool: McpConnectionPool,
    llm: Arc<dyn LlmClient>,
    audit: Arc<dyn AuditStore>,
    hookbus: HookBus,
    clock: SessionClock,
    runbook_fetcher: Arc<dyn RunbookFetcher>,
    semaphore: Arc<Semaphore>,
    model: String,
}

impl AlertService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chains: ChainRegistry,
        agents: crate::agent::AgentRegistry,
        mcp_registry: McpRegistry,
        mcp_pool: McpConnectionPool,
        llm: Arc<dyn LlmClient>,
        audit: Arc<dyn AuditStore>,
        hookbus: HookBus,
        runbook_fetcher: Arc<dyn RunbookFetcher>,
        max_concurrent_alerts: usize,
        model: String,
    ) -> Self {
        Self {
            chains,
            agents,
            mcp_registry,
            mcp_pool,
            llm,
            audit,
            hookbus,
            clock: SessionClock::new(),
            runbook_fetcher,
            semaphore: Arc::new(Semaphore::new(max_concurrent_alerts)),
            model,
        }
    }

    /// Queues an alert for background processing and returns its session id
    /// immediately. The returned id is valid to query via
    /// `get_session_with_timeline` as soon as the background task acquires a
    /// concurrency permit and creates the session row.
    pub fn submit(self: &Arc<Self>, alert_type: String, alert_data: Value) -> String {
        let session_id = Uuid::new_v4().to_string();
        let service = Arc::clone(self);
        let returned_id = session_id.clone();

        tokio::spawn(async move {
            let _permit = match service.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let cancellation = CancellationToken::new();
            service.run_to_completion(session_id, alert_type, alert_data, &cancellation).await;
        });

        returned_id
    }

    /// The deterministic core pipeline: resolve the chain, fetch the
    /// runbook, run every stage in order, finalize. Exposed directly so
    /// tests can drive it without going through the concurrency-gated
    /// `submit` path.
    pub async fn run_to_completion(
        &self,
        session_id: String,
        alert_type: String,
        alert_data: Value,
        cancellation: &CancellationToken,
    ) {
        let created_at_us = self.clock.now_us();
        if let Err(e) = self
            .audit
            .create_session(NewAlertSession {
                session_id: session_id.clone(),
                alert_type: alert_type.clone(),
                alert_data: alert_data.clone(),
                created_at_us,
            })
            .await
        {
            tracing::error!(error = %e, session_id = %session_id, "failed to create session row");
            return;
        }
        self.hookbus.emit_lifecycle(session_id.clone(), created_at_us, LifecycleKind::SessionCreated, None).await;

        let chain = match self.chains.resolve(&alert_type) {
            Ok(chain) => chain,
            Err(e) => {
                let completed_at_us = self.clock.now_us();
                let _ = self.audit.finalize_session(&session_id, SessionStatus::Failed, Some(e.to_string()), None, completed_at_us).await;
                self.hookbus.emit_lifecycle(session_id.clone(), completed_at_us, LifecycleKind::SessionFinalized, Some(e.to_string())).await;
                return;
            }
        };
        let _ = self.audit.set_session_chain(&session_id, &chain.chain_id).await;

        let runbook_url = alert_data.get("runbook_url").and_then(Value::as_str).map(str::to_string);
        let mut data = AlertProcessingData::new(alert_type.clone(), alert_data.clone(), runbook_url.clone());

        if let Some(url) = &runbook_url {
            match self.runbook_fetcher.fetch(url).await {
                Ok(content) => data.runbook_content = Some(content),
                Err(e) => {
                    let ts_us = self.clock.now_us();
                    self.hookbus.emit_lifecycle(session_id.clone(), ts_us, LifecycleKind::RunbookFetchError, Some(e.to_string())).await;
                }
            }
        }

        let mut hard_stop = false;

        for stage in &chain.stages {
            if cancellation.is_cancelled() {
                let strategy = stage.iteration_strategy.unwrap_or(IterationStrategy::React);
                let stage_execution_id = Uuid::new_v4().to_string();
                let ts_us = self.clock.now_us();
                let _ = self
                    .audit
                    .create_stage_execution(NewStageExecution {
                        stage_execution_id: stage_execution_id.clone(),
                        session_id: session_id.clone(),
                        stage_id: stage.stage_id.clone(),
                        agent_id: stage.agent_id.clone(),
                        strategy: strategy.to_string(),
                        started_at_us: ts_us,
                    })
                    .await;
                self.hookbus.emit_lifecycle(session_id.clone(), ts_us, LifecycleKind::Cancelled, Some("cancelled".into())).await;
                let _ = self
                    .audit
                    .finalize_stage_execution(&stage_execution_id, StageStatus::Error, None, Some("cancelled".into()), ts_us)
                    .await;
                data.record_stage(stage.stage_id.clone(), StageResult::error(strategy, ts_us, "cancelled".into(), HashMap::new()));
                hard_stop = true;
                break;
            }

            let Some(agent) = self.agents.get(&stage.agent_id) else {
                tracing::error!(agent_id = %stage.agent_id, "chain references an agent missing at runtime");
                hard_stop = true;
                break;
            };
            let strategy = stage.iteration_strategy.or(agent.default_strategy).unwrap_or(IterationStrategy::React);

            let stage_execution_id = Uuid::new_v4().to_string();
            let started_at_us = self.clock.now_us();
            let _ = self
                .audit
                .create_stage_execution(NewStageExecution {
                    stage_execution_id: stage_execution_id.clone(),
                    session_id: session_id.clone(),
                    stage_id: stage.stage_id.clone(),
                    agent_id: agent.agent_id.clone(),
                    strategy: strategy.to_string(),
                    started_at_us,
                })
                .await;
            self.hookbus.emit_lifecycle(session_id.clone(), started_at_us, LifecycleKind::StageStarted, Some(stage.stage_id.clone())).await;

            let backend = McpBackend { registry: &self.mcp_registry, pool: &self.mcp_pool };
            let runtime = AgentRuntime::new(self.llm.as_ref(), &backend, &self.mcp_registry, &self.hookbus, &self.clock, &self.model);

            let result = hookbus::with_context(
                session_id.clone(),
                stage_execution_id.clone(),
                runtime.process_alert(&session_id, agent, strategy, &data, cancellation),
            )
            .await;

            let completed_at_us = self.clock.now_us();
            let _ = self
                .audit
                .finalize_stage_execution(
                    &stage_execution_id,
                    result.status,
                    result.analysis.clone(),
                    result.error.clone(),
                    completed_at_us,
                )
                .await;
            self.hookbus
                .emit_lifecycle(session_id.clone(), completed_at_us, LifecycleKind::StageFinalized, Some(stage.stage_id.clone()))
                .await;

            // Never short-circuit on stage failure: later analytical stages
            // may still synthesize a useful result from what ran so far.
            data.record_stage(stage.stage_id.clone(), result);

            if cancellation.is_cancelled() {
                self.hookbus.emit_lifecycle(session_id.clone(), completed_at_us, LifecycleKind::Cancelled, Some("cancelled".into())).await;
                hard_stop = true;
                break;
            }
        }

        let any_success = data.stage_outputs().iter().any(|(_, r)| r.is_success());
        let any_failure = data.stage_outputs().iter().any(|(_, r)| !r.is_success());

        let status = if hard_stop {
            SessionStatus::Failed
        } else if any_failure && any_success {
            SessionStatus::PartiallyFailed
        } else if any_failure {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };

        let error_message = data.stage_outputs().iter().rev().find_map(|(_, r)| r.error.clone());
        let final_analysis = final_analysis(&data, &chain.chain_id);
        let completed_at_us = self.clock.now_us();
        let _ = self.audit.finalize_session(&session_id, status, error_message.clone(), final_analysis, completed_at_us).await;
        self.hookbus.emit_lifecycle(session_id.clone(), completed_at_us, LifecycleKind::SessionFinalized, error_message).await;
    }

    pub async fn list_sessions(&self, filter: SessionFilter) -> Result<Page<AlertSessionRow>, crate::error::TarsyError> {
        self.audit.list_sessions(filter).await
    }

    pub async fn get_session_with_timeline(&self, session_id: &str) -> Result<Option<SessionTimeline>, crate::error::TarsyError> {
        self.audit.get_session_with_timeline(session_id).await
    }
}

/// Walks the chain's stage outputs in reverse and returns the first
/// successful stage's analysis. If no stage produced one — every stage
/// failed, or every successful stage was a data-collection-only strategy —
/// synthesizes a minimal summary instead of leaving the session with no
/// final word at all.
fn final_analysis(data: &AlertProcessingData, chain_id: &str) -> Option<String> {
    let found = data
        .stage_outputs()
        .iter()
        .rev()
        .find_map(|(_, r)| if r.is_success() { r.analysis.clone() } else { None });

    found.or_else(|| {
        Some(format!(
            "chain '{chain_id}' processed {} stage(s); no stage produced an analysis",
            data.stage_outputs().len()
        ))
    })
}

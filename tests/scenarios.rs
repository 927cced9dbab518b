//! End-to-end scenarios driving `AlertService::run_to_completion` directly,
//! against in-memory audit storage and scripted LLM/MCP/runbook adapters.
//! No network calls or subprocesses are made.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use tarsy::agent::{AgentConfig, AgentRegistry, AgentSource};
use tarsy::audit::{AuditStore, AuditSubscriber, InMemoryAuditStore, SessionFilter};
use tarsy::chain::{ChainDefinition, ChainRegistry, ChainStage};
use tarsy::error::TarsyError;
use tarsy::llm::{LlmClient, LlmCompletion, LlmRequest, MockLlmClient};
use tarsy::mcp::registry::McpClientFactory;
use tarsy::mcp::{McpClient, McpConnectionPool, McpRegistry, McpServerConfig, MockMcpClient, McpToolDef};
use tarsy::runbook::{MockRunbookFetcher, RunbookFetcher};
use tarsy::{AlertService, HookBus, IterationStrategy, SessionStatus};

// ─────────────────────────────────────────────────────────────────────────
// Test harness
// ─────────────────────────────────────────────────────────────────────────

/// Hands back a pre-registered `MockMcpClient` for each server id. A lookup
/// for any other id is a harness bug, not a runtime condition.
#[derive(Default)]
struct FixedMcpClientFactory {
    clients: HashMap<String, Arc<MockMcpClient>>,
}

impl FixedMcpClientFactory {
    fn with(mut self, server_id: impl Into<String>, client: Arc<MockMcpClient>) -> Self {
        self.clients.insert(server_id.into(), client);
        self
    }
}

#[async_trait]
impl McpClientFactory for FixedMcpClientFactory {
    async fn create(&self, config: &McpServerConfig) -> Result<Arc<dyn McpClient>, TarsyError> {
        self.clients
            .get(&config.server_id)
            .cloned()
            .map(|c| c as Arc<dyn McpClient>)
            .ok_or_else(|| TarsyError::UnknownMcpServer(config.server_id.clone()))
    }
}

/// Like `MockLlmClient`, but some scripted turns also flip a shared
/// cancellation token right after handing back their response — simulates
/// cancellation arriving while a stage is mid-flight rather than before it
/// ever starts.
struct CancelingLlmClient {
    cancellation: CancellationToken,
    responses: Mutex<VecDeque<(LlmCompletion, bool)>>,
}

impl CancelingLlmClient {
    fn new(cancellation: CancellationToken, responses: Vec<(LlmCompletion, bool)>) -> Self {
        Self { cancellation, responses: Mutex::new(responses.into_iter().collect()) }
    }
}

#[async_trait]
impl LlmClient for CancelingLlmClient {
    async fn complete(&self, _request: LlmRequest) -> Result<LlmCompletion, TarsyError> {
        let (completion, cancel_after) =
            self.responses.lock().await.pop_front().expect("CancelingLlmClient: no more scripted turns");
        if cancel_after {
            self.cancellation.cancel();
        }
        Ok(completion)
    }
}

fn kubernetes_mcp_server() -> McpServerConfig {
    McpServerConfig { server_id: "kubernetes".into(), enabled: true, command: "kubectl-mcp".into(), args: vec![], instructions: None }
}

struct Harness {
    service: Arc<AlertService>,
    audit: Arc<InMemoryAuditStore>,
}

#[derive(Default)]
struct HarnessConfig {
    chains: Vec<ChainDefinition>,
    agents: Vec<AgentConfig>,
    mcp_servers: Vec<McpServerConfig>,
    mcp_factory: FixedMcpClientFactory,
    llm: Option<Arc<dyn LlmClient>>,
    runbook_fetcher: Option<Arc<MockRunbookFetcher>>,
}

fn build_harness(cfg: HarnessConfig) -> Harness {
    let mut agents = AgentRegistry::new();
    for agent in cfg.agents {
        agents.insert(agent);
    }

    let mut mcp_registry = McpRegistry::new();
    for server in cfg.mcp_servers {
        mcp_registry.insert(server);
    }

    let chains = ChainRegistry::build(cfg.chains, vec![], &agents, &mcp_registry).expect("valid chain configuration");
    let mcp_pool = McpConnectionPool::new(Arc::new(cfg.mcp_factory));
    let audit = Arc::new(InMemoryAuditStore::new());

    let mut hookbus = HookBus::new();
    hookbus.subscribe(Arc::new(AuditSubscriber::new(audit.clone() as Arc<dyn AuditStore>)));

    let llm = cfg.llm.unwrap_or_else(|| Arc::new(MockLlmClient::new(Vec::new())) as Arc<dyn LlmClient>);
    let runbook_fetcher = cfg.runbook_fetcher.unwrap_or_else(|| Arc::new(MockRunbookFetcher::ok("")));

    let service = Arc::new(AlertService::new(
        chains,
        agents,
        mcp_registry,
        mcp_pool,
        llm as Arc<dyn LlmClient>,
        audit.clone() as Arc<dyn AuditStore>,
        hookbus,
        runbook_fetcher as Arc<dyn RunbookFetcher>,
        5,
        "test-model".into(),
    ));

    Harness { service, audit }
}

fn pod_crash_chain(stage_agent: &str) -> ChainDefinition {
    ChainDefinition {
        chain_id: "k8s-chain".into(),
        alert_types: vec!["PodCrashLoop".into()],
        stages: vec![ChainStage { stage_id: "investigate".into(), agent_id: stage_agent.into(), iteration_strategy: None }],
    }
}

fn kubernetes_agent() -> AgentConfig {
    AgentConfig {
        agent_id: "kubernetes-agent".into(),
        mcp_server_ids: vec!["kubernetes".into()],
        custom_instructions: None,
        default_strategy: Some(IterationStrategy::React),
        source: AgentSource::BuiltIn,
    }
}

// A single REACT stage calls a tool once, then answers. The session
// completes and the final analysis is the stage's own answer.
#[tokio::test]
async fn single_stage_tool_call_then_final_answer_completes() {
    let mcp_client = Arc::new(MockMcpClient::new(vec![McpToolDef {
        name: "get_pods".into(),
        description: Some("lists pods".into()),
        input_schema: None,
    }]));
    mcp_client.push_response("get_pods", Ok(json!({"pods": ["api-7f9"]}))).await;

    let llm = Arc::new(MockLlmClient::new(vec![
        LlmCompletion {
            text: Some("Thought: check pods\nAction: kubernetes__get_pods\nAction Input: {}".into()),
            tool_call: None,
            usage: None,
        },
        LlmCompletion {
            text: Some("Thought: done\nFinal Answer: pod api-7f9 is crash-looping due to OOM".into()),
            tool_call: None,
            usage: None,
        },
    ]));

    let harness = build_harness(HarnessConfig {
        chains: vec![pod_crash_chain("kubernetes-agent")],
        agents: vec![kubernetes_agent()],
        mcp_servers: vec![kubernetes_mcp_server()],
        mcp_factory: FixedMcpClientFactory::default().with("kubernetes", mcp_client.clone()),
        llm: Some(llm as Arc<dyn LlmClient>),
        runbook_fetcher: Some(Arc::new(MockRunbookFetcher::ok(""))),
    });

    let session_id = "s1".to_string();
    harness
        .service
        .run_to_completion(session_id.clone(), "PodCrashLoop".into(), json!({"pod": "api-7f9"}), &CancellationToken::new())
        .await;

    let timeline = harness.audit.get_session_with_timeline(&session_id).await.unwrap().expect("session recorded");
    assert_eq!(timeline.session.status, SessionStatus::Completed);
    assert_eq!(timeline.session.final_analysis.as_deref(), Some("pod api-7f9 is crash-looping due to OOM"));
    assert_eq!(timeline.stages.len(), 1);
    assert_eq!(timeline.llm_interactions.len(), 2);
    assert_eq!(timeline.mcp_interactions.len(), 1);

    let kinds: Vec<&str> = timeline.lifecycle_events.iter().map(|e| e.kind.as_str()).collect();
    assert!(kinds.contains(&"session_created"));
    assert!(kinds.contains(&"stage_started"));
    assert!(kinds.contains(&"stage_finalized"));
    assert!(kinds.contains(&"session_finalized"));

    assert_eq!(mcp_client.calls.lock().await.len(), 1);
}

// An alert type with no matching chain fails immediately, before any
// stage is ever created.
#[tokio::test]
async fn unknown_alert_type_fails_with_no_stages() {
    let harness = build_harness(HarnessConfig {
        chains: vec![pod_crash_chain("kubernetes-agent")],
        agents: vec![kubernetes_agent()],
        mcp_servers: vec![kubernetes_mcp_server()],
        ..HarnessConfig::default()
    });

    let session_id = "s2".to_string();
    harness
        .service
        .run_to_completion(session_id.clone(), "DiskFull".into(), json!({}), &CancellationToken::new())
        .await;

    let timeline = harness.audit.get_session_with_timeline(&session_id).await.unwrap().expect("session recorded");
    assert_eq!(timeline.session.status, SessionStatus::Failed);
    assert!(timeline.stages.is_empty());
    assert!(timeline.session.error_message.as_deref().unwrap().contains("DiskFull"));
}

// Non-short-circuiting: stage A fails (a recoverable MCP tool error is fed
// back as an observation on every iteration until its budget is exhausted)
// but stage B still runs and supplies the session's final analysis.
#[tokio::test]
async fn stage_failure_does_not_short_circuit_later_stages() {
    let mcp_client = Arc::new(MockMcpClient::new(vec![McpToolDef {
        name: "get_pods".into(),
        description: None,
        input_schema: None,
    }]));
    for _ in 0..tarsy::iteration::DEFAULT_MAX_ITERATIONS {
        mcp_client.push_response("get_pods", Err("kubectl: connection refused".into())).await;
    }

    let mut stage_a_turns: Vec<LlmCompletion> = (0..tarsy::iteration::DEFAULT_MAX_ITERATIONS)
        .map(|_| LlmCompletion {
            text: Some("Thought: check pods\nAction: kubernetes__get_pods\nAction Input: {}".into()),
            tool_call: None,
            usage: None,
        })
        .collect();
    // stage B: REACT_FINAL_ANALYSIS, no tools offered, synthesizes directly
    stage_a_turns.push(LlmCompletion { text: Some("Thought: summarize\nFinal Answer: partial".into()), tool_call: None, usage: None });
    let llm = Arc::new(MockLlmClient::new(stage_a_turns));

    let chain = ChainDefinition {
        chain_id: "k8s-chain".into(),
        alert_types: vec!["PodCrashLoop".into()],
        stages: vec![
            ChainStage { stage_id: "investigate".into(), agent_id: "kubernetes-agent".into(), iteration_strategy: None },
            ChainStage {
                stage_id: "summarize".into(),
                agent_id: "summary-agent".into(),
                iteration_strategy: Some(IterationStrategy::ReactFinalAnalysis),
            },
        ],
    };
    let summary_agent = AgentConfig {
        agent_id: "summary-agent".into(),
        mcp_server_ids: vec![],
        custom_instructions: None,
        default_strategy: None,
        source: AgentSource::Configured,
    };

    let harness = build_harness(HarnessConfig {
        chains: vec![chain],
        agents: vec![kubernetes_agent(), summary_agent],
        mcp_servers: vec![kubernetes_mcp_server()],
        mcp_factory: FixedMcpClientFactory::default().with("kubernetes", mcp_client.clone()),
        llm: Some(llm as Arc<dyn LlmClient>),
        runbook_fetcher: Some(Arc::new(MockRunbookFetcher::ok(""))),
    });

    let session_id = "s3".to_string();
    harness
        .service
        .run_to_completion(session_id.clone(), "PodCrashLoop".into(), json!({"pod": "api-7f9"}), &CancellationToken::new())
        .await;

    let timeline = harness.audit.get_session_with_timeline(&session_id).await.unwrap().expect("session recorded");
    assert_eq!(timeline.session.status, SessionStatus::PartiallyFailed);
    assert_eq!(timeline.session.final_analysis.as_deref(), Some("partial"));
    assert_eq!(timeline.stages.len(), 2, "both stages must be persisted even though the first failed");
    assert_eq!(timeline.stages[0].stage_id, "investigate");
    assert_eq!(timeline.stages[1].stage_id, "summarize");
    assert_eq!(timeline.stages[0].error_message.as_deref(), Some("iteration budget exhausted"));
    assert!(timeline.stages[1].error_message.is_none());

    let mcp_calls = mcp_client.calls.lock().await.len();
    assert_eq!(mcp_calls, tarsy::iteration::DEFAULT_MAX_ITERATIONS as usize, "every recoverable tool error is fed back and retried, not treated as a terminal stage failure");
}

// Every stage fails -> the session is Failed and the derived
// final_analysis falls back to the synthesized summary rather than silently
// leaving it empty.
#[tokio::test]
async fn all_stages_failing_yields_failed_session_with_fallback_analysis() {
    let mcp_client = Arc::new(MockMcpClient::new(vec![McpToolDef {
        name: "get_pods".into(),
        description: None,
        input_schema: None,
    }]));
    for _ in 0..tarsy::iteration::DEFAULT_MAX_ITERATIONS {
        mcp_client.push_response("get_pods", Err("timeout".into())).await;
    }

    let llm = Arc::new(MockLlmClient::new(
        (0..tarsy::iteration::DEFAULT_MAX_ITERATIONS)
            .map(|_| LlmCompletion {
                text: Some("Thought: check pods\nAction: kubernetes__get_pods\nAction Input: {}".into()),
                tool_call: None,
                usage: None,
            })
            .collect(),
    ));

    let harness = build_harness(HarnessConfig {
        chains: vec![pod_crash_chain("kubernetes-agent")],
        agents: vec![kubernetes_agent()],
        mcp_servers: vec![kubernetes_mcp_server()],
        mcp_factory: FixedMcpClientFactory::default().with("kubernetes", mcp_client),
        llm: Some(llm as Arc<dyn LlmClient>),
        runbook_fetcher: Some(Arc::new(MockRunbookFetcher::ok(""))),
    });

    let session_id = "s4".to_string();
    harness
        .service
        .run_to_completion(session_id.clone(), "PodCrashLoop".into(), json!({"pod": "api-7f9"}), &CancellationToken::new())
        .await;

    let timeline = harness.audit.get_session_with_timeline(&session_id).await.unwrap().expect("session recorded");
    assert_eq!(timeline.session.status, SessionStatus::Failed);
    assert_eq!(timeline.stages[0].error_message.as_deref(), Some("iteration budget exhausted"));
    assert!(timeline.session.final_analysis.as_deref().unwrap().contains("no stage produced an analysis"));
}

// A failed runbook fetch is non-fatal — the session still runs its chain
// and a lifecycle event records the failure.
#[tokio::test]
async fn runbook_fetch_failure_is_non_fatal() {
    let llm = Arc::new(MockLlmClient::new(vec![LlmCompletion {
        text: Some("Thought: no data needed\nFinal Answer: looks fine".into()),
        tool_call: None,
        usage: None,
    }]));

    let no_tools_agent = AgentConfig {
        agent_id: "kubernetes-agent".into(),
        mcp_server_ids: vec![],
        custom_instructions: None,
        default_strategy: Some(IterationStrategy::React),
        source: AgentSource::BuiltIn,
    };

    let harness = build_harness(HarnessConfig {
        chains: vec![pod_crash_chain("kubernetes-agent")],
        agents: vec![no_tools_agent],
        llm: Some(llm as Arc<dyn LlmClient>),
        runbook_fetcher: Some(Arc::new(MockRunbookFetcher::failing("404 not found"))),
        ..HarnessConfig::default()
    });

    let session_id = "s5".to_string();
    harness
        .service
        .run_to_completion(
            session_id.clone(),
            "PodCrashLoop".into(),
            json!({"pod": "api-7f9", "runbook_url": "https://runbooks.example/oom"}),
            &CancellationToken::new(),
        )
        .await;

    let timeline = harness.audit.get_session_with_timeline(&session_id).await.unwrap().expect("session recorded");
    assert_eq!(timeline.session.status, SessionStatus::Completed);
    assert!(timeline.lifecycle_events.iter().any(|e| e.kind == "runbook_fetch_error"));
}

// A session that starts out cancelled records a terminal, failed stage
// execution for the stage it never ran, and never creates the next one.
#[tokio::test]
async fn cancellation_before_a_stage_starts_records_a_terminal_row_and_stops_the_chain() {
    let chain = ChainDefinition {
        chain_id: "k8s-chain".into(),
        alert_types: vec!["PodCrashLoop".into()],
        stages: vec![
            ChainStage { stage_id: "investigate".into(), agent_id: "kubernetes-agent".into(), iteration_strategy: None },
            ChainStage { stage_id: "summarize".into(), agent_id: "kubernetes-agent".into(), iteration_strategy: None },
        ],
    };

    let harness = build_harness(HarnessConfig {
        chains: vec![chain],
        agents: vec![kubernetes_agent()],
        mcp_servers: vec![kubernetes_mcp_server()],
        ..HarnessConfig::default()
    });

    let session_id = "s6".to_string();
    let cancellation = CancellationToken::new();
    cancellation.cancel();

    harness.service.run_to_completion(session_id.clone(), "PodCrashLoop".into(), json!({"pod": "api-7f9"}), &cancellation).await;

    let timeline = harness.audit.get_session_with_timeline(&session_id).await.unwrap().expect("session recorded");
    assert_eq!(timeline.session.status, SessionStatus::Failed);
    assert_eq!(timeline.stages.len(), 1, "the second stage must never be created once cancellation takes hold");
    assert_eq!(timeline.stages[0].stage_id, "investigate");
    assert_eq!(timeline.stages[0].error_message.as_deref(), Some("cancelled"));
}

// Cancellation arriving mid-stage marks that stage cancelled but must not
// let a later stage ever get its own StageExecution row created.
#[tokio::test]
async fn cancellation_mid_stage_stops_before_the_next_stage_is_created() {
    let mcp_client = Arc::new(MockMcpClient::new(vec![McpToolDef {
        name: "get_pods".into(),
        description: None,
        input_schema: None,
    }]));
    mcp_client.push_response("get_pods", Ok(json!({"pods": []}))).await;

    let cancellation = CancellationToken::new();
    let llm = Arc::new(CancelingLlmClient::new(
        cancellation.clone(),
        vec![
            // stage 1 ("investigate"): answers immediately, no cancellation.
            (LlmCompletion { text: Some("Thought: x\nFinal Answer: ok".into()), tool_call: None, usage: None }, false),
            // stage 2 ("diagnose"): calls a tool, then cancellation lands.
            (
                LlmCompletion {
                    text: Some("Thought: check pods\nAction: kubernetes__get_pods\nAction Input: {}".into()),
                    tool_call: None,
                    usage: None,
                },
                true,
            ),
        ],
    ));

    let observer_agent = AgentConfig {
        agent_id: "observer".into(),
        mcp_server_ids: vec![],
        custom_instructions: None,
        default_strategy: Some(IterationStrategy::React),
        source: AgentSource::BuiltIn,
    };

    let chain = ChainDefinition {
        chain_id: "k8s-chain".into(),
        alert_types: vec!["PodCrashLoop".into()],
        stages: vec![
            ChainStage { stage_id: "investigate".into(), agent_id: "observer".into(), iteration_strategy: None },
            ChainStage { stage_id: "diagnose".into(), agent_id: "kubernetes-agent".into(), iteration_strategy: None },
            ChainStage { stage_id: "summarize".into(), agent_id: "observer".into(), iteration_strategy: None },
        ],
    };

    let harness = build_harness(HarnessConfig {
        chains: vec![chain],
        agents: vec![observer_agent, kubernetes_agent()],
        mcp_servers: vec![kubernetes_mcp_server()],
        mcp_factory: FixedMcpClientFactory::default().with("kubernetes", mcp_client),
        llm: Some(llm as Arc<dyn LlmClient>),
        runbook_fetcher: Some(Arc::new(MockRunbookFetcher::ok(""))),
    });

    let session_id = "s7".to_string();
    harness
        .service
        .run_to_completion(session_id.clone(), "PodCrashLoop".into(), json!({"pod": "api-7f9"}), &cancellation)
        .await;

    let timeline = harness.audit.get_session_with_timeline(&session_id).await.unwrap().expect("session recorded");
    assert_eq!(timeline.session.status, SessionStatus::Failed);
    assert_eq!(timeline.stages.len(), 2, "the third stage must never be created once cancellation lands mid-chain");
    assert_eq!(timeline.stages[0].stage_id, "investigate");
    assert_eq!(timeline.stages[1].stage_id, "diagnose");
    assert_eq!(timeline.stages[1].error_message.as_deref(), Some("cancelled"));
}

// list_sessions should only surface sessions matching the requested filter.
#[tokio::test]
async fn list_sessions_filters_by_alert_type() {
    let llm = Arc::new(MockLlmClient::new(vec![
        LlmCompletion { text: Some("Thought: x\nFinal Answer: ok".into()), tool_call: None, usage: None },
        LlmCompletion { text: Some("Thought: x\nFinal Answer: ok".into()), tool_call: None, usage: None },
    ]));
    let no_tools_agent = AgentConfig {
        agent_id: "kubernetes-agent".into(),
        mcp_server_ids: vec![],
        custom_instructions: None,
        default_strategy: Some(IterationStrategy::React),
        source: AgentSource::BuiltIn,
    };
    let harness = build_harness(HarnessConfig {
        chains: vec![
            pod_crash_chain("kubernetes-agent"),
            ChainDefinition {
                chain_id: "oom-chain".into(),
                alert_types: vec!["PodOOMKilled".into()],
                stages: vec![ChainStage { stage_id: "investigate".into(), agent_id: "kubernetes-agent".into(), iteration_strategy: None }],
            },
        ],
        agents: vec![no_tools_agent],
        llm: Some(llm as Arc<dyn LlmClient>),
        ..HarnessConfig::default()
    });

    harness.service.run_to_completion("a".into(), "PodCrashLoop".into(), json!({}), &CancellationToken::new()).await;
    harness.service.run_to_completion("b".into(), "PodOOMKilled".into(), json!({}), &CancellationToken::new()).await;

    let page = harness
        .service
        .list_sessions(SessionFilter { alert_type: Some("PodOOMKilled".into()), status: None, limit: 50, offset: 0 })
        .await
        .unwrap();

    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].session_id, "b");
}

use serde_json::{json, Value};

use crate::data::AlertProcessingData;
use crate::llm::LlmToolSchema;
use crate::mcp::types::McpToolDef;
use crate::types::IterationStrategy;

const REACT_INSTRUCTIONS: &str = "\
Respond using this exact format:
Thought: <your reasoning>
Action: <tool name>
Action Input: <JSON object of arguments>

Once you have enough information, respond instead with:
Thought: <your reasoning>
Final Answer: <your analysis>";

const REACT_TOOLS_INSTRUCTIONS: &str = "\
Respond using this exact format:
Thought: <your reasoning>
Action: <tool name>
Action Input: <JSON object of arguments>

Once you have collected all the data this stage needs, respond with:
Thought: <your reasoning>
Final Answer: DONE";

/// Flattens a stage agent's tool catalog into the schema shape an LLM
/// request wants, prefixing each tool with its owning server id so two
/// servers exposing a same-named tool never collide.
pub fn build_tool_schemas(catalog: &[(String, Vec<McpToolDef>)]) -> Vec<LlmToolSchema> {
    catalog
        .iter()
        .flat_map(|(server_id, tools)| {
            tools.iter().map(move |tool| LlmToolSchema {
                name: format!("{server_id}__{}", tool.name),
                description: tool.description.clone().unwrap_or_default(),
                input_schema: tool.input_schema.clone().unwrap_or_else(|| json!({"type": "object"})),
            })
        })
        .collect()
}

fn tool_catalog_text(catalog: &[(String, Vec<McpToolDef>)]) -> String {
    catalog
        .iter()
        .flat_map(|(server_id, tools)| {
            tools.iter().map(move |tool| {
                format!(
                    "- {server_id}__{}: {}",
                    tool.name,
                    tool.description.clone().unwrap_or_else(|| "(no description)".to_string())
                )
            })
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn system_prompt(strategy: IterationStrategy, custom_instructions: Option<&str>, catalog: &[(String, Vec<McpToolDef>)]) -> String {
    let mut parts = vec!["You are an agent investigating an operational alert.".to_string()];

    if let Some(instructions) = custom_instructions {
        parts.push(instructions.to_string());
    }

    if strategy.allows_tools() && !catalog.is_empty() {
        parts.push(format!("Available tools:\n{}", tool_catalog_text(catalog)));
    }

    match strategy {
        IterationStrategy::React | IterationStrategy::ReactToolsPartial => parts.push(REACT_INSTRUCTIONS.to_string()),
        IterationStrategy::ReactTools => parts.push(REACT_TOOLS_INSTRUCTIONS.to_string()),
        IterationStrategy::ReactFinalAnalysis => {
            parts.push("No tools are available for this stage. Synthesize a final analysis directly from the context below.".to_string())
        }
        IterationStrategy::Regular => {}
    }

    parts.join("\n\n")
}

/// Builds the initial chat messages for a stage: system prompt plus a user
/// message carrying the alert payload, runbook text, and everything prior
/// stages have produced so far.
pub fn build_initial_messages(
    strategy: IterationStrategy,
    custom_instructions: Option<&str>,
    catalog: &[(String, Vec<McpToolDef>)],
    data: &AlertProcessingData,
) -> Vec<Value> {
    let system = system_prompt(strategy, custom_instructions, catalog);

    let mut user_parts = vec![
        format!("Alert type: {}", data.alert_type),
        format!("Alert data:\n{}", serde_json::to_string_pretty(&data.alert_data).unwrap_or_default()),
    ];

    if let Some(runbook) = &data.runbook_content {
        user_parts.push(format!("Runbook:\n{runbook}"));
    }

    let prior = data.prior_analyses();
    if !prior.is_empty() {
        let joined =
            prior.iter().map(|(stage_id, analysis)| format!("[{stage_id}]\n{analysis}")).collect::<Vec<_>>().join("\n\n");
        user_parts.push(format!("Findings from prior stages:\n{joined}"));
    }

    let mcp_results = data.get_all_mcp_results();
    if !mcp_results.is_empty() {
        let joined = mcp_results
            .iter()
            .map(|(server_id, records)| {
                let calls = records
                    .iter()
                    .map(|r| match &r.result {
                        Some(v) => format!("  {} -> {v}", r.tool_name),
                        None => format!("  {} -> error: {}", r.tool_name, r.error.clone().unwrap_or_default()),
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("{server_id}:\n{calls}")
            })
            .collect::<Vec<_>>()
            .join("\n");
        user_parts.push(format!("Data already collected:\n{joined}"));
    }

    vec![
        json!({ "role": "system", "content": system }),
        json!({ "role": "user", "content": user_parts.join("\n\n") }),
    ]
}

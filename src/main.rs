//! Hive 演示程序
//!
//! 入口：初始化日志、加载配置，组装「写作 -> 评审/修订循环 -> 发布」流水线并运行一次。
//! 发布数量超过阈值时流水线挂起，演示程序自动批准后恢复。
//! 生成器为确定性的 FnProducer，不依赖外部模型服务。

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use hive::agent::{LeafUnit, LoopUnit, SequentialUnit};
use hive::config::{load_config, AppConfig};
use hive::confirmation::{ConfirmationController, ThresholdGate};
use hive::core::InvocationStatus;
use hive::llm::{FnProducer, TurnRequest};
use hive::runner::{RunOutcome, Runner, RunnerBuilder};
use hive::session::{ConfirmationResponse, Message, ToolCall};
use hive::tools::{schema_of, ExitLoopTool, Tool, ToolContext, ToolExecutor, ToolRegistry, EXIT_LOOP};

const APPROVED: &str = "No major issues found.";

#[derive(Debug, Deserialize, JsonSchema)]
struct PublishArgs {
    /// 印刷册数
    copies: u64,
}

/// 发布工具：记录发布册数
struct PublishTool;

#[async_trait]
impl Tool for PublishTool {
    fn name(&self) -> &str {
        "publish"
    }

    fn description(&self) -> &str {
        "Publish the current story. Args: {\"copies\": number}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<PublishArgs>()
    }

    async fn execute(&self, args: Value, ctx: &mut ToolContext) -> Result<Value, String> {
        let args: PublishArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        ctx.set_state("published_copies", args.copies);
        Ok(json!({ "status": "success", "copies": args.copies }))
    }
}

fn last_has_result(req: &TurnRequest) -> bool {
    req.contents
        .last()
        .map(|m| !m.results().is_empty())
        .unwrap_or(false)
}

fn story_pipeline(config: &AppConfig) -> SequentialUnit {
    let writer = LeafUnit::new(
        "writer",
        Arc::new(FnProducer::new(|req: &TurnRequest| {
            let topic = req.last_user_text().unwrap_or_else(|| "a quiet town".to_string());
            Ok(Message::model(format!("Once upon a time, {topic}.")))
        })),
    )
    .with_instruction("Write a short first draft about the user's topic.")
    .with_output_key("current_story")
    .with_max_steps(config.runner.max_steps);

    let critic = LeafUnit::new(
        "critic",
        Arc::new(FnProducer::new(|req: &TurnRequest| {
            let story = req.state.get_str("current_story").unwrap_or_default();
            let verdict = if story.contains("(revised)") {
                APPROVED.to_string()
            } else {
                "Add a twist at the end.".to_string()
            };
            Ok(Message::model(verdict))
        })),
    )
    .with_instruction("Review this story:\n{current_story}")
    .with_output_key("criticism")
    .with_max_steps(config.runner.max_steps);

    let loop_tools = Arc::new(ToolExecutor::new(
        ToolRegistry::new().with(ExitLoopTool),
        config.tools.tool_timeout_secs,
    ));
    let refiner = LeafUnit::new(
        "refiner",
        Arc::new(FnProducer::new(|req: &TurnRequest| {
            let criticism = req.state.get_str("criticism").unwrap_or_default();
            if criticism.contains(APPROVED) {
                return Ok(Message::tool_calls(vec![ToolCall::new(EXIT_LOOP, json!({}))]));
            }
            let story = req.state.get_str("current_story").unwrap_or_default();
            Ok(Message::model(format!("{story} Then the storm answered back. (revised)")))
        })),
    )
    .with_instruction("Story:\n{current_story}\nCriticism:\n{criticism}\nRevise, or call exit_loop if approved.")
    .with_tools(loop_tools)
    .with_output_key("current_story")
    .with_max_steps(config.runner.max_steps);

    let publish_tools = Arc::new(ToolExecutor::new(
        ToolRegistry::new().with(PublishTool),
        config.tools.tool_timeout_secs,
    ));
    let publisher = LeafUnit::new(
        "publisher",
        Arc::new(FnProducer::new(|req: &TurnRequest| {
            if last_has_result(req) {
                return Ok(Message::model("The story has been published."));
            }
            Ok(Message::tool_calls(vec![ToolCall::new("publish", json!({ "copies": 500 }))]))
        })),
    )
    .with_instruction("Publish the final story:\n{current_story}")
    .with_tools(publish_tools)
    .with_max_steps(config.runner.max_steps);

    SequentialUnit::new(
        "pipeline",
        vec![
            writer.into(),
            LoopUnit::new("story_loop", vec![critic.into(), refiner.into()], 3).into(),
            publisher.into(),
        ],
    )
}

fn report(outcome: &RunOutcome) {
    for event in &outcome.events {
        let text = event.text();
        if !text.is_empty() {
            println!("[{}] {}", event.branch, text);
        }
    }
    println!("-- invocation {} is {:?}", outcome.invocation_id, outcome.status);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config = load_config(None).context("Failed to load config")?;
    let controller = ConfirmationController::from_config(&config.confirmation)
        .with_gate("publish", ThresholdGate::new("copies", 100.0));
    let runner: Runner = RunnerBuilder::from_config(&config)
        .with_controller(controller)
        .with_root(story_pipeline(&config))
        .build()
        .context("Failed to build runner")?;

    let mut outcome = runner
        .run("demo-user", "demo-session", Message::user("a lighthouse keeper befriends a storm"))
        .await
        .context("Run failed")?;
    report(&outcome);

    while outcome.status == InvocationStatus::Suspended {
        let Some(request) = outcome.pending().cloned() else {
            break;
        };
        println!("-- confirmation needed: {} (auto-approving)", request.hint);
        outcome = runner
            .resume(ConfirmationResponse {
                approval_id: request.approval_id,
                invocation_id: request.invocation_id,
                confirmed: true,
            })
            .await
            .context("Resume failed")?;
        report(&outcome);
    }

    if let Some(error) = &outcome.error {
        anyhow::bail!("pipeline failed: {error}");
    }
    Ok(())
}

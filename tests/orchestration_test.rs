//! 组合器集成测试：顺序可见性、并行合并与聚合错误、循环终止

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use hive::agent::{LeafUnit, LoopUnit, ParallelUnit, SequentialUnit, Unit};
    use hive::core::{AgentError, InvocationStatus};
    use hive::llm::{FnProducer, ModelError, ScriptedProducer, TurnProducer, TurnRequest};
    use hive::runner::Runner;
    use hive::session::{Message, Part, Role, SessionKey, State, ToolCall};
    use hive::tools::{ExitLoopTool, Tool, ToolContext, ToolExecutor, ToolRegistry, EXIT_LOOP};

    fn runner(root: impl Into<Unit>) -> Runner {
        Runner::builder().with_root(root).build().unwrap()
    }

    async fn final_state(runner: &Runner) -> State {
        runner
            .session_service()
            .read_state(&SessionKey::new("hive", "u1", "s1"))
            .await
            .unwrap()
    }

    fn echo_instruction(name: &str) -> LeafUnit {
        LeafUnit::new(
            name,
            Arc::new(FnProducer::new(|req: &TurnRequest| {
                Ok(Message::model(req.instruction.clone()))
            })),
        )
    }

    /// 按固定延迟回复，用于打乱并行分支的完成顺序
    struct DelayedProducer {
        delay: Duration,
        reply: String,
    }

    #[async_trait]
    impl TurnProducer for DelayedProducer {
        async fn produce(&self, req: &TurnRequest) -> Result<Message, ModelError> {
            tokio::time::sleep(self.delay).await;
            Ok(Message::model(format!("{} saw {} keys", self.reply, req.state.to_flat().len())))
        }
    }

    fn delayed(name: &str, millis: u64) -> Unit {
        LeafUnit::new(
            name,
            Arc::new(DelayedProducer {
                delay: Duration::from_millis(millis),
                reply: name.to_string(),
            }),
        )
        .with_output_key(name)
        .into()
    }

    /// 计数工具：每次调用 count + 1，达到 stop_at 时发出终止信号
    struct TickTool {
        stop_at: Option<u64>,
    }

    #[async_trait]
    impl Tool for TickTool {
        fn name(&self) -> &str {
            "tick"
        }

        fn description(&self) -> &str {
            "increment the pass counter"
        }

        async fn execute(&self, _args: Value, ctx: &mut ToolContext) -> Result<Value, String> {
            let n = ctx.get_state("count").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
            ctx.set_state("count", n);
            if self.stop_at.map_or(false, |stop| n >= stop) {
                ctx.signal_termination();
            }
            Ok(json!({ "count": n }))
        }
    }

    fn ticker(stop_at: Option<u64>) -> Unit {
        let executor = ToolExecutor::new(ToolRegistry::new().with(TickTool { stop_at }), 5);
        LeafUnit::new(
            "ticker",
            Arc::new(FnProducer::new(|req: &TurnRequest| {
                let answered = req.contents.last().map_or(false, |m| !m.results().is_empty());
                if answered {
                    Ok(Message::model("ticked"))
                } else {
                    Ok(Message::tool_calls(vec![ToolCall::new("tick", json!({}))]))
                }
            })),
        )
        .with_tools(Arc::new(executor))
        .into()
    }

    #[tokio::test]
    async fn test_sequential_unit_sees_previous_output_key() {
        let first = LeafUnit::new("first", Arc::new(ScriptedProducer::text("alpha")))
            .with_output_key("step_1");
        let second = echo_instruction("second")
            .with_instruction("after {step_1}")
            .with_output_key("step_2");
        let third = echo_instruction("third").with_instruction("after {step_2}");
        let runner = runner(SequentialUnit::new(
            "pipeline",
            vec![first.into(), second.into(), third.into()],
        ));

        let outcome = runner.run("u1", "s1", Message::user("go")).await.unwrap();
        assert_eq!(outcome.status, InvocationStatus::Completed);
        assert_eq!(outcome.final_text().as_deref(), Some("after after alpha"));

        let state = final_state(&runner).await;
        assert_eq!(state.get_str("step_2"), Some("after alpha"));
    }

    #[tokio::test]
    async fn test_missing_state_key_aborts_sequence() {
        let later = Arc::new(ScriptedProducer::text("never"));
        let broken = echo_instruction("broken").with_instruction("needs {absent}");
        let runner = runner(SequentialUnit::new(
            "pipeline",
            vec![
                broken.recoverable(true).into(),
                LeafUnit::new("later", later.clone()).into(),
            ],
        ));

        let outcome = runner.run("u1", "s1", Message::user("go")).await.unwrap();
        assert_eq!(outcome.status, InvocationStatus::Failed);
        assert!(matches!(
            outcome.error,
            Some(AgentError::MissingStateKey { ref key, .. }) if key == "absent"
        ));
        assert_eq!(later.call_count(), 0);
        let failure = outcome.events.iter().find(|e| e.is_unit_failure()).unwrap();
        assert_eq!(failure.author, "broken");
    }

    #[tokio::test]
    async fn test_recoverable_failure_continues_sequence() {
        let flaky = LeafUnit::new(
            "flaky",
            Arc::new(ScriptedProducer::new(Vec::new()).then_error(ModelError::new("bad output"))),
        )
        .recoverable(true);
        let next = LeafUnit::new("next", Arc::new(ScriptedProducer::text("still here")));
        let runner = runner(SequentialUnit::new("pipeline", vec![flaky.into(), next.into()]));

        let outcome = runner.run("u1", "s1", Message::user("go")).await.unwrap();
        assert_eq!(outcome.status, InvocationStatus::Completed);
        assert_eq!(outcome.final_text().as_deref(), Some("still here"));
        let error = outcome
            .events
            .iter()
            .find_map(|e| e.error.as_ref())
            .unwrap();
        assert!(error.unit_failed && error.recoverable);
    }

    #[tokio::test]
    async fn test_parallel_merges_disjoint_keys_in_declaration_order() {
        let runner = runner(ParallelUnit::new(
            "fanout",
            vec![delayed("a", 60), delayed("b", 30), delayed("c", 1)],
        ));

        let outcome = runner.run("u1", "s1", Message::user("go")).await.unwrap();
        assert_eq!(outcome.status, InvocationStatus::Completed);

        let state = final_state(&runner).await;
        // 每个分支只看到分叉时的快照
        assert_eq!(state.get_str("a"), Some("a saw 0 keys"));
        assert_eq!(state.get_str("b"), Some("b saw 0 keys"));
        assert_eq!(state.get_str("c"), Some("c saw 0 keys"));

        let branches: Vec<&str> = outcome
            .events
            .iter()
            .filter(|e| e.author != "user")
            .map(|e| e.branch.as_str())
            .collect();
        assert_eq!(branches, vec!["fanout.a", "fanout.b", "fanout.c"]);
    }

    #[tokio::test]
    async fn test_parallel_same_key_later_declared_wins() {
        let writer = |name: &str, millis: u64| -> Unit {
            LeafUnit::new(
                name,
                Arc::new(DelayedProducer {
                    delay: Duration::from_millis(millis),
                    reply: name.to_string(),
                }),
            )
            .with_output_key("shared")
            .into()
        };
        // 先声明的分支最后完成
        let runner = runner(ParallelUnit::new(
            "fanout",
            vec![writer("first", 60), writer("second", 30), writer("third", 1)],
        ));

        let outcome = runner.run("u1", "s1", Message::user("go")).await.unwrap();
        assert_eq!(outcome.status, InvocationStatus::Completed);
        assert_eq!(final_state(&runner).await.get_str("shared"), Some("third saw 0 keys"));
        let writes: Vec<&str> = outcome
            .events
            .iter()
            .filter_map(|e| e.actions.state_delta.get("shared"))
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(writes, vec!["first saw 0 keys", "second saw 0 keys", "third saw 0 keys"]);
    }

    #[tokio::test]
    async fn test_parallel_reports_all_failed_branches() {
        let failing = |name: &str| -> Unit {
            LeafUnit::new(
                name,
                Arc::new(ScriptedProducer::new(Vec::new()).then_error(ModelError::new("boom"))),
            )
            .into()
        };
        let runner = runner(ParallelUnit::new(
            "fanout",
            vec![failing("bad_1"), delayed("ok", 5), failing("bad_2")],
        ));

        let outcome = runner.run("u1", "s1", Message::user("go")).await.unwrap();
        assert_eq!(outcome.status, InvocationStatus::Failed);
        match outcome.error {
            Some(AgentError::ParallelFailed { failed }) => {
                assert_eq!(failed, vec!["bad_1".to_string(), "bad_2".to_string()])
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // 成功分支的输出仍然合并
        assert_eq!(final_state(&runner).await.get_str("ok"), Some("ok saw 0 keys"));
        let aggregate = outcome.events.iter().rev().find(|e| e.is_unit_failure()).unwrap();
        assert_eq!(aggregate.author, "fanout");
    }

    #[tokio::test]
    async fn test_loop_stops_on_termination_signal() {
        let runner = runner(LoopUnit::new("repeat", vec![ticker(Some(3))], 5));
        let outcome = runner.run("u1", "s1", Message::user("go")).await.unwrap();

        assert_eq!(outcome.status, InvocationStatus::Completed);
        assert_eq!(final_state(&runner).await.get("count"), Some(&json!(3)));
        assert!(outcome.events.iter().any(|e| e.actions.terminate && e.branch == "repeat#3.ticker"));
        assert!(!outcome.events.iter().any(|e| e.branch.starts_with("repeat#4")));
    }

    #[tokio::test]
    async fn test_loop_runs_max_iterations_without_signal() {
        let runner = runner(LoopUnit::new("repeat", vec![ticker(None)], 4));
        let outcome = runner.run("u1", "s1", Message::user("go")).await.unwrap();

        assert_eq!(outcome.status, InvocationStatus::Completed);
        assert_eq!(final_state(&runner).await.get("count"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_output_key_written_when_reply_also_exits_loop() {
        let refiner = LeafUnit::new(
            "refiner",
            Arc::new(FnProducer::new(|_req: &TurnRequest| {
                Ok(Message::new(
                    Role::Model,
                    vec![
                        Part::Text {
                            text: "final polished story".to_string(),
                        },
                        Part::ToolCall(ToolCall::new(EXIT_LOOP, json!({}))),
                    ],
                ))
            })),
        )
        .with_tools(Arc::new(ToolExecutor::new(ToolRegistry::new().with(ExitLoopTool), 5)))
        .with_output_key("current_story");
        let runner = runner(LoopUnit::new("story_loop", vec![refiner.into()], 2));

        let outcome = runner.run("u1", "s1", Message::user("go")).await.unwrap();
        assert_eq!(outcome.status, InvocationStatus::Completed);
        assert_eq!(
            final_state(&runner).await.get_str("current_story"),
            Some("final polished story")
        );
        assert!(!outcome.events.iter().any(|e| e.branch.starts_with("story_loop#2")));
    }

    #[tokio::test]
    async fn test_story_loop_with_two_passes() {
        let critic = LeafUnit::new(
            "critic",
            Arc::new(FnProducer::new(|req: &TurnRequest| {
                let story = req.state.get_str("current_story").unwrap_or_default();
                if story.ends_with("(revised)") {
                    Ok(Message::model("No major issues found."))
                } else {
                    Ok(Message::model("Needs a twist."))
                }
            })),
        )
        .with_instruction("Review: {current_story}")
        .with_output_key("criticism");
        let refiner_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = refiner_calls.clone();
        let refiner = LeafUnit::new(
            "refiner",
            Arc::new(FnProducer::new(move |req: &TurnRequest| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let criticism = req.state.get_str("criticism").unwrap_or_default();
                if criticism.starts_with("No major issues") {
                    return Ok(Message::tool_calls(vec![ToolCall::new(EXIT_LOOP, json!({}))]));
                }
                let story = req.state.get_str("current_story").unwrap_or_default();
                Ok(Message::model(format!("{story} (revised)")))
            })),
        )
        .with_tools(Arc::new(ToolExecutor::new(ToolRegistry::new().with(ExitLoopTool), 5)))
        .with_output_key("current_story");
        let writer = LeafUnit::new("writer", Arc::new(ScriptedProducer::text("A storm arrives.")))
            .with_output_key("current_story");

        let runner = runner(SequentialUnit::new(
            "pipeline",
            vec![
                writer.into(),
                LoopUnit::new("story_loop", vec![critic.into(), refiner.into()], 2).into(),
            ],
        ));
        let outcome = runner.run("u1", "s1", Message::user("go")).await.unwrap();

        assert_eq!(outcome.status, InvocationStatus::Completed);
        assert_eq!(refiner_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        let state = final_state(&runner).await;
        assert_eq!(state.get_str("current_story"), Some("A storm arrives. (revised)"));
        assert_eq!(state.get_str("criticism"), Some("No major issues found."));
        assert!(outcome
            .events
            .iter()
            .any(|e| e.actions.terminate && e.branch == "pipeline.story_loop#2.refiner"));
    }
}

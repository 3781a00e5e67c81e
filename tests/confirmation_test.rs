//! 审批 / 恢复集成测试：阈值门、拒绝、恢复等价、过期 approval id、并行多重挂起

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use hive::agent::{LeafUnit, ParallelUnit, Unit};
    use hive::confirmation::{confirmation_message, ConfirmationController, ThresholdGate};
    use hive::core::{AgentError, InvocationStatus};
    use hive::llm::{FnProducer, TurnRequest};
    use hive::runner::{RunOutcome, Runner};
    use hive::session::{ConfirmationRequest, ConfirmationResponse, Message, SessionKey, State, ToolCall};
    use hive::tools::{Tool, ToolContext, ToolExecutor, ToolRegistry};

    /// 下单工具：把 num 写入 `ordered_<key>`
    struct OrderTool;

    #[async_trait]
    impl Tool for OrderTool {
        fn name(&self) -> &str {
            "order"
        }

        fn description(&self) -> &str {
            "place an order of num containers"
        }

        async fn execute(&self, args: Value, ctx: &mut ToolContext) -> Result<Value, String> {
            let key = args["key"].as_str().unwrap_or("default").to_string();
            let num = args["num"].as_u64().ok_or("num must be a number")?;
            ctx.set_state(format!("ordered_{key}"), num);
            Ok(json!({ "status": "success", "num": num }))
        }
    }

    /// 转账工具：自行请求确认，批准后才生效
    struct TransferTool;

    #[async_trait]
    impl Tool for TransferTool {
        fn name(&self) -> &str {
            "transfer"
        }

        fn description(&self) -> &str {
            "transfer funds after confirmation"
        }

        async fn execute(&self, args: Value, ctx: &mut ToolContext) -> Result<Value, String> {
            match ctx.confirmation_decision() {
                None => {
                    ctx.request_confirmation("Confirm the transfer?", args.clone());
                    Ok(json!({ "status": "pending" }))
                }
                Some(true) => {
                    ctx.set_state("transferred", args["amount"].clone());
                    Ok(json!({ "status": "success" }))
                }
                Some(false) => Ok(json!({ "status": "declined" })),
            }
        }
    }

    fn ordering_leaf(name: &str, num: u64) -> Unit {
        let key = name.to_string();
        let executor = ToolExecutor::new(
            ToolRegistry::new().with(OrderTool).with(TransferTool),
            5,
        );
        LeafUnit::new(
            name,
            Arc::new(FnProducer::new(move |req: &TurnRequest| {
                let answered = req.contents.last().map_or(false, |m| !m.results().is_empty());
                if answered {
                    return Ok(Message::model("order handled"));
                }
                Ok(Message::tool_calls(vec![ToolCall::new(
                    "order",
                    json!({ "key": key, "num": num }),
                )]))
            })),
        )
        .with_tools(Arc::new(executor))
        .into()
    }

    fn runner(root: impl Into<Unit>, threshold: f64) -> Runner {
        Runner::builder()
            .with_controller(
                ConfirmationController::new().with_gate("order", ThresholdGate::new("num", threshold)),
            )
            .with_root(root)
            .build()
            .unwrap()
    }

    async fn final_state(runner: &Runner) -> State {
        runner
            .session_service()
            .read_state(&SessionKey::new("hive", "u1", "s1"))
            .await
            .unwrap()
    }

    fn pending_events(outcome: &RunOutcome) -> Vec<&ConfirmationRequest> {
        outcome
            .events
            .iter()
            .filter_map(|e| e.actions.confirmation_request.as_ref())
            .collect()
    }

    fn answer(request: &ConfirmationRequest, confirmed: bool) -> ConfirmationResponse {
        ConfirmationResponse {
            approval_id: request.approval_id.clone(),
            invocation_id: request.invocation_id.clone(),
            confirmed,
        }
    }

    #[tokio::test]
    async fn test_below_threshold_never_suspends() {
        let runner = runner(ordering_leaf("buyer", 3), 5.0);
        let outcome = runner.run("u1", "s1", Message::user("buy")).await.unwrap();

        assert_eq!(outcome.status, InvocationStatus::Completed);
        assert!(pending_events(&outcome).is_empty());
        assert_eq!(final_state(&runner).await.get("ordered_buyer"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_above_threshold_suspends_once() {
        let runner = runner(ordering_leaf("buyer", 10), 5.0);
        let outcome = runner.run("u1", "s1", Message::user("buy")).await.unwrap();

        assert_eq!(outcome.status, InvocationStatus::Suspended);
        assert_eq!(pending_events(&outcome).len(), 1);
        let request = outcome.pending().unwrap();
        assert_eq!(request.tool_call.as_ref().map(|c| c.name.as_str()), Some("order"));
        assert!(final_state(&runner).await.get("ordered_buyer").is_none());
        assert_eq!(
            runner.controller().status(&outcome.invocation_id).await,
            Some(InvocationStatus::Suspended)
        );
    }

    #[tokio::test]
    async fn test_rejection_skips_tool_and_continues() {
        let runner = runner(ordering_leaf("buyer", 10), 5.0);
        let suspended = runner.run("u1", "s1", Message::user("buy")).await.unwrap();
        let request = suspended.pending().cloned().unwrap();

        let outcome = runner.resume(answer(&request, false)).await.unwrap();
        assert_eq!(outcome.status, InvocationStatus::Completed);
        assert!(final_state(&runner).await.get("ordered_buyer").is_none());
        let rejected = outcome
            .events
            .iter()
            .filter_map(|e| e.content.as_ref())
            .flat_map(|m| m.results())
            .find(|r| r.name == "order")
            .unwrap();
        assert_eq!(rejected.response["status"], "rejected");
        assert_eq!(outcome.final_text().as_deref(), Some("order handled"));
    }

    #[tokio::test]
    async fn test_resumed_approval_matches_immediate_approval() {
        let immediate = runner(ordering_leaf("buyer", 10), 100.0);
        let direct = immediate.run("u1", "s1", Message::user("buy")).await.unwrap();
        assert_eq!(direct.status, InvocationStatus::Completed);

        let gated = runner(ordering_leaf("buyer", 10), 5.0);
        let suspended = gated.run("u1", "s1", Message::user("buy")).await.unwrap();
        let request = suspended.pending().cloned().unwrap();
        let resumed = gated.resume(answer(&request, true)).await.unwrap();
        assert_eq!(resumed.status, InvocationStatus::Completed);

        assert_eq!(
            final_state(&gated).await.to_flat(),
            final_state(&immediate).await.to_flat()
        );
        // 被批准的调用只执行一次
        let key = SessionKey::new("hive", "u1", "s1");
        let session = gated.session_service().get_session(&key).await.unwrap().unwrap();
        let executions = session
            .events
            .iter()
            .filter(|e| e.actions.state_delta.get("ordered_buyer").is_some())
            .count();
        assert_eq!(executions, 1);
    }

    #[tokio::test]
    async fn test_stale_approval_id_rejected() {
        let runner = runner(ordering_leaf("buyer", 10), 5.0);
        let suspended = runner.run("u1", "s1", Message::user("buy")).await.unwrap();
        let request = suspended.pending().cloned().unwrap();

        let mut wrong = answer(&request, true);
        wrong.approval_id = "apr_stale".to_string();
        let err = runner.resume(wrong).await.unwrap_err();
        assert!(matches!(err, AgentError::ConfirmationMismatch { .. }));
        assert_eq!(
            runner.controller().status(&request.invocation_id).await,
            Some(InvocationStatus::Suspended)
        );

        let outcome = runner.resume(answer(&request, true)).await.unwrap();
        assert_eq!(outcome.status, InvocationStatus::Completed);

        // 已完成的 Invocation 不能再次恢复
        let err = runner.resume(answer(&request, true)).await.unwrap_err();
        assert!(matches!(err, AgentError::NotSuspended(_)));
    }

    #[tokio::test]
    async fn test_resume_through_confirmation_message() {
        let runner = runner(ordering_leaf("buyer", 10), 5.0);
        let suspended = runner.run("u1", "s1", Message::user("buy")).await.unwrap();
        let request = suspended.pending().cloned().unwrap();

        let outcome = runner
            .run("u1", "s1", confirmation_message(&request.approval_id, true))
            .await
            .unwrap();
        assert_eq!(outcome.invocation_id, request.invocation_id);
        assert_eq!(outcome.status, InvocationStatus::Completed);
        assert_eq!(final_state(&runner).await.get("ordered_buyer"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn test_tool_requested_confirmation() {
        let executor = ToolExecutor::new(ToolRegistry::new().with(TransferTool), 5);
        let leaf = LeafUnit::new(
            "banker",
            Arc::new(FnProducer::new(|req: &TurnRequest| {
                let answered = req.contents.last().map_or(false, |m| !m.results().is_empty());
                if answered {
                    return Ok(Message::model("transfer handled"));
                }
                Ok(Message::tool_calls(vec![ToolCall::new("transfer", json!({ "amount": 250 }))]))
            })),
        )
        .with_tools(Arc::new(executor));
        let runner = runner(leaf, 5.0);

        let suspended = runner.run("u1", "s1", Message::user("pay")).await.unwrap();
        assert_eq!(suspended.status, InvocationStatus::Suspended);
        let request = suspended.pending().cloned().unwrap();
        assert_eq!(request.hint, "Confirm the transfer?");
        assert_eq!(request.payload["amount"], 250);

        let outcome = runner.resume(answer(&request, true)).await.unwrap();
        assert_eq!(outcome.status, InvocationStatus::Completed);
        assert_eq!(final_state(&runner).await.get("transferred"), Some(&json!(250)));
    }

    #[tokio::test]
    async fn test_parallel_branches_suspend_and_resume_one_at_a_time() {
        let root = ParallelUnit::new(
            "fanout",
            vec![ordering_leaf("east", 10), ordering_leaf("west", 20)],
        );
        let runner = runner(root, 5.0);

        let first = runner.run("u1", "s1", Message::user("buy")).await.unwrap();
        assert_eq!(first.status, InvocationStatus::Suspended);
        assert_eq!(pending_events(&first).len(), 2);
        // 最后追加的请求才是未决请求
        let west = first.pending().cloned().unwrap();
        assert_eq!(west.branch, "fanout.west");
        let east_original = pending_events(&first)[0].clone();

        let second = runner.resume(answer(&west, true)).await.unwrap();
        assert_eq!(second.status, InvocationStatus::Suspended);
        let east = second.pending().cloned().unwrap();
        assert_eq!(east.branch, "fanout.east");
        assert_ne!(east.approval_id, east_original.approval_id);
        assert_eq!(final_state(&runner).await.get("ordered_west"), Some(&json!(20)));

        let err = runner.resume(answer(&east_original, true)).await.unwrap_err();
        assert!(matches!(err, AgentError::ConfirmationMismatch { .. }));

        let done = runner.resume(answer(&east, true)).await.unwrap();
        assert_eq!(done.status, InvocationStatus::Completed);
        let state = final_state(&runner).await;
        assert_eq!(state.get("ordered_east"), Some(&json!(10)));
        assert_eq!(state.get("ordered_west"), Some(&json!(20)));
        // 已完成的分支不会重复执行
        assert!(!done.events.iter().any(|e| e.branch == "fanout.west"));
    }
}

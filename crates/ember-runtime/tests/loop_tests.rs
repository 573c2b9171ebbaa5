#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use ember_config::EmberConfig;
    use ember_config::schema::AgentConfig;
    use ember_core::memory::TABLE_MESSAGES;
    use ember_core::{Content, Event, EventBus, IncomingMessage, Memory, Result, State};
    use ember_llm::{MockModel, MockReply, ModelKind, ModelRegistration, ModelRouter};
    use ember_memory::InMemoryStore;
    use ember_plugin::{
        Action, ActionResult, CollectingSink, Provider, ProviderResult, ResponseSink,
        RuntimeContext,
    };
    use ember_runtime::*;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    const CONTINUE: &str = r#"{"thought": "thinking", "providers": [], "action": "none", "isFinish": false}"#;

    async fn runtime(max_iterations: u32) -> (AgentRuntime, Arc<MockModel>) {
        let mut config = EmberConfig::default();
        config.agent.max_iterations = max_iterations;
        let rt = AgentRuntime::with_storage(config, Arc::new(InMemoryStore::new()))
            .await
            .unwrap();
        let model = Arc::new(MockModel::new("mock"));
        rt.models()
            .register(ModelRegistration::new(ModelKind::TextLarge, 10, model.clone()));
        (rt, model)
    }

    fn incoming(text: &str) -> IncomingMessage {
        IncomingMessage::text("cli", "console", "user-1", text)
    }

    // ── Capabilities ───────────────────────────────────────────

    struct EchoAction;

    #[async_trait]
    impl Action for EchoAction {
        fn name(&self) -> &str {
            "ECHO"
        }

        fn description(&self) -> &str {
            "Repeat the message back"
        }

        async fn handle(
            &self,
            _ctx: &dyn RuntimeContext,
            message: &Memory,
            _state: &State,
            sink: &dyn ResponseSink,
        ) -> Result<ActionResult> {
            sink.send(Content::text(format!("echo: {}", message.text())))
                .await?;
            Ok(ActionResult::ok("echoed"))
        }
    }

    struct WeatherProvider;

    #[async_trait]
    impl Provider for WeatherProvider {
        fn name(&self) -> &str {
            "WEATHER"
        }

        fn dynamic(&self) -> bool {
            true
        }

        async fn get(
            &self,
            _ctx: &dyn RuntimeContext,
            _message: &Memory,
            _state: &State,
        ) -> Result<ProviderResult> {
            Ok(ProviderResult::text("sunny and warm"))
        }
    }

    struct OpenTicketAction;

    #[async_trait]
    impl Action for OpenTicketAction {
        fn name(&self) -> &str {
            "OPEN_TICKET"
        }

        fn description(&self) -> &str {
            "Open a support ticket"
        }

        async fn handle(
            &self,
            _ctx: &dyn RuntimeContext,
            _message: &Memory,
            _state: &State,
            _sink: &dyn ResponseSink,
        ) -> Result<ActionResult> {
            Ok(ActionResult::ok("opened").with_value("ticket_id", "T-4242"))
        }
    }

    // ── Iteration bound ────────────────────────────────────────

    #[tokio::test]
    async fn test_max_iterations_then_summary() {
        let (rt, model) = runtime(2).await;
        model.push(MockReply::Text(CONTINUE.into()));
        model.push(MockReply::Text(CONTINUE.into()));
        model.push(MockReply::Text(
            r#"{"thought": "wrap up", "text": "Here is what I found."}"#.into(),
        ));

        let report = rt.process_message(incoming("hello")).await.unwrap();
        let outcome = report.outcome.unwrap();

        assert_eq!(model.call_count(ModelKind::TextLarge), 3);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.mode, ResponseMode::Simple);
        assert_eq!(
            outcome.reply.unwrap().text.as_deref(),
            Some("Here is what I found.")
        );
        assert_eq!(report.replies.len(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_decision_counts_as_iteration() {
        let (rt, model) = runtime(1).await;
        model.push(MockReply::Text("I am not sure what to do".into()));
        model.push(MockReply::Text(r#"{"text": "Sorry, try again."}"#.into()));

        let outcome = rt
            .process_message(incoming("hello"))
            .await
            .unwrap()
            .outcome
            .unwrap();
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.parse_failures, 1);
        assert_eq!(outcome.mode, ResponseMode::Simple);
    }

    #[tokio::test]
    async fn test_empty_summary_means_no_reply() {
        let (rt, model) = runtime(4).await;
        model.push(MockReply::Text(
            r#"{"thought": "nothing to say", "isFinish": true}"#.into(),
        ));
        model.push(MockReply::Text(r#"{"thought": "stay quiet", "text": ""}"#.into()));

        let report = rt.process_message(incoming("ok thanks")).await.unwrap();
        let outcome = report.outcome.unwrap();
        assert_eq!(model.call_count(ModelKind::TextLarge), 2);
        assert_eq!(outcome.mode, ResponseMode::None);
        assert!(outcome.reply.is_none());
        assert!(report.replies.is_empty());
    }

    // ── Execution ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_action_output_goes_through_sink() {
        let (rt, model) = runtime(3).await;
        rt.registry().register_action(Arc::new(EchoAction));
        let mut events = rt.event_bus().subscribe();
        model.push(MockReply::Text(
            r#"{"thought": "echo it", "action": "ECHO", "isFinish": true}"#.into(),
        ));
        model.push(MockReply::Text(r#"{"text": "Done echoing."}"#.into()));

        let report = rt.process_message(incoming("ping")).await.unwrap();
        let outcome = report.outcome.unwrap();

        let prompt = &model.requests()[0].1.prompt;
        assert!(prompt.contains("- ECHO: Repeat the message back"));
        assert_eq!(report.replies.len(), 2);
        assert!(matches!(
            &outcome.trajectory[..],
            [TrajectoryEntry::Action { name, success: true, .. }] if name == "ECHO"
        ));
        assert_eq!(outcome.reply.unwrap().actions, vec!["ECHO".to_string()]);

        let mut started = false;
        let mut completed = false;
        let mut sent = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                Event::ActionStarted { action, .. } => started = action == "ECHO",
                Event::ActionCompleted { success, .. } => completed = success,
                Event::MessageSent { content, .. } => sent.push(content.text.unwrap_or_default()),
                _ => {}
            }
        }
        assert!(started && completed);
        assert_eq!(sent, vec!["echo: ping".to_string(), "Done echoing.".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_action_recorded_as_failure() {
        let (rt, model) = runtime(3).await;
        model.push(MockReply::Text(
            r#"{"action": "LAUNCH_ROCKET", "isFinish": true}"#.into(),
        ));
        model.push(MockReply::Text(r#"{"text": "I can't do that."}"#.into()));

        let outcome = rt
            .process_message(incoming("launch"))
            .await
            .unwrap()
            .outcome
            .unwrap();
        match &outcome.trajectory[..] {
            [TrajectoryEntry::Action { success, error, .. }] => {
                assert!(!success);
                assert!(error.as_deref().unwrap().contains("LAUNCH_ROCKET"));
            }
            other => panic!("unexpected trajectory: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pulled_providers_feed_next_decision() {
        let (rt, model) = runtime(3).await;
        rt.registry().register_provider(Arc::new(WeatherProvider));
        model.push(MockReply::Text(
            r#"{"thought": "check weather", "providers": ["weather", "stocks"]}"#.into(),
        ));
        model.push(MockReply::Text(r#"{"isFinish": true}"#.into()));
        model.push(MockReply::Text(r#"{"text": "It is sunny."}"#.into()));

        let outcome = rt
            .process_message(incoming("weather?"))
            .await
            .unwrap()
            .outcome
            .unwrap();

        assert_eq!(outcome.iterations, 2);
        let oks: Vec<(String, bool)> = outcome
            .trajectory
            .iter()
            .map(|e| match e {
                TrajectoryEntry::Provider { name, ok, .. } => (name.clone(), *ok),
                TrajectoryEntry::Action { name, success, .. } => (name.clone(), *success),
            })
            .collect();
        assert_eq!(
            oks,
            vec![("WEATHER".to_string(), true), ("stocks".to_string(), false)]
        );

        let requests = model.requests();
        assert!(!requests[0].1.prompt.contains("sunny and warm"));
        assert!(requests[1].1.prompt.contains("sunny and warm"));
    }

    #[tokio::test]
    async fn test_action_values_reach_later_steps() {
        let (rt, model) = runtime(3).await;
        rt.registry().register_action(Arc::new(OpenTicketAction));
        model.push(MockReply::Text(
            r#"{"thought": "open one", "action": "OPEN_TICKET", "isFinish": false}"#.into(),
        ));
        model.push(MockReply::Text(r#"{"isFinish": true}"#.into()));
        model.push(MockReply::Text(r#"{"text": "Ticket opened."}"#.into()));

        let outcome = rt
            .process_message(incoming("my printer is on fire"))
            .await
            .unwrap()
            .outcome
            .unwrap();
        assert_eq!(outcome.iterations, 2);

        let requests = model.requests();
        assert!(!requests[0].1.prompt.contains("T-4242"));
        assert!(requests[1].1.prompt.contains("ticket_id: T-4242"));
        assert!(requests[2].1.prompt.contains("ticket_id: T-4242"));
    }

    #[tokio::test]
    async fn test_conversation_history_in_prompt() {
        let (rt, model) = runtime(1).await;
        model.push(MockReply::Text(r#"{"isFinish": true}"#.into()));
        model.push(MockReply::Text(r#"{"text": "Hi Ada."}"#.into()));
        let mut first = incoming("my name is Ada");
        first.author_name = Some("Ada".into());
        rt.process_message(first).await.unwrap();

        model.push(MockReply::Text(r#"{"isFinish": true}"#.into()));
        model.push(MockReply::Text(r#"{"text": "Ada."}"#.into()));
        rt.process_message(incoming("what is my name?")).await.unwrap();

        let prompt = &model.requests()[2].1.prompt;
        assert!(prompt.contains("Ada: my name is Ada"));
        assert!(prompt.contains("Ember: Hi Ada."));
    }

    // ── Cancellation ───────────────────────────────────────────

    #[tokio::test]
    async fn test_cancelled_cycle_skips_model() {
        let storage = Arc::new(InMemoryStore::new());
        let models = Arc::new(ModelRouter::new());
        let model = Arc::new(MockModel::new("mock"));
        models.register(ModelRegistration::new(ModelKind::TextLarge, 0, model.clone()));
        let ctx: Arc<dyn RuntimeContext> = Arc::new(AgentContext::new(
            Uuid::new_v4(),
            "Ember",
            storage,
            models,
            Arc::new(ServiceRegistry::new()),
            EventBus::default(),
            Duration::from_secs(60),
        ));
        let registry = Arc::new(CapabilityRegistry::new());
        let composer = Arc::new(StateComposer::new(
            ctx.clone(),
            registry.clone(),
            StateCache::new(Duration::from_secs(60), 16),
            Duration::from_secs(1),
        ));
        let pipeline = Arc::new(CapabilityPipeline::new(
            ctx.clone(),
            registry,
            Duration::from_secs(1),
            Duration::from_secs(1),
        ));
        let cycle = MultiStepLoop::new(ctx.clone(), composer, pipeline, &AgentConfig::default());

        let message = Memory::new(
            ctx.agent_id(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Content::text("hello"),
            TABLE_MESSAGES,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sink = CollectingSink::new();

        let outcome = cycle.run(Uuid::new_v4(), &message, &sink, &cancel).await;
        assert!(outcome.cancelled);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.mode, ResponseMode::None);
        assert_eq!(model.call_count(ModelKind::TextLarge), 0);
    }
}

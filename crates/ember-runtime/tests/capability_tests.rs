#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use ember_core::memory::{TABLE_ACTIONS, TABLE_EVALUATIONS, TABLE_MESSAGES};
    use ember_core::{Content, EmberError, Event, EventBus, Memory, MemoryQuery, Result, State};
    use ember_llm::ModelRouter;
    use ember_memory::{InMemoryStore, StorageAdapter};
    use ember_plugin::*;
    use ember_runtime::*;
    use uuid::Uuid;

    // ── Fixtures ───────────────────────────────────────────────

    fn context() -> (Arc<AgentContext>, Arc<InMemoryStore>) {
        let storage = Arc::new(InMemoryStore::new());
        let ctx = Arc::new(AgentContext::new(
            Uuid::new_v4(),
            "Ember",
            storage.clone(),
            Arc::new(ModelRouter::new()),
            Arc::new(ServiceRegistry::new()),
            EventBus::default(),
            Duration::from_secs(60),
        ));
        (ctx, storage)
    }

    fn message(ctx: &AgentContext, text: &str) -> Memory {
        Memory::new(
            ctx.agent_id(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Content::text(text),
            TABLE_MESSAGES,
        )
    }

    fn composer(ctx: &Arc<AgentContext>, registry: &Arc<CapabilityRegistry>) -> StateComposer {
        StateComposer::new(
            ctx.clone(),
            registry.clone(),
            StateCache::new(Duration::from_secs(60), 100),
            Duration::from_millis(200),
        )
    }

    fn pipeline(ctx: &Arc<AgentContext>, registry: &Arc<CapabilityRegistry>) -> CapabilityPipeline {
        CapabilityPipeline::new(
            ctx.clone(),
            registry.clone(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
    }

    // ── Providers ──────────────────────────────────────────────

    enum Behaviour {
        Text(&'static str),
        Value(&'static str, &'static str),
        Fail,
        Hang,
        Panic,
    }

    struct TestProvider {
        name: &'static str,
        behaviour: Behaviour,
        private: bool,
        dynamic: bool,
        calls: AtomicUsize,
    }

    impl TestProvider {
        fn new(name: &'static str, behaviour: Behaviour) -> Self {
            Self {
                name,
                behaviour,
                private: false,
                dynamic: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn dynamic(mut self) -> Self {
            self.dynamic = true;
            self
        }

        fn private(mut self) -> Self {
            self.private = true;
            self
        }
    }

    #[async_trait]
    impl Provider for TestProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn private(&self) -> bool {
            self.private
        }

        fn dynamic(&self) -> bool {
            self.dynamic
        }

        async fn get(
            &self,
            _ctx: &dyn RuntimeContext,
            _message: &Memory,
            _state: &State,
        ) -> Result<ProviderResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Text(t) => Ok(ProviderResult::text(t)),
                Behaviour::Value(k, v) => Ok(ProviderResult::text(format!("{k}={v}")).with_value(k, v)),
                Behaviour::Fail => Err(EmberError::Provider {
                    provider: self.name.into(),
                    reason: "backend down".into(),
                }),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(ProviderResult::default())
                }
                Behaviour::Panic => panic!("provider exploded"),
            }
        }
    }

    #[tokio::test]
    async fn test_failing_providers_are_skipped() {
        let (ctx, _) = context();
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register_provider(Arc::new(TestProvider::new("A", Behaviour::Text("alpha"))));
        registry.register_provider(Arc::new(TestProvider::new("B", Behaviour::Fail)));
        registry.register_provider(Arc::new(TestProvider::new("C", Behaviour::Hang)));
        registry.register_provider(Arc::new(TestProvider::new("D", Behaviour::Panic)));
        registry.register_provider(Arc::new(TestProvider::new("E", Behaviour::Text("epsilon"))));

        let composer = composer(&ctx, &registry);
        let msg = message(&ctx, "hi");
        let (state, outcomes) = composer.compose(&msg, &[], true).await;

        assert_eq!(state.text, "alpha\n\nepsilon");
        assert_eq!(outcomes.len(), 5);
        let failed: Vec<&str> = outcomes
            .iter()
            .filter(|o| !o.ok)
            .map(|o| o.name.as_str())
            .collect();
        assert_eq!(failed, vec!["B", "C", "D"]);
    }

    #[tokio::test]
    async fn test_later_provider_value_wins() {
        let (ctx, _) = context();
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register_provider(Arc::new(TestProvider::new("A", Behaviour::Value("k", "a"))));
        registry.register_provider(Arc::new(TestProvider::new("B", Behaviour::Value("k", "b"))));

        let (state, _) = composer(&ctx, &registry)
            .compose(&message(&ctx, "hi"), &[], true)
            .await;
        assert_eq!(state.value("k"), Some("b"));
        assert!(state.text.contains("k=a"));
        assert!(state.text.contains("k=b"));
        assert_eq!(state.value("providers"), Some(state.text.as_str()));
    }

    #[tokio::test]
    async fn test_private_and_dynamic_only_when_named() {
        let (ctx, _) = context();
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register_provider(Arc::new(TestProvider::new("PUBLIC", Behaviour::Text("p"))));
        registry.register_provider(Arc::new(
            TestProvider::new("SECRET", Behaviour::Text("s")).private(),
        ));
        registry.register_provider(Arc::new(
            TestProvider::new("SEARCH", Behaviour::Text("d")).dynamic(),
        ));
        let composer = composer(&ctx, &registry);
        let msg = message(&ctx, "hi");

        let (state, _) = composer.compose(&msg, &[], false).await;
        assert_eq!(state.text, "p");

        let names = vec!["secret".to_string(), "SEARCH".to_string(), "MISSING".to_string()];
        let (state, outcomes) = composer.compose(&msg, &names, false).await;
        assert_eq!(state.text, "s\n\nd");
        assert_eq!(outcomes.len(), 2);
    }

    #[tokio::test]
    async fn test_cache_reuses_results_until_bypassed() {
        let (ctx, _) = context();
        let registry = Arc::new(CapabilityRegistry::new());
        let provider = Arc::new(TestProvider::new("A", Behaviour::Text("alpha")));
        registry.register_provider(provider.clone());
        let composer = composer(&ctx, &registry);
        let msg = message(&ctx, "hi");

        composer.compose(&msg, &[], true).await;
        let (_, outcomes) = composer.compose(&msg, &[], true).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(outcomes[0].cached);

        composer.compose(&msg, &[], false).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        composer.cache().purge();
        assert!(composer.cache().is_empty());
    }

    // ── Actions ────────────────────────────────────────────────

    struct TestAction {
        name: &'static str,
        valid: bool,
        fail: bool,
    }

    #[async_trait]
    impl Action for TestAction {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "test action"
        }

        fn similes(&self) -> Vec<String> {
            vec!["SEND_MESSAGE".into()]
        }

        async fn validate(
            &self,
            _ctx: &dyn RuntimeContext,
            _message: &Memory,
            _state: &State,
        ) -> Result<bool> {
            if self.valid {
                Ok(true)
            } else {
                Err(EmberError::Action {
                    action: self.name.into(),
                    reason: "not applicable".into(),
                })
            }
        }

        async fn handle(
            &self,
            _ctx: &dyn RuntimeContext,
            _message: &Memory,
            _state: &State,
            sink: &dyn ResponseSink,
        ) -> Result<ActionResult> {
            if self.fail {
                return Err(EmberError::Action {
                    action: self.name.into(),
                    reason: "smtp down".into(),
                });
            }
            sink.send(Content::text("sent!")).await?;
            Ok(ActionResult::ok("delivered"))
        }
    }

    #[tokio::test]
    async fn test_select_actions_empty_when_all_invalid() {
        let (ctx, _) = context();
        let registry = Arc::new(CapabilityRegistry::new());
        for name in ["A", "B"] {
            registry.register_action(Arc::new(TestAction {
                name,
                valid: false,
                fail: false,
            }));
        }
        let selected = pipeline(&ctx, &registry)
            .select_actions(&message(&ctx, "hi"), &State::new())
            .await;
        assert!(selected.is_empty());
    }

    #[tokio::test]
    async fn test_find_action_by_simile() {
        let (ctx, _) = context();
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register_action(Arc::new(TestAction {
            name: "REPLY",
            valid: true,
            fail: false,
        }));
        let pipeline = pipeline(&ctx, &registry);
        assert!(pipeline.find_action("reply").is_some());
        assert!(pipeline.find_action("send-message").is_some());
        assert!(pipeline.find_action("IGNORE").is_none());
    }

    #[tokio::test]
    async fn test_invoke_records_success_and_failure() {
        let (ctx, storage) = context();
        let registry = Arc::new(CapabilityRegistry::new());
        let pipeline = pipeline(&ctx, &registry);
        let msg = message(&ctx, "hi");
        let sink = CollectingSink::new();

        let ok: Arc<dyn Action> = Arc::new(TestAction {
            name: "SEND",
            valid: true,
            fail: false,
        });
        let outcome = pipeline.invoke(&ok, &msg, &State::new(), &sink).await;
        assert!(outcome.success());
        assert_eq!(sink.sent().len(), 1);

        let broken: Arc<dyn Action> = Arc::new(TestAction {
            name: "SEND",
            valid: true,
            fail: true,
        });
        let outcome = pipeline.invoke(&broken, &msg, &State::new(), &sink).await;
        assert!(!outcome.success());

        let records = storage
            .get_memories(&MemoryQuery::room(msg.room_id).table(TABLE_ACTIONS))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        let failed = storage.get_memory(outcome.memory_id).await.unwrap().unwrap();
        assert!(failed.content.error.as_deref().unwrap().contains("smtp down"));
    }

    // ── Evaluators ─────────────────────────────────────────────

    struct TestEvaluator {
        name: &'static str,
        always: bool,
        applies: bool,
        fail: bool,
    }

    #[async_trait]
    impl Evaluator for TestEvaluator {
        fn name(&self) -> &str {
            self.name
        }

        fn always_run(&self) -> bool {
            self.always
        }

        async fn validate(
            &self,
            _ctx: &dyn RuntimeContext,
            _message: &Memory,
            _state: &State,
        ) -> Result<bool> {
            Ok(self.applies)
        }

        async fn evaluate(
            &self,
            _ctx: &dyn RuntimeContext,
            _message: &Memory,
            _state: &State,
            did_respond: bool,
        ) -> Result<EvaluationResult> {
            if self.fail {
                return Err(EmberError::Evaluator {
                    evaluator: self.name.into(),
                    reason: "model offline".into(),
                });
            }
            Ok(if did_respond {
                EvaluationResult::pass()
            } else {
                EvaluationResult::fail("no reply")
            })
        }
    }

    #[tokio::test]
    async fn test_evaluate_runs_applicable_and_records_failures() {
        let (ctx, storage) = context();
        let mut events = ctx.events().subscribe();
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register_evaluator(Arc::new(TestEvaluator {
            name: "ALWAYS",
            always: true,
            applies: false,
            fail: false,
        }));
        registry.register_evaluator(Arc::new(TestEvaluator {
            name: "SKIPPED",
            always: false,
            applies: false,
            fail: false,
        }));
        registry.register_evaluator(Arc::new(TestEvaluator {
            name: "BROKEN",
            always: false,
            applies: true,
            fail: true,
        }));
        let msg = message(&ctx, "hi");

        let outcomes = pipeline(&ctx, &registry)
            .evaluate(&msg, &State::new(), true)
            .await;
        let names: Vec<&str> = outcomes.iter().map(|o| o.evaluator.as_str()).collect();
        assert_eq!(names, vec!["ALWAYS", "BROKEN"]);
        assert!(outcomes[0].result.passed);
        assert!(!outcomes[1].result.passed);

        let records = storage
            .get_memories(&MemoryQuery::room(msg.room_id).table(TABLE_EVALUATIONS))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::EvaluatorCompleted { passed: true, .. }
        ));
    }

    // ── Services ───────────────────────────────────────────────

    struct NamedService {
        service_type: &'static str,
        fail_stop: bool,
        stops: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Service for NamedService {
        fn service_type(&self) -> &str {
            self.service_type
        }

        async fn stop(&self) -> Result<()> {
            self.stops.lock().push(self.service_type);
            if self.fail_stop {
                return Err(EmberError::Service {
                    service: self.service_type.into(),
                    reason: "stuck".into(),
                });
            }
            Ok(())
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[tokio::test]
    async fn test_service_registry_lifecycle() {
        let stops = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let svc = |service_type, fail_stop| {
            Arc::new(NamedService {
                service_type,
                fail_stop,
                stops: stops.clone(),
            })
        };
        let registry = ServiceRegistry::new();
        registry.register(svc("sql", false)).unwrap();
        registry.register(svc("browser", true)).unwrap();
        registry.register(svc("voice", false)).unwrap();

        assert!(matches!(
            registry.register(svc("sql", false)),
            Err(EmberError::DuplicateService(_))
        ));
        assert!(registry.replace(svc("sql", false)).is_some());
        assert_eq!(registry.types(), vec!["sql", "browser", "voice"]);
        assert!(registry.get_as::<NamedService>("browser").is_some());
        assert!(registry.has("voice"));

        let failures = registry.stop_all().await;
        assert_eq!(*stops.lock(), vec!["voice", "browser", "sql"]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "browser");
        assert!(registry.types().is_empty());
    }

    // ── World settings ─────────────────────────────────────────

    #[tokio::test]
    async fn test_world_settings_update_and_cache() {
        let (ctx, storage) = context();
        let world_id = Uuid::new_v4();
        let mut settings = ember_core::WorldSettings::new();
        settings.insert("API_KEY", ember_core::Setting::new("API_KEY", "key", true));
        let mut world = ember_core::World {
            id: world_id,
            agent_id: ctx.agent_id(),
            name: None,
            server_id: "guild".into(),
            owner_id: None,
            metadata: Default::default(),
        };
        world.set_settings(&settings).unwrap();
        storage.create_world(&world).await.unwrap();

        let before = ctx.get_world_settings(world_id).await.unwrap().unwrap();
        assert!(!before.is_complete());

        ctx.set_world_setting(world_id, "API_KEY", serde_json::json!("abc"))
            .await
            .unwrap();
        let after = ctx.get_world_settings(world_id).await.unwrap().unwrap();
        assert!(after.is_complete());

        assert!(matches!(
            ctx.set_world_setting(world_id, "NOPE", serde_json::json!(1)).await,
            Err(EmberError::UnknownSetting(_))
        ));
    }
}

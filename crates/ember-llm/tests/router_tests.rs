#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use ember_core::{EmberError, Result};
    use ember_llm::model::ModelHandler;
    use parking_lot::Mutex;
    use ember_llm::mock::{MockModel, MockReply};
    use ember_llm::model::{ModelKind, ModelOutput, ModelRegistration, ModelRequest};
    use ember_llm::router::ModelRouter;

    fn fast_router() -> ModelRouter {
        ModelRouter::new().with_retry(3, Duration::from_millis(1))
    }

    fn request() -> ModelRequest {
        ModelRequest::prompt("Hello")
    }

    // ── Selection ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_no_handler_is_model_not_found() {
        let router = fast_router();
        let err = router
            .use_model(ModelKind::TextLarge, &request())
            .await
            .unwrap_err();
        assert!(matches!(err, EmberError::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn test_highest_priority_wins() {
        let router = fast_router();
        let low = Arc::new(MockModel::new("low").with_fallback(MockReply::Text("low".into())));
        let high = Arc::new(MockModel::new("high").with_fallback(MockReply::Text("high".into())));
        router.register(ModelRegistration::new(ModelKind::TextLarge, 0, low.clone()));
        router.register(ModelRegistration::new(ModelKind::TextLarge, 10, high.clone()));

        let out = router.use_model(ModelKind::TextLarge, &request()).await.unwrap();
        assert_eq!(out, ModelOutput::Text("high".into()));
        assert_eq!(low.call_count(ModelKind::TextLarge), 0);
        assert_eq!(router.active_handler(ModelKind::TextLarge).as_deref(), Some("high"));
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_registration_order() {
        let router = fast_router();
        router.register(ModelRegistration::new(
            ModelKind::TextSmall,
            5,
            Arc::new(MockModel::new("first")),
        ));
        router.register(ModelRegistration::new(
            ModelKind::TextSmall,
            5,
            Arc::new(MockModel::new("second")),
        ));
        assert_eq!(router.active_handler(ModelKind::TextSmall).as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_kinds_are_routed_independently() {
        let router = fast_router();
        router.register(ModelRegistration::new(
            ModelKind::TextEmbedding,
            0,
            Arc::new(MockModel::new("emb").with_fallback(MockReply::Embedding(vec![0.5, 0.5]))),
        ));
        assert!(router.has_handler(ModelKind::TextEmbedding));
        assert!(!router.has_handler(ModelKind::TextLarge));

        let emb = router
            .use_model(ModelKind::TextEmbedding, &request())
            .await
            .unwrap()
            .into_embedding()
            .unwrap();
        assert_eq!(emb, vec![0.5, 0.5]);
    }

    // ── Retry / failover ───────────────────────────────────────

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let router = fast_router();
        let model = Arc::new(
            MockModel::new("flaky")
                .with_error("HTTP 503: overloaded")
                .with_text("recovered"),
        );
        router.register(ModelRegistration::new(ModelKind::TextLarge, 0, model.clone()));

        let text = router.generate_text(ModelKind::TextLarge, &request()).await.unwrap();
        assert_eq!(text, "recovered");
        assert_eq!(model.call_count(ModelKind::TextLarge), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let router = fast_router();
        let model = Arc::new(MockModel::new("strict").with_error("bad request"));
        router.register(ModelRegistration::new(ModelKind::TextLarge, 0, model.clone()));

        let err = router
            .use_model(ModelKind::TextLarge, &request())
            .await
            .unwrap_err();
        assert!(matches!(err, EmberError::Model(_)));
        assert_eq!(model.call_count(ModelKind::TextLarge), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let router = ModelRouter::new().with_retry(2, Duration::from_millis(1));
        let model = Arc::new(
            MockModel::new("down").with_fallback(MockReply::Error("HTTP 500: boom".into())),
        );
        router.register(ModelRegistration::new(ModelKind::TextLarge, 0, model.clone()));

        assert!(router.use_model(ModelKind::TextLarge, &request()).await.is_err());
        assert_eq!(model.call_count(ModelKind::TextLarge), 3);
    }

    #[tokio::test]
    async fn test_failover_to_lower_priority() {
        let router = fast_router();
        let primary = Arc::new(MockModel::new("primary").with_error("bad request"));
        let backup = Arc::new(MockModel::new("backup").with_text("from backup"));
        router.register(ModelRegistration::new(ModelKind::TextLarge, 10, primary));
        router.register(ModelRegistration::new(ModelKind::TextLarge, 1, backup));

        let text = router.generate_text(ModelKind::TextLarge, &request()).await.unwrap();
        assert_eq!(text, "from backup");
    }

    #[tokio::test]
    async fn test_unregister_removes_handler() {
        let router = fast_router();
        router.register(ModelRegistration::new(
            ModelKind::TextSmall,
            0,
            Arc::new(MockModel::new("gone")),
        ));
        assert_eq!(router.unregister("gone"), 1);
        assert!(!router.has_handler(ModelKind::TextSmall));
    }

    // ── Circuit breaker ────────────────────────────────────────

    #[derive(Clone, Copy)]
    enum Mode {
        Fail,
        Hang,
        Succeed,
    }

    struct FlakyModel {
        mode: Mutex<Mode>,
        calls: AtomicUsize,
    }

    impl FlakyModel {
        fn new(mode: Mode) -> Self {
            Self {
                mode: Mutex::new(mode),
                calls: AtomicUsize::new(0),
            }
        }

        fn set(&self, mode: Mode) {
            *self.mode.lock() = mode;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelHandler for FlakyModel {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn generate(&self, _kind: ModelKind, _request: &ModelRequest) -> Result<ModelOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mode = *self.mode.lock();
            match mode {
                Mode::Fail => Err(EmberError::Model("bad request".into())),
                Mode::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Mode::Succeed => Ok(ModelOutput::Text("recovered".into())),
            }
        }
    }

    #[tokio::test]
    async fn test_open_circuit_skips_handler() {
        let router = ModelRouter::new()
            .with_retry(0, Duration::from_millis(1))
            .with_circuit_breaker(2, Duration::from_secs(60));
        let model = Arc::new(FlakyModel::new(Mode::Fail));
        router.register(ModelRegistration::new(ModelKind::TextLarge, 0, model.clone()));

        for _ in 0..2 {
            assert!(router.use_model(ModelKind::TextLarge, &request()).await.is_err());
        }
        model.set(Mode::Succeed);
        let err = router
            .use_model(ModelKind::TextLarge, &request())
            .await
            .unwrap_err();
        assert!(matches!(err, EmberError::ModelNotFound(_)));
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_dropped_half_open_call_does_not_disable_handler() {
        let open_for = Duration::from_millis(50);
        let router = ModelRouter::new()
            .with_retry(0, Duration::from_millis(1))
            .with_circuit_breaker(1, open_for);
        let model = Arc::new(FlakyModel::new(Mode::Fail));
        router.register(ModelRegistration::new(ModelKind::TextLarge, 0, model.clone()));

        assert!(router.use_model(ModelKind::TextLarge, &request()).await.is_err());
        tokio::time::sleep(open_for + Duration::from_millis(20)).await;

        // The first call after the open period hangs and is abandoned by its caller.
        model.set(Mode::Hang);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            router.use_model(ModelKind::TextLarge, &request()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(model.calls(), 2);

        model.set(Mode::Succeed);
        tokio::time::sleep(open_for + Duration::from_millis(20)).await;
        let text = router
            .generate_text(ModelKind::TextLarge, &request())
            .await
            .unwrap();
        assert_eq!(text, "recovered");
        assert_eq!(model.calls(), 3);

        // Closed again: no waiting needed.
        assert!(router.use_model(ModelKind::TextLarge, &request()).await.is_ok());
    }

    #[test]
    fn test_model_kind_display() {
        assert_eq!(ModelKind::TextLarge.to_string(), "TEXT_LARGE");
        let json = serde_json::to_string(&ModelKind::ObjectSmall).unwrap();
        assert_eq!(json, "\"OBJECT_SMALL\"");
    }
}

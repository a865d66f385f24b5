// LLM request broker
//
// Sits between pipeline code and the chat completion endpoint:
// - cache: answers are looked up in the call log by exact (prompt, model)
// - decode: structured replies are parsed with lenient repair
// - validate: callers may reject decoded replies
// - retry: transport, decode and validation failures share one attempt budget
//
// Every failed attempt is recorded in the `error` partition before the next
// one starts.

pub mod decode;
pub mod transport;
pub mod validate;

use std::sync::Arc;
use std::time::Duration;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub use decode::StructuredDecoder;
pub use transport::{ChatRequest, ChatTransport, OpenAiTransport, RetryingTransport, TransportFactory};
pub use validate::{FieldEquals, ResponseValidator, ValidationResult, ValidationStatus};

use crate::calllog::{CallRecord, PersistentCallLog, DEFAULT_PARTITION, ERROR_PARTITION};
use crate::config::{ApiConfig, Config};
use crate::error::{AttemptError, BrokerError, Result};

const API_CHECK_PROMPT: &str = "This is a test, response 'message':'success' in json format.";

/// Per-call parameters for [`RequestBroker::ask`]
#[derive(Clone)]
pub struct RequestConfig {
    pub model: String,
    /// Decode the reply as JSON; otherwise the raw text is returned
    pub require_structured: bool,
    pub validator: Option<Arc<dyn ResponseValidator>>,
    /// Partition receiving the successful record; `None` disables it
    pub log_partition: Option<String>,
    /// Upper bound for the whole call, including waiting for the broker
    pub deadline: Option<Duration>,
}

impl RequestConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            require_structured: true,
            validator: None,
            log_partition: Some(DEFAULT_PARTITION.to_string()),
            deadline: None,
        }
    }

    pub fn text(mut self) -> Self {
        self.require_structured = false;
        self
    }

    pub fn with_validator<V: ResponseValidator + 'static>(mut self, validator: V) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn with_log_partition(mut self, partition: impl Into<String>) -> Self {
        self.log_partition = Some(partition.into());
        self
    }

    pub fn without_logging(mut self) -> Self {
        self.log_partition = None;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

enum Attempt {
    Accepted(Value),
    Failed(AttemptError),
}

pub struct RequestBroker {
    api: ApiConfig,
    log: PersistentCallLog,
    transport: RetryingTransport,
    decoder: StructuredDecoder,
    max_attempts: u32,
    // Serializes lookup, upstream call and append across all callers
    lock: Mutex<()>,
}

impl RequestBroker {
    pub fn new(config: &Config) -> Result<Self> {
        let transport = TransportFactory::create_transport(&config.api)?;
        Ok(Self::with_transport(config, transport))
    }

    pub fn with_transport(config: &Config, transport: Box<dyn ChatTransport>) -> Self {
        Self {
            api: config.api.clone(),
            log: PersistentCallLog::new(&config.broker.log_dir),
            transport: RetryingTransport::new(transport, config.broker.retry_delay()),
            decoder: StructuredDecoder::new(),
            max_attempts: config.broker.max_attempts.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn log(&self) -> &PersistentCallLog {
        &self.log
    }

    /// Request defaults for the configured model
    pub fn request_config(&self) -> RequestConfig {
        RequestConfig::new(&self.api.model)
    }

    /// Ask the model, answering from the call log when possible.
    ///
    /// Returns the decoded JSON value, or a JSON string holding the raw
    /// reply when structured output was not requested.
    pub async fn ask(&self, prompt: &str, request: &RequestConfig) -> Result<Value> {
        if let Some(partition) = &request.log_partition {
            PersistentCallLog::check_partition_name(partition)?;
        }

        match request.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.ask_serialized(prompt, request))
                .await
                .map_err(|_| {
                    warn!("Request for model {} exceeded its deadline of {:?}", request.model, deadline);
                    BrokerError::DeadlineExceeded(deadline)
                })?,
            None => self.ask_serialized(prompt, request).await,
        }
    }

    async fn ask_serialized(&self, prompt: &str, request: &RequestConfig) -> Result<Value> {
        let _guard = self.lock.lock().await;

        if let Some(record) = self.lookup(prompt, &request.model).await? {
            debug!("Answering from call log for model {}", request.model);
            return Ok(record.response);
        }

        if self.api.key.trim().is_empty() {
            return Err(BrokerError::Precondition("API key is missing".to_string()));
        }

        let json_mode = request.require_structured && self.api.supports_json_mode(&request.model);
        let chat = ChatRequest::user(&request.model, prompt, json_mode);

        let mut attempt = 0;
        let value = loop {
            attempt += 1;
            match self.attempt(prompt, request, &chat, attempt).await? {
                Attempt::Accepted(value) => break value,
                Attempt::Failed(cause) if attempt >= self.max_attempts => {
                    error!("Giving up on model {} after {} attempts: {}", request.model, attempt, cause);
                    return Err(BrokerError::ExhaustedRetries { attempts: attempt, last: cause });
                }
                Attempt::Failed(AttemptError::Transport(_)) => {
                    info!("Retrying ({}/{})...", attempt + 1, self.max_attempts);
                    self.transport.backoff().await;
                }
                Attempt::Failed(_) => {
                    info!("Retrying ({}/{})...", attempt + 1, self.max_attempts);
                }
            }
        };

        if let Some(partition) = &request.log_partition {
            self.append(partition, CallRecord::success(&request.model, prompt, value.clone())).await?;
        }

        Ok(value)
    }

    /// One round trip plus decoding and validation. Failures are written to
    /// the error partition here; only log I/O problems escape as `Err`.
    async fn attempt(
        &self,
        prompt: &str,
        request: &RequestConfig,
        chat: &ChatRequest,
        attempt: u32,
    ) -> Result<Attempt> {
        let raw = match self.transport.call(chat, attempt, self.max_attempts).await {
            Ok(raw) => raw,
            Err(cause) => {
                self.record_failure(&request.model, prompt, Value::Null, &cause).await?;
                return Ok(Attempt::Failed(cause));
            }
        };

        if !request.require_structured {
            return Ok(Attempt::Accepted(Value::String(raw)));
        }

        let value = match self.decoder.decode(&raw) {
            Ok(value) => value,
            Err(cause) => {
                warn!("JSON parsing failed: {}. Reply: '''{}'''", cause, raw);
                self.record_failure(&request.model, prompt, Value::String(raw), &cause).await?;
                return Ok(Attempt::Failed(cause));
            }
        };

        if let Some(validator) = &request.validator {
            let result = validator.validate(&value);
            if !result.is_success() {
                let message = result.message.unwrap_or_else(|| "validation failed".to_string());
                warn!("API response error: {}", message);
                let cause = AttemptError::Validation(message);
                self.record_failure(&request.model, prompt, value, &cause).await?;
                return Ok(Attempt::Failed(cause));
            }
        }

        Ok(Attempt::Accepted(value))
    }

    async fn record_failure(&self, model: &str, prompt: &str, response: Value, cause: &AttemptError) -> Result<()> {
        let message = match cause {
            AttemptError::Validation(message) => message.clone(),
            other => other.to_string(),
        };
        self.append(ERROR_PARTITION, CallRecord::failure(model, prompt, response, message)).await
    }

    // The call log is plain std::fs; keep its scans and rewrites off the
    // async workers while the broker lock is held.
    async fn lookup(&self, prompt: &str, model: &str) -> Result<Option<CallRecord>> {
        let log = self.log.clone();
        let (prompt, model) = (prompt.to_string(), model.to_string());
        tokio::task::spawn_blocking(move || log.lookup(&prompt, &model))
            .await
            .map_err(|e| BrokerError::Log(format!("Call log lookup task failed: {}", e)))?
    }

    async fn append(&self, partition: &str, record: CallRecord) -> Result<()> {
        let log = self.log.clone();
        let partition = partition.to_string();
        tokio::task::spawn_blocking(move || log.append(&partition, record))
            .await
            .map_err(|e| BrokerError::Log(format!("Call log append task failed: {}", e)))?
    }
}

/// Probe the endpoint with a tiny JSON request; `true` when the configured
/// key and model produce an acceptable answer.
pub async fn check_api(broker: &RequestBroker) -> bool {
    let request = broker
        .request_config()
        .with_validator(FieldEquals::new("message", "success"))
        .without_logging();

    match broker.ask(API_CHECK_PROMPT, &request).await {
        Ok(_) => true,
        Err(e) => {
            warn!("API check failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;
    use serde_json::json;
    use crate::error::TransportError;
    use transport::MockChatTransport;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.api.key = "sk-test".to_string();
        config.api.model = "m1".to_string();
        config.api.json_models = vec!["m1".to_string()];
        config.broker.log_dir = dir.join("gpt_log");
        config.broker.retry_delay_secs = 0;
        config
    }

    /// Replays canned replies in order, repeating the last one
    struct ScriptedTransport {
        replies: std::sync::Mutex<VecDeque<std::result::Result<String, TransportError>>>,
        calls: Arc<AtomicUsize>,
        latency: Duration,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<std::result::Result<String, TransportError>>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let transport = Self {
                replies: std::sync::Mutex::new(replies.into()),
                calls: calls.clone(),
                latency: Duration::ZERO,
            };
            (transport, calls)
        }

        fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn complete(&self, _request: &ChatRequest) -> std::result::Result<String, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                replies.front().cloned().unwrap()
            }
        }
    }

    fn success_validator(value: &Value) -> ValidationResult {
        if value["message"] == "success" {
            ValidationResult::success()
        } else {
            ValidationResult::failure("message is not success")
        }
    }

    #[tokio::test]
    async fn test_accepted_reply_is_returned_and_logged() {
        let temp = tempfile::tempdir().unwrap();
        let (transport, calls) = ScriptedTransport::new(vec![Ok(r#"{"message":"success"}"#.to_string())]);
        let broker = RequestBroker::with_transport(&test_config(temp.path()), Box::new(transport));

        let request = broker.request_config().with_validator(success_validator);
        let value = broker.ask("return 200 as json", &request).await.unwrap();

        assert_eq!(value, json!({"message": "success"}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let records = broker.log().read(DEFAULT_PARTITION).unwrap();
        assert_eq!(records, vec![CallRecord::success("m1", "return 200 as json", json!({"message": "success"}))]);
        assert!(broker.log().read(ERROR_PARTITION).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_identical_ask_is_served_from_log() {
        let temp = tempfile::tempdir().unwrap();
        let mut mock = MockChatTransport::new();
        mock.expect_complete()
            .times(1)
            .returning(|_| Ok(r#"{"text": "bonjour"}"#.to_string()));
        let broker = RequestBroker::with_transport(&test_config(temp.path()), Box::new(mock));

        let request = broker.request_config().with_log_partition("translate");
        let first = broker.ask("translate hello", &request).await.unwrap();
        let second = broker.ask("translate hello", &request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(broker.log().read("translate").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cache_survives_a_new_broker() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());

        let (transport, _) = ScriptedTransport::new(vec![Ok(r#"{"n": 1}"#.to_string())]);
        let broker = RequestBroker::with_transport(&config, Box::new(transport));
        broker.ask("count", &broker.request_config()).await.unwrap();
        drop(broker);

        let mut mock = MockChatTransport::new();
        mock.expect_complete().times(0);
        let restarted = RequestBroker::with_transport(&config, Box::new(mock));
        assert_eq!(restarted.ask("count", &restarted.request_config()).await.unwrap(), json!({"n": 1}));

        // Exact matching: a trailing space is a different prompt
        let mut mock = MockChatTransport::new();
        mock.expect_complete().times(1).returning(|_| Ok(r#"{"n": 2}"#.to_string()));
        let restarted = RequestBroker::with_transport(&config, Box::new(mock));
        assert_eq!(restarted.ask("count ", &restarted.request_config()).await.unwrap(), json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_transport_failures_exhaust_after_five_attempts() {
        let temp = tempfile::tempdir().unwrap();
        let (transport, calls) = ScriptedTransport::new(vec![Err(TransportError::network("connection refused"))]);
        let broker = RequestBroker::with_transport(&test_config(temp.path()), Box::new(transport));

        let err = broker.ask("hello", &broker.request_config()).await.unwrap_err();

        match err {
            BrokerError::ExhaustedRetries { attempts, last } => {
                assert_eq!(attempts, 5);
                assert_eq!(last, AttemptError::Transport(TransportError::network("connection refused")));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(broker.log().read(ERROR_PARTITION).unwrap().len(), 5);
        assert!(broker.log().read(DEFAULT_PARTITION).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validator_rejections_are_logged_per_attempt() {
        let temp = tempfile::tempdir().unwrap();
        let (transport, calls) = ScriptedTransport::new(vec![Ok(r#"{"message": "nope"}"#.to_string())]);
        let broker = RequestBroker::with_transport(&test_config(temp.path()), Box::new(transport));

        let request = broker.request_config().with_validator(success_validator);
        let err = broker.ask("check", &request).await.unwrap_err();

        assert!(matches!(
            err,
            BrokerError::ExhaustedRetries { attempts: 5, last: AttemptError::Validation(_) }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let errors = broker.log().read(ERROR_PARTITION).unwrap();
        assert_eq!(errors.len(), 5);
        for record in errors {
            assert_eq!(record.response, json!({"message": "nope"}));
            assert_eq!(record.message.as_deref(), Some("message is not success"));
        }
    }

    #[tokio::test]
    async fn test_undecodable_reply_is_retried() {
        let temp = tempfile::tempdir().unwrap();
        let (transport, calls) = ScriptedTransport::new(vec![
            Ok("Sorry, I can't do that.".to_string()),
            Ok("```json\n{\"code\": 200,}\n```".to_string()),
        ]);
        let broker = RequestBroker::with_transport(&test_config(temp.path()), Box::new(transport));

        let value = broker.ask("just return 200", &broker.request_config()).await.unwrap();
        assert_eq!(value, json!({"code": 200}));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let errors = broker.log().read(ERROR_PARTITION).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].response, json!("Sorry, I can't do that."));
        assert!(errors[0].message.as_deref().unwrap().contains("structured decoding failed"));
    }

    #[tokio::test]
    async fn test_mixed_failures_share_one_budget() {
        let temp = tempfile::tempdir().unwrap();
        let (transport, calls) = ScriptedTransport::new(vec![
            Err(TransportError::network("timeout")),
            Ok("not json".to_string()),
            Err(TransportError::status(500, "boom")),
            Ok("still not json".to_string()),
            Err(TransportError::network("reset")),
            Ok(r#"{"late": true}"#.to_string()),
        ]);
        let broker = RequestBroker::with_transport(&test_config(temp.path()), Box::new(transport));

        let err = broker.ask("q", &broker.request_config()).await.unwrap_err();
        assert!(matches!(
            err,
            BrokerError::ExhaustedRetries { attempts: 5, last: AttemptError::Transport(_) }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_json_mode_only_for_allow_listed_models() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = test_config(temp.path());
        config.api.json_models = vec!["gpt-4o".to_string()];

        let mut mock = MockChatTransport::new();
        mock.expect_complete()
            .withf(|request: &ChatRequest| request.model == "m1" && request.response_format.is_none())
            .times(1)
            .returning(|_| Ok(r#"{"a": 1}"#.to_string()));
        mock.expect_complete()
            .withf(|request: &ChatRequest| request.model == "gpt-4o" && request.response_format.is_some())
            .times(1)
            .returning(|_| Ok(r#"{"a": 2}"#.to_string()));
        let broker = RequestBroker::with_transport(&config, Box::new(mock));

        broker.ask("q", &RequestConfig::new("m1")).await.unwrap();
        broker.ask("q", &RequestConfig::new("gpt-4o")).await.unwrap();
    }

    #[tokio::test]
    async fn test_text_mode_skips_decoding_and_json_mode() {
        let temp = tempfile::tempdir().unwrap();
        let mut mock = MockChatTransport::new();
        mock.expect_complete()
            .withf(|request: &ChatRequest| request.response_format.is_none())
            .times(1)
            .returning(|_| Ok("plain words, no JSON".to_string()));
        let broker = RequestBroker::with_transport(&test_config(temp.path()), Box::new(mock));

        let value = broker.ask("say something", &broker.request_config().text()).await.unwrap();
        assert_eq!(value, json!("plain words, no JSON"));
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_before_any_attempt() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = test_config(temp.path());
        config.api.key = "  ".to_string();

        let mut mock = MockChatTransport::new();
        mock.expect_complete().times(0);
        let broker = RequestBroker::with_transport(&config, Box::new(mock));

        let err = broker.ask("q", &broker.request_config()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Precondition(_)));
        assert!(broker.log().partitions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_partition_still_records_errors() {
        let temp = tempfile::tempdir().unwrap();
        let (transport, _) = ScriptedTransport::new(vec![
            Ok("garbage".to_string()),
            Ok(r#"{"ok": true}"#.to_string()),
        ]);
        let broker = RequestBroker::with_transport(&test_config(temp.path()), Box::new(transport));

        let value = broker.ask("q", &broker.request_config().without_logging()).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(broker.log().partitions().unwrap(), vec![ERROR_PARTITION.to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_identical_asks_make_one_upstream_call() {
        let temp = tempfile::tempdir().unwrap();
        let (transport, calls) = ScriptedTransport::new(vec![Ok(r#"{"v": 42}"#.to_string())]);
        let transport = transport.with_latency(Duration::from_millis(100));
        let broker = Arc::new(RequestBroker::with_transport(&test_config(temp.path()), Box::new(transport)));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let broker = broker.clone();
                tokio::spawn(async move {
                    let request = broker.request_config();
                    broker.ask("same prompt", &request).await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!({"v": 42}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.log().read(DEFAULT_PARTITION).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deadline_bounds_a_slow_call() {
        let temp = tempfile::tempdir().unwrap();
        let (transport, _) = ScriptedTransport::new(vec![Ok(r#"{"v": 1}"#.to_string())]);
        let transport = transport.with_latency(Duration::from_millis(500));
        let broker = RequestBroker::with_transport(&test_config(temp.path()), Box::new(transport));

        let request = broker.request_config().with_deadline(Duration::from_millis(50));
        let err = broker.ask("slow", &request).await.unwrap_err();
        assert!(matches!(err, BrokerError::DeadlineExceeded(d) if d == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_check_api() {
        let temp = tempfile::tempdir().unwrap();
        let (transport, _) = ScriptedTransport::new(vec![Ok(r#"{"message": "success"}"#.to_string())]);
        let broker = RequestBroker::with_transport(&test_config(temp.path()), Box::new(transport));
        assert!(check_api(&broker).await);
        assert!(broker.log().read(DEFAULT_PARTITION).unwrap().is_empty());

        let temp = tempfile::tempdir().unwrap();
        let (transport, _) = ScriptedTransport::new(vec![Err(TransportError::status(401, "invalid key"))]);
        let broker = RequestBroker::with_transport(&test_config(temp.path()), Box::new(transport));
        assert!(!check_api(&broker).await);
    }

    #[tokio::test]
    async fn test_unusable_partition_names_fail_before_any_call() {
        for partition in ["", "step/one", "step\\one", "../outside", "error", "terror_sub"] {
            let temp = tempfile::tempdir().unwrap();
            let mut mock = MockChatTransport::new();
            mock.expect_complete().times(0);
            let broker = RequestBroker::with_transport(&test_config(temp.path()), Box::new(mock));

            let request = broker.request_config().with_log_partition(partition);
            let err = broker.ask("q", &request).await.unwrap_err();
            assert!(matches!(err, BrokerError::Config(_)), "partition {:?} gave {}", partition, err);
            assert!(broker.log().partitions().unwrap().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_follows_transport_failures_only() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = test_config(temp.path());
        config.broker.retry_delay_secs = 2;

        let (transport, calls) = ScriptedTransport::new(vec![
            Err(TransportError::network("connection reset")),
            Err(TransportError::network("connection reset")),
            Ok(r#"{"ok": true}"#.to_string()),
        ]);
        let broker = RequestBroker::with_transport(&config, Box::new(transport));

        let started = tokio::time::Instant::now();
        broker.ask("flaky", &broker.request_config()).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(4));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let (transport, calls) = ScriptedTransport::new(vec![
            Ok("not json at all".to_string()),
            Ok(r#"{"message": "nope"}"#.to_string()),
            Ok(r#"{"message": "success"}"#.to_string()),
        ]);
        let broker = RequestBroker::with_transport(&config, Box::new(transport));

        let started = tokio::time::Instant::now();
        let request = broker.request_config().with_validator(success_validator);
        broker.ask("picky", &request).await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

//! Scripted broker doubles for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;

use crate::broker::{
    AccountInfo, Broker, BrokerError, BrokerMessage, ConsumerBacklog, ConsumerSpec, Headers,
    MessageInfo, PullConsumer, StreamSpec,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AckCall {
    Ack,
    Nak(Option<Duration>),
    Term,
    InProgress,
}

#[derive(Debug, thiserror::Error)]
#[error("scripted failure: {0}")]
pub struct ScriptedError(pub String);

impl BrokerError for ScriptedError {}

#[derive(Clone, Debug)]
pub struct ScriptedMessage {
    subject: String,
    headers: Headers,
    payload: Bytes,
    num_delivered: u64,
    broken_info: bool,
    calls: Arc<Mutex<Vec<AckCall>>>,
}

impl ScriptedMessage {
    pub fn new(subject: &str, num_delivered: u64) -> Self {
        Self {
            subject: subject.to_string(),
            headers: Headers::new(),
            payload: Bytes::from_static(b"payload"),
            num_delivered,
            broken_info: false,
            calls: Arc::default(),
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn with_payload(mut self, payload: &'static [u8]) -> Self {
        self.payload = Bytes::from_static(payload);
        self
    }

    /// Makes `info()` fail, as a message without a reply subject would.
    pub const fn with_broken_info(mut self) -> Self {
        self.broken_info = true;
        self
    }

    pub fn calls(&self) -> Vec<AckCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: AckCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl BrokerMessage for ScriptedMessage {
    type Error = ScriptedError;

    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &Bytes {
        &self.payload
    }

    fn headers(&self) -> Headers {
        self.headers.clone()
    }

    fn info(&self) -> Result<MessageInfo, ScriptedError> {
        if self.broken_info {
            return Err(ScriptedError("no reply subject".to_string()));
        }

        Ok(MessageInfo {
            stream: "round".to_string(),
            consumer: "backend-round-finalized-v1".to_string(),
            num_delivered: self.num_delivered,
            stream_sequence: 42,
            consumer_sequence: 7,
            timestamp: Utc::now(),
            domain: None,
        })
    }

    async fn ack(&self) -> Result<(), ScriptedError> {
        self.record(AckCall::Ack);
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), ScriptedError> {
        self.record(AckCall::Nak(delay));
        Ok(())
    }

    async fn term(&self) -> Result<(), ScriptedError> {
        self.record(AckCall::Term);
        Ok(())
    }

    async fn in_progress(&self) -> Result<(), ScriptedError> {
        self.record(AckCall::InProgress);
        Ok(())
    }
}

type FetchResult = Result<Vec<ScriptedMessage>, ScriptedError>;

/// Replays scripted fetch results, then idles like an empty pull.
#[derive(Clone, Debug, Default)]
pub struct ScriptedConsumer {
    script: Arc<Mutex<VecDeque<FetchResult>>>,
    fetches: Arc<AtomicUsize>,
}

impl ScriptedConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_fail(self, reason: &str) -> Self {
        self.script
            .lock()
            .push_back(Err(ScriptedError(reason.to_string())));
        self
    }

    pub fn then_deliver(self, messages: Vec<ScriptedMessage>) -> Self {
        self.script.lock().push_back(Ok(messages));
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PullConsumer for ScriptedConsumer {
    type Error = ScriptedError;
    type Message = ScriptedMessage;

    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self, _batch: usize, max_wait: Duration) -> FetchResult {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let next = self.script.lock().pop_front();
        match next {
            Some(result) => result,
            None => {
                tokio::time::sleep(max_wait).await;
                Ok(Vec::new())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Recorded {
    pub streams: Vec<StreamSpec>,
    pub consumers: Vec<(String, ConsumerSpec)>,
    pub published: Vec<(String, Headers, Bytes)>,
    pub purged: Vec<(String, String)>,
    pub purged_before: Vec<(String, u64)>,
    pub deleted: Vec<(String, String)>,
    pub fail_publish: bool,
    pub disconnected: bool,
    pub account: Option<AccountInfo>,
    pub backlog: ConsumerBacklog,
}

/// Records every broker call; consumers it hands out are empty [`ScriptedConsumer`]s.
#[derive(Clone, Debug, Default)]
pub struct RecordingBroker {
    state: Arc<Mutex<Recorded>>,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, Recorded> {
        self.state.lock()
    }

    pub fn published_subjects(&self) -> Vec<String> {
        self.state
            .lock()
            .published
            .iter()
            .map(|(subject, _, _)| subject.clone())
            .collect()
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    type Error = ScriptedError;
    type Consumer = ScriptedConsumer;

    async fn create_or_update_stream(&self, spec: StreamSpec) -> Result<(), ScriptedError> {
        self.state.lock().streams.push(spec);
        Ok(())
    }

    async fn create_or_update_consumer(
        &self,
        stream: &str,
        spec: ConsumerSpec,
    ) -> Result<ScriptedConsumer, ScriptedError> {
        self.state.lock().consumers.push((stream.to_string(), spec));
        Ok(ScriptedConsumer::new())
    }

    async fn consumer_spec(&self, _stream: &str, name: &str) -> Result<ConsumerSpec, ScriptedError> {
        self.state
            .lock()
            .consumers
            .iter()
            .rev()
            .find(|(_, spec)| spec.durable_name.as_deref() == Some(name))
            .map(|(_, spec)| spec.clone())
            .ok_or_else(|| ScriptedError(format!("consumer not found: {name}")))
    }

    async fn consumer_backlog(
        &self,
        _stream: &str,
        _name: &str,
    ) -> Result<ConsumerBacklog, ScriptedError> {
        Ok(self.state.lock().backlog)
    }

    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<(), ScriptedError> {
        self.state
            .lock()
            .deleted
            .push((stream.to_string(), name.to_string()));
        Ok(())
    }

    async fn purge_subject(&self, stream: &str, subject: &str) -> Result<u64, ScriptedError> {
        self.state
            .lock()
            .purged
            .push((stream.to_string(), subject.to_string()));
        Ok(1)
    }

    async fn purge_subject_before(
        &self,
        _stream: &str,
        subject: &str,
        sequence: u64,
    ) -> Result<u64, ScriptedError> {
        self.state
            .lock()
            .purged_before
            .push((subject.to_string(), sequence));
        Ok(0)
    }

    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
    ) -> Result<u64, ScriptedError> {
        let mut state = self.state.lock();
        if state.fail_publish {
            return Err(ScriptedError("publish rejected".to_string()));
        }
        state.published.push((subject.to_string(), headers, payload));
        Ok(state.published.len() as u64)
    }

    fn is_connected(&self) -> bool {
        !self.state.lock().disconnected
    }

    async fn flush(&self) -> Result<(), ScriptedError> {
        Ok(())
    }

    async fn account_info(&self) -> Result<Option<AccountInfo>, ScriptedError> {
        Ok(self.state.lock().account.clone())
    }
}

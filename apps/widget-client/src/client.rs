//! Widget client state machine.
//!
//! One supervising task owns the lifecycle:
//! `checking-connection → loading-config → resuming-conversation →
//! {idle, connected, offline, error}`. The task is driven by a command
//! channel, the push-stream subscription, and a single retry timer; state is
//! published over a `watch` channel. Stream errors retry on a fixed delay as
//! long as a conversation id is held; offline/error states are re-probed on
//! a fixed interval independent of user action.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use futures::StreamExt;
use time::OffsetDateTime;
use uuid::Uuid;

use odm_core::{Message, MessageMetadata, MessageStatus, MessageType, SenderRef};
use odm_reconcile::{ConversationCache, VisibleMessage, new_correlation_id};

use crate::api::{ClientError, EventStream, SendMessageRequest, WidgetApi, WidgetConfig};
use crate::sse::StreamEvent;
use crate::storage::{WidgetStorage, conversation_key, visitor_key};

/// Connection lifecycle states visible to the embedding UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetState {
    CheckingConnection,
    LoadingConfig,
    ResumingConversation,
    /// No conversation yet; only the static welcome copy is shown.
    Idle,
    Connected,
    Offline,
    Error,
}

/// Timer cadences. The defaults are the production values; tests shrink
/// them.
#[derive(Debug, Clone, Copy)]
pub struct ClientTuning {
    /// Re-probe interval for `Offline`/`Error`.
    pub reprobe_interval: Duration,
    /// Fixed stream reconnect delay; no backoff growth, the reconnect cost
    /// is one idle connection from one browser tab.
    pub stream_retry_delay: Duration,
}

impl Default for ClientTuning {
    fn default() -> Self {
        Self {
            reprobe_interval: Duration::from_secs(30),
            stream_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Out-of-band notifications for the embedding UI.
#[derive(Debug, Clone)]
pub enum ClientNotice {
    MessageReceived(Message),
    SendFailed { content: String, reason: String },
}

enum Command {
    Send(String),
    Shutdown,
}

/// Handle to a spawned widget client.
pub struct WidgetHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<WidgetState>,
    conversation: watch::Receiver<Option<Uuid>>,
    config: watch::Receiver<Option<WidgetConfig>>,
    cache: Arc<ConversationCache>,
    notices: Option<mpsc::UnboundedReceiver<ClientNotice>>,
}

impl WidgetHandle {
    pub fn spawn(
        api: Arc<dyn WidgetApi>,
        storage: Arc<dyn WidgetStorage>,
        token: &str,
    ) -> Self {
        Self::spawn_with(api, storage, token, ClientTuning::default())
    }

    pub fn spawn_with(
        api: Arc<dyn WidgetApi>,
        storage: Arc<dyn WidgetStorage>,
        token: &str,
        tuning: ClientTuning,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(WidgetState::CheckingConnection);
        let (conversation_tx, conversation_rx) = watch::channel(None);
        let (config_tx, config_rx) = watch::channel(None);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let cache = Arc::new(ConversationCache::new());

        let runner = Runner {
            api,
            storage,
            token: token.to_string(),
            tuning,
            cache: Arc::clone(&cache),
            state_tx,
            conversation_tx,
            notices: notice_tx,
            commands: command_rx,
            visitor_id: String::new(),
            conversation_id: None,
            stream: None,
            retry_at: None,
            config_tx,
        };
        tokio::spawn(runner.run());

        Self {
            commands: command_tx,
            state: state_rx,
            conversation: conversation_rx,
            config: config_rx,
            cache,
            notices: Some(notice_rx),
        }
    }

    pub fn state(&self) -> WidgetState {
        self.state.borrow().clone()
    }

    /// Waits for the next state transition and returns the new state.
    pub async fn state_changed(&mut self) -> WidgetState {
        let _ = self.state.changed().await;
        self.state.borrow().clone()
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        *self.conversation.borrow()
    }

    /// Welcome copy once the config has loaded; the Idle state renders this
    /// and nothing else.
    pub fn widget_config(&self) -> Option<WidgetConfig> {
        self.config.borrow().clone()
    }

    /// The reconciled view of the active conversation.
    pub fn transcript(&self) -> Vec<VisibleMessage> {
        match self.conversation_id() {
            Some(id) => self.cache.visible(id),
            None => Vec::new(),
        }
    }

    pub async fn send(&self, content: impl Into<String>) -> Result<(), ClientError> {
        self.commands
            .send(Command::Send(content.into()))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn next_notice(&mut self) -> Option<ClientNotice> {
        match self.notices.as_mut() {
            Some(notices) => notices.recv().await,
            None => None,
        }
    }

    /// Detaches the notice receiver so it can be consumed from a separate
    /// task.
    pub fn take_notices(&mut self) -> Option<mpsc::UnboundedReceiver<ClientNotice>> {
        self.notices.take()
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

enum Wake {
    Command(Option<Command>),
    Stream(Option<Result<StreamEvent, ClientError>>),
    Retry,
}

struct Runner {
    api: Arc<dyn WidgetApi>,
    storage: Arc<dyn WidgetStorage>,
    token: String,
    tuning: ClientTuning,
    cache: Arc<ConversationCache>,
    state_tx: watch::Sender<WidgetState>,
    conversation_tx: watch::Sender<Option<Uuid>>,
    notices: mpsc::UnboundedSender<ClientNotice>,
    commands: mpsc::Receiver<Command>,
    visitor_id: String,
    conversation_id: Option<Uuid>,
    stream: Option<EventStream>,
    retry_at: Option<Instant>,
    config_tx: watch::Sender<Option<WidgetConfig>>,
}

impl Runner {
    async fn run(mut self) {
        loop {
            match self.boot().await {
                Ok(()) => break,
                Err(state) => {
                    self.set_state(state);
                    if self.wait_reprobe().await {
                        return;
                    }
                }
            }
        }
        self.drive().await;
    }

    fn set_state(&self, state: WidgetState) {
        let _ = self.state_tx.send(state);
    }

    fn degraded_state(err: &ClientError) -> WidgetState {
        match err {
            ClientError::Transport(_) => WidgetState::Offline,
            ClientError::Remote { status, .. } if status.is_server_error() => {
                WidgetState::Offline
            }
            _ => WidgetState::Error,
        }
    }

    /// Probe, load config, and resume. Failures map to `Offline`/`Error`
    /// for the fixed-interval re-probe loop.
    async fn boot(&mut self) -> Result<(), WidgetState> {
        self.set_state(WidgetState::CheckingConnection);
        let config = self.api.fetch_config().await.map_err(|err| {
            tracing::warn!("widget config probe failed: {err}");
            Self::degraded_state(&err)
        })?;
        self.set_state(WidgetState::LoadingConfig);
        let _ = self.config_tx.send(Some(config));

        self.set_state(WidgetState::ResumingConversation);
        self.visitor_id = self.load_or_mint_visitor_id();

        // Stored conversation id first; a stale one is discarded.
        let stored_key = conversation_key(&self.token);
        if let Some(stored) = self.storage.get(&stored_key) {
            match stored.parse::<Uuid>() {
                Ok(id) => match self.api.conversation_exists(id).await {
                    Ok(true) => {
                        self.adopt(id).await;
                        return Ok(());
                    }
                    Ok(false) => {
                        tracing::info!(conversation = %id, "stored conversation is gone; discarding");
                        self.storage.remove(&stored_key);
                    }
                    Err(err) => {
                        tracing::warn!("conversation probe failed: {err}");
                        return Err(Self::degraded_state(&err));
                    }
                },
                Err(_) => self.storage.remove(&stored_key),
            }
        }

        // Fall back to the visitor's stable anonymous id.
        match self.api.visitor_conversation(&self.visitor_id).await {
            Ok(Some(id)) => {
                self.adopt(id).await;
            }
            Ok(None) => self.set_state(WidgetState::Idle),
            Err(err) => {
                tracing::warn!("visitor conversation lookup failed: {err}");
                return Err(Self::degraded_state(&err));
            }
        }
        Ok(())
    }

    fn load_or_mint_visitor_id(&self) -> String {
        let key = visitor_key(&self.token);
        if let Some(existing) = self.storage.get(&key) {
            if !existing.trim().is_empty() {
                return existing;
            }
        }
        let minted = Uuid::new_v4().to_string();
        self.storage.set(&key, &minted);
        minted
    }

    /// Makes a conversation the active one: persist its id, backfill the
    /// transcript, and establish the stream. This is the only place a
    /// subscription is opened, so an id becoming known opens it exactly
    /// once; later sends never touch it.
    async fn adopt(&mut self, id: Uuid) {
        self.conversation_id = Some(id);
        let _ = self.conversation_tx.send(Some(id));
        self.storage
            .set(&conversation_key(&self.token), &id.to_string());
        self.open_stream(id).await;
        self.backfill(id).await;
    }

    async fn open_stream(&mut self, id: Uuid) {
        // Tear down any previous subscription before opening the next one so
        // a stale stream can never deliver into the new view.
        self.stream = None;
        match self.api.open_stream(id).await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.retry_at = None;
                self.set_state(WidgetState::Connected);
            }
            Err(err) => {
                tracing::warn!("stream open failed: {err}");
                self.set_state(WidgetState::Error);
                self.arm_retry();
            }
        }
    }

    fn arm_retry(&mut self) {
        self.stream = None;
        if self.conversation_id.is_some() {
            self.retry_at = Some(Instant::now() + self.tuning.stream_retry_delay);
        }
    }

    async fn backfill(&mut self, id: Uuid) {
        match self.api.fetch_messages(id, None).await {
            Ok(messages) => {
                for message in messages {
                    if self.cache.ingest_canonical(id, message.clone()) {
                        let _ = self.notices.send(ClientNotice::MessageReceived(message));
                    }
                }
            }
            Err(err) => tracing::warn!("transcript backfill failed: {err}"),
        }
    }

    /// Re-probe wait while offline/errored. The deadline is fixed up front
    /// so user activity cannot postpone it. Returns true on shutdown.
    async fn wait_reprobe(&mut self) -> bool {
        let deadline = Instant::now() + self.tuning.reprobe_interval;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return false,
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return true,
                    Some(Command::Send(content)) => {
                        // No durable offline queue: surface the failure now.
                        let _ = self.notices.send(ClientNotice::SendFailed {
                            content,
                            reason: "widget is offline".into(),
                        });
                    }
                },
            }
        }
    }

    async fn drive(&mut self) {
        loop {
            let wake = {
                let commands = &mut self.commands;
                let stream = &mut self.stream;
                let retry_at = self.retry_at;
                tokio::select! {
                    command = commands.recv() => Wake::Command(command),
                    event = async {
                        match stream.as_mut() {
                            Some(stream) => stream.next().await,
                            None => std::future::pending().await,
                        }
                    } => Wake::Stream(event),
                    _ = async {
                        match retry_at {
                            Some(deadline) => sleep_until(deadline).await,
                            None => std::future::pending().await,
                        }
                    } => Wake::Retry,
                }
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Shutdown)) => {
                    // Explicit teardown of the subscription before exit.
                    self.stream = None;
                    return;
                }
                Wake::Command(Some(Command::Send(content))) => {
                    self.handle_send(content).await;
                }
                Wake::Stream(Some(Ok(event))) => self.handle_event(event),
                Wake::Stream(Some(Err(err))) => {
                    tracing::warn!("stream failed: {err}");
                    self.arm_retry();
                }
                Wake::Stream(None) => {
                    tracing::warn!("stream ended");
                    self.arm_retry();
                }
                Wake::Retry => {
                    self.retry_at = None;
                    if let Some(id) = self.conversation_id {
                        self.open_stream(id).await;
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Connected => self.set_state(WidgetState::Connected),
            StreamEvent::Ping => {}
            StreamEvent::Message { message } => {
                let Some(id) = self.conversation_id else {
                    return;
                };
                if message.conversation_id != id {
                    return;
                }
                if self.cache.ingest_canonical(id, message.clone()) {
                    let _ = self.notices.send(ClientNotice::MessageReceived(message));
                }
            }
        }
    }

    async fn handle_send(&mut self, content: String) {
        let correlation = new_correlation_id();
        if let Some(id) = self.conversation_id {
            let draft = self.provisional(id, &content, &correlation);
            self.cache.push_provisional(id, &correlation, draft);
        }

        let request = SendMessageRequest {
            conversation_id: self.conversation_id,
            visitor_id: self.visitor_id.clone(),
            content: content.clone(),
            correlation_id: Some(correlation.clone()),
        };
        match self.api.send_message(request).await {
            Ok(response) => {
                let id = response.conversation_id;
                let newly_created = self.conversation_id.is_none();
                self.cache.resolve_success(id, &correlation, response.message);
                if newly_created {
                    // First send implicitly created the conversation.
                    self.adopt(id).await;
                }
            }
            Err(err) => {
                if let Some(id) = self.conversation_id {
                    self.cache.resolve_failure(id, &correlation);
                }
                tracing::warn!("send failed: {err}");
                let _ = self.notices.send(ClientNotice::SendFailed {
                    content,
                    reason: err.to_string(),
                });
            }
        }
    }

    fn provisional(&self, conversation_id: Uuid, content: &str, correlation: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender: SenderRef::visitor(self.visitor_id.clone()),
            message_type: MessageType::Text,
            content: Some(content.to_string()),
            media: None,
            provider: None,
            external_id: None,
            status: MessageStatus::Pending,
            failure_reason: None,
            metadata: MessageMetadata {
                correlation_id: Some(correlation.to_string()),
                ..Default::default()
            },
            created_at: OffsetDateTime::now_utc(),
            read_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout};

    use crate::api::SendResponse;
    use crate::storage::MemoryStorage;

    const TOKEN: &str = "wdg_pub_token";

    fn fast_tuning() -> ClientTuning {
        ClientTuning {
            reprobe_interval: Duration::from_millis(30),
            stream_retry_delay: Duration::from_millis(30),
        }
    }

    fn canonical(conversation_id: Uuid, content: &str, correlation: Option<&str>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender: SenderRef::agent("agent-1"),
            message_type: MessageType::Text,
            content: Some(content.to_string()),
            media: None,
            provider: None,
            external_id: None,
            status: MessageStatus::Sent,
            failure_reason: None,
            metadata: MessageMetadata {
                correlation_id: correlation.map(str::to_owned),
                ..Default::default()
            },
            created_at: OffsetDateTime::now_utc(),
            read_at: None,
        }
    }

    #[derive(Default)]
    struct MockApi {
        probe_down: AtomicBool,
        fail_sends: AtomicBool,
        known: Mutex<HashSet<Uuid>>,
        by_visitor: Mutex<HashMap<String, Uuid>>,
        transcript: Mutex<HashMap<Uuid, Vec<Message>>>,
        stream_opens: AtomicUsize,
        streams: Mutex<Vec<mpsc::UnboundedSender<Result<StreamEvent, ClientError>>>>,
    }

    impl MockApi {
        fn seed_conversation(&self, visitor_id: &str, content: &str) -> Uuid {
            let id = Uuid::new_v4();
            self.known.lock().unwrap().insert(id);
            self.by_visitor
                .lock()
                .unwrap()
                .insert(visitor_id.to_string(), id);
            self.transcript
                .lock()
                .unwrap()
                .insert(id, vec![canonical(id, content, None)]);
            id
        }

        fn push_event(&self, event: StreamEvent) {
            let streams = self.streams.lock().unwrap();
            let sender = streams.last().expect("a stream is open");
            sender.send(Ok(event)).expect("stream subscriber alive");
        }

        fn break_stream(&self) {
            let mut streams = self.streams.lock().unwrap();
            streams.pop();
        }

        fn opens(&self) -> usize {
            self.stream_opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WidgetApi for MockApi {
        async fn fetch_config(&self) -> Result<WidgetConfig, ClientError> {
            if self.probe_down.swap(false, Ordering::SeqCst) {
                return Err(ClientError::Remote {
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                    message: "down".into(),
                });
            }
            Ok(WidgetConfig {
                inbox_name: "Soporte".into(),
                welcome_title: "Hola".into(),
                welcome_tagline: "Te leemos".into(),
            })
        }

        async fn conversation_exists(&self, conversation_id: Uuid) -> Result<bool, ClientError> {
            Ok(self.known.lock().unwrap().contains(&conversation_id))
        }

        async fn visitor_conversation(
            &self,
            visitor_id: &str,
        ) -> Result<Option<Uuid>, ClientError> {
            Ok(self.by_visitor.lock().unwrap().get(visitor_id).copied())
        }

        async fn fetch_messages(
            &self,
            conversation_id: Uuid,
            _last_message_id: Option<Uuid>,
        ) -> Result<Vec<Message>, ClientError> {
            Ok(self
                .transcript
                .lock()
                .unwrap()
                .get(&conversation_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn send_message(
            &self,
            request: SendMessageRequest,
        ) -> Result<SendResponse, ClientError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ClientError::Remote {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    message: "boom".into(),
                });
            }
            let conversation_id = request.conversation_id.unwrap_or_else(Uuid::new_v4);
            self.known.lock().unwrap().insert(conversation_id);
            self.by_visitor
                .lock()
                .unwrap()
                .insert(request.visitor_id.clone(), conversation_id);

            let mut message = canonical(
                conversation_id,
                &request.content,
                request.correlation_id.as_deref(),
            );
            message.sender = SenderRef::visitor(request.visitor_id.clone());
            self.transcript
                .lock()
                .unwrap()
                .entry(conversation_id)
                .or_default()
                .push(message.clone());

            Ok(SendResponse {
                success: true,
                message,
                conversation_id,
                ai_response: None,
            })
        }

        async fn open_stream(&self, _conversation_id: Uuid) -> Result<EventStream, ClientError> {
            self.stream_opens.fetch_add(1, Ordering::SeqCst);
            let (tx, mut rx) = mpsc::unbounded_channel();
            self.streams.lock().unwrap().push(tx);
            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(stream.boxed())
        }
    }

    async fn wait_for_state(handle: &mut WidgetHandle, want: WidgetState) {
        timeout(Duration::from_secs(2), async {
            while handle.state() != want {
                handle.state_changed().await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("state {want:?} never reached, at {:?}", handle.state()));
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    #[tokio::test]
    async fn stale_stored_id_falls_back_to_visitor_lookup() {
        let api = Arc::new(MockApi::default());
        let storage = Arc::new(MemoryStorage::new());
        storage.set(&visitor_key(TOKEN), "visitor-42");
        let live = api.seed_conversation("visitor-42", "bienvenido");
        // A conversation id the server no longer recognizes.
        storage.set(&conversation_key(TOKEN), &Uuid::new_v4().to_string());

        let mut handle = WidgetHandle::spawn_with(
            api.clone(),
            storage.clone(),
            TOKEN,
            fast_tuning(),
        );
        wait_for_state(&mut handle, WidgetState::Connected).await;

        assert_eq!(handle.conversation_id(), Some(live));
        assert_eq!(
            storage.get(&conversation_key(TOKEN)).as_deref(),
            Some(live.to_string().as_str())
        );
        assert_eq!(handle.transcript().len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn no_prior_conversation_lands_in_idle() {
        let api = Arc::new(MockApi::default());
        let storage = Arc::new(MemoryStorage::new());
        let mut handle =
            WidgetHandle::spawn_with(api.clone(), storage, TOKEN, fast_tuning());
        wait_for_state(&mut handle, WidgetState::Idle).await;
        assert!(handle.conversation_id().is_none());
        assert_eq!(api.opens(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn offline_probe_recovers_on_the_reprobe_interval() {
        let api = Arc::new(MockApi::default());
        api.probe_down.store(true, Ordering::SeqCst);
        let storage = Arc::new(MemoryStorage::new());

        let mut handle =
            WidgetHandle::spawn_with(api.clone(), storage, TOKEN, fast_tuning());
        wait_for_state(&mut handle, WidgetState::Offline).await;
        // The flag auto-clears on the first probe, so the fixed-interval
        // re-probe brings the client up without any user action.
        wait_for_state(&mut handle, WidgetState::Idle).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn first_send_adopts_conversation_and_opens_stream_exactly_once() {
        let api = Arc::new(MockApi::default());
        let storage = Arc::new(MemoryStorage::new());
        let mut handle = WidgetHandle::spawn_with(
            api.clone(),
            storage.clone(),
            TOKEN,
            fast_tuning(),
        );
        wait_for_state(&mut handle, WidgetState::Idle).await;

        handle.send("hola").await.unwrap();
        wait_for_state(&mut handle, WidgetState::Connected).await;
        let conversation = handle.conversation_id().expect("conversation adopted");
        assert_eq!(
            storage.get(&conversation_key(TOKEN)).as_deref(),
            Some(conversation.to_string().as_str())
        );
        assert_eq!(api.opens(), 1);

        handle.send("sigo aquí").await.unwrap();
        wait_until(|| handle.transcript().len() == 2).await;
        // A later send never reconnects the stream.
        assert_eq!(api.opens(), 1);

        let transcript = handle.transcript();
        assert!(transcript.iter().all(|entry| !entry.provisional));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stream_messages_are_deduplicated_by_id() {
        let api = Arc::new(MockApi::default());
        let storage = Arc::new(MemoryStorage::new());
        storage.set(&visitor_key(TOKEN), "visitor-42");
        let conversation = api.seed_conversation("visitor-42", "hola");

        let mut handle =
            WidgetHandle::spawn_with(api.clone(), storage, TOKEN, fast_tuning());
        wait_for_state(&mut handle, WidgetState::Connected).await;
        wait_until(|| handle.transcript().len() == 1).await;

        let inbound = canonical(conversation, "respuesta", None);
        api.push_event(StreamEvent::Message {
            message: inbound.clone(),
        });
        api.push_event(StreamEvent::Ping);
        api.push_event(StreamEvent::Message { message: inbound });

        wait_until(|| handle.transcript().len() == 2).await;
        sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.transcript().len(), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn broken_stream_reconnects_after_fixed_delay() {
        let api = Arc::new(MockApi::default());
        let storage = Arc::new(MemoryStorage::new());
        storage.set(&visitor_key(TOKEN), "visitor-42");
        api.seed_conversation("visitor-42", "hola");

        let mut handle =
            WidgetHandle::spawn_with(api.clone(), storage, TOKEN, fast_tuning());
        wait_for_state(&mut handle, WidgetState::Connected).await;
        assert_eq!(api.opens(), 1);

        api.break_stream();
        wait_until(|| api.opens() == 2).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn failed_send_rolls_back_and_surfaces_the_failure() {
        let api = Arc::new(MockApi::default());
        let storage = Arc::new(MemoryStorage::new());
        storage.set(&visitor_key(TOKEN), "visitor-42");
        api.seed_conversation("visitor-42", "hola");

        let mut handle =
            WidgetHandle::spawn_with(api.clone(), storage, TOKEN, fast_tuning());
        wait_for_state(&mut handle, WidgetState::Connected).await;
        wait_until(|| handle.transcript().len() == 1).await;

        api.fail_sends.store(true, Ordering::SeqCst);
        handle.send("condenado").await.unwrap();

        let notice = timeout(Duration::from_secs(2), async {
            loop {
                match handle.next_notice().await {
                    Some(ClientNotice::SendFailed { content, .. }) => return content,
                    Some(_) => continue,
                    None => panic!("notice channel closed"),
                }
            }
        })
        .await
        .expect("failure surfaced");
        assert_eq!(notice, "condenado");

        // Rolled back to the pre-send state.
        assert_eq!(handle.transcript().len(), 1);
        handle.shutdown().await;
    }
}

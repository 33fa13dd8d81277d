//! Per-session state and the registry that owns it.
//!
//! A session is created the first time a client attaches with its id and
//! lives for the rest of the process. Each session owns its message
//! history, mixer mirror, observer, and a swappable event sink: the sink
//! points at the currently attached client channel and is cleared on
//! detach, so observer commits during a disconnect are simply dropped
//! while history keeps accumulating for the next attach.
//!
//! All sessions share the bridge, the transport underneath it, and the
//! provider.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use liveset::{Indexer, LiveBridge, MixerMirror, ParameterObserver};
use mixchat::{
    mixer_summary, run_turn, AgentChannel, AgentEvent, ApprovalRequest, ChatContent,
    ChatMessage, ChatProvider, MixerToolbox, TurnOptions,
};

use crate::events::ClientEvent;

pub struct SessionManager {
    sessions: tokio::sync::RwLock<HashMap<String, Arc<Session>>>,
    bridge: Arc<LiveBridge>,
    provider: Arc<dyn ChatProvider>,
    observer_config: liveset::ObserverConfig,
    system_prompt: String,
    turn_options: TurnOptions,
}

impl SessionManager {
    pub fn new(
        bridge: Arc<LiveBridge>,
        provider: Arc<dyn ChatProvider>,
        observer_config: liveset::ObserverConfig,
        system_prompt: String,
    ) -> Self {
        Self {
            sessions: tokio::sync::RwLock::new(HashMap::new()),
            bridge,
            provider,
            observer_config,
            system_prompt,
            turn_options: TurnOptions::default(),
        }
    }

    pub async fn get_or_create(&self, session_id: &str, project: &str) -> Arc<Session> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(session_id) {
                return session.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        // A racing attach may have created it between the locks.
        if let Some(session) = sessions.get(session_id) {
            return session.clone();
        }
        info!(session_id, project, "creating session");
        let session = Session::new(
            session_id.to_string(),
            project.to_string(),
            self.bridge.clone(),
            self.provider.clone(),
            self.observer_config.clone(),
            self.system_prompt.clone(),
            self.turn_options.clone(),
        );
        sessions.insert(session_id.to_string(), session.clone());
        session
    }

    /// Best-effort teardown of every session (process shutdown).
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            session.shutdown().await;
        }
    }
}

struct PendingApproval {
    ids: HashSet<String>,
    tx: oneshot::Sender<HashMap<String, bool>>,
}

pub struct Session {
    pub id: String,
    pub project: String,
    pub mirror: Arc<MixerMirror>,
    pub observer: Arc<ParameterObserver>,
    bridge: Arc<LiveBridge>,
    toolbox: MixerToolbox,
    provider: Arc<dyn ChatProvider>,
    system_prompt: String,
    turn_options: TurnOptions,
    history: tokio::sync::Mutex<Vec<ChatMessage>>,
    sink: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    pending_approval: Mutex<Option<PendingApproval>>,
    turn: Mutex<Option<JoinHandle<()>>>,
    indexing: AtomicBool,
}

impl Session {
    fn new(
        id: String,
        project: String,
        bridge: Arc<LiveBridge>,
        provider: Arc<dyn ChatProvider>,
        observer_config: liveset::ObserverConfig,
        system_prompt: String,
        turn_options: TurnOptions,
    ) -> Arc<Self> {
        let mirror = Arc::new(MixerMirror::new());
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let observer = Arc::new(ParameterObserver::new(
            bridge.clone(),
            observer_config,
            changes_tx,
        ));

        let session = Arc::new(Self {
            id,
            project,
            toolbox: MixerToolbox::new(bridge.clone(), mirror.clone()),
            mirror,
            observer,
            bridge,
            provider,
            system_prompt,
            turn_options,
            history: tokio::sync::Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            pending_approval: Mutex::new(None),
            turn: Mutex::new(None),
            indexing: AtomicBool::new(false),
        });

        // Forward observer commits to whichever client channel is
        // attached. Weak so the forwarder does not keep the session alive.
        let weak = Arc::downgrade(&session);
        tokio::spawn(async move {
            let mut changes_rx = changes_rx;
            while let Some(change) = changes_rx.recv().await {
                let Some(session) = weak.upgrade() else { break };
                session.send_event(ClientEvent::from(change));
            }
        });

        session
    }

    /// Point the event stream at a newly attached client channel.
    pub fn attach(&self, sink: mpsc::UnboundedSender<ClientEvent>) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    /// Client channel closed: stop the running turn, drop the sink.
    /// Subscriptions and history stay; they are useful on reconnect.
    pub fn detach(&self) {
        self.cancel_turn();
        *self.sink.lock().unwrap() = None;
        debug!(session_id = %self.id, "detached");
    }

    pub fn send_event(&self, event: ClientEvent) {
        let mut sink = self.sink.lock().unwrap();
        if let Some(tx) = sink.as_ref() {
            if tx.send(event).is_err() {
                *sink = None;
            }
        }
    }

    /// Index (or reindex) the mixer, streaming `indexing_status` frames.
    /// On failure the previous snapshot stays authoritative and the client
    /// gets an `index_error`.
    pub async fn run_indexing(self: &Arc<Self>) {
        if self.indexing.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.id, "indexing already in progress");
            return;
        }

        let indexer = Indexer::new(
            self.bridge.clone(),
            self.mirror.clone(),
            self.observer.clone(),
        );
        let session = self.clone();
        let result = indexer
            .run(&move |frame| session.send_event(ClientEvent::from(frame)))
            .await;

        match result {
            Ok(snapshot) => {
                self.send_event(ClientEvent::Tracks {
                    content: mixer_summary(&snapshot),
                });
            }
            Err(e) => {
                error!(session_id = %self.id, error = %e, "indexing failed");
                self.send_event(ClientEvent::IndexError {
                    content: e.to_string(),
                });
            }
        }
        self.indexing.store(false, Ordering::SeqCst);
    }

    /// Start the agent loop for one user message. Rejected with an `error`
    /// event if a turn is already running.
    pub fn spawn_turn(self: &Arc<Self>, message: ChatContent) {
        let mut turn = self.turn.lock().unwrap();
        if turn.as_ref().is_some_and(|t| !t.is_finished()) {
            warn!(session_id = %self.id, "turn rejected: one is already running");
            self.send_event(ClientEvent::Error {
                content: "a response is already in progress".to_string(),
            });
            return;
        }

        let session = self.clone();
        *turn = Some(tokio::spawn(async move {
            let channel = SessionChannel {
                session: session.clone(),
            };
            let provider = session.provider.clone();
            let mut history = session.history.lock().await;
            if let Err(e) = run_turn(
                provider.as_ref(),
                &session.toolbox,
                &channel,
                &session.system_prompt,
                &mut history,
                message,
                &session.turn_options,
            )
            .await
            {
                // The loop already emitted an error event.
                error!(session_id = %session.id, error = %e, "agent turn failed");
            }
        }));
    }

    /// Abort the in-flight turn, if any. Dropping the pending approval
    /// sender resolves any waiting approval as denied.
    pub fn cancel_turn(&self) {
        if let Some(handle) = self.turn.lock().unwrap().take() {
            handle.abort();
        }
        self.pending_approval.lock().unwrap().take();
    }

    /// Route the client's approval decisions to the waiting turn. Returns
    /// false when no pending request matches (the payload is then
    /// ignored).
    pub fn resolve_approvals(&self, decisions: HashMap<String, bool>) -> bool {
        let mut pending = self.pending_approval.lock().unwrap();
        let matches = pending
            .as_ref()
            .is_some_and(|p| decisions.keys().any(|id| p.ids.contains(id)));
        if !matches {
            return false;
        }
        let Some(p) = pending.take() else { return false };
        let _ = p.tx.send(decisions);
        true
    }

    /// The observer's recent history as the JSON the agent consumes.
    pub fn recent_changes_json(&self) -> String {
        serde_json::to_string(&self.observer.recent_changes())
            .unwrap_or_else(|_| "[]".to_string())
    }

    pub async fn shutdown(&self) {
        self.cancel_turn();
        self.detach();
        self.observer.unsubscribe_all().await;
        self.observer.shutdown();
    }
}

/// The agent loop's view of a session: events out, approvals in.
struct SessionChannel {
    session: Arc<Session>,
}

#[async_trait]
impl AgentChannel for SessionChannel {
    fn emit(&self, event: AgentEvent) {
        self.session.send_event(ClientEvent::from(event));
    }

    async fn request_approval(
        &self,
        requests: Vec<ApprovalRequest>,
    ) -> HashMap<String, bool> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.session.pending_approval.lock().unwrap();
            *pending = Some(PendingApproval {
                ids: requests.iter().map(|r| r.tool_call_id.clone()).collect(),
                tx,
            });
        }
        self.session
            .send_event(ClientEvent::ApprovalRequired { content: requests });

        match rx.await {
            Ok(decisions) => decisions,
            // Sender dropped: channel closed or turn cancelled. Deny.
            Err(_) => HashMap::new(),
        }
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    domain::AccountId,
    errors::Error,
    events::{CookieChanged, Envelope, EventData, MessengerDisconnected},
    ports::{EventSink, ListenerTransport},
    subscriber::EventHandler,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Listening,
    AwaitingCredentialRefresh,
}

/// What a `cookie.changed` event did to the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CookieOutcome {
    /// Addressed to another account.
    Ignored,
    /// Credential kept for the next connect; no state change.
    Stored,
    Reconnected,
    /// The reconnect failed; the session waits for the next credential.
    ReconnectFailed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub disconnect_notified: bool,
    pub has_credential: bool,
    /// Successful entries into `Listening`.
    pub sessions_established: u64,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    disconnect_notified: bool,
    started: bool,
    credential: Option<String>,
    sessions_established: u64,
}

/// One long-lived inbound transport connection for a chat account.
///
/// Publishes `messenger.disconnected` once per drop and reconnects when a
/// fresh credential arrives with `force_reconnect`.
pub struct ListenerSession {
    account: AccountId,
    transport: Arc<dyn ListenerTransport>,
    events: Arc<dyn EventSink>,
    inner: Mutex<SessionInner>,
}

impl ListenerSession {
    pub fn new(
        account: AccountId,
        transport: Arc<dyn ListenerTransport>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            account,
            transport,
            events,
            inner: Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                disconnect_notified: false,
                started: false,
                credential: None,
                sessions_established: 0,
            }),
        }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            state: inner.state,
            disconnect_notified: inner.disconnect_notified,
            has_credential: inner.credential.is_some(),
            sessions_established: inner.sessions_established,
        }
    }

    /// Initial connect. Only valid once, from the initial state.
    pub async fn start(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.started || inner.state != SessionState::Disconnected {
                return Err(Error::Session(format!(
                    "session for {} already started (state {:?})",
                    self.account, inner.state
                )));
            }
            inner.started = true;
            inner.state = SessionState::Connecting;
        }

        self.connect().await
    }

    /// The transport reported that the inbound connection dropped.
    ///
    /// Returns whether a `messenger.disconnected` event was published; repeated
    /// signals for the same drop publish once.
    pub async fn on_transport_drop(&self, reason: Option<&str>) -> Result<bool> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Listening | SessionState::Disconnected => {}
                SessionState::Connecting | SessionState::AwaitingCredentialRefresh => {
                    debug!(account = %self.account, state = ?inner.state, "drop signal during reconnect ignored");
                    return Ok(false);
                }
            }
            if inner.state == SessionState::Listening {
                info!(account = %self.account, reason = reason.unwrap_or("-"), "listener disconnected");
            }
            inner.state = SessionState::Disconnected;
            if inner.disconnect_notified {
                debug!(account = %self.account, "disconnect already notified");
                return Ok(false);
            }
            inner.disconnect_notified = true;
        }

        let data = MessengerDisconnected {
            account_id: self.account.to_string(),
            reason: reason.map(str::to_string),
        };
        match self.events.emit(data.into(), None).await {
            Ok(event_id) => {
                info!(account = %self.account, event_id = %event_id, "published messenger.disconnected");
                Ok(true)
            }
            Err(e) => {
                // Let a later signal retry the notification.
                self.inner.lock().await.disconnect_notified = false;
                warn!(account = %self.account, error = %e, "failed to publish messenger.disconnected");
                Err(e)
            }
        }
    }

    /// React to a rotated credential.
    pub async fn on_cookie_changed(&self, event: &CookieChanged) -> CookieOutcome {
        if event.account_id != self.account.as_str() {
            debug!(account = %self.account, other = %event.account_id, "cookie for another account ignored");
            return CookieOutcome::Ignored;
        }

        {
            let mut inner = self.inner.lock().await;
            inner.credential = Some(event.new_cookie.clone());
            if inner.state != SessionState::Disconnected || !event.force_reconnect {
                debug!(
                    account = %self.account,
                    state = ?inner.state,
                    force_reconnect = event.force_reconnect,
                    "credential stored"
                );
                return CookieOutcome::Stored;
            }
            inner.state = SessionState::AwaitingCredentialRefresh;
        }

        if let Err(e) = self
            .transport
            .apply_credential(&self.account, &event.new_cookie)
            .await
        {
            self.inner.lock().await.state = SessionState::Disconnected;
            warn!(account = %self.account, error = %e, "applying credential failed");
            return CookieOutcome::ReconnectFailed(e.to_string());
        }

        self.inner.lock().await.state = SessionState::Connecting;
        match self.connect().await {
            Ok(()) => CookieOutcome::Reconnected,
            Err(e) => CookieOutcome::ReconnectFailed(e.to_string()),
        }
    }

    // Caller has moved the state to `Connecting`.
    async fn connect(&self) -> Result<()> {
        let result = self.transport.connect(&self.account).await;
        let mut inner = self.inner.lock().await;
        match result {
            Ok(()) => {
                inner.state = SessionState::Listening;
                inner.disconnect_notified = false;
                inner.sessions_established += 1;
                info!(
                    account = %self.account,
                    sessions = inner.sessions_established,
                    "listener connected"
                );
                Ok(())
            }
            Err(e) => {
                inner.state = SessionState::Disconnected;
                warn!(account = %self.account, error = %e, "listener connect failed; waiting for a new credential");
                Err(e)
            }
        }
    }
}

/// Drives a [`ListenerSession`] from a `cookie.changed` subscription.
pub struct CookieChangeHandler {
    session: Arc<ListenerSession>,
}

impl CookieChangeHandler {
    pub fn new(session: Arc<ListenerSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl EventHandler for CookieChangeHandler {
    async fn handle(&self, envelope: Envelope) -> Result<()> {
        match envelope.data() {
            EventData::CookieChanged(cookie) => {
                let outcome = self.session.on_cookie_changed(cookie).await;
                debug!(event_id = %envelope.event_id(), outcome = ?outcome, "cookie.changed handled");
                Ok(())
            }
            EventData::MessageReceived(_)
            | EventData::MessageSend(_)
            | EventData::MatchEnded(_)
            | EventData::MessengerDisconnected(_) => {
                debug!(event_type = %envelope.event_type(), "not a session event");
                Ok(())
            }
        }
    }
}

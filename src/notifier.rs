//! Notifier server: connection lifecycle and the notification stream.
//!
//! [`NotifierServer`] owns exactly one outward hub connection and re-exposes
//! everything that arrives on it as a single ordered, blockable stream.
//! Three independent termination triggers — remote hangup, a signal-driven
//! stop, and a signal-driven graceful shutdown — funnel into one consistent
//! externally observable sequence:
//!
//! - a **non-forced** [`NotifierServer::stop`] lets the consumer drain any
//!   buffered items and then observe a clean end of stream;
//! - a **forced** stop or a [`NotifierServer::shutdown`] pushes a terminate
//!   sentinel through the same buffer, unblocking a parked consumer and
//!   exiting the process.
//!
//! The buffer and its wait primitive are the only shared state between the
//! producer (the connection's event callbacks) and the consumer (the output
//! driver pulling items); ordering is strict FIFO with no deduplication.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tokio::sync::Notify;

use crate::application::HubApplication;
use crate::config::{self, CertError, HubError};
use crate::constants::DEFAULT_PROFILE;
use crate::protocol::Message;
use crate::transport::{
    Acceptor, ConnectionManager, EventsHandle, TcpConnectionManager, TransportError,
};

/// Errors raised by [`NotifierServer::start`].
///
/// Connection-level problems after a successful start never surface here;
/// they become ordinary stream items.
#[derive(Debug)]
pub enum NotifierError {
    /// `start()` was called while already connecting or connected.
    AlreadyRunning,
    /// The hub specification was malformed or unresolvable.
    Hub(HubError),
    /// The certificate profile could not be loaded.
    Cert(CertError),
    /// The connection could not be established.
    Transport(TransportError),
}

impl fmt::Display for NotifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "notifier server is already running"),
            Self::Hub(e) => write!(f, "{e}"),
            Self::Cert(e) => write!(f, "{e}"),
            Self::Transport(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for NotifierError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AlreadyRunning => None,
            Self::Hub(e) => Some(e),
            Self::Cert(e) => Some(e),
            Self::Transport(e) => Some(e),
        }
    }
}

impl From<HubError> for NotifierError {
    fn from(e: HubError) -> Self {
        Self::Hub(e)
    }
}

impl From<CertError> for NotifierError {
    fn from(e: CertError) -> Self {
        Self::Cert(e)
    }
}

impl From<TransportError> for NotifierError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Externally observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; the initial and terminal state.
    Disconnected,
    /// `start()` has been issued; the acceptor has not fired yet.
    Connecting,
    /// A live application is bound to the connection.
    Connected,
}

/// Internal state, carrying the live application in `Connected`.
enum State {
    Disconnected,
    Connecting,
    Connected(Arc<HubApplication>),
}

impl State {
    fn kind(&self) -> ConnectionState {
        match self {
            State::Disconnected => ConnectionState::Disconnected,
            State::Connecting => ConnectionState::Connecting,
            State::Connected(_) => ConnectionState::Connected,
        }
    }
}

/// Buffer slot: a genuine item or the forced-termination sentinel.
enum Envelope {
    Item(Message),
    Terminate,
}

/// Hook invoked when the terminate sentinel is consumed. Expected not to
/// return in production; injectable so tests can observe it.
type ExitHook = Box<dyn Fn() + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Subscribes to a notification hub and exposes the notifications as one
/// ordered stream.
///
/// One server per process per hub target. Construction performs no I/O;
/// the connection is opened by [`start`](Self::start), or lazily by
/// [`iter`](Self::iter) on first consumption.
pub struct NotifierServer {
    hub_spec: String,
    cert_conf: Option<String>,
    secure: bool,
    app_name: String,
    app_id: String,
    manager: Arc<dyn ConnectionManager>,
    state: Mutex<State>,
    queue: Mutex<VecDeque<Envelope>>,
    notify_event: Notify,
    exit_hook: ExitHook,
    // Back-reference to the owning Arc, for the acceptor callback and the
    // stream handle. Always upgradable while a method runs.
    weak_self: Weak<NotifierServer>,
}

impl fmt::Debug for NotifierServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierServer")
            .field("hub_spec", &self.hub_spec)
            .field("app_name", &self.app_name)
            .field("app_id", &self.app_id)
            .field("state", &self.state_kind())
            .finish_non_exhaustive()
    }
}

impl NotifierServer {
    /// Create a server for `hub_spec` using the tokio TCP connection
    /// manager.
    ///
    /// `app_name` defaults to the program name and `app_id` to a fresh
    /// UUID. With `secure` set, `cert_conf` (or the default certificate
    /// configuration path) is loaded during `start()`.
    pub fn new(
        hub_spec: impl Into<String>,
        cert_conf: Option<String>,
        secure: bool,
        app_name: Option<String>,
        app_id: Option<String>,
    ) -> Arc<Self> {
        Self::with_manager(
            hub_spec,
            cert_conf,
            secure,
            app_name,
            app_id,
            Arc::new(TcpConnectionManager::new()),
            Box::new(|| std::process::exit(1)),
        )
    }

    /// Create a server with an explicit connection manager and exit hook.
    pub fn with_manager(
        hub_spec: impl Into<String>,
        cert_conf: Option<String>,
        secure: bool,
        app_name: Option<String>,
        app_id: Option<String>,
        manager: Arc<dyn ConnectionManager>,
        exit_hook: ExitHook,
    ) -> Arc<Self> {
        let app_name = app_name.unwrap_or_else(program_name);
        let app_id = app_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let hub_spec = hub_spec.into();
        Arc::new_cyclic(|weak| Self {
            hub_spec,
            cert_conf,
            secure,
            app_name,
            app_id,
            manager,
            state: Mutex::new(State::Disconnected),
            queue: Mutex::new(VecDeque::new()),
            notify_event: Notify::new(),
            exit_hook,
            weak_self: Weak::clone(weak),
        })
    }

    /// The owning `Arc` for this server.
    fn strong_self(&self) -> Arc<NotifierServer> {
        self.weak_self
            .upgrade()
            .expect("NotifierServer is always Arc-owned")
    }

    /// Name this server presents to the hub when subscribing.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Id this server presents to the hub when subscribing.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Current connection state.
    pub fn state_kind(&self) -> ConnectionState {
        lock(&self.state).kind()
    }

    /// Open the hub connection.
    ///
    /// Resolves the hub specification, loads the certificate profile when
    /// security is enabled, and issues the connect. The acceptor callback
    /// binds a [`HubApplication`] to this server and transitions the state
    /// to `Connected`.
    ///
    /// # Errors
    ///
    /// [`NotifierError::AlreadyRunning`] when not `Disconnected` (with no
    /// further side effects); hub, certificate, and connect failures
    /// propagate with the state rolled back to `Disconnected`.
    pub async fn start(&self) -> Result<(), NotifierError> {
        {
            let mut state = lock(&self.state);
            if !matches!(*state, State::Disconnected) {
                return Err(NotifierError::AlreadyRunning);
            }
            *state = State::Connecting;
        }

        let result = self.start_inner().await;
        if result.is_err() {
            *lock(&self.state) = State::Disconnected;
        }
        result
    }

    async fn start_inner(&self) -> Result<(), NotifierError> {
        let endpoint = config::resolve_hub(&self.hub_spec).await?;
        let tls = config::cert_wrapper(self.cert_conf.as_deref(), DEFAULT_PROFILE, self.secure)?;

        self.manager.start()?;

        let server = self.strong_self();
        let acceptor: Acceptor = Box::new(move |conn| {
            let app = Arc::new(HubApplication::new(
                Arc::clone(&conn),
                Arc::clone(&server),
                server.app_name.clone(),
                server.app_id.clone(),
            ));
            let mut state = lock(&server.state);
            if matches!(*state, State::Connecting) {
                *state = State::Connected(Arc::clone(&app));
                log::info!("connected to hub {}", server.hub_spec);
            } else {
                // A stop or shutdown landed while the connect was in
                // flight; it is terminal, so the fresh connection must
                // not resurrect the server.
                log::debug!("connection accepted after stop; closing it");
                tokio::spawn(async move { conn.close().await });
            }
            drop(state);
            app as EventsHandle
        });

        self.manager.connect(&endpoint, acceptor, tls).await?;
        Ok(())
    }

    /// Append a message to the notification buffer and wake a parked
    /// consumer. Callable at any time, including after disconnect.
    pub fn notify(&self, message: Message) {
        lock(&self.queue).push_back(Envelope::Item(message));
        self.notify_event.notify_one();
    }

    /// Stop the server.
    ///
    /// Idempotent when already `Disconnected`. Otherwise: disconnects the
    /// live application (if any), stops the connection manager abruptly,
    /// and wakes a parked consumer. When `forced` — a signal-driven stop —
    /// exactly one terminate sentinel is also pushed, so the consumer exits
    /// instead of draining to a clean end of stream. Buffered items are
    /// never discarded.
    pub async fn stop(&self, forced: bool) {
        let previous = {
            let mut state = lock(&self.state);
            if matches!(*state, State::Disconnected) {
                return;
            }
            std::mem::replace(&mut *state, State::Disconnected)
        };

        if let State::Connected(app) = previous {
            app.disconnect().await;
        }
        self.manager.stop().await;

        if forced {
            lock(&self.queue).push_back(Envelope::Terminate);
        }
        self.notify_event.notify_one();
        log::info!("notifier server stopped (forced: {forced})");
    }

    /// Shut the server down gracefully.
    ///
    /// Idempotent when already `Disconnected`. Otherwise asks the manager
    /// for an orderly drain instead of an abrupt stop, and — unlike
    /// [`stop`](Self::stop) — always pushes the terminate sentinel: a
    /// shutdown winds down cleanly but still exits.
    pub async fn shutdown(&self) {
        {
            let mut state = lock(&self.state);
            if matches!(*state, State::Disconnected) {
                return;
            }
            *state = State::Disconnected;
        }

        self.manager.shutdown().await;

        lock(&self.queue).push_back(Envelope::Terminate);
        self.notify_event.notify_one();
        log::info!("notifier server shut down");
    }

    /// Pull the next notification, suspending while the buffer is empty
    /// and the connection is alive.
    ///
    /// Returns `None` at the clean end of the stream: buffer drained while
    /// `Disconnected`. Consuming the terminate sentinel invokes the
    /// process-exit hook instead.
    pub async fn next_notification(&self) -> Option<Message> {
        loop {
            if let Some(envelope) = lock(&self.queue).pop_front() {
                match envelope {
                    Envelope::Item(message) => return Some(message),
                    Envelope::Terminate => {
                        log::debug!("terminate sentinel consumed");
                        (self.exit_hook)();
                        return None;
                    }
                }
            }

            // Arm the waiter before the state check so a wakeup between
            // the check and the await is not lost.
            let notified = self.notify_event.notified();
            if self.state_kind() == ConnectionState::Disconnected {
                if lock(&self.queue).is_empty() {
                    return None;
                }
                continue;
            }
            notified.await;
        }
    }

    /// Obtain the consuming stream handle, implicitly starting the server
    /// when it is currently `Disconnected`.
    ///
    /// # Errors
    ///
    /// Propagates [`start`](Self::start) failures from the implicit start.
    pub async fn iter(&self) -> Result<NotificationStream, NotifierError> {
        if self.state_kind() == ConnectionState::Disconnected {
            self.start().await?;
        }
        Ok(NotificationStream {
            server: self.strong_self(),
        })
    }
}

/// Program name from `argv[0]`, falling back to the crate name.
fn program_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .map(std::path::Path::new)
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}

/// Consuming handle over a [`NotifierServer`]'s notification stream.
#[derive(Debug)]
pub struct NotificationStream {
    server: Arc<NotifierServer>,
}

impl NotificationStream {
    /// Next notification, or `None` at the clean end of the stream.
    pub async fn next(&mut self) -> Option<Message> {
        self.server.next_notification().await
    }

    /// The server this stream consumes.
    pub fn server(&self) -> &Arc<NotifierServer> {
        &self.server
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Notification;
    use crate::transport::testing::RecordingManager;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_server(manager: Arc<RecordingManager>) -> (Arc<NotifierServer>, Arc<AtomicUsize>) {
        let exits = Arc::new(AtomicUsize::new(0));
        let hook_exits = Arc::clone(&exits);
        let server = NotifierServer::with_manager(
            "127.0.0.1:4859",
            None,
            false,
            Some("test-app".to_string()),
            Some("test-id".to_string()),
            manager,
            Box::new(move || {
                hook_exits.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (server, exits)
    }

    fn message(summary: &str) -> Message {
        Message::Notify(Notification {
            id: "n".to_string(),
            app_name: "test-app".to_string(),
            summary: summary.to_string(),
            body: String::new(),
            category: None,
            urgency: None,
        })
    }

    #[test]
    fn test_new_server_is_disconnected() {
        let manager = RecordingManager::new();
        let (server, _) = test_server(manager);
        assert_eq!(server.state_kind(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_start_connects_once() {
        let manager = RecordingManager::new();
        let (server, _) = test_server(Arc::clone(&manager));

        server.start().await.expect("start");

        assert_eq!(manager.starts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.connect_count(), 1);
        assert_eq!(server.state_kind(), ConnectionState::Connected);
        // The application subscribed during opened().
        assert_eq!(manager.conn.sent_frames().len(), 1);
    }

    #[tokio::test]
    async fn test_start_while_running_is_invalid_state() {
        let manager = RecordingManager::new();
        let (server, _) = test_server(Arc::clone(&manager));

        server.start().await.expect("first start");
        let result = server.start().await;

        assert!(matches!(result, Err(NotifierError::AlreadyRunning)));
        assert_eq!(manager.connect_count(), 1);
        assert_eq!(server.state_kind(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_start_bad_hub_spec_rolls_back() {
        let manager = RecordingManager::new();
        let server = NotifierServer::with_manager(
            "[::1",
            None,
            false,
            None,
            None,
            Arc::clone(&manager) as Arc<dyn ConnectionManager>,
            Box::new(|| {}),
        );

        let result = server.start().await;

        assert!(matches!(result, Err(NotifierError::Hub(_))));
        assert_eq!(server.state_kind(), ConnectionState::Disconnected);
        assert_eq!(manager.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_iter_starts_lazily_exactly_once() {
        let manager = RecordingManager::new();
        let (server, _) = test_server(Arc::clone(&manager));

        let _stream = server.iter().await.expect("iter");
        assert_eq!(manager.connect_count(), 1);
        assert_eq!(server.state_kind(), ConnectionState::Connected);

        // Already running: no second start.
        let _stream2 = server.iter().await.expect("iter again");
        assert_eq!(manager.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_notify_then_next_returns_item() {
        let manager = RecordingManager::new();
        let (server, _) = test_server(manager);

        server.notify(message("hello"));
        let item = server.next_notification().await.expect("item");
        assert_eq!(item, message("hello"));

        // Buffer is drained and the server is disconnected: clean end.
        assert!(server.next_notification().await.is_none());
    }

    #[tokio::test]
    async fn test_next_on_empty_disconnected_ends_without_blocking() {
        let manager = RecordingManager::new();
        let (server, exits) = test_server(manager);

        assert!(server.next_notification().await.is_none());
        assert_eq!(exits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_next_blocks_until_item_arrives() {
        let manager = RecordingManager::new();
        let (server, _) = test_server(Arc::clone(&manager));
        server.start().await.expect("start");

        let consumer = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.next_notification().await })
        };

        // Give the consumer time to park.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!consumer.is_finished());

        server.notify(message("late"));
        let item = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("consumer should wake")
            .expect("join");
        assert_eq!(item, Some(message("late")));
    }

    #[tokio::test]
    async fn test_ordering_is_fifo() {
        let manager = RecordingManager::new();
        let (server, _) = test_server(manager);

        server.notify(message("one"));
        server.notify(message("two"));
        server.notify(message("three"));

        assert_eq!(server.next_notification().await, Some(message("one")));
        assert_eq!(server.next_notification().await, Some(message("two")));
        assert_eq!(server.next_notification().await, Some(message("three")));
    }

    #[tokio::test]
    async fn test_stop_nonforced_disconnects_without_sentinel() {
        let manager = RecordingManager::new();
        let (server, exits) = test_server(Arc::clone(&manager));
        server.start().await.expect("start");
        server.notify(message("pending"));

        server.stop(false).await;

        assert_eq!(server.state_kind(), ConnectionState::Disconnected);
        assert_eq!(manager.stop_count(), 1);
        assert_eq!(manager.shutdown_count(), 0);
        // Goodbye was sent by the application's disconnect and the
        // connection closed.
        assert_eq!(manager.conn.sent_frames().len(), 2);
        assert_eq!(manager.conn.close_count(), 1);

        // Pending item drains, then clean end; no exit.
        assert_eq!(server.next_notification().await, Some(message("pending")));
        assert!(server.next_notification().await.is_none());
        assert_eq!(exits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_when_disconnected_is_a_no_op() {
        let manager = RecordingManager::new();
        let (server, _) = test_server(Arc::clone(&manager));

        server.stop(false).await;
        server.stop(true).await;

        assert_eq!(manager.stop_count(), 0);
        assert!(lock(&server.queue).is_empty());
    }

    #[tokio::test]
    async fn test_stop_forced_appends_one_sentinel() {
        let manager = RecordingManager::new();
        let (server, exits) = test_server(Arc::clone(&manager));
        server.start().await.expect("start");

        server.stop(true).await;

        assert_eq!(manager.stop_count(), 1);
        assert_eq!(lock(&server.queue).len(), 1);

        // Consuming the sentinel fires the exit hook.
        assert!(server.next_notification().await.is_none());
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forced_stop_wakes_parked_consumer() {
        let manager = RecordingManager::new();
        let (server, exits) = test_server(Arc::clone(&manager));
        server.start().await.expect("start");

        let consumer = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.next_notification().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.stop(true).await;

        let item = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("consumer should wake")
            .expect("join");
        assert_eq!(item, None);
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_graceful_and_always_sentinels() {
        let manager = RecordingManager::new();
        let (server, exits) = test_server(Arc::clone(&manager));
        server.start().await.expect("start");

        server.shutdown().await;

        assert_eq!(server.state_kind(), ConnectionState::Disconnected);
        assert_eq!(manager.shutdown_count(), 1);
        assert_eq!(manager.stop_count(), 0);
        // No application disconnect on shutdown; the drain handles the
        // transport side. Only the subscribe frame was ever sent.
        assert_eq!(manager.conn.sent_frames().len(), 1);

        assert!(server.next_notification().await.is_none());
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_when_disconnected_is_a_no_op() {
        let manager = RecordingManager::new();
        let (server, _) = test_server(Arc::clone(&manager));

        server.shutdown().await;

        assert_eq!(manager.shutdown_count(), 0);
        assert!(lock(&server.queue).is_empty());
    }

    /// Manager double whose `connect` parks until released, so teardown
    /// can be driven while a connect is still in flight.
    struct GatedManager {
        inner: Arc<RecordingManager>,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl ConnectionManager for GatedManager {
        fn start(&self) -> Result<(), TransportError> {
            self.inner.start()
        }

        async fn connect(
            &self,
            endpoint: &config::HubEndpoint,
            acceptor: Acceptor,
            tls: Option<config::TlsClient>,
        ) -> Result<(), TransportError> {
            self.release.notified().await;
            self.inner.connect(endpoint, acceptor, tls).await
        }

        async fn stop(&self) {
            self.inner.stop().await;
        }

        async fn shutdown(&self) {
            self.inner.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_stop_during_connect_stays_disconnected() {
        let recording = RecordingManager::new();
        let gated = Arc::new(GatedManager {
            inner: Arc::clone(&recording),
            release: Notify::new(),
        });
        let server = NotifierServer::with_manager(
            "127.0.0.1:4859",
            None,
            false,
            Some("test-app".to_string()),
            Some("test-id".to_string()),
            Arc::clone(&gated) as Arc<dyn ConnectionManager>,
            Box::new(|| {}),
        );

        let starter = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.start().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.state_kind(), ConnectionState::Connecting);

        server.stop(false).await;
        assert_eq!(server.state_kind(), ConnectionState::Disconnected);

        gated.release.notify_one();
        starter.await.expect("join").expect("start");

        // Stop is terminal: the late connect must not resurrect the
        // server, and its fresh connection gets closed again.
        assert_eq!(server.state_kind(), ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recording.conn.close_count(), 1);
        assert!(server.next_notification().await.is_none());
    }

    #[tokio::test]
    async fn test_notify_after_stop_is_harmless() {
        let manager = RecordingManager::new();
        let (server, _) = test_server(Arc::clone(&manager));
        server.start().await.expect("start");
        server.stop(false).await;

        server.notify(message("straggler"));
        assert_eq!(server.next_notification().await, Some(message("straggler")));
        assert!(server.next_notification().await.is_none());
    }
}

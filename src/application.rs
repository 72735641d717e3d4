//! Per-connection protocol application.
//!
//! [`HubApplication`] drives one live hub connection on behalf of its
//! [`NotifierServer`]: it sends the initial `subscribe`, classifies every
//! inbound frame, and turns protocol and transport events into stream
//! items or termination requests. Remote notifications pass through
//! unchanged; local status events (connection established/closed, protocol
//! problems) are synthesized as `notify` messages carrying a
//! [`Category`], so the consumer sees one message shape for everything.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::notifier::NotifierServer;
use crate::protocol::{Category, Message, Notification};
use crate::transport::{ConnectionEvents, ConnectionHandle};

/// Protocol state machine for one live connection.
///
/// Owned by exactly the server it serves; created by the server's acceptor
/// on a successful connect, discarded when the connection state returns to
/// disconnected.
pub struct HubApplication {
    conn: ConnectionHandle,
    server: Arc<NotifierServer>,
    app_name: String,
    app_id: String,
}

impl std::fmt::Debug for HubApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubApplication")
            .field("app_name", &self.app_name)
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

impl HubApplication {
    /// Bind a new application to `conn`, serving `server`.
    pub fn new(
        conn: ConnectionHandle,
        server: Arc<NotifierServer>,
        app_name: String,
        app_id: String,
    ) -> Self {
        Self {
            conn,
            server,
            app_name,
            app_id,
        }
    }

    /// Best-effort send a frame; failures are logged and swallowed.
    async fn send_best_effort(&self, message: &Message) {
        match message.encode() {
            Ok(frame) => {
                if let Err(e) = self.conn.send_frame(frame).await {
                    log::debug!("could not send '{}' message: {e}", message.kind());
                }
            }
            Err(e) => log::debug!("could not encode '{}' message: {e}", message.kind()),
        }
    }

    /// Disconnect this application: best-effort `goodbye`, then close.
    ///
    /// A send failure never prevents the close; disconnect cannot fail.
    pub async fn disconnect(&self) {
        self.send_best_effort(&Message::Goodbye).await;
        self.conn.close().await;
    }

    /// Synthesize a local status notification and hand it to the server.
    ///
    /// Status events carry the app identity and a [`Category`]; genuine
    /// remote notifications carry an urgency instead.
    async fn status(&self, summary: &str, body: String, category: Category) {
        self.server.notify(Message::Notify(Notification {
            id: self.app_id.clone(),
            app_name: self.app_name.clone(),
            summary: summary.to_string(),
            body,
            category: Some(category),
            urgency: None,
        }));
    }
}

#[async_trait]
impl ConnectionEvents for HubApplication {
    async fn opened(&self) {
        // Failure to subscribe here is the transport layer's concern; the
        // hub will either answer or the connection will close.
        self.send_best_effort(&Message::Subscribe {
            app_name: self.app_name.clone(),
            app_id: self.app_id.clone(),
        })
        .await;
    }

    async fn recv_frame(&self, frame: Bytes) {
        match Message::decode(&frame) {
            Err(e) => {
                self.status(
                    "Failed To Parse Server Message",
                    format!("Unable to parse a message from the server: {e}"),
                    Category::Error,
                )
                .await;
                self.disconnect().await;
                self.server.stop(false).await;
            }
            Ok(Message::Error { reason }) => {
                self.status(
                    "Communication Error",
                    format!("An error occurred communicating with the notification hub: {reason}"),
                    Category::Error,
                )
                .await;
                self.disconnect().await;
                self.server.stop(false).await;
            }
            Ok(Message::Goodbye) => {
                // The remote already said goodbye; close without sending
                // anything further and report the closure directly.
                self.conn.close().await;
                self.closed(None).await;
            }
            Ok(Message::Subscribed) => {
                self.status(
                    "Connection Established",
                    "The connection to the notification hub has been established.".to_string(),
                    Category::Connected,
                )
                .await;
            }
            Ok(Message::Notify(notification)) => {
                self.server.notify(Message::Notify(notification));
            }
            Ok(other @ (Message::Subscribe { .. } | Message::Unknown { .. })) => {
                self.status(
                    "Unknown Server Message",
                    format!(
                        "An unrecognized server message of type \"{}\" was received.",
                        other.kind()
                    ),
                    Category::Error,
                )
                .await;
            }
        }
    }

    async fn closed(&self, reason: Option<String>) {
        if let Some(reason) = &reason {
            log::debug!("connection closed: {reason}");
        }
        self.status(
            "Connection Closed",
            "The connection to the notification hub has been closed.".to_string(),
            Category::Disconnected,
        )
        .await;
        self.server.stop(false).await;
    }
}

//! Messaging transport abstraction for the publisher.

use crate::error::EnvError;
use crate::types::{ChannelEvent, ConnectionStateChange, PresenceData, PresenceMessage};
use async_trait::async_trait;
use std::sync::Arc;

/// Receives presence events for one trackable channel.
pub type PresenceListener = Arc<dyn Fn(PresenceMessage) + Send + Sync>;

/// Receives connectivity changes of the whole transport connection.
pub type ConnectionStateListener = Arc<dyn Fn(ConnectionStateChange) + Send + Sync>;

/// Receives connectivity changes of one trackable channel.
pub type ChannelStateListener = Arc<dyn Fn(ConnectionStateChange) + Send + Sync>;

/// Abstraction over the remote pub/sub service client.
///
/// Every trackable maps to one channel. The publisher is a presence member
/// of each channel it publishes on.
///
/// # Implementations
///
/// - **Production**: wraps a realtime messaging SDK
/// - **Simulation**: `SimTransport` - in-memory with scripted failures
///
/// # Channel Flow
///
/// ```text
/// Publisher                 Transport                  Subscriber
///   |                           |                          |
///   |-- connect(T1) ----------->|                          |
///   |-- enter_presence(T1) ---->|-- presence(enter) ------>|
///   |<-- presence(enter) -------|<-- enter_presence(T1) ---|
///   |-- publish(T1, enhanced) ->|-- message -------------->|
/// ```
///
/// Failures carry an HTTP-like status code, see [`crate::FailureKind`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens the shared connection. Called before the first channel.
    async fn start_connection(&self) -> Result<(), EnvError>;

    /// Closes the shared connection. Called after the last channel.
    async fn stop_connection(&self) -> Result<(), EnvError>;

    /// Creates and attaches the channel for a trackable.
    async fn connect(&self, trackable_id: &str, presence_data: &PresenceData) -> Result<(), EnvError>;

    /// Leaves presence and detaches the channel for a trackable.
    async fn disconnect(&self, trackable_id: &str, presence_data: &PresenceData) -> Result<(), EnvError>;

    /// Enters presence on a connected channel.
    async fn enter_presence(&self, trackable_id: &str, presence_data: &PresenceData) -> Result<(), EnvError>;

    /// Publishes a serialized payload under the given event name.
    async fn publish(&self, trackable_id: &str, event: ChannelEvent, payload: String) -> Result<(), EnvError>;

    /// Registers a listener for presence events on a trackable channel.
    async fn subscribe_for_presence(
        &self,
        trackable_id: &str,
        listener: PresenceListener,
    ) -> Result<(), EnvError>;

    /// Replaces this client's presence payload on a trackable channel.
    async fn update_presence_data(&self, trackable_id: &str, presence_data: &PresenceData) -> Result<(), EnvError>;

    /// Resolves once the trackable channel is attached.
    async fn wait_for_channel_attach(&self, trackable_id: &str) -> Result<(), EnvError>;

    /// Registers a listener for connection-level state changes.
    fn subscribe_for_connection_state(&self, listener: ConnectionStateListener);

    /// Registers a listener for state changes of one channel.
    fn subscribe_for_channel_state(&self, trackable_id: &str, listener: ChannelStateListener);

    /// Leaves every channel and closes the connection.
    async fn close(&self, presence_data: &PresenceData) -> Result<(), EnvError>;
}

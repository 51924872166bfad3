//! The greeting capability the click handler consumes.

use async_trait::async_trait;

use crate::client::ClientHandle;
use crate::config::PageConfig;
use crate::error::Result;

/// An asynchronous `greet(name) -> greeting` operation supplied by some
/// collaborator. The page never looks behind this trait.
#[async_trait]
pub trait Greeter: Send + Sync {
    async fn greet(&self, name: &str) -> Result<String>;
}

/// Reaches a `greet` method on a remote object through the broker.
#[derive(Clone)]
pub struct RemoteGreeter {
    client: ClientHandle,
    object: String,
    method: String,
}

impl RemoteGreeter {
    pub fn new(client: ClientHandle, object: impl Into<String>) -> Self {
        Self {
            client,
            object: object.into(),
            method: "greet".into(),
        }
    }

    /// Target the actor and method named in the page config.
    pub fn from_config(client: ClientHandle, config: &PageConfig) -> Self {
        Self {
            client,
            object: config.actor.clone(),
            method: config.method.clone(),
        }
    }
}

#[async_trait]
impl Greeter for RemoteGreeter {
    async fn greet(&self, name: &str) -> Result<String> {
        self.client
            .remote_call::<&str, String>(&self.object, &self.method, name)
            .await
    }
}

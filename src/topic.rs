//! Topic identity and handler types
//!
//! A [`Topic`] pairs a subscription key with the handler that receives the
//! decoded payload of every push message published on it. Two topics are the
//! same topic when their keys are equal, regardless of handler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Error type handlers may return; logged by the connection, never propagated
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by topic handlers
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Strongly typed topic key to prevent confusion with other string types
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicKey(pub String);

impl TopicKey {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self(key.into())
    }

    /// Build a key in the service's `<topic-name>.<target-id>` form
    pub fn scoped(name: &str, target_id: impl fmt::Display) -> Self {
        Self(format!("{}.{}", name, target_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TopicKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TopicKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for TopicKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for TopicKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiver of decoded push payloads for one topic
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> TopicHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, payload: Value) -> HandlerResult {
        (self)(payload).await
    }
}

/// A subscription key together with its handler
#[derive(Clone)]
pub struct Topic {
    key: TopicKey,
    handler: Arc<dyn TopicHandler>,
}

impl Topic {
    pub fn new<K, H>(key: K, handler: H) -> Self
    where
        K: Into<TopicKey>,
        H: TopicHandler + 'static,
    {
        Self {
            key: key.into(),
            handler: Arc::new(handler),
        }
    }

    /// Build a topic sharing an already allocated handler
    pub fn with_shared_handler<K: Into<TopicKey>>(key: K, handler: Arc<dyn TopicHandler>) -> Self {
        Self {
            key: key.into(),
            handler,
        }
    }

    pub fn key(&self) -> &TopicKey {
        &self.key
    }

    /// Run the handler on a decoded payload
    pub async fn dispatch(&self, payload: Value) -> HandlerResult {
        self.handler.handle(payload).await
    }
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Topic {}

impl Hash for Topic {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic").field("key", &self.key).finish()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

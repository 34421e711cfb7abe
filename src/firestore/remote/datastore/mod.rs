use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::firestore::error::FirestoreResult;
use crate::firestore::util::AsyncQueue;

pub mod streaming;

pub use streaming::{box_stream_future, StreamingDatastoreImpl, StreamingHandleImpl};

pub type StreamingFuture<'a, T> = BoxFuture<'a, T>;

/// One open bidirectional RPC stream.
pub trait StreamHandle: Send + Sync {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// Next inbound payload. `None` once the stream is closed, `Some(Err)` when
    /// the backend terminated it with a status.
    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>>;

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>>;
}

/// Opens the listen and write RPC streams against the backend.
pub trait StreamingDatastore: Send + Sync + 'static {
    fn open_listen_stream(
        &self,
        token: Option<Token>,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;

    fn open_write_stream(
        &self,
        token: Option<Token>,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;
}

/// An auth token sent with every stream open request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub value: String,
}

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub(crate) fn authorization_header(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

pub type CredentialChangeListener = Arc<dyn Fn(Option<Token>) + Send + Sync>;

#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// Returns the current token, or `None` when the auth system has no
    /// signed-in user or is not ready yet.
    async fn get_token(&self, force_refresh: bool) -> FirestoreResult<Option<Token>>;

    /// Drops any cached token so the next `get_token` fetches a fresh one.
    fn invalidate_token(&self);

    /// Registers `on_change`, which is invoked on `queue` whenever the token
    /// changes.
    fn start(&self, queue: AsyncQueue, on_change: CredentialChangeListener);
}

pub type CredentialsProviderArc = Arc<dyn CredentialsProvider>;

#[derive(Default, Clone)]
pub struct EmptyCredentialsProvider;

#[async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self, _force_refresh: bool) -> FirestoreResult<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn start(&self, _queue: AsyncQueue, _on_change: CredentialChangeListener) {}
}

/// Hands out a fixed token that can be swapped with [`set_token`].
///
/// [`set_token`]: StaticCredentialsProvider::set_token
#[derive(Default)]
pub struct StaticCredentialsProvider {
    state: Mutex<StaticCredentialsState>,
}

#[derive(Default)]
struct StaticCredentialsState {
    token: Option<Token>,
    invalidations: usize,
    listener: Option<(AsyncQueue, CredentialChangeListener)>,
}

impl StaticCredentialsProvider {
    pub fn new(token: Option<Token>) -> Self {
        Self {
            state: Mutex::new(StaticCredentialsState {
                token,
                ..Default::default()
            }),
        }
    }

    pub fn set_token(&self, token: Option<Token>) {
        let listener = {
            let mut state = self.state.lock().unwrap();
            if state.token == token {
                return;
            }
            state.token = token.clone();
            state.listener.clone()
        };
        if let Some((queue, on_change)) = listener {
            queue.enqueue_and_forget(async move {
                on_change(token);
                Ok(())
            });
        }
    }

    /// How many times the token was invalidated.
    pub fn invalidation_count(&self) -> usize {
        self.state.lock().unwrap().invalidations
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self, _force_refresh: bool) -> FirestoreResult<Option<Token>> {
        Ok(self.state.lock().unwrap().token.clone())
    }

    fn invalidate_token(&self) {
        self.state.lock().unwrap().invalidations += 1;
    }

    fn start(&self, queue: AsyncQueue, on_change: CredentialChangeListener) {
        self.state.lock().unwrap().listener = Some((queue, on_change));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::test_support::spin_until;

    #[tokio::test]
    async fn static_provider_notifies_on_change() {
        let provider = StaticCredentialsProvider::new(Some(Token::new("first")));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        provider.start(
            AsyncQueue::new(),
            Arc::new(move |token| sink.lock().unwrap().push(token)),
        );

        provider.set_token(Some(Token::new("first")));
        provider.set_token(Some(Token::new("second")));

        spin_until(|| !seen.lock().unwrap().is_empty()).await;
        assert_eq!(*seen.lock().unwrap(), vec![Some(Token::new("second"))]);
        assert_eq!(
            provider.get_token(false).await.unwrap(),
            Some(Token::new("second"))
        );
    }

    #[test]
    fn invalidation_is_counted() {
        let provider = StaticCredentialsProvider::new(None);
        provider.invalidate_token();
        provider.invalidate_token();
        assert_eq!(provider.invalidation_count(), 2);
    }
}

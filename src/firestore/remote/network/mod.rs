use std::sync::Arc;
use std::time::Duration;

use crate::firestore::constants::HEALTHY_STREAM_PERIOD;
use crate::firestore::remote::datastore::{
    CredentialsProviderArc, EmptyCredentialsProvider, StreamingDatastore,
};
use crate::firestore::remote::stream::{PersistentStream, PersistentStreamDelegate, StreamKind};
use crate::firestore::util::AsyncQueue;
use crate::util::backoff::BackoffConfig;

/// Reconnect delays of the listen and write streams.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrySettings {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetrySettings {
    pub fn streaming_defaults() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.initial_delay,
            backoff_factor: self.multiplier,
            max_delay: self.max_delay,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::streaming_defaults()
    }
}

/// Everything a [`PersistentStream`] needs to connect: the datastore, the
/// credentials, the queue its events run on and its retry policy.
#[derive(Clone)]
pub struct NetworkLayer {
    datastore: Arc<dyn StreamingDatastore>,
    credentials: CredentialsProviderArc,
    queue: AsyncQueue,
    retry: RetrySettings,
    healthy_period: Duration,
}

impl NetworkLayer {
    pub fn builder(
        datastore: Arc<dyn StreamingDatastore>,
        credentials: CredentialsProviderArc,
    ) -> NetworkLayerBuilder {
        NetworkLayerBuilder::new(datastore, credentials)
    }

    pub fn listen<D>(&self, delegate: Arc<D>) -> PersistentStream<D>
    where
        D: PersistentStreamDelegate,
    {
        PersistentStream::new(self, StreamKind::Listen, delegate)
    }

    pub fn write<D>(&self, delegate: Arc<D>) -> PersistentStream<D>
    where
        D: PersistentStreamDelegate,
    {
        PersistentStream::new(self, StreamKind::Write, delegate)
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.queue
    }

    pub fn credentials(&self) -> CredentialsProviderArc {
        Arc::clone(&self.credentials)
    }

    pub(crate) fn datastore(&self) -> Arc<dyn StreamingDatastore> {
        Arc::clone(&self.datastore)
    }

    pub fn retry(&self) -> &RetrySettings {
        &self.retry
    }

    pub fn healthy_period(&self) -> Duration {
        self.healthy_period
    }
}

pub struct NetworkLayerBuilder {
    datastore: Arc<dyn StreamingDatastore>,
    credentials: Option<CredentialsProviderArc>,
    retry: RetrySettings,
    healthy_period: Duration,
}

impl NetworkLayerBuilder {
    fn new(datastore: Arc<dyn StreamingDatastore>, credentials: CredentialsProviderArc) -> Self {
        Self {
            datastore,
            credentials: Some(credentials),
            retry: RetrySettings::streaming_defaults(),
            healthy_period: HEALTHY_STREAM_PERIOD,
        }
    }

    /// Streams connect without an auth token.
    pub fn anonymous(mut self) -> Self {
        self.credentials = None;
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_healthy_period(mut self, period: Duration) -> Self {
        self.healthy_period = period;
        self
    }

    pub fn build(self, queue: AsyncQueue) -> NetworkLayer {
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(EmptyCredentialsProvider) as CredentialsProviderArc);
        NetworkLayer {
            datastore: self.datastore,
            credentials,
            queue,
            retry: self.retry,
            healthy_period: self.healthy_period,
        }
    }
}

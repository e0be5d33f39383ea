/// Content stream to vote extraction
///
/// Loads the option vocabulary from every known poll once, subscribes to an
/// external content stream and emits one vote per option mentioned in each
/// status update. Cancellation is observed between reads; the completion
/// notification is a `oneshot`, so it fires at most once however often
/// cancellation is requested.
use crate::error::Result;
use crate::metrics::VOTES_MATCHED;
use crate::repository::PollStore;
use crate::shutdown::stop_requested;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// One event from the content stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEvent {
    /// A new public status
    Update { content: String, author: String },
    /// Any other event kind (delete, notification, ...)
    Ignored { kind: String },
}

/// An open subscription. `None` means the stream ended.
#[async_trait]
pub trait ContentSource: Send {
    async fn next_event(&mut self) -> Option<Result<ContentEvent>>;
}

/// Something that can open a content subscription
#[async_trait]
pub trait ContentStream: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn ContentSource>>;
}

/// Known vote options, matched case-insensitively
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    // (option as stored, lowercased for matching)
    options: Vec<(String, String)>,
}

impl Vocabulary {
    /// Union of option sets, de-duplicated, in first-seen order
    pub fn from_option_sets<I, S>(sets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: IntoIterator<Item = String>,
    {
        let mut seen = HashSet::new();
        let options = sets
            .into_iter()
            .flatten()
            .filter(|option| !option.is_empty() && seen.insert(option.clone()))
            .map(|option| {
                let folded = option.to_lowercase();
                (option, folded)
            })
            .collect();
        Self { options }
    }

    /// Load from every poll in the store
    pub async fn load(store: &dyn PollStore) -> Result<Self> {
        let polls = store.load_polls().await?;
        Ok(Self::from_option_sets(polls.into_iter().map(|p| p.options)))
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Every option contained in `content`, each at most once
    pub fn matches(&self, content: &str) -> Vec<&str> {
        let folded = content.to_lowercase();
        self.options
            .iter()
            .filter(|(_, needle)| folded.contains(needle.as_str()))
            .map(|(option, _)| option.as_str())
            .collect()
    }
}

/// Counts reported once the filter stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSummary {
    pub events: u64,
    pub votes: u64,
    /// Set when the filter stopped because of a failure instead of cancellation
    pub failure: Option<String>,
}

pub struct StreamFilter {
    store: Arc<dyn PollStore>,
    stream: Arc<dyn ContentStream>,
}

impl StreamFilter {
    pub fn new(store: Arc<dyn PollStore>, stream: Arc<dyn ContentStream>) -> Self {
        Self { store, stream }
    }

    /// Start the receive loop.
    ///
    /// `votes` is dropped when the loop exits, which closes the vote channel.
    /// The returned receiver resolves once with the filter's summary.
    pub fn spawn(
        self,
        votes: mpsc::Sender<String>,
        cancel: watch::Receiver<bool>,
    ) -> oneshot::Receiver<FilterSummary> {
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let summary = self.run(votes, cancel).await;
            let _ = done_tx.send(summary);
        });
        done_rx
    }

    async fn run(
        self,
        votes: mpsc::Sender<String>,
        mut cancel: watch::Receiver<bool>,
    ) -> FilterSummary {
        let mut summary = FilterSummary::default();

        let vocabulary = match Vocabulary::load(self.store.as_ref()).await {
            Ok(vocabulary) => vocabulary,
            Err(e) => {
                error!(error = %e, "Failed to load vote options, stream filter not started");
                summary.failure = Some(e.to_string());
                return summary;
            }
        };
        if vocabulary.is_empty() {
            warn!("No vote options known, nothing will match");
        }
        info!(options = vocabulary.len(), "Vote vocabulary loaded");

        let mut source = tokio::select! {
            biased;
            _ = stop_requested(&mut cancel) => {
                info!("Stream filter cancelled before subscribing");
                return summary;
            }
            subscribed = self.stream.subscribe() => match subscribed {
                Ok(source) => source,
                Err(e) => {
                    error!(error = %e, "Failed to subscribe to content stream, stream filter stopping");
                    summary.failure = Some(e.to_string());
                    return summary;
                }
            },
        };
        info!("Subscribed to content stream");

        loop {
            let event = tokio::select! {
                biased;
                _ = stop_requested(&mut cancel) => {
                    info!("Stream filter cancelled");
                    break;
                }
                event = source.next_event() => event,
            };

            let (content, author) = match event {
                Some(Ok(ContentEvent::Update { content, author })) => (content, author),
                Some(Ok(ContentEvent::Ignored { kind })) => {
                    debug!(kind = %kind, "Ignoring stream event");
                    continue;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Content stream failed, stream filter stopping");
                    summary.failure = Some(e.to_string());
                    break;
                }
                None => {
                    error!("Content stream ended, stream filter stopping");
                    summary.failure = Some("content stream ended".to_string());
                    break;
                }
            };
            summary.events += 1;

            for option in vocabulary.matches(&content) {
                // A full channel applies backpressure to the stream reader
                if votes.send(option.to_string()).await.is_err() {
                    warn!("Vote channel closed, stream filter stopping");
                    return summary;
                }
                summary.votes += 1;
                VOTES_MATCHED.inc();
                info!(option = %option, author = %author, "vote");
            }
        }

        summary
    }
}

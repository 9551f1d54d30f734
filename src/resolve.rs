//! Turns media placeholders into URLs.
//!
//! Generation responses often acknowledge media before they are rendered. Resolution
//! first takes any URLs that arrived inline, then polls the media query for the rest,
//! and only when that query keeps failing falls back to scraping the conversation page.
//! A resolved id is final: it is never queried again and its URL never changes.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::MetaAiError;
use crate::poll::{poll_until, AttemptOutcome, Backoff, PollPolicy};
use crate::scrape::scrape_media_urls;
use crate::types::{MediaItem, MediaKind, MediaPlaceholder, RawProviderResponse, ResolutionStrategy};

/// Where resolution gets its data from. Implemented by the client; tests substitute
/// in-memory fakes.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Runs the media query for `media_id`. The provider answers with a feed of the
    /// requester's recent media, which may or may not include the id asked for.
    async fn fetch_media(
        &self,
        media_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<MediaPlaceholder>, MetaAiError>;

    /// The rendered HTML of a conversation.
    async fn fetch_conversation_page(&self, conversation_id: &str) -> Result<String, MetaAiError>;
}

/// Bounds for resolving one generation's media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionPolicy {
    pub polling: PollPolicy,
    pub scrape: PollPolicy,
    /// Failed media queries needed before the page scrape is tried.
    pub scrape_after_failures: u32,
}

impl ResolutionPolicy {
    pub fn image_default() -> Self {
        Self {
            polling: PollPolicy {
                max_attempts: 20,
                initial_delay: Duration::ZERO,
                backoff: Backoff {
                    base: Duration::from_secs(1),
                    fast_attempts: 3,
                    ceiling: Duration::from_secs(5),
                },
            },
            scrape: PollPolicy {
                max_attempts: 12,
                initial_delay: Duration::ZERO,
                backoff: Backoff::fixed(Duration::from_secs(5)),
            },
            scrape_after_failures: 3,
        }
    }

    pub fn video_default() -> Self {
        Self {
            polling: PollPolicy {
                max_attempts: 30,
                initial_delay: Duration::from_secs(10),
                backoff: Backoff {
                    base: Duration::from_secs(5),
                    fast_attempts: 3,
                    ceiling: Duration::from_secs(15),
                },
            },
            scrape: PollPolicy {
                max_attempts: 12,
                initial_delay: Duration::ZERO,
                backoff: Backoff::fixed(Duration::from_secs(5)),
            },
            scrape_after_failures: 3,
        }
    }
}

/// What resolution produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    /// Resolved items, in the order the provider reported them.
    pub items: Vec<MediaItem>,
    pub strategy: ResolutionStrategy,
    /// Media queries plus page fetches spent.
    pub attempts: u32,
    /// Ids that never resolved.
    pub unresolved: Vec<String>,
}

struct Resolution {
    placeholders: Vec<MediaPlaceholder>,
}

impl Resolution {
    fn next_query_id(&self) -> Option<String> {
        self.placeholders
            .iter()
            .find(|p| !p.is_resolved())
            .map(|p| p.id.clone())
    }

    fn is_complete(&self) -> bool {
        self.placeholders.iter().all(MediaPlaceholder::is_resolved)
    }

    /// Takes urls for outstanding ids from `feed`; returns whether everything is resolved.
    fn absorb_feed(&mut self, feed: Vec<MediaPlaceholder>) -> bool {
        for entry in feed.iter().filter(|entry| entry.is_resolved()) {
            if let Some(target) = self
                .placeholders
                .iter_mut()
                .find(|p| p.id == entry.id && !p.is_resolved())
            {
                debug!(media_id = %target.id, "media resolved");
                target.absorb(entry);
            }
        }
        self.is_complete()
    }

    /// Hands scraped urls to outstanding ids in order.
    fn absorb_scraped(&mut self, urls: Vec<String>, kind: MediaKind) {
        let known: Vec<String> = self.placeholders.iter().filter_map(|p| p.url.clone()).collect();
        let mut fresh = urls.into_iter().filter(|url| !known.contains(url));

        if self.placeholders.is_empty() {
            self.placeholders = fresh
                .map(|url| {
                    let mut placeholder = MediaPlaceholder::pending(url.clone(), kind);
                    placeholder.url = Some(url);
                    placeholder
                })
                .collect();
            return;
        }
        for placeholder in self.placeholders.iter_mut().filter(|p| !p.is_resolved()) {
            match fresh.next() {
                Some(url) => placeholder.url = Some(url),
                None => break,
            }
        }
    }

    fn resolved_count(&self) -> usize {
        self.placeholders.iter().filter(|p| p.is_resolved()).count()
    }

    fn finish(self, strategy: ResolutionStrategy, attempts: u32) -> ResolutionOutcome {
        let unresolved = self
            .placeholders
            .iter()
            .filter(|p| !p.is_resolved())
            .map(|p| p.id.clone())
            .collect();
        let items: Vec<MediaItem> = self
            .placeholders
            .into_iter()
            .filter_map(MediaPlaceholder::into_item)
            .collect();
        let strategy = if items.is_empty() {
            ResolutionStrategy::Unresolved
        } else {
            strategy
        };
        ResolutionOutcome {
            items,
            strategy,
            attempts,
            unresolved,
        }
    }
}

/// Resolves the placeholders of `response`.
///
/// Partial results are returned as they are; only an unrecoverable auth failure is an
/// error.
#[instrument(skip(source, response, policy), fields(placeholders = response.placeholders.len()))]
pub async fn resolve_media<S>(
    source: &S,
    response: &RawProviderResponse,
    kind: MediaKind,
    conversation_id: &str,
    policy: &ResolutionPolicy,
) -> Result<ResolutionOutcome, MetaAiError>
where
    S: MediaSource + ?Sized,
{
    let mut state = Resolution {
        placeholders: response.placeholders.clone(),
    };

    if response.all_resolved() {
        debug!("all media urls present inline");
        return Ok(state.finish(ResolutionStrategy::Inline, 0));
    }

    let mut attempts = 0;
    let mut failures = 0;
    if !state.placeholders.is_empty() {
        let report = poll_until(
            &policy.polling,
            "media query",
            &mut state,
            |state: &Resolution, _| {
                let next = state.next_query_id();
                async move {
                    let Some(media_id) = next else {
                        return AttemptOutcome::Ready(Vec::new());
                    };
                    match source.fetch_media(&media_id, conversation_id).await {
                        Ok(feed) => AttemptOutcome::Ready(feed),
                        Err(err) if err.is_fatal_for_polling() => AttemptOutcome::Fatal(err),
                        Err(err) => AttemptOutcome::Failed(err.to_string()),
                    }
                }
            },
            |state: &mut Resolution, feed| state.absorb_feed(feed),
        )
        .await?;

        attempts = report.attempts;
        failures = report.failures;
        if report.completed {
            info!(attempts, "media resolved by polling");
            return Ok(state.finish(ResolutionStrategy::Polling, attempts));
        }
    }

    let query_kept_failing = failures >= policy.scrape_after_failures;
    if !(state.placeholders.is_empty() || query_kept_failing) {
        warn!(
            attempts,
            resolved = state.resolved_count(),
            total = state.placeholders.len(),
            "media polling exhausted, returning partial result"
        );
        return Ok(state.finish(ResolutionStrategy::Polling, attempts));
    }

    warn!(attempts, failures, "falling back to conversation page scrape");
    let resolved_before = state.resolved_count();
    let mut scraped: Vec<String> = Vec::new();
    let report = poll_until(
        &policy.scrape,
        "conversation page",
        &mut scraped,
        |_, _| async move {
            match source.fetch_conversation_page(conversation_id).await {
                Ok(html) => AttemptOutcome::Ready(scrape_media_urls(&html, kind)),
                Err(err) if err.is_fatal_for_polling() => AttemptOutcome::Fatal(err),
                Err(err) => AttemptOutcome::Failed(err.to_string()),
            }
        },
        |scraped: &mut Vec<String>, urls| {
            if urls.is_empty() {
                return false;
            }
            *scraped = urls;
            true
        },
    )
    .await?;

    state.absorb_scraped(scraped, kind);
    let strategy = if state.resolved_count() > resolved_before {
        ResolutionStrategy::PageScrape
    } else {
        ResolutionStrategy::Polling
    };
    let outcome = state.finish(strategy, attempts + report.attempts);
    info!(
        resolved = outcome.items.len(),
        unresolved = outcome.unresolved.len(),
        strategy = ?outcome.strategy,
        "media resolution finished"
    );
    Ok(outcome)
}

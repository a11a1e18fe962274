//! Retriever: topic → search and feed seeds → gated fetches → entity queue.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use topicdigest_crawler::{LinkPolicy, extract_links};
use topicdigest_shared::{
    CrawlConfig, DigestError, FetchResult, FetchTask, FetchedDocument, Result, SearchHit,
    WebSource,
};

use crate::frontier::Frontier;
use crate::gate::Gate;
use crate::progress::Progress;
use crate::queue::WorkQueue;
use crate::retry::{RetryPolicy, transient_only};

/// Reason recorded when neither the page nor its search snippet has text.
pub const NO_CONTENT: &str = "no extractable content";

/// Producer stage. Shared by all retriever workers through an `Arc`.
pub(crate) struct Retriever {
    pub topic: String,
    pub source: Arc<dyn WebSource>,
    pub gate: Arc<Gate>,
    pub frontier: Arc<Frontier>,
    pub output: Arc<WorkQueue<FetchResult>>,
    pub policy: LinkPolicy,
    pub retry: RetryPolicy,
    pub crawl: CrawlConfig,
    pub progress: Arc<Progress>,
}

impl Retriever {
    /// Seed the frontier, run `workers` fetch loops until it is exhausted,
    /// then close the entity queue.
    ///
    /// The queue is closed on every exit path so consumers never wait on a
    /// producer that is gone.
    #[instrument(skip_all, fields(topic = %self.topic, workers = workers))]
    pub async fn run(self: Arc<Self>, workers: usize, cancel: CancellationToken) -> Result<()> {
        let result = Arc::clone(&self).crawl_frontier(workers, &cancel).await;
        self.output.close();
        result
    }

    async fn crawl_frontier(self: Arc<Self>, workers: usize, cancel: &CancellationToken) -> Result<()> {
        let seeds = self.seeds(cancel).await?;
        let seeded = self.frontier.extend(seeds);
        info!(seeded, "frontier seeded");

        // Siblings stop as soon as one worker fails.
        let workers_cancel = cancel.child_token();
        let mut set = JoinSet::new();
        for worker in 0..workers.max(1) {
            let this = Arc::clone(&self);
            let cancel = workers_cancel.clone();
            set.spawn(async move { this.worker(worker, &cancel).await });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(DigestError::invariant(format!("retriever worker panicked: {e}")))
            });
            if let Err(err) = outcome {
                workers_cancel.cancel();
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!(admitted = self.frontier.admitted(), "frontier exhausted");
                Ok(())
            }
        }
    }

    /// Search hits, feed entries and configured seed URLs, all at depth 0.
    ///
    /// Dated hits outside the publish window are dropped; undated ones and
    /// configured URLs always pass.
    async fn seeds(&self, cancel: &CancellationToken) -> Result<Vec<FetchTask>> {
        let mut hits = self.discover(cancel).await?;
        for feed_url in &self.crawl.feed_urls {
            hits.extend(self.read_feed(feed_url, cancel).await?);
        }

        let window = self.crawl.window;
        let before = hits.len();
        hits.retain(|hit| window.contains(hit.published));
        if hits.len() < before {
            info!(dropped = before - hits.len(), "seeds outside publish window dropped");
        }

        let from_hits = hits.into_iter().map(|hit| FetchTask {
            url: hit.url,
            depth: 0,
            topic: self.topic.clone(),
            title: hit.title,
            snippet: hit.snippet,
        });
        let configured = self.crawl.seed_urls.iter().map(|url| FetchTask {
            url: url.clone(),
            depth: 0,
            topic: self.topic.clone(),
            title: None,
            snippet: None,
        });
        Ok(from_hits.chain(configured).collect())
    }

    /// Discovery that still fails after retries yields no hits rather than
    /// ending the run; only cancellation and fatal errors propagate.
    async fn discover(&self, cancel: &CancellationToken) -> Result<Vec<SearchHit>> {
        let outcome = self
            .retry
            .run("discover", cancel, transient_only, |_| {
                self.source.discover(&self.topic)
            })
            .await;
        self.progress.record_fetch_retries(outcome.retries);

        match outcome.result {
            Ok(hits) => {
                info!(hits = hits.len(), "discovery complete");
                Ok(hits)
            }
            Err(err) if matches!(err, DigestError::Cancelled) || err.is_fatal() => Err(err),
            Err(err) => {
                warn!(error = %err, "discovery failed; continuing with other seeds");
                Ok(Vec::new())
            }
        }
    }

    /// One feed, retried on its own. A feed that keeps failing is skipped.
    async fn read_feed(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<SearchHit>> {
        let outcome = self
            .retry
            .run("feed", cancel, transient_only, |_| self.source.feed(url))
            .await;
        self.progress.record_fetch_retries(outcome.retries);

        match outcome.result {
            Ok(entries) => {
                let total = entries.len();
                let kept: Vec<SearchHit> = entries
                    .into_iter()
                    .filter(|hit| hit.mentions_any(&self.crawl.feed_keywords))
                    .collect();
                info!(feed = url, total, kept = kept.len(), "feed read");
                Ok(kept)
            }
            Err(err) if matches!(err, DigestError::Cancelled) || err.is_fatal() => Err(err),
            Err(err) => {
                warn!(feed = url, error = %err, "feed failed; skipping");
                Ok(Vec::new())
            }
        }
    }

    async fn worker(&self, worker: usize, cancel: &CancellationToken) -> Result<()> {
        let mut fetched = 0usize;
        while let Some(task) = self.frontier.next(cancel).await? {
            let (result, links) = match self.retrieve(&task, cancel).await {
                Ok(retrieved) => retrieved,
                Err(err) => {
                    // Release the task so waiting workers are not parked on it.
                    self.frontier.complete(Vec::new());
                    return Err(err);
                }
            };
            let admitted = self.frontier.complete(links);
            debug!(
                worker,
                url = %result.url,
                ok = result.is_ok(),
                admitted,
                "page retrieved"
            );
            self.output.push(result, cancel).await?;
            fetched += 1;
        }
        debug!(worker, fetched, "retriever worker finished");
        Ok(())
    }

    /// Fetch one task with retries and turn it into a terminal result plus
    /// the outbound links worth following.
    async fn retrieve(
        &self,
        task: &FetchTask,
        cancel: &CancellationToken,
    ) -> Result<(FetchResult, Vec<FetchTask>)> {
        let outcome = self
            .retry
            .run("fetch", cancel, transient_only, |_| self.fetch_gated(&task.url, cancel))
            .await;
        self.progress.record_fetch_retries(outcome.retries);

        match outcome.result {
            Ok(doc) => Ok(self.prepare(task, doc)),
            Err(err) if matches!(err, DigestError::Cancelled) || err.is_fatal() => Err(err),
            Err(err) => {
                warn!(url = %task.url, error = %err, "fetch failed");
                Ok((FetchResult::failed(task, err.to_string()), Vec::new()))
            }
        }
    }

    /// One fetch attempt under the fetch gate. The politeness delay is
    /// slept before the permit is released.
    async fn fetch_gated(&self, url: &str, cancel: &CancellationToken) -> Result<FetchedDocument> {
        let _permit = self.gate.acquire(cancel).await?;
        if cancel.is_cancelled() {
            return Err(DigestError::Cancelled);
        }

        self.progress.record_fetch_started();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DigestError::Cancelled),
            fetched = self.source.fetch(url) => fetched,
        };

        if !self.crawl.politeness_delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DigestError::Cancelled),
                _ = tokio::time::sleep(self.crawl.politeness_delay) => {}
            }
        }
        result
    }

    fn prepare(&self, task: &FetchTask, doc: FetchedDocument) -> (FetchResult, Vec<FetchTask>) {
        let links = self.follow_links(task, &doc);

        let (title, text) = match topicdigest_markdown::page_text(&doc.body) {
            Ok(page) => (page.title, page.text),
            Err(err) => {
                warn!(url = %task.url, error = %err, "text extraction failed");
                (None, String::new())
            }
        };

        let text = if text.trim().is_empty() {
            task.snippet.clone().unwrap_or_default()
        } else {
            text
        };

        let result = if text.trim().is_empty() {
            FetchResult::failed(task, NO_CONTENT)
        } else {
            FetchResult::ok(task, doc.body, title, text)
        };
        (result, links)
    }

    fn follow_links(&self, task: &FetchTask, doc: &FetchedDocument) -> Vec<FetchTask> {
        if task.depth >= self.crawl.max_depth {
            return Vec::new();
        }
        let Ok(base) = Url::parse(&doc.url).or_else(|_| Url::parse(&task.url)) else {
            return Vec::new();
        };

        self.policy
            .select(&extract_links(&doc.body, &base))
            .into_iter()
            .map(|url| FetchTask {
                url,
                depth: task.depth + 1,
                topic: task.topic.clone(),
                title: None,
                snippet: None,
            })
            .collect()
    }
}

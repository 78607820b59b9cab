//! Background job scheduling.
//!
//! A [`JobGroup`] runs every event source as its own task under one shared
//! lifecycle:
//!
//! - observers drain a stream and handle one item at a time
//! - spawning observers drain a bounded queue and handle items concurrently,
//!   up to a limit
//! - timers invoke a function once per period
//!
//! # Graceful Shutdown
//!
//! [`JobGroup::shutdown`] cancels the shared token. Jobs finish the item they
//! are handling and exit; spawning observers wait for their in-flight work.
//! Anything still running after the shutdown timeout is aborted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{Error, Result};

/// Shortest period a timer runs with.
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// A set of background jobs sharing one cancellation token.
pub struct JobGroup {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    names: Vec<&'static str>,
    shutdown_timeout: Duration,
}

impl JobGroup {
    /// Create an empty group.
    #[must_use]
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            names: Vec::new(),
            shutdown_timeout,
        }
    }

    /// Number of jobs started in this group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns `true` if no job was started.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Handle every item of `stream`, one at a time, until the stream ends or
    /// the group shuts down.
    pub fn add_observer<S, F, Fut>(&mut self, name: &'static str, mut stream: S, mut handle: F)
    where
        S: Stream + Send + Unpin + 'static,
        S::Item: Send + 'static,
        F: FnMut(S::Item) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.spawn(name, async move {
            loop {
                let item = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    item = stream.next() => item,
                };
                match item {
                    Some(item) => handle(item).await,
                    None => {
                        debug!("Event stream closed");
                        break;
                    }
                }
            }
        });
    }

    /// Handle items of `queue` concurrently, at most `limit` at a time.
    ///
    /// At the limit the job stops receiving, so a full queue pushes back on
    /// its producers. Items are taken from the queue in order.
    pub fn add_spawning_observer<T, F, Fut>(
        &mut self,
        name: &'static str,
        mut queue: mpsc::Receiver<T>,
        limit: usize,
        handle: F,
    ) where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let slots = Arc::new(Semaphore::new(limit.max(1)));
        self.spawn(name, async move {
            let mut workers = JoinSet::new();
            loop {
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    permit = Arc::clone(&slots).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let item = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    item = queue.recv() => match item {
                        Some(item) => item,
                        None => {
                            debug!("Queue closed");
                            break;
                        }
                    },
                };

                let work = handle(item);
                workers.spawn(
                    async move {
                        work.await;
                        drop(permit);
                    }
                    .in_current_span(),
                );

                while let Some(done) = workers.try_join_next() {
                    report_join(done);
                }
            }

            queue.close();
            while let Some(done) = workers.join_next().await {
                report_join(done);
            }
        });
    }

    /// Invoke `tick` every `period`, starting one period from now.
    ///
    /// Periods below one millisecond are raised to one millisecond.
    pub fn add_timer<F, Fut>(&mut self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let period = period.max(MIN_TIMER_PERIOD);
        self.spawn(name, async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
        });
    }

    /// Cancel every job and wait for them to exit.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if jobs had to be aborted because they did not
    /// exit within the shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        let jobs = self.names.len();

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(done) = self.tasks.join_next().await {
                report_join(done);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.tasks.len(),
                timeout = ?self.shutdown_timeout,
                "Jobs did not stop in time, aborting"
            );
            self.tasks.shutdown().await;
            return Err(Error::Timeout(format!(
                "jobs did not stop within {:?}",
                self.shutdown_timeout
            )));
        }

        info!(jobs, "All jobs stopped");
        Ok(())
    }

    fn spawn<Fut>(&mut self, name: &'static str, job: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.names.push(name);
        self.tasks.spawn(
            async move {
                debug!("Job started");
                job.await;
                debug!("Job stopped");
            }
            .instrument(info_span!("job", name)),
        );
    }
}

fn report_join(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result
        && e.is_panic()
    {
        warn!(error = %e, "Job task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn observer_handles_every_item_in_order() {
        // GIVEN: a group with one observer over a finite stream
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut group = JobGroup::new(Duration::from_secs(1));
        let sink = seen.clone();
        group.add_observer("numbers", futures::stream::iter(1..=5), move |n| {
            let sink = sink.clone();
            async move { sink.lock().push(n) }
        });

        // WHEN: the stream is exhausted and the group stops
        tokio::time::sleep(Duration::from_millis(50)).await;
        group.shutdown().await.unwrap();

        // THEN
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_each_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut group = JobGroup::new(Duration::from_secs(1));
        let counter = ticks.clone();
        group.add_timer("tick", Duration::from_secs(60), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(122)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        group.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_timer_still_ticks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut group = JobGroup::new(Duration::from_secs(1));
        let counter = ticks.clone();
        group.add_timer("tick", Duration::ZERO, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 5);

        // the timer task is alive, so shutdown joins it cleanly
        group.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn spawning_observer_respects_limit() {
        // GIVEN: limit 2 and work that blocks until released
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let (tx, rx) = mpsc::channel(16);
        let mut group = JobGroup::new(Duration::from_secs(1));
        {
            let (running, peak, release) = (running.clone(), peak.clone(), release.clone());
            group.add_spawning_observer("work", rx, 2, move |()| {
                let (running, peak, release) = (running.clone(), peak.clone(), release.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    release.notified().await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }

        // WHEN: five items are queued
        for _ in 0..5 {
            tx.send(()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // THEN: only two run, the rest wait in the queue
        assert_eq!(running.load(Ordering::SeqCst), 2);
        assert_eq!(tx.capacity(), 16 - 3);

        for _ in 0..5 {
            release.notify_one();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        group.shutdown().await.unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_aborts_stuck_jobs() {
        let mut group = JobGroup::new(Duration::from_millis(50));
        let (tx, rx) = mpsc::channel(1);
        group.add_spawning_observer("stuck", rx, 1, |()| std::future::pending::<()>());
        tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(group.len(), 1);
        let err = group.shutdown().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}

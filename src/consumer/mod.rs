//! The consume loop: message intake, size/time flushing and commit.
//!
//! The flush timer is only reset by a flush, never by an incoming message, so
//! a slow trickle of messages still flushes once the wait elapses.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batch::Batch;
use crate::export::health::HealthMetrics;
use crate::handler::BatchHandler;
use crate::source::MessageSource;

/// What caused a batch to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The batch reached its maximum size.
    Size,
    /// The wait elapsed with a non-empty batch.
    Timeout,
    /// The source was exhausted.
    Drain,
}

impl FlushTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Timeout => "timeout",
            Self::Drain => "drain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Waiting,
    Flushing(FlushTrigger),
    Stopped,
}

/// Single consumer task driving a source through a batch handler.
pub struct ConsumeLoop<S: MessageSource, H> {
    source: Arc<S>,
    handler: Arc<H>,
    batch: Batch<S::Message>,
    wait: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl<S, H> ConsumeLoop<S, H>
where
    S: MessageSource,
    H: BatchHandler,
{
    pub fn new(
        source: Arc<S>,
        handler: Arc<H>,
        batch_size: usize,
        wait: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            source,
            handler,
            batch: Batch::new(batch_size, health.clone()),
            wait,
            health,
        }
    }

    /// Runs until cancelled, the source is exhausted, or the handler fails.
    ///
    /// Cancellation leaves the pending batch uncommitted. A handler or source
    /// read error stops the loop without committing and is returned.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let first_tick = tokio::time::Instant::now() + self.wait;
        let mut ticker = tokio::time::interval_at(first_tick, self.wait);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut state = State::Waiting;
        loop {
            state = match state {
                State::Waiting => self.wait_for_event(&cancel, &mut ticker).await?,
                State::Flushing(_) if cancel.is_cancelled() => State::Stopped,
                State::Flushing(trigger) => {
                    self.flush(trigger).await?;
                    ticker.reset();

                    if trigger == FlushTrigger::Drain {
                        State::Stopped
                    } else {
                        State::Waiting
                    }
                }
                State::Stopped => break,
            };
        }

        if !self.batch.is_empty() {
            info!(
                pending = self.batch.size(),
                "consume loop stopped with an uncommitted batch"
            );
        }

        Ok(())
    }

    async fn wait_for_event(
        &mut self,
        cancel: &CancellationToken,
        ticker: &mut Interval,
    ) -> Result<State> {
        let state = tokio::select! {
            biased;

            _ = cancel.cancelled() => State::Stopped,

            _ = ticker.tick() => {
                if self.batch.is_empty() {
                    State::Waiting
                } else {
                    State::Flushing(FlushTrigger::Timeout)
                }
            }

            message = self.source.next_message() => match message.context("reading from message source")? {
                Some(message) => {
                    if let Some(health) = &self.health {
                        health.messages_received.inc();
                    }

                    self.batch.add(message);
                    if self.batch.is_full() {
                        State::Flushing(FlushTrigger::Size)
                    } else {
                        State::Waiting
                    }
                }
                None if self.batch.is_empty() => {
                    info!("message source exhausted");
                    State::Stopped
                }
                None => State::Flushing(FlushTrigger::Drain),
            },
        };

        Ok(state)
    }

    async fn flush(&mut self, trigger: FlushTrigger) -> Result<()> {
        let size = self.batch.size();
        let start = Instant::now();

        debug!(size, trigger = trigger.as_str(), "flushing batch");

        self.handler
            .handle(self.batch.events())
            .await
            .with_context(|| format!("handling batch of {size} events"))?;

        self.batch.commit();

        if let Some(health) = &self.health {
            health
                .batches_flushed
                .with_label_values(&[trigger.as_str()])
                .inc();
            health.batch_size.observe(size as f64);
            health
                .flush_duration
                .observe(start.elapsed().as_secs_f64());
        }

        Ok(())
    }
}

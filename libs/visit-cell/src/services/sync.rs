use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use shared_database::realtime::change_handler;
use shared_database::{ChangeEvent, ChangeFeed, ChannelHandle, ChannelSpec, EventFilter, QueryCache};

use crate::error::VisitError;
use crate::models::QueueInvalidation;
use crate::services::calendar::ClinicCalendar;
use crate::services::visit::{day_key, is_past_day, VISITS_TABLE};

pub const QUEUE_CHANNEL: &str = "visits-queue";

const UPDATE_BUFFER: usize = 64;

/// Keeps the cached day view of the queue in step with backend changes.
#[derive(Clone)]
pub struct QueueSyncService {
    feed: Arc<dyn ChangeFeed>,
    cache: QueryCache,
    calendar: ClinicCalendar,
}

impl QueueSyncService {
    pub fn new(feed: Arc<dyn ChangeFeed>, cache: QueryCache, calendar: ClinicCalendar) -> Self {
        Self { feed, cache, calendar }
    }

    /// Opens one channel on `visits` for every change type. Each notification
    /// invalidates the day view captured at activation. Once the clinic date
    /// has rolled over it also invalidates the current day view and drops the
    /// views of earlier days.
    pub async fn activate(&self, auth_token: Option<String>) -> Result<QueueSubscription, VisitError> {
        let activation_date = self.calendar.today();
        let closed = Arc::new(AtomicBool::new(false));
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);

        let handler = {
            let closed = Arc::clone(&closed);
            let cache = self.cache.clone();
            let calendar = self.calendar.clone();
            let updates = updates.clone();
            change_handler(move |event: ChangeEvent| {
                let closed = Arc::clone(&closed);
                let cache = cache.clone();
                let calendar = calendar.clone();
                let updates = updates.clone();
                async move {
                    if closed.load(Ordering::SeqCst) {
                        return;
                    }

                    cache.invalidate(&day_key(activation_date)).await;
                    let today = calendar.today();
                    if today != activation_date {
                        cache.invalidate(&day_key(today)).await;
                        let evicted = cache.evict_where(|key| is_past_day(key, today)).await;
                        debug!("Clinic day rolled over to {}, dropped {} past day views", today, evicted);
                    }

                    let notice = QueueInvalidation {
                        date: today,
                        table: event.table,
                        event: event.kind,
                        received_at: Utc::now(),
                    };
                    // No live consumer is fine.
                    let _ = updates.send(notice);
                }
            })
        };

        let spec = ChannelSpec::table(QUEUE_CHANNEL, VISITS_TABLE)
            .with_event(EventFilter::All)
            .with_access_token(auth_token);
        let handle = self.feed.subscribe(spec, handler).await?;

        info!("Queue sync active for {} on {}", activation_date, handle.topic);
        Ok(QueueSubscription {
            feed: Arc::clone(&self.feed),
            handle,
            closed,
            updates,
            activation_date,
        })
    }
}

/// An open queue channel. `close` releases it; dropping an open subscription
/// schedules the release on the current runtime.
pub struct QueueSubscription {
    feed: Arc<dyn ChangeFeed>,
    handle: ChannelHandle,
    closed: Arc<AtomicBool>,
    updates: broadcast::Sender<QueueInvalidation>,
    activation_date: NaiveDate,
}

impl QueueSubscription {
    pub fn activation_date(&self) -> NaiveDate {
        self.activation_date
    }

    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Invalidation notices published after this call.
    pub fn updates(&self) -> broadcast::Receiver<QueueInvalidation> {
        self.updates.subscribe()
    }

    /// Stops the handler and unsubscribes. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), VisitError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Queue subscription {} already closed", self.handle.id);
            return Ok(());
        }

        self.feed.unsubscribe(&self.handle).await?;
        info!("Queue sync closed for {}", self.activation_date);
        Ok(())
    }
}

impl Drop for QueueSubscription {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let feed = Arc::clone(&self.feed);
                let handle = self.handle.clone();
                runtime.spawn(async move {
                    if let Err(e) = feed.unsubscribe(&handle).await {
                        warn!("Failed to release queue channel {}: {}", handle.topic, e);
                    }
                });
            }
            Err(_) => warn!("Queue subscription {} dropped outside a runtime", self.handle.id),
        }
    }
}

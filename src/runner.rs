use std::{ sync::Arc, time::Duration };

use anyhow::{ anyhow, Result };
use tokio::{ sync::broadcast, task::JoinSet, time::{ interval, MissedTickBehavior } };
use tracing::{ debug, error, info };

use crate::{
    config::{ InstanceConfig, Vendor },
    cursor::CursorStore,
    darktrace::{ self, DarktraceBreaches },
    poller::{ Clock, EventSource, Poller, SystemClock },
    sink::IncidentSink,
    timestamp::{ TimestampParser, VendorTimestampParser },
    utils,
    zimperium::{ self, ZimperiumEvents },
};

pub type InstancePoller = Poller<Box<dyn EventSource>, VendorTimestampParser>;

pub fn build_poller(i: &InstanceConfig) -> Result<InstancePoller> {
    let conn = i.connection();
    let source: Box<dyn EventSource> = match i.vendor {
        Vendor::Zimperium => Box::new(ZimperiumEvents::new(zimperium::Client::new(&conn)?)),
        Vendor::Darktrace =>
            Box::new(DarktraceBreaches::new(darktrace::Client::new(&conn)?, i.min_score)),
    };
    Ok(Poller::new(source, VendorTimestampParser, i.poller_config()?))
}

/// Loads the stored cursor, polls once, hands the incidents to the sink and
/// only then stores the new cursor. Any failure leaves the stored cursor as it
/// was, so the next cycle retries the same window.
pub async fn run_cycle<S, P, C>(
    instance: &str,
    poller: &Poller<S, P, C>,
    store: &dyn CursorStore,
    sink: &dyn IncidentSink
) -> Result<usize>
    where S: EventSource, P: TimestampParser, C: Clock
{
    let cycle_id = utils::generate_id();
    let res = cycle(instance, &cycle_id, poller, store, sink).await;
    if let Err(e) = &res {
        error!(instance, cycle_id = %cycle_id, "poll cycle failed, cursor left unchanged: {:#}", e);
    }
    res
}

async fn cycle<S, P, C>(
    instance: &str,
    cycle_id: &str,
    poller: &Poller<S, P, C>,
    store: &dyn CursorStore,
    sink: &dyn IncidentSink
) -> Result<usize>
    where S: EventSource, P: TimestampParser, C: Clock
{
    let cursor = store.get(instance).await?;
    debug!(instance, cycle_id, has_cursor = cursor.is_some(), "starting poll cycle");
    let outcome = match poller.poll(cursor).await {
        Ok(o) => o,
        Err(e) => {
            if let Some(c) = &e.cursor {
                debug!(
                    instance,
                    cycle_id,
                    watermark = %utils::format_timestamp(&c.watermark),
                    "next cycle retries from the same cursor"
                );
            }
            return Err(e.into());
        }
    };
    let count = outcome.incidents.len();
    sink.deliver(instance, &outcome.incidents).await?;
    store.set(instance, &outcome.next_cursor).await?;
    info!(
        instance,
        cycle_id,
        count,
        watermark = %utils::format_timestamp(&outcome.next_cursor.watermark),
        "poll cycle finished"
    );
    Ok(count)
}

/// A poller and how often to run it.
pub struct Scheduled<S, P, C = SystemClock> {
    pub name: String,
    pub every: Duration,
    pub poller: Poller<S, P, C>,
}

pub fn schedule(instances: &[InstanceConfig]) -> Result<Vec<Scheduled<Box<dyn EventSource>, VendorTimestampParser>>> {
    instances
        .iter()
        .map(|i| {
            Ok(Scheduled {
                name: i.name.clone(),
                every: Duration::from_secs(i.interval_secs),
                poller: build_poller(i)?,
            })
        })
        .collect()
}

/// Runs every poller on its own interval until a cancel signal arrives. A
/// failed cycle is logged and retried on the next tick.
pub async fn watch<S, P, C>(
    scheduled: Vec<Scheduled<S, P, C>>,
    store: Arc<dyn CursorStore>,
    sink: Arc<dyn IncidentSink>,
    cancel_tx: broadcast::Sender<()>
) -> Result<()>
    where S: EventSource + 'static, P: TimestampParser + 'static, C: Clock + 'static
{
    if scheduled.is_empty() {
        return Err(anyhow!("no enabled instances to poll"));
    }
    let mut set = JoinSet::new();
    for s in scheduled {
        let store = store.clone();
        let sink = sink.clone();
        let mut cancel_rx = cancel_tx.subscribe();
        set.spawn(async move {
            let mut tick = interval(s.every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                instance = %s.name,
                interval_secs = s.every.as_secs(),
                page_size = s.poller.config().page_size,
                "instance poller started"
            );
            loop {
                tokio::select! {
                    _ = cancel_rx.recv() => {
                        info!(instance = %s.name, "cancel signal received, exiting instance poller");
                        break;
                    }
                    _ = tick.tick() => {
                        let _ = run_cycle(&s.name, &s.poller, store.as_ref(), sink.as_ref()).await;
                    }
                }
            }
        });
    }
    while set.join_next().await.is_some() {}
    info!("all instance pollers exited");
    Ok(())
}

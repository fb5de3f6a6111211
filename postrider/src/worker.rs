//! Worker-mode entry point: the inbound accept path and the outbound
//! forwarder, one isolated process per supervisor slot.

use std::{sync::Arc, time::Duration};

use postrider_common::{Signal, backpressure::BackpressureSignal, internal};
use postrider_delivery::{DeliveryConfig, DeliveryEngine, DnsResolver};
use postrider_smtp::{listener::Listener, session::SessionConfig, traits::AcceptAllValidator};
use postrider_spool::{INBOUND, MailQueue, MemoryQueue};
use postrider_supervisor::QueueSampler;
use tokio::sync::broadcast;

use crate::{config::Config, controller::SHUTDOWN_BROADCAST};

/// Runs one worker slot until shutdown.
///
/// # Errors
///
/// Returns an error if privileges cannot be dropped, the resolver cannot be
/// built, or a listener fails.
pub async fn run(config: Config, slot: u32) -> anyhow::Result<()> {
    postrider_supervisor::drop_privileges(config.privileges.uid, config.privileges.gid)?;

    internal!(
        level = INFO,
        "Worker {slot} serving {:?}",
        config.server.listen
    );

    tokio::spawn(crate::controller::watch_signals());

    let spool = Arc::new(MemoryQueue::new());
    let signal = Arc::new(BackpressureSignal::new());
    let resolver = Arc::new(DnsResolver::new(config.dns.clone())?);

    let session_config = SessionConfig::builder()
        .with_extensions(config.server.extensions())
        .with_banner(config.server.banner.clone())
        .with_max_command_line(config.server.max_command_line)
        .with_crlf_relaxed(config.server.crlf_relaxed)
        .with_timeouts(config.server.timeouts)
        .with_queue(Some(spool.clone() as Arc<dyn MailQueue>))
        .with_resolver(resolver.clone())
        .with_validator(Arc::new(AcceptAllValidator))
        .with_backpressure(Some(signal.clone()))
        .build();

    let sampler = QueueSampler::new(spool.clone(), signal, config.backpressure.clone());
    let sampler_task = tokio::spawn(sampler.run(SHUTDOWN_BROADCAST.subscribe()));

    let forwarder = Forwarder::new(config.delivery.clone(), resolver, spool);
    let forwarder_task = tokio::spawn(forwarder.run(SHUTDOWN_BROADCAST.subscribe()));

    let mut listeners = Vec::new();
    for socket in config.server.listen.clone() {
        let listener = Listener::new(socket, session_config.clone());
        let receiver = SHUTDOWN_BROADCAST.subscribe();
        listeners.push(tokio::spawn(
            async move { listener.serve(receiver).await },
        ));
    }

    for handle in listeners {
        handle.await??;
    }
    forwarder_task.await?;
    sampler_task.await?;

    internal!(level = INFO, "Worker {slot} stopped");
    Ok(())
}

const FLUSH_INTERVAL_SECS: u64 = 1;

/// Drains accepted mail from the spool and hands it to the delivery engine.
///
/// There is no deferred queue: a message that fails delivery is logged and
/// dropped.
struct Forwarder {
    engine: DeliveryEngine,
    spool: Arc<MemoryQueue>,
}

impl Forwarder {
    fn new(config: DeliveryConfig, resolver: Arc<DnsResolver>, spool: Arc<MemoryQueue>) -> Self {
        Self {
            engine: DeliveryEngine::new(config, resolver),
            spool,
        }
    }

    async fn run(mut self, mut shutdown: broadcast::Receiver<Signal>) {
        let mut interval = tokio::time::interval(Duration::from_secs(FLUSH_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.flush().await,

                _ = shutdown.recv() => {
                    // Accepted mail still in the spool goes out before we stop
                    self.flush().await;
                    return;
                }
            }
        }
    }

    async fn flush(&mut self) {
        for message in self.spool.drain(INBOUND) {
            if let Err(err) = self
                .engine
                .deliver(&message.envelope, &message.body)
                .await
            {
                internal!(level = WARN, "Delivery failed: {err}");
            }
        }
    }
}

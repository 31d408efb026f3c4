use crate::{process, Disposition, Runtime};
use futures::StreamExt;
use models::SourceKind;
use queue::Broker;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Redeliveries wait this many times `requeue_delay` before the nack.
const REDELIVERY_BACKOFF_FACTOR: u32 = 6;

/// Consume both imaging queues until `shutdown` fires, then drain: stop
/// taking deliveries, give in-flight messages a grace window, and cancel
/// whatever remains (cancelled workers nack for redelivery).
pub async fn serve(
    rt: Arc<Runtime>,
    broker: Arc<Broker>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let prefetch = rt.limits.in_flight.global_limit() as u16;
    let mut primary = broker
        .consumer(queue::PRIMARY_QUEUE, prefetch, "pixl-primary")
        .await?;
    let mut secondary = broker
        .consumer(queue::SECONDARY_QUEUE, prefetch, "pixl-secondary")
        .await?;

    // Workers get their own token so a drain can let them finish before
    // cancellation propagates into transfers.
    let workers = CancellationToken::new();

    tracing::info!(prefetch, "consuming imaging queues");
    loop {
        let (leg, delivery) = tokio::select! {
            () = shutdown.cancelled() => break,
            delivery = primary.next() => match delivery {
                Some(Ok(delivery)) => (SourceKind::Primary, delivery),
                Some(Err(err)) => return Err(err.into()),
                None => anyhow::bail!("primary consumer closed by broker"),
            },
            delivery = secondary.next() => match delivery {
                Some(Ok(delivery)) => (SourceKind::Secondary, delivery),
                Some(Err(err)) => return Err(err.into()),
                None => anyhow::bail!("secondary consumer closed by broker"),
            },
        };

        let request = match queue::decode(&delivery.data) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(error = %err, "dead-lettering malformed message");
                if let Err(err) = queue::dead_letter(&delivery).await {
                    tracing::error!(error = %err, "failed to reject delivery");
                }
                continue;
            }
        };

        let permit = match rt.limits.in_flight.acquire_message(&shutdown).await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let rt = rt.clone();
        let broker = broker.clone();
        let cancel = workers.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let disposition = process(&rt, leg, &request, &cancel).await;
            let result = match disposition {
                Disposition::Ack => queue::ack(&delivery).await,
                Disposition::RouteSecondary(request) => {
                    match broker.publish(queue::SECONDARY_QUEUE, &request).await {
                        Ok(()) => queue::ack(&delivery).await,
                        Err(err) => {
                            tracing::error!(error = %err, "secondary publish failed, requeueing");
                            queue::nack_requeue(&delivery).await
                        }
                    }
                }
                Disposition::DeadLetter => queue::dead_letter(&delivery).await,
                Disposition::Requeue => {
                    // Transient trouble retries via broker redelivery; hold
                    // the delivery (and its permit) through a local backoff
                    // first so the retry loop is paced. A drain skips
                    // straight to the nack.
                    let delay = if delivery.redelivered {
                        rt.settings.requeue_delay * REDELIVERY_BACKOFF_FACTOR
                    } else {
                        rt.settings.requeue_delay
                    };
                    tracing::debug!(
                        ?delay,
                        redelivered = delivery.redelivered,
                        "pacing transient-failure redelivery",
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {}
                    }
                    queue::nack_requeue(&delivery).await
                }
            };
            if let Err(err) = result {
                tracing::error!(error = %err, "failed to settle delivery");
            }
        });
    }

    tracing::info!(
        grace = ?rt.settings.shutdown_grace,
        "draining: waiting for in-flight messages",
    );
    let drained = tokio::time::timeout(rt.settings.shutdown_grace, rt.limits.in_flight.drained());
    if drained.await.is_err() {
        tracing::warn!("grace window elapsed, cancelling remaining work");
        workers.cancel();
        rt.limits.in_flight.drained().await;
    }
    tracing::info!("drained");
    Ok(())
}

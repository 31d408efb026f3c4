use crate::Runtime;
use cache::CacheError;
use ledger::LedgerError;
use models::{ErrorKind, ExportState, ExtractRequest, SourceKind};
use sources::SourceError;
use tokio_util::sync::CancellationToken;

/// What the consume loop should do with a delivery once processed.
#[derive(Debug)]
pub enum Disposition {
    /// Settled: success, duplicate, or a failure recorded in the ledger.
    Ack,
    /// Primary miss; re-publish onto the secondary queue (priority kept in
    /// the message itself) and ack the original.
    RouteSecondary(ExtractRequest),
    /// Unprocessable message; reject into the dead-letter queue.
    DeadLetter,
    /// Transient trouble or cancellation; negative-ack so the broker
    /// redelivers.
    Requeue,
}

/// Run one delivered message end to end against one source leg.
#[tracing::instrument(
    skip_all,
    fields(
        project = %request.project_name,
        source_key = %request.source_key(),
        leg = %leg,
    ),
)]
pub async fn process(
    rt: &Runtime,
    leg: SourceKind,
    request: &ExtractRequest,
    cancel: &CancellationToken,
) -> Disposition {
    let project_slug = request.project_name.as_str();
    let key = request.source_key();

    // 1. Deduplicate against the ledger before any source work.
    let record = match rt.ledger.ensure_pending(project_slug, &key).await {
        Ok(record) => record,
        Err(err) => {
            tracing::error!(error = %err, "ledger unavailable");
            return Disposition::Requeue;
        }
    };
    match record.state {
        ExportState::Exported | ExportState::Anonymised => {
            tracing::info!(state = %record.state, "dropping duplicate message");
            return Disposition::Ack;
        }
        ExportState::Failed => {
            // A redelivered message for a failed pair retries from scratch.
            if let Err(err) = rt
                .ledger
                .transition(
                    project_slug,
                    &key,
                    ExportState::Failed,
                    ExportState::Pending,
                    None,
                )
                .await
            {
                tracing::warn!(error = %err, "could not reopen failed ledger row");
                return Disposition::Ack;
            }
        }
        ExportState::Pending => {}
    }

    // 2. Resolve project policy.
    let project = match rt.registry.project(project_slug) {
        Ok(project) => project,
        Err(err) => {
            tracing::warn!(error = %err, kind = %ErrorKind::UnknownProject, "dead-lettering message");
            return Disposition::DeadLetter;
        }
    };

    // 3/4. Attempt retrieval from this leg's source.
    let raw_instances = match retrieve_all(rt, leg, request, cancel).await {
        Ok(instances) => instances,
        Err(Outcome::Miss) => {
            return match leg {
                SourceKind::Primary => {
                    tracing::info!("primary miss, routing to secondary queue");
                    Disposition::RouteSecondary(request.clone())
                }
                SourceKind::Secondary => {
                    fail(rt, project_slug, &key, ErrorKind::NotFound).await
                }
            };
        }
        Err(Outcome::Transient(reason)) => {
            tracing::warn!(reason, "transient retrieval trouble, requeueing");
            return Disposition::Requeue;
        }
        Err(Outcome::Failed(kind)) => return fail(rt, project_slug, &key, kind).await,
        Err(Outcome::Cancelled) => return Disposition::Requeue,
    };

    // 5 already happened inside retrieve_all (stability + repair).

    // 6. Anonymise. The salt is created on first use for the project.
    let salt = match rt.secrets.salt(&project.kv_alias).await {
        Ok(salt) => salt,
        Err(err) => {
            tracing::warn!(error = %err, kind = %ErrorKind::SecretUnavailable, "requeueing");
            return Disposition::Requeue;
        }
    };

    let anonymised = match deident::anonymise_study(
        &project,
        &salt,
        &rt.settings.org_root,
        rt.settings.forced_offset_days,
        &raw_instances,
    ) {
        Ok(anonymised) => anonymised,
        Err(deident::DeidentError::Validation { summary }) => {
            tracing::warn!(summary, kind = %ErrorKind::ValidationFailure, "study failed validation");
            return fail(rt, project_slug, &key, ErrorKind::ValidationFailure).await;
        }
        Err(err) => {
            tracing::warn!(error = %err, kind = %ErrorKind::AnonymisationFailure, "study failed anonymisation");
            return fail(rt, project_slug, &key, ErrorKind::AnonymisationFailure).await;
        }
    };
    tracing::info!(
        anon_study_uid = %anonymised.study_uid,
        instances = anonymised.instances.len(),
        skipped = anonymised.skipped.len(),
        "study anonymised",
    );

    // Stage the anonymised instances before recording progress.
    for instance in &anonymised.instances {
        if let Err(err) = rt.staging.store_instance(instance.bytes.clone()).await {
            tracing::warn!(error = %err, "staging store rejected an instance, requeueing");
            return Disposition::Requeue;
        }
    }

    match rt
        .ledger
        .record_anonymised(
            project_slug,
            &key,
            &anonymised.study_uid,
            &anonymised.pseudo_patient_id,
        )
        .await
    {
        Ok(()) => {}
        Err(LedgerError::Conflict { actual, .. }) => {
            // Another worker settled this pair first.
            tracing::info!(state = %actual, kind = %ErrorKind::LedgerConflict, "lost the ledger race");
            return Disposition::Ack;
        }
        Err(err) => {
            tracing::error!(error = %err, "ledger unavailable");
            return Disposition::Requeue;
        }
    }

    // 7. Export.
    let spec = project.destination();
    let uploader = match rt.uploaders.dicom_uploader(&spec, &project.kv_alias).await {
        Ok(uploader) => uploader,
        Err(export::UploadError::Transient(reason)) => {
            tracing::warn!(reason, kind = %ErrorKind::SecretUnavailable, "requeueing");
            return Disposition::Requeue;
        }
        Err(export::UploadError::Permanent(reason)) => {
            tracing::warn!(reason, kind = %ErrorKind::UploadFailure, "cannot build uploader");
            return settle(rt, project_slug, &key, ExportState::Anonymised, ErrorKind::UploadFailure)
                .await;
        }
    };

    let Some(uploader) = uploader else {
        // No DICOM destination configured: anonymisation is the product.
        return finish(rt, project_slug, &key).await;
    };

    let upload = export::upload_with_retry(rt.settings.upload_attempts, || {
        uploader.upload_study(project_slug, &anonymised)
    })
    .await;
    let closed = uploader.close().await;
    if let Err(err) = closed {
        tracing::warn!(error = %err, "uploader teardown failed");
    }

    match upload {
        Ok(receipt) => {
            tracing::info!(location = %receipt.location, bytes = receipt.bytes, "study exported");
            finish(rt, project_slug, &key).await
        }
        Err(err) => {
            tracing::warn!(error = %err, kind = %ErrorKind::UploadFailure, "export failed");
            settle(rt, project_slug, &key, ExportState::Anonymised, ErrorKind::UploadFailure).await
        }
    }
}

enum Outcome {
    /// The source does not hold the study.
    Miss,
    /// Retry later via redelivery.
    Transient(String),
    /// Permanent failure of this message.
    Failed(ErrorKind),
    Cancelled,
}

/// Find, retrieve, stabilise and read back every study matching the
/// request from the given leg's source.
async fn retrieve_all(
    rt: &Runtime,
    leg: SourceKind,
    request: &ExtractRequest,
    cancel: &CancellationToken,
) -> Result<Vec<Vec<u8>>, Outcome> {
    let source = rt.source(leg);

    // The token bucket governs request initiation only; it is released
    // (consumed) before the transfer, while the per-source permit bounds
    // concurrent occupation for the duration.
    if rt.limits.acquire_token(leg, cancel).await.is_err() {
        return Err(Outcome::Cancelled);
    }
    let _permit = match rt.limits.in_flight.acquire_source(leg, cancel).await {
        Ok(permit) => permit,
        Err(_) => return Err(Outcome::Cancelled),
    };

    let found = match source.find_study(&request.query(), cancel).await {
        Ok(found) => found,
        Err(SourceError::CircuitOpen(_)) => {
            return Err(match leg {
                SourceKind::Primary => Outcome::Miss,
                SourceKind::Secondary => Outcome::Transient("secondary circuit open".to_string()),
            });
        }
        Err(SourceError::Cancelled) => return Err(Outcome::Cancelled),
        Err(err) => {
            return Err(match leg {
                SourceKind::Primary => Outcome::Miss,
                SourceKind::Secondary => Outcome::Transient(err.to_string()),
            });
        }
    };
    if found.is_empty() {
        return Err(Outcome::Miss);
    }

    let mut all_bytes = Vec::new();
    for study in &found {
        // Make room before pulling fresh data in.
        if let Err(err) = rt.raw_cache.evict_for_headroom().await {
            tracing::warn!(error = %err, "cache eviction failed");
        }

        let _pin = rt.raw_cache.pin(&study.study_uid);
        match source.retrieve_study(&study.study_uid, cancel).await {
            Ok(()) => {}
            Err(SourceError::Cancelled) => return Err(Outcome::Cancelled),
            Err(SourceError::Timeout { .. }) => {
                return Err(Outcome::Transient(ErrorKind::TransferTimeout.to_string()))
            }
            Err(err) => return Err(Outcome::Transient(err.to_string())),
        }

        let local_id = match rt.raw_cache.find_study(&study.study_uid).await {
            Ok(Some(id)) => id,
            Ok(None) => return Err(Outcome::Failed(ErrorKind::CacheUnstable)),
            Err(err) => return Err(Outcome::Transient(err.to_string())),
        };
        // Store-local identifiers are what eviction sees.
        let _pin_local = rt.raw_cache.pin(&local_id);

        match rt
            .raw_cache
            .wait_stable(&local_id, study.expected_instances, cancel)
            .await
        {
            Ok(_) => {}
            Err(CacheError::Unstable { .. }) => {
                return Err(Outcome::Failed(ErrorKind::CacheUnstable))
            }
            Err(CacheError::Cancelled) => return Err(Outcome::Cancelled),
            Err(err) => return Err(Outcome::Transient(err.to_string())),
        }

        let instances = match rt
            .raw_cache
            .ensure_complete(
                source,
                &local_id,
                &study.study_uid,
                study.expected_instances,
                cancel,
            )
            .await
        {
            Ok(instances) => instances,
            Err(CacheError::Cancelled) => return Err(Outcome::Cancelled),
            Err(err) => return Err(Outcome::Transient(err.to_string())),
        };

        for instance in &instances {
            match rt.raw_cache.instance_bytes(&instance.id).await {
                Ok(bytes) => all_bytes.push(bytes),
                Err(err) => return Err(Outcome::Transient(err.to_string())),
            }
        }
    }

    tracing::info!(
        studies = found.len(),
        instances = all_bytes.len(),
        source = %leg,
        "retrieved into raw cache",
    );
    Ok(all_bytes)
}

/// Record a terminal failure from the pending state and ack.
async fn fail(rt: &Runtime, project: &str, key: &str, kind: ErrorKind) -> Disposition {
    settle(rt, project, key, ExportState::Pending, kind).await
}

async fn settle(
    rt: &Runtime,
    project: &str,
    key: &str,
    from: ExportState,
    kind: ErrorKind,
) -> Disposition {
    match rt
        .ledger
        .transition(project, key, from, ExportState::Failed, Some(kind.as_str()))
        .await
    {
        Ok(()) => Disposition::Ack,
        Err(LedgerError::Conflict { actual, .. }) => {
            tracing::info!(state = %actual, kind = %ErrorKind::LedgerConflict, "failure already settled");
            Disposition::Ack
        }
        Err(err) => {
            tracing::error!(error = %err, "ledger unavailable");
            Disposition::Requeue
        }
    }
}

/// Transition anonymised -> exported and ack.
async fn finish(rt: &Runtime, project: &str, key: &str) -> Disposition {
    match rt
        .ledger
        .transition(
            project,
            key,
            ExportState::Anonymised,
            ExportState::Exported,
            None,
        )
        .await
    {
        Ok(()) => Disposition::Ack,
        Err(LedgerError::Conflict { actual, .. }) => {
            tracing::info!(state = %actual, kind = %ErrorKind::LedgerConflict, "export already settled");
            Disposition::Ack
        }
        Err(err) => {
            tracing::error!(error = %err, "ledger unavailable");
            Disposition::Requeue
        }
    }
}

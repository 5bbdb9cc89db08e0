use super::*;

impl AuditInterceptor {
    /// Routes records to the merge path or plain inserts.
    ///
    /// Only modified records whose every property may merge take the merge path,
    /// and only when merging is enabled and the store supports it.
    pub(super) async fn persist(
        &self,
        records: Vec<AuditLogRecord>,
        cancellation: &CancellationToken,
    ) -> AppResult<AuditOutcome> {
        let mut outcome = AuditOutcome {
            records: records.len(),
            ..AuditOutcome::default()
        };
        if records.is_empty() {
            return Ok(outcome);
        }
        if cancellation.is_cancelled() {
            return Err(AppError::Cancelled(
                "audit persistence was cancelled before writing".to_owned(),
            ));
        }

        if self.options.merge_enabled() && self.store.supports_merge() {
            let (mergeable, plain): (Vec<_>, Vec<_>) = records.into_iter().partition(|record| {
                record.state == AuditEntryState::Modified && record.is_fully_mergeable()
            });

            if !mergeable.is_empty() {
                outcome.merged = until_cancelled(
                    cancellation,
                    self.store
                        .merge_records(&mergeable, self.options.merge_window),
                )
                .await?;
            }
            if !plain.is_empty() {
                let merged = outcome.merged;
                outcome.inserted =
                    until_cancelled(cancellation, self.store.insert_records(&plain))
                        .await
                        .map_err(|error| match error {
                            AppError::Cancelled(_) if merged > 0 => {
                                AppError::Cancelled(format!(
                                    "audit persistence was cancelled after merging {merged} \
                                     records, {} records not inserted",
                                    plain.len()
                                ))
                            }
                            other => other,
                        })?;
            }
        } else {
            if self.options.merge_enabled() {
                warn!(
                    records = records.len(),
                    "audit store cannot merge, inserting without deduplication"
                );
            }
            outcome.inserted =
                until_cancelled(cancellation, self.store.insert_records(&records)).await?;
        }

        debug!(
            records = outcome.records,
            merged = outcome.merged,
            inserted = outcome.inserted,
            "persisted audit batch"
        );
        Ok(outcome)
    }
}

async fn until_cancelled<T>(
    cancellation: &CancellationToken,
    operation: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    tokio::select! {
        biased;
        () = cancellation.cancelled() => Err(AppError::Cancelled(
            "audit persistence was cancelled".to_owned(),
        )),
        result = operation => result,
    }
}

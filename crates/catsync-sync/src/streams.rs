//! Daily playcount collection for a user's catalogue.

use catsync_core::{
    CatalogueTrack, MetricSnapshot, PassCounts, PassKind, PassReport, Platform, RunStatus,
    TokenSet,
};
use catsync_platforms::PlatformError;
use catsync_storage::{SnapshotBatcher, SnapshotRow};
use chrono::NaiveDate;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{PassContext, SyncError};

/// Runs the pass and folds any fatal failure into a failed report after alerting.
pub async fn run(ctx: &PassContext<'_>, user_id: &str, date: NaiveDate) -> PassReport {
    let span = info_span!("streams_pass", user_id, %date);
    async {
        let mut counts = PassCounts::default();
        match collect(ctx, user_id, date, &mut counts).await {
            Ok(total) => finish(ctx, date, counts, total).await,
            Err(err) => {
                error!(error = %err, ?counts, "stream collection aborted");
                ctx.alerts
                    .send(&format!("Error in stream collection: {err}"))
                    .await;
                PassReport::failed(PassKind::Streams, date, counts, err.to_string())
            }
        }
    }
    .instrument(span)
    .await
}

async fn finish(ctx: &PassContext<'_>, date: NaiveDate, counts: PassCounts, total: i64) -> PassReport {
    if let Err(err) = ctx.store.refresh_daily_delta().await {
        warn!(error = %err, "daily delta refresh failed");
    }

    if counts.processed > 0 && total == 0 {
        warn!(processed = counts.processed, "persisted playcounts sum to zero");
        ctx.alerts
            .send(&format!(
                "Warning: Streams collection for {date} found 0 total streams"
            ))
            .await;
    }

    info!(?counts, total, "stream collection finished");
    PassReport {
        pass: PassKind::Streams,
        snapshot_date: date,
        status: RunStatus::Success,
        counts,
        total_counter: Some(total),
        error: None,
    }
}

/// Returns the sum of persisted counters.
async fn collect(
    ctx: &PassContext<'_>,
    user_id: &str,
    date: NaiveDate,
    counts: &mut PassCounts,
) -> Result<i64, SyncError> {
    let tracks = ctx.store.catalogue_for_user(user_id).await?;
    if tracks.is_empty() {
        info!("no catalogue rows; nothing to collect");
        return Ok(0);
    }
    info!(tracks = tracks.len(), "collecting playcounts");

    let tokens = ctx.tokens.token_set().await?;
    let mut batcher = SnapshotBatcher::new(ctx.store, ctx.batch_size);
    let mut total = 0i64;

    for track in &tracks {
        match measure(ctx, tokens, track).await {
            Ok(Some(value)) => {
                batcher.stage(SnapshotRow::Metric(MetricSnapshot {
                    platform: Platform::Spotify,
                    track_uid: track.track_uid,
                    snapshot_date: date,
                    counter_value: value,
                    user_id: user_id.to_string(),
                }));
                counts.processed += 1;
                total += value;
            }
            Ok(None) => counts.skipped += 1,
            Err(err) => {
                warn!(isrc = %track.isrc, error = %err, "track failed; continuing");
                counts.errored += 1;
            }
        }

        if let Err(err) = batcher.item_done().await {
            batcher.discard();
            return Err(err.into());
        }
    }

    if let Err(err) = batcher.flush().await {
        batcher.discard();
        return Err(err.into());
    }
    Ok(total)
}

/// `Ok(None)` covers both an unresolvable ISRC and a response without a counter.
async fn measure(
    ctx: &PassContext<'_>,
    tokens: &TokenSet,
    track: &CatalogueTrack,
) -> Result<Option<i64>, PlatformError> {
    let resolved = ctx.platforms.resolver.resolve(&track.isrc, &tokens.search).await;
    ctx.pacing.after_request().await;
    let Some(id) = resolved? else {
        info!(isrc = %track.isrc, "isrc not found on platform");
        return Ok(None);
    };

    let lookup = ctx.platforms.playcounts.playcount(&id, &tokens.web).await;
    ctx.pacing.after_request().await;
    Ok(lookup?.value())
}

//! Catalogue health: is each track still listed on Apple Music and Spotify.

use catsync_core::{AvailabilitySnapshot, PassCounts, PassKind, PassReport, RunStatus};
use catsync_storage::{SnapshotBatcher, SnapshotRow};
use chrono::NaiveDate;
use tracing::{error, info, info_span, Instrument};

use crate::{PassContext, SyncError};

pub async fn run(ctx: &PassContext<'_>, user_id: &str, date: NaiveDate) -> PassReport {
    let span = info_span!("health_pass", user_id, %date);
    async {
        let mut counts = PassCounts::default();
        match check(ctx, user_id, date, &mut counts).await {
            Ok(()) => {
                info!(?counts, "catalogue health check finished");
                PassReport {
                    pass: PassKind::CatalogueHealth,
                    snapshot_date: date,
                    status: RunStatus::Success,
                    counts,
                    total_counter: None,
                    error: None,
                }
            }
            Err(err) => {
                error!(error = %err, ?counts, "catalogue health check aborted");
                PassReport::failed(PassKind::CatalogueHealth, date, counts, err.to_string())
            }
        }
    }
    .instrument(span)
    .await
}

async fn check(
    ctx: &PassContext<'_>,
    user_id: &str,
    date: NaiveDate,
    counts: &mut PassCounts,
) -> Result<(), SyncError> {
    let tracks = ctx.store.catalogue_for_user(user_id).await?;
    if tracks.is_empty() {
        return Ok(());
    }
    let token = ctx.tokens.search_token().await?;
    let mut batcher = SnapshotBatcher::new(ctx.store, ctx.batch_size);

    for track in &tracks {
        let (Some(title), Some(artist)) = (
            track.title.as_deref().filter(|t| !t.trim().is_empty()),
            track.artist.as_deref().filter(|a| !a.trim().is_empty()),
        ) else {
            info!(isrc = %track.isrc, "missing title or artist; skipping health check");
            counts.skipped += 1;
            continue;
        };

        let apple_music_present = ctx.platforms.apple_music.is_available(artist, title, token).await;
        let spotify_present = ctx.platforms.spotify_search.is_available(artist, title, token).await;
        ctx.pacing.after_availability_check().await;

        info!(isrc = %track.isrc, apple_music_present, spotify_present, "availability checked");
        batcher.stage(SnapshotRow::Availability(AvailabilitySnapshot {
            snapshot_date: date,
            track_uid: track.track_uid,
            apple_music_present,
            spotify_present,
            user_id: user_id.to_string(),
        }));
        counts.processed += 1;

        if let Err(err) = batcher.item_done().await {
            batcher.discard();
            return Err(err.into());
        }
    }

    if let Err(err) = batcher.flush().await {
        batcher.discard();
        return Err(err.into());
    }
    Ok(())
}

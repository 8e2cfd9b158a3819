//! Daily follower counts for the user's own playlists.

use catsync_core::{FollowerSnapshot, PassCounts, PassKind, PassReport, Platform, RunStatus};
use catsync_storage::{SnapshotBatcher, SnapshotRow};
use chrono::NaiveDate;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{PassContext, SyncError};

pub async fn run(ctx: &PassContext<'_>, user_id: &str, date: NaiveDate) -> PassReport {
    let span = info_span!("followers_pass", user_id, %date);
    async {
        let mut counts = PassCounts::default();
        match collect(ctx, user_id, date, &mut counts).await {
            Ok(()) => {
                info!(?counts, "playlist followers collected");
                PassReport {
                    pass: PassKind::PlaylistFollowers,
                    snapshot_date: date,
                    status: RunStatus::Success,
                    counts,
                    total_counter: None,
                    error: None,
                }
            }
            Err(err) => {
                error!(error = %err, ?counts, "playlist follower collection aborted");
                PassReport::failed(PassKind::PlaylistFollowers, date, counts, err.to_string())
            }
        }
    }
    .instrument(span)
    .await
}

async fn collect(
    ctx: &PassContext<'_>,
    user_id: &str,
    date: NaiveDate,
    counts: &mut PassCounts,
) -> Result<(), SyncError> {
    let playlists = ctx.store.playlists_for_user(user_id).await?;
    if playlists.is_empty() {
        return Ok(());
    }
    let token = ctx.tokens.search_token().await?;
    let mut batcher = SnapshotBatcher::new(ctx.store, ctx.batch_size);

    for playlist in &playlists {
        let id = playlist.bare_id();
        let result = ctx.platforms.followers.followers(id, token).await;
        ctx.pacing.after_request().await;

        match result {
            Ok(Some(followers)) => {
                batcher.stage(SnapshotRow::Followers(FollowerSnapshot {
                    platform: Platform::Spotify,
                    playlist_uid: playlist.playlist_uid,
                    snapshot_date: date,
                    followers,
                    user_id: user_id.to_string(),
                }));
                counts.processed += 1;
            }
            Ok(None) => {
                info!(playlist_id = id, "playlist not found upstream; skipping");
                counts.skipped += 1;
            }
            Err(err) => {
                warn!(playlist_id = id, error = %err, "playlist lookup failed; continuing");
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
    Ok(())
}

//! Recording session state machine.
//!
//! ```text
//! Idle --start()--> Recording --finish()--> Draft --discard()/publish--> Idle
//!                       |
//!                       +--finish() with < 2 points--> Idle
//! ```
//!
//! The session keeps no state of its own. [`RecordingSession::state`] derives
//! it from whether the sampler is registered with the OS and whether a draft
//! is persisted, so it is correct after a relaunch and should be called on
//! every app foreground.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::draft_store::DraftStore;
use crate::metrics::LiveStats;
use crate::sampler::{GeoSampler, LocationProvider};
use crate::storage::KeyValueStore;
use crate::{CaptureError, Clock, RouteDraft, SystemClock};

/// Where the recording lifecycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No draft and not sampling.
    Idle,
    /// Sampling is active and the draft is growing.
    Recording { started_at: i64 },
    /// Sampling stopped; the draft holds a finished, unpublished route.
    Draft,
}

pub struct RecordingSession<P: LocationProvider, K: KeyValueStore, C: Clock = SystemClock> {
    sampler: GeoSampler<P>,
    drafts: Arc<DraftStore<K>>,
    clock: C,
}

impl<P: LocationProvider, K: KeyValueStore, C: Clock> RecordingSession<P, K, C> {
    pub fn new(sampler: GeoSampler<P>, drafts: Arc<DraftStore<K>>, clock: C) -> Self {
        Self { sampler, drafts, clock }
    }

    pub fn drafts(&self) -> &Arc<DraftStore<K>> {
        &self.drafts
    }

    pub fn sampler(&self) -> &GeoSampler<P> {
        &self.sampler
    }

    /// Re-derive the session state from the sampler and the draft store.
    ///
    /// A sampler left running without a draft (e.g. the draft was cleared
    /// while the app was dead) is stopped.
    pub async fn state(&self) -> Result<SessionState, CaptureError> {
        let active = self.sampler.is_active().await;
        let draft = self.drafts.load().await?;

        Ok(match (active, draft) {
            (true, Some(draft)) => SessionState::Recording { started_at: draft.started_at },
            (false, Some(_)) => SessionState::Draft,
            (true, None) => {
                warn!("[Session] Sampler active without a draft, stopping it");
                self.sampler.stop().await?;
                SessionState::Idle
            }
            (false, None) => SessionState::Idle,
        })
    }

    /// Start a new recording.
    ///
    /// Only valid from `Idle`. Fails with `PermissionDenied` (and stays idle)
    /// unless both foreground and background location access are granted.
    pub async fn start(&self) -> Result<SessionState, CaptureError> {
        let current = self.state().await?;
        if current != SessionState::Idle {
            return Err(CaptureError::SessionBusy(current));
        }

        if !self.sampler.request_permission().await {
            return Err(CaptureError::PermissionDenied);
        }

        // The draft must exist before the first delivery can arrive
        let started_at = self.clock.now_ms();
        self.drafts.save(&RouteDraft::new(started_at)).await?;

        if let Err(e) = self.sampler.start().await {
            warn!("[Session] Failed to start sampling: {}", e);
            self.drafts.clear().await?;
            return Err(e);
        }

        info!("[Session] Recording started at {}", started_at);
        Ok(SessionState::Recording { started_at })
    }

    /// Stop sampling and return the persisted draft. Safe to call repeatedly.
    pub async fn stop(&self) -> Result<Option<RouteDraft>, CaptureError> {
        self.sampler.stop().await?;
        self.drafts.load().await
    }

    /// Stop recording and return the finished route.
    ///
    /// A route with fewer than 2 points is unusable: the draft is cleared and
    /// `InsufficientSignal` is returned, leaving the session `Idle`.
    pub async fn finish(&self) -> Result<RouteDraft, CaptureError> {
        let draft = self.stop().await?;
        let captured = draft.as_ref().map_or(0, |d| d.points.len());

        match draft {
            Some(draft) if draft.is_usable() => {
                info!("[Session] Recording finished with {} points", captured);
                Ok(draft)
            }
            Some(_) => {
                info!("[Session] Discarding recording with {} point(s)", captured);
                self.drafts.clear().await?;
                Err(CaptureError::InsufficientSignal { captured })
            }
            None => Err(CaptureError::InsufficientSignal { captured }),
        }
    }

    /// Throw away the current draft. Irreversible.
    pub async fn discard(&self) -> Result<(), CaptureError> {
        self.sampler.stop().await?;
        self.drafts.clear().await?;
        info!("[Session] Draft discarded");
        Ok(())
    }

    /// Stats for the live recording view, if a draft exists.
    pub async fn live_stats(&self) -> Result<Option<LiveStats>, CaptureError> {
        let now = self.clock.now_ms();
        Ok(self.drafts.load().await?.map(|draft| LiveStats::from_draft(&draft, now)))
    }
}

/// Fires a callback once per second with the elapsed recording time.
///
/// Elapsed time is computed from `started_at` on every tick, so it never
/// drifts. The ticker stops when dropped. Requires a tokio runtime.
pub struct ElapsedTicker {
    handle: JoinHandle<()>,
}

impl ElapsedTicker {
    pub fn spawn<C, F>(started_at: i64, clock: C, mut on_tick: F) -> Self
    where
        C: Clock + 'static,
        F: FnMut(i64) + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                on_tick((clock.now_ms() - started_at).max(0));
            }
        });
        Self { handle }
    }
}

impl Drop for ElapsedTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::testing::FakeProvider;
    use crate::sampler::handle_location_batch;
    use crate::testing::FixedClock;
    use crate::{FileKvStore, RawFix, TrackFilterConfig, UserAction};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    const T0: i64 = 1_700_000_000_000;

    fn session(dir: &tempfile::TempDir) -> RecordingSession<FakeProvider, FileKvStore, Arc<FixedClock>> {
        let drafts = Arc::new(DraftStore::new(FileKvStore::new(dir.path())));
        RecordingSession::new(GeoSampler::new(FakeProvider::default()), drafts, Arc::new(FixedClock::new(T0)))
    }

    async fn deliver(session: &RecordingSession<FakeProvider, FileKvStore, Arc<FixedClock>>, fixes: &[RawFix]) {
        handle_location_batch(session.drafts(), fixes, &TrackFilterConfig::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_writes_empty_draft_and_samples() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(&dir);

        assert_eq!(session.state().await.unwrap(), SessionState::Idle);
        assert_eq!(session.start().await.unwrap(), SessionState::Recording { started_at: T0 });

        let draft = session.drafts().load().await.unwrap().unwrap();
        assert_eq!(draft, RouteDraft::new(T0));
        assert!(session.sampler().is_active().await);
    }

    #[tokio::test]
    async fn test_start_denied_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(&dir);
        session.sampler().provider().deny_background.store(true, Ordering::SeqCst);

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, CaptureError::PermissionDenied));
        assert_eq!(err.user_action(), UserAction::GrantPermission);
        assert_eq!(session.state().await.unwrap(), SessionState::Idle);
        assert_eq!(session.drafts().load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_start_while_recording_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(&dir);
        session.start().await.unwrap();
        deliver(&session, &[RawFix::new(51.5, -0.12, T0)]).await;

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, CaptureError::SessionBusy(SessionState::Recording { .. })));
        // Recorded point untouched
        assert_eq!(session.drafts().load().await.unwrap().unwrap().points.len(), 1);
    }

    #[tokio::test]
    async fn test_full_recording_to_draft() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(&dir);
        session.start().await.unwrap();

        deliver(
            &session,
            &[
                RawFix::new(51.50000, -0.12, T0),
                RawFix::new(51.50004, -0.12, T0 + 10_000),
                RawFix::new(51.50004, -0.12, T0 + 70_000),
            ],
        )
        .await;

        let draft = session.finish().await.unwrap();
        assert_eq!(draft.points.len(), 2);
        assert_eq!(session.state().await.unwrap(), SessionState::Draft);
        assert!(!session.sampler().is_active().await);
    }

    #[tokio::test]
    async fn test_finish_with_one_point_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(&dir);
        session.start().await.unwrap();
        deliver(&session, &[RawFix::new(51.5, -0.12, T0)]).await;

        let err = session.finish().await.unwrap_err();
        assert!(matches!(err, CaptureError::InsufficientSignal { captured: 1 }));
        assert_eq!(err.user_action(), UserAction::NothingToRetry);
        assert_eq!(session.drafts().load().await.unwrap(), None);
        assert_eq!(session.state().await.unwrap(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_stop_twice_keeps_draft_intact() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(&dir);
        session.start().await.unwrap();
        deliver(
            &session,
            &[RawFix::new(51.500, -0.12, T0), RawFix::new(51.501, -0.12, T0 + 5_000)],
        )
        .await;

        let first = session.stop().await.unwrap();
        let second = session.stop().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.unwrap().points.len(), 2);
        assert_eq!(session.sampler().provider().stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_delivery_after_discard_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(&dir);
        session.start().await.unwrap();
        session.discard().await.unwrap();

        deliver(&session, &[RawFix::new(51.5, -0.12, T0 + 1_000)]).await;
        assert_eq!(session.drafts().load().await.unwrap(), None);
        assert_eq!(session.state().await.unwrap(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_state_rebuilt_by_new_session_instance() {
        let dir = tempfile::tempdir().unwrap();
        let first = session(&dir);
        first.start().await.unwrap();

        // Simulated relaunch: fresh session over the same storage, OS still sampling
        let relaunched = session(&dir);
        relaunched.sampler().provider().active.store(true, Ordering::SeqCst);
        assert_eq!(relaunched.state().await.unwrap(), SessionState::Recording { started_at: T0 });

        // OS reports sampling stopped: the finished draft remains
        relaunched.sampler().provider().active.store(false, Ordering::SeqCst);
        assert_eq!(relaunched.state().await.unwrap(), SessionState::Draft);
    }

    #[tokio::test]
    async fn test_orphaned_sampler_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(&dir);
        session.sampler().provider().active.store(true, Ordering::SeqCst);

        assert_eq!(session.state().await.unwrap(), SessionState::Idle);
        assert!(!session.sampler().is_active().await);
    }

    #[tokio::test]
    async fn test_live_stats_use_clock() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(T0));
        let drafts = Arc::new(DraftStore::new(FileKvStore::new(dir.path())));
        let session = RecordingSession::new(GeoSampler::new(FakeProvider::default()), drafts, clock.clone());

        assert_eq!(session.live_stats().await.unwrap(), None);
        session.start().await.unwrap();
        clock.advance(65_000);

        let stats = session.live_stats().await.unwrap().unwrap();
        assert_eq!(stats.elapsed_display(), "01:05");
        assert_eq!(stats.point_count, 0);
    }

    #[tokio::test]
    async fn test_elapsed_ticker_reports_from_started_at() {
        let clock = Arc::new(FixedClock::new(T0 + 3_000));
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = ticks.clone();

        let ticker = ElapsedTicker::spawn(T0, clock, move |elapsed| sink.lock().unwrap().push(elapsed));
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(ticker);

        let seen = ticks.lock().unwrap().clone();
        assert!(!seen.is_empty());
        assert_eq!(seen[0], 3_000);
    }
}

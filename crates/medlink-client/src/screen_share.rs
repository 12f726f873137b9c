//! Screen sharing by swapping the outgoing video track in place.
//!
//! Starting a share replaces the camera on the existing video sender; no new
//! offer is created. Stopping puts the camera back. A share can end from two
//! sides: the local toggle, or the capture itself ending. Both go through
//! [`ShareInner::revert`], which runs under one lock and only acts on the
//! share it was started for, so a revert happens once per share.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::error::CallError;
use crate::media::{LocalTrack, MediaDevices};
use crate::peer::PeerConnectionManager;

/// What the local preview shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewSource {
    Camera,
    Screen,
}

struct ActiveShare {
    track: Arc<LocalTrack>,
    generation: u64,
}

struct ShareInner {
    manager: Arc<PeerConnectionManager>,
    devices: Arc<dyn MediaDevices>,
    camera: Arc<LocalTrack>,
    active: Mutex<Option<ActiveShare>>,
    generation: AtomicU64,
    preview: watch::Sender<PreviewSource>,
    reverts: AtomicUsize,
}

impl ShareInner {
    /// Restores the camera. With `generation` set, only reverts if that share
    /// is still the active one.
    async fn revert(&self, generation: Option<u64>) -> Result<bool, CallError> {
        let mut active = self.active.lock().await;
        let share = match active.take() {
            Some(share) if generation.map_or(true, |g| g == share.generation) => share,
            other => {
                *active = other;
                return Ok(false);
            }
        };

        // The share stays active until the sender carries the camera again.
        if let Err(err) = self.manager.replace_track(Arc::clone(&self.camera)).await {
            *active = Some(share);
            return Err(CallError::InvalidState(format!(
                "cannot restore camera: {err}"
            )));
        }
        share.track.stop();
        self.preview.send_replace(PreviewSource::Camera);
        self.reverts.fetch_add(1, Ordering::SeqCst);
        info!(camera = self.camera.id(), "screen share stopped, camera restored");
        Ok(true)
    }
}

#[derive(Clone)]
pub struct ScreenShare {
    inner: Arc<ShareInner>,
}

impl ScreenShare {
    pub fn new(
        manager: Arc<PeerConnectionManager>,
        devices: Arc<dyn MediaDevices>,
        camera: Arc<LocalTrack>,
    ) -> Self {
        let (preview, _) = watch::channel(PreviewSource::Camera);
        Self {
            inner: Arc::new(ShareInner {
                manager,
                devices,
                camera,
                active: Mutex::new(None),
                generation: AtomicU64::new(0),
                preview,
                reverts: AtomicUsize::new(0),
            }),
        }
    }

    /// Captures a screen and sends it instead of the camera. A no-op while a
    /// share is already running.
    pub async fn start(&self) -> Result<(), CallError> {
        let mut active = self.inner.active.lock().await;
        if active.is_some() {
            return Ok(());
        }
        let track = self.inner.devices.display_media().await?;
        if let Err(err) = self.inner.manager.replace_track(Arc::clone(&track)).await {
            track.stop();
            return Err(CallError::InvalidState(format!(
                "cannot share screen: {err}"
            )));
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *active = Some(ActiveShare {
            track: Arc::clone(&track),
            generation,
        });
        self.inner.preview.send_replace(PreviewSource::Screen);
        info!(track = track.id(), "screen share started");

        let weak: Weak<ShareInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            track.ended().await;
            if let Some(inner) = weak.upgrade() {
                if let Err(err) = inner.revert(Some(generation)).await {
                    warn!("revert after capture ended failed: {}", err);
                }
            }
        });
        Ok(())
    }

    /// Returns `true` if a share was running and the camera is back.
    pub async fn stop(&self) -> Result<bool, CallError> {
        self.inner.revert(None).await
    }

    /// Starts or stops sharing; returns whether a share is running afterwards.
    pub async fn toggle(&self) -> Result<bool, CallError> {
        if self.is_sharing() {
            self.stop().await?;
            Ok(false)
        } else {
            self.start().await?;
            Ok(true)
        }
    }

    /// Ends a running capture at call teardown without touching the sender.
    pub async fn shutdown(&self) {
        if let Some(share) = self.inner.active.lock().await.take() {
            share.track.stop();
            self.inner.preview.send_replace(PreviewSource::Camera);
        }
    }

    pub fn is_sharing(&self) -> bool {
        self.preview() == PreviewSource::Screen
    }

    pub fn preview(&self) -> PreviewSource {
        *self.inner.preview.borrow()
    }

    pub fn watch_preview(&self) -> watch::Receiver<PreviewSource> {
        self.inner.preview.subscribe()
    }

    /// How many times the camera has been restored.
    pub fn revert_count(&self) -> usize {
        self.inner.reverts.load(Ordering::SeqCst)
    }

    /// The track currently in the video sender's slot.
    pub fn outgoing_video(&self) -> Option<Arc<LocalTrack>> {
        self.inner.manager.outgoing(crate::media::TrackKind::Video)
    }
}

//! Local media: tracks, capture constraints and the device seam.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{CallError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

/// An outgoing media track. Stopping is one-way; a stopped track can only be
/// replaced, not restarted.
pub struct LocalTrack {
    id: String,
    source: TrackSource,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    live: watch::Sender<bool>,
    samples: AtomicU64,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(source: TrackSource, stream_id: &str) -> Arc<Self> {
        let kind = source.kind();
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };
        let id = format!("{}-{}", kind.as_str(), Uuid::new_v4());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            stream_id.to_string(),
        ));
        let (live, _) = watch::channel(true);
        Arc::new(Self {
            id,
            source,
            rtc,
            enabled: AtomicBool::new(true),
            live,
            samples: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Mutes or unmutes the track without touching the negotiated sender.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    /// Ends the track. Returns `false` if it had already ended.
    pub fn stop(&self) -> bool {
        let was_live = self.live.send_replace(false);
        if was_live {
            debug!(track = %self.id, "local track stopped");
        }
        was_live
    }

    /// Resolves once the track has ended, whether stopped locally or by its
    /// source (for a screen capture: the user revoking the share).
    pub async fn ended(&self) {
        let mut rx = self.live.subscribe();
        let _ = rx.wait_for(|live| !*live).await;
    }

    /// Feeds one encoded sample. Samples on muted or stopped tracks are dropped.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), TransportError> {
        if !self.is_enabled() || !self.is_live() {
            return Ok(());
        }
        self.rtc
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        self.samples.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Samples accepted while the track was enabled and live.
    pub fn samples_sent(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Writes `frame` every `period` until the track ends or is dropped.
    /// Ticks that fall while the track is muted send nothing.
    pub fn spawn_pump(self: &Arc<Self>, frame: Bytes, period: Duration) -> JoinHandle<()> {
        let track = Arc::downgrade(self);
        let ended = wait_ended(self.live.subscribe());
        tokio::spawn(async move {
            tokio::pin!(ended);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut ended => break,
                    _ = ticker.tick() => {}
                }
                let Some(track) = track.upgrade() else { break };
                if let Err(err) = track.write_sample(frame.clone(), period).await {
                    debug!(track = %track.id, "sample write failed: {}", err);
                }
            }
        })
    }
}

async fn wait_ended(mut live: watch::Receiver<bool>) {
    let _ = live.wait_for(|live| !*live).await;
}

/// Opus DTX silence frame.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

const AUDIO_FRAME: Duration = Duration::from_millis(20);
const SCREEN_FRAME_RATE: u32 = 15;

/// A VP8 key frame header for a `width`x`height` picture followed by an
/// empty first partition.
fn vp8_key_frame(width: u32, height: u32) -> Bytes {
    let mut frame = vec![0x50, 0x00, 0x00, 0x9d, 0x01, 0x2a];
    frame.extend_from_slice(&(width as u16 & 0x3fff).to_le_bytes());
    frame.extend_from_slice(&(height as u16 & 0x3fff).to_le_bytes());
    frame.resize(frame.len() + 16, 0);
    Bytes::from(frame)
}

fn frame_period(frame_rate: u32) -> Duration {
    Duration::from_millis(1000 / u64::from(frame_rate.max(1)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

/// What to ask the capture devices for. `None` skips that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: Some(VideoConstraints {
                width: 1280,
                height: 720,
                frame_rate: 30,
            }),
            audio: Some(AudioConstraints {
                echo_cancellation: true,
                noise_suppression: true,
                auto_gain_control: true,
            }),
        }
    }
}

/// Camera and microphone of one participant.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    pub audio: Option<Arc<LocalTrack>>,
    pub video: Option<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

/// Capture device access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Camera and microphone. Refusal maps to [`CallError::MediaAccessDenied`].
    async fn user_media(&self, constraints: &MediaConstraints) -> Result<LocalMedia, CallError>;

    /// A screen or window capture track.
    async fn display_media(&self) -> Result<Arc<LocalTrack>, CallError>;
}

/// Devices that hand out tracks fed with generated frames instead of
/// hardware capture. Used by the headless client and by tests.
#[derive(Debug, Default)]
pub struct SyntheticDevices {
    deny_user_media: AtomicBool,
    deny_display_media: AtomicBool,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_user_media(&self, deny: bool) {
        self.deny_user_media.store(deny, Ordering::SeqCst);
    }

    pub fn deny_display_media(&self, deny: bool) {
        self.deny_display_media.store(deny, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn user_media(&self, constraints: &MediaConstraints) -> Result<LocalMedia, CallError> {
        if self.deny_user_media.load(Ordering::SeqCst) {
            return Err(CallError::MediaAccessDenied(
                "camera and microphone permission refused".to_string(),
            ));
        }
        let stream_id = format!("local-{}", Uuid::new_v4());
        let audio = constraints.audio.map(|_| {
            let track = LocalTrack::new(TrackSource::Microphone, &stream_id);
            track.spawn_pump(Bytes::from_static(&OPUS_SILENCE), AUDIO_FRAME);
            track
        });
        let video = constraints.video.map(|video| {
            let track = LocalTrack::new(TrackSource::Camera, &stream_id);
            track.spawn_pump(
                vp8_key_frame(video.width, video.height),
                frame_period(video.frame_rate),
            );
            track
        });
        Ok(LocalMedia { audio, video })
    }

    async fn display_media(&self) -> Result<Arc<LocalTrack>, CallError> {
        if self.deny_display_media.load(Ordering::SeqCst) {
            return Err(CallError::MediaAccessDenied(
                "screen capture permission refused".to_string(),
            ));
        }
        let track = LocalTrack::new(TrackSource::Screen, &format!("screen-{}", Uuid::new_v4()));
        track.spawn_pump(vp8_key_frame(1920, 1080), frame_period(SCREEN_FRAME_RATE));
        Ok(track)
    }
}

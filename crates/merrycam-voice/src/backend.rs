//! Audio device backends.
//!
//! cpal and rodio streams are not `Send` on every platform, so each real
//! device lives on its own thread and the session holds a [`DeviceHandle`]
//! to it. [`VirtualBackend`] has no hardware at all: tests push microphone
//! frames by hand and drive the playback clock themselves.

use crate::capture::{self, AudioChunk, CaptureConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{self, PlaybackConfig, PlaybackTimeline};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Opens the capture and playback devices for a session.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Open the microphone. Blocks of `config.frame_size` samples are pushed
    /// into `frames`; when the queue is full the block is dropped.
    async fn open_capture(
        &self,
        config: &CaptureConfig,
        frames: mpsc::Sender<AudioChunk>,
    ) -> VoiceResult<DeviceHandle>;

    /// Open the speaker and let it render `timeline`.
    async fn open_playback(
        &self,
        config: &PlaybackConfig,
        timeline: Arc<PlaybackTimeline>,
    ) -> VoiceResult<DeviceHandle>;
}

/// Handle to an open device. Closing is idempotent and also happens on drop.
pub struct DeviceHandle {
    name: String,
    shutdown: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
    open: bool,
}

impl DeviceHandle {
    /// Run `open` on a dedicated thread and keep what it returns alive there
    /// until the handle is closed.
    pub async fn spawn<G, F>(name: &str, open: F) -> VoiceResult<Self>
    where
        F: FnOnce() -> VoiceResult<G> + Send + 'static,
        G: 'static,
    {
        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<()>>();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name(format!("merrycam-{}", name))
            .spawn(move || {
                let guard = match open() {
                    Ok(guard) => {
                        let _ = ready_tx.send(Ok(()));
                        guard
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Err here just means the handle was dropped
                let _ = shutdown_rx.recv();
                drop(guard);
            })?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                name: name.to_string(),
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
                on_close: None,
                open: true,
            }),
            Ok(Err(e)) => {
                join_off_runtime(name, thread).await;
                Err(e)
            }
            Err(_) => {
                join_off_runtime(name, thread).await;
                Err(VoiceError::AudioDevice(format!(
                    "{} thread exited during setup",
                    name
                )))
            }
        }
    }

    /// A handle with no thread behind it; `on_close` runs once on close.
    pub fn detached(name: &str, on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.to_string(),
            shutdown: None,
            thread: None,
            on_close: Some(Box::new(on_close)),
            open: true,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Release the device from async code. The device thread is joined on
    /// the blocking pool so the runtime worker keeps running.
    pub async fn release(&mut self) {
        if !self.open {
            return;
        }
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            join_off_runtime(&self.name, thread).await;
        }
        // still open until here so a drop mid-join finishes through `close`
        self.open = false;
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
        debug!(device = %self.name, "device released");
    }

    /// Release the device and wait for its thread to finish. Blocks the
    /// calling thread; async callers use [`release`](Self::release).
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(device = %self.name, "device thread panicked");
            }
        }
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
        debug!(device = %self.name, "device closed");
    }
}

async fn join_off_runtime(name: &str, thread: thread::JoinHandle<()>) {
    match tokio::task::spawn_blocking(move || thread.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => warn!(device = %name, "device thread panicked"),
        Err(e) => warn!(device = %name, "device join task failed: {}", e),
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.name)
            .field("open", &self.open)
            .finish()
    }
}

/// Host microphone via cpal, host speaker via rodio.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

#[async_trait]
impl AudioBackend for CpalBackend {
    async fn open_capture(
        &self,
        config: &CaptureConfig,
        frames: mpsc::Sender<AudioChunk>,
    ) -> VoiceResult<DeviceHandle> {
        capture::open_cpal_capture(config, frames).await
    }

    async fn open_playback(
        &self,
        config: &PlaybackConfig,
        timeline: Arc<PlaybackTimeline>,
    ) -> VoiceResult<DeviceHandle> {
        playback::open_rodio_output(config, timeline).await
    }
}

#[derive(Default)]
struct VirtualState {
    deny_microphone: bool,
    fail_playback: bool,
    microphone: Option<mpsc::Sender<AudioChunk>>,
    capture_config: Option<CaptureConfig>,
    timeline: Option<Arc<PlaybackTimeline>>,
}

/// Device-free backend for tests and headless demos.
#[derive(Clone, Default)]
pub struct VirtualBackend {
    state: Arc<Mutex<VirtualState>>,
    open_devices: Arc<AtomicUsize>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next captures fail as if the user refused microphone access.
    pub fn deny_microphone(&self, deny: bool) {
        self.state.lock().deny_microphone = deny;
    }

    /// Make the next playback opens fail.
    pub fn fail_playback(&self, fail: bool) {
        self.state.lock().fail_playback = fail;
    }

    /// Push one captured block as the microphone would. Returns false when no
    /// capture device is open or its queue is full.
    pub fn push_frame(&self, samples: Vec<f32>) -> bool {
        let tx = match self.state.lock().microphone.clone() {
            Some(tx) => tx,
            None => return false,
        };
        tx.try_send(AudioChunk::new(samples)).is_ok()
    }

    /// Capture config of the most recently opened microphone.
    pub fn capture_config(&self) -> Option<CaptureConfig> {
        self.state.lock().capture_config.clone()
    }

    /// Timeline of the most recently opened speaker.
    pub fn timeline(&self) -> Option<Arc<PlaybackTimeline>> {
        self.state.lock().timeline.clone()
    }

    /// Devices opened and not yet closed.
    pub fn open_devices(&self) -> usize {
        self.open_devices.load(Ordering::SeqCst)
    }

    pub fn microphone_open(&self) -> bool {
        self.state.lock().microphone.is_some()
    }
}

#[async_trait]
impl AudioBackend for VirtualBackend {
    async fn open_capture(
        &self,
        config: &CaptureConfig,
        frames: mpsc::Sender<AudioChunk>,
    ) -> VoiceResult<DeviceHandle> {
        {
            let mut state = self.state.lock();
            if state.deny_microphone {
                return Err(VoiceError::PermissionDenied(
                    "virtual microphone access denied".to_string(),
                ));
            }
            state.microphone = Some(frames);
            state.capture_config = Some(config.clone());
        }
        self.open_devices.fetch_add(1, Ordering::SeqCst);

        let state = Arc::clone(&self.state);
        let open_devices = Arc::clone(&self.open_devices);
        Ok(DeviceHandle::detached("virtual-capture", move || {
            state.lock().microphone = None;
            open_devices.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    async fn open_playback(
        &self,
        _config: &PlaybackConfig,
        timeline: Arc<PlaybackTimeline>,
    ) -> VoiceResult<DeviceHandle> {
        {
            let mut state = self.state.lock();
            if state.fail_playback {
                return Err(VoiceError::Playback("virtual speaker unavailable".to_string()));
            }
            state.timeline = Some(timeline);
        }
        self.open_devices.fetch_add(1, Ordering::SeqCst);

        let open_devices = Arc::clone(&self.open_devices);
        Ok(DeviceHandle::detached("virtual-playback", move || {
            open_devices.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_handle_closes_once() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let mut handle = DeviceHandle::detached("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.is_open());
        handle.close();
        handle.close();
        drop(handle);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawned_device_reports_setup_failure() {
        let result = DeviceHandle::spawn::<(), _>("broken", || {
            Err(VoiceError::AudioDevice("no such device".to_string()))
        })
        .await;
        assert!(matches!(result, Err(VoiceError::AudioDevice(_))));
    }

    #[tokio::test]
    async fn spawned_device_holds_guard_until_closed() {
        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&dropped);
        let mut handle = DeviceHandle::spawn("guarded", move || Ok(Guard(flag)))
            .await
            .unwrap();
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        handle.close();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(!handle.is_open());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn release_joins_device_thread_without_blocking_runtime() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&dropped);
        let mut handle = DeviceHandle::spawn("slow", move || {
            Ok(on_drop(move || {
                // a slow driver teardown
                thread::sleep(std::time::Duration::from_millis(100));
                flag.fetch_add(1, Ordering::SeqCst);
            }))
        })
        .await
        .unwrap();

        // the single runtime thread must keep ticking while the device shuts down
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            })
        };
        tokio::task::yield_now().await;
        let before = ticks.load(Ordering::SeqCst);

        handle.release().await;
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(!handle.is_open());
        assert!(ticks.load(Ordering::SeqCst) > before + 2);

        // idempotent
        handle.release().await;
        handle.close();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        ticker.abort();
    }

    struct OnDrop<F: FnOnce()>(Option<F>);

    impl<F: FnOnce()> Drop for OnDrop<F> {
        fn drop(&mut self) {
            if let Some(f) = self.0.take() {
                f();
            }
        }
    }

    fn on_drop<F: FnOnce()>(f: F) -> OnDrop<F> {
        OnDrop(Some(f))
    }

    #[tokio::test]
    async fn virtual_microphone_can_be_denied() {
        let backend = VirtualBackend::new();
        backend.deny_microphone(true);
        let (tx, _rx) = mpsc::channel(4);
        let err = backend
            .open_capture(&CaptureConfig::default(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::PermissionDenied(_)));
        assert_eq!(backend.open_devices(), 0);
    }

    #[tokio::test]
    async fn virtual_capture_forwards_frames_until_closed() {
        let backend = VirtualBackend::new();
        let (tx, mut rx) = mpsc::channel(4);
        let mut device = backend
            .open_capture(&CaptureConfig::default(), tx)
            .await
            .unwrap();
        assert_eq!(backend.open_devices(), 1);

        assert!(backend.push_frame(vec![0.0; 8]));
        assert_eq!(rx.recv().await.unwrap().samples.len(), 8);

        device.close();
        assert_eq!(backend.open_devices(), 0);
        assert!(!backend.push_frame(vec![0.0; 8]));
        assert!(rx.recv().await.is_none());
    }
}

//! Session lifecycle manager.
//!
//! Owns at most one duplex session. `start` opens the speaker, the
//! microphone and the remote channel, then wires capture → channel and
//! channel → scheduler. Every way out (explicit `stop`, remote close, remote
//! error) goes through the same teardown, which first takes the session out
//! of the slot so late callbacks see `Idle`.

use crate::backend::{AudioBackend, DeviceHandle};
use crate::capture::{self, AudioChunk, CaptureStats};
use crate::channel::{ChannelEvent, Connector};
use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{PlaybackTimeline, UnitId};
use crate::scheduler::PlaybackScheduler;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Called once when the remote side ends the session.
pub type OnClose = Box<dyn FnOnce() + Send + 'static>;

/// Blocks the device may queue before the encoder; older blocks are never
/// displaced, new ones are dropped.
const CAPTURE_QUEUE: usize = 32;

/// Observable lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Starting,
    Active,
}

enum SessionSlot {
    Idle,
    /// Setup in progress for the session with this id.
    Starting(u64),
    Active(ActiveSession),
}

/// Resources of one running session.
struct ActiveSession {
    id: u64,
    started_at: DateTime<Utc>,
    capture: DeviceHandle,
    playback: DeviceHandle,
    timeline: Arc<PlaybackTimeline>,
    capture_task: JoinHandle<CaptureStats>,
    inbound_task: Option<JoinHandle<()>>,
    io_tasks: Vec<JoinHandle<()>>,
    on_close: Option<OnClose>,
}

/// What is left to do after the synchronous part of teardown.
struct Teardown {
    on_close: Option<OnClose>,
    capture_task: JoinHandle<CaptureStats>,
    inbound_task: Option<JoinHandle<()>>,
}

impl ActiveSession {
    async fn teardown(mut self, reason: &str) -> Teardown {
        info!(session = self.id, reason, "🛑 Stopping voice session");

        // microphone first so no new frames are produced
        self.capture_task.abort();
        self.capture.release().await;

        let cut = self.timeline.close();
        self.playback.release().await;

        for task in self.io_tasks.drain(..) {
            task.abort();
        }

        let elapsed = Utc::now().signed_duration_since(self.started_at);
        info!(
            session = self.id,
            cut_units = cut,
            duration_ms = elapsed.num_milliseconds(),
            "✅ Voice session released"
        );

        Teardown {
            on_close: self.on_close.take(),
            capture_task: self.capture_task,
            inbound_task: self.inbound_task.take(),
        }
    }

    /// Synchronous release for drop paths outside the runtime's control.
    fn abandon(mut self) {
        self.capture_task.abort();
        if let Some(task) = self.inbound_task.take() {
            task.abort();
        }
        for task in self.io_tasks.drain(..) {
            task.abort();
        }
        self.capture.close();
        self.timeline.close();
        self.playback.close();
    }
}

/// Puts the slot back to `Idle` if a start attempt ends without installing
/// its session, including when the start future is dropped mid-setup.
struct StartGuard<'a> {
    slot: &'a Mutex<SessionSlot>,
    id: u64,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if matches!(*slot, SessionSlot::Starting(id) if id == self.id) {
            *slot = SessionSlot::Idle;
            debug!(session = self.id, "Start attempt abandoned");
        }
    }
}

/// Starts and stops the voice assistant's duplex session.
pub struct SessionManager {
    config: VoiceConfig,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn Connector>,
    slot: Arc<Mutex<SessionSlot>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(
        config: VoiceConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            backend,
            connector,
            slot: Arc::new(Mutex::new(SessionSlot::Idle)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn phase(&self) -> SessionPhase {
        match &*self.slot.lock() {
            SessionSlot::Idle => SessionPhase::Idle,
            SessionSlot::Starting(_) => SessionPhase::Starting,
            SessionSlot::Active(_) => SessionPhase::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase() == SessionPhase::Active
    }

    /// Start a session; `false` means nothing was started and start may be
    /// retried. `on_close` runs once if the remote side ends the session.
    pub async fn start<F>(&self, on_close: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.try_start(on_close).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to start voice session: {}", e);
                false
            }
        }
    }

    /// Like [`start`](Self::start) but reports why setup failed.
    pub async fn try_start<F>(&self, on_close: F) -> VoiceResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut slot = self.slot.lock();
            if !matches!(*slot, SessionSlot::Idle) {
                return Err(VoiceError::AlreadyActive);
            }
            *slot = SessionSlot::Starting(id);
        }
        let _guard = StartGuard {
            slot: &self.slot,
            id,
        };

        let (session, go) = self.open_session(id, Box::new(on_close)).await?;

        let session = {
            let mut slot = self.slot.lock();
            if matches!(*slot, SessionSlot::Starting(current) if current == id) {
                *slot = SessionSlot::Active(session);
                None
            } else {
                Some(session)
            }
        };

        match session {
            None => {
                let _ = go.send(());
                info!(session = id, "🎙️ Voice session active");
                Ok(())
            }
            Some(session) => {
                // stop() ran while we were opening
                let teardown = session.teardown("stopped while starting").await;
                abort_tasks(teardown);
                Err(VoiceError::StartCancelled)
            }
        }
    }

    async fn open_session(
        &self,
        id: u64,
        on_close: OnClose,
    ) -> VoiceResult<(ActiveSession, oneshot::Sender<()>)> {
        info!(session = id, "🚀 Starting voice session");

        let (timeline, completions) = PlaybackTimeline::new(self.config.playback_sample_rate);

        let mut playback = self
            .backend
            .open_playback(&self.config.playback_config(), Arc::clone(&timeline))
            .await?;

        let (frame_tx, frame_rx) = mpsc::channel::<AudioChunk>(CAPTURE_QUEUE);
        let mut capture = match self
            .backend
            .open_capture(&self.config.capture_config(), frame_tx)
            .await
        {
            Ok(capture) => capture,
            Err(e) => {
                timeline.close();
                playback.release().await;
                return Err(e);
            }
        };

        let channel = match self
            .connector
            .connect(&self.config.session_setup(), self.config.outbound_queue)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                capture.release().await;
                timeline.close();
                playback.release().await;
                return Err(e);
            }
        };
        let (outbound, inbound, io_tasks) = channel.into_parts();

        let capture_task = tokio::spawn(capture::pump_frames(frame_rx, outbound));

        let (go_tx, go_rx) = oneshot::channel();
        let scheduler = PlaybackScheduler::new(Arc::clone(&timeline), self.config.lag_policy());
        let inbound_task = tokio::spawn(run_inbound(
            id,
            go_rx,
            inbound,
            completions,
            scheduler,
            Arc::clone(&self.slot),
        ));

        Ok((
            ActiveSession {
                id,
                started_at: Utc::now(),
                capture,
                playback,
                timeline,
                capture_task,
                inbound_task: Some(inbound_task),
                io_tasks,
                on_close: Some(on_close),
            },
            go_tx,
        ))
    }

    /// Tear the session down. Safe to call when idle and to call twice.
    ///
    /// Does not run the close callback; that is reserved for remote-initiated
    /// endings.
    pub async fn stop(&self) {
        let session = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, SessionSlot::Idle) {
                SessionSlot::Active(session) => Some(session),
                SessionSlot::Starting(id) => {
                    // the pending start sees its id gone and releases what it opened
                    info!(session = id, "Voice session start cancelled");
                    None
                }
                SessionSlot::Idle => None,
            }
        };

        let Some(session) = session else {
            debug!("stop() with no active session");
            return;
        };

        let teardown = session.teardown("stopped by caller").await;
        teardown.capture_task.abort();
        if let Some(task) = teardown.inbound_task {
            task.abort();
            let _ = task.await;
        }
        let _ = teardown.capture_task.await;
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let taken = std::mem::replace(&mut *self.slot.lock(), SessionSlot::Idle);
        if let SessionSlot::Active(session) = taken {
            session.abandon();
        }
    }
}

fn abort_tasks(teardown: Teardown) {
    teardown.capture_task.abort();
    if let Some(task) = teardown.inbound_task {
        task.abort();
    }
}

/// Inbound side of a session: channel events feed the scheduler, timeline
/// completions prune its active set. Ends the session on remote close/error.
async fn run_inbound(
    session_id: u64,
    go: oneshot::Receiver<()>,
    mut inbound: mpsc::Receiver<ChannelEvent>,
    mut completions: mpsc::UnboundedReceiver<UnitId>,
    mut scheduler: PlaybackScheduler,
    slot: Arc<Mutex<SessionSlot>>,
) {
    if go.await.is_err() {
        return;
    }

    let reason = loop {
        tokio::select! {
            event = inbound.recv() => match event {
                Some(ChannelEvent::Opened) => info!(session = session_id, "Live session opened"),
                Some(ChannelEvent::Message(msg)) => {
                    if msg.setup_complete.is_some() {
                        debug!(session = session_id, "Live setup complete");
                    }
                    let outcome = scheduler.handle_message(&msg);
                    if msg.is_turn_complete() {
                        debug!(session = session_id, active = scheduler.active_len(), "Model turn complete");
                    }
                    if !outcome.scheduled.is_empty() {
                        debug!(
                            session = session_id,
                            units = outcome.scheduled.len(),
                            cursor = scheduler.cursor(),
                            "Model audio scheduled"
                        );
                    }
                }
                Some(ChannelEvent::Closed) => {
                    info!(session = session_id, "Live session closed by remote");
                    break "closed by remote";
                }
                Some(ChannelEvent::Error(e)) => {
                    error!(session = session_id, "Live session error: {}", e);
                    break "remote error";
                }
                None => {
                    warn!(session = session_id, "Live session channel dropped");
                    break "channel dropped";
                }
            },
            Some(id) = completions.recv() => {
                scheduler.complete(id);
            }
        }
    };

    end_remotely(&slot, session_id, reason).await;
}

/// Remote-initiated teardown; runs the close callback exactly once.
async fn end_remotely(slot: &Mutex<SessionSlot>, session_id: u64, reason: &str) {
    let session = {
        let mut slot = slot.lock();
        let ours = matches!(&*slot, SessionSlot::Active(session) if session.id == session_id);
        if ours {
            match std::mem::replace(&mut *slot, SessionSlot::Idle) {
                SessionSlot::Active(session) => Some(session),
                _ => None,
            }
        } else {
            None
        }
    };

    let Some(session) = session else {
        debug!(session = session_id, "Session already released");
        return;
    };

    let teardown = session.teardown(reason).await;
    teardown.capture_task.abort();
    // this task is the inbound task; it finishes on return
    drop(teardown.inbound_task);
    if let Some(on_close) = teardown.on_close {
        on_close();
    }
}

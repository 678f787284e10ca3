//! # Merrycam Voice - Realtime Elf Assistant
//!
//! Full-duplex voice pipeline for the portrait studio's holiday helper. The
//! microphone streams to a live conversational model while the model's
//! spoken replies play back gap-free, and the user can talk over the elf at
//! any time.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Session Manager                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐    │
//! │  │   Mic In     │→ │ PCM16 Encode │→ │  Remote Channel  │    │
//! │  │ (cpal+rubato)│  │  (base64)    │  │ (ws/relay/loop)  │    │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘    │
//! │                                               ↓               │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐    │
//! │  │  Speaker Out │← │   Timeline   │← │    Scheduler     │    │
//! │  │   (rodio)    │  │  (mixer)     │  │ (cursor / barge) │    │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod capture;
pub mod channel;
pub mod config;
pub mod error;
pub mod live;
pub mod pcm;
pub mod playback;
pub mod protocol;
pub mod resample;
pub mod scheduler;
pub mod session;

pub use backend::{AudioBackend, CpalBackend, DeviceHandle, VirtualBackend};
pub use capture::{AudioChunk, CaptureConfig, CapturePipeline, CaptureStats, MicCapture};
pub use channel::{ChannelEvent, Connector, LoopbackConnector, RelayConnector, RemoteChannel, RemotePeer};
pub use config::{ApiKey, Transport, VoiceConfig};
pub use error::{VoiceError, VoiceResult};
pub use live::LiveConnector;
pub use playback::{PlaybackConfig, PlaybackTimeline, UnitId};
pub use protocol::{ClientMessage, ServerMessage, SessionSetup};
pub use resample::CaptureResampler;
pub use scheduler::{LagPolicy, MessageOutcome, PlaybackScheduler, ScheduledUnit};
pub use session::{SessionManager, SessionPhase};

//! Speech provider traits.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioFrame, SampleRate};
use crate::error::Result;
use crate::frame::Transcript;

/// An event from a streaming transcription session.
#[derive(Debug, Clone)]
pub enum SttEvent {
    /// Replaceable hypothesis; later interims supersede earlier ones.
    Interim(Transcript),
    /// Committed hypothesis for the segment just ended.
    Final(Transcript),
}

/// Streaming speech-to-text provider. One session per connected peer.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Open a bidirectional stream. The returned session owns the provider
    /// connection; dropping it tears the connection down.
    async fn open(&self) -> Result<Box<dyn SttSession>>;

    fn provider_name(&self) -> &'static str;
}

/// One live transcription stream.
///
/// The first interim after speech onset must arrive within the configured
/// budget; the driving stage reconnects on a miss.
#[async_trait]
pub trait SttSession: Send {
    /// Feed one chunk of canonical 16kHz mono audio.
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<()>;

    /// Await the next event. `None` means the provider closed the stream.
    async fn next_event(&mut self) -> Result<Option<SttEvent>>;

    /// Force a final for whatever audio has been consumed so far.
    async fn finalize(&mut self) -> Result<Option<Transcript>>;

    async fn close(&mut self) -> Result<()>;
}

/// Streaming text-to-speech provider.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Native output rate of this provider; the pipeline resamples to the
    /// transport rate.
    fn output_rate(&self) -> SampleRate;

    fn provider_name(&self) -> &'static str;

    /// Synthesize one utterance unit, streaming audio frames as they are
    /// produced. Must stop promptly when `cancel` fires and must not send
    /// any frame afterwards.
    async fn synthesize(
        &self,
        text: &str,
        audio_tx: mpsc::Sender<AudioFrame>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

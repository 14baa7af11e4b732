//! Speech player: synthesis plus playback with start/finish signalling

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::playback::AudioSink;
use super::tts::{SpeechOptions, Synthesizer};

/// Default deadline for a synthesis request
pub const DEFAULT_SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress of one `speak` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Audio is ready and about to reach the speaker
    Started,
    /// Playback ran to the end
    Finished,
    /// Synthesis or playback failed
    Failed(String),
}

struct ActivePlayback {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Speaks replies one at a time
///
/// A new `speak` stops whatever is playing first. A stopped playback ends its
/// event stream without `Finished`.
pub struct SpeechPlayer {
    synthesizer: Arc<dyn Synthesizer>,
    sink: Arc<dyn AudioSink>,
    synthesis_timeout: Duration,
    active: Mutex<Option<ActivePlayback>>,
}

impl SpeechPlayer {
    /// Create a player
    #[must_use]
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        sink: Arc<dyn AudioSink>,
        synthesis_timeout: Duration,
    ) -> Self {
        Self {
            synthesizer,
            sink,
            synthesis_timeout,
            active: Mutex::new(None),
        }
    }

    /// Speak `text`, returning a stream of playback events
    ///
    /// Must be called from within a tokio runtime.
    pub fn speak(&self, text: &str, options: SpeechOptions) -> mpsc::Receiver<PlaybackEvent> {
        self.stop();

        let (tx, rx) = mpsc::channel(4);

        if text.trim().is_empty() {
            tracing::debug!("nothing to say");
            let _ = tx.try_send(PlaybackEvent::Finished);
            return rx;
        }

        let cancel = CancellationToken::new();
        let synthesizer = Arc::clone(&self.synthesizer);
        let sink = Arc::clone(&self.sink);
        let timeout = self.synthesis_timeout;
        let text = text.to_string();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let synthesis = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    result = tokio::time::timeout(timeout, synthesizer.synthesize(&text, &options)) => result,
                };

                let audio = match synthesis {
                    Ok(Ok(audio)) => audio,
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "speech synthesis failed");
                        let _ = tx.send(PlaybackEvent::Failed(e.to_string())).await;
                        return;
                    }
                    Err(_) => {
                        tracing::warn!(timeout_secs = timeout.as_secs(), "speech synthesis timed out");
                        let _ = tx
                            .send(PlaybackEvent::Failed("synthesis timed out".to_string()))
                            .await;
                        return;
                    }
                };

                if cancel.is_cancelled() {
                    return;
                }

                let _ = tx.send(PlaybackEvent::Started).await;

                match sink.play(audio, cancel.clone()).await {
                    Ok(()) if cancel.is_cancelled() => {}
                    Ok(()) => {
                        let _ = tx.send(PlaybackEvent::Finished).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "playback failed");
                        let _ = tx.send(PlaybackEvent::Failed(e.to_string())).await;
                    }
                }
            }
        });

        if let Ok(mut active) = self.active.lock() {
            *active = Some(ActivePlayback { cancel, task });
        }

        rx
    }

    /// Stop the current playback; a no-op when idle
    pub fn stop(&self) {
        let previous = self.active.lock().ok().and_then(|mut active| active.take());
        if let Some(playback) = previous {
            if !playback.task.is_finished() {
                tracing::debug!("stopping playback");
            }
            playback.cancel.cancel();
        }
    }
}

impl Drop for SpeechPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{Error, Result};

    #[derive(Default)]
    struct CountingSynth {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Synthesizer for CountingSynth {
        async fn synthesize(&self, text: &str, _options: &SpeechOptions) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text == "fail" {
                return Err(Error::Tts("rejected".to_string()));
            }
            Ok(text.as_bytes().to_vec())
        }
    }

    /// Plays for one second per call unless cancelled
    struct SlowSink;

    #[async_trait]
    impl AudioSink for SlowSink {
        async fn play(&self, _audio: Vec<u8>, cancel: CancellationToken) -> Result<()> {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            Ok(())
        }
    }

    fn player(synth: Arc<CountingSynth>) -> SpeechPlayer {
        SpeechPlayer::new(synth, Arc::new(SlowSink), DEFAULT_SYNTHESIS_TIMEOUT)
    }

    async fn drain(mut rx: mpsc::Receiver<PlaybackEvent>) -> Vec<PlaybackEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_speak_reports_start_then_finish() {
        let player = player(Arc::new(CountingSynth::default()));
        let events = drain(player.speak("hello there", SpeechOptions::default())).await;
        assert_eq!(events, vec![PlaybackEvent::Started, PlaybackEvent::Finished]);
    }

    #[tokio::test]
    async fn test_empty_text_finishes_without_synthesis() {
        let synth = Arc::new(CountingSynth::default());
        let player = player(Arc::clone(&synth));
        let events = drain(player.speak("   ", SpeechOptions::default())).await;
        assert_eq!(events, vec![PlaybackEvent::Finished]);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_synthesis_failure_is_reported() {
        let player = player(Arc::new(CountingSynth::default()));
        let events = drain(player.speak("fail", SpeechOptions::default())).await;
        assert!(matches!(events.as_slice(), [PlaybackEvent::Failed(_)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_speak_while_speaking_stops_previous() {
        let player = player(Arc::new(CountingSynth::default()));
        let mut first = player.speak("first", SpeechOptions::default());
        assert_eq!(first.recv().await, Some(PlaybackEvent::Started));

        let second = player.speak("second", SpeechOptions::default());

        // The interrupted playback closes without finishing
        assert_eq!(first.recv().await, None);
        assert_eq!(
            drain(second).await,
            vec![PlaybackEvent::Started, PlaybackEvent::Finished]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle_is_safe() {
        let player = player(Arc::new(CountingSynth::default()));
        player.stop();
        player.stop();
        assert_eq!(
            drain(player.speak("after stop", SpeechOptions::default())).await,
            vec![PlaybackEvent::Started, PlaybackEvent::Finished]
        );
    }
}

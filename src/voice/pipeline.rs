//! Voice pipeline - JACK audio to node-addressed commands
//!
//! A single consumer thread drains the capture queue, resamples to the
//! recognizer's rate, feeds the streaming recognizer, and routes results
//! through the wake gate and alias table. Commands are published on the
//! event bridge and handed to the dispatcher, which sends them to the local
//! tool registry or a remote node's gateway.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::events::{Event, EventBridge};
use crate::Result;

use super::aliases::{normalize, AliasTable};
use super::capture::CaptureConsumer;
use super::gate::WakeGate;
use super::recognizer::{RecognizerResult, StreamingRecognizer};
use super::resample::StreamResampler;

/// Idle sleep while the capture queue is empty
const IDLE_WAIT: Duration = Duration::from_millis(2);

/// A command extracted from speech, ready for dispatch
#[derive(Debug, Clone, Serialize)]
pub struct VoiceCommandMsg {
    pub target_node: String,
    pub command: String,
    pub raw_text: String,
    pub confidence: f64,
}

/// Receives extracted commands; runs on the pipeline thread, so it must
/// hand heavy work to an executor rather than doing it inline
pub type CommandDispatcher = Box<dyn Fn(VoiceCommandMsg) + Send>;

/// Pipeline counters snapshot
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub chunks_dropped: u64,
    pub transcriptions: u64,
    pub wake_words: u64,
    pub commands: u64,
}

#[derive(Default)]
struct StatsInner {
    frames_captured: AtomicU64,
    chunks_dropped: AtomicU64,
    transcriptions: AtomicU64,
    wake_words: AtomicU64,
    commands: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            transcriptions: self.transcriptions.load(Ordering::Relaxed),
            wake_words: self.wake_words.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the running voice pipeline thread
pub struct VoicePipeline {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<StatsInner>,
}

impl VoicePipeline {
    /// Start the pipeline thread.
    ///
    /// `jack_rate` is the capture-side sample rate; a resampler bridges it
    /// to the recognizer's expected rate.
    ///
    /// # Errors
    ///
    /// Returns an error if the resampler cannot be constructed for the rate
    /// pair.
    pub fn spawn(
        consumer: CaptureConsumer,
        jack_rate: u32,
        recognizer: Box<dyn StreamingRecognizer>,
        gate: WakeGate,
        aliases: AliasTable,
        bridge: EventBridge,
        dispatcher: CommandDispatcher,
    ) -> Result<Self> {
        let resampler = StreamResampler::new(jack_rate, recognizer.target_sample_rate())?;
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(StatsInner::default());

        let worker = Worker {
            consumer,
            resampler,
            recognizer,
            gate,
            aliases,
            bridge,
            dispatcher,
            stop: Arc::clone(&stop),
            stats: Arc::clone(&stats),
        };

        let thread = std::thread::Builder::new()
            .name("skc-voice".to_string())
            .spawn(move || worker.run())
            .map_err(|e| crate::Error::Voice(format!("pipeline thread spawn failed: {e}")))?;

        tracing::info!(jack_rate, "voice pipeline started");

        Ok(Self {
            stop,
            thread: Some(thread),
            stats,
        })
    }

    /// Counters snapshot
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.stats.snapshot()
    }

    /// Stop the pipeline, draining queued audio first
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        tracing::info!("voice pipeline stopped");
    }
}

impl Drop for VoicePipeline {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

struct Worker {
    consumer: CaptureConsumer,
    resampler: StreamResampler,
    recognizer: Box<dyn StreamingRecognizer>,
    gate: WakeGate,
    aliases: AliasTable,
    bridge: EventBridge,
    dispatcher: CommandDispatcher,
    stop: Arc<AtomicBool>,
    stats: Arc<StatsInner>,
}

impl Worker {
    fn run(mut self) {
        let mut resampled: Vec<f32> = Vec::with_capacity(4096);
        let mut pcm: Vec<i16> = Vec::with_capacity(4096);

        loop {
            if let Some(node_id) = self.gate.tick(Instant::now()) {
                self.bridge.publish(Event::WakeTimeout { node_id });
            }

            self.stats
                .frames_captured
                .store(self.consumer.frames_captured(), Ordering::Relaxed);
            self.stats
                .chunks_dropped
                .store(self.consumer.dropped(), Ordering::Relaxed);

            let stopping = self.stop.load(Ordering::Relaxed);

            match self.consumer.pop() {
                Some(chunk) => {
                    resampled.clear();
                    if let Err(e) = self.resampler.process(chunk.samples(), &mut resampled) {
                        tracing::warn!(error = %e, "resample failed, dropping chunk");
                        continue;
                    }
                    if resampled.is_empty() {
                        continue;
                    }

                    convert_to_i16(&resampled, &mut pcm);
                    match self.recognizer.feed(&pcm) {
                        Ok(results) => {
                            for result in results {
                                self.handle_result(&result);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "recognizer feed failed");
                        }
                    }
                }
                None if stopping => break,
                None => std::thread::park_timeout(IDLE_WAIT),
            }
        }

        // Flush the recognizer so a trailing utterance is not lost
        match self.recognizer.finalize() {
            Ok(results) => {
                for result in results {
                    self.handle_result(&result);
                }
            }
            Err(e) => tracing::debug!(error = %e, "recognizer finalize failed"),
        }
    }

    fn handle_result(&mut self, result: &RecognizerResult) {
        let now = Instant::now();

        if result.is_final {
            self.stats.transcriptions.fetch_add(1, Ordering::Relaxed);
        }

        // Any result kind may open the window; partials give faster wake
        if self.gate.window().is_none() {
            if let Some(node_id) = self.gate.observe(&result.text, now) {
                self.stats.wake_words.fetch_add(1, Ordering::Relaxed);
                self.bridge.publish(Event::VoiceWake { node_id });
            }
        }

        if !result.is_final {
            return;
        }
        let Some(window) = self.gate.window().cloned() else {
            return;
        };

        // Command text is whatever follows the wake phrase, or the whole
        // utterance when the phrase arrived in an earlier result.
        let normalized = normalize(&result.text);
        let command_text = match normalized.find(window.phrase.as_str()) {
            Some(idx) => normalized[idx + window.phrase.len()..].trim().to_string(),
            None => normalized,
        };
        if command_text.is_empty() {
            return;
        }

        match self.aliases.resolve(&window.node_id, &command_text) {
            Some(command) => {
                let msg = VoiceCommandMsg {
                    target_node: window.node_id.clone(),
                    command: command.to_string(),
                    raw_text: command_text,
                    confidence: result.confidence,
                };
                tracing::info!(
                    target_node = %msg.target_node,
                    command = %msg.command,
                    confidence = msg.confidence,
                    "voice command extracted"
                );
                self.stats.commands.fetch_add(1, Ordering::Relaxed);
                self.bridge.publish(Event::VoiceCommand {
                    target_node: msg.target_node.clone(),
                    command: msg.command.clone(),
                    raw_text: msg.raw_text.clone(),
                    confidence: msg.confidence,
                });
                (self.dispatcher)(msg);
                self.gate.close();
            }
            None => {
                tracing::debug!(text = %command_text, "no alias matched, window stays open");
            }
        }
    }
}

fn convert_to_i16(samples: &[f32], out: &mut Vec<i16>) {
    out.clear();
    out.extend(samples.iter().map(|&s| {
        #[allow(clippy::cast_possible_truncation)]
        let v = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
        v
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::capture::capture_pair;
    use crate::voice::recognizer::ScriptedRecognizer;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn wake_words() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("indigo".to_string(), "computer indigo".to_string());
        m
    }

    #[tokio::test]
    async fn wake_then_command_in_one_utterance() {
        let bridge = EventBridge::new();
        let mut rx = bridge.subscribe();

        let (sink, consumer) = capture_pair(16);
        let mut recognizer = ScriptedRecognizer::new(16_000);
        recognizer.push_partial(100, "computer indigo");
        recognizer.push_final(200, "computer indigo play", 0.92);

        let dispatched: Arc<Mutex<Vec<VoiceCommandMsg>>> = Arc::new(Mutex::new(Vec::new()));
        let dispatched2 = Arc::clone(&dispatched);

        let pipeline = VoicePipeline::spawn(
            consumer,
            16_000,
            Box::new(recognizer),
            WakeGate::new(&wake_words(), Duration::from_secs(5)),
            AliasTable::with_defaults(),
            bridge.clone(),
            Box::new(move |msg| dispatched2.lock().unwrap().push(msg)),
        )
        .unwrap();

        sink.push(&vec![0.1f32; 512]);

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind(), "voice_wake");

        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match second {
            Event::VoiceCommand {
                target_node,
                command,
                raw_text,
                ..
            } => {
                assert_eq!(target_node, "indigo");
                assert_eq!(command, "jack_transport_start");
                assert_eq!(raw_text, "play");
            }
            other => panic!("expected voice_command, got {}", other.kind()),
        }

        pipeline.shutdown();

        let dispatched = dispatched.lock().unwrap();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].command, "jack_transport_start");
    }

    #[tokio::test]
    async fn window_timeout_emits_wake_timeout() {
        let bridge = EventBridge::new();
        let mut rx = bridge.subscribe();

        let (sink, consumer) = capture_pair(16);
        let mut recognizer = ScriptedRecognizer::new(16_000);
        recognizer.push_final(100, "computer indigo", 0.8);

        let pipeline = VoicePipeline::spawn(
            consumer,
            16_000,
            Box::new(recognizer),
            WakeGate::new(&wake_words(), Duration::from_millis(100)),
            AliasTable::with_defaults(),
            bridge.clone(),
            Box::new(|_| {}),
        )
        .unwrap();

        sink.push(&vec![0.1f32; 256]);

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind(), "voice_wake");

        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.kind(), "wake_timeout");

        pipeline.shutdown();
    }

    #[tokio::test]
    async fn no_command_without_wake() {
        let bridge = EventBridge::new();
        let mut rx = bridge.subscribe();

        let (sink, consumer) = capture_pair(16);
        let mut recognizer = ScriptedRecognizer::new(16_000);
        recognizer.push_final(100, "play", 0.9);

        let pipeline = VoicePipeline::spawn(
            consumer,
            16_000,
            Box::new(recognizer),
            WakeGate::new(&wake_words(), Duration::from_secs(5)),
            AliasTable::with_defaults(),
            bridge.clone(),
            Box::new(|_| {}),
        )
        .unwrap();

        sink.push(&vec![0.1f32; 256]);
        tokio::time::sleep(Duration::from_millis(200)).await;
        pipeline.shutdown();

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stats_track_pipeline_activity() {
        let (sink, consumer) = capture_pair(16);
        let mut recognizer = ScriptedRecognizer::new(16_000);
        recognizer.push_final(50, "computer indigo play", 0.9);

        let pipeline = VoicePipeline::spawn(
            consumer,
            16_000,
            Box::new(recognizer),
            WakeGate::new(&wake_words(), Duration::from_secs(5)),
            AliasTable::with_defaults(),
            EventBridge::new(),
            Box::new(|_| {}),
        )
        .unwrap();

        sink.push(&vec![0.1f32; 256]);
        std::thread::sleep(Duration::from_millis(200));
        let stats = pipeline.stats();
        pipeline.shutdown();

        assert_eq!(stats.frames_captured, 256);
        assert_eq!(stats.transcriptions, 1);
        assert_eq!(stats.wake_words, 1);
        assert_eq!(stats.commands, 1);
    }

    #[test]
    fn i16_conversion_clamps() {
        let mut out = Vec::new();
        convert_to_i16(&[0.0, 1.0, -1.0, 2.0], &mut out);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 32767);
        assert_eq!(out[3], 32767);
        assert!(out[2] <= -32767);
    }
}

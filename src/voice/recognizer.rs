//! Streaming recognizer contract
//!
//! STT engine internals live outside this daemon. The pipeline only needs a
//! way to feed PCM and receive ordered hypothesis updates: any number of
//! partial results followed by exactly one final result per utterance.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// One hypothesis update from the recognizer
#[derive(Debug, Clone)]
pub struct RecognizerResult {
    /// Transcribed text; partials are volatile, finals are committed
    pub text: String,
    /// Whether this result is final for the current utterance
    pub is_final: bool,
    /// Confidence in [0, 1]; partials report 0
    pub confidence: f64,
}

/// Streaming speech recognizer fed by the voice pipeline.
///
/// Implementations must emit per-utterance results in order: partials
/// first, then exactly one final.
pub trait StreamingRecognizer: Send {
    /// PCM sample rate this recognizer expects
    fn target_sample_rate(&self) -> u32;

    /// Feed mono 16-bit PCM; returns any results produced so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the recognizer backend fails; the pipeline logs
    /// and keeps running.
    fn feed(&mut self, pcm: &[i16]) -> Result<Vec<RecognizerResult>>;

    /// Flush the current utterance, returning any remaining results.
    ///
    /// # Errors
    ///
    /// Returns an error if the recognizer backend fails.
    fn finalize(&mut self) -> Result<Vec<RecognizerResult>>;
}

/// Wire shape of results coming back from an external recognizer daemon
#[derive(Debug, Deserialize)]
struct WireResult {
    text: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    confidence: f64,
}

/// Recognizer adapter speaking to an external engine over TCP.
///
/// Outbound: length-prefixed little-endian PCM frames (`u32` byte count,
/// then samples); a zero-length frame requests finalization. Inbound:
/// newline-delimited JSON `{text, is_final, confidence}` objects.
pub struct SocketRecognizer {
    stream: TcpStream,
    sample_rate: u32,
    rx_buf: Vec<u8>,
}

impl SocketRecognizer {
    /// Connect to a recognizer daemon at `endpoint` (host:port).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn connect(endpoint: &str, sample_rate: u32) -> Result<Self> {
        let stream = TcpStream::connect(endpoint)
            .map_err(|e| Error::Recognizer(format!("connect to {endpoint} failed: {e}")))?;
        stream
            .set_read_timeout(Some(Duration::from_millis(1)))
            .map_err(|e| Error::Recognizer(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Recognizer(e.to_string()))?;

        tracing::info!(endpoint, sample_rate, "connected to recognizer");

        Ok(Self {
            stream,
            sample_rate,
            rx_buf: Vec::with_capacity(4096),
        })
    }

    fn send_frame(&mut self, pcm: &[i16]) -> Result<()> {
        let byte_len = u32::try_from(pcm.len() * 2)
            .map_err(|_| Error::Recognizer("pcm frame too large".to_string()))?;
        let mut frame = Vec::with_capacity(4 + pcm.len() * 2);
        frame.extend_from_slice(&byte_len.to_le_bytes());
        for sample in pcm {
            frame.extend_from_slice(&sample.to_le_bytes());
        }
        self.stream
            .write_all(&frame)
            .map_err(|e| Error::Recognizer(format!("send failed: {e}")))
    }

    fn drain_results(&mut self) -> Result<Vec<RecognizerResult>> {
        let mut scratch = [0u8; 4096];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => {
                    return Err(Error::Recognizer("recognizer closed connection".to_string()))
                }
                Ok(n) => self.rx_buf.extend_from_slice(&scratch[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(e) => return Err(Error::Recognizer(format!("recv failed: {e}"))),
            }
        }

        let mut results = Vec::new();
        while let Some(pos) = self.rx_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.rx_buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<WireResult>(line) {
                Ok(wire) => results.push(RecognizerResult {
                    text: wire.text,
                    is_final: wire.is_final,
                    confidence: wire.confidence,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed recognizer result");
                }
            }
        }
        Ok(results)
    }
}

impl StreamingRecognizer for SocketRecognizer {
    fn target_sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn feed(&mut self, pcm: &[i16]) -> Result<Vec<RecognizerResult>> {
        self.send_frame(pcm)?;
        self.drain_results()
    }

    fn finalize(&mut self) -> Result<Vec<RecognizerResult>> {
        self.send_frame(&[])?;
        // Give the engine a moment to flush the final hypothesis
        std::thread::sleep(Duration::from_millis(50));
        self.drain_results()
    }
}

/// Deterministic recognizer that replays a prepared script.
///
/// Each entry becomes available once the cumulative number of fed samples
/// reaches its threshold. Used by tests and for dry-running the pipeline
/// without an STT engine.
pub struct ScriptedRecognizer {
    sample_rate: u32,
    fed: usize,
    script: VecDeque<(usize, RecognizerResult)>,
}

impl ScriptedRecognizer {
    /// Create an empty scripted recognizer at the given sample rate
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            fed: 0,
            script: VecDeque::new(),
        }
    }

    /// Queue a partial result to emit once `after_samples` have been fed
    pub fn push_partial(&mut self, after_samples: usize, text: &str) {
        self.script.push_back((
            after_samples,
            RecognizerResult {
                text: text.to_string(),
                is_final: false,
                confidence: 0.0,
            },
        ));
    }

    /// Queue a final result to emit once `after_samples` have been fed
    pub fn push_final(&mut self, after_samples: usize, text: &str, confidence: f64) {
        self.script.push_back((
            after_samples,
            RecognizerResult {
                text: text.to_string(),
                is_final: true,
                confidence,
            },
        ));
    }
}

impl StreamingRecognizer for ScriptedRecognizer {
    fn target_sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn feed(&mut self, pcm: &[i16]) -> Result<Vec<RecognizerResult>> {
        self.fed += pcm.len();
        let mut out = Vec::new();
        while self
            .script
            .front()
            .is_some_and(|(threshold, _)| *threshold <= self.fed)
        {
            out.push(self.script.pop_front().expect("peeked entry").1);
        }
        Ok(out)
    }

    fn finalize(&mut self) -> Result<Vec<RecognizerResult>> {
        Ok(self.script.drain(..).map(|(_, r)| r).collect())
    }
}

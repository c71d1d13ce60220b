//! TTS/STT broker.
//!
//! Forwards synthesis requests to the configured speech engines (HTTP
//! services, possibly reached through an SSH-forwarded loopback port, or a
//! local process) and transcription requests to the STT engine. Pads
//! 300ms of silence onto synthesized WAVs so the first syllable is not
//! clipped by browser playback ramp-up. Backends are tried in order and
//! circuit-broken after repeated failures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::{Config, SttConfig, TtsBackendConfig};
use crate::error::{PortalError, Result};
use crate::host::{HostExecutor, HostId};

/// Silence prepended to every synthesized WAV.
const SILENCE: Duration = Duration::from_millis(300);
/// Voice list cache lifetime.
const VOICE_CACHE_TTL: Duration = Duration::from_secs(30);

const BREAKER_FAILURES: u32 = 3;
const BREAKER_WINDOW: Duration = Duration::from_secs(30);
const BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

/// One TTS backend.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>>;
    async fn voices(&self) -> Result<Vec<String>>;
    fn name(&self) -> &str;
}

/// HTTP engine: JSON in, WAV bytes out.
pub struct NetworkTts {
    client: reqwest::Client,
    url: String,
}

impl NetworkTts {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }

    fn voices_url(&self) -> String {
        match self.url.rsplit_once('/') {
            Some((base, _)) => format!("{}/voices", base),
            None => format!("{}/voices", self.url),
        }
    }
}

#[async_trait]
impl TtsEngine for NetworkTts {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&serde_json::json!({ "text": text, "voice": voice }))
            .send()
            .await
            .map_err(|e| PortalError::TtsUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PortalError::TtsUnavailable(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PortalError::TtsUnavailable(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn voices(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.voices_url())
            .send()
            .await
            .map_err(|e| PortalError::TtsUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PortalError::TtsUnavailable(format!(
                "voices returned {}",
                response.status()
            )));
        }
        response
            .json::<Vec<String>>()
            .await
            .map_err(|e| PortalError::TtsUnavailable(e.to_string()))
    }

    fn name(&self) -> &str {
        &self.url
    }
}

/// Local process engine: text on stdin, WAV on stdout. `{voice}` in the argv
/// is substituted with the voice id.
pub struct LocalTts {
    command: Vec<String>,
    exec: Arc<HostExecutor>,
}

impl LocalTts {
    pub fn new(command: Vec<String>, exec: Arc<HostExecutor>) -> Self {
        Self { command, exec }
    }
}

#[async_trait]
impl TtsEngine for LocalTts {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        let argv: Vec<String> = self
            .command
            .iter()
            .map(|part| part.replace("{voice}", voice))
            .collect();
        let out = self
            .exec
            .run(&HostId::Local, &argv, Some(text.as_bytes()))
            .await
            .map_err(|e| PortalError::TtsUnavailable(e.to_string()))?;
        if !out.success() {
            return Err(PortalError::TtsUnavailable(format!(
                "{} exited {}: {}",
                argv[0],
                out.exit,
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }

    async fn voices(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or("local")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Three consecutive failures inside the window open the breaker; after the
/// cooldown one probe call is let through.
#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    failures: u32,
    first_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            first_failure: None,
            opened_at: None,
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if self
                    .opened_at
                    .map(|t| now.duration_since(t) >= BREAKER_COOLDOWN)
                    .unwrap_or(true)
                {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            // A probe is already in flight.
            BreakerState::HalfOpen => false,
        }
    }

    fn record_success(&mut self) {
        *self = Self::new();
    }

    fn record_failure(&mut self, now: Instant) {
        if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Open;
            self.opened_at = Some(now);
            return;
        }
        match self.first_failure {
            Some(first) if now.duration_since(first) <= BREAKER_WINDOW => {
                self.failures += 1;
            }
            _ => {
                self.first_failure = Some(now);
                self.failures = 1;
            }
        }
        if self.failures >= BREAKER_FAILURES {
            self.state = BreakerState::Open;
            self.opened_at = Some(now);
        }
    }
}

struct TtsSlot {
    engine: Box<dyn TtsEngine>,
    breaker: Mutex<Breaker>,
}

/// Routes audio between agents, browsers, and the speech engines.
pub struct SpeechBroker {
    tts: Vec<TtsSlot>,
    stt: Option<SttConfig>,
    transcoder: Vec<String>,
    client: reqwest::Client,
    exec: Arc<HostExecutor>,
    tts_deadline: Duration,
    stt_deadline: Duration,
    voice_cache: Mutex<Option<(Instant, Vec<String>)>>,
}

impl SpeechBroker {
    pub fn new(config: &Config, exec: Arc<HostExecutor>) -> Self {
        let client = reqwest::Client::new();
        let tts = config
            .services
            .tts
            .iter()
            .map(|backend| {
                let engine: Box<dyn TtsEngine> = match backend {
                    TtsBackendConfig::Network { url, .. } => {
                        Box::new(NetworkTts::new(client.clone(), url.clone()))
                    }
                    TtsBackendConfig::Local { command } => {
                        Box::new(LocalTts::new(command.clone(), Arc::clone(&exec)))
                    }
                };
                TtsSlot {
                    engine,
                    breaker: Mutex::new(Breaker::new()),
                }
            })
            .collect();
        Self {
            tts,
            stt: config.services.stt.clone(),
            transcoder: default_transcoder(&config.services.transcoder),
            client,
            exec,
            tts_deadline: config.timeouts.tts(),
            stt_deadline: config.timeouts.stt(),
            voice_cache: Mutex::new(None),
        }
    }

    /// Synthesize text, trying backends in order. The returned WAV carries a
    /// 300ms silence prefix.
    pub async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        if self.tts.is_empty() {
            return Err(PortalError::TtsUnavailable("no tts backend configured".into()));
        }
        let mut last_error = None;
        for slot in &self.tts {
            if !slot.breaker.lock().await.allow(Instant::now()) {
                continue;
            }
            match tokio::time::timeout(self.tts_deadline, slot.engine.synthesize(text, voice)).await
            {
                Ok(Ok(wav)) => {
                    slot.breaker.lock().await.record_success();
                    return Ok(prepend_silence(&wav, SILENCE));
                }
                Ok(Err(e)) => {
                    tracing::warn!("tts backend {} failed: {}", slot.engine.name(), e);
                    slot.breaker.lock().await.record_failure(Instant::now());
                    last_error = Some(e);
                }
                Err(_) => {
                    tracing::warn!("tts backend {} timed out", slot.engine.name());
                    slot.breaker.lock().await.record_failure(Instant::now());
                    last_error = Some(PortalError::TtsUnavailable(format!(
                        "{} timed out",
                        slot.engine.name()
                    )));
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| PortalError::TtsUnavailable("all tts backends circuit-open".into())))
    }

    /// Transcribe audio to text. Empty text after trimming is an empty
    /// result, not an error.
    pub async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<String> {
        let stt = self
            .stt
            .as_ref()
            .ok_or_else(|| PortalError::SttUnavailable("no stt engine configured".into()))?;

        let wav = if needs_transcode(audio, mime) {
            let out = self
                .exec
                .run(&HostId::Local, &self.transcoder, Some(audio))
                .await
                .map_err(|e| PortalError::SttUnavailable(format!("transcode: {}", e)))?;
            if !out.success() {
                return Err(PortalError::SttUnavailable(format!(
                    "transcoder exited {}: {}",
                    out.exit,
                    out.stderr.trim()
                )));
            }
            out.stdout
        } else {
            audio.to_vec()
        };

        let send = self
            .client
            .post(stt.url.clone())
            .header("content-type", "audio/wav")
            .body(wav)
            .send();
        let response = tokio::time::timeout(self.stt_deadline, send)
            .await
            .map_err(|_| PortalError::SttUnavailable("stt engine timed out".into()))?
            .map_err(|e| PortalError::SttUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PortalError::SttUnavailable(format!(
                "stt engine returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PortalError::SttUnavailable(e.to_string()))?;
        let text = body
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string();
        Ok(text)
    }

    /// Voice list, cached for 30s. A stale cache beats an error.
    pub async fn voices(&self) -> Result<Vec<String>> {
        {
            let cache = self.voice_cache.lock().await;
            if let Some((at, voices)) = cache.as_ref() {
                if at.elapsed() < VOICE_CACHE_TTL {
                    return Ok(voices.clone());
                }
            }
        }

        for slot in &self.tts {
            match slot.engine.voices().await {
                Ok(voices) if !voices.is_empty() => {
                    let mut cache = self.voice_cache.lock().await;
                    *cache = Some((Instant::now(), voices.clone()));
                    return Ok(voices);
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!("voice query via {} failed: {}", slot.engine.name(), e);
                }
            }
        }

        let cache = self.voice_cache.lock().await;
        if let Some((_, voices)) = cache.as_ref() {
            return Ok(voices.clone());
        }
        Ok(Vec::new())
    }
}

fn default_transcoder(configured: &[String]) -> Vec<String> {
    if configured.is_empty() {
        vec![
            "ffmpeg".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            "pipe:0".to_string(),
            "-ar".to_string(),
            "16000".to_string(),
            "-ac".to_string(),
            "1".to_string(),
            "-f".to_string(),
            "wav".to_string(),
            "pipe:1".to_string(),
        ]
    } else {
        configured.to_vec()
    }
}

/// 16-kHz mono PCM WAVs pass through untouched; everything else transcodes.
fn needs_transcode(audio: &[u8], mime: &str) -> bool {
    if !mime.contains("wav") && !mime.contains("x-wav") {
        return true;
    }
    match parse_wav(audio) {
        Some(parsed) => parsed.fmt.sample_rate != 16_000 || parsed.fmt.channels != 1,
        None => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WavFmt {
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
}

struct ParsedWav {
    fmt: WavFmt,
    data_offset: usize,
    data_len: usize,
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(bytes.get(at..at + 2)?.try_into().ok()?))
}

fn parse_wav(bytes: &[u8]) -> Option<ParsedWav> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return None;
    }
    let mut fmt = None;
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = read_u32(bytes, pos + 4)? as usize;
        let body = pos + 8;
        match id {
            b"fmt " => {
                fmt = Some(WavFmt {
                    channels: read_u16(bytes, body + 2)?,
                    sample_rate: read_u32(bytes, body + 4)?,
                    bits_per_sample: read_u16(bytes, body + 14)?,
                });
            }
            b"data" => {
                return Some(ParsedWav {
                    fmt: fmt?,
                    data_offset: body,
                    data_len: size.min(bytes.len().saturating_sub(body)),
                });
            }
            _ => {}
        }
        // Chunks are word-aligned.
        pos = body + size + (size & 1);
    }
    None
}

/// Insert silence at the head of the data chunk, patching RIFF/data sizes.
/// Unparseable input is returned unchanged.
fn prepend_silence(wav: &[u8], duration: Duration) -> Vec<u8> {
    let Some(parsed) = parse_wav(wav) else {
        return wav.to_vec();
    };
    let frame = usize::from(parsed.fmt.channels) * usize::from(parsed.fmt.bits_per_sample / 8);
    if frame == 0 {
        return wav.to_vec();
    }
    let mut silence_len =
        (parsed.fmt.sample_rate as u128 * duration.as_millis() / 1000) as usize * frame;
    silence_len -= silence_len % frame;

    let mut out = Vec::with_capacity(wav.len() + silence_len);
    out.extend_from_slice(&wav[..parsed.data_offset]);
    out.resize(parsed.data_offset + silence_len, 0);
    out.extend_from_slice(&wav[parsed.data_offset..]);

    let new_data_len = (parsed.data_len + silence_len) as u32;
    out[parsed.data_offset - 4..parsed.data_offset].copy_from_slice(&new_data_len.to_le_bytes());
    let riff_len = (out.len() - 8) as u32;
    out[4..8].copy_from_slice(&riff_len.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal canonical 44-byte-header WAV.
    fn wav(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let bits: u16 = 16;
        let data_len = (samples.len() * 2) as u32;
        let byte_rate = sample_rate * u32::from(channels) * u32::from(bits / 8);
        let block_align = channels * (bits / 8);
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    #[test]
    fn parse_wav_reads_fmt_and_data() {
        let bytes = wav(16_000, 1, &[1, 2, 3]);
        let parsed = parse_wav(&bytes).unwrap();
        assert_eq!(parsed.fmt.sample_rate, 16_000);
        assert_eq!(parsed.fmt.channels, 1);
        assert_eq!(parsed.data_offset, 44);
        assert_eq!(parsed.data_len, 6);
    }

    #[test]
    fn silence_prefix_has_expected_length() {
        let bytes = wav(16_000, 1, &[100, 200]);
        let padded = prepend_silence(&bytes, Duration::from_millis(300));
        // 300ms at 16kHz mono 16-bit = 4800 frames = 9600 bytes.
        assert_eq!(padded.len(), bytes.len() + 9600);
        let parsed = parse_wav(&padded).unwrap();
        assert_eq!(parsed.data_len, 6 + 9600);
        // Original samples survive after the silence.
        assert_eq!(&padded[44 + 9600..44 + 9600 + 2], &100i16.to_le_bytes());
        // RIFF size patched.
        assert_eq!(read_u32(&padded, 4).unwrap() as usize, padded.len() - 8);
    }

    #[test]
    fn garbage_passes_through_unpadded() {
        let garbage = b"not a wav".to_vec();
        assert_eq!(prepend_silence(&garbage, Duration::from_millis(300)), garbage);
    }

    #[test]
    fn transcode_detection() {
        let pcm16k = wav(16_000, 1, &[0]);
        let pcm48k = wav(48_000, 2, &[0]);
        assert!(!needs_transcode(&pcm16k, "audio/wav"));
        assert!(needs_transcode(&pcm48k, "audio/wav"));
        assert!(needs_transcode(&pcm16k, "audio/webm"));
        assert!(needs_transcode(b"junk", "audio/wav"));
    }

    #[test]
    fn breaker_opens_after_three_failures() {
        let mut b = Breaker::new();
        let now = Instant::now();
        assert!(b.allow(now));
        b.record_failure(now);
        b.record_failure(now);
        assert!(b.allow(now));
        b.record_failure(now);
        assert!(!b.allow(now));
    }

    #[test]
    fn breaker_half_opens_after_cooldown() {
        let mut b = Breaker::new();
        let now = Instant::now();
        for _ in 0..3 {
            b.record_failure(now);
        }
        assert!(!b.allow(now));
        let later = now + BREAKER_COOLDOWN;
        // One probe allowed, a second concurrent one is not.
        assert!(b.allow(later));
        assert!(!b.allow(later));
        // Failed probe re-opens; success closes.
        b.record_failure(later);
        assert!(!b.allow(later + Duration::from_secs(1)));
        b.record_success();
        assert!(b.allow(later + Duration::from_secs(2)));
    }

    #[test]
    fn slow_failures_outside_window_do_not_open() {
        let mut b = Breaker::new();
        let start = Instant::now();
        b.record_failure(start);
        b.record_failure(start + BREAKER_WINDOW + Duration::from_secs(1));
        b.record_failure(start + (BREAKER_WINDOW + Duration::from_secs(1)) * 2);
        assert!(b.allow(start + (BREAKER_WINDOW + Duration::from_secs(2)) * 2));
    }

    #[test]
    fn voices_url_derivation() {
        let engine = NetworkTts::new(reqwest::Client::new(), "http://127.0.0.1:5002/synthesize".into());
        assert_eq!(engine.voices_url(), "http://127.0.0.1:5002/voices");
    }
}

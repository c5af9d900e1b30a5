use hound::{ SampleFormat, WavSpec, WavWriter };
use log::{ debug, info, warn };
use rodio::buffer::SamplesBuffer;
use rodio::mixer::Mixer;
use rodio::{ OutputStreamBuilder, Sink };
use std::path::PathBuf;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ mpsc, Arc };
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::pcm::AudioBuffer;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("playback already stopped")]
    AlreadyStopped,
    #[error("audio engine unavailable: {0}")]
    Unavailable(String),
    #[error("failed to write audio: {0}")]
    Wav(#[from] hound::Error),
}

/// Control side of one started playback.
pub trait PlaybackControl: Send {
    fn stop(&mut self) -> Result<(), OutputError>;
}

/// A started playback. `finished` resolves with `Ok(())` only on natural
/// end-of-audio; it errors when the playback is stopped or torn down.
pub struct PlaybackHandle {
    pub control: Box<dyn PlaybackControl>,
    pub finished: oneshot::Receiver<()>,
}

/// The audio device. Held by exactly one playback controller.
pub trait AudioEngine: Send {
    fn start(&mut self, buffer: &AudioBuffer, label: &str) -> Result<PlaybackHandle, OutputError>;

    fn close(&mut self) {}
}

pub type EngineFactory = Box<
    dyn (Fn() -> Result<Box<dyn AudioEngine>, OutputError>) + Send + Sync
>;

struct TimedPlayback {
    task: Option<JoinHandle<()>>,
}

impl PlaybackControl for TimedPlayback {
    fn stop(&mut self) -> Result<(), OutputError> {
        match self.task.take() {
            Some(task) => {
                task.abort();
                Ok(())
            }
            None => Err(OutputError::AlreadyStopped),
        }
    }
}

struct SinkPlayback {
    sink: Arc<Sink>,
    stopped: Arc<AtomicBool>,
}

impl PlaybackControl for SinkPlayback {
    fn stop(&mut self) -> Result<(), OutputError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(OutputError::AlreadyStopped);
        }
        self.sink.stop();
        Ok(())
    }
}

/// The default output device. The device stream lives on its own thread
/// until the engine is closed or dropped; playbacks attach a `Sink` to its
/// mixer.
pub struct RodioOutput {
    mixer: Mixer,
    release: Option<mpsc::Sender<()>>,
}

impl RodioOutput {
    pub fn open() -> Result<Self, OutputError> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        std::thread::Builder
            ::new()
            .name("audio-output".to_string())
            .spawn(move || {
                match OutputStreamBuilder::open_default_stream() {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(stream.mixer().clone()));
                        // Held until the engine lets go of `release_tx`.
                        let _ = release_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                    }
                }
            })
            .map_err(|e| OutputError::Unavailable(e.to_string()))?;

        let mixer = ready_rx
            .recv()
            .map_err(|e| OutputError::Unavailable(e.to_string()))?
            .map_err(OutputError::Unavailable)?;
        info!("Audio output device opened");
        Ok(Self { mixer, release: Some(release_tx) })
    }
}

impl AudioEngine for RodioOutput {
    fn start(&mut self, buffer: &AudioBuffer, label: &str) -> Result<PlaybackHandle, OutputError> {
        let (done_tx, done_rx) = oneshot::channel();
        let stopped = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(Sink::connect_new(&self.mixer));

        if buffer.is_empty() {
            let _ = done_tx.send(());
        } else {
            debug!("Playing '{}' ({:?})", label, buffer.duration());
            sink.append(SamplesBuffer::new(buffer.channels, buffer.sample_rate, buffer.samples.clone()));
            let sink = Arc::clone(&sink);
            let stopped = Arc::clone(&stopped);
            tokio::task::spawn_blocking(move || {
                sink.sleep_until_end();
                if !stopped.load(Ordering::SeqCst) {
                    let _ = done_tx.send(());
                }
            });
        }

        Ok(PlaybackHandle {
            control: Box::new(SinkPlayback { sink, stopped }),
            finished: done_rx,
        })
    }

    fn close(&mut self) {
        if self.release.take().is_some() {
            info!("Audio output device released");
        }
    }
}

/// Speaker when one is available, silent timing otherwise. With `audio_out`
/// every playback is written to a WAV file instead.
pub fn default_factory(audio_out: Option<PathBuf>) -> EngineFactory {
    match audio_out {
        Some(dir) =>
            Box::new(move || -> Result<Box<dyn AudioEngine>, OutputError> {
                Ok(Box::new(WavRecorder::new(&dir)?))
            }),
        None =>
            Box::new(|| -> Result<Box<dyn AudioEngine>, OutputError> {
                match RodioOutput::open() {
                    Ok(output) => Ok(Box::new(output)),
                    Err(e) => {
                        warn!("{}; replies will not be audible", e);
                        Ok(Box::new(ClockOutput))
                    }
                }
            }),
    }
}

/// Plays nothing audible; a playback lasts as long as its buffer would.
#[derive(Debug, Default)]
pub struct ClockOutput;

impl AudioEngine for ClockOutput {
    fn start(&mut self, buffer: &AudioBuffer, label: &str) -> Result<PlaybackHandle, OutputError> {
        let duration = buffer.duration();
        debug!("ClockOutput playing '{}' for {:?}", label, duration);
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = done_tx.send(());
        });
        Ok(PlaybackHandle {
            control: Box::new(TimedPlayback { task: Some(task) }),
            finished: done_rx,
        })
    }
}

/// Writes every played buffer to `<dir>/<label>.wav`, then times it like
/// [`ClockOutput`].
#[derive(Debug)]
pub struct WavRecorder {
    dir: PathBuf,
    clock: ClockOutput,
}

impl WavRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, OutputError> {
        let dir = dir.into();
        std::fs
            ::create_dir_all(&dir)
            .map_err(|e| OutputError::Unavailable(format!("{}: {}", dir.display(), e)))?;
        Ok(Self { dir, clock: ClockOutput })
    }

    fn path_for(&self, label: &str) -> PathBuf {
        let name: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.wav", name))
    }

    fn write(&self, buffer: &AudioBuffer, label: &str) -> Result<PathBuf, OutputError> {
        let path = self.path_for(label);
        let spec = WavSpec {
            channels: buffer.channels,
            sample_rate: buffer.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec)?;
        for sample in &buffer.samples {
            let value = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            writer.write_sample(value)?;
        }
        writer.finalize()?;
        Ok(path)
    }
}

impl AudioEngine for WavRecorder {
    fn start(&mut self, buffer: &AudioBuffer, label: &str) -> Result<PlaybackHandle, OutputError> {
        let path = self.write(buffer, label)?;
        info!("Speech for '{}' written to {}", label, path.display());
        self.clock.start(buffer, label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::decode_pcm16;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn clock_output_finishes_after_buffer_duration() {
        let buffer = decode_pcm16(&vec![0u8; 4_800]).unwrap();
        let mut engine = ClockOutput;
        let handle = engine.start(&buffer, "m1").unwrap();
        let started = tokio::time::Instant::now();
        handle.finished.await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_playback_never_reports_natural_end() {
        let buffer = decode_pcm16(&vec![0u8; 48_000]).unwrap();
        let mut engine = ClockOutput;
        let mut handle = engine.start(&buffer, "m1").unwrap();
        handle.control.stop().unwrap();
        assert!(handle.finished.await.is_err());
        assert!(matches!(handle.control.stop(), Err(OutputError::AlreadyStopped)));
    }

    #[tokio::test]
    async fn default_factory_always_yields_an_engine() {
        let factory = default_factory(None);
        let mut engine = factory().unwrap();
        let handle = engine.start(&decode_pcm16(&[]).unwrap(), "empty").unwrap();
        assert!(handle.finished.await.is_ok());
        engine.close();
    }

    #[tokio::test]
    async fn default_factory_records_when_a_directory_is_given() {
        let dir = std::env::temp_dir().join(format!("school-buddy-wav-{}", uuid::Uuid::new_v4()));
        let factory = default_factory(Some(dir.clone()));
        let mut engine = factory().unwrap();
        let mut handle = engine.start(&decode_pcm16(&[0x00, 0x40]).unwrap(), "m1").unwrap();
        let _ = handle.control.stop();
        assert!(dir.join("m1.wav").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn wav_recorder_writes_pcm16_file() {
        let dir = std::env::temp_dir().join(format!("school-buddy-wav-{}", uuid::Uuid::new_v4()));
        let mut engine = WavRecorder::new(&dir).unwrap();
        let buffer = decode_pcm16(&[0x00, 0x00, 0x00, 0x80, 0x00, 0x40]).unwrap();
        let mut handle = engine.start(&buffer, "msg/1").unwrap();
        let _ = handle.control.stop();

        let mut reader = hound::WavReader::open(dir.join("msg_1.wav")).unwrap();
        assert_eq!(reader.spec().sample_rate, 24_000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![0, i16::MIN, 0x4000]);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

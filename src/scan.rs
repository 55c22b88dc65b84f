//! LED scan controller
//!
//! Lights one LED at a time, photographs it and records the brightest spot.
//!
//! Two tasks cooperate through single-slot channels:
//! - the illumination task owns the link and the [`ScanSession`]. On every
//!   tick it sends the buffer for the current LED, waits half a tick for the
//!   LED and camera to settle, then signals the main task.
//! - the main task owns the camera and the output stream. On each signal it
//!   captures and localizes one frame, appends the sample and acknowledges.
//!
//! The next LED is only lit after the acknowledgement, so a slow camera delays
//! the scan instead of letting illumination run ahead of capture. Link writes
//! and frame captures block, so both run on the blocking pool with the device
//! moved in and handed back.

use std::future::Future;
use std::io::{self, Write};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::capture::FrameSource;
use crate::config::ScanSettings;
use crate::coords::CoordinateWriter;
use crate::detect::{coerce_radius, BrightSpotDetector};
use crate::link::{FailureTracker, LightLink};
use crate::transform::Point;

/// Bytes per LED in the illumination buffer
const BYTES_PER_LED: usize = 3;

/// Longest strip the controller addresses
pub const MAX_LEDS_PER_STRIP: usize = 10_000;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid scan configuration: {0}")]
    InvalidConfig(String),

    #[error("camera unavailable at LED {index}")]
    CameraUnavailable {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("no usable frame for LED {index} after {attempts} attempts")]
    NoSpot { index: usize, attempts: u32 },

    #[error("cannot write sample for LED {index}")]
    Output {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("illumination task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub leds_per_strip: usize,
    pub strip_count: usize,
    pub brightness: u8,
    pub tick_interval: Duration,
    /// Strip to start at (0-based)
    pub start_at_index: usize,
    /// Blur kernel size, coerced odd and at least 1
    pub blur_radius: u32,
    /// Empty frames tolerated per LED
    pub capture_retries: u32,
}

impl ScanConfig {
    pub fn from_settings(settings: &ScanSettings) -> Result<Self, ScanError> {
        if settings.start_pin == 0 {
            return Err(ScanError::InvalidConfig("start pin is 1-based".into()));
        }
        let config = Self {
            leds_per_strip: settings.leds,
            strip_count: settings.pins,
            brightness: settings.brightness,
            tick_interval: Duration::from_millis(settings.delay_ms),
            start_at_index: settings.start_pin - 1,
            blur_radius: coerce_radius(settings.radius),
            capture_retries: settings.capture_retries,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.leds_per_strip == 0 || self.strip_count == 0 {
            return Err(ScanError::InvalidConfig(format!(
                "need at least one LED and one strip (got {} x {})",
                self.leds_per_strip, self.strip_count
            )));
        }
        if self.leds_per_strip > MAX_LEDS_PER_STRIP {
            return Err(ScanError::InvalidConfig(format!(
                "{} LEDs per strip, the limit is {}",
                self.leds_per_strip, MAX_LEDS_PER_STRIP
            )));
        }
        if self.brightness == 0 {
            return Err(ScanError::InvalidConfig("brightness must be 1-255".into()));
        }
        if self.start_at_index >= self.strip_count {
            return Err(ScanError::InvalidConfig(format!(
                "start pin {} is past the last pin {}",
                self.start_at_index + 1,
                self.strip_count
            )));
        }
        if self.tick_interval.is_zero() {
            return Err(ScanError::InvalidConfig("tick interval must be positive".into()));
        }
        Ok(())
    }
}

/// Position within the illumination buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSession {
    /// Byte offset of the lit LED, a multiple of 3
    counter: usize,
    /// Buffer length: strips x LEDs x 3
    total: usize,
    brightness: u8,
    /// LED the scan started (or resumed) at
    start: usize,
}

impl ScanSession {
    pub fn new(config: &ScanConfig) -> Self {
        let start = config.start_at_index * config.leds_per_strip;
        Self {
            counter: start * BYTES_PER_LED,
            total: config.leds_per_strip * config.strip_count * BYTES_PER_LED,
            brightness: config.brightness,
            start,
        }
    }

    pub fn start_index(&self) -> usize {
        self.start
    }

    /// Absolute index of the LED currently addressed
    pub fn led_index(&self) -> usize {
        self.counter / BYTES_PER_LED
    }

    pub fn led_count(&self) -> usize {
        self.total / BYTES_PER_LED
    }

    pub fn is_done(&self) -> bool {
        self.counter >= self.total
    }

    /// Buffer lighting only the current LED
    pub fn illumination_buffer(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.total];
        let end = (self.counter + BYTES_PER_LED).min(self.total);
        if self.counter < end {
            buf[self.counter..end].fill(self.brightness);
        }
        buf
    }

    /// Move to the next LED, returning true once every LED has been lit
    pub fn advance(&mut self) -> bool {
        self.counter += BYTES_PER_LED;
        self.is_done()
    }
}

/// Sent by the illumination task once an LED has settled
#[derive(Debug, Clone, Copy)]
struct Settled {
    led: usize,
    last: bool,
}

/// Result of a scan that ended normally or by interruption
#[derive(Debug)]
pub struct ScanOutcome {
    /// One sample per captured LED, in scan order
    pub samples: Vec<Point>,
    /// True if the scan was stopped before the last LED
    pub interrupted: bool,
    /// Link writes that failed and were skipped
    pub link_failures: u64,
    /// Session state when the scan stopped
    pub session: ScanSession,
}

pub struct ScanController<L, F> {
    config: ScanConfig,
    link: L,
    capture: Capture<F>,
}

/// Camera plus detector, moved onto the blocking pool for each LED
struct Capture<F> {
    source: F,
    detector: BrightSpotDetector,
    retries: u32,
}

impl<L, F> ScanController<L, F>
where
    L: LightLink + Send + 'static,
    F: FrameSource + Send + 'static,
{
    pub fn new(config: ScanConfig, link: L, source: F) -> Result<Self, ScanError> {
        config.validate()?;
        let capture = Capture {
            source,
            detector: BrightSpotDetector::new(config.blur_radius as i64),
            retries: config.capture_retries,
        };
        Ok(Self {
            config,
            link,
            capture,
        })
    }

    /// Run the scan until every LED is captured or `shutdown` resolves
    ///
    /// Samples are appended to `out` as they are captured, so they survive a
    /// fatal error part way through.
    pub async fn run<W, S>(
        self,
        out: &mut CoordinateWriter<W>,
        shutdown: S,
    ) -> Result<ScanOutcome, ScanError>
    where
        W: Write,
        S: Future<Output = ()>,
    {
        let session = ScanSession::new(&self.config);
        let total = session.led_count();
        info!(
            "Scanning {} pins x {} LEDs from LED {} with {:?} per LED",
            self.config.strip_count,
            self.config.leds_per_strip,
            session.led_index(),
            self.config.tick_interval
        );

        let (settled_tx, mut settled_rx) = mpsc::channel::<Settled>(1);
        let (ack_tx, ack_rx) = mpsc::channel::<()>(1);
        let illumination = tokio::spawn(illuminate(
            self.link,
            session,
            self.config.tick_interval,
            settled_tx,
            ack_rx,
        ));

        tokio::pin!(shutdown);
        let mut capture = self.capture;
        let mut samples = Vec::new();
        let mut interrupted = false;

        let result = loop {
            let settled = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Scan interrupted after {} samples", samples.len());
                    interrupted = true;
                    break Ok(());
                }
                msg = settled_rx.recv() => msg,
            };
            let Some(Settled { led, last }) = settled else {
                break Ok(());
            };

            // The illumination task is parked on the acknowledgement until
            // this capture has finished.
            let job = tokio::task::spawn_blocking(move || {
                let located = capture.locate(led);
                (capture, located)
            });
            let point = match job.await {
                Ok((returned, Ok(p))) => {
                    capture = returned;
                    p
                }
                Ok((_, Err(e))) => break Err(e),
                Err(e) => break Err(task_failed(e)),
            };

            if let Err(source) = out.write_point(point).and_then(|_| out.flush()) {
                break Err(ScanError::Output { index: led, source });
            }
            samples.push(point);
            info!("LED {}/{}: {} x {}", led + 1, total, point.x, point.y);

            if last {
                info!("Finished sequence, {} samples", samples.len());
                break Ok(());
            }
            // An interrupt during the capture must be seen before the next LED
            // is released.
            let stop = tokio::select! {
                biased;
                _ = &mut shutdown => true,
                _ = std::future::ready(()) => false,
            };
            if stop {
                info!("Scan interrupted after {} samples", samples.len());
                interrupted = true;
                break Ok(());
            }
            if ack_tx.send(()).await.is_err() {
                break Ok(());
            }
        };

        // Closing both channels stops the illumination task before it lights
        // another LED.
        drop(settled_rx);
        drop(ack_tx);
        let (session, failures) = illumination.await.map_err(task_failed)??;

        result?;
        Ok(ScanOutcome {
            samples,
            interrupted,
            link_failures: failures.failures(),
            session,
        })
    }
}

impl<F: FrameSource> Capture<F> {
    /// Capture frames until one yields a spot
    fn locate(&mut self, led: usize) -> Result<Point, ScanError> {
        let attempts = self.retries.max(1);
        for attempt in 1..=attempts {
            let frame = self
                .source
                .read_frame()
                .map_err(|source| ScanError::CameraUnavailable { index: led, source })?;

            match self.detector.detect(&frame) {
                Some(spot) => return Ok(spot.to_point()),
                None => debug!("Empty frame for LED {} (attempt {}/{})", led, attempt, attempts),
            }
        }
        Err(ScanError::NoSpot { index: led, attempts })
    }
}

fn task_failed(e: tokio::task::JoinError) -> ScanError {
    ScanError::Task(e.to_string())
}

/// Illumination task: one LED per tick, gated on capture acknowledgements
async fn illuminate<L: LightLink + Send + 'static>(
    mut link: L,
    mut session: ScanSession,
    tick: Duration,
    settled: mpsc::Sender<Settled>,
    mut acks: mpsc::Receiver<()>,
) -> Result<(ScanSession, FailureTracker), ScanError> {
    let mut failures = FailureTracker::default();
    let settle = tick / 2;
    let mut ticker = interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !session.is_done() {
        tokio::select! {
            biased;
            _ = settled.closed() => break,
            _ = ticker.tick() => {}
        }

        let led = session.led_index();
        debug!("Lighting LED {} of {}", led, session.led_count());
        let buf = session.illumination_buffer();
        let (returned, sent) = tokio::task::spawn_blocking(move || {
            let sent = link.send(&buf);
            (link, sent)
        })
        .await
        .map_err(task_failed)?;
        link = returned;
        if let Err(e) = sent {
            failures.record(led, &e);
        }

        tokio::select! {
            biased;
            _ = settled.closed() => break,
            _ = tokio::time::sleep(settle) => {}
        }

        let last = session.advance();
        if settled.send(Settled { led, last }).await.is_err() || last {
            break;
        }
        if acks.recv().await.is_none() {
            break;
        }
    }

    Ok((session, failures))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    #[derive(Clone, Default)]
    struct RecordingLink {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        fail: bool,
    }

    impl LightLink for RecordingLink {
        fn send(&mut self, buf: &[u8]) -> io::Result<()> {
            self.sent.lock().unwrap().push(buf.to_vec());
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
            }
            Ok(())
        }
    }

    /// Renders the most recently lit LED at `(10 + 20 * led, 15)`
    struct FakeCamera {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        empty_frames: usize,
        fail_after: Option<usize>,
        on_read: Option<oneshot::Sender<()>>,
        reads: usize,
        /// Time spent in each read, to model a camera slower than the tick
        delay: Duration,
    }

    impl FakeCamera {
        fn new(link: &RecordingLink) -> Self {
            Self {
                sent: link.sent.clone(),
                empty_frames: 0,
                fail_after: None,
                on_read: None,
                reads: 0,
                delay: Duration::ZERO,
            }
        }
    }

    impl FrameSource for FakeCamera {
        fn read_frame(&mut self) -> io::Result<RgbImage> {
            self.reads += 1;
            if let Some(tx) = self.on_read.take() {
                let _ = tx.send(());
            }
            std::thread::sleep(self.delay);
            if matches!(self.fail_after, Some(n) if self.reads > n) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "camera gone"));
            }
            if self.empty_frames > 0 {
                self.empty_frames -= 1;
                return Ok(RgbImage::new(0, 0));
            }

            let mut img = RgbImage::from_pixel(200, 40, Rgb([2, 2, 2]));
            let sent = self.sent.lock().unwrap();
            if let Some(buf) = sent.last() {
                if let Some(pos) = buf.iter().position(|&b| b != 0) {
                    let led = (pos / 3) as u32;
                    img.put_pixel(10 + 20 * led, 15, Rgb([255, 255, 255]));
                }
            }
            Ok(img)
        }
    }

    fn config(leds: usize, strips: usize) -> ScanConfig {
        ScanConfig {
            leds_per_strip: leds,
            strip_count: strips,
            brightness: 64,
            tick_interval: Duration::from_millis(10),
            start_at_index: 0,
            blur_radius: 1,
            capture_retries: 3,
        }
    }

    fn output_text(out: CoordinateWriter<Vec<u8>>) -> String {
        String::from_utf8(out.into_inner()).unwrap()
    }

    #[test]
    fn test_session_buffer_and_advance() {
        let mut session = ScanSession::new(&config(2, 1));
        assert_eq!(session.led_count(), 2);
        assert_eq!(session.illumination_buffer(), vec![64, 64, 64, 0, 0, 0]);
        assert!(!session.advance());
        assert_eq!(session.illumination_buffer(), vec![0, 0, 0, 64, 64, 64]);
        assert!(session.advance());
        assert!(session.is_done());
    }

    #[test]
    fn test_session_start_offset() {
        let mut cfg = config(4, 3);
        cfg.start_at_index = 2;
        let session = ScanSession::new(&cfg);
        assert_eq!(session.start_index(), 8);
        assert_eq!(session.led_index(), 8);
        assert_eq!(session.led_count(), 12);
    }

    #[test]
    fn test_config_validation() {
        assert!(config(2, 1).validate().is_ok());
        assert!(config(0, 1).validate().is_err());

        let mut cfg = config(2, 2);
        cfg.start_at_index = 2;
        assert!(matches!(cfg.validate(), Err(ScanError::InvalidConfig(_))));

        let mut cfg = config(2, 2);
        cfg.brightness = 0;
        assert!(cfg.validate().is_err());

        assert!(config(MAX_LEDS_PER_STRIP, 1).validate().is_ok());
        assert!(matches!(
            config(MAX_LEDS_PER_STRIP + 1, 1).validate(),
            Err(ScanError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = ScanSettings {
            leds: 10,
            pins: 4,
            radius: 6,
            start_pin: 2,
            ..Default::default()
        };
        let cfg = ScanConfig::from_settings(&settings).unwrap();
        assert_eq!(cfg.start_at_index, 1);
        assert_eq!(cfg.blur_radius, 7);
        assert_eq!(cfg.tick_interval, Duration::from_millis(1000));

        let settings = ScanSettings { start_pin: 0, ..Default::default() };
        assert!(ScanConfig::from_settings(&settings).is_err());
    }

    #[tokio::test]
    async fn test_full_scan() {
        let link = RecordingLink::default();
        let camera = FakeCamera::new(&link);
        let controller = ScanController::new(config(2, 1), link.clone(), camera).unwrap();

        let mut out = CoordinateWriter::new(Vec::new());
        let outcome = controller
            .run(&mut out, std::future::pending())
            .await
            .unwrap();

        assert!(!outcome.interrupted);
        assert_eq!(outcome.samples, vec![Point::new(10.0, 15.0), Point::new(30.0, 15.0)]);
        assert!(outcome.session.is_done());
        assert_eq!(outcome.link_failures, 0);
        assert_eq!(
            *link.sent.lock().unwrap(),
            vec![vec![64, 64, 64, 0, 0, 0], vec![0, 0, 0, 64, 64, 64]]
        );
        assert_eq!(output_text(out), "10\t15\n30\t15\n");
    }

    #[tokio::test]
    async fn test_scan_from_start_pin() {
        let link = RecordingLink::default();
        let camera = FakeCamera::new(&link);
        let mut cfg = config(2, 3);
        cfg.start_at_index = 1;
        let controller = ScanController::new(cfg, link.clone(), camera).unwrap();

        let mut out = CoordinateWriter::new(Vec::new());
        let outcome = controller
            .run(&mut out, std::future::pending())
            .await
            .unwrap();

        assert_eq!(
            outcome.samples,
            vec![
                Point::new(50.0, 15.0),
                Point::new(70.0, 15.0),
                Point::new(90.0, 15.0),
                Point::new(110.0, 15.0),
            ]
        );
        assert_eq!(link.sent.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_interrupt_keeps_partial_result() {
        let link = RecordingLink::default();
        let mut camera = FakeCamera::new(&link);
        let (tx, rx) = oneshot::channel();
        camera.on_read = Some(tx);

        let mut cfg = config(2, 1);
        cfg.tick_interval = Duration::from_millis(50);
        let controller = ScanController::new(cfg, link.clone(), camera).unwrap();

        let mut out = CoordinateWriter::new(Vec::new());
        let outcome = controller
            .run(&mut out, async {
                let _ = rx.await;
            })
            .await
            .unwrap();

        assert!(outcome.interrupted);
        assert_eq!(outcome.samples, vec![Point::new(10.0, 15.0)]);
        // No further LED was lit after the interrupt
        assert_eq!(link.sent.lock().unwrap().len(), 1);
        assert_eq!(output_text(out), "10\t15\n");
    }

    #[tokio::test]
    async fn test_link_failures_are_not_fatal() {
        let link = RecordingLink {
            fail: true,
            ..Default::default()
        };
        let camera = FakeCamera::new(&link);
        let controller = ScanController::new(config(3, 1), link.clone(), camera).unwrap();

        let mut out = CoordinateWriter::new(Vec::new());
        let outcome = controller
            .run(&mut out, std::future::pending())
            .await
            .unwrap();

        assert_eq!(outcome.samples.len(), 3);
        assert_eq!(outcome.link_failures, 3);
    }

    #[tokio::test]
    async fn test_empty_frames_are_retried() {
        let link = RecordingLink::default();
        let mut camera = FakeCamera::new(&link);
        camera.empty_frames = 2;
        let controller = ScanController::new(config(1, 1), link.clone(), camera).unwrap();

        let mut out = CoordinateWriter::new(Vec::new());
        let outcome = controller
            .run(&mut out, std::future::pending())
            .await
            .unwrap();
        assert_eq!(outcome.samples, vec![Point::new(10.0, 15.0)]);
    }

    #[tokio::test]
    async fn test_too_many_empty_frames() {
        let link = RecordingLink::default();
        let mut camera = FakeCamera::new(&link);
        camera.empty_frames = 10;
        let controller = ScanController::new(config(1, 1), link, camera).unwrap();

        let mut out = CoordinateWriter::new(Vec::new());
        let err = controller
            .run(&mut out, std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::NoSpot { index: 0, attempts: 3 }));
    }

    #[tokio::test]
    async fn test_camera_loss_is_fatal_and_keeps_written_samples() {
        let link = RecordingLink::default();
        let mut camera = FakeCamera::new(&link);
        camera.fail_after = Some(1);
        let controller = ScanController::new(config(3, 1), link.clone(), camera).unwrap();

        let mut out = CoordinateWriter::new(Vec::new());
        let err = controller
            .run(&mut out, std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::CameraUnavailable { index: 1, .. }));
        assert_eq!(link.sent.lock().unwrap().len(), 2);
        assert_eq!(output_text(out), "10\t15\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_camera_gates_illumination() {
        let link = RecordingLink::default();
        let mut camera = FakeCamera::new(&link);
        camera.delay = Duration::from_millis(40);
        let controller = ScanController::new(config(4, 1), link.clone(), camera).unwrap();

        let mut out = CoordinateWriter::new(Vec::new());
        let outcome = controller
            .run(&mut out, std::future::pending())
            .await
            .unwrap();

        // Each frame shows the LED lit for its own cycle, never the next one
        assert_eq!(
            outcome.samples,
            vec![
                Point::new(10.0, 15.0),
                Point::new(30.0, 15.0),
                Point::new(50.0, 15.0),
                Point::new(70.0, 15.0),
            ]
        );
        assert_eq!(link.sent.lock().unwrap().len(), outcome.samples.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interrupt_during_capture_lights_nothing_more() {
        let link = RecordingLink::default();
        let mut camera = FakeCamera::new(&link);
        let (tx, rx) = oneshot::channel();
        camera.on_read = Some(tx);
        camera.delay = Duration::from_millis(40);
        let controller = ScanController::new(config(3, 1), link.clone(), camera).unwrap();

        let mut out = CoordinateWriter::new(Vec::new());
        let outcome = controller
            .run(&mut out, async {
                let _ = rx.await;
            })
            .await
            .unwrap();

        assert!(outcome.interrupted);
        assert_eq!(outcome.samples, vec![Point::new(10.0, 15.0)]);
        assert_eq!(outcome.session.start_index(), 0);
        assert_eq!(link.sent.lock().unwrap().len(), 1);
    }
}

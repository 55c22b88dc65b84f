//! Camera frame acquisition from V4L2 devices
//!
//! The scanner needs one decoded RGB frame per LED. Cameras deliver
//! MJPEG, YUYV or raw RGB/BGR; MJPEG is decoded with turbojpeg (libjpeg-turbo
//! with SIMD) and falls back to the pure-Rust jpeg-decoder.
//!
//! Memory-mapped capture keeps a small ring of queued buffers that fill up
//! while the scanner is waiting for an LED to settle, so each read drains the
//! queued frames and decodes the newest one.

use std::cell::RefCell;
use std::io;

use anyhow::{Context, Result};
use image::RgbImage;
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::config::{CameraConfig, CaptureFormat};

/// Supplies one frame on demand
pub trait FrameSource {
    /// Read the most recent frame
    ///
    /// An error means the camera is unavailable. A frame that could not be
    /// decoded is returned as an empty image so the caller can retry.
    fn read_frame(&mut self) -> io::Result<RgbImage>;
}

/// Frames tried by [`first_frame`] before the camera counts as unusable
const FIRST_FRAME_ATTEMPTS: u32 = 5;

/// Read frames until one decodes, returning its size
///
/// A camera that cannot deliver a single usable frame is treated as
/// unavailable.
pub fn first_frame<F: FrameSource>(source: &mut F) -> io::Result<(u32, u32)> {
    for _ in 0..FIRST_FRAME_ATTEMPTS {
        let frame = source.read_frame()?;
        if frame.width() > 0 && frame.height() > 0 {
            return Ok(frame.dimensions());
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("no decodable frame in {} attempts", FIRST_FRAME_ATTEMPTS),
    ))
}

thread_local! {
    // One libjpeg-turbo handle per thread; None if it failed to initialize
    static TURBO: RefCell<Option<turbojpeg::Decompressor>> =
        RefCell::new(turbojpeg::Decompressor::new().ok());
}

const BUFFER_COUNT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputFormat {
    Mjpeg,
    Yuyv,
    Rgb,
    Bgr,
}

impl InputFormat {
    fn from_fourcc(fourcc: &[u8; 4]) -> Self {
        match fourcc {
            b"MJPG" => InputFormat::Mjpeg,
            b"YUYV" => InputFormat::Yuyv,
            b"BGR3" => InputFormat::Bgr,
            _ => InputFormat::Rgb,
        }
    }
}

/// V4L2 camera frame source
pub struct V4lCamera {
    device_path: String,
    // Field order matters: the stream must be dropped before the device
    stream: Stream<'static>,
    _dev: Device,
    width: u32,
    height: u32,
    format: InputFormat,
    frames_read: u64,
}

impl V4lCamera {
    pub fn open(config: &CameraConfig) -> Result<Self> {
        let dev = Device::with_path(&config.device)
            .with_context(|| format!("Failed to open camera device: {}", config.device))?;

        let caps = dev.query_caps().context("Failed to query device capabilities")?;
        info!("Camera: {} (driver: {})", caps.card, caps.driver);

        let format = configure_capture_format(&dev, config.width, config.height, config.format)?;
        info!(
            "Capture format: {}x{} {:?}",
            format.width,
            format.height,
            String::from_utf8_lossy(&format.fourcc.repr)
        );

        if let Err(e) = set_frame_rate(&dev, config.fps) {
            warn!("Could not set frame rate to {} fps: {}", config.fps, e);
        }

        let stream = Stream::with_buffers(&dev, Type::VideoCapture, BUFFER_COUNT)
            .context("Failed to create capture stream")?;

        let input = InputFormat::from_fourcc(&format.fourcc.repr);
        if input == InputFormat::Mjpeg && TURBO.with(|t| t.borrow().is_none()) {
            warn!("libjpeg-turbo unavailable, decoding MJPEG in software");
        }

        Ok(Self {
            device_path: config.device.clone(),
            stream,
            _dev: dev,
            width: format.width,
            height: format.height,
            format: input,
            frames_read: 0,
        })
    }
}

impl FrameSource for V4lCamera {
    fn read_frame(&mut self) -> io::Result<RgbImage> {
        let device = &self.device_path;
        let unreadable =
            |e: io::Error| io::Error::new(e.kind(), format!("cannot read device {}: {}", device, e));

        // Drop frames queued while the LED was settling
        for _ in 1..BUFFER_COUNT {
            self.stream.next().map_err(unreadable)?;
        }
        let (buf, _meta) = self.stream.next().map_err(unreadable)?;
        self.frames_read += 1;

        let frame = match self.format {
            InputFormat::Mjpeg => decode_mjpeg(buf, self.width, self.height),
            InputFormat::Yuyv => {
                let mut frame = RgbImage::new(self.width, self.height);
                yuyv_to_rgb(buf, &mut frame);
                Some(frame)
            }
            InputFormat::Bgr => {
                let mut frame = RgbImage::new(self.width, self.height);
                bgr_to_rgb(buf, &mut frame);
                Some(frame)
            }
            InputFormat::Rgb => {
                let mut frame = RgbImage::new(self.width, self.height);
                let pixels: &mut [u8] = &mut frame;
                let n = buf.len().min(pixels.len());
                pixels[..n].copy_from_slice(&buf[..n]);
                Some(frame)
            }
        };

        Ok(frame.unwrap_or_else(|| {
            warn!("Dropped undecodable frame {} from {}", self.frames_read, self.device_path);
            RgbImage::new(0, 0)
        }))
    }
}

/// Configure the capture format, trying the preferred format first
fn configure_capture_format(
    dev: &Device,
    width: u32,
    height: u32,
    preferred: CaptureFormat,
) -> Result<v4l::Format> {
    let formats = dev.enum_formats().context("Failed to enumerate formats")?;

    debug!("Available formats:");
    for fmt in &formats {
        debug!("  {:?}: {}", String::from_utf8_lossy(&fmt.fourcc.repr), fmt.description);
    }

    let order: [&[u8; 4]; 4] = match preferred {
        CaptureFormat::Mjpeg => [b"MJPG", b"YUYV", b"RGB3", b"BGR3"],
        CaptureFormat::Yuyv => [b"YUYV", b"MJPG", b"RGB3", b"BGR3"],
    };

    for candidate in order {
        let fourcc = FourCC::new(candidate);
        if !formats.iter().any(|f| f.fourcc == fourcc) {
            continue;
        }

        let mut format = dev.format().context("Failed to get current format")?;
        format.width = width;
        format.height = height;
        format.fourcc = fourcc;

        match dev.set_format(&format) {
            Ok(actual) => return Ok(actual),
            Err(e) => {
                warn!(
                    "Could not set format {:?} at {}x{}: {}",
                    String::from_utf8_lossy(candidate),
                    width,
                    height,
                    e
                );
            }
        }
    }

    let current = dev.format().context("Failed to get device format")?;
    info!(
        "Using device's current format: {}x{} {:?}",
        current.width,
        current.height,
        String::from_utf8_lossy(&current.fourcc.repr)
    );
    Ok(current)
}

fn set_frame_rate(dev: &Device, fps: u32) -> Result<()> {
    let mut params = dev.params().context("Failed to get parameters")?;
    params.interval = v4l::Fraction::new(1, fps);
    dev.set_params(&params).context("Failed to set parameters")?;

    let actual = dev.params().context("Failed to read back parameters")?;
    debug!(
        "Frame interval: {}/{} (requested {} fps)",
        actual.interval.numerator, actual.interval.denominator, fps
    );
    Ok(())
}

/// Decode a JPEG frame, `None` when neither decoder accepts it
fn decode_mjpeg(data: &[u8], width: u32, height: u32) -> Option<RgbImage> {
    let fast = TURBO.with(|cell| {
        let mut slot = cell.borrow_mut();
        let decompressor = slot.as_mut()?;
        let header = decompressor.read_header(data).ok()?;
        if (header.width, header.height) != (width as usize, height as usize) {
            debug!(
                "JPEG is {}x{}, expected {}x{}",
                header.width, header.height, width, height
            );
            return None;
        }

        let mut frame = RgbImage::new(width, height);
        let target = turbojpeg::Image {
            pixels: &mut *frame,
            width: header.width,
            pitch: header.width * 3,
            height: header.height,
            format: turbojpeg::PixelFormat::RGB,
        };
        decompressor.decompress(data, target).ok()?;
        Some(frame)
    });

    fast.or_else(|| decode_jpeg_fallback(data))
}

/// Pure-Rust decode for frames libjpeg-turbo rejected
fn decode_jpeg_fallback(data: &[u8]) -> Option<RgbImage> {
    let mut decoder = jpeg_decoder::Decoder::new(data);
    let raw = decoder.decode().ok()?;
    let meta = decoder.info()?;
    let (w, h) = (meta.width as u32, meta.height as u32);

    match meta.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => RgbImage::from_raw(w, h, raw),
        jpeg_decoder::PixelFormat::L8 => {
            let luma = image::GrayImage::from_raw(w, h, raw)?;
            Some(image::DynamicImage::ImageLuma8(luma).to_rgb8())
        }
        other => {
            debug!("Unsupported JPEG pixel format {:?}", other);
            None
        }
    }
}

/// BT.601 YUV to RGB in 8.8 fixed point
#[inline]
fn yuv_pixel(y: i32, u: i32, v: i32) -> [u8; 3] {
    let r = y + ((359 * v) >> 8);
    let g = y - ((88 * u + 183 * v) >> 8);
    let b = y + ((454 * u) >> 8);
    [r.clamp(0, 255) as u8, g.clamp(0, 255) as u8, b.clamp(0, 255) as u8]
}

/// Convert packed YUYV (two pixels per four bytes) into an RGB buffer
pub fn yuyv_to_rgb(yuyv: &[u8], rgb: &mut [u8]) {
    for (src, dst) in yuyv.chunks_exact(4).zip(rgb.chunks_exact_mut(6)) {
        let u = src[1] as i32 - 128;
        let v = src[3] as i32 - 128;
        dst[..3].copy_from_slice(&yuv_pixel(src[0] as i32, u, v));
        dst[3..].copy_from_slice(&yuv_pixel(src[2] as i32, u, v));
    }
}

/// Reorder BGR24 into RGB24
pub fn bgr_to_rgb(bgr: &[u8], rgb: &mut [u8]) {
    for (src, dst) in bgr.chunks_exact(3).zip(rgb.chunks_exact_mut(3)) {
        dst.copy_from_slice(&[src[2], src[1], src[0]]);
    }
}

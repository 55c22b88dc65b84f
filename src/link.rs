// Wire links to the LED controller
//
// The controller takes one flat buffer of `leds * pins * 3` bytes per frame
// (three color bytes per LED, strips back to back). Two transports exist:
// 1. Serial - 8N1 at the configured baud rate, including non-standard rates
// 2. UDP - one datagram per buffer to a fixed controller address

use std::io::{self, BufRead, BufReader, Write};
use std::net::UdpSocket;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, warn};

use crate::config::{LinkConfig, LinkKind};

/// How long a serial read or write may block
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Sends illumination buffers to the LED controller
pub trait LightLink {
    fn send(&mut self, buf: &[u8]) -> io::Result<()>;
}

impl LightLink for Box<dyn LightLink + Send> {
    fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        (**self).send(buf)
    }
}

/// Open the link described by the configuration
pub fn open(config: &LinkConfig) -> Result<Box<dyn LightLink + Send>> {
    match config.kind {
        LinkKind::Serial => {
            let link = SerialLink::open(&config.port, config.baud)
                .with_context(|| format!("When connecting to port: {}", config.port))?;
            Ok(Box::new(link))
        }
        LinkKind::Udp => {
            let link = UdpLink::connect(&config.address)
                .with_context(|| format!("When connecting to {}", config.address))?;
            Ok(Box::new(link))
        }
    }
}

/// Build the 28-byte handshake frame
///
/// Layout: `"Cyma"` followed by eight `[hi, lo, check]` groups, one per channel.
/// Only the first five groups carry a check byte (`hi ^ lo ^ 0x55`); the
/// remaining check bytes are zero.
pub fn handshake_frame(channels: [u16; 8]) -> [u8; 28] {
    let mut frame = [0u8; 28];
    frame[..4].copy_from_slice(b"Cyma");
    for (i, value) in channels.iter().enumerate() {
        let offset = 4 + i * 3;
        let [hi, lo] = value.to_be_bytes();
        frame[offset] = hi;
        frame[offset + 1] = lo;
        if i < 5 {
            frame[offset + 2] = hi ^ lo ^ 0x55;
        }
    }
    frame
}

/// Serial link, 8N1 without flow control
pub struct SerialLink {
    path: String,
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Open `path` at `baud`; non-standard rates such as 256000 are passed
    /// through to the driver
    pub fn open(path: &str, baud: u32) -> io::Result<Self> {
        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(REPLY_TIMEOUT)
            .open()?;
        info!("Opened serial link {} at {} baud", path, baud);

        Ok(Self {
            path: path.to_string(),
            port,
        })
    }

    /// Read newline-terminated replies until `on_line` returns false, the
    /// device closes or nothing arrives within the reply timeout
    pub fn read_lines(&mut self, mut on_line: impl FnMut(&str) -> bool) -> io::Result<()> {
        let mut reader = BufReader::new(&mut self.port);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    debug!("Serial link {} closed", self.path);
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    debug!("No more replies on {}", self.path);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            if !on_line(line.trim_end()) {
                return Ok(());
            }
        }
    }
}

impl LightLink for SerialLink {
    fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()
    }
}

/// UDP link: one datagram per buffer
pub struct UdpLink {
    socket: UdpSocket,
}

impl UdpLink {
    pub fn connect(address: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(address)?;
        info!("UDP link to {}", address);
        Ok(Self { socket })
    }

    /// Wait for one reply datagram
    pub fn receive(&self, timeout: Duration) -> io::Result<String> {
        self.socket.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; 1500];
        let n = self.socket.recv(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf[..n]).trim_end().to_string())
    }
}

impl LightLink for UdpLink {
    fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        let sent = self.socket.send(buf)?;
        if sent != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("Short datagram: sent {} of {} bytes", sent, buf.len()),
            ));
        }
        Ok(())
    }
}

/// Counts failed link writes and logs them at most every 5 seconds
#[derive(Debug, Default)]
pub struct FailureTracker {
    failures: u64,
    last_warn: Option<Instant>,
}

impl FailureTracker {
    pub fn record(&mut self, index: usize, err: &io::Error) {
        self.failures += 1;

        let should_warn = match self.last_warn {
            None => true,
            Some(last) => last.elapsed() >= Duration::from_secs(5),
        };

        if should_warn {
            warn!(
                "Link write error at LED {}: {} (total failures: {})",
                index, err, self.failures
            );
            self.last_warn = Some(Instant::now());
        } else {
            debug!("Link write error at LED {}: {}", index, err);
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_frame() {
        let frame = handshake_frame([150, 150, 720, 150, 150, 0, 0, 0]);
        assert_eq!(&frame[..4], b"Cyma");
        // 150 = 0x0096
        assert_eq!(&frame[4..7], &[0x00, 0x96, 0x00 ^ 0x96 ^ 0x55]);
        // 720 = 0x02D0
        assert_eq!(&frame[10..13], &[0x02, 0xD0, 0x02 ^ 0xD0 ^ 0x55]);
        assert_eq!(&frame[16..19], &[0x00, 0x96, 0xC3]);
        // Channels six to eight carry no check byte
        assert_eq!(&frame[19..], &[0u8; 9]);
    }

    #[test]
    fn test_handshake_unchecked_channels() {
        let frame = handshake_frame([0, 0, 0, 0, 0, 0x0102, 0x0304, 0xFFFF]);
        assert_eq!(frame[6], 0x55);
        assert_eq!(&frame[19..], &[0x01, 0x02, 0, 0x03, 0x04, 0, 0xFF, 0xFF, 0]);
    }

    #[test]
    fn test_serial_open_missing_device() {
        let err = SerialLink::open("/dev/cymapper-no-such-tty", 256_000)
            .err()
            .unwrap();
        assert_ne!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_udp_link_sends_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = receiver.local_addr().unwrap();
        let mut link = UdpLink::connect(&addr.to_string()).unwrap();

        link.send(&[1, 2, 3, 4, 5, 6]).unwrap();

        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 16];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_failure_tracker_counts() {
        let mut tracker = FailureTracker::default();
        let err = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        tracker.record(0, &err);
        tracker.record(1, &err);
        assert_eq!(tracker.failures(), 2);
    }
}

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use serialport::SerialPort as _;

use crate::error::{Error, Result};

pub const CC3200_BAUD: u32 = 921_600;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Both sides acknowledge every packet with this pair.
const ACK: [u8; 2] = [0x00, 0xCC];

/// Length of the UART break condition used to enter the bootloader.
const BREAK_DURATION: Duration = Duration::from_millis(200);

/// The surface the link needs from a serial port.
/// Narrowing it to a trait keeps the framing logic testable against a
/// scripted port.
pub trait LinkPort: Read + Write {
    fn timeout(&self) -> Duration;
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
    fn send_break(&mut self, duration: Duration) -> Result<()>;
    fn set_dtr(&mut self, level: bool) -> Result<()>;
    fn set_rts(&mut self, level: bool) -> Result<()>;
    fn flush_input(&mut self) -> Result<()>;
}

impl LinkPort for Box<dyn serialport::SerialPort> {
    fn timeout(&self) -> Duration
    {
        (**self).timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()>
    {
        Ok((**self).set_timeout(timeout)?)
    }

    fn send_break(&mut self, duration: Duration) -> Result<()>
    {
        self.set_break()?;
        thread::sleep(duration);
        Ok(self.clear_break()?)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()>
    {
        Ok(self.write_data_terminal_ready(level)?)
    }

    fn set_rts(&mut self, level: bool) -> Result<()>
    {
        Ok(self.write_request_to_send(level)?)
    }

    fn flush_input(&mut self) -> Result<()>
    {
        Ok(self.clear(serialport::ClearBuffer::Input)?)
    }
}

/// Framed, acknowledged byte transport over a UART.
///
/// Frame layout in both directions:
/// `len_be16 (= payload_len + 2) | checksum_u8 (sum of payload mod 256) | payload`
#[derive(Debug)]
pub struct SerialLink<P> {
    pub(crate) port: P,
}

impl SerialLink<Box<dyn serialport::SerialPort>> {
    /// Open a UART at 921600 baud, 8N1, with the default read timeout.
    pub fn open(path: &str) -> Result<Self>
    {
        let port = serialport::new(path, CC3200_BAUD)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .map_err(Error::SerialOpen)?;

        Ok(Self { port })
    }
}

impl<P: LinkPort> SerialLink<P> {
    pub fn new(port: P) -> Self
    {
        Self { port }
    }

    pub fn port_timeout(&self) -> Duration
    {
        self.port.timeout()
    }

    pub fn set_port_timeout(&mut self, timeout: Duration) -> Result<()>
    {
        self.port.set_timeout(timeout)
    }

    pub fn flush_input(&mut self) -> Result<()>
    {
        self.port.flush_input()
    }

    pub fn set_dtr(&mut self, level: bool) -> Result<()>
    {
        self.port.set_dtr(level)
    }

    pub fn set_rts(&mut self, level: bool) -> Result<()>
    {
        self.port.set_rts(level)
    }

    /// Run `f` with the port timeout temporarily replaced.
    /// The previous timeout is restored on every path.
    pub fn with_timeout<T>(
        &mut self,
        timeout: Option<Duration>,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T>
    {
        let timeout = match timeout {
            Some(t) if t != self.port.timeout() => t,
            _ => return f(self),
        };

        let prev = self.port.timeout();
        self.port.set_timeout(timeout)?;
        let ret = f(self);
        let restored = self.port.set_timeout(prev);

        match ret {
            Ok(v) => restored.map(|_| v),
            err => err,
        }
    }

    /// Frame and send one packet, then wait for the ACK pair.
    /// A caller-supplied timeout is scoped to this call only.
    pub fn send_packet(&mut self, payload: &[u8], timeout: Option<Duration>) -> Result<()>
    {
        let checksum = sum_mod_256(payload);

        let mut frame = Vec::with_capacity(payload.len() + 3);
        frame.extend_from_slice(&(payload.len() as u16 + 2).to_be_bytes());
        frame.push(checksum);
        frame.extend_from_slice(payload);

        self.port.write_all(&frame)?;
        self.port.flush()?;

        if !self.read_ack(timeout)? {
            return Err(Error::Protocol(format!(
                "no ack for packet opcode=0x{:02x}",
                payload[0]
            )));
        }

        Ok(())
    }

    /// Receive one framed packet, verify its checksum and acknowledge it.
    pub fn recv_packet(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>>
    {
        let data = self.with_timeout(timeout, |link| {
            let mut header = [0u8; 3];
            link.read_wire_exact(&mut header, "packet header")?;

            let wire_len = u16::from_be_bytes([header[0], header[1]]) as usize;
            let data_len = wire_len
                .checked_sub(2)
                .ok_or_else(|| Error::Protocol("invalid packet length".to_string()))?;

            let mut data = vec![0u8; data_len];
            link.read_wire_exact(&mut data, "packet body")?;

            if sum_mod_256(&data) != header[2] {
                return Err(Error::Protocol("rx checksum failed".to_string()));
            }

            Ok(data)
        })?;

        self.send_ack()?;
        Ok(data)
    }

    /// Read up to `len` raw bytes (no framing); short on timeout.
    pub fn read_raw(&mut self, len: usize, timeout: Option<Duration>) -> Result<Vec<u8>>
    {
        self.with_timeout(timeout, |link| {
            let mut buf = vec![0u8; len];
            let mut got = 0;

            while got < len {
                match link.read_byte()? {
                    Some(b) => {
                        buf[got] = b;
                        got += 1;
                    }
                    None => break,
                }
            }

            buf.truncate(got);
            Ok(buf)
        })
    }

    /// Scan the incoming bytes for the ACK pair.
    /// Returns `false` when the port times out before the pair shows up.
    pub fn read_ack(&mut self, timeout: Option<Duration>) -> Result<bool>
    {
        self.with_timeout(timeout, |link| {
            let mut window = [0xFFu8; 2];

            loop {
                match link.read_byte()? {
                    Some(b) => {
                        window = [window[1], b];
                        if window == ACK {
                            return Ok(true);
                        }
                    }
                    None => {
                        log::error!("timed out while waiting for ack");
                        return Ok(false);
                    }
                }
            }
        })
    }

    pub fn send_ack(&mut self) -> Result<()>
    {
        self.port.write_all(&ACK)?;
        Ok(self.port.flush()?)
    }

    /// Issue a UART break and wait for the bootloader's ACK pair,
    /// retrying up to `tries` times.
    pub fn break_in(&mut self, tries: u32, per_try_timeout: Duration) -> Result<()>
    {
        for _ in 0..tries {
            self.port.send_break(BREAK_DURATION)?;
            if self.read_ack(Some(per_try_timeout))? {
                return Ok(());
            }
        }

        Err(Error::Protocol("no ACK on break condition".to_string()))
    }

    fn read_byte(&mut self) -> Result<Option<u8>>
    {
        let mut b = [0u8; 1];

        match self.port.read(&mut b) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(b[0])),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_wire_exact(&mut self, buf: &mut [u8], what: &str) -> Result<()>
    {
        self.port
            .read_exact(buf)
            .map_err(|e| Error::Protocol(format!("short read on {}: {}", what, e)))
    }
}

pub fn sum_mod_256(data: &[u8]) -> u8
{
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}


#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// Serial port double fed from a pre-scripted receive queue.
    #[derive(Debug, Default)]
    pub struct ScriptedPort {
        pub rx: VecDeque<u8>,
        pub tx: Vec<u8>,
        pub timeout: Duration,
        pub breaks: usize,
        pub dtr: Vec<bool>,
        pub rts: Vec<bool>,
        pub flushes: usize,
    }

    impl ScriptedPort {
        pub fn new() -> Self
        {
            Self {
                timeout: DEFAULT_TIMEOUT,
                ..Self::default()
            }
        }

        pub fn feed(&mut self, bytes: &[u8])
        {
            self.rx.extend(bytes.iter().copied());
        }

        pub fn feed_ack(&mut self)
        {
            self.feed(&ACK);
        }

        /// Queue a fully framed packet carrying `payload`.
        pub fn feed_packet(&mut self, payload: &[u8])
        {
            self.feed(&(payload.len() as u16 + 2).to_be_bytes());
            self.feed(&[sum_mod_256(payload)]);
            self.feed(payload);
        }
    }

    impl io::Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
        {
            if self.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "scripted timeout"));
            }

            let n = buf.len().min(self.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.rx.pop_front().unwrap();
            }

            Ok(n)
        }
    }

    impl io::Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize>
        {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()>
        {
            Ok(())
        }
    }

    impl LinkPort for ScriptedPort {
        fn timeout(&self) -> Duration
        {
            self.timeout
        }

        fn set_timeout(&mut self, timeout: Duration) -> Result<()>
        {
            self.timeout = timeout;
            Ok(())
        }

        fn send_break(&mut self, _duration: Duration) -> Result<()>
        {
            self.breaks += 1;
            Ok(())
        }

        fn set_dtr(&mut self, level: bool) -> Result<()>
        {
            self.dtr.push(level);
            Ok(())
        }

        fn set_rts(&mut self, level: bool) -> Result<()>
        {
            self.rts.push(level);
            Ok(())
        }

        fn flush_input(&mut self) -> Result<()>
        {
            // Scripted bytes model the device's future replies, so a
            // flush only counts; it must not eat them.
            self.flushes += 1;
            Ok(())
        }
    }

    /// Split a captured transmit stream back into packet payloads,
    /// skipping interleaved ACK pairs.
    pub fn split_tx_frames(mut tx: &[u8]) -> Vec<Vec<u8>>
    {
        let mut frames = Vec::new();

        while !tx.is_empty() {
            if tx.starts_with(&ACK) {
                tx = &tx[2..];
                continue;
            }

            let wire_len = u16::from_be_bytes([tx[0], tx[1]]) as usize;
            let body_len = wire_len - 2;
            frames.push(tx[3..3 + body_len].to_vec());
            tx = &tx[3 + body_len..];
        }

        frames
    }
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure modes of the bootloader link and the SFFS engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to open serial port: {0}")]
    SerialOpen(#[source] serialport::Error),

    /// Timeouts, short reads, checksum failures, missing ACKs and
    /// responses of unexpected size.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The device answered, but with a status other than 0x40.
    #[error("device reported status 0x{0:02x}")]
    DeviceStatus(u8),

    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    #[error("broken FAT: {0}")]
    CorruptFat(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file too large: {0}")]
    FileTooLarge(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self
    {
        Error::Protocol(e.to_string())
    }
}

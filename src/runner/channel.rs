use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use thiserror::Error;

pub const REPRL_CRFD: RawFd = 100; // we read control
pub const REPRL_CWFD: RawFd = 101; // we write status
pub const REPRL_DRFD: RawFd = 102; // we read program bytes
pub const REPRL_DWFD: RawFd = 103; // we write fuzzer prints

pub const HANDSHAKE: &[u8; 4] = b"HELO";
/// The fuzzer sends the bytes `exec`, i.e. `'cexe'` read as a little-endian word.
pub const EXEC_ACTION: u32 = u32::from_le_bytes(*b"exec");

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to send handshake: {0}")]
    HandshakeWrite(#[source] io::Error),
    #[error("Invalid response from parent: {0}")]
    HandshakeRead(#[source] io::Error),
    #[error("Invalid response from parent: {0:?}")]
    HandshakeMismatch([u8; 4]),
    #[error("Failed to read action: {0}")]
    ActionRead(#[source] io::Error),
    #[error("Unknown action {0:#x}")]
    UnknownAction(u32),
    #[error("Failed to read script size: {0}")]
    SizeRead(#[source] io::Error),
    #[error("Script size {0} does not fit in memory")]
    SizeOverflow(u64),
    #[error("Failed to load script: {0}")]
    ScriptRead(#[source] io::Error),
    #[error("Erroring writing return value over REPRL_CWFD: {0}")]
    StatusWrite(#[source] io::Error),
}

/// The harness side of the REPRL channel. Data written by scripts goes
/// through [`crate::intrinsics::FuzzOutput`], not through here.
#[derive(Debug)]
pub struct ReprlChannel<R = File, W = File, D = File> {
    ctrl_rx: R,
    ctrl_tx: W,
    data_rx: D,
}

impl ReprlChannel {
    /// Adopt the descriptors the fuzzer installed before exec'ing us.
    ///
    /// # Safety
    /// Descriptors 100, 101 and 102 must be open and owned by nobody else.
    pub unsafe fn from_fixed_descriptors() -> Self {
        unsafe {
            Self::new(
                File::from_raw_fd(REPRL_CRFD),
                File::from_raw_fd(REPRL_CWFD),
                File::from_raw_fd(REPRL_DRFD),
            )
        }
    }
}

impl<R: Read, W: Write, D: Read> ReprlChannel<R, W, D> {
    pub fn new(ctrl_rx: R, ctrl_tx: W, data_rx: D) -> Self {
        Self {
            ctrl_rx,
            ctrl_tx,
            data_rx,
        }
    }

    pub fn handshake(&mut self) -> Result<(), ProtocolError> {
        self.ctrl_tx
            .write_all(HANDSHAKE)
            .and_then(|_| self.ctrl_tx.flush())
            .map_err(ProtocolError::HandshakeWrite)?;

        let mut buf = [0u8; 4];
        self.ctrl_rx
            .read_exact(&mut buf)
            .map_err(ProtocolError::HandshakeRead)?;
        if &buf != HANDSHAKE {
            return Err(ProtocolError::HandshakeMismatch(buf));
        }
        Ok(())
    }

    /// Block until the fuzzer asks for the next execution.
    pub fn recv_action(&mut self) -> Result<(), ProtocolError> {
        let mut buf = [0u8; 4];
        self.ctrl_rx
            .read_exact(&mut buf)
            .map_err(ProtocolError::ActionRead)?;
        let action = u32::from_le_bytes(buf);
        if action != EXEC_ACTION {
            return Err(ProtocolError::UnknownAction(action));
        }
        Ok(())
    }

    /// Read the script length from the control pipe, then the script itself
    /// from the data pipe.
    pub fn recv_script(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut size = [0u8; 8];
        self.ctrl_rx
            .read_exact(&mut size)
            .map_err(ProtocolError::SizeRead)?;
        let size = u64::from_le_bytes(size);
        let len = usize::try_from(size).map_err(|_| ProtocolError::SizeOverflow(size))?;

        let mut script = vec![0u8; len];
        let mut offset = 0;
        while offset < len {
            match self.data_rx.read(&mut script[offset..]) {
                Ok(0) => {
                    return Err(ProtocolError::ScriptRead(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("data pipe closed after {offset} of {len} bytes"),
                    )));
                }
                Ok(n) => offset += n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ProtocolError::ScriptRead(err)),
            }
        }
        Ok(script)
    }

    pub fn send_status(&mut self, status: u32) -> Result<(), ProtocolError> {
        self.ctrl_tx
            .write_all(&status.to_le_bytes())
            .and_then(|_| self.ctrl_tx.flush())
            .map_err(ProtocolError::StatusWrite)
    }
}

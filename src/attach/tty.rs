// src/attach/tty.rs

//! Cancellable terminal input.
//!
//! `tokio::io::stdin()` reads on a blocking thread that cannot be interrupted,
//! so a pending read keeps the runtime alive after the session is gone and
//! swallows the next keystroke. [`TtyInput`] opens its own non-blocking file
//! description and polls it through the reactor instead; dropping it is
//! enough to stop reading.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, Interest, ReadBuf};

use crate::errors::Result;

#[derive(Debug)]
pub struct TtyInput {
    fd: AsyncFd<File>,
}

impl TtyInput {
    /// The controlling terminal. Must be called inside a Tokio runtime.
    pub fn open() -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open("/dev/tty")?;
        Self::from_file(file)
    }

    /// Poll an already open terminal or pipe. The descriptor is switched to
    /// non-blocking mode.
    pub fn from_file(file: File) -> Result<Self> {
        let fd = file.as_raw_fd();
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
        Ok(Self {
            fd: AsyncFd::with_interest(file, Interest::READABLE)?,
        })
    }
}

impl AsyncRead for TtyInput {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(unfilled)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn reads_what_the_writer_sends_then_eof() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut input = TtyInput::from_file(File::from(read_end)).unwrap();
        let mut writer = File::from(write_end);

        writer.write_all(b"ls\r").unwrap();
        let mut buf = [0u8; 16];
        let n = input.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ls\r");

        drop(writer);
        assert_eq!(input.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn idle_read_can_be_abandoned() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        let mut input = TtyInput::from_file(File::from(read_end)).unwrap();
        let mut buf = [0u8; 16];
        let idle = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            input.read(&mut buf),
        )
        .await;
        assert!(idle.is_err());
    }
}

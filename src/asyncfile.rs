use futures::ready;
use nix::fcntl::OFlag;
use nix::sys::termios::{self, BaudRate, FlushArg, SetArg};
use std::io::{self, Error, ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::AsyncWrite;

const READ_CHUNK: usize = 256;

/// Device node polled through the reactor, so a silent line never occupies a thread
pub struct AsyncFile {
    inner: AsyncFd<std::fs::File>,
    /// bytes read past the last returned line
    pending: Vec<u8>,
}

pub fn baud_rate(baud: u32) -> Option<BaudRate> {
    match baud {
        1200 => Some(BaudRate::B1200),
        2400 => Some(BaudRate::B2400),
        4800 => Some(BaudRate::B4800),
        9600 => Some(BaudRate::B9600),
        19200 => Some(BaudRate::B19200),
        38400 => Some(BaudRate::B38400),
        57600 => Some(BaudRate::B57600),
        115200 => Some(BaudRate::B115200),
        _ => None,
    }
}

impl AsyncFile {
    pub fn open(path: &str) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags((OFlag::O_NONBLOCK | OFlag::O_NOCTTY).bits())
            .open(path)?;
        Ok(Self {
            inner: AsyncFd::new(file)?,
            pending: vec![],
        })
    }

    /// Raw mode at the given speed, discarding anything queued before
    pub fn setup_tty(&self, baud: BaudRate) -> io::Result<()> {
        let fd = self.inner.get_ref();
        let mut attrs = termios::tcgetattr(fd)?;
        termios::cfmakeraw(&mut attrs);
        termios::cfsetspeed(&mut attrs, baud)?;
        termios::tcsetattr(fd, SetArg::TCSANOW, &attrs)?;
        termios::tcflush(fd, FlushArg::TCIOFLUSH)?;
        Ok(())
    }

    async fn read_some(&self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                let res = inner.get_ref().read(out);

                //handle Ok(0) results:
                if let Ok(len) = res {
                    if len == 0 {
                        return Err(Error::new(ErrorKind::UnexpectedEof, "device disconnected"));
                    }
                }

                res
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Next line without its terminator. Dropping the future loses no data.
    pub async fn read_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(String::from_utf8_lossy(&line)
                    .trim_end_matches(|c: char| c == '\r' || c == '\n')
                    .to_string());
            }
            let mut chunk = [0u8; READ_CHUNK];
            let len = self.read_some(&mut chunk).await?;
            self.pending.extend_from_slice(&chunk[..len]);
        }
    }
}

impl AsyncWrite for AsyncFile {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;

            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

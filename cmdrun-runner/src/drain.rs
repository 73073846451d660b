use os_pipe::PipeReader;
use std::io;
use std::os::fd::OwnedFd;
use std::time::Duration;
use tokio::net::unix::pipe;
use tokio::time;

const CHUNK_SIZE: usize = 4096;
/// Upper bound on bytes taken from one stream in a single pass
const MAX_PASS_BYTES: usize = 1 << 20;
/// Longest final flush, in ticks
const FLUSH_TICKS: u32 = 3;

/// One captured child stream: a non-blocking pipe plus everything read from it
struct Stream {
    pipe: Option<pipe::Receiver>,
    buffer: Vec<u8>,
}

impl Stream {
    fn open(reader: Option<PipeReader>) -> io::Result<Self> {
        let pipe = reader
            .map(|reader| pipe::Receiver::from_owned_fd(OwnedFd::from(reader)))
            .transpose()?;

        Ok(Self {
            pipe,
            buffer: Vec::new(),
        })
    }

    fn is_open(&self) -> bool {
        self.pipe.is_some()
    }

    /// Read until the pipe would block, reaches EOF or MAX_PASS_BYTES have
    /// been taken. EOF closes the pipe.
    fn read_available(&mut self, chunk: &mut [u8]) -> io::Result<usize> {
        let Some(pipe) = &self.pipe else {
            return Ok(0);
        };

        let mut total = 0;
        let mut eof = false;
        while total < MAX_PASS_BYTES {
            match pipe.try_read(chunk) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if eof {
            self.pipe = None;
        }
        Ok(total)
    }
}

/// Collects a child's output without ever blocking longer than one tick.
///
/// Holds the primary stream (combined output, or stdout in split mode) and,
/// in split mode, stderr. A stream that was not captured starts out closed.
pub struct OutputDrainer {
    output: Stream,
    stderr: Option<Stream>,
    chunk: Vec<u8>,
}

impl OutputDrainer {
    /// `split` decides whether the result reports a separate stderr buffer,
    /// even when stderr itself was discarded.
    pub fn new(
        output: Option<PipeReader>,
        stderr: Option<PipeReader>,
        split: bool,
    ) -> io::Result<Self> {
        let stderr = if split || stderr.is_some() {
            Some(Stream::open(stderr)?)
        } else {
            None
        };

        Ok(Self {
            output: Stream::open(output)?,
            stderr,
            chunk: vec![0; CHUNK_SIZE],
        })
    }

    /// True once every captured stream has reached EOF
    pub fn is_finished(&self) -> bool {
        !self.output.is_open() && !self.stderr.as_ref().is_some_and(Stream::is_open)
    }

    /// Wait up to `tick` for output, then take everything currently available.
    /// Returns the number of bytes read.
    pub async fn drain_for(&mut self, tick: Duration) -> io::Result<usize> {
        if self.is_finished() {
            return Ok(0);
        }

        if let Ok(ready) = time::timeout(tick, self.readable()).await {
            ready?;
        }

        let mut total = self.output.read_available(&mut self.chunk)?;
        if let Some(stderr) = &mut self.stderr {
            total += stderr.read_available(&mut self.chunk)?;
        }
        Ok(total)
    }

    /// Final flush once the child has exited. Stops at EOF on every pipe,
    /// after a pass with no new data, or once FLUSH_TICKS ticks have passed.
    /// Pipes still held open by a grandchild are left for `into_buffers`.
    pub async fn flush(&mut self, tick: Duration) -> io::Result<()> {
        let deadline = time::Instant::now() + tick * FLUSH_TICKS;

        while !self.is_finished() {
            let now = time::Instant::now();
            if now >= deadline {
                break;
            }
            if self.drain_for(tick.min(deadline - now)).await? == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Close any remaining pipes and hand back the buffers
    pub fn into_buffers(self) -> (Vec<u8>, Option<Vec<u8>>) {
        (self.output.buffer, self.stderr.map(|s| s.buffer))
    }

    async fn readable(&self) -> io::Result<()> {
        let output = self.output.pipe.as_ref();
        let stderr = self.stderr.as_ref().and_then(|s| s.pipe.as_ref());

        match (output, stderr) {
            (Some(out), Some(err)) => {
                tokio::select! {
                    ready = out.readable() => ready,
                    ready = err.readable() => ready,
                }
            }
            (Some(pipe), None) | (None, Some(pipe)) => pipe.readable().await,
            (None, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TICK: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_drain_reads_until_eof() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        let mut drainer = OutputDrainer::new(Some(reader), None, false).unwrap();

        writer.write_all(b"hello\n").unwrap();
        drop(writer);

        drainer.flush(TICK).await.unwrap();
        assert!(drainer.is_finished());

        let (output, stderr) = drainer.into_buffers();
        assert_eq!(output, b"hello\n");
        assert!(stderr.is_none());
    }

    #[tokio::test]
    async fn test_drain_does_not_block_on_open_pipe() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        let mut drainer = OutputDrainer::new(Some(reader), None, false).unwrap();

        let started = std::time::Instant::now();
        assert_eq!(drainer.drain_for(TICK).await.unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!drainer.is_finished());

        writer.write_all(b"partial").unwrap();
        let mut read = 0;
        for _ in 0..20 {
            read += drainer.drain_for(TICK).await.unwrap();
            if read == 7 {
                break;
            }
        }
        assert_eq!(read, 7);
        assert!(!drainer.is_finished());

        drop(writer);
        drainer.flush(TICK).await.unwrap();
        assert!(drainer.is_finished());
        assert_eq!(drainer.into_buffers().0, b"partial");
    }

    #[tokio::test]
    async fn test_split_streams_accumulate_separately() {
        let (out_reader, mut out_writer) = os_pipe::pipe().unwrap();
        let (err_reader, mut err_writer) = os_pipe::pipe().unwrap();
        let mut drainer =
            OutputDrainer::new(Some(out_reader), Some(err_reader), true).unwrap();

        out_writer.write_all(b"OUT1\n").unwrap();
        err_writer.write_all(b"ERR\n").unwrap();
        out_writer.write_all(b"OUT2\n").unwrap();
        drop(out_writer);
        drop(err_writer);

        drainer.flush(TICK).await.unwrap();
        let (output, stderr) = drainer.into_buffers();
        assert_eq!(output, b"OUT1\nOUT2\n");
        assert_eq!(stderr.unwrap(), b"ERR\n");
    }

    #[tokio::test]
    async fn test_drain_larger_than_pipe_buffer() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        let mut drainer = OutputDrainer::new(Some(reader), None, false).unwrap();

        let payload = vec![b'x'; 256 * 1024];
        let expected = payload.clone();
        let writer_thread = std::thread::spawn(move || {
            writer.write_all(&payload).unwrap();
        });

        while !drainer.is_finished() {
            drainer.drain_for(TICK).await.unwrap();
        }
        writer_thread.join().unwrap();

        assert_eq!(drainer.into_buffers().0, expected);
    }

    #[tokio::test]
    async fn test_flush_returns_while_writer_keeps_writing() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        let mut drainer = OutputDrainer::new(Some(reader), None, false).unwrap();

        writer.write_all(b"before\n").unwrap();
        let writer_thread = std::thread::spawn(move || {
            while writer.write_all(b"x\n").is_ok() {
                std::thread::sleep(Duration::from_millis(10));
            }
        });

        let started = std::time::Instant::now();
        drainer.flush(TICK).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!drainer.is_finished());

        let (output, _) = drainer.into_buffers();
        assert!(output.starts_with(b"before\n"));

        // The read end is closed now, so the writer sees EPIPE and stops
        writer_thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_nothing_captured_is_finished() {
        let drainer = OutputDrainer::new(None, None, true).unwrap();
        assert!(drainer.is_finished());
        let (output, stderr) = drainer.into_buffers();
        assert!(output.is_empty());
        assert_eq!(stderr, Some(Vec::new()));
    }
}

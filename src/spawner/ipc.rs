//! Line framing for worker pipes.
//!
//! The wire format is newline-delimited JSON in both directions. Workers
//! keep their pipe ends blocking and use plain buffered stdio; the
//! orchestrator switches its read end of every worker pipe to non-blocking
//! mode and reassembles frames across polls, so one slow worker can never
//! stall the control loop.

use std::io::{self, Read, Write};
use std::os::fd::AsFd;

use nix::fcntl::{FcntlArg, OFlag, fcntl};

/// Switch a descriptor to non-blocking mode.
pub fn set_nonblocking<F: AsFd>(fd: &F) -> io::Result<()> {
    let fd = fd.as_fd();
    let bits = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    let flags = OFlag::from_bits_truncate(bits) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

/// Write one newline-terminated frame and flush it through.
pub fn send_line<W: Write>(dst: &mut W, line: &str) -> io::Result<()> {
    dst.write_all(line.as_bytes())?;
    if !line.ends_with('\n') {
        dst.write_all(b"\n")?;
    }
    dst.flush()
}

/// One poll of a [`FrameReader`].
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete line was available.
    Line(String),
    /// No complete line buffered yet.
    Pending,
    /// The peer closed its end and the buffer is exhausted.
    Eof,
}

/// Reassembles newline-delimited frames from a non-blocking byte stream.
///
/// Partial lines accumulate internally across polls. A closed stream keeps
/// yielding buffered complete lines before reporting [`Frame::Eof`], so
/// nothing a worker wrote before dying is dropped.
pub struct FrameReader<R> {
    src: R,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(src: R) -> Self {
        Self {
            src,
            buf: Vec::with_capacity(4096),
            eof: false,
        }
    }

    /// Poll for the next complete line.
    ///
    /// Never blocks as long as `src` is in non-blocking mode.
    pub fn poll_line(&mut self) -> io::Result<Frame> {
        // Several lines may arrive in one read; serve buffered ones first.
        if let Some(line) = self.pop_line() {
            return Ok(Frame::Line(line));
        }

        let mut chunk = [0u8; 4096];
        while !self.eof {
            match self.src.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    if let Some(line) = self.pop_line() {
                        return Ok(Frame::Line(line));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Frame::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(match self.pop_line() {
            Some(line) => Frame::Line(line),
            None => Frame::Eof,
        })
    }

    fn pop_line(&mut self) -> Option<String> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        let rest = self.buf.split_off(end + 1);
        let mut line = std::mem::replace(&mut self.buf, rest);
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Read source replaying a scripted sequence of chunks and errors,
    /// followed by EOF.
    struct Script(VecDeque<io::Result<Vec<u8>>>);

    impl Script {
        fn new(steps: Vec<io::Result<Vec<u8>>>) -> FrameReader<Self> {
            FrameReader::new(Self(steps.into()))
        }
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    fn chunk(s: &str) -> io::Result<Vec<u8>> {
        Ok(s.as_bytes().to_vec())
    }

    fn would_block() -> io::Result<Vec<u8>> {
        Err(io::Error::new(io::ErrorKind::WouldBlock, "not ready"))
    }

    #[test]
    fn test_pending_then_line() {
        let mut reader = Script::new(vec![would_block(), chunk("one\n"), would_block()]);
        assert_eq!(reader.poll_line().unwrap(), Frame::Pending);
        assert_eq!(reader.poll_line().unwrap(), Frame::Line("one".into()));
        assert_eq!(reader.poll_line().unwrap(), Frame::Pending);
    }

    #[test]
    fn test_several_lines_in_one_chunk() {
        let mut reader = Script::new(vec![chunk("a\nb\nc\n"), would_block()]);
        assert_eq!(reader.poll_line().unwrap(), Frame::Line("a".into()));
        assert_eq!(reader.poll_line().unwrap(), Frame::Line("b".into()));
        assert_eq!(reader.poll_line().unwrap(), Frame::Line("c".into()));
        assert_eq!(reader.poll_line().unwrap(), Frame::Pending);
    }

    #[test]
    fn test_line_split_across_polls() {
        let mut reader = Script::new(vec![chunk("hel"), would_block(), chunk("lo\n")]);
        assert_eq!(reader.poll_line().unwrap(), Frame::Pending);
        assert_eq!(reader.poll_line().unwrap(), Frame::Line("hello".into()));
    }

    #[test]
    fn test_buffered_lines_survive_eof() {
        let mut reader = Script::new(vec![chunk("last words\n")]);
        assert_eq!(reader.poll_line().unwrap(), Frame::Line("last words".into()));
        assert_eq!(reader.poll_line().unwrap(), Frame::Eof);
        assert_eq!(reader.poll_line().unwrap(), Frame::Eof);
    }

    #[test]
    fn test_unterminated_tail_is_dropped_at_eof() {
        let mut reader = Script::new(vec![chunk("complete\nhalf a li")]);
        assert_eq!(reader.poll_line().unwrap(), Frame::Line("complete".into()));
        assert_eq!(reader.poll_line().unwrap(), Frame::Eof);
    }

    #[test]
    fn test_interrupted_read_is_retried() {
        let mut reader = Script::new(vec![
            Err(io::Error::new(io::ErrorKind::Interrupted, "signal")),
            chunk("x\n"),
        ]);
        assert_eq!(reader.poll_line().unwrap(), Frame::Line("x".into()));
    }

    #[test]
    fn test_crlf_is_stripped() {
        let mut reader = Script::new(vec![chunk("line1\r\n")]);
        assert_eq!(reader.poll_line().unwrap(), Frame::Line("line1".into()));
    }

    #[test]
    fn test_send_line_terminates_and_flushes() {
        let mut out = Vec::new();
        send_line(&mut out, "hello").unwrap();
        send_line(&mut out, "world\n").unwrap();
        assert_eq!(out, b"hello\nworld\n");
    }
}

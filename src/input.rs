//! Non-blocking drain of one descriptor into line records.
//!
//! Captured program streams split on newline into the reader's backlog (the
//! newline byte is kept, so the concatenation of backlog lines reproduces
//! the byte stream exactly). Client sessions leave classification to the
//! line editor: bytes accumulate in the working line until the client's
//! send buffer is idle, then get replayed through the key handler.

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;

use crate::line::{self, Line};

pub struct Input {
    pub fd: RawFd,
    pub is_telnet: bool,
    /// Finished lines not yet promoted (captured streams), or this client's
    /// command history (client sessions).
    pub backlog: VecDeque<Line>,
    /// Working line receiving raw bytes.
    pub line: Line,
}

impl Input {
    /// Wrap a descriptor, switching it to non-blocking.
    pub fn new(fd: RawFd) -> Self {
        set_nonblock(fd);
        Self {
            fd,
            is_telnet: false,
            backlog: VecDeque::new(),
            line: Line::new(),
        }
    }

    /// Placeholder for a stream that is not captured.
    pub fn idle() -> Self {
        Self {
            fd: -1,
            is_telnet: false,
            backlog: VecDeque::new(),
            line: Line::new(),
        }
    }

    /// Drain the descriptor until EAGAIN. With `split_lines` (captured
    /// streams) every newline commits a finished line into the backlog, and
    /// a line that would cross MAX_LINE_SIZE is committed early. Returns -1
    /// when the descriptor closed, 1 when the backlog holds lines, else 0.
    pub fn read(&mut self, readable: bool, split_lines: bool) -> i32 {
        if !readable || self.fd < 0 {
            return 0;
        }
        loop {
            if self.line.reserve(80) {
                if split_lines {
                    line::split(&mut self.backlog, &mut self.line);
                    continue;
                }
                // client input backpressure: leave the rest in the kernel
                break;
            }
            let len = self.line.buf.len();
            // Vec::reserve over-allocates; never read past the line cap or a
            // split could commit an oversized line
            let spare = (self.line.buf.capacity() - len).min(line::MAX_LINE_SIZE - len);
            let n = unsafe {
                libc::read(
                    self.fd,
                    self.line.buf.as_mut_ptr().add(len) as *mut libc::c_void,
                    spare,
                )
            };
            if n < 0 {
                match io::Error::last_os_error().raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => break,
                    Some(libc::EINTR) => continue,
                    _ => {
                        self.close_fd();
                        return -1;
                    }
                }
            }
            if n == 0 {
                self.close_fd();
                println!(
                    "{}mish: telnet: disconnected{}",
                    crate::COLOR_RED,
                    crate::COLOR_RESET
                );
                return -1;
            }
            // SAFETY: read() filled exactly n bytes of the reserved spare tail
            unsafe { self.line.buf.set_len(len + n as usize) };
            if split_lines {
                self.split_pending();
            }
        }
        if self.backlog.is_empty() {
            0
        } else {
            1
        }
    }

    /// Classify freshly received bytes: store everything, split at newline.
    fn split_pending(&mut self) {
        let mut start = 0usize;
        let mut i = self.line.done;
        while i < self.line.buf.len() {
            if self.line.buf[i] == b'\n' {
                line::add(&mut self.backlog, &self.line.buf[start..=i]);
                start = i + 1;
            }
            i += 1;
        }
        if start > 0 {
            self.line.buf.drain(..start);
        }
        self.line.done = self.line.buf.len();
    }

    fn close_fd(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }

    /// Drop buffered lines and close the descriptor.
    pub fn clear(&mut self) {
        self.backlog.clear();
        self.line = Line::new();
        self.close_fd();
    }
}

fn set_nonblock(fd: RawFd) {
    if fd < 0 {
        return;
    }
    unsafe {
        let mut flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == 1 || flags == -1 {
            flags = 0;
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            eprintln!("mish: input F_SETFL: {}", io::Error::last_os_error());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        unsafe {
            libc::pipe(fds.as_mut_ptr());
        }
        (fds[0], fds[1])
    }

    fn write_all(fd: RawFd, bytes: &[u8]) {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        assert_eq!(n as usize, bytes.len());
    }

    #[test]
    fn newline_splits_lines_with_terminator() {
        let (r, w) = pipe();
        let mut input = Input::new(r);
        write_all(w, b"hello\nworld\n");
        assert_eq!(input.read(true, true), 1);
        assert_eq!(input.backlog.len(), 2);
        assert_eq!(&input.backlog[0].buf, b"hello\n");
        assert_eq!(&input.backlog[1].buf, b"world\n");
        assert!(input.line.is_empty());
        input.clear();
        unsafe {
            libc::close(w);
        }
    }

    #[test]
    fn partial_line_stays_in_working_buffer() {
        let (r, w) = pipe();
        let mut input = Input::new(r);
        write_all(w, b"no newline yet");
        assert_eq!(input.read(true, true), 0);
        assert!(input.backlog.is_empty());
        assert_eq!(&input.line.buf, b"no newline yet");
        write_all(w, b" done\n");
        assert_eq!(input.read(true, true), 1);
        assert_eq!(&input.backlog[0].buf, b"no newline yet done\n");
        input.clear();
        unsafe {
            libc::close(w);
        }
    }

    #[test]
    fn byte_stream_is_reproduced_exactly() {
        // fragmented writes, odd boundaries: backlog concatenation == input
        let (r, w) = pipe();
        let mut input = Input::new(r);
        let data = b"alpha\nbr".to_vec();
        write_all(w, &data);
        input.read(true, true);
        let data2 = b"avo\n\ncharlie\n".to_vec();
        write_all(w, &data2);
        input.read(true, true);
        let mut all = Vec::new();
        for l in &input.backlog {
            all.extend_from_slice(&l.buf);
        }
        all.extend_from_slice(&input.line.buf);
        let mut expect = data;
        expect.extend_from_slice(&data2);
        assert_eq!(all, expect);
        input.clear();
        unsafe {
            libc::close(w);
        }
    }

    #[test]
    fn eof_closes_descriptor() {
        let (r, w) = pipe();
        let mut input = Input::new(r);
        write_all(w, b"tail\n");
        unsafe {
            libc::close(w);
        }
        // first pass drains the data, second sees EOF
        input.read(true, true);
        assert_eq!(input.read(true, true), -1);
        assert_eq!(input.fd, -1);
    }

    #[test]
    fn not_readable_is_a_no_op() {
        let (r, w) = pipe();
        let mut input = Input::new(r);
        assert_eq!(input.read(false, true), 0);
        input.clear();
        unsafe {
            libc::close(w);
        }
    }
}

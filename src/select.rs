use std::io;
use std::os::fd::RawFd;

pub const READ: i16 = libc::POLLIN;
pub const WRITE: i16 = libc::POLLOUT;

/// Readiness results of one poll round, keyed by descriptor.
#[derive(Debug, Default)]
pub struct Readiness {
    fds: Vec<(RawFd, i16)>,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Hangup and error both count as readable so EOF is observed by read().
    pub fn readable(&self, fd: RawFd) -> bool {
        fd >= 0
            && self.fds.iter().any(|(f, r)| {
                *f == fd && (r & (READ | libc::POLLHUP | libc::POLLERR)) != 0
            })
    }

    pub fn writable(&self, fd: RawFd) -> bool {
        fd >= 0 && self.fds.iter().any(|(f, r)| *f == fd && (r & WRITE) != 0)
    }
}

pub fn poll_fds(fds: &[(RawFd, i16)], timeout_ms: i32) -> io::Result<Readiness> {
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|(fd, ev)| libc::pollfd {
            fd: *fd,
            events: *ev,
            revents: 0,
        })
        .collect();
    let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut out = Readiness::default();
    for p in pfds {
        if p.revents != 0 {
            out.fds.push((p.fd, p.revents));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::{FromRawFd, IntoRawFd};

    #[test]
    fn poll_pipe_readable() {
        let mut fds = [0; 2];
        unsafe {
            libc::pipe(fds.as_mut_ptr());
        }
        let r = fds[0];
        let w = fds[1];
        // write to pipe so it's readable
        let mut f = unsafe { std::fs::File::from_raw_fd(w) };
        f.write_all(b"x").unwrap();
        // Leak file descriptor back so drop doesn't close both
        let _ = f.into_raw_fd();
        let ready = poll_fds(&[(r, READ)], 100).unwrap();
        assert!(ready.readable(r));
        assert!(!ready.writable(r));
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn poll_timeout_is_empty() {
        let mut fds = [0; 2];
        unsafe {
            libc::pipe(fds.as_mut_ptr());
        }
        let ready = poll_fds(&[(fds[0], READ)], 10).unwrap();
        assert!(ready.is_empty());
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}

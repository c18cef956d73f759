//! Scatter/gather output assembly, one per client.
//!
//! Two segment kinds share the outgoing vector: inline bytes copied into a
//! growing composition line (prompts, cursor motion, colors) and zero-copy
//! references into scrollback lines. Inline segments store offsets, not
//! addresses; the composition line may reallocate while segments are added,
//! so addresses are only materialized at flush time. The first flush locks
//! the buffer: nothing may be appended until the whole vector has drained,
//! which keeps any one line's payload contiguous on the wire.

use std::io;
use std::os::fd::RawFd;

use crate::scrollback::Scrollback;

enum Seg {
    Inline { off: usize, len: usize },
    Ref { seq: u64, off: usize, len: usize },
}

pub struct SendBuf {
    pub fd: RawFd,
    segs: Vec<Seg>,
    /// Composition line for inline segments.
    sqb: Vec<u8>,
    /// Set on the first flush attempt; cleared when the vector drains.
    pub locked: bool,
    /// Write-readiness interest, mirrored into the supervisor's poll set.
    pub want_write: bool,
    /// Lifetime byte counter, used to bound one screenful per burst.
    pub total: usize,
}

impl SendBuf {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            segs: Vec::new(),
            sqb: Vec::new(),
            locked: false,
            want_write: false,
            total: 0,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.segs.is_empty()
    }

    /// Number of vector slots currently allocated (status display).
    pub fn vec_size(&self) -> usize {
        self.segs.capacity()
    }

    /// Append literal bytes to the composition line. Successive inline
    /// appends coalesce into one vector entry.
    pub fn queue(&mut self, b: &[u8]) {
        if self.locked {
            panic!("mish: send queue while flushing");
        }
        if b.is_empty() {
            return;
        }
        self.total += b.len();
        let off = self.sqb.len();
        self.sqb.extend_from_slice(b);
        if let Some(Seg::Inline { len, .. }) = self.segs.last_mut() {
            *len += b.len();
        } else {
            self.segs.push(Seg::Inline { off, len: b.len() });
        }
    }

    /// Append a zero-copy reference to a scrollback line. The seq is
    /// resolved at flush time; if the evictor reclaimed it meanwhile the
    /// segment is dropped instead of dangling.
    pub fn queue_line(&mut self, seq: u64, len: usize) {
        if self.locked {
            panic!("mish: send queue while flushing");
        }
        if len == 0 {
            return;
        }
        self.total += len;
        self.segs.push(Seg::Ref { seq, off: 0, len });
    }

    /// Inline composition content, oldest first (tests and status).
    pub fn queued_bytes(&self) -> Vec<u8> {
        self.sqb.clone()
    }

    /// Push the vector at the descriptor. Returns true while more remains
    /// ("call me again when writable"): the first call only raises write
    /// interest, later calls issue one vectored write each. On completion
    /// the buffer unlocks and write interest drops unless `still_sending`.
    pub fn flush(&mut self, sb: &Scrollback, still_sending: bool) -> bool {
        if !self.locked {
            self.locked = true;
        }
        // forget refs the evictor reclaimed while we waited
        self.segs.retain(|s| match s {
            Seg::Ref { seq, .. } => sb.get(*seq).is_some(),
            Seg::Inline { .. } => true,
        });
        if self.segs.is_empty() {
            self.finish(still_sending);
            return false;
        }
        if !self.want_write {
            self.want_write = true;
            return true;
        }
        let mut iov: Vec<libc::iovec> = Vec::with_capacity(self.segs.len());
        for s in &self.segs {
            let (base, len) = match s {
                Seg::Inline { off, len } => (unsafe { self.sqb.as_ptr().add(*off) }, *len),
                Seg::Ref { seq, off, len } => match sb.get(*seq) {
                    Some(l) => (unsafe { l.buf.as_ptr().add(*off) }, *len),
                    None => continue,
                },
            };
            iov.push(libc::iovec {
                iov_base: base as *mut libc::c_void,
                iov_len: len,
            });
        }
        let n = unsafe { libc::writev(self.fd, iov.as_ptr(), iov.len() as libc::c_int) };
        if n < 0 {
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => return true,
                _ => {
                    // peer went away; drop everything quietly, the capture
                    // supervisor reaps the client on its read side
                    self.segs.clear();
                    self.finish(still_sending);
                    self.want_write = false;
                    return false;
                }
            }
        }
        let mut got = n as usize;
        while got > 0 && !self.segs.is_empty() {
            let drained = {
                let s = &mut self.segs[0];
                let (off, len) = match s {
                    Seg::Inline { off, len } => (off, len),
                    Seg::Ref { off, len, .. } => (off, len),
                };
                let take = got.min(*len);
                *off += take;
                *len -= take;
                got -= take;
                *len == 0
            };
            if drained {
                self.segs.remove(0);
            }
        }
        if self.segs.is_empty() {
            self.finish(still_sending);
            return false;
        }
        true
    }

    fn finish(&mut self, still_sending: bool) {
        self.locked = false;
        self.sqb.clear();
        self.segs.clear();
        if !still_sending {
            self.want_write = false;
        }
    }
}

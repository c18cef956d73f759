//! Send buffer draining against a descriptor that cannot take the whole
//! vector at once: partial writes must advance segments without losing or
//! duplicating a byte.

use std::os::fd::RawFd;

use mish::line::Line;
use mish::scrollback::Scrollback;
use mish::send::SendBuf;

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr());
    }
    (fds[0], fds[1])
}

fn set_nonblock(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn shrink_sndbuf(fd: RawFd) {
    let size: libc::c_int = 4096;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

fn read_chunk(fd: RawFd) -> Vec<u8> {
    let mut buf = [0u8; 8192];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n <= 0 {
        Vec::new()
    } else {
        buf[..n as usize].to_vec()
    }
}

#[test]
fn backpressured_vector_drains_exactly_once() {
    let (reader, writer) = socketpair();
    shrink_sndbuf(writer);
    set_nonblock(writer);
    // the first flush only raises write interest; a blocking read here
    // would wait forever
    set_nonblock(reader);

    let mut sb = Scrollback::new();
    let mut expect = Vec::new();
    let mut out = SendBuf::new(writer);

    // a screenful of interleaved control strings and line references
    for i in 0..200 {
        let text = format!("scrollback line number {:04} with some padding\n", i);
        let seq = sb.push(Line::tight(text.as_bytes()));
        let ctl = format!("\x1b[{};1H", (i % 22) + 1);
        out.queue(ctl.as_bytes());
        out.queue_line(seq, text.len());
        expect.extend_from_slice(ctl.as_bytes());
        expect.extend_from_slice(text.as_bytes());
    }
    let total_before = out.total;
    assert_eq!(total_before, expect.len());

    let mut got = Vec::new();
    let mut spins = 0;
    let mut more = out.flush(&sb, false);
    while more {
        got.extend_from_slice(&read_chunk(reader));
        more = out.flush(&sb, false);
        spins += 1;
        assert!(spins < 10_000, "flush never finished");
    }
    got.extend_from_slice(&read_chunk(reader));
    while got.len() < expect.len() {
        let chunk = read_chunk(reader);
        if chunk.is_empty() {
            break;
        }
        got.extend_from_slice(&chunk);
    }

    // byte-exact: nothing lost, nothing doubled, order preserved
    assert_eq!(got, expect);
    assert!(!out.has_pending());
    assert!(!out.locked);

    unsafe {
        libc::close(reader);
        libc::close(writer);
    }
}

#[test]
fn queue_after_drain_reuses_the_buffer() {
    let (reader, writer) = socketpair();
    let sb = Scrollback::new();
    let mut out = SendBuf::new(writer);

    out.queue(b"first burst\n");
    while out.flush(&sb, false) {}
    assert_eq!(read_chunk(reader), b"first burst\n");

    // unlocked again: a second composition starts clean
    out.queue(b"second burst\n");
    while out.flush(&sb, false) {}
    assert_eq!(read_chunk(reader), b"second burst\n");

    unsafe {
        libc::close(reader);
        libc::close(writer);
    }
}

//! Interactive client behavior over a real socketpair: window-size probe,
//! NAWS-driven telnet sessions, the split-screen draw, and stderr coloring
//! on the wire.

use std::os::fd::RawFd;

use mish::client::{Client, ClientFlags};
use mish::line::Line;
use mish::scrollback::Scrollback;
use mish::telnet::{DO, IAC, SB, SE, TELOPT_ECHO, TELOPT_NAWS, TELOPT_SGA, WILL};

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr());
    }
    (fds[0], fds[1])
}

fn read_avail(fd: RawFd) -> Vec<u8> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        let mut buf = [0u8; 65536];
        let n = libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        libc::fcntl(fd, libc::F_SETFL, flags);
        if n <= 0 {
            Vec::new()
        } else {
            buf[..n as usize].to_vec()
        }
    }
}

fn send_bytes(fd: RawFd, bytes: &[u8]) {
    let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    assert_eq!(n as usize, bytes.len());
}

fn new_client(tty: bool) -> (Box<Client>, RawFd) {
    let (ours, theirs) = socketpair();
    let dup = unsafe { libc::dup(theirs) };
    (Client::new(std::ptr::null_mut(), theirs, dup, tty), ours)
}

/// One supervisor iteration, minus the poll: resume the coroutine, then
/// drain whatever the peer sent.
fn iterate(c: &mut Client, sb: &Scrollback) {
    c.step(sb);
    c.input.read(true, false);
    c.drain_input(sb);
}

#[test]
fn telnet_session_negotiates_then_draws_from_naws() {
    let (mut c, peer) = new_client(true);
    c.input.is_telnet = true;
    let mut sb = Scrollback::new();
    sb.push(Line::tight(b"captured output\n"));

    for _ in 0..3 {
        iterate(&mut c, &sb);
    }
    let greeting = read_avail(peer);
    // option negotiation leads, the window probe follows
    let init = [
        IAC, DO, TELOPT_ECHO,
        IAC, DO, TELOPT_NAWS,
        IAC, WILL, TELOPT_ECHO,
        IAC, WILL, TELOPT_SGA,
    ];
    assert!(greeting.starts_with(&init));
    assert!(greeting
        .windows(4)
        .any(|w| w == b"\x1b[6n"));

    // the peer answers with NAWS instead of a cursor report
    send_bytes(peer, &[IAC, SB, TELOPT_NAWS, 0x00, 0x50, 0x00, 0x18, IAC, SE]);
    for _ in 0..8 {
        iterate(&mut c, &sb);
    }
    assert_eq!(c.window_size, (80, 24));
    assert!(c.has(ClientFlags::HAS_WINDOW_SIZE));
    assert!(c.has(ClientFlags::SCROLLING));

    let drawn = read_avail(peer);
    let s = String::from_utf8_lossy(&drawn);
    assert!(s.contains("\x1b[1;22r"), "scrolling region: {:?}", s);
    assert!(s.contains(">>: "), "prompt: {:?}", s);
    assert!(s.contains("captured output\n"), "backlog replay: {:?}", s);

    c.teardown();
    unsafe {
        libc::close(peer);
    }
}

#[test]
fn stderr_output_reaches_the_wire_in_red() {
    let (mut c, peer) = new_client(true);
    let mut sb = Scrollback::new();

    for _ in 0..3 {
        iterate(&mut c, &sb);
    }
    read_avail(peer);
    // terminal cursor-position report completes the probe
    send_bytes(peer, b"\x1b[24;80R");
    for _ in 0..4 {
        iterate(&mut c, &sb);
    }
    read_avail(peer);

    let mut l = Line::tight(b"oops\n");
    l.err = true;
    sb.push(l);
    for _ in 0..6 {
        iterate(&mut c, &sb);
    }
    let got = String::from_utf8_lossy(&read_avail(peer)).into_owned();
    let red = got.find("\x1b[38;5;125m").expect("red SGR prefix");
    let text = got.find("oops\n").expect("stderr payload");
    let reset = got[text..].find("\x1b[0m").map(|i| i + text).expect("reset");
    assert!(red < text && text < reset);

    c.teardown();
    unsafe {
        libc::close(peer);
    }
}

#[test]
fn typed_bytes_echo_through_the_prompt() {
    let (mut c, peer) = new_client(true);
    let sb = Scrollback::new();

    for _ in 0..3 {
        iterate(&mut c, &sb);
    }
    read_avail(peer);
    send_bytes(peer, b"\x1b[24;80R");
    for _ in 0..4 {
        iterate(&mut c, &sb);
    }
    read_avail(peer);

    send_bytes(peer, b"mish");
    for _ in 0..6 {
        iterate(&mut c, &sb);
    }
    let echoed = read_avail(peer);
    assert!(String::from_utf8_lossy(&echoed).contains("mish"));

    c.teardown();
    unsafe {
        libc::close(peer);
    }
}

#[test]
fn live_tail_follows_new_lines_one_at_a_time() {
    let (mut c, peer) = new_client(true);
    let mut sb = Scrollback::new();

    for _ in 0..3 {
        iterate(&mut c, &sb);
    }
    read_avail(peer);
    send_bytes(peer, b"\x1b[24;80R");
    for _ in 0..4 {
        iterate(&mut c, &sb);
    }
    read_avail(peer);

    sb.push(Line::tight(b"first\n"));
    sb.push(Line::tight(b"second\n"));
    for _ in 0..10 {
        iterate(&mut c, &sb);
    }
    let got = String::from_utf8_lossy(&read_avail(peer)).into_owned();
    let a = got.find("first\n").expect("first line");
    let b = got.find("second\n").expect("second line");
    assert!(a < b);
    // caught up with the tail
    assert_eq!(c.bottom, sb.last_seq());

    c.teardown();
    unsafe {
        libc::close(peer);
    }
}

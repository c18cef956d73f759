//! One attached session: the console wrapping the original terminal, or a
//! remote telnet peer.
//!
//! Each client runs a stackless coroutine: `step` resumes exactly where the
//! last call suspended, and every piece of resumable state lives on the
//! client record, never in locals. The interactive variant keeps a
//! split-screen layout (scrolling region above a two-row prompt footer); the
//! dumb variant just appends lines as they arrive.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::input::Input;
use crate::line;
use crate::scrollback::Scrollback;
use crate::send::SendBuf;
use crate::session::Engine;
use crate::telnet;
use crate::vt::VtSequence;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientFlags: u32 {
        const INIT_SENT = 1 << 0;
        const HAS_WINDOW_SIZE = 1 << 1;
        const HAS_CURSOR_POS = 1 << 2;
        const UPDATE_PROMPT = 1 << 3;
        const UPDATE_WINDOW = 1 << 4;
        /// Following the live tail of the scrollback.
        const SCROLLING = 1 << 5;
        /// A committed unsafe command awaits the runner thread.
        const HAS_CMD = 1 << 6;
        /// Teardown requested; the supervisor reaps on its next iteration.
        const DELETE = 1 << 7;
    }
}

/// Resume points of the per-client coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrState {
    Start,
    ProbeFlush,
    ProbeWait,
    Draw,
    Loop,
    LoopFlush,
    Send,
    DumbStart,
    DumbLoop,
    DumbFlush,
}

pub struct Client {
    /// Backpointer into the owning engine; null in component tests.
    pub mish: *mut Engine,
    /// Pending-signal bits, atomic because command handlers flip them from
    /// the runner thread.
    pub flags: AtomicU32,
    /// Interactive split-screen renderer, or the dumb fallback. Downgraded
    /// permanently when the window-size probe times out.
    pub interactive: bool,
    pub state: CrState,
    /// Static rows at the bottom of the screen holding the prompt.
    pub footer_height: i32,
    pub current_vpos: i32,
    /// Youngest scrollback line currently on-screen; None = live tail.
    pub bottom: Option<u64>,
    /// Next scrollback line to emit, when mid-burst.
    pub sending: Option<u64>,
    pub out: SendBuf,
    /// Prompt bytes plus its on-screen glyph count: escape sequences and
    /// multi-byte glyphs in the prompt do not advance the cursor.
    pub prompt: String,
    pub prompt_gc: usize,
    /// Raw session input; its backlog doubles as this client's history.
    pub input: Input,
    /// Decoder for prompt-side key and escape sequences; the telnet decoder
    /// rides the same state.
    pub vts: VtSequence,
    /// Index of the line being edited, into `input.backlog`.
    pub cmd: Option<usize>,
    pub window_size: (i32, i32),
    pub cursor_pos: (i32, i32),
    pub probe_stamp: u64,
}

// SAFETY: the capture thread is the sole owner of client records; command
// handlers on the runner thread only touch the atomic flag word through the
// raw pointer they receive as parameter.
unsafe impl Send for Client {}

impl Client {
    pub fn new(mish: *mut Engine, in_fd: RawFd, out_fd: RawFd, is_tty: bool) -> Box<Client> {
        set_nonblock(out_fd);
        let input = Input::new(in_fd); // sets its own fd non-blocking
        Box::new(Client {
            mish,
            flags: AtomicU32::new(0),
            interactive: is_tty,
            state: if is_tty { CrState::Start } else { CrState::DumbStart },
            footer_height: 2,
            current_vpos: 0,
            bottom: None,
            sending: None,
            out: SendBuf::new(out_fd),
            prompt: String::new(),
            prompt_gc: 0,
            input,
            vts: VtSequence::new(),
            cmd: None,
            window_size: (0, 0),
            cursor_pos: (0, 0),
            probe_stamp: 0,
        })
    }

    pub fn has(&self, f: ClientFlags) -> bool {
        self.flags.load(Ordering::Relaxed) & f.bits() != 0
    }

    pub fn set(&self, f: ClientFlags) {
        self.flags.fetch_or(f.bits(), Ordering::Relaxed);
    }

    pub fn clear(&self, f: ClientFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::Relaxed);
    }

    /// Restore the peer terminal and close both descriptors. Blocking mode
    /// comes back first so the restore string cannot hit EAGAIN.
    pub fn teardown(&mut self) {
        for fd in [self.input.fd, self.out.fd] {
            if fd >= 0 {
                set_block(fd);
            }
        }
        if self.out.fd >= 0 {
            let restore = b"\x1b[4l\x1b[;r\x1b[999;1H";
            unsafe {
                let _ = libc::write(
                    self.out.fd,
                    restore.as_ptr() as *const libc::c_void,
                    restore.len(),
                );
                libc::close(self.out.fd);
            }
            self.out.fd = -1;
        }
        self.input.clear();
    }

    /// Recompute the prompt's glyph count by running the VT decoder over it:
    /// only completed glyphs advance the cursor.
    pub fn set_prompt(&mut self, p: &str) {
        if self.prompt != p {
            self.prompt = p.to_string();
        }
        let mut sq = VtSequence::new();
        self.prompt_gc = 0;
        for &b in self.prompt.as_bytes() {
            if sq.feed(b) && sq.glyph != 0 {
                self.prompt_gc += 1;
            }
        }
    }

    fn flush_out(&mut self, sb: &Scrollback) -> bool {
        let still = self.sending.is_some();
        self.out.flush(sb, still)
    }

    /// Resume the coroutine until it next suspends.
    pub fn step(&mut self, sb: &Scrollback) {
        if self.interactive {
            self.step_interactive(sb)
        } else {
            self.step_dumb(sb)
        }
    }

    fn step_interactive(&mut self, sb: &Scrollback) {
        loop {
            match self.state {
                CrState::Start => {
                    if self.input.is_telnet {
                        telnet::send_init(&mut self.out);
                    }
                    // park the cursor far out, then ask where it ended up:
                    // the position report is the window size
                    self.out.queue(b"\x1b[999;999H\x1b[6n");
                    self.state = CrState::ProbeFlush;
                }
                CrState::ProbeFlush => {
                    if self.flush_out(sb) {
                        return;
                    }
                    self.probe_stamp = line::stamp_ms();
                    self.state = CrState::ProbeWait;
                }
                CrState::ProbeWait => {
                    // either the terminal's CPR or a telnet NAWS will do
                    if !self.has(ClientFlags::HAS_CURSOR_POS | ClientFlags::HAS_WINDOW_SIZE) {
                        if line::stamp_ms() - self.probe_stamp < 2_000 {
                            return;
                        }
                        println!("mish: no window size, falling back to dumb scrollback");
                        self.interactive = false;
                        self.state = CrState::DumbStart;
                        return;
                    }
                    if self.has(ClientFlags::HAS_CURSOR_POS) {
                        self.window_size = (self.cursor_pos.0, self.cursor_pos.1);
                        self.set(ClientFlags::HAS_WINDOW_SIZE);
                    }
                    self.set(ClientFlags::INIT_SENT | ClientFlags::SCROLLING);
                    self.bottom = sb.last_seq();
                    self.state = CrState::Draw;
                }
                CrState::Draw => {
                    self.set(ClientFlags::UPDATE_PROMPT);
                    self.sending = self.bottom;
                    self.current_vpos = self.window_size.1 - self.footer_height;
                    // walk back from `bottom` until the top of the window or
                    // the top of the scrollback
                    while self.sending.is_some() && self.current_vpos >= 1 {
                        match self.sending.and_then(|s| sb.prev(s)) {
                            Some(p) => {
                                self.sending = Some(p);
                                self.current_vpos -= 1;
                            }
                            None => break,
                        }
                    }
                    self.out.queue(
                        format!(
                            "\x1bD\x1b[1;{}r",
                            self.window_size.1 - self.footer_height
                        )
                        .as_bytes(),
                    );
                    self.out
                        .queue(format!("\x1b[{};1H\x1b[J", self.current_vpos).as_bytes());
                    self.state = CrState::Loop;
                }
                CrState::Loop => {
                    if self.has(ClientFlags::UPDATE_WINDOW) {
                        self.clear(ClientFlags::UPDATE_WINDOW);
                        self.state = CrState::Draw;
                        continue;
                    }
                    if self.has(ClientFlags::UPDATE_PROMPT) {
                        self.clear(ClientFlags::UPDATE_PROMPT);
                        self.set_prompt(">>: ");
                        self.out.queue(
                            format!(
                                "\x1b[{};1H{}\x1b[J\x1b[4h",
                                self.window_size.1 - self.footer_height + 1,
                                self.prompt
                            )
                            .as_bytes(),
                        );
                        if let Some(ci) = self.cmd {
                            let (bytes, len, done) = {
                                let l = &self.input.backlog[ci];
                                (l.buf.clone(), l.len(), l.done)
                            };
                            if len > 0 {
                                self.out.queue(&bytes);
                                if len > done {
                                    self.out
                                        .queue(format!("\x1b[{}D", len - done).as_bytes());
                                }
                            }
                        }
                    }
                    self.state = CrState::LoopFlush;
                }
                CrState::LoopFlush => {
                    if self.out.has_pending() {
                        if self.flush_out(sb) {
                            return;
                        }
                        self.state = CrState::Send;
                    } else {
                        // idle pacing: one yield per supervisor iteration
                        self.state = CrState::Send;
                        return;
                    }
                }
                CrState::Send => {
                    if self.sending.is_none() {
                        match self.bottom {
                            None => {
                                self.bottom = sb.last_seq();
                                self.sending = self.bottom;
                            }
                            Some(b) => {
                                if self.has(ClientFlags::SCROLLING) {
                                    if let Some(next) = sb.next(b) {
                                        self.bottom = Some(next);
                                        self.sending = Some(next);
                                    }
                                }
                            }
                        }
                    }
                    if self.sending.is_none() {
                        self.state = CrState::Loop;
                        continue;
                    }
                    let start = self.out.total;
                    // reposition into the scrolling area, replace mode
                    self.out.queue(
                        format!("\x1b[s\x08\x1b[{};1H\x1b[4l", self.current_vpos).as_bytes(),
                    );
                    // send up to one screenful, so the prompt stays serviced
                    let screen_worth = (self.window_size.0 * self.window_size.1).max(0) as usize;
                    loop {
                        let s = match self.sending {
                            Some(s) => s,
                            None => break,
                        };
                        if let Some(l) = sb.get(s) {
                            if l.err {
                                self.out.queue(crate::COLOR_RED.as_bytes());
                            }
                            self.out.queue_line(s, l.len());
                            if l.err {
                                self.out.queue(b"\x1b[0m");
                            }
                        }
                        self.sending = if Some(s) == self.bottom {
                            None
                        } else {
                            sb.next(s)
                        };
                        if self.sending.is_none() || self.out.total - start > screen_worth {
                            break;
                        }
                    }
                    if self.sending.is_none() {
                        self.current_vpos = self.window_size.1 - self.footer_height;
                    }
                    self.out.queue(b"\x1b[u");
                    self.state = CrState::Loop;
                }
                // dumb states are unreachable from the interactive variant
                _ => {
                    self.state = CrState::DumbLoop;
                    return;
                }
            }
        }
    }

    fn step_dumb(&mut self, sb: &Scrollback) {
        loop {
            match self.state {
                CrState::DumbStart => {
                    println!(
                        "{}mish: Started dumb console{}",
                        crate::COLOR_RED,
                        crate::COLOR_RESET
                    );
                    self.state = CrState::DumbLoop;
                    return;
                }
                CrState::DumbLoop => {
                    if self.sending.is_none() {
                        match self.bottom {
                            None => {
                                self.bottom = sb.last_seq();
                                self.sending = self.bottom;
                            }
                            Some(b) => {
                                if let Some(next) = sb.next(b) {
                                    self.sending = Some(next);
                                    self.bottom = sb.last_seq();
                                }
                            }
                        }
                    }
                    if self.sending.is_none() {
                        return;
                    }
                    loop {
                        let s = match self.sending {
                            Some(s) => s,
                            None => break,
                        };
                        if let Some(l) = sb.get(s) {
                            self.out.queue_line(s, l.len());
                        }
                        self.sending = if Some(s) == self.bottom {
                            None
                        } else {
                            sb.next(s)
                        };
                    }
                    self.state = CrState::DumbFlush;
                }
                CrState::DumbFlush => {
                    if self.flush_out(sb) {
                        return;
                    }
                    self.state = CrState::DumbLoop;
                    return;
                }
                // a client downgraded mid-probe lands here
                _ => {
                    self.state = CrState::DumbStart;
                }
            }
        }
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
            eprintln!("mish: client F_SETFL: {}", io::Error::last_os_error());
        }
    }
}

fn set_block(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            let _ = libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
        }
    }
}

fn cmd_history(param: *mut libc::c_void, _argv: &[&str]) {
    if param.is_null() {
        return;
    }
    // SAFETY: the parameter of a CLIENT_CMD_KIND handler is the invoking
    // client; the capture thread owns it, this is a read-only status peek.
    let c = unsafe { &*(param as *mut Client) };
    let mut i = 0;
    for l in &c.input.backlog {
        println!("{:3} {}", i + 1, String::from_utf8_lossy(&l.buf));
        i += 1;
    }
    println!(
        "{}mish: {} history{}",
        crate::COLOR_GREEN,
        i,
        crate::COLOR_RESET
    );
}

fn cmd_disconnect(param: *mut libc::c_void, _argv: &[&str]) {
    if param.is_null() {
        return;
    }
    // SAFETY: see cmd_history; only the atomic flag word is written.
    let c = unsafe { &*(param as *mut Client) };
    let console = if c.mish.is_null() {
        std::ptr::null_mut()
    } else {
        unsafe { (*c.mish).console }
    };
    if param as *mut Client == console {
        println!(
            "{}mish: can't disconnect console{}",
            crate::COLOR_RED,
            crate::COLOR_RESET
        );
        return;
    }
    println!(
        "{}mish: telnet: logout{}",
        crate::COLOR_GREEN,
        crate::COLOR_RESET
    );
    c.set(ClientFlags::DELETE);
}

pub(crate) fn register_builtins() {
    crate::cmd::register_cmd_kind(
        &["history"],
        &["Display the history of commands."],
        cmd_history,
        std::ptr::null_mut(),
        false,
        crate::cmd::CLIENT_CMD_KIND,
    );
    crate::cmd::register_cmd_kind(
        &["dis", "disconnect", "logout"],
        &["Disconnect this telnet session. If appropriate"],
        cmd_disconnect,
        std::ptr::null_mut(),
        false,
        crate::cmd::CLIENT_CMD_KIND,
    );
}

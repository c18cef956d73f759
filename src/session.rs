//! Engine lifecycle: descriptor redirection through pseudo-terminals,
//! terminal mode save/restore, worker threads and the process-exit hook.
//!
//! `prepare` steals fds 1 and 2 (dup2 of pty slaves), wraps the original
//! terminal as the console client, optionally opens the telnet listener,
//! and starts the capture and command-runner threads. `terminate` undoes
//! all of it and is also wired to process exit.

use std::io::{self, Write};
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use libc::c_void;

use crate::capture;
use crate::client::Client;
use crate::cmd;
use crate::input::Input;
use crate::line;
use crate::scrollback::Scrollback;
use crate::telnet;

bitflags! {
    /// Capability flags accepted by `prepare`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        /// Leave fd 2 alone.
        const NO_STDERR = 1 << 0;
        /// Treat fds 0/1/2 as a tty even when they are not.
        const FORCE_PTY = 1 << 1;
        /// No remote sessions.
        const NO_TELNET = 1 << 2;
    }
}

// engine-internal bits sharing the flags word with the caps
pub const QUIT: u32 = 1 << 31;
pub const CONSOLE_TTY: u32 = 1 << 30;
pub const CLEAR_BACKLOG: u32 = 1 << 29;

/// Counting semaphore gating the command-runner thread.
pub struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut n = self.count.lock().unwrap();
        *n += 1;
        self.cv.notify_one();
    }

    pub fn wait(&self) {
        let mut n = self.count.lock().unwrap();
        while *n == 0 {
            n = self.cv.wait(n).unwrap();
        }
        *n -= 1;
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide engine singleton.
pub struct Engine {
    pub flags: AtomicU32,
    pub(crate) orig_termios: libc::termios,
    /// Backups of the original fds 1 and 2 for restoration.
    originals: [RawFd; 2],
    /// Readers on the pty masters capturing stdout (0) and stderr (1).
    pub origin: [Input; 2],
    pub stamp_start: u64,
    pub clients: Vec<Box<Client>>,
    /// The client that is also the original terminal; null once reaped.
    pub console: *mut Client,
    pub backlog: Scrollback,
    pub telnet_listen: RawFd,
    pub telnet_port: u16,
    pub runner_block: Semaphore,
    pub capture_done: AtomicBool,
    pub runner_done: AtomicBool,
}

impl Engine {
    pub fn quit(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & QUIT != 0
    }
}

static MISH: AtomicPtr<Engine> = AtomicPtr::new(ptr::null_mut());

pub(crate) struct EnginePtr(pub *mut Engine);
// SAFETY: the engine is heap-pinned for the process lifetime; thread roles
// are documented in capture.rs.
unsafe impl Send for EnginePtr {}

extern "C" fn mish_atexit() {
    let m = MISH.load(Ordering::SeqCst);
    if !m.is_null() {
        terminate(m);
    }
}

/// Start capture: returns the engine, or None when disabled by `MISH_OFF`
/// or when the pseudo-terminals cannot be created.
pub fn prepare(caps: Caps) -> Option<*mut Engine> {
    // in production, set MISH_OFF=1 to neuter a linked-in mish without
    // relinking; .env files are honored for all MISH_* settings
    let _ = dotenvy::dotenv();
    crate::debug_log::clear_debug_log();
    if let Ok(v) = std::env::var("MISH_OFF") {
        if v.trim().parse::<i64>().unwrap_or(0) != 0 {
            std::env::remove_var("MISH_TELNET_PORT");
            println!("mish: Disabled by MISH_OFF");
            return None;
        }
    }

    let tty = match std::env::var("MISH_TTY") {
        Ok(v) => v.trim().parse::<i64>().unwrap_or(0) != 0,
        Err(_) => {
            (unsafe { libc::isatty(0) != 0 && libc::isatty(1) != 0 && libc::isatty(2) != 0 })
                || caps.contains(Caps::FORCE_PTY)
        }
    };

    // stdout pty pair, and one for stderr unless capture is off
    let mut io_pty: [libc::c_int; 2] = [-1, -1];
    let mut ie_pty: [libc::c_int; 2] = [-1, -1];
    unsafe {
        if libc::openpty(
            &mut io_pty[0],
            &mut io_pty[1],
            ptr::null_mut(),
            ptr::null(),
            ptr::null(),
        ) == -1
        {
            eprintln!("mish: openpty: {}", io::Error::last_os_error());
            return None;
        }
        if !caps.contains(Caps::NO_STDERR)
            && libc::openpty(
                &mut ie_pty[0],
                &mut ie_pty[1],
                ptr::null_mut(),
                ptr::null(),
                ptr::null(),
            ) == -1
        {
            eprintln!("mish: openpty: {}", io::Error::last_os_error());
            libc::close(io_pty[0]);
            libc::close(io_pty[1]);
            return None;
        }
    }

    let mut flags = caps.bits();
    if tty {
        flags |= CONSOLE_TTY;
    }

    let mut orig_termios: libc::termios = unsafe { mem::zeroed() };
    unsafe {
        libc::tcgetattr(0, &mut orig_termios);
        let mut raw = orig_termios;
        raw.c_iflag &= !(libc::ICRNL | libc::IXON);
        raw.c_lflag &= !(libc::ECHO | libc::ICANON | libc::IEXTEN);
        libc::tcsetattr(0, libc::TCSAFLUSH, &raw);
    }

    let mut telnet_listen: RawFd = -1;
    let mut telnet_port: u16 = 0;
    if !caps.contains(Caps::NO_TELNET) {
        let want: u16 = std::env::var("MISH_TELNET_PORT")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        match telnet::prepare_listener(want) {
            Ok((fd, port)) => {
                telnet_listen = fd;
                telnet_port = port;
                std::env::set_var("MISH_TELNET_PORT", port.to_string());
            }
            Err(e) => {
                eprintln!("mish: telnet disabled: {}", e);
                std::env::remove_var("MISH_TELNET_PORT");
            }
        }
    }

    let originals = [unsafe { libc::dup(1) }, unsafe { libc::dup(2) }];

    let m = Box::into_raw(Box::new(Engine {
        flags: AtomicU32::new(flags),
        orig_termios,
        originals,
        origin: [Input::idle(), Input::idle()],
        stamp_start: line::stamp_ms(),
        clients: Vec::new(),
        console: ptr::null_mut(),
        backlog: Scrollback::new(),
        telnet_listen,
        telnet_port,
        runner_block: Semaphore::new(),
        capture_done: AtomicBool::new(false),
        runner_done: AtomicBool::new(false),
    }));

    unsafe {
        let e = &mut *m;
        // the console client owns duplicates; the originals stay with us
        let c = Client::new(m, libc::dup(0), libc::dup(1), tty);
        e.clients.push(c);
        e.console = &mut *e.clients[0] as *mut Client;

        e.origin[0] = Input::new(io_pty[0]);
        if libc::dup2(io_pty[1], 1) == -1 {
            eprintln!("mish: dup2: {}", io::Error::last_os_error());
            drop(Box::from_raw(m));
            return None;
        }
        if !caps.contains(Caps::NO_STDERR) {
            e.origin[1] = Input::new(ie_pty[0]);
            if libc::dup2(ie_pty[1], 2) == -1 {
                eprintln!("mish: dup2: {}", io::Error::last_os_error());
                drop(Box::from_raw(m));
                return None;
            }
        }
    }

    cmd::register_builtins();
    crate::cmd_env::register_builtins();
    crate::client::register_builtins();
    register_builtins();
    cmd::set_command_parameter(cmd::MISH_CMD_KIND, m as *mut c_void);

    unsafe {
        libc::atexit(mish_atexit);
    }

    let p = EnginePtr(m);
    std::thread::spawn(move || {
        let p = p;
        capture::cmd_runner_thread(p.0)
    });
    let p = EnginePtr(m);
    std::thread::spawn(move || {
        let p = p;
        capture::capture_thread(p.0)
    });

    MISH.store(m, Ordering::SeqCst);
    Some(m)
}

/// The flags word: the caps passed to `prepare` plus engine-internal bits.
pub fn get_flags(m: *mut Engine) -> u32 {
    if m.is_null() {
        0
    } else {
        unsafe { (*m).flags.load(Ordering::Relaxed) }
    }
}

/// Stop capture, restore the original descriptors and terminal attributes,
/// and free the engine. Safe to call at any time; also runs at process exit.
pub fn terminate(m: *mut Engine) {
    // only one caller tears down: the exit hook and a direct call can race
    let cur = MISH.swap(ptr::null_mut(), Ordering::SeqCst);
    if m.is_null() || cur.is_null() {
        return;
    }
    let e = unsafe { &*m };
    unsafe {
        libc::dup2(e.originals[0], 1);
        libc::dup2(e.originals[1], 2);
        // the capture thread restores too, but it may never get there if we
        // are called from another exit()
        if e.flags.load(Ordering::Relaxed) & CONSOLE_TTY != 0
            && libc::tcsetattr(0, libc::TCSAFLUSH, &e.orig_termios) != 0
        {
            eprintln!("mish: terminate tcsetattr: {}", io::Error::last_os_error());
        }
        libc::close(e.originals[0]);
        libc::close(e.originals[1]);
    }
    e.flags.fetch_or(QUIT, Ordering::Relaxed);
    e.runner_block.post();
    unsafe {
        // best-effort wake; the poll's one second budget covers the rest
        let _ = libc::write(1, b"\n".as_ptr() as *const c_void, 1);
    }
    // both workers must be off the engine before it is freed
    let start = Instant::now();
    while (!e.capture_done.load(Ordering::Relaxed) || !e.runner_done.load(Ordering::Relaxed))
        && start.elapsed() < Duration::from_secs(2)
    {
        std::thread::sleep(Duration::from_millis(1));
    }
    print!("\x1b[4l\x1b[;r\x1b[999;1H");
    let _ = io::stdout().flush();
    if e.capture_done.load(Ordering::Relaxed) && e.runner_done.load(Ordering::Relaxed) {
        unsafe {
            drop(Box::from_raw(m));
        }
    }
}

fn cmd_quit(param: *mut c_void, _argv: &[&str]) {
    println!("{}mish: Quitting.{}", crate::COLOR_RED, crate::COLOR_RESET);
    if param.is_null() {
        return;
    }
    let m = unsafe { &*(param as *mut Engine) };
    m.flags.fetch_or(QUIT, Ordering::Relaxed);
}

fn cmd_mish(param: *mut c_void, argv: &[&str]) {
    if param.is_null() {
        return;
    }
    let m = unsafe { &*(param as *mut Engine) };
    println!(
        "Backlog: {:6} lines ({:5}KB)\x1b[40GTelnet Port: {:5}",
        m.backlog.size_hint(),
        m.backlog.alloc_bytes() / 1024,
        m.telnet_port
    );
    // SAFETY: the capture thread owns the client list; this is the same
    // relaxed status peek the original made.
    for c in &m.clients {
        let role = if c.input.is_telnet {
            "telnet session"
        } else if &**c as *const Client == m.console as *const Client {
            "console"
        } else {
            "*unknown*"
        };
        let mode = if &**c as *const Client == m.console as *const Client {
            if m.flags.load(Ordering::Relaxed) & CONSOLE_TTY != 0 {
                "(tty)"
            } else {
                "(dumb)"
            }
        } else {
            ""
        };
        println!(
            "  Client: r: {} w: {} {} {}",
            c.input.fd, c.out.fd, role, mode
        );
        println!(
            "          max sizes: vector: {} input: {}",
            c.out.vec_size(),
            c.input.line.size()
        );
    }
    match argv.get(1).copied() {
        Some("clear") => {
            println!("Clearing backlog");
            m.flags.fetch_or(CLEAR_BACKLOG, Ordering::Relaxed);
        }
        Some("backlog") => match argv.get(2).copied() {
            Some("clear") => {
                m.flags.fetch_or(CLEAR_BACKLOG, Ordering::Relaxed);
            }
            Some("max") => {
                if let Some(n) = argv.get(3).and_then(|s| s.parse::<usize>().ok()) {
                    m.backlog.max_lines.store(n, Ordering::Relaxed);
                    println!("Backlog max lines set to {}", n);
                }
            }
            Some(n) if n.chars().next().map_or(false, |c| c.is_ascii_digit()) => {
                if let Ok(n) = n.parse::<usize>() {
                    m.backlog.max_lines.store(n, Ordering::Relaxed);
                    println!("Backlog max lines set to {}", n);
                }
            }
            Some(other) => {
                eprintln!("Unknown backlog command '{}'", other);
            }
            None => {
                println!(
                    "Backlog: {:6}/{:6} lines ({:5}KB)",
                    m.backlog.size_hint(),
                    m.backlog.max_lines.load(Ordering::Relaxed),
                    m.backlog.alloc_bytes() / 1024
                );
            }
        },
        _ => {}
    }
}

pub(crate) fn register_builtins() {
    cmd::register_cmd_kind(
        &["q", "quit"],
        &["exit running program", "Close all clients and exit(0)"],
        cmd_quit,
        ptr::null_mut(),
        false,
        cmd::MISH_CMD_KIND,
    );
    cmd::register_cmd_kind(
        &["mish"],
        &[
            "[cmd...] Displays mish status.",
            "backlog [clear] [max <n>] - show backlog status",
            "   also set the maximum lines in the backlog",
            "   (0 = unlimited)",
            "Show status and a few bits of internals.",
        ],
        cmd_mish,
        ptr::null_mut(),
        false,
        cmd::MISH_CMD_KIND,
    );
}

//! The capture supervisor and the command-runner thread.
//!
//! The supervisor owns every client record, the scrollback and the origin
//! readers. Each iteration it resumes the client coroutines, waits for
//! readiness with a one second budget (so QUIT is observed promptly),
//! accepts telnet sessions, drains the captured streams into the
//! scrollback, drains client input, reaps dead clients and enforces the
//! scrollback cap.
//!
//! Commands run elsewhere: a handler that floods stdout would fill the pty
//! buffer and deadlock this loop, so unsafe handlers execute on the runner
//! thread, gated by a semaphore the supervisor posts.

use std::os::fd::RawFd;
use std::sync::atomic::Ordering;

use crate::client::{Client, ClientFlags};
use crate::select;
use crate::session::{Engine, CLEAR_BACKLOG, CONSOLE_TTY};

pub(crate) fn cmd_runner_thread(m: *mut Engine) {
    // SAFETY: the engine outlives both worker threads; see terminate().
    let m = unsafe { &*m };
    crate::debug_log!("mish: cmd runner up");
    while !m.quit() {
        m.runner_block.wait();
        if m.quit() {
            break;
        }
        crate::cmd::flush_runner();
    }
    m.runner_done.store(true, Ordering::Relaxed);
}

pub(crate) fn capture_thread(m: *mut Engine) {
    // SAFETY: as above; this thread is the sole mutator of the engine's
    // collections until it marks itself done.
    let m = unsafe { &mut *m };
    m.capture_loop();
}

impl Engine {
    pub(crate) fn capture_loop(&mut self) {
        while !self.quit() {
            {
                let Engine { clients, backlog, .. } = self;
                for c in clients.iter_mut() {
                    c.step(backlog);
                }
            }

            let mut fds: Vec<(RawFd, i16)> = Vec::new();
            for o in &self.origin {
                if o.fd >= 0 {
                    fds.push((o.fd, select::READ));
                }
            }
            if self.telnet_listen >= 0 {
                fds.push((self.telnet_listen, select::READ));
            }
            for c in &self.clients {
                if c.input.fd >= 0 {
                    fds.push((c.input.fd, select::READ));
                }
                if c.out.want_write && c.out.fd >= 0 {
                    fds.push((c.out.fd, select::WRITE));
                }
            }

            let ready = match select::poll_fds(&fds, 1_000) {
                Ok(r) => r,
                // EINTR and friends: just go around
                Err(_) => continue,
            };
            if ready.is_empty() {
                continue;
            }

            self.telnet_accept(&ready);

            // promote finished origin lines into the scrollback
            {
                let Engine { origin, backlog, .. } = self;
                for (i, o) in origin.iter_mut().enumerate() {
                    if o.fd < 0 {
                        continue;
                    }
                    o.read(ready.readable(o.fd), true);
                    while let Some(mut l) = o.backlog.pop_front() {
                        l.err = i == 1;
                        backlog.push(l);
                    }
                }
            }

            // client input, reaping, and runner wake-ups
            {
                let Engine {
                    clients,
                    backlog,
                    runner_block,
                    console,
                    ..
                } = self;
                let mut i = 0;
                while i < clients.len() {
                    let c = &mut clients[i];
                    c.input.read(ready.readable(c.input.fd), false);
                    c.drain_input(backlog);
                    if c.input.fd < 0 || c.has(ClientFlags::DELETE) {
                        let mut dead = clients.remove(i);
                        if &mut *dead as *mut Client == *console {
                            // the console going away does not stop the engine
                            *console = std::ptr::null_mut();
                        }
                        dead.teardown();
                        continue;
                    }
                    if c.has(ClientFlags::HAS_CMD) {
                        c.clear(ClientFlags::HAS_CMD);
                        runner_block.post();
                    }
                    i += 1;
                }
            }

            // scrollback cap; a clear request squeezes it to one line once
            let mut max = self.backlog.max_lines.load(Ordering::Relaxed);
            if self.flags.load(Ordering::Relaxed) & CLEAR_BACKLOG != 0 {
                self.flags.fetch_and(!CLEAR_BACKLOG, Ordering::Relaxed);
                println!("mish: clearing backlog of {} lines", self.backlog.len());
                max = 1;
            }
            if max > 0 && self.backlog.enforce_cap(max) {
                let Engine { clients, backlog, .. } = self;
                for c in clients.iter_mut() {
                    c.bottom = backlog.clamp(c.bottom);
                    c.sending = backlog.clamp(c.sending);
                }
            }
        }

        if self.flags.load(Ordering::Relaxed) & CONSOLE_TTY != 0 {
            unsafe {
                if libc::tcsetattr(0, libc::TCSAFLUSH, &self.orig_termios) != 0 {
                    eprintln!(
                        "mish: thread tcsetattr: {}",
                        std::io::Error::last_os_error()
                    );
                }
            }
        }
        while let Some(mut c) = self.clients.pop() {
            c.teardown();
        }
        self.console = std::ptr::null_mut();
        self.capture_done.store(true, Ordering::Relaxed);
        // unwinds the whole process through the exit hook, which runs
        // terminate on this thread
        std::process::exit(0);
    }

    fn telnet_accept(&mut self, ready: &select::Readiness) {
        if self.telnet_listen < 0 || !ready.readable(self.telnet_listen) {
            return;
        }
        let fd = unsafe {
            libc::accept(
                self.telnet_listen,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if fd < 0 {
            eprintln!("mish: accept: {}", std::io::Error::last_os_error());
            return;
        }
        // two descriptors per session keeps the read/write interest
        // bookkeeping per-fd; a dup is cheap
        let out = unsafe { libc::dup(fd) };
        let mut c = Client::new(self as *mut Engine, fd, out, true);
        c.input.is_telnet = true;
        self.clients.push(c);
        println!(
            "{}mish: telnet: connected.{}",
            crate::COLOR_GREEN,
            crate::COLOR_RESET
        );
    }
}

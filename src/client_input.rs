//! Prompt-side input: emacs-style line editing, history navigation,
//! backlog paging and the window-size probe reply, fed one byte at a time
//! from the client's descriptor.
//!
//! This handles mostly the keys heavy bash users reach for; if you want vi
//! bindings, sad story.

use crate::client::{Client, ClientFlags};
use crate::line::Line;
use crate::scrollback::Scrollback;
use crate::telnet::{self, TelnetStep};
use crate::vt::{vt_seq, VT_CSI, VT_RAW};

const CSI_TILDE: u32 = vt_seq(VT_CSI, b'~');
const CSI_HOME: u32 = vt_seq(VT_CSI, b'H');
const CSI_END: u32 = vt_seq(VT_CSI, b'F');
const CSI_CPR: u32 = vt_seq(VT_CSI, b'R');

impl Client {
    /// Replay whatever input accumulated, unless the send vector is mid
    /// flush: while it is locked, bytes keep queueing in the raw line and
    /// get replayed in order the next time the buffer has drained.
    pub fn drain_input(&mut self, sb: &Scrollback) {
        if self.out.locked {
            return;
        }
        if self.input.line.is_empty() {
            return;
        }
        let bytes = std::mem::take(&mut self.input.line.buf);
        self.input.line.done = 0;
        for ch in bytes {
            self.handle_byte(sb, ch);
        }
    }

    fn handle_byte(&mut self, sb: &Scrollback, ch: u8) {
        if self.input.is_telnet {
            match telnet::parse(&mut self.vts, ch) {
                TelnetStep::Eat => return,
                TelnetStep::Naws { w, h } => {
                    self.window_size = (w as i32, h as i32);
                    self.set(ClientFlags::HAS_WINDOW_SIZE | ClientFlags::UPDATE_WINDOW);
                    return;
                }
                TelnetStep::Pass => {}
            }
        }
        if !self.vts.feed(ch) {
            return;
        }
        // an empty edit line joins the history queue the moment a key lands
        if self.cmd.is_none() {
            self.input.backlog.push_back(Line::new());
            self.cmd = Some(self.input.backlog.len() - 1);
        }
        let ci = self.cmd.unwrap_or(0);
        let h = self.window_size.1;

        match self.vts.seq {
            CSI_TILDE => match self.vts.p[0] {
                1 => self.kb_home(sb),
                4 => self.kb_end(),
                5 => {
                    // Page Up: walk the view back one window
                    let mut cursor = self.bottom;
                    for _ in 0..(h - 3).max(0) {
                        match cursor.and_then(|s| sb.prev(s)) {
                            Some(p) => cursor = Some(p),
                            None => {
                                cursor = None;
                                break;
                            }
                        }
                    }
                    if cursor.is_some() {
                        self.bottom = cursor;
                        self.set(ClientFlags::UPDATE_WINDOW);
                        self.clear(ClientFlags::SCROLLING);
                    }
                }
                6 => {
                    // Page Down: forward one window; past the tail resumes live
                    let mut cursor = self.bottom;
                    for _ in 0..(h - 3).max(0) {
                        match cursor.and_then(|s| sb.next(s)) {
                            Some(n) => cursor = Some(n),
                            None => {
                                cursor = None;
                                break;
                            }
                        }
                    }
                    self.bottom = cursor;
                    self.set(ClientFlags::UPDATE_WINDOW);
                    if self.bottom.is_none() {
                        self.set(ClientFlags::SCROLLING);
                    }
                }
                _ => {}
            },
            CSI_HOME => self.kb_home(sb),
            CSI_END => self.kb_end(),
            CSI_CPR => {
                self.set(ClientFlags::HAS_CURSOR_POS);
                self.cursor_pos = (self.vts.p[1] as i32, self.vts.p[0] as i32);
            }
            seq if seq == vt_seq(VT_RAW, 16) => {
                // ^P: previous history entry
                if ci > 0 {
                    self.cmd = Some(ci - 1);
                    self.set(ClientFlags::UPDATE_PROMPT);
                }
            }
            seq if seq == vt_seq(VT_RAW, 14) => {
                // ^N: next history entry
                if ci + 1 < self.input.backlog.len() {
                    self.cmd = Some(ci + 1);
                    self.set(ClientFlags::UPDATE_PROMPT);
                }
            }
            seq if seq == vt_seq(VT_RAW, 1) => {
                // ^A: caret to start of line
                let done = self.input.backlog[ci].done;
                if done > 0 {
                    self.out.queue(format!("\x1b[{}D", done).as_bytes());
                    self.input.backlog[ci].done = 0;
                }
            }
            seq if seq == vt_seq(VT_RAW, 5) => {
                // ^E: caret to end of line
                let (len, done) = {
                    let l = &self.input.backlog[ci];
                    (l.len(), l.done)
                };
                if done < len {
                    self.out.queue(format!("\x1b[{}C", len - done).as_bytes());
                    self.input.backlog[ci].done = len;
                }
            }
            seq if seq == vt_seq(VT_RAW, 2) => {
                // ^B: back one column
                if self.input.backlog[ci].done > 0 {
                    self.input.backlog[ci].done -= 1;
                    self.out.queue(b"\x1b[1D");
                }
            }
            seq if seq == vt_seq(VT_RAW, 6) => {
                // ^F: forward one column
                let l = &mut self.input.backlog[ci];
                if l.done < l.len() {
                    l.done += 1;
                    self.out.queue(b"\x1b[1C");
                }
            }
            seq if seq == vt_seq(VT_RAW, 23) => {
                // ^W: delete previous word (trailing spaces, then word chars)
                let del = {
                    let l = &mut self.input.backlog[ci];
                    let old = l.done;
                    while l.done > 0 && l.buf[l.done - 1] == b' ' {
                        l.done -= 1;
                    }
                    while l.done > 0 && l.buf[l.done - 1] != b' ' {
                        l.done -= 1;
                    }
                    let del = old - l.done;
                    if del > 0 {
                        let at = l.done;
                        l.buf.drain(at..old);
                    }
                    del
                };
                if del > 0 {
                    self.out
                        .queue(format!("\x1b[{}D\x1b[{}P", del, del).as_bytes());
                }
            }
            seq if seq == vt_seq(VT_RAW, 0x7f) || seq == vt_seq(VT_RAW, 8) => {
                // backspace
                let l = &mut self.input.backlog[ci];
                if l.done > 0 {
                    l.done -= 1;
                    let at = l.done;
                    l.buf.remove(at);
                    self.out.queue(b"\x08\x1b[P");
                }
            }
            seq if seq == vt_seq(VT_RAW, 11) => {
                // ^K: kill to end of line
                let l = &mut self.input.backlog[ci];
                let at = l.done;
                l.buf.truncate(at);
                self.out.queue(b"\x1b[K");
            }
            seq if seq == vt_seq(VT_RAW, 12) => {
                // ^L: full redraw
                self.set(ClientFlags::UPDATE_WINDOW);
            }
            seq if seq == vt_seq(VT_RAW, 13) => {
                // enter: commit the line
                let text = String::from_utf8_lossy(&self.input.backlog[ci].buf).into_owned();
                let cptr = self as *mut Client as *mut libc::c_void;
                if crate::cmd::call(&text, cptr) == 1 {
                    self.set(ClientFlags::HAS_CMD);
                }
                self.cmd = None;
                // recycle an empty tail slot instead of growing history
                if let Some(last) = self.input.backlog.back() {
                    if last.is_empty() {
                        self.cmd = Some(self.input.backlog.len() - 1);
                    }
                }
                self.set(ClientFlags::UPDATE_PROMPT);
            }
            seq => {
                if seq & !0xff != 0 {
                    let mut msg = format!(
                        "{}mish: Unknown sequence: {:08x} ",
                        crate::COLOR_RED,
                        seq
                    );
                    for i in 0..self.vts.pc as usize {
                        msg.push_str(&format!(":{}", self.vts.p[i]));
                    }
                    msg.push('\'');
                    msg.push(((seq >> 8) & 0xff) as u8 as char);
                    msg.push((seq & 0xff) as u8 as char);
                    msg.push('\'');
                    println!("{}{}", msg, crate::COLOR_RESET);
                }
            }
        }
        // printable glyphs insert at the caret; terminal is in insert mode
        let g = self.vts.glyph;
        if (0x20..0x7f).contains(&g) {
            if let Some(ci) = self.cmd {
                let l = &mut self.input.backlog[ci];
                if l.len() < crate::line::MAX_LINE_SIZE {
                    let at = l.done;
                    l.buf.insert(at, g as u8);
                    l.done += 1;
                    self.out.queue(&[g as u8]);
                }
            }
        }
    }

    fn kb_home(&mut self, sb: &Scrollback) {
        let h = self.window_size.1;
        // don't bother if there's not enough backlog to fill a window
        if (sb.len() as i32) < h - 2 {
            return;
        }
        self.bottom = sb.first_seq();
        for _ in 0..(h - 3).max(0) {
            match self.bottom.and_then(|s| sb.next(s)) {
                Some(n) => self.bottom = Some(n),
                None => {
                    self.bottom = None;
                    break;
                }
            }
        }
        self.set(ClientFlags::UPDATE_WINDOW);
        if self.bottom.is_some() {
            self.clear(ClientFlags::SCROLLING);
        }
    }

    fn kb_end(&mut self) {
        self.set(ClientFlags::UPDATE_WINDOW | ClientFlags::SCROLLING);
        self.bottom = None;
    }
}

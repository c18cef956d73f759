//! Telnet IAC negotiation for remote sessions, plus the loopback listen
//! socket. The option decoder is parasitic on the client's VT decoder: it
//! parks its state in the `seq` field under the TELNET tag, which a raw
//! byte can never produce (0xff starts a UTF-8 path instead), so the two
//! machines cannot clash.

use std::io;
use std::os::fd::RawFd;

use crate::send::SendBuf;
use crate::vt::{vt_seq, VtSequence, VT_RAW, VT_TELNET};

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

pub const TELOPT_ECHO: u8 = 1;
pub const TELOPT_SGA: u8 = 3;
pub const TELOPT_NAWS: u8 = 31;

const T_WILL: u32 = vt_seq(VT_TELNET, WILL);
const T_WONT: u32 = vt_seq(VT_TELNET, WONT);
const T_DO: u32 = vt_seq(VT_TELNET, DO);
const T_DONT: u32 = vt_seq(VT_TELNET, DONT);
const T_SB: u32 = vt_seq(VT_TELNET, SB);
const T_SB_NAWS: u32 = (T_SB << 8) | TELOPT_NAWS as u32;

/// What to do with the byte just offered to the telnet decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelnetStep {
    /// Not telnet traffic (or an escaped IAC IAC); hand it to the VT decoder.
    Pass,
    /// Consumed by the negotiation machinery.
    Eat,
    /// A NAWS sub-negotiation completed with this window size.
    Naws { w: u16, h: u16 },
}

/// Ask the remote to stop echoing and to report its window size.
pub fn send_init(out: &mut SendBuf) {
    out.queue(&[
        IAC, DO, TELOPT_ECHO,
        IAC, DO, TELOPT_NAWS,
        IAC, WILL, TELOPT_ECHO,
        IAC, WILL, TELOPT_SGA,
    ]);
}

/// Offer one input byte to the negotiation decoder. Everything but NAWS is
/// acknowledged by silent consumption.
pub fn parse(vts: &mut VtSequence, ch: u8) -> TelnetStep {
    match vts.seq {
        VT_RAW => {
            if ch == IAC {
                vts.seq = VT_TELNET;
                return TelnetStep::Eat;
            }
            TelnetStep::Pass
        }
        VT_TELNET => match ch {
            WILL | WONT | DO | DONT | SB => {
                vts.seq = (vts.seq << 8) | ch as u32;
                TelnetStep::Eat
            }
            IAC => {
                // escaped 0xff: yield one literal byte to the VT decoder
                vts.seq = VT_RAW;
                TelnetStep::Pass
            }
            // SE and anything unexpected
            _ => {
                vts.seq = VT_RAW;
                TelnetStep::Eat
            }
        },
        T_WILL | T_WONT | T_DO | T_DONT => {
            // consume the option byte, no reply
            vts.seq = VT_RAW;
            TelnetStep::Eat
        }
        T_SB => {
            vts.seq_want = 0;
            vts.p[0] = 0;
            if ch == TELOPT_NAWS {
                vts.seq = (vts.seq << 8) | ch as u32;
            } else if ch == IAC {
                vts.seq = VT_TELNET;
            }
            // unknown sub-option bodies stay here until IAC SE
            TelnetStep::Eat
        }
        T_SB_NAWS => {
            // four byte body: width then height, both big-endian
            match vts.seq_want {
                0 => {
                    vts.p[1] = ch as u32;
                    vts.seq_want = 1;
                }
                1 => {
                    vts.p[1] = (vts.p[1] << 8) | ch as u32;
                    vts.seq_want = 2;
                }
                2 => {
                    vts.p[0] = ch as u32;
                    vts.seq_want = 3;
                }
                _ => {
                    vts.p[0] = (vts.p[0] << 8) | ch as u32;
                    vts.seq = VT_RAW;
                    vts.done = true;
                    return TelnetStep::Naws {
                        w: vts.p[1] as u16,
                        h: vts.p[0] as u16,
                    };
                }
            }
            TelnetStep::Eat
        }
        _ => TelnetStep::Pass,
    }
}

/// Pseudo random port derived from the program name, so each program gets a
/// stable 'unique' port before falling back to jitter.
pub fn derive_port(name: &str) -> u16 {
    let mut port = 0u16;
    for (i, b) in name.bytes().enumerate() {
        port = port.wrapping_add(b as u16 + i as u16);
    }
    if port < 1024 {
        port += 1024;
    }
    port & 0x3fff
}

fn progname() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "mish".to_string())
}

/// Bind and listen on loopback. `port` 0 picks the name-derived port; a taken
/// port is retried up to 10 times with random jitter. Returns the socket and
/// the port actually bound.
pub fn prepare_listener(port: u16) -> io::Result<(RawFd, u16)> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        let flag: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &flag as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) != 0
        {
            eprintln!("mish: SO_REUSEADDR: {}", io::Error::last_os_error());
        }

        let mut port = if port == 0 { derive_port(&progname()) } else { port };
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr = libc::in_addr {
            s_addr: u32::to_be(libc::INADDR_LOOPBACK),
        };

        let mut tries = 10;
        loop {
            addr.sin_port = u16::to_be(port);
            if libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ) == 0
            {
                break;
            }
            eprintln!("mish: can't bind {}: {}", port, io::Error::last_os_error());
            tries -= 1;
            if tries == 0 {
                libc::close(fd);
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "telnet bind retries exhausted",
                ));
            }
            port = port.wrapping_add((libc::rand() & 0x3ff) as u16);
        }
        if libc::listen(fd, 2) == -1 {
            let e = io::Error::last_os_error();
            libc::close(fd);
            return Err(e);
        }
        println!(
            "{}mish: telnet port on {}{}",
            crate::COLOR_GREEN,
            port,
            crate::COLOR_RESET
        );
        Ok((fd, port))
    }
}

//! Process-global command registry and dispatcher.
//!
//! Registration is order-independent and permanent; entries are kept sorted
//! by their first name for display. Safe commands are queued into a bounded
//! FIFO and executed on the main thread via `cmd_poll`; everything else is
//! handed to the command-runner thread through an unbounded queue gated by
//! the engine's semaphore.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, OnceLock};

use libc::c_void;

/// Four character constant, grouping related commands by kind.
pub const fn fcc(s: &[u8; 4]) -> u32 {
    (s[0] as u32) << 24 | (s[1] as u32) << 16 | (s[2] as u32) << 8 | s[3] as u32
}

/// Engine built-ins; their parameter is rebound to the engine at prepare.
pub const MISH_CMD_KIND: u32 = fcc(b"mish");
/// Session built-ins; their parameter is the invoking client.
pub const CLIENT_CMD_KIND: u32 = fcc(b"clie");

/// Handler contract: `param` is the registered parameter if non-null, the
/// invoking client for CLIENT_CMD_KIND entries, else null. `argv[0]` is the
/// command name as typed.
pub type CmdHandler = fn(*mut c_void, &[&str]);

pub struct CmdEntry {
    names: Vec<String>,
    help: Vec<String>,
    handler: CmdHandler,
    param: std::sync::atomic::AtomicPtr<c_void>,
    safe: bool,
    kind: u32,
}

struct CmdCall {
    handler: CmdHandler,
    param: *mut c_void,
    argv: Vec<String>,
}

// SAFETY: the parameter pointer travels from the capture thread to whichever
// thread executes the handler; the pointees (engine, client) outlive both
// queues and are only touched through their atomic fields or as status reads.
unsafe impl Send for CmdCall {}

static CMDS: OnceLock<Mutex<Vec<&'static CmdEntry>>> = OnceLock::new();

struct SafeFifo {
    tx: Mutex<SyncSender<CmdCall>>,
    rx: Mutex<Receiver<CmdCall>>,
}

/// Bounded hand-off to the main thread. A stuck main thread fills it up and
/// further safe calls are dropped with a notice: retrying would only pile on.
const SAFE_FIFO_DEPTH: usize = 4;

static SAFE_FIFO: OnceLock<SafeFifo> = OnceLock::new();
static RUN_QUEUE: OnceLock<Mutex<VecDeque<CmdCall>>> = OnceLock::new();

fn cmds() -> &'static Mutex<Vec<&'static CmdEntry>> {
    CMDS.get_or_init(|| Mutex::new(Vec::new()))
}

fn safe_fifo() -> &'static SafeFifo {
    SAFE_FIFO.get_or_init(|| {
        let (tx, rx) = mpsc::sync_channel(SAFE_FIFO_DEPTH);
        SafeFifo {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        }
    })
}

fn run_queue() -> &'static Mutex<VecDeque<CmdCall>> {
    RUN_QUEUE.get_or_init(|| Mutex::new(VecDeque::new()))
}

/// Register a command under one or more aliases. `help[0]` is the one-liner
/// shown in the command list, the rest is shown by `help <cmd>`.
/// Registration is idempotent: a second entry with the same first name is
/// ignored.
pub fn register_cmd_kind(
    names: &[&str],
    help: &[&str],
    handler: CmdHandler,
    param: *mut c_void,
    safe: bool,
    kind: u32,
) {
    if names.is_empty() || help.is_empty() {
        eprintln!("mish: register_cmd invalid parameters");
        return;
    }
    let mut list = cmds().lock().unwrap();
    if list.iter().any(|e| e.names[0] == names[0]) {
        return;
    }
    let entry: &'static CmdEntry = Box::leak(Box::new(CmdEntry {
        names: names.iter().map(|s| s.to_string()).collect(),
        help: help.iter().map(|s| s.to_string()).collect(),
        handler,
        param: std::sync::atomic::AtomicPtr::new(param),
        safe,
        kind,
    }));
    // keep the list sorted by first name
    let at = list
        .iter()
        .position(|e| e.names[0].as_str() > names[0])
        .unwrap_or(list.len());
    list.insert(at, entry);
}

pub fn register_cmd(names: &[&str], help: &[&str], handler: CmdHandler, param: *mut c_void, safe: bool) {
    register_cmd_kind(names, help, handler, param, safe, 0);
}

/// One-line registration sugar for host programs:
/// `mish_cmd!(["set"], ["set the counter"], my_handler);`
/// append `, safe` for commands that must run on the main thread.
#[macro_export]
macro_rules! mish_cmd {
    ([$($name:expr),+ $(,)?], [$($help:expr),+ $(,)?], $handler:expr) => {
        $crate::cmd::register_cmd(&[$($name),+], &[$($help),+], $handler,
            core::ptr::null_mut(), false)
    };
    ([$($name:expr),+ $(,)?], [$($help:expr),+ $(,)?], $handler:expr, safe) => {
        $crate::cmd::register_cmd(&[$($name),+], &[$($help),+], $handler,
            core::ptr::null_mut(), true)
    };
}

/// Bulk-rebind the parameter of every entry whose kind matches; kind 0
/// applies to all entries.
pub fn set_command_parameter(kind: u32, param: *mut c_void) {
    let list = cmds().lock().unwrap();
    for e in list.iter() {
        if kind == 0 || e.kind == kind {
            e.param.store(param, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

fn first_word(line: &str) -> &str {
    line.split(' ').next().unwrap_or("")
}

fn find(list: &[&'static CmdEntry], token: &str) -> Option<&'static CmdEntry> {
    if token.is_empty() {
        return None;
    }
    for e in list {
        for name in &e.names {
            if name.as_bytes().starts_with(token.as_bytes()) {
                return Some(e);
            }
        }
    }
    None
}

/// Exact-prefix lookup of the first token against any alias; first hit in
/// display order wins.
pub fn lookup(line: &str) -> Option<&'static CmdEntry> {
    let list = cmds().lock().unwrap();
    find(&list, first_word(line))
}

/// Split a command line into argv words. Runs of spaces separate words; a
/// word starting with a quote runs to the matching quote (stripped), with
/// backslash escaping the next byte inside.
pub fn argv_make(line: &str) -> Vec<String> {
    let b = line.as_bytes();
    let mut argv = Vec::new();
    let mut i = 0;
    while i < b.len() {
        while i < b.len() && b[i] == b' ' {
            i += 1;
        }
        if i >= b.len() {
            break;
        }
        let mut word = Vec::new();
        if b[i] == b'"' || b[i] == b'\'' {
            let q = b[i];
            i += 1;
            while i < b.len() {
                if b[i] == b'\\' && i + 1 < b.len() {
                    word.push(b[i + 1]);
                    i += 2;
                } else if b[i] == q {
                    i += 1;
                    break;
                } else {
                    word.push(b[i]);
                    i += 1;
                }
            }
        } else {
            while i < b.len() && b[i] != b' ' {
                word.push(b[i]);
                i += 1;
            }
        }
        argv.push(String::from_utf8_lossy(&word).into_owned());
    }
    argv
}

/// Dispatch a committed line. Returns 1 when the command went to the runner
/// thread (the caller should raise HAS_CMD), 0 when handled or queued for
/// `cmd_poll`, -1 when empty or unknown.
pub fn call(line: &str, client: *mut c_void) -> i32 {
    if line.is_empty() {
        return -1;
    }
    let entry = match lookup(line) {
        Some(e) => e,
        None => {
            println!(
                "{}mish: '{}' not found. type 'help'.{}",
                crate::COLOR_RED,
                first_word(line),
                crate::COLOR_RESET
            );
            return -1;
        }
    };
    let argv = argv_make(line);
    let bound = entry.param.load(std::sync::atomic::Ordering::Relaxed);
    let param = if !bound.is_null() {
        bound
    } else if entry.kind == CLIENT_CMD_KIND {
        client
    } else {
        bound
    };
    let call = CmdCall {
        handler: entry.handler,
        param,
        argv,
    };
    if entry.safe {
        match safe_fifo().tx.lock().unwrap().try_send(call) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                eprintln!("mish: cmd FIFO full, make sure to call mish::cmd_poll()!");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
        0
    } else {
        run_queue().lock().unwrap().push_back(call);
        1
    }
}

fn invoke(call: CmdCall) {
    let argv: Vec<&str> = call.argv.iter().map(|s| s.as_str()).collect();
    (call.handler)(call.param, &argv);
}

/// Main-thread poll: execute queued safe commands, returning how many ran.
pub fn cmd_poll() -> usize {
    let drained: Vec<CmdCall> = {
        let rx = safe_fifo().rx.lock().unwrap();
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    };
    let n = drained.len();
    for call in drained {
        invoke(call);
    }
    n
}

/// Runner-thread drain of unsafe commands, one semaphore post per batch.
pub(crate) fn flush_runner() -> usize {
    let drained: Vec<CmdCall> = {
        let mut q = run_queue().lock().unwrap();
        q.drain(..).collect()
    };
    let n = drained.len();
    for call in drained {
        invoke(call);
    }
    n
}

static HELP_KEYS: &[&str] = &[
    "A few of the typical EMACS keys work for editing commands.",
    "like, ^A-^E, ^W, ^K - ^P,^N to navigate history and ^L to",
    "redraw.",
    "BEG/PGUP/DOWN/END to change the view of the backlog buffer.",
];

fn cmd_help(_param: *mut c_void, argv: &[&str]) {
    let list = cmds().lock().unwrap();
    if argv.len() < 2 {
        println!("{}mish: Key binding", crate::COLOR_GREEN);
        for l in HELP_KEYS {
            println!("  {}", l);
        }
        println!("{}List of commands", crate::COLOR_GREEN);
        for e in list.iter() {
            println!("  {} - {}", e.names.join(","), e.help[0]);
        }
        print!("{}", crate::COLOR_RESET);
    } else {
        for name in &argv[1..] {
            match find(&list, name) {
                None => {
                    println!(
                        "{}mish: Unknown command '{}'{}",
                        crate::COLOR_RED,
                        name,
                        crate::COLOR_RESET
                    );
                }
                Some(e) => {
                    println!("{}{}", crate::COLOR_GREEN, e.names.join(","));
                    for h in &e.help {
                        println!(" {}", h);
                    }
                    print!("{}", crate::COLOR_RESET);
                }
            }
        }
    }
}

pub(crate) fn register_builtins() {
    register_cmd(
        &["help"],
        &[
            "[cmd...] - Display command list, or help for commands",
            "(optional) [cmd...] will display all the help for [cmd]",
        ],
        cmd_help,
        std::ptr::null_mut(),
        false,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static HITS: AtomicUsize = AtomicUsize::new(0);
    // dispatch tests share the process-global queues; run them one at a time
    static DISPATCH_LOCK: Mutex<()> = Mutex::new(());

    fn count_hits(_p: *mut c_void, _argv: &[&str]) {
        HITS.fetch_add(1, Ordering::Relaxed);
    }

    fn noop(_p: *mut c_void, _argv: &[&str]) {}

    #[test]
    fn argv_splits_words_and_quotes() {
        let argv = argv_make("command with some \"quoted\\\"words\" should work");
        assert_eq!(argv.len(), 6);
        assert_eq!(
            argv,
            vec!["command", "with", "some", "quoted\"words", "should", "work"]
        );
    }

    #[test]
    fn argv_round_trips_plain_lines() {
        let line = "testing one two three";
        assert_eq!(argv_make(line).join(" "), line);
    }

    #[test]
    fn argv_skips_space_runs_and_trailing_blanks() {
        let argv = argv_make("testing \"one escape two\"  ala ");
        assert_eq!(argv, vec!["testing", "one escape two", "ala"]);
    }

    #[test]
    fn argv_single_quotes_and_empty() {
        assert_eq!(argv_make("say 'hello world'"), vec!["say", "hello world"]);
        assert!(argv_make("").is_empty());
        assert!(argv_make("   ").is_empty());
    }

    #[test]
    fn lookup_matches_alias_prefix_first_hit_wins() {
        register_cmd(&["zebra", "zz"], &["zebra test"], noop, ptr::null_mut(), false);
        register_cmd(&["zeta"], &["zeta test"], noop, ptr::null_mut(), false);
        // "zeb" prefixes only zebra; "z" hits zebra first (sorted order)
        assert_eq!(lookup("zeb arg").unwrap().names[0], "zebra");
        assert_eq!(lookup("z").unwrap().names[0], "zebra");
        assert!(lookup("nope").is_none());
    }

    #[test]
    fn registration_is_idempotent_and_sorted() {
        register_cmd(&["aaa_first"], &["a"], noop, ptr::null_mut(), false);
        register_cmd(&["aaa_first"], &["duplicate"], noop, ptr::null_mut(), false);
        let list = cmds().lock().unwrap();
        let hits: Vec<_> = list.iter().filter(|e| e.names[0] == "aaa_first").collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].help[0], "a");
        // sorted by first name
        let names: Vec<_> = list.iter().map(|e| e.names[0].as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn unsafe_commands_go_to_the_runner_queue() {
        let _g = DISPATCH_LOCK.lock().unwrap();
        register_cmd(&["runnerq"], &["runner"], count_hits, ptr::null_mut(), false);
        let before = HITS.load(Ordering::Relaxed);
        assert_eq!(call("runnerq", ptr::null_mut()), 1);
        // nothing ran yet; the runner thread drains it
        assert_eq!(HITS.load(Ordering::Relaxed), before);
        assert!(flush_runner() >= 1);
        assert_eq!(HITS.load(Ordering::Relaxed), before + 1);
    }

    #[test]
    fn call_resolves_client_param_for_client_kind() {
        let _g = DISPATCH_LOCK.lock().unwrap();
        static GOT: AtomicUsize = AtomicUsize::new(0);
        fn grab(p: *mut c_void, _argv: &[&str]) {
            GOT.store(p as usize, Ordering::Relaxed);
        }
        register_cmd_kind(
            &["whoami_test"],
            &["param check"],
            grab,
            ptr::null_mut(),
            false,
            CLIENT_CMD_KIND,
        );
        let fake_client = 0x5150usize as *mut c_void;
        call("whoami_test", fake_client);
        flush_runner();
        assert_eq!(GOT.load(Ordering::Relaxed), 0x5150);
    }

    #[test]
    fn set_command_parameter_rebinds_by_kind() {
        let _g = DISPATCH_LOCK.lock().unwrap();
        static GOT: AtomicUsize = AtomicUsize::new(0);
        fn grab(p: *mut c_void, _argv: &[&str]) {
            GOT.store(p as usize, Ordering::Relaxed);
        }
        register_cmd_kind(
            &["kindbind_test"],
            &["param check"],
            grab,
            ptr::null_mut(),
            false,
            fcc(b"tst1"),
        );
        set_command_parameter(fcc(b"tst1"), 0xbeef as *mut c_void);
        call("kindbind_test", std::ptr::null_mut());
        flush_runner();
        assert_eq!(GOT.load(Ordering::Relaxed), 0xbeef);
    }

    #[test]
    fn unknown_command_is_reported_not_queued() {
        assert_eq!(call("definitely_not_registered", ptr::null_mut()), -1);
        assert_eq!(call("", ptr::null_mut()), -1);
    }
}

//! Minimal host program: a 1 Hz counter with a live mish prompt on the
//! terminal and on the published telnet port. `set <n>` assigns the
//! counter from any attached session.

use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::Duration;

use mish::mish_cmd;

static CNT: AtomicI64 = AtomicI64::new(0);

fn set_cnt(_param: *mut libc::c_void, argv: &[&str]) {
    match argv.get(1).and_then(|v| v.parse::<i64>().ok()) {
        Some(n) => CNT.store(n, Ordering::Relaxed),
        None => eprintln!("{}: syntax 'set XXX' to set the variable", argv[0]),
    }
}

fn main() {
    let _ = mish::prepare(mish::Caps::empty());
    // safe: runs on this thread through the cmd_poll below
    mish_cmd!(["set"], ["set 'cnt' variable", "demo command for mish"], set_cnt, safe);

    loop {
        thread::sleep(Duration::from_secs(1));
        mish::cmd_poll();
        println!("Count {}", CNT.fetch_add(1, Ordering::Relaxed));
    }
}

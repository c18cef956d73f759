//! Environment inspection built-ins.

use libc::c_void;

fn cmd_env(_param: *mut c_void, argv: &[&str]) {
    if argv.len() < 2 {
        for (k, v) in std::env::vars() {
            if k != "LS_COLORS" {
                println!("{}={}", k, v);
            }
        }
        return;
    }
    for (k, v) in std::env::vars() {
        let entry = format!("{}={}", k, v);
        for prefix in &argv[1..] {
            if entry.starts_with(prefix) {
                println!("{}", entry);
            }
        }
    }
}

fn cmd_setenv(_param: *mut c_void, argv: &[&str]) {
    for arg in &argv[1..] {
        let (name, value) = match arg.split_once('=') {
            Some(nv) => nv,
            None => {
                println!("mish: setenv: '{}' requires an '='", arg);
                return;
            }
        };
        println!(
            "mish: {}{}{}{}",
            if value.is_empty() { "unset " } else { "" },
            name,
            if value.is_empty() { "" } else { " = " },
            value
        );
        if value.is_empty() {
            std::env::remove_var(name);
        } else {
            std::env::set_var(name, value);
        }
    }
}

pub(crate) fn register_builtins() {
    crate::cmd::register_cmd(
        &["env"],
        &[
            "[names ...] display all environment, or variables",
            "Apart from LS_COLORS: that is just spam.",
            "If you specify names it'll just show the ones whose name",
            "start with that prefix",
        ],
        cmd_env,
        std::ptr::null_mut(),
        false,
    );
    crate::cmd::register_cmd(
        &["setenv"],
        &[
            "[<name>=<value>...] set/clear environment variable(s)",
            "Set <name> to <value> .. if <value> is omitted, clears it.",
            "The '=' is required, even when clearing.",
        ],
        cmd_setenv,
        std::ptr::null_mut(),
        false,
    );
}

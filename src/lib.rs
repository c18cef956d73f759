pub mod line;
pub mod scrollback;
pub mod vt;
pub mod telnet;
pub mod select;
pub mod input;
pub mod send;
pub mod client;
pub mod client_input;
pub mod cmd;
pub mod cmd_env;
pub mod capture;
pub mod session;
pub mod debug_log;

pub use cmd::{cmd_poll, register_cmd, register_cmd_kind, set_command_parameter};
pub use cmd::{CmdHandler, CLIENT_CMD_KIND, MISH_CMD_KIND};
pub use session::{get_flags, prepare, terminate, Caps, Engine};

// https://en.wikipedia.org/wiki/ANSI_escape_code#Terminal_output_sequences
pub const COLOR_RED: &str = "\x1b[38;5;125m";
pub const COLOR_GREEN: &str = "\x1b[38;5;28m";
pub const COLOR_RESET: &str = "\x1b[0m";

//! Worker command line construction.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::config::WorkerCommand;

/// `<program> <args..> <module path>` wired for the JSON-lines protocol:
/// stdin and stdout piped, stderr passed through.
pub fn worker_command(worker: &WorkerCommand, module_path: &Path) -> Command {
    let mut cmd = Command::new(&worker.program);
    cmd.args(&worker.args)
        .arg(module_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(false);
    hide_console_window(&mut cmd);
    cmd
}

#[cfg(target_os = "windows")]
fn hide_console_window(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(target_os = "windows"))]
fn hide_console_window(_cmd: &mut Command) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_module_path_is_last_argument() {
        let worker = WorkerCommand {
            program: "node".to_string(),
            args: vec!["--enable-source-maps".to_string()],
        };
        let cmd = worker_command(&worker, Path::new("lib/module.js"));
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), OsStr::new("node"));
        let args: Vec<&OsStr> = std_cmd.get_args().collect();
        assert_eq!(args, vec![OsStr::new("--enable-source-maps"), OsStr::new("lib/module.js")]);
    }
}

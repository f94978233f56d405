use std::ffi::OsStr;
use std::process::{Child, Command, Stdio};

/// Builds a command for an external tool that runs without a console and without stdin.
pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null());
    configure_for_background(&mut cmd);
    cmd
}

/// Kills the child together with anything it spawned (yt-dlp forks ffmpeg for merges).
pub fn kill_process_tree(child: &mut Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = command("taskkill").args(["/PID", &pid, "/T", "/F"]).status();
    }

    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

//! Detaches a spawned child from the current process group, so `breakpoint
//! start` can fork `wait` into the background without it dying when the
//! parent's controlling session (an SSH connection, a CI step) exits.
//! Grounded on `pkg/execbackground/bg_unix.go`.

#[cfg(unix)]
pub fn set_create_session(command: &mut tokio::process::Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn set_create_session(_command: &mut tokio::process::Command) {}

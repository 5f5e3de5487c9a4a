//! Cooperative spawner: the dynamic loader pulls the fault-injection
//! library in through the preload variable, so the child only needs its
//! channel ends and resource ceilings arranged between `fork` and `exec`.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Stdio;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tokio::net::unix::pipe::Receiver;

use crate::command::FuzzCommand;
use crate::error::LaunchError;
use crate::options::InjectionMode;
use crate::{Channels, FuzzedChild, env, preload};

pub type ChannelReader = Receiver;
pub type ExitStatus = std::process::ExitStatus;
pub(crate) type ChildHandle = tokio::process::Child;

/// Descriptor number the fault-injection library expects its debug stream
/// on. High enough that targets juggling their own descriptors rarely
/// collide with it.
pub const DEBUG_FD: RawFd = 17;

cfg_if::cfg_if! {
    if #[cfg(target_os = "openbsd")] {
        use libc::RLIMIT_DATA as RLIMIT_MEM;
    } else {
        use libc::RLIMIT_AS as RLIMIT_MEM;
    }
}

struct Channel {
    read: Receiver,
    write: OwnedFd,
}

/// Both ends are created close-on-exec. The write end loses the flag in
/// the child when it is dup2'ed onto its destination descriptor.
fn create_channel() -> io::Result<Channel> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
    let read = Receiver::from_owned_fd(read)?;
    Ok(Channel { read, write })
}

/// The child's setup rewires descriptors 0 through 2 before any hook of
/// ours runs, so the debug end must sit above that range.
fn duplicate_past_stdio(mut fd: OwnedFd) -> io::Result<OwnedFd> {
    let mut crowded = Vec::new();
    while fd.as_raw_fd() <= 2 {
        let above = fd.try_clone()?;
        crowded.push(fd);
        fd = above;
    }
    Ok(fd)
}

/// Child-side hook. Only async-signal-safe calls are allowed here.
fn install_debug_fd(fd: RawFd) -> io::Result<()> {
    if fd == DEBUG_FD {
        // already in place; just let it survive the exec
        let flags = unsafe { libc::fcntl(DEBUG_FD, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(DEBUG_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }
    if unsafe { libc::dup2(fd, DEBUG_FD) } < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { libc::close(fd) };
    Ok(())
}

/// Child-side hook. Ceilings are best effort; a refusal must not fail the
/// launch, and nothing can be logged on this side of the fork.
fn apply_resource_ceilings(max_memory_mb: Option<u64>, max_cpu_seconds: Option<u64>) {
    if let Some(mb) = max_memory_mb {
        let bytes = (mb << 20) as libc::rlim_t;
        let ceiling = libc::rlimit {
            rlim_cur: bytes,
            rlim_max: bytes,
        };
        unsafe { libc::setrlimit(RLIMIT_MEM, &ceiling) };
    }
    if let Some(seconds) = max_cpu_seconds {
        // slack between soft and hard so the target can catch SIGXCPU
        let ceiling = libc::rlimit {
            rlim_cur: seconds as libc::rlim_t,
            rlim_max: (seconds + 5) as libc::rlim_t,
        };
        unsafe { libc::setrlimit(libc::RLIMIT_CPU, &ceiling) };
    }
}

pub(crate) async fn spawn_impl(mut command: FuzzCommand) -> Result<FuzzedChild, LaunchError> {
    let options = command.options.clone();

    let debug = create_channel().map_err(LaunchError::Channel)?;
    let stderr = create_channel().map_err(LaunchError::Channel)?;
    let stdout = create_channel().map_err(LaunchError::Channel)?;
    let debug_write = duplicate_past_stdio(debug.write).map_err(LaunchError::Channel)?;

    for (name, value) in env::fuzzing_vars(&options, DEBUG_FD as u64) {
        command.envs.insert(name.into(), value.into());
    }
    if options.mode == InjectionMode::Preload {
        preload::install(&mut command.envs, &options.original_argv0);
    }

    let command_line = command.command_line();
    let mut tokio_command = command.into_tokio_command();
    tokio_command
        .stdout(Stdio::from(stdout.write))
        .stderr(Stdio::from(stderr.write));

    let debug_raw = debug_write.as_raw_fd();
    let max_memory_mb = options.max_memory_mb;
    let max_cpu_seconds = options.max_cpu_seconds;
    unsafe {
        tokio_command.pre_exec(move || {
            install_debug_fd(debug_raw)?;
            apply_resource_ceilings(max_memory_mb, max_cpu_seconds);
            Ok(())
        });
    }

    let child = tokio_command.spawn().map_err(LaunchError::Spawn)?;
    let id = child.id().expect("freshly spawned child has a pid");
    // Drop the parent's write ends so each reader reaches EOF as soon as
    // the last process holding them exits.
    drop(tokio_command);
    drop(debug_write);

    Ok(FuzzedChild {
        id,
        command_line,
        channels: Channels {
            debug: debug.read,
            stderr: stderr.read,
            stdout: stdout.read,
        },
        handle: child,
    })
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt as _;

    use super::*;

    #[tokio::test]
    async fn dropping_the_write_end_ends_the_stream() {
        let mut channel = create_channel().unwrap();
        drop(channel.write);
        let mut buf = Vec::new();
        channel.read.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn channel_ends_never_leak_into_children() {
        let channel = create_channel().unwrap();
        let flags = unsafe { libc::fcntl(channel.read.as_raw_fd(), libc::F_GETFD) };
        assert!(flags >= 0 && flags & libc::FD_CLOEXEC != 0);
        let flags = unsafe { libc::fcntl(channel.write.as_raw_fd(), libc::F_GETFD) };
        assert!(flags >= 0 && flags & libc::FD_CLOEXEC != 0);
    }
}

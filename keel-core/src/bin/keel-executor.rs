//! Build executor: the isolator child.
//!
//! Spawned by the build engine with a root directory and a set of bind
//! mounts. Binds its listening socket, applies the mounts beneath the root,
//! switches into it with `chroot(2)` and then serves one `Execute` at a
//! time: the command runs under `/bin/sh -c`, its output streams back as
//! ordered `Log` messages, and exactly one `Completed` closes the request.
//!
//! Requires privileges for `mount(2)` and `chroot(2)`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::mount::MsFlags;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Command;

use keel_core::isolator::wire::{self, LogStream, Message};

#[derive(Parser)]
#[command(name = "keel-executor", about = "Sandboxed command executor for keel builds")]
struct Args {
    /// Directory to take as the new root.
    #[arg(long)]
    root: PathBuf,

    /// Unix socket to listen on, bound before switching roots.
    #[arg(long)]
    socket: PathBuf,

    /// Bind mount as HOST:CONTAINER:(ro|rw), applied beneath the root.
    #[arg(long = "mount")]
    mounts: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("binding {}", args.socket.display()))?;

    for spec in &args.mounts {
        apply_mount(&args.root, spec)?;
    }

    std::env::set_current_dir(&args.root)
        .with_context(|| format!("entering {}", args.root.display()))?;
    nix::unistd::chroot(&args.root)
        .with_context(|| format!("chroot into {}", args.root.display()))?;
    nix::unistd::chdir("/").context("chdir after chroot")?;

    let (stream, _addr) = listener.accept().await.context("accepting client")?;
    serve(stream).await
}

/// Bind a host directory beneath the root. Read-only binds take the
/// required two steps: bind first, then remount with the read-only flag.
fn apply_mount(root: &Path, spec: &str) -> Result<()> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (host, container, mode) = match parts.as_slice() {
        [host, container, mode] => (*host, *container, *mode),
        _ => bail!("invalid mount spec {spec:?}, expected HOST:CONTAINER:(ro|rw)"),
    };
    let writable = match mode {
        "rw" => true,
        "ro" => false,
        other => bail!("invalid mount mode {other:?} in {spec:?}"),
    };

    let target = root.join(container.trim_start_matches('/'));
    std::fs::create_dir_all(&target)
        .with_context(|| format!("creating mountpoint {}", target.display()))?;

    nix::mount::mount(Some(host), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
        .with_context(|| format!("binding {host} at {}", target.display()))?;
    if !writable {
        nix::mount::mount(
            Some(host),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .with_context(|| format!("remounting {} read-only", target.display()))?;
    }
    Ok(())
}

async fn serve(mut stream: UnixStream) -> Result<()> {
    loop {
        // The client hanging up is the nominal way this process ends.
        let Ok(msg) = wire::recv(&mut stream).await else {
            return Ok(());
        };
        let Message::Execute { command } = msg else {
            bail!("unexpected message from client: {msg:?}");
        };
        let completed = execute(&mut stream, &command).await?;
        wire::send(&mut stream, &completed).await?;
    }
}

/// Run one command, streaming stdout and stderr lines in arrival order.
async fn execute(stream: &mut UnixStream, command: &str) -> Result<Message> {
    let mut child = match Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            return Ok(Message::Completed { exit_code: -1, error: format!("spawning shell: {err}") })
        }
    };

    let stdout = child.stdout.take().context("stdout pipe missing")?;
    let stderr = child.stderr.take().context("stderr pipe missing")?;
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_done = false;
    let mut err_done = false;

    while !out_done || !err_done {
        tokio::select! {
            line = out_lines.next_line(), if !out_done => match line? {
                Some(text) => {
                    wire::send(stream, &Message::Log { stream: LogStream::Out, text }).await?;
                }
                None => out_done = true,
            },
            line = err_lines.next_line(), if !err_done => match line? {
                Some(text) => {
                    wire::send(stream, &Message::Log { stream: LogStream::Err, text }).await?;
                }
                None => err_done = true,
            },
        }
    }

    let status = child.wait().await.context("waiting for command")?;
    Ok(Message::Completed { exit_code: status.code().unwrap_or(-1), error: String::new() })
}

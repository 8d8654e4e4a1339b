//! Minimal application used to exercise the spawner end to end.
//!
//! Binds a unix socket, announces it on the control descriptor named by
//! `APPPOOL_CONTROL_FD` and closes that descriptor, then answers each
//! connection with one reply and closes it. A connection starting with a NUL byte
//! carries a framed request (length-prefixed header list); anything else is
//! a one-line text command:
//!
//! - `ping`     -> `pong`
//! - `pid`      -> the process id
//! - `envvars`  -> `NAME = value` for every environment variable
//! - `identity` -> uid, gid and supplementary groups, one per line

use std::fs::File;
use std::io::Write;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::path::PathBuf;

use anyhow::Context;
use apppool_spawner::SystemAccounts;
use apppool_spawner::launcher::CONTROL_FD_ENV_VAR;
use apppool_spawner::privilege::ResolvedIdentity;
use apppool_spawner::request;
use apppool_spawner::request::CONNECT_PASSWORD_KEY;
use clap::Parser;
use rand::Rng;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct StubAppCli {
    /// Directory for the listening socket. Defaults to the system temp dir.
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Name announced for the socket.
    #[arg(long, default_value = "main")]
    name: String,

    /// Concurrency announced for the socket.
    #[arg(long, default_value_t = 1)]
    concurrency: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let StubAppCli {
        socket_dir,
        name,
        concurrency,
    } = StubAppCli::parse();
    let socket_dir = socket_dir.unwrap_or_else(std::env::temp_dir);
    let socket_path = socket_dir.join(format!(
        "apppool-stub-{}-{:08x}.sock",
        std::process::id(),
        rand::rng().random::<u32>()
    ));
    let listener = UnixListener::bind(&socket_path)?;

    let mut control = control_channel()?;
    write!(
        control,
        "socket: {name};unix:{};session;{concurrency}\n\n",
        socket_path.display()
    )?;
    control.flush()?;
    drop(control);

    let connect_password = std::env::var(CONNECT_PASSWORD_KEY).unwrap_or_default();
    loop {
        let (stream, _) = listener.accept().await?;
        let connect_password = connect_password.clone();
        tokio::spawn(async move {
            if let Err(err) = serve(stream, &connect_password).await {
                tracing::warn!("connection failed: {err}");
            }
        });
    }
}

fn control_channel() -> anyhow::Result<File> {
    let fd: RawFd = std::env::var(CONTROL_FD_ENV_VAR)
        .with_context(|| format!("{CONTROL_FD_ENV_VAR} is not set"))?
        .parse()
        .with_context(|| format!("{CONTROL_FD_ENV_VAR} is not a descriptor number"))?;
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        anyhow::bail!("{CONTROL_FD_ENV_VAR}={fd} is not an open descriptor");
    }
    // The spawner hands this descriptor to us alone; nothing else owns it.
    Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

async fn serve(stream: UnixStream, connect_password: &str) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let framed = match reader.fill_buf().await?.first() {
        None => return Ok(()),
        Some(first) => *first == 0,
    };

    let reply = if framed {
        let Some(body) = request::read_scalar_message(&mut reader).await? else {
            return Ok(());
        };
        let headers = request::decode_headers(&body)?;
        let password = headers
            .iter()
            .find(|(key, _)| key == CONNECT_PASSWORD_KEY)
            .map(|(_, value)| value.as_str());
        if password != Some(connect_password) {
            tracing::debug!("rejecting request with a wrong connect password");
            return Ok(());
        }
        let path_info = headers
            .iter()
            .find(|(key, _)| key == "PATH_INFO")
            .map(|(_, value)| value.as_str());
        if path_info == Some("/print_stderr") {
            eprintln!("hello world!");
        }
        "ok\n".to_string()
    } else {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        command_reply(line.trim())?
    };

    writer.write_all(reply.as_bytes()).await?;
    writer.shutdown().await?;
    Ok(())
}

fn command_reply(command: &str) -> anyhow::Result<String> {
    let reply = match command {
        "ping" => "pong\n".to_string(),
        "pid" => format!("{}\n", std::process::id()),
        "envvars" => std::env::vars_os()
            .map(|(key, value)| {
                format!("{} = {}\n", key.to_string_lossy(), value.to_string_lossy())
            })
            .collect(),
        "identity" => {
            let identity = ResolvedIdentity::current(&SystemAccounts)?;
            let groups: Vec<String> = identity
                .supplementary_gids
                .iter()
                .map(ToString::to_string)
                .collect();
            format!(
                "{}\n{}\n{}\n",
                identity.uid,
                identity.primary_gid,
                groups.join(" ")
            )
        }
        other => format!("unknown command {other:?}\n"),
    };
    Ok(reply)
}

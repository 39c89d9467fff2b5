//! Receive datagrams from a peer thread and print who sent them.
//!
//! Run with `RUST_LOG=uring_dgram=trace` to watch buffers cycle through the
//! provided buffer ring.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::thread;

use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};
use uring_dgram::{Config, Handler, Reception};

const MESSAGES: usize = 32;

fn init_logging() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_target(true))
        .init();
}

fn enable_passcred(socket: &UnixDatagram) -> std::io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of_val(&on) as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn main() {
    init_logging();

    if !uring_dgram::is_supported() {
        error!("this kernel does not support multishot recvmsg with provided buffers");
        std::process::exit(1);
    }

    let (rx, tx) = match UnixDatagram::pair() {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, "failed to create socket pair");
            std::process::exit(1);
        }
    };
    if let Err(e) = enable_passcred(&rx) {
        error!(error = %e, "failed to enable SO_PASSCRED");
        std::process::exit(1);
    }

    let config = Config {
        num_buffers: 4,
        payload_size: 256,
        ..Default::default()
    };
    let mut handler = match Handler::with_config(rx.as_raw_fd(), &config) {
        Ok(handler) => handler,
        Err(e) => {
            error!(error = %e, "failed to start handler");
            std::process::exit(1);
        }
    };

    let sender = thread::spawn(move || {
        for i in 0..MESSAGES {
            if tx.send(format!("message {i}").as_bytes()).is_err() {
                break;
            }
        }
    });

    let mut received = 0;
    while received < MESSAGES {
        match handler.receive() {
            Ok(Reception::Datagram(datagram)) => {
                received += 1;
                info!(
                    buf_id = datagram.buffer_id(),
                    pid = datagram.credentials().map(|creds| creds.pid()),
                    payload = %String::from_utf8_lossy(datagram.payload()),
                    "received"
                );
            }
            Ok(Reception::Empty) => {}
            Err(e) => {
                error!(error = %e, "receive failed");
                break;
            }
        }
    }

    let _ = sender.join();
    info!(stats = ?handler.stats(), "done");
}

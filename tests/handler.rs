//! Receive tests against a real io_uring instance.
//!
//! Every test drives a `UnixDatagram` pair. When the kernel or sandbox
//! refuses io_uring the test prints why and returns early.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixDatagram;

use uring_dgram::{Config, Datagram, Error, Handler, RECVMSG_OUT_LEN, Reception};

/// Upper bound on empty completions tolerated while waiting for one datagram.
const MAX_EMPTY: usize = 16;

fn socket_pair(passcred: bool) -> (UnixDatagram, UnixDatagram) {
    let (rx, tx) = UnixDatagram::pair().unwrap();
    if passcred {
        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                rx.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of_val(&on) as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0, "SO_PASSCRED: {}", std::io::Error::last_os_error());
    }
    (rx, tx)
}

/// Build a ready handler, or `None` if io_uring is unavailable here.
fn armed_handler(rx: &UnixDatagram, num_buffers: u16, payload_size: usize) -> Option<Handler> {
    if !uring_dgram::is_supported() {
        eprintln!("skipping: kernel older than 6.1");
        return None;
    }
    let mut handler = Handler::new(rx.as_raw_fd());
    let ready = handler
        .setup(8)
        .and_then(|_| handler.allocate_and_register(num_buffers, payload_size))
        .and_then(|_| handler.arm_multishot_recv());
    match ready {
        Ok(()) => Some(handler),
        Err(e) => {
            eprintln!("skipping: io_uring unavailable: {e}");
            None
        }
    }
}

/// Receive the next datagram, pass it to `f`, then release it.
fn with_next<R>(handler: &mut Handler, f: impl FnOnce(&Datagram<'_>) -> R) -> R {
    for _ in 0..MAX_EMPTY {
        match handler.receive().unwrap() {
            Reception::Datagram(datagram) => return f(&datagram),
            Reception::Empty => continue,
        }
    }
    panic!("no datagram after {MAX_EMPTY} empty completions");
}

#[test]
fn test_receive_with_credentials() {
    let (rx, tx) = socket_pair(true);
    let Some(mut handler) = armed_handler(&rx, 4, 1024) else {
        return;
    };

    assert_eq!(handler.num_buffers(), 4);
    assert_eq!(
        handler.buffer_size(),
        RECVMSG_OUT_LEN + handler.ancillary_len() + 1024
    );

    tx.send(b"hello").unwrap();

    let buf_id = with_next(&mut handler, |datagram| {
        assert_eq!(datagram.len(), 5);
        assert_eq!(datagram.payload(), b"hello");
        assert!(!datagram.is_truncated());

        let creds = datagram.credentials().expect("credentials attached");
        assert_eq!(creds.pid(), std::process::id() as libc::pid_t);
        assert_eq!(creds.uid(), unsafe { libc::getuid() });
        assert_eq!(creds.gid(), unsafe { libc::getgid() });
        datagram.buffer_id()
    });

    assert!(buf_id < 4);
    assert_eq!(handler.active_buffer(), None);
    let stats = handler.stats();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.released, 1);
}

#[test]
fn test_receive_without_credentials() {
    let (rx, tx) = socket_pair(false);
    let Some(mut handler) = armed_handler(&rx, 4, 1024) else {
        return;
    };

    tx.send(b"anonymous").unwrap();

    with_next(&mut handler, |datagram| {
        assert_eq!(datagram.payload(), b"anonymous");
        assert!(datagram.credentials().is_none());
    });
}

#[test]
fn test_buffers_cycle() {
    let (rx, tx) = socket_pair(true);
    let Some(mut handler) = armed_handler(&rx, 2, 64) else {
        return;
    };

    let mut seen = [0usize; 2];
    for i in 0..10u8 {
        tx.send(&[i]).unwrap();
        let buf_id = with_next(&mut handler, |datagram| {
            assert_eq!(datagram.payload(), &[i]);
            datagram.buffer_id()
        });
        assert!(buf_id < 2, "buffer {buf_id} outside pool");
        seen[buf_id as usize] += 1;
    }

    assert!(seen.iter().all(|&count| count > 0), "starved buffer: {seen:?}");
    let stats = handler.stats();
    assert_eq!(stats.received, 10);
    assert_eq!(stats.released, 10);
}

#[test]
fn test_ring_exhaustion_rearms() {
    let (rx, tx) = socket_pair(false);
    let Some(mut handler) = armed_handler(&rx, 2, 64) else {
        return;
    };

    // More datagrams than buffers: the kernel may end the chain with ENOBUFS.
    for payload in [b"a", b"b", b"c"] {
        tx.send(payload).unwrap();
    }
    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(with_next(&mut handler, |datagram| datagram.payload().to_vec()));
    }
    assert_eq!(received, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    // The chain is live again for the next deliveries.
    for payload in [b"d", b"e", b"f"] {
        tx.send(payload).unwrap();
        let got = with_next(&mut handler, |datagram| datagram.payload().to_vec());
        assert_eq!(got, payload.to_vec());
    }

    // One ENOBUFS ended the chain once and it was re-armed once.
    let stats = handler.stats();
    assert_eq!(stats.received, 6);
    assert_eq!(stats.released, 6);
    assert_eq!(stats.kernel_errors, 1);
    assert_eq!(stats.arms, 2);
}

#[test]
fn test_live_chain_is_not_rearmed() {
    let (rx, tx) = socket_pair(false);
    let Some(mut handler) = armed_handler(&rx, 4, 64) else {
        return;
    };

    for i in 0..6u8 {
        tx.send(&[i]).unwrap();
        let got = with_next(&mut handler, |datagram| datagram.payload().to_vec());
        assert_eq!(got, vec![i]);
    }

    let stats = handler.stats();
    assert_eq!(stats.received, 6);
    assert_eq!(stats.kernel_errors, 0);
    assert_eq!(stats.arms, 1);
    assert!(handler.is_armed());
}

#[test]
fn test_reregister_with_new_layout() {
    let (rx, tx) = socket_pair(false);
    let Some(mut handler) = armed_handler(&rx, 4, 1024) else {
        return;
    };

    tx.send(b"one").unwrap();
    with_next(&mut handler, |datagram| assert_eq!(datagram.payload(), b"one"));

    handler.deregister();
    assert!(!handler.is_registered());
    assert!(!handler.is_armed());
    assert_eq!(handler.num_buffers(), 0);
    assert_eq!(handler.buffer_size(), 0);
    assert_eq!(handler.ancillary_len(), 0);
    assert!(matches!(handler.receive(), Err(Error::NotRegistered)));

    handler.allocate_and_register(8, 256).unwrap();
    assert_eq!(handler.num_buffers(), 8);
    assert_eq!(
        handler.buffer_size(),
        RECVMSG_OUT_LEN + handler.ancillary_len() + 256
    );
    assert!(matches!(
        handler.allocate_and_register(8, 256),
        Err(Error::AlreadyRegistered)
    ));
    handler.arm_multishot_recv().unwrap();

    tx.send(b"two").unwrap();
    let buf_id = with_next(&mut handler, |datagram| {
        assert_eq!(datagram.payload(), b"two");
        datagram.buffer_id()
    });
    assert!(buf_id < 8);
}

#[test]
fn test_reregister_drops_pending_completions() {
    let (rx, tx) = socket_pair(false);
    let Some(mut handler) = armed_handler(&rx, 4, 64) else {
        return;
    };

    // "two" and "thr" land in old-pool buffers and are never surfaced.
    for payload in [b"one", b"two", b"thr"] {
        tx.send(payload).unwrap();
    }
    with_next(&mut handler, |datagram| assert_eq!(datagram.payload(), b"one"));

    handler.deregister();
    assert!(!handler.is_armed());

    handler.allocate_and_register(4, 64).unwrap();
    handler.arm_multishot_recv().unwrap();

    tx.send(b"fresh").unwrap();
    with_next(&mut handler, |datagram| {
        assert!(!datagram.is_empty());
        assert_eq!(datagram.payload(), b"fresh");
    });

    // Several in flight at once: a buffer advertised twice would be overwritten.
    let batch: [&[u8]; 3] = [b"x", b"y", b"z"];
    for payload in batch {
        tx.send(payload).unwrap();
    }
    let mut buf_ids = Vec::new();
    for payload in batch {
        let buf_id = with_next(&mut handler, |datagram| {
            assert_eq!(datagram.payload(), payload);
            datagram.buffer_id()
        });
        buf_ids.push(buf_id);
    }
    buf_ids.sort_unstable();
    buf_ids.dedup();
    assert_eq!(buf_ids.len(), 3);

    let stats = handler.stats();
    assert_eq!(stats.received, 5);
    assert_eq!(stats.kernel_errors, 0);
    assert_eq!(stats.arms, 2);
}

#[test]
fn test_forgotten_datagram_blocks_receive() {
    let (rx, tx) = socket_pair(false);
    let Some(mut handler) = armed_handler(&rx, 4, 64) else {
        return;
    };

    tx.send(b"first").unwrap();
    tx.send(b"second").unwrap();

    let mut forgotten = None;
    for _ in 0..MAX_EMPTY {
        if let Some(datagram) = handler.receive().unwrap().into_datagram() {
            forgotten = Some(datagram.buffer_id());
            std::mem::forget(datagram);
            break;
        }
    }
    let buf_id = forgotten.expect("datagram");

    assert_eq!(handler.active_buffer(), Some(buf_id));
    assert!(matches!(handler.receive(), Err(Error::BufferOutstanding)));

    handler.release();
    assert_eq!(handler.active_buffer(), None);

    with_next(&mut handler, |datagram| assert_eq!(datagram.payload(), b"second"));
}

#[test]
fn test_truncated_datagram() {
    let (rx, tx) = socket_pair(false);
    let Some(mut handler) = armed_handler(&rx, 2, 4) else {
        return;
    };

    tx.send(b"truncated!").unwrap();
    with_next(&mut handler, |datagram| {
        assert!(datagram.is_truncated());
        assert_eq!(datagram.payload(), b"trun");
    });
}

#[test]
fn test_with_config() {
    let (rx, tx) = socket_pair(true);
    let config = Config {
        num_buffers: 8,
        payload_size: 128,
        ..Default::default()
    };
    let mut handler = match Handler::with_config(rx.as_raw_fd(), &config) {
        Ok(handler) => handler,
        Err(e @ (Error::Unsupported | Error::RingSetup(_) | Error::Registration(_))) => {
            eprintln!("skipping: {e}");
            return;
        }
        Err(e) => panic!("unexpected error: {e}"),
    };
    assert!(handler.is_setup());
    assert!(handler.is_armed());
    assert!(matches!(handler.setup(8), Err(Error::AlreadySetUp)));

    tx.send(b"configured").unwrap();
    with_next(&mut handler, |datagram| {
        assert_eq!(datagram.payload(), b"configured");
        assert!(datagram.credentials().is_some());
    });
}

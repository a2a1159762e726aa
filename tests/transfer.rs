//! End-to-end transfer scenarios: both personalities in one process over
//! the loopback fabric. Byte fidelity is enforced by the sink inside the
//! `get` personality; a clean pair of results means the stream verified.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use fabxfer::config::RunConfig;
use fabxfer::run::GetState;
use fabxfer::Result;

fn leaked_flag() -> &'static AtomicBool {
    Box::leak(Box::new(AtomicBool::new(false)))
}

/// Run a get/put pair on threads; put dials get's ephemeral listener.
fn run_pair(get_cfg: RunConfig, put_cfg: RunConfig) -> (Result<()>, Result<()>) {
    let gst = GetState::open(get_cfg.with_bind("127.0.0.1:0")).expect("open listener");
    let addr = gst.local_addr();

    let g = thread::spawn(move || gst.run());
    let p = thread::spawn(move || fabxfer::put(put_cfg.with_dest(addr.to_string())));

    (g.join().unwrap(), p.join().unwrap())
}

#[test]
fn test_single_session() {
    let (g, p) = run_pair(RunConfig::default(), RunConfig::default());
    g.expect("get personality");
    p.expect("put personality");
}

#[test]
fn test_four_sessions() {
    let (g, p) = run_pair(
        RunConfig::default().with_nsessions(4),
        RunConfig::default().with_nsessions(4),
    );
    g.expect("get personality");
    p.expect("put personality");
}

#[test]
fn test_contiguous_writes() {
    // One remote segment per write; the byte stream must still verify.
    let (g, p) = run_pair(
        RunConfig::default(),
        RunConfig::default().with_contiguous(true),
    );
    g.expect("get personality");
    p.expect("put personality");
}

#[test]
fn test_reregister() {
    let (g, p) = run_pair(
        RunConfig::default().with_reregister(true),
        RunConfig::default().with_reregister(true),
    );
    g.expect("get personality");
    p.expect("put personality");
}

#[test]
fn test_waitfd() {
    let (g, p) = run_pair(
        RunConfig::default().with_waitfd(true),
        RunConfig::default().with_waitfd(true),
    );
    g.expect("get personality");
    p.expect("put personality");
}

#[test]
fn test_cancellation_drains() {
    let get_flag = leaked_flag();
    let put_flag = leaked_flag();

    let gst = GetState::open(
        RunConfig::default()
            .with_bind("127.0.0.1:0")
            .with_expect_cancellation(true)
            .with_cancel_flag(get_flag),
    )
    .expect("open listener");
    let addr = gst.local_addr();

    let g = thread::spawn(move || gst.run());
    let p = thread::spawn(move || {
        fabxfer::put(
            RunConfig::default()
                .with_dest(addr.to_string())
                .with_expect_cancellation(true)
                .with_cancel_flag(put_flag),
        )
    });

    // Let the handshake and the first writes go through, then cancel both
    // sides, as a signal would.
    thread::sleep(Duration::from_millis(300));
    get_flag.store(true, Ordering::Relaxed);
    put_flag.store(true, Ordering::Relaxed);

    g.join().unwrap().expect("canceled get drains cleanly");
    p.join().unwrap().expect("canceled put drains cleanly");
}

#[test]
fn test_cancellation_without_expectation_fails() {
    let get_flag = leaked_flag();
    let put_flag = leaked_flag();

    let gst = GetState::open(
        RunConfig::default()
            .with_bind("127.0.0.1:0")
            .with_cancel_flag(get_flag),
    )
    .expect("open listener");
    let addr = gst.local_addr();

    let g = thread::spawn(move || gst.run());
    let p = thread::spawn(move || {
        fabxfer::put(
            RunConfig::default()
                .with_dest(addr.to_string())
                .with_cancel_flag(put_flag),
        )
    });

    thread::sleep(Duration::from_millis(300));
    get_flag.store(true, Ordering::Relaxed);
    put_flag.store(true, Ordering::Relaxed);

    assert!(g.join().unwrap().is_err());
    assert!(p.join().unwrap().is_err());
}

/// A hand-rolled receiver whose first advertisement slices its target
/// region into 2-byte windows, smaller than any payload buffer: every
/// buffer overflows the write window and the sender must fragment. The
/// stream still has to land byte-for-byte in advertisement order, and the
/// progress reports must sum to the total.
#[test]
fn test_oversize_payload_fragments_end_to_end() {
    use fabxfer::fabric::{AccessFlags, Fabric, FabricConfig, RmaIov, Sge};
    use fabxfer::message::{
        AckMsg, InitialMsg, ProgressMsg, VectorMsg, ACK_MSG_SIZE, INITIAL_MSG_SIZE,
        PROGRESS_MSG_SIZE,
    };
    use fabxfer::terminal::{entire_len, PATTERN};

    let fabric = Fabric::open(FabricConfig::default()).unwrap();
    let domain = fabric.domain();
    let av = domain.av();

    let listen = domain
        .endpoint(&av, Some("127.0.0.1:0".parse().unwrap()))
        .unwrap();
    let mut initial_buf = vec![0u8; INITIAL_MSG_SIZE];
    listen
        .recvmsg(
            &[Sge {
                addr: initial_buf.as_mut_ptr() as u64,
                len: initial_buf.len(),
            }],
            1,
        )
        .unwrap();

    let addr = listen.local_addr();
    let p = thread::spawn(move || fabxfer::put(RunConfig::default().with_dest(addr.to_string())));

    let cancel = AtomicBool::new(false);
    let cmpl = listen.cq().sread(&cancel).unwrap();
    assert_eq!(cmpl.len, INITIAL_MSG_SIZE);
    let init = InitialMsg::decode(&initial_buf).unwrap();
    let peer = av.insert(&init.addr).unwrap();

    let ep = domain.endpoint(&av, None).unwrap();
    let mut progress_bufs = vec![vec![0u8; PROGRESS_MSG_SIZE]; 8];
    for (i, buf) in progress_bufs.iter_mut().enumerate() {
        ep.recvmsg(
            &[Sge {
                addr: buf.as_mut_ptr() as u64,
                len: buf.len(),
            }],
            100 + i as u64,
        )
        .unwrap();
    }

    let mut ack_buf = vec![0u8; ACK_MSG_SIZE];
    AckMsg::new(ep.getname()).encode_to(&mut ack_buf);
    ep.sendmsg(
        &[Sge {
            addr: ack_buf.as_ptr() as u64,
            len: ack_buf.len(),
        }],
        peer,
        2,
    )
    .unwrap();

    // One big target region. The first advertisement forces fragmentation;
    // the rest hands out generous 4 KiB windows, with enough slack past the
    // stream total that the sender never stalls at the tail.
    let total = entire_len();
    let mut target = vec![0u8; total + 64 * 1024];
    let mr = domain
        .register(
            target.as_mut_ptr() as u64,
            target.len(),
            AccessFlags::RECV | AccessFlags::REMOTE_WRITE,
            0x5000,
        )
        .unwrap();

    let mut vectors: Vec<VectorMsg> = Vec::new();
    vectors.push(VectorMsg::new(
        (0..8)
            .map(|i| RmaIov {
                addr: i * 2,
                len: 2,
                key: mr.key(),
            })
            .collect(),
    ));
    let mut advertised = 16u64;
    while (advertised as usize) < target.len() {
        let iovs: Vec<RmaIov> = (0..8)
            .map(|i| RmaIov {
                addr: advertised + i * 4096,
                len: 4096,
                key: mr.key(),
            })
            .take_while(|r| (r.addr + r.len) as usize <= target.len())
            .collect();
        if iovs.is_empty() {
            break;
        }
        advertised += iovs.iter().map(|r| r.len).sum::<u64>();
        vectors.push(VectorMsg::new(iovs));
    }
    assert!(advertised as usize >= total + 32 * 1024);

    for (i, v) in vectors.iter().enumerate() {
        let mut buf = vec![0u8; v.wire_len()];
        v.encode_to(&mut buf);
        loop {
            match ep.sendmsg(
                &[Sge {
                    addr: buf.as_ptr() as u64,
                    len: buf.len(),
                }],
                peer,
                10_000 + i as u64,
            ) {
                Ok(()) => break,
                Err(fabxfer::Error::TryAgain) => {
                    ep.cq().ready();
                    thread::sleep(Duration::from_micros(200));
                }
                Err(e) => panic!("vector send failed: {e}"),
            }
        }
    }

    // Drain progress reports until the sender closes the stream.
    let mut nfilled_total = 0u64;
    loop {
        let cmpl = ep.cq().sread(&cancel).unwrap();
        if !(100..108).contains(&cmpl.ctx) {
            continue;
        }
        assert_eq!(cmpl.len, PROGRESS_MSG_SIZE);
        let idx = (cmpl.ctx - 100) as usize;
        let msg = ProgressMsg::decode(&progress_bufs[idx]).unwrap();
        nfilled_total += msg.nfilled;
        let done = msg.nleftover == 0;
        ep.recvmsg(
            &[Sge {
                addr: progress_bufs[idx].as_mut_ptr() as u64,
                len: PROGRESS_MSG_SIZE,
            }],
            cmpl.ctx,
        )
        .unwrap();
        if done {
            break;
        }
    }
    assert_eq!(nfilled_total as usize, total);

    // Close this side so the sender can finish.
    let eof = VectorMsg::eof();
    let mut eof_buf = vec![0u8; eof.wire_len()];
    eof.encode_to(&mut eof_buf);
    ep.sendmsg(
        &[Sge {
            addr: eof_buf.as_ptr() as u64,
            len: eof_buf.len(),
        }],
        peer,
        3,
    )
    .unwrap();

    p.join().unwrap().expect("put closes cleanly");

    for (i, &b) in target[..total].iter().enumerate() {
        assert_eq!(b, PATTERN[i % PATTERN.len()], "mismatch at offset {i}");
    }
}

/// A hand-rolled receiver that advertises nothing: the sender must record
/// remote EOF at once, post no writes, report `nleftover == 0`, and close.
#[test]
fn test_zero_advertisement() {
    use fabxfer::fabric::{Fabric, FabricConfig, Sge};
    use fabxfer::message::{
        AckMsg, InitialMsg, ProgressMsg, VectorMsg, ACK_MSG_SIZE, INITIAL_MSG_SIZE,
        PROGRESS_MSG_SIZE,
    };

    let fabric = Fabric::open(FabricConfig::default()).unwrap();
    let domain = fabric.domain();
    let av = domain.av();

    let listen = domain
        .endpoint(&av, Some("127.0.0.1:0".parse().unwrap()))
        .unwrap();
    let mut initial_buf = vec![0u8; INITIAL_MSG_SIZE];
    listen
        .recvmsg(
            &[Sge {
                addr: initial_buf.as_mut_ptr() as u64,
                len: initial_buf.len(),
            }],
            1,
        )
        .unwrap();

    let addr = listen.local_addr();
    let p = thread::spawn(move || fabxfer::put(RunConfig::default().with_dest(addr.to_string())));

    let cancel = AtomicBool::new(false);
    let cmpl = listen.cq().sread(&cancel).unwrap();
    assert_eq!(cmpl.ctx, 1);
    assert_eq!(cmpl.len, INITIAL_MSG_SIZE);
    let init = InitialMsg::decode(&initial_buf).unwrap();
    assert_eq!(init.nsources, 1);
    let peer = av.insert(&init.addr).unwrap();

    // The per-session endpoint whose address travels back in the ack.
    let ep = domain.endpoint(&av, None).unwrap();
    let mut progress_bufs = vec![vec![0u8; PROGRESS_MSG_SIZE]; 4];
    for (i, buf) in progress_bufs.iter_mut().enumerate() {
        ep.recvmsg(
            &[Sge {
                addr: buf.as_mut_ptr() as u64,
                len: buf.len(),
            }],
            10 + i as u64,
        )
        .unwrap();
    }

    let mut ack_buf = vec![0u8; ACK_MSG_SIZE];
    AckMsg::new(ep.getname()).encode_to(&mut ack_buf);
    ep.sendmsg(
        &[Sge {
            addr: ack_buf.as_ptr() as u64,
            len: ack_buf.len(),
        }],
        peer,
        2,
    )
    .unwrap();

    let eof = VectorMsg::eof();
    let mut vec_buf = vec![0u8; eof.wire_len()];
    eof.encode_to(&mut vec_buf);
    ep.sendmsg(
        &[Sge {
            addr: vec_buf.as_ptr() as u64,
            len: vec_buf.len(),
        }],
        peer,
        3,
    )
    .unwrap();

    // The sender must answer with a progress report: nothing written, no
    // more coming.
    loop {
        let cmpl = ep.cq().sread(&cancel).unwrap();
        if cmpl.ctx < 10 {
            continue;
        }
        assert_eq!(cmpl.len, PROGRESS_MSG_SIZE);
        let msg = ProgressMsg::decode(&progress_bufs[(cmpl.ctx - 10) as usize]).unwrap();
        assert_eq!(msg.nfilled, 0);
        assert_eq!(msg.nleftover, 0);
        break;
    }

    p.join().unwrap().expect("put closes cleanly");
}

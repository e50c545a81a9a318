//! End-to-end tests of the async framework over the loopback kernel: one
//! server runtime with a connection handler, one client runtime issuing
//! requests from a fibril.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use libasync::{
    AcceptLimits, Call, CallId, ConnectionHandler, IpcError, IrqCode, PhoneId, Runtime,
    Semaphore, ShareFlags, SharedArea, method,
};
use loopback_kernel::Loopback;
use pretty_assertions::assert_eq;

const ECHO: u64 = method::FIRST_USER;

struct Harness {
    kernel: Loopback,
    server: Runtime,
    client: Runtime,
    bootstrap: PhoneId,
}

impl Harness {
    fn new(handler: ConnectionHandler) -> Self {
        let kernel = Loopback::new();
        let server_port = Arc::new(kernel.port("server"));
        let client_port = Arc::new(kernel.port("client"));
        let bootstrap = kernel.connect(&client_port, &server_port);

        let server = Runtime::new(server_port);
        server.set_client_connection(handler);
        server.create_manager();

        let client = Runtime::new(client_port);
        client.create_manager();

        Self { kernel, server, client, bootstrap }
    }

    /// Run `f` on a client fibril and hand its result back to the test
    /// thread.
    fn run_client<T: Send + 'static>(
        &self,
        f: impl FnOnce(&Runtime, PhoneId) -> T + Send + 'static,
    ) -> T {
        let (tx, rx) = mpsc::channel();
        let bootstrap = self.bootstrap;
        self.client
            .spawn("test-client", move |rt| {
                let _ = tx.send(f(rt, bootstrap));
            })
            .expect("cannot start client fibril");
        rx.recv_timeout(Duration::from_secs(10)).expect("client fibril stalled")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.client.destroy_manager();
        self.server.destroy_manager();
        self.kernel.shutdown();
    }
}

/// Answer the opening call, echo every request, return on hangup.
fn echo_handler() -> ConnectionHandler {
    Arc::new(|rt: &Runtime, cid: CallId, _call: &Call| {
        let _ = rt.answer(cid, Ok(()), [0; 5]);
        loop {
            let (cid, call) = rt.get_call();
            if call.method == method::PHONE_HUNGUP {
                return;
            }
            let _ = rt.answer(cid, Ok(()), call.args);
        }
    })
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn echo_round_trip() {
    let h = Harness::new(echo_handler());
    let reply = h
        .run_client(|rt, boot| {
            let session = rt.connect_me_to(boot, 0, 0, 0)?;
            let reply = rt.request_fast(session, ECHO, 42, 0, 0, 0)?;
            rt.hangup(session)?;
            Ok::<_, IpcError>(reply)
        })
        .expect("echo failed");
    assert_eq!(reply.args[0], 42);
}

#[test]
fn flood_is_delivered_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let handler: ConnectionHandler = Arc::new(move |rt: &Runtime, cid: CallId, _call: &Call| {
        let _ = rt.answer(cid, Ok(()), [0; 5]);
        loop {
            let (cid, call) = rt.get_call();
            if call.method == method::PHONE_HUNGUP {
                return;
            }
            seen2.lock().unwrap().push(call.method);
            let _ = rt.answer(cid, Ok(()), [0; 5]);
        }
    });

    let h = Harness::new(handler);
    h.run_client(|rt, boot| {
        let s = rt.connect_me_to(boot, 0, 0, 0).unwrap();
        let a1 = rt.send_fast(s, ECHO + 1, 0, 0, 0, 0);
        let a2 = rt.send_fast(s, ECHO + 2, 0, 0, 0, 0);
        let a3 = rt.send_fast(s, ECHO + 3, 0, 0, 0, 0);
        rt.wait_for(a1).unwrap();
        rt.wait_for(a2).unwrap();
        rt.wait_for(a3).unwrap();
        rt.hangup(s).unwrap();
    });

    assert_eq!(*seen.lock().unwrap(), vec![ECHO + 1, ECHO + 2, ECHO + 3]);
}

#[test]
fn wait_timeout_expires_and_late_reply_is_harmless() {
    let handler: ConnectionHandler = Arc::new(|rt: &Runtime, cid: CallId, _call: &Call| {
        let _ = rt.answer(cid, Ok(()), [0; 5]);
        loop {
            let (cid, call) = rt.get_call();
            if call.method == method::PHONE_HUNGUP {
                return;
            }
            // Answer well after the client's patience runs out.
            rt.usleep(Duration::from_millis(40));
            let _ = rt.answer(cid, Ok(()), call.args);
        }
    });

    let h = Harness::new(handler);
    let (elapsed, late) = h.run_client(|rt, boot| {
        let s = rt.connect_me_to(boot, 0, 0, 0).unwrap();
        let aid = rt.send_fast(s, ECHO, 1, 0, 0, 0);
        let start = Instant::now();
        let res = rt.wait_timeout(aid, Duration::from_millis(10));
        let elapsed = start.elapsed();
        assert_eq!(res.unwrap_err(), IpcError::TimedOut);

        // Let the delayed reply land, then prove the session still works.
        rt.usleep(Duration::from_millis(60));
        let late = rt.request_fast(s, ECHO, 2, 0, 0, 0).unwrap();
        rt.hangup(s).unwrap();
        (elapsed, late)
    });

    assert!(elapsed >= Duration::from_millis(10), "returned after {elapsed:?}");
    assert_eq!(late.args[0], 2);
}

#[test]
fn hangup_read_is_idempotent() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let handler: ConnectionHandler = Arc::new(move |rt: &Runtime, cid: CallId, _call: &Call| {
        let _ = rt.answer(cid, Ok(()), [0; 5]);
        // The real hangup from the inbox, then two synthesized repeats.
        for _ in 0..3 {
            let (cid, call) =
                rt.get_call_timeout(Duration::from_millis(50)).expect("hangup expected");
            seen2.lock().unwrap().push((cid, call.method));
        }
    });

    let h = Harness::new(handler);
    h.run_client(|rt, boot| {
        let s = rt.connect_me_to(boot, 0, 0, 0).unwrap();
        rt.hangup(s).unwrap();
    });

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    let (first_cid, _) = seen[0];
    for (cid, m) in seen.iter() {
        assert_eq!(*cid, first_cid);
        assert_eq!(*m, method::PHONE_HUNGUP);
    }
}

#[test]
fn early_return_drains_inbox_with_hangup() {
    let handler: ConnectionHandler = Arc::new(|rt: &Runtime, cid: CallId, _call: &Call| {
        let _ = rt.answer(cid, Ok(()), [0; 5]);
        let (cid, call) = rt.get_call();
        let _ = rt.answer(cid, Ok(()), call.args);
        // Let the remaining messages queue up, then abandon them.
        rt.usleep(Duration::from_millis(50));
    });

    let h = Harness::new(handler);
    let (r1, r2, r3) = h.run_client(|rt, boot| {
        let s = rt.connect_me_to(boot, 0, 0, 0).unwrap();
        let a1 = rt.send_fast(s, ECHO + 1, 0, 0, 0, 0);
        let a2 = rt.send_fast(s, ECHO + 2, 0, 0, 0, 0);
        let a3 = rt.send_fast(s, ECHO + 3, 0, 0, 0, 0);
        (rt.wait_for(a1), rt.wait_for(a2), rt.wait_for(a3))
    });

    assert!(r1.is_ok());
    assert_eq!(r2.unwrap_err(), IpcError::Hungup);
    assert_eq!(r3.unwrap_err(), IpcError::Hungup);
}

#[test]
fn two_connections_stay_separate() {
    let logs = Arc::new(Mutex::new(HashMap::<u64, Vec<u64>>::new()));
    let logs2 = logs.clone();
    let handler: ConnectionHandler = Arc::new(move |rt: &Runtime, cid: CallId, call: &Call| {
        let tag = call.args[0];
        let _ = rt.answer(cid, Ok(()), [0; 5]);
        loop {
            let (cid, call) = rt.get_call();
            if call.method == method::PHONE_HUNGUP {
                return;
            }
            logs2.lock().unwrap().entry(tag).or_default().push(call.method);
            let _ = rt.answer(cid, Ok(()), [0; 5]);
        }
    });

    let h = Harness::new(handler);
    h.run_client(|rt, boot| {
        let a = rt.connect_me_to(boot, 7, 0, 0).unwrap();
        let b = rt.connect_me_to(boot, 8, 0, 0).unwrap();
        for i in 0..3 {
            rt.request_fast(a, ECHO + 70 + i, 0, 0, 0, 0).unwrap();
            rt.request_fast(b, ECHO + 80 + i, 0, 0, 0, 0).unwrap();
        }
        rt.hangup(a).unwrap();
        rt.hangup(b).unwrap();
    });

    let logs = logs.lock().unwrap();
    assert_eq!(logs[&7], vec![ECHO + 70, ECHO + 71, ECHO + 72]);
    assert_eq!(logs[&8], vec![ECHO + 80, ECHO + 81, ECHO + 82]);
}

#[test]
fn unrouted_call_is_answered_with_hangup() {
    let h = Harness::new(echo_handler());
    // The bootstrap phone has no connection behind it on the server.
    let res = h.run_client(|rt, boot| rt.request_fast(boot, ECHO, 0, 0, 0, 0));
    assert_eq!(res.unwrap_err(), IpcError::Hungup);
}

#[test]
fn notifications_spawn_handler_fibrils() {
    let h = Harness::new(echo_handler());
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    h.server.set_interrupt_received(Arc::new(move |_rt: &Runtime, cid: CallId, call: &Call| {
        assert!(cid.is_notification());
        assert_eq!(call.method, method::INTERRUPT);
        count2.fetch_add(1, Ordering::SeqCst);
    }));
    h.server
        .register_irq(4, 0, IrqCode { method: method::INTERRUPT, args: [1, 0, 0, 0, 0] })
        .unwrap();

    assert!(h.kernel.trigger_interrupt(4));
    assert!(h.kernel.trigger_interrupt(4));
    assert!(!h.kernel.trigger_interrupt(9));

    assert!(
        wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) == 2),
        "expected 2 notifications, saw {}",
        count.load(Ordering::SeqCst)
    );
}

#[test]
fn semaphore_serializes_fibrils() {
    let h = Harness::new(echo_handler());
    let sem = Arc::new(Semaphore::new(&h.client, 1));
    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    let (sem_a, order_a) = (sem.clone(), order.clone());
    h.client
        .spawn("holder", move |rt| {
            sem_a.down();
            order_a.lock().unwrap().push("a-acquired");
            rt.usleep(Duration::from_millis(30));
            order_a.lock().unwrap().push("a-release");
            sem_a.up();
        })
        .unwrap();

    let (sem_b, order_b) = (sem.clone(), order.clone());
    h.client
        .spawn("waiter", move |_rt| {
            order_b.lock().unwrap().push("b-try");
            sem_b.down();
            order_b.lock().unwrap().push("b-acquired");
            sem_b.up();
            let _ = tx.send(());
        })
        .unwrap();

    rx.recv_timeout(Duration::from_secs(5)).expect("waiter never got the semaphore");
    assert_eq!(*order.lock().unwrap(), vec!["a-acquired", "b-try", "a-release", "b-acquired"]);
}

#[test]
fn manager_rotation_keeps_the_runtime_live() {
    let h = Harness::new(echo_handler());

    // Open a session and leave its server fibril parked in get_call.
    let (session, first) = h.run_client(|rt, boot| {
        let s = rt.connect_me_to(boot, 0, 0, 0).unwrap();
        let first = rt.request_fast(s, ECHO, 1, 0, 0, 0);
        (s, first)
    });
    assert_eq!(first.unwrap().args[0], 1);

    // Rotate the manager on both sides; create_manager waits for the
    // outgoing manager to deregister, so this must not race or panic.
    h.client.destroy_manager();
    h.client.create_manager();
    h.server.destroy_manager();
    h.server.create_manager();

    // The open session keeps working under the new managers.
    let second = h.run_client(move |rt, _boot| {
        let second = rt.request_fast(session, ECHO, 2, 0, 0, 0);
        rt.hangup(session).unwrap();
        second
    });
    assert_eq!(second.unwrap().args[0], 2);
}

#[test]
fn usleep_suspends_for_at_least_the_duration() {
    let h = Harness::new(echo_handler());
    let elapsed = h.run_client(|rt, _boot| {
        let start = Instant::now();
        rt.usleep(Duration::from_millis(25));
        start.elapsed()
    });
    assert!(elapsed >= Duration::from_millis(25), "slept only {elapsed:?}");
}

#[test]
fn data_read_hands_bytes_to_the_caller() {
    let handler: ConnectionHandler = Arc::new(|rt: &Runtime, cid: CallId, _call: &Call| {
        let _ = rt.answer(cid, Ok(()), [0; 5]);
        loop {
            match rt.data_read_receive() {
                Ok((cid, _max)) => rt.data_read_finalize(cid, b"sensor data").unwrap(),
                Err(unexpected) => {
                    if unexpected.call.method == method::PHONE_HUNGUP {
                        return;
                    }
                    let _ = rt.answer(unexpected.cid, Err(IpcError::InvalidArgs), [0; 5]);
                }
            }
        }
    });

    let h = Harness::new(handler);
    let (n, buf) = h.run_client(|rt, boot| {
        let s = rt.connect_me_to(boot, 0, 0, 0).unwrap();
        let mut buf = [0u8; 64];
        let n = rt.data_read_start(s, &mut buf).unwrap();
        rt.hangup(s).unwrap();
        (n, buf)
    });
    assert_eq!(&buf[..n], b"sensor data");
}

#[test]
fn data_write_accept_enforces_limits() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    let handler: ConnectionHandler = Arc::new(move |rt: &Runtime, cid: CallId, _call: &Call| {
        let _ = rt.answer(cid, Ok(()), [0; 5]);

        let limits = AcceptLimits {
            min_size: 1,
            max_size: Some(8),
            null_terminated: true,
            ..Default::default()
        };
        match rt.data_write_accept(&limits) {
            Ok(data) => received2.lock().unwrap().extend_from_slice(&data),
            Err(e) => panic!("first write refused: {e}"),
        }

        // The second transfer exceeds the limit and must be refused.
        let limits = AcceptLimits { max_size: Some(2), ..Default::default() };
        assert_eq!(rt.data_write_accept(&limits).unwrap_err(), IpcError::InvalidArgs);

        loop {
            let (_cid, call) = rt.get_call();
            if call.method == method::PHONE_HUNGUP {
                return;
            }
        }
    });

    let h = Harness::new(handler);
    let (first, second) = h.run_client(|rt, boot| {
        let s = rt.connect_me_to(boot, 0, 0, 0).unwrap();
        let first = rt.data_write_start(s, b"hello");
        let second = rt.data_write_start(s, b"toolong");
        rt.hangup(s).unwrap();
        (first, second)
    });

    assert!(first.is_ok());
    assert_eq!(second.unwrap_err(), IpcError::InvalidArgs);
    assert_eq!(*received.lock().unwrap(), b"hello\0");
}

#[test]
fn data_write_void_refuses_the_transfer() {
    let handler: ConnectionHandler = Arc::new(|rt: &Runtime, cid: CallId, _call: &Call| {
        let _ = rt.answer(cid, Ok(()), [0; 5]);
        rt.data_write_void(Err(IpcError::NotFound));
        loop {
            let (_cid, call) = rt.get_call();
            if call.method == method::PHONE_HUNGUP {
                return;
            }
        }
    });

    let h = Harness::new(handler);
    let res = h.run_client(|rt, boot| {
        let s = rt.connect_me_to_blocking(boot, 0, 0, 0).unwrap();
        let res = rt.data_write_start(s, b"unwanted");
        rt.hangup(s).unwrap();
        res
    });
    assert_eq!(res.unwrap_err(), IpcError::NotFound);
}

#[test]
fn sharing_handshakes_pass_areas_both_ways() {
    let handler: ConnectionHandler = Arc::new(|rt: &Runtime, cid: CallId, _call: &Call| {
        let _ = rt.answer(cid, Ok(()), [0; 5]);

        let (cid, size) = rt.share_in_receive().expect("share-in expected");
        let area = SharedArea::new(size);
        area.with_bytes_mut(|v| v[..4].copy_from_slice(b"boot"));
        rt.share_in_finalize(cid, area, ShareFlags::READ).unwrap();

        let (cid, _size, _flags) = rt.share_out_receive().expect("share-out expected");
        let area = rt.share_out_finalize(cid).unwrap();
        area.with_bytes_mut(|v| v[0] = 0xEE);

        loop {
            let (_cid, call) = rt.get_call();
            if call.method == method::PHONE_HUNGUP {
                return;
            }
        }
    });

    let h = Harness::new(handler);
    let (seen, flags, stamped) = h.run_client(|rt, boot| {
        let s = rt.connect_me_to(boot, 0, 0, 0).unwrap();

        let (area, flags) = rt.share_in_start(s, 16, 0).unwrap();
        let seen = area.with_bytes(|v| v[..4].to_vec());

        let out = SharedArea::new(4);
        rt.share_out_start(s, &out, ShareFlags::READ | ShareFlags::WRITE).unwrap();

        // The hangup ack orders the server's stamp before our read.
        rt.hangup(s).unwrap();
        let stamped = out.with_bytes(|v| v[0]);
        (seen, flags, stamped)
    });

    assert_eq!(seen, b"boot");
    assert!(flags.contains(ShareFlags::READ));
    assert_eq!(stamped, 0xEE);
}

#[test]
fn data_write_forward_relays_to_backend() {
    const RELAY_DONE: u64 = ECHO + 9;

    let kernel = Loopback::new();
    let front_port = Arc::new(kernel.port("front"));
    let back_port = Arc::new(kernel.port("back"));
    let client_port = Arc::new(kernel.port("client"));
    let boot_front = kernel.connect(&client_port, &front_port);
    let boot_back = kernel.connect(&front_port, &back_port);

    let stored = Arc::new(Mutex::new(Vec::new()));

    let back = Runtime::new(back_port);
    let stored2 = stored.clone();
    back.set_client_connection(Arc::new(move |rt: &Runtime, cid: CallId, _call: &Call| {
        let _ = rt.answer(cid, Ok(()), [0; 5]);
        loop {
            let (cid, call) = rt.get_call();
            match call.method {
                method::PHONE_HUNGUP => return,
                method::DATA_WRITE => {
                    let data = rt.data_write_finalize(cid, call.args[1] as usize).unwrap();
                    stored2.lock().unwrap().extend_from_slice(&data);
                }
                RELAY_DONE => {
                    let _ = rt.answer(cid, Ok(()), [0; 5]);
                }
                _ => {
                    let _ = rt.answer(cid, Err(IpcError::InvalidArgs), [0; 5]);
                }
            }
        }
    }));
    back.create_manager();

    let front = Runtime::new(front_port);
    front.set_client_connection(Arc::new(move |rt: &Runtime, cid: CallId, _call: &Call| {
        let _ = rt.answer(cid, Ok(()), [0; 5]);
        let back_session = rt.connect_me_to(boot_back, 0, 0, 0).unwrap();

        // First call of the protocol is the write; relay it.
        let relayed = rt.data_write_forward(back_session, RELAY_DONE, 0, 0, 0, 0);
        assert!(relayed.is_ok(), "relay failed: {relayed:?}");
        let _ = rt.hangup(back_session);

        loop {
            let (_cid, call) = rt.get_call();
            if call.method == method::PHONE_HUNGUP {
                return;
            }
        }
    }));
    front.create_manager();

    let client = Runtime::new(client_port);
    client.create_manager();

    let (tx, rx) = mpsc::channel();
    client
        .spawn("client", move |rt| {
            let s = rt.connect_me_to(boot_front, 0, 0, 0).unwrap();
            let res = rt.data_write_start(s, b"relayed");
            let _ = rt.hangup(s);
            let _ = tx.send(res);
        })
        .unwrap();

    let res = rx.recv_timeout(Duration::from_secs(10)).expect("client stalled");
    assert!(res.is_ok());
    assert_eq!(*stored.lock().unwrap(), b"relayed");

    client.destroy_manager();
    front.destroy_manager();
    back.destroy_manager();
    kernel.shutdown();
}

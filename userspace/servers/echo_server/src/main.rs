//! Echo server demonstration: two async runtimes (a server and a client
//! task) talking over the loopback kernel.
//!
//! The server answers `ECHO` requests with their own arguments, accepts
//! `DATA_WRITE` buffers and returns on hangup. The client opens a
//! connection, round-trips a word, pushes a message and hangs up.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use ipc_types::{Call, CallId, IpcError, IpcResult, PhoneId, method};
use libasync::Runtime;
use loopback_kernel::Loopback;

/// Application method: reply with the request arguments.
const ECHO: u64 = method::FIRST_USER;

fn serve_connection(rt: &Runtime, open_cid: CallId, _open_call: &Call) {
    if rt.answer(open_cid, Ok(()), [0; 5]).is_err() {
        return;
    }

    loop {
        let (cid, call) = rt.get_call();
        match call.method {
            method::PHONE_HUNGUP => return,
            ECHO => {
                log::info!("echo: {:?}", call.args);
                let _ = rt.answer(cid, Ok(()), call.args);
            }
            method::DATA_WRITE => {
                // The call is already consumed, so finalize directly.
                match rt.data_write_finalize(cid, call.args[1] as usize) {
                    Ok(data) => log::info!("received {} bytes", data.len()),
                    Err(e) => log::warn!("data write failed: {e}"),
                }
            }
            other => {
                log::warn!("unknown method {other}");
                let _ = rt.answer(cid, Err(IpcError::InvalidArgs), [0; 5]);
            }
        }
    }
}

fn run_client(rt: &Runtime, bootstrap: PhoneId) -> IpcResult {
    let session = rt.connect_me_to(bootstrap, 0, 0, 0)?;

    let reply = rt.request_fast(session, ECHO, 42, 7, 0, 0)?;
    println!("echo replied: {:?}", &reply.args[..2]);

    rt.data_write_start(session, b"hello over ipc")?;
    println!("data write accepted");

    rt.hangup(session)?;
    println!("session closed");
    Ok(())
}

fn main() {
    env_logger::init();

    let kernel = Loopback::new();
    let server_port = Arc::new(kernel.port("echo_server"));
    let client_port = Arc::new(kernel.port("client"));
    // Hand the client its bootstrap phone the way init would.
    let bootstrap = kernel.connect(&client_port, &server_port);

    let server = Runtime::new(server_port);
    server.set_client_connection(Arc::new(serve_connection));
    server.create_manager();

    let client = Runtime::new(client_port);
    client.create_manager();

    let (tx, rx) = mpsc::channel();
    client
        .spawn("client-main", move |rt| {
            let _ = tx.send(run_client(rt, bootstrap));
        })
        .expect("cannot start client fibril");

    match rx.recv_timeout(Duration::from_secs(10)) {
        Ok(Ok(())) => println!("demo finished"),
        Ok(Err(e)) => eprintln!("demo failed: {e}"),
        Err(_) => eprintln!("demo timed out"),
    }

    client.destroy_manager();
    server.destroy_manager();
    kernel.shutdown();
}

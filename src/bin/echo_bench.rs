use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use nix::sys::socket::{AddressFamily, SockProtocol, SockType};

const NR_CONNS: u32 = 500;
const NUM_MSGS: u32 = 200;

static NUM_RUNS: AtomicU64 = AtomicU64::new(0);

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

fn weft_echo() {
    let params = weft::SchedulerParams {
        sq_entries: 4 * 1024,
        cq_entries: 64 * 1024,
        stack_size: 32 * 1024,
    };

    let mut sched = weft::Scheduler::with_params(&params);

    sched.new_task(|task| {
        let ex = task.owner();

        let server = task
            .socket(AddressFamily::Inet, SockType::Stream, SockProtocol::Tcp)
            .unwrap();
        task.bind(server, localhost(0)).unwrap();
        task.listen(server, 1024).unwrap();

        let port = ex.local_port(server).unwrap();

        for _ in 0..NR_CONNS {
            ex.new_task(move |task| {
                let client = task
                    .socket(AddressFamily::Inet, SockType::Stream, SockProtocol::Tcp)
                    .unwrap();
                task.connect(client, localhost(port)).unwrap();

                let mut buf = [0_u8; 1024];
                for _ in 0..NUM_MSGS {
                    task.send(client, b"hello, world!").unwrap();

                    let n = task.recv(client, &mut buf).unwrap();
                    assert_eq!(&buf[..n], b"hello, world!");
                }

                task.closesocket(client).unwrap();
                NUM_RUNS.fetch_add(1, Ordering::Relaxed);
            });
        }

        for _ in 0..NR_CONNS {
            let conn = task.accept(server).unwrap();

            ex.new_task(move |task| {
                let mut buf = [0_u8; 1024];
                loop {
                    match task.recv(conn, &mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => task.send(conn, &buf[..n]).unwrap(),
                    }
                }
                task.closesocket(conn).unwrap();
                NUM_RUNS.fetch_add(1, Ordering::Relaxed);
            });
        }

        task.closesocket(server).unwrap();
    });

    while !sched.peek() {}
}

fn main() {
    let prev = Instant::now();

    weft_echo();

    let dur = Instant::now().duration_since(prev);
    assert_eq!(NUM_RUNS.load(Ordering::Relaxed), u64::from(2 * NR_CONNS));
    println!("duration: {dur:?}");
}

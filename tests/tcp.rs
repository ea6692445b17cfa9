use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::Rc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{AddressFamily, SockProtocol, SockType};

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

fn tcp_socket(task: &mut weft::Task) -> std::os::fd::RawFd {
    task.socket(AddressFamily::Inet, SockType::Stream, SockProtocol::Tcp)
        .unwrap()
}

//-----------------------------------------------------------------------------

#[test]
fn tcp_echo() {
    let mut sched = weft::Scheduler::new();

    let done = Rc::new(RefCell::new(0_u32));

    {
        let done2 = done.clone();
        sched.new_task(move |task| {
            let ex = task.owner();

            let server = tcp_socket(task);
            task.bind(server, localhost(0)).unwrap();
            task.listen(server, 100).unwrap();

            let port = ex.local_port(server).unwrap();

            {
                let done3 = done2.clone();
                ex.new_task(move |task| {
                    let client = tcp_socket(task);
                    task.connect(client, localhost(port)).unwrap();
                    task.send(client, b"lll").unwrap();

                    let mut buf = [0_u8; 256];
                    let mut received = 0;
                    while received < 3 {
                        let n = task.recv(client, &mut buf[received..]).unwrap();
                        assert!(n > 0);
                        received += n;
                    }

                    assert_eq!(&buf[..3], b"lll");
                    task.closesocket(client).unwrap();
                    *done3.borrow_mut() += 1;
                });
            }

            let conn = task.accept(server).unwrap();

            {
                let done3 = done2.clone();
                ex.new_task(move |task| {
                    let mut buf = [0_u8; 256];
                    loop {
                        match task.recv(conn, &mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => task.send(conn, &buf[..n]).unwrap(),
                        }
                    }
                    task.closesocket(conn).unwrap();
                    *done3.borrow_mut() += 1;
                });
            }

            task.closesocket(server).unwrap();
            *done2.borrow_mut() += 1;
        });
    }

    while !sched.peek() {}
    assert_eq!(*done.borrow(), 3);
    assert!(sched.peek());
}

//-----------------------------------------------------------------------------

#[test]
fn tcp_connect_closed_port() {
    let mut sched = weft::Scheduler::new();

    let done = Rc::new(RefCell::new(false));

    {
        let done2 = done.clone();
        sched.new_task(move |task| {
            let client = tcp_socket(task);

            let m_ok = task.connect(client, localhost(1));
            assert!(m_ok.is_err());

            task.closesocket(client).unwrap();
            assert_eq!(task.closesocket(client), Err(Errno::EBADF));

            *done2.borrow_mut() = true;
        });
    }

    while !sched.peek() {}
    assert!(*done.borrow());
}

//-----------------------------------------------------------------------------

#[test]
fn tcp_recv_exclusion() {
    // Only one task may be suspended in recv on a socket; a second attempt
    // fails immediately instead of queueing.
    let mut sched = weft::Scheduler::new();

    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let log2 = log.clone();
        sched.new_task(move |task| {
            let ex = task.owner();

            let server = tcp_socket(task);
            task.bind(server, localhost(0)).unwrap();
            task.listen(server, 10).unwrap();

            let port = ex.local_port(server).unwrap();

            ex.new_task(move |task| {
                let client = tcp_socket(task);
                task.connect(client, localhost(port)).unwrap();
                task.sleep(Duration::from_millis(100)).unwrap();
                task.send(client, b"x").unwrap();
                task.closesocket(client).unwrap();
            });

            let conn = task.accept(server).unwrap();

            {
                let log3 = log2.clone();
                ex.new_task(move |task| {
                    let mut buf = [0_u8; 16];
                    assert_eq!(task.recv(conn, &mut buf), Ok(1));
                    log3.borrow_mut().push("first recv");

                    assert_eq!(task.recv(conn, &mut buf), Ok(0));
                    task.closesocket(conn).unwrap();
                });
            }

            // let the reader arm its recv first
            task.sleep(Duration::from_millis(50)).unwrap();

            let mut buf = [0_u8; 16];
            assert_eq!(task.recv(conn, &mut buf), Err(Errno::EBUSY));
            log2.borrow_mut().push("second recv rejected");

            task.closesocket(server).unwrap();
        });
    }

    while !sched.peek() {}
    assert_eq!(*log.borrow(), vec!["second recv rejected", "first recv"]);
}

//-----------------------------------------------------------------------------

#[test]
fn tcp_close_parked_acceptor() {
    // Closing a listener wakes the task parked inside accept.
    let mut sched = weft::Scheduler::new();

    let done = Rc::new(RefCell::new(false));

    {
        let done2 = done.clone();
        sched.new_task(move |task| {
            let ex = task.owner();

            let server = tcp_socket(task);
            task.bind(server, localhost(0)).unwrap();
            task.listen(server, 10).unwrap();

            ex.new_task(move |task| {
                task.sleep(Duration::from_millis(50)).unwrap();
                task.closesocket(server).unwrap();
            });

            let m_conn = task.accept(server);
            assert!(m_conn.is_err());

            *done2.borrow_mut() = true;
        });
    }

    while !sched.peek() {}
    assert!(*done.borrow());
}

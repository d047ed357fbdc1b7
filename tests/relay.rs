use evnet::{Client, ConnId, Decode, EventLoop, Handler, Server};
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

const CHUNKS: [&[u8]; 4] = [b"alpha-", b"bravo-bravo-", b"charlie\n", b"\x00\xffdelta"];

/// Forwards everything it reads to `peer`, recording what passed through.
struct Bridge {
    peer: Option<ConnId>,
    seen: Rc<RefCell<Vec<u8>>>,
    closed: Rc<Cell<usize>>,
    stop_on_close: bool,
}

impl Handler for Bridge {
    fn on_message(&mut self, lp: &mut EventLoop, _: ConnId, data: &[u8]) -> Decode {
        self.seen.borrow_mut().extend_from_slice(data);
        match self.peer {
            Some(peer) if lp.write(peer, data).is_err() => Decode::Error,
            _ => Decode::Consumed(data.len()),
        }
    }

    fn on_close(&mut self, lp: &mut EventLoop, _: ConnId) {
        self.closed.set(self.closed.get() + 1);
        if let Some(peer) = self.peer.take() {
            lp.set_close(peer);
        }
        if self.stop_on_close {
            lp.stop();
        }
    }
}

fn echo_upstream() -> (u16, thread::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind upstream");
    let port = listener.local_addr().expect("local addr").port();

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut echoed = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    echoed.extend_from_slice(&buf[..n]);
                    if stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
        echoed
    });

    (port, handle)
}

#[test]
fn relay_preserves_order_across_interleaved_chunks() {
    let mut lp = EventLoop::new(64).expect("event loop");
    let timed_out = Rc::new(Cell::new(false));
    let flag = timed_out.clone();
    lp.add_timer(Duration::from_secs(5), Duration::ZERO, move |lp, _| {
        flag.set(true);
        lp.stop();
    });

    let (upstream_port, upstream) = echo_upstream();

    let downstream_seen = Rc::new(RefCell::new(Vec::new()));
    let upstream_seen = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(Cell::new(0));

    let (down, up, cl) = (
        downstream_seen.clone(),
        upstream_seen.clone(),
        closed.clone(),
    );
    let server = Server::bind(&mut lp, "127.0.0.1", 0, move |lp, conn| {
        let upstream = Client::new("127.0.0.1", upstream_port)
            .connect(
                lp,
                Bridge {
                    peer: Some(conn),
                    seen: up.clone(),
                    closed: cl.clone(),
                    stop_on_close: true,
                },
            )
            .expect("connect upstream");

        Box::new(Bridge {
            peer: Some(upstream),
            seen: down.clone(),
            closed: cl.clone(),
            stop_on_close: false,
        })
    })
    .expect("bind relay");
    let addr = server.local_addr();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).expect("connect relay");
        let mut replies = Vec::new();
        for chunk in CHUNKS {
            stream.write_all(chunk).expect("write");
            let mut reply = vec![0u8; chunk.len()];
            stream.read_exact(&mut reply).expect("read");
            replies.push(reply);
        }
        replies
    });

    lp.run().expect("run");
    let replies = client.join().unwrap();
    let echoed = upstream.join().unwrap();

    let expected: Vec<u8> = CHUNKS.concat();
    assert!(!timed_out.get());
    assert_eq!(replies, CHUNKS.map(<[u8]>::to_vec));
    assert_eq!(*downstream_seen.borrow(), expected);
    assert_eq!(*upstream_seen.borrow(), expected);
    assert_eq!(echoed, expected);
    assert_eq!(closed.get(), 2);
}

use evnet::{Client, ConnId, ConnState, Decode, Error, EventLoop, Handler, Server};
use std::cell::{Cell, RefCell};
use std::io;
use std::net::TcpListener;
use std::rc::Rc;
use std::time::Duration;

fn watchdog(lp: &mut EventLoop) -> Rc<Cell<bool>> {
    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();
    lp.add_timer(Duration::from_secs(5), Duration::ZERO, move |lp, _| {
        flag.set(true);
        lp.stop();
    });
    fired
}

type Events = Rc<RefCell<Vec<String>>>;

/// Records every callback in order.
struct Recorder {
    events: Events,
    request: Option<&'static str>,
}

impl Handler for Recorder {
    fn on_connect(&mut self, lp: &mut EventLoop, conn: ConnId) {
        let failed = lp.has_error(conn);
        self.events.borrow_mut().push(format!("connect error={failed}"));
        if let (Some(request), false) = (self.request, failed) {
            lp.write(conn, request).expect("write");
        }
    }

    fn on_message(&mut self, lp: &mut EventLoop, conn: ConnId, data: &[u8]) -> Decode {
        if !data.contains(&b'}') {
            return Decode::Again;
        }
        self.events.borrow_mut().push("message".to_string());
        lp.set_close(conn);
        Decode::Consumed(data.len())
    }

    fn on_error(&mut self, _: &mut EventLoop, _: ConnId, error: &Error) {
        assert_eq!(error.io_kind(), Some(io::ErrorKind::ConnectionRefused));
        self.events.borrow_mut().push("error".to_string());
    }

    fn on_done(&mut self, _: &mut EventLoop, _: ConnId) {
        self.events.borrow_mut().push("done".to_string());
    }

    fn on_close(&mut self, lp: &mut EventLoop, _: ConnId) {
        self.events.borrow_mut().push("close".to_string());
        lp.stop();
    }
}

/// Answers every `\n`-terminated request with `{}\n`.
struct Json {
    requests: Rc<Cell<usize>>,
}

impl Handler for Json {
    fn on_message(&mut self, lp: &mut EventLoop, conn: ConnId, data: &[u8]) -> Decode {
        let Some(end) = data.iter().position(|&b| b == b'\n') else {
            return Decode::Again;
        };
        self.requests.set(self.requests.get() + 1);
        lp.write(conn, "{}\n").expect("write");
        Decode::Consumed(end + 1)
    }
}

fn json_server(lp: &mut EventLoop) -> (u16, Rc<Cell<usize>>, Rc<Cell<usize>>) {
    let accepted = Rc::new(Cell::new(0));
    let requests = Rc::new(Cell::new(0));
    let (a, r) = (accepted.clone(), requests.clone());
    let server = Server::bind(lp, "127.0.0.1", 0, move |_, _| {
        a.set(a.get() + 1);
        Box::new(Json {
            requests: r.clone(),
        })
    })
    .expect("bind");

    (server.local_addr().port(), accepted, requests)
}

#[test]
fn refused_connect_reports_through_callbacks() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("local addr").port()
    };

    let mut lp = EventLoop::new(16).expect("event loop");
    let timed_out = watchdog(&mut lp);

    let events = Events::default();
    let conn = Client::new("127.0.0.1", port)
        .connect(
            &mut lp,
            Recorder {
                events: events.clone(),
                request: Some("never sent\n"),
            },
        )
        .expect("connect");

    // Nothing is reported from inside connect().
    assert!(events.borrow().is_empty());

    lp.run().expect("run");

    assert!(!timed_out.get());
    assert_eq!(
        *events.borrow(),
        ["connect error=true", "error", "done", "close"]
    );
    assert_eq!(lp.state(conn), None);
}

#[test]
fn unresolvable_host_fails_construction() {
    let mut lp = EventLoop::new(16).expect("event loop");
    let events = Events::default();

    let result = Client::new("no-such-host.invalid", 80).connect(
        &mut lp,
        Recorder {
            events: events.clone(),
            request: None,
        },
    );

    assert!(matches!(result, Err(Error::Resolve { port: 80, .. })));
    assert!(events.borrow().is_empty());
}

#[test]
fn single_exchange_client_gets_done_at_teardown() {
    let mut lp = EventLoop::new(16).expect("event loop");
    let timed_out = watchdog(&mut lp);
    let (port, accepted, requests) = json_server(&mut lp);

    let events = Events::default();
    Client::new("127.0.0.1", port)
        .connect(
            &mut lp,
            Recorder {
                events: events.clone(),
                request: Some("GET /foo\n"),
            },
        )
        .expect("connect");

    lp.run().expect("run");

    assert!(!timed_out.get());
    assert_eq!(
        *events.borrow(),
        ["connect error=false", "message", "done", "close"]
    );
    assert_eq!(accepted.get(), 1);
    assert_eq!(requests.get(), 1);
}

#[test]
fn writes_queued_while_connecting_are_sent_on_connect() {
    let mut lp = EventLoop::new(16).expect("event loop");
    let timed_out = watchdog(&mut lp);
    let (port, _, _) = json_server(&mut lp);

    let events = Events::default();
    let conn = Client::new("127.0.0.1", port)
        .connect(
            &mut lp,
            Recorder {
                events: events.clone(),
                request: None,
            },
        )
        .expect("connect");

    assert_eq!(lp.state(conn), Some(ConnState::Connecting));
    lp.write(conn, "early\n").expect("write");
    assert_eq!(lp.pending_bytes(conn), 6);

    lp.run().expect("run");

    assert!(!timed_out.get());
    assert_eq!(
        *events.borrow(),
        ["connect error=false", "message", "done", "close"]
    );
}

struct KeepAlive {
    exchanges: Rc<Cell<usize>>,
    closes: Rc<Cell<usize>>,
    limit: usize,
}

impl Handler for KeepAlive {
    fn on_connect(&mut self, lp: &mut EventLoop, conn: ConnId) {
        assert!(!lp.has_error(conn));
        assert!(lp.is_keep_alive(conn));
        assert_eq!(lp.client_peer(conn).map(|(host, _)| host), Some("127.0.0.1"));
        lp.write(conn, "GET /1\n").expect("write");
    }

    fn on_message(&mut self, _: &mut EventLoop, _: ConnId, data: &[u8]) -> Decode {
        match data.iter().position(|&b| b == b'}') {
            Some(end) => Decode::Consumed(end + 2),
            None => Decode::Again,
        }
    }

    fn on_done(&mut self, lp: &mut EventLoop, conn: ConnId) {
        let done = self.exchanges.get() + 1;
        self.exchanges.set(done);

        if done < self.limit {
            lp.write(conn, format!("GET /{}\n", done + 1)).expect("write");
        } else {
            lp.close(conn);
        }
    }

    fn on_close(&mut self, lp: &mut EventLoop, _: ConnId) {
        self.closes.set(self.closes.get() + 1);
        lp.stop();
    }
}

#[test]
fn keep_alive_client_reuses_one_connection() {
    let mut lp = EventLoop::new(16).expect("event loop");
    let timed_out = watchdog(&mut lp);
    let (port, accepted, requests) = json_server(&mut lp);

    let exchanges = Rc::new(Cell::new(0));
    let closes = Rc::new(Cell::new(0));
    Client::new("127.0.0.1", port)
        .keep_alive(true)
        .connect(
            &mut lp,
            KeepAlive {
                exchanges: exchanges.clone(),
                closes: closes.clone(),
                limit: 3,
            },
        )
        .expect("connect");

    lp.run().expect("run");

    assert!(!timed_out.get());
    assert_eq!(exchanges.get(), 3);
    assert_eq!(closes.get(), 1);
    assert_eq!(accepted.get(), 1);
    assert_eq!(requests.get(), 3);
}

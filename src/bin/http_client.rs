use anyhow::{Result, bail};
use clap::Parser;
use evnet::{Client, ConnId, Decode, Error, EventLoop, Handler};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;
use tracing::{Level, info, warn};

const CONCURRENT_CONNS: usize = 10;
const REQUEST: &[u8] = b"GET /foo HTTP/1.1\r\n\r\n";

#[derive(Parser, Debug)]
#[command(author, version, about = "Minimal HTTP/1.1 load driver", long_about = None)]
struct Args {
    host: String,
    port: u16,

    /// Stop after this many responses
    max_req: usize,

    /// Reuse one keep-alive connection for every request
    #[arg(short = 'k', long)]
    keep_alive: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug)]
struct Stats {
    host: String,
    port: u16,
    keep_alive: bool,
    conns: usize,
    peak: usize,
    requests: usize,
    responses: usize,
    max: usize,
    started: Instant,
}

type Shared = Rc<RefCell<Stats>>;

struct Session {
    stats: Shared,
    counted: bool,
}

impl Session {
    /// Gives this session's slot back to the connection cap.
    fn release(&mut self) {
        if std::mem::take(&mut self.counted) {
            self.stats.borrow_mut().conns -= 1;
        }
    }

    fn send_request(&self, lp: &mut EventLoop, conn: ConnId) {
        let mut stats = self.stats.borrow_mut();
        if stats.requests >= stats.max {
            return;
        }
        stats.requests += 1;
        drop(stats);

        if !lp.has_error(conn) {
            let _ = lp.write(conn, REQUEST);
        }
    }
}

/// Opens another client unless the request budget or the connection cap is
/// exhausted.
fn launch(lp: &mut EventLoop, stats: &Shared) {
    let (host, port, keep_alive) = {
        let s = stats.borrow();
        if s.requests >= s.max || s.conns >= CONCURRENT_CONNS {
            return;
        }
        (s.host.clone(), s.port, s.keep_alive)
    };

    let session = Session {
        stats: stats.clone(),
        counted: true,
    };
    match Client::new(host, port).keep_alive(keep_alive).connect(lp, session) {
        Ok(_) => {
            let mut s = stats.borrow_mut();
            s.conns += 1;
            s.peak = s.peak.max(s.conns);
        }
        Err(error) => warn!(%error, "cannot open client"),
    }
}

impl Handler for Session {
    fn on_connect(&mut self, lp: &mut EventLoop, conn: ConnId) {
        self.send_request(lp, conn);
    }

    fn on_message(&mut self, lp: &mut EventLoop, conn: ConnId, data: &[u8]) -> Decode {
        info!(conn = %conn, size = data.len(), "recv response");

        if !data.contains(&b'}') {
            return Decode::Again;
        }

        let reached = {
            let mut stats = self.stats.borrow_mut();
            stats.responses += 1;
            stats.responses >= stats.max
        };

        if reached {
            lp.stop();
        } else if !lp.is_keep_alive(conn) {
            // Hand the slot to a successor; on_done opens one more, so the
            // client count ramps up toward the cap.
            lp.set_close(conn);
            self.release();
            launch(lp, &self.stats);
        }

        Decode::Consumed(data.len())
    }

    fn on_error(&mut self, _: &mut EventLoop, conn: ConnId, error: &Error) {
        warn!(conn = %conn, %error, "request failed");
    }

    fn on_done(&mut self, lp: &mut EventLoop, conn: ConnId) {
        if lp.is_keep_alive(conn) && lp.is_open(conn) {
            self.send_request(lp, conn);
            return;
        }

        self.release();
        if !lp.is_stopping() {
            launch(lp, &self.stats);
        }
    }

    fn on_close(&mut self, lp: &mut EventLoop, _: ConnId) {
        self.release();
        if self.stats.borrow().conns == 0 && !lp.is_stopping() {
            info!("no client left");
            lp.stop();
        }
    }
}

fn shared_stats(host: String, port: u16, keep_alive: bool, max: usize) -> Shared {
    Rc::new(RefCell::new(Stats {
        host,
        port,
        keep_alive,
        conns: 0,
        peak: 0,
        requests: 0,
        responses: 0,
        max,
        started: Instant::now(),
    }))
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.max_req == 0 {
        bail!("max_req must be positive");
    }

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let stats = shared_stats(args.host, args.port, args.keep_alive, args.max_req);

    let mut lp = EventLoop::new(1024)?;

    launch(&mut lp, &stats);
    if stats.borrow().conns == 0 {
        bail!("no client could be opened");
    }

    let summary = stats.clone();
    lp.set_stop_callback(move |_| {
        let stats = summary.borrow();
        info!("========== benchmark statistics ==========");
        info!("req_cnt: {}", stats.requests);
        info!("res_cnt: {}", stats.responses);
        info!("peak conns: {}", stats.peak);
        info!("time elapsed: {:.3?}", stats.started.elapsed());
    });

    lp.run()?;

    Ok(())
}

use anyhow::Result;
use clap::Parser;
use evnet::{Client, ConnId, Decode, Error, EventLoop, Handler, Server};
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{Level, debug, info, warn};

const DEFAULT_PORT: u16 = 1080;
const GRANTED: u8 = 0x5a;
const REJECTED: u8 = 0x5b;

#[derive(Parser, Debug)]
#[command(author, version, about = "SOCKS4 CONNECT proxy", long_about = None)]
struct Args {
    /// Port to listen on (all interfaces)
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, PartialEq, Eq)]
enum Request {
    Incomplete,
    Invalid,
    Connect { target: SocketAddrV4, len: usize },
}

/// `VN(1) CD(1) DSTPORT(2) DSTIP(4) USERID NUL`
fn parse_request(data: &[u8]) -> Request {
    if data.len() >= 2 && (data[0] != 4 || data[1] != 1) {
        return Request::Invalid;
    }
    if data.len() < 9 {
        return Request::Incomplete;
    }
    let Some(nul) = data[8..].iter().position(|&b| b == 0) else {
        return Request::Incomplete;
    };

    let port = u16::from_be_bytes([data[2], data[3]]);
    let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);

    Request::Connect {
        target: SocketAddrV4::new(ip, port),
        len: 8 + nul + 1,
    }
}

fn reply(code: u8, target: SocketAddrV4) -> Vec<u8> {
    let mut reply = vec![0, code];
    reply.extend_from_slice(&target.port().to_be_bytes());
    reply.extend_from_slice(&target.ip().octets());
    reply
}

/// Queues `data` on `peer`. A peer that is already gone is detached and the
/// bytes are dropped; the sending side then closes once its own output drains.
fn relay(lp: &mut EventLoop, conn: ConnId, peer: &mut Option<ConnId>, data: &[u8]) -> Decode {
    if let Some(target) = *peer {
        if lp.write(target, data).is_err() {
            debug!(conn = %conn, peer = %target, "peer detached");
            *peer = None;
            lp.set_close(conn);
        }
    }

    Decode::Consumed(data.len())
}

/// The SOCKS client side: parses the request, then relays to the upstream.
struct Downstream {
    upstream: Option<ConnId>,
}

impl Handler for Downstream {
    fn on_message(&mut self, lp: &mut EventLoop, conn: ConnId, data: &[u8]) -> Decode {
        if self.upstream.is_some() {
            debug!(conn = %conn, len = data.len(), "client -> upstream");
            return relay(lp, conn, &mut self.upstream, data);
        }

        let (target, len) = match parse_request(data) {
            Request::Incomplete => return Decode::Again,
            Request::Invalid => {
                warn!(conn = %conn, ver = data[0], cmd = data[1], "unknown socks4 request");
                return Decode::Error;
            }
            Request::Connect { target, len } => (target, len),
        };

        info!(conn = %conn, %target, "connect");
        let upstream = Client::new(target.ip().to_string(), target.port())
            .connect(
                lp,
                Upstream {
                    downstream: Some(conn),
                    target,
                },
            );

        match upstream {
            Ok(upstream) => self.upstream = Some(upstream),
            Err(error) => {
                warn!(conn = %conn, %target, %error, "upstream unavailable");
                let _ = lp.write(conn, reply(REJECTED, target));
                lp.set_close(conn);
            }
        }

        Decode::Consumed(len)
    }

    fn on_close(&mut self, lp: &mut EventLoop, conn: ConnId) {
        debug!(conn = %conn, "client side closed");
        if let Some(upstream) = self.upstream.take() {
            lp.set_close(upstream);
        }
    }
}

struct Upstream {
    downstream: Option<ConnId>,
    target: SocketAddrV4,
}

impl Handler for Upstream {
    fn on_connect(&mut self, lp: &mut EventLoop, conn: ConnId) {
        let Some(downstream) = self.downstream else {
            return;
        };

        if lp.has_error(conn) {
            let _ = lp.write(downstream, reply(REJECTED, self.target));
            lp.set_close(downstream);
            return;
        }

        debug!(conn = %conn, target = %self.target, "granted");
        let _ = lp.write(downstream, reply(GRANTED, self.target));
    }

    fn on_message(&mut self, lp: &mut EventLoop, conn: ConnId, data: &[u8]) -> Decode {
        debug!(conn = %conn, len = data.len(), "upstream -> client");
        relay(lp, conn, &mut self.downstream, data)
    }

    fn on_error(&mut self, _: &mut EventLoop, conn: ConnId, error: &Error) {
        warn!(conn = %conn, target = %self.target, %error, "upstream error");
    }

    fn on_close(&mut self, lp: &mut EventLoop, conn: ConnId) {
        debug!(conn = %conn, "server side closed");
        if let Some(downstream) = self.downstream.take() {
            lp.set_close(downstream);
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut lp = EventLoop::new(1024)?;
    let server = Server::bind(&mut lp, "0.0.0.0", args.port, |_, _| {
        Box::new(Downstream { upstream: None })
    })?;

    info!("socks4 proxy on {}", server.local_addr());
    lp.run()?;

    Ok(())
}

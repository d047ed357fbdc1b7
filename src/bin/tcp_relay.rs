use anyhow::{Result, anyhow};
use clap::Parser;
use evnet::{Client, ConnId, Decode, Error, EventLoop, Handler, Server};
use std::net::SocketAddr;
use tracing::{Level, debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Forwards every accepted connection to an upstream", long_about = None)]
struct Args {
    /// Listener address
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    listen: String,

    /// Upstream host
    upstream_host: String,

    /// Upstream port
    upstream_port: u16,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// One direction of a relayed pair. Bytes arriving on this connection are
/// queued verbatim on `peer`.
struct Bridge {
    side: &'static str,
    peer: Option<ConnId>,
}

impl Bridge {
    /// Queues `data` on the peer. Once the peer is gone the bridge detaches
    /// and drops whatever is still arriving.
    fn forward(&mut self, lp: &mut EventLoop, conn: ConnId, data: &[u8]) -> Decode {
        let Some(peer) = self.peer else {
            return Decode::Consumed(data.len());
        };

        debug!(conn = %conn, side = self.side, len = data.len(), "forward");
        if lp.write(peer, data).is_err() {
            debug!(conn = %conn, side = self.side, peer = %peer, "peer detached");
            self.peer = None;
            lp.set_close(conn);
        }

        Decode::Consumed(data.len())
    }
}

impl Handler for Bridge {
    fn on_message(&mut self, lp: &mut EventLoop, conn: ConnId, data: &[u8]) -> Decode {
        self.forward(lp, conn, data)
    }

    fn on_error(&mut self, _: &mut EventLoop, conn: ConnId, error: &Error) {
        warn!(conn = %conn, side = self.side, %error, "relay error");
    }

    fn on_close(&mut self, lp: &mut EventLoop, conn: ConnId) {
        debug!(conn = %conn, side = self.side, "closed");
        if let Some(peer) = self.peer.take() {
            lp.set_close(peer);
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

    let listen: SocketAddr = args
        .listen
        .parse()
        .map_err(|_| anyhow!("invalid listen address: {}", args.listen))?;

    let mut lp = EventLoop::new(1024)?;
    let upstream_host = args.upstream_host.clone();
    let upstream_port = args.upstream_port;

    let server = Server::bind(
        &mut lp,
        &listen.ip().to_string(),
        listen.port(),
        move |lp, conn| {
            let upstream = Client::new(upstream_host.clone(), upstream_port).connect(
                lp,
                Bridge {
                    side: "upstream",
                    peer: Some(conn),
                },
            );

            match upstream {
                Ok(upstream) => Box::new(Bridge {
                    side: "downstream",
                    peer: Some(upstream),
                }),
                Err(error) => {
                    warn!(conn = %conn, %error, "upstream unavailable");
                    lp.close(conn);
                    Box::new(Bridge {
                        side: "downstream",
                        peer: None,
                    })
                }
            }
        },
    )?;

    info!(
        "relaying {} -> {}:{}",
        server.local_addr(),
        args.upstream_host,
        args.upstream_port
    );
    lp.run()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn write_to_a_gone_peer_detaches() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut lp = EventLoop::new(16).unwrap();
        let gone = Client::new("127.0.0.1", port)
            .connect(&mut lp, Bridge { side: "upstream", peer: None })
            .unwrap();
        lp.close(gone);
        assert!(lp.state(gone).is_none());

        let mut bridge = Bridge {
            side: "downstream",
            peer: Some(gone),
        };
        assert_eq!(bridge.forward(&mut lp, gone, b"late"), Decode::Consumed(4));
        assert_eq!(bridge.peer, None);
        assert_eq!(bridge.forward(&mut lp, gone, b"later"), Decode::Consumed(5));
    }
}

use anyhow::Result;
use clap::Parser;
use evnet::{ConnId, Decode, EventLoop, Handler, Server};
use std::fmt::Write;
use tracing::{Level, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Answers every line with a greeting", long_about = None)]
struct Args {
    /// Address to bind
    host: String,

    /// Port to bind
    port: u16,

    /// Log lifecycle events (-v) or every read and write (-vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct Hello;

impl Handler for Hello {
    fn on_message(&mut self, lp: &mut EventLoop, conn: ConnId, data: &[u8]) -> Decode {
        let Some(end) = data.iter().position(|&b| b == b'\n') else {
            return Decode::Again;
        };

        let line = String::from_utf8_lossy(&data[..end]);
        let line = line.trim_end_matches('\r');

        let mut reply = evnet::Buffer::new();
        let _ = writeln!(reply, "== hello {line} ==");

        if lp.write(conn, reply).is_err() {
            return Decode::Error;
        }

        Decode::Consumed(end + 1)
    }

    fn on_close(&mut self, _: &mut EventLoop, conn: ConnId) {
        info!(conn = %conn, "client gone");
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut lp = EventLoop::new(1024)?;
    let server = Server::bind(&mut lp, &args.host, args.port, |lp, conn| {
        info!(conn = %conn, peer = ?lp.peer_addr(conn), "client connected");
        Box::new(Hello)
    })?;

    info!("hello server on {}", server.local_addr());
    lp.run()?;

    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

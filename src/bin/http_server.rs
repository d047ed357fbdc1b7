use anyhow::Result;
use clap::Parser;
use evnet::{Buffer, ConnId, Decode, EventLoop, Handler, Server};
use std::fmt::Write;
use tracing::{Level, debug, info, warn};

const SERVER_NAME: &str = concat!("evnet/", env!("CARGO_PKG_VERSION"));
// Larger headers are rejected instead of buffered without bound.
const MAX_HEAD: usize = 8 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "Minimal HTTP/1.1 server with a fixed route table", long_about = None)]
struct Args {
    /// Address to bind
    host: String,

    /// Port to bind
    port: u16,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, PartialEq, Eq)]
struct Request {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn wants_close(&self) -> bool {
        self.header("Connection")
            .is_some_and(|value| value.eq_ignore_ascii_case("close"))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Parse {
    Incomplete,
    Invalid,
    /// A request whose head and body span `len` bytes.
    Complete { request: Request, len: usize },
}

fn parse_request(data: &[u8]) -> Parse {
    let Some(head_end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
        return if data.len() > MAX_HEAD {
            Parse::Invalid
        } else {
            Parse::Incomplete
        };
    };

    let Ok(head) = std::str::from_utf8(&data[..head_end]) else {
        return Parse::Invalid;
    };
    let mut lines = head.split("\r\n");

    let mut request_line = lines.next().unwrap_or_default().split(' ');
    let (Some(method), Some(path), Some(version)) =
        (request_line.next(), request_line.next(), request_line.next())
    else {
        return Parse::Invalid;
    };
    if !version.starts_with("HTTP/1.") {
        return Parse::Invalid;
    }

    let mut headers = Vec::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Parse::Invalid;
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let request = Request {
        method: method.to_string(),
        path: path.to_string(),
        headers,
    };

    let body = match request.header("Content-Length").map(str::parse::<usize>) {
        None => 0,
        Some(Ok(len)) => len,
        Some(Err(_)) => return Parse::Invalid,
    };
    let len = head_end + 4 + body;
    if data.len() < len {
        return Parse::Incomplete;
    }

    Parse::Complete { request, len }
}

struct Response {
    status: u16,
    reason: &'static str,
    headers: Vec<(&'static str, String)>,
    body: String,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            reason: "OK",
            headers: Vec::new(),
            body: String::new(),
        }
    }
}

impl Response {
    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn render(&self, close: bool) -> Buffer {
        let mut out = Buffer::with_capacity(128 + self.body.len());
        let _ = write!(out, "HTTP/1.1 {} {}\r\n", self.status, self.reason);
        if !self.headers.iter().any(|(name, _)| *name == "Server") {
            let _ = write!(out, "Server: {SERVER_NAME}\r\n");
        }
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        if close {
            let _ = write!(out, "Connection: close\r\n");
        }
        let _ = write!(out, "Content-Length: {}\r\n\r\n", self.body.len());
        out.append(self.body.as_bytes());
        out
    }
}

type Route = fn(&Request) -> Response;

const ROUTES: &[(&str, Route)] = &[
    ("/foo", foo as Route),
    ("/bar", bar as Route),
    ("/def", def as Route),
];

fn json_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            c if c.is_control() => {
                let _ = write!(escaped, "\\u{:04x}", c as u32);
            }
            c => escaped.push(c),
        }
    }
    escaped
}

/// Echoes the request headers as a JSON object.
fn foo(request: &Request) -> Response {
    let fields: Vec<String> = request
        .headers
        .iter()
        .map(|(name, value)| format!("\"{}\": \"{}\"", json_escape(name), json_escape(value)))
        .collect();

    Response {
        body: format!("{{{}}}", fields.join(",")),
        ..Response::default()
    }
    .header("Server", "evnet-foo")
    .header("Content-Type", "application/json")
}

fn bar(_: &Request) -> Response {
    Response {
        body: r#"{"bar": "foo"}"#.to_string(),
        ..Response::default()
    }
    .header("Server", "bar/0.0.1")
    .header("Content-Type", "application/json")
}

fn def(_: &Request) -> Response {
    Response {
        body: r#"{"bar": "foo"}"#.to_string(),
        ..Response::default()
    }
    .header("Content-Type", "application/json")
}

fn dispatch(request: &Request) -> Response {
    let path = request.path.split('?').next().unwrap_or_default();
    match ROUTES.iter().find(|(route, _)| *route == path) {
        Some((_, handler)) => handler(request),
        None => Response {
            status: 404,
            reason: "Not Found",
            body: r#"{"error": "not found"}"#.to_string(),
            ..Response::default()
        }
        .header("Content-Type", "application/json"),
    }
}

struct Http;

impl Handler for Http {
    fn on_message(&mut self, lp: &mut EventLoop, conn: ConnId, data: &[u8]) -> Decode {
        let (request, len) = match parse_request(data) {
            Parse::Incomplete => return Decode::Again,
            Parse::Invalid => {
                warn!(conn = %conn, "malformed request");
                let response = Response {
                    status: 400,
                    reason: "Bad Request",
                    ..Response::default()
                };
                let _ = lp.write(conn, response.render(true));
                lp.set_close(conn);
                return Decode::Consumed(data.len());
            }
            Parse::Complete { request, len } => (request, len),
        };

        let response = dispatch(&request);
        debug!(
            conn = %conn,
            method = %request.method,
            path = %request.path,
            status = response.status,
            "request"
        );

        let close = request.wants_close();
        if lp.write(conn, response.render(close)).is_err() {
            return Decode::Error;
        }
        if close {
            lp.set_close(conn);
        }

        Decode::Consumed(len)
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
    let server = Server::bind(&mut lp, &args.host, args.port, |_, _| Box::new(Http))?;

    info!("http server on {}", server.local_addr());
    lp.run()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write as _};
    use std::net::TcpStream;
    use std::thread;
    use std::time::{Duration, Instant};

    fn complete(data: &[u8]) -> (Request, usize) {
        match parse_request(data) {
            Parse::Complete { request, len } => (request, len),
            other => panic!("expected a complete request, got {other:?}"),
        }
    }

    #[test]
    fn head_without_blank_line_is_incomplete() {
        assert_eq!(parse_request(b"GET /foo HTTP/1.1\r\nHost: a"), Parse::Incomplete);
        assert_eq!(parse_request(&[b'a'; MAX_HEAD + 1]), Parse::Invalid);
        assert_eq!(parse_request(b"GET\r\n\r\n"), Parse::Invalid);
    }

    #[test]
    fn body_is_part_of_the_request() {
        let data = b"POST /bar HTTP/1.1\r\nContent-Length: 3\r\n\r\nab";
        assert_eq!(parse_request(data), Parse::Incomplete);

        let data = b"POST /bar HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET";
        let (request, len) = complete(data);
        assert_eq!(request.method, "POST");
        assert_eq!(len, data.len() - 3);
    }

    #[test]
    fn foo_echoes_headers_as_json() {
        let (request, _) = complete(b"GET /foo HTTP/1.1\r\nHost: x\r\nX-Quote: a\"b\r\n\r\n");
        let response = dispatch(&request);

        assert_eq!(response.status, 200);
        assert_eq!(response.body, r#"{"Host": "x","X-Quote": "a\"b"}"#);
    }

    #[test]
    fn unknown_route_is_not_found() {
        let (request, _) = complete(b"GET /nope HTTP/1.1\r\n\r\n");
        assert_eq!(dispatch(&request).status, 404);

        let (request, _) = complete(b"GET /def?x=1 HTTP/1.1\r\n\r\n");
        assert_eq!(dispatch(&request).status, 200);
    }

    #[test]
    fn rendered_response_carries_content_length() {
        let (request, _) = complete(b"GET /def HTTP/1.1\r\n\r\n");
        let rendered = dispatch(&request).render(false);
        let text = String::from_utf8(rendered.as_slice().to_vec()).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains(&format!("Server: {SERVER_NAME}\r\n")));
        assert!(text.ends_with("Content-Length: 14\r\n\r\n{\"bar\": \"foo\"}"));
    }

    #[test]
    fn pipelined_requests_get_answers_in_order() {
        let mut lp = EventLoop::new(64).unwrap();
        let server = Server::bind(&mut lp, "127.0.0.1", 0, |_, _| Box::new(Http)).unwrap();
        let addr = server.local_addr();

        let peer = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .write_all(b"GET /bar HTTP/1.1\r\n\r\nGET /nope HTTP/1.1\r\nConnection: close\r\n\r\n")
                .unwrap();
            let mut received = String::new();
            stream.read_to_string(&mut received).unwrap();
            received
        });

        // The server closes after the second answer; stop once it is gone.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut accepted = false;
        while Instant::now() < deadline {
            lp.turn(Some(Duration::from_millis(10))).unwrap();
            accepted |= lp.entry_count() == 2;
            if accepted && lp.entry_count() == 1 {
                break;
            }
        }
        let received = peer.join().unwrap();

        let first = received.find("200 OK").unwrap();
        let second = received.find("404 Not Found").unwrap();
        assert!(first < second);
        assert!(received.ends_with(r#"{"error": "not found"}"#));
    }
}

//! Connect-URL parsing: `socket://host:port`, `http://host[:port]/path`, `btspp://<addr>:<channel>`.

use std::net::Ipv4Addr;

use crate::event::ConnError;

const SOCKET: &str = "socket://";
const HTTP: &str = "http://";
const BTSPP: &str = "btspp://";

/// Default port for `http://` URLs without an explicit port.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Highest RFCOMM server channel.
pub const MAX_RFCOMM_CHANNEL: u8 = 30;

/// Bluetooth device address, most significant byte first as written in the URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BtAddr(pub [u8; 6]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketUrl {
    pub host: String,
    pub port: u16,
}

impl SocketUrl {
    /// Loopback address if the host names this machine (`localhost` or a `127.x.y.z` literal).
    pub fn loopback(&self) -> Option<Ipv4Addr> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Some(Ipv4Addr::LOCALHOST);
        }
        if self.host.len() > 4 && self.host.starts_with("127.") {
            return self.host.parse().ok();
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpUrl {
    pub host: String,
    pub port: u16,
    /// Always starts with `/`.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectUrl {
    Socket(SocketUrl),
    Http(HttpUrl),
    Btspp { addr: BtAddr, channel: u8 },
}

/// Parse any supported connect URL. Unknown schemes and malformed URLs are `Url` errors.
pub fn parse(url: &str) -> Result<ConnectUrl, ConnError> {
    if let Some(rest) = strip_scheme(url, SOCKET) {
        let (host, port) = split_host_port(rest)?;
        return Ok(ConnectUrl::Socket(SocketUrl {
            host: host.to_string(),
            port,
        }));
    }
    if strip_scheme(url, HTTP).is_some() {
        return parse_http(url).map(ConnectUrl::Http);
    }
    if let Some(rest) = strip_scheme(url, BTSPP) {
        let (addr, channel) = rest.split_once(':').ok_or(ConnError::Url)?;
        let channel: u8 = channel.parse().map_err(|_| ConnError::Url)?;
        if channel == 0 || channel > MAX_RFCOMM_CHANNEL {
            return Err(ConnError::Url);
        }
        return Ok(ConnectUrl::Btspp {
            addr: parse_bt_addr(addr)?,
            channel,
        });
    }
    Err(ConnError::Url)
}

/// True if `url` names the `btspp://` scheme, whether or not the rest parses.
pub fn is_btspp(url: &str) -> bool {
    strip_scheme(url, BTSPP).is_some()
}

/// Parse an `http://` URL. A path is required; the port defaults to 80.
pub fn parse_http(url: &str) -> Result<HttpUrl, ConnError> {
    let rest = strip_scheme(url, HTTP).ok_or(ConnError::Url)?;
    let path_index = rest.find('/').ok_or(ConnError::Url)?;
    let (authority, path) = rest.split_at(path_index);
    let (host, port) = match authority.split_once(':') {
        Some((host, port)) => (host, parse_port(port)?),
        None => (authority, DEFAULT_HTTP_PORT),
    };
    check_host(host)?;
    Ok(HttpUrl {
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

fn strip_scheme<'a>(url: &'a str, scheme: &str) -> Option<&'a str> {
    let head = url.get(..scheme.len())?;
    if head.eq_ignore_ascii_case(scheme) {
        Some(&url[scheme.len()..])
    } else {
        None
    }
}

fn split_host_port(s: &str) -> Result<(&str, u16), ConnError> {
    let (host, port) = s.split_once(':').ok_or(ConnError::Url)?;
    check_host(host)?;
    Ok((host, parse_port(port)?))
}

fn parse_port(s: &str) -> Result<u16, ConnError> {
    match s.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(ConnError::Url),
    }
}

fn check_host(host: &str) -> Result<(), ConnError> {
    let valid = !host.is_empty()
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'));
    if valid {
        Ok(())
    } else {
        Err(ConnError::Url)
    }
}

fn parse_bt_addr(s: &str) -> Result<BtAddr, ConnError> {
    if s.len() != 12 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ConnError::Url);
    }
    let mut out = [0u8; 6];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| ConnError::Url)?;
    }
    Ok(BtAddr(out))
}

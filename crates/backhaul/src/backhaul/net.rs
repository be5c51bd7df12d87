use std::{borrow::Cow, io, net::IpAddr, time::Duration};

use anyhow::Context;
use tokio::net::TcpStream;

/// Port used for targets given without one.
pub const DEFAULT_TARGET_PORT: u16 = 80;

/// Normalize a bind/listen address.
///
/// The shorthand `":PORT"` means "bind on all interfaces". Rust's `SocketAddr`
/// parsing and Tokio bind APIs do not accept `":PORT"`, so we normalize it to
/// `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Splits `host:port`, accepting bracketed IPv6 literals. The port is optional.
pub fn split_host_port(addr: &str) -> anyhow::Result<(&str, Option<u16>)> {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .with_context(|| format!("address {addr:?}: missing ']'"))?;
        return match tail.strip_prefix(':') {
            Some(p) => Ok((host, Some(parse_port(addr, p)?))),
            None if tail.is_empty() => Ok((host, None)),
            None => anyhow::bail!("address {addr:?}: unexpected {tail:?} after ']'"),
        };
    }

    // A bare IPv6 literal has several colons and no port.
    if addr.parse::<IpAddr>().is_ok() {
        return Ok((addr, None));
    }
    match addr.rsplit_once(':') {
        Some((host, p)) => Ok((host, Some(parse_port(addr, p)?))),
        None => Ok((addr, None)),
    }
}

fn parse_port(addr: &str, p: &str) -> anyhow::Result<u16> {
    p.parse::<u16>()
        .with_context(|| format!("address {addr:?}: invalid port {p:?}"))
}

/// Host part of a bind address; `":PORT"` yields `0.0.0.0`.
pub fn host_of(bind: &str) -> anyhow::Result<String> {
    let bind = normalize_bind_addr(bind);
    let (host, _) = split_host_port(&bind)?;
    Ok(host.to_string())
}

/// Joins host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Resolves a user supplied target to a dialable `ip:port`.
///
/// IP literals pass through; hostnames are looked up and the first address wins.
/// Without a port, [`DEFAULT_TARGET_PORT`] is used.
pub async fn resolve_target(target: &str) -> anyhow::Result<String> {
    let (host, port) = split_host_port(target)?;
    let port = port.unwrap_or(DEFAULT_TARGET_PORT);
    if host.is_empty() {
        anyhow::bail!("target {target:?}: empty host");
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(join_host_port(&ip.to_string(), port));
    }

    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("resolve {host:?}"))?;
    let first = addrs
        .next()
        .with_context(|| format!("resolve {host:?}: no addresses"))?;
    Ok(first.to_string())
}

/// `TcpStream::connect` bounded by `timeout`.
pub async fn dial(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("dial {addr}: timed out after {}", humantime::format_duration(timeout)),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn split_and_join_handle_ipv6() {
        assert_eq!(split_host_port("[::1]:9201").unwrap(), ("::1", Some(9201)));
        assert_eq!(split_host_port("::1").unwrap(), ("::1", None));
        assert_eq!(split_host_port("example.org").unwrap(), ("example.org", None));
        assert!(split_host_port("example.org:http").is_err());
        assert_eq!(join_host_port("::1", 0), "[::1]:0");
        assert_eq!(join_host_port("127.0.0.1", 18080), "127.0.0.1:18080");
    }

    #[test]
    fn host_of_bind_addresses() {
        assert_eq!(host_of("127.0.0.1:9201").unwrap(), "127.0.0.1");
        assert_eq!(host_of(":9201").unwrap(), "0.0.0.0");
        assert_eq!(host_of("[::]:9201").unwrap(), "::");
    }

    #[tokio::test]
    async fn resolve_ip_literals_pass_through() {
        assert_eq!(resolve_target("10.1.2.3:9000").await.unwrap(), "10.1.2.3:9000");
        assert_eq!(resolve_target("10.1.2.3").await.unwrap(), "10.1.2.3:80");
        assert_eq!(resolve_target("[::1]:22").await.unwrap(), "[::1]:22");
    }

    #[tokio::test]
    async fn resolve_localhost_keeps_port() {
        let got = resolve_target("localhost:9000").await.unwrap();
        assert!(got.ends_with(":9000"), "{got}");
    }
}

use std::{
    net::{IpAddr, SocketAddr},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use anyhow::Context;
use hickory_resolver::{
    config::{NameServerConfigGroup, ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use regex::RegexSet;
use tokio::net::{TcpStream, UdpSocket};

use crate::skein::relay::frame::CloseReason;

/// Stream-fatal dial failures. Each maps to a CLOSE reason reported to the
/// client; the session itself always survives a failed dial.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("destination blocked by policy")]
    Blocked,
    #[error("dial timed out")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("dns resolution failed: {0}")]
    Dns(String),
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

impl DialError {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            DialError::Blocked => CloseReason::Blocked,
            DialError::Timeout => CloseReason::DialTimeout,
            DialError::Refused => CloseReason::Refused,
            DialError::Dns(_) => CloseReason::DnsFailure,
            DialError::Io(_) => CloseReason::NetworkError,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DialError::Blocked => "blocked",
            DialError::Timeout => "timeout",
            DialError::Refused => "refused",
            DialError::Dns(_) => "dns",
            DialError::Io(_) => "io",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DialerOptions {
    /// Regex patterns matched against the lowercased destination hostname.
    pub hostname_blacklist: Vec<String>,
    /// Pinned resolvers (UDP/TCP port 53). Empty means the system resolver.
    pub dns_servers: Vec<IpAddr>,
    pub allow_udp: bool,
    pub dial_timeout: Duration,
}

/// Opens outbound destination connections. Built once at startup from the
/// immutable process configuration and shared by all sessions.
pub struct Dialer {
    blacklist: RegexSet,
    resolver: TokioAsyncResolver,
    allow_udp: bool,
    dial_timeout: Duration,
    // Counts attempts that reached network I/O. Blocked destinations are
    // rejected before this is touched.
    attempts: AtomicU64,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("allow_udp", &self.allow_udp)
            .field("dial_timeout", &self.dial_timeout)
            .finish_non_exhaustive()
    }
}

impl Dialer {
    pub fn new(opts: DialerOptions) -> anyhow::Result<Self> {
        let blacklist =
            RegexSet::new(&opts.hostname_blacklist).context("dialer: compile hostname_blacklist")?;

        let resolver = if opts.dns_servers.is_empty() {
            TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|err| {
                tracing::warn!(err = %err, "dialer: system resolver unavailable, using defaults");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            })
        } else {
            let group = NameServerConfigGroup::from_ips_clear(&opts.dns_servers, 53, true);
            TokioAsyncResolver::tokio(
                ResolverConfig::from_parts(None, vec![], group),
                ResolverOpts::default(),
            )
        };

        Ok(Self {
            blacklist,
            resolver,
            allow_udp: opts.allow_udp,
            dial_timeout: opts.dial_timeout,
            attempts: AtomicU64::new(0),
        })
    }

    pub fn allow_udp(&self) -> bool {
        self.allow_udp
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        self.blacklist.is_match(&host.trim().to_ascii_lowercase())
    }

    /// Number of dials that reached the network.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, DialError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|err| DialError::Dns(err.to_string()))?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return Err(DialError::Dns(format!("no addresses for {host}")));
        }
        Ok(addrs)
    }

    pub async fn dial_tcp(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        if self.is_blocked(host) {
            return Err(DialError::Blocked);
        }
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let deadline = tokio::time::Instant::now() + self.dial_timeout;
        let addrs = tokio::time::timeout_at(deadline, self.resolve(host))
            .await
            .map_err(|_| DialError::Timeout)??;

        let mut last: Option<DialError> = None;
        for ip in addrs {
            let addr = SocketAddr::new(ip, port);
            match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(err)) => last = Some(map_io(err)),
                Err(_) => return Err(DialError::Timeout),
            }
        }
        Err(last.unwrap_or(DialError::Timeout))
    }

    /// Opens a connected UDP socket. Datagram boundaries map 1:1 onto DATA
    /// frames; no fragmentation or reassembly is performed.
    pub async fn dial_udp(&self, host: &str, port: u16) -> Result<UdpSocket, DialError> {
        if self.is_blocked(host) {
            return Err(DialError::Blocked);
        }
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let deadline = tokio::time::Instant::now() + self.dial_timeout;
        let addrs = tokio::time::timeout_at(deadline, self.resolve(host))
            .await
            .map_err(|_| DialError::Timeout)??;
        let addr = SocketAddr::new(addrs[0], port);

        let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;
        Ok(socket)
    }
}

fn map_io(err: std::io::Error) -> DialError {
    match err.kind() {
        std::io::ErrorKind::ConnectionRefused => DialError::Refused,
        std::io::ErrorKind::TimedOut => DialError::Timeout,
        _ => DialError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialer_with(blacklist: Vec<String>) -> Dialer {
        Dialer::new(DialerOptions {
            hostname_blacklist: blacklist,
            dns_servers: vec![],
            allow_udp: false,
            dial_timeout: Duration::from_millis(500),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn blocked_host_never_reaches_the_network() {
        let d = dialer_with(vec!["^ads\\.".into(), "tracker".into()]);

        assert!(d.is_blocked("ads.example.com"));
        assert!(d.is_blocked("ADS.EXAMPLE.COM"));
        assert!(d.is_blocked("api.tracker.net"));
        assert!(!d.is_blocked("example.com"));

        let err = d.dial_tcp("ads.example.com", 80).await.unwrap_err();
        assert!(matches!(err, DialError::Blocked));
        assert_eq!(d.attempts(), 0);
    }

    #[tokio::test]
    async fn ip_literals_skip_resolution() {
        let d = dialer_with(vec![]);
        let addrs = d.resolve("127.0.0.1").await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn refused_port_maps_to_refused() {
        // Bind then drop to find a port with nothing listening.
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        drop(ln);

        let d = dialer_with(vec![]);
        let err = d.dial_tcp("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, DialError::Refused | DialError::Timeout));
        assert_eq!(d.attempts(), 1);
    }

    #[test]
    fn invalid_blacklist_pattern_fails_startup() {
        let res = Dialer::new(DialerOptions {
            hostname_blacklist: vec!["(unclosed".into()],
            dns_servers: vec![],
            allow_udp: false,
            dial_timeout: Duration::from_secs(1),
        });
        assert!(res.is_err());
    }
}

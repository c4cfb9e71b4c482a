//! Destination checks applied before every outbound request.
//!
//! A URL is accepted only when its scheme is http(s) and every address its
//! host resolves to is publicly routable. The resolved addresses are returned
//! so the caller can pin the connection to exactly what was checked.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use url::{Host, Url};

use crate::error::{CoreError, CoreResult};

pub trait Resolve: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        Ok((host, port).to_socket_addrs()?.map(|addr| addr.ip()).collect())
    }
}

/// Fixed host table, for hosts-file style overrides and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, addrs: &[IpAddr]) -> Self {
        self.hosts
            .insert(host.to_ascii_lowercase(), addrs.to_vec());
        self
    }
}

impl Resolve for StaticResolver {
    fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
        self.hosts
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown host {host}")))
    }
}

/// A URL that passed validation together with the addresses it was checked against.
#[derive(Debug, Clone)]
pub struct ValidatedUrl {
    pub url: Url,
    /// Domain name to pin, `None` for IP-literal hosts.
    pub domain: Option<String>,
    pub addrs: Vec<SocketAddr>,
}

#[derive(Clone)]
pub struct UrlValidator {
    resolver: Arc<dyn Resolve>,
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self::new(Arc::new(SystemResolver))
    }
}

impl UrlValidator {
    pub fn new(resolver: Arc<dyn Resolve>) -> Self {
        Self { resolver }
    }

    pub fn validate(&self, raw: &str) -> CoreResult<ValidatedUrl> {
        let url = Url::parse(raw.trim())
            .map_err(|err| CoreError::UnsafeUrl(format!("malformed url {raw}: {err}")))?;
        self.validate_url(&url)
    }

    pub fn validate_url(&self, url: &Url) -> CoreResult<ValidatedUrl> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(CoreError::UnsafeUrl(format!(
                    "scheme {other} is not allowed"
                )))
            }
        }
        let port = url
            .port_or_known_default()
            .ok_or_else(|| CoreError::UnsafeUrl(format!("no port for {url}")))?;

        let (domain, ips) = match url.host() {
            Some(Host::Ipv4(ip)) => (None, vec![IpAddr::V4(ip)]),
            Some(Host::Ipv6(ip)) => (None, vec![IpAddr::V6(ip)]),
            Some(Host::Domain(name)) => {
                let ips = self.resolver.resolve(name, port).map_err(|err| {
                    CoreError::UnsafeUrl(format!("cannot resolve {name}: {err}"))
                })?;
                (Some(name.to_string()), ips)
            }
            None => return Err(CoreError::UnsafeUrl(format!("missing host in {url}"))),
        };

        if ips.is_empty() {
            return Err(CoreError::UnsafeUrl(format!(
                "{} resolved to no addresses",
                url.host_str().unwrap_or_default()
            )));
        }
        if let Some(ip) = ips.iter().find(|ip| !is_public_ip(**ip)) {
            return Err(CoreError::UnsafeUrl(format!(
                "{} resolves to non-public address {ip}",
                url.host_str().unwrap_or_default()
            )));
        }

        Ok(ValidatedUrl {
            url: url.clone(),
            domain,
            addrs: ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect(),
        })
    }
}

pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => is_public_v6(v6),
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    let special = ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.is_documentation()
        // 0.0.0.0/8 "this network" and 240.0.0.0/4 reserved
        || a == 0
        || a >= 240
        // 100.64.0.0/10 shared address space
        || (a == 100 && (b & 0xc0) == 64)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b & 0xfe) == 18)
        // 192.0.0.0/24 protocol assignments
        || (a == 192 && b == 0 && c == 0);
    !special
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    if ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() {
        return false;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_public_v4(v4);
    }
    let seg = ip.segments();
    let embedded_tail = || Ipv4Addr::from(((seg[6] as u32) << 16) | seg[7] as u32);
    match seg[0] {
        // ::a.b.c.d (deprecated IPv4-compatible)
        0 if seg[1..6].iter().all(|s| *s == 0) => is_public_v4(embedded_tail()),
        // 64:ff9b::/96 NAT64
        0x64 if seg[1] == 0xff9b && seg[2..6].iter().all(|s| *s == 0) => {
            is_public_v4(embedded_tail())
        }
        // 100::/64 discard-only
        0x100 if seg[1..4].iter().all(|s| *s == 0) => false,
        // 2001::/23 protocol assignments, 2001:db8::/32 documentation
        0x2001 if seg[1] < 0x200 || seg[1] == 0xdb8 => false,
        // 2002::/16 6to4
        0x2002 => is_public_v4(Ipv4Addr::from(((seg[1] as u32) << 16) | seg[2] as u32)),
        // fc00::/7 unique local
        s if s & 0xfe00 == 0xfc00 => false,
        // fe80::/10 link-local, fec0::/10 site-local
        s if s & 0xffc0 == 0xfe80 || s & 0xffc0 == 0xfec0 => false,
        _ => true,
    }
}

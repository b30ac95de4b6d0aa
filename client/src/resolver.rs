//! Address resolution used while connecting.

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, UdpSocket};

/// Public IP echo service queried by [`SystemResolver`]
pub const DEFAULT_ECHO_URL: &str = "https://api.ipify.org";

#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Address of the interface used for outbound traffic.
    fn local_address(&self) -> io::Result<IpAddr>;

    /// Address the outside world sees this host as.
    async fn public_address(&self) -> io::Result<IpAddr>;
}

/// Resolves addresses from the host's routing table and a public echo
/// service.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    http: reqwest::Client,
    echo_url: String,
}

impl SystemResolver {
    pub fn new() -> Self {
        Self::with_echo_url(DEFAULT_ECHO_URL)
    }

    pub fn with_echo_url(echo_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            echo_url: echo_url.into(),
        }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AddressResolver for SystemResolver {
    fn local_address(&self) -> io::Result<IpAddr> {
        // Connecting a UDP socket sends nothing; it only picks a route.
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    }

    async fn public_address(&self) -> io::Result<IpAddr> {
        let body = self
            .http
            .get(&self.echo_url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(io::Error::other)?
            .text()
            .await
            .map_err(io::Error::other)?;

        body.trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Always answers with fixed addresses.
#[derive(Debug, Clone, Copy)]
pub struct StaticResolver {
    local: IpAddr,
    public: IpAddr,
}

impl StaticResolver {
    pub fn new(local: IpAddr, public: IpAddr) -> Self {
        Self { local, public }
    }

    pub fn loopback() -> Self {
        let loopback = IpAddr::from([127, 0, 0, 1]);
        Self::new(loopback, loopback)
    }
}

#[async_trait]
impl AddressResolver for StaticResolver {
    fn local_address(&self) -> io::Result<IpAddr> {
        Ok(self.local)
    }

    async fn public_address(&self) -> io::Result<IpAddr> {
        Ok(self.public)
    }
}

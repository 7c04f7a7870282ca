use crate::{Error, Result};
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

#[derive(Debug, Clone, clap::Parser)]
#[command(author, version, about = "Relay tun interface TCP traffic through a local SOCKS5 proxy.", long_about = None)]
pub struct Args {
    /// Name of the tun interface, such as tun0, utun4, etc.
    /// If this option is not provided, the OS will generate a random one.
    #[arg(short, long, value_name = "name", value_parser = validate_tun)]
    #[cfg_attr(unix, arg(conflicts_with = "tun_fd"))]
    pub tun: Option<String>,

    /// File descriptor of an already configured tun interface
    #[cfg(unix)]
    #[arg(long, value_name = "fd", conflicts_with = "tun")]
    pub tun_fd: Option<i32>,

    /// Set whether to close the received raw file descriptor on drop or not.
    /// This setting is dependent on [tun_fd].
    #[cfg(unix)]
    #[arg(long, value_name = "true or false", conflicts_with = "tun", requires = "tun_fd")]
    pub close_fd_on_drop: Option<bool>,

    /// Address assigned to the tun interface
    #[arg(long, value_name = "IP", default_value = "10.0.0.2")]
    pub tun_address: Ipv4Addr,

    /// Netmask of the tun interface
    #[arg(long, value_name = "IP", default_value = "255.255.255.0")]
    pub tun_netmask: Ipv4Addr,

    /// MTU of the tun interface
    #[arg(long, value_name = "bytes", default_value = "1500")]
    pub mtu: u16,

    /// Listen address of the embedded SOCKS5 server, also the endpoint flows are relayed through
    #[arg(short, long, value_name = "IP:PORT", default_value = "127.0.0.1:1080")]
    pub socks_listen: SocketAddr,

    /// Physical interface outbound proxy connections are bound to, avoiding routing loops
    #[arg(short, long, value_name = "name")]
    pub outbound_interface: Option<String>,

    /// Timeout in seconds for the SOCKS5 server connecting to a target
    #[arg(long, value_name = "seconds", default_value = "15")]
    pub connect_timeout: u64,

    /// Timeout in seconds for a flow to reach the proxy and finish the SOCKS5 handshake
    #[arg(long, value_name = "seconds", default_value = "10")]
    pub handshake_timeout: u64,

    /// Sessions older than this many seconds are swept
    #[arg(long, value_name = "seconds", default_value = "300")]
    pub session_timeout: u64,

    /// Interval in seconds between session sweeps
    #[arg(long, value_name = "seconds", default_value = "60")]
    pub cleanup_interval: u64,

    /// Interval in seconds between status dumps in the log, 0 disables them
    #[arg(long, value_name = "seconds", default_value = "0")]
    pub status_interval: u64,

    /// Verbosity level
    #[arg(short, long, value_name = "level", value_enum, default_value = "info")]
    pub verbosity: ArgVerbosity,

    /// Daemonize (unix only)
    #[arg(long)]
    pub daemonize: bool,
}

fn validate_tun(p: &str) -> Result<String> {
    #[cfg(target_os = "macos")]
    if p.len() <= 4 || &p[..4] != "utun" {
        return Err(Error::from("Invalid tun interface name, please use utunX"));
    }
    if p.is_empty() {
        return Err(Error::from("Empty tun interface name"));
    }
    Ok(p.to_string())
}

impl Default for Args {
    fn default() -> Self {
        Args {
            tun: None,
            #[cfg(unix)]
            tun_fd: None,
            #[cfg(unix)]
            close_fd_on_drop: None,
            tun_address: Ipv4Addr::new(10, 0, 0, 2),
            tun_netmask: Ipv4Addr::new(255, 255, 255, 0),
            mtu: crate::packet_processor::DEFAULT_MTU,
            socks_listen: crate::socks5_server::DEFAULT_LISTEN_ADDR,
            outbound_interface: None,
            connect_timeout: 15,
            handshake_timeout: 10,
            session_timeout: 300,
            cleanup_interval: 60,
            status_interval: 0,
            verbosity: ArgVerbosity::Info,
            daemonize: false,
        }
    }
}

impl Args {
    pub fn parse_args() -> Self {
        use clap::Parser;
        Self::parse()
    }

    #[cfg(unix)]
    pub fn tun_fd(&mut self, tun_fd: Option<i32>) -> &mut Self {
        self.tun_fd = tun_fd;
        self
    }

    #[cfg(unix)]
    pub fn close_fd_on_drop(&mut self, close_fd_on_drop: bool) -> &mut Self {
        self.close_fd_on_drop = Some(close_fd_on_drop);
        self
    }

    pub fn tun(&mut self, tun: String) -> &mut Self {
        self.tun = Some(tun);
        self
    }

    pub fn mtu(&mut self, mtu: u16) -> &mut Self {
        self.mtu = mtu;
        self
    }

    pub fn socks_listen(&mut self, addr: SocketAddr) -> &mut Self {
        self.socks_listen = addr;
        self
    }

    pub fn outbound_interface(&mut self, name: &str) -> &mut Self {
        self.outbound_interface = Some(name.to_string());
        self
    }

    pub fn handshake_timeout(&mut self, secs: u64) -> &mut Self {
        self.handshake_timeout = secs;
        self
    }

    pub fn session_timeout(&mut self, secs: u64) -> &mut Self {
        self.session_timeout = secs;
        self
    }

    pub fn verbosity(&mut self, verbosity: ArgVerbosity) -> &mut Self {
        self.verbosity = verbosity;
        self
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn handshake_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    pub fn session_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.session_timeout)
    }

    /// Never zero, so it can drive a `tokio::time::interval`.
    pub fn cleanup_interval_duration(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval.max(1))
    }

    pub fn status_interval_duration(&self) -> Option<Duration> {
        (self.status_interval > 0).then(|| Duration::from_secs(self.status_interval))
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum ArgVerbosity {
    Off = 0,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<ArgVerbosity> for log::LevelFilter {
    fn from(verbosity: ArgVerbosity) -> Self {
        match verbosity {
            ArgVerbosity::Off => log::LevelFilter::Off,
            ArgVerbosity::Error => log::LevelFilter::Error,
            ArgVerbosity::Warn => log::LevelFilter::Warn,
            ArgVerbosity::Info => log::LevelFilter::Info,
            ArgVerbosity::Debug => log::LevelFilter::Debug,
            ArgVerbosity::Trace => log::LevelFilter::Trace,
        }
    }
}

impl std::fmt::Display for ArgVerbosity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let level: log::LevelFilter = (*self).into();
        write!(f, "{}", level.as_str().to_ascii_lowercase())
    }
}

//! Probes used by reclamation to decide whether a lease is still backed by a
//! live process that is actually listening on its ports.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Answers the two questions reclamation asks about a lease.
///
/// Probing is expected to fail often; a failure is an answer, not an error.
pub trait LivenessProbe {
    fn is_process_alive(&self, pid: u32) -> bool;

    fn is_port_active(&self, port: u16) -> bool;
}

/// Probes the local operating system: signal 0 for processes, a TCP connect
/// for ports.
#[derive(Debug, Clone)]
pub struct OsProbe {
    host: String,
    timeout: Duration,
}

impl OsProbe {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

/// Probes the machine's own hostname, which is where workers bind.
impl Default for OsProbe {
    fn default() -> Self {
        Self::new(local_hostname(), DEFAULT_PROBE_TIMEOUT)
    }
}

/// Name of this machine, or `localhost` when it cannot be read.
#[cfg(unix)]
pub fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            debug!(error = %e, "Cannot read hostname, probing localhost");
            "localhost".to_string()
        }
    }
}

#[cfg(not(unix))]
pub fn local_hostname() -> String {
    "localhost".to_string()
}

impl LivenessProbe for OsProbe {
    fn is_process_alive(&self, pid: u32) -> bool {
        process_exists(pid)
    }

    fn is_port_active(&self, port: u16) -> bool {
        let addrs = match (self.host.as_str(), port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(host = %self.host, port, error = %e, "Cannot resolve probe host");
                return false;
            }
        };

        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, self.timeout).is_ok())
    }
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // pid 0 and values past i32::MAX would address process groups
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    // EPERM means the process exists but belongs to someone else
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, TcpListener, UdpSocket};
    use std::process::Command;

    fn loopback_probe() -> OsProbe {
        OsProbe::new("127.0.0.1", DEFAULT_PROBE_TIMEOUT)
    }

    #[test]
    fn test_own_process_is_alive() {
        let probe = OsProbe::default();
        assert!(probe.is_process_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_reaped_child_is_dead() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let probe = OsProbe::default();
        assert!(!probe.is_process_alive(pid));
    }

    #[cfg(unix)]
    #[test]
    fn test_invalid_pids_are_dead() {
        let probe = OsProbe::default();
        assert!(!probe.is_process_alive(0));
        assert!(!probe.is_process_alive(u32::MAX));
    }

    #[test]
    fn test_port_activity() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = loopback_probe();
        assert!(probe.is_port_active(port));

        drop(listener);
        assert!(!probe.is_port_active(port));
    }

    /// A non-loopback address of this machine: what the hostname resolves
    /// to, or else the address outbound traffic would leave from.
    fn host_address() -> Option<(IpAddr, OsProbe)> {
        let by_name = (local_hostname().as_str(), 0)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.find(|a| !a.ip().is_loopback()));
        if let Some(addr) = by_name {
            return Some((addr.ip(), OsProbe::default()));
        }

        // connect() on UDP only picks a route, nothing is sent
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("192.0.2.1:9").ok()?;
        let ip = socket.local_addr().ok()?.ip();
        if ip.is_loopback() || ip.is_unspecified() {
            return None;
        }
        Some((ip, OsProbe::new(ip.to_string(), DEFAULT_PROBE_TIMEOUT)))
    }

    #[test]
    fn test_listener_on_host_address_is_active() {
        let Some((ip, probe)) = host_address() else {
            return;
        };

        let listener = TcpListener::bind((ip, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(probe.is_port_active(port));
        // The same listener is invisible from loopback
        assert!(!loopback_probe().is_port_active(port));
    }
}

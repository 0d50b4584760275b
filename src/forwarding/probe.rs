//! Local port availability checks
//!
//! A port is "available" when a bind-and-release on the given address
//! succeeds right now. Nothing is reserved: callers re-check by binding.

use std::net::TcpListener;

use tracing::debug;

/// Lowest port a wrapped scan restarts from (first unprivileged port)
pub const WRAP_FLOOR: u16 = 1024;

#[derive(Debug, Clone)]
pub struct PortProbe {
    bind_address: String,
    attempts: u16,
}

impl PortProbe {
    pub fn new(bind_address: impl Into<String>, attempts: u16) -> Self {
        Self {
            bind_address: bind_address.into(),
            attempts: attempts.max(1),
        }
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    /// Try to bind `bind_address:port` and release it immediately.
    pub fn is_available(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        match TcpListener::bind((self.bind_address.as_str(), port)) {
            Ok(_) => true,
            Err(e) => {
                debug!("Port {}:{} unavailable: {}", self.bind_address, port, e);
                false
            }
        }
    }

    /// First available port above `port` on the probe's bind address.
    pub fn suggest_alternative(&self, port: u16) -> Option<u16> {
        self.suggest_alternative_excluding(port, |_| false)
    }

    /// Like [`suggest_alternative`](Self::suggest_alternative), skipping ports
    /// `exclude` claims (e.g. ports reserved by tunnels that are still starting).
    pub fn suggest_alternative_excluding(
        &self,
        port: u16,
        exclude: impl Fn(u16) -> bool,
    ) -> Option<u16> {
        candidates(port, self.attempts)
            .filter(|candidate| !exclude(*candidate))
            .find(|candidate| self.is_available(*candidate))
    }

    pub fn attempts(&self) -> u16 {
        self.attempts
    }
}

/// Ports to try after `port`, in order: `port+1` upward, wrapping to
/// [`WRAP_FLOOR`] past 65535, never yielding `port` itself.
pub fn candidates(port: u16, attempts: u16) -> impl Iterator<Item = u16> {
    let mut next = port;
    (0..attempts)
        .map(move |_| {
            next = if next == u16::MAX { WRAP_FLOOR } else { next + 1 };
            next
        })
        .filter(move |candidate| *candidate != port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_scan_upward() {
        let ports: Vec<u16> = candidates(8080, 3).collect();
        assert_eq!(ports, vec![8081, 8082, 8083]);
    }

    #[test]
    fn test_candidates_wrap_past_max() {
        let ports: Vec<u16> = candidates(65534, 3).collect();
        assert_eq!(ports, vec![65535, 1024, 1025]);
    }

    #[test]
    fn test_occupied_port_is_unavailable() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = holder.local_addr().unwrap().port();

        let probe = PortProbe::new("127.0.0.1", 100);
        assert!(!probe.is_available(port));

        drop(holder);
        assert!(probe.is_available(port));
    }

    #[test]
    fn test_suggestion_differs_and_is_free() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = holder.local_addr().unwrap().port();

        let probe = PortProbe::new("127.0.0.1", 100);
        let suggested = probe.suggest_alternative(port).unwrap();
        assert_ne!(suggested, port);
        assert!(probe.is_available(suggested));
    }

    #[test]
    fn test_suggestion_respects_exclusions() {
        let probe = PortProbe::new("127.0.0.1", 100);
        let base = 40100;
        let suggested = probe
            .suggest_alternative_excluding(base, |p| p <= base + 2)
            .unwrap();
        assert!(suggested > base + 2);
    }
}

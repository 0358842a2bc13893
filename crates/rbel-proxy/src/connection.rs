//! Direction-agnostic connection identity.

use std::fmt;
use std::net::SocketAddr;

/// Identifies a TCP connection by its two endpoints, in either order.
///
/// ```
/// use rbel_proxy::ConnectionIdentifier;
///
/// let client = "10.0.0.1:50000".parse().unwrap();
/// let server = "10.0.0.2:443".parse().unwrap();
/// assert_eq!(
///     ConnectionIdentifier::new(client, server),
///     ConnectionIdentifier::new(server, client)
/// );
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionIdentifier {
    lower: SocketAddr,
    upper: SocketAddr,
}

impl ConnectionIdentifier {
    /// Creates an identifier from two endpoints.
    pub fn new(a: SocketAddr, b: SocketAddr) -> Self {
        if a <= b {
            Self { lower: a, upper: b }
        } else {
            Self { lower: b, upper: a }
        }
    }

    /// Both endpoints, smaller first.
    pub fn endpoints(&self) -> (SocketAddr, SocketAddr) {
        (self.lower, self.upper)
    }

    /// Returns true if `addr` is one of the endpoints.
    pub fn involves(&self, addr: &SocketAddr) -> bool {
        self.lower == *addr || self.upper == *addr
    }

    /// The endpoint opposite `addr`, if `addr` belongs to this connection.
    pub fn peer_of(&self, addr: &SocketAddr) -> Option<SocketAddr> {
        if self.lower == *addr {
            Some(self.upper)
        } else if self.upper == *addr {
            Some(self.lower)
        } else {
            None
        }
    }
}

impl fmt::Display for ConnectionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.lower, self.upper)
    }
}

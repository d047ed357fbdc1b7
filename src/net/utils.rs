use crate::error::{Error, Result};

use libc::{
    AF_INET, AF_INET6, in_addr, in6_addr, sa_family_t, sockaddr_in, sockaddr_in6,
    sockaddr_storage, socklen_t,
};
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};

/// Resolves `host:port` to the first address the system resolver returns.
/// Numeric hosts skip the resolver.
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| Error::Resolve {
            host: host.to_string(),
            port,
        })
}

/// Converts an address into the raw form `connect(2)` expects.
pub(crate) fn to_raw(address: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    let len = match address {
        SocketAddr::V4(v4) => {
            let raw = unsafe { &mut *(&mut storage as *mut sockaddr_storage as *mut sockaddr_in) };
            raw.sin_family = AF_INET as sa_family_t;
            raw.sin_port = v4.port().to_be();
            raw.sin_addr = in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            {
                raw.sin_len = mem::size_of::<sockaddr_in>() as u8;
            }
            mem::size_of::<sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let raw = unsafe { &mut *(&mut storage as *mut sockaddr_storage as *mut sockaddr_in6) };
            raw.sin6_family = AF_INET6 as sa_family_t;
            raw.sin6_port = v6.port().to_be();
            raw.sin6_flowinfo = v6.flowinfo();
            raw.sin6_addr = in6_addr {
                s6_addr: v6.ip().octets(),
            };
            raw.sin6_scope_id = v6.scope_id();
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            {
                raw.sin6_len = mem::size_of::<sockaddr_in6>() as u8;
            }
            mem::size_of::<sockaddr_in6>()
        }
    };

    (storage, len as socklen_t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_host_resolves_without_lookup() {
        let addr = resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn unresolvable_host_is_a_resolve_error() {
        let err = resolve("no-such-host.invalid", 80).unwrap_err();
        assert!(matches!(err, Error::Resolve { port: 80, .. }));
    }

    #[test]
    fn v4_raw_address_is_network_order() {
        let addr: SocketAddr = "10.1.2.3:4660".parse().unwrap();
        let (storage, len) = to_raw(&addr);
        assert_eq!(len as usize, mem::size_of::<sockaddr_in>());

        let raw = unsafe { &*(&storage as *const sockaddr_storage as *const sockaddr_in) };
        assert_eq!(raw.sin_port.to_ne_bytes(), [0x12, 0x34]);
        assert_eq!(raw.sin_addr.s_addr.to_ne_bytes(), [10, 1, 2, 3]);
    }
}

//! Record implementations for network addresses
//!
//! Addresses encode as a one-byte family tag (0 unspecified, 1 IPv4,
//! 2 IPv6) followed by the raw 0/4/16 address bytes. An endpoint is the
//! address followed by a big-endian port. The unspecified address is the
//! empty state.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{StoreError, StoreResult};
use crate::serial::{compose_read, compose_write, Record};

const TAG_UNSPECIFIED: u8 = 0;
const TAG_V4: u8 = 1;
const TAG_V6: u8 = 2;

impl Record for IpAddr {
    fn empty() -> Self {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    fn encoded_size(&self) -> usize {
        match self {
            IpAddr::V4(_) => 1 + 4,
            IpAddr::V6(_) => 1 + 16,
        }
    }

    fn is_empty(&self) -> bool {
        self.is_unspecified()
    }

    fn write(&self, dst: &mut [u8]) -> StoreResult<usize> {
        let required = self.encoded_size();
        if dst.len() < required {
            return Ok(required);
        }
        match self {
            IpAddr::V4(addr) => {
                dst[0] = TAG_V4;
                dst[1..5].copy_from_slice(&addr.octets());
            }
            IpAddr::V6(addr) => {
                dst[0] = TAG_V6;
                dst[1..17].copy_from_slice(&addr.octets());
            }
        }
        Ok(required)
    }

    fn read(&mut self, src: &[u8]) -> StoreResult<usize> {
        if src.is_empty() {
            return Ok(1);
        }
        match src[0] {
            TAG_UNSPECIFIED => {
                *self = Self::empty();
                Ok(1)
            }
            TAG_V4 => {
                if src.len() < 5 {
                    return Ok(5);
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&src[1..5]);
                *self = IpAddr::V4(octets.into());
                Ok(5)
            }
            TAG_V6 => {
                if src.len() < 17 {
                    return Ok(17);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&src[1..17]);
                *self = IpAddr::V6(octets.into());
                Ok(17)
            }
            other => Err(StoreError::Decode {
                reason: format!("invalid address family tag {}", other),
            }),
        }
    }
}

impl Record for SocketAddr {
    fn empty() -> Self {
        SocketAddr::new(IpAddr::empty(), 0)
    }

    fn encoded_size(&self) -> usize {
        self.ip().encoded_size() + 2
    }

    fn is_empty(&self) -> bool {
        self.ip().is_unspecified() && self.port() == 0
    }

    fn write(&self, dst: &mut [u8]) -> StoreResult<usize> {
        compose_write(dst, |w| {
            w.write(&self.ip())?;
            w.write(&self.port())?;
            Ok(())
        })
    }

    fn read(&mut self, src: &[u8]) -> StoreResult<usize> {
        let mut addr = IpAddr::empty();
        let mut port = 0u16;
        let used = compose_read(src, |r| {
            r.read(&mut addr)?;
            r.read(&mut port)?;
            Ok(())
        })?;
        if used <= src.len() {
            *self = SocketAddr::new(addr, port);
        }
        Ok(used)
    }
}

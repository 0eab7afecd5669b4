//! Client-side path builder.
//!
//! A route is value-data: an instruction path beginning with the pointer
//! marker, plus the `ttl` and `seg_size` defaults stamped into datagrams
//! built from it.

use crate::{
    Key,
    error::{WireError, WireResult},
    write_pair,
};

/// Longest path a route can hold, marker byte included.
pub const ROUTE_MAX_LEN: usize = 64;

/// An outgoing path plus its datagram header defaults.
#[derive(Clone)]
pub struct Route {
    path: [u8; ROUTE_MAX_LEN],
    path_len: u16,
    /// Milliseconds-to-live stamped into datagrams built from this route.
    pub ttl: u16,
    /// Segment-size hint stamped into datagrams built from this route.
    pub seg_size: u16,
}

impl Default for Route {
    fn default() -> Self {
        let mut path = [0u8; ROUTE_MAX_LEN];
        path[0] = Key::Ptr.byte();
        Self {
            path,
            path_len: 1,
            ttl: 1000,
            seg_size: 128,
        }
    }
}

impl Route {
    /// An empty route: just the pointer marker, default ttl and segment size.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a route from serialized parts (as carried by route CRUD
    /// requests). The path must lead with the pointer marker.
    pub fn from_parts(path: &[u8], ttl: u16, seg_size: u16) -> WireResult<Self> {
        if path.len() > ROUTE_MAX_LEN {
            return Err(WireError::Oversize);
        }
        if path.first() != Some(&Key::Ptr.byte()) {
            return Err(WireError::MissingPtr);
        }
        let mut route = Self::new();
        route.path[..path.len()].copy_from_slice(path);
        route.path_len = path.len() as u16;
        route.ttl = ttl;
        route.seg_size = seg_size;
        Ok(route)
    }

    /// The path bytes, marker included.
    #[must_use]
    pub fn path(&self) -> &[u8] {
        &self.path[..usize::from(self.path_len)]
    }

    /// Override the ttl default.
    #[must_use]
    pub fn with_ttl(mut self, ttl: u16) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the segment-size default.
    #[must_use]
    pub fn with_seg_size(mut self, seg_size: u16) -> Self {
        self.seg_size = seg_size;
        self
    }

    fn push(mut self, key: Key, arg: u16) -> Self {
        let at = usize::from(self.path_len);
        debug_assert!(at + 2 <= ROUTE_MAX_LEN, "route path full");
        if write_pair(&mut self.path, at, key, arg).is_ok() {
            self.path_len += 2;
        }
        self
    }

    /// Append a hop to the sibling at `indice`.
    #[must_use]
    pub fn sib(self, indice: u16) -> Self {
        self.push(Key::Sib, indice)
    }

    /// Append a hop to the parent.
    #[must_use]
    pub fn parent(self) -> Self {
        self.push(Key::Parent, 0)
    }

    /// Append a hop to the child at `indice`.
    #[must_use]
    pub fn child(self, indice: u16) -> Self {
        self.push(Key::Child, indice)
    }

    /// Append a port transmit.
    #[must_use]
    pub fn pfwd(self) -> Self {
        self.push(Key::Pfwd, 0)
    }

    /// Append a bus transmit to `rx_addr`.
    #[must_use]
    pub fn bfwd(self, rx_addr: u16) -> Self {
        self.push(Key::Bfwd, rx_addr)
    }

    /// Append a bus broadcast on `channel`.
    #[must_use]
    pub fn bbrd(self, channel: u16) -> Self {
        self.push(Key::Bbrd, channel)
    }
}

impl core::fmt::Debug for Route {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path())
            .field("ttl", &self.ttl)
            .field("seg_size", &self.seg_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_route_is_just_the_marker() {
        let route = Route::new();
        assert_eq!(route.path(), &[0xF0]);
        assert_eq!(route.ttl, 1000);
        assert_eq!(route.seg_size, 128);
    }

    #[test]
    fn test_builder_appends_pairs() {
        let route = Route::new().sib(3).parent().child(2).pfwd().bfwd(12).bbrd(7);
        assert_eq!(
            route.path(),
            &[0xF0, 0x10, 3, 0x20, 0, 0x30, 2, 0x40, 0, 0x50, 12, 0x60, 7]
        );
    }

    #[test]
    fn test_from_parts_roundtrip() {
        let built = Route::new().sib(1).pfwd().with_ttl(500);
        let parsed = Route::from_parts(built.path(), built.ttl, built.seg_size).unwrap();
        assert_eq!(parsed.path(), built.path());
        assert_eq!(parsed.ttl, 500);
    }

    #[test]
    fn test_from_parts_requires_leading_marker() {
        assert_eq!(
            Route::from_parts(&[0x10, 0x01], 1000, 128).unwrap_err(),
            WireError::MissingPtr
        );
    }
}

use crate::errors::{SessionError, SessionResult};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Decides whether a TCP port can be handed to a new terminal.
pub trait PortProbe: Send + Sync + 'static {
    fn is_free(&self, port: u16) -> bool;
}

/// Binds the port on the loopback interface and releases it immediately.
///
/// The answer is advisory: another process may grab the port between the probe and the
/// moment ttyd binds it.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopbackProbe;

impl PortProbe for LoopbackProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}

/// First port in `start..=max` that the probe reports free and `skip` does not exclude.
pub fn find_available(
    probe: &dyn PortProbe,
    start: u16,
    max: u16,
    skip: impl Fn(u16) -> bool,
) -> Option<u16> {
    for port in start..=max {
        if skip(port) {
            continue;
        }
        if probe.is_free(port) {
            info!(port, "port appears free");
            return Some(port);
        }
        debug!(port, "port seems occupied, trying next");
    }
    None
}

/// A port handed out by [`PortAllocator::allocate`], remembering where the cursor was.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortLease {
    pub port: u16,
    previous_cursor: u16,
}

pub struct PortAllocator {
    first: u16,
    max: u16,
    reserved: u16,
    cursor: u16,
    probe: Arc<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new(first: u16, max: u16, reserved: u16) -> Self {
        Self::with_probe(first, max, reserved, Arc::new(LoopbackProbe))
    }

    pub fn with_probe(first: u16, max: u16, reserved: u16, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            first,
            max,
            reserved,
            cursor: first,
            probe,
        }
    }

    pub fn cursor(&self) -> u16 {
        self.cursor
    }

    pub fn range(&self) -> (u16, u16) {
        (self.first, self.max)
    }

    /// The port the next call to [`allocate`](Self::allocate) would return, without
    /// moving the cursor.
    pub fn peek(&self, is_tracked: impl Fn(u16) -> bool) -> Option<u16> {
        self.search(&is_tracked)
    }

    /// Finds a free port starting at the cursor, wrapping once to the start of the range.
    ///
    /// On exhaustion the cursor is left where it was.
    pub fn allocate(&mut self, is_tracked: impl Fn(u16) -> bool) -> SessionResult<PortLease> {
        let Some(port) = self.search(&is_tracked) else {
            error!(
                first = self.first,
                max = self.max,
                "no available port found in dynamic range"
            );
            return Err(SessionError::PortExhausted {
                first: self.first,
                max: self.max,
            });
        };

        let lease = PortLease {
            port,
            previous_cursor: self.cursor,
        };
        self.cursor = if port >= self.max {
            self.first
        } else {
            port + 1
        };
        Ok(lease)
    }

    /// Puts the cursor back so the leased port is tried again by the next allocation.
    pub fn rollback(&mut self, lease: PortLease) {
        debug!(
            port = lease.port,
            cursor = lease.previous_cursor,
            "rolling back port cursor"
        );
        self.cursor = lease.previous_cursor;
    }

    fn search(&self, is_tracked: &dyn Fn(u16) -> bool) -> Option<u16> {
        let skip = |port: u16| port == self.reserved || is_tracked(port);
        let start = self.cursor.clamp(self.first, self.max);

        find_available(self.probe.as_ref(), start, self.max, skip).or_else(|| {
            if start > self.first {
                find_available(self.probe.as_ref(), self.first, start - 1, skip)
            } else {
                None
            }
        })
    }
}

//! Packet router.
//!
//! Fans packets out to labelled routes keyed on packet flags. The sender
//! routes owned packets to per-interface transports; a receiver session
//! routes shared packets into its source and repair queues, so the router
//! is generic over both packet forms.

use tracing::debug;

use crate::packet::{Packet, PacketPtr};

/// Packet form that can be routed by flags.
pub trait Routable {
    /// Returns the packet's role flags.
    fn route_flags(&self) -> u32;
}

impl Routable for Packet {
    fn route_flags(&self) -> u32 {
        self.flags()
    }
}

impl Routable for PacketPtr {
    fn route_flags(&self) -> u32 {
        self.flags()
    }
}

struct Route<P> {
    flags: u32,
    writer: Box<dyn FnMut(P) + Send>,
}

/// Flag-keyed packet fan-out.
pub struct Router<P> {
    routes: Vec<Route<P>>,
}

impl<P: Routable> Router<P> {
    // ---
    /// Creates a router with no routes.
    pub fn new() -> Self {
        // ---
        Self { routes: Vec::new() }
    }

    /// Registers a route receiving packets whose flags contain `flags`.
    ///
    /// Routes are matched in registration order; the first match wins.
    pub fn add_route(&mut self, flags: u32, writer: impl FnMut(P) + Send + 'static) {
        // ---
        self.routes.push(Route {
            flags,
            writer: Box::new(writer),
        });
    }

    /// Forwards the packet to the first matching route.
    ///
    /// Packets matching no route are dropped after a debug log.
    pub fn write(&mut self, packet: P) {
        // ---
        let packet_flags = packet.route_flags();

        for route in &mut self.routes {
            if packet_flags & route.flags == route.flags {
                (route.writer)(packet);
                return;
            }
        }

        debug!("router: dropping packet, no route matches: flags=0x{:x}", packet_flags);
    }
}

impl<P: Routable> Default for Router<P> {
    fn default() -> Self {
        Self::new()
    }
}

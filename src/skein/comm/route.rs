use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use dashmap::DashMap;

use crate::skein::comm::{CommSession, protocol::ChannelInfo};

/// One egress path a channel can take: either this node dials the target
/// from its own network (gateway), or the channel is relayed into the next
/// hop's session.
pub struct Route {
    pub id: u64,
    /// Human-readable hop chain, for listing.
    pub hops: Vec<String>,
    pub gateway: bool,
    pub next_hop: Option<Arc<CommSession>>,
    pending: AtomicUsize,
}

impl Route {
    pub fn gateway(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            hops: Vec::new(),
            gateway: true,
            next_hop: None,
            pending: AtomicUsize::new(0),
        })
    }

    pub fn forwarding(id: u64, hops: Vec<String>, next_hop: Arc<CommSession>) -> Arc<Self> {
        Arc::new(Self {
            id,
            hops,
            gateway: false,
            next_hop: Some(next_hop),
            pending: AtomicUsize::new(0),
        })
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// RAII count of channels currently being opened through this route.
    pub fn track(self: &Arc<Self>) -> PendingGuard {
        self.pending.fetch_add(1, Ordering::AcqRel);
        PendingGuard(self.clone())
    }
}

pub struct PendingGuard(Arc<Route>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Where an inbound channel should go.
pub enum ChannelTarget {
    /// Dial from this node's own network.
    Local { route: Option<Arc<Route>> },
    /// Relay into the next hop's session.
    Forward {
        route: Arc<Route>,
        session: Arc<CommSession>,
    },
}

#[derive(Default)]
pub struct RouteRegistry {
    routes: DashMap<u64, Arc<Route>>,
}

impl RouteRegistry {
    pub fn add(&self, route: Arc<Route>) {
        self.routes.insert(route.id, route);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Route>> {
        self.routes.remove(&id).map(|(_, r)| r)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Route>> {
        self.routes.get(&id).map(|r| r.clone())
    }

    pub fn list(&self) -> Vec<Arc<Route>> {
        self.routes.iter().map(|r| r.clone()).collect()
    }

    /// Resolve a channel's egress. Channels with no route id dial locally;
    /// an unknown route id is a rejection, never a guess.
    pub fn resolve(&self, info: &ChannelInfo) -> Result<ChannelTarget, String> {
        if info.route_id == 0 {
            return Ok(ChannelTarget::Local { route: None });
        }
        let Some(route) = self.get(info.route_id) else {
            return Err(format!("no route {}", info.route_id));
        };
        if route.gateway {
            return Ok(ChannelTarget::Local { route: Some(route) });
        }
        match route.next_hop.clone() {
            Some(session) => Ok(ChannelTarget::Forward { route, session }),
            None => Err(format!("route {} has no next hop", info.route_id)),
        }
    }
}

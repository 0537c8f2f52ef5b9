use std::sync::{Arc, Mutex};
use std::time::Instant;

use latch_common::Resource;

use crate::device::Peer;

/// A resource bound to its server peer, plus the time of the last
/// successful knock. Targets are rebuilt after a registry reload; knocks
/// already in flight keep the captured resource.
#[derive(Debug)]
pub struct KnockTarget {
    resource: Arc<Resource>,
    peer: Arc<Peer>,
    last_success: Mutex<Option<Instant>>,
}

impl KnockTarget {
    pub fn new(resource: Arc<Resource>, peer: Arc<Peer>) -> Self {
        Self {
            resource,
            peer,
            last_success: Mutex::new(None),
        }
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn last_success(&self) -> Option<Instant> {
        *self.last_success.lock().unwrap()
    }

    pub fn mark_success(&self) {
        *self.last_success.lock().unwrap() = Some(Instant::now());
    }
}

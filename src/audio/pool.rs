//! Registry of shared capture streams
//!
//! Hands out slaves so that every consumer of the same device configuration
//! reads through the same [`MasterInputStream`]. A master is evicted once it
//! has no started slave and no slave object left.

use dashmap::DashMap;
use std::sync::{Arc, Weak};

use crate::audio::master::{MasterInputStream, SlaveInputStream};
use crate::audio::native::{NativeAudio, StreamParameters};

type MasterMap = DashMap<StreamParameters, Arc<MasterInputStream>>;

/// Device-pool manager for capture streams
pub struct InputStreamPool {
    audio: Arc<dyn NativeAudio>,
    masters: Arc<MasterMap>,
}

impl InputStreamPool {
    pub fn new(audio: Arc<dyn NativeAudio>) -> Self {
        Self {
            audio,
            masters: Arc::new(DashMap::new()),
        }
    }

    /// Create a stopped slave reading from the master for `params`
    pub fn slave(&self, params: StreamParameters) -> SlaveInputStream {
        let entry = self.masters.entry(params).or_insert_with(|| {
            tracing::debug!(
                "Creating capture master for device {} ({} Hz, {} ch)",
                params.device_index,
                params.sample_rate,
                params.channels
            );
            let masters: Weak<MasterMap> = Arc::downgrade(&self.masters);
            MasterInputStream::with_release(
                self.audio.clone(),
                params,
                Box::new(move |params: &StreamParameters| {
                    if let Some(masters) = masters.upgrade() {
                        evict_if_unused(&masters, params);
                    }
                }),
            )
        });

        // Slave is created under the shard lock so eviction cannot race it
        entry.value().slave()
    }

    /// Master currently pooled for `params`
    pub fn master(&self, params: &StreamParameters) -> Option<Arc<MasterInputStream>> {
        self.masters.get(params).map(|m| m.value().clone())
    }

    /// Number of pooled masters
    pub fn len(&self) -> usize {
        self.masters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }
}

fn evict_if_unused(masters: &MasterMap, params: &StreamParameters) {
    if masters.remove_if(params, |_, master| master.is_unused()).is_some() {
        tracing::debug!("Evicted capture master for device {}", params.device_index);
    }
}

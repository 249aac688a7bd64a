// Copyright (c) TinyMQ contributors.
// Licensed under the MIT License.

//! The publish orchestrator: keeps DAS data callbacks in sync with topic
//! publish flags and sensor membership, using a "clear and reinstall"
//! pattern rather than mutating live closures (spec §4.H).

use std::collections::HashSet;
use std::sync::Arc;

use log::warn;

use crate::das::Das;
use crate::model::SensorEvent;
use crate::pubsub::PubSub;
use crate::store::LocalStore;

/// Refreshes DAS callbacks whenever a topic's publish flag or sensor
/// membership changes, so each published topic stays wired to exactly the
/// sensors currently assigned to it.
pub struct Orchestrator {
    store: Arc<dyn LocalStore>,
    das: Arc<Das>,
    pubsub: Arc<PubSub>,
}

impl Orchestrator {
    /// Builds an orchestrator over the given collaborators.
    #[must_use]
    pub fn new(store: Arc<dyn LocalStore>, das: Arc<Das>, pubsub: Arc<PubSub>) -> Self {
        Self { store, das, pubsub }
    }

    /// Clears every DAS data callback and reinstalls one per currently
    /// published topic. Call on connect, and after any mutation to a
    /// topic's publish flag or sensor membership.
    ///
    /// # Errors
    /// Returns an error if the local store cannot be read.
    pub fn refresh(&self) -> crate::error::Result<()> {
        self.das.clear_callbacks();
        for topic in self.store.get_published_topics()? {
            let sensor_names: HashSet<String> =
                self.store.get_topic_sensors(&topic.name)?.into_iter().collect();
            if sensor_names.is_empty() {
                continue;
            }
            let topic_name = topic.name.clone();
            let store = self.store.clone();
            let pubsub = self.pubsub.clone();
            self.das.add_data_callback(Box::new(move |event: &SensorEvent| {
                if !sensor_names.contains(&event.name) {
                    return;
                }
                // Re-read the publish flag here rather than trusting the
                // snapshot this closure was built from: a topic can be
                // unpublished between install and this event without
                // triggering a reinstall if the caller forgets to refresh.
                match store.get_topic(&topic_name) {
                    Ok(Some(t)) if t.publish => emit(pubsub.clone(), topic_name.clone(), event.clone()),
                    Ok(_) => {}
                    Err(err) => warn!("orchestrator failed to re-read topic '{topic_name}': {err}"),
                }
            }));
        }
        Ok(())
    }
}

fn emit(pubsub: Arc<PubSub>, topic_name: String, event: SensorEvent) {
    tokio::spawn(async move {
        let message = match serde_json::to_vec(&event) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("orchestrator failed to encode reading for '{topic_name}': {err}");
                return;
            }
        };
        if let Err(err) = pubsub.publish(&topic_name, &message).await {
            warn!("orchestrator failed to publish reading to '{topic_name}': {err}");
        }
    });
}

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use super::{channel_id_repo::ChannelIdRepository, ChannelResource};
use crate::frame::{AmqpChannelId, Frame};

/// Owned by the reader task, so no locking is needed around id allocation.
pub(crate) struct ChannelManager {
    id_repo: ChannelIdRepository,
    resources: BTreeMap<AmqpChannelId, ChannelResource>,
}

impl ChannelManager {
    pub fn new(channel_max: AmqpChannelId) -> Self {
        Self {
            id_repo: ChannelIdRepository::new(channel_max),
            resources: BTreeMap::new(),
        }
    }

    pub fn insert_resource(&mut self, resource: ChannelResource) -> Option<AmqpChannelId> {
        let id = self.id_repo.allocate()?;
        self.resources.insert(id, resource);
        Some(id)
    }

    pub fn remove_resource(&mut self, channel_id: AmqpChannelId) -> Option<ChannelResource> {
        let resource = self.resources.remove(&channel_id)?;
        self.id_repo.release(channel_id);
        Some(resource)
    }

    pub fn get_dispatcher(&self, channel_id: AmqpChannelId) -> Option<&mpsc::UnboundedSender<Frame>> {
        self.resources.get(&channel_id).map(|r| &r.dispatcher_tx)
    }
}

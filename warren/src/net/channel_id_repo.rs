use crate::frame::AmqpChannelId;

const INITIAL_BIT_MASK: u8 = 0b1000_0000;

/// Pool of channel ids `1..=channel_max`, always handing out the lowest free one.
pub(crate) struct ChannelIdRepository {
    channel_max: AmqpChannelId,
    /// Each bit represent two states: 1: occupied, 0: free.
    /// Real id is calculated by byte postion in Vec + bit postion in byte.
    id_state: Vec<u8>,
}

impl ChannelIdRepository {
    pub fn new(channel_max: AmqpChannelId) -> Self {
        let channel_max = channel_max.max(1);
        let len = 1 + (channel_max as usize - 1) / 8;

        Self {
            channel_max,
            id_state: vec![0; len],
        }
    }

    fn is_free(&self, pos: usize, mask: u8) -> bool {
        (mask & self.id_state[pos]) == 0
    }

    fn get_pos_mask(&self, id: AmqpChannelId) -> (usize, u8) {
        let pos = (id as usize - 1) / 8;
        let mask = INITIAL_BIT_MASK >> ((id - 1) % 8);
        (pos, mask)
    }

    /// `None` if every id up to `channel_max` is in use.
    pub fn allocate(&mut self) -> Option<AmqpChannelId> {
        let pos = self.id_state.iter().position(|&v| v != 0b1111_1111)?;
        for i in 0..8u16 {
            let mask = INITIAL_BIT_MASK >> i;
            if self.is_free(pos, mask) {
                let channel_id = (pos as u32 * 8 + i as u32 + 1) as AmqpChannelId;
                // the last byte may have bits beyond channel_max
                if channel_id > self.channel_max || channel_id == 0 {
                    return None;
                }
                self.id_state[pos] |= mask;
                return Some(channel_id);
            }
        }
        None
    }

    /// true: OK, false: already released
    pub fn release(&mut self, id: AmqpChannelId) -> bool {
        if id == 0 || id > self.channel_max {
            return false;
        }
        let (pos, mask) = self.get_pos_mask(id);
        if self.is_free(pos, mask) {
            false
        } else {
            self.id_state[pos] &= !mask;
            true
        }
    }
}

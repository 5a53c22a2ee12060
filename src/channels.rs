//! Named WebSocket channels.
//!
//! Channel names live in a small open addressing table (FNV-1a, linear probing). Each channel
//! gets a bit index when first joined, and membership is a `u32` mask per connection slot, so
//! publishing is a walk over the set bits of the WebSocket mask.

use arrayvec::ArrayString;

use crate::config::{MAX_CHANNELS, MAX_CHANNEL_NAME_LEN, MAX_CONNECTIONS};
use crate::error::HttpError;

const BUCKETS: usize = 64;

const _: () = assert!(BUCKETS.is_power_of_two() && BUCKETS >= 2 * MAX_CHANNELS);
const _: () = assert!(MAX_CHANNELS <= 32);

fn fnv1a(name: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for b in name.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Clone, Copy)]
struct Bucket {
    name: ArrayString<MAX_CHANNEL_NAME_LEN>,
    index: u8,
}

/// Channel registry and per connection membership.
pub struct Channels {
    buckets: [Option<Bucket>; BUCKETS],
    by_index: [u8; MAX_CHANNELS],
    count: u8,
    members: [u32; MAX_CONNECTIONS],
}

impl Channels {
    /// No channels.
    pub const fn new() -> Self {
        Channels {
            buckets: [None; BUCKETS],
            by_index: [0; MAX_CHANNELS],
            count: 0,
            members: [0; MAX_CONNECTIONS],
        }
    }

    fn find(&self, name: &str) -> Option<u8> {
        let start = fnv1a(name) as usize;
        for probe in 0..BUCKETS {
            match &self.buckets[(start + probe) & (BUCKETS - 1)] {
                None => return None,
                Some(b) if b.name.as_str() == name => return Some(b.index),
                Some(_) => {}
            }
        }
        None
    }

    fn find_or_create(&mut self, name: &str) -> Result<u8, HttpError> {
        if name.is_empty() || name.len() > MAX_CHANNEL_NAME_LEN {
            return Err(HttpError::InvalidArg);
        }

        let start = fnv1a(name) as usize;
        for probe in 0..BUCKETS {
            let at = (start + probe) & (BUCKETS - 1);
            match &self.buckets[at] {
                Some(b) if b.name.as_str() == name => return Ok(b.index),
                Some(_) => {}
                None => {
                    if self.count as usize >= MAX_CHANNELS {
                        warn!("channel table full");
                        return Err(HttpError::NoMem);
                    }
                    let name = ArrayString::from(name).map_err(|_| HttpError::InvalidArg)?;
                    let index = self.count;
                    self.buckets[at] = Some(Bucket { name, index });
                    self.by_index[index as usize] = at as u8;
                    self.count += 1;
                    debug!("channel {} created", index);
                    return Ok(index);
                }
            }
        }
        Err(HttpError::NoMem)
    }

    /// Subscribe `slot` to `name`, creating the channel if needed.
    pub fn join(&mut self, slot: usize, name: &str) -> Result<(), HttpError> {
        if slot >= MAX_CONNECTIONS {
            return Err(HttpError::InvalidArg);
        }
        let index = self.find_or_create(name)?;
        self.members[slot] |= 1 << index;
        Ok(())
    }

    /// Unsubscribe `slot` from `name`. `NotFound` if it was not a member.
    pub fn leave(&mut self, slot: usize, name: &str) -> Result<(), HttpError> {
        let index = self.find(name).ok_or(HttpError::NotFound)?;
        let mask = self.members.get_mut(slot).ok_or(HttpError::InvalidArg)?;
        if *mask & (1 << index) == 0 {
            return Err(HttpError::NotFound);
        }
        *mask &= !(1 << index);
        Ok(())
    }

    /// Unsubscribe `slot` from everything.
    pub fn leave_all(&mut self, slot: usize) {
        if let Some(mask) = self.members.get_mut(slot) {
            *mask = 0;
        }
    }

    /// Whether `slot` is subscribed to `name`.
    pub fn in_channel(&self, slot: usize, name: &str) -> bool {
        match (self.find(name), self.members.get(slot)) {
            (Some(index), Some(mask)) => mask & (1 << index) != 0,
            _ => false,
        }
    }

    /// Slot mask of the members of `name`, restricted to `candidates`.
    pub fn members(&self, name: &str, candidates: u32) -> u32 {
        let Some(index) = self.find(name) else {
            return 0;
        };
        let mut out = 0;
        for (slot, mask) in self.members.iter().enumerate() {
            if candidates & (1 << slot) != 0 && mask & (1 << index) != 0 {
                out |= 1 << slot;
            }
        }
        out
    }

    /// Number of `candidates` subscribed to `name`.
    pub fn size(&self, name: &str, candidates: u32) -> usize {
        self.members(name, candidates).count_ones() as usize
    }

    /// Names of the channels `slot` is subscribed to, in creation order.
    pub fn channels_of(&self, slot: usize) -> impl Iterator<Item = &str> + '_ {
        let mut mask = self.members.get(slot).copied().unwrap_or(0);
        core::iter::from_fn(move || {
            while mask != 0 {
                let index = mask.trailing_zeros() as usize;
                mask &= mask - 1;
                let at = self.by_index[index] as usize;
                if let Some(b) = &self.buckets[at] {
                    return Some(b.name.as_str());
                }
            }
            None
        })
    }

    /// Number of channels ever created.
    pub fn count(&self) -> usize {
        self.count as usize
    }
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

use crate::pack::Packer;
use parking_lot::Mutex;

/// Pool of open packers shared by concurrent blob savers.
pub struct PackerManager {
    packers: Mutex<Vec<Packer>>,
    min_pack_size: usize,
    max_packers: usize,
}

impl PackerManager {
    pub fn new(min_pack_size: usize, max_packers: usize) -> Self {
        Self {
            packers: Mutex::new(Vec::new()),
            min_pack_size,
            max_packers: max_packers.max(1),
        }
    }

    /// Removes the least-filled packer from the pool, or starts a new one.
    pub fn take_packer(&self) -> Packer {
        let mut packers = self.packers.lock();
        let smallest = packers
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| p.size())
            .map(|(i, _)| i);
        match smallest {
            Some(i) => packers.swap_remove(i),
            None => Packer::new(),
        }
    }

    /// Puts a packer back while it is still small and the pool has room. Otherwise
    /// hands it back to the caller to be finalized.
    pub fn return_packer(&self, packer: Packer) -> Option<Packer> {
        let mut packers = self.packers.lock();
        if packer.size() < self.min_pack_size && packers.len() < self.max_packers {
            packers.push(packer);
            None
        } else {
            Some(packer)
        }
    }

    /// Empties the pool, returning every packer that holds blobs.
    pub fn drain(&self) -> Vec<Packer> {
        self.packers
            .lock()
            .drain(..)
            .filter(|p| !p.is_empty())
            .collect()
    }

}

// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Mutex;

/// Bookkeeping pool of GPU slots. Each slot is either free or owned by
/// exactly one in-flight job; the tracker knows nothing about the physical
/// devices themselves.
pub struct GpuTracker {
    slots: Mutex<Vec<bool>>,
}

impl GpuTracker {
    pub fn new(total: usize) -> Self {
        Self {
            slots: Mutex::new(vec![false; total]),
        }
    }

    /// Claims the first free slot, returning its index.
    pub fn acquire(&self) -> Option<usize> {
        let mut slots = self.slots.lock().unwrap();
        for (index, taken) in slots.iter_mut().enumerate() {
            if !*taken {
                *taken = true;
                return Some(index);
            }
        }
        None
    }

    /// Claims the given slot; fails when it is out of range or already owned.
    pub fn acquire_specific(&self, index: usize) -> bool {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(index) {
            Some(taken) if !*taken => {
                *taken = true;
                true
            }
            _ => false,
        }
    }

    /// Releases a slot. Releasing a free or out-of-range slot is a no-op;
    /// release runs on every job exit path, including ones that never
    /// acquired.
    pub fn release(&self, index: usize) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(taken) = slots.get_mut(index) {
            *taken = false;
        }
    }

    pub fn available(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        slots.iter().filter(|taken| !**taken).count()
    }

    pub fn total(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        slots.len()
    }
}

//! Fixed-capacity scratch region shared by sensor and appendage bindings
//! that need a stable, always-allocated slot rather than a heap tensor —
//! e.g. a transport writing live sensor readings in before a cycle, or a
//! controller reading appendage targets out after one.

/// Number of independent slots per region.
pub const MAX_VARIABLE_SLOTS: usize = 4;
/// Number of `f32` values held by each slot.
pub const MAX_SLOT_NEURONS: usize = 96;

/// 32-byte aligned, so the region can be handed to SIMD or device-copy
/// paths that assume aligned scratch.
#[repr(align(32))]
#[derive(Clone, Copy)]
struct SlotRegion([[f32; MAX_SLOT_NEURONS]; MAX_VARIABLE_SLOTS]);

impl Default for SlotRegion {
    fn default() -> Self {
        SlotRegion([[0.0; MAX_SLOT_NEURONS]; MAX_VARIABLE_SLOTS])
    }
}

/// Two fixed regions — sensors (inputs written from outside) and
/// appendages (outputs read from outside) — each with `MAX_VARIABLE_SLOTS`
/// slots of `MAX_SLOT_NEURONS` floats, plus an `active` flag per slot.
/// `clear()` zeros everything; consumers of an inactive slot must mask its
/// values rather than trust stale data.
#[derive(Clone)]
pub struct ConstantSlab {
    sensors: SlotRegion,
    appendages: SlotRegion,
    sensors_active: [bool; MAX_VARIABLE_SLOTS],
    appendages_active: [bool; MAX_VARIABLE_SLOTS],
}

impl ConstantSlab {
    pub fn new() -> Self {
        Self {
            sensors: SlotRegion::default(),
            appendages: SlotRegion::default(),
            sensors_active: [false; MAX_VARIABLE_SLOTS],
            appendages_active: [false; MAX_VARIABLE_SLOTS],
        }
    }

    pub fn clear(&mut self) {
        self.sensors = SlotRegion::default();
        self.appendages = SlotRegion::default();
        self.sensors_active = [false; MAX_VARIABLE_SLOTS];
        self.appendages_active = [false; MAX_VARIABLE_SLOTS];
    }

    pub fn sensor_slot(&self, slot: usize) -> &[f32; MAX_SLOT_NEURONS] {
        &self.sensors.0[slot]
    }

    pub fn sensor_slot_mut(&mut self, slot: usize) -> &mut [f32; MAX_SLOT_NEURONS] {
        &mut self.sensors.0[slot]
    }

    pub fn appendage_slot(&self, slot: usize) -> &[f32; MAX_SLOT_NEURONS] {
        &self.appendages.0[slot]
    }

    pub fn appendage_slot_mut(&mut self, slot: usize) -> &mut [f32; MAX_SLOT_NEURONS] {
        &mut self.appendages.0[slot]
    }

    pub fn set_sensor_active(&mut self, slot: usize, active: bool) {
        self.sensors_active[slot] = active;
    }

    pub fn set_appendage_active(&mut self, slot: usize, active: bool) {
        self.appendages_active[slot] = active;
    }

    pub fn sensor_active(&self, slot: usize) -> bool {
        self.sensors_active[slot]
    }

    pub fn appendage_active(&self, slot: usize) -> bool {
        self.appendages_active[slot]
    }
}

impl Default for ConstantSlab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_is_32_bytes() {
        assert_eq!(std::mem::align_of::<SlotRegion>(), 32);
    }

    #[test]
    fn clear_zeros_data_and_flags() {
        let mut slab = ConstantSlab::new();
        slab.sensor_slot_mut(0)[0] = 1.0;
        slab.set_sensor_active(0, true);
        slab.clear();
        assert_eq!(slab.sensor_slot(0)[0], 0.0);
        assert!(!slab.sensor_active(0));
    }

    #[test]
    fn slots_are_independent() {
        let mut slab = ConstantSlab::new();
        slab.sensor_slot_mut(1)[5] = 3.0;
        assert_eq!(slab.sensor_slot(0)[5], 0.0);
        assert_eq!(slab.sensor_slot(1)[5], 3.0);
    }
}

pub mod capacity;
pub mod lifecycle;
pub mod models;

pub use capacity::{CapacityError, CapacityGuard, PreemptionCandidate, SlotLockGuard};
pub use lifecycle::SlotLifecycle;
pub use models::{
    build_slot_id, AvailableSlotsFilter, DoctorSchedule, Slot, SlotLifecycleError, SlotMetadata,
    SlotStatus, SlotType, WeeklySlotTemplate,
};
